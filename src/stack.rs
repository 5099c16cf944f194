//! Fiber stack allocation and usage accounting.
//!
//! Stacks come from `corosensei`'s `DefaultStack`, which maps a region
//! whose bottom page is left inaccessible as a guard. The manager
//! optionally records exact stack usage: the writable range above the
//! guard is painted with a sentinel byte before the coroutine writes its
//! first frame, and a linear scan on surrender to the pool finds the
//! furthest byte ever written.

use corosensei::stack::{DefaultStack, Stack};
use std::io;

const STACK_SENTINEL: u8 = 0x5A;

/// The guard `DefaultStack` leaves at the bottom of its mapping is exactly
/// one host page, and `Stack::limit` includes it. Touching it faults, so
/// painting and scanning must start this far above the limit.
#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
const GUARD_PAGE_SIZE: usize = 16 * 1024;
#[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
const GUARD_PAGE_SIZE: usize = 4096;

/// Address range of a stack's writable region. The mapping itself is owned
/// by the coroutine; this is the bookkeeping the manager keeps on the side
/// so it can scan the region while the fiber is parked.
#[derive(Clone, Copy)]
pub(crate) struct StackSpan {
    /// High end of the writable range; stacks grow downward from here.
    base: usize,
    /// Low end of the writable range, just above the guard page.
    floor: usize,
}

impl StackSpan {
    pub(crate) fn size(&self) -> usize {
        self.base - self.floor
    }

    /// Bytes ever written, scanning from the growth end for the first
    /// non-sentinel byte. Only meaningful for a painted stack.
    ///
    /// # Safety contract
    ///
    /// The caller must ensure the mapping is still alive and the owning
    /// fiber is not running.
    pub(crate) fn used_bytes(&self) -> usize {
        let mut addr = self.floor;
        while addr < self.base {
            // SAFETY: [floor, base) stays mapped and readable as long as
            // the coroutine that owns the stack is alive; see caller
            // contract.
            if unsafe { *(addr as *const u8) } != STACK_SENTINEL {
                break;
            }
            addr += 1;
        }
        self.base - addr
    }
}

/// Maps a stack of (at least) `size` usable bytes, optionally painting it
/// for usage recording. Painting must happen here, before the coroutine
/// lays its setup frame onto the region.
pub(crate) fn allocate(size: usize, paint: bool) -> io::Result<(DefaultStack, StackSpan)> {
    let stack = DefaultStack::new(size)?;
    // `limit()` is the bottom of the whole mapping, guard page included;
    // only [limit + guard, base) is actually readable and writable.
    let span = StackSpan {
        base: stack.base().get(),
        floor: stack.limit().get() + GUARD_PAGE_SIZE,
    };
    debug_assert!(span.floor < span.base);
    if paint {
        // SAFETY: the writable range is freshly mapped and nothing has run
        // on it yet; the guard page stays untouched below `floor`.
        unsafe {
            std::ptr::write_bytes(span.floor as *mut u8, STACK_SENTINEL, span.size());
        }
    }
    Ok((stack, span))
}
