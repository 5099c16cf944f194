//! Baton: a one-shot rendezvous between a waiting fiber and its posters.
//!
//! The whole primitive is a single atomic word holding one of `INIT`,
//! `POSTED`, `TIMED_OUT`, or the address of the parked fiber. Transitions
//! are monotonic compare-and-swaps: once a baton leaves `INIT` toward a
//! verdict it never reverts, so the first post (or the registered timeout)
//! decides the outcome and every later arrival is a no-op.
//!
//! The waiter handshake is deliberately split across the context switch:
//! the fiber's address enters the word only on the main context, after the
//! waiter has truly suspended. A poster on another thread therefore either
//! sees the parked fiber or wins the word first, in which case the manager
//! re-readies the fiber immediately; it can never resume a fiber that is
//! still running.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::fiber::{Fiber, FiberHandle};
use crate::manager;

const INIT: usize = 0;
const POSTED: usize = 1;
const TIMED_OUT: usize = 2;
// Any other value is the address of the waiting fiber; alignment keeps
// real addresses clear of the tags.

/// How a wait ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Someone posted the baton.
    Posted,
    /// The registered timeout fired first.
    TimedOut,
}

/// Single-use wait/post primitive. `wait` must be called from a fiber;
/// `post` may be called from any thread. The baton must outlive the
/// awaiting fiber's suspension: waiting on it borrows it for exactly
/// that long, and the verdict word is all the state there is.
#[derive(Default)]
pub struct Baton {
    state: AtomicUsize,
}

impl Baton {
    pub const fn new() -> Self {
        Baton {
            state: AtomicUsize::new(INIT),
        }
    }

    /// True once the baton has been decided, by post or by timeout.
    pub fn is_decided(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), POSTED | TIMED_OUT)
    }

    /// Blocks the calling fiber until the baton is posted or timed out.
    ///
    /// Must be called from a fiber; anything else is a contract violation
    /// and fails a hard assertion.
    pub fn wait(&self) -> WaitOutcome {
        let mgr = manager::current_ptr();
        assert!(!mgr.is_null(), "Baton::wait outside a fiber manager loop");
        // SAFETY: the pointer is published only while the manager runs on
        // this thread.
        let mgr = unsafe { &*mgr };
        // Checked before the fast path so an already-decided baton cannot
        // mask a wait from a main-context thunk.
        assert!(mgr.has_active_fiber(), "baton wait requires a fiber context");

        // Fast path: decided before we ever suspend.
        match self.state.load(Ordering::Acquire) {
            POSTED => return WaitOutcome::Posted,
            TIMED_OUT => return WaitOutcome::TimedOut,
            _ => {}
        }

        mgr.park_on_baton(self);

        match self.state.load(Ordering::Acquire) {
            POSTED => WaitOutcome::Posted,
            TIMED_OUT => WaitOutcome::TimedOut,
            other => unreachable!("fiber resumed with undecided baton state {other}"),
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. The losing
    /// side, post or timer, is a no-op; exactly one effect is ever
    /// visible to the waiter.
    pub fn wait_timeout(&self, timeout: Duration) -> WaitOutcome {
        let mgr = manager::current_ptr();
        assert!(!mgr.is_null(), "Baton::wait_timeout outside a fiber manager loop");
        // SAFETY: as in `wait`.
        let mgr = unsafe { &*mgr };
        // Checked before registering: the callback points into this frame,
        // which only a parked fiber keeps alive.
        assert!(mgr.has_active_fiber(), "baton wait requires a fiber context");

        let service = mgr.timeout_service();
        let baton = self as *const Baton as usize;
        let token = service.register(
            timeout,
            // SAFETY: the registration is cancelled below before this frame
            // returns, and the service guarantees a cancelled callback does
            // not fire; the pointer is live whenever the callback runs.
            Box::new(move || unsafe { (*(baton as *const Baton)).decide(TIMED_OUT) }),
        );
        let outcome = self.wait();
        service.cancel(token);
        outcome
    }

    /// Posts the baton, waking the parked fiber if there is one. Callable
    /// from any thread; posting an already-decided baton does nothing.
    pub fn post(&self) {
        self.decide(POSTED);
    }

    fn decide(&self, verdict: usize) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == POSTED || current == TIMED_OUT {
                return;
            }
            match self.state.compare_exchange(
                current,
                verdict,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current != INIT {
                        // A fiber is parked here: hand it back to its manager.
                        manager::schedule_posted_fiber(FiberHandle(current as *mut Fiber));
                    }
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Publishes the parked fiber. Main context only, called by the run
    /// loop after the waiter switched out. Returns false when a poster
    /// already decided the baton, in which case the caller re-readies the
    /// fiber itself.
    pub(crate) fn try_install_waiter(&self, fiber: *mut Fiber) -> bool {
        self.state
            .compare_exchange(INIT, fiber as usize, Ordering::Release, Ordering::Acquire)
            .is_ok()
    }
}

impl Drop for Baton {
    fn drop(&mut self) {
        let state = *self.state.get_mut();
        assert!(
            matches!(state, INIT | POSTED | TIMED_OUT),
            "baton dropped while a fiber is parked on it"
        );
    }
}
