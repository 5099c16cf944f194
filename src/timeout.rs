//! Contract for the external timeout service.
//!
//! The manager never implements timer wheels or heaps itself; the host
//! supplies something that can run a callback on the manager's thread at
//! or after a deadline. Baton timed waits are the only consumer inside
//! this crate.

use std::time::Duration;

/// Opaque handle to a pending registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeoutToken(pub u64);

/// Deferred-callback scheduler owned by the host.
///
/// Contract:
/// - `register` arranges for `callback` to run on the manager's thread at
///   or after `delay` from now.
/// - `cancel` is best effort, but when called from the manager thread it
///   must guarantee the callback will not run afterwards. Timed baton
///   waits rely on that guarantee: their callbacks point into the waiting
///   call frame.
pub trait TimeoutService {
    fn register(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimeoutToken;

    fn cancel(&self, token: TimeoutToken);
}
