//! Contract for the host loop, plus a minimal bundled implementation.
//!
//! The manager never blocks: when nothing is ready it returns to its
//! caller, and somebody has to arrange the next `run_until_idle` on the
//! owning thread. That somebody is the loop driver. Submissions on the
//! manager thread arm it with `schedule`; remote producers and foreign
//! posters use `schedule_thread_safe`.

use crossbeam::channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use crate::manager::FiberManager;

/// Host-side scheduling contract.
pub trait LoopDriver: Send + Sync {
    /// Arrange for the manager's run function to be called on its owning
    /// thread at least once after this call. Owner thread only; idempotent
    /// from the manager's perspective.
    fn schedule(&self);

    /// Same, callable from any thread; must not block the caller.
    fn schedule_thread_safe(&self);

    /// Best-effort cancellation of a pending wake.
    fn cancel(&self) {}
}

/// Channel-backed driver for tests, benches and simple hosts: the wake
/// signal is a bounded(1) channel, so any number of schedules coalesce
/// into one pending token.
pub struct SimpleLoopDriver {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl SimpleLoopDriver {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        let (tx, rx) = bounded(1);
        Arc::new(SimpleLoopDriver { tx, rx })
    }

    /// Consumes a pending wake token, if any.
    pub fn take_wake(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Blocks until a wake token arrives or `timeout` elapses.
    pub fn wait_wake(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    /// Drives `manager` until `until` returns true. Owner thread only.
    pub fn run_until(&self, manager: &FiberManager, mut until: impl FnMut() -> bool) {
        loop {
            self.take_wake();
            manager.run_until_idle();
            if until() {
                return;
            }
            // Every work arrival posts a wake token, so this returns
            // immediately when something already landed and otherwise naps
            // until a producer or poster wakes us.
            self.wait_wake(Duration::from_millis(1));
        }
    }
}

impl LoopDriver for SimpleLoopDriver {
    fn schedule(&self) {
        let _ = self.tx.try_send(());
    }

    fn schedule_thread_safe(&self) {
        let _ = self.tx.try_send(());
    }

    fn cancel(&self) {
        let _ = self.rx.try_recv();
    }
}
