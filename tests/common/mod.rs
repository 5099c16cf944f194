//! Shared harness for the integration tests: a heap-based timeout service
//! and a drive loop that runs a manager to full quiescence, firing due
//! timeouts along the way.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use weft::{FiberManager, TimeoutService, TimeoutToken};

/// Timer callbacks keyed by wall-clock deadline, fired manually by the
/// test's drive loop on the manager thread. `cancel` removes the pending
/// entry outright, which is exactly the guarantee timed baton waits need.
#[derive(Default)]
pub struct TestTimeoutService {
    pending: RefCell<Vec<(TimeoutToken, Instant, Box<dyn FnOnce()>)>>,
    next_token: Cell<u64>,
}

impl TestTimeoutService {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Fires every callback whose deadline has passed; returns how many ran.
    pub fn fire_due(&self) -> usize {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut pending = self.pending.borrow_mut();
            let mut i = 0;
            while i < pending.len() {
                if pending[i].1 <= now {
                    due.push(pending.swap_remove(i).2);
                } else {
                    i += 1;
                }
            }
        }
        // The borrow is released: callbacks may re-register or cancel.
        let fired = due.len();
        for callback in due {
            callback();
        }
        fired
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.borrow().is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.borrow().iter().map(|entry| entry.1).min()
    }
}

impl TimeoutService for TestTimeoutService {
    fn register(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimeoutToken {
        let token = TimeoutToken(self.next_token.get());
        self.next_token.set(token.0 + 1);
        self.pending
            .borrow_mut()
            .push((token, Instant::now() + delay, callback));
        token
    }

    fn cancel(&self, token: TimeoutToken) {
        self.pending.borrow_mut().retain(|entry| entry.0 != token);
    }
}

/// Drives `manager` until no task remains, sleeping toward timer deadlines
/// when everything is parked. Panics on a wait that nothing can ever wake.
#[allow(dead_code)]
pub fn quiesce(manager: &FiberManager, timeouts: &TestTimeoutService) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        manager.run_until_idle();
        if timeouts.fire_due() > 0 {
            continue;
        }
        if !manager.has_tasks() {
            return;
        }
        match timeouts.next_deadline() {
            Some(next) => {
                let now = Instant::now();
                if next > now {
                    std::thread::sleep((next - now).min(Duration::from_millis(5)));
                }
            }
            None => panic!("manager has parked tasks and no timer can wake them"),
        }
        assert!(Instant::now() < deadline, "quiesce timed out");
    }
}
