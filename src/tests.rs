//! Scenario tests for the fiber manager core.

use crate::{on_fiber, Baton, FiberManager, Options, SimpleLoopDriver, WaitOutcome};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

fn manager() -> FiberManager {
    FiberManager::new(Options::default(), SimpleLoopDriver::new())
}

#[test]
fn test_single_task_runs_to_completion() {
    let manager = manager();
    let value = Rc::new(Cell::new(0));
    let sink = Rc::clone(&value);

    manager.submit(move || sink.set(42)).unwrap();
    // Submission never runs synchronously.
    assert_eq!(value.get(), 0);
    assert!(manager.has_tasks());

    let pending = manager.run_until_idle();

    assert_eq!(value.get(), 42);
    assert!(!pending);
    assert_eq!(manager.fibers_allocated(), 1);
    assert_eq!(manager.fibers_pool_size(), 1);
    assert!(!manager.has_tasks());
}

#[test]
fn test_tasks_run_in_submission_order() {
    let manager = manager();
    let order = Rc::new(RefCell::new(Vec::new()));

    for i in 0..10 {
        let order = Rc::clone(&order);
        manager.submit(move || order.borrow_mut().push(i)).unwrap();
    }
    manager.run_until_idle();

    assert_eq!(*order.borrow(), (0..10).collect::<Vec<_>>());
}

#[test]
fn test_await_and_post_on_same_thread() {
    let manager = manager();
    let baton = Arc::new(Baton::new());
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let baton = Arc::clone(&baton);
        let log = Rc::clone(&log);
        manager
            .submit(move || {
                log.borrow_mut().push("a:waiting");
                assert_eq!(baton.wait(), WaitOutcome::Posted);
                log.borrow_mut().push("a:resumed");
            })
            .unwrap();
    }
    {
        let baton = Arc::clone(&baton);
        let log = Rc::clone(&log);
        manager
            .submit(move || {
                log.borrow_mut().push("c:posting");
                baton.post();
            })
            .unwrap();
    }

    manager.run_until_idle();

    assert_eq!(
        *log.borrow(),
        vec!["a:waiting", "c:posting", "a:resumed"]
    );
    assert_eq!(manager.fibers_pool_size(), 2);
    assert!(!manager.has_tasks());
}

#[test]
fn test_post_before_wait_returns_immediately() {
    let manager = manager();
    let baton = Arc::new(Baton::new());
    baton.post();

    let resumed = Rc::new(Cell::new(false));
    let sink = Rc::clone(&resumed);
    let waiter = Arc::clone(&baton);
    manager
        .submit(move || {
            assert_eq!(waiter.wait(), WaitOutcome::Posted);
            sink.set(true);
        })
        .unwrap();
    manager.run_until_idle();

    assert!(resumed.get());
}

#[test]
fn test_fibers_are_recycled_through_the_pool() {
    let manager = manager();
    for round in 0..5 {
        for _ in 0..4 {
            manager.submit(|| {}).unwrap();
        }
        manager.run_until_idle();
        // Same four fibers every round; active + pooled == allocated.
        assert_eq!(manager.fibers_allocated(), 4, "round {round}");
        assert_eq!(manager.fibers_pool_size(), 4, "round {round}");
    }
}

#[test]
fn test_pool_is_bounded_by_cap() {
    let manager = FiberManager::new(
        Options {
            max_fibers_pool_size: 2,
            ..Options::default()
        },
        SimpleLoopDriver::new(),
    );
    let batons: Vec<Arc<Baton>> = (0..5).map(|_| Arc::new(Baton::new())).collect();

    // Five concurrent waiters force five live fibers.
    for baton in &batons {
        let baton = Arc::clone(baton);
        manager
            .submit(move || {
                baton.wait();
            })
            .unwrap();
    }
    manager.run_until_idle();
    assert_eq!(manager.fibers_allocated(), 5);
    assert_eq!(manager.fibers_pool_size(), 0);

    // Wake everyone; only two survive into the pool.
    for baton in &batons {
        baton.post();
    }
    manager.run_until_idle();
    assert_eq!(manager.fibers_pool_size(), 2);
    assert_eq!(manager.fibers_allocated(), manager.fibers_pool_size());
}

#[test]
fn test_serial_execution_no_overlap() {
    let manager = manager();
    let running = Rc::new(Cell::new(0u32));
    let max_seen = Rc::new(Cell::new(0u32));

    for _ in 0..8 {
        let running = Rc::clone(&running);
        let max_seen = Rc::clone(&max_seen);
        manager
            .submit(move || {
                running.set(running.get() + 1);
                max_seen.set(max_seen.get().max(running.get()));
                running.set(running.get() - 1);
            })
            .unwrap();
    }
    manager.run_until_idle();

    assert_eq!(max_seen.get(), 1);
}

#[test]
fn test_run_in_main_context_returns_value() {
    let manager = manager();
    let observed = Rc::new(RefCell::new(Vec::new()));

    let log = Rc::clone(&observed);
    manager
        .submit(move || {
            let mgr = unsafe { &*crate::manager::current_ptr() };
            log.borrow_mut().push(("before", on_fiber()));
            let doubled = mgr.run_in_main_context(|| {
                log.borrow_mut().push(("inside", on_fiber()));
                21 * 2
            });
            log.borrow_mut().push(("after", on_fiber()));
            assert_eq!(doubled, 42);
        })
        .unwrap();
    manager.run_until_idle();

    assert_eq!(
        *observed.borrow(),
        vec![("before", true), ("inside", false), ("after", true)]
    );
}

#[test]
fn test_main_context_thunk_still_sees_fiber_locals() {
    let manager = manager();
    let seen = Rc::new(Cell::new(0u64));

    let sink = Rc::clone(&seen);
    manager
        .submit(move || {
            let mgr = unsafe { &*crate::manager::current_ptr() };
            mgr.with_local::<u64, _>(|slot| *slot = 99);
            mgr.run_in_main_context(|| {
                // Not on a fiber stack, but the fiber's locals resolve.
                assert!(!on_fiber());
                sink.set(mgr.with_local::<u64, _>(|slot| *slot));
            });
        })
        .unwrap();
    manager.run_until_idle();

    assert_eq!(seen.get(), 99);
}

#[test]
fn test_main_context_panic_unwinds_on_the_fiber() {
    let manager = manager();
    let caught = Rc::new(Cell::new(false));

    let sink = Rc::clone(&caught);
    manager
        .submit(move || {
            let mgr = unsafe { &*crate::manager::current_ptr() };
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                mgr.run_in_main_context(|| panic!("main context boom"))
            }));
            sink.set(result.is_err());
        })
        .unwrap();
    manager.run_until_idle();

    assert!(caught.get());
    assert!(!manager.has_tasks());
}

#[test]
fn test_finally_receives_value() {
    let manager = manager();
    let outcome = Rc::new(RefCell::new(None));

    let sink = Rc::clone(&outcome);
    manager
        .submit_finally(|| 7 * 6, move |result| *sink.borrow_mut() = Some(result))
        .unwrap();
    manager.run_until_idle();

    assert_eq!(outcome.borrow_mut().take().unwrap().unwrap(), 42);
}

#[test]
fn test_finally_receives_failure() {
    let manager = manager();
    let outcome = Rc::new(RefCell::new(None));

    let sink = Rc::clone(&outcome);
    manager
        .submit_finally(
            || -> u32 { panic!("task exploded") },
            move |result| *sink.borrow_mut() = Some(result),
        )
        .unwrap();
    manager.run_until_idle();

    let failure = outcome.borrow_mut().take().unwrap().unwrap_err();
    assert_eq!(failure.message(), "task exploded");

    // The manager keeps accepting work after a failure.
    let ran = Rc::new(Cell::new(false));
    let sink = Rc::clone(&ran);
    manager.submit(move || sink.set(true)).unwrap();
    manager.run_until_idle();
    assert!(ran.get());
}

#[test]
fn test_ready_hook_runs_before_first_resume() {
    let manager = manager();
    let log = Rc::new(RefCell::new(Vec::new()));

    let hook_log = Rc::clone(&log);
    let task_log = Rc::clone(&log);
    manager
        .submit_with_hook(
            move || task_log.borrow_mut().push("task"),
            move || {
                // Main context: the fiber has not started yet.
                assert!(!on_fiber());
                hook_log.borrow_mut().push("hook");
            },
        )
        .unwrap();
    manager.run_until_idle();

    assert_eq!(*log.borrow(), vec!["hook", "task"]);
}

#[test]
fn test_wait_from_main_context_hook_is_fatal() {
    let manager = manager();
    let failures = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&failures);
    manager.set_exception_callback(move |failure, context| {
        sink.borrow_mut().push((failure.message().to_string(), context));
    });

    // Already decided, so a leaky fast path would return instead of
    // tripping the fiber-context assertion.
    let baton = Arc::new(Baton::new());
    baton.post();

    let misused = Arc::clone(&baton);
    manager
        .submit_with_hook(
            || {},
            move || {
                misused.wait();
            },
        )
        .unwrap();
    manager.run_until_idle();

    let failures = failures.borrow();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].0.contains("requires a fiber context"));
    assert_eq!(failures[0].1, "ready hook");
    assert!(!manager.has_tasks());
}

#[test]
fn test_nested_submission_from_a_fiber() {
    let manager = manager();
    let log = Rc::new(RefCell::new(Vec::new()));

    let outer_log = Rc::clone(&log);
    manager
        .submit(move || {
            let mgr = unsafe { &*crate::manager::current_ptr() };
            outer_log.borrow_mut().push("outer");
            let inner_log = Rc::clone(&outer_log);
            mgr.submit(move || inner_log.borrow_mut().push("inner"))
                .unwrap();
            outer_log.borrow_mut().push("outer-done");
        })
        .unwrap();
    manager.run_until_idle();

    assert_eq!(*log.borrow(), vec!["outer", "outer-done", "inner"]);
    assert!(!manager.has_tasks());
}
