//! The fiber manager: scheduling loop, free pool and submission API.
//!
//! A manager multiplexes any number of fibers over the single thread it is
//! first run on. Everything scheduling-related is plain single-threaded
//! state behind `Cell`/`RefCell`; the only concurrent surfaces are the two
//! lock-free remote lists and the loop driver's wake signal, reachable
//! through [`RemoteSubmitter`](crate::RemoteSubmitter) and
//! [`Baton::post`](crate::Baton::post).

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::baton::Baton;
use crate::driver::LoopDriver;
use crate::error::{SpawnError, TaskFailure, TaskOutcome};
use crate::fiber::{Fiber, FiberHandle, FiberInput, FiberState, FiberYield, TaskBox};
use crate::local_data::LocalData;
use crate::remote::{RemoteSide, RemoteSubmitter};
use crate::timeout::TimeoutService;

/// Tuning knobs, fixed at construction.
#[derive(Clone, Debug)]
pub struct Options {
    /// Stack size for every fiber, in bytes. The mapping may be rounded up
    /// to page granularity.
    pub stack_size: usize,

    /// Keep at most this many idle fibers for reuse. Completed fibers
    /// beyond the cap are destroyed, so total live fibers stay bounded by
    /// active + this cap.
    pub max_fibers_pool_size: usize,

    /// Record exact stack usage. Expensive: every new stack is painted
    /// with a sentinel and linearly scanned each time its fiber returns
    /// to the pool.
    pub debug_record_stack_used: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            stack_size: 64 * 1024,
            max_fibers_pool_size: 1000,
            debug_record_stack_used: false,
        }
    }
}

thread_local! {
    /// Manager whose loop is running on this thread, if any. Stacked on
    /// entry so nested managers restore the outer one on exit.
    static CURRENT_MANAGER: Cell<*const FiberManager> = const { Cell::new(ptr::null()) };
}

/// True iff the calling code is running on a fiber's own stack.
///
/// Thunks executed through `run_in_main_context` observe `false` here even
/// though their fiber's locals are still reachable.
pub fn on_fiber() -> bool {
    let mgr = CURRENT_MANAGER.with(|cell| cell.get());
    // SAFETY: the pointer is published only for the duration of the
    // manager's loop on this very thread.
    !mgr.is_null() && unsafe { (*mgr).has_active_fiber() }
}

pub(crate) fn current_ptr() -> *const FiberManager {
    CURRENT_MANAGER.with(|cell| cell.get())
}

/// Locals of the fiber currently running on this thread, for remote
/// submission snapshots. None outside a fiber.
pub(crate) fn current_locals_snapshot() -> Option<LocalData> {
    let mgr = current_ptr();
    if mgr.is_null() {
        return None;
    }
    // SAFETY: published only while the manager runs on this thread.
    unsafe { (*mgr).snapshot_current_locals() }
}

/// Hands a just-posted fiber back to its manager. Called by the winning
/// `Baton::post` from whatever thread it happens on: straight onto the
/// local ready queue when that is this manager's own loop, through the
/// remote-ready list otherwise.
pub(crate) fn schedule_posted_fiber(handle: FiberHandle) {
    // SAFETY: the fiber was parked (owned by the baton); only this call
    // site takes it over, and only its manager's thread will run it.
    let fiber = unsafe { &*handle.0 };
    if current_ptr() == fiber.manager {
        // SAFETY: we are on the owning thread, inside the loop.
        unsafe { (*fiber.manager).ready_posted_fiber(handle) };
    } else {
        let remote = Arc::clone(&fiber.remote);
        if remote.ready_queue.push(handle.0) {
            remote.driver.schedule_thread_safe();
        }
    }
}

/// Single-threaded cooperative task execution engine.
///
/// Tasks are submitted as thunks, each runs on a fiber with its own stack,
/// and a fiber may suspend mid-execution on a [`Baton`] and resume later at
/// the exact point of suspension. The manager owns the ready queue, the
/// pool of idle fibers and the main context the loop runs on; it is pinned
/// to the thread that first runs it and is deliberately `!Send + !Sync`.
pub struct FiberManager {
    ready_fibers: RefCell<VecDeque<Box<Fiber>>>,
    fibers_pool: RefCell<Vec<Box<Fiber>>>,

    fibers_allocated: Cell<usize>,
    fibers_active: Cell<usize>,

    /// Fiber executing on its own stack, null on the main context.
    active_fiber: Cell<*mut Fiber>,
    /// As `active_fiber`, but kept set while main-context thunks run so
    /// fiber-local lookups still resolve.
    current_fiber: Cell<*mut Fiber>,

    /// Baton parked here between a waiter's suspension and the
    /// main-context half of the handshake.
    pending_baton: Cell<*const Baton>,

    is_loop_scheduled: Cell<bool>,
    stack_high_watermark: Cell<usize>,

    options: Options,
    exception_callback: RefCell<Box<dyn FnMut(TaskFailure, &'static str)>>,

    remote: Arc<RemoteSide>,
    timeouts: RefCell<Option<Rc<dyn TimeoutService>>>,

    /// Fallback slot bag for local lookups outside any fiber.
    manager_locals: RefCell<LocalData>,

    /// Pinned on first run.
    owner: Cell<Option<ThreadId>>,

    _not_send: PhantomData<*const ()>,
}

impl FiberManager {
    /// Creates a manager. Nothing runs until the host calls
    /// [`run_until_idle`](Self::run_until_idle) on the owning thread.
    pub fn new(options: Options, driver: Arc<dyn LoopDriver>) -> FiberManager {
        FiberManager {
            ready_fibers: RefCell::new(VecDeque::new()),
            fibers_pool: RefCell::new(Vec::new()),
            fibers_allocated: Cell::new(0),
            fibers_active: Cell::new(0),
            active_fiber: Cell::new(ptr::null_mut()),
            current_fiber: Cell::new(ptr::null_mut()),
            pending_baton: Cell::new(ptr::null()),
            is_loop_scheduled: Cell::new(false),
            stack_high_watermark: Cell::new(0),
            options,
            exception_callback: RefCell::new(Box::new(|failure, context| {
                log::error!("unhandled {context} failure: {failure}");
            })),
            remote: RemoteSide::new(driver),
            timeouts: RefCell::new(None),
            manager_locals: RefCell::new(LocalData::default()),
            owner: Cell::new(None),
            _not_send: PhantomData,
        }
    }

    /// Installs the timeout service timed baton waits go through.
    pub fn set_timeout_service(&self, service: Rc<dyn TimeoutService>) {
        *self.timeouts.borrow_mut() = Some(service);
    }

    pub(crate) fn timeout_service(&self) -> Rc<dyn TimeoutService> {
        self.timeouts
            .borrow()
            .clone()
            .expect("no timeout service configured")
    }

    /// Replaces the callback invoked when a task fails with no finally
    /// sink to receive the failure. Must not itself fail.
    pub fn set_exception_callback(
        &self,
        callback: impl FnMut(TaskFailure, &'static str) + 'static,
    ) {
        *self.exception_callback.borrow_mut() = Box::new(callback);
    }

    /// Cloneable handle for submitting tasks from other threads.
    pub fn remote_handle(&self) -> RemoteSubmitter {
        RemoteSubmitter::new(Arc::clone(&self.remote))
    }

    // --- submission -------------------------------------------------------

    /// Enqueues a task. Never runs it synchronously, even when called from
    /// the main context with an idle manager. When called from a fiber,
    /// the child receives a copy of the submitter's locals.
    pub fn submit<F>(&self, func: F) -> Result<(), SpawnError>
    where
        F: FnOnce() + 'static,
    {
        self.submit_parts(Box::new(func), None, None)
    }

    /// Like [`submit`](Self::submit); `ready_hook` additionally runs on
    /// the main context immediately before the new fiber's first resume,
    /// never reordered with other fibers' hooks.
    pub fn submit_with_hook<F, G>(&self, func: F, ready_hook: G) -> Result<(), SpawnError>
    where
        F: FnOnce() + 'static,
        G: FnOnce() + 'static,
    {
        self.submit_parts(Box::new(func), Some(Box::new(ready_hook)), None)
    }

    /// Like [`submit`](Self::submit) for a value-returning task; once it
    /// completes, `finally` runs on the main context with the outcome,
    /// including the failure if the task panicked.
    pub fn submit_finally<T, F, G>(&self, func: F, finally: G) -> Result<(), SpawnError>
    where
        T: 'static,
        F: FnOnce() -> T + 'static,
        G: FnOnce(TaskOutcome<T>) + 'static,
    {
        let result: Rc<Cell<Option<TaskOutcome<T>>>> = Rc::new(Cell::new(None));
        let sink = Rc::clone(&result);
        let task: TaskBox = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(func))
                .map_err(|payload| TaskFailure::from_panic(payload.as_ref()));
            sink.set(Some(outcome));
        });
        let finally: TaskBox = Box::new(move || {
            let outcome = result
                .take()
                .expect("task finished without recording an outcome");
            finally(outcome);
        });
        self.submit_parts(task, None, Some(finally))
    }

    /// Enqueues a task from the owner thread through the remote path.
    /// From any other thread, use [`remote_handle`](Self::remote_handle).
    pub fn submit_remote<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.remote_handle().submit(func);
    }

    fn submit_parts(
        &self,
        task: TaskBox,
        ready_hook: Option<TaskBox>,
        finally: Option<TaskBox>,
    ) -> Result<(), SpawnError> {
        self.assert_owner("submit");
        let locals = self.snapshot_current_locals();
        let mut fiber = self.take_fiber()?;
        fiber.prepare(task, locals, ready_hook, finally);
        self.ready_fibers.borrow_mut().push_back(fiber);
        self.ensure_loop_scheduled();
        Ok(())
    }

    fn take_fiber(&self) -> Result<Box<Fiber>, SpawnError> {
        if let Some(fiber) = self.fibers_pool.borrow_mut().pop() {
            self.fibers_active.set(self.fibers_active.get() + 1);
            return Ok(fiber);
        }
        let fiber = Fiber::new(
            self.options.stack_size,
            self.options.debug_record_stack_used,
            self as *const FiberManager,
            Arc::clone(&self.remote),
        )?;
        self.fibers_allocated.set(self.fibers_allocated.get() + 1);
        self.fibers_active.set(self.fibers_active.get() + 1);
        Ok(fiber)
    }

    // --- scheduling loop --------------------------------------------------

    /// Runs ready fibers until none remain, then returns whether any
    /// outstanding work (awaiting fibers, undrained remote submissions)
    /// is left. Never blocks; the loop driver decides when to call again.
    pub fn run_until_idle(&self) -> bool {
        self.assert_owner("run_until_idle");
        assert!(
            self.active_fiber.get().is_null(),
            "run loop re-entered from a fiber"
        );
        let _enter = EnterGuard::new(self);
        self.is_loop_scheduled.set(false);

        loop {
            self.drain_remote();
            let fiber = self.ready_fibers.borrow_mut().pop_front();
            match fiber {
                Some(fiber) => self.run_ready_fiber(fiber),
                None => {
                    // Work published during the drain must not strand.
                    if self.remote.task_queue.is_empty() && self.remote.ready_queue.is_empty() {
                        break;
                    }
                }
            }
        }
        self.has_tasks()
    }

    /// Moves remotely published work into the local structures: woken
    /// fibers rejoin the ready queue, remote tasks become fibers.
    fn drain_remote(&self) {
        for raw in self.remote.ready_queue.sweep() {
            // SAFETY: ownership rode the list from the waking thread.
            let fiber = unsafe { Box::from_raw(raw) };
            fiber.state.set(FiberState::Ready);
            self.ready_fibers.borrow_mut().push_back(fiber);
        }
        for raw in self.remote.task_queue.sweep() {
            // SAFETY: ownership rode the list from the submitting thread.
            let task = unsafe { Box::from_raw(raw) };
            let (func, locals) = task.into_parts();
            match self.take_fiber() {
                Ok(mut fiber) => {
                    fiber.prepare(func, locals, None, None);
                    self.ready_fibers.borrow_mut().push_back(fiber);
                }
                Err(err) => {
                    // No synchronous channel back to the submitter; the
                    // task is dropped with a diagnostic.
                    self.report_failure(TaskFailure::new(err.to_string()), "remote task");
                }
            }
        }
    }

    fn run_ready_fiber(&self, mut fiber: Box<Fiber>) {
        // The hook fires exactly once, just before the first resume.
        if let Some(hook) = fiber.ready_hook.take() {
            self.run_sink(hook, "ready hook");
        }

        let raw = &mut *fiber as *mut Fiber;
        let input = match fiber.state.get() {
            FiberState::NotStarted => FiberInput::Run(fiber.take_task(), FiberHandle(raw)),
            FiberState::Ready => FiberInput::Resume,
            other => unreachable!("fiber in state {other:?} on the ready queue"),
        };

        self.active_fiber.set(raw);
        self.current_fiber.set(raw);
        let reason = fiber.resume(input);
        self.active_fiber.set(ptr::null_mut());

        match reason {
            FiberYield::Completed(payload) => {
                // `current_fiber` stays set through the finally so the
                // task's locals remain reachable from it.
                if let Some(finally) = fiber.finally.take() {
                    self.run_sink(finally, "finally");
                }
                if let Some(payload) = payload {
                    self.report_failure(TaskFailure::from_panic(payload.as_ref()), "task");
                }
                self.current_fiber.set(ptr::null_mut());
                self.recycle(fiber);
            }
            FiberYield::Awaiting => {
                self.current_fiber.set(ptr::null_mut());
                let baton = self.pending_baton.replace(ptr::null());
                assert!(!baton.is_null(), "fiber suspended awaiting without a baton");
                let raw = Box::into_raw(fiber);
                // Install the waiter only now that the fiber has truly
                // switched out; a racing poster either sees it or has
                // already decided the baton.
                // SAFETY: the baton outlives the suspension; see Baton docs.
                if !unsafe { (*baton).try_install_waiter(raw) } {
                    // SAFETY: the install failed, so ownership never left us.
                    let fiber = unsafe { Box::from_raw(raw) };
                    fiber.state.set(FiberState::Ready);
                    self.ready_fibers.borrow_mut().push_back(fiber);
                }
            }
            FiberYield::YieldedToMain => {
                // `active_fiber` is already clear, so on_fiber() reports
                // false inside the thunk while locals stay reachable.
                let immediate = fiber
                    .immediate
                    .take()
                    .expect("fiber yielded to main without a thunk");
                immediate();
                self.current_fiber.set(ptr::null_mut());
                fiber.state.set(FiberState::Ready);
                // Front of the queue: the fiber resumes with minimal latency.
                self.ready_fibers.borrow_mut().push_front(fiber);
            }
        }
    }

    /// Runs a main-context sink (finally, ready hook), containing panics.
    fn run_sink(&self, sink: TaskBox, context: &'static str) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(sink)) {
            self.report_failure(TaskFailure::from_panic(payload.as_ref()), context);
        }
    }

    fn recycle(&self, mut fiber: Box<Fiber>) {
        self.fibers_active.set(self.fibers_active.get() - 1);
        if self.options.debug_record_stack_used {
            let used = fiber.record_stack_used();
            debug_assert!(used <= fiber.stack_size(), "fiber stack overflow");
            if used > self.stack_high_watermark.get() {
                self.stack_high_watermark.set(used);
                log::trace!("new stack high watermark: {used} bytes");
            }
        }
        let mut pool = self.fibers_pool.borrow_mut();
        if pool.len() < self.options.max_fibers_pool_size {
            fiber.state.set(FiberState::Invalid);
            fiber.local_data.clear();
            pool.push(fiber);
        } else {
            self.fibers_allocated.set(self.fibers_allocated.get() - 1);
            // Dropping the fiber force-unwinds its parked trampoline and
            // releases the stack mapping.
        }
    }

    /// Re-readies a fiber whose baton was posted from this thread while
    /// the loop is running.
    pub(crate) fn ready_posted_fiber(&self, handle: FiberHandle) {
        // SAFETY: the waiter handed ownership to the baton; the winning
        // post hands it back to us.
        let fiber = unsafe { Box::from_raw(handle.0) };
        fiber.state.set(FiberState::Ready);
        self.ready_fibers.borrow_mut().push_back(fiber);
        self.ensure_loop_scheduled();
    }

    /// Parks the active fiber on `baton`. Called from the fiber, via
    /// `Baton::wait`; returns once the baton is decided and the fiber
    /// resumed.
    pub(crate) fn park_on_baton(&self, baton: &Baton) {
        let active = self.active_fiber.get();
        assert!(!active.is_null(), "baton wait requires a fiber context");
        self.pending_baton.set(baton as *const Baton);
        // SAFETY: `active` is the fiber this code is running on.
        unsafe {
            (*active).state.set(FiberState::Awaiting);
            let _ = (*active).suspend(FiberYield::Awaiting);
        }
    }

    // --- main context escape hatch ---------------------------------------

    /// Runs `func` on the main context and returns its value. Outside a
    /// fiber this is a plain call; inside one, the fiber suspends, the
    /// loop runs `func`, and the fiber resumes next with the result. A
    /// panicking `func` unwinds on the calling fiber, not in the loop.
    pub fn run_in_main_context<F, R>(&self, func: F) -> R
    where
        F: FnOnce() -> R,
    {
        let active = self.active_fiber.get();
        if active.is_null() {
            return func();
        }

        let mut slot: Option<thread::Result<R>> = None;
        {
            let slot_ptr: *mut Option<thread::Result<R>> = &mut slot;
            let thunk: Box<dyn FnOnce() + '_> = Box::new(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(func));
                // SAFETY: the suspended frame that owns `slot` stays alive
                // until this fiber is resumed, which happens strictly after
                // the thunk runs.
                unsafe { *slot_ptr = Some(outcome) };
            });
            // SAFETY: the thunk is executed on the main context before this
            // frame resumes, so the captured borrows never dangle.
            let thunk: TaskBox = unsafe { mem::transmute(thunk) };
            // SAFETY: `active` is the fiber this code is running on.
            unsafe {
                (*active).immediate = Some(thunk);
                (*active).state.set(FiberState::YieldedToMain);
                let _ = (*active).suspend(FiberYield::YieldedToMain);
            }
        }
        match slot.take().expect("main-context thunk did not run") {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    // --- fiber-local storage ----------------------------------------------

    /// Gives `func` access to the typed fiber-local slot of the current
    /// fiber, default-constructing it on first use. Outside any fiber the
    /// slot comes from a manager-owned bag instead.
    ///
    /// The same slot type must be used consistently per fiber, and
    /// re-entrant access to the *same* slot type from inside `func` is
    /// forbidden: one live reference per slot at a time.
    pub fn with_local<T, R>(&self, func: impl FnOnce(&mut T) -> R) -> R
    where
        T: Default + Clone + Send + 'static,
    {
        let current = self.current_fiber.get();
        let slot = if current.is_null() {
            self.manager_locals.borrow_mut().slot_ptr::<T>()
        } else {
            // SAFETY: single-threaded; the slot value lives behind its own
            // box, so later slot insertions do not move it.
            unsafe { (*current).local_data.slot_ptr::<T>() }
        };
        // SAFETY: one live reference per call, per the documented contract.
        func(unsafe { &mut *slot })
    }

    pub(crate) fn snapshot_current_locals(&self) -> Option<LocalData> {
        let current = self.current_fiber.get();
        if current.is_null() {
            None
        } else {
            // SAFETY: single-threaded read of the current fiber's bag.
            Some(unsafe { (*current).local_data.clone() })
        }
    }

    // --- observability ----------------------------------------------------

    /// How many fibers (and stacks) this manager has ever allocated and
    /// not yet destroyed.
    pub fn fibers_allocated(&self) -> usize {
        self.fibers_allocated.get()
    }

    /// How many allocated fibers sit idle in the free pool.
    pub fn fibers_pool_size(&self) -> usize {
        self.fibers_pool.borrow().len()
    }

    /// Whether any submitted work has not yet completed.
    pub fn has_tasks(&self) -> bool {
        self.fibers_active.get() > 0
            || !self.remote.task_queue.is_empty()
            || !self.remote.ready_queue.is_empty()
    }

    /// True while a fiber is executing on its own stack.
    pub fn has_active_fiber(&self) -> bool {
        !self.active_fiber.get().is_null()
    }

    /// Largest observed per-fiber stack usage, in bytes. Always zero
    /// unless `debug_record_stack_used` is set.
    pub fn stack_high_watermark(&self) -> usize {
        self.stack_high_watermark.get()
    }

    // --- internals --------------------------------------------------------

    pub(crate) fn report_failure(&self, failure: TaskFailure, context: &'static str) {
        (self.exception_callback.borrow_mut())(failure, context);
    }

    fn ensure_loop_scheduled(&self) {
        if !self.is_loop_scheduled.get() {
            self.is_loop_scheduled.set(true);
            self.remote.driver.schedule();
        }
    }

    /// Pins the manager to the first thread that drives it; every later
    /// owner-thread entry point asserts the pin.
    fn assert_owner(&self, what: &str) {
        let me = thread::current().id();
        match self.owner.get() {
            Some(owner) => assert!(owner == me, "{what} called off the manager thread"),
            None => self.owner.set(Some(me)),
        }
    }
}

impl Drop for FiberManager {
    fn drop(&mut self) {
        assert!(
            self.fibers_active.get() == 0
                && self.ready_fibers.borrow().is_empty()
                && self.remote.task_queue.is_empty()
                && self.remote.ready_queue.is_empty(),
            "FiberManager dropped with live or queued work"
        );
        // Pooled fibers are parked at their trampolines; dropping them
        // force-unwinds those frames and releases the stacks.
        self.fibers_pool.borrow_mut().clear();
    }
}

/// Publishes the manager in the thread-current slot for the duration of a
/// loop run, restoring whatever was there before (nested managers).
struct EnterGuard {
    previous: *const FiberManager,
}

impl EnterGuard {
    fn new(manager: &FiberManager) -> Self {
        let previous =
            CURRENT_MANAGER.with(|cell| cell.replace(manager as *const FiberManager));
        EnterGuard { previous }
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        CURRENT_MANAGER.with(|cell| cell.set(self.previous));
    }
}
