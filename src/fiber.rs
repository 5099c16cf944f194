//! Fiber: one resumable execution context.
//!
//! A fiber owns a stack and a `corosensei` coroutine whose body is a
//! trampoline loop: receive a task, run it under `catch_unwind`, yield a
//! completion marker, park until the next task. A pooled fiber is therefore
//! a live coroutine suspended at the top of that loop, and recycling it
//! re-enters the same warm stack instead of mapping a new one.
//!
//! Suspension points deeper inside a task (baton waits, main-context hops)
//! reach the coroutine's yielder through a raw pointer the trampoline
//! installs on entry.

use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::Arc;

use crate::error::SpawnError;
use crate::local_data::LocalData;
use crate::manager::FiberManager;
use crate::remote::{RemoteNode, RemoteSide};
use crate::stack::{self, StackSpan};

/// Raw pointer to a fiber, used wherever a fiber is referenced from
/// another structure: a baton's waiter slot or the remote-ready list.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct FiberHandle(pub(crate) *mut Fiber);

// SAFETY: the handle is an address; threads that hold one only ever hand
// it back to the owning manager's thread for actual use.
unsafe impl Send for FiberHandle {}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FiberState {
    /// Idle in the pool, no task installed.
    Invalid,
    /// Task installed, never resumed.
    NotStarted,
    /// On the ready queue, resumable.
    Ready,
    /// Executing on its own stack.
    Running,
    /// Parked on a baton; owned by neither queue.
    Awaiting,
    /// Suspended while its main-context thunk runs.
    YieldedToMain,
}

pub(crate) type TaskBox = Box<dyn FnOnce()>;

/// Value passed into the coroutine on resume.
pub(crate) enum FiberInput {
    /// Install and run a task on a fresh or recycled fiber.
    Run(TaskBox, FiberHandle),
    /// Continue from the last suspension point.
    Resume,
}

/// Why control came back to the main context.
pub(crate) enum FiberYield {
    /// The task ran to completion; carries the panic payload if it unwound.
    Completed(Option<Box<dyn Any + Send>>),
    /// Parked on a baton; the manager finishes the waiter handshake.
    Awaiting,
    /// `run_in_main_context` wants its thunk executed.
    YieldedToMain,
}

pub(crate) struct Fiber {
    coroutine: Option<Coroutine<FiberInput, FiberYield, ()>>,
    span: StackSpan,

    /// Set by the trampoline on entry; meaningful only while the coroutine
    /// is live on its stack.
    yielder: Cell<*const Yielder<FiberInput, FiberYield>>,

    pub(crate) state: Cell<FiberState>,
    pub(crate) local_data: LocalData,
    pending_task: Option<TaskBox>,
    pub(crate) ready_hook: Option<TaskBox>,
    pub(crate) finally: Option<TaskBox>,
    /// Thunk parked here across a `run_in_main_context` switch.
    pub(crate) immediate: Option<TaskBox>,

    /// Stack bytes ever used, when recording is enabled.
    remembered_watermark: Cell<usize>,

    /// Hook for the manager's remote-ready list.
    next_remote_ready: AtomicPtr<Fiber>,

    /// Owning manager; the manager outlives every fiber it allocated.
    pub(crate) manager: *const FiberManager,
    /// Thread-safe half of the owning manager, for wake-ups from foreign
    /// threads.
    pub(crate) remote: Arc<RemoteSide>,
}

// SAFETY: `next_remote_ready` is embedded in the fiber, which lives behind
// a stable `Box` from allocation to destruction.
unsafe impl RemoteNode for Fiber {
    fn hook(&self) -> &AtomicPtr<Self> {
        &self.next_remote_ready
    }
}

impl Fiber {
    pub(crate) fn new(
        stack_size: usize,
        record_stack_used: bool,
        manager: *const FiberManager,
        remote: Arc<RemoteSide>,
    ) -> Result<Box<Fiber>, SpawnError> {
        let (stack, span) = stack::allocate(stack_size, record_stack_used)?;
        Ok(Box::new(Fiber {
            coroutine: Some(Coroutine::with_stack(stack, Self::trampoline)),
            span,
            yielder: Cell::new(ptr::null()),
            state: Cell::new(FiberState::Invalid),
            local_data: LocalData::default(),
            pending_task: None,
            ready_hook: None,
            finally: None,
            immediate: None,
            remembered_watermark: Cell::new(0),
            next_remote_ready: AtomicPtr::new(ptr::null_mut()),
            manager,
            remote,
        }))
    }

    /// Body of every fiber. One task per `Run` input; parks between tasks.
    fn trampoline(yielder: &Yielder<FiberInput, FiberYield>, mut input: FiberInput) {
        loop {
            let (task, handle) = match input {
                FiberInput::Run(task, handle) => (task, handle),
                FiberInput::Resume => unreachable!("idle fiber resumed without a task"),
            };
            // Publish the yielder so suspension points deeper in the task
            // can reach it.
            // SAFETY: the handle points at the boxed fiber that owns this
            // coroutine; it stays valid for as long as we can run.
            unsafe { (*handle.0).yielder.set(yielder as *const _) };
            let payload = panic::catch_unwind(AssertUnwindSafe(task)).err();
            input = yielder.suspend(FiberYield::Completed(payload));
        }
    }

    /// Installs a task into an idle fiber.
    pub(crate) fn prepare(
        &mut self,
        task: TaskBox,
        locals: Option<LocalData>,
        ready_hook: Option<TaskBox>,
        finally: Option<TaskBox>,
    ) {
        debug_assert!(matches!(self.state.get(), FiberState::Invalid));
        self.local_data = locals.unwrap_or_default();
        self.pending_task = Some(task);
        self.ready_hook = ready_hook;
        self.finally = finally;
        self.state.set(FiberState::NotStarted);
    }

    pub(crate) fn take_task(&mut self) -> TaskBox {
        self.pending_task.take().expect("fiber has no pending task")
    }

    /// Switches into the fiber. Main context only; returns when the fiber
    /// suspends or completes its task.
    pub(crate) fn resume(&mut self, input: FiberInput) -> FiberYield {
        self.state.set(FiberState::Running);
        let coroutine = self.coroutine.as_mut().expect("fiber has no coroutine");
        match coroutine.resume(input) {
            CoroutineResult::Yield(reason) => reason,
            CoroutineResult::Return(()) => unreachable!("fiber trampoline never returns"),
        }
    }

    /// Switches back to the main context with `reason`. Fiber context only;
    /// returns the input of the next resume.
    pub(crate) fn suspend(&self, reason: FiberYield) -> FiberInput {
        let yielder = self.yielder.get();
        assert!(!yielder.is_null(), "suspend outside a running fiber");
        // SAFETY: non-null only while the trampoline is live on this stack.
        unsafe { (*yielder).suspend(reason) }
    }

    /// Records stack usage on surrender to the pool; returns the fiber's
    /// high watermark. Only meaningful when the stack was painted.
    pub(crate) fn record_stack_used(&self) -> usize {
        let used = self.span.used_bytes();
        if used > self.remembered_watermark.get() {
            self.remembered_watermark.set(used);
        }
        self.remembered_watermark.get()
    }

    pub(crate) fn stack_size(&self) -> usize {
        self.span.size()
    }
}
