//! The cross-thread half of the manager.
//!
//! Foreign threads talk to a manager through exactly two lock-free
//! multi-producer/single-consumer intrusive lists: one carries brand-new
//! remote tasks, the other carries fibers of this manager woken from
//! another thread. Producers splice at the head with a CAS; the consumer
//! (the run loop) detaches the whole list in one exchange and reverses it,
//! restoring per-producer submission order.

use crossbeam::utils::CachePadded;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::driver::LoopDriver;
use crate::fiber::Fiber;
use crate::local_data::LocalData;
use crate::manager;

/// A node that can ride one of the manager's lock-free lists.
///
/// # Safety
///
/// `hook` must return an `AtomicPtr` embedded in the node itself, and the
/// node must not move while linked.
pub(crate) unsafe trait RemoteNode {
    fn hook(&self) -> &AtomicPtr<Self>
    where
        Self: Sized;
}

pub(crate) struct AtomicNodeList<T: RemoteNode> {
    head: CachePadded<AtomicPtr<T>>,
}

impl<T: RemoteNode> AtomicNodeList<T> {
    pub(crate) fn new() -> Self {
        AtomicNodeList {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Pushes a node, returning true when the list was previously empty.
    /// The producer that flips the list non-empty arms the loop driver.
    pub(crate) fn push(&self, node: *mut T) -> bool {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: the node is exclusively ours until the CAS publishes it.
            unsafe { (*node).hook().store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return head.is_null(),
                Err(observed) => head = observed,
            }
        }
    }

    /// Detaches everything and yields the nodes in insertion order.
    /// Consumer thread only.
    pub(crate) fn sweep(&self) -> Drain<T> {
        let mut head = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        // Producers publish in LIFO; reverse the chain in place for FIFO.
        let mut prev: *mut T = ptr::null_mut();
        while !head.is_null() {
            // SAFETY: detached nodes are owned by the consumer now.
            let next = unsafe { (*head).hook().load(Ordering::Relaxed) };
            unsafe { (*head).hook().store(prev, Ordering::Relaxed) };
            prev = head;
            head = next;
        }
        Drain { next: prev }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

pub(crate) struct Drain<T: RemoteNode> {
    next: *mut T,
}

impl<T: RemoteNode> Iterator for Drain<T> {
    type Item = *mut T;

    fn next(&mut self) -> Option<*mut T> {
        if self.next.is_null() {
            return None;
        }
        let node = self.next;
        // SAFETY: the chain was detached in `sweep`; nodes are unlinked as
        // they are handed out.
        self.next = unsafe { (*node).hook().load(Ordering::Relaxed) };
        Some(node)
    }
}

/// A task submitted from a foreign thread, waiting to be turned into a
/// fiber on the manager thread.
pub(crate) struct RemoteTask {
    func: Box<dyn FnOnce() + Send>,
    local_data: Option<LocalData>,
    next: AtomicPtr<RemoteTask>,
}

// SAFETY: `next` is embedded in the node and the node lives behind a
// stable heap allocation from creation to consumption.
unsafe impl RemoteNode for RemoteTask {
    fn hook(&self) -> &AtomicPtr<Self> {
        &self.next
    }
}

impl RemoteTask {
    pub(crate) fn new(func: Box<dyn FnOnce() + Send>, local_data: Option<LocalData>) -> Box<Self> {
        Box::new(RemoteTask {
            func,
            local_data,
            next: AtomicPtr::new(ptr::null_mut()),
        })
    }

    pub(crate) fn into_parts(self) -> (Box<dyn FnOnce() + Send>, Option<LocalData>) {
        (self.func, self.local_data)
    }
}

/// Everything a foreign thread may touch: the two lists plus the driver's
/// thread-safe wake signal.
pub(crate) struct RemoteSide {
    pub(crate) task_queue: AtomicNodeList<RemoteTask>,
    pub(crate) ready_queue: AtomicNodeList<Fiber>,
    pub(crate) driver: Arc<dyn LoopDriver>,
}

impl RemoteSide {
    pub(crate) fn new(driver: Arc<dyn LoopDriver>) -> Arc<Self> {
        Arc::new(RemoteSide {
            task_queue: AtomicNodeList::new(),
            ready_queue: AtomicNodeList::new(),
            driver,
        })
    }
}

/// Cloneable handle for submitting tasks to a manager from any thread.
///
/// The manager itself is single-threaded by construction (`!Sync`); this
/// handle is the only cross-thread submission surface. A submission never
/// runs synchronously and there is no synchronous error channel: a task
/// whose fiber cannot be allocated is dropped with a diagnostic through
/// the manager's exception callback.
#[derive(Clone)]
pub struct RemoteSubmitter {
    remote: Arc<RemoteSide>,
}

impl RemoteSubmitter {
    pub(crate) fn new(remote: Arc<RemoteSide>) -> Self {
        RemoteSubmitter { remote }
    }

    /// Enqueues `func` to run on the manager's thread. When the submitter
    /// is itself running on a fiber, that fiber's locals are snapshotted
    /// into the new task.
    pub fn submit<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let locals = manager::current_locals_snapshot();
        let task = RemoteTask::new(Box::new(func), locals);
        if self.remote.task_queue.push(Box::into_raw(task)) {
            self.remote.driver.schedule_thread_safe();
        }
    }
}
