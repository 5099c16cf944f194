//! # Weft - Single-Threaded Cooperative Fiber Manager
//!
//! A user-space task execution engine in which every task runs on a fiber:
//! a lightweight execution context with its own stack that can suspend
//! mid-execution and resume later at the exact point of suspension. One
//! manager owns a set of fibers bound to a single host thread and
//! multiplexes their execution over that thread; there is no preemption
//! and no work-stealing.
//!
//! ## Architecture
//!
//! - **Fibers**: reusable stackful contexts, drawn from a bounded free
//!   pool and recycled after every task
//! - **Batons**: one-shot wait/post primitives fibers block on, postable
//!   from any thread and optionally bounded by a timeout
//! - **Remote submission**: lock-free producer queues that let foreign
//!   threads feed work to the manager without taking locks
//! - **Loop driver**: the host-supplied hook that schedules the manager's
//!   run function whenever work becomes available
//!
//! ## Example
//!
//! ```no_run
//! use weft::{FiberManager, Options, SimpleLoopDriver};
//!
//! let driver = SimpleLoopDriver::new();
//! let manager = FiberManager::new(Options::default(), driver);
//!
//! manager
//!     .submit(|| {
//!         println!("hello from a fiber");
//!     })
//!     .unwrap();
//!
//! manager.run_until_idle();
//! ```

pub mod baton;
pub mod driver;
pub mod error;
mod fiber;
mod local_data;
pub mod manager;
mod remote;
mod stack;
pub mod timeout;

pub use baton::{Baton, WaitOutcome};
pub use driver::{LoopDriver, SimpleLoopDriver};
pub use error::{SpawnError, TaskFailure, TaskOutcome};
pub use manager::{on_fiber, FiberManager, Options};
pub use remote::RemoteSubmitter;
pub use timeout::{TimeoutService, TimeoutToken};

#[cfg(test)]
mod tests;
