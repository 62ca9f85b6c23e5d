//! Tenon executor core
//!
//! A small multi-threaded executor for cooperative tasks:
//! - **Tasks**: stacks of [`Coroutine`] frames resumed by workers (`task` module)
//! - **Wait registry**: I/O readiness and timers that park and wake tasks (`registry` module)
//! - **Executor**: worker threads, ready queue and lifecycle (`executor` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use tenon_core::{Action, Executor, from_fn};
//! use std::time::Duration;
//!
//! let executor = Executor::with_workers(4)?;
//! executor.start()?;
//!
//! let mut slept = false;
//! let handle = executor.submit(from_fn(move |_| {
//!     if !slept {
//!         slept = true;
//!         return Action::sleep(Duration::from_millis(10));
//!     }
//!     Action::done()
//! }))?;
//!
//! assert!(handle.join().is_completed());
//! executor.stop()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod executor;
mod queue;
pub mod registry;
pub mod task;
mod worker;

pub use error::{ExecutorError, TaskError};
pub use executor::{Executor, ExecutorConfig, ExecutorStats, ExecutorStatus, QueuePolicy};
pub use registry::{IoSource, SourceToken, WaitRegistry};
pub use task::{
    from_fn, Action, Context, Coroutine, FnCoroutine, Outcome, SuspendReason, TaskHandle, TaskId,
    TaskState, Wake,
};
