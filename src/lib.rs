//! Cooperative task scheduler built on stackful fibers.
//!
//! A [`Task`] wraps a callable and runs it on its own fiber, a resumable
//! native stack. Tasks may suspend themselves on awaitables, either other
//! tasks or [`Deferred`] awaitables settled by the embedder, and a
//! [`TaskScheduler`] drains a FIFO queue of runnable tasks to quiescence on
//! a single OS thread. A [`Context`] travels with each task across await
//! points, carrying named values and an optional error handler.
//!
//! Scheduling is strictly cooperative: tasks interleave only at explicit
//! await points, and readiness is signalled solely through the awaitable
//! continuation protocol. All handles are confined to the thread that owns
//! the scheduler; none of them are `Send`, and none of them can be
//! serialized, since they carry live execution state.
//!
//! ```
//! use cotask::{value, Task, TaskScheduler};
//!
//! let scheduler = TaskScheduler::new();
//!
//! let first = scheduler.spawn(|_args| Ok(value(32_i32)), Vec::new());
//! let second = {
//!     let first = first.clone();
//!     scheduler.spawn(
//!         move |_args| {
//!             let base = Task::await_value(first.to_value())?;
//!             let base = base.downcast_ref::<i32>().copied().unwrap();
//!             Ok(value(base + 10))
//!         },
//!         Vec::new(),
//!     )
//! };
//!
//! scheduler.run().unwrap();
//! let result = second.result().unwrap();
//! assert_eq!(result.downcast_ref::<i32>(), Some(&42));
//! ```

#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]

mod awaitable;
mod context;
mod error;
mod fiber;
mod scheduler;
mod task;

pub use crate::awaitable::{Deferred, DeferredAwaitable};
pub use crate::context::Context;
pub use crate::error::{Failure, TaskError};
pub use crate::fiber::DEFAULT_STACK_SIZE;
pub use crate::scheduler::TaskScheduler;
pub use crate::task::{Task, TaskStatus};

use std::any::Any;
use std::rc::Rc;

/// The dynamic value passed between tasks and awaitables.
///
/// Results, failures and awaited values all travel as shared `Any` values,
/// so awaiting is dispatched on the runtime type: tasks and deferred
/// awaitables suspend the caller, anything else is returned unchanged.
pub type Value = Rc<dyn Any>;

/// Wraps a value as a [`Value`].
pub fn value<T: 'static>(value: T) -> Value {
    Rc::new(value)
}
