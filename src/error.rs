use crate::Value;
use std::any::Any;
use std::fmt::{Debug, Display, Formatter};
use std::rc::Rc;
use thiserror::Error;

/// A failure value produced by a task.
///
/// Failures carry an opaque payload so that the value raised inside a task
/// body reaches its awaiters with identity intact. A payload is either the
/// value of an `Err` returned by the task callable or the payload of a panic
/// captured while the callable ran.
#[derive(Clone)]
pub struct Failure {
    payload: Value,
    message: Option<Rc<str>>,
}

impl Failure {
    /// Wraps an arbitrary value as a failure payload.
    pub fn new<T: 'static>(payload: T) -> Self {
        Self {
            payload: Rc::new(payload),
            message: None,
        }
    }

    /// Wraps an existing [`Value`] as a failure payload.
    pub fn from_value(payload: Value) -> Self {
        Self {
            payload,
            message: None,
        }
    }

    /// Captures the payload of an unwound panic.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            Some(Rc::from(*message))
        } else {
            payload
                .downcast_ref::<String>()
                .map(|message| Rc::from(message.as_str()))
        };

        let payload: Box<dyn Any> = payload;
        Self {
            payload: Rc::from(payload),
            message,
        }
    }

    /// The failure payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Attempts to borrow the payload as a concrete type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }

    /// A human readable description, if one is known.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether two failures share the same payload.
    pub fn ptr_eq(&self, other: &Failure) -> bool {
        Rc::ptr_eq(&self.payload, &other.payload)
    }
}

impl From<&str> for Failure {
    fn from(message: &str) -> Self {
        Self {
            payload: Rc::new(message.to_owned()),
            message: Some(Rc::from(message)),
        }
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        let shared: Rc<str> = Rc::from(message.as_str());
        Self {
            payload: Rc::new(message),
            message: Some(shared),
        }
    }
}

impl From<TaskError> for Failure {
    fn from(error: TaskError) -> Self {
        let message = Rc::from(error.to_string().as_str());
        Self {
            payload: Rc::new(error),
            message: Some(message),
        }
    }
}

impl Debug for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Failure")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message().unwrap_or("<opaque failure value>"))
    }
}

/// Errors raised by the scheduler and the await machinery.
#[derive(Debug, Error)]
pub enum TaskError {
    /// No scheduler is driving the current thread.
    #[error("no task scheduler is available on this thread")]
    NoScheduler,
    /// The scheduler is already inside a `run` invocation.
    #[error("the task scheduler is already running")]
    SchedulerBusy,
    /// The awaited task belongs to another scheduler.
    #[error("cannot await a task that runs on a different task scheduler")]
    CrossScheduler,
    /// Only tasks can be awaited when no task is running.
    #[error("only tasks can be awaited from outside a running task")]
    AwaitOutsideTask,
    /// The awaited task was still pending after its scheduler drained.
    #[error("the awaited task did not run to completion")]
    Incomplete,
    /// The awaitable was already resolved or failed.
    #[error("the awaitable has already been settled")]
    AlreadySettled,
    /// A fiber stack could not be allocated.
    #[error("failed to allocate a fiber stack of {0} bytes")]
    StackAllocation(usize),
    /// The task was destroyed while suspended on an awaitable.
    #[error("the task has been destroyed")]
    TaskDestroyed,
    /// The awaited task or awaitable failed.
    #[error("task failed: {0}")]
    Failed(Failure),
    /// A continuation callback panicked while an awaitable settled.
    #[error("uncaught awaitable continuation error: {0}")]
    FatalContinuation(Failure),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_identity_survives_clones() {
        let failure = Failure::new(42_u32);
        let clone = failure.clone();
        assert!(failure.ptr_eq(&clone));
        assert_eq!(clone.downcast_ref::<u32>(), Some(&42));
    }

    #[test]
    fn failure_from_str_carries_a_message() {
        let failure = Failure::from("boom");
        assert_eq!(failure.message(), Some("boom"));
        assert_eq!(failure.to_string(), "boom");
        assert_eq!(failure.downcast_ref::<String>().map(String::as_str), Some("boom"));
    }

    #[test]
    fn task_errors_convert_into_failures() {
        let failure = Failure::from(TaskError::TaskDestroyed);
        assert!(matches!(
            failure.downcast_ref::<TaskError>(),
            Some(TaskError::TaskDestroyed)
        ));
        assert_eq!(failure.message(), Some("the task has been destroyed"));
    }
}
