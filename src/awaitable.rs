//! The continuation protocol awaitables settle through.
//!
//! An awaitable owns at most one [`ContinuationList`], created on first
//! attachment. Settling drains the list and invokes every continuation
//! exactly once, in registration order, on the settler's stack. Callbacks
//! must not switch fibers; they are expected only to enqueue work on a
//! scheduler, and a panicking callback is escalated to the waiter's
//! scheduler as a fatal error.

use crate::error::{Failure, TaskError};
use crate::task::TaskInner;
use crate::Value;
use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

/// Terminal state of a settled awaitable.
pub(crate) enum Settlement {
    Resolved(Value),
    Failed(Failure),
}

/// Invoked once per registered waiter when the awaitable settles.
pub(crate) type ContinuationFn = fn(&Rc<TaskInner>, &Settlement);

struct Continuation {
    waiter: Rc<TaskInner>,
    notify: ContinuationFn,
}

/// An ordered list of waiters attached to a pending awaitable.
///
/// Each entry holds a strong reference that pins the suspended waiter until
/// the list fires or is disposed.
pub(crate) struct ContinuationList {
    entries: Vec<Continuation>,
}

impl ContinuationList {
    fn new(waiter: Rc<TaskInner>, notify: ContinuationFn) -> Self {
        Self {
            entries: vec![Continuation { waiter, notify }],
        }
    }

    fn append(&mut self, waiter: Rc<TaskInner>, notify: ContinuationFn) {
        self.entries.push(Continuation { waiter, notify });
    }

    /// Invokes every continuation in registration order and consumes the
    /// list. The waiter pins drop one by one as the entries are delivered.
    pub fn trigger(self, settlement: &Settlement) {
        log::trace!("triggering {} continuation(s)", self.entries.len());

        for Continuation { waiter, notify } in self.entries {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| notify(&waiter, settlement))) {
                log::error!("continuation callback for task {} panicked", waiter.id);
                if let Some(scheduler) = waiter.scheduler.upgrade() {
                    scheduler.set_fatal(Failure::from_panic(payload));
                }
            }
        }
    }
}

impl Debug for ContinuationList {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuationList")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Attaches a waiter to an awaitable's continuation record, creating the
/// record on first use.
pub(crate) fn attach(
    slot: &RefCell<Option<ContinuationList>>,
    waiter: Rc<TaskInner>,
    notify: ContinuationFn,
) {
    let mut slot = slot.borrow_mut();
    match &mut *slot {
        Some(list) => list.append(waiter, notify),
        None => *slot = Some(ContinuationList::new(waiter, notify)),
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DeferredStatus {
    Pending,
    Resolved,
    Failed,
}

struct DeferredInner {
    status: Cell<DeferredStatus>,
    result: RefCell<Option<Value>>,
    error: RefCell<Option<Failure>>,
    continuation: RefCell<Option<ContinuationList>>,
}

/// The producer side of a deferred awaitable.
///
/// A deferred is settled at most once, from outside any task. Dropping a
/// pending deferred disposes its continuation list without invoking it,
/// which releases the pins of any suspended waiters.
pub struct Deferred {
    inner: Rc<DeferredInner>,
}

/// The consumer side of a [`Deferred`], awaitable from inside a task.
#[derive(Clone)]
pub struct DeferredAwaitable {
    inner: Rc<DeferredInner>,
}

impl Deferred {
    /// Creates a new pending deferred.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(DeferredInner {
                status: Cell::new(DeferredStatus::Pending),
                result: RefCell::new(None),
                error: RefCell::new(None),
                continuation: RefCell::new(None),
            }),
        }
    }

    /// Returns an awaitable handle settled by this deferred.
    pub fn awaitable(&self) -> DeferredAwaitable {
        DeferredAwaitable {
            inner: self.inner.clone(),
        }
    }

    /// Resolves the deferred, waking every attached waiter in order.
    pub fn resolve(&self, value: Value) -> Result<(), TaskError> {
        if self.inner.status.get() != DeferredStatus::Pending {
            return Err(TaskError::AlreadySettled);
        }

        log::trace!("deferred resolved");
        self.inner.status.set(DeferredStatus::Resolved);
        *self.inner.result.borrow_mut() = Some(value.clone());

        // End the borrow before the callbacks run.
        let list = self.inner.continuation.borrow_mut().take();
        if let Some(list) = list {
            list.trigger(&Settlement::Resolved(value));
        }
        Ok(())
    }

    /// Fails the deferred, delivering `failure` to every attached waiter.
    pub fn fail(&self, failure: Failure) -> Result<(), TaskError> {
        if self.inner.status.get() != DeferredStatus::Pending {
            return Err(TaskError::AlreadySettled);
        }

        log::trace!("deferred failed");
        self.inner.status.set(DeferredStatus::Failed);
        *self.inner.error.borrow_mut() = Some(failure.clone());

        // End the borrow before the callbacks run.
        let list = self.inner.continuation.borrow_mut().take();
        if let Some(list) = list {
            list.trigger(&Settlement::Failed(failure));
        }
        Ok(())
    }
}

impl DeferredAwaitable {
    /// If already settled, the terminal outcome without yielding.
    pub(crate) fn settled(&self) -> Option<Result<Value, Failure>> {
        match self.inner.status.get() {
            DeferredStatus::Pending => None,
            DeferredStatus::Resolved => {
                Some(Ok(self.inner.result.borrow().clone().expect("resolved without a value")))
            }
            DeferredStatus::Failed => {
                Some(Err(self.inner.error.borrow().clone().expect("failed without an error")))
            }
        }
    }

    pub(crate) fn attach(&self, waiter: Rc<TaskInner>, notify: ContinuationFn) {
        debug_assert_eq!(self.inner.status.get(), DeferredStatus::Pending);
        attach(&self.inner.continuation, waiter, notify);
    }
}

impl Default for Deferred {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Deferred {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("status", &self.inner.status.get())
            .finish_non_exhaustive()
    }
}

impl Debug for DeferredAwaitable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredAwaitable")
            .field("status", &self.inner.status.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value;

    #[test]
    fn settling_twice_is_rejected() {
        let deferred = Deferred::new();
        assert!(deferred.resolve(value(1_i32)).is_ok());
        assert!(matches!(
            deferred.resolve(value(2_i32)),
            Err(TaskError::AlreadySettled)
        ));
        assert!(matches!(
            deferred.fail(Failure::from("late")),
            Err(TaskError::AlreadySettled)
        ));
    }

    #[test]
    fn settled_outcome_is_retained() {
        let deferred = Deferred::new();
        let awaitable = deferred.awaitable();
        assert!(awaitable.settled().is_none());

        deferred.resolve(value(7_i32)).unwrap();
        let outcome = awaitable.settled().unwrap().unwrap();
        assert_eq!(outcome.downcast_ref::<i32>(), Some(&7));
    }

    #[test]
    fn failed_outcome_keeps_identity() {
        let deferred = Deferred::new();
        let awaitable = deferred.awaitable();
        let failure = Failure::from("nope");

        deferred.fail(failure.clone()).unwrap();
        let outcome = awaitable.settled().unwrap().unwrap_err();
        assert!(outcome.ptr_eq(&failure));
    }
}
