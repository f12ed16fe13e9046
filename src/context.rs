//! Ambient state propagated across await points.
//!
//! A [`Context`] is an immutable bundle of named values plus an optional
//! error handler. Tasks capture a context at spawn time, and the scheduler
//! makes it the thread's current context for the duration of every dispatch
//! slice, so contextual state follows logical control flow instead of the
//! physical call stack. Contexts form a tree: deriving from a context adds
//! bindings without touching the parent.

use crate::error::Failure;
use crate::Value;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

thread_local! {
    static CURRENT_CONTEXT: RefCell<Option<Context>> = RefCell::new(None);
}

type ErrorHandler = Rc<dyn Fn(&Failure)>;

/// An immutable bundle of contextual values with an optional error handler.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

struct ContextInner {
    values: FxHashMap<String, Value>,
    error_handler: Option<ErrorHandler>,
    parent: Option<Rc<ContextInner>>,
}

impl Context {
    /// Creates an empty root context.
    pub fn new() -> Self {
        Self::with_values(std::iter::empty::<(String, Value)>())
    }

    /// Creates a root context seeded with the given bindings.
    pub fn with_values<K, I>(values: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self {
            inner: Rc::new(ContextInner {
                values: values.into_iter().map(|(k, v)| (k.into(), v)).collect(),
                error_handler: None,
                parent: None,
            }),
        }
    }

    /// Derives a child context with one additional binding.
    pub fn with_value(&self, key: impl Into<String>, value: Value) -> Context {
        let mut values = FxHashMap::default();
        values.insert(key.into(), value);

        Self {
            inner: Rc::new(ContextInner {
                values,
                error_handler: None,
                parent: Some(self.inner.clone()),
            }),
        }
    }

    /// Derives a child context carrying an error handler.
    ///
    /// The handler receives failures of tasks that die without anything
    /// awaiting them. The innermost handler on the derivation chain wins.
    pub fn with_error_handler(&self, handler: impl Fn(&Failure) + 'static) -> Context {
        Self {
            inner: Rc::new(ContextInner {
                values: FxHashMap::default(),
                error_handler: Some(Rc::new(handler)),
                parent: Some(self.inner.clone()),
            }),
        }
    }

    /// Looks up a binding, walking the derivation chain outwards.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = Some(&self.inner);
        while let Some(context) = inner {
            if let Some(value) = context.values.get(key) {
                return Some(value.clone());
            }
            inner = context.parent.as_ref();
        }
        None
    }

    /// The context of the task the caller is running in, if any.
    pub fn current() -> Option<Context> {
        CURRENT_CONTEXT.with(|current| current.borrow().clone())
    }

    pub(crate) fn error_handler(&self) -> Option<ErrorHandler> {
        let mut inner = Some(&self.inner);
        while let Some(context) = inner {
            if let Some(handler) = &context.error_handler {
                return Some(handler.clone());
            }
            inner = context.parent.as_ref();
        }
        None
    }

    /// Whether two handles refer to the same context record.
    pub fn ptr_eq(&self, other: &Context) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("values", &self.inner.values.len())
            .field("derived", &self.inner.parent.is_some())
            .finish_non_exhaustive()
    }
}

/// Scoped snapshot of the thread's current context.
///
/// Every fiber switch and every inline task execution is bracketed by one of
/// these, so the ambient context is restored on all exit paths, including
/// unwinding.
pub(crate) struct ContextScope {
    previous: Option<Context>,
}

impl ContextScope {
    /// Makes `context` current until the scope is dropped.
    pub fn enter(context: Context) -> Self {
        Self {
            previous: CURRENT_CONTEXT.with(|current| current.borrow_mut().replace(context)),
        }
    }

    /// Snapshots the current context without replacing it.
    pub fn save() -> Self {
        Self {
            previous: Context::current(),
        }
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        CURRENT_CONTEXT.with(|current| *current.borrow_mut() = self.previous.take());
    }
}
