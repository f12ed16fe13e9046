//! The FIFO dispatcher driving tasks on one thread.

use crate::context::{Context, ContextScope};
use crate::error::{Failure, TaskError};
use crate::fiber::{self, ContextSlot, DEFAULT_STACK_SIZE};
use crate::task::{Operation, Task, TaskCall, TaskInner, TaskStatus};
use crate::Value;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Rc<SchedulerInner>>> = RefCell::new(None);
    static CURRENT_TASK: RefCell<Option<Rc<TaskInner>>> = RefCell::new(None);
}

/// The scheduler a `run` invocation is currently driving on this thread.
pub(crate) fn current_scheduler() -> Option<Rc<SchedulerInner>> {
    CURRENT_SCHEDULER.with(|scheduler| scheduler.borrow().clone())
}

/// The task currently occupying the dispatcher on this thread.
pub(crate) fn current_task() -> Option<Rc<TaskInner>> {
    CURRENT_TASK.with(|task| task.borrow().clone())
}

/// Like [`current_task`], without touching the reference count.
pub(crate) fn current_task_ptr() -> Option<*const TaskInner> {
    CURRENT_TASK.with(|task| task.borrow().as_ref().map(Rc::as_ptr))
}

fn set_current_task(task: Option<Rc<TaskInner>>) -> Option<Rc<TaskInner>> {
    CURRENT_TASK.with(|current| std::mem::replace(&mut *current.borrow_mut(), task))
}

type ActivatorFn = Rc<dyn Fn(&TaskScheduler)>;
type AdapterFn = Rc<dyn Fn(Value) -> Value>;

pub(crate) struct SchedulerInner {
    /// The scheduler's root context; captured by `spawn` on the scheduler.
    pub context: Context,
    /// True only while a `run` invocation is on the stack.
    pub running: Cell<bool>,
    queue: RefCell<VecDeque<Rc<TaskInner>>>,
    /// The task occupying the dispatcher, or the last one that yielded.
    current: Cell<Option<Rc<TaskInner>>>,
    /// Latch arming the activator; cleared on fire and while running.
    activate: Cell<bool>,
    /// Parked continuation of whoever called `run`.
    root: ContextSlot,
    activator: RefCell<Option<ActivatorFn>>,
    adapter: RefCell<Option<AdapterFn>>,
    /// Failure escalated by a panicking continuation callback.
    fatal: Cell<Option<Failure>>,
    task_ids: Cell<u64>,
    default_stack_size: Cell<usize>,
}

impl SchedulerInner {
    fn new(context: Context) -> Rc<Self> {
        Rc::new(Self {
            context,
            running: Cell::new(false),
            queue: RefCell::new(VecDeque::new()),
            current: Cell::new(None),
            activate: Cell::new(true),
            root: ContextSlot::new(),
            activator: RefCell::new(None),
            adapter: RefCell::new(None),
            fatal: Cell::new(None),
            task_ids: Cell::new(0),
            default_stack_size: Cell::new(DEFAULT_STACK_SIZE),
        })
    }

    pub fn spawn_task(self: &Rc<Self>, context: Context, call: TaskCall) -> Task {
        let id = self.task_ids.get() + 1;
        self.task_ids.set(id);

        let inner = Rc::new(TaskInner::new(
            id,
            self.default_stack_size.get(),
            Rc::downgrade(self),
            context,
            call,
        ));
        log::trace!("spawned task {}", id);

        let enqueued = self.enqueue(&inner);
        debug_assert!(enqueued);
        Task::from_inner(inner)
    }

    /// Appends a task to the runnable queue.
    ///
    /// Returns `false` without enqueueing when the task's status admits no
    /// start or resume. Fires the activator when the scheduler goes from
    /// idle to non-empty.
    pub fn enqueue(self: &Rc<Self>, task: &Rc<TaskInner>) -> bool {
        match task.status.get() {
            TaskStatus::Init => task.operation.set(Operation::Start),
            TaskStatus::Suspended => task.operation.set(Operation::Resume),
            _ => return false,
        }

        self.queue.borrow_mut().push_back(task.clone());
        log::trace!(
            "enqueued task {} for {:?}, {} queued",
            task.id,
            task.operation.get(),
            self.queue.borrow().len()
        );

        if !self.running.get() && self.activate.get() {
            let activator = self.activator.borrow().clone();
            if let Some(activator) = activator {
                self.activate.set(false);
                debug_assert!(!self.running.get());
                activator(&TaskScheduler::from_inner(self.clone()));
            }
        }

        true
    }

    pub fn adapter(&self) -> Option<AdapterFn> {
        self.adapter.borrow().clone()
    }

    pub fn set_fatal(&self, failure: Failure) {
        // The first escalation wins.
        let pending = self.fatal.take();
        self.fatal.set(pending.or(Some(failure)));
    }

    /// The dispatcher loop.
    ///
    /// Entered from `run` with no task, and from inside a task's fiber when
    /// that task yields or finishes. Runs on the stack of `from` (or the
    /// `run` caller) until it switches into the next runnable task, or back
    /// to the parked root continuation once the queue drains.
    pub fn dispatch(&self, from: Option<Rc<TaskInner>>) {
        // Release the previous occupant of the dispatcher and take its
        // place. The reference taken at enqueue time is carried here until
        // the dispatch after the task yields.
        drop(self.current.take());
        let source: *const ContextSlot = match &from {
            Some(task) => &task.saved,
            None => &self.root,
        };
        self.current.set(from);

        loop {
            let next = self.queue.borrow_mut().pop_front();
            let Some(next) = next else {
                log::trace!("runnable queue drained, leaving dispatcher");
                if let Some(root) = self.root.take() {
                    // Safety: the source slot is owned by the current
                    // occupant or the scheduler, both alive across the
                    // switch.
                    unsafe { fiber::switch(root, &*source) };
                }
                // With no parked root this frame already runs on the `run`
                // caller's stack and can plainly return.
                return;
            };

            match next.operation.get() {
                Operation::None => {
                    // Executed inline while queued. Drop the queue
                    // reference and move on.
                    log::trace!("skipping task {}, already settled inline", next.id);
                    continue;
                }
                Operation::Start => {
                    next.operation.set(Operation::None);
                    if let Err(error) = next.create_fiber() {
                        log::error!("cannot start task {}: {}", next.id, error);
                        next.fail_unstarted(Failure::from(error));
                        continue;
                    }
                    log::trace!("starting task {}", next.id);
                }
                Operation::Resume => {
                    next.operation.set(Operation::None);
                    log::trace!("resuming task {}", next.id);
                }
            }

            next.status.set(TaskStatus::Running);
            let target = next.saved.take().expect("runnable task has no continuation");
            set_current_task(Some(next));

            // Safety: see above; the slot outlives the suspension because
            // its owner is pinned by `current` or by the scheduler handle.
            unsafe { fiber::switch(target, &*source) };
            return;
        }
    }
}

impl Debug for SchedulerInner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerInner")
            .field("running", &self.running.get())
            .field("scheduled", &self.queue.borrow().len())
            .finish_non_exhaustive()
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        log::trace!("shutting down task scheduler");
        // Queued tasks drop with the queue; suspended ones among them
        // unwind their fibers as their last reference goes.
    }
}

/// A cooperative FIFO scheduler for one thread.
///
/// Tasks are spawned in `Init` state and drained to quiescence by [`run`].
/// Handles are cheap to clone; the scheduler itself holds live execution
/// state and never leaves its thread.
///
/// [`run`]: TaskScheduler::run
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Rc<SchedulerInner>,
}

impl TaskScheduler {
    /// Creates a scheduler with an empty root context.
    pub fn new() -> Self {
        Self::with_context(Context::new())
    }

    /// Creates a scheduler whose tasks inherit the given root context.
    ///
    /// Seed the context with values or an error handler to configure the
    /// scheduler, as in
    /// `TaskScheduler::with_context(Context::new().with_error_handler(..))`.
    pub fn with_context(context: Context) -> Self {
        Self {
            inner: SchedulerInner::new(context),
        }
    }

    pub(crate) fn from_inner(inner: Rc<SchedulerInner>) -> Self {
        Self { inner }
    }

    /// The number of queued tasks.
    pub fn count(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    /// The scheduler's root context.
    pub fn context(&self) -> Context {
        self.inner.context.clone()
    }

    /// Spawns a task owned by this scheduler, inheriting its root context.
    pub fn spawn(
        &self,
        callable: impl FnOnce(Vec<Value>) -> Result<Value, Failure> + 'static,
        args: Vec<Value>,
    ) -> Task {
        self.inner
            .spawn_task(self.inner.context.clone(), TaskCall::new(callable, args))
    }

    /// Installs the activator hook, replacing any previous one.
    ///
    /// The activator fires when a task is enqueued while the scheduler is
    /// idle. It must arrange a future call to [`TaskScheduler::run`], for
    /// example by scheduling it on an event loop; it must not call `run`
    /// synchronously.
    pub fn set_activator(&self, activator: impl Fn(&TaskScheduler) + 'static) {
        *self.inner.activator.borrow_mut() = Some(Rc::new(activator));
    }

    /// Installs the adapter hook, replacing any previous one.
    ///
    /// The adapter sees every awaited value that is neither a [`Task`] nor a
    /// [`crate::DeferredAwaitable`]; whatever it returns is awaited in
    /// place of the original value.
    pub fn set_adapter(&self, adapter: impl Fn(Value) -> Value + 'static) {
        *self.inner.adapter.borrow_mut() = Some(Rc::new(adapter));
    }

    /// Overrides the stack size for subsequently spawned tasks.
    pub fn set_default_stack_size(&self, bytes: usize) {
        self.inner.default_stack_size.set(bytes);
    }

    /// The stack size used for newly spawned tasks.
    pub fn default_stack_size(&self) -> usize {
        self.inner.default_stack_size.get()
    }

    /// Drains the runnable queue to quiescence.
    ///
    /// Returns immediately on an empty queue. Must not be nested on the same
    /// scheduler; running a different scheduler from inside a task is fine.
    /// A failure escalated by a continuation callback is re-raised here as
    /// [`TaskError::FatalContinuation`].
    pub fn run(&self) -> Result<(), TaskError> {
        let inner = &self.inner;

        if inner.running.get() {
            return Err(TaskError::SchedulerBusy);
        }
        if inner.queue.borrow().is_empty() {
            return Ok(());
        }
        log::trace!("entering dispatcher, {} queued", inner.queue.borrow().len());

        let previous_scheduler = CURRENT_SCHEDULER
            .with(|scheduler| scheduler.borrow_mut().replace(inner.clone()));
        let previous_task = set_current_task(None);
        inner.running.set(true);
        inner.activate.set(false);

        {
            // Restore the caller's ambient context on the way out; the last
            // dispatched slice may have left its own behind.
            let _scope = ContextScope::save();
            inner.dispatch(None);
        }

        set_current_task(previous_task);
        CURRENT_SCHEDULER.with(|scheduler| *scheduler.borrow_mut() = previous_scheduler);
        drop(inner.current.take());
        inner.running.set(false);
        inner.activate.set(true);
        log::trace!("dispatcher left, {} queued", inner.queue.borrow().len());

        match inner.fatal.take() {
            Some(failure) => Err(TaskError::FatalContinuation(failure)),
            None => Ok(()),
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for TaskScheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("scheduled", &self.count())
            .field("running", &self.inner.running.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value;

    #[test]
    fn enqueue_rejects_terminal_and_running_statuses() {
        let scheduler = TaskScheduler::new();
        let task = scheduler.spawn(|_| Ok(value(())), Vec::new());
        assert_eq!(scheduler.count(), 1);

        for status in [TaskStatus::Running, TaskStatus::Finished, TaskStatus::Dead] {
            task.inner.status.set(status);
            assert!(!scheduler.inner.enqueue(&task.inner));
            assert_eq!(scheduler.count(), 1);
        }

        task.inner.status.set(TaskStatus::Init);
    }

    #[test]
    fn activator_fires_once_per_idle_phase() {
        let scheduler = TaskScheduler::new();
        let fired = Rc::new(Cell::new(0_u32));

        let observed = fired.clone();
        scheduler.set_activator(move |_| observed.set(observed.get() + 1));

        scheduler.spawn(|_| Ok(value(())), Vec::new());
        assert_eq!(fired.get(), 1);

        // The latch stays cleared until the next run completes.
        scheduler.spawn(|_| Ok(value(())), Vec::new());
        assert_eq!(fired.get(), 1);

        scheduler.run().unwrap();
        scheduler.spawn(|_| Ok(value(())), Vec::new());
        assert_eq!(fired.get(), 2);
        scheduler.run().unwrap();
    }
}
