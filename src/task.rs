//! Tasks and the await machinery.

use crate::awaitable::{attach, ContinuationList, DeferredAwaitable, Settlement};
use crate::context::{Context, ContextScope};
use crate::error::{Failure, TaskError};
use crate::fiber::{self, ContextSlot, Fiber};
use crate::scheduler::{self, SchedulerInner, TaskScheduler};
use crate::Value;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

/// Lifecycle states of a task.
#[derive(Debug, Copy, Clone, Hash, Ord, PartialOrd, PartialEq, Eq)]
pub enum TaskStatus {
    /// Spawned but not yet started by the scheduler.
    Init,
    /// Currently occupying the dispatcher.
    Running,
    /// Parked on an awaitable, waiting to be resumed.
    Suspended,
    /// Ran to completion; the result slot is populated.
    Finished,
    /// Failed or was destroyed; the error slot is populated.
    Dead,
}

/// What the dispatcher should do with a queued task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Operation {
    None,
    Start,
    Resume,
}

pub(crate) type TaskFn = Box<dyn FnOnce(Vec<Value>) -> Result<Value, Failure>>;

/// The callable and its arguments, retained from spawn until consumed.
pub(crate) struct TaskCall {
    callable: TaskFn,
    args: Vec<Value>,
}

impl TaskCall {
    pub fn new(
        callable: impl FnOnce(Vec<Value>) -> Result<Value, Failure> + 'static,
        args: Vec<Value>,
    ) -> Self {
        Self {
            callable: Box::new(callable),
            args,
        }
    }
}

pub(crate) struct TaskInner {
    pub id: u64,
    pub status: Cell<TaskStatus>,
    pub operation: Cell<Operation>,
    pub stack_size: usize,
    pub scheduler: Weak<SchedulerInner>,
    pub context: Context,
    /// Consumed by the first start or by inline execution.
    pub call: RefCell<Option<TaskCall>>,
    /// Created on the first start, kept until teardown.
    pub fiber: RefCell<Option<Fiber>>,
    /// Parked continuation of this task's fiber while it is not running.
    pub saved: ContextSlot,
    /// Parks the destructor's continuation during a forced unwind.
    pub teardown: ContextSlot,
    /// Settlement delivery slot, taken when a suspended await resumes.
    pub value: RefCell<Option<Value>>,
    /// Failure delivery slot; holds the terminal failure once the task dies.
    pub error: RefCell<Option<Failure>>,
    /// Terminal result once the task finishes.
    pub result: RefCell<Option<Value>>,
    /// Waiters to notify when this task settles.
    pub continuation: RefCell<Option<ContinuationList>>,
}

impl TaskInner {
    pub fn new(
        id: u64,
        stack_size: usize,
        scheduler: Weak<SchedulerInner>,
        context: Context,
        call: TaskCall,
    ) -> Self {
        Self {
            id,
            status: Cell::new(TaskStatus::Init),
            operation: Cell::new(Operation::None),
            stack_size,
            scheduler,
            context,
            call: RefCell::new(Some(call)),
            fiber: RefCell::new(None),
            saved: ContextSlot::new(),
            teardown: ContextSlot::new(),
            value: RefCell::new(None),
            error: RefCell::new(None),
            result: RefCell::new(None),
            continuation: RefCell::new(None),
        }
    }

    /// Lazily allocates the fiber stack and arms the entry point.
    pub fn create_fiber(&self) -> Result<(), TaskError> {
        debug_assert!(self.fiber.borrow().is_none());

        let (fiber, initial) = Fiber::new(self.stack_size, fiber_main)?;
        *self.fiber.borrow_mut() = Some(fiber);
        self.saved.park(initial);
        Ok(())
    }

    pub fn attach_waiter(&self, waiter: Rc<TaskInner>) {
        attach(&self.continuation, waiter, task_continuation);
    }

    /// Fires the continuation list, or reports an unawaited failure.
    fn settle(&self, settlement: Settlement) {
        // End the borrow before the callbacks run.
        let list = self.continuation.borrow_mut().take();
        match list {
            Some(list) => list.trigger(&settlement),
            None => {
                if let Settlement::Failed(failure) = &settlement {
                    self.report_unhandled(failure);
                }
            }
        }
    }

    fn report_unhandled(&self, failure: &Failure) {
        match self.context.error_handler() {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler(failure))).is_err() {
                    log::error!("error handler for task {} panicked", self.id);
                }
            }
            None => log::error!("task {} failed with no awaiter: {}", self.id, failure),
        }
    }

    /// Marks a task that never ran as dead. Used when its fiber stack cannot
    /// be allocated.
    pub fn fail_unstarted(&self, failure: Failure) {
        debug_assert_eq!(self.status.get(), TaskStatus::Init);

        self.call.borrow_mut().take();
        *self.error.borrow_mut() = Some(failure.clone());
        self.status.set(TaskStatus::Dead);
        self.settle(Settlement::Failed(failure));
    }
}

/// Records the outcome of a task callable and notifies the waiters.
fn complete(task: &TaskInner, outcome: Result<Result<Value, Failure>, Box<dyn Any + Send>>) {
    let settlement = match outcome {
        Ok(Ok(value)) => {
            log::trace!("task {} finished", task.id);
            *task.result.borrow_mut() = Some(value.clone());
            task.status.set(TaskStatus::Finished);
            Settlement::Resolved(value)
        }
        Ok(Err(failure)) => {
            log::trace!("task {} failed", task.id);
            *task.error.borrow_mut() = Some(failure.clone());
            task.status.set(TaskStatus::Dead);
            Settlement::Failed(failure)
        }
        Err(payload) => {
            log::trace!("task {} panicked", task.id);
            let failure = Failure::from_panic(payload);
            *task.error.borrow_mut() = Some(failure.clone());
            task.status.set(TaskStatus::Dead);
            Settlement::Failed(failure)
        }
    };

    task.settle(settlement);
}

/// Continuation installed by `await`: deliver the settlement and re-enqueue
/// the suspended waiter. Runs on the settler's stack, never switches fibers.
fn task_continuation(waiter: &Rc<TaskInner>, settlement: &Settlement) {
    debug_assert_eq!(waiter.status.get(), TaskStatus::Suspended);

    match settlement {
        Settlement::Resolved(value) => *waiter.value.borrow_mut() = Some(value.clone()),
        Settlement::Failed(failure) => *waiter.error.borrow_mut() = Some(failure.clone()),
    }

    if let Some(scheduler) = waiter.scheduler.upgrade() {
        scheduler.enqueue(waiter);
    }
}

/// Runs an `Init` task's callable synchronously on the caller's fiber.
///
/// No fiber is ever created for the inner task; its queue entry is skipped
/// by the dispatcher once the operation tag is cleared.
fn execute_inline(inner: &TaskInner) {
    debug_assert_eq!(inner.status.get(), TaskStatus::Init);
    log::trace!("executing task {} inline", inner.id);

    inner.operation.set(Operation::None);
    let TaskCall { callable, args } = inner
        .call
        .borrow_mut()
        .take()
        .expect("task has no callable");

    let outcome = {
        let _scope = ContextScope::enter(inner.context.clone());
        catch_unwind(AssertUnwindSafe(move || callable(args)))
    };

    complete(inner, outcome);
}

/// Entry point of every task fiber.
extern "C" fn fiber_main(transfer: context::Transfer) -> ! {
    // Safety: the dispatcher passed a pointer to the source context slot.
    unsafe { fiber::park_transfer(transfer) };

    // Safety: the dispatcher published the task before switching here and
    // keeps it alive while it runs; during a forced unwind the destructor
    // keeps it valid until control is handed back. Holding a strong
    // reference instead would keep the task alive forever, because this
    // frame is never unwound.
    let task = unsafe { &*scheduler::current_task_ptr().expect("fiber started without a task") };

    let TaskCall { callable, args } = task
        .call
        .borrow_mut()
        .take()
        .expect("task has no callable");

    let outcome = {
        let _scope = ContextScope::enter(task.context.clone());
        catch_unwind(AssertUnwindSafe(move || callable(args)))
    };

    // A task found dead here was destroyed while suspended: the await
    // observed the forced resume and unwound the body. Hand control back to
    // the destructor instead of the scheduler.
    if task.status.get() == TaskStatus::Dead {
        drop(outcome);
        let target = task
            .teardown
            .take()
            .expect("destroyed task has no teardown continuation");
        // Safety: the destructor parked its continuation and waits for it;
        // it keeps the task alive across this switch.
        unsafe { fiber::switch(target, &task.saved) };
        unreachable!()
    }

    complete(task, outcome);

    let from = scheduler::current_task();
    debug_assert!(from.is_some());

    // The scheduler must not be kept alive by this frame once it parks for
    // good, so the reference is degraded to a pointer before dispatching.
    let scheduler = task
        .scheduler
        .upgrade()
        .expect("scheduler destroyed while dispatching");
    let scheduler_ptr = Rc::as_ptr(&scheduler);
    drop(scheduler);

    // Safety: the active `run` invocation owns a handle to the scheduler for
    // the whole dispatch, so the pointer stays valid.
    unsafe { (*scheduler_ptr).dispatch(from) };
    unreachable!()
}

/// Parks the current task on the dispatcher until a continuation resumes it.
fn suspend_current(current: Rc<TaskInner>, scheduler: Rc<SchedulerInner>) -> Result<Value, TaskError> {
    log::trace!("suspending task {}", current.id);

    // Only raw pointers may live across the switch. A strong self reference
    // parked in this frame would prevent the suspended task from ever being
    // destroyed, and a strong scheduler reference would make an abandoned
    // scheduler immortal through the stacks of its suspended tasks.
    let task_ptr = Rc::as_ptr(&current);
    let scheduler_ptr = Rc::as_ptr(&scheduler);
    drop(scheduler);
    current.status.set(TaskStatus::Suspended);

    {
        let _scope = ContextScope::save();
        // Safety: the scheduler outlives the dispatch. While it has handles,
        // the active `run` invocation owns one; during teardown it stays
        // allocated until its queue, and with it every pinned task, has
        // dropped, and the resumed path below reads no scheduler state.
        unsafe { (*scheduler_ptr).dispatch(Some(current)) };
    }

    // Safety: a resumed task was pinned by its continuation entry and is
    // published by the dispatcher; a force-resumed task is kept valid by its
    // destructor until the fiber hands control back.
    let task = unsafe { &*task_ptr };

    if task.status.get() == TaskStatus::Dead {
        return Err(TaskError::TaskDestroyed);
    }
    if let Some(failure) = task.error.borrow_mut().take() {
        return Err(TaskError::Failed(failure));
    }

    let value = task
        .value
        .borrow_mut()
        .take()
        .expect("task resumed without a settlement");
    Ok(value)
}

/// A handle to a spawned task.
///
/// Handles are cheap to clone and can be passed to [`Task::await_value`] as
/// a [`Value`] so other tasks can wait for the result. Tasks carry live
/// execution state and are confined to the thread of their scheduler.
#[derive(Clone)]
pub struct Task {
    pub(crate) inner: Rc<TaskInner>,
}

impl Task {
    pub(crate) fn from_inner(inner: Rc<TaskInner>) -> Self {
        Self { inner }
    }

    /// Whether the caller is executing inside a task.
    pub fn is_running() -> bool {
        scheduler::current_task_ptr().is_some()
    }

    /// Spawns a task on the current scheduler, capturing the current
    /// context.
    ///
    /// Fails with [`TaskError::NoScheduler`] when called outside a running
    /// scheduler; use [`TaskScheduler::spawn`] to target a scheduler
    /// directly.
    pub fn spawn(
        callable: impl FnOnce(Vec<Value>) -> Result<Value, Failure> + 'static,
        args: Vec<Value>,
    ) -> Result<Task, TaskError> {
        let scheduler = scheduler::current_scheduler().ok_or(TaskError::NoScheduler)?;
        let context = Context::current().unwrap_or_else(|| scheduler.context.clone());
        Ok(scheduler.spawn_task(context, TaskCall::new(callable, args)))
    }

    /// Spawns a task on the current scheduler with an explicit context.
    pub fn spawn_with_context(
        context: &Context,
        callable: impl FnOnce(Vec<Value>) -> Result<Value, Failure> + 'static,
        args: Vec<Value>,
    ) -> Result<Task, TaskError> {
        let scheduler = scheduler::current_scheduler().ok_or(TaskError::NoScheduler)?;
        Ok(scheduler.spawn_task(context.clone(), TaskCall::new(callable, args)))
    }

    /// Awaits a value from inside a running task.
    ///
    /// Non-awaitable values are returned unchanged. A [`Task`] or
    /// [`DeferredAwaitable`] that already settled yields its outcome without
    /// suspending; a pending one suspends the caller until it settles. An
    /// `Init` task on the same scheduler whose stack fits the caller's is
    /// executed inline on the current fiber.
    ///
    /// Called outside any task, only a [`Task`] may be awaited: its
    /// scheduler is run to quiescence synchronously and the terminal outcome
    /// is returned.
    pub fn await_value(value: Value) -> Result<Value, TaskError> {
        let Some(current) = scheduler::current_task() else {
            return Self::await_outside(value);
        };

        if current.status.get() != TaskStatus::Running {
            // Only reachable while the task unwinds after a forced resume.
            return Err(TaskError::TaskDestroyed);
        }
        let scheduler = current.scheduler.upgrade().ok_or(TaskError::NoScheduler)?;

        // Foreign objects get one chance to be adapted into a builtin
        // awaitable before the dispatch below.
        let value = if value.downcast_ref::<Task>().is_none()
            && value.downcast_ref::<DeferredAwaitable>().is_none()
        {
            match scheduler.adapter() {
                Some(adapter) => adapter(value),
                None => value,
            }
        } else {
            value
        };

        if let Some(target) = value.downcast_ref::<Task>().map(|t| t.inner.clone()) {
            drop(value);
            Self::await_task(current, scheduler, target)
        } else if let Some(awaitable) = value.downcast_ref::<DeferredAwaitable>().cloned() {
            drop(value);
            Self::await_deferred(current, scheduler, awaitable)
        } else {
            Ok(value)
        }
    }

    fn await_task(
        current: Rc<TaskInner>,
        scheduler: Rc<SchedulerInner>,
        target: Rc<TaskInner>,
    ) -> Result<Value, TaskError> {
        if !Weak::ptr_eq(&target.scheduler, &current.scheduler) {
            return Err(TaskError::CrossScheduler);
        }
        assert!(
            !Rc::ptr_eq(&target, &current),
            "a task cannot await itself"
        );

        if target.status.get() == TaskStatus::Init && target.stack_size <= current.stack_size {
            execute_inline(&target);
        }

        match target.status.get() {
            TaskStatus::Finished => {
                let result = target.result.borrow().clone().expect("finished without a result");
                return Ok(result);
            }
            TaskStatus::Dead => {
                let failure = target.error.borrow().clone().expect("dead without an error");
                return Err(TaskError::Failed(failure));
            }
            _ => {}
        }

        target.attach_waiter(current.clone());
        drop(target);
        suspend_current(current, scheduler)
    }

    fn await_deferred(
        current: Rc<TaskInner>,
        scheduler: Rc<SchedulerInner>,
        awaitable: DeferredAwaitable,
    ) -> Result<Value, TaskError> {
        if let Some(outcome) = awaitable.settled() {
            return outcome.map_err(TaskError::Failed);
        }

        awaitable.attach(current.clone(), task_continuation);
        drop(awaitable);
        suspend_current(current, scheduler)
    }

    /// The degenerate await: no fiber is active.
    fn await_outside(value: Value) -> Result<Value, TaskError> {
        let Some(target) = value.downcast_ref::<Task>().map(|t| t.inner.clone()) else {
            return Err(TaskError::AwaitOutsideTask);
        };
        drop(value);

        let scheduler = target.scheduler.upgrade().ok_or(TaskError::NoScheduler)?;
        if scheduler.running.get() {
            return Err(TaskError::SchedulerBusy);
        }
        TaskScheduler::from_inner(scheduler).run()?;

        match target.status.get() {
            TaskStatus::Finished => {
                Ok(target.result.borrow().clone().expect("finished without a result"))
            }
            TaskStatus::Dead => {
                Err(TaskError::Failed(target.error.borrow().clone().expect("dead without an error")))
            }
            _ => Err(TaskError::Incomplete),
        }
    }

    /// Awaits this task's outcome.
    ///
    /// Inside a task this behaves like [`Task::await_value`]; outside, the
    /// task's scheduler is drained synchronously first.
    pub fn join(&self) -> Result<Value, TaskError> {
        Task::await_value(self.to_value())
    }

    /// Wraps this handle as a [`Value`] so it can be awaited.
    pub fn to_value(&self) -> Value {
        Rc::new(self.clone())
    }

    /// The task's scheduler-assigned id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The task's current lifecycle state.
    pub fn status(&self) -> TaskStatus {
        self.inner.status.get()
    }

    /// The result value, once the task finished.
    pub fn result(&self) -> Option<Value> {
        self.inner.result.borrow().clone()
    }

    /// The failure, once the task died.
    pub fn error(&self) -> Option<Failure> {
        self.inner.error.borrow().clone()
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("status", &self.inner.status.get())
            .finish_non_exhaustive()
    }
}

impl Debug for TaskInner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskInner")
            .field("id", &self.id)
            .field("status", &self.status.get())
            .field("operation", &self.operation.get())
            .field("stack_size", &self.stack_size)
            .finish_non_exhaustive()
    }
}

impl Drop for TaskInner {
    fn drop(&mut self) {
        if self.status.get() == TaskStatus::Suspended {
            // Force one last resume so the fiber's frames unwind. The
            // suspended await observes the dead status and raises, and the
            // fiber entry switches back here through the teardown slot.
            log::trace!("destroying suspended task {}", self.id);
            self.status.set(TaskStatus::Dead);

            if let Some(target) = self.saved.take() {
                let _scope = ContextScope::save();
                // Safety: the fiber hands control back through the teardown
                // slot before this frame continues, and `self` stays valid
                // for the whole switch because fields drop only afterwards.
                unsafe { fiber::switch(target, &self.teardown) };
            }
        }

        log::trace!("task {} destroyed", self.id);
        // Remaining resources (callable, fiber stack, slots, context and
        // continuation list) drop with the fields. A pending continuation
        // list is disposed without being invoked.
    }
}
