use cotask::{
    value, Deferred, Failure, Task, TaskError, TaskScheduler, TaskStatus, Value, DEFAULT_STACK_SIZE,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn int(value: &Value) -> i32 {
    *value.downcast_ref::<i32>().expect("not an i32")
}

fn failure_of(error: TaskError) -> Failure {
    match error {
        TaskError::Failed(failure) => failure,
        other => Failure::from(other),
    }
}

#[test]
fn await_returns_non_awaitables_unchanged() {
    let scheduler = TaskScheduler::new();
    let passed_through = Rc::new(Cell::new(false));

    {
        let passed_through = passed_through.clone();
        scheduler.spawn(
            move |_args| {
                let input = value(5_i32);
                let output = Task::await_value(input.clone()).map_err(Failure::from)?;
                passed_through.set(Rc::ptr_eq(&input, &output));
                Ok(value(()))
            },
            Vec::new(),
        );
    }

    scheduler.run().unwrap();
    assert!(passed_through.get());
}

#[test]
fn awaiting_outside_requires_a_task() {
    assert!(matches!(
        Task::await_value(value(5_i32)),
        Err(TaskError::AwaitOutsideTask)
    ));
}

#[test]
fn join_drains_the_scheduler() {
    let scheduler = TaskScheduler::new();
    let task = scheduler.spawn(|_args| Ok(value(42_i32)), Vec::new());

    let result = task.join().unwrap();
    assert_eq!(int(&result), 42);
    assert_eq!(scheduler.count(), 0);

    // A terminal task joins again without running anything.
    let again = task.join().unwrap();
    assert!(Rc::ptr_eq(&result, &again));
}

#[test]
fn joining_a_dead_task_reraises_its_failure() {
    let scheduler = TaskScheduler::new();
    let failure = Failure::from("broken");

    let task = {
        let failure = failure.clone();
        scheduler.spawn(move |_args| Err(failure), Vec::new())
    };

    let error = task.join().unwrap_err();
    assert!(failure_of(error).ptr_eq(&failure));
    assert_eq!(task.status(), TaskStatus::Dead);
}

#[test]
fn nested_init_task_executes_inline() {
    let scheduler = TaskScheduler::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    let outer = {
        let order = order.clone();
        scheduler.spawn(
            move |_args| {
                order.borrow_mut().push("outer:before");
                let inner = {
                    let order = order.clone();
                    Task::spawn(
                        move |_args| {
                            order.borrow_mut().push("inner");
                            Ok(value(7_i32))
                        },
                        Vec::new(),
                    )
                    .map_err(Failure::from)?
                };
                let result = Task::await_value(inner.to_value()).map_err(Failure::from)?;
                order.borrow_mut().push("outer:after");
                Ok(result)
            },
            Vec::new(),
        )
    };
    {
        let order = order.clone();
        scheduler.spawn(
            move |_args| {
                order.borrow_mut().push("other");
                Ok(value(()))
            },
            Vec::new(),
        );
    }

    scheduler.run().unwrap();

    // The inner task ran synchronously inside the outer task's await; the
    // outer task never suspended, so "other" only ran after it finished.
    assert_eq!(
        *order.borrow(),
        ["outer:before", "inner", "outer:after", "other"]
    );
    assert_eq!(int(&outer.result().unwrap()), 7);
}

#[test]
fn larger_stacks_are_not_inlined() {
    let scheduler = TaskScheduler::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    let outer = {
        let order = order.clone();
        let spawner = scheduler.clone();
        scheduler.spawn(
            move |_args| {
                order.borrow_mut().push("outer:before");
                spawner.set_default_stack_size(DEFAULT_STACK_SIZE * 2);
                let inner = {
                    let order = order.clone();
                    spawner.spawn(
                        move |_args| {
                            order.borrow_mut().push("inner");
                            Ok(value(7_i32))
                        },
                        Vec::new(),
                    )
                };
                let result = Task::await_value(inner.to_value()).map_err(Failure::from)?;
                order.borrow_mut().push("outer:after");
                Ok(result)
            },
            Vec::new(),
        )
    };
    {
        let order = order.clone();
        scheduler.spawn(
            move |_args| {
                order.borrow_mut().push("other");
                Ok(value(()))
            },
            Vec::new(),
        );
    }

    scheduler.run().unwrap();

    // The inner task wants a bigger stack than the outer one has, so the
    // await suspends instead of inlining and the queue order takes over.
    assert_eq!(
        *order.borrow(),
        ["outer:before", "other", "inner", "outer:after"]
    );
    assert_eq!(int(&outer.result().unwrap()), 7);
}

#[test]
fn awaiting_a_finished_task_returns_without_scheduling() {
    let scheduler = TaskScheduler::new();
    let finished = scheduler.spawn(|_args| Ok(value(3_i32)), Vec::new());
    scheduler.run().unwrap();
    assert_eq!(finished.status(), TaskStatus::Finished);

    let results = Rc::new(RefCell::new(Vec::new()));
    {
        let results = results.clone();
        let finished = finished.clone();
        scheduler.spawn(
            move |_args| {
                for _ in 0..2 {
                    let result =
                        Task::await_value(finished.to_value()).map_err(Failure::from)?;
                    results.borrow_mut().push(int(&result));
                }
                Ok(value(()))
            },
            Vec::new(),
        );
    }

    scheduler.run().unwrap();
    assert_eq!(*results.borrow(), [3, 3]);
}

#[test]
fn failure_propagates_with_identity() {
    let scheduler = TaskScheduler::new();
    let marker = Failure::new("explosion marker");

    let bad = {
        let marker = marker.clone();
        scheduler.spawn(move |_args| Err(marker), Vec::new())
    };
    let wrap = {
        let bad = bad.clone();
        scheduler.spawn(
            move |_args| {
                Task::await_value(bad.to_value()).map_err(failure_of)
            },
            Vec::new(),
        )
    };

    scheduler.run().unwrap();

    assert_eq!(bad.status(), TaskStatus::Dead);
    assert_eq!(wrap.status(), TaskStatus::Dead);
    assert!(wrap.error().unwrap().ptr_eq(&marker));
}

#[test]
fn awaiting_across_schedulers_fails() {
    let scheduler = TaskScheduler::new();
    let other = TaskScheduler::new();
    let foreign = other.spawn(|_args| Ok(value(())), Vec::new());

    let observed = Rc::new(Cell::new(false));
    {
        let observed = observed.clone();
        scheduler.spawn(
            move |_args| {
                observed.set(matches!(
                    Task::await_value(foreign.to_value()),
                    Err(TaskError::CrossScheduler)
                ));
                Ok(value(()))
            },
            Vec::new(),
        );
    }

    scheduler.run().unwrap();
    assert!(observed.get());
}

#[test]
fn destroying_a_suspended_task_unwinds_its_fiber() {
    struct DropFlag(Rc<Cell<bool>>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    let scheduler = TaskScheduler::new();
    let deferred = Deferred::new();
    let observed = Rc::new(Cell::new(None));
    let unwound = Rc::new(Cell::new(false));

    let task = {
        let awaitable = deferred.awaitable();
        let observed = observed.clone();
        let unwound = unwound.clone();
        scheduler.spawn(
            move |_args| {
                let _guard = DropFlag(unwound);
                let result = Task::await_value(value(awaitable));
                observed.set(Some(matches!(result, Err(TaskError::TaskDestroyed))));
                result.map_err(Failure::from)
            },
            Vec::new(),
        )
    };

    scheduler.run().unwrap();
    assert_eq!(task.status(), TaskStatus::Suspended);
    assert_eq!(scheduler.count(), 0);

    // The external handle is not what pins a suspended task.
    drop(task);
    assert_eq!(observed.get(), None);
    assert!(!unwound.get());

    // Disposing the pending awaitable drops the pin, and the last reference
    // tears the task down: the suspended await observes the destruction and
    // the body's guards run.
    drop(deferred);
    assert_eq!(observed.get(), Some(true));
    assert!(unwound.get());
    assert_eq!(scheduler.count(), 0);
}

#[test]
fn panics_become_failures() {
    let scheduler = TaskScheduler::new();
    let task = scheduler.spawn(|_args| panic!("exploded"), Vec::new());

    scheduler.run().unwrap();

    assert_eq!(task.status(), TaskStatus::Dead);
    assert_eq!(task.error().unwrap().message(), Some("exploded"));
}

#[test]
fn adapter_translates_foreign_awaitables() {
    struct Token;

    let scheduler = TaskScheduler::new();
    let deferred = Deferred::new();

    {
        let awaitable = deferred.awaitable();
        scheduler.set_adapter(move |foreign| {
            if foreign.downcast_ref::<Token>().is_some() {
                value(awaitable.clone())
            } else {
                foreign
            }
        });
    }

    let task = scheduler.spawn(
        |_args| Task::await_value(value(Token)).map_err(Failure::from),
        Vec::new(),
    );

    scheduler.run().unwrap();
    assert_eq!(task.status(), TaskStatus::Suspended);

    deferred.resolve(value(11_i32)).unwrap();
    scheduler.run().unwrap();
    assert_eq!(int(&task.result().unwrap()), 11);
}

#[test]
fn is_running_reflects_task_context() {
    assert!(!Task::is_running());

    let scheduler = TaskScheduler::new();
    let observed = Rc::new(Cell::new(false));
    {
        let observed = observed.clone();
        scheduler.spawn(
            move |_args| {
                observed.set(Task::is_running());
                Ok(value(()))
            },
            Vec::new(),
        );
    }

    scheduler.run().unwrap();
    assert!(observed.get());
    assert!(!Task::is_running());
}
