// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cancellation and exception propagation across the context tree.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use weft::{TaskArena, TaskBuilder, TaskGroupContext, WaitError, task};

#[test]
fn panic_in_a_child_context_reaches_the_root_waiter_but_not_siblings() {
    let arena = TaskArena::with_concurrency(2, 1);

    let root = TaskGroupContext::new();
    let child_one = TaskGroupContext::with_parent(&root);
    let child_two = TaskGroupContext::with_parent(&root);
    let sibling = TaskGroupContext::new();

    let waiter_saw_panic = Arc::new(AtomicBool::new(false));

    {
        let root = root.clone();
        let child_one = child_one.clone();
        let child_two = child_two.clone();
        let waiter_saw_panic = waiter_saw_panic.clone();

        arena.execute(move || {
            // the waiter on the root context: a task bound to it waits for
            // work running in both child contexts
            let waiter = TaskBuilder::child().context(&root).build(move || {
                let faulty = TaskBuilder::child()
                    .context(&child_one)
                    .build(|| panic!("boom"));
                let busy = TaskBuilder::child().context(&child_two).build(|| {});
                task::spawn(faulty).expect("spawn faulty");
                task::spawn(busy).expect("spawn busy");

                let outcome = catch_unwind(AssertUnwindSafe(task::wait_for_all));
                if outcome.is_err() {
                    waiter_saw_panic.store(true, Ordering::SeqCst);
                }
            });
            task::spawn_and_wait_for_all(waiter).expect("outer wait");
        });
    }

    assert!(
        waiter_saw_panic.load(Ordering::SeqCst),
        "the panic must be resumed at the waiter of the root context"
    );
    assert!(root.is_group_execution_cancelled());
    assert!(child_one.is_group_execution_cancelled());
    // the other child observes the cancellation of the shared root
    assert!(child_two.is_group_execution_cancelled());
    // an unrelated group is untouched
    assert!(!sibling.is_group_execution_cancelled());
}

#[test]
fn cancelled_tasks_are_finalized_without_running() {
    let arena = TaskArena::with_concurrency(2, 1);
    let group = TaskGroupContext::new();
    let ran = Arc::new(AtomicBool::new(false));

    group.cancel_group_execution();

    let result = {
        let group = group.clone();
        let ran = ran.clone();
        arena.execute(move || {
            let task = TaskBuilder::child()
                .context(&group)
                .build(move || ran.store(true, Ordering::SeqCst));
            task::spawn(task).expect("spawn");
            task::wait_for_all()
        })
    };

    assert!(!ran.load(Ordering::SeqCst), "cancelled body must not run");
    // the wait scope itself is clean; cancellation belongs to `group`
    assert_eq!(result, Ok(()));
    assert!(group.is_group_execution_cancelled());
}

#[test]
fn explicit_cancellation_surfaces_at_the_waiter_of_that_context() {
    let arena = TaskArena::with_concurrency(2, 1);
    let observed = Arc::new(std::sync::Mutex::new(None));
    let group = TaskGroupContext::new();

    {
        let group = group.clone();
        let observed = observed.clone();
        arena.execute(move || {
            let waiter = TaskBuilder::child().context(&group).build({
                let group = group.clone();
                let observed = observed.clone();
                move || {
                    // the child inherits this task's (cancelled-to-be) group
                    let child = TaskBuilder::child().build(|| {});
                    task::spawn(child).expect("spawn child");
                    group.cancel_group_execution();
                    *observed.lock().unwrap() = Some(task::wait_for_all());
                }
            });
            task::spawn_and_wait_for_all(waiter).expect("outer wait is clean");
        });
    }

    assert_eq!(
        *observed.lock().unwrap(),
        Some(Err(WaitError::Cancelled)),
        "the waiter inside the cancelled group observes the cancellation"
    );
    assert!(group.is_group_execution_cancelled());
}
