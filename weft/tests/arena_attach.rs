// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Attaching external threads to arenas: slot assignment, nesting and
//! delegation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use weft::{TaskArena, TaskBuilder, task, this_task_arena};

#[test]
fn concurrent_executes_fill_distinct_slots() {
    let arena = Arc::new(TaskArena::with_concurrency(4, 1));
    let barrier = Arc::new(Barrier::new(4));

    let spawn_attach = |arena: Arc<TaskArena>, barrier: Arc<Barrier>| {
        std::thread::spawn(move || {
            arena.execute(|| {
                let index = this_task_arena::current_thread_index().expect("attached");
                // hold the slot until everyone is in
                barrier.wait();
                index
            })
        })
    };

    let threads: Vec<_> = (0..3)
        .map(|_| spawn_attach(arena.clone(), barrier.clone()))
        .collect();

    let own = arena.execute(|| {
        let index = this_task_arena::current_thread_index().expect("attached");
        barrier.wait();
        index
    });

    let mut indices: HashSet<usize> = threads
        .into_iter()
        .map(|thread| thread.join().expect("attacher thread"))
        .collect();
    indices.insert(own);

    assert_eq!(indices.len(), 4, "all four threads got distinct slots");
    assert!(indices.iter().all(|&index| index < 4));
}

#[test]
fn recursive_execute_keeps_the_slot_index() {
    let arena = TaskArena::with_concurrency(2, 1);
    arena.execute(|| {
        let outer = this_task_arena::current_thread_index();
        arena.execute(|| {
            assert_eq!(this_task_arena::current_thread_index(), outer);
        });
        assert_eq!(this_task_arena::current_thread_index(), outer);
    });
}

#[test]
fn nested_execute_across_arenas_restores_the_outer_binding() {
    let outer = TaskArena::with_concurrency(2, 1);
    let inner = TaskArena::with_concurrency(3, 1);

    outer.execute(|| {
        let before = this_task_arena::current_thread_index();
        inner.execute(|| {
            assert!(this_task_arena::current_thread_index().is_some());
        });
        assert_eq!(this_task_arena::current_thread_index(), before);
    });
    assert_eq!(this_task_arena::current_thread_index(), None);
}

#[test]
fn single_slot_arena_serves_external_work_with_zero_workers() {
    let arena = TaskArena::with_concurrency(1, 1);
    let counter = Arc::new(AtomicU32::new(0));

    let total = {
        let counter = counter.clone();
        arena.execute(move || {
            for _ in 0..8 {
                let counter = counter.clone();
                let child = TaskBuilder::child().build(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
                task::spawn(child).expect("spawn");
            }
            task::wait_for_all().expect("wait");
            counter.load(Ordering::Relaxed)
        })
    };

    assert_eq!(total, 8, "the external thread ran everything itself");
    assert_eq!(arena.active_workers(), 0);
}

#[test]
fn execute_is_delegated_when_all_slots_are_taken() {
    let arena = Arc::new(TaskArena::with_concurrency(2, 1));
    let inside = Arc::new(Barrier::new(3));
    let release = Arc::new(AtomicBool::new(false));

    let hold_slot = |arena: Arc<TaskArena>, inside: Arc<Barrier>, release: Arc<AtomicBool>| {
        std::thread::spawn(move || {
            arena.execute(|| {
                inside.wait();
                while !release.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
            });
        })
    };

    let holder_a = hold_slot(arena.clone(), inside.clone(), release.clone());
    let holder_b = hold_slot(arena.clone(), inside.clone(), release.clone());
    // both slots of the arena are now occupied
    inside.wait();

    let delegated = {
        let arena = arena.clone();
        std::thread::spawn(move || arena.execute(|| 7))
    };

    // give the delegated call time to enqueue, then free the slots so a
    // worker can pick the delegated task up
    std::thread::sleep(std::time::Duration::from_millis(50));
    release.store(true, Ordering::Release);

    assert_eq!(delegated.join().expect("delegated thread"), 7);
    holder_a.join().expect("holder a");
    holder_b.join().expect("holder b");
}
