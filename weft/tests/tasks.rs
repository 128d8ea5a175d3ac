// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task graph surface: predecessor links, affinity, observers, isolation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use weft::{ScheduleObserver, TaskArena, TaskBuilder, task, this_task_arena};

#[test]
fn predecessors_complete_before_the_gated_task_starts() {
    let arena = TaskArena::with_concurrency(3, 1);
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let order = order.clone();
        arena.execute(move || {
            let record = |label: &'static str, order: &Arc<Mutex<Vec<&'static str>>>| {
                let order = order.clone();
                move || order.lock().unwrap().push(label)
            };

            let mut successor = TaskBuilder::child().build(record("successor", &order));
            let mut first = TaskBuilder::child().build(record("first", &order));
            let mut second = TaskBuilder::child().build(record("second", &order));

            successor.add_predecessor(&mut first);
            successor.add_predecessor(&mut second);

            // spawning the successor first must not start it: its
            // continuation vertex still holds both predecessor references
            task::spawn(successor).expect("spawn successor");
            task::spawn(first).expect("spawn first");
            task::spawn(second).expect("spawn second");
            task::wait_for_all().expect("wait");
        });
    }

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 3);
    assert_eq!(*order.last().unwrap(), "successor");
}

#[test]
fn dropping_a_gated_handle_keeps_predecessors_runnable() {
    let arena = TaskArena::with_concurrency(2, 1);
    let ran = Arc::new(AtomicUsize::new(0));

    {
        let ran = ran.clone();
        arena.execute(move || {
            let gated_ran = ran.clone();
            let mut gated = TaskBuilder::child().build(move || {
                gated_ran.fetch_add(100, Ordering::Relaxed);
            });

            let pred_ran = ran.clone();
            let mut pred = TaskBuilder::child().build(move || {
                pred_ran.fetch_add(1, Ordering::Relaxed);
            });

            gated.add_predecessor(&mut pred);
            // never launch the gated task
            drop(gated);

            task::spawn(pred).expect("spawn pred");
            task::wait_for_all().expect("wait");
        });
    }

    // the predecessor ran; the dropped successor could not be revived
    assert_eq!(ran.load(Ordering::Relaxed), 1);
}

#[test]
fn affinity_hinted_tasks_still_run_exactly_once() {
    let arena = TaskArena::with_concurrency(4, 1);
    let counter = Arc::new(AtomicUsize::new(0));

    {
        let counter = counter.clone();
        arena.execute(move || {
            for slot in 0..4 {
                let counter = counter.clone();
                let child = TaskBuilder::child().affinity(slot).build(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
                task::spawn(child).expect("spawn");
            }
            task::wait_for_all().expect("wait");
        });
    }

    assert_eq!(counter.load(Ordering::Relaxed), 4);
}

#[test]
fn observer_hooks_fire_once_per_occupancy_cycle() {
    #[derive(Default)]
    struct Counting {
        entries: AtomicUsize,
        exits: AtomicUsize,
        worker_entries: AtomicUsize,
    }

    impl ScheduleObserver for Counting {
        fn on_scheduler_entry(&self, is_worker: bool) {
            self.entries.fetch_add(1, Ordering::SeqCst);
            if is_worker {
                self.worker_entries.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn on_scheduler_exit(&self, _is_worker: bool) {
            self.exits.fetch_add(1, Ordering::SeqCst);
        }
    }

    let arena = TaskArena::with_concurrency(2, 2);
    let observer = Arc::new(Counting::default());
    arena.attach_observer(observer.clone());

    // no spawns: no workers are requested, so the only occupancy cycle is
    // this external thread's
    arena.execute(|| {});

    assert_eq!(observer.entries.load(Ordering::SeqCst), 1);
    assert_eq!(observer.exits.load(Ordering::SeqCst), 1);
    assert_eq!(observer.worker_entries.load(Ordering::SeqCst), 0);
}

#[test]
fn isolation_restores_the_previous_region() {
    let arena = TaskArena::with_concurrency(2, 1);
    let total = arena.execute(|| {
        let inner = this_task_arena::isolate(|| {
            let counter = Arc::new(AtomicUsize::new(0));
            for _ in 0..4 {
                let counter = counter.clone();
                let child = TaskBuilder::child().build(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
                task::spawn(child).expect("spawn isolated");
            }
            task::wait_for_all().expect("isolated wait");
            counter.load(Ordering::Relaxed)
        });

        // outside the region again: spawns and waits work as before
        let counter = Arc::new(AtomicUsize::new(inner));
        let child = {
            let counter = counter.clone();
            TaskBuilder::child().build(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
        };
        task::spawn_and_wait_for_all(child).expect("outer wait");
        counter.load(Ordering::Relaxed)
    });

    assert_eq!(total, 5);
}
