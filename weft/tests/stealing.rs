// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Work distribution: tasks spawned into one slot are stolen by workers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use weft::{TaskArena, TaskBuilder, task};

#[test]
fn spawned_work_is_stolen_by_other_threads() {
    if std::thread::available_parallelism().map_or(1, usize::from) < 2 {
        // a single hardware thread means a zero soft limit: no workers, no
        // stealing to observe
        return;
    }

    let arena = TaskArena::with_concurrency(4, 1);
    let executors: Arc<Mutex<HashSet<ThreadId>>> = Arc::new(Mutex::new(HashSet::new()));

    {
        let executors = executors.clone();
        arena.execute(move || {
            // everything is pushed into this thread's deque; any other
            // executing thread must have stolen its share
            for _ in 0..256 {
                let executors = executors.clone();
                let child = TaskBuilder::child().build(move || {
                    executors.lock().unwrap().insert(std::thread::current().id());
                    // widen the stealing window
                    let mut spin = 0_u32;
                    for i in 0..20_000 {
                        spin = spin.wrapping_add(i);
                    }
                    std::hint::black_box(spin);
                });
                task::spawn(child).expect("spawn");
            }
            task::wait_for_all().expect("wait");
        });
    }

    let executors = executors.lock().unwrap();
    assert!(
        executors.len() >= 2,
        "expected steals, but one thread ran all 256 tasks"
    );
}
