// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fire-and-forget tasks: starvation resistance and mandatory concurrency.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use weft::{GlobalControl, GlobalParameter, TaskArena};

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn enqueue_runs_under_zero_soft_limit_then_the_worker_retires() {
    // a parallelism cap of one means zero workers: only mandatory
    // concurrency can run the enqueued task
    let limit = GlobalControl::new(GlobalParameter::MaxAllowedParallelism, 1);

    let arena = TaskArena::with_concurrency(2, 1);
    let flag = Arc::new(AtomicBool::new(false));
    {
        let flag = flag.clone();
        arena.enqueue(move || flag.store(true, Ordering::SeqCst));
    }

    // the calling thread performs no further scheduler calls; the flag must
    // flip anyway
    wait_until("the enqueued task to run", || flag.load(Ordering::SeqCst));

    // once the arena observes itself empty the forced worker must return to
    // the sleep pool
    wait_until("the mandatory worker to retire", || {
        arena.active_workers() == 0
    });

    drop(limit);

    // under normal limits, enqueued work still runs without the enqueuer
    // ever waiting
    let second = Arc::new(AtomicBool::new(false));
    {
        let second = second.clone();
        arena.enqueue(move || second.store(true, Ordering::SeqCst));
    }
    wait_until("the second enqueued task to run", || {
        second.load(Ordering::SeqCst)
    });
}
