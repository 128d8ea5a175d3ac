// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A nested spawn tree: the classic Fibonacci decomposition.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::util::SubscriberInitExt;
use weft::{TaskArena, TaskBuilder, task};

fn fib_seq(n: u64) -> u64 {
    match n {
        0 | 1 => n,
        _ => fib_seq(n - 1) + fib_seq(n - 2),
    }
}

/// Recursively split `F(n) = F(n-1) + F(n-2)` into child tasks; leaves below
/// the cutoff add their sequential result into the shared accumulator.
fn fib_task(n: u64, out: Arc<AtomicU64>) {
    if n < 10 {
        out.fetch_add(fib_seq(n), Ordering::Relaxed);
        return;
    }

    let left = out.clone();
    let right = out;
    let first = TaskBuilder::child().build(move || fib_task(n - 1, left));
    let second = TaskBuilder::child().build(move || fib_task(n - 2, right));

    task::spawn(first).expect("spawning requires an arena slot");
    task::spawn_and_wait_for_all(second).expect("nested wait failed");
}

#[test]
fn fibonacci_spawn_tree() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_thread_names(true)
        .set_default();

    let arena = TaskArena::with_concurrency(4, 1);
    let out = Arc::new(AtomicU64::new(0));

    let result = {
        let out = out.clone();
        arena.execute(move || {
            fib_task(20, out.clone());
            task::wait_for_all().expect("top-level wait failed");
            out.load(Ordering::Relaxed)
        })
    };

    assert_eq!(result, 6765);
    // every task was executed and destroyed: no body is still holding a
    // clone of the accumulator
    assert_eq!(Arc::strong_count(&out), 1);
}

#[test]
fn spawn_outside_an_arena_is_rejected() {
    let handle = TaskBuilder::root().build(|| {});
    assert_eq!(task::spawn(handle), Err(weft::SpawnError::MissingWait));
}
