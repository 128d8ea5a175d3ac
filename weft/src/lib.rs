// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A user-space task-parallel runtime.
//!
//! `weft` turns fine-grained, nested units of computation into execution on
//! a fixed pool of OS worker threads. Work is expressed as tasks spawned
//! into [arenas](TaskArena): per-client slotted structures with one
//! work-stealing deque and one affinity mailbox per slot, plus a
//! starvation-resistant FIFO stream for fire-and-forget
//! [`enqueue`](TaskArena::enqueue)d tasks. A permit manager divides the
//! worker budget among arenas by demand and priority, and a cancellation /
//! exception tree of [`TaskGroupContext`]s spans them all.
//!
//! ```
//! use weft::{TaskArena, TaskBuilder, task};
//!
//! let arena = TaskArena::with_concurrency(4, 1);
//! let total = arena.execute(|| {
//!     let counter = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
//!     for _ in 0..16 {
//!         let counter = counter.clone();
//!         let child = TaskBuilder::child().build(move || {
//!             counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
//!         });
//!         task::spawn(child).unwrap();
//!     }
//!     task::wait_for_all().unwrap();
//!     counter.load(std::sync::atomic::Ordering::Relaxed)
//! });
//! assert_eq!(total, 16);
//! ```

mod arena;
mod context;
mod control;
mod dispatch;
mod error;
pub(crate) mod loom;
mod mailbox;
mod market;
mod monitor;
mod observer;
mod scheduler;
mod slot;
mod stream;
pub mod task;
pub mod this_task_arena;
mod util;

pub use arena::TaskArena;
pub use context::{Priority, TaskGroupContext};
pub use control::{GlobalControl, GlobalParameter, terminate};
pub use error::{SpawnError, TerminateError, UserAbort, WaitError};
pub use observer::ScheduleObserver;
pub use task::{TaskBuilder, TaskHandle};
