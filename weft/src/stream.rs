// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The arena's starvation-resistant FIFO stream of enqueued tasks.
//!
//! The stream guarantees eventual execution: an enqueued task runs even if
//! its enqueuer never calls back into the scheduler. Each priority level owns
//! a set of lanes; pushes spread over the lanes of a level through the
//! caller's rotating hint, pops drain a level starting from a shared hint so
//! lane 0 is not always emptied first. Within one lane the order is FIFO.

use crate::loom::sync::Mutex;
use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::task::TaskRef;
use crate::util::lock;
use std::collections::VecDeque;

pub(crate) const NUM_PRIORITY_LEVELS: usize = 3;
const LANES_PER_LEVEL: usize = 4;

#[derive(Debug)]
struct Lane {
    tasks: Mutex<VecDeque<TaskRef>>,
    /// Non-empty hint so pops skip drained lanes without locking.
    occupied: AtomicBool,
}

impl Lane {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            occupied: AtomicBool::new(false),
        }
    }
}

#[derive(Debug)]
struct Level {
    lanes: [Lane; LANES_PER_LEVEL],
    /// The lane after the one a pop last drained from.
    pop_hint: AtomicUsize,
}

impl Level {
    fn new() -> Self {
        Self {
            lanes: [Lane::new(), Lane::new(), Lane::new(), Lane::new()],
            pop_hint: AtomicUsize::new(0),
        }
    }
}

#[derive(Debug)]
pub(crate) struct TaskStream {
    levels: [Level; NUM_PRIORITY_LEVELS],
}

// === impl TaskStream ===

impl TaskStream {
    pub(crate) fn new() -> Self {
        Self {
            levels: [Level::new(), Level::new(), Level::new()],
        }
    }

    /// Push a task into the given priority level; `lane_hint` is the caller's
    /// rotating lane selector.
    pub(crate) fn push(&self, task: TaskRef, level: usize, lane_hint: usize) {
        debug_assert!(level < NUM_PRIORITY_LEVELS);
        let lane = &self.levels[level].lanes[lane_hint % LANES_PER_LEVEL];
        let mut tasks = lock(&lane.tasks);
        tasks.push_back(task);
        lane.occupied.store(true, Ordering::Release);
    }

    /// Pop the next task, preferring higher priority levels; within a level
    /// the shared hint selects the lane subsequent to the last drained one.
    pub(crate) fn pop(&self) -> Option<TaskRef> {
        for level in &self.levels {
            let start = level.pop_hint.load(Ordering::Relaxed);
            for offset in 0..LANES_PER_LEVEL {
                let index = (start + offset) % LANES_PER_LEVEL;
                let lane = &level.lanes[index];
                if !lane.occupied.load(Ordering::Acquire) {
                    continue;
                }

                let mut tasks = lock(&lane.tasks);
                if let Some(task) = tasks.pop_front() {
                    if tasks.is_empty() {
                        lane.occupied.store(false, Ordering::Release);
                    }
                    drop(tasks);
                    level.pop_hint.store(index + 1, Ordering::Relaxed);
                    return Some(task);
                }
                lane.occupied.store(false, Ordering::Release);
            }
        }
        None
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.levels
            .iter()
            .flat_map(|level| level.lanes.iter())
            .all(|lane| !lane.occupied.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marked_task(marker: usize) -> TaskRef {
        let handle = crate::task::TaskBuilder::root().affinity(marker).build(|| {});
        let (task, _gate) = handle.into_parts();
        task.expect("freshly built handle owns its task")
    }

    fn marker_of(task: &TaskRef) -> usize {
        task.affinity().expect("test tasks carry a marker")
    }

    #[cfg(not(loom))]
    #[test]
    fn higher_priority_levels_pop_first() {
        let stream = TaskStream::new();
        stream.push(marked_task(0), 2, 0);
        stream.push(marked_task(1), 1, 0);
        stream.push(marked_task(2), 0, 0);

        let order: Vec<usize> = std::iter::from_fn(|| stream.pop())
            .map(|task| marker_of(&task))
            .collect();
        assert_eq!(order, [2, 1, 0]);
        assert!(stream.is_empty());
    }

    #[cfg(not(loom))]
    #[test]
    fn a_lane_is_fifo() {
        let stream = TaskStream::new();
        for marker in 0..8 {
            stream.push(marked_task(marker), 1, 3);
        }

        let order: Vec<usize> = std::iter::from_fn(|| stream.pop())
            .map(|task| marker_of(&task))
            .collect();
        assert_eq!(order, [0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[cfg(not(loom))]
    #[test]
    fn pops_rotate_away_from_the_first_lane() {
        let stream = TaskStream::new();
        stream.push(marked_task(0), 1, 0);
        stream.push(marked_task(1), 1, 1);

        let first = stream.pop().expect("two tasks queued");
        // the shared hint moves past the drained lane, so the next pop does
        // not rescan lane 0 first
        let second = stream.pop().expect("one task left");
        assert_ne!(marker_of(&first), marker_of(&second));
        assert!(stream.pop().is_none());
    }
}
