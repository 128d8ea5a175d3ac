// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Scheduler observation hooks.

/// Callbacks fired when a thread joins or leaves an arena slot.
///
/// For every observer attached to an arena, `on_scheduler_entry` and
/// `on_scheduler_exit` fire exactly once per slot occupancy cycle of each
/// thread: entry after the slot is taken, exit right before it is released.
/// The hooks run on the observed thread and must not call back into
/// blocking runtime operations.
pub trait ScheduleObserver: Send + Sync {
    fn on_scheduler_entry(&self, is_worker: bool) {
        let _ = is_worker;
    }

    fn on_scheduler_exit(&self, is_worker: bool) {
        let _ = is_worker;
    }
}
