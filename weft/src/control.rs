// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Threading control: top-level lifetime and aggregation.
//!
//! A process-wide, lazily initialized singleton joins the permit manager,
//! the thread dispatcher and the cancellation disseminator, and aggregates
//! the RAII [`GlobalControl`] settings (minimum wins for parallelism,
//! maximum for stack size).

use crate::arena::{Arena, NewWork};
use crate::context::{ContextInner, Priority};
use crate::dispatch::ThreadDispatcher;
use crate::error::TerminateError;
use crate::loom::sync::Mutex;
use crate::loom::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use crate::market::Market;
use crate::util::lock;
use core::fmt;
use lazy_static::lazy_static;
use std::sync::Arc;

lazy_static! {
    static ref GLOBAL: Mutex<Option<Arc<ThreadingControl>>> = Mutex::new(None);
    static ref GLOBAL_SETTINGS: Mutex<Settings> = Mutex::new(Settings::default());
    /// Serializes every change to the context-tree topology and every
    /// cancellation walk across it.
    static ref CONTEXT_TOPOLOGY: Mutex<()> = Mutex::new(());
    /// Fallback arena for work submitted outside any explicit arena.
    static ref DEFAULT_ARENA: Mutex<Option<Arc<Arena>>> = Mutex::new(None);
}

/// Hardware concurrency, the default arena width and parallelism cap.
pub(crate) fn default_concurrency() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Parameters adjustable through [`GlobalControl`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum GlobalParameter {
    /// Cap on the total number of threads doing work, the calling thread
    /// included. The minimum over all active settings wins.
    MaxAllowedParallelism,
    /// Stack size for worker threads created after the change. The maximum
    /// over all active settings wins; zero keeps the platform default.
    ThreadStackSize,
}

#[derive(Debug, Default)]
struct Settings {
    parallelism: Vec<usize>,
    stack_size: Vec<usize>,
}

impl Settings {
    fn list(&mut self, parameter: GlobalParameter) -> &mut Vec<usize> {
        match parameter {
            GlobalParameter::MaxAllowedParallelism => &mut self.parallelism,
            GlobalParameter::ThreadStackSize => &mut self.stack_size,
        }
    }
}

/// RAII-scoped adjustment of a global setting.
///
/// The adjustment is active from construction until drop; overlapping
/// adjustments aggregate per parameter.
#[derive(Debug)]
pub struct GlobalControl {
    parameter: GlobalParameter,
    value: usize,
}

// === impl GlobalControl ===

impl GlobalControl {
    pub fn new(parameter: GlobalParameter, value: usize) -> Self {
        lock(&GLOBAL_SETTINGS).list(parameter).push(value);
        if parameter == GlobalParameter::MaxAllowedParallelism {
            apply_parallelism_setting();
        }
        tracing::debug!(?parameter, value, "global control activated");
        Self { parameter, value }
    }

    /// The currently effective value of `parameter`.
    pub fn active_value(parameter: GlobalParameter) -> usize {
        let mut settings = lock(&GLOBAL_SETTINGS);
        let list = settings.list(parameter);
        match parameter {
            GlobalParameter::MaxAllowedParallelism => list
                .iter()
                .copied()
                .min()
                .unwrap_or_else(default_concurrency),
            GlobalParameter::ThreadStackSize => list.iter().copied().max().unwrap_or(0),
        }
    }
}

impl Drop for GlobalControl {
    fn drop(&mut self) {
        {
            let mut settings = lock(&GLOBAL_SETTINGS);
            let list = settings.list(self.parameter);
            if let Some(position) = list.iter().position(|&value| value == self.value) {
                list.swap_remove(position);
            }
        }
        if self.parameter == GlobalParameter::MaxAllowedParallelism {
            apply_parallelism_setting();
        }
    }
}

/// Stack size for newly created workers; zero means platform default.
pub(crate) fn active_stack_size() -> usize {
    GlobalControl::active_value(GlobalParameter::ThreadStackSize)
}

/// The soft limit derived from the active parallelism cap: the calling
/// thread occupies one unit, workers get the rest.
fn derived_soft_limit() -> usize {
    GlobalControl::active_value(GlobalParameter::MaxAllowedParallelism).saturating_sub(1)
}

fn apply_parallelism_setting() {
    let control = { lock(&GLOBAL).clone() };
    if let Some(control) = control {
        control.set_active_num_workers(derived_soft_limit());
    }
}

/// Per-thread synchronization record registered with the cancellation
/// disseminator.
#[derive(Debug)]
pub(crate) struct ThreadSync {
    /// The thread's view of the global cancellation epoch.
    pub(crate) context_epoch: AtomicU64,
}

impl ThreadSync {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            context_epoch: AtomicU64::new(0),
        })
    }
}

/// Walks the live thread list on every cancellation so each thread's local
/// epoch is in sync with the global one before the cancel call returns.
#[derive(Debug)]
pub(crate) struct Disseminator {
    threads: Mutex<Vec<Arc<ThreadSync>>>,
    epoch: AtomicU64,
}

// === impl Disseminator ===

impl Disseminator {
    fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(0),
        }
    }

    fn register(&self, thread: Arc<ThreadSync>) {
        thread
            .context_epoch
            .store(self.epoch.load(Ordering::Acquire), Ordering::Relaxed);
        lock(&self.threads).push(thread);
    }

    fn unregister(&self, thread: &Arc<ThreadSync>) {
        lock(&self.threads).retain(|other| !Arc::ptr_eq(other, thread));
    }

    fn advance_and_sync(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        for thread in lock(&self.threads).iter() {
            thread.context_epoch.store(epoch, Ordering::Release);
        }
    }
}

pub(crate) struct ThreadingControl {
    market: Market,
    dispatcher: ThreadDispatcher,
    disseminator: Disseminator,
    public_refs: AtomicUsize,
    terminating: AtomicBool,
}

// === impl ThreadingControl ===

impl ThreadingControl {
    /// The process-wide instance, created on first use.
    pub(crate) fn acquire() -> Arc<ThreadingControl> {
        let mut global = lock(&GLOBAL);
        if let Some(control) = &*global {
            return control.clone();
        }

        let soft_limit = derived_soft_limit();
        let hard_limit = default_concurrency().max(1);
        let control = Arc::new(ThreadingControl {
            market: Market::new(soft_limit, hard_limit),
            dispatcher: ThreadDispatcher::new(hard_limit),
            disseminator: Disseminator::new(),
            public_refs: AtomicUsize::new(0),
            terminating: AtomicBool::new(false),
        });
        tracing::debug!(soft_limit, hard_limit, "threading control created");
        *global = Some(control.clone());
        control
    }

    /// Ref-counted acquire from an external thread.
    pub(crate) fn register_public_reference() -> Arc<ThreadingControl> {
        let control = Self::acquire();
        control.public_refs.fetch_add(1, Ordering::AcqRel);
        control
    }

    /// Drop a public reference. With `blocking`, the last reference stops
    /// and joins every worker thread before returning.
    ///
    /// # Errors
    ///
    /// [`TerminateError::BlockingNested`] when a blocking termination is
    /// requested from inside the runtime (a worker, or a second blocking
    /// terminate racing the first).
    pub(crate) fn unregister_public_reference(
        self: &Arc<Self>,
        blocking: bool,
    ) -> Result<(), TerminateError> {
        if blocking
            && (crate::scheduler::is_worker_thread()
                || self.terminating.swap(true, Ordering::SeqCst))
        {
            return Err(TerminateError::BlockingNested);
        }

        let mut refs = self.public_refs.load(Ordering::Acquire);
        while refs > 0 {
            match self.public_refs.compare_exchange(
                refs,
                refs - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    refs -= 1;
                    break;
                }
                Err(actual) => refs = actual,
            }
        }

        if blocking {
            if refs == 0 {
                self.dispatcher.stop_and_join();
                *lock(&DEFAULT_ARENA) = None;
                *lock(&GLOBAL) = None;
            }
            self.terminating.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    pub(crate) fn market(&self) -> &Market {
        &self.market
    }

    pub(crate) fn dispatcher(&self) -> &ThreadDispatcher {
        &self.dispatcher
    }

    /// Install an arena in both the permit manager and the dispatcher ring.
    pub(crate) fn register_arena(&self, arena: &Arc<Arena>) {
        self.market.insert_arena(arena);
        self.dispatcher.insert_ticket(arena);
    }

    /// Change an arena's worker demand; the permit manager recomputes
    /// allotments and the net delta reaches the dispatcher ticket-ordered.
    pub(crate) fn adjust_demand(
        self: &Arc<Self>,
        arena: &Arc<Arena>,
        mandatory_delta: isize,
        workers_delta: isize,
    ) {
        let ticket = self
            .market
            .request_demand(arena, mandatory_delta, workers_delta);
        self.market.issue_ticket(ticket, |delta| {
            self.dispatcher.adjust_job_count_estimate(delta, self);
        });
    }

    /// Retract an arena's demand entirely (it observed itself empty).
    pub(crate) fn zero_demand(self: &Arc<Self>, arena: &Arc<Arena>, mandatory_delta: isize) {
        let ticket = self.market.zero_demand(arena, mandatory_delta);
        self.market.issue_ticket(ticket, |delta| {
            self.dispatcher.adjust_job_count_estimate(delta, self);
        });
    }

    /// Tear the arena down if it is still unreferenced, keyed by the ABA
    /// epoch snapshotted before the caller dropped its reference.
    pub(crate) fn try_destroy_arena(self: &Arc<Self>, arena: &Arc<Arena>, aba_epoch: usize) {
        if let Some(ticket) = self.market.try_destroy_arena(arena, aba_epoch) {
            self.dispatcher.remove_ticket(arena);
            // the arena's public runtime reference goes with it
            let _ = self.unregister_public_reference(false);
            {
                let mut fallback = lock(&DEFAULT_ARENA);
                if fallback
                    .as_ref()
                    .is_some_and(|default| Arc::ptr_eq(default, arena))
                {
                    *fallback = None;
                }
            }
            self.market.issue_ticket(ticket, |delta| {
                self.dispatcher.adjust_job_count_estimate(delta, self);
            });
        }
    }

    /// Apply a new soft limit and wake arenas whose work became servable.
    pub(crate) fn set_active_num_workers(self: &Arc<Self>, soft_limit: usize) {
        tracing::debug!(soft_limit, "active worker count changed");
        let (ticket, arenas) = self.market.set_active_num_workers(soft_limit);
        self.market.issue_ticket(ticket, |delta| {
            self.dispatcher.adjust_job_count_estimate(delta, self);
        });

        for arena in arenas {
            // only meaningful for an arena whose pool went empty while it
            // still has stream work; otherwise the advertise is a no-op
            if arena.is_pool_empty() && arena.has_work() {
                arena.advertise_new_work(NewWork::Wakeup);
            }
        }
    }

    /// Register a thread with the cancellation disseminator.
    pub(crate) fn register_thread(&self, thread: Arc<ThreadSync>) {
        self.disseminator.register(thread);
    }

    pub(crate) fn unregister_thread(&self, thread: &Arc<ThreadSync>) {
        self.disseminator.unregister(thread);
    }

    /// Propagate a cancellation from `src` through its subtree and sync all
    /// registered threads' epochs before returning.
    pub(crate) fn propagate_task_group_state(&self, src: &Arc<ContextInner>) {
        with_context_topology(|| src.cancel_subtree());
        self.disseminator.advance_and_sync();
    }
}

impl fmt::Debug for ThreadingControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadingControl")
            .field("public_refs", &self.public_refs.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Run `f` with the context-tree topology locked.
pub(crate) fn with_context_topology<R>(f: impl FnOnce() -> R) -> R {
    let _guard = lock(&CONTEXT_TOPOLOGY);
    f()
}

/// Cancellation entry point used by contexts; works with or without a live
/// threading control.
pub(crate) fn propagate_cancellation(inner: &Arc<ContextInner>) {
    let control = { lock(&GLOBAL).clone() };
    match control {
        Some(control) => control.propagate_task_group_state(inner),
        None => with_context_topology(|| inner.cancel_subtree()),
    }
}

/// The arena used when work is submitted outside any explicit arena.
pub(crate) fn default_arena() -> Arc<Arena> {
    let control = ThreadingControl::register_public_reference();
    let mut fallback = lock(&DEFAULT_ARENA);
    if let Some(arena) = &*fallback {
        return arena.clone();
    }
    let arena = Arena::new(control.clone(), default_concurrency(), 1, Priority::Normal);
    control.register_arena(&arena);
    *fallback = Some(arena.clone());
    arena
}

/// Release a public runtime reference, optionally blocking until all worker
/// threads exited.
///
/// # Errors
///
/// See [`ThreadingControl::unregister_public_reference`].
pub fn terminate(blocking: bool) -> Result<(), TerminateError> {
    let control = { lock(&GLOBAL).clone() };
    match control {
        Some(control) => control.unregister_public_reference(blocking),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(loom))]
    #[test]
    fn stack_size_settings_aggregate_by_maximum() {
        assert_eq!(active_stack_size(), 0);

        let small = GlobalControl::new(GlobalParameter::ThreadStackSize, 1 << 20);
        let large = GlobalControl::new(GlobalParameter::ThreadStackSize, 4 << 20);
        assert_eq!(active_stack_size(), 4 << 20);

        drop(large);
        assert_eq!(active_stack_size(), 1 << 20);
        drop(small);
        assert_eq!(active_stack_size(), 0);
    }

    #[cfg(not(loom))]
    #[test]
    fn cancellation_sync_reaches_registered_threads() {
        let control = ThreadingControl::acquire();
        let thread = ThreadSync::new();
        control.register_thread(thread.clone());

        let before = thread.context_epoch.load(Ordering::Acquire);
        let ctx = crate::context::TaskGroupContext::new();
        ctx.cancel_group_execution();

        assert!(thread.context_epoch.load(Ordering::Acquire) > before);
        control.unregister_thread(&thread);
    }
}
