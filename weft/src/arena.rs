// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Arenas: the slotted structures workers are dispatched into.
//!
//! An arena owns a fixed array of slots, each with a work-stealing deque and
//! an affinity mailbox, plus a FIFO stream for enqueued tasks, a packed reference
//! word splitting external from worker references, and the EMPTY/FULL pool
//! state that drives worker demand.

use crate::context::{Priority, TaskGroupContext};
use crate::control::ThreadingControl;
use crate::loom::sync::Mutex;
use crate::loom::sync::atomic::{AtomicIsize, AtomicUsize, Ordering, fence};
use crate::monitor::Monitor;
use crate::observer::ScheduleObserver;
use crate::slot::{ArenaSlot, Steal};
use crate::stream::TaskStream;
use crate::task::{TaskHandle, TaskRef};
use crate::util::lock;
use core::fmt;
use std::sync::{Arc, OnceLock};

/// The number of least significant bits of the reference word counting
/// external references; the rest counts workers. Up to 4095 external
/// references and roughly a million workers fit one word.
pub(crate) const REF_EXTERNAL_BITS: u32 = 12;

mycelium_bitfield::bitfield! {
    /// Decoded view of an arena's packed reference word.
    pub(crate) struct RefWord<usize> {
        /// References held by external threads and arena handles.
        pub(crate) const EXTERNAL = 12;
        /// References held by workers servicing the arena.
        pub(crate) const WORKERS = ..;
    }
}

/// Which half of the reference word a thread holds.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum RefKind {
    External,
    Worker,
}

impl RefKind {
    pub(crate) fn unit(self) -> usize {
        match self {
            RefKind::External => 1,
            RefKind::Worker => 1 << REF_EXTERNAL_BITS,
        }
    }
}

/// Sentinel returned by [`Arena::occupy_free_slot`] when no slot is free.
pub(crate) const OUT_OF_ARENA: usize = usize::MAX;

/// No tasks to steal since the last snapshot was taken.
const SNAPSHOT_EMPTY: usize = 0;
/// At least one task was offered for stealing since the last snapshot.
const SNAPSHOT_FULL: usize = usize::MAX;
/// A thread is in the middle of taking an out-of-work snapshot.
const SNAPSHOT_BUSY: usize = 1;

fn is_busy_or_empty(state: usize) -> bool {
    state < SNAPSHOT_FULL
}

/// Mandatory-concurrency mode of the arena.
const MANDATORY_NONE: usize = 0;
/// The arena temporarily raised its own worker window for an enqueued task.
const MANDATORY_LOCAL: usize = 1;
/// The permit manager forces one worker although the soft limit is zero.
const MANDATORY_GLOBAL: usize = 2;

/// Kind of work being advertised; decides the memory fence and the
/// mandatory-concurrency action.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum NewWork {
    /// Spawned into a slot's deque. Deliberately relaxed: a missed wakeup
    /// only delays parallelism, since the spawner itself keeps working.
    Spawned,
    /// Pushed into the FIFO stream. Requires the full fence: nobody else
    /// owns execution of an enqueued task, so a missed wakeup could stall it
    /// forever.
    Enqueued,
    /// Existing work became runnable again.
    Wakeup,
}

static ARENA_EPOCH: AtomicUsize = AtomicUsize::new(1);

pub(crate) struct Arena {
    control: Arc<ThreadingControl>,
    slots: Box<[ArenaSlot]>,
    num_reserved: usize,
    /// Worker window the arena was created with: `max_concurrency − R`.
    base_max_workers: usize,
    /// Current worker window; may be raised above `base_max_workers` by
    /// local mandatory concurrency.
    max_workers: AtomicUsize,
    /// Upper bound of busy slots; stealing only probes `[0, limit)`.
    limit: AtomicUsize,
    references: AtomicUsize,
    pool_state: AtomicUsize,
    stream: TaskStream,
    /// Workers currently requested from the permit manager. Written only
    /// under the permit manager's list lock.
    requested: AtomicIsize,
    /// Workers currently granted by the permit manager.
    allotted: AtomicUsize,
    mandatory: AtomicUsize,
    /// Disambiguates reuse of an address by a freshly created arena.
    aba_epoch: usize,
    priority: Priority,
    default_ctx: TaskGroupContext,
    /// Threads in nested waits sleep here, keyed by their wait vertex.
    waiter_monitor: Monitor,
    /// Delegated `execute` calls wait here for completion or a freed slot.
    exit_monitor: Monitor,
    observers: Mutex<Vec<Arc<dyn ScheduleObserver>>>,
    /// Rotating lane selector for stream pushes.
    lane_hint: AtomicUsize,
    /// Successful steals, for diagnostics.
    steals: AtomicUsize,
}

// === impl Arena ===

impl Arena {
    /// An arena always has at least two slots, even at `max_concurrency` 1,
    /// so there is a pool to steal from next to the reserved slot.
    fn num_arena_slots(max_concurrency: usize) -> usize {
        max_concurrency.max(2)
    }

    pub(crate) fn new(
        control: Arc<ThreadingControl>,
        max_concurrency: usize,
        reserved: usize,
        priority: Priority,
    ) -> Arc<Arena> {
        let max_concurrency = max_concurrency.max(1);
        let reserved = reserved.min(max_concurrency);
        let num_slots = Self::num_arena_slots(max_concurrency);
        let slots = (0..num_slots).map(|_| ArenaSlot::new()).collect();

        let arena = Arc::new(Arena {
            control,
            slots,
            num_reserved: reserved,
            base_max_workers: max_concurrency - reserved,
            max_workers: AtomicUsize::new(max_concurrency - reserved),
            limit: AtomicUsize::new(0),
            // the creating handle holds one external reference
            references: AtomicUsize::new(RefKind::External.unit()),
            pool_state: AtomicUsize::new(SNAPSHOT_EMPTY),
            stream: TaskStream::new(),
            requested: AtomicIsize::new(0),
            allotted: AtomicUsize::new(0),
            mandatory: AtomicUsize::new(MANDATORY_NONE),
            aba_epoch: ARENA_EPOCH.fetch_add(1, Ordering::Relaxed),
            priority,
            default_ctx: TaskGroupContext::new(),
            waiter_monitor: Monitor::new(),
            exit_monitor: Monitor::new(),
            observers: Mutex::new(Vec::new()),
            lane_hint: AtomicUsize::new(0),
            steals: AtomicUsize::new(0),
        });

        tracing::debug!(
            slots = num_slots,
            reserved,
            workers = arena.base_max_workers,
            ?priority,
            epoch = arena.aba_epoch,
            "arena created"
        );
        arena
    }

    pub(crate) fn control(&self) -> &Arc<ThreadingControl> {
        &self.control
    }

    pub(crate) fn slot(&self, index: usize) -> &ArenaSlot {
        &self.slots[index]
    }

    pub(crate) fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn num_reserved(&self) -> usize {
        self.num_reserved
    }

    pub(crate) fn priority_level(&self) -> usize {
        self.priority.level()
    }

    pub(crate) fn default_context(&self) -> &TaskGroupContext {
        &self.default_ctx
    }

    pub(crate) fn waiter_monitor(&self) -> &Monitor {
        &self.waiter_monitor
    }

    pub(crate) fn exit_monitor(&self) -> &Monitor {
        &self.exit_monitor
    }

    pub(crate) fn aba_epoch(&self) -> usize {
        self.aba_epoch
    }

    pub(crate) fn max_workers(&self) -> usize {
        self.max_workers.load(Ordering::Relaxed)
    }

    pub(crate) fn allotted(&self) -> usize {
        self.allotted.load(Ordering::Relaxed)
    }

    pub(crate) fn set_allotted(&self, workers: usize) {
        self.allotted.store(workers, Ordering::Relaxed);
    }

    pub(crate) fn requested(&self) -> isize {
        self.requested.load(Ordering::Relaxed)
    }

    /// Adjust the recorded demand. Only the permit manager calls this, under
    /// its list lock.
    pub(crate) fn add_requested(&self, delta: isize) -> isize {
        let updated = (self.requested.load(Ordering::Relaxed) + delta).max(0);
        self.requested.store(updated, Ordering::Relaxed);
        updated
    }

    pub(crate) fn is_mandatory(&self) -> bool {
        self.mandatory.load(Ordering::Relaxed) != MANDATORY_NONE
    }

    /// Fold a demand change into this arena's `(min, max)` worker window.
    /// Called by the permit manager under its list lock.
    pub(crate) fn update_request(
        &self,
        mandatory_delta: isize,
        workers_delta: isize,
    ) -> (isize, isize) {
        let requested = self.add_requested(workers_delta);
        let min = if mandatory_delta > 0 || self.is_mandatory() {
            1
        } else {
            0
        };
        (min, requested)
    }

    pub(crate) fn is_pool_empty(&self) -> bool {
        self.pool_state.load(Ordering::SeqCst) == SNAPSHOT_EMPTY
    }

    pub(crate) fn steal_count(&self) -> usize {
        self.steals.load(Ordering::Relaxed)
    }

    // --- references ---

    pub(crate) fn add_external_ref(&self) {
        self.references
            .fetch_add(RefKind::External.unit(), Ordering::AcqRel);
    }

    pub(crate) fn num_workers_active(&self) -> usize {
        RefWord::from_bits(self.references.load(Ordering::Acquire)).get(RefWord::WORKERS)
    }

    pub(crate) fn has_references(&self) -> bool {
        self.references.load(Ordering::Acquire) != 0
    }

    /// Conditionally take a worker reference: succeeds only while the arena
    /// wants more workers than it has.
    pub(crate) fn try_join_worker(&self) -> bool {
        let mut refs = self.references.load(Ordering::Relaxed);
        loop {
            let active = RefWord::from_bits(refs).get(RefWord::WORKERS);
            if active >= self.allotted() {
                return false;
            }
            match self.references.compare_exchange_weak(
                refs,
                refs + RefKind::Worker.unit(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => refs = actual,
            }
        }
    }

    /// Notification that a worker or external thread leaves the arena.
    ///
    /// The ABA epoch and the owning control are snapshotted *before* the
    /// reference drop: after it, the arena may already have been retired by
    /// another leaving thread, and a reused address must not be freed twice.
    pub(crate) fn on_thread_leaving(self: &Arc<Self>, kind: RefKind) {
        let aba_epoch = self.aba_epoch;
        let control = self.control.clone();
        let unit = kind.unit();

        let previous = self.references.fetch_sub(unit, Ordering::AcqRel);
        debug_assert!(previous >= unit, "arena reference counter underflow");

        if previous == unit {
            control.try_destroy_arena(self, aba_epoch);
        }
    }

    // --- slots ---

    /// Try to occupy a slot: external threads probe the reserved range
    /// first, workers skip straight past it. Returns the slot index or
    /// [`OUT_OF_ARENA`].
    pub(crate) fn occupy_free_slot(&self, as_worker: bool) -> usize {
        if !as_worker {
            if let Some(index) = self.occupy_in_range(0, self.num_reserved) {
                return self.note_occupied(index);
            }
        }
        if let Some(index) = self.occupy_in_range(self.num_reserved, self.slots.len()) {
            return self.note_occupied(index);
        }
        OUT_OF_ARENA
    }

    fn occupy_in_range(&self, lower: usize, upper: usize) -> Option<usize> {
        (lower..upper).find(|&index| self.slots[index].try_occupy())
    }

    fn note_occupied(&self, index: usize) -> usize {
        let mut limit = self.limit.load(Ordering::Relaxed);
        while limit < index + 1 {
            match self.limit.compare_exchange_weak(
                limit,
                index + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => limit = actual,
            }
        }
        index
    }

    pub(crate) fn release_slot(&self, index: usize) {
        self.slots[index].release();
        // a delegated `execute` may be waiting for a reserved slot to free up
        self.exit_monitor.notify_all_relaxed();
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire).min(self.slots.len())
    }

    // --- work advertising ---

    /// Raise the there-is-work flag after a spawn, enqueue or wakeup, and
    /// request workers when the pool transitions from empty.
    pub(crate) fn advertise_new_work(self: &Arc<Self>, kind: NewWork) {
        match kind {
            NewWork::Enqueued => {
                if self.control.market().soft_limit() == 0 {
                    // nobody owns execution of an enqueued task; force one
                    // worker through the permit manager
                    if self.mandatory.swap(MANDATORY_GLOBAL, Ordering::SeqCst) != MANDATORY_GLOBAL {
                        self.pool_state.store(SNAPSHOT_FULL, Ordering::SeqCst);
                        self.control.adjust_demand(self, 1, 0);
                        self.waiter_monitor.notify_all();
                        return;
                    }
                } else if self.max_workers.load(Ordering::Relaxed) == 0
                    && self.base_max_workers == 0
                {
                    // workerless arena: oversubscribe a single worker for the
                    // starvation-resistant task
                    self.max_workers.store(1, Ordering::Relaxed);
                    self.mandatory.store(MANDATORY_LOCAL, Ordering::Relaxed);
                    self.pool_state.store(SNAPSHOT_FULL, Ordering::SeqCst);
                    self.control.adjust_demand(self, 0, 1);
                    self.waiter_monitor.notify_all();
                    return;
                }
                fence(Ordering::SeqCst);
            }
            NewWork::Wakeup => fence(Ordering::SeqCst),
            // the spawn path deliberately skips the fence; see `NewWork`
            NewWork::Spawned => {}
        }

        // Double-check idiom. The CAS is unusual in that the result is
        // compared against a value that may differ from the comparand: if we
        // read "busy" but the sweeper released to EMPTY in the meantime, the
        // transition out of EMPTY is retried so exactly one advertiser ends
        // up responsible for requesting workers.
        let snapshot = self.pool_state.load(Ordering::Relaxed);
        if is_busy_or_empty(snapshot) {
            let ordering = match kind {
                NewWork::Spawned => Ordering::Relaxed,
                _ => Ordering::SeqCst,
            };
            let previous = match self.pool_state.compare_exchange(
                snapshot,
                SNAPSHOT_FULL,
                ordering,
                Ordering::Relaxed,
            ) {
                Ok(previous) | Err(previous) => previous,
            };
            if previous != SNAPSHOT_EMPTY {
                return;
            }
            if snapshot != SNAPSHOT_EMPTY
                && self
                    .pool_state
                    .compare_exchange(SNAPSHOT_EMPTY, SNAPSHOT_FULL, ordering, Ordering::Relaxed)
                    .is_err()
            {
                // some other thread took over the empty -> full transition
                return;
            }

            // we moved the pool out of EMPTY and owe the permit manager a
            // demand update
            if matches!(kind, NewWork::Spawned)
                && self.mandatory.load(Ordering::Relaxed) == MANDATORY_LOCAL
                && self.base_max_workers == 0
            {
                // a real parallel region started on the oversubscribed
                // arena; stop forcing the extra worker. Demand was retracted
                // while the pool was EMPTY, so there is nothing to undo.
                self.max_workers.store(0, Ordering::Relaxed);
                self.mandatory.store(MANDATORY_NONE, Ordering::Relaxed);
                return;
            }

            let workers = self.max_workers.load(Ordering::Relaxed);
            let workers = isize::try_from(workers).unwrap_or(isize::MAX);
            self.control.adjust_demand(self, 0, workers);
            self.waiter_monitor.notify_all_relaxed();
        }
    }

    /// Check whether the arena has run dry, transitioning FULL -> EMPTY only
    /// after an unsuccessful sweep of every task pool, mailbox and the FIFO
    /// stream. False negatives (staying FULL) are fine; false positives are
    /// not.
    pub(crate) fn is_out_of_work(self: &Arc<Self>) -> bool {
        loop {
            match self.pool_state.load(Ordering::SeqCst) {
                SNAPSHOT_EMPTY => return true,
                SNAPSHOT_FULL => {
                    if self
                        .pool_state
                        .compare_exchange(
                            SNAPSHOT_FULL,
                            SNAPSHOT_BUSY,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_err()
                    {
                        continue;
                    }

                    if self.sweep_finds_work() {
                        // restore unless an advertiser already re-marked full
                        let _ = self.pool_state.compare_exchange(
                            SNAPSHOT_BUSY,
                            SNAPSHOT_FULL,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        );
                        return false;
                    }

                    if self
                        .pool_state
                        .compare_exchange(
                            SNAPSHOT_BUSY,
                            SNAPSHOT_EMPTY,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        tracing::trace!(epoch = self.aba_epoch, "arena out of work");
                        self.retract_demand();
                        return true;
                    }
                    // an advertiser raced the release; take a fresh snapshot
                }
                _busy => return false,
            }
        }
    }

    /// Whether any deque, mailbox or the stream currently holds work.
    pub(crate) fn has_work(&self) -> bool {
        self.sweep_finds_work()
    }

    fn sweep_finds_work(&self) -> bool {
        if !self.stream.is_empty() {
            return true;
        }
        let limit = self.limit();
        self.slots[..limit]
            .iter()
            .any(|slot| !slot.deque.is_empty() || !slot.inbox.is_empty())
    }

    fn retract_demand(self: &Arc<Self>) {
        let mode = self.mandatory.swap(MANDATORY_NONE, Ordering::SeqCst);
        if mode == MANDATORY_LOCAL && self.base_max_workers == 0 {
            self.max_workers.store(0, Ordering::Relaxed);
        }
        let mandatory_delta = if mode == MANDATORY_GLOBAL { -1 } else { 0 };
        self.control.zero_demand(self, mandatory_delta);
    }

    /// Sources an already-sleeping thread double-checks before committing
    /// its wait.
    pub(crate) fn has_visible_work(&self, slot_index: usize, isolation: usize) -> bool {
        if !self.slots[slot_index].inbox.is_empty() {
            return true;
        }
        if isolation == 0 && !self.stream.is_empty() {
            return true;
        }
        let limit = self.limit();
        self.slots[..limit].iter().any(|slot| !slot.deque.is_empty())
    }

    // --- task sources ---

    pub(crate) fn enqueue_task(self: &Arc<Self>, task: TaskRef, priority: Option<Priority>) {
        let level = priority.unwrap_or(self.priority).level();
        let hint = self.lane_hint.fetch_add(1, Ordering::Relaxed);
        task.set_isolation(0);
        tracing::trace!(task = ?task, level, "task enqueued");
        self.stream.push(task, level, hint);
        self.advertise_new_work(NewWork::Enqueued);
    }

    pub(crate) fn get_stream_task(&self) -> Option<TaskRef> {
        self.stream.pop()
    }

    /// Steal a task for the thief occupying `thief` from a random victim
    /// slot within `[0, limit)`, honoring the thief's isolation token.
    pub(crate) fn steal_task(
        &self,
        thief: usize,
        rng: &mut fastrand::Rng,
        isolation: usize,
    ) -> Option<TaskRef> {
        let limit = self.limit();
        if limit <= 1 {
            return None;
        }

        let start = rng.usize(..limit);
        for offset in 0..limit {
            let victim_index = (start + offset) % limit;
            if victim_index == thief {
                continue;
            }

            let victim = &self.slots[victim_index];
            let mut retries = 0;
            loop {
                match victim.deque.steal() {
                    Steal::Success(entry) => match entry.isolation() {
                        // the proxy was already claimed through the mailbox
                        None => break,
                        Some(token) if token == isolation => {
                            if let Some(task) = entry.claim() {
                                self.steals.fetch_add(1, Ordering::Relaxed);
                                tracing::trace!(victim = victim_index, thief, task = ?task, "stole task");
                                return Some(task);
                            }
                            break;
                        }
                        Some(_) => {
                            // foreign isolation: keep the entry runnable by
                            // migrating it into the thief's own pool, where
                            // its owner region can steal it back
                            //
                            // Safety: the thief occupies its own slot.
                            unsafe { self.slots[thief].deque.push(entry) };
                            break;
                        }
                    },
                    Steal::Empty => break,
                    Steal::Retry => {
                        retries += 1;
                        if retries > 2 {
                            break;
                        }
                        core::hint::spin_loop();
                    }
                }
            }
        }
        None
    }

    // --- observers ---

    pub(crate) fn attach_observer(&self, observer: Arc<dyn ScheduleObserver>) {
        lock(&self.observers).push(observer);
    }

    pub(crate) fn notify_observer_entry(&self, is_worker: bool) {
        let observers: Vec<_> = lock(&self.observers).clone();
        for observer in observers {
            observer.on_scheduler_entry(is_worker);
        }
    }

    pub(crate) fn notify_observer_exit(&self, is_worker: bool) {
        let observers: Vec<_> = lock(&self.observers).clone();
        for observer in observers {
            observer.on_scheduler_exit(is_worker);
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("slots", &self.slots.len())
            .field("reserved", &self.num_reserved)
            .field("epoch", &self.aba_epoch)
            .field("refs", &RefWord::from_bits(self.references.load(Ordering::Relaxed)))
            .finish_non_exhaustive()
    }
}

/// A configurable execution context: a slotted container hosting one team of
/// threads.
///
/// The arena proper is created lazily on first use and torn down when the
/// handle is dropped *and* all its fire-and-forget work has drained.
pub struct TaskArena {
    max_concurrency: usize,
    reserved_for_masters: usize,
    priority: Priority,
    inner: OnceLock<Arc<Arena>>,
}

// === impl TaskArena ===

impl TaskArena {
    /// A new arena with automatic concurrency and one reserved slot.
    pub fn new() -> Self {
        Self::with_concurrency(0, 1)
    }

    /// `max_concurrency` of 0 means one slot per hardware thread.
    /// `reserved_for_masters` slots are only occupiable by external threads.
    pub fn with_concurrency(max_concurrency: usize, reserved_for_masters: usize) -> Self {
        Self {
            max_concurrency,
            reserved_for_masters,
            priority: Priority::Normal,
            inner: OnceLock::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Eagerly initialize the arena instead of deferring to first use.
    pub fn initialize(&self) {
        let _ = self.arena();
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.get().is_some()
    }

    /// The concurrency level this arena was (or would be) initialized with.
    pub fn max_concurrency(&self) -> usize {
        match self.max_concurrency {
            0 => crate::control::default_concurrency(),
            explicit => explicit,
        }
    }

    pub(crate) fn arena(&self) -> &Arc<Arena> {
        self.inner.get_or_init(|| {
            let control = ThreadingControl::register_public_reference();
            let arena = Arena::new(
                control.clone(),
                self.max_concurrency(),
                self.reserved_for_masters,
                self.priority,
            );
            control.register_arena(&arena);
            arena
        })
    }

    /// Execute `f` inside this arena on the calling thread, joining a
    /// reserved slot if possible; otherwise the work is delegated into the
    /// arena and the calling thread blocks until it completed.
    ///
    /// Re-entering the arena the thread is already attached to runs `f`
    /// in place without changing the thread's slot index.
    pub fn execute<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        let arena = self.arena().clone();

        if crate::scheduler::current_arena_is(&arena) {
            return f();
        }

        arena.add_external_ref();
        let index = arena.occupy_free_slot(false);
        let result = if index != OUT_OF_ARENA {
            crate::scheduler::run_in_slot(&arena, index, f)
        } else {
            crate::scheduler::delegate_execute(&arena, f)
        };
        arena.on_thread_leaving(RefKind::External);
        result
    }

    /// Fire-and-forget: enqueue `f` into the arena's FIFO stream. The task
    /// runs eventually even if this thread never calls back into the
    /// runtime.
    pub fn enqueue<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue_with_priority(f, None);
    }

    pub fn enqueue_with_priority<F>(&self, f: F, priority: impl Into<Option<Priority>>)
    where
        F: FnOnce() + Send + 'static,
    {
        let arena = self.arena().clone();
        // inherits the caller's context inside the runtime; outside, the
        // builder creates a fresh isolated one, so a panicking
        // fire-and-forget task cannot poison unrelated work
        let handle = crate::task::TaskBuilder::root().build(f);
        Self::enqueue_parts(&arena, handle, priority.into());
    }

    /// Enqueue an explicitly built task.
    pub fn enqueue_handle(&self, handle: TaskHandle, priority: impl Into<Option<Priority>>) {
        let arena = self.arena().clone();
        Self::enqueue_parts(&arena, handle, priority.into());
    }

    fn enqueue_parts(arena: &Arc<Arena>, handle: TaskHandle, priority: Option<Priority>) {
        let (task, gate) = handle.into_parts();
        if let Some(gate) = gate {
            // a gated task starts through its continuation vertex; dropping
            // the launch reference arms it
            gate.release();
            return;
        }
        if let Some(task) = task {
            arena.enqueue_task(task, priority);
        }
    }

    /// Attach an observer whose entry/exit hooks fire exactly once per slot
    /// occupancy cycle.
    pub fn attach_observer(&self, observer: Arc<dyn ScheduleObserver>) {
        self.arena().attach_observer(observer);
    }

    /// Diagnostic: number of workers currently servicing the arena.
    #[doc(hidden)]
    pub fn active_workers(&self) -> usize {
        self.inner
            .get()
            .map_or(0, |arena| arena.num_workers_active())
    }
}

impl Default for TaskArena {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskArena")
            .field("max_concurrency", &self.max_concurrency)
            .field("reserved_for_masters", &self.reserved_for_masters)
            .field("priority", &self.priority)
            .field("initialized", &self.inner.get().is_some())
            .finish()
    }
}

impl Drop for TaskArena {
    fn drop(&mut self) {
        if let Some(arena) = self.inner.take() {
            arena.on_thread_leaving(RefKind::External);
        }
    }
}

static_assertions::assert_impl_all!(TaskArena: Send, Sync);
static_assertions::assert_impl_all!(Arena: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(loom))]
    #[test]
    fn slot_occupancy_respects_reservation() {
        let control = ThreadingControl::acquire();
        let arena = Arena::new(control, 4, 1, Priority::Normal);

        // workers skip the reserved range
        assert_eq!(arena.occupy_free_slot(true), 1);
        assert_eq!(arena.occupy_free_slot(true), 2);
        assert_eq!(arena.occupy_free_slot(true), 3);
        assert_eq!(arena.occupy_free_slot(true), OUT_OF_ARENA);

        // the external thread still gets the reserved slot
        assert_eq!(arena.occupy_free_slot(false), 0);
        assert_eq!(arena.limit(), 4);

        arena.release_slot(2);
        // an external thread falls back past the reserved range
        assert_eq!(arena.occupy_free_slot(false), 2);

        for index in 0..4 {
            arena.release_slot(index);
        }
        // keep the registry clean for other tests
        arena.on_thread_leaving(RefKind::External);
    }

    #[cfg(not(loom))]
    #[test]
    fn reference_word_splits_external_and_workers() {
        let control = ThreadingControl::acquire();
        let arena = Arena::new(control, 4, 1, Priority::Normal);

        assert_eq!(arena.num_workers_active(), 0);
        arena.set_allotted(2);
        assert!(arena.try_join_worker());
        assert!(arena.try_join_worker());
        // the allotment is exhausted
        assert!(!arena.try_join_worker());
        assert_eq!(arena.num_workers_active(), 2);

        arena.on_thread_leaving(RefKind::Worker);
        arena.on_thread_leaving(RefKind::Worker);
        assert_eq!(arena.num_workers_active(), 0);
        arena.on_thread_leaving(RefKind::External);
    }

    #[cfg(not(loom))]
    #[test]
    fn stealing_takes_the_oldest_task_and_is_counted() {
        let control = ThreadingControl::acquire();
        let arena = Arena::new(control, 4, 1, Priority::Normal);

        let victim = arena.occupy_free_slot(true);
        let thief = arena.occupy_free_slot(true);
        assert!(arena.slot(victim).is_occupied());
        assert_eq!(arena.num_reserved(), 1);

        let log = std::sync::Arc::new(crate::loom::sync::Mutex::new(Vec::new()));
        for value in 0..3_u32 {
            let log = log.clone();
            let handle = crate::task::TaskBuilder::root().build(move || {
                lock(&log).push(value);
            });
            let (task, _gate) = handle.into_parts();
            let task = task.expect("freshly built handle owns its task");
            // Safety: this test thread acts as the victim slot's occupant.
            unsafe {
                arena
                    .slot(victim)
                    .deque
                    .push(Box::new(crate::slot::PoolEntry::Direct(task)));
            }
        }

        let mut rng = fastrand::Rng::with_seed(7);
        let stolen = arena
            .steal_task(thief, &mut rng, 0)
            .expect("two busy slots, one full deque");
        assert_eq!(arena.steal_count(), 1);

        if let Some(body) = stolen.take_body() {
            let _ = body();
        }
        // stealing is FIFO: the oldest task comes out first
        assert_eq!(lock(&log).as_slice(), &[0]);

        arena.release_slot(victim);
        arena.release_slot(thief);
        arena.on_thread_leaving(RefKind::External);
    }
}
