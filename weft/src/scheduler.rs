// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-thread dispatch loop.
//!
//! Every thread that executes tasks (a worker driven by the dispatcher, or
//! any thread inside a nested wait) runs the same state machine: drain the
//! affinity inbox, pop the local deque LIFO, pull from the FIFO stream,
//! steal from a random peer, and only then consider sleeping, with a
//! double-check of all four sources under the monitor's prepare/commit
//! protocol.

use crate::arena::{Arena, NewWork, OUT_OF_ARENA, RefKind};
use crate::context::TaskGroupContext;
use crate::control::{ThreadSync, ThreadingControl};
use crate::error::{SpawnError, UserAbort, WaitError};
use crate::mailbox::ProxyCell;
use crate::monitor::WaitNode;
use crate::slot::PoolEntry;
use crate::task::{LatchWaiter, TaskHandle, TaskRef, WaitVertex};
use crate::util::{Backoff, lock};
use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-thread scheduler state.
struct ThreadData {
    is_worker: bool,
    arena: Option<Arc<Arena>>,
    slot: usize,
    rng: fastrand::Rng,
    /// Isolation token of the innermost `isolate` region, zero outside.
    isolation: usize,
    current_task: Option<TaskRef>,
    current_ctx: Option<TaskGroupContext>,
    /// Implicit wait scope of a `TaskArena::execute` invocation.
    scope_vertex: Option<Arc<WaitVertex>>,
    /// Tags of vertices this thread is currently waiting on, for detecting
    /// recursive waits.
    waiting_on: Vec<usize>,
    monitor_node: Arc<WaitNode>,
    sync: Arc<ThreadSync>,
    control: Option<Arc<ThreadingControl>>,
}

impl ThreadData {
    fn new() -> Box<Self> {
        Box::new(Self {
            is_worker: false,
            arena: None,
            slot: 0,
            rng: fastrand::Rng::new(),
            isolation: 0,
            current_task: None,
            current_ctx: None,
            scope_vertex: None,
            waiting_on: Vec::new(),
            monitor_node: WaitNode::new(),
            sync: ThreadSync::new(),
            control: None,
        })
    }

    fn ensure_registered(&mut self, control: &Arc<ThreadingControl>) {
        if self.control.is_none() {
            control.register_thread(self.sync.clone());
            self.control = Some(control.clone());
        }
    }
}

impl Drop for ThreadData {
    fn drop(&mut self) {
        if let Some(control) = self.control.take() {
            control.unregister_thread(&self.sync);
        }
    }
}

std::thread_local! {
    static CURRENT: RefCell<Option<Box<ThreadData>>> = const { RefCell::new(None) };
}

/// Run `f` with the calling thread's scheduler state.
///
/// Never invoke user code or re-entrant runtime operations from inside the
/// closure; the state is borrowed for its duration.
fn with_td<R>(f: impl FnOnce(&mut ThreadData) -> R) -> R {
    CURRENT.with(|cell| {
        let mut slot = cell.borrow_mut();
        let td = slot.get_or_insert_with(ThreadData::new);
        f(td)
    })
}

// === worker plumbing ===

pub(crate) fn register_worker_thread(control: &Arc<ThreadingControl>, index: usize) {
    let _ = index;
    with_td(|td| {
        td.is_worker = true;
        td.ensure_registered(control);
    });
}

pub(crate) fn unregister_worker_thread(control: &Arc<ThreadingControl>) {
    let _ = control;
    CURRENT.with(|cell| cell.borrow_mut().take());
}

pub(crate) fn is_worker_thread() -> bool {
    with_td(|td| td.is_worker)
}

/// Drive the dispatch loop on `arena` as a worker until it runs out of work
/// or this worker is revoked. Pairs the worker reference taken by
/// `try_join_worker` with the leave at the end.
pub(crate) fn process_worker(arena: &Arc<Arena>) {
    let index = arena.occupy_free_slot(true);
    if index == OUT_OF_ARENA {
        arena.on_thread_leaving(RefKind::Worker);
        return;
    }

    let _span = tracing::debug_span!("arena process", slot = index).entered();
    with_td(|td| {
        td.arena = Some(arena.clone());
        td.slot = index;
        td.current_ctx = Some(arena.default_context().clone());
    });
    arena.notify_observer_entry(true);

    let mut backoff = Backoff::new();
    loop {
        if let Some(task) = next_task() {
            execute_task(task);
            backoff.reset();
            continue;
        }
        if arena.num_workers_active() > arena.allotted() {
            tracing::trace!(slot = index, "worker revoked by allotment");
            break;
        }
        if arena.is_out_of_work() {
            break;
        }
        backoff.spin();
    }

    arena.notify_observer_exit(true);
    with_td(|td| {
        td.arena = None;
        td.current_ctx = None;
        td.scope_vertex = None;
    });
    arena.release_slot(index);
    arena.on_thread_leaving(RefKind::Worker);
}

// === the dispatch loop proper ===

/// Find the next task: mailbox -> local deque -> FIFO stream -> steal.
fn next_task() -> Option<TaskRef> {
    let snapshot = with_td(|td| {
        td.arena
            .clone()
            .map(|arena| (arena, td.slot, td.isolation))
    });
    let (arena, slot_index, isolation) = snapshot?;
    let slot = arena.slot(slot_index);

    // 1. affinity inbox, highest preference on local
    loop {
        let Some(cell) = slot.inbox.pop() else { break };
        match cell.isolation() {
            // the pooled copy won the race; the proxy is free to drop
            None => continue,
            Some(token) if token == isolation => {
                if let Some(task) = cell.claim() {
                    return Some(task);
                }
            }
            Some(_) => {
                // mailed under a different isolation: park it in the pool
                // where the owning region can steal it back
                //
                // Safety: this thread occupies the slot.
                unsafe { slot.deque.push(Box::new(PoolEntry::Mailed(cell))) };
                break;
            }
        }
    }

    // 2. local deque, LIFO for cache locality
    loop {
        // Safety: this thread occupies the slot.
        let Some(entry) = (unsafe { slot.deque.pop_local() }) else {
            break;
        };
        match entry.isolation() {
            None => continue,
            Some(token) if token == isolation => {
                if let Some(task) = entry.claim() {
                    return Some(task);
                }
            }
            Some(_) => {
                // leave foreign-isolation work in the pool
                //
                // Safety: this thread occupies the slot.
                unsafe { slot.deque.push(entry) };
                break;
            }
        }
    }

    // 3. the FIFO stream, for starvation resistance
    if isolation == 0 {
        if let Some(task) = arena.get_stream_task() {
            return Some(task);
        }
    }

    // 4. steal from a random victim
    with_td(|td| {
        let arena = td.arena.clone()?;
        arena.steal_task(td.slot, &mut td.rng, td.isolation)
    })
}

/// Run one task, looping on bypassed successors.
fn execute_task(mut task: TaskRef) {
    loop {
        let ctx = task.context().clone();

        let previous = with_td(|td| {
            if let Some(arena) = &td.arena {
                arena.slot(td.slot).inbox_idle.store(false, Ordering::Relaxed);
            }
            task.set_isolation(td.isolation);
            (
                core::mem::replace(&mut td.current_task, Some(task.clone())),
                core::mem::replace(&mut td.current_ctx, Some(ctx.clone())),
            )
        });

        // cancellation sampling point: a task whose group was cancelled is
        // finalized without running its body
        let mut bypass = None;
        if ctx.is_group_execution_cancelled() {
            tracing::trace!(task = ?task, "skipping body of cancelled task");
        } else if let Some(body) = task.take_body() {
            // the group priority is re-read lazily, at every execute entry
            tracing::trace!(task = ?task, priority = ?ctx.priority(), "executing task");
            match catch_unwind(AssertUnwindSafe(body)) {
                Ok(next) => bypass = next,
                Err(payload) => {
                    // first capture wins; the bound chain is cancelled so
                    // descendants stop at their next entry and the chain
                    // root's waiter rethrows
                    tracing::trace!(task = ?task, "task body panicked");
                    ctx.capture_panic(payload);
                }
            }
        }

        // finalize: the parent wait vertex loses this task's reference
        if let Some(parent) = task.take_parent() {
            parent.release();
        }

        with_td(|td| {
            td.current_task = previous.0;
            td.current_ctx = previous.1;
        });

        match bypass.map(TaskHandle::into_parts) {
            // tail-chain straight into the successor, no deque round-trip
            Some((Some(next), None)) => task = next,
            // a gated successor starts through its continuation vertex
            Some((_, Some(gate))) => {
                gate.release();
                break;
            }
            _ => break,
        }
    }
}

// === waiting ===

/// Dispatch on the current arena until `vertex` completes.
pub(crate) fn local_wait_for_all(vertex: Arc<WaitVertex>) -> Result<(), WaitError> {
    let arena = with_td(|td| td.arena.clone()).ok_or(WaitError::MissingWait)?;
    let tag = vertex.tag();

    if with_td(|td| td.waiting_on.contains(&tag)) {
        return Err(WaitError::ImproperLock);
    }
    with_td(|td| td.waiting_on.push(tag));
    debug_assert!(!vertex.has_waiter(), "a latch supports a single waiter");
    vertex.set_waiter(LatchWaiter {
        arena: arena.clone(),
        exit_monitor: false,
    });

    tracing::trace!(
        vertex = tag,
        may_have_children = with_td(|td| td.current_ctx.as_ref().is_some_and(TaskGroupContext::may_have_children)),
        cancellation_epoch = with_td(|td| td.sync.context_epoch.load(Ordering::Acquire)),
        "entering nested wait"
    );

    let mut backoff = Backoff::new();
    let mut aborted = false;
    while !vertex.done() {
        if let Some(task) = next_task() {
            execute_task(task);
            backoff.reset();
            continue;
        }
        if arena.is_out_of_work() {
            match cooperative_sleep(&arena, &vertex, tag) {
                Ok(()) => {}
                Err(UserAbort(())) => {
                    aborted = true;
                    break;
                }
            }
        } else {
            backoff.spin();
        }
    }

    vertex.clear_waiter();
    with_td(|td| td.waiting_on.retain(|&waited| waited != tag));

    if aborted {
        return Err(WaitError::Aborted);
    }
    wait_outcome()
}

/// Sleep on the arena's monitor, double-checking the vertex and all four
/// task sources between prepare and commit so no wakeup can be missed.
fn cooperative_sleep(
    arena: &Arc<Arena>,
    vertex: &Arc<WaitVertex>,
    tag: usize,
) -> Result<(), UserAbort> {
    let (node, slot_index, isolation) =
        with_td(|td| (td.monitor_node.clone(), td.slot, td.isolation));
    let monitor = arena.waiter_monitor();

    monitor.prepare_wait(&node, tag);
    if vertex.done() || arena.has_visible_work(slot_index, isolation) {
        monitor.cancel_wait(&node);
        return Ok(());
    }

    arena
        .slot(slot_index)
        .inbox_idle
        .store(true, Ordering::Relaxed);
    let result = monitor.commit_wait(&node).map(|_| ());
    arena
        .slot(slot_index)
        .inbox_idle
        .store(false, Ordering::Relaxed);
    result
}

/// Translate the current context's state into the wait result: captured
/// panics are resumed at the waiting call site, explicit cancellation is
/// reported as an error.
fn wait_outcome() -> Result<(), WaitError> {
    let ctx = with_td(|td| td.current_ctx.clone());
    let Some(ctx) = ctx else {
        return Ok(());
    };
    if ctx.has_exception() {
        if let Some(payload) = ctx.take_exception() {
            resume_unwind(payload);
        }
    }
    if ctx.is_group_execution_cancelled() {
        return Err(WaitError::Cancelled);
    }
    Ok(())
}

/// Wait for the current scope's children. Without a scope (no children were
/// ever allocated) this is a no-op.
pub(crate) fn wait_for_all() -> Result<(), WaitError> {
    let vertex = with_td(|td| match &td.current_task {
        Some(task) => task.existing_child_vertex(),
        None => td.scope_vertex.clone(),
    });
    match vertex {
        Some(vertex) => local_wait_for_all(vertex),
        None => Ok(()),
    }
}

// === spawning ===

/// The wait scope children of the calling thread attach to: the innermost
/// executing task's child latch, or the `execute` invocation's implicit
/// latch. `None` off the scheduler.
pub(crate) fn current_scope_vertex() -> Option<Arc<WaitVertex>> {
    with_td(|td| {
        if td.arena.is_none() {
            return None;
        }
        match &td.current_task {
            Some(task) => Some(task.child_vertex()),
            None => Some(
                td.scope_vertex
                    .get_or_insert_with(WaitVertex::latch)
                    .clone(),
            ),
        }
    })
}

/// Steal the current task's parent vertex for a continuation task.
pub(crate) fn take_current_parent() -> Option<Arc<WaitVertex>> {
    with_td(|td| td.current_task.as_ref().and_then(TaskRef::take_parent))
}

pub(crate) fn current_context() -> Option<TaskGroupContext> {
    with_td(|td| td.current_ctx.clone())
}

pub(crate) fn current_arena_is(arena: &Arc<Arena>) -> bool {
    with_td(|td| td.arena.as_ref().is_some_and(|current| Arc::ptr_eq(current, arena)))
}

pub(crate) fn current_slot_index() -> Option<usize> {
    with_td(|td| td.arena.is_some().then_some(td.slot))
}

/// Spawn a built task into the calling thread's slot.
pub(crate) fn spawn_handle(handle: TaskHandle) -> Result<(), SpawnError> {
    if with_td(|td| td.arena.is_none()) {
        return Err(SpawnError::MissingWait);
    }

    let (task, gate) = handle.into_parts();
    if let Some(gate) = gate {
        // dropping the launch reference arms the continuation vertex; the
        // task is submitted once every predecessor finished
        gate.release();
        return Ok(());
    }
    let Some(task) = task else { return Ok(()) };
    spawn_ref(task);
    Ok(())
}

/// Like [`spawn_handle`], but a parentless task is first attached to the
/// current wait scope so `wait_for_all` covers it.
pub(crate) fn spawn_handle_tracked(handle: TaskHandle) -> Result<(), SpawnError> {
    if with_td(|td| td.arena.is_none()) {
        return Err(SpawnError::MissingWait);
    }

    let (task, gate) = handle.into_parts();
    if let Some(gate) = gate {
        gate.release();
        return Ok(());
    }
    let Some(task) = task else { return Ok(()) };

    if task.existing_parent().is_none() {
        if let Some(scope) = current_scope_vertex() {
            scope.reserve();
            task.set_parent(Some(scope));
        }
    }
    spawn_ref(task);
    Ok(())
}

/// Push a runnable task into the current slot; tasks with a foreign
/// affinity are additionally mailed to the target slot's inbox.
fn spawn_ref(task: TaskRef) {
    let arena = with_td(|td| {
        let arena = td.arena.clone()?;
        let slot_index = td.slot;
        task.set_isolation(td.isolation);
        let slot = arena.slot(slot_index);

        match task.affinity() {
            Some(target) if target != slot_index && target < arena.num_slots() => {
                let cell = ProxyCell::new(task.clone());
                // Safety: this thread occupies the slot.
                unsafe { slot.deque.push(Box::new(PoolEntry::Mailed(cell.clone()))) };
                arena.slot(target).inbox.push(cell);
                tracing::trace!(task = ?task, target, "task spawned with affinity");
            }
            _ => {
                tracing::trace!(task = ?task, slot = slot_index, "task spawned");
                // Safety: this thread occupies the slot.
                unsafe { slot.deque.push(Box::new(PoolEntry::Direct(task.clone()))) };
            }
        }
        Some(arena)
    });

    if let Some(arena) = arena {
        arena.advertise_new_work(NewWork::Spawned);
    }
}

/// Submission point for continuation vertices firing: push locally when the
/// releasing thread has a slot, fall back to the default arena's stream
/// otherwise (the release may happen on a plain application thread).
pub(crate) fn submit(task: TaskRef) {
    if with_td(|td| td.arena.is_some()) {
        spawn_ref(task);
    } else {
        crate::control::default_arena().enqueue_task(task, None);
    }
}

// === external-thread entry points ===

struct ThreadBinding {
    arena: Option<Arc<Arena>>,
    slot: usize,
    ctx: Option<TaskGroupContext>,
    scope: Option<Arc<WaitVertex>>,
    task: Option<TaskRef>,
    isolation: usize,
}

struct SlotGuard {
    arena: Arc<Arena>,
    index: usize,
    previous: Option<ThreadBinding>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.arena.notify_observer_exit(false);
        if let Some(previous) = self.previous.take() {
            with_td(|td| {
                td.arena = previous.arena;
                td.slot = previous.slot;
                td.current_ctx = previous.ctx;
                td.scope_vertex = previous.scope;
                td.current_task = previous.task;
                td.isolation = previous.isolation;
            });
        }
        self.arena.release_slot(self.index);
    }
}

/// Bind the calling thread to an occupied slot, run `f`, restore the
/// previous binding, also on unwind.
pub(crate) fn run_in_slot<F, R>(arena: &Arc<Arena>, index: usize, f: F) -> R
where
    F: FnOnce() -> R,
{
    let control = arena.control().clone();
    let previous = with_td(|td| {
        td.ensure_registered(&control);
        let previous = ThreadBinding {
            arena: td.arena.take(),
            slot: td.slot,
            ctx: td.current_ctx.take(),
            scope: td.scope_vertex.take(),
            task: td.current_task.take(),
            isolation: core::mem::replace(&mut td.isolation, 0),
        };
        td.arena = Some(arena.clone());
        td.slot = index;
        // a fresh context per `execute` scope, so a panic captured below it
        // cannot poison unrelated later work on this arena
        td.current_ctx = Some(TaskGroupContext::new());
        previous
    });

    arena.notify_observer_entry(false);
    let _guard = SlotGuard {
        arena: arena.clone(),
        index,
        previous: Some(previous),
    };
    f()
}

/// Pointer wrapper for handing borrowed delegated work to a `'static` task
/// body. Sound because the delegating thread blocks until the work's latch
/// completed.
struct SendPtr(*const ());

// Safety: see `SendPtr`; the pointee outlives every access.
unsafe impl Send for SendPtr {}

/// Borrowed state of one delegated `execute` call, reached from the task
/// body through a type-erased pointer.
struct DelegatedShell<F, R> {
    func: crate::loom::sync::Mutex<Option<F>>,
    result: crate::loom::sync::Mutex<Option<R>>,
}

/// Monomorphic entry point the `'static` task body calls; keeps the body's
/// closure free of the (non-`'static`) `F` and `R` parameters.
///
/// # Safety
///
/// `raw` must point at the live [`DelegatedShell`] of a delegating call that
/// is still blocked on its latch.
#[expect(
    clippy::cast_ptr_alignment,
    reason = "the pointer was erased from a correctly aligned shell"
)]
unsafe fn run_delegated<F, R>(raw: *const ())
where
    F: FnOnce() -> R,
{
    // Safety: ensured by caller.
    let shell = unsafe { &*raw.cast::<DelegatedShell<F, R>>() };
    if let Some(func) = lock(&shell.func).take() {
        let result = func();
        *lock(&shell.result) = Some(result);
    }
}

/// `TaskArena::execute` fallback when no reserved slot is free: wrap `f`
/// into a task, enqueue it, and block on the arena's exit monitor until it
/// ran inside the arena.
pub(crate) fn delegate_execute<F, R>(arena: &Arc<Arena>, f: F) -> R
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    let shell = DelegatedShell::<F, R> {
        func: crate::loom::sync::Mutex::new(Some(f)),
        result: crate::loom::sync::Mutex::new(None),
    };

    let latch = WaitVertex::latch();
    latch.reserve();
    latch.set_waiter(LatchWaiter {
        arena: arena.clone(),
        exit_monitor: true,
    });
    let tag = latch.tag();

    let ctx = TaskGroupContext::new();
    let shell_ptr = SendPtr(core::ptr::from_ref(&shell).cast::<()>());
    let runner: unsafe fn(*const ()) = run_delegated::<F, R>;
    let handle = crate::task::TaskBuilder::root()
        .context(&ctx)
        .build(move || {
            let shell_ptr = shell_ptr;
            // Safety: the delegating thread blocks on the latch until this
            // body (and its finalize) completed, keeping the shell alive.
            unsafe { runner(shell_ptr.0) }
        });

    let (task, _gate) = handle.into_parts();
    if let Some(task) = task {
        task.set_parent(Some(latch.clone()));
        tracing::trace!(vertex = tag, "delegating execute into the arena");
        arena.enqueue_task(task, None);
    }

    let node = WaitNode::new();
    let monitor = arena.exit_monitor();
    while !latch.done() {
        monitor.prepare_wait(&node, tag);
        if latch.done() {
            monitor.cancel_wait(&node);
            break;
        }
        // an abort is just another wakeup here; the latch decides
        let _ = monitor.commit_wait(&node);
    }
    latch.clear_waiter();

    if ctx.has_exception() {
        if let Some(payload) = ctx.take_exception() {
            resume_unwind(payload);
        }
    }
    lock(&shell.result)
        .take()
        .expect("delegated work completed without result or exception")
}

// === isolation ===

static NEXT_ISOLATION_TOKEN: AtomicUsize = AtomicUsize::new(1);

struct IsolationGuard(usize);

impl Drop for IsolationGuard {
    fn drop(&mut self) {
        let token = self.0;
        with_td(|td| td.isolation = token);
    }
}

/// Run `f` under a fresh isolation token: tasks spawned inside are only
/// executed by threads in the same region, so a nested wait cannot consume
/// a sibling algorithm's tasks and reverse the wait order.
pub(crate) fn isolate<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let token = NEXT_ISOLATION_TOKEN.fetch_add(1, Ordering::Relaxed);
    let previous = with_td(|td| core::mem::replace(&mut td.isolation, token));
    let _guard = IsolationGuard(previous);
    f()
}
