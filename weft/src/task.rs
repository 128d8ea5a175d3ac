// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tasks, wait vertices and task handles.
//!
//! A [`Task`] is a heap-allocated, run-at-most-once unit of work. Its parent
//! back-reference is a [`WaitVertex`], an abstract ref-counted endpoint,
//! rather than another task: plain waits use a latch vertex the waiting
//! thread observes, and predecessor links share a continuation vertex that
//! releases the gated task once every predecessor finished.

use crate::context::TaskGroupContext;
use crate::error::{SpawnError, WaitError};
use crate::loom::sync::Mutex;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::util::lock;
use core::fmt;
use std::sync::Arc;

/// The function form of a task body: runs once, optionally bypassing
/// directly to a next task.
pub(crate) type TaskBody = Box<dyn FnOnce() -> Option<TaskHandle> + Send + 'static>;

/// Where a completed latch vertex delivers its notification.
#[derive(Debug, Clone)]
pub(crate) struct LatchWaiter {
    pub(crate) arena: Arc<crate::arena::Arena>,
    /// Notify the arena's exit monitor (delegated `execute` waits) instead
    /// of the dispatch-wait monitor.
    pub(crate) exit_monitor: bool,
}

#[derive(Debug)]
enum VertexKind {
    /// A waiting thread's reference vertex; reaching zero marks the wait
    /// done and notifies the registered waiter.
    Latch(Mutex<Option<LatchWaiter>>),
    /// Reaching zero submits the stored task for execution.
    Continuation(Mutex<Option<TaskRef>>),
}

/// An abstract wait endpoint with a `reserve`/`release` ref-count interface.
#[derive(Debug)]
pub(crate) struct WaitVertex {
    refs: AtomicUsize,
    kind: VertexKind,
}

// === impl WaitVertex ===

impl WaitVertex {
    /// A latch for a thread to wait on. Starts at zero; child allocation
    /// reserves it. Reserving from zero is legal for latches as long as the
    /// owner has not started waiting yet.
    pub(crate) fn latch() -> Arc<Self> {
        Arc::new(Self {
            refs: AtomicUsize::new(0),
            kind: VertexKind::Latch(Mutex::new(None)),
        })
    }

    /// A continuation vertex gating `task`. Starts with one reference, the
    /// launch reference, released when the gated handle is spawned, so the
    /// vertex cannot fire while predecessors are still being linked.
    pub(crate) fn continuation(task: TaskRef) -> Arc<Self> {
        Arc::new(Self {
            refs: AtomicUsize::new(1),
            kind: VertexKind::Continuation(Mutex::new(Some(task))),
        })
    }

    pub(crate) fn reserve(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference; the transition to zero happens exactly once and
    /// triggers completion.
    pub(crate) fn release(self: &Arc<Self>) {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "wait vertex released below zero");
        if previous == 1 {
            self.complete();
        }
    }

    pub(crate) fn done(&self) -> bool {
        self.refs.load(Ordering::Acquire) == 0
    }

    /// Identity of this vertex for monitor contexts.
    pub(crate) fn tag(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    /// Register the thread that will sleep on this latch. One waiter at a
    /// time; recursive waits are rejected earlier with
    /// [`WaitError::ImproperLock`].
    pub(crate) fn set_waiter(&self, waiter: LatchWaiter) {
        match &self.kind {
            VertexKind::Latch(slot) => *lock(slot) = Some(waiter),
            VertexKind::Continuation(_) => {
                debug_assert!(false, "cannot wait on a continuation vertex")
            }
        }
    }

    pub(crate) fn clear_waiter(&self) {
        if let VertexKind::Latch(slot) = &self.kind {
            *lock(slot) = None;
        }
    }

    pub(crate) fn has_waiter(&self) -> bool {
        match &self.kind {
            VertexKind::Latch(slot) => lock(slot).is_some(),
            VertexKind::Continuation(_) => false,
        }
    }

    /// Remove the gated task so a dropped handle cannot be revived by its
    /// predecessors finishing later.
    pub(crate) fn disarm(&self) -> Option<TaskRef> {
        match &self.kind {
            VertexKind::Continuation(slot) => lock(slot).take(),
            VertexKind::Latch(_) => None,
        }
    }

    fn complete(self: &Arc<Self>) {
        match &self.kind {
            VertexKind::Latch(slot) => {
                let waiter = lock(slot).clone();
                if let Some(waiter) = waiter {
                    let tag = self.tag();
                    tracing::trace!(vertex = tag, "latch completed, notifying waiter");
                    if waiter.exit_monitor {
                        waiter.arena.exit_monitor().notify_where(|ctx| ctx == tag);
                    } else {
                        waiter.arena.waiter_monitor().notify_where(|ctx| ctx == tag);
                    }
                }
            }
            VertexKind::Continuation(slot) => {
                let task = lock(slot).take();
                if let Some(task) = task {
                    tracing::trace!(task = ?task, "continuation vertex fired");
                    crate::scheduler::submit(task);
                }
            }
        }
    }
}

/// A heap-allocated unit of work.
pub(crate) struct Task {
    body: Mutex<Option<TaskBody>>,
    /// The wait vertex released when this task finalizes.
    parent: Mutex<Option<Arc<WaitVertex>>>,
    context: TaskGroupContext,
    /// Slot affinity hint: slot index + 1, zero meaning none.
    affinity: AtomicUsize,
    /// Isolation token of the spawning nested wait, captured at spawn.
    isolation: AtomicUsize,
    /// Lazily created latch this task's children reserve.
    child_vertex: Mutex<Option<Arc<WaitVertex>>>,
}

/// A cloneable reference to a spawned or not-yet-spawned [`Task`].
#[derive(Clone)]
pub(crate) struct TaskRef(Arc<Task>);

// === impl TaskRef ===

impl TaskRef {
    fn new(body: TaskBody, context: TaskGroupContext, affinity: Option<usize>) -> Self {
        Self(Arc::new(Task {
            body: Mutex::new(Some(body)),
            parent: Mutex::new(None),
            context,
            affinity: AtomicUsize::new(affinity.map_or(0, |slot| slot + 1)),
            isolation: AtomicUsize::new(0),
            child_vertex: Mutex::new(None),
        }))
    }

    pub(crate) fn context(&self) -> &TaskGroupContext {
        &self.0.context
    }

    /// Take the body out for execution; `None` if the task already ran.
    pub(crate) fn take_body(&self) -> Option<TaskBody> {
        lock(&self.0.body).take()
    }

    pub(crate) fn set_parent(&self, vertex: Option<Arc<WaitVertex>>) -> Option<Arc<WaitVertex>> {
        core::mem::replace(&mut *lock(&self.0.parent), vertex)
    }

    pub(crate) fn take_parent(&self) -> Option<Arc<WaitVertex>> {
        lock(&self.0.parent).take()
    }

    pub(crate) fn existing_parent(&self) -> Option<Arc<WaitVertex>> {
        lock(&self.0.parent).clone()
    }

    /// The latch this task's children reserve, created on first use.
    pub(crate) fn child_vertex(&self) -> Arc<WaitVertex> {
        let mut slot = lock(&self.0.child_vertex);
        slot.get_or_insert_with(WaitVertex::latch).clone()
    }

    pub(crate) fn existing_child_vertex(&self) -> Option<Arc<WaitVertex>> {
        lock(&self.0.child_vertex).clone()
    }

    pub(crate) fn affinity(&self) -> Option<usize> {
        self.0.affinity.load(Ordering::Relaxed).checked_sub(1)
    }

    pub(crate) fn isolation(&self) -> usize {
        self.0.isolation.load(Ordering::Relaxed)
    }

    pub(crate) fn set_isolation(&self, token: usize) {
        self.0.isolation.store(token, Ordering::Relaxed);
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("addr", &Arc::as_ptr(&self.0))
            .field("affinity", &self.affinity())
            .finish()
    }
}

/// Unique-owning handle to an unlaunched task.
///
/// Transferable between threads; [`spawn`] (or
/// [`TaskArena::enqueue_handle`](crate::TaskArena::enqueue_handle)) consumes
/// it exactly once. Dropping an unlaunched handle finalizes the task without
/// running it.
pub struct TaskHandle {
    task: Option<TaskRef>,
    /// The continuation vertex gating this task, installed by the first
    /// predecessor link.
    gate: Option<Arc<WaitVertex>>,
}

// === impl TaskHandle ===

impl TaskHandle {
    fn new(task: TaskRef) -> Self {
        Self {
            task: Some(task),
            gate: None,
        }
    }

    /// Make `predecessor` a prerequisite of this task.
    ///
    /// On first use this installs a continuation vertex and retargets the
    /// task's start behind it; `predecessor`'s completion is folded into the
    /// same vertex. After linking, spawning this handle alone is not enough
    /// to start the task: the vertex must reach zero, which also requires
    /// every linked predecessor to finish.
    ///
    /// Linking the same pair twice is well-defined and keeps a single
    /// continuation vertex.
    pub fn add_predecessor(&mut self, predecessor: &mut TaskHandle) {
        let (Some(task), Some(pred)) = (self.task.clone(), predecessor.task.clone()) else {
            return;
        };

        let gate = self
            .gate
            .get_or_insert_with(|| WaitVertex::continuation(task))
            .clone();

        // reserve for the new predecessor before rewiring, so the vertex can
        // never transiently hit zero
        gate.reserve();
        let old = pred.set_parent(Some(gate.clone()));
        if let Some(old) = old {
            // if the predecessor already pointed at this gate (double link),
            // this release undoes the extra reservation; otherwise it hands
            // the predecessor's previous completion target back
            old.release();
        }
    }

    /// Whether the handle still owns a task.
    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    pub(crate) fn into_parts(mut self) -> (Option<TaskRef>, Option<Arc<WaitVertex>>) {
        (self.task.take(), self.gate.take())
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task", &self.task)
            .field("gated", &self.gate.is_some())
            .finish()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        tracing::trace!(task = ?task, "task handle dropped without launch");
        if let Some(gate) = self.gate.take() {
            // keep finished predecessors from reviving the dropped task,
            // then drop the launch reference
            gate.disarm();
            gate.release();
        }
        // undo the parent reservation made at build time
        if let Some(parent) = task.take_parent() {
            parent.release();
        }
    }
}

#[derive(Debug)]
enum Flavor {
    /// No parent vertex; waited on through an explicit latch, if at all.
    Root,
    /// Child of the calling thread's current wait scope.
    Child,
    /// Takes over the current task's parent vertex.
    Continuation,
    /// Child gated behind another handle's continuation vertex.
    SuccessorOf(Arc<WaitVertex>),
}

/// Allocator facade binding new tasks to a parent vertex and context.
#[derive(Debug)]
pub struct TaskBuilder {
    flavor: Flavor,
    context: Option<TaskGroupContext>,
    affinity: Option<usize>,
}

// === impl TaskBuilder ===

impl TaskBuilder {
    /// A free-standing task: nothing waits on it unless linked explicitly.
    pub fn root() -> Self {
        Self {
            flavor: Flavor::Root,
            context: None,
            affinity: None,
        }
    }

    /// A child of the calling thread's current wait scope: the innermost
    /// executing task, or the surrounding `TaskArena::execute` invocation.
    /// [`wait_for_all`] waits for all such children.
    pub fn child() -> Self {
        Self {
            flavor: Flavor::Child,
            context: None,
            affinity: None,
        }
    }

    /// A continuation: takes over the current task's parent vertex, so the
    /// enclosing wait completes only when the new task does.
    pub fn continuation() -> Self {
        Self {
            flavor: Flavor::Continuation,
            context: None,
            affinity: None,
        }
    }

    /// A child gated into `successor`: the built task must finish before
    /// `successor` can start.
    pub fn child_of(successor: &mut TaskHandle) -> Self {
        let gate = successor.task.clone().map(|task| {
            successor
                .gate
                .get_or_insert_with(|| WaitVertex::continuation(task))
                .clone()
        });
        match gate {
            Some(gate) => Self {
                flavor: Flavor::SuccessorOf(gate),
                context: None,
                affinity: None,
            },
            None => Self::root(),
        }
    }

    /// Run the task on behalf of `context` instead of the inherited one.
    pub fn context(mut self, context: &TaskGroupContext) -> Self {
        self.context = Some(context.clone());
        self
    }

    /// Hint that the task prefers to run in the given slot; it is mailed to
    /// that slot's inbox in addition to the spawner's pool.
    pub fn affinity(mut self, slot: usize) -> Self {
        self.affinity = Some(slot);
        self
    }

    /// Build with a plain body.
    pub fn build<F>(self, body: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.build_bypass(move || {
            body();
            None
        })
    }

    /// Build with a body that may return a next task to bypass directly to.
    pub fn build_bypass<F>(self, body: F) -> TaskHandle
    where
        F: FnOnce() -> Option<TaskHandle> + Send + 'static,
    {
        let context = self
            .context
            .or_else(crate::scheduler::current_context)
            .unwrap_or_default();

        let task = TaskRef::new(Box::new(body), context, self.affinity);

        let parent = match self.flavor {
            Flavor::Root => None,
            Flavor::Child => {
                let vertex = crate::scheduler::current_scope_vertex();
                if let Some(vertex) = &vertex {
                    vertex.reserve();
                    task.context().mark_may_have_children();
                }
                vertex
            }
            Flavor::Continuation => crate::scheduler::take_current_parent(),
            Flavor::SuccessorOf(gate) => {
                gate.reserve();
                Some(gate)
            }
        };
        task.set_parent(parent);

        TaskHandle::new(task)
    }
}

/// Spawn the task into the calling thread's slot, LIFO.
///
/// For a handle with linked predecessors this drops the launch reference
/// instead; the task starts once its continuation vertex reaches zero.
///
/// # Errors
///
/// [`SpawnError::MissingWait`] if the calling thread does not occupy an
/// arena slot.
pub fn spawn(handle: TaskHandle) -> Result<(), SpawnError> {
    crate::scheduler::spawn_handle(handle)
}

/// [`spawn`], then wait until every task of the current wait scope finished.
///
/// A parentless task is first attached to the current scope, so the wait
/// covers the spawned task itself.
pub fn spawn_and_wait_for_all(handle: TaskHandle) -> Result<(), WaitError> {
    crate::scheduler::spawn_handle_tracked(handle)?;
    crate::scheduler::wait_for_all()
}

/// Wait until every child of the current wait scope finished, executing and
/// stealing tasks while waiting.
///
/// Returns [`WaitError::Cancelled`] if the current context was cancelled; a
/// panic captured from a task body is resumed here.
pub fn wait_for_all() -> Result<(), WaitError> {
    crate::scheduler::wait_for_all()
}

static_assertions::assert_impl_all!(TaskHandle: Send);
static_assertions::assert_impl_all!(TaskRef: Send, Sync);
