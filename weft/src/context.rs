// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task group contexts: the cancellation / exception propagation tree.
//!
//! Every task runs on behalf of a context. Cancelling a context marks the
//! whole subtree below it; tasks observe the mark at their next execute entry
//! or wait loop head (cancellation is cooperative, never preemptive). A panic
//! escaping a task body is captured into the context (first writer wins)
//! and resumed at the waiting call site.

use crate::loom::sync::Mutex;
use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::util::lock;
use core::fmt;
// the context tree is never model-checked, and loom's `Arc` has no `Weak`
use std::sync::{Arc, Weak};

/// Priority of an arena or task group, also selecting the FIFO stream level
/// used by enqueued tasks.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// The priority-list index; level 0 is served first.
    pub(crate) fn level(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub(crate) fn from_level(level: usize) -> Self {
        match level {
            0 => Priority::High,
            1 => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

/// A captured panic payload, stored at most once per context.
pub(crate) type StoredException = Box<dyn core::any::Any + Send + 'static>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ContextKind {
    /// Not affected by its creator's context; cancellation reaches it only
    /// through an explicit parent relationship.
    Isolated,
    /// Bound under the context current at creation time.
    Bound,
}

pub(crate) struct ContextInner {
    kind: ContextKind,
    parent: Option<Weak<ContextInner>>,
    children: Mutex<Vec<Weak<ContextInner>>>,
    cancelled: AtomicBool,
    /// Bumped on every state transition of this node, so independent
    /// subtrees can be observed to change without touching their siblings.
    version: AtomicUsize,
    exception: Mutex<Option<StoredException>>,
    exception_set: AtomicBool,
    priority: AtomicUsize,
    /// Hint that tasks of this context may spawn children; lets waiters skip
    /// a sweep when it is clear.
    may_have_children: AtomicBool,
}

/// A node in the cancellation/exception propagation tree.
///
/// Cheap to clone; all clones refer to the same node.
#[derive(Clone)]
pub struct TaskGroupContext {
    inner: Arc<ContextInner>,
}

// === impl TaskGroupContext ===

impl TaskGroupContext {
    /// A new isolated context: a root of its own propagation tree.
    pub fn new() -> Self {
        Self::build(ContextKind::Isolated, None)
    }

    /// A new context bound under the context the calling thread currently
    /// runs in (the innermost executing task's context), if any.
    pub fn bound() -> Self {
        let parent = crate::scheduler::current_context();
        Self::build(ContextKind::Bound, parent.map(|ctx| ctx.inner))
    }

    /// A new context explicitly chained under `parent`: cancelling the
    /// parent cancels it, and a panic captured below it surfaces at the
    /// chain's root.
    pub fn with_parent(parent: &TaskGroupContext) -> Self {
        Self::build(ContextKind::Bound, Some(parent.inner.clone()))
    }

    fn build(kind: ContextKind, parent: Option<Arc<ContextInner>>) -> Self {
        let priority = parent
            .as_ref()
            .map_or(Priority::Normal, |p| Priority::from_level(p.priority.load(Ordering::Relaxed)));

        let inner = Arc::new(ContextInner {
            kind,
            parent: parent.as_ref().map(Arc::downgrade),
            children: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            version: AtomicUsize::new(0),
            exception: Mutex::new(None),
            exception_set: AtomicBool::new(false),
            priority: AtomicUsize::new(priority.level()),
            may_have_children: AtomicBool::new(false),
        });

        if let Some(parent) = parent {
            // registration is serialized against cancellation walks by the
            // global topology mutex, so a newly bound child can never miss a
            // cancel of its parent
            crate::control::with_context_topology(|| {
                let mut children = lock(&parent.children);
                children.retain(|child| child.strong_count() > 0);
                children.push(Arc::downgrade(&inner));
                if parent.cancelled.load(Ordering::SeqCst) {
                    inner.cancelled.store(true, Ordering::SeqCst);
                }
            });
        }

        Self { inner }
    }

    /// Cancel this group and every group below it.
    ///
    /// Idempotent and monotone: once set, the bit stays set. Returns `true`
    /// if this call observed the transition.
    pub fn cancel_group_execution(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.version.fetch_add(1, Ordering::Release);
        crate::control::propagate_cancellation(&self.inner);
        tracing::trace!(ctx = ?self.tag(), "task group cancelled");
        true
    }

    pub fn is_group_execution_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Re-prioritize the group. Tasks pick the new value up lazily, at their
    /// next execute entry.
    pub fn set_priority(&self, priority: Priority) {
        self.inner
            .priority
            .store(priority.level(), Ordering::Relaxed);
    }

    pub fn priority(&self) -> Priority {
        Priority::from_level(self.inner.priority.load(Ordering::Relaxed))
    }

    pub(crate) fn mark_may_have_children(&self) {
        self.inner.may_have_children.store(true, Ordering::Relaxed);
    }

    pub(crate) fn may_have_children(&self) -> bool {
        self.inner.may_have_children.load(Ordering::Relaxed)
    }

    /// Reset the context for reuse after all its tasks quiesced: clears the
    /// cancellation bit and drops a stored exception.
    pub fn reset(&self) {
        self.inner.cancelled.store(false, Ordering::SeqCst);
        let _ = self.take_exception();
    }

    /// The root of this context's explicit parent chain; `self` when the
    /// context is isolated.
    pub(crate) fn bound_root(&self) -> TaskGroupContext {
        let mut current = self.inner.clone();
        loop {
            let parent = current.parent.as_ref().and_then(Weak::upgrade);
            match parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        TaskGroupContext { inner: current }
    }

    /// Capture a panic escaping a task body: the payload is stored at the
    /// root of the bound chain (first writer wins) and the whole chain is
    /// cancelled so the root's waiter observes the exception while sibling
    /// trees stay runnable.
    pub(crate) fn capture_panic(&self, payload: StoredException) {
        let root = self.bound_root();
        root.store_exception(payload);
        root.cancel_group_execution();
    }

    /// Store a captured panic; the first writer wins.
    pub(crate) fn store_exception(&self, exception: StoredException) -> bool {
        let mut slot = lock(&self.inner.exception);
        if slot.is_some() {
            return false;
        }
        *slot = Some(exception);
        self.inner.exception_set.store(true, Ordering::Release);
        true
    }

    /// Lock-free fast check used at wait loop exits.
    pub(crate) fn has_exception(&self) -> bool {
        self.inner.exception_set.load(Ordering::Acquire)
    }

    pub(crate) fn take_exception(&self) -> Option<StoredException> {
        let mut slot = lock(&self.inner.exception);
        let taken = slot.take();
        if taken.is_some() {
            self.inner.exception_set.store(false, Ordering::Release);
        }
        taken
    }

    pub(crate) fn tag(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl Default for TaskGroupContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskGroupContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroupContext")
            .field("addr", &Arc::as_ptr(&self.inner))
            .field("kind", &self.inner.kind)
            .field("cancelled", &self.inner.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}

// === impl ContextInner ===

impl ContextInner {
    /// Mark this subtree cancelled. Must run under the topology mutex.
    pub(crate) fn cancel_subtree(&self) {
        let mut stack: Vec<Arc<ContextInner>> = {
            let mut children = lock(&self.children);
            children.retain(|child| child.strong_count() > 0);
            children.iter().filter_map(Weak::upgrade).collect()
        };

        while let Some(node) = stack.pop() {
            if node.cancelled.swap(true, Ordering::SeqCst) {
                // already cancelled: its own subtree was marked by whoever
                // set the bit, also under the topology mutex
                continue;
            }
            node.version.fetch_add(1, Ordering::Release);
            let children = lock(&node.children);
            stack.extend(children.iter().filter_map(Weak::upgrade));
        }
    }
}

impl fmt::Debug for ContextInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextInner")
            .field("kind", &self.kind)
            .field("bound", &self.parent.is_some())
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(loom))]
    #[test]
    fn cancel_marks_descendants_not_siblings() {
        let root = TaskGroupContext::new();
        let child_a = TaskGroupContext::with_parent(&root);
        let grandchild = TaskGroupContext::with_parent(&child_a);
        let sibling = TaskGroupContext::new();

        assert!(root.cancel_group_execution());
        assert!(root.is_group_execution_cancelled());
        assert!(child_a.is_group_execution_cancelled());
        assert!(grandchild.is_group_execution_cancelled());
        assert!(!sibling.is_group_execution_cancelled());

        // idempotent: the transition is observed only once
        assert!(!root.cancel_group_execution());
    }

    #[cfg(not(loom))]
    #[test]
    fn binding_under_a_cancelled_parent_inherits_the_mark() {
        let root = TaskGroupContext::new();
        root.cancel_group_execution();

        let late_child = TaskGroupContext::with_parent(&root);
        assert!(late_child.is_group_execution_cancelled());
    }

    #[cfg(not(loom))]
    #[test]
    fn exception_is_stored_at_most_once() {
        let ctx = TaskGroupContext::new();
        assert!(ctx.store_exception(Box::new("first")));
        assert!(!ctx.store_exception(Box::new("second")));

        let stored = ctx.take_exception().expect("exception was stored");
        assert_eq!(*stored.downcast::<&str>().unwrap(), "first");
        assert!(ctx.take_exception().is_none());
    }

    #[cfg(not(loom))]
    #[test]
    fn priority_round_trips() {
        let ctx = TaskGroupContext::new();
        assert_eq!(ctx.priority(), Priority::Normal);
        ctx.set_priority(Priority::High);
        assert_eq!(ctx.priority(), Priority::High);
    }
}
