// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A multi-producer/multi-consumer predicate wait queue.
//!
//! Threads enroll with [`Monitor::prepare_wait`], double-check their wake
//! condition, and then either [`Monitor::commit_wait`] (block) or
//! [`Monitor::cancel_wait`]. Notifiers advance the monitor's epoch under the
//! waitset lock; a waiter whose epoch is stale by commit time cancels instead
//! of blocking, which makes missed wakeups impossible: any notification that
//! happens-after the writes a waiter's predicate reads either wakes that
//! waiter or causes its commit to fall through.

use crate::error::UserAbort;
use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use crate::loom::sync::{Arc, Condvar, Mutex};
use crate::util::{condvar_wait, lock};
use std::collections::VecDeque;

/// A binary semaphore: `post` stores at most one wakeup.
#[derive(Debug)]
struct Semaphore {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut signaled = lock(&self.signaled);
        while !*signaled {
            signaled = condvar_wait(&self.condvar, signaled);
        }
        *signaled = false;
    }

    fn post(&self) {
        let mut signaled = lock(&self.signaled);
        *signaled = true;
        drop(signaled);
        self.condvar.notify_one();
    }
}

/// Per-thread waiter descriptor.
///
/// A node is owned by exactly one thread and shared with the waitset while
/// enrolled; the notifier side keeps its own `Arc` until the wakeup has been
/// delivered, so a woken node is never touched after the waiter moved on.
#[derive(Debug)]
pub(crate) struct WaitNode {
    /// User context attached at `prepare_wait`, matched by `notify_where`.
    ctx: AtomicUsize,
    /// Monitor epoch observed at `prepare_wait`.
    epoch: AtomicUsize,
    /// Whether the node is currently linked into a waitset.
    in_waitset: AtomicBool,
    /// Set when a notifier claimed this node after the waiter had already
    /// cancelled; the pending semaphore post is drained by the next
    /// `prepare_wait`.
    skipped_wakeup: AtomicBool,
    aborted: AtomicBool,
    sema: Semaphore,
}

impl WaitNode {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            ctx: AtomicUsize::new(0),
            epoch: AtomicUsize::new(0),
            in_waitset: AtomicBool::new(false),
            skipped_wakeup: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            sema: Semaphore::new(),
        })
    }
}

#[derive(Debug)]
pub(crate) struct Monitor {
    epoch: AtomicUsize,
    /// Waiter count mirror so the notify paths can bail without locking.
    waiters: AtomicUsize,
    waitset: Mutex<VecDeque<Arc<WaitNode>>>,
}

// === impl Monitor ===

impl Monitor {
    pub(crate) fn new() -> Self {
        Self {
            epoch: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
            waitset: Mutex::new(VecDeque::new()),
        }
    }

    /// Enroll `node` in the waitset under the current epoch, attaching `ctx`
    /// for predicate-based notification.
    pub(crate) fn prepare_wait(&self, node: &Arc<WaitNode>, ctx: usize) {
        // pump a previously skipped wakeup so the semaphore is clean
        if node.skipped_wakeup.swap(false, Ordering::Relaxed) {
            node.sema.wait();
        }

        node.ctx.store(ctx, Ordering::Relaxed);
        node.aborted.store(false, Ordering::Relaxed);

        {
            let mut waitset = lock(&self.waitset);
            node.epoch
                .store(self.epoch.load(Ordering::Relaxed), Ordering::Relaxed);
            node.in_waitset.store(true, Ordering::Relaxed);
            waitset.push_back(node.clone());
            self.waiters.store(waitset.len(), Ordering::Relaxed);
        }

        fence(Ordering::SeqCst);
    }

    /// Block on the node's semaphore if the epoch has not advanced since
    /// [`prepare_wait`]; otherwise cancel the wait.
    ///
    /// Returns `Ok(true)` if the wait actually blocked, `Ok(false)` if it was
    /// cancelled, and `Err` if the waiter was torn down by [`abort_all`].
    ///
    /// [`prepare_wait`]: Self::prepare_wait
    /// [`abort_all`]: Self::abort_all
    pub(crate) fn commit_wait(&self, node: &Arc<WaitNode>) -> Result<bool, UserAbort> {
        let committed = node.epoch.load(Ordering::Relaxed) == self.epoch.load(Ordering::Relaxed);
        if committed {
            node.sema.wait();
            debug_assert!(!node.in_waitset.load(Ordering::Relaxed));
            if node.aborted.swap(false, Ordering::Relaxed) {
                return Err(UserAbort(()));
            }
        } else {
            self.cancel_wait(node);
        }
        Ok(committed)
    }

    /// Withdraw the node from the waitset. Idempotent.
    ///
    /// If a notifier claimed the node first, its semaphore post is (or will
    /// be) pending; remember that so the next [`prepare_wait`] drains it.
    ///
    /// [`prepare_wait`]: Self::prepare_wait
    pub(crate) fn cancel_wait(&self, node: &Arc<WaitNode>) {
        if node.in_waitset.load(Ordering::Acquire) {
            let mut waitset = lock(&self.waitset);
            if node.in_waitset.load(Ordering::Relaxed) {
                waitset.retain(|other| !Arc::ptr_eq(other, node));
                node.in_waitset.store(false, Ordering::Relaxed);
                self.waiters.store(waitset.len(), Ordering::Relaxed);
                return;
            }
        }
        // a notifier got there first
        node.aborted.store(false, Ordering::Relaxed);
        node.skipped_wakeup.store(true, Ordering::Relaxed);
    }

    pub(crate) fn notify_one(&self) {
        fence(Ordering::SeqCst);
        self.notify_one_relaxed();
    }

    pub(crate) fn notify_one_relaxed(&self) {
        if self.waiters.load(Ordering::Acquire) == 0 {
            return;
        }

        let woken = {
            let mut waitset = lock(&self.waitset);
            self.bump_epoch();
            let woken = waitset.pop_front();
            if let Some(node) = &woken {
                node.in_waitset.store(false, Ordering::Relaxed);
            }
            self.waiters.store(waitset.len(), Ordering::Relaxed);
            woken
        };

        if let Some(node) = woken {
            node.sema.post();
        }
    }

    pub(crate) fn notify_all(&self) {
        fence(Ordering::SeqCst);
        self.notify_all_relaxed();
    }

    pub(crate) fn notify_all_relaxed(&self) {
        self.notify_where_relaxed(|_| true);
    }

    /// Wake exactly the waiters whose context satisfies `predicate`.
    pub(crate) fn notify_where<P: Fn(usize) -> bool>(&self, predicate: P) {
        fence(Ordering::SeqCst);
        self.notify_where_relaxed(predicate);
    }

    pub(crate) fn notify_where_relaxed<P: Fn(usize) -> bool>(&self, predicate: P) {
        if self.waiters.load(Ordering::Acquire) == 0 {
            return;
        }

        let mut woken = Vec::new();
        {
            let mut waitset = lock(&self.waitset);
            self.bump_epoch();
            waitset.retain(|node| {
                if predicate(node.ctx.load(Ordering::Relaxed)) {
                    node.in_waitset.store(false, Ordering::Relaxed);
                    woken.push(node.clone());
                    false
                } else {
                    true
                }
            });
            self.waiters.store(waitset.len(), Ordering::Relaxed);
        }

        for node in woken {
            node.sema.post();
        }
    }

    /// Wake all waiters, signaling cancellation: they observe the aborted
    /// flag and fail their wait with [`UserAbort`].
    pub(crate) fn abort_all(&self) {
        fence(Ordering::SeqCst);

        if self.waiters.load(Ordering::Acquire) == 0 {
            return;
        }

        let mut woken = Vec::new();
        {
            let mut waitset = lock(&self.waitset);
            self.bump_epoch();
            while let Some(node) = waitset.pop_front() {
                node.in_waitset.store(false, Ordering::Relaxed);
                node.aborted.store(true, Ordering::Relaxed);
                woken.push(node);
            }
            self.waiters.store(0, Ordering::Relaxed);
        }

        for node in woken {
            node.sema.post();
        }
    }

    pub(crate) fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::Acquire) != 0
    }

    /// Must be called with the waitset lock held.
    fn bump_epoch(&self) {
        self.epoch
            .store(self.epoch.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::loom::thread;

    #[test]
    fn prepare_cancel_is_idempotent() {
        loom::model(|| {
            let monitor = Monitor::new();
            let node = WaitNode::new();

            monitor.prepare_wait(&node, 1);
            monitor.cancel_wait(&node);
            monitor.cancel_wait(&node);

            assert!(!monitor.has_waiters());
            // no epoch drift observable to other waiters: a fresh
            // prepare/commit pair must still block-or-cancel purely based on
            // notifications that happen afterwards.
            monitor.prepare_wait(&node, 1);
            monitor.notify_one();
            // the notification claimed the node and advanced the epoch, so
            // the commit falls through instead of blocking
            assert_eq!(monitor.commit_wait(&node), Ok(false));
            // the claimed wakeup is pending on the semaphore; re-preparation
            // drains it
            monitor.prepare_wait(&node, 1);
            monitor.cancel_wait(&node);
            assert!(!monitor.has_waiters());
        });
    }

    #[test]
    fn notify_before_commit_does_not_block() {
        loom::model(|| {
            let monitor = Arc::new(Monitor::new());
            let node = WaitNode::new();

            monitor.prepare_wait(&node, 7);

            let remote = monitor.clone();
            let handle = thread::spawn(move || {
                remote.notify_one();
            });

            // either the notifier already advanced the epoch (commit cancels)
            // or the semaphore post is pending (commit returns immediately);
            // in both cases the wait terminates.
            let committed = monitor.commit_wait(&node).unwrap();
            handle.join().unwrap();

            if !committed {
                // the wakeup may have been claimed concurrently with the
                // cancellation; draining it is `prepare_wait`'s job.
                monitor.prepare_wait(&node, 7);
                monitor.cancel_wait(&node);
            }
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn notify_where_wakes_matching_waiters_only() {
        let monitor = Arc::new(Monitor::new());

        let matching = WaitNode::new();
        let other = WaitNode::new();
        monitor.prepare_wait(&matching, 42);
        monitor.prepare_wait(&other, 43);

        monitor.notify_where(|ctx| ctx == 42);

        // the matching waiter was claimed before its commit, so the commit
        // falls through; the wakeup itself is pending on the semaphore
        assert_eq!(monitor.commit_wait(&matching), Ok(false));
        monitor.prepare_wait(&matching, 42);
        monitor.cancel_wait(&matching);

        // the non-matching waiter is still enrolled
        assert!(monitor.has_waiters());
        monitor.cancel_wait(&other);
        assert!(!monitor.has_waiters());
    }

    #[cfg(not(loom))]
    #[test]
    fn abort_all_fails_the_wait() {
        let monitor = Arc::new(Monitor::new());
        let node = WaitNode::new();
        monitor.prepare_wait(&node, 0);

        let remote = monitor.clone();
        let handle = std::thread::spawn(move || {
            remote.abort_all();
        });

        let result = monitor.commit_wait(&node);
        handle.join().unwrap();
        // aborted if we blocked, cancelled if the epoch already moved
        if result != Ok(false) {
            assert_eq!(result, Err(UserAbort(())));
        }
    }
}
