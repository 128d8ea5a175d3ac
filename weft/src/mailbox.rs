// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-slot affinity inbox.
//!
//! Any slot may mail a task proxy to any other slot when the task carries an
//! affinity hint. The proxy is only that, a hint: the pooled copy and the
//! mailed copy share one [`ProxyCell`], and whichever side claims the cell
//! first executes the task; the loser observes an empty cell and drops the
//! proxy cheaply.

use crate::loom::sync::Mutex;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::task::TaskRef;
use crate::util::lock;
use cordyceps::Linked;
use cordyceps::mpsc_queue::{self, MpscQueue};
use std::ptr::NonNull;
use std::sync::Arc;

/// The shared claim cell behind a mailed task.
#[derive(Debug)]
pub(crate) struct ProxyCell {
    task: Mutex<Option<TaskRef>>,
}

// === impl ProxyCell ===

impl ProxyCell {
    pub(crate) fn new(task: TaskRef) -> Arc<Self> {
        Arc::new(Self {
            task: Mutex::new(Some(task)),
        })
    }

    /// Take the task out of the cell; the first claimant wins.
    pub(crate) fn claim(&self) -> Option<TaskRef> {
        lock(&self.task).take()
    }

    /// The isolation token of the unclaimed task, or `None` if the cell has
    /// been claimed already.
    pub(crate) fn isolation(&self) -> Option<usize> {
        lock(&self.task).as_ref().map(TaskRef::isolation)
    }
}

/// Intrusive queue node carrying a proxy into a mailbox.
struct MailEntry {
    /// Must stay valid for the queue's intrusive links; the stub entry is the
    /// only one with an empty cell.
    links: mpsc_queue::Links<MailEntry>,
    cell: Option<Arc<ProxyCell>>,
}

// Safety: mail entries are always treated as heap-owned by exactly one queue;
// the handle type below converts ownership losslessly between the box and the
// raw pointer the queue links through.
unsafe impl Linked<mpsc_queue::Links<MailEntry>> for MailEntry {
    type Handle = Box<MailEntry>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        NonNull::from(Box::leak(handle))
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        // Safety: pointers handed back by the queue were produced by
        // `into_ptr` above.
        unsafe { Box::from_raw(ptr.as_ptr()) }
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<mpsc_queue::Links<Self>> {
        // Safety: raw field projection, no reference to the (possibly
        // aliased) node is created.
        unsafe { NonNull::new_unchecked(&raw mut (*ptr.as_ptr()).links) }
    }
}

/// A multi-producer / single-consumer (the slot owner) inbox of task proxies.
pub(crate) struct Mailbox {
    queue: MpscQueue<MailEntry>,
    /// Approximate occupancy, so out-of-work sweeps and idle spawners can
    /// check without touching the queue.
    len: AtomicUsize,
}

// === impl Mailbox ===

impl Mailbox {
    pub(crate) fn new() -> Self {
        let stub = Box::new(MailEntry {
            links: mpsc_queue::Links::new_stub(),
            cell: None,
        });
        Self {
            queue: MpscQueue::new_with_stub(stub),
            len: AtomicUsize::new(0),
        }
    }

    /// Mail a proxy into this slot. Callable from any thread.
    pub(crate) fn push(&self, cell: Arc<ProxyCell>) {
        self.len.fetch_add(1, Ordering::Release);
        self.queue.enqueue(Box::new(MailEntry {
            links: mpsc_queue::Links::new(),
            cell: Some(cell),
        }));
    }

    /// Pop the oldest proxy. Only the slot owner may consume.
    pub(crate) fn pop(&self) -> Option<Arc<ProxyCell>> {
        let entry = self.queue.dequeue()?;
        self.len.fetch_sub(1, Ordering::Release);
        entry.cell
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len.load(Ordering::Acquire) == 0
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("len", &self.len.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
