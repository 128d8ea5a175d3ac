// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-slot task pool: a Chase-Lev work-stealing deque plus the slot record.
//!
//! The owner (the thread occupying the slot) pushes and pops at the tail in
//! LIFO order; thieves steal from the head in FIFO order, which hands out the
//! oldest (typically outermost and largest) piece of work first.

use crate::loom::sync::Mutex;
use crate::loom::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, Ordering, fence};
use crate::mailbox::{Mailbox, ProxyCell};
use crate::task::TaskRef;
use crate::util::{CachePadded, lock};
use std::ptr;
use std::sync::Arc;

/// An entry in a task pool.
///
/// A task spawned with an affinity hint lives in the pool *and* in the target
/// slot's mailbox; both sides reference the same [`ProxyCell`] and the first
/// claimant wins.
#[derive(Debug)]
pub(crate) enum PoolEntry {
    Direct(TaskRef),
    Mailed(Arc<ProxyCell>),
}

impl PoolEntry {
    /// Resolve the entry into a runnable task, if it has not been claimed
    /// through the mailbox side already.
    pub(crate) fn claim(self) -> Option<TaskRef> {
        match self {
            PoolEntry::Direct(task) => Some(task),
            PoolEntry::Mailed(cell) => cell.claim(),
        }
    }

    /// The isolation token the entry's task was spawned under, if the entry
    /// is still claimable.
    pub(crate) fn isolation(&self) -> Option<usize> {
        match self {
            PoolEntry::Direct(task) => Some(task.isolation()),
            PoolEntry::Mailed(cell) => cell.isolation(),
        }
    }
}

/// Outcome of a steal attempt.
#[derive(Debug)]
pub(crate) enum Steal<T> {
    Success(Box<T>),
    /// The deque was observed empty.
    Empty,
    /// Lost a race against the owner or another thief; retrying may succeed.
    Retry,
}

struct Buffer<T> {
    cap: usize,
    slots: Box<[AtomicPtr<T>]>,
}

impl<T> Buffer<T> {
    fn alloc(cap: usize) -> *mut Buffer<T> {
        debug_assert!(cap.is_power_of_two());
        let slots = (0..cap).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        Box::into_raw(Box::new(Buffer { cap, slots }))
    }

    #[inline]
    fn index(&self, index: isize) -> usize {
        debug_assert!(index >= 0);
        usize::try_from(index).unwrap_or(0) & (self.cap - 1)
    }

    #[inline]
    fn put(&self, index: isize, entry: *mut T) {
        self.slots[self.index(index)].store(entry, Ordering::Relaxed);
    }

    #[inline]
    fn get(&self, index: isize) -> *mut T {
        self.slots[self.index(index)].load(Ordering::Relaxed)
    }
}

/// A Chase-Lev work-stealing deque of boxed entries.
pub(crate) struct Deque<T> {
    head: CachePadded<AtomicIsize>,
    tail: CachePadded<AtomicIsize>,
    buffer: AtomicPtr<Buffer<T>>,
    /// Buffers replaced by [`grow`](Self::grow). A thief may still be reading
    /// a replaced buffer, so they are only freed when the deque is dropped;
    /// geometric growth bounds the total waste to the size of the live
    /// buffer.
    retired: Mutex<Vec<*mut Buffer<T>>>,
}

// Safety: entries are owned boxes handed across threads through atomic
// pointers; the push/pop/steal protocol ensures each entry is freed once.
unsafe impl<T: Send> Send for Deque<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for Deque<T> {}

pub(crate) type TaskDeque = Deque<PoolEntry>;

const INITIAL_CAPACITY: usize = 64;

// === impl Deque ===

impl<T> Deque<T> {
    pub(crate) fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub(crate) fn with_capacity(cap: usize) -> Self {
        Self {
            head: CachePadded(AtomicIsize::new(0)),
            tail: CachePadded(AtomicIsize::new(0)),
            buffer: AtomicPtr::new(Buffer::alloc(cap.next_power_of_two())),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Push an entry at the tail.
    ///
    /// # Safety
    ///
    /// Only the slot's current occupant may call this.
    pub(crate) unsafe fn push(&self, entry: Box<T>) {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let mut buffer = self.buffer.load(Ordering::Relaxed);

        // Safety: the buffer pointer is always valid; only the owner replaces
        // it and we are the owner.
        if (tail - head) >= unsafe { (*buffer).cap as isize } {
            buffer = self.grow(head, tail, buffer);
        }

        // Safety: as above.
        unsafe { (*buffer).put(tail, Box::into_raw(entry)) };
        self.tail.store(tail + 1, Ordering::Release);
    }

    /// Pop the most recently pushed entry (LIFO).
    ///
    /// # Safety
    ///
    /// Only the slot's current occupant may call this.
    pub(crate) unsafe fn pop_local(&self) -> Option<Box<T>> {
        let tail = self.tail.load(Ordering::Relaxed) - 1;
        let buffer = self.buffer.load(Ordering::Relaxed);
        self.tail.store(tail, Ordering::Relaxed);
        // the speculative tail decrement must be visible to thieves before we
        // read the head
        fence(Ordering::SeqCst);

        let head = self.head.load(Ordering::Relaxed);
        if head > tail {
            // observed empty, restore
            self.tail.store(tail + 1, Ordering::Relaxed);
            return None;
        }

        // Safety: owner-only replacement, see `push`.
        let entry = unsafe { (*buffer).get(tail) };
        if head == tail {
            // last entry: exactly one of pop/steal may take it
            let won = self
                .head
                .compare_exchange(head, head + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.tail.store(tail + 1, Ordering::Relaxed);
            // Safety: winning the CAS transfers ownership of the entry.
            won.then(|| unsafe { Box::from_raw(entry) })
        } else {
            // Safety: tail entries above head are owned by us.
            Some(unsafe { Box::from_raw(entry) })
        }
    }

    /// Steal the oldest entry (FIFO). Callable from any thread.
    pub(crate) fn steal(&self) -> Steal<T> {
        let head = self.head.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail {
            return Steal::Empty;
        }

        let buffer = self.buffer.load(Ordering::Acquire);
        // the entry must be read *before* claiming it with the CAS below; a
        // concurrent grow keeps this buffer alive in the retired list, so the
        // read cannot fault even when it loses the race
        //
        // Safety: buffers are only freed when the deque is dropped.
        let entry = unsafe { (*buffer).get(head) };
        if self
            .head
            .compare_exchange(head, head + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            // Safety: winning the CAS transfers ownership of the entry.
            Steal::Success(unsafe { Box::from_raw(entry) })
        } else {
            Steal::Retry
        }
    }

    /// A racy emptiness check, good enough for out-of-work sweeps: false
    /// negatives delay the sweep, which is allowed.
    pub(crate) fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head >= tail
    }

    /// Owner-only reallocation; the old buffer is retired, not freed, so
    /// thieves mid-read stay valid.
    fn grow(&self, head: isize, tail: isize, old: *mut Buffer<T>) -> *mut Buffer<T> {
        // Safety: owner-only access, the old buffer is still alive.
        let old_ref = unsafe { &*old };
        let grown = Buffer::alloc(old_ref.cap * 2);
        // Safety: freshly allocated above.
        let grown_ref = unsafe { &*grown };
        for index in head..tail {
            grown_ref.put(index, old_ref.get(index));
        }
        self.buffer.store(grown, Ordering::Release);
        lock(&self.retired).push(old);

        tracing::trace!(
            capacity = grown_ref.cap,
            live = tail - head,
            "task pool grown"
        );
        grown
    }
}

impl<T> Drop for Deque<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        let buffer = self.buffer.load(Ordering::Acquire);

        for index in head..tail {
            // Safety: no other thread can access the deque during drop;
            // entries in [head, tail) are unclaimed and owned by the buffer.
            unsafe {
                let entry = (*buffer).get(index);
                if !entry.is_null() {
                    drop(Box::from_raw(entry));
                }
            }
        }

        // Safety: all entry pointers were either claimed or freed above, the
        // buffers themselves are exclusively ours now.
        unsafe {
            drop(Box::from_raw(buffer));
            for retired in lock(&self.retired).drain(..) {
                drop(Box::from_raw(retired));
            }
        }
    }
}

impl<T> std::fmt::Debug for Deque<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deque")
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// One slot of an arena: deque, affinity inbox and the occupancy flag.
#[derive(Debug)]
pub(crate) struct ArenaSlot {
    occupied: AtomicBool,
    pub(crate) deque: TaskDeque,
    pub(crate) inbox: Mailbox,
    /// Set while the occupant is sleeping; lets spawners know that mailing
    /// this slot will not be picked up promptly.
    pub(crate) inbox_idle: AtomicBool,
}

// === impl ArenaSlot ===

impl ArenaSlot {
    pub(crate) fn new() -> Self {
        Self {
            occupied: AtomicBool::new(false),
            deque: TaskDeque::new(),
            inbox: Mailbox::new(),
            inbox_idle: AtomicBool::new(true),
        }
    }

    pub(crate) fn try_occupy(&self) -> bool {
        !self.occupied.load(Ordering::Relaxed)
            && self
                .occupied
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    pub(crate) fn release(&self) {
        self.inbox_idle.store(true, Ordering::Relaxed);
        self.occupied.store(false, Ordering::Release);
    }

    pub(crate) fn is_occupied(&self) -> bool {
        self.occupied.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::loom::thread;

    #[test]
    fn pop_steal_race_takes_exactly_one() {
        loom::model(|| {
            // a small buffer keeps the model's state space tractable
            let deque = Arc::new(Deque::<u32>::with_capacity(4));
            // Safety: this thread is the owner.
            unsafe { deque.push(Box::new(1)) };

            let thief = deque.clone();
            let handle = thread::spawn(move || matches!(thief.steal(), Steal::Success(_)));

            // Safety: this thread is the owner.
            let popped = unsafe { deque.pop_local() }.is_some();
            let stolen = handle.join().unwrap();

            assert!(popped ^ stolen, "exactly one of pop/steal must succeed");
        });
    }

    #[cfg(not(loom))]
    #[test]
    fn owner_is_lifo_thief_is_fifo() {
        let deque = Deque::<u32>::new();
        // Safety: this thread is the owner.
        unsafe {
            deque.push(Box::new(1));
            deque.push(Box::new(2));
            deque.push(Box::new(3));
        }

        assert!(matches!(deque.steal(), Steal::Success(entry) if *entry == 1));
        // Safety: this thread is the owner.
        assert_eq!(unsafe { deque.pop_local() }.as_deref(), Some(&3));
        assert_eq!(unsafe { deque.pop_local() }.as_deref(), Some(&2));
        assert!(unsafe { deque.pop_local() }.is_none());
        assert!(matches!(deque.steal(), Steal::Empty));
    }

    #[cfg(not(loom))]
    #[test]
    fn growth_preserves_entries() {
        let deque = Deque::<usize>::with_capacity(4);
        for value in 0..100 {
            // Safety: this thread is the owner.
            unsafe { deque.push(Box::new(value)) };
        }

        for expected in (0..100).rev() {
            // Safety: this thread is the owner.
            assert_eq!(unsafe { deque.pop_local() }.as_deref(), Some(&expected));
        }
        assert!(deque.is_empty());
    }

    #[cfg(not(loom))]
    #[test]
    fn dropping_a_nonempty_deque_frees_entries() {
        let deque = Deque::<String>::new();
        // Safety: this thread is the owner.
        unsafe {
            deque.push(Box::new("a".to_owned()));
            deque.push(Box::new("b".to_owned()));
        }
        drop(deque);
    }
}
