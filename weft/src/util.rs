// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::{Condvar, Mutex, MutexGuard};
use core::ops::{Deref, DerefMut};
// loom mirrors `std`'s lock API including `LockResult`, so poison recovery
// goes through the `std` error type in both builds.
use std::sync::PoisonError;

/// Pads and aligns a value to the length of a cache line.
///
/// Shared hot fields (deque indices, reference words) get wrapped in this to
/// avoid false sharing between slots.
#[derive(Debug, Default)]
#[repr(align(128))]
pub(crate) struct CachePadded<T>(pub(crate) T);

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CachePadded<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// Bounded exponential backoff: spin with a growing pause count, then start
/// yielding the OS thread.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    pub(crate) const fn new() -> Self {
        Self { step: 0 }
    }

    pub(crate) fn spin(&mut self) {
        cfg_if::cfg_if! {
            if #[cfg(loom)] {
                loom::thread::yield_now();
            } else {
                if self.step <= Self::SPIN_LIMIT {
                    for _ in 0..1_u32 << self.step {
                        core::hint::spin_loop();
                    }
                    self.step += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }

    pub(crate) fn reset(&mut self) {
        self.step = 0;
    }
}

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// All internal critical sections are panic-free (user code never runs under
/// a runtime lock), so a poisoned guard is still in a consistent state.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`Condvar::wait`] with the same poison recovery as [`lock`].
#[inline]
pub(crate) fn condvar_wait<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}
