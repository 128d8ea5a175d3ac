// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Error returned by spawn-family operations.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum SpawnError {
    /// The calling thread does not occupy an arena slot, so there is no task
    /// pool to push into.
    MissingWait,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::MissingWait => {
                f.write_str("spawn requires the calling thread to be attached to an arena slot")
            }
        }
    }
}

impl core::error::Error for SpawnError {}

/// Error returned by wait-family operations.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum WaitError {
    /// The task group context this wait belongs to was cancelled.
    ///
    /// Note that a panic captured from a task body is *not* reported through
    /// this variant; it is resumed at the waiting call site instead.
    Cancelled,
    /// A recursive wait on a vertex this thread is already waiting on.
    ImproperLock,
    /// The operation needed an arena slot but the calling thread has none.
    MissingWait,
    /// The wait was torn down by a monitor-level [`abort_all`].
    ///
    /// [`abort_all`]: crate::monitor::Monitor::abort_all
    Aborted,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Cancelled => f.write_str("task group execution was cancelled"),
            WaitError::ImproperLock => f.write_str("recursive wait on the same wait vertex"),
            WaitError::MissingWait => {
                f.write_str("wait requires the calling thread to be attached to an arena slot")
            }
            WaitError::Aborted => f.write_str("wait aborted"),
        }
    }
}

impl core::error::Error for WaitError {}

impl From<UserAbort> for WaitError {
    fn from(_: UserAbort) -> Self {
        WaitError::Aborted
    }
}

impl From<SpawnError> for WaitError {
    fn from(error: SpawnError) -> Self {
        match error {
            SpawnError::MissingWait => WaitError::MissingWait,
        }
    }
}

/// A sleeping thread was kicked out of its wait by [`Monitor::abort_all`].
///
/// [`Monitor::abort_all`]: crate::monitor::Monitor::abort_all
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UserAbort(pub(crate) ());

impl fmt::Display for UserAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("user abort")
    }
}

impl core::error::Error for UserAbort {}

/// Error returned when tearing down the runtime.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum TerminateError {
    /// A blocking termination was requested from a thread that is itself
    /// driven by the runtime (a worker, or a thread inside a nested blocking
    /// terminate), which would deadlock.
    BlockingNested,
}

impl fmt::Display for TerminateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminateError::BlockingNested => {
                f.write_str("blocking terminate requested from inside the runtime")
            }
        }
    }
}

impl core::error::Error for TerminateError {}
