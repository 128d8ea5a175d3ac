// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The thread dispatcher: owns the worker pool and hands workers to arenas.
//!
//! Arenas are registered as tickets in a priority-indexed ring. An idle
//! worker scans the ring once around from its last-served arena, joining the
//! first one whose active worker count is below its allotment; when two
//! passes (with a yield in between) find nobody in need, the worker sleeps
//! on the dispatcher's monitor until the job count estimate rises again.

use crate::arena::Arena;
use crate::control::ThreadingControl;
use crate::loom::sync::Mutex;
use crate::loom::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use crate::monitor::{Monitor, WaitNode};
use crate::stream::NUM_PRIORITY_LEVELS;
use crate::util::lock;
use std::sync::{Arc, RwLock};
use std::thread;

/// Worker-pool server flavor backing the dispatcher.
///
/// A shared server can be requested through the `WEFT_SERVER` environment
/// variable at startup; resolution of a shared pool is not available here,
/// so the request falls back to the private pool, which always works. No
/// environment variable is required for correctness.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ServerKind {
    Private,
    Shared,
}

fn resolve_server() -> ServerKind {
    let requested = match std::env::var("WEFT_SERVER").as_deref() {
        Ok("shared") => ServerKind::Shared,
        _ => ServerKind::Private,
    };
    match requested {
        ServerKind::Shared => {
            tracing::warn!("no shared worker-pool server available, falling back to private");
            ServerKind::Private
        }
        ServerKind::Private => ServerKind::Private,
    }
}

#[derive(Debug, Default)]
struct TicketRing {
    levels: [Vec<Arc<Arena>>; NUM_PRIORITY_LEVELS],
}

#[derive(Debug)]
pub(crate) struct ThreadDispatcher {
    tickets: RwLock<TicketRing>,
    monitor: Monitor,
    /// Net worker demand last issued by the permit manager.
    demand: AtomicIsize,
    stop: AtomicBool,
    /// Maximal number of worker threads ever created.
    hard_limit: usize,
    server: ServerKind,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

// === impl ThreadDispatcher ===

impl ThreadDispatcher {
    pub(crate) fn new(hard_limit: usize) -> Self {
        let server = resolve_server();
        tracing::debug!(hard_limit, ?server, "thread dispatcher created");
        Self {
            tickets: RwLock::new(TicketRing::default()),
            monitor: Monitor::new(),
            demand: AtomicIsize::new(0),
            stop: AtomicBool::new(false),
            hard_limit,
            server,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn insert_ticket(&self, arena: &Arc<Arena>) {
        let mut ring = self.tickets.write().unwrap_or_else(|e| e.into_inner());
        ring.levels[arena.priority_level()].push(arena.clone());
    }

    pub(crate) fn remove_ticket(&self, arena: &Arc<Arena>) {
        let mut ring = self.tickets.write().unwrap_or_else(|e| e.into_inner());
        ring.levels[arena.priority_level()].retain(|ticket| !Arc::ptr_eq(ticket, arena));
    }

    /// Find an arena wanting more workers: scan once around the ring from
    /// `prev` (highest non-empty priority first), attempting a conditional
    /// join on each candidate.
    pub(crate) fn ticket_in_need(&self, prev: Option<&Arc<Arena>>) -> Option<Arc<Arena>> {
        let ring = self.tickets.read().unwrap_or_else(|e| e.into_inner());
        let order: Vec<&Arc<Arena>> = ring.levels.iter().flatten().collect();
        if order.is_empty() {
            return None;
        }

        let start = prev
            .and_then(|prev| order.iter().position(|arena| Arc::ptr_eq(arena, prev)))
            .map_or(0, |position| position + 1);

        for offset in 0..order.len() {
            let arena = order[(start + offset) % order.len()];
            if arena.try_join_worker() {
                return Some(arena.clone());
            }
        }
        None
    }

    /// Whether any registered arena currently wants more workers. Used as
    /// the double-check before a worker commits its sleep.
    pub(crate) fn any_in_need(&self) -> bool {
        let ring = self.tickets.read().unwrap_or_else(|e| e.into_inner());
        ring.levels
            .iter()
            .flatten()
            .any(|arena| arena.num_workers_active() < arena.allotted())
    }

    /// Forwarded from the permit manager through its ticket serializer, so
    /// concurrent demand changes arrive as one net delta each, in order.
    pub(crate) fn adjust_job_count_estimate(&self, delta: isize, control: &Arc<ThreadingControl>) {
        debug_assert!(delta != 0);
        let updated = self.demand.fetch_add(delta, Ordering::AcqRel) + delta;
        tracing::trace!(delta, demand = updated, "adjusted job count estimate");

        if delta > 0 {
            let target = usize::try_from(updated.max(0)).unwrap_or(0);
            self.ensure_workers(target, control);
            self.monitor.notify_all();
        }
    }

    /// Lazily bring worker threads into existence, up to the hard limit.
    fn ensure_workers(&self, target: usize, control: &Arc<ThreadingControl>) {
        let target = target.min(self.hard_limit);
        let mut workers = lock(&self.workers);
        while workers.len() < target {
            let index = workers.len();
            let control = control.clone();
            let stack_size = crate::control::active_stack_size();

            let mut builder = thread::Builder::new().name(format!("weft-worker-{index}"));
            if stack_size != 0 {
                builder = builder.stack_size(stack_size);
            }

            match builder.spawn(move || worker_main(&control, index)) {
                Ok(handle) => workers.push(handle),
                Err(error) => {
                    tracing::warn!(%error, "failed to spawn a worker thread");
                    break;
                }
            }
        }
    }

    pub(crate) fn num_started_workers(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Stop all workers and join them. Only called from outside the pool.
    pub(crate) fn stop_and_join(&self) {
        tracing::debug!(server = ?self.server, "stopping the worker pool");
        self.stop.store(true, Ordering::SeqCst);
        self.monitor.abort_all();

        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// One worker thread's lifetime: serve arenas in need, sleep when none are.
fn worker_main(control: &Arc<ThreadingControl>, index: usize) {
    let _span = tracing::debug_span!("worker main loop", worker = index).entered();
    crate::scheduler::register_worker_thread(control, index);

    let dispatcher = control.dispatcher();
    let node = WaitNode::new();
    let mut last_ticket: Option<Arc<Arena>> = None;

    loop {
        for pass in 0..2 {
            while let Some(arena) = dispatcher.ticket_in_need(last_ticket.as_ref()) {
                last_ticket = Some(arena.clone());
                // drives the dispatch loop; pairs the worker reference taken
                // by `try_join_worker` with the leave below
                crate::scheduler::process_worker(&arena);
            }
            // a worker can get here before the permit manager decreased its
            // estimate; the yield keeps that window from spinning hot
            if pass == 0 {
                thread::yield_now();
            }
        }

        if dispatcher.is_stopping() {
            break;
        }

        dispatcher.monitor.prepare_wait(&node, index);
        if dispatcher.is_stopping() || dispatcher.any_in_need() {
            dispatcher.monitor.cancel_wait(&node);
            continue;
        }
        tracing::trace!(worker = index, "going to sleep");
        // an abort is just another wakeup here; the stop flag decides
        let _ = dispatcher.monitor.commit_wait(&node);
        tracing::trace!(worker = index, "woke up");
    }

    crate::scheduler::unregister_worker_thread(control);
    tracing::debug!(worker = index, "worker shut down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::RefKind;
    use crate::context::Priority;
    use crate::control::ThreadingControl;

    #[cfg(not(loom))]
    #[test]
    fn ticket_in_need_serves_higher_priorities_first() {
        let control = ThreadingControl::acquire();
        let dispatcher = ThreadDispatcher::new(4);
        assert_eq!(dispatcher.num_started_workers(), 0);

        let normal = Arena::new(control.clone(), 3, 1, Priority::Normal);
        let high = Arena::new(control, 3, 1, Priority::High);
        dispatcher.insert_ticket(&normal);
        dispatcher.insert_ticket(&high);
        normal.set_allotted(1);
        high.set_allotted(1);
        assert!(dispatcher.any_in_need());

        let first = dispatcher.ticket_in_need(None).expect("someone in need");
        assert!(Arc::ptr_eq(&first, &high));

        // scanning continues after the previously served ticket
        let second = dispatcher
            .ticket_in_need(Some(&first))
            .expect("the normal arena still wants a worker");
        assert!(Arc::ptr_eq(&second, &normal));

        // both allotments are exhausted now
        assert!(dispatcher.ticket_in_need(Some(&second)).is_none());
        assert!(!dispatcher.any_in_need());

        high.on_thread_leaving(RefKind::Worker);
        normal.on_thread_leaving(RefKind::Worker);

        dispatcher.remove_ticket(&high);
        dispatcher.remove_ticket(&normal);
        assert!(dispatcher.ticket_in_need(None).is_none());
    }
}
