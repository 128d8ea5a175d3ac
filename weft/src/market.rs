// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The permit manager: divides the worker budget among arenas.
//!
//! Every arena owns a [`PmClient`] tracking its demand window. The manager
//! keeps clients in priority-ordered lists, distributes `min(total demand,
//! soft limit)` workers by largest remainder with a running carry, and
//! serializes the resulting deltas towards the thread dispatcher through
//! numbered tickets so concurrent demand changes are observed in order.

use crate::arena::Arena;
use crate::loom::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use crate::loom::sync::{Condvar, Mutex};
use crate::stream::NUM_PRIORITY_LEVELS;
use crate::util::{condvar_wait, lock};
use std::sync::Arc;

/// Per-arena client of the permit manager.
#[derive(Debug)]
pub(crate) struct PmClient {
    arena: Arc<Arena>,
    min_workers: AtomicIsize,
    max_workers: AtomicIsize,
    top_priority: AtomicBool,
}

// === impl PmClient ===

impl PmClient {
    fn new(arena: Arc<Arena>) -> Arc<Self> {
        Arc::new(Self {
            arena,
            min_workers: AtomicIsize::new(0),
            max_workers: AtomicIsize::new(0),
            top_priority: AtomicBool::new(false),
        })
    }

    pub(crate) fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    pub(crate) fn min_workers(&self) -> isize {
        self.min_workers.load(Ordering::Relaxed)
    }

    pub(crate) fn max_workers(&self) -> isize {
        self.max_workers.load(Ordering::Relaxed)
    }

    pub(crate) fn is_top_priority(&self) -> bool {
        self.top_priority.load(Ordering::Relaxed)
    }

    fn set_top_priority(&self, top: bool) {
        self.top_priority.store(top, Ordering::Relaxed);
    }

    fn priority_level(&self) -> usize {
        self.arena.priority_level()
    }

    /// Fold a demand change into the window; returns the change of the
    /// upper bound. Called under the manager's list lock.
    fn update_request(&self, mandatory_delta: isize, workers_delta: isize) -> isize {
        let (min, max) = self.arena.update_request(mandatory_delta, workers_delta);
        let delta = max - self.max_workers.load(Ordering::Relaxed);
        self.min_workers.store(min, Ordering::Relaxed);
        self.max_workers.store(max, Ordering::Relaxed);
        delta
    }
}

/// Orders the permit manager's calls into the OS-facing worker-count
/// adjuster: tickets are committed under the list lock and waited on outside
/// it, so concurrent demand changes issue one net delta each, in order.
#[derive(Debug)]
struct RequestSerializer {
    current: Mutex<u64>,
    turn: Condvar,
}

// === impl RequestSerializer ===

impl RequestSerializer {
    fn new() -> Self {
        Self {
            current: Mutex::new(0),
            turn: Condvar::new(),
        }
    }

    fn wait_for_ticket(&self, seq: u64) {
        let mut current = lock(&self.current);
        while *current != seq {
            current = condvar_wait(&self.turn, current);
        }
    }

    fn complete_ticket(&self) {
        let mut current = lock(&self.current);
        *current += 1;
        drop(current);
        self.turn.notify_all();
    }
}

#[derive(Debug, Default)]
struct Lists {
    levels: [Vec<Arc<PmClient>>; NUM_PRIORITY_LEVELS],
    /// Σ of client demand across all levels.
    total_demand: isize,
    /// Worker count last issued to the dispatcher.
    issued: isize,
    next_seq: u64,
}

/// A committed demand change: the ticket to wait on and the net delta for
/// the dispatcher.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DemandTicket {
    pub(crate) seq: u64,
    pub(crate) delta: isize,
}

#[derive(Debug)]
pub(crate) struct Market {
    lists: Mutex<Lists>,
    soft_limit: AtomicUsize,
    hard_limit: usize,
    /// Arenas currently under mandatory concurrency.
    mandatory_requests: AtomicIsize,
    serializer: RequestSerializer,
}

// === impl Market ===

impl Market {
    pub(crate) fn new(soft_limit: usize, hard_limit: usize) -> Self {
        Self {
            lists: Mutex::new(Lists::default()),
            soft_limit: AtomicUsize::new(soft_limit),
            hard_limit,
            mandatory_requests: AtomicIsize::new(0),
            serializer: RequestSerializer::new(),
        }
    }

    pub(crate) fn soft_limit(&self) -> usize {
        self.soft_limit.load(Ordering::Acquire)
    }

    pub(crate) fn hard_limit(&self) -> usize {
        self.hard_limit
    }

    pub(crate) fn insert_arena(&self, arena: &Arc<Arena>) {
        let client = PmClient::new(arena.clone());
        let mut lists = lock(&self.lists);
        lists.levels[client.priority_level()].push(client);
        self.refresh_top_priority(&mut lists);
    }

    /// Fold a demand change and commit a ticket for it.
    pub(crate) fn request_demand(
        &self,
        arena: &Arc<Arena>,
        mandatory_delta: isize,
        workers_delta: isize,
    ) -> DemandTicket {
        let mut lists = lock(&self.lists);

        if mandatory_delta != 0 {
            self.mandatory_requests
                .fetch_add(mandatory_delta, Ordering::SeqCst);
        }

        if let Some(client) = Self::client_of(&lists, arena) {
            let delta = client.update_request(mandatory_delta, workers_delta);
            lists.total_demand += delta;
        }

        self.update_allotment(&mut lists);
        self.commit_ticket(&mut lists)
    }

    /// Retract the arena's whole demand (it observed itself empty).
    pub(crate) fn zero_demand(&self, arena: &Arc<Arena>, mandatory_delta: isize) -> DemandTicket {
        let retract = -arena.requested();
        self.request_demand(arena, mandatory_delta, retract)
    }

    /// Re-distribute the soft limit after a global-control change. Returns
    /// the ticket plus the arenas that should re-advertise their work.
    pub(crate) fn set_active_num_workers(&self, soft: usize) -> (DemandTicket, Vec<Arc<Arena>>) {
        let mut lists = lock(&self.lists);
        self.soft_limit.store(soft, Ordering::Release);
        self.update_allotment(&mut lists);
        let ticket = self.commit_ticket(&mut lists);

        let wake = lists
            .levels
            .iter()
            .flatten()
            .map(|client| client.arena().clone())
            .collect();
        (ticket, wake)
    }

    /// Remove the arena if it is still dead: no references, matching ABA
    /// epoch and no leftover work. Returns a ticket when it was removed.
    pub(crate) fn try_destroy_arena(
        &self,
        arena: &Arc<Arena>,
        aba_epoch: usize,
    ) -> Option<DemandTicket> {
        let mut lists = lock(&self.lists);

        if arena.aba_epoch() != aba_epoch || arena.has_references() || !arena.is_pool_empty() {
            return None;
        }

        let level = arena.priority_level();
        let before = lists.levels[level].len();
        lists.levels[level].retain(|client| !Arc::ptr_eq(client.arena(), arena));
        if lists.levels[level].len() == before {
            // not registered (already removed, or never inserted)
            return None;
        }

        lists.total_demand -= arena.requested().max(0);
        if arena.is_mandatory() {
            self.mandatory_requests.fetch_sub(1, Ordering::SeqCst);
        }
        self.refresh_top_priority(&mut lists);
        self.update_allotment(&mut lists);

        tracing::debug!(epoch = aba_epoch, "arena destroyed");
        Some(self.commit_ticket(&mut lists))
    }

    /// Serialize the ticket's delta into `issue`, in ticket order.
    pub(crate) fn issue_ticket(&self, ticket: DemandTicket, issue: impl FnOnce(isize)) {
        self.serializer.wait_for_ticket(ticket.seq);
        if ticket.delta != 0 {
            issue(ticket.delta);
        }
        self.serializer.complete_ticket();
    }

    /// The allotment pass. Called under the list lock.
    ///
    /// `effective = min(total demand, soft limit)` workers are distributed
    /// over the top-priority level by largest remainder with a running
    /// carry, clamped per arena; lower levels get whatever is left. Under a
    /// zero soft limit, arenas with mandatory requests still get one worker.
    fn update_allotment(&self, lists: &mut Lists) {
        let soft = isize::try_from(self.soft_limit()).unwrap_or(isize::MAX);
        let mandatory_on = soft == 0 && self.mandatory_requests.load(Ordering::SeqCst) > 0;
        let mut available = lists.total_demand.min(soft).max(0);

        for level in &lists.levels {
            let level_demand: isize = level
                .iter()
                .map(|client| client.max_workers().max(0))
                .sum();

            if level_demand > 0 && available > 0 {
                let budget = level_demand.min(available);
                let mut carry = 0;
                let mut assigned = 0;
                for client in level {
                    let requested = client.max_workers();
                    if requested <= 0 {
                        client.arena().set_allotted(Self::mandatory_floor(client, mandatory_on, 0));
                        continue;
                    }
                    let tmp = requested * budget + carry;
                    let share = tmp / level_demand;
                    carry = tmp % level_demand;
                    let allotted = share.min(isize::try_from(client.arena().max_workers()).unwrap_or(isize::MAX));
                    let allotted = usize::try_from(allotted.max(0)).unwrap_or(0);
                    let allotted = Self::mandatory_floor(client, mandatory_on, allotted);
                    client.arena().set_allotted(allotted);
                    assigned += isize::try_from(allotted).unwrap_or(0);
                }
                debug_assert!(assigned <= budget);
                available -= level_demand;
                available = available.max(0);
            } else {
                for client in level {
                    client
                        .arena()
                        .set_allotted(Self::mandatory_floor(client, mandatory_on, 0));
                }
            }
        }
    }

    /// Mandatory concurrency floor: one worker even when the distribution
    /// yielded none.
    fn mandatory_floor(client: &PmClient, mandatory_on: bool, allotted: usize) -> usize {
        if allotted == 0
            && mandatory_on
            && (client.arena().is_mandatory() || client.min_workers() > 0)
        {
            1
        } else {
            allotted
        }
    }

    fn refresh_top_priority(&self, lists: &mut Lists) {
        let top = lists
            .levels
            .iter()
            .position(|level| !level.is_empty())
            .unwrap_or(NUM_PRIORITY_LEVELS);
        for (index, level) in lists.levels.iter().enumerate() {
            for client in level {
                client.set_top_priority(index == top);
            }
        }
    }

    /// Compute the net dispatcher delta for the current state and commit a
    /// ticket for it. Called under the list lock.
    fn commit_ticket(&self, lists: &mut Lists) -> DemandTicket {
        let soft = isize::try_from(self.soft_limit()).unwrap_or(isize::MAX);
        let mut effective = lists.total_demand.min(soft).max(0);
        if soft == 0 && self.mandatory_requests.load(Ordering::SeqCst) > 0 {
            effective = 1;
        }
        let delta = effective - lists.issued;
        lists.issued = effective;

        let seq = lists.next_seq;
        lists.next_seq += 1;
        DemandTicket { seq, delta }
    }

    fn client_of(lists: &Lists, arena: &Arc<Arena>) -> Option<Arc<PmClient>> {
        lists
            .levels
            .iter()
            .flatten()
            .find(|client| Arc::ptr_eq(client.arena(), arena))
            .cloned()
    }

    #[cfg(test)]
    fn top_priority_arenas(&self) -> Vec<Arc<Arena>> {
        lock(&self.lists)
            .levels
            .iter()
            .flatten()
            .filter(|client| client.is_top_priority())
            .map(|client| client.arena().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Priority;
    use crate::control::ThreadingControl;

    #[cfg(not(loom))]
    #[test]
    fn allotment_is_proportional_with_carry_and_clamped() {
        let control = ThreadingControl::acquire();
        let market = Market::new(4, market_hard_limit());
        let big = Arena::new(control.clone(), 9, 1, Priority::Normal);
        let small = Arena::new(control, 5, 1, Priority::Normal);
        market.insert_arena(&big);
        market.insert_arena(&small);

        let first = market.request_demand(&big, 0, 8);
        assert_eq!(first.delta, 4, "capped by the soft limit");
        let second = market.request_demand(&small, 0, 4);
        assert_eq!(second.delta, 0, "the soft limit was already exhausted");

        // demand 8:4 over 4 workers, largest remainder with carry
        assert_eq!(big.allotted(), 2);
        assert_eq!(small.allotted(), 2);
        assert!(big.allotted() + small.allotted() <= market.soft_limit());

        // the small arena retires; the big one takes the freed budget
        let retract = market.zero_demand(&small, 0);
        assert_eq!(retract.delta, 0, "total demand still exceeds the limit");
        assert_eq!(big.allotted(), 4);
        assert_eq!(small.allotted(), 0);
    }

    #[cfg(not(loom))]
    fn market_hard_limit() -> usize {
        8
    }

    #[cfg(not(loom))]
    #[test]
    fn mandatory_request_grants_one_worker_under_zero_soft_limit() {
        let control = ThreadingControl::acquire();
        let market = Market::new(0, market_hard_limit());
        let arena = Arena::new(control, 2, 1, Priority::Normal);
        market.insert_arena(&arena);

        let enable = market.request_demand(&arena, 1, 0);
        assert_eq!(enable.delta, 1, "one worker in spite of the zero limit");
        assert_eq!(arena.allotted(), 1);

        let disable = market.request_demand(&arena, -1, 0);
        assert_eq!(disable.delta, -1);
        assert_eq!(arena.allotted(), 0);
    }

    #[cfg(not(loom))]
    #[test]
    fn top_priority_tracks_the_highest_populated_level() {
        let control = ThreadingControl::acquire();
        let market = Market::new(4, market_hard_limit());
        assert!(market.hard_limit() >= market.soft_limit());

        let low = Arena::new(control.clone(), 2, 1, Priority::Low);
        market.insert_arena(&low);
        assert_eq!(market.top_priority_arenas().len(), 1);

        let high = Arena::new(control, 2, 1, Priority::High);
        market.insert_arena(&high);

        let top = market.top_priority_arenas();
        assert_eq!(top.len(), 1);
        assert!(Arc::ptr_eq(&top[0], &high));
    }
}
