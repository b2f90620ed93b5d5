//! Server-wide ledger of seats held by limited priority levels.
//!
//! Every limited level's current budget is drawn from this pool, so the sum
//! of all budgets never exceeds the server concurrency limit. Levels shrink
//! toward their targets as their own requests finish and give the freed seats
//! back here; the pool then offers them to levels still below target.
//!
//! Lock order is level state first, pool second. The pool never calls into a
//! level while holding its own lock.

use crate::application::queueset::QueueSet;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Requests sent from the request path to the config controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nudge {
    /// A level wants its lent seats back
    Rebalance,
    /// A level removed from configuration went idle
    Reap,
}

#[derive(Debug, Default)]
struct PoolState {
    allocated: u32,
    members: Vec<Weak<QueueSet>>,
}

/// Shared seat ledger.
#[derive(Debug)]
pub struct SeatPool {
    server_limit: u32,
    state: Mutex<PoolState>,
    nudges: Sender<Nudge>,
}

impl SeatPool {
    /// Create a pool of `server_limit` seats that reports to `nudges`.
    pub fn new(server_limit: u32, nudges: Sender<Nudge>) -> Self {
        Self {
            server_limit,
            state: Mutex::new(PoolState::default()),
            nudges,
        }
    }

    pub fn server_limit(&self) -> u32 {
        self.server_limit
    }

    /// Seats currently held by levels.
    pub fn allocated(&self) -> u32 {
        self.state.lock().allocated
    }

    /// Seats no level holds.
    pub fn free(&self) -> u32 {
        self.server_limit - self.state.lock().allocated
    }

    /// Track a level so it is offered returned seats.
    pub fn register(&self, level: &Arc<QueueSet>) {
        let mut state = self.state.lock();
        state.members.retain(|m| m.strong_count() > 0);
        state.members.push(Arc::downgrade(level));
    }

    /// Take up to `want` seats. Returns how many were granted.
    pub(crate) fn take(&self, want: u32) -> u32 {
        let mut state = self.state.lock();
        let granted = want.min(self.server_limit - state.allocated);
        state.allocated += granted;
        granted
    }

    /// Return seats to the pool.
    pub(crate) fn give_back(&self, seats: u32) {
        let mut state = self.state.lock();
        debug_assert!(state.allocated >= seats);
        state.allocated = state.allocated.saturating_sub(seats);
    }

    /// Offer free seats to every level below its target.
    ///
    /// Must be called with no level lock held.
    pub fn grant_waiting(&self) {
        let members: Vec<Arc<QueueSet>> = {
            let mut state = self.state.lock();
            state.members.retain(|m| m.strong_count() > 0);
            state.members.iter().filter_map(Weak::upgrade).collect()
        };
        for level in members {
            if self.free() == 0 {
                break;
            }
            level.grow_toward_target();
        }
    }

    /// Ask the controller for work. Nudges coalesce while one is pending.
    pub(crate) fn nudge(&self, nudge: Nudge) {
        let _ = self.nudges.try_send(nudge);
    }
}
