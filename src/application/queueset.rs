//! Per-priority-level admission state.
//!
//! A `QueueSet` owns one level's seat budget and, for levels that queue, a
//! set of fair queues. Requests that cannot run at once are placed into one
//! of a few candidate queues dealt by shuffle sharding, and dispatched in
//! order of their virtual finish times as seats free up:
//!
//! - on enqueue, `start = max(V, queue.last_finish)` and
//!   `finish = start + seats * estimated_service`;
//! - dispatch always takes the waiting head with the smallest finish time,
//!   and stops as soon as that head does not fit in the free seats;
//! - on dispatch, the level's virtual clock `V` advances to the head's finish.
//!
//! A flow with many queued requests therefore cannot starve a flow that
//! arrives later: the newcomer's finish times start from `V`.
//!
//! All state sits behind one mutex. The waiter blocks outside the lock on a
//! select over its dispatch signal, its context and its deadline.

use crate::application::context::RequestContext;
use crate::application::ports::Clock;
use crate::application::seat_pool::{Nudge, SeatPool};
use crate::domain::config::{LimitResponse, QueuingConfig};
use crate::domain::shuffle::{Dealer, DealerError};
use crate::domain::work::{RejectReason, WorkEstimate};
use crossbeam_channel::{select, Sender};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Runtime queuing parameters of a limited level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueuingSettings {
    pub limit_response: LimitResponse,
    /// Longest a request may wait in a queue
    pub request_wait_limit: Duration,
    /// Assumed execution time per seat, used for virtual time and wait estimates
    pub estimated_service: Duration,
}

impl Default for QueuingSettings {
    fn default() -> Self {
        Self {
            limit_response: LimitResponse::Queue(QueuingConfig::default()),
            request_wait_limit: Duration::from_secs(15),
            estimated_service: Duration::from_secs(1),
        }
    }
}

/// A level's share of the server's seats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Budget {
    /// Seats owned by configured shares
    pub nominal: u32,
    /// Seats the controller wants this level to hold
    pub target: u32,
    /// Seats actually drawn from the pool
    pub allocated: u32,
}

/// Result of asking a level to run a request.
#[derive(Debug)]
pub enum Admission {
    /// The request holds seats and must run; dropping the permit releases them
    Dispatched(ExecutionPermit),
    /// The request will not run. `waited` is set when it spent time queued.
    Rejected {
        reason: RejectReason,
        waited: Option<Duration>,
    },
}

/// Seats held by one executing request.
#[derive(Debug)]
pub struct ExecutionPermit {
    level: Arc<QueueSet>,
    queue: Option<usize>,
    seats: u32,
    waited: Option<Duration>,
    released: bool,
}

impl ExecutionPermit {
    pub fn seats(&self) -> u32 {
        self.seats
    }

    /// Time spent queued, if the request was queued at all.
    pub fn waited(&self) -> Option<Duration> {
        self.waited
    }

    /// Return the seats and let waiting requests run.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.level.finish(self.queue, self.seats);
        }
    }
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Point-in-time view of one queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub index: usize,
    pub waiting: usize,
    pub seats_waiting: u32,
    pub executing: u32,
    pub seats_in_use: u32,
    pub virtual_finish: f64,
}

/// Point-in-time view of a level.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSetSnapshot {
    pub name: String,
    pub exempt: bool,
    pub budget: Budget,
    pub seats_in_use: u32,
    pub executing: u32,
    pub waiting: u32,
    pub seats_waiting: u32,
    pub virtual_time: f64,
    pub queues: Vec<QueueSnapshot>,
    pub dispatched: u64,
    pub rejected: BTreeMap<&'static str, u64>,
    pub idle: bool,
}

#[derive(Debug)]
struct Waiting {
    id: u64,
    seats: u32,
    virtual_finish: f64,
    wake: Sender<()>,
}

#[derive(Debug)]
struct FairQueue {
    requests: VecDeque<Waiting>,
    last_finish: f64,
    seats_waiting: u32,
    executing: u32,
    seats_in_use: u32,
}

impl FairQueue {
    fn new(virtual_time: f64) -> Self {
        Self {
            requests: VecDeque::new(),
            last_finish: virtual_time,
            seats_waiting: 0,
            executing: 0,
            seats_in_use: 0,
        }
    }

    fn is_active(&self) -> bool {
        !self.requests.is_empty() || self.executing > 0
    }

    fn effective_finish(&self, virtual_time: f64) -> f64 {
        self.last_finish.max(virtual_time)
    }
}

#[derive(Debug)]
struct State {
    settings: QueuingSettings,
    dealer: Option<Dealer>,
    desired_queues: usize,
    queues: Vec<FairQueue>,
    virtual_time: f64,
    robin_index: usize,
    budget: Budget,
    seats_in_use: u32,
    executing: u32,
    waiting: u32,
    seats_waiting: u32,
    demand_watermark: u32,
    next_id: u64,
    idle_since: Option<Instant>,
    dispatched: u64,
    rejected: BTreeMap<&'static str, u64>,
}

impl State {
    fn new(settings: QueuingSettings, dealer: Option<Dealer>, nominal: u32, now: Instant) -> Self {
        let mut state = Self {
            settings,
            dealer,
            desired_queues: 0,
            queues: Vec::new(),
            virtual_time: 0.0,
            robin_index: 0,
            budget: Budget {
                nominal,
                target: nominal,
                allocated: 0,
            },
            seats_in_use: 0,
            executing: 0,
            waiting: 0,
            seats_waiting: 0,
            demand_watermark: 0,
            next_id: 0,
            idle_since: Some(now),
            dispatched: 0,
            rejected: BTreeMap::new(),
        };
        state.resize_queues();
        state
    }

    fn resize_queues(&mut self) {
        self.desired_queues = self.dealer.map_or(0, |d| d.deck_size() as usize);
        while self.queues.len() < self.desired_queues {
            self.queues.push(FairQueue::new(self.virtual_time));
        }
        self.trim_surplus();
    }

    /// Drop trailing queues beyond the configured count once they drain.
    fn trim_surplus(&mut self) {
        while self.queues.len() > self.desired_queues
            && self.queues.last().is_some_and(|q| !q.is_active())
        {
            self.queues.pop();
        }
    }

    fn available(&self) -> u32 {
        self.budget.allocated.saturating_sub(self.seats_in_use)
    }

    fn is_lending(&self) -> bool {
        self.budget.target < self.budget.nominal
    }

    fn clamp_seats(&self, seats: u32) -> u32 {
        let ceiling = self.budget.allocated.max(self.budget.nominal).max(1);
        seats.clamp(1, ceiling)
    }

    fn note_demand(&mut self, seats: u32) {
        let wanted = self.seats_in_use + self.seats_waiting + seats;
        self.demand_watermark = self.demand_watermark.max(wanted);
    }

    fn record_rejection(&mut self, reason: RejectReason) {
        *self.rejected.entry(reason.as_str()).or_default() += 1;
    }

    fn start_executing(&mut self, queue: Option<usize>, seats: u32) {
        self.seats_in_use += seats;
        self.executing += 1;
        self.dispatched += 1;
        self.idle_since = None;
        if let Some(q) = queue.and_then(|i| self.queues.get_mut(i)) {
            q.executing += 1;
            q.seats_in_use += seats;
        }
    }

    fn mark_idle_if_quiet(&mut self, now: Instant) {
        if self.executing == 0 && self.waiting == 0 && self.idle_since.is_none() {
            self.idle_since = Some(now);
        }
    }

    /// Pick the queue from the flow's hand with the earliest tail finish time.
    fn choose_queue(&self, hash: u64) -> Option<usize> {
        let dealer = self.dealer?;
        let v = self.virtual_time;
        let mut best: Option<usize> = None;
        dealer.deal(hash, |card| {
            let candidate = &self.queues[card];
            let better = match best {
                None => true,
                Some(b) => {
                    let current = &self.queues[b];
                    (candidate.effective_finish(v), candidate.requests.len(), card)
                        < (current.effective_finish(v), current.requests.len(), b)
                }
            };
            if better {
                best = Some(card);
            }
        });
        best
    }

    /// Expected time until a request of `seats` at the tail of `index` runs.
    fn estimated_wait(&self, index: usize, seats: u32) -> Duration {
        let queue = &self.queues[index];
        let backlog = queue.seats_waiting + seats;
        let mut active = self.queues.iter().filter(|q| q.is_active()).count();
        if !queue.is_active() {
            active += 1;
        }
        let capacity = self.budget.allocated.max(self.budget.nominal).max(1);
        let per_queue = f64::from(capacity) / active as f64;
        self.settings
            .estimated_service
            .mul_f64(f64::from(backlog) / per_queue)
    }

    fn enqueue(&mut self, index: usize, seats: u32, wake: Sender<()>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let cost = self.settings.estimated_service.as_secs_f64() * f64::from(seats);
        let v = self.virtual_time;
        let queue = &mut self.queues[index];
        let finish = queue.last_finish.max(v) + cost;
        queue.last_finish = finish;
        queue.seats_waiting += seats;
        queue.requests.push_back(Waiting {
            id,
            seats,
            virtual_finish: finish,
            wake,
        });
        self.waiting += 1;
        self.seats_waiting += seats;
        self.idle_since = None;
        id
    }

    /// Take a request out of its queue. False if it was already dispatched.
    fn remove_waiting(&mut self, index: usize, id: u64) -> bool {
        let Some(queue) = self.queues.get_mut(index) else {
            return false;
        };
        let Some(pos) = queue.requests.iter().position(|r| r.id == id) else {
            return false;
        };
        let Some(removed) = queue.requests.remove(pos) else {
            return false;
        };
        queue.seats_waiting -= removed.seats;
        self.waiting -= 1;
        self.seats_waiting -= removed.seats;
        self.dispatch();
        self.trim_surplus();
        true
    }

    /// Index of the waiting head with the smallest finish time.
    ///
    /// Ties go to the first queue at or after the round-robin index.
    fn next_head(&self) -> Option<usize> {
        let n = self.queues.len();
        let mut best: Option<(usize, f64)> = None;
        for offset in 0..n {
            let index = (self.robin_index + offset) % n;
            if let Some(head) = self.queues[index].requests.front() {
                if best.map_or(true, |(_, finish)| head.virtual_finish < finish) {
                    best = Some((index, head.virtual_finish));
                }
            }
        }
        best.map(|(index, _)| index)
    }

    /// Dispatch waiting heads while they fit.
    fn dispatch(&mut self) -> u32 {
        let mut count = 0;
        while let Some(index) = self.next_head() {
            let Some(seats) = self.queues[index].requests.front().map(|r| r.seats) else {
                break;
            };
            if self.seats_in_use + seats > self.budget.allocated {
                break;
            }
            let Some(request) = self.queues[index].requests.pop_front() else {
                break;
            };
            self.queues[index].seats_waiting -= request.seats;
            self.waiting -= 1;
            self.seats_waiting -= request.seats;
            self.start_executing(Some(index), request.seats);
            self.virtual_time = self.virtual_time.max(request.virtual_finish);
            self.robin_index = (index + 1) % self.queues.len();
            let _ = request.wake.try_send(());
            count += 1;
        }
        count
    }

    /// Give back seats above target that no request is using.
    fn shrink_to_target(&mut self) -> u32 {
        let excess = self.budget.allocated.saturating_sub(self.budget.target);
        let give = excess.min(self.available());
        self.budget.allocated -= give;
        give
    }
}

/// Admission state of one priority level.
#[derive(Debug)]
pub struct QueueSet {
    name: String,
    /// `None` for exempt levels
    pool: Option<Arc<SeatPool>>,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

fn dealer_for(settings: &QueuingSettings) -> Result<Option<Dealer>, DealerError> {
    match settings.limit_response {
        LimitResponse::Queue(queuing) => Dealer::new(queuing.queues, queuing.hand_size).map(Some),
        LimitResponse::Reject => Ok(None),
    }
}

impl QueueSet {
    /// An exempt level: no budget, no queues, only execution counts.
    pub fn exempt(name: &str, clock: Arc<dyn Clock>) -> Arc<Self> {
        let now = clock.now();
        Arc::new(Self {
            name: name.to_string(),
            pool: None,
            clock,
            state: Mutex::new(State::new(QueuingSettings::default(), None, 0, now)),
        })
    }

    /// A limited level drawing seats from `pool`.
    ///
    /// The level starts with a target of `nominal` seats and no allocation;
    /// call [`grow_toward_target`](Self::grow_toward_target) to fill it.
    pub fn limited(
        name: &str,
        settings: QueuingSettings,
        nominal: u32,
        pool: Arc<SeatPool>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, DealerError> {
        let dealer = dealer_for(&settings)?;
        let now = clock.now();
        let level = Arc::new(Self {
            name: name.to_string(),
            pool: Some(Arc::clone(&pool)),
            clock,
            state: Mutex::new(State::new(settings, dealer, nominal, now)),
        });
        pool.register(&level);
        Ok(level)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_exempt(&self) -> bool {
        self.pool.is_none()
    }

    /// Apply new settings in place. Surplus queues drain before they go away.
    pub fn reconfigure(&self, settings: QueuingSettings, nominal: u32) -> Result<(), DealerError> {
        if self.is_exempt() {
            return Ok(());
        }
        let dealer = dealer_for(&settings)?;
        let mut state = self.state.lock();
        state.settings = settings;
        state.dealer = dealer;
        state.budget.nominal = nominal;
        state.resize_queues();
        state.dispatch();
        Ok(())
    }

    /// Run a request or decide not to, blocking while it waits in a queue.
    ///
    /// `note_queued` is called with `true` when the request is enqueued and
    /// with `false` exactly once when it leaves the queue. A request rejected
    /// without queuing gets `true` then `false`. Exempt levels and immediate
    /// dispatch never call it.
    ///
    /// Wait deadlines run on real time. The injected [`Clock`] only stamps
    /// wait durations and idleness, so a `MockClock` never times a waiter out.
    pub fn start_request(
        self: &Arc<Self>,
        ctx: &RequestContext,
        work: WorkEstimate,
        flow_hash: u64,
        note_queued: &mut dyn FnMut(bool),
    ) -> Admission {
        let Some(pool) = &self.pool else {
            let mut state = self.state.lock();
            state.start_executing(None, 0);
            return Admission::Dispatched(self.permit(None, work.seats, None));
        };

        let enqueued_at = self.clock.now();
        let mut state = self.state.lock();
        if self.fill_from_pool(&mut state) > 0 {
            // Seats drawn on arrival belong to earlier waiters first.
            state.dispatch();
        }
        let seats = state.clamp_seats(work.seats);
        state.note_demand(seats);

        if state.waiting == 0 && state.available() >= seats {
            state.start_executing(None, seats);
            return Admission::Dispatched(self.permit(None, seats, None));
        }

        let queuing = match state.settings.limit_response {
            LimitResponse::Queue(queuing) => queuing,
            LimitResponse::Reject => {
                return self.reject_now(state, RejectReason::Reject, note_queued);
            }
        };
        let Some(index) = state.choose_queue(flow_hash) else {
            return self.reject_now(state, RejectReason::QueueFull, note_queued);
        };
        if state.queues[index].requests.len() >= queuing.queue_length_limit as usize {
            return self.reject_now(state, RejectReason::QueueFull, note_queued);
        }
        let wait_limit = state.settings.request_wait_limit;
        if state.estimated_wait(index, seats) > wait_limit {
            return self.reject_now(state, RejectReason::WaitEstimate, note_queued);
        }

        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let id = state.enqueue(index, seats, wake_tx);
        let lending = state.is_lending();
        drop(state);

        if lending {
            pool.nudge(Nudge::Rebalance);
        }
        trace!(level = %self.name, queue = index, seats, "request queued");
        note_queued(true);

        let wait_deadline = Instant::now() + wait_limit;
        let deadline = ctx.deadline().map_or(wait_deadline, |d| d.min(wait_deadline));
        let outcome = select! {
            recv(wake_rx) -> _ => None,
            recv(ctx.done()) -> _ => Some(RejectReason::Cancelled),
            recv(crossbeam_channel::at(deadline)) -> _ => Some(RejectReason::TimeOut),
        };

        if let Some(reason) = outcome {
            let mut state = self.state.lock();
            if state.remove_waiting(index, id) {
                state.record_rejection(reason);
                let now = self.clock.now();
                state.mark_idle_if_quiet(now);
                drop(state);
                note_queued(false);
                debug!(level = %self.name, queue = index, %reason, "queued request abandoned");
                return Admission::Rejected {
                    reason,
                    waited: Some(now.saturating_duration_since(enqueued_at)),
                };
            }
            // Dispatched before we got the lock; the seats are already ours.
        }

        note_queued(false);
        let waited = self.clock.now().saturating_duration_since(enqueued_at);
        Admission::Dispatched(self.permit(Some(index), seats, Some(waited)))
    }

    fn reject_now(
        &self,
        mut state: MutexGuard<'_, State>,
        reason: RejectReason,
        note_queued: &mut dyn FnMut(bool),
    ) -> Admission {
        state.record_rejection(reason);
        let lending = state.is_lending();
        drop(state);
        if lending {
            if let Some(pool) = &self.pool {
                pool.nudge(Nudge::Rebalance);
            }
        }
        debug!(level = %self.name, %reason, "request rejected");
        note_queued(true);
        note_queued(false);
        Admission::Rejected {
            reason,
            waited: None,
        }
    }

    fn permit(self: &Arc<Self>, queue: Option<usize>, seats: u32, waited: Option<Duration>) -> ExecutionPermit {
        ExecutionPermit {
            level: Arc::clone(self),
            queue,
            seats,
            waited,
            released: false,
        }
    }

    fn finish(&self, queue: Option<usize>, seats: u32) {
        let now = self.clock.now();
        let Some(pool) = &self.pool else {
            let mut state = self.state.lock();
            state.executing = state.executing.saturating_sub(1);
            state.mark_idle_if_quiet(now);
            return;
        };

        let returned = {
            let mut state = self.state.lock();
            state.executing = state.executing.saturating_sub(1);
            state.seats_in_use = state.seats_in_use.saturating_sub(seats);
            if let Some(q) = queue.and_then(|i| state.queues.get_mut(i)) {
                q.executing = q.executing.saturating_sub(1);
                q.seats_in_use = q.seats_in_use.saturating_sub(seats);
            }
            let returned = state.shrink_to_target();
            if returned > 0 {
                pool.give_back(returned);
            }
            state.dispatch();
            state.trim_surplus();
            state.mark_idle_if_quiet(now);
            returned
        };
        if returned > 0 {
            trace!(level = %self.name, seats = returned, "seats returned to pool");
            pool.grant_waiting();
        }
    }

    fn fill_from_pool(&self, state: &mut State) -> u32 {
        let Some(pool) = &self.pool else {
            return 0;
        };
        let want = state.budget.target.saturating_sub(state.budget.allocated);
        if want == 0 {
            return 0;
        }
        let granted = pool.take(want);
        state.budget.allocated += granted;
        granted
    }

    /// Change nominal seats, keeping the queuing settings.
    pub fn set_nominal(&self, nominal: u32) {
        self.state.lock().budget.nominal = nominal;
    }

    /// Set the seat target, giving back unused seats above it at once.
    ///
    /// Seats in use above the target are returned as their requests finish.
    pub fn set_target(&self, target: u32) {
        let Some(pool) = &self.pool else {
            return;
        };
        let mut state = self.state.lock();
        state.budget.target = target;
        let returned = state.shrink_to_target();
        if returned > 0 {
            pool.give_back(returned);
        }
    }

    /// Draw free seats from the pool up to the target and dispatch.
    pub fn grow_toward_target(&self) {
        let mut state = self.state.lock();
        if self.fill_from_pool(&mut state) > 0 {
            state.dispatch();
        }
    }

    /// Peak seats wanted since the last call.
    pub fn take_demand(&self) -> u32 {
        let mut state = self.state.lock();
        let current = state.seats_in_use + state.seats_waiting;
        let demand = state.demand_watermark.max(current);
        state.demand_watermark = current;
        demand
    }

    pub fn budget(&self) -> Budget {
        self.state.lock().budget
    }

    /// When the level last became idle, if it is idle now.
    pub fn idle_since(&self) -> Option<Instant> {
        self.state.lock().idle_since
    }

    pub fn is_idle(&self) -> bool {
        self.idle_since().is_some()
    }

    pub fn snapshot(&self) -> QueueSetSnapshot {
        let state = self.state.lock();
        QueueSetSnapshot {
            name: self.name.clone(),
            exempt: self.is_exempt(),
            budget: state.budget,
            seats_in_use: state.seats_in_use,
            executing: state.executing,
            waiting: state.waiting,
            seats_waiting: state.seats_waiting,
            virtual_time: state.virtual_time,
            queues: state
                .queues
                .iter()
                .enumerate()
                .map(|(index, q)| QueueSnapshot {
                    index,
                    waiting: q.requests.len(),
                    seats_waiting: q.seats_waiting,
                    executing: q.executing,
                    seats_in_use: q.seats_in_use,
                    virtual_finish: q.last_finish,
                })
                .collect(),
            dispatched: state.dispatched,
            rejected: state.rejected.clone(),
            idle: state.idle_since.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::MockClock;
    use std::thread;

    fn pool(limit: u32) -> Arc<SeatPool> {
        let (tx, _rx) = crossbeam_channel::unbounded();
        Arc::new(SeatPool::new(limit, tx))
    }

    fn queuing(queues: u32, queue_length_limit: u32, hand_size: u32) -> QueuingSettings {
        QueuingSettings {
            limit_response: LimitResponse::Queue(QueuingConfig {
                queues,
                queue_length_limit,
                hand_size,
            }),
            request_wait_limit: Duration::from_secs(60),
            estimated_service: Duration::from_secs(1),
        }
    }

    fn level(settings: QueuingSettings, seats: u32) -> Arc<QueueSet> {
        let clock = Arc::new(MockClock::new(Instant::now()));
        let qs = QueueSet::limited("test", settings, seats, pool(seats), clock).unwrap();
        qs.grow_toward_target();
        qs
    }

    fn start(qs: &Arc<QueueSet>, seats: u32) -> Admission {
        qs.start_request(
            &RequestContext::background(),
            WorkEstimate::seats(seats),
            7,
            &mut |_| {},
        )
    }

    fn wait_until(qs: &QueueSet, what: &str, condition: impl Fn(&QueueSetSnapshot) -> bool) {
        for _ in 0..1000 {
            if condition(&qs.snapshot()) {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("never saw {what}");
    }

    fn wait_for_waiting(qs: &QueueSet, n: u32) {
        wait_until(qs, "the expected waiting count", |snap| snap.waiting == n);
    }

    #[test]
    fn test_immediate_dispatch_within_budget() {
        let qs = level(queuing(4, 10, 2), 2);
        let a = start(&qs, 1);
        let b = start(&qs, 1);
        assert!(matches!(a, Admission::Dispatched(_)));
        assert!(matches!(b, Admission::Dispatched(_)));
        assert_eq!(qs.snapshot().seats_in_use, 2);

        drop(a);
        drop(b);
        let snap = qs.snapshot();
        assert_eq!(snap.seats_in_use, 0);
        assert!(snap.idle);
    }

    #[test]
    fn test_seats_clamped_to_budget() {
        let qs = level(queuing(4, 10, 2), 3);
        match start(&qs, 50) {
            Admission::Dispatched(permit) => assert_eq!(permit.seats(), 3),
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[test]
    fn test_rejecting_level_never_queues() {
        let settings = QueuingSettings {
            limit_response: LimitResponse::Reject,
            ..QueuingSettings::default()
        };
        let qs = level(settings, 1);
        let _held = start(&qs, 1);

        let mut notes = Vec::new();
        let outcome = qs.start_request(
            &RequestContext::background(),
            WorkEstimate::default(),
            1,
            &mut |q| notes.push(q),
        );
        assert!(matches!(
            outcome,
            Admission::Rejected {
                reason: RejectReason::Reject,
                waited: None
            }
        ));
        assert_eq!(notes, vec![true, false]);
        assert_eq!(qs.snapshot().rejected["concurrency-limit"], 1);
    }

    #[test]
    fn test_queue_full_rejection() {
        let qs = level(queuing(1, 1, 1), 1);
        let _held = start(&qs, 1);

        let waiter = {
            let qs = Arc::clone(&qs);
            thread::spawn(move || matches!(start(&qs, 1), Admission::Dispatched(_)))
        };
        wait_for_waiting(&qs, 1);

        let outcome = start(&qs, 1);
        assert!(matches!(
            outcome,
            Admission::Rejected {
                reason: RejectReason::QueueFull,
                ..
            }
        ));

        drop(_held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_estimate_rejection() {
        let mut settings = queuing(1, 100, 1);
        settings.request_wait_limit = Duration::from_millis(1500);
        let qs = level(settings, 1);
        let held = start(&qs, 1);

        // One queued seat at 1s per seat is within the 1.5s limit.
        let waiter = {
            let qs = Arc::clone(&qs);
            thread::spawn(move || start(&qs, 1))
        };
        wait_for_waiting(&qs, 1);

        // A second would wait ~2s.
        assert!(matches!(
            start(&qs, 1),
            Admission::Rejected {
                reason: RejectReason::WaitEstimate,
                waited: None
            }
        ));
        drop(held);
        assert!(matches!(waiter.join().unwrap(), Admission::Dispatched(_)));
    }

    #[test]
    fn test_cancel_removes_waiter() {
        let qs = level(queuing(2, 10, 1), 1);
        let held = start(&qs, 1);

        let (ctx, cancel) = RequestContext::with_cancel();
        let waiter = {
            let qs = Arc::clone(&qs);
            thread::spawn(move || {
                let mut notes = Vec::new();
                let outcome =
                    qs.start_request(&ctx, WorkEstimate::default(), 3, &mut |q| notes.push(q));
                (outcome, notes)
            })
        };
        wait_for_waiting(&qs, 1);
        cancel.cancel();

        let (outcome, notes) = waiter.join().unwrap();
        assert!(matches!(
            outcome,
            Admission::Rejected {
                reason: RejectReason::Cancelled,
                waited: Some(_)
            }
        ));
        assert_eq!(notes, vec![true, false]);
        let snap = qs.snapshot();
        assert_eq!(snap.waiting, 0);
        assert_eq!(snap.seats_in_use, 1);
        drop(held);
    }

    #[test]
    fn test_deadline_times_out_waiter() {
        let qs = level(queuing(2, 10, 1), 1);
        let _held = start(&qs, 1);

        let ctx = RequestContext::background().with_timeout(Duration::from_millis(30));
        let outcome = qs.start_request(&ctx, WorkEstimate::default(), 3, &mut |_| {});
        assert!(matches!(
            outcome,
            Admission::Rejected {
                reason: RejectReason::TimeOut,
                ..
            }
        ));
        assert_eq!(qs.snapshot().waiting, 0);
    }

    #[test]
    fn test_large_head_blocks_smaller_followers() {
        let qs = level(queuing(1, 10, 1), 4);
        let held = start(&qs, 3);

        let big = {
            let qs = Arc::clone(&qs);
            thread::spawn(move || start(&qs, 4))
        };
        wait_for_waiting(&qs, 1);
        let small = {
            let qs = Arc::clone(&qs);
            thread::spawn(move || start(&qs, 1))
        };
        wait_for_waiting(&qs, 2);

        // One seat is free but the head needs four.
        assert_eq!(qs.snapshot().seats_in_use, 3);

        drop(held);
        let big = big.join().unwrap();
        assert!(matches!(big, Admission::Dispatched(ref p) if p.seats() == 4));
        drop(big);
        assert!(matches!(small.join().unwrap(), Admission::Dispatched(_)));
    }

    #[test]
    fn test_reconfigure_drains_surplus_queues() {
        let qs = level(queuing(8, 10, 2), 1);
        assert_eq!(qs.snapshot().queues.len(), 8);

        qs.reconfigure(queuing(2, 10, 1), 1).unwrap();
        assert_eq!(qs.snapshot().queues.len(), 2);
    }

    #[test]
    fn test_lower_target_returns_unused_seats() {
        let p = pool(4);
        let clock = Arc::new(MockClock::new(Instant::now()));
        let qs = QueueSet::limited("l", queuing(2, 10, 1), 4, Arc::clone(&p), clock).unwrap();
        qs.grow_toward_target();
        assert_eq!(p.free(), 0);

        let held = start(&qs, 3);
        qs.set_target(1);
        // Only the idle seat goes back now.
        assert_eq!(qs.budget().allocated, 3);
        assert_eq!(p.free(), 1);

        drop(held);
        assert_eq!(qs.budget().allocated, 1);
        assert_eq!(p.free(), 3);
    }

    #[test]
    fn test_seats_drawn_on_arrival_serve_earlier_waiters() {
        let p = pool(2);
        let clock = Arc::new(MockClock::new(Instant::now()));
        let other = QueueSet::limited("other", queuing(2, 10, 1), 1, Arc::clone(&p), clock.clone())
            .unwrap();
        other.grow_toward_target();
        let qs = QueueSet::limited("m", queuing(1, 10, 1), 2, Arc::clone(&p), clock).unwrap();
        qs.grow_toward_target();
        assert_eq!(qs.budget().allocated, 1);

        let held = start(&qs, 1);
        let first = {
            let qs = Arc::clone(&qs);
            thread::spawn(move || start(&qs, 1))
        };
        wait_for_waiting(&qs, 1);

        // A seat comes free without anyone offering it to `m`
        other.set_target(0);
        assert_eq!(p.free(), 1);

        // The next arrival draws it, and the earlier waiter gets it
        let second = {
            let qs = Arc::clone(&qs);
            thread::spawn(move || start(&qs, 1))
        };
        wait_until(&qs, "the earlier waiter running", |snap| {
            snap.seats_in_use == 2 && snap.waiting == 1
        });
        assert_eq!(qs.budget().allocated, 2);
        assert!(matches!(first.join().unwrap(), Admission::Dispatched(_)));

        drop(held);
        assert!(matches!(second.join().unwrap(), Admission::Dispatched(_)));
    }

    #[test]
    fn test_take_demand_resets_to_current() {
        let qs = level(queuing(2, 10, 1), 4);
        let a = start(&qs, 2);
        let b = start(&qs, 2);
        drop(b);
        assert_eq!(qs.take_demand(), 4);
        assert_eq!(qs.take_demand(), 2);
        drop(a);
        assert_eq!(qs.take_demand(), 2);
        assert_eq!(qs.take_demand(), 0);
    }

    #[test]
    fn test_exempt_counts_only() {
        let clock = Arc::new(MockClock::new(Instant::now()));
        let qs = QueueSet::exempt("exempt", clock);
        let permits: Vec<_> = (0..50).map(|_| start(&qs, 10)).collect();
        assert!(permits.iter().all(|a| matches!(a, Admission::Dispatched(_))));
        let snap = qs.snapshot();
        assert_eq!(snap.executing, 50);
        assert_eq!(snap.seats_in_use, 0);
        drop(permits);
        assert!(qs.is_idle());
    }
}
