//! Seat allocation across limited priority levels.
//!
//! Two computations live here:
//! - nominal seats, a static split of the server limit by concurrency shares;
//! - current targets, a dynamic split that lets idle levels lend seats to
//!   busy ones within each level's lending and borrowing bounds.
//!
//! Both are pure and deterministic: identical inputs give identical outputs,
//! and ties are always broken by level name.

use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Split `server_limit` seats by shares using the largest-remainder method.
///
/// The result sums to exactly `server_limit` whenever any level has shares.
pub fn nominal_seats(server_limit: u32, shares: &BTreeMap<String, u32>) -> BTreeMap<String, u32> {
    let total_shares: u64 = shares.values().map(|&s| u64::from(s)).sum();
    if total_shares == 0 {
        return shares.keys().map(|name| (name.clone(), 0)).collect();
    }

    let mut seats = BTreeMap::new();
    let mut remainders = Vec::with_capacity(shares.len());
    let mut assigned = 0u64;
    for (name, &share) in shares {
        let exact = u64::from(server_limit) * u64::from(share);
        let floor = exact / total_shares;
        assigned += floor;
        seats.insert(name.clone(), floor as u32);
        remainders.push((exact % total_shares, name));
    }

    // Largest remainder first, then name
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    let leftover = u64::from(server_limit).saturating_sub(assigned) as usize;
    for (_, name) in remainders.into_iter().take(leftover) {
        if let Some(s) = seats.get_mut(name) {
            *s += 1;
        }
    }
    seats
}

fn percent_of(seats: u32, percent: u32) -> u32 {
    ((u64::from(seats) * u64::from(percent) + 50) / 100) as u32
}

/// Lending and borrowing bounds of one limited level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeatBounds {
    /// Seats owned by share
    pub nominal: u32,
    /// Seats others may borrow
    pub lendable: u32,
    /// Seats this level may borrow; `None` is unbounded
    pub borrowing_limit: Option<u32>,
}

impl SeatBounds {
    /// Derive bounds from nominal seats and the configured percentages.
    pub fn from_percentages(
        nominal: u32,
        lendable_percent: u32,
        borrowing_limit_percent: Option<u32>,
    ) -> Self {
        Self {
            nominal,
            lendable: percent_of(nominal, lendable_percent.min(100)),
            borrowing_limit: borrowing_limit_percent.map(|p| percent_of(nominal, p)),
        }
    }

    /// Fewest seats this level can be left with.
    pub fn lower(&self) -> u32 {
        self.nominal - self.lendable
    }

    /// Most seats this level can hold.
    pub fn upper(&self, server_limit: u32) -> u32 {
        match self.borrowing_limit {
            Some(limit) => self.nominal.saturating_add(limit).min(server_limit),
            None => server_limit.max(self.nominal),
        }
    }
}

/// Allocation input for one limited level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub name: String,
    pub shares: u32,
    pub bounds: SeatBounds,
    /// Seats the level wanted during the last period
    pub demand: u32,
}

/// Compute current seat targets.
///
/// Every level first receives its lower bound, then its own demand up to its
/// nominal seats. Seats still free go one at a time to the level that has
/// borrowed least relative to its shares and still wants more. Whatever
/// remains returns idle lenders toward their nominal seats. The sum of the
/// targets never exceeds `server_limit`.
pub fn allocate(server_limit: u32, requests: &[AllocationRequest]) -> BTreeMap<String, u32> {
    let mut sorted: Vec<&AllocationRequest> = requests.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut alloc: Vec<u32> = sorted.iter().map(|r| r.bounds.lower()).collect();
    let mut free = server_limit.saturating_sub(alloc.iter().sum());

    for (i, req) in sorted.iter().enumerate() {
        let want = req.demand.clamp(req.bounds.lower(), req.bounds.nominal);
        let add = want.saturating_sub(alloc[i]).min(free);
        alloc[i] += add;
        free -= add;
    }

    while free > 0 {
        let mut best: Option<usize> = None;
        for (i, req) in sorted.iter().enumerate() {
            let ceiling = req.demand.min(req.bounds.upper(server_limit));
            if alloc[i] >= ceiling {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b) if borrowed_share_cmp(i, b, &alloc, &sorted) == Ordering::Less => Some(i),
                keep => keep,
            };
        }
        let Some(i) = best else {
            break;
        };
        alloc[i] += 1;
        free -= 1;
    }

    for (i, req) in sorted.iter().enumerate() {
        let add = req.bounds.nominal.saturating_sub(alloc[i]).min(free);
        alloc[i] += add;
        free -= add;
    }

    sorted
        .iter()
        .zip(alloc)
        .map(|(req, seats)| (req.name.clone(), seats))
        .collect()
}

/// Compare `borrowed / shares` of two levels without floating point.
fn borrowed_share_cmp(
    a: usize,
    b: usize,
    alloc: &[u32],
    sorted: &[&AllocationRequest],
) -> Ordering {
    let borrowed = |i: usize| u64::from(alloc[i].saturating_sub(sorted[i].bounds.nominal));
    let shares = |i: usize| u64::from(sorted[i].shares.max(1));
    (borrowed(a) * shares(b)).cmp(&(borrowed(b) * shares(a)))
}
