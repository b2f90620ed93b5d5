//! Request cost and admission outcomes.

use std::fmt;

/// Cost of a request, in seats, as reported by the host's estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkEstimate {
    /// Seats held for the whole execution
    pub seats: u32,
}

impl WorkEstimate {
    /// A request occupying `seats` seats.
    pub fn seats(seats: u32) -> Self {
        Self { seats }
    }
}

impl Default for WorkEstimate {
    fn default() -> Self {
        Self { seats: 1 }
    }
}

/// Why a request was not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// The chosen queue was already at its length limit
    QueueFull,
    /// The estimated wait exceeded the request wait limit
    WaitEstimate,
    /// The level rejects anything it cannot run at once
    Reject,
    /// The request waited until its deadline
    TimeOut,
    /// The caller's context was cancelled while waiting
    Cancelled,
}

impl RejectReason {
    /// Stable label for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::QueueFull => "queue-full",
            RejectReason::WaitEstimate => "wait-estimate",
            RejectReason::Reject => "concurrency-limit",
            RejectReason::TimeOut => "time-out",
            RejectReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
