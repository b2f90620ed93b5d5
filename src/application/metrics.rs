//! Built-in metrics recorder.
//!
//! Hosts that already have a metrics pipeline implement `MetricsRecorder`
//! themselves; `Metrics` is the default, keeping per-flow counters in memory
//! so they can be inspected in tests and debug dumps.

use crate::application::ports::MetricsRecorder;
use crate::domain::work::RejectReason;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counters for one (priority level, flow schema) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowStats {
    pub dispatched: u64,
    pub rejected: BTreeMap<&'static str, u64>,
    /// Waits that ended in execution
    pub waits_executed: u64,
    /// Waits that ended in rejection
    pub waits_rejected: u64,
    pub total_wait: Duration,
    pub executions: u64,
    pub total_execution: Duration,
}

/// Thread-safe in-memory recorder.
///
/// Totals are atomics; per-flow breakdowns live in a DashMap keyed by
/// `(priority_level, flow_schema)`. Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    dispatched: AtomicU64,
    rejected: AtomicU64,
    executions: AtomicU64,
    flows: DashMap<(String, String), FlowStats>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, level: &str, schema: &str, f: impl FnOnce(&mut FlowStats)) {
        let mut entry = self
            .inner
            .flows
            .entry((level.to_string(), schema.to_string()))
            .or_default();
        f(&mut entry);
    }

    /// Requests dispatched into execution.
    pub fn dispatched(&self) -> u64 {
        self.inner.dispatched.load(Ordering::Relaxed)
    }

    /// Requests rejected for any reason.
    pub fn rejected(&self) -> u64 {
        self.inner.rejected.load(Ordering::Relaxed)
    }

    /// Requests that finished executing.
    pub fn executions(&self) -> u64 {
        self.inner.executions.load(Ordering::Relaxed)
    }

    /// Counters for one flow, if it has seen traffic.
    pub fn flow(&self, priority_level: &str, flow_schema: &str) -> Option<FlowStats> {
        self.inner
            .flows
            .get(&(priority_level.to_string(), flow_schema.to_string()))
            .map(|s| s.clone())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatched: self.dispatched(),
            rejected: self.rejected(),
            executions: self.executions(),
            flows: self
                .inner
                .flows
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }

    /// Clear every counter.
    pub fn reset(&self) {
        self.inner.dispatched.store(0, Ordering::Relaxed);
        self.inner.rejected.store(0, Ordering::Relaxed);
        self.inner.executions.store(0, Ordering::Relaxed);
        self.inner.flows.clear();
    }
}

impl MetricsRecorder for Metrics {
    fn add_dispatch(&self, priority_level: &str, flow_schema: &str) {
        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
        self.update(priority_level, flow_schema, |s| s.dispatched += 1);
    }

    fn add_rejection(&self, priority_level: &str, flow_schema: &str, reason: RejectReason) {
        self.inner.rejected.fetch_add(1, Ordering::Relaxed);
        self.update(priority_level, flow_schema, |s| {
            *s.rejected.entry(reason.as_str()).or_default() += 1;
        });
    }

    fn observe_wait(&self, priority_level: &str, flow_schema: &str, executed: bool, wait: Duration) {
        self.update(priority_level, flow_schema, |s| {
            if executed {
                s.waits_executed += 1;
            } else {
                s.waits_rejected += 1;
            }
            s.total_wait += wait;
        });
    }

    fn observe_execution(&self, priority_level: &str, flow_schema: &str, duration: Duration) {
        self.inner.executions.fetch_add(1, Ordering::Relaxed);
        self.update(priority_level, flow_schema, |s| {
            s.executions += 1;
            s.total_execution += duration;
        });
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub dispatched: u64,
    pub rejected: u64,
    pub executions: u64,
    pub flows: BTreeMap<(String, String), FlowStats>,
}

impl MetricsSnapshot {
    /// Fraction of decided requests that were rejected.
    pub fn rejection_rate(&self) -> f64 {
        let total = self.dispatched + self.rejected;
        if total == 0 {
            0.0
        } else {
            self.rejected as f64 / total as f64
        }
    }
}
