//! Read-only introspection endpoints.
//!
//! The host mounts these on whatever debug server it runs. Each endpoint
//! renders the current snapshot as comma-separated text with a header row.

use crate::application::controller::Snapshot;
use std::collections::BTreeMap;
use std::fmt::Write;

pub const DUMP_PRIORITY_LEVELS: &str = "/debug/flowcontrol/dump_priority_levels";
pub const DUMP_QUEUES: &str = "/debug/flowcontrol/dump_queues";
pub const DUMP_FLOW_SCHEMAS: &str = "/debug/flowcontrol/dump_flow_schemas";

type Handler = Box<dyn Fn() -> String + Send + Sync>;

/// Path to handler table.
#[derive(Default)]
pub struct DebugMux {
    routes: BTreeMap<String, Handler>,
}

impl std::fmt::Debug for DebugMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugMux")
            .field("paths", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DebugMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` at `path`, replacing any previous handler.
    pub fn handle(&mut self, path: &str, handler: impl Fn() -> String + Send + Sync + 'static) {
        self.routes.insert(path.to_string(), Box::new(handler));
    }

    /// Render the endpoint at `path`.
    pub fn serve(&self, path: &str) -> Option<String> {
        self.routes.get(path).map(|handler| handler())
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

pub fn dump_priority_levels(snapshot: &Snapshot) -> String {
    let mut out = String::from(
        "PriorityLevelName, Exempt, Quiescing, IsIdle, ActiveQueues, WaitingRequests, \
         ExecutingRequests, SeatsInUse, NominalCL, TargetCL, AllocatedCL, Dispatched, Rejected\n",
    );
    for level in snapshot.levels() {
        let s = level.queue_set.snapshot();
        let active = s
            .queues
            .iter()
            .filter(|q| q.waiting > 0 || q.executing > 0)
            .count();
        let rejected: u64 = s.rejected.values().sum();
        let _ = writeln!(
            out,
            "{}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}",
            s.name,
            s.exempt,
            level.quiescing,
            s.idle,
            active,
            s.waiting,
            s.executing,
            s.seats_in_use,
            s.budget.nominal,
            s.budget.target,
            s.budget.allocated,
            s.dispatched,
            rejected,
        );
    }
    out
}

pub fn dump_queues(snapshot: &Snapshot) -> String {
    let mut out = String::from(
        "PriorityLevelName, Index, PendingRequests, SeatsWaiting, ExecutingRequests, SeatsInUse, VirtualFinish\n",
    );
    for level in snapshot.levels() {
        let s = level.queue_set.snapshot();
        for q in &s.queues {
            let _ = writeln!(
                out,
                "{}, {}, {}, {}, {}, {}, {:.4}",
                s.name, q.index, q.waiting, q.seats_waiting, q.executing, q.seats_in_use, q.virtual_finish,
            );
        }
    }
    out
}

pub fn dump_flow_schemas(snapshot: &Snapshot) -> String {
    let classifier = snapshot.classifier();
    let mut out = String::from(
        "FlowSchemaName, MatchingPrecedence, PriorityLevelName, DistinguisherMethod, Dangling\n",
    );
    for fs in classifier.flow_schemas() {
        let _ = writeln!(
            out,
            "{}, {}, {}, {}, false",
            fs.name,
            fs.matching_precedence,
            fs.priority_level,
            fs.distinguisher_method
                .map_or_else(|| "None".to_string(), |m| format!("{m:?}")),
        );
    }
    for name in classifier.dangling() {
        let _ = writeln!(out, "{name}, -, -, -, true");
    }
    out
}
