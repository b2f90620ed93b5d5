//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports; the host server
//! supplies its own config store and metrics sink through them.

use crate::domain::config::{FlowSchema, FlowSchemaStatus, PriorityLevelConfiguration};
use crate::domain::work::RejectReason;
use crossbeam_channel::Receiver;
use std::fmt::Debug;
use std::time::{Duration, Instant};

/// Port for obtaining current time.
///
/// Used for wait and execution measurements and for reap grace periods.
/// Infrastructure provides concrete implementations (SystemClock, MockClock).
pub trait Clock: Send + Sync + Debug {
    /// Get the current instant.
    fn now(&self) -> Instant;
}

/// A consistent listing of all configuration objects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigObjects {
    pub flow_schemas: Vec<FlowSchema>,
    pub priority_levels: Vec<PriorityLevelConfiguration>,
}

/// Kind of configuration object named in a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    FlowSchema,
    PriorityLevel,
}

/// Notification that a configuration object changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent {
    /// Created or updated
    Applied { kind: ObjectKind, name: String },
    /// Deleted
    Deleted { kind: ObjectKind, name: String },
}

/// Error returned when the config store cannot be read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("config source unavailable: {0}")]
    Unavailable(String),
}

/// Port for reading configuration.
///
/// Events only say *that* something changed; the controller always
/// re-lists to get a consistent view.
pub trait ConfigSource: Send + Sync {
    /// List every flow schema and priority level.
    fn list(&self) -> Result<ConfigObjects, SourceError>;

    /// Subscribe to change notifications.
    fn watch(&self) -> Result<Receiver<ConfigEvent>, SourceError>;
}

/// Error returned when a status write fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// The object changed since it was read
    #[error("conflict writing {name:?}: expected version {expected}, found {actual}")]
    Conflict {
        name: String,
        expected: u64,
        actual: u64,
    },
    /// The object no longer exists
    #[error("{0:?} not found")]
    NotFound(String),
    /// The store could not be reached
    #[error("status writer unavailable: {0}")]
    Unavailable(String),
}

/// Port for writing flow schema status back to the config store.
pub trait StatusWriter: Send + Sync {
    /// Apply `status` to the named schema if it is still at `expected_version`.
    ///
    /// `field_manager` identifies the writer so concurrent writers can be told
    /// apart. Returns the new version.
    fn apply_flow_schema_status(
        &self,
        name: &str,
        expected_version: u64,
        status: &FlowSchemaStatus,
        field_manager: &str,
    ) -> Result<u64, ApplyError>;
}

/// Port for the host's metrics sink. Write-only.
pub trait MetricsRecorder: Send + Sync + Debug {
    /// A request was dispatched into execution.
    fn add_dispatch(&self, priority_level: &str, flow_schema: &str);

    /// A request was rejected.
    fn add_rejection(&self, priority_level: &str, flow_schema: &str, reason: RejectReason);

    /// A queued request stopped waiting.
    fn observe_wait(&self, priority_level: &str, flow_schema: &str, executed: bool, wait: Duration);

    /// A request finished executing.
    fn observe_execution(&self, priority_level: &str, flow_schema: &str, duration: Duration);
}
