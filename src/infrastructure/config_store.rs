//! In-memory configuration store.
//!
//! Implements both config ports so a host without an external store, and the
//! test suite, can drive the controller. Objects are kept in DashMaps; every
//! write bumps a store-wide resource version and fans a `ConfigEvent` out to
//! all live watchers.

use crate::application::ports::{
    ApplyError, ConfigEvent, ConfigObjects, ConfigSource, ObjectKind, SourceError, StatusWriter,
};
use crate::domain::config::{FlowSchema, FlowSchemaStatus, PriorityLevelConfiguration};
use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Versioned, watchable store of flow schemas and priority levels.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    flow_schemas: DashMap<String, FlowSchema>,
    priority_levels: DashMap<String, PriorityLevelConfiguration>,
    /// Last field manager to write each schema's status
    status_managers: DashMap<String, String>,
    version: AtomicU64,
    status_writes: AtomicU64,
    forced_conflicts: AtomicU32,
    watchers: Mutex<Vec<Sender<ConfigEvent>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-loaded with `flow_schemas` and `priority_levels`.
    pub fn with_objects(
        flow_schemas: Vec<FlowSchema>,
        priority_levels: Vec<PriorityLevelConfiguration>,
    ) -> Self {
        let store = Self::new();
        for pl in priority_levels {
            store.apply_priority_level(pl);
        }
        for fs in flow_schemas {
            store.apply_flow_schema(fs);
        }
        store
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, event: ConfigEvent) {
        self.watchers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Create or update a flow schema. An existing status is kept.
    pub fn apply_flow_schema(&self, mut schema: FlowSchema) -> u64 {
        let version = self.next_version();
        schema.resource_version = version;
        let name = schema.name.clone();
        if let Some(existing) = self.flow_schemas.get(&name) {
            schema.status = existing.status.clone();
        }
        self.flow_schemas.insert(name.clone(), schema);
        self.notify(ConfigEvent::Applied {
            kind: ObjectKind::FlowSchema,
            name,
        });
        version
    }

    pub fn delete_flow_schema(&self, name: &str) -> bool {
        let removed = self.flow_schemas.remove(name).is_some();
        if removed {
            self.status_managers.remove(name);
            self.notify(ConfigEvent::Deleted {
                kind: ObjectKind::FlowSchema,
                name: name.to_string(),
            });
        }
        removed
    }

    /// Create or update a priority level.
    pub fn apply_priority_level(&self, mut level: PriorityLevelConfiguration) -> u64 {
        let version = self.next_version();
        level.resource_version = version;
        let name = level.name.clone();
        self.priority_levels.insert(name.clone(), level);
        self.notify(ConfigEvent::Applied {
            kind: ObjectKind::PriorityLevel,
            name,
        });
        version
    }

    pub fn delete_priority_level(&self, name: &str) -> bool {
        let removed = self.priority_levels.remove(name).is_some();
        if removed {
            self.notify(ConfigEvent::Deleted {
                kind: ObjectKind::PriorityLevel,
                name: name.to_string(),
            });
        }
        removed
    }

    pub fn flow_schema(&self, name: &str) -> Option<FlowSchema> {
        self.flow_schemas.get(name).map(|fs| fs.clone())
    }

    pub fn priority_level(&self, name: &str) -> Option<PriorityLevelConfiguration> {
        self.priority_levels.get(name).map(|pl| pl.clone())
    }

    /// Number of successful status writes.
    pub fn status_writes(&self) -> u64 {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Field manager of the last status write to `name`.
    pub fn status_manager(&self, name: &str) -> Option<String> {
        self.status_managers.get(name).map(|m| m.clone())
    }

    /// Make the next `n` status writes fail with a conflict.
    pub fn force_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    /// Close every watch channel, as a dropped connection would.
    pub fn disconnect_watchers(&self) {
        self.watchers.lock().clear();
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }
}

impl ConfigSource for MemoryConfigStore {
    fn list(&self) -> Result<ConfigObjects, SourceError> {
        let mut flow_schemas: Vec<FlowSchema> =
            self.flow_schemas.iter().map(|e| e.value().clone()).collect();
        let mut priority_levels: Vec<PriorityLevelConfiguration> =
            self.priority_levels.iter().map(|e| e.value().clone()).collect();
        flow_schemas.sort_by(|a, b| a.name.cmp(&b.name));
        priority_levels.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ConfigObjects {
            flow_schemas,
            priority_levels,
        })
    }

    fn watch(&self) -> Result<Receiver<ConfigEvent>, SourceError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.watchers.lock().push(tx);
        Ok(rx)
    }
}

impl StatusWriter for MemoryConfigStore {
    fn apply_flow_schema_status(
        &self,
        name: &str,
        expected_version: u64,
        status: &FlowSchemaStatus,
        field_manager: &str,
    ) -> Result<u64, ApplyError> {
        let version = {
            let mut entry = self
                .flow_schemas
                .get_mut(name)
                .ok_or_else(|| ApplyError::NotFound(name.to_string()))?;

            let forced = self
                .forced_conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if forced || entry.resource_version != expected_version {
                return Err(ApplyError::Conflict {
                    name: name.to_string(),
                    expected: expected_version,
                    actual: entry.resource_version,
                });
            }

            let version = self.next_version();
            entry.status = status.clone();
            entry.resource_version = version;
            version
        };
        self.status_managers
            .insert(name.to_string(), field_manager.to_string());
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        self.notify(ConfigEvent::Applied {
            kind: ObjectKind::FlowSchema,
            name: name.to_string(),
        });
        Ok(version)
    }
}
