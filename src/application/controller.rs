//! Configuration controller.
//!
//! Keeps the published [`Snapshot`] consistent with the config store. A sync
//! lists every object, validates it, injects the mandatory objects, builds a
//! new classifier, reuses or creates one `QueueSet` per priority level,
//! splits the server's seats by shares and publishes the result with a single
//! atomic swap. Request handling never waits on a sync: it keeps using the
//! snapshot it loaded.
//!
//! Levels whose configuration disappears are kept as *quiescing* until they
//! have been idle for the reap grace period, so requests already inside them
//! finish normally.

use crate::application::classifier::Classifier;
use crate::application::ports::{
    ApplyError, Clock, ConfigEvent, ConfigObjects, ConfigSource, SourceError, StatusWriter,
};
use crate::application::queueset::{QueueSet, QueuingSettings};
use crate::application::seat_pool::{Nudge, SeatPool};
use crate::domain::allocation::{allocate, nominal_seats, AllocationRequest, SeatBounds};
use crate::domain::config::{
    mandatory_flow_schemas, mandatory_priority_levels, ConditionStatus, ConfigError, FlowSchema,
    FlowSchemaCondition, FlowSchemaStatus, PriorityLevelConfiguration, DANGLING_CONDITION,
};
use arc_swap::ArcSwap;
use crossbeam_channel::{select, Receiver};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Identity the controller writes status under.
pub const FIELD_MANAGER: &str = "flowgate-config-consumer-v1";

/// Retries after a conflicting status write, within one sync.
const MAX_STATUS_RETRIES: usize = 3;

/// Queued nudges before further ones are dropped.
const NUDGE_BACKLOG: usize = 8;

/// Server-wide admission settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    server_concurrency_limit: u32,
    request_wait_limit: Duration,
    estimated_service_duration: Duration,
    resync_period: Duration,
    rebalance_period: Duration,
    reap_grace_period: Duration,
    field_manager: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            server_concurrency_limit: 600,
            request_wait_limit: Duration::from_secs(15),
            estimated_service_duration: Duration::from_secs(1),
            resync_period: Duration::from_secs(30),
            rebalance_period: Duration::from_secs(10),
            reap_grace_period: Duration::from_secs(60),
            field_manager: FIELD_MANAGER.to_string(),
        }
    }
}

impl FilterConfig {
    pub fn builder() -> FilterConfigBuilder {
        FilterConfigBuilder {
            config: Self::default(),
        }
    }

    /// Seats shared by all limited priority levels.
    pub fn server_concurrency_limit(&self) -> u32 {
        self.server_concurrency_limit
    }

    /// Longest a request may wait in a queue.
    pub fn request_wait_limit(&self) -> Duration {
        self.request_wait_limit
    }

    /// Assumed execution time of one seat.
    pub fn estimated_service_duration(&self) -> Duration {
        self.estimated_service_duration
    }

    pub fn resync_period(&self) -> Duration {
        self.resync_period
    }

    pub fn rebalance_period(&self) -> Duration {
        self.rebalance_period
    }

    /// How long a removed level must stay idle before it is dropped.
    pub fn reap_grace_period(&self) -> Duration {
        self.reap_grace_period
    }

    pub fn field_manager(&self) -> &str {
        &self.field_manager
    }
}

/// Builder for [`FilterConfig`]. Values are validated by `build()`.
#[derive(Debug, Clone)]
pub struct FilterConfigBuilder {
    config: FilterConfig,
}

impl FilterConfigBuilder {
    pub fn with_server_concurrency_limit(mut self, seats: u32) -> Self {
        self.config.server_concurrency_limit = seats;
        self
    }

    pub fn with_request_wait_limit(mut self, limit: Duration) -> Self {
        self.config.request_wait_limit = limit;
        self
    }

    pub fn with_estimated_service_duration(mut self, duration: Duration) -> Self {
        self.config.estimated_service_duration = duration;
        self
    }

    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.config.resync_period = period;
        self
    }

    pub fn with_rebalance_period(mut self, period: Duration) -> Self {
        self.config.rebalance_period = period;
        self
    }

    pub fn with_reap_grace_period(mut self, period: Duration) -> Self {
        self.config.reap_grace_period = period;
        self
    }

    /// Override the status writer identity.
    pub fn with_field_manager(mut self, manager: impl Into<String>) -> Self {
        self.config.field_manager = manager.into();
        self
    }

    /// # Errors
    /// Returns `ConfigError::ZeroValue` for a zero limit or period.
    pub fn build(self) -> Result<FilterConfig, ConfigError> {
        let c = &self.config;
        if c.server_concurrency_limit == 0 {
            return Err(ConfigError::ZeroValue("server_concurrency_limit"));
        }
        let durations = [
            (c.request_wait_limit, "request_wait_limit"),
            (c.estimated_service_duration, "estimated_service_duration"),
            (c.resync_period, "resync_period"),
            (c.rebalance_period, "rebalance_period"),
            (c.reap_grace_period, "reap_grace_period"),
        ];
        if let Some((_, name)) = durations.iter().find(|(d, _)| d.is_zero()) {
            return Err(ConfigError::ZeroValue(*name));
        }
        if c.field_manager.is_empty() {
            return Err(ConfigError::ZeroValue("field_manager"));
        }
        Ok(self.config)
    }
}

/// Error returned by the controller.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// `run` was called while another `run` is active
    #[error("controller loop is already running")]
    AlreadyRunning,
    /// The config store could not be listed
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Error returned when stopping a spawned controller.
#[cfg(feature = "async")]
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// The controller loop panicked
    #[error("controller task panicked")]
    Panicked,
    /// The runtime cancelled the controller task
    #[error("controller task was cancelled")]
    Cancelled,
    /// The controller loop returned an error
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

/// Runtime state of one priority level inside a snapshot.
#[derive(Debug, Clone)]
pub struct LevelState {
    pub config: Arc<PriorityLevelConfiguration>,
    pub queue_set: Arc<QueueSet>,
    /// Concurrency shares; zero for exempt levels
    pub shares: u32,
    /// Seat bounds; `None` for exempt levels
    pub bounds: Option<SeatBounds>,
    /// Removed from configuration, waiting to drain
    pub quiescing: bool,
}

/// Immutable view of the configuration used by the request path.
#[derive(Debug)]
pub struct Snapshot {
    generation: u64,
    classifier: Classifier,
    levels: BTreeMap<String, LevelState>,
}

impl Snapshot {
    /// Increases by one with every publish.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn level(&self, name: &str) -> Option<&LevelState> {
        self.levels.get(name)
    }

    /// Every level, including quiescing ones, by name.
    pub fn levels(&self) -> impl Iterator<Item = &LevelState> {
        self.levels.values()
    }
}

/// Outcome of one sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub generation: u64,
    pub flow_schemas: usize,
    pub priority_levels: usize,
    /// Objects skipped by validation
    pub invalid: Vec<String>,
    pub dangling: Vec<String>,
    pub quiescing: Vec<String>,
    pub reaped: Vec<String>,
    pub status_writes: usize,
    pub status_failures: usize,
}

/// Reconciles the config store into published snapshots.
pub struct ConfigController {
    config: FilterConfig,
    source: Arc<dyn ConfigSource>,
    status_writer: Arc<dyn StatusWriter>,
    clock: Arc<dyn Clock>,
    pool: Arc<SeatPool>,
    snapshot: ArcSwap<Snapshot>,
    /// Serializes syncs and rebalances
    sync_lock: Mutex<()>,
    nudges: Receiver<Nudge>,
    running: AtomicBool,
}

impl std::fmt::Debug for ConfigController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigController")
            .field("config", &self.config)
            .field("generation", &self.snapshot.load().generation)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn dangling_condition(schema: &FlowSchema, dangling: bool) -> FlowSchemaCondition {
    if dangling {
        FlowSchemaCondition {
            kind: DANGLING_CONDITION.to_string(),
            status: ConditionStatus::True,
            reason: "NotFound".to_string(),
            message: format!(
                "references a missing priority level {:?}",
                schema.priority_level
            ),
        }
    } else {
        FlowSchemaCondition {
            kind: DANGLING_CONDITION.to_string(),
            status: ConditionStatus::False,
            reason: "Found".to_string(),
            message: format!(
                "references an existing priority level {:?}",
                schema.priority_level
            ),
        }
    }
}

impl ConfigController {
    /// Create a controller serving only the mandatory objects until the first sync.
    pub fn new(
        config: FilterConfig,
        source: Arc<dyn ConfigSource>,
        status_writer: Arc<dyn StatusWriter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (nudge_tx, nudges) = crossbeam_channel::bounded(NUDGE_BACKLOG);
        let pool = Arc::new(SeatPool::new(config.server_concurrency_limit, nudge_tx));
        let initial = Snapshot {
            generation: 0,
            classifier: Classifier::new(mandatory_flow_schemas(), mandatory_priority_levels()),
            levels: BTreeMap::new(),
        };
        let controller = Self {
            config,
            source,
            status_writer,
            clock,
            pool,
            snapshot: ArcSwap::from_pointee(initial),
            sync_lock: Mutex::new(()),
            nudges,
            running: AtomicBool::new(false),
        };
        {
            let _serial = controller.sync_lock.lock();
            controller.reconcile(ConfigObjects::default());
        }
        controller
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn seat_pool(&self) -> &Arc<SeatPool> {
        &self.pool
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// List, reconcile, publish, then write back changed statuses.
    ///
    /// # Errors
    /// Returns `ControllerError::Source` if the config store cannot be listed;
    /// the previous snapshot stays in place.
    pub fn sync(&self) -> Result<SyncReport, ControllerError> {
        let _serial = self.sync_lock.lock();
        let listed = self.source.list()?;
        let (mut report, stored, snapshot) = self.reconcile(listed);

        for schema in &stored {
            let desired = dangling_condition(schema, snapshot.classifier.is_dangling(&schema.name));
            if schema.status.condition(DANGLING_CONDITION) == Some(&desired) {
                continue;
            }
            if desired.status == ConditionStatus::True {
                warn!(
                    flow_schema = %schema.name,
                    priority_level = %schema.priority_level,
                    "flow schema references a missing priority level"
                );
            }
            let mut status = schema.status.clone();
            status.set_condition(desired);
            match self.apply_status(schema, &status) {
                Ok(_) => report.status_writes += 1,
                Err(err) => {
                    report.status_failures += 1;
                    warn!(flow_schema = %schema.name, error = %err, "status write failed, will retry next sync");
                }
            }
        }
        Ok(report)
    }

    /// Sync, logging instead of returning errors.
    pub fn sync_logged(&self) {
        if let Err(err) = self.sync() {
            warn!(error = %err, "configuration sync failed, keeping previous snapshot");
        }
    }

    fn apply_status(
        &self,
        schema: &FlowSchema,
        status: &FlowSchemaStatus,
    ) -> Result<u64, ApplyError> {
        let mut version = schema.resource_version;
        let mut retries = 0;
        loop {
            match self.status_writer.apply_flow_schema_status(
                &schema.name,
                version,
                status,
                &self.config.field_manager,
            ) {
                Err(ApplyError::Conflict { actual, .. }) if retries < MAX_STATUS_RETRIES => {
                    retries += 1;
                    debug!(flow_schema = %schema.name, retries, "status write conflict, retrying");
                    version = actual;
                }
                other => return other,
            }
        }
    }

    /// Build and publish a snapshot from `listed`. Caller holds `sync_lock`.
    fn reconcile(&self, listed: ConfigObjects) -> (SyncReport, Vec<FlowSchema>, Arc<Snapshot>) {
        let mut report = SyncReport::default();

        let mut levels: BTreeMap<String, PriorityLevelConfiguration> = BTreeMap::new();
        for pl in listed.priority_levels {
            match pl.validate() {
                Ok(()) => {
                    levels.insert(pl.name.clone(), pl);
                }
                Err(err) => {
                    warn!(priority_level = %pl.name, error = %err, "skipping invalid priority level");
                    report.invalid.push(pl.name);
                }
            }
        }
        for mandatory in mandatory_priority_levels() {
            let configured = levels.get(&mandatory.name);
            if configured.is_some_and(|pl| pl.is_exempt() == mandatory.is_exempt()) {
                continue;
            }
            if configured.is_some() {
                warn!(priority_level = %mandatory.name, "mandatory priority level has the wrong kind, using the built-in one");
            }
            levels.insert(mandatory.name.clone(), mandatory);
        }

        let mut stored = Vec::new();
        let mut schemas: BTreeMap<String, FlowSchema> = BTreeMap::new();
        for fs in listed.flow_schemas {
            match fs.validate() {
                Ok(()) => {
                    stored.push(fs.clone());
                    schemas.insert(fs.name.clone(), fs);
                }
                Err(err) => {
                    warn!(flow_schema = %fs.name, error = %err, "skipping invalid flow schema");
                    report.invalid.push(fs.name);
                }
            }
        }
        for mandatory in mandatory_flow_schemas() {
            schemas.entry(mandatory.name.clone()).or_insert(mandatory);
        }

        let shares: BTreeMap<String, u32> = levels
            .values()
            .filter_map(|pl| {
                pl.limited_spec()
                    .map(|spec| (pl.name.clone(), spec.nominal_concurrency_shares))
            })
            .collect();
        let nominal = nominal_seats(self.config.server_concurrency_limit, &shares);

        let previous = self.snapshot.load_full();
        let mut next = BTreeMap::new();
        for pl in levels.into_values() {
            let seats = nominal.get(&pl.name).copied().unwrap_or(0);
            let name = pl.name.clone();
            match self.level_state(pl, seats, previous.levels.get(&name)) {
                Some(state) => {
                    next.insert(name, state);
                }
                None => report.invalid.push(name),
            }
        }

        // Only levels with runtime state can be classified into.
        let classifier = Classifier::new(
            schemas.into_values(),
            next.values().map(|state| state.config.as_ref().clone()),
        );
        report.dangling = classifier.dangling().iter().cloned().collect();
        report.flow_schemas = classifier.flow_schemas().len();
        report.priority_levels = next.len();

        let now = self.clock.now();
        for (name, old) in &previous.levels {
            if next.contains_key(name) {
                continue;
            }
            let idle_for = old
                .queue_set
                .idle_since()
                .map(|since| now.saturating_duration_since(since));
            if old.quiescing && idle_for.is_some_and(|d| d >= self.config.reap_grace_period) {
                old.queue_set.set_target(0);
                info!(priority_level = %name, "reaped idle priority level");
                report.reaped.push(name.clone());
                continue;
            }
            if !old.quiescing {
                info!(priority_level = %name, "priority level removed, quiescing until idle");
            }
            old.queue_set.set_nominal(0);
            let mut state = old.clone();
            state.quiescing = true;
            state.bounds = old.bounds.map(|_| SeatBounds {
                nominal: 0,
                lendable: 0,
                borrowing_limit: None,
            });
            report.quiescing.push(name.clone());
            next.insert(name.clone(), state);
        }

        let snapshot = Arc::new(Snapshot {
            generation: previous.generation + 1,
            classifier,
            levels: next,
        });
        self.snapshot.store(Arc::clone(&snapshot));
        self.apply_allocation(&snapshot);
        report.generation = snapshot.generation;
        info!(
            generation = snapshot.generation,
            flow_schemas = report.flow_schemas,
            priority_levels = report.priority_levels,
            "published configuration snapshot"
        );
        (report, stored, snapshot)
    }

    fn level_state(
        &self,
        pl: PriorityLevelConfiguration,
        nominal: u32,
        previous: Option<&LevelState>,
    ) -> Option<LevelState> {
        let config = Arc::new(pl);
        let Some(spec) = config.limited_spec().copied() else {
            let queue_set = match previous {
                Some(p) if p.queue_set.is_exempt() => Arc::clone(&p.queue_set),
                _ => {
                    if let Some(p) = previous {
                        p.queue_set.set_target(0);
                    }
                    QueueSet::exempt(&config.name, Arc::clone(&self.clock))
                }
            };
            return Some(LevelState {
                config,
                queue_set,
                shares: 0,
                bounds: None,
                quiescing: false,
            });
        };

        let settings = QueuingSettings {
            limit_response: spec.limit_response,
            request_wait_limit: self.config.request_wait_limit,
            estimated_service: self.config.estimated_service_duration,
        };
        let queue_set = match previous.filter(|p| !p.queue_set.is_exempt()) {
            Some(p) => {
                if let Err(err) = p.queue_set.reconfigure(settings, nominal) {
                    warn!(priority_level = %config.name, error = %err, "keeping previous queuing settings");
                }
                Arc::clone(&p.queue_set)
            }
            None => match QueueSet::limited(
                &config.name,
                settings,
                nominal,
                Arc::clone(&self.pool),
                Arc::clone(&self.clock),
            ) {
                Ok(queue_set) => queue_set,
                Err(err) => {
                    warn!(priority_level = %config.name, error = %err, "cannot build queues for priority level");
                    return None;
                }
            },
        };
        Some(LevelState {
            shares: spec.nominal_concurrency_shares,
            bounds: Some(SeatBounds::from_percentages(
                nominal,
                spec.lendable_percent,
                spec.borrowing_limit_percent,
            )),
            config,
            queue_set,
            quiescing: false,
        })
    }

    /// Recompute seat targets from recent demand and apply them.
    pub fn rebalance(&self) {
        let _serial = self.sync_lock.lock();
        let snapshot = self.snapshot.load_full();
        self.apply_allocation(&snapshot);
    }

    fn apply_allocation(&self, snapshot: &Snapshot) {
        let requests: Vec<AllocationRequest> = snapshot
            .levels
            .values()
            .filter_map(|level| {
                Some(AllocationRequest {
                    name: level.config.name.clone(),
                    shares: level.shares.max(1),
                    bounds: level.bounds?,
                    demand: level.queue_set.take_demand(),
                })
            })
            .collect();
        let targets = allocate(self.pool.server_limit(), &requests);

        // Shrink everyone before anyone grows so freed seats are available.
        for (name, target) in &targets {
            if let Some(level) = snapshot.levels.get(name) {
                level.queue_set.set_target(*target);
            }
        }
        for name in targets.keys() {
            if let Some(level) = snapshot.levels.get(name) {
                level.queue_set.grow_toward_target();
            }
        }
        debug!(?targets, free = self.pool.free(), "applied seat targets");
    }

    /// Republish the current snapshot without `level`'s runtime state.
    #[cfg(test)]
    pub(crate) fn forget_level_state(&self, level: &str) {
        let _serial = self.sync_lock.lock();
        let current = self.snapshot.load_full();
        let mut levels = current.levels.clone();
        levels.remove(level);
        self.snapshot.store(Arc::new(Snapshot {
            generation: current.generation + 1,
            classifier: current.classifier.clone(),
            levels,
        }));
    }

    /// Ask for a sync if `level` is quiescing and idle.
    pub fn maybe_reap(&self, level: &str) {
        let snapshot = self.snapshot.load();
        if let Some(state) = snapshot.levels.get(level) {
            if state.quiescing && state.queue_set.is_idle() {
                self.pool.nudge(Nudge::Reap);
            }
        }
    }

    fn subscribe(&self) -> Receiver<ConfigEvent> {
        match self.source.watch() {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "cannot watch configuration, relying on periodic resync");
                crossbeam_channel::never()
            }
        }
    }

    /// Drive the reconciliation loop until `stop` receives a message or disconnects.
    ///
    /// # Errors
    /// Returns `ControllerError::AlreadyRunning` if another `run` is active.
    /// Sync failures are logged and retried, never returned.
    pub fn run(&self, stop: &Receiver<()>) -> Result<(), ControllerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ControllerError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        let mut events = self.subscribe();
        self.sync_logged();
        let resync = crossbeam_channel::tick(self.config.resync_period);
        let rebalance = crossbeam_channel::tick(self.config.rebalance_period);
        info!("configuration controller started");

        loop {
            let mut watch_closed = false;
            select! {
                recv(stop) -> _ => {
                    info!("configuration controller stopping");
                    return Ok(());
                }
                recv(events) -> event => match event {
                    Ok(event) => {
                        debug!(?event, "configuration changed");
                        // Coalesce a burst of events into one sync.
                        while events.try_recv().is_ok() {}
                        self.sync_logged();
                    }
                    Err(_) => watch_closed = true,
                },
                recv(resync) -> _ => self.sync_logged(),
                recv(rebalance) -> _ => self.rebalance(),
                recv(self.nudges) -> nudge => match nudge {
                    Ok(Nudge::Rebalance) => self.rebalance(),
                    Ok(Nudge::Reap) => self.sync_logged(),
                    Err(_) => {}
                },
            }
            if watch_closed {
                warn!("configuration watch closed, resubscribing");
                events = self.subscribe();
                self.sync_logged();
            }
        }
    }

    /// Run the loop on tokio's blocking pool.
    #[cfg(feature = "async")]
    pub fn spawn(self: &Arc<Self>) -> ControllerHandle {
        let (stop, stop_rx) = crossbeam_channel::bounded(1);
        let controller = Arc::clone(self);
        let task = tokio::task::spawn_blocking(move || controller.run(&stop_rx));
        ControllerHandle {
            stop: Some(stop),
            task,
        }
    }
}

/// Handle to a controller loop started with `spawn`.
#[cfg(feature = "async")]
#[derive(Debug)]
pub struct ControllerHandle {
    stop: Option<crossbeam_channel::Sender<()>>,
    task: tokio::task::JoinHandle<Result<(), ControllerError>>,
}

#[cfg(feature = "async")]
impl ControllerHandle {
    /// Stop the loop and wait for it to exit.
    ///
    /// # Errors
    /// Returns `ShutdownError` if the loop panicked, was cancelled or failed.
    pub async fn shutdown(mut self) -> Result<(), ShutdownError> {
        drop(self.stop.take());
        match (&mut self.task).await {
            Ok(result) => result.map_err(ShutdownError::from),
            Err(err) if err.is_panic() => Err(ShutdownError::Panicked),
            Err(_) => Err(ShutdownError::Cancelled),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
