//! Request entry point.
//!
//! `Filter::handle` classifies a request, asks its priority level for seats,
//! runs the caller's `execute` callback if admitted, and records what
//! happened. It blocks while the request waits in a queue and never returns
//! while `execute` is still running.

use crate::application::classifier::Classification;
use crate::application::context::RequestContext;
use crate::application::controller::{ConfigController, ControllerError, FilterConfig};
use crate::application::debug::{self, DebugMux};
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, ConfigSource, MetricsRecorder, StatusWriter};
use crate::application::queueset::{Admission, ExecutionPermit, QueueSet};
use crate::application::watch_tracker::{WatchGuard, WatchTracker};
use crate::domain::config::EXEMPT;
use crate::domain::digest::RequestDigest;
use crate::domain::shuffle::flow_hash;
use crate::domain::work::{RejectReason, WorkEstimate};
use crate::infrastructure::clock::SystemClock;
use crossbeam_channel::Receiver;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to a handled request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum HandleOutcome<R> {
    /// `execute` ran and returned this value
    Executed(R),
    /// `execute` was never called
    Rejected(RejectReason),
}

impl<R> HandleOutcome<R> {
    pub fn is_executed(&self) -> bool {
        matches!(self, HandleOutcome::Executed(_))
    }

    pub fn rejection(&self) -> Option<RejectReason> {
        match self {
            HandleOutcome::Executed(_) => None,
            HandleOutcome::Rejected(reason) => Some(*reason),
        }
    }

    pub fn into_result(self) -> Result<R, RejectReason> {
        match self {
            HandleOutcome::Executed(value) => Ok(value),
            HandleOutcome::Rejected(reason) => Err(reason),
        }
    }
}

/// Builder for [`Filter`].
pub struct FilterBuilder {
    config: FilterConfig,
    source: Arc<dyn ConfigSource>,
    status_writer: Arc<dyn StatusWriter>,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl FilterBuilder {
    pub fn with_config(mut self, config: FilterConfig) -> Self {
        self.config = config;
        self
    }

    /// Set a custom clock (mainly for testing).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Send metrics somewhere other than the built-in [`Metrics`].
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the filter and run a first sync.
    ///
    /// A failed first sync is logged; the filter then serves the mandatory
    /// configuration until `run` syncs successfully.
    pub fn build(self) -> Filter {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(Metrics::new()) as Arc<dyn MetricsRecorder>);
        let controller = Arc::new(ConfigController::new(
            self.config,
            self.source,
            self.status_writer,
            clock,
        ));
        controller.sync_logged();
        Filter {
            controller,
            metrics,
            watches: WatchTracker::new(),
        }
    }
}

/// Admission control for one server.
pub struct Filter {
    controller: Arc<ConfigController>,
    metrics: Arc<dyn MetricsRecorder>,
    watches: WatchTracker,
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("controller", &self.controller)
            .field("metrics", &self.metrics)
            .field("open_watches", &self.watches.open_watches())
            .finish()
    }
}

impl Filter {
    /// Start building a filter over the given config store.
    pub fn builder(
        source: Arc<dyn ConfigSource>,
        status_writer: Arc<dyn StatusWriter>,
    ) -> FilterBuilder {
        FilterBuilder {
            config: FilterConfig::default(),
            source,
            status_writer,
            clock: None,
            metrics: None,
        }
    }

    pub fn controller(&self) -> &Arc<ConfigController> {
        &self.controller
    }

    /// Count a watch request as open until the guard is dropped.
    ///
    /// Hosts register long-running watches here after `handle` admits them.
    pub fn register_watch(&self, digest: &RequestDigest) -> Option<WatchGuard> {
        self.watches.register_watch(digest)
    }

    /// Open watches a mutating request would notify, for use in `estimate_work`.
    pub fn interested_watch_count(&self, digest: &RequestDigest) -> usize {
        self.watches.interested_watch_count(digest)
    }

    /// Handle one request.
    ///
    /// - `on_classified` is called first, exactly once.
    /// - `estimate_work` is called once after it, and only for limited levels.
    /// - `on_queue_state_change` is never called for exempt levels or
    ///   immediate dispatch. A rejected request sees `true` then `false`; a
    ///   queued request sees `true` on enqueue and `false` when its wait ends.
    /// - Cancelling `ctx` only affects a request that is still queued.
    /// - A level with no runtime state runs on the exempt level, with the
    ///   usual accounting, and is recorded under it.
    ///
    /// A panic inside `execute` is propagated after the request's seats are
    /// released and its execution is recorded.
    pub fn handle<R>(
        &self,
        ctx: &RequestContext,
        digest: &RequestDigest,
        on_classified: impl FnOnce(&Classification),
        estimate_work: impl FnOnce() -> WorkEstimate,
        mut on_queue_state_change: impl FnMut(bool),
        execute: impl FnOnce() -> R,
    ) -> HandleOutcome<R> {
        let snapshot = self.controller.snapshot();
        let classification = snapshot.classifier().classify(digest);
        on_classified(&classification);

        let schema_name = classification.flow_schema.name.as_str();
        let (level_name, queue_set) = match snapshot.level(&classification.priority_level.name) {
            Some(level) => (level.config.name.as_str(), Arc::clone(&level.queue_set)),
            None => {
                warn!(
                    priority_level = %classification.priority_level.name,
                    "no state for classified priority level, running it as exempt"
                );
                let queue_set = match snapshot.level(EXEMPT) {
                    Some(exempt) => Arc::clone(&exempt.queue_set),
                    None => QueueSet::exempt(EXEMPT, Arc::clone(self.controller.clock())),
                };
                (EXEMPT, queue_set)
            }
        };

        let admission = if queue_set.is_exempt() {
            queue_set.start_request(ctx, WorkEstimate::default(), 0, &mut |_| {})
        } else {
            let work = estimate_work();
            let hash = flow_hash(schema_name, &classification.flow_distinguisher);
            queue_set.start_request(ctx, work, hash, &mut on_queue_state_change)
        };

        match admission {
            Admission::Rejected { reason, waited } => {
                debug!(priority_level = level_name, flow_schema = schema_name, %reason, "request rejected");
                self.metrics.add_rejection(level_name, schema_name, reason);
                self.metrics
                    .observe_wait(level_name, schema_name, false, waited.unwrap_or_default());
                self.controller.maybe_reap(level_name);
                HandleOutcome::Rejected(reason)
            }
            Admission::Dispatched(permit) => {
                HandleOutcome::Executed(self.execute(level_name, schema_name, permit, execute))
            }
        }
    }

    fn execute<R>(
        &self,
        level: &str,
        schema: &str,
        permit: ExecutionPermit,
        execute: impl FnOnce() -> R,
    ) -> R {
        self.metrics.add_dispatch(level, schema);
        self.metrics
            .observe_wait(level, schema, true, permit.waited().unwrap_or_default());

        let clock = self.controller.clock();
        let started = clock.now();
        let result = panic::catch_unwind(AssertUnwindSafe(execute));
        let elapsed = clock.now().saturating_duration_since(started);

        permit.release();
        self.metrics.observe_execution(level, schema, elapsed);
        self.controller.maybe_reap(level);

        match result {
            Ok(value) => value,
            Err(payload) => {
                warn!(priority_level = level, flow_schema = schema, "execute panicked, propagating");
                panic::resume_unwind(payload)
            }
        }
    }

    /// Run the configuration controller until `stop` fires.
    ///
    /// # Errors
    /// Returns `ControllerError::AlreadyRunning` if the controller is already running.
    pub fn run(&self, stop: &Receiver<()>) -> Result<(), ControllerError> {
        self.controller.run(stop)
    }

    /// Run the configuration controller on the tokio blocking pool.
    #[cfg(feature = "async")]
    pub fn spawn(&self) -> crate::application::controller::ControllerHandle {
        self.controller.spawn()
    }

    /// Register the debug endpoints on `mux`.
    pub fn install(&self, mux: &mut DebugMux) {
        let controller = Arc::clone(&self.controller);
        mux.handle(debug::DUMP_PRIORITY_LEVELS, move || {
            debug::dump_priority_levels(&controller.snapshot())
        });
        let controller = Arc::clone(&self.controller);
        mux.handle(debug::DUMP_QUEUES, move || {
            debug::dump_queues(&controller.snapshot())
        });
        let controller = Arc::clone(&self.controller);
        mux.handle(debug::DUMP_FLOW_SCHEMAS, move || {
            debug::dump_flow_schemas(&controller.snapshot())
        });
    }
}
