//! # flowgate
//!
//! Priority-and-fairness admission control for request-serving processes.
//!
//! Every incoming request is classified by a set of **flow schemas** into a
//! **priority level** and a **flow**. Each limited priority level owns a
//! share of the server's concurrency, measured in **seats**. When a level is
//! out of seats its requests wait in shuffle-sharded fair queues, so one noisy
//! flow cannot starve the others. Exempt levels bypass all of this.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowgate::{
//!     Filter, FilterConfig, FlowSchema, MemoryConfigStore, PolicyRulesWithSubjects,
//!     PriorityLevelConfiguration, QueuingConfig, RequestContext, RequestDigest, UserInfo,
//!     WorkEstimate,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let store = Arc::new(MemoryConfigStore::with_objects(
//!     vec![FlowSchema::new("service-accounts", 100, "workload")
//!         .with_rule(PolicyRulesWithSubjects::everything())],
//!     vec![PriorityLevelConfiguration::limited("workload", 30, QueuingConfig::default())],
//! ));
//!
//! let config = FilterConfig::builder()
//!     .with_server_concurrency_limit(400)
//!     .with_request_wait_limit(Duration::from_secs(10))
//!     .build()
//!     .expect("valid config");
//!
//! let filter = Filter::builder(store.clone(), store)
//!     .with_config(config)
//!     .build();
//!
//! let ctx = RequestContext::background().with_timeout(Duration::from_secs(30));
//! let digest = RequestDigest::resource("get", "", "pods", "default", UserInfo::new("alice", &[]));
//! let outcome = filter.handle(
//!     &ctx,
//!     &digest,
//!     |classification| println!("classified into {}", classification.priority_level.name),
//!     WorkEstimate::default,
//!     |queued| println!("queued: {queued}"),
//!     || "response body",
//! );
//! match outcome.into_result() {
//!     Ok(body) => println!("{body}"),
//!     Err(reason) => println!("rejected: {reason}"),
//! }
//! ```
//!
//! ## Configuration Lifecycle
//!
//! A [`ConfigController`] keeps the published snapshot in step with the
//! config store. Run it on a thread with [`Filter::run`], or on tokio with
//! `Filter::spawn` when the `async` feature is enabled:
//!
//! ```rust,no_run
//! # use flowgate::{Filter, MemoryConfigStore};
//! # use std::sync::Arc;
//! # let store = Arc::new(MemoryConfigStore::new());
//! # let filter = Arc::new(Filter::builder(store.clone(), store).build());
//! let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
//! let worker = {
//!     let filter = Arc::clone(&filter);
//!     std::thread::spawn(move || filter.run(&stop_rx))
//! };
//!
//! // ... serve traffic ...
//!
//! drop(stop_tx);
//! worker.join().unwrap().unwrap();
//! ```
//!
//! Two objects always exist: the `exempt` level, which `system:masters` is
//! classified into, and the `catch-all` level with its match-everything
//! schema. A flow schema that names a missing level is marked *dangling* in
//! its status and skipped during classification.
//!
//! ## Observability
//!
//! Metrics go through the [`MetricsRecorder`] port. The built-in [`Metrics`]
//! keeps counters in memory:
//!
//! ```rust,no_run
//! # use flowgate::{Filter, MemoryConfigStore, Metrics};
//! # use std::sync::Arc;
//! # let store = Arc::new(MemoryConfigStore::new());
//! let metrics = Metrics::new();
//! let filter = Filter::builder(store.clone(), store)
//!     .with_metrics(Arc::new(metrics.clone()))
//!     .build();
//!
//! let snapshot = metrics.snapshot();
//! println!("Rejection rate: {:.2}%", snapshot.rejection_rate() * 100.0);
//! ```
//!
//! [`Filter::install`] registers text dumps of the priority levels, queues
//! and flow schemas on a [`DebugMux`].
//!
//! ## Concurrency
//!
//! `Filter::handle` is synchronous and blocks the calling thread while its
//! request waits in a queue. Waiting ends on dispatch, on the request's
//! deadline, on the configured request wait limit, or when the
//! [`RequestContext`] is cancelled. Those deadlines run on real time; a
//! custom [`Clock`] only stamps wait and execution durations and idleness.
//!
//! ## Watches
//!
//! Hosts register long-running watches with [`Filter::register_watch`] and
//! keep the returned [`WatchGuard`] while the watch is open. Inside
//! `estimate_work`, [`Filter::interested_watch_count`] tells a mutating
//! request how many open watches its change will reach.

// Domain layer - pure admission-control logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use domain::{
    allocation::SeatBounds,
    config::{
        ConditionStatus, ConfigError, DistinguisherMethod, FlowSchema, FlowSchemaCondition,
        FlowSchemaStatus, LimitResponse, LimitedSpec, NonResourceRule, PolicyRulesWithSubjects,
        PriorityLevelConfiguration, PriorityLevelSpec, QueuingConfig, ResourceRule, Subject,
        CATCH_ALL, EXEMPT,
    },
    digest::{RequestDigest, UserInfo},
    shuffle::{Dealer, DealerError},
    work::{RejectReason, WorkEstimate},
};

pub use application::{
    classifier::{Classification, Classifier},
    context::{CancelHandle, RequestContext},
    controller::{
        ConfigController, ControllerError, FilterConfig, FilterConfigBuilder, LevelState,
        Snapshot, SyncReport, FIELD_MANAGER,
    },
    debug::DebugMux,
    filter::{Filter, FilterBuilder, HandleOutcome},
    metrics::{FlowStats, Metrics, MetricsSnapshot},
    ports::{
        ApplyError, Clock, ConfigEvent, ConfigObjects, ConfigSource, MetricsRecorder, ObjectKind,
        SourceError, StatusWriter,
    },
    queueset::{Budget, QueueSetSnapshot, QueueSnapshot},
    watch_tracker::{WatchGuard, WatchTracker},
};

#[cfg(feature = "async")]
pub use application::controller::{ControllerHandle, ShutdownError};

pub use infrastructure::{clock::SystemClock, config_store::MemoryConfigStore};
