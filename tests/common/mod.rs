//! Shared helpers for integration tests.

#![allow(dead_code)]

use crossbeam_channel::{Receiver, Sender};
use flowgate::{
    DistinguisherMethod, Filter, FilterConfig, FlowSchema, HandleOutcome, LimitResponse,
    LimitedSpec, MemoryConfigStore, PolicyRulesWithSubjects, PriorityLevelConfiguration,
    QueueSetSnapshot, QueuingConfig, RequestContext, RequestDigest, UserInfo, WorkEstimate,
};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long a test waits for another thread before failing.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Lifecycle points of a request running on its own thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Queued,
    Dequeued,
    Executing,
}

/// A request handled on a background thread.
///
/// Its `execute` callback reports `Executing` and then blocks until the
/// request is released.
pub struct InFlight {
    pub progress: Receiver<Progress>,
    release: Option<Sender<()>>,
    thread: JoinHandle<HandleOutcome<()>>,
}

impl InFlight {
    /// Wait for the next progress report and check it.
    pub fn expect(&self, expected: Progress) {
        let got = self
            .progress
            .recv_timeout(PATIENCE)
            .unwrap_or_else(|_| panic!("timed out waiting for {expected:?}"));
        assert_eq!(got, expected);
    }

    /// Let `execute` return as soon as it runs.
    pub fn unblock(&mut self) {
        self.release = None;
    }

    /// Let `execute` return and collect the outcome.
    pub fn finish(mut self) -> HandleOutcome<()> {
        self.unblock();
        self.thread.join().expect("request thread panicked")
    }
}

pub fn submit(filter: &Arc<Filter>, digest: RequestDigest, ctx: RequestContext) -> InFlight {
    submit_with(filter, digest, ctx, WorkEstimate::default(), |_| {})
}

/// Submit a request whose `execute` also runs `on_execute`.
pub fn submit_with(
    filter: &Arc<Filter>,
    digest: RequestDigest,
    ctx: RequestContext,
    work: WorkEstimate,
    on_execute: impl FnOnce(&Filter) + Send + 'static,
) -> InFlight {
    let (progress_tx, progress) = crossbeam_channel::unbounded();
    let (release, release_rx) = crossbeam_channel::bounded::<()>(0);
    let filter = Arc::clone(filter);
    let thread = thread::spawn(move || {
        let notes = progress_tx.clone();
        filter.handle(
            &ctx,
            &digest,
            |_| {},
            || work,
            |queued| {
                let _ = notes.send(if queued {
                    Progress::Queued
                } else {
                    Progress::Dequeued
                });
            },
            || {
                let _ = progress_tx.send(Progress::Executing);
                on_execute(&filter);
                let _ = release_rx.recv();
            },
        )
    });
    InFlight {
        progress,
        release: Some(release),
        thread,
    }
}

pub fn get(user: &str) -> RequestDigest {
    RequestDigest::resource("get", "", "pods", "default", UserInfo::new(user, &[]))
}

pub fn admin(user: &str) -> RequestDigest {
    RequestDigest::resource(
        "delete",
        "",
        "nodes",
        "",
        UserInfo::new(user, &["system:masters"]),
    )
}

/// A schema sending every request to `level`, one flow per user.
pub fn schema_for(name: &str, precedence: u32, level: &str) -> FlowSchema {
    FlowSchema::new(name, precedence, level)
        .with_rule(PolicyRulesWithSubjects::everything())
        .with_distinguisher(DistinguisherMethod::ByUser)
}

pub fn queuing(queues: u32, queue_length_limit: u32, hand_size: u32) -> QueuingConfig {
    QueuingConfig {
        queues,
        queue_length_limit,
        hand_size,
    }
}

/// A queuing level that lends `lendable_percent` of its seats.
pub fn lending_level(name: &str, shares: u32, lendable_percent: u32) -> PriorityLevelConfiguration {
    PriorityLevelConfiguration::with_limited_spec(
        name,
        LimitedSpec {
            nominal_concurrency_shares: shares,
            lendable_percent,
            borrowing_limit_percent: None,
            limit_response: LimitResponse::Queue(QueuingConfig::default()),
        },
    )
}

pub fn config(limit: u32) -> FilterConfig {
    FilterConfig::builder()
        .with_server_concurrency_limit(limit)
        .build()
        .expect("valid config")
}

pub fn filter(store: &Arc<MemoryConfigStore>, config: FilterConfig) -> Arc<Filter> {
    Arc::new(
        Filter::builder(store.clone(), store.clone())
            .with_config(config)
            .build(),
    )
}

pub fn level(filter: &Filter, name: &str) -> QueueSetSnapshot {
    filter
        .controller()
        .snapshot()
        .level(name)
        .unwrap_or_else(|| panic!("no level {name}"))
        .queue_set
        .snapshot()
}
