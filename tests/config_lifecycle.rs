//! Integration tests for configuration sync, seat lending and level removal.

mod common;

use common::*;
use flowgate::infrastructure::mocks::{MockCaptureLayer, MockClock};
use flowgate::{
    ConditionStatus, Filter, FlowSchema, MemoryConfigStore, PolicyRulesWithSubjects,
    PriorityLevelConfiguration, QueuingConfig, RequestContext, RequestDigest, Subject, UserInfo,
    FIELD_MANAGER,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;

fn member_of(user: &str, group: &str) -> RequestDigest {
    RequestDigest::resource("list", "apps", "deployments", "prod", UserInfo::new(user, &[group]))
}

fn schema_for_group(name: &str, precedence: u32, level: &str, group: &str) -> FlowSchema {
    FlowSchema::new(name, precedence, level).with_rule(PolicyRulesWithSubjects::everything_for(
        vec![Subject::Group {
            name: group.to_string(),
        }],
    ))
}

#[test]
fn test_sync_is_idempotent() {
    let store = Arc::new(MemoryConfigStore::with_objects(
        vec![schema_for("workload", 500, "workload")],
        vec![PriorityLevelConfiguration::limited("workload", 30, QueuingConfig::default())],
    ));
    let filter = filter(&store, config(100));
    let controller = filter.controller();
    let writes = store.status_writes();
    assert!(writes > 0, "first sync records the dangling condition");

    let before = controller.snapshot();
    let first = controller.sync().unwrap();
    let middle = controller.snapshot();
    let second = controller.sync().unwrap();
    let after = controller.snapshot();

    assert_eq!(first.status_writes, 0);
    assert_eq!(second.status_writes, 0);
    assert_eq!(store.status_writes(), writes);
    assert_eq!(after.generation(), before.generation() + 2);
    assert_eq!(first.flow_schemas, second.flow_schemas);

    for (old, new) in [(&before, &middle), (&middle, &after)] {
        let old_names: Vec<_> = old.levels().map(|l| l.config.name.clone()).collect();
        let new_names: Vec<_> = new.levels().map(|l| l.config.name.clone()).collect();
        assert_eq!(old_names, new_names);
        for (a, b) in old.levels().zip(new.levels()) {
            assert!(Arc::ptr_eq(&a.queue_set, &b.queue_set));
            let (a, b) = (a.queue_set.snapshot(), b.queue_set.snapshot());
            assert_eq!(a.budget, b.budget);
            assert_eq!(a.queues.len(), b.queues.len());
        }
    }
}

#[test]
fn test_dangling_schema_falls_through_and_is_marked() {
    let store = Arc::new(MemoryConfigStore::with_objects(
        vec![schema_for_group("orphan", 50, "missing", "ops")],
        vec![],
    ));
    let filter = filter(&store, config(50));
    let controller = filter.controller();

    let classification = controller
        .snapshot()
        .classifier()
        .classify(&member_of("olga", "ops"));
    assert_eq!(classification.flow_schema.name, "catch-all");

    let stored = store.flow_schema("orphan").unwrap();
    let condition = stored.status.condition("Dangling").unwrap();
    assert_eq!(condition.status, ConditionStatus::True);
    assert_eq!(condition.reason, "NotFound");
    assert_eq!(store.status_manager("orphan").as_deref(), Some(FIELD_MANAGER));

    store.apply_priority_level(PriorityLevelConfiguration::limited(
        "missing",
        10,
        QueuingConfig::default(),
    ));
    let report = controller.sync().unwrap();
    assert!(report.dangling.is_empty());
    assert_eq!(report.status_writes, 1);

    let classification = controller
        .snapshot()
        .classifier()
        .classify(&member_of("olga", "ops"));
    assert_eq!(classification.flow_schema.name, "orphan");
    assert_eq!(classification.priority_level.name, "missing");
    let stored = store.flow_schema("orphan").unwrap();
    assert!(!stored.is_marked_dangling());
}

#[test]
fn test_mandatory_levels_keep_their_kind() {
    let store = Arc::new(MemoryConfigStore::with_objects(
        vec![],
        vec![
            // Same kind as the built-in: kept, shares and all
            PriorityLevelConfiguration::rejecting("catch-all", 20),
            // Wrong kind: replaced by the built-in exempt level
            PriorityLevelConfiguration::limited("exempt", 5, QueuingConfig::default()),
        ],
    ));
    let filter = filter(&store, config(10));
    let snapshot = filter.controller().snapshot();

    assert!(snapshot.level("exempt").unwrap().config.is_exempt());
    let catch_all = snapshot.level("catch-all").unwrap();
    assert_eq!(catch_all.shares, 20);
    assert_eq!(catch_all.queue_set.budget().nominal, 10);

    let classification = snapshot.classifier().classify(&admin("root"));
    assert!(classification.is_exempt());
}

#[test]
fn test_invalid_objects_are_skipped_with_a_warning() {
    let capture = MockCaptureLayer::new();
    let subscriber = tracing_subscriber::registry().with(capture.clone());

    let store = Arc::new(MemoryConfigStore::with_objects(
        vec![FlowSchema::new("bad", 0, "catch-all")],
        vec![PriorityLevelConfiguration::rejecting("broken", 0)],
    ));
    let filter = tracing::subscriber::with_default(subscriber, || filter(&store, config(10)));

    let warnings = capture.matching(Level::WARN, "skipping invalid priority level");
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].fields["priority_level"], "broken");
    assert_eq!(
        capture
            .matching(Level::WARN, "skipping invalid flow schema")
            .len(),
        1
    );

    let snapshot = filter.controller().snapshot();
    assert!(snapshot.level("broken").is_none());
    assert!(snapshot
        .classifier()
        .flow_schemas()
        .iter()
        .all(|fs| fs.name != "bad"));

    let report = filter.controller().sync().unwrap();
    assert_eq!(report.invalid, vec!["broken".to_string(), "bad".to_string()]);
}

#[test]
fn test_idle_lender_seats_are_borrowed_and_reclaimed() {
    // Nominal seats at a limit of 20: lender 5, borrower 10, catch-all 5
    let store = Arc::new(MemoryConfigStore::with_objects(
        vec![
            schema_for_group("to-lender", 100, "lender", "lenders"),
            schema_for_group("to-borrower", 100, "borrower", "borrowers"),
        ],
        vec![
            lending_level("lender", 5, 100),
            PriorityLevelConfiguration::limited("borrower", 10, QueuingConfig::default()),
        ],
    ));
    let filter = filter(&store, config(20));
    let controller = filter.controller();
    assert_eq!(level(&filter, "lender").budget.allocated, 5);
    assert_eq!(level(&filter, "borrower").budget.allocated, 10);

    let mut borrowers: Vec<_> = (0..10)
        .map(|i| {
            let request = submit(
                &filter,
                member_of(&format!("b-{i}"), "borrowers"),
                RequestContext::background(),
            );
            request.expect(Progress::Executing);
            request
        })
        .collect();
    let extra = submit(&filter, member_of("b-extra", "borrowers"), RequestContext::background());
    extra.expect(Progress::Queued);

    // The idle lender gives up one seat, and the borrower's queued request runs on it
    controller.rebalance();
    extra.expect(Progress::Dequeued);
    extra.expect(Progress::Executing);
    let borrower = level(&filter, "borrower");
    assert_eq!(borrower.budget.target, 11);
    assert_eq!(borrower.budget.allocated, 11);
    let lender = level(&filter, "lender");
    assert_eq!(lender.budget.target, 4);
    assert_eq!(lender.budget.allocated, 4);
    assert_eq!(controller.seat_pool().allocated(), 20);

    // The lender gets busy and wants its seats back
    let lenders: Vec<_> = (0..4)
        .map(|i| {
            let request = submit(
                &filter,
                member_of(&format!("l-{i}"), "lenders"),
                RequestContext::background(),
            );
            request.expect(Progress::Executing);
            request
        })
        .collect();
    let reclaiming = submit(&filter, member_of("l-extra", "lenders"), RequestContext::background());
    reclaiming.expect(Progress::Queued);

    controller.rebalance();
    assert_eq!(level(&filter, "lender").budget.target, 5);
    assert_eq!(level(&filter, "borrower").budget.target, 10);
    // Every borrowed seat is busy, so the lender waits for one to finish
    assert_eq!(level(&filter, "lender").waiting, 1);

    assert!(extra.finish().is_executed());
    reclaiming.expect(Progress::Dequeued);
    reclaiming.expect(Progress::Executing);
    assert_eq!(level(&filter, "borrower").budget.allocated, 10);
    assert_eq!(level(&filter, "lender").budget.allocated, 5);

    assert!(reclaiming.finish().is_executed());
    for request in lenders.into_iter().chain(borrowers.drain(..)) {
        assert!(request.finish().is_executed());
    }
    assert!(controller.seat_pool().allocated() <= 20);
}

#[test]
fn test_removed_level_drains_then_is_reaped() {
    let store = Arc::new(MemoryConfigStore::with_objects(
        vec![schema_for_group("batch", 200, "batch", "batch-jobs")],
        vec![PriorityLevelConfiguration::limited("batch", 5, QueuingConfig::default())],
    ));
    let clock = MockClock::new(Instant::now());
    let filter = Arc::new(
        Filter::builder(store.clone(), store.clone())
            .with_config(config(10))
            .with_clock(Arc::new(clock.clone()))
            .build(),
    );
    let controller = filter.controller();

    let running = submit(&filter, member_of("job-1", "batch-jobs"), RequestContext::background());
    running.expect(Progress::Executing);

    store.delete_priority_level("batch");
    let report = controller.sync().unwrap();
    assert_eq!(report.quiescing, vec!["batch".to_string()]);
    assert_eq!(report.dangling, vec!["batch".to_string()]);
    let classification = controller
        .snapshot()
        .classifier()
        .classify(&member_of("job-2", "batch-jobs"));
    assert_eq!(classification.priority_level.name, "catch-all");

    // Busy levels are never reaped, however long they run
    clock.advance(Duration::from_secs(61));
    let report = controller.sync().unwrap();
    assert_eq!(report.quiescing, vec!["batch".to_string()]);
    assert!(report.reaped.is_empty());

    assert!(running.finish().is_executed());
    let report = controller.sync().unwrap();
    assert!(report.reaped.is_empty(), "grace period restarts when idle");

    clock.advance(Duration::from_secs(61));
    let report = controller.sync().unwrap();
    assert_eq!(report.reaped, vec!["batch".to_string()]);
    assert!(controller.snapshot().level("batch").is_none());
    assert_eq!(level(&filter, "catch-all").budget.allocated, 10);
    assert_eq!(controller.seat_pool().allocated(), 10);
}
