use chrono::{TimeZone, Utc};
use std::sync::Arc;

use quotagate_core::{
    AdmissionDecision, AdmissionReason, Clock, CompletionOutcome, ConcurrencyScope, CounterType,
    FixedClock, QuotaConfig, GLOBAL_IDENTIFIER,
};
use quotagate_db::{CounterStore, MemoryCounterStore};
use quotagate_services::{AdmissionOutcome, QuotaGate};

struct Harness {
    gate: QuotaGate,
    store: Arc<MemoryCounterStore>,
    clock: Arc<FixedClock>,
}

fn harness(config: QuotaConfig) -> Harness {
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
    let gate = QuotaGate::with_clock(store.clone(), config, clock.clone());
    Harness { gate, store, clock }
}

fn enabled() -> QuotaConfig {
    QuotaConfig {
        enabled: true,
        ..QuotaConfig::default()
    }
}

async fn quota(h: &Harness, user_id: &str, counter_type: CounterType) -> i64 {
    h.store
        .get_quota_count(user_id, h.clock.today(), counter_type)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_total_quota_reached_after_tenth_start() {
    let h = harness(enabled());
    h.store
        .increment_quota_count("alice", h.clock.today(), CounterType::Total, 9)
        .await
        .unwrap();

    let before = h.gate.check_quota("alice", false, false).await;
    assert!(before.allowed);

    h.gate.start("alice", "t1", false).await.unwrap();
    assert_eq!(quota(&h, "alice", CounterType::Total).await, 10);

    let after = h.gate.check_quota("alice", false, false).await;
    assert!(!after.allowed);
    assert_eq!(after.reason, AdmissionReason::TotalQuotaExceeded);
}

#[tokio::test]
async fn test_free_llm_quota_degrades() {
    let h = harness(enabled());

    let first = h.gate.check_quota("bob", true, false).await;
    assert!(first.allowed);

    h.gate.start("bob", "t2", true).await.unwrap();
    assert_eq!(quota(&h, "bob", CounterType::Llm).await, 1);

    let second = h.gate.check_quota("bob", true, false).await;
    assert!(!second.allowed);
    assert_eq!(second.reason, AdmissionReason::LlmQuotaExceeded);
    assert!(second.llm_quota_exceeded);
    assert!(second.quota.unwrap().total_used < second.quota.unwrap().total_limit);

    h.gate.complete("t2").await;
    let evaluation = h.gate.evaluate("bob", true, false).await;
    assert_eq!(
        evaluation.decision,
        AdmissionDecision::Degrade {
            reason: AdmissionReason::LlmQuotaExceeded
        }
    );
    let json = serde_json::to_value(&evaluation).unwrap();
    assert_eq!(json["decision"]["decision"], "degrade");
}

#[tokio::test]
async fn test_global_concurrency_denies_idle_user() {
    let h = harness(enabled());
    h.store
        .increment_concurrency(ConcurrencyScope::System, GLOBAL_IDENTIFIER, 10)
        .await
        .unwrap();

    let result = h.gate.check_concurrency("carol").await;
    assert!(!result.allowed);
    assert_eq!(
        result.reason,
        AdmissionReason::SystemConcurrencyLimitExceeded
    );
    assert_eq!(result.concurrency.unwrap().user_active, 0);
}

#[tokio::test]
async fn test_unknown_tree_completion_is_noop() {
    let h = harness(enabled());
    h.gate.start("dave", "t1", false).await.unwrap();

    assert_eq!(
        h.gate.complete("unknown-tree-id").await,
        CompletionOutcome::Unknown
    );
    assert_eq!(
        h.store
            .get_concurrency_count(ConcurrencyScope::System, GLOBAL_IDENTIFIER)
            .await
            .unwrap(),
        1
    );
    assert_eq!(quota(&h, "dave", CounterType::Total).await, 1);
}

#[tokio::test]
async fn test_disabled_never_touches_storage() {
    let h = harness(QuotaConfig::default());
    h.store.set_unavailable(true);

    let quota = h.gate.check_quota("erin", true, false).await;
    assert!(quota.allowed);
    assert_eq!(quota.reason, AdmissionReason::Disabled);

    let concurrency = h.gate.check_concurrency("erin").await;
    assert!(concurrency.allowed);
    assert_eq!(concurrency.reason, AdmissionReason::Disabled);

    let status = h.gate.get_status("erin", false).await;
    assert!(!status.enabled);
    assert!(status.storage_available);
}

#[tokio::test]
async fn test_premium_only_denied_by_total() {
    let h = harness(enabled());
    h.store
        .increment_quota_count("frank", h.clock.today(), CounterType::Llm, 9)
        .await
        .unwrap();
    h.store
        .increment_quota_count("frank", h.clock.today(), CounterType::Total, 9)
        .await
        .unwrap();

    let allowed = h.gate.check_quota("frank", true, true).await;
    assert!(allowed.allowed);

    h.gate.start("frank", "t1", true).await.unwrap();
    let denied = h.gate.check_quota("frank", true, true).await;
    assert_eq!(denied.reason, AdmissionReason::TotalQuotaExceeded);
    assert!(!denied.llm_quota_exceeded);
}

#[tokio::test]
async fn test_storage_outage_fails_open_by_default() {
    let h = harness(enabled());
    h.store.set_unavailable(true);

    let quota = h.gate.check_quota("gina", false, false).await;
    assert!(quota.allowed);
    assert_eq!(quota.reason, AdmissionReason::StorageError);

    let status = h.gate.get_status("gina", false).await;
    assert!(!status.storage_available);
    assert_eq!(status.total_remaining, status.total_limit);
}

#[tokio::test]
async fn test_excess_completions_never_go_negative() {
    let h = harness(enabled());
    h.gate.start("hank", "t1", false).await.unwrap();
    for _ in 0..3 {
        h.gate.complete("t1").await;
    }
    h.store
        .decrement_concurrency(ConcurrencyScope::User, "hank", 4)
        .await
        .unwrap();

    assert_eq!(
        h.store
            .get_concurrency_count(ConcurrencyScope::User, "hank")
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        h.store
            .get_concurrency_count(ConcurrencyScope::System, GLOBAL_IDENTIFIER)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_quota_resets_on_next_utc_day() {
    let h = harness(enabled());
    for i in 0..10 {
        h.gate.start("ivy", &format!("t{}", i), false).await.unwrap();
        h.gate.complete(&format!("t{}", i)).await;
    }
    assert!(!h.gate.check_quota("ivy", false, false).await.allowed);

    h.clock.advance(chrono::Duration::hours(15));
    assert!(h.gate.check_quota("ivy", false, false).await.allowed);
}

#[tokio::test]
async fn test_atomic_admission_lifecycle() {
    let h = harness(enabled());

    let started = h.gate.admit("jo", "t1", true, false).await.unwrap();
    assert!(matches!(started, AdmissionOutcome::Started { .. }));
    assert!(!started.use_demo());

    let busy = h.gate.admit("jo", "t2", false, false).await.unwrap();
    assert!(!busy.proceeds());
    assert_eq!(
        busy.result().reason,
        AdmissionReason::UserConcurrencyLimitExceeded
    );

    assert!(matches!(
        h.gate.complete("t1").await,
        CompletionOutcome::Completed { .. }
    ));

    let degraded = h.gate.admit("jo", "t3", true, false).await.unwrap();
    assert!(degraded.proceeds());
    assert!(degraded.use_demo());
    assert_eq!(quota(&h, "jo", CounterType::Llm).await, 1);
    assert_eq!(quota(&h, "jo", CounterType::Total).await, 2);

    h.gate.log_task_execution("t3", Some("jo"), degraded.use_demo()).await;
    let report = h.gate.get_usage_stats(None, Some("jo")).await;
    assert_eq!(report.demo_tasks, 1);
    assert_eq!(report.user_tasks, Some(1));
}

#[tokio::test]
async fn test_system_stats_track_started_and_completed_trees() {
    let h = harness(enabled());
    h.gate.start("kim", "t1", false).await.unwrap();
    h.gate.start("lee", "t2", true).await.unwrap();

    let busy = h.gate.system_stats().await;
    assert_eq!(busy.total_concurrent, 2);
    assert_eq!(busy.active_users, 2);
    assert_eq!(busy.max_concurrent, 10);
    assert!(busy.accepting_new_trees);

    h.gate.complete("t1").await;
    let stats = h.gate.system_stats().await;
    assert_eq!(stats.total_concurrent, 1);
    assert_eq!(stats.active_users, 1);
    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["quota_config"]["premium_user_total_limit"], 10);
    assert_eq!(json["fail_mode"], "open");
}

#[tokio::test]
async fn test_concurrent_atomic_admissions_never_exceed_limit() {
    let h = harness(QuotaConfig {
        max_concurrent_global: 5,
        max_concurrent_per_user: 5,
        ..enabled()
    });

    let mut handles = Vec::new();
    for i in 0..30 {
        let gate = h.gate.clone();
        handles.push(tokio::spawn(async move {
            gate.admit(&format!("user-{}", i % 7), &format!("tree-{}", i), false, true)
                .await
                .unwrap()
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap().proceeds() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);
    assert_eq!(
        h.store
            .get_concurrency_count(ConcurrencyScope::System, GLOBAL_IDENTIFIER)
            .await
            .unwrap(),
        5
    );
}
