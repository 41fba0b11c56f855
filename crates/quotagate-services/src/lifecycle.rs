//! Task tree lifecycle: NONE -> ACTIVE (start or admit) -> COMPLETED (complete).

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use quotagate_core::{
    AdmissionResult, AtomicAdmission, Clock, CompletionOutcome, ConcurrencyScope, CounterType,
    FailMode, QuotaConfig, QuotaGateError, Result, TaskTreeAdmissionRequest, TaskTreeTracking,
    Tier, GLOBAL_IDENTIFIER,
};
use quotagate_db::CounterStore;

use crate::bounded::bounded;

/// What [`LifecycleTracker::admit`] did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdmissionOutcome {
    /// Run the real work; the tree is tracked and counted.
    Started {
        tracking: TaskTreeTracking,
        result: AdmissionResult,
    },
    /// Run with demo output; the tree is tracked and counted as non-LLM work.
    Degraded {
        tracking: TaskTreeTracking,
        result: AdmissionResult,
    },
    /// Do not run; nothing was recorded.
    Denied { result: AdmissionResult },
    /// Nothing was recorded because admission control is disabled or storage failed.
    /// `result.allowed` says whether the caller may proceed.
    Untracked { result: AdmissionResult },
}

impl AdmissionOutcome {
    pub fn result(&self) -> &AdmissionResult {
        match self {
            AdmissionOutcome::Started { result, .. }
            | AdmissionOutcome::Degraded { result, .. }
            | AdmissionOutcome::Denied { result }
            | AdmissionOutcome::Untracked { result } => result,
        }
    }

    /// Whether the caller may run the task tree at all.
    pub fn proceeds(&self) -> bool {
        self.result().allowed || matches!(self, AdmissionOutcome::Degraded { .. })
    }

    /// Whether the caller must substitute demo output for real work.
    pub fn use_demo(&self) -> bool {
        matches!(self, AdmissionOutcome::Degraded { .. })
    }
}

impl From<AtomicAdmission> for AdmissionOutcome {
    fn from(admission: AtomicAdmission) -> Self {
        match admission {
            AtomicAdmission::Started { tracking, result } => {
                AdmissionOutcome::Started { tracking, result }
            }
            AtomicAdmission::Degraded { tracking, result } => {
                AdmissionOutcome::Degraded { tracking, result }
            }
            AtomicAdmission::Denied { result } => AdmissionOutcome::Denied { result },
        }
    }
}

#[derive(Clone)]
pub struct LifecycleTracker {
    store: Arc<dyn CounterStore>,
    config: Arc<QuotaConfig>,
    clock: Arc<dyn Clock>,
}

impl LifecycleTracker {
    pub fn new(store: Arc<dyn CounterStore>, config: Arc<QuotaConfig>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    // Storage failures are swallowed under fail-open; everything else propagates.
    fn absorb(&self, operation: &'static str, err: QuotaGateError) -> Result<()> {
        if err.is_storage_failure() && self.config.fail_mode == FailMode::Open {
            tracing::warn!(error = %err, operation, "Counter storage failed, continuing untracked");
            return Ok(());
        }
        Err(err)
    }

    /// Record the start of an admitted task tree.
    ///
    /// Counters are incremented before the tracking row is inserted, so a crash in
    /// between over-counts. Starting a tree id twice fails with `DuplicateTreeStart`.
    ///
    /// A start that loses a race with a concurrent start of the same id gives its
    /// concurrency slots back but stays charged against the daily `total` (and `llm`)
    /// quota. Use [`LifecycleTracker::admit`] when that over-count matters.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self, user_id: &str, task_tree_id: &str, is_llm_consuming: bool) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        match self.try_start(user_id, task_tree_id, is_llm_consuming).await {
            Ok(()) => {
                tracing::debug!(user_id = %user_id, task_tree_id = %task_tree_id, "Task tree started");
                Ok(())
            }
            Err(e) => self.absorb("start", e),
        }
    }

    async fn try_start(&self, user_id: &str, task_tree_id: &str, is_llm_consuming: bool) -> Result<()> {
        let timeout = self.config.storage_timeout();
        let today = self.clock.today();

        if bounded(timeout, "get_task_tree", self.store.get_task_tree(task_tree_id))
            .await?
            .is_some()
        {
            return Err(QuotaGateError::DuplicateTreeStart {
                tree_id: task_tree_id.to_string(),
            });
        }

        bounded(
            timeout,
            "increment_quota_count",
            self.store
                .increment_quota_count(user_id, today, CounterType::Total, 1),
        )
        .await?;
        if is_llm_consuming {
            bounded(
                timeout,
                "increment_quota_count",
                self.store
                    .increment_quota_count(user_id, today, CounterType::Llm, 1),
            )
            .await?;
        }
        bounded(
            timeout,
            "increment_concurrency",
            self.store
                .increment_concurrency(ConcurrencyScope::System, GLOBAL_IDENTIFIER, 1),
        )
        .await?;
        bounded(
            timeout,
            "increment_concurrency",
            self.store
                .increment_concurrency(ConcurrencyScope::User, user_id, 1),
        )
        .await?;

        let inserted = bounded(
            timeout,
            "start_task_tree",
            self.store
                .start_task_tree(task_tree_id, user_id, is_llm_consuming),
        )
        .await;

        if let Err(QuotaGateError::DuplicateTreeStart { .. }) = inserted {
            // Lost a race with another start of the same id: hand the slots back.
            self.release(user_id).await;
        }
        inserted.map(|_| ())
    }

    async fn release(&self, user_id: &str) -> bool {
        let timeout = self.config.storage_timeout();
        let mut released = true;
        for (scope, identifier) in [
            (ConcurrencyScope::System, GLOBAL_IDENTIFIER),
            (ConcurrencyScope::User, user_id),
        ] {
            if let Err(e) = bounded(
                timeout,
                "decrement_concurrency",
                self.store.decrement_concurrency(scope, identifier, 1),
            )
            .await
            {
                tracing::warn!(
                    error = %e,
                    scope = %scope,
                    identifier = %identifier,
                    "Failed to release concurrency slot"
                );
                released = false;
            }
        }
        released
    }

    /// Mark a task tree completed and release its concurrency slots.
    ///
    /// Idempotent: unknown or already completed trees leave every counter untouched.
    /// Daily quota counters are never decremented.
    #[tracing::instrument(skip(self))]
    pub async fn complete(&self, task_tree_id: &str) -> CompletionOutcome {
        if !self.config.enabled {
            return CompletionOutcome::Disabled;
        }

        let completion = match bounded(
            self.config.storage_timeout(),
            "complete_task_tree",
            self.store.complete_task_tree(task_tree_id),
        )
        .await
        {
            Ok(completion) => completion,
            Err(e) => {
                tracing::warn!(error = %e, task_tree_id = %task_tree_id, "Failed to complete task tree");
                return CompletionOutcome::StorageError;
            }
        };

        match completion {
            None => {
                tracing::debug!(task_tree_id = %task_tree_id, "Completion for unknown task tree ignored");
                CompletionOutcome::Unknown
            }
            Some(completion) if !completion.transitioned => {
                tracing::debug!(task_tree_id = %task_tree_id, "Task tree already completed");
                CompletionOutcome::AlreadyCompleted {
                    record: completion.record,
                }
            }
            Some(completion) => {
                if !self.release(&completion.record.user_id).await {
                    // The tree is closed but its slots are still held; reconcile repairs this.
                    return CompletionOutcome::StorageError;
                }
                tracing::debug!(
                    task_tree_id = %task_tree_id,
                    user_id = %completion.record.user_id,
                    "Task tree completed"
                );
                CompletionOutcome::Completed {
                    record: completion.record,
                }
            }
        }
    }

    /// Check the limits and start the tree in one atomic step.
    #[tracing::instrument(skip(self))]
    pub async fn admit(
        &self,
        user_id: &str,
        task_tree_id: &str,
        is_llm_consuming: bool,
        has_llm_key: bool,
    ) -> Result<AdmissionOutcome> {
        if !self.config.enabled {
            return Ok(AdmissionOutcome::Untracked {
                result: AdmissionResult::disabled(),
            });
        }

        let tier = Tier::from_llm_key(has_llm_key);
        let request = TaskTreeAdmissionRequest {
            user_id: user_id.to_string(),
            task_tree_id: task_tree_id.to_string(),
            is_llm_consuming,
            tier,
            date: self.clock.today(),
            limits: self.config.limits_for(tier),
            max_concurrent_global: self.config.max_concurrent_global,
            max_concurrent_per_user: self.config.max_concurrent_per_user,
        };

        match bounded(
            self.config.storage_timeout(),
            "admit_task_tree",
            self.store.admit_task_tree(&request),
        )
        .await
        {
            Ok(admission) => {
                let outcome = AdmissionOutcome::from(admission);
                tracing::debug!(
                    user_id = %user_id,
                    task_tree_id = %task_tree_id,
                    reason = %outcome.result().reason,
                    proceeds = outcome.proceeds(),
                    "Task tree admission decided"
                );
                Ok(outcome)
            }
            Err(e) if e.is_storage_failure() => {
                tracing::warn!(
                    error = %e,
                    fail_mode = %self.config.fail_mode,
                    "Counter storage failed during admission, applying fail mode"
                );
                Ok(AdmissionOutcome::Untracked {
                    result: AdmissionResult::storage_error(self.config.fail_mode).with_tier(tier),
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotagate_core::{AdmissionReason, SystemClock};
    use quotagate_db::MemoryCounterStore;

    fn tracker(store: Arc<MemoryCounterStore>, config: QuotaConfig) -> LifecycleTracker {
        LifecycleTracker::new(store, Arc::new(config), Arc::new(SystemClock))
    }

    fn enabled() -> QuotaConfig {
        QuotaConfig {
            enabled: true,
            ..QuotaConfig::default()
        }
    }

    async fn gauge(store: &MemoryCounterStore, scope: ConcurrencyScope, id: &str) -> i64 {
        store.get_concurrency_count(scope, id).await.unwrap()
    }

    #[tokio::test]
    async fn test_complete_twice_releases_once() {
        let store = Arc::new(MemoryCounterStore::new());
        let tracker = tracker(store.clone(), enabled());

        tracker.start("u1", "t1", false).await.unwrap();
        tracker.start("u2", "t2", false).await.unwrap();
        assert_eq!(gauge(&store, ConcurrencyScope::System, GLOBAL_IDENTIFIER).await, 2);

        assert!(matches!(
            tracker.complete("t1").await,
            CompletionOutcome::Completed { .. }
        ));
        assert!(matches!(
            tracker.complete("t1").await,
            CompletionOutcome::AlreadyCompleted { .. }
        ));
        assert_eq!(gauge(&store, ConcurrencyScope::System, GLOBAL_IDENTIFIER).await, 1);
        assert_eq!(gauge(&store, ConcurrencyScope::User, "u1").await, 0);
        assert_eq!(gauge(&store, ConcurrencyScope::User, "u2").await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_start_propagates_without_counting() {
        let store = Arc::new(MemoryCounterStore::new());
        let tracker = tracker(store.clone(), enabled());

        tracker.start("u1", "t1", true).await.unwrap();
        let err = tracker.start("u1", "t1", true).await.unwrap_err();
        assert!(matches!(err, QuotaGateError::DuplicateTreeStart { .. }));

        let today = SystemClock.today();
        assert_eq!(
            store.get_quota_count("u1", today, CounterType::Total).await.unwrap(),
            1
        );
        assert_eq!(gauge(&store, ConcurrencyScope::User, "u1").await, 1);
    }

    #[tokio::test]
    async fn test_failed_tracking_insert_over_counts_until_reconciled() {
        let store = Arc::new(MemoryCounterStore::new());
        store.fail_operation("start_task_tree");
        let closed = QuotaConfig {
            fail_mode: FailMode::Closed,
            ..enabled()
        };
        let tracker = tracker(store.clone(), closed);

        let err = tracker.start("u1", "t1", true).await.unwrap_err();
        assert!(err.is_storage_failure());

        let today = SystemClock.today();
        assert_eq!(
            store.get_quota_count("u1", today, CounterType::Total).await.unwrap(),
            1
        );
        assert_eq!(
            store.get_quota_count("u1", today, CounterType::Llm).await.unwrap(),
            1
        );
        assert_eq!(gauge(&store, ConcurrencyScope::System, GLOBAL_IDENTIFIER).await, 1);
        assert_eq!(gauge(&store, ConcurrencyScope::User, "u1").await, 1);
        assert!(store.get_task_tree("t1").await.unwrap().is_none());

        store.clear_failures();
        let drifts = store.reconcile_concurrency().await.unwrap();
        assert_eq!(drifts.len(), 2);
        assert_eq!(gauge(&store, ConcurrencyScope::System, GLOBAL_IDENTIFIER).await, 0);
        assert_eq!(gauge(&store, ConcurrencyScope::User, "u1").await, 0);
        assert_eq!(
            store.get_quota_count("u1", today, CounterType::Total).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_start_failure_follows_fail_mode() {
        let store = Arc::new(MemoryCounterStore::new());
        store.set_unavailable(true);

        assert!(tracker(store.clone(), enabled())
            .start("u1", "t1", false)
            .await
            .is_ok());

        let closed = QuotaConfig {
            fail_mode: FailMode::Closed,
            ..enabled()
        };
        let err = tracker(store, closed)
            .start("u1", "t1", false)
            .await
            .unwrap_err();
        assert!(err.is_storage_failure());
    }

    #[tokio::test]
    async fn test_admit_storage_failure_is_untracked() {
        let store = Arc::new(MemoryCounterStore::new());
        store.set_unavailable(true);

        let outcome = tracker(store, enabled())
            .admit("u1", "t1", true, false)
            .await
            .unwrap();
        match outcome {
            AdmissionOutcome::Untracked { ref result } => {
                assert_eq!(result.reason, AdmissionReason::StorageError);
                assert!(outcome.proceeds());
            }
            other => panic!("expected untracked, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disabled_tracker_touches_nothing() {
        let store = Arc::new(MemoryCounterStore::new());
        store.set_unavailable(true);
        let tracker = tracker(store, QuotaConfig::default());

        assert!(tracker.start("u1", "t1", true).await.is_ok());
        assert_eq!(tracker.complete("t1").await, CompletionOutcome::Disabled);
        let outcome = tracker.admit("u1", "t2", true, false).await.unwrap();
        assert_eq!(outcome.result().reason, AdmissionReason::Disabled);
    }

    #[test]
    fn test_degraded_outcome_proceeds_with_demo() {
        let mut result = AdmissionResult::denied(AdmissionReason::LlmQuotaExceeded);
        result.llm_quota_exceeded = true;
        let degraded = AdmissionOutcome::Degraded {
            tracking: TaskTreeTracking {
                task_tree_id: "t1".to_string(),
                user_id: "u1".to_string(),
                is_llm_consuming: false,
                started_at: chrono::Utc::now(),
                completed_at: None,
            },
            result,
        };
        assert!(degraded.proceeds());
        assert!(degraded.use_demo());

        let denied = AdmissionOutcome::Denied {
            result: AdmissionResult::denied(AdmissionReason::TotalQuotaExceeded),
        };
        assert!(!denied.proceeds());
    }
}
