use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;

use quotagate_core::models::{
    AtomicAdmission, ConcurrencyCounter, ConcurrencyScope, CounterDrift, CounterType,
    QuotaCounter, TaskTreeAdmissionRequest, TaskTreeCompletion, TaskTreeTracking, UsageStatType,
    GLOBAL_IDENTIFIER,
};
use quotagate_core::{QuotaGateError, Result};

/// Durable storage for quota counters, concurrency counters and task tree tracking.
///
/// Every mutation must be correct under unbounded concurrent callers spread over
/// several processes: counters are changed with single atomic statements (or inside a
/// row-locked transaction), never by reading a value and writing it back.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Daily quota count, 0 when the counter does not exist.
    async fn get_quota_count(
        &self,
        user_id: &str,
        date: NaiveDate,
        counter_type: CounterType,
    ) -> Result<i64>;

    /// Atomically add `amount` (creating the counter on first use) and return the new value.
    async fn increment_quota_count(
        &self,
        user_id: &str,
        date: NaiveDate,
        counter_type: CounterType,
        amount: i64,
    ) -> Result<i64>;

    /// All quota counters of a user for one day.
    async fn list_quota_counters(&self, user_id: &str, date: NaiveDate)
        -> Result<Vec<QuotaCounter>>;

    async fn get_concurrency_count(&self, scope: ConcurrencyScope, identifier: &str)
        -> Result<i64>;

    async fn increment_concurrency(
        &self,
        scope: ConcurrencyScope,
        identifier: &str,
        amount: i64,
    ) -> Result<i64>;

    /// Atomically subtract `amount`, clamping at zero. Returns 0 for unknown counters.
    async fn decrement_concurrency(
        &self,
        scope: ConcurrencyScope,
        identifier: &str,
        amount: i64,
    ) -> Result<i64>;

    async fn list_concurrency_counters(&self) -> Result<Vec<ConcurrencyCounter>>;

    /// Insert an active tracking row. Fails with `DuplicateTreeStart` when the id exists.
    async fn start_task_tree(
        &self,
        task_tree_id: &str,
        user_id: &str,
        is_llm_consuming: bool,
    ) -> Result<TaskTreeTracking>;

    /// Set `completed_at` unless already set. `None` for unknown ids. Safe to repeat:
    /// only the call that performed the transition reports `transitioned = true`.
    async fn complete_task_tree(&self, task_tree_id: &str) -> Result<Option<TaskTreeCompletion>>;

    async fn get_task_tree(&self, task_tree_id: &str) -> Result<Option<TaskTreeTracking>>;

    /// Open tracking rows, optionally for one user, oldest first.
    async fn list_active_task_trees(&self, user_id: Option<&str>) -> Result<Vec<TaskTreeTracking>>;

    /// Check the limits and start the tree as one atomic unit.
    ///
    /// Counts are read under lock (global concurrency row, then the user's concurrency
    /// row, then the user's quota rows) and evaluated with
    /// [`quotagate_core::policy::evaluate_tree_admission`]. A denial changes nothing.
    async fn admit_task_tree(&self, request: &TaskTreeAdmissionRequest) -> Result<AtomicAdmission>;

    async fn increment_usage_stat(
        &self,
        date: NaiveDate,
        stat_type: UsageStatType,
        identifier: &str,
        amount: i64,
    ) -> Result<i64>;

    async fn get_usage_stat(
        &self,
        date: NaiveDate,
        stat_type: UsageStatType,
        identifier: &str,
    ) -> Result<i64>;

    /// Delete quota counters and usage stats dated before the cutoff and tracking rows
    /// completed before it. Open tracking rows are never deleted. Returns rows deleted.
    async fn cleanup_older_than(&self, today: NaiveDate, days_to_keep: i64) -> Result<u64>;

    /// Reset concurrency counters to the number of open tracking rows and report
    /// every counter that was corrected.
    async fn reconcile_concurrency(&self) -> Result<Vec<CounterDrift>>;
}

pub(crate) fn ensure_non_negative(amount: i64) -> Result<()> {
    if amount < 0 {
        return Err(QuotaGateError::InvalidInput(format!(
            "counter amount must not be negative, got {}",
            amount
        )));
    }
    Ok(())
}

/// Compare stored concurrency counters against open tracking rows grouped by user.
pub(crate) fn concurrency_drift(
    counters: &[(ConcurrencyScope, String, i64)],
    active_by_user: &HashMap<String, i64>,
) -> Vec<CounterDrift> {
    let global_actual: i64 = active_by_user.values().sum();
    let mut drifts = Vec::new();
    let mut seen_global = false;

    for (scope, identifier, recorded) in counters {
        let actual = match scope {
            ConcurrencyScope::System if identifier == GLOBAL_IDENTIFIER => {
                seen_global = true;
                global_actual
            }
            ConcurrencyScope::System => *recorded,
            ConcurrencyScope::User => active_by_user.get(identifier).copied().unwrap_or(0),
        };
        if actual != *recorded {
            drifts.push(CounterDrift {
                scope: *scope,
                identifier: identifier.clone(),
                recorded: *recorded,
                actual,
            });
        }
    }

    if !seen_global && global_actual > 0 {
        drifts.push(CounterDrift {
            scope: ConcurrencyScope::System,
            identifier: GLOBAL_IDENTIFIER.to_string(),
            recorded: 0,
            actual: global_actual,
        });
    }

    let mut missing: Vec<_> = active_by_user
        .iter()
        .filter(|(user_id, count)| {
            **count > 0
                && !counters
                    .iter()
                    .any(|(scope, id, _)| *scope == ConcurrencyScope::User && id == *user_id)
        })
        .collect();
    missing.sort();
    for (user_id, count) in missing {
        drifts.push(CounterDrift {
            scope: ConcurrencyScope::User,
            identifier: user_id.clone(),
            recorded: 0,
            actual: *count,
        });
    }

    drifts
}
