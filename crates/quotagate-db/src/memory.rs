use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;
use tokio::sync::Mutex;

use quotagate_core::calendar::retention_cutoff;
use quotagate_core::models::{
    AtomicAdmission, ConcurrencyCounter, ConcurrencyScope, CounterDrift, CounterType,
    QuotaCounter, TaskTreeAdmissionRequest, TaskTreeCompletion, TaskTreeTracking, UsageStatType,
    GLOBAL_IDENTIFIER,
};
use quotagate_core::policy::{evaluate_tree_admission, TreeAdmissionVerdict};
use quotagate_core::{Clock, QuotaGateError, Result, SystemClock};

use crate::store::{concurrency_drift, ensure_non_negative, CounterStore};

type QuotaKey = (String, NaiveDate, CounterType);
type ConcurrencyKey = (ConcurrencyScope, String);
type UsageKey = (NaiveDate, UsageStatType, String);

#[derive(Default)]
struct State {
    quota: HashMap<QuotaKey, (i64, DateTime<Utc>)>,
    concurrency: BTreeMap<ConcurrencyKey, (i64, DateTime<Utc>)>,
    trees: HashMap<String, TaskTreeTracking>,
    usage: HashMap<UsageKey, i64>,
}

impl State {
    fn quota_count(&self, user_id: &str, date: NaiveDate, counter_type: CounterType) -> i64 {
        self.quota
            .get(&(user_id.to_string(), date, counter_type))
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }

    fn add_quota(
        &mut self,
        user_id: &str,
        date: NaiveDate,
        counter_type: CounterType,
        amount: i64,
        now: DateTime<Utc>,
    ) -> i64 {
        let entry = self
            .quota
            .entry((user_id.to_string(), date, counter_type))
            .or_insert((0, now));
        entry.0 += amount;
        entry.1 = now;
        entry.0
    }

    fn concurrency_count(&self, scope: ConcurrencyScope, identifier: &str) -> i64 {
        self.concurrency
            .get(&(scope, identifier.to_string()))
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }

    fn add_concurrency(
        &mut self,
        scope: ConcurrencyScope,
        identifier: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> i64 {
        let entry = self
            .concurrency
            .entry((scope, identifier.to_string()))
            .or_insert((0, now));
        entry.0 += amount;
        entry.1 = now;
        entry.0
    }

    fn insert_tree(
        &mut self,
        task_tree_id: &str,
        user_id: &str,
        is_llm_consuming: bool,
        now: DateTime<Utc>,
    ) -> Result<TaskTreeTracking> {
        if self.trees.contains_key(task_tree_id) {
            return Err(QuotaGateError::DuplicateTreeStart {
                tree_id: task_tree_id.to_string(),
            });
        }
        let tracking = TaskTreeTracking {
            task_tree_id: task_tree_id.to_string(),
            user_id: user_id.to_string(),
            is_llm_consuming,
            started_at: now,
            completed_at: None,
        };
        self.trees.insert(task_tree_id.to_string(), tracking.clone());
        Ok(tracking)
    }
}

/// In-process counter store.
///
/// A single lock serializes every operation, which gives the same atomicity the
/// PostgreSQL store gets from row locks. Only suitable for tests and single-process
/// tools. Storage faults can be injected with [`MemoryCounterStore::set_unavailable`],
/// [`MemoryCounterStore::fail_operation`] and [`MemoryCounterStore::set_latency`].
pub struct MemoryCounterStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
    failing: SyncMutex<HashSet<&'static str>>,
    latency_ms: AtomicU64,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Timestamps (`started_at`, `completed_at`, `updated_at`) come from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            unavailable: AtomicBool::new(false),
            failing: SyncMutex::new(HashSet::new()),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Make every subsequent call fail with `StorageUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make calls of one trait method (e.g. `"start_task_tree"`) fail with
    /// `StorageUnavailable` while every other method keeps working.
    pub fn fail_operation(&self, operation: &'static str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(operation);
    }

    pub fn clear_failures(&self) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Delay every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn fault(&self, operation: &'static str) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QuotaGateError::StorageUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(operation);
        if failing {
            return Err(QuotaGateError::StorageUnavailable(format!(
                "in-memory store failing '{}'",
                operation
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get_quota_count(
        &self,
        user_id: &str,
        date: NaiveDate,
        counter_type: CounterType,
    ) -> Result<i64> {
        self.fault("get_quota_count").await?;
        Ok(self.state.lock().await.quota_count(user_id, date, counter_type))
    }

    async fn increment_quota_count(
        &self,
        user_id: &str,
        date: NaiveDate,
        counter_type: CounterType,
        amount: i64,
    ) -> Result<i64> {
        self.fault("increment_quota_count").await?;
        ensure_non_negative(amount)?;
        let now = self.clock.now();
        Ok(self
            .state
            .lock()
            .await
            .add_quota(user_id, date, counter_type, amount, now))
    }

    async fn list_quota_counters(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<QuotaCounter>> {
        self.fault("list_quota_counters").await?;
        let state = self.state.lock().await;
        let mut counters: Vec<QuotaCounter> = state
            .quota
            .iter()
            .filter(|((user, day, _), _)| user == user_id && *day == date)
            .map(|((user, day, counter_type), (count, updated_at))| QuotaCounter {
                user_id: user.clone(),
                date: *day,
                counter_type: *counter_type,
                count: *count,
                updated_at: *updated_at,
            })
            .collect();
        counters.sort_by_key(|c| c.counter_type.as_str());
        Ok(counters)
    }

    async fn get_concurrency_count(
        &self,
        scope: ConcurrencyScope,
        identifier: &str,
    ) -> Result<i64> {
        self.fault("get_concurrency_count").await?;
        Ok(self.state.lock().await.concurrency_count(scope, identifier))
    }

    async fn increment_concurrency(
        &self,
        scope: ConcurrencyScope,
        identifier: &str,
        amount: i64,
    ) -> Result<i64> {
        self.fault("increment_concurrency").await?;
        ensure_non_negative(amount)?;
        let now = self.clock.now();
        Ok(self
            .state
            .lock()
            .await
            .add_concurrency(scope, identifier, amount, now))
    }

    async fn decrement_concurrency(
        &self,
        scope: ConcurrencyScope,
        identifier: &str,
        amount: i64,
    ) -> Result<i64> {
        self.fault("decrement_concurrency").await?;
        ensure_non_negative(amount)?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        match state.concurrency.get_mut(&(scope, identifier.to_string())) {
            Some(entry) => {
                entry.0 = (entry.0 - amount).max(0);
                entry.1 = now;
                Ok(entry.0)
            }
            None => Ok(0),
        }
    }

    async fn list_concurrency_counters(&self) -> Result<Vec<ConcurrencyCounter>> {
        self.fault("list_concurrency_counters").await?;
        let state = self.state.lock().await;
        Ok(state
            .concurrency
            .iter()
            .map(|((scope, identifier), (count, updated_at))| ConcurrencyCounter {
                scope: *scope,
                identifier: identifier.clone(),
                count: *count,
                updated_at: *updated_at,
            })
            .collect())
    }

    async fn start_task_tree(
        &self,
        task_tree_id: &str,
        user_id: &str,
        is_llm_consuming: bool,
    ) -> Result<TaskTreeTracking> {
        self.fault("start_task_tree").await?;
        let now = self.clock.now();
        self.state
            .lock()
            .await
            .insert_tree(task_tree_id, user_id, is_llm_consuming, now)
    }

    async fn complete_task_tree(&self, task_tree_id: &str) -> Result<Option<TaskTreeCompletion>> {
        self.fault("complete_task_tree").await?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.trees.get_mut(task_tree_id).map(|tree| {
            let transitioned = tree.completed_at.is_none();
            if transitioned {
                tree.completed_at = Some(now);
            }
            TaskTreeCompletion {
                record: tree.clone(),
                transitioned,
            }
        }))
    }

    async fn get_task_tree(&self, task_tree_id: &str) -> Result<Option<TaskTreeTracking>> {
        self.fault("get_task_tree").await?;
        Ok(self.state.lock().await.trees.get(task_tree_id).cloned())
    }

    async fn list_active_task_trees(&self, user_id: Option<&str>) -> Result<Vec<TaskTreeTracking>> {
        self.fault("list_active_task_trees").await?;
        let state = self.state.lock().await;
        let mut trees: Vec<TaskTreeTracking> = state
            .trees
            .values()
            .filter(|tree| tree.is_active())
            .filter(|tree| user_id.map_or(true, |id| tree.user_id == id))
            .cloned()
            .collect();
        trees.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.task_tree_id.cmp(&b.task_tree_id))
        });
        Ok(trees)
    }

    async fn admit_task_tree(&self, request: &TaskTreeAdmissionRequest) -> Result<AtomicAdmission> {
        self.fault("admit_task_tree").await?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let verdict = evaluate_tree_admission(
            request,
            state.quota_count(&request.user_id, request.date, CounterType::Total),
            state.quota_count(&request.user_id, request.date, CounterType::Llm),
            state.concurrency_count(ConcurrencyScope::System, GLOBAL_IDENTIFIER),
            state.concurrency_count(ConcurrencyScope::User, &request.user_id),
        );

        let (result, runs_as_llm, degraded) = match verdict {
            TreeAdmissionVerdict::Deny { result } => return Ok(AtomicAdmission::Denied { result }),
            TreeAdmissionVerdict::Start { result } => (result, request.is_llm_consuming, false),
            TreeAdmissionVerdict::Degrade { result } => (result, false, true),
        };

        let tracking =
            state.insert_tree(&request.task_tree_id, &request.user_id, runs_as_llm, now)?;
        state.add_quota(&request.user_id, request.date, CounterType::Total, 1, now);
        if runs_as_llm {
            state.add_quota(&request.user_id, request.date, CounterType::Llm, 1, now);
        }
        state.add_concurrency(ConcurrencyScope::System, GLOBAL_IDENTIFIER, 1, now);
        state.add_concurrency(ConcurrencyScope::User, &request.user_id, 1, now);

        Ok(if degraded {
            AtomicAdmission::Degraded { tracking, result }
        } else {
            AtomicAdmission::Started { tracking, result }
        })
    }

    async fn increment_usage_stat(
        &self,
        date: NaiveDate,
        stat_type: UsageStatType,
        identifier: &str,
        amount: i64,
    ) -> Result<i64> {
        self.fault("increment_usage_stat").await?;
        ensure_non_negative(amount)?;
        let mut state = self.state.lock().await;
        let count = state
            .usage
            .entry((date, stat_type, identifier.to_string()))
            .or_insert(0);
        *count += amount;
        Ok(*count)
    }

    async fn get_usage_stat(
        &self,
        date: NaiveDate,
        stat_type: UsageStatType,
        identifier: &str,
    ) -> Result<i64> {
        self.fault("get_usage_stat").await?;
        let state = self.state.lock().await;
        Ok(state
            .usage
            .get(&(date, stat_type, identifier.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn cleanup_older_than(&self, today: NaiveDate, days_to_keep: i64) -> Result<u64> {
        self.fault("cleanup_older_than").await?;
        let cutoff = retention_cutoff(today, days_to_keep)?;
        let mut state = self.state.lock().await;

        let before = state.quota.len() + state.usage.len() + state.trees.len();
        state.quota.retain(|(_, date, _), _| *date >= cutoff);
        state.usage.retain(|(date, _, _), _| *date >= cutoff);
        state.trees.retain(|_, tree| match tree.completed_at {
            Some(completed_at) => completed_at.date_naive() >= cutoff,
            None => true,
        });
        let after = state.quota.len() + state.usage.len() + state.trees.len();

        Ok((before - after) as u64)
    }

    async fn reconcile_concurrency(&self) -> Result<Vec<CounterDrift>> {
        self.fault("reconcile_concurrency").await?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let mut active_by_user: HashMap<String, i64> = HashMap::new();
        for tree in state.trees.values().filter(|tree| tree.is_active()) {
            *active_by_user.entry(tree.user_id.clone()).or_insert(0) += 1;
        }
        let counters: Vec<(ConcurrencyScope, String, i64)> = state
            .concurrency
            .iter()
            .map(|((scope, identifier), (count, _))| (*scope, identifier.clone(), *count))
            .collect();

        let drifts = concurrency_drift(&counters, &active_by_user);
        for drift in &drifts {
            state
                .concurrency
                .insert((drift.scope, drift.identifier.clone()), (drift.actual, now));
        }

        Ok(drifts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use quotagate_core::models::{AdmissionReason, Tier};
    use quotagate_core::{FixedClock, QuotaLimits};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn request(user_id: &str, task_tree_id: &str, tier: Tier, is_llm: bool) -> TaskTreeAdmissionRequest {
        TaskTreeAdmissionRequest {
            user_id: user_id.to_string(),
            task_tree_id: task_tree_id.to_string(),
            is_llm_consuming: is_llm,
            tier,
            date: day(),
            limits: match tier {
                Tier::Free => QuotaLimits { total: 10, llm: 1 },
                Tier::Premium => QuotaLimits { total: 10, llm: 10 },
            },
            max_concurrent_global: 10,
            max_concurrent_per_user: 2,
        }
    }

    #[tokio::test]
    async fn test_quota_counter_increments_and_lists() {
        let store = MemoryCounterStore::new();
        assert_eq!(
            store.get_quota_count("u1", day(), CounterType::Total).await.unwrap(),
            0
        );
        store.increment_quota_count("u1", day(), CounterType::Total, 1).await.unwrap();
        let count = store
            .increment_quota_count("u1", day(), CounterType::Total, 2)
            .await
            .unwrap();
        assert_eq!(count, 3);
        store.increment_quota_count("u1", day(), CounterType::Llm, 1).await.unwrap();

        let counters = store.list_quota_counters("u1", day()).await.unwrap();
        assert_eq!(counters.len(), 2);
        assert_eq!(counters[0].counter_type, CounterType::Llm);
        assert_eq!(counters[1].count, 3);

        let err = store
            .increment_quota_count("u1", day(), CounterType::Total, -1)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaGateError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_decrement_clamps_at_zero() {
        let store = MemoryCounterStore::new();
        assert_eq!(
            store.decrement_concurrency(ConcurrencyScope::User, "ghost", 1).await.unwrap(),
            0
        );
        store.increment_concurrency(ConcurrencyScope::User, "u1", 1).await.unwrap();
        assert_eq!(
            store.decrement_concurrency(ConcurrencyScope::User, "u1", 5).await.unwrap(),
            0
        );
        assert_eq!(
            store.get_concurrency_count(ConcurrencyScope::User, "u1").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_tracking_lifecycle() {
        let store = MemoryCounterStore::new();
        store.start_task_tree("t1", "u1", true).await.unwrap();

        let dup = store.start_task_tree("t1", "u2", false).await.unwrap_err();
        assert!(matches!(dup, QuotaGateError::DuplicateTreeStart { ref tree_id } if tree_id == "t1"));

        let first = store.complete_task_tree("t1").await.unwrap().unwrap();
        assert!(first.transitioned);
        assert_eq!(first.record.user_id, "u1");
        let second = store.complete_task_tree("t1").await.unwrap().unwrap();
        assert!(!second.transitioned);
        assert_eq!(second.record.completed_at, first.record.completed_at);

        assert!(store.complete_task_tree("missing").await.unwrap().is_none());
        assert!(store.list_active_task_trees(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admit_starts_degrades_and_denies() {
        let store = MemoryCounterStore::new();

        let started = store
            .admit_task_tree(&request("u1", "t1", Tier::Free, true))
            .await
            .unwrap();
        assert!(matches!(started, AtomicAdmission::Started { .. }));
        assert!(started.tracking().unwrap().is_llm_consuming);

        // Free LLM quota of 1 is now used up.
        let degraded = store
            .admit_task_tree(&request("u1", "t2", Tier::Free, true))
            .await
            .unwrap();
        assert!(matches!(degraded, AtomicAdmission::Degraded { .. }));
        assert!(!degraded.tracking().unwrap().is_llm_consuming);
        assert!(degraded.result().llm_quota_exceeded);

        // Per-user concurrency of 2 is now reached.
        let denied = store
            .admit_task_tree(&request("u1", "t3", Tier::Free, false))
            .await
            .unwrap();
        assert_eq!(
            denied.result().reason,
            AdmissionReason::UserConcurrencyLimitExceeded
        );
        assert!(store.get_task_tree("t3").await.unwrap().is_none());

        assert_eq!(store.get_quota_count("u1", day(), CounterType::Total).await.unwrap(), 2);
        assert_eq!(store.get_quota_count("u1", day(), CounterType::Llm).await.unwrap(), 1);
        assert_eq!(
            store
                .get_concurrency_count(ConcurrencyScope::System, GLOBAL_IDENTIFIER)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_admit_duplicate_changes_nothing() {
        let store = MemoryCounterStore::new();
        store
            .admit_task_tree(&request("u1", "t1", Tier::Premium, true))
            .await
            .unwrap();
        let err = store
            .admit_task_tree(&request("u1", "t1", Tier::Premium, true))
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaGateError::DuplicateTreeStart { .. }));
        assert_eq!(store.get_quota_count("u1", day(), CounterType::Total).await.unwrap(), 1);
        assert_eq!(
            store.get_concurrency_count(ConcurrencyScope::User, "u1").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_concurrent_admissions_respect_global_limit() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut req = request(&format!("user-{}", i), &format!("tree-{}", i), Tier::Premium, false);
                req.max_concurrent_global = 10;
                store.admit_task_tree(&req).await.unwrap()
            }));
        }

        let mut started = 0;
        for handle in handles {
            if handle.await.unwrap().tracking().is_some() {
                started += 1;
            }
        }
        assert_eq!(started, 10);
        assert_eq!(
            store
                .get_concurrency_count(ConcurrencyScope::System, GLOBAL_IDENTIFIER)
                .await
                .unwrap(),
            10
        );
    }

    #[tokio::test]
    async fn test_cleanup_keeps_open_trees_and_recent_rows() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap()));
        let store = MemoryCounterStore::with_clock(clock.clone());
        let old_day = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();

        store.increment_quota_count("u1", old_day, CounterType::Total, 1).await.unwrap();
        store.increment_usage_stat(old_day, UsageStatType::Total, "global", 1).await.unwrap();
        store.start_task_tree("done", "u1", false).await.unwrap();
        store.complete_task_tree("done").await.unwrap();
        store.start_task_tree("stuck", "u1", false).await.unwrap();

        clock.set(Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap());
        store.increment_quota_count("u1", day(), CounterType::Total, 1).await.unwrap();

        let deleted = store.cleanup_older_than(day(), 30).await.unwrap();
        assert_eq!(deleted, 3);
        assert!(store.get_task_tree("stuck").await.unwrap().is_some());
        assert!(store.get_task_tree("done").await.unwrap().is_none());
        assert_eq!(store.get_quota_count("u1", day(), CounterType::Total).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_rejects_unrepresentable_window() {
        let store = MemoryCounterStore::new();
        store.increment_quota_count("u1", day(), CounterType::Total, 1).await.unwrap();

        let err = store.cleanup_older_than(day(), 1_000_000_000).await.unwrap_err();
        assert!(matches!(err, QuotaGateError::InvalidInput(_)));
        let err = store.cleanup_older_than(day(), -1).await.unwrap_err();
        assert!(matches!(err, QuotaGateError::InvalidInput(_)));
        assert_eq!(store.get_quota_count("u1", day(), CounterType::Total).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_resets_drifted_counters() {
        let store = MemoryCounterStore::new();
        store.start_task_tree("t1", "u1", false).await.unwrap();
        store.increment_concurrency(ConcurrencyScope::User, "u2", 3).await.unwrap();

        let drifts = store.reconcile_concurrency().await.unwrap();
        assert_eq!(drifts.len(), 3);
        assert_eq!(
            store.get_concurrency_count(ConcurrencyScope::User, "u1").await.unwrap(),
            1
        );
        assert_eq!(
            store.get_concurrency_count(ConcurrencyScope::User, "u2").await.unwrap(),
            0
        );
        assert_eq!(
            store
                .get_concurrency_count(ConcurrencyScope::System, GLOBAL_IDENTIFIER)
                .await
                .unwrap(),
            1
        );
        assert!(store.reconcile_concurrency().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryCounterStore::new();
        store.set_unavailable(true);
        let err = store
            .get_quota_count("u1", day(), CounterType::Total)
            .await
            .unwrap_err();
        assert!(err.is_storage_failure());
        store.set_unavailable(false);
        assert!(store.get_quota_count("u1", day(), CounterType::Total).await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_operation_leaves_others_working() {
        let store = MemoryCounterStore::new();
        store.fail_operation("start_task_tree");

        let err = store.start_task_tree("t1", "u1", false).await.unwrap_err();
        assert!(err.is_storage_failure());
        assert_eq!(
            store.increment_concurrency(ConcurrencyScope::User, "u1", 1).await.unwrap(),
            1
        );

        store.clear_failures();
        assert!(store.start_task_tree("t1", "u1", false).await.is_ok());
    }
}
