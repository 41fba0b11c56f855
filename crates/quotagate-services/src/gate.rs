use chrono::NaiveDate;
use std::sync::Arc;

use quotagate_core::{
    AdmissionResult, Clock, CompletionOutcome, QuotaConfig, QuotaStatus, Result, SystemClock,
    SystemStats, UsageReport,
};
use quotagate_db::CounterStore;

use crate::admission::{AdmissionController, AdmissionEvaluation};
use crate::lifecycle::{AdmissionOutcome, LifecycleTracker};
use crate::retention::RetentionService;
use crate::usage::UsageTracker;

/// Entry point used by the task-execution engine.
///
/// Built once from a counter store and a configuration, then cloned and passed to
/// whoever needs it. Holds no mutable state of its own.
#[derive(Clone)]
pub struct QuotaGate {
    config: Arc<QuotaConfig>,
    admission: AdmissionController,
    lifecycle: LifecycleTracker,
    usage: UsageTracker,
    retention: Arc<RetentionService>,
}

impl QuotaGate {
    pub fn new(store: Arc<dyn CounterStore>, config: QuotaConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn CounterStore>, config: QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        let config = Arc::new(config);
        Self {
            admission: AdmissionController::new(store.clone(), config.clone(), clock.clone()),
            lifecycle: LifecycleTracker::new(store.clone(), config.clone(), clock.clone()),
            usage: UsageTracker::new(store.clone(), config.clone(), clock.clone()),
            retention: Arc::new(RetentionService::new(
                store,
                clock,
                config.retention_days,
                config.cleanup_interval(),
            )),
            config,
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn lifecycle(&self) -> &LifecycleTracker {
        &self.lifecycle
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn retention(&self) -> Arc<RetentionService> {
        self.retention.clone()
    }

    pub async fn check_quota(
        &self,
        user_id: &str,
        is_llm_consuming: bool,
        has_llm_key: bool,
    ) -> AdmissionResult {
        self.admission
            .check_quota(user_id, is_llm_consuming, has_llm_key)
            .await
    }

    pub async fn check_concurrency(&self, user_id: &str) -> AdmissionResult {
        self.admission.check_concurrency(user_id).await
    }

    pub async fn evaluate(
        &self,
        user_id: &str,
        is_llm_consuming: bool,
        has_llm_key: bool,
    ) -> AdmissionEvaluation {
        self.admission
            .evaluate(user_id, is_llm_consuming, has_llm_key)
            .await
    }

    pub async fn get_status(&self, user_id: &str, has_llm_key: bool) -> QuotaStatus {
        self.admission
            .get_user_quota_status(user_id, has_llm_key)
            .await
    }

    pub async fn system_stats(&self) -> SystemStats {
        self.admission.get_system_stats().await
    }

    pub async fn check_request_limit(
        &self,
        user_id: Option<&str>,
        ip_address: Option<&str>,
    ) -> AdmissionResult {
        self.admission
            .check_request_limit(user_id, ip_address)
            .await
    }

    pub async fn record_request(&self, user_id: Option<&str>, ip_address: Option<&str>) {
        self.admission.record_request(user_id, ip_address).await
    }

    pub async fn start(&self, user_id: &str, task_tree_id: &str, is_llm_consuming: bool) -> Result<()> {
        self.lifecycle
            .start(user_id, task_tree_id, is_llm_consuming)
            .await
    }

    pub async fn complete(&self, task_tree_id: &str) -> CompletionOutcome {
        self.lifecycle.complete(task_tree_id).await
    }

    pub async fn admit(
        &self,
        user_id: &str,
        task_tree_id: &str,
        is_llm_consuming: bool,
        has_llm_key: bool,
    ) -> Result<AdmissionOutcome> {
        self.lifecycle
            .admit(user_id, task_tree_id, is_llm_consuming, has_llm_key)
            .await
    }

    pub async fn log_task_execution(&self, task_tree_id: &str, user_id: Option<&str>, is_demo: bool) {
        self.usage
            .log_task_execution(task_tree_id, user_id, is_demo)
            .await
    }

    pub async fn get_usage_stats(&self, date: Option<NaiveDate>, user_id: Option<&str>) -> UsageReport {
        self.usage.get_usage_stats(date, user_id).await
    }
}
