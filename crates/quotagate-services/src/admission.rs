//! Read-only admission checks.
//!
//! The controller turns counts read from the [`CounterStore`] into typed results.
//! It never mutates quota or concurrency counters, except [`AdmissionController::record_request`]
//! which feeds the request limit. Every store call is bounded by the configured storage
//! timeout and storage failures are resolved by the configured [`FailMode`].
//!
//! [`FailMode`]: quotagate_core::FailMode

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use quotagate_core::models::{ip_counter_key, CounterType, QuotaCounter};
use quotagate_core::policy::{decide, evaluate_concurrency, evaluate_quota, evaluate_requests, remaining};
use quotagate_core::{
    next_reset, AdmissionDecision, AdmissionResult, Clock, ConcurrencyScope, FailMode,
    LimitsSummary, QuotaConfig, QuotaGateError, QuotaStatus, SystemStats, Tier,
    GLOBAL_IDENTIFIER,
};
use quotagate_db::CounterStore;

use crate::bounded::bounded;

/// Both read-only checks and the decision derived from them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdmissionEvaluation {
    pub decision: AdmissionDecision,
    pub quota: AdmissionResult,
    pub concurrency: AdmissionResult,
}

#[derive(Clone)]
pub struct AdmissionController {
    store: Arc<dyn CounterStore>,
    config: Arc<QuotaConfig>,
    clock: Arc<dyn Clock>,
}

fn count_of(counters: &[QuotaCounter], counter_type: CounterType) -> i64 {
    counters
        .iter()
        .find(|c| c.counter_type == counter_type)
        .map(|c| c.count)
        .unwrap_or(0)
}

impl AdmissionController {
    pub fn new(store: Arc<dyn CounterStore>, config: Arc<QuotaConfig>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    fn storage_failed(&self, operation: &'static str, err: QuotaGateError) -> AdmissionResult {
        tracing::warn!(
            error = %err,
            operation,
            fail_mode = %self.config.fail_mode,
            "Counter storage failed, applying fail mode"
        );
        AdmissionResult::storage_error(self.config.fail_mode)
    }

    /// Daily quota check for one caller.
    #[tracing::instrument(skip(self))]
    pub async fn check_quota(
        &self,
        user_id: &str,
        is_llm_consuming: bool,
        has_llm_key: bool,
    ) -> AdmissionResult {
        if !self.config.enabled {
            return AdmissionResult::disabled();
        }

        let tier = Tier::from_llm_key(has_llm_key);
        let today = self.clock.today();
        let counters = match bounded(
            self.config.storage_timeout(),
            "list_quota_counters",
            self.store.list_quota_counters(user_id, today),
        )
        .await
        {
            Ok(counters) => counters,
            Err(e) => return self.storage_failed("check_quota", e).with_tier(tier),
        };

        let result = evaluate_quota(
            tier,
            is_llm_consuming,
            count_of(&counters, CounterType::Total),
            count_of(&counters, CounterType::Llm),
            self.config.limits_for(tier),
        );

        if !result.allowed {
            tracing::info!(user_id = %user_id, reason = %result.reason, "Daily quota exceeded");
        }
        result
    }

    /// Concurrency check. The system-wide limit is checked before the per-user limit.
    #[tracing::instrument(skip(self))]
    pub async fn check_concurrency(&self, user_id: &str) -> AdmissionResult {
        if !self.config.enabled {
            return AdmissionResult::disabled();
        }

        let timeout = self.config.storage_timeout();
        let global_active = match bounded(
            timeout,
            "get_concurrency_count",
            self.store
                .get_concurrency_count(ConcurrencyScope::System, GLOBAL_IDENTIFIER),
        )
        .await
        {
            Ok(count) => count,
            Err(e) => return self.storage_failed("check_concurrency", e),
        };
        let user_active = match bounded(
            timeout,
            "get_concurrency_count",
            self.store.get_concurrency_count(ConcurrencyScope::User, user_id),
        )
        .await
        {
            Ok(count) => count,
            Err(e) => return self.storage_failed("check_concurrency", e),
        };

        let result = evaluate_concurrency(
            global_active,
            user_active,
            self.config.max_concurrent_global,
            self.config.max_concurrent_per_user,
        );

        if !result.allowed {
            tracing::info!(user_id = %user_id, reason = %result.reason, "Concurrency limit reached");
        }
        result
    }

    /// Run both checks and derive the caller-facing decision.
    #[tracing::instrument(skip(self))]
    pub async fn evaluate(
        &self,
        user_id: &str,
        is_llm_consuming: bool,
        has_llm_key: bool,
    ) -> AdmissionEvaluation {
        let quota = self
            .check_quota(user_id, is_llm_consuming, has_llm_key)
            .await;
        let concurrency = self.check_concurrency(user_id).await;
        let decision = decide(Tier::from_llm_key(has_llm_key), &quota, &concurrency);

        tracing::debug!(user_id = %user_id, decision = ?decision, "Admission evaluated");

        AdmissionEvaluation {
            decision,
            quota,
            concurrency,
        }
    }

    /// Remaining-quota projection. Never mutates anything.
    #[tracing::instrument(skip(self))]
    pub async fn get_user_quota_status(&self, user_id: &str, has_llm_key: bool) -> QuotaStatus {
        let tier = Tier::from_llm_key(has_llm_key);
        let limits = self.config.limits_for(tier);
        let now = self.clock.now();
        let today = now.date_naive();

        let (counters, storage_available) = if self.config.enabled {
            match bounded(
                self.config.storage_timeout(),
                "list_quota_counters",
                self.store.list_quota_counters(user_id, today),
            )
            .await
            {
                Ok(counters) => (counters, true),
                Err(e) => {
                    tracing::warn!(error = %e, user_id = %user_id, "Quota status unavailable");
                    (Vec::new(), false)
                }
            }
        } else {
            (Vec::new(), true)
        };

        let total_used = count_of(&counters, CounterType::Total);
        let llm_used = count_of(&counters, CounterType::Llm);

        QuotaStatus {
            enabled: self.config.enabled,
            storage_available,
            tier,
            date: today,
            total_used,
            total_limit: limits.total,
            total_remaining: remaining(limits.total, total_used),
            total_quota_exceeded: total_used >= limits.total,
            llm_used,
            llm_limit: limits.llm,
            llm_remaining: remaining(limits.llm, llm_used),
            llm_quota_exceeded: !tier.is_premium() && llm_used >= limits.llm,
            resets_at: next_reset(now),
        }
    }

    /// Daily request limit for an optional user and an optional client IP.
    #[tracing::instrument(skip(self))]
    pub async fn check_request_limit(
        &self,
        user_id: Option<&str>,
        ip_address: Option<&str>,
    ) -> AdmissionResult {
        if !self.config.enabled {
            return AdmissionResult::disabled();
        }

        let timeout = self.config.storage_timeout();
        let today = self.clock.today();

        let user_count = match user_id {
            Some(user_id) => match bounded(
                timeout,
                "get_quota_count",
                self.store
                    .get_quota_count(user_id, today, CounterType::Request),
            )
            .await
            {
                Ok(count) => Some(count),
                Err(e) => return self.storage_failed("check_request_limit", e),
            },
            None => None,
        };

        let ip_count = match ip_address {
            Some(ip) => match bounded(
                timeout,
                "get_quota_count",
                self.store
                    .get_quota_count(&ip_counter_key(ip), today, CounterType::Request),
            )
            .await
            {
                Ok(count) => Some(count),
                Err(e) => return self.storage_failed("check_request_limit", e),
            },
            None => None,
        };

        evaluate_requests(
            user_count,
            ip_count,
            self.config.daily_request_limit_per_user,
            self.config.daily_request_limit_per_ip,
        )
    }

    /// Count one request against the user and IP request limits. Failures are logged.
    #[tracing::instrument(skip(self))]
    pub async fn record_request(&self, user_id: Option<&str>, ip_address: Option<&str>) {
        if !self.config.enabled {
            return;
        }

        let timeout = self.config.storage_timeout();
        let today = self.clock.today();
        let keys = user_id
            .map(str::to_string)
            .into_iter()
            .chain(ip_address.map(ip_counter_key));

        for key in keys {
            if let Err(e) = bounded(
                timeout,
                "increment_quota_count",
                self.store
                    .increment_quota_count(&key, today, CounterType::Request, 1),
            )
            .await
            {
                tracing::warn!(error = %e, key = %key, "Failed to record request");
            }
        }
    }

    /// System-wide concurrency next to the configured limits. Never mutates anything.
    #[tracing::instrument(skip(self))]
    pub async fn get_system_stats(&self) -> SystemStats {
        let counters = if self.config.enabled {
            bounded(
                self.config.storage_timeout(),
                "list_concurrency_counters",
                self.store.list_concurrency_counters(),
            )
            .await
            .map(Some)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "System statistics unavailable");
                None
            })
        } else {
            Some(Vec::new())
        };

        let storage_available = counters.is_some();
        let counters = counters.unwrap_or_default();
        let total_concurrent = counters
            .iter()
            .find(|c| c.scope == ConcurrencyScope::System && c.identifier == GLOBAL_IDENTIFIER)
            .map(|c| c.count)
            .unwrap_or(0);
        let active_users = counters
            .iter()
            .filter(|c| c.scope == ConcurrencyScope::User && c.count > 0)
            .count() as i64;

        let accepting_new_trees = if !self.config.enabled {
            true
        } else if storage_available {
            total_concurrent < self.config.max_concurrent_global
        } else {
            self.config.fail_mode == FailMode::Open
        };

        SystemStats {
            enabled: self.config.enabled,
            storage_available,
            fail_mode: self.config.fail_mode,
            total_concurrent,
            max_concurrent: self.config.max_concurrent_global,
            active_users,
            accepting_new_trees,
            quota_config: LimitsSummary {
                free_user_total_limit: self.config.daily_total_limit_free,
                free_user_llm_limit: self.config.daily_llm_limit_free,
                premium_user_total_limit: self.config.daily_total_limit_premium,
                max_concurrent_per_user: self.config.max_concurrent_per_user,
            },
        }
    }
}
