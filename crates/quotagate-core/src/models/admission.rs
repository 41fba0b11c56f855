use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

use crate::config::{FailMode, QuotaLimits};
use crate::models::TaskTreeTracking;

/// Caller tier. Callers presenting their own LLM credential are premium.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Premium,
}

impl Tier {
    pub fn from_llm_key(has_llm_key: bool) -> Self {
        if has_llm_key {
            Tier::Premium
        } else {
            Tier::Free
        }
    }

    pub fn is_premium(&self) -> bool {
        matches!(self, Tier::Premium)
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Premium => write!(f, "premium"),
        }
    }
}

/// Machine-readable reason attached to every admission result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionReason {
    None,
    TotalQuotaExceeded,
    LlmQuotaExceeded,
    SystemConcurrencyLimitExceeded,
    UserConcurrencyLimitExceeded,
    UserRequestLimitExceeded,
    IpRequestLimitExceeded,
    StorageError,
    Disabled,
}

impl AdmissionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionReason::None => "none",
            AdmissionReason::TotalQuotaExceeded => "total_quota_exceeded",
            AdmissionReason::LlmQuotaExceeded => "llm_quota_exceeded",
            AdmissionReason::SystemConcurrencyLimitExceeded => "system_concurrency_limit_exceeded",
            AdmissionReason::UserConcurrencyLimitExceeded => "user_concurrency_limit_exceeded",
            AdmissionReason::UserRequestLimitExceeded => "user_request_limit_exceeded",
            AdmissionReason::IpRequestLimitExceeded => "ip_request_limit_exceeded",
            AdmissionReason::StorageError => "storage_error",
            AdmissionReason::Disabled => "disabled",
        }
    }

    /// Whether this reason denies because a limit was reached (as opposed to a
    /// storage failure or no denial at all).
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(
            self,
            AdmissionReason::TotalQuotaExceeded
                | AdmissionReason::LlmQuotaExceeded
                | AdmissionReason::SystemConcurrencyLimitExceeded
                | AdmissionReason::UserConcurrencyLimitExceeded
                | AdmissionReason::UserRequestLimitExceeded
                | AdmissionReason::IpRequestLimitExceeded
        )
    }
}

impl Display for AdmissionReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// Daily quota counts and limits observed by a check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub total_used: i64,
    pub total_limit: i64,
    pub llm_used: i64,
    pub llm_limit: i64,
}

/// Active task tree counts and limits observed by a check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConcurrencySnapshot {
    pub global_active: i64,
    pub global_limit: i64,
    pub user_active: i64,
    pub user_limit: i64,
}

/// Daily request counts observed by a request-limit check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RequestSnapshot {
    pub user_count: Option<i64>,
    pub user_limit: i64,
    pub ip_count: Option<i64>,
    pub ip_limit: i64,
}

/// Outcome of a read-only admission check.
///
/// Exceeding a limit is a normal outcome (`allowed=false` plus a reason), never an error.
/// `llm_quota_exceeded` separates "must not run real work" (free caller, degrade to demo
/// output) from "must not run at all".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdmissionResult {
    pub allowed: bool,
    pub reason: AdmissionReason,
    #[serde(default)]
    pub llm_quota_exceeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<ConcurrencySnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<RequestSnapshot>,
}

impl AdmissionResult {
    fn bare(allowed: bool, reason: AdmissionReason) -> Self {
        Self {
            allowed,
            reason,
            llm_quota_exceeded: false,
            tier: None,
            quota: None,
            concurrency: None,
            requests: None,
        }
    }

    pub fn allowed() -> Self {
        Self::bare(true, AdmissionReason::None)
    }

    pub fn denied(reason: AdmissionReason) -> Self {
        Self::bare(false, reason)
    }

    /// Admission control switched off: always allowed, storage never consulted.
    pub fn disabled() -> Self {
        Self::bare(true, AdmissionReason::Disabled)
    }

    /// The store could not answer; the configured fail mode decides.
    pub fn storage_error(fail_mode: FailMode) -> Self {
        Self::bare(fail_mode == FailMode::Open, AdmissionReason::StorageError)
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_quota(mut self, quota: QuotaSnapshot) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencySnapshot) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_requests(mut self, requests: RequestSnapshot) -> Self {
        self.requests = Some(requests);
        self
    }

    /// Status code a transport layer should answer with for this result.
    pub fn http_status_code(&self) -> u16 {
        if self.allowed {
            200
        } else if self.reason == AdmissionReason::StorageError {
            503
        } else {
            429
        }
    }
}

/// Caller-facing policy derived from a quota check and a concurrency check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    /// Run the real work.
    Admit,
    /// Proceed, but substitute demo/cached output instead of resource-consuming work.
    Degrade { reason: AdmissionReason },
    /// Do not run at all.
    Reject { reason: AdmissionReason },
}

impl AdmissionDecision {
    pub fn proceeds(&self) -> bool {
        !matches!(self, AdmissionDecision::Reject { .. })
    }
}

/// Read-only projection used for "quota remaining" displays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaStatus {
    pub enabled: bool,
    pub storage_available: bool,
    pub tier: Tier,
    pub date: NaiveDate,
    pub total_used: i64,
    pub total_limit: i64,
    pub total_remaining: i64,
    pub total_quota_exceeded: bool,
    pub llm_used: i64,
    pub llm_limit: i64,
    pub llm_remaining: i64,
    pub llm_quota_exceeded: bool,
    pub resets_at: DateTime<Utc>,
}

/// Configured limits, as reported by [`SystemStats`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitsSummary {
    pub free_user_total_limit: i64,
    pub free_user_llm_limit: i64,
    pub premium_user_total_limit: i64,
    pub max_concurrent_per_user: i64,
}

/// Operator view of system-wide concurrency and the configured limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemStats {
    pub enabled: bool,
    pub storage_available: bool,
    pub fail_mode: FailMode,
    pub total_concurrent: i64,
    pub max_concurrent: i64,
    /// Users holding at least one concurrency slot.
    pub active_users: i64,
    /// Whether a new task tree would currently pass the global concurrency check.
    /// With storage down this is what the fail mode answers.
    pub accepting_new_trees: bool,
    pub quota_config: LimitsSummary,
}

/// Input of the atomic check-and-start performed by the counter store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTreeAdmissionRequest {
    pub user_id: String,
    pub task_tree_id: String,
    pub is_llm_consuming: bool,
    pub tier: Tier,
    pub date: NaiveDate,
    pub limits: QuotaLimits,
    pub max_concurrent_global: i64,
    pub max_concurrent_per_user: i64,
}

/// Outcome of the atomic check-and-start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AtomicAdmission {
    /// Counters incremented and the tree is tracked.
    Started {
        tracking: TaskTreeTracking,
        result: AdmissionResult,
    },
    /// Free caller over the LLM sub-quota: tracked and counted as non-LLM work.
    Degraded {
        tracking: TaskTreeTracking,
        result: AdmissionResult,
    },
    /// Nothing was changed.
    Denied { result: AdmissionResult },
}

impl AtomicAdmission {
    pub fn result(&self) -> &AdmissionResult {
        match self {
            AtomicAdmission::Started { result, .. }
            | AtomicAdmission::Degraded { result, .. }
            | AtomicAdmission::Denied { result } => result,
        }
    }

    pub fn tracking(&self) -> Option<&TaskTreeTracking> {
        match self {
            AtomicAdmission::Started { tracking, .. }
            | AtomicAdmission::Degraded { tracking, .. } => Some(tracking),
            AtomicAdmission::Denied { .. } => None,
        }
    }
}
