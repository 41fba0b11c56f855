//! Admission policy
//!
//! Pure functions turning observed counts and configured limits into admission
//! results. The admission controller, the PostgreSQL store and the in-memory store
//! all decide through these functions so the read-only checks and the atomic
//! check-and-start can never disagree.

use crate::config::QuotaLimits;
use crate::models::{
    AdmissionDecision, AdmissionReason, AdmissionResult, ConcurrencySnapshot, QuotaSnapshot,
    RequestSnapshot, TaskTreeAdmissionRequest, Tier,
};

/// `max(0, limit - used)`
pub fn remaining(limit: i64, used: i64) -> i64 {
    (limit - used).max(0)
}

/// Daily quota check.
///
/// The total limit applies to every tier. The LLM sub-quota only applies to free
/// callers asking for LLM-consuming work, so a premium caller can never be denied
/// with `llm_quota_exceeded`.
pub fn evaluate_quota(
    tier: Tier,
    is_llm_consuming: bool,
    total_used: i64,
    llm_used: i64,
    limits: QuotaLimits,
) -> AdmissionResult {
    let snapshot = QuotaSnapshot {
        total_used,
        total_limit: limits.total,
        llm_used,
        llm_limit: limits.llm,
    };

    let result = if total_used >= limits.total {
        AdmissionResult::denied(AdmissionReason::TotalQuotaExceeded)
    } else if !tier.is_premium() && is_llm_consuming && llm_used >= limits.llm {
        let mut denied = AdmissionResult::denied(AdmissionReason::LlmQuotaExceeded);
        denied.llm_quota_exceeded = true;
        denied
    } else {
        AdmissionResult::allowed()
    };

    result.with_tier(tier).with_quota(snapshot)
}

/// Concurrency check. The system-wide limit is checked before the per-user limit.
pub fn evaluate_concurrency(
    global_active: i64,
    user_active: i64,
    global_limit: i64,
    user_limit: i64,
) -> AdmissionResult {
    let snapshot = ConcurrencySnapshot {
        global_active,
        global_limit,
        user_active,
        user_limit,
    };

    let result = if global_active >= global_limit {
        AdmissionResult::denied(AdmissionReason::SystemConcurrencyLimitExceeded)
    } else if user_active >= user_limit {
        AdmissionResult::denied(AdmissionReason::UserConcurrencyLimitExceeded)
    } else {
        AdmissionResult::allowed()
    };

    result.with_concurrency(snapshot)
}

/// Daily request-limit check for an optional user and an optional client IP.
pub fn evaluate_requests(
    user_count: Option<i64>,
    ip_count: Option<i64>,
    user_limit: i64,
    ip_limit: i64,
) -> AdmissionResult {
    let snapshot = RequestSnapshot {
        user_count,
        user_limit,
        ip_count,
        ip_limit,
    };

    let result = match (user_count, ip_count) {
        (Some(count), _) if count >= user_limit => {
            AdmissionResult::denied(AdmissionReason::UserRequestLimitExceeded)
        }
        (_, Some(count)) if count >= ip_limit => {
            AdmissionResult::denied(AdmissionReason::IpRequestLimitExceeded)
        }
        _ => AdmissionResult::allowed(),
    };

    result.with_requests(snapshot)
}

/// Caller-facing decision for a quota result and a concurrency result.
///
/// - total quota exceeded: reject, whatever the tier
/// - concurrency denied: reject, there is no degrade path for capacity
/// - free caller over the LLM sub-quota only: degrade to demo output
/// - fail-closed storage error: reject
pub fn decide(
    tier: Tier,
    quota: &AdmissionResult,
    concurrency: &AdmissionResult,
) -> AdmissionDecision {
    if !quota.allowed && quota.reason != AdmissionReason::LlmQuotaExceeded {
        return AdmissionDecision::Reject {
            reason: quota.reason,
        };
    }

    if !concurrency.allowed {
        return AdmissionDecision::Reject {
            reason: concurrency.reason,
        };
    }

    if !quota.allowed {
        return if tier.is_premium() {
            AdmissionDecision::Reject {
                reason: quota.reason,
            }
        } else {
            AdmissionDecision::Degrade {
                reason: quota.reason,
            }
        };
    }

    AdmissionDecision::Admit
}

/// What the atomic check-and-start must do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeAdmissionVerdict {
    /// Increment `total`, `llm` (when LLM-consuming) and both concurrency counters.
    Start { result: AdmissionResult },
    /// Increment `total` and both concurrency counters; the tree runs as non-LLM work.
    Degrade { result: AdmissionResult },
    /// Change nothing.
    Deny { result: AdmissionResult },
}

/// Evaluate a task tree admission against counts read under lock.
pub fn evaluate_tree_admission(
    request: &TaskTreeAdmissionRequest,
    total_used: i64,
    llm_used: i64,
    global_active: i64,
    user_active: i64,
) -> TreeAdmissionVerdict {
    let quota = evaluate_quota(
        request.tier,
        request.is_llm_consuming,
        total_used,
        llm_used,
        request.limits,
    );
    let concurrency = evaluate_concurrency(
        global_active,
        user_active,
        request.max_concurrent_global,
        request.max_concurrent_per_user,
    );

    let decision = decide(request.tier, &quota, &concurrency);

    let mut result = match decision {
        AdmissionDecision::Reject { reason }
            if reason == concurrency.reason && !concurrency.allowed =>
        {
            concurrency.clone()
        }
        _ => quota.clone(),
    };
    result.tier = Some(request.tier);
    result.quota = quota.quota;
    result.concurrency = concurrency.concurrency;

    match decision {
        AdmissionDecision::Admit => TreeAdmissionVerdict::Start { result },
        AdmissionDecision::Degrade { .. } => TreeAdmissionVerdict::Degrade { result },
        AdmissionDecision::Reject { .. } => TreeAdmissionVerdict::Deny { result },
    }
}
