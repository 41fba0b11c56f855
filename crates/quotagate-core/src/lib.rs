//! Quotagate Core Library
//!
//! Domain models, configuration, error types and the pure admission policy shared
//! by the counter store, the admission services and the operator CLI.

pub mod calendar;
pub mod config;
pub mod error;
pub mod models;
pub mod policy;

// Re-export commonly used types
pub use calendar::{next_reset, Clock, FixedClock, SystemClock};
pub use config::{DatabaseConfig, FailMode, QuotaConfig, QuotaLimits};
pub use error::{ErrorMetadata, LogLevel, QuotaGateError, Result};
pub use models::{
    AdmissionDecision, AdmissionReason, AdmissionResult, AtomicAdmission, CompletionOutcome,
    ConcurrencyCounter, ConcurrencyScope, ConcurrencySnapshot, CounterDrift, CounterType,
    LimitsSummary, QuotaCounter, QuotaSnapshot, QuotaStatus, RequestSnapshot, SystemStats,
    TaskTreeAdmissionRequest, TaskTreeCompletion,
    TaskTreeState, TaskTreeTracking, Tier, UsageReport, UsageStatType, GLOBAL_IDENTIFIER,
};
