pub mod admission;
pub mod counter;
pub mod tracking;
pub mod usage;

pub use admission::{
    AdmissionDecision, AdmissionReason, AdmissionResult, AtomicAdmission, ConcurrencySnapshot,
    LimitsSummary, QuotaSnapshot, QuotaStatus, RequestSnapshot, SystemStats,
    TaskTreeAdmissionRequest, Tier,
};
pub use counter::{
    ip_counter_key, ConcurrencyCounter, ConcurrencyScope, CounterDrift, CounterType,
    QuotaCounter, GLOBAL_IDENTIFIER,
};
pub use tracking::{CompletionOutcome, TaskTreeCompletion, TaskTreeState, TaskTreeTracking};
pub use usage::{UsageReport, UsageStatType};
