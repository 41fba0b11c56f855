//! Quotagate Services Layer
//!
//! Admission checks, task tree lifecycle tracking, usage statistics and retention,
//! all built on a shared [`quotagate_db::CounterStore`]. [`QuotaGate`] bundles them
//! behind the small set of operations the task-execution engine calls.

mod bounded;

pub mod admission;
pub mod gate;
pub mod lifecycle;
pub mod retention;
pub mod usage;

pub use admission::{AdmissionController, AdmissionEvaluation};
pub use gate::QuotaGate;
pub use lifecycle::{AdmissionOutcome, LifecycleTracker};
pub use retention::{RetentionReport, RetentionService};
pub use usage::UsageTracker;
