//! Error types module
//!
//! All failures of the quota gate are unified under [`QuotaGateError`]. Quota and
//! concurrency exhaustion are deliberately absent: they are normal admission outcomes
//! carried by [`crate::models::AdmissionReason`], not errors.
//!
//! The `Database` and `Migration` variants are gated behind the `sqlx` feature.

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like invalid input
    Debug,
    /// Warning level - for recoverable issues like storage outages
    Warn,
    /// Error level - for caller bugs and unexpected failures
    Error,
}

/// Metadata for error responses - defines how an error should be presented
/// by a transport layer sitting in front of the gate.
pub trait ErrorMetadata {
    /// HTTP status code to return
    fn http_status_code(&self) -> u16;

    /// Machine-readable error code (e.g., "STORAGE_UNAVAILABLE")
    fn error_code(&self) -> &'static str;

    /// Whether this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum QuotaGateError {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    #[cfg(feature = "sqlx")]
    #[error("Migration error: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("Counter storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Counter storage call '{operation}' timed out after {timeout_ms}ms")]
    StorageTimeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Task tree '{tree_id}' has already been started")]
    DuplicateTreeStart { tree_id: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, QuotaGateError>;

#[cfg(feature = "sqlx")]
impl From<SqlxError> for QuotaGateError {
    fn from(err: SqlxError) -> Self {
        QuotaGateError::Database(err)
    }
}

#[cfg(feature = "sqlx")]
impl From<sqlx::migrate::MigrateError> for QuotaGateError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        QuotaGateError::Migration(err)
    }
}

impl QuotaGateError {
    /// True for failures of the counter store itself. These are subject to the
    /// configured fail policy instead of being raised to the end caller.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            QuotaGateError::Database(_)
                | QuotaGateError::StorageUnavailable(_)
                | QuotaGateError::StorageTimeout { .. }
        )
    }
}

/// Static metadata for each variant: (http_status, error_code, recoverable, log_level).
fn quota_gate_error_static_metadata(
    err: &QuotaGateError,
) -> (u16, &'static str, bool, LogLevel) {
    match err {
        QuotaGateError::Database(_) => (503, "DATABASE_ERROR", true, LogLevel::Warn),
        #[cfg(feature = "sqlx")]
        QuotaGateError::Migration(_) => (500, "MIGRATION_ERROR", false, LogLevel::Error),
        QuotaGateError::StorageUnavailable(_) => {
            (503, "STORAGE_UNAVAILABLE", true, LogLevel::Warn)
        }
        QuotaGateError::StorageTimeout { .. } => (503, "STORAGE_TIMEOUT", true, LogLevel::Warn),
        QuotaGateError::DuplicateTreeStart { .. } => {
            (409, "DUPLICATE_TREE_START", false, LogLevel::Error)
        }
        QuotaGateError::InvalidInput(_) => (400, "INVALID_INPUT", false, LogLevel::Debug),
    }
}

impl ErrorMetadata for QuotaGateError {
    fn http_status_code(&self) -> u16 {
        quota_gate_error_static_metadata(self).0
    }

    fn error_code(&self) -> &'static str {
        quota_gate_error_static_metadata(self).1
    }

    fn is_recoverable(&self) -> bool {
        quota_gate_error_static_metadata(self).2
    }

    fn log_level(&self) -> LogLevel {
        quota_gate_error_static_metadata(self).3
    }
}
