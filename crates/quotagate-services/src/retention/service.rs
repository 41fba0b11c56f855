use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use quotagate_core::calendar::retention_cutoff;
use quotagate_core::{Clock, CounterDrift, Result};
use quotagate_db::CounterStore;

/// Result of one retention pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionReport {
    /// Rows dated before this day were eligible for deletion.
    pub cutoff: NaiveDate,
    pub rows_deleted: u64,
}

/// Deletes expired quota counters, usage stats and completed tracking rows.
#[derive(Clone)]
pub struct RetentionService {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    retention_days: i64,
    interval: Duration,
}

impl RetentionService {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        retention_days: i64,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            retention_days,
            interval,
        }
    }

    /// Start the background retention task.
    /// Returns a JoinHandle for graceful shutdown
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut retention_interval = interval(self.interval);

            loop {
                retention_interval.tick().await;

                tracing::info!("Starting scheduled quota retention pass");

                match self.run_once().await {
                    Ok(report) => tracing::info!(
                        cutoff = %report.cutoff,
                        rows_deleted = report.rows_deleted,
                        "Quota retention pass completed"
                    ),
                    Err(e) => tracing::error!(error = %e, "Quota retention pass failed"),
                }
            }
        })
    }

    #[tracing::instrument(skip(self), fields(retention_days = self.retention_days))]
    pub async fn run_once(&self) -> Result<RetentionReport> {
        self.run_with(self.retention_days).await
    }

    /// One pass with an explicit retention window, for operator-triggered cleanups.
    #[tracing::instrument(skip(self))]
    pub async fn run_with(&self, days_to_keep: i64) -> Result<RetentionReport> {
        let today = self.clock.today();
        let cutoff = retention_cutoff(today, days_to_keep)?;
        let rows_deleted = self.store.cleanup_older_than(today, days_to_keep).await?;
        Ok(RetentionReport {
            cutoff,
            rows_deleted,
        })
    }

    /// Rebuild concurrency counters from open tracking rows.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<Vec<CounterDrift>> {
        let drifts = self.store.reconcile_concurrency().await?;
        for drift in &drifts {
            tracing::warn!(
                scope = %drift.scope,
                identifier = %drift.identifier,
                recorded = drift.recorded,
                actual = drift.actual,
                "Corrected concurrency counter"
            );
        }
        Ok(drifts)
    }
}
