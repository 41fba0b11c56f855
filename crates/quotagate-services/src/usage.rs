use chrono::NaiveDate;
use std::sync::Arc;

use quotagate_core::{Clock, QuotaConfig, UsageReport, UsageStatType, GLOBAL_IDENTIFIER};
use quotagate_db::CounterStore;

use crate::bounded::bounded;

/// Daily execution statistics. Reporting only: nothing here feeds admission, and
/// failures are logged rather than raised.
#[derive(Clone)]
pub struct UsageTracker {
    store: Arc<dyn CounterStore>,
    config: Arc<QuotaConfig>,
    clock: Arc<dyn Clock>,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn CounterStore>, config: Arc<QuotaConfig>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn log_task_execution(&self, task_tree_id: &str, user_id: Option<&str>, is_demo: bool) {
        let today = self.clock.today();
        let mut stats = vec![(UsageStatType::Total, GLOBAL_IDENTIFIER)];
        if is_demo {
            stats.push((UsageStatType::Demo, GLOBAL_IDENTIFIER));
        }
        if let Some(user_id) = user_id {
            stats.push((UsageStatType::User, user_id));
        }

        for (stat_type, identifier) in stats {
            if let Err(e) = bounded(
                self.config.storage_timeout(),
                "increment_usage_stat",
                self.store
                    .increment_usage_stat(today, stat_type, identifier, 1),
            )
            .await
            {
                tracing::warn!(
                    error = %e,
                    task_tree_id = %task_tree_id,
                    stat_type = %stat_type,
                    "Failed to log task execution"
                );
                return;
            }
        }

        tracing::debug!(task_tree_id = %task_tree_id, is_demo, "Task execution logged");
    }

    /// Usage for `date` (today when omitted), plus one user's count when given.
    #[tracing::instrument(skip(self))]
    pub async fn get_usage_stats(&self, date: Option<NaiveDate>, user_id: Option<&str>) -> UsageReport {
        let date = date.unwrap_or_else(|| self.clock.today());
        let mut report = UsageReport::empty(date);

        match self.read(date, user_id).await {
            Ok((total, demo, user)) => {
                report.total_tasks = total;
                report.demo_tasks = demo;
                report.user_tasks = user;
            }
            Err(e) => {
                tracing::warn!(error = %e, date = %date, "Usage statistics unavailable");
                report.database_unavailable = true;
            }
        }

        report
    }

    async fn read(
        &self,
        date: NaiveDate,
        user_id: Option<&str>,
    ) -> quotagate_core::Result<(i64, i64, Option<i64>)> {
        let timeout = self.config.storage_timeout();
        let total = bounded(
            timeout,
            "get_usage_stat",
            self.store
                .get_usage_stat(date, UsageStatType::Total, GLOBAL_IDENTIFIER),
        )
        .await?;
        let demo = bounded(
            timeout,
            "get_usage_stat",
            self.store
                .get_usage_stat(date, UsageStatType::Demo, GLOBAL_IDENTIFIER),
        )
        .await?;
        let user = match user_id {
            Some(user_id) => Some(
                bounded(
                    timeout,
                    "get_usage_stat",
                    self.store.get_usage_stat(date, UsageStatType::User, user_id),
                )
                .await?,
            ),
            None => None,
        };
        Ok((total, demo, user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotagate_core::SystemClock;
    use quotagate_db::MemoryCounterStore;

    fn tracker(store: Arc<MemoryCounterStore>) -> UsageTracker {
        UsageTracker::new(store, Arc::new(QuotaConfig::default()), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_logs_total_demo_and_user_counts() {
        let store = Arc::new(MemoryCounterStore::new());
        let usage = tracker(store);

        usage.log_task_execution("t1", Some("u1"), false).await;
        usage.log_task_execution("t2", Some("u1"), true).await;
        usage.log_task_execution("t3", None, true).await;

        let report = usage.get_usage_stats(None, Some("u1")).await;
        assert_eq!(report.total_tasks, 3);
        assert_eq!(report.demo_tasks, 2);
        assert_eq!(report.user_tasks, Some(2));
        assert!(!report.database_unavailable);
    }

    #[tokio::test]
    async fn test_unavailable_store_reports_zeros() {
        let store = Arc::new(MemoryCounterStore::new());
        store.set_unavailable(true);
        let usage = tracker(store);

        usage.log_task_execution("t1", Some("u1"), false).await;
        let report = usage.get_usage_stats(None, None).await;
        assert!(report.database_unavailable);
        assert_eq!(report.total_tasks, 0);
        assert_eq!(report.user_tasks, None);
    }
}
