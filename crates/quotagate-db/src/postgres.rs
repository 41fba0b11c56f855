use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgExecutor, PgPool, Postgres, Row};
use std::collections::HashMap;

use quotagate_core::calendar::retention_cutoff;
use quotagate_core::models::{
    AtomicAdmission, ConcurrencyCounter, ConcurrencyScope, CounterDrift, CounterType,
    QuotaCounter, TaskTreeAdmissionRequest, TaskTreeCompletion, TaskTreeTracking, UsageStatType,
    GLOBAL_IDENTIFIER,
};
use quotagate_core::policy::{evaluate_tree_admission, TreeAdmissionVerdict};
use quotagate_core::{QuotaGateError, Result};

use crate::store::{concurrency_drift, ensure_non_negative, CounterStore};

const TRACKING_COLUMNS: &str = "task_tree_id, user_id, is_llm_consuming, started_at, completed_at";

/// Counter store backed by PostgreSQL, shared by every server process.
#[derive(Clone)]
pub struct PgCounterStore {
    pool: PgPool,
}

impl PgCounterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn add_quota<'e, E: PgExecutor<'e>>(
    executor: E,
    user_id: &str,
    date: NaiveDate,
    counter_type: CounterType,
    amount: i64,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO quota_counters (user_id, quota_date, counter_type, count)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (user_id, quota_date, counter_type)
        DO UPDATE SET count = quota_counters.count + EXCLUDED.count, updated_at = NOW()
        RETURNING count
        "#,
    )
    .bind(user_id)
    .bind(date)
    .bind(counter_type.as_str())
    .bind(amount)
    .fetch_one(executor)
    .await?;

    Ok(count)
}

async fn read_quota<'e, E: PgExecutor<'e>>(
    executor: E,
    user_id: &str,
    date: NaiveDate,
    counter_type: CounterType,
) -> Result<i64> {
    let count: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT count FROM quota_counters
        WHERE user_id = $1 AND quota_date = $2 AND counter_type = $3
        "#,
    )
    .bind(user_id)
    .bind(date)
    .bind(counter_type.as_str())
    .fetch_optional(executor)
    .await?;

    Ok(count.unwrap_or(0))
}

async fn add_concurrency<'e, E: PgExecutor<'e>>(
    executor: E,
    scope: ConcurrencyScope,
    identifier: &str,
    amount: i64,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO concurrency_counters (scope, identifier, count)
        VALUES ($1, $2, $3)
        ON CONFLICT (scope, identifier)
        DO UPDATE SET count = concurrency_counters.count + EXCLUDED.count, updated_at = NOW()
        RETURNING count
        "#,
    )
    .bind(scope.as_str())
    .bind(identifier)
    .bind(amount)
    .fetch_one(executor)
    .await?;

    Ok(count)
}

// An upsert adding zero creates the row if needed and holds its lock until the
// surrounding transaction ends.
async fn lock_quota<'e, E: PgExecutor<'e>>(
    executor: E,
    user_id: &str,
    date: NaiveDate,
    counter_type: CounterType,
) -> Result<i64> {
    add_quota(executor, user_id, date, counter_type, 0).await
}

async fn lock_concurrency<'e, E: PgExecutor<'e>>(
    executor: E,
    scope: ConcurrencyScope,
    identifier: &str,
) -> Result<i64> {
    add_concurrency(executor, scope, identifier, 0).await
}

async fn insert_tracking<'e, E: PgExecutor<'e>>(
    executor: E,
    task_tree_id: &str,
    user_id: &str,
    is_llm_consuming: bool,
) -> Result<TaskTreeTracking> {
    let sql = format!(
        r#"
        INSERT INTO task_tree_tracking (task_tree_id, user_id, is_llm_consuming)
        VALUES ($1, $2, $3)
        RETURNING {}
        "#,
        TRACKING_COLUMNS
    );

    sqlx::query_as::<Postgres, TaskTreeTracking>(&sql)
        .bind(task_tree_id)
        .bind(user_id)
        .bind(is_llm_consuming)
        .fetch_one(executor)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                QuotaGateError::DuplicateTreeStart {
                    tree_id: task_tree_id.to_string(),
                }
            }
            other => QuotaGateError::Database(other),
        })
}

#[async_trait]
impl CounterStore for PgCounterStore {
    #[tracing::instrument(skip(self))]
    async fn get_quota_count(
        &self,
        user_id: &str,
        date: NaiveDate,
        counter_type: CounterType,
    ) -> Result<i64> {
        read_quota(&self.pool, user_id, date, counter_type).await
    }

    #[tracing::instrument(skip(self))]
    async fn increment_quota_count(
        &self,
        user_id: &str,
        date: NaiveDate,
        counter_type: CounterType,
        amount: i64,
    ) -> Result<i64> {
        ensure_non_negative(amount)?;
        add_quota(&self.pool, user_id, date, counter_type, amount).await
    }

    #[tracing::instrument(skip(self))]
    async fn list_quota_counters(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<QuotaCounter>> {
        let counters = sqlx::query_as::<Postgres, QuotaCounter>(
            r#"
            SELECT user_id, quota_date, counter_type, count, updated_at
            FROM quota_counters
            WHERE user_id = $1 AND quota_date = $2
            ORDER BY counter_type
            "#,
        )
        .bind(user_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        Ok(counters)
    }

    #[tracing::instrument(skip(self))]
    async fn get_concurrency_count(
        &self,
        scope: ConcurrencyScope,
        identifier: &str,
    ) -> Result<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM concurrency_counters WHERE scope = $1 AND identifier = $2",
        )
        .bind(scope.as_str())
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        Ok(count.unwrap_or(0))
    }

    #[tracing::instrument(skip(self))]
    async fn increment_concurrency(
        &self,
        scope: ConcurrencyScope,
        identifier: &str,
        amount: i64,
    ) -> Result<i64> {
        ensure_non_negative(amount)?;
        add_concurrency(&self.pool, scope, identifier, amount).await
    }

    #[tracing::instrument(skip(self))]
    async fn decrement_concurrency(
        &self,
        scope: ConcurrencyScope,
        identifier: &str,
        amount: i64,
    ) -> Result<i64> {
        ensure_non_negative(amount)?;
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE concurrency_counters
            SET count = GREATEST(count - $3, 0), updated_at = NOW()
            WHERE scope = $1 AND identifier = $2
            RETURNING count
            "#,
        )
        .bind(scope.as_str())
        .bind(identifier)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;

        Ok(count.unwrap_or(0))
    }

    #[tracing::instrument(skip(self))]
    async fn list_concurrency_counters(&self) -> Result<Vec<ConcurrencyCounter>> {
        let counters = sqlx::query_as::<Postgres, ConcurrencyCounter>(
            r#"
            SELECT scope, identifier, count, updated_at
            FROM concurrency_counters
            ORDER BY scope, identifier
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(counters)
    }

    #[tracing::instrument(skip(self))]
    async fn start_task_tree(
        &self,
        task_tree_id: &str,
        user_id: &str,
        is_llm_consuming: bool,
    ) -> Result<TaskTreeTracking> {
        insert_tracking(&self.pool, task_tree_id, user_id, is_llm_consuming).await
    }

    #[tracing::instrument(skip(self))]
    async fn complete_task_tree(&self, task_tree_id: &str) -> Result<Option<TaskTreeCompletion>> {
        // The outer SELECT reads the snapshot taken before the UPDATE, so the second
        // branch only returns rows the UPDATE skipped because they were already closed.
        let sql = format!(
            r#"
            WITH closed AS (
                UPDATE task_tree_tracking
                SET completed_at = NOW()
                WHERE task_tree_id = $1 AND completed_at IS NULL
                RETURNING {cols}
            )
            SELECT {cols}, TRUE AS transitioned FROM closed
            UNION ALL
            SELECT {cols}, FALSE AS transitioned FROM task_tree_tracking
            WHERE task_tree_id = $1 AND NOT EXISTS (SELECT 1 FROM closed)
            "#,
            cols = TRACKING_COLUMNS
        );

        let row: Option<PgRow> = sqlx::query(&sql)
            .bind(task_tree_id)
            .fetch_optional(&self.pool)
            .await?;

        let completion = row
            .map(|row| -> Result<TaskTreeCompletion> {
                Ok(TaskTreeCompletion {
                    record: TaskTreeTracking::from_row(&row)?,
                    transitioned: row.try_get("transitioned")?,
                })
            })
            .transpose()?;

        match completion {
            // A concurrent completion committed after this statement's snapshot was
            // taken: the skipped row still reads as open, so fetch it again.
            Some(completion)
                if !completion.transitioned && completion.record.completed_at.is_none() =>
            {
                let record = self.get_task_tree(task_tree_id).await?;
                Ok(Some(TaskTreeCompletion {
                    record: record.unwrap_or(completion.record),
                    transitioned: false,
                }))
            }
            other => Ok(other),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn get_task_tree(&self, task_tree_id: &str) -> Result<Option<TaskTreeTracking>> {
        let sql = format!(
            "SELECT {} FROM task_tree_tracking WHERE task_tree_id = $1",
            TRACKING_COLUMNS
        );
        let tracking = sqlx::query_as::<Postgres, TaskTreeTracking>(&sql)
            .bind(task_tree_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(tracking)
    }

    #[tracing::instrument(skip(self))]
    async fn list_active_task_trees(&self, user_id: Option<&str>) -> Result<Vec<TaskTreeTracking>> {
        let sql = format!(
            r#"
            SELECT {} FROM task_tree_tracking
            WHERE completed_at IS NULL AND ($1::VARCHAR IS NULL OR user_id = $1)
            ORDER BY started_at, task_tree_id
            "#,
            TRACKING_COLUMNS
        );
        let trees = sqlx::query_as::<Postgres, TaskTreeTracking>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(trees)
    }

    #[tracing::instrument(skip(self, request), fields(user_id = %request.user_id, task_tree_id = %request.task_tree_id))]
    async fn admit_task_tree(&self, request: &TaskTreeAdmissionRequest) -> Result<AtomicAdmission> {
        let mut tx = self.pool.begin().await?;

        // Fixed lock order: global, user concurrency, total quota, llm quota.
        let global_active =
            lock_concurrency(&mut *tx, ConcurrencyScope::System, GLOBAL_IDENTIFIER).await?;
        let user_active =
            lock_concurrency(&mut *tx, ConcurrencyScope::User, &request.user_id).await?;
        let total_used =
            lock_quota(&mut *tx, &request.user_id, request.date, CounterType::Total).await?;
        let llm_used = if request.is_llm_consuming {
            lock_quota(&mut *tx, &request.user_id, request.date, CounterType::Llm).await?
        } else {
            read_quota(&mut *tx, &request.user_id, request.date, CounterType::Llm).await?
        };

        let verdict = evaluate_tree_admission(
            request,
            total_used,
            llm_used,
            global_active,
            user_active,
        );

        let (result, runs_as_llm, degraded) = match verdict {
            TreeAdmissionVerdict::Deny { result } => {
                tx.rollback().await?;
                tracing::debug!(reason = %result.reason, "Task tree admission denied");
                return Ok(AtomicAdmission::Denied { result });
            }
            TreeAdmissionVerdict::Start { result } => (result, request.is_llm_consuming, false),
            TreeAdmissionVerdict::Degrade { result } => (result, false, true),
        };

        let tracking = insert_tracking(
            &mut *tx,
            &request.task_tree_id,
            &request.user_id,
            runs_as_llm,
        )
        .await?;

        add_quota(&mut *tx, &request.user_id, request.date, CounterType::Total, 1).await?;
        if runs_as_llm {
            add_quota(&mut *tx, &request.user_id, request.date, CounterType::Llm, 1).await?;
        }
        add_concurrency(&mut *tx, ConcurrencyScope::System, GLOBAL_IDENTIFIER, 1).await?;
        add_concurrency(&mut *tx, ConcurrencyScope::User, &request.user_id, 1).await?;

        tx.commit().await?;

        tracing::debug!(degraded, "Task tree admitted and tracked");

        Ok(if degraded {
            AtomicAdmission::Degraded { tracking, result }
        } else {
            AtomicAdmission::Started { tracking, result }
        })
    }

    #[tracing::instrument(skip(self))]
    async fn increment_usage_stat(
        &self,
        date: NaiveDate,
        stat_type: UsageStatType,
        identifier: &str,
        amount: i64,
    ) -> Result<i64> {
        ensure_non_negative(amount)?;
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO usage_stats (stat_date, stat_type, identifier, count)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (stat_date, stat_type, identifier)
            DO UPDATE SET count = usage_stats.count + EXCLUDED.count, updated_at = NOW()
            RETURNING count
            "#,
        )
        .bind(date)
        .bind(stat_type.as_str())
        .bind(identifier)
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    #[tracing::instrument(skip(self))]
    async fn get_usage_stat(
        &self,
        date: NaiveDate,
        stat_type: UsageStatType,
        identifier: &str,
    ) -> Result<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT count FROM usage_stats
            WHERE stat_date = $1 AND stat_type = $2 AND identifier = $3
            "#,
        )
        .bind(date)
        .bind(stat_type.as_str())
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        Ok(count.unwrap_or(0))
    }

    #[tracing::instrument(skip(self))]
    async fn cleanup_older_than(&self, today: NaiveDate, days_to_keep: i64) -> Result<u64> {
        let cutoff = retention_cutoff(today, days_to_keep)?;
        let cutoff_instant = cutoff.and_time(NaiveTime::MIN).and_utc();
        let mut tx = self.pool.begin().await?;

        let counters = sqlx::query("DELETE FROM quota_counters WHERE quota_date < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let stats = sqlx::query("DELETE FROM usage_stats WHERE stat_date < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let trees = sqlx::query(
            r#"
            DELETE FROM task_tree_tracking
            WHERE completed_at IS NOT NULL AND completed_at < $1
            "#,
        )
        .bind(cutoff_instant)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        tracing::info!(
            cutoff = %cutoff,
            quota_counters = counters,
            usage_stats = stats,
            task_trees = trees,
            "Deleted expired quota data"
        );

        Ok(counters + stats + trees)
    }

    #[tracing::instrument(skip(self))]
    async fn reconcile_concurrency(&self) -> Result<Vec<CounterDrift>> {
        let mut tx = self.pool.begin().await?;

        // Same first lock as admission, so no admission interleaves with the rewrite.
        lock_concurrency(&mut *tx, ConcurrencyScope::System, GLOBAL_IDENTIFIER).await?;

        let rows = sqlx::query(
            r#"
            SELECT scope, identifier, count FROM concurrency_counters
            ORDER BY scope, identifier
            FOR UPDATE
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut counters: Vec<(ConcurrencyScope, String, i64)> = Vec::with_capacity(rows.len());
        for row in rows {
            let scope: String = row.try_get("scope")?;
            let scope = scope
                .parse::<ConcurrencyScope>()
                .map_err(|e| QuotaGateError::InvalidInput(e.to_string()))?;
            counters.push((scope, row.try_get("identifier")?, row.try_get("count")?));
        }

        let active: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) FROM task_tree_tracking
            WHERE completed_at IS NULL
            GROUP BY user_id
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;
        let active_by_user: HashMap<String, i64> = active.into_iter().collect();

        let drifts = concurrency_drift(&counters, &active_by_user);
        for drift in &drifts {
            sqlx::query(
                r#"
                INSERT INTO concurrency_counters (scope, identifier, count)
                VALUES ($1, $2, $3)
                ON CONFLICT (scope, identifier)
                DO UPDATE SET count = EXCLUDED.count, updated_at = NOW()
                "#,
            )
            .bind(drift.scope.as_str())
            .bind(&drift.identifier)
            .bind(drift.actual)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        if !drifts.is_empty() {
            tracing::warn!(corrected = drifts.len(), "Concurrency counters drifted from tracking");
        }

        Ok(drifts)
    }
}
