use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Identifier of the single system-wide concurrency counter.
pub const GLOBAL_IDENTIFIER: &str = "global";

/// Kind of daily quota counter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CounterType {
    /// Every admitted task tree.
    Total,
    /// Admitted task trees classified as LLM-consuming.
    Llm,
    /// Recorded requests, used by the per-user and per-IP request limits.
    Request,
}

impl CounterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterType::Total => "total",
            CounterType::Llm => "llm",
            CounterType::Request => "request",
        }
    }
}

impl Display for CounterType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for CounterType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "total" => Ok(CounterType::Total),
            "llm" => Ok(CounterType::Llm),
            "request" => Ok(CounterType::Request),
            _ => Err(anyhow::anyhow!("Invalid counter type: {}", s)),
        }
    }
}

/// Scope of a concurrency counter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyScope {
    /// The system-wide counter, identified by [`GLOBAL_IDENTIFIER`].
    System,
    /// A per-user counter, identified by the user id.
    User,
}

impl ConcurrencyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConcurrencyScope::System => "system",
            ConcurrencyScope::User => "user",
        }
    }
}

impl Display for ConcurrencyScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConcurrencyScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(ConcurrencyScope::System),
            "user" => Ok(ConcurrencyScope::User),
            _ => Err(anyhow::anyhow!("Invalid concurrency scope: {}", s)),
        }
    }
}

/// Quota counter key used for a client IP address.
pub fn ip_counter_key(ip_address: &str) -> String {
    format!("ip:{}", ip_address)
}

/// Daily usage ledger row: how many task trees of a kind a user started on a UTC day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaCounter {
    pub user_id: String,
    pub date: NaiveDate,
    pub counter_type: CounterType,
    pub count: i64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for QuotaCounter {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let counter_type: String = row.try_get("counter_type")?;
        Ok(QuotaCounter {
            user_id: row.try_get("user_id")?,
            date: row.try_get("quota_date")?,
            counter_type: counter_type
                .parse()
                .map_err(|e: anyhow::Error| sqlx::Error::Decode(e.into()))?,
            count: row.try_get("count")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Gauge of currently active task trees for one scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConcurrencyCounter {
    pub scope: ConcurrencyScope,
    pub identifier: String,
    pub count: i64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for ConcurrencyCounter {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let scope: String = row.try_get("scope")?;
        Ok(ConcurrencyCounter {
            scope: scope
                .parse()
                .map_err(|e: anyhow::Error| sqlx::Error::Decode(e.into()))?,
            identifier: row.try_get("identifier")?,
            count: row.try_get("count")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// A concurrency counter whose stored value disagreed with the open tracking rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterDrift {
    pub scope: ConcurrencyScope,
    pub identifier: String,
    pub recorded: i64,
    pub actual: i64,
}
