use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// Kind of daily usage statistic. Reporting only, never consulted for admission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatType {
    /// All executed task trees, identifier `global`.
    Total,
    /// Task trees served with demo output, identifier `global`.
    Demo,
    /// Task trees per user, identifier is the user id.
    User,
}

impl UsageStatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageStatType::Total => "total",
            UsageStatType::Demo => "demo",
            UsageStatType::User => "user",
        }
    }
}

impl Display for UsageStatType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageStatType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "total" => Ok(UsageStatType::Total),
            "demo" => Ok(UsageStatType::Demo),
            "user" => Ok(UsageStatType::User),
            _ => Err(anyhow::anyhow!("Invalid usage stat type: {}", s)),
        }
    }
}

/// Daily usage summary returned by the usage tracker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageReport {
    pub date: NaiveDate,
    pub total_tasks: i64,
    pub demo_tasks: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_tasks: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub database_unavailable: bool,
}

impl UsageReport {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            total_tasks: 0,
            demo_tasks: 0,
            user_tasks: None,
            database_unavailable: false,
        }
    }
}
