//! Quota days are UTC calendar dates; quotas reset at the next UTC midnight.

use chrono::{DateTime, Days, Duration, NaiveDate, Utc};
use std::sync::Mutex;

use crate::error::{QuotaGateError, Result};

/// Source of the current time, injectable so day boundaries can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// The quota day for "now".
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Start of the next UTC day, when daily quotas reset.
pub fn next_reset(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    tomorrow
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

/// First day that survives a retention pass keeping `days_to_keep` days.
///
/// Negative windows and windows reaching past the representable calendar are
/// rejected as `InvalidInput`.
pub fn retention_cutoff(today: NaiveDate, days_to_keep: i64) -> Result<NaiveDate> {
    let days = u64::try_from(days_to_keep).map_err(|_| {
        QuotaGateError::InvalidInput(format!(
            "days_to_keep must not be negative, got {}",
            days_to_keep
        ))
    })?;
    today.checked_sub_days(Days::new(days)).ok_or_else(|| {
        QuotaGateError::InvalidInput(format!(
            "days_to_keep {} reaches before the earliest representable date",
            days_to_keep
        ))
    })
}
