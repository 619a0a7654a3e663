//! Rolling per-period energy and cost counters.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use tracing::debug;

use crate::{
    db::models::{Period, ServiceType, UsageStatistics},
    store::UsageStore,
};

/// Start of the period containing `at`, in the fixed local zone.
///
/// Days start at local midnight, weeks on Monday, months on the 1st.
pub fn period_start(period: Period, at: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let date = at.with_timezone(&offset).date_naive();
    let first = match period {
        Period::Daily => date,
        Period::Weekly => date - Duration::days(date.weekday().num_days_from_monday() as i64),
        Period::Monthly => date.with_day(1).unwrap_or(date),
    };
    local_midnight(first, offset)
}

/// Next local midnight strictly after `at`.
pub fn next_local_midnight(at: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    period_start(Period::Daily, at, offset) + Duration::days(1)
}

fn local_midnight(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN) - Duration::seconds(offset.local_minus_utc() as i64);
    Utc.from_utc_datetime(&naive)
}

/// kWh consumed between two cumulative counter readings.
///
/// A counter that went backwards was reset on the device, so everything it
/// now shows was consumed since the reset. Without a baseline nothing can be
/// attributed.
pub fn energy_delta(previous: Option<f64>, current: f64) -> f64 {
    match previous {
        None => 0.0,
        Some(prev) if current < prev => current,
        Some(prev) => current - prev,
    }
}

/// Adds each reading's consumption to the daily, weekly and monthly rows.
#[derive(Clone)]
pub struct UsageAggregator {
    store: Arc<dyn UsageStore>,
    offset: FixedOffset,
}

impl UsageAggregator {
    pub fn new(store: Arc<dyn UsageStore>, offset: FixedOffset) -> Self {
        Self { store, offset }
    }

    /// Increment the three period rows containing `at` by `kwh` and its cost.
    pub async fn apply(
        &self,
        device_id: &str,
        at: DateTime<Utc>,
        kwh: f64,
        service_type: ServiceType,
    ) -> Result<Vec<UsageStatistics>> {
        let cost = kwh * service_type.rate_per_kwh();
        let mut rows = Vec::with_capacity(Period::ALL.len());
        for period in Period::ALL {
            let start = period_start(period, at, self.offset);
            rows.push(self.store.increment(device_id, period, start, kwh, cost).await?);
        }
        debug!(device_id = %device_id, kwh, cost, "Usage statistics incremented");
        Ok(rows)
    }
}
