//! Persistence seams for the ingestion pipeline.
//!
//! Three logical stores back the service: readings, devices with their
//! settings, and alerts with usage statistics. Each concern is a trait so the
//! pipeline can run against Postgres in production and against
//! [`MemoryStore`] in tests.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::models::{
    Alert, AlertDraft, Device, DeviceConfig, DeviceSettings, DeviceStatus, DeviceStatusLog,
    NewReading, ObservedValues, Period, Reading, UsageStatistics,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Append-only collection of telemetry samples.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn append(&self, reading: NewReading) -> Result<Reading>;

    async fn latest(&self, device_id: &str) -> Result<Option<Reading>>;

    /// Newest reading with `reading_time < before`.
    async fn latest_before(&self, device_id: &str, before: DateTime<Utc>) -> Result<Option<Reading>>;

    /// Readings with `from <= reading_time <= to`, ordered by `reading_time ASC`.
    async fn range(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>>;
}

/// Single writer of per-device state. Every mutation touches a disjoint set
/// of fields so concurrent writers never clobber each other.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn get(&self, device_id: &str) -> Result<Option<Device>>;

    async fn settings(&self, device_id: &str) -> Result<Option<DeviceSettings>>;

    /// Update `last_connection` and, when given, the last observed values.
    async fn record_contact(
        &self,
        device_id: &str,
        at: DateTime<Utc>,
        observed: Option<ObservedValues>,
    ) -> Result<()>;

    /// Store `energy` as the device's last cumulative counter and return the
    /// value it replaced, in one atomic step. Each counter value is handed
    /// out as a baseline exactly once, so concurrent writers never diff
    /// against the same previous value.
    async fn swap_last_energy(&self, device_id: &str, energy: f64) -> Result<Option<f64>>;

    /// Set `status` to `next` only if it is still `expected`.
    /// Returns `false` when another writer got there first.
    async fn compare_and_set_status(
        &self,
        device_id: &str,
        expected: DeviceStatus,
        next: DeviceStatus,
    ) -> Result<bool>;

    async fn set_relay_state(&self, device_id: &str, state: bool) -> Result<()>;

    async fn set_config(&self, device_id: &str, config: DeviceConfig) -> Result<()>;

    /// Connected devices whose last contact is older than `before`.
    async fn stale_connected(&self, before: DateTime<Utc>) -> Result<Vec<Device>>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn create(&self, device_id: &str, draft: AlertDraft) -> Result<Alert>;

    async fn active(&self, device_id: &str) -> Result<Vec<Alert>>;

    /// Mark an alert of `device_id` resolved. Returns `None` if the device
    /// has no such alert. Resolving twice keeps the first `resolved_at`.
    async fn resolve(&self, device_id: &str, id: Uuid) -> Result<Option<Alert>>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Upsert the `(device_id, period, period_start)` row and add both
    /// amounts in one atomic statement.
    async fn increment(
        &self,
        device_id: &str,
        period: Period,
        period_start: DateTime<Utc>,
        kwh: f64,
        cost: f64,
    ) -> Result<UsageStatistics>;

    /// Rows with `period_start >= since`, ordered by `period_start ASC`.
    async fn history(
        &self,
        device_id: &str,
        period: Period,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageStatistics>>;
}

#[async_trait]
pub trait StatusLogStore: Send + Sync {
    async fn append(
        &self,
        device_id: &str,
        status: DeviceStatus,
        reason: &str,
        details: serde_json::Value,
    ) -> Result<DeviceStatusLog>;

    /// Most recent entries first.
    async fn recent(&self, device_id: &str, limit: i64) -> Result<Vec<DeviceStatusLog>>;
}

/// Cloneable bundle of every store the pipeline writes to.
#[derive(Clone)]
pub struct Stores {
    pub readings: Arc<dyn ReadingStore>,
    pub devices: Arc<dyn DeviceRegistry>,
    pub alerts: Arc<dyn AlertStore>,
    pub usage: Arc<dyn UsageStore>,
    pub status_logs: Arc<dyn StatusLogStore>,
}

impl Stores {
    pub fn postgres(store: PgStore) -> Self {
        Self::from_shared(Arc::new(store))
    }

    pub fn memory(store: MemoryStore) -> Self {
        Self::from_shared(Arc::new(store))
    }

    fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: ReadingStore + DeviceRegistry + AlertStore + UsageStore + StatusLogStore + 'static,
    {
        Self {
            readings: store.clone(),
            devices: store.clone(),
            alerts: store.clone(),
            usage: store.clone(),
            status_logs: store,
        }
    }
}
