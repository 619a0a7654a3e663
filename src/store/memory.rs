use std::{collections::HashMap, sync::Arc};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AlertStore, DeviceRegistry, ReadingStore, StatusLogStore, UsageStore};
use crate::db::models::{
    Alert, AlertDraft, Device, DeviceConfig, DeviceSettings, DeviceStatus, DeviceStatusLog,
    NewReading, ObservedValues, Period, Reading, UsageStatistics,
};

type UsageKey = (String, Period, DateTime<Utc>);

#[derive(Default)]
struct Inner {
    readings: Vec<Reading>,
    devices: HashMap<String, Device>,
    settings: HashMap<String, DeviceSettings>,
    alerts: Vec<Alert>,
    usage: HashMap<UsageKey, UsageStatistics>,
    status_logs: Vec<DeviceStatusLog>,
}

/// In-process store with the same semantics as [`super::PgStore`].
///
/// Cheap to clone; every clone shares the same data. Each trait method takes
/// the write lock once, so increments and compare-and-set are atomic.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device, replacing any previous record with the same id.
    pub async fn insert_device(&self, device: Device) {
        self.inner
            .write()
            .await
            .devices
            .insert(device.device_id.clone(), device);
    }

    pub async fn insert_settings(&self, settings: DeviceSettings) {
        self.inner
            .write()
            .await
            .settings
            .insert(settings.device_id.clone(), settings);
    }

    /// Every reading of a device in insertion order.
    pub async fn readings_of(&self, device_id: &str) -> Vec<Reading> {
        self.inner
            .read()
            .await
            .readings
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect()
    }

    /// Every alert of a device in creation order, resolved ones included.
    pub async fn alerts_of(&self, device_id: &str) -> Vec<Alert> {
        self.inner
            .read()
            .await
            .alerts
            .iter()
            .filter(|a| a.device_id == device_id)
            .cloned()
            .collect()
    }

    pub async fn usage_rows(&self, device_id: &str, period: Period) -> Vec<UsageStatistics> {
        let mut rows: Vec<_> = self
            .inner
            .read()
            .await
            .usage
            .values()
            .filter(|u| u.device_id == device_id && u.period == period)
            .cloned()
            .collect();
        rows.sort_by_key(|u| u.period_start);
        rows
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn append(&self, r: NewReading) -> Result<Reading> {
        let mut inner = self.inner.write().await;
        if !inner.devices.contains_key(&r.device_id) {
            bail!("reading references unknown device {}", r.device_id);
        }
        let reading = Reading {
            id: Uuid::new_v4(),
            device_id: r.device_id,
            reading_time: r.reading_time,
            voltage: r.voltage,
            current: r.current,
            power: r.power,
            energy: r.energy,
            frequency: r.frequency,
            power_factor: r.power_factor,
            power_connected: r.power_connected,
        };
        inner.readings.push(reading.clone());
        Ok(reading)
    }

    async fn latest(&self, device_id: &str) -> Result<Option<Reading>> {
        Ok(self
            .inner
            .read()
            .await
            .readings
            .iter()
            .filter(|r| r.device_id == device_id)
            .max_by_key(|r| r.reading_time)
            .cloned())
    }

    async fn latest_before(&self, device_id: &str, before: DateTime<Utc>) -> Result<Option<Reading>> {
        Ok(self
            .inner
            .read()
            .await
            .readings
            .iter()
            .filter(|r| r.device_id == device_id && r.reading_time < before)
            .max_by_key(|r| r.reading_time)
            .cloned())
    }

    async fn range(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        let mut rows: Vec<_> = self
            .inner
            .read()
            .await
            .readings
            .iter()
            .filter(|r| r.device_id == device_id && r.reading_time >= from && r.reading_time <= to)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.reading_time);
        Ok(rows)
    }
}

#[async_trait]
impl DeviceRegistry for MemoryStore {
    async fn get(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.inner.read().await.devices.get(device_id).cloned())
    }

    async fn settings(&self, device_id: &str) -> Result<Option<DeviceSettings>> {
        Ok(self.inner.read().await.settings.get(device_id).cloned())
    }

    async fn record_contact(
        &self,
        device_id: &str,
        at: DateTime<Utc>,
        observed: Option<ObservedValues>,
    ) -> Result<()> {
        if let Some(device) = self.inner.write().await.devices.get_mut(device_id) {
            device.last_connection = Some(at);
            if let Some(v) = observed {
                device.last_voltage = Some(v.voltage);
                device.last_current = Some(v.current);
                device.last_power = Some(v.power);
            }
        }
        Ok(())
    }

    async fn swap_last_energy(&self, device_id: &str, energy: f64) -> Result<Option<f64>> {
        Ok(self
            .inner
            .write()
            .await
            .devices
            .get_mut(device_id)
            .and_then(|device| device.last_energy.replace(energy)))
    }

    async fn compare_and_set_status(
        &self,
        device_id: &str,
        expected: DeviceStatus,
        next: DeviceStatus,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.devices.get_mut(device_id) {
            Some(device) if device.status == expected => {
                device.status = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_relay_state(&self, device_id: &str, state: bool) -> Result<()> {
        if let Some(device) = self.inner.write().await.devices.get_mut(device_id) {
            device.relay_state = state;
        }
        Ok(())
    }

    async fn set_config(&self, device_id: &str, config: DeviceConfig) -> Result<()> {
        if let Some(device) = self.inner.write().await.devices.get_mut(device_id) {
            device.power_limit = config.power_limit;
            device.current_limit = config.current_limit;
            device.warning_threshold_percent = config.warning_threshold_percent;
        }
        Ok(())
    }

    async fn stale_connected(&self, before: DateTime<Utc>) -> Result<Vec<Device>> {
        Ok(self
            .inner
            .read()
            .await
            .devices
            .values()
            .filter(|d| {
                d.status == DeviceStatus::Connected
                    && d.last_connection.map_or(true, |at| at < before)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn create(&self, device_id: &str, draft: AlertDraft) -> Result<Alert> {
        let alert = Alert {
            id: Uuid::new_v4(),
            device_id: device_id.to_owned(),
            alert_type: draft.alert_type,
            message: draft.message,
            is_active: true,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.inner.write().await.alerts.push(alert.clone());
        Ok(alert)
    }

    async fn active(&self, device_id: &str) -> Result<Vec<Alert>> {
        let mut alerts: Vec<_> = self
            .inner
            .read()
            .await
            .alerts
            .iter()
            .filter(|a| a.device_id == device_id && a.is_active)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(alerts)
    }

    async fn resolve(&self, device_id: &str, id: Uuid) -> Result<Option<Alert>> {
        let mut inner = self.inner.write().await;
        let found = inner
            .alerts
            .iter_mut()
            .find(|a| a.id == id && a.device_id == device_id);
        Ok(found.map(|alert| {
            alert.is_active = false;
            alert.resolved_at.get_or_insert_with(Utc::now);
            alert.clone()
        }))
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn increment(
        &self,
        device_id: &str,
        period: Period,
        period_start: DateTime<Utc>,
        kwh: f64,
        cost: f64,
    ) -> Result<UsageStatistics> {
        let mut inner = self.inner.write().await;
        let row = inner
            .usage
            .entry((device_id.to_owned(), period, period_start))
            .or_insert_with(|| UsageStatistics {
                device_id: device_id.to_owned(),
                period,
                period_start,
                total_kwh: 0.0,
                total_cost: 0.0,
                updated_at: Utc::now(),
            });
        row.total_kwh += kwh;
        row.total_cost += cost;
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn history(
        &self,
        device_id: &str,
        period: Period,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageStatistics>> {
        let mut rows: Vec<_> = self
            .inner
            .read()
            .await
            .usage
            .values()
            .filter(|u| u.device_id == device_id && u.period == period && u.period_start >= since)
            .cloned()
            .collect();
        rows.sort_by_key(|u| u.period_start);
        Ok(rows)
    }
}

#[async_trait]
impl StatusLogStore for MemoryStore {
    async fn append(
        &self,
        device_id: &str,
        status: DeviceStatus,
        reason: &str,
        details: serde_json::Value,
    ) -> Result<DeviceStatusLog> {
        let log = DeviceStatusLog {
            id: Uuid::new_v4(),
            device_id: device_id.to_owned(),
            timestamp: Utc::now(),
            status,
            reason: reason.to_owned(),
            details,
        };
        self.inner.write().await.status_logs.push(log.clone());
        Ok(log)
    }

    async fn recent(&self, device_id: &str, limit: i64) -> Result<Vec<DeviceStatusLog>> {
        Ok(self
            .inner
            .read()
            .await
            .status_logs
            .iter()
            .rev()
            .filter(|l| l.device_id == device_id)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub(crate) fn device(device_id: &str) -> Device {
        Device {
            device_id: device_id.to_owned(),
            owner_id: Uuid::nil(),
            status: DeviceStatus::Disconnected,
            relay_state: false,
            last_connection: None,
            power_limit: 1000.0,
            current_limit: 10.0,
            warning_threshold_percent: 80.0,
            last_voltage: None,
            last_current: None,
            last_power: None,
            last_energy: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn increment_upserts_a_single_row_per_key() {
        let store = MemoryStore::new();
        let start = Utc::now();
        store.increment("dev1", Period::Daily, start, 1.5, 10.0).await.unwrap();
        let row = store.increment("dev1", Period::Daily, start, 2.0, 5.0).await.unwrap();

        assert_eq!(row.total_kwh, 3.5);
        assert_eq!(row.total_cost, 15.0);
        assert_eq!(store.usage_rows("dev1", Period::Daily).await.len(), 1);
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_expectation() {
        let store = MemoryStore::new();
        store.insert_device(fixtures::device("dev1")).await;

        assert!(store
            .compare_and_set_status("dev1", DeviceStatus::Disconnected, DeviceStatus::Connected)
            .await
            .unwrap());
        assert!(!store
            .compare_and_set_status("dev1", DeviceStatus::Disconnected, DeviceStatus::Configuring)
            .await
            .unwrap());
        assert_eq!(
            store.get("dev1").await.unwrap().unwrap().status,
            DeviceStatus::Connected
        );
    }

    #[tokio::test]
    async fn append_rejects_unknown_device() {
        let store = MemoryStore::new();
        let err = ReadingStore::append(
            &store,
            NewReading {
                device_id: "ghost".into(),
                reading_time: Utc::now(),
                voltage: 0.0,
                current: 0.0,
                power: 0.0,
                energy: 0.0,
                frequency: None,
                power_factor: None,
                power_connected: false,
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("unknown device"));
    }

    #[tokio::test]
    async fn resolve_marks_alert_inactive() {
        let store = MemoryStore::new();
        let alert = store
            .create("dev1", AlertDraft::warning("voltage high"))
            .await
            .unwrap();

        assert!(store.resolve("dev2", alert.id).await.unwrap().is_none());
        let resolved = store.resolve("dev1", alert.id).await.unwrap().unwrap();
        assert!(!resolved.is_active);
        assert!(resolved.resolved_at.is_some());
        assert!(store.active("dev1").await.unwrap().is_empty());

        let again = store.resolve("dev1", alert.id).await.unwrap().unwrap();
        assert_eq!(again.resolved_at, resolved.resolved_at);
    }

    #[tokio::test]
    async fn swap_last_energy_hands_out_each_baseline_once() {
        let store = MemoryStore::new();
        store.insert_device(fixtures::device("dev1")).await;

        assert_eq!(store.swap_last_energy("dev1", 1.5).await.unwrap(), None);
        assert_eq!(store.swap_last_energy("dev1", 2.0).await.unwrap(), Some(1.5));
        assert_eq!(store.swap_last_energy("ghost", 2.0).await.unwrap(), None);
        let device = DeviceRegistry::get(&store, "dev1").await.unwrap().unwrap();
        assert_eq!(device.last_energy, Some(2.0));
    }
}
