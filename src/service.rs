//! The service object the dashboard and CRUD layers call into.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    analytics::{prediction::Prediction, AnalyticsEngine, EnergyAnalysis, PredictionOptions},
    control::{ControlError, ControlService},
    db::models::{
        Alert, Device, DeviceConfig, DeviceSettings, DeviceStatusLog, Period, Reading,
        UsageStatistics,
    },
    ingest::{messages::DataMessage, IngestError, TelemetryPipeline},
    store::Stores,
    usage::period_start,
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),

    #[error("user {user_id} does not own device {device_id}")]
    Forbidden { device_id: String, user_id: Uuid },

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Control(ControlError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<ControlError> for ServiceError {
    fn from(e: ControlError) -> Self {
        match e {
            ControlError::InvalidConfig(msg) => ServiceError::Validation(msg),
            ControlError::Store(e) => ServiceError::Store(e),
            e @ ControlError::Command(_) => ServiceError::Control(e),
        }
    }
}

impl From<IngestError> for ServiceError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Validation(e) => ServiceError::Validation(e.to_string()),
            IngestError::UnknownDevice(id) => ServiceError::NotFound(format!("device {id} not found")),
            IngestError::Store(e) => ServiceError::Store(e),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

pub const DEFAULT_STATUS_HISTORY: u32 = 50;
pub const MAX_STATUS_HISTORY: u32 = 500;

/// Window of usage history to return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    /// Today's daily row.
    Day,
    /// Daily rows for the last 7 days.
    #[default]
    Week,
    /// Daily rows for the last 30 days.
    Month,
    /// Monthly rows for the last 12 months.
    Year,
}

impl TimeRange {
    /// Granularity and earliest `period_start` to include.
    pub fn window(self, now: DateTime<Utc>, offset: FixedOffset) -> (Period, DateTime<Utc>) {
        let today = period_start(Period::Daily, now, offset);
        match self {
            TimeRange::Day => (Period::Daily, today),
            TimeRange::Week => (Period::Daily, today - Duration::days(6)),
            TimeRange::Month => (Period::Daily, today - Duration::days(29)),
            TimeRange::Year => (
                Period::Monthly,
                period_start(Period::Monthly, now - Duration::days(334), offset),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct UsageHistory {
    pub device_id: String,
    pub range: TimeRange,
    pub period: Period,
    pub since: DateTime<Utc>,
    pub total_kwh: f64,
    pub total_cost: f64,
    pub rows: Vec<UsageStatistics>,
}

#[derive(Clone)]
pub struct EnergyService {
    stores: Stores,
    pipeline: TelemetryPipeline,
    control: ControlService,
    analytics: AnalyticsEngine,
    offset: FixedOffset,
}

impl EnergyService {
    pub fn new(
        stores: Stores,
        pipeline: TelemetryPipeline,
        control: ControlService,
        analytics: AnalyticsEngine,
        offset: FixedOffset,
    ) -> Self {
        Self { stores, pipeline, control, analytics, offset }
    }

    /// Ingest one sample object or an array of them for `device_id`.
    ///
    /// The path's device id wins; a body naming a different device is
    /// rejected. The whole batch is validated before anything is written.
    pub async fn record_reading(&self, device_id: &str, readings: Value) -> ServiceResult<Vec<Reading>> {
        self.device(device_id).await?;

        let items = match readings {
            Value::Array(items) => items,
            other => vec![other],
        };
        if items.is_empty() {
            return Err(ServiceError::Validation("no readings supplied".into()));
        }

        let mut samples = Vec::with_capacity(items.len());
        for mut item in items {
            let Some(obj) = item.as_object_mut() else {
                return Err(ServiceError::Validation("each reading must be a JSON object".into()));
            };
            match obj.get("deviceId").and_then(Value::as_str) {
                Some(id) if id != device_id => {
                    return Err(ServiceError::Validation(format!(
                        "reading names device {id} but was posted for {device_id}"
                    )));
                }
                _ => {
                    obj.insert("deviceId".into(), Value::String(device_id.to_owned()));
                }
            }
            match crate::ingest::messages::parse_data(&item).map_err(IngestError::from)? {
                DataMessage::Telemetry(sample) => samples.push(sample),
                DataMessage::ManualToggle(_) => {
                    return Err(ServiceError::Validation(
                        "relay toggles are reported on the status topic, not as readings".into(),
                    ));
                }
            }
        }

        let mut recorded = Vec::with_capacity(samples.len());
        for sample in samples {
            recorded.push(self.pipeline.ingest_sample(sample).await?.reading);
        }
        Ok(recorded)
    }

    /// Latest reading, served from the in-memory cache when possible.
    pub async fn latest_reading(&self, device_id: &str) -> ServiceResult<Reading> {
        self.device(device_id).await?;
        if let Some(reading) = self.pipeline.recorder().cache().get(device_id).await {
            return Ok(reading);
        }
        self.stores
            .readings
            .latest(device_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("no readings for device {device_id}")))
    }

    pub async fn usage_history(&self, device_id: &str, range: TimeRange) -> ServiceResult<UsageHistory> {
        self.device(device_id).await?;
        let (period, since) = range.window(Utc::now(), self.offset);
        let rows = self.stores.usage.history(device_id, period, since).await?;

        Ok(UsageHistory {
            device_id: device_id.to_owned(),
            range,
            period,
            since,
            total_kwh: rows.iter().map(|r| r.total_kwh).sum(),
            total_cost: rows.iter().map(|r| r.total_cost).sum(),
            rows,
        })
    }

    pub async fn predict_energy_consumption(
        &self,
        device_id: &str,
        options: PredictionOptions,
    ) -> ServiceResult<Prediction> {
        let device = self.device(device_id).await?;
        let settings = self.settings(&device).await?;
        Ok(self.analytics.predict(&settings, options, Utc::now()).await?)
    }

    pub async fn analyze(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> ServiceResult<EnergyAnalysis> {
        if from >= to {
            return Err(ServiceError::Validation("`from` must be before `to`".into()));
        }
        let device = self.device(device_id).await?;
        let settings = self.settings(&device).await?;
        Ok(self.analytics.analyze(&settings, from, to).await?)
    }

    /// Switch the relay on behalf of the device owner. Returns the updated
    /// device record.
    pub async fn control_relay(&self, device_id: &str, user_id: Uuid, state: bool) -> ServiceResult<Device> {
        self.check_device_ownership(device_id, user_id).await?;
        self.control.set_relay(device_id, state).await?;
        self.device(device_id).await
    }

    pub async fn update_config(
        &self,
        device_id: &str,
        user_id: Uuid,
        config: DeviceConfig,
    ) -> ServiceResult<Device> {
        self.check_device_ownership(device_id, user_id).await?;
        self.control.update_config(device_id, config).await?;
        self.device(device_id).await
    }

    /// Active alerts of a device, newest first.
    pub async fn list_active_alerts(&self, device_id: &str) -> ServiceResult<Vec<Alert>> {
        self.device(device_id).await?;
        Ok(self.stores.alerts.active(device_id).await?)
    }

    /// Acknowledge an alert on behalf of the device owner.
    pub async fn resolve_alert(
        &self,
        device_id: &str,
        user_id: Uuid,
        alert_id: Uuid,
    ) -> ServiceResult<Alert> {
        self.check_device_ownership(device_id, user_id).await?;
        self.stores
            .alerts
            .resolve(device_id, alert_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("alert {alert_id} not found on device {device_id}")))
    }

    /// Most recent status transitions, newest first. `limit` is clamped to
    /// `1..=MAX_STATUS_HISTORY`.
    pub async fn status_history(
        &self,
        device_id: &str,
        limit: u32,
    ) -> ServiceResult<Vec<DeviceStatusLog>> {
        self.device(device_id).await?;
        let limit = limit.clamp(1, MAX_STATUS_HISTORY);
        Ok(self.stores.status_logs.recent(device_id, i64::from(limit)).await?)
    }

    /// The device, if `user_id` owns it.
    pub async fn check_device_ownership(&self, device_id: &str, user_id: Uuid) -> ServiceResult<Device> {
        let device = self.device(device_id).await?;
        if device.owner_id != user_id {
            return Err(ServiceError::Forbidden { device_id: device_id.to_owned(), user_id });
        }
        Ok(device)
    }

    async fn device(&self, device_id: &str) -> ServiceResult<Device> {
        self.stores
            .devices
            .get(device_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("device {device_id} not found")))
    }

    async fn settings(&self, device: &Device) -> ServiceResult<DeviceSettings> {
        Ok(self
            .stores
            .devices
            .settings(&device.device_id)
            .await?
            .unwrap_or_else(|| DeviceSettings::fallback_for(device)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{
        alerts::{AlertSink, LogNotifier},
        mqtt::{models::DeviceCommand, CommandPublisher, MqttError},
        reading_cache::ReadingCache,
        store::{memory::fixtures, MemoryStore},
        telemetry::TelemetryRecorder,
        usage::UsageAggregator,
    };

    struct Offline;

    #[async_trait]
    impl CommandPublisher for Offline {
        async fn send_command(&self, _: &str, _: &DeviceCommand) -> Result<(), MqttError> {
            Err(MqttError::NotConnected)
        }
    }

    fn owner() -> Uuid {
        Uuid::from_u128(7)
    }

    async fn service() -> (EnergyService, MemoryStore) {
        let mem = MemoryStore::new();
        let mut device = fixtures::device("SN001");
        device.owner_id = owner();
        mem.insert_device(device).await;

        let stores = Stores::memory(mem.clone());
        let offset = FixedOffset::east_opt(7 * 3600).unwrap();
        let pipeline = TelemetryPipeline::new(
            stores.clone(),
            TelemetryRecorder::new(stores.clone(), ReadingCache::new()),
            AlertSink::new(stores.alerts.clone(), Arc::new(LogNotifier)),
            UsageAggregator::new(stores.usage.clone(), offset),
        );
        let control = ControlService::new(Arc::new(Offline), stores.clone());
        let analytics = AnalyticsEngine::new(stores.readings.clone(), offset);
        (EnergyService::new(stores, pipeline, control, analytics, offset), mem)
    }

    fn sample(energy: f64) -> Value {
        json!({ "power_connected": true, "voltage": 220, "current": 1, "power": 220, "energy": energy })
    }

    #[tokio::test]
    async fn record_then_read_latest() {
        let (svc, _) = service().await;

        let recorded = svc.record_reading("SN001", json!([sample(1.0), sample(1.2)])).await.unwrap();
        assert_eq!(recorded.len(), 2);

        let latest = svc.latest_reading("SN001").await.unwrap();
        assert_eq!(latest.id, recorded[1].id);

        let usage = svc.usage_history("SN001", TimeRange::Day).await.unwrap();
        assert_eq!(usage.rows.len(), 1);
        assert!((usage.total_kwh - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn invalid_batch_writes_nothing() {
        let (svc, mem) = service().await;
        let bad = json!({ "power_connected": true, "voltage": 220 });

        let err = svc.record_reading("SN001", json!([sample(1.0), bad])).await.unwrap_err();

        assert!(matches!(err, ServiceError::Validation(msg) if msg.contains("current")));
        assert!(mem.readings_of("SN001").await.is_empty());
    }

    #[tokio::test]
    async fn mismatched_device_id_is_rejected() {
        let (svc, _) = service().await;
        let mut body = sample(1.0);
        body["deviceId"] = json!("SN999");
        let err = svc.record_reading("SN001", body).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_device_and_missing_readings_are_not_found() {
        let (svc, _) = service().await;
        assert!(matches!(svc.latest_reading("ghost").await, Err(ServiceError::NotFound(_))));
        assert!(matches!(svc.latest_reading("SN001").await, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn ownership_is_enforced() {
        let (svc, _) = service().await;
        assert!(svc.check_device_ownership("SN001", owner()).await.is_ok());
        let err = svc.check_device_ownership("SN001", Uuid::from_u128(8)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden { .. }));
        let err = svc.control_relay("SN001", Uuid::from_u128(8), true).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn relay_failure_surfaces_transport_error() {
        let (svc, mem) = service().await;
        let err = svc.control_relay("SN001", owner(), true).await.unwrap_err();
        assert!(matches!(err, ServiceError::Control(_)));
        assert!(err.to_string().contains("not connected"));
        let device = crate::store::DeviceRegistry::get(&mem, "SN001").await.unwrap().unwrap();
        assert!(!device.relay_state);
    }

    #[tokio::test]
    async fn alerts_can_be_listed_and_resolved_by_owner() {
        let (svc, mem) = service().await;
        let mut overload = sample(1.0);
        overload["power"] = json!(990);
        overload["current"] = json!(4.5);
        svc.record_reading("SN001", overload).await.unwrap();

        let active = svc.list_active_alerts("SN001").await.unwrap();
        assert_eq!(active.len(), 1);
        let alert_id = active[0].id;

        let err = svc.resolve_alert("SN001", Uuid::from_u128(8), alert_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden { .. }));
        let err = svc.resolve_alert("SN001", owner(), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let resolved = svc.resolve_alert("SN001", owner(), alert_id).await.unwrap();
        assert!(!resolved.is_active);
        assert!(svc.list_active_alerts("SN001").await.unwrap().is_empty());
        assert_eq!(mem.alerts_of("SN001").await.len(), 1);
    }

    #[tokio::test]
    async fn status_history_lists_transitions_newest_first() {
        let (svc, _) = service().await;
        svc.record_reading("SN001", sample(1.0)).await.unwrap();

        let history = svc.status_history("SN001", DEFAULT_STATUS_HISTORY).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, crate::db::models::DeviceStatus::Connected);

        assert_eq!(svc.status_history("SN001", 0).await.unwrap().len(), 1);
        assert!(matches!(
            svc.status_history("ghost", 10).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn analysis_window_must_be_ordered() {
        let (svc, _) = service().await;
        let now = Utc::now();
        let err = svc.analyze("SN001", now, now).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn week_window_spans_seven_local_days() {
        let offset = FixedOffset::east_opt(7 * 3600).unwrap();
        let now = DateTime::parse_from_rfc3339("2024-05-10T03:00:00Z").unwrap().with_timezone(&Utc);
        let (period, since) = TimeRange::Week.window(now, offset);
        assert_eq!(period, Period::Daily);
        assert_eq!(since, DateTime::parse_from_rfc3339("2024-05-03T17:00:00Z").unwrap().with_timezone(&Utc));
    }
}
