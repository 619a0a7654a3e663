use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::{
    analytics::prediction::PredictionMethod,
    db::models::{DeviceConfig, Reading},
    service::TimeRange,
};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReadingDto {
    pub id: Uuid,
    pub device_id: String,
    pub reading_time: DateTime<Utc>,
    /// Volts
    pub voltage: f64,
    /// Amperes
    pub current: f64,
    /// Watts
    pub power: f64,
    /// Volt-amperes, `voltage × current`
    pub apparent_power: f64,
    /// Cumulative kWh
    pub energy: f64,
    /// Hertz
    pub frequency: Option<f64>,
    pub power_factor: Option<f64>,
    pub power_connected: bool,
}

impl From<Reading> for ReadingDto {
    fn from(r: Reading) -> Self {
        Self {
            apparent_power: r.apparent_power(),
            id: r.id,
            device_id: r.device_id,
            reading_time: r.reading_time,
            voltage: r.voltage,
            current: r.current,
            power: r.power,
            energy: r.energy,
            frequency: r.frequency,
            power_factor: r.power_factor,
            power_connected: r.power_connected,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RelayRequest {
    /// Caller; must own the device.
    pub user_id: Uuid,
    pub state: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConfigRequest {
    /// Caller; must own the device.
    pub user_id: Uuid,
    pub config: DeviceConfig,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResolveAlertRequest {
    /// Caller; must own the device.
    pub user_id: Uuid,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct StatusHistoryQuery {
    /// Maximum entries to return, newest first. Defaults to 50, at most 500.
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct UsageQuery {
    /// `day`, `week` (default), `month` or `year`
    #[serde(default)]
    pub range: TimeRange,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct AnalyticsQuery {
    /// Start of the window (RFC3339). Defaults to 24 hours before `to`.
    pub from: Option<DateTime<Utc>>,
    /// End of the window (RFC3339). Defaults to now.
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct PredictionQuery {
    /// `simple` (default), `weighted` or `linear`
    #[serde(default)]
    pub method: PredictionMethod,
    /// Days of history to base the forecast on. Defaults to 7.
    pub lookback_days: Option<u32>,
}
