use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

/// One telemetry sample as persisted.
///
/// When `power_connected` is false the electrical fields are stored as zero
/// (`voltage`, `current`, `power`) or null (`frequency`, `power_factor`);
/// `energy` carries the last known cumulative counter.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct Reading {
    pub id: Uuid,
    pub device_id: String,
    /// Gateway clock at ingestion time.
    pub reading_time: DateTime<Utc>,
    /// Volts
    pub voltage: f64,
    /// Amperes
    pub current: f64,
    /// Watts
    pub power: f64,
    /// Cumulative kWh counter reported by the meter.
    pub energy: f64,
    /// Hertz
    pub frequency: Option<f64>,
    pub power_factor: Option<f64>,
    pub power_connected: bool,
}

impl Reading {
    /// Volt-amperes, derived as `voltage × current`.
    pub fn apparent_power(&self) -> f64 {
        self.voltage * self.current
    }
}

/// A reading about to be appended. The store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub device_id: String,
    pub reading_time: DateTime<Utc>,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub energy: f64,
    pub frequency: Option<f64>,
    pub power_factor: Option<f64>,
    pub power_connected: bool,
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

/// Mirrors the `device_status` Postgres enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "device_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Connected,
    Disconnected,
    Configuring,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Connected => "connected",
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Configuring => "configuring",
        };
        f.write_str(s)
    }
}

/// Limits pushed to the device with `update_config`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeviceConfig {
    /// Watts
    pub power_limit: f64,
    /// Amperes
    pub current_limit: f64,
    pub warning_threshold_percent: f64,
}

/// Last electrical values observed from a device, stored alongside its state
/// record. The energy counter is written separately through
/// [`crate::store::DeviceRegistry::swap_last_energy`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ObservedValues {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct Device {
    pub device_id: String,
    pub owner_id: Uuid,
    pub status: DeviceStatus,
    pub relay_state: bool,
    pub last_connection: Option<DateTime<Utc>>,
    pub power_limit: f64,
    pub current_limit: f64,
    pub warning_threshold_percent: f64,
    pub last_voltage: Option<f64>,
    pub last_current: Option<f64>,
    pub last_power: Option<f64>,
    pub last_energy: Option<f64>,
}

impl Device {
    pub fn config(&self) -> DeviceConfig {
        DeviceConfig {
            power_limit: self.power_limit,
            current_limit: self.current_limit,
            warning_threshold_percent: self.warning_threshold_percent,
        }
    }
}

/// Tariff class. Mirrors the `service_type` Postgres enum.
///
/// Named after the household connection class and its contracted capacity
/// in volt-amperes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "service_type")]
pub enum ServiceType {
    #[sqlx(rename = "r1_450")]
    #[serde(rename = "r1_450")]
    R1Va450,
    #[sqlx(rename = "r1_900")]
    #[serde(rename = "r1_900")]
    R1Va900,
    #[sqlx(rename = "r1_1300")]
    #[serde(rename = "r1_1300")]
    R1Va1300,
    #[sqlx(rename = "r1_2200")]
    #[serde(rename = "r1_2200")]
    R1Va2200,
    #[sqlx(rename = "r2_3500")]
    #[serde(rename = "r2_3500")]
    R2Va3500,
    #[sqlx(rename = "r3_6600")]
    #[serde(rename = "r3_6600")]
    R3Va6600,
}

impl Default for ServiceType {
    fn default() -> Self {
        Self::R1Va1300
    }
}

/// Billing parameters, one-to-one with a device.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct DeviceSettings {
    pub device_id: String,
    pub service_type: ServiceType,
    /// Watts
    pub power_limit: f64,
    /// Percentage of `power_limit` above which a warning is raised.
    pub warning_percentage: f64,
    /// Percentage applied on top of the base energy cost.
    pub tax_rate: f64,
}

impl DeviceSettings {
    /// Settings derived from the device's own config when no billing row exists.
    pub fn fallback_for(device: &Device) -> Self {
        Self {
            device_id: device.device_id.clone(),
            service_type: ServiceType::default(),
            power_limit: device.power_limit,
            warning_percentage: device.warning_threshold_percent,
            tax_rate: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Mirrors the `alert_type` Postgres enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "alert_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct Alert {
    pub id: Uuid,
    pub device_id: String,
    pub alert_type: AlertType,
    pub message: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// An alert not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertDraft {
    pub alert_type: AlertType,
    pub message: String,
}

impl AlertDraft {
    pub fn warning(message: impl Into<String>) -> Self {
        Self { alert_type: AlertType::Warning, message: message.into() }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self { alert_type: AlertType::Critical, message: message.into() }
    }
}

// ---------------------------------------------------------------------------
// Usage statistics
// ---------------------------------------------------------------------------

/// Aggregation granularity. Mirrors the `usage_period` Postgres enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "usage_period", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Daily,
    Weekly,
    Monthly,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Daily, Period::Weekly, Period::Monthly];
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Period::Daily => "daily",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct UsageStatistics {
    pub device_id: String,
    pub period: Period,
    pub period_start: DateTime<Utc>,
    /// kWh
    pub total_kwh: f64,
    pub total_cost: f64,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Status log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize, ToSchema)]
pub struct DeviceStatusLog {
    pub id: Uuid,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: DeviceStatus,
    pub reason: String,
    #[schema(value_type = Object)]
    pub details: serde_json::Value,
}
