use serde::{Deserialize, Serialize};

use crate::db::models::DeviceConfig;

// ---------------------------------------------------------------------------
// Topics
//
// All topics hang off a configurable prefix (default `energy`):
//
//   {prefix}/data              telemetry samples        (inbound)
//   {prefix}/status            connectivity and relay   (inbound)
//   {prefix}/logs              device log lines         (inbound)
//   {prefix}/control/{device}  command envelopes        (outbound)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

/// Which handler an inbound topic belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Data,
    Status,
    Logs,
    /// Echo of a command on a device control channel.
    Control { device_id: String },
}

impl Topics {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_owned(),
        }
    }

    pub fn data(&self) -> String {
        format!("{}/data", self.prefix)
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.prefix)
    }

    pub fn logs(&self) -> String {
        format!("{}/logs", self.prefix)
    }

    pub fn control(&self, device_id: &str) -> String {
        format!("{}/control/{}", self.prefix, device_id)
    }

    /// Every filter subscribed on (re)connect.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            self.data(),
            self.status(),
            self.logs(),
            format!("{}/control/+", self.prefix),
        ]
    }

    pub fn route(&self, topic: &str) -> Option<Route> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        match rest {
            "data" => Some(Route::Data),
            "status" => Some(Route::Status),
            "logs" => Some(Route::Logs),
            other => {
                let device_id = other.strip_prefix("control/")?;
                (!device_id.is_empty() && !device_id.contains('/')).then(|| Route::Control {
                    device_id: device_id.to_owned(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A publish received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Command envelope published on a device control topic.
///
/// Serialises to one of:
/// - `{"set_relay": true}`
/// - `{"update_config": {"power_limit": .., "current_limit": .., "warning_threshold_percent": ..}}`
/// - `{"sync_time": "2024-05-01 00:00:00", "timestamp": 1714496400, "timezone": "UTC+07:00"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceCommand {
    SetRelay {
        set_relay: bool,
    },
    UpdateConfig {
        update_config: DeviceConfig,
    },
    SyncTime {
        sync_time: String,
        timestamp: i64,
        timezone: String,
    },
}

impl DeviceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::SetRelay { .. } => "set_relay",
            DeviceCommand::UpdateConfig { .. } => "update_config",
            DeviceCommand::SyncTime { .. } => "sync_time",
        }
    }
}
