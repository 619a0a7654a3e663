//! Device connection state machine.
//!
//! | from \ event   | DataReceived | ReportedOnline | ReportedOffline | ConfigPushed | HeartbeatTimeout |
//! |----------------|--------------|----------------|-----------------|--------------|------------------|
//! | Connected      | -            | -              | Disconnected    | Configuring  | Disconnected     |
//! | Disconnected   | Connected    | Connected      | -               | -            | -                |
//! | Configuring    | Connected    | Connected      | Disconnected    | -            | Disconnected     |
//!
//! `-` is a no-op: nothing is written and no status log is produced.

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info};

use crate::{db::models::DeviceStatus, store::Stores};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    DataReceived,
    ReportedOnline,
    ReportedOffline,
    ConfigPushed,
    HeartbeatTimeout,
}

impl DeviceEvent {
    pub fn reason(&self) -> &'static str {
        match self {
            DeviceEvent::DataReceived => "telemetry received",
            DeviceEvent::ReportedOnline => "device reported online",
            DeviceEvent::ReportedOffline => "device reported offline",
            DeviceEvent::ConfigPushed => "configuration pushed",
            DeviceEvent::HeartbeatTimeout => "heartbeat timeout",
        }
    }
}

/// Next status for `event`, or `None` when the event does not change state.
pub fn next_status(current: DeviceStatus, event: DeviceEvent) -> Option<DeviceStatus> {
    use DeviceEvent::*;
    use DeviceStatus::*;

    match (current, event) {
        (Connected, ReportedOffline | HeartbeatTimeout) => Some(Disconnected),
        (Connected, ConfigPushed) => Some(Configuring),
        (Disconnected, DataReceived | ReportedOnline) => Some(Connected),
        (Configuring, DataReceived | ReportedOnline) => Some(Connected),
        (Configuring, ReportedOffline | HeartbeatTimeout) => Some(Disconnected),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: DeviceStatus,
    pub to: DeviceStatus,
}

impl Transition {
    /// The device just came back from being unreachable.
    pub fn came_online(&self) -> bool {
        self.from == DeviceStatus::Disconnected && self.to == DeviceStatus::Connected
    }
}

/// Compare-and-set attempts before giving up on a contended device record.
const MAX_CAS_ATTEMPTS: usize = 3;

/// Apply `event` to the stored status of `device_id` and log the change.
///
/// Returns `None` for unknown devices, no-op events, or when concurrent
/// writers kept moving the status underneath us.
pub async fn apply_event(
    stores: &Stores,
    device_id: &str,
    event: DeviceEvent,
    details: Value,
) -> Result<Option<Transition>> {
    for _ in 0..MAX_CAS_ATTEMPTS {
        let Some(device) = stores.devices.get(device_id).await? else {
            return Ok(None);
        };
        let Some(next) = next_status(device.status, event) else {
            return Ok(None);
        };

        if stores
            .devices
            .compare_and_set_status(device_id, device.status, next)
            .await?
        {
            stores
                .status_logs
                .append(device_id, next, event.reason(), details)
                .await?;
            info!(
                device_id = %device_id,
                from = %device.status,
                to = %next,
                reason = event.reason(),
                "Device status changed"
            );
            return Ok(Some(Transition { from: device.status, to: next }));
        }
        debug!(device_id = %device_id, "Device status changed concurrently; retrying");
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::{memory::fixtures, MemoryStore, StatusLogStore};

    #[test]
    fn data_brings_disconnected_device_online() {
        assert_eq!(
            next_status(DeviceStatus::Disconnected, DeviceEvent::DataReceived),
            Some(DeviceStatus::Connected)
        );
    }

    #[test]
    fn repeated_online_is_a_no_op() {
        assert_eq!(next_status(DeviceStatus::Connected, DeviceEvent::DataReceived), None);
        assert_eq!(next_status(DeviceStatus::Connected, DeviceEvent::ReportedOnline), None);
        assert_eq!(
            next_status(DeviceStatus::Disconnected, DeviceEvent::ReportedOffline),
            None
        );
    }

    #[test]
    fn config_push_only_from_connected() {
        assert_eq!(
            next_status(DeviceStatus::Connected, DeviceEvent::ConfigPushed),
            Some(DeviceStatus::Configuring)
        );
        assert_eq!(next_status(DeviceStatus::Disconnected, DeviceEvent::ConfigPushed), None);
        assert_eq!(
            next_status(DeviceStatus::Configuring, DeviceEvent::DataReceived),
            Some(DeviceStatus::Connected)
        );
    }

    #[tokio::test]
    async fn apply_event_logs_only_real_transitions() {
        let mem = MemoryStore::new();
        mem.insert_device(fixtures::device("dev1")).await;
        let stores = Stores::memory(mem.clone());

        let t = apply_event(&stores, "dev1", DeviceEvent::DataReceived, json!({}))
            .await
            .unwrap()
            .unwrap();
        assert!(t.came_online());

        let again = apply_event(&stores, "dev1", DeviceEvent::DataReceived, json!({}))
            .await
            .unwrap();
        assert!(again.is_none());

        let logs = mem.recent("dev1", 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, DeviceStatus::Connected);
        assert_eq!(logs[0].reason, "telemetry received");
    }

    #[tokio::test]
    async fn unknown_device_is_ignored() {
        let stores = Stores::memory(MemoryStore::new());
        let t = apply_event(&stores, "ghost", DeviceEvent::ReportedOnline, json!({}))
            .await
            .unwrap();
        assert!(t.is_none());
    }
}
