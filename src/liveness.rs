//! Marks connected devices that stopped talking as disconnected.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tokio::time;
use tracing::{error, info};

use crate::{
    store::Stores,
    telemetry::device_state::{self, DeviceEvent},
};

pub struct LivenessMonitor {
    stores: Stores,
    offline_after: Duration,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(stores: Stores, offline_after: Duration, interval: Duration) -> Self {
        Self { stores, offline_after, interval }
    }

    /// Runs the sweep indefinitely.
    /// Spawn this via `tokio::spawn`.
    pub async fn run(self) {
        info!(
            interval_secs = self.interval.as_secs(),
            offline_after_secs = self.offline_after.as_secs(),
            "Liveness monitor started"
        );
        let mut ticker = time::interval(self.interval);

        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                error!(error = %e, "Liveness sweep failed");
            }
        }
    }

    /// Apply a heartbeat timeout to every stale connected device. Returns the
    /// number of devices that went offline.
    pub async fn sweep(&self) -> Result<usize> {
        let offline_after = chrono::Duration::from_std(self.offline_after)?;
        let cutoff = Utc::now() - offline_after;
        let stale = self.stores.devices.stale_connected(cutoff).await?;

        let mut marked = 0;
        for device in stale {
            let details = json!({
                "last_connection": device.last_connection,
                "offline_after_secs": self.offline_after.as_secs(),
            });
            if device_state::apply_event(
                &self.stores,
                &device.device_id,
                DeviceEvent::HeartbeatTimeout,
                details,
            )
            .await?
            .is_some()
            {
                marked += 1;
            }
        }
        Ok(marked)
    }
}
