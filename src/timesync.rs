//! Daily device clock synchronisation.
//!
//! At startup and at every local midnight a `sync_time` command is sent to the
//! reference device. Ten seconds later its latest reading is compared with the
//! gateway clock and a warning is raised when they are more than five minutes
//! apart. Devices coming back online get an immediate resync.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Utc};
use tokio::{task::JoinHandle, time};
use tracing::{error, info, warn};

use crate::{
    alerts::AlertSink,
    db::models::{Alert, AlertDraft},
    mqtt::{models::DeviceCommand, CommandPublisher, MqttError},
    retry::{retry, RetryError, RetryPolicy},
    store::Stores,
    usage::next_local_midnight,
};

/// Wait between publishing `sync_time` and checking the device's clock.
pub const VERIFY_DELAY: Duration = Duration::from_secs(10);

/// Largest tolerated gap between the device's latest reading and now, in seconds.
pub const MAX_DRIFT_SECS: i64 = 5 * 60;

const SYNC_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone)]
pub struct TimeSyncScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    publisher: Arc<dyn CommandPublisher>,
    stores: Stores,
    alerts: AlertSink,
    offset: FixedOffset,
    reference_device: String,
    /// Set while a midnight timer is armed.
    sync_scheduled: AtomicBool,
}

impl TimeSyncScheduler {
    pub fn new(
        publisher: Arc<dyn CommandPublisher>,
        stores: Stores,
        alerts: AlertSink,
        offset: FixedOffset,
        reference_device: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                publisher,
                stores,
                alerts,
                offset,
                reference_device: reference_device.into(),
                sync_scheduled: AtomicBool::new(false),
            }),
        }
    }

    pub fn reference_device(&self) -> &str {
        &self.inner.reference_device
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.sync_scheduled.load(Ordering::Acquire)
    }

    /// Sync the reference device now, then keep it synced every midnight.
    pub fn start(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            this.run_sync(&this.inner.reference_device).await;
            this.arm();
        })
    }

    /// Arm the midnight timer. Returns `false` when one is already pending.
    pub fn arm(&self) -> bool {
        if self
            .inner
            .sync_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let now = Utc::now();
            let next = next_local_midnight(now, this.inner.offset);
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(next_sync = %next, delay_secs = delay.as_secs(), "Time sync scheduled");

            time::sleep(delay).await;
            this.inner.sync_scheduled.store(false, Ordering::Release);
            this.run_sync(&this.inner.reference_device).await;
            this.arm();
        });
        true
    }

    /// Resync `device_id` in the background, e.g. after it came back online.
    pub fn resync(&self, device_id: &str) -> JoinHandle<()> {
        let this = self.clone();
        let device_id = device_id.to_owned();
        tokio::spawn(async move { this.run_sync(&device_id).await })
    }

    /// Publish, wait, verify. Failures are logged.
    pub async fn run_sync(&self, device_id: &str) {
        if let Err(e) = self.send_sync(device_id).await {
            error!(device_id = %device_id, error = %e, "Time sync command failed");
            return;
        }
        time::sleep(VERIFY_DELAY).await;
        if let Err(e) = self.verify(device_id).await {
            error!(device_id = %device_id, error = %e, "Time sync verification failed");
        }
    }

    pub async fn send_sync(&self, device_id: &str) -> Result<(), RetryError<MqttError>> {
        let command = sync_command(Utc::now(), self.inner.offset);
        retry(&RetryPolicy::COMMAND, |_| {
            self.inner.publisher.send_command(device_id, &command)
        })
        .await?;
        info!(device_id = %device_id, "Time sync sent");
        Ok(())
    }

    /// Raise a drift warning when the latest reading is older than [`MAX_DRIFT_SECS`].
    pub async fn verify(&self, device_id: &str) -> Result<Option<Alert>> {
        let Some(latest) = self.inner.stores.readings.latest(device_id).await? else {
            warn!(device_id = %device_id, "No readings to verify time sync against");
            return Ok(None);
        };

        let drift = Utc::now() - latest.reading_time;
        if drift.num_seconds().abs() <= MAX_DRIFT_SECS {
            info!(device_id = %device_id, drift_secs = drift.num_seconds(), "Device clock in sync");
            return Ok(None);
        }

        warn!(device_id = %device_id, drift_secs = drift.num_seconds(), "Device clock drift detected");
        let draft = AlertDraft::warning(format!(
            "Clock drift of {} minutes detected after time sync",
            drift.num_minutes()
        ));
        let mut alerts = self.inner.alerts.raise(device_id, vec![draft]).await?;
        Ok(alerts.pop())
    }
}

/// The `sync_time` envelope for `now` in the fixed local zone.
pub fn sync_command(now: DateTime<Utc>, offset: FixedOffset) -> DeviceCommand {
    let local = now.with_timezone(&offset);
    DeviceCommand::SyncTime {
        sync_time: local.format(SYNC_TIME_FORMAT).to_string(),
        timestamp: now.timestamp(),
        timezone: format!("UTC{}", local.format("%:z")),
    }
}
