use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use super::device_state::{self, DeviceEvent, Transition};
use crate::{
    db::models::{Device, NewReading, ObservedValues, Reading},
    ingest::messages::TelemetrySample,
    reading_cache::ReadingCache,
    store::Stores,
};

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Result of recording one sample.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub reading: Reading,
    /// Device record as it was before this sample was applied.
    pub device: Device,
    pub transition: Option<Transition>,
    previous_energy: Option<f64>,
}

impl RecordOutcome {
    /// Cumulative counter this sample replaced, if any.
    pub fn previous_energy(&self) -> Option<f64> {
        self.previous_energy
    }
}

/// Turns validated samples into persisted readings and device state updates.
///
/// Samples of the same device are recorded one at a time, whether they come
/// from the broker or the HTTP API, so reading times and counter baselines
/// advance in the same order.
#[derive(Clone)]
pub struct TelemetryRecorder {
    stores: Stores,
    cache: ReadingCache,
    device_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl TelemetryRecorder {
    pub fn new(stores: Stores, cache: ReadingCache) -> Self {
        Self {
            stores,
            cache,
            device_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn cache(&self) -> &ReadingCache {
        &self.cache
    }

    fn device_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        self.device_locks
            .entry(device_id.to_owned())
            .or_default()
            .clone()
    }

    /// Append a reading stamped with the gateway clock, then update the
    /// device's last contact, last observed values and connection status.
    pub async fn record(&self, sample: TelemetrySample) -> Result<RecordOutcome, RecordError> {
        let device = self
            .stores
            .devices
            .get(&sample.device_id)
            .await?
            .ok_or_else(|| RecordError::UnknownDevice(sample.device_id.clone()))?;

        let lock = self.device_lock(&device.device_id);
        let _guard = lock.lock().await;

        // Re-read under the lock so the disconnected fallback sees the
        // counter left by the previous sample.
        let device = self
            .stores
            .devices
            .get(&device.device_id)
            .await?
            .ok_or_else(|| RecordError::UnknownDevice(device.device_id.clone()))?;

        let reading_time = Utc::now();
        let new = to_new_reading(sample, &device, reading_time);
        let reading = self.stores.readings.append(new).await?;

        let previous_energy = self
            .stores
            .devices
            .swap_last_energy(&reading.device_id, reading.energy)
            .await?;
        let observed = ObservedValues {
            voltage: reading.voltage,
            current: reading.current,
            power: reading.power,
        };
        self.stores
            .devices
            .record_contact(&reading.device_id, reading_time, Some(observed))
            .await?;

        let transition = device_state::apply_event(
            &self.stores,
            &reading.device_id,
            DeviceEvent::DataReceived,
            json!({ "power_connected": reading.power_connected }),
        )
        .await?;

        self.cache.update(reading.clone()).await;
        debug!(
            device_id = %reading.device_id,
            power = reading.power,
            energy = reading.energy,
            "Reading recorded"
        );

        Ok(RecordOutcome {
            reading,
            device,
            transition,
            previous_energy,
        })
    }
}

/// Disconnected samples keep only the energy counter, falling back to the
/// last value the device reported.
fn to_new_reading(
    sample: TelemetrySample,
    device: &Device,
    reading_time: chrono::DateTime<Utc>,
) -> NewReading {
    let energy = sample
        .energy
        .or(device.last_energy)
        .unwrap_or_default();

    if !sample.power_connected {
        return NewReading {
            device_id: sample.device_id,
            reading_time,
            voltage: 0.0,
            current: 0.0,
            power: 0.0,
            energy,
            frequency: None,
            power_factor: None,
            power_connected: false,
        };
    }

    NewReading {
        device_id: sample.device_id,
        reading_time,
        voltage: sample.voltage,
        current: sample.current,
        power: sample.power,
        energy,
        frequency: sample.frequency,
        power_factor: sample.power_factor,
        power_connected: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::models::DeviceStatus,
        store::{memory::fixtures, DeviceRegistry, MemoryStore},
    };

    fn sample(device_id: &str, connected: bool) -> TelemetrySample {
        TelemetrySample {
            device_id: device_id.into(),
            power_connected: connected,
            voltage: 230.0,
            current: 2.0,
            power: 460.0,
            energy: Some(3.5),
            frequency: Some(50.0),
            power_factor: Some(0.95),
        }
    }

    async fn recorder() -> (TelemetryRecorder, MemoryStore) {
        let mem = MemoryStore::new();
        mem.insert_device(fixtures::device("dev1")).await;
        let recorder = TelemetryRecorder::new(Stores::memory(mem.clone()), ReadingCache::new());
        (recorder, mem)
    }

    #[tokio::test]
    async fn record_appends_reading_and_updates_device() {
        let (recorder, mem) = recorder().await;
        let before = Utc::now();

        let outcome = recorder.record(sample("dev1", true)).await.unwrap();

        assert_eq!(outcome.reading.power, 460.0);
        assert!(outcome.reading.reading_time >= before);
        assert_eq!(outcome.reading.apparent_power(), 460.0);
        assert!(outcome.transition.unwrap().came_online());
        assert_eq!(outcome.previous_energy(), None);

        let device = DeviceRegistry::get(&mem, "dev1").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Connected);
        assert_eq!(device.last_connection, Some(outcome.reading.reading_time));
        assert_eq!(device.last_energy, Some(3.5));
        assert_eq!(recorder.cache().get("dev1").await.unwrap().id, outcome.reading.id);
    }

    #[tokio::test]
    async fn disconnected_reading_is_zeroed_and_keeps_last_energy() {
        let (recorder, mem) = recorder().await;
        recorder.record(sample("dev1", true)).await.unwrap();

        let mut off = sample("dev1", false);
        off.energy = None;
        let outcome = recorder.record(off).await.unwrap();

        let r = &outcome.reading;
        assert!(!r.power_connected);
        assert_eq!((r.voltage, r.current, r.power), (0.0, 0.0, 0.0));
        assert_eq!(r.frequency, None);
        assert_eq!(r.power_factor, None);
        assert_eq!(r.energy, 3.5);
        assert_eq!(outcome.previous_energy(), Some(3.5));
        assert_eq!(mem.readings_of("dev1").await.len(), 2);
    }

    #[tokio::test]
    async fn unknown_device_writes_nothing() {
        let (recorder, mem) = recorder().await;
        let err = recorder.record(sample("ghost", true)).await.unwrap_err();
        assert!(matches!(err, RecordError::UnknownDevice(id) if id == "ghost"));
        assert!(mem.readings_of("ghost").await.is_empty());
    }
}
