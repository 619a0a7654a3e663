use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

use crate::db::models::Reading;

/// In-memory store of the most recent `Reading` per device.
///
/// Wrapped in `Arc` so it can be cheaply cloned and shared across tasks.
/// Uses `tokio::sync::RwLock` so concurrent readers never block each other.
#[derive(Clone, Default)]
pub struct ReadingCache {
    inner: Arc<RwLock<HashMap<String, Reading>>>,
}

impl ReadingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the cached reading for `reading.device_id`, unless the cache
    /// already holds a newer one.
    pub async fn update(&self, reading: Reading) {
        let mut inner = self.inner.write().await;
        match inner.get(&reading.device_id) {
            Some(existing) if existing.reading_time > reading.reading_time => {}
            _ => {
                inner.insert(reading.device_id.clone(), reading);
            }
        }
    }

    /// Return the latest reading for a specific device, if present.
    pub async fn get(&self, device_id: &str) -> Option<Reading> {
        self.inner.read().await.get(device_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::*;

    fn make_reading(device_id: &str, power: f64, age_secs: i64) -> Reading {
        Reading {
            id: Uuid::new_v4(),
            device_id: device_id.to_owned(),
            reading_time: Utc::now() - Duration::seconds(age_secs),
            voltage: 220.0,
            current: power / 220.0,
            power,
            energy: 1.0,
            frequency: Some(50.0),
            power_factor: Some(0.95),
            power_connected: true,
        }
    }

    #[tokio::test]
    async fn empty_cache_returns_nothing() {
        let cache = ReadingCache::new();
        assert!(cache.get("dev1").await.is_none());
    }

    #[tokio::test]
    async fn update_overwrites_previous_reading() {
        let cache = ReadingCache::new();
        cache.update(make_reading("dev1", 100.0, 10)).await;
        cache.update(make_reading("dev1", 250.0, 0)).await;

        assert_eq!(cache.get("dev1").await.unwrap().power, 250.0);
        assert!(cache.get("dev2").await.is_none());
    }

    #[tokio::test]
    async fn older_reading_does_not_replace_newer() {
        let cache = ReadingCache::new();
        cache.update(make_reading("dev1", 250.0, 0)).await;
        cache.update(make_reading("dev1", 100.0, 30)).await;

        assert_eq!(cache.get("dev1").await.unwrap().power, 250.0);
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let cache = ReadingCache::new();
        let clone = cache.clone();

        cache.update(make_reading("dev2", 42.0, 0)).await;

        assert_eq!(clone.get("dev2").await.unwrap().power, 42.0);
    }
}
