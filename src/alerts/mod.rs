//! Threshold alerts raised from readings and device logs.

pub mod notifier;

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::{
    db::models::{Alert, AlertDraft, DeviceSettings, Reading},
    ingest::messages::LogMessage,
    store::AlertStore,
};

pub use notifier::{AlertNotifier, LogNotifier, WebhookNotifier};

/// Comfortable supply band in volts. Readings outside it raise a warning.
pub const VOLTAGE_WARNING_MIN: f64 = 200.0;
pub const VOLTAGE_WARNING_MAX: f64 = 240.0;
/// Hard operating range of the appliances behind the meter.
pub const VOLTAGE_HARD_MIN: f64 = 190.0;
pub const VOLTAGE_HARD_MAX: f64 = 250.0;
/// Load above this share of the power limit is critical.
pub const POWER_CRITICAL_PERCENT: f64 = 95.0;

/// Alerts warranted by a single reading. At most one per category.
///
/// Disconnected readings carry no electrical values and never alert.
pub fn evaluate(reading: &Reading, settings: &DeviceSettings) -> Vec<AlertDraft> {
    if !reading.power_connected {
        return Vec::new();
    }

    let mut drafts = Vec::new();

    let v = reading.voltage;
    if !(VOLTAGE_WARNING_MIN..=VOLTAGE_WARNING_MAX).contains(&v) {
        let message = if (VOLTAGE_HARD_MIN..=VOLTAGE_HARD_MAX).contains(&v) {
            format!(
                "Voltage {v:.1} V outside normal range {VOLTAGE_WARNING_MIN:.0}-{VOLTAGE_WARNING_MAX:.0} V"
            )
        } else {
            format!(
                "Voltage {v:.1} V outside safe operating range {VOLTAGE_HARD_MIN:.0}-{VOLTAGE_HARD_MAX:.0} V"
            )
        };
        drafts.push(AlertDraft::warning(message));
    }

    if settings.power_limit > 0.0 {
        let percent = reading.power / settings.power_limit * 100.0;
        if percent > POWER_CRITICAL_PERCENT {
            drafts.push(AlertDraft::critical(format!(
                "Power usage critical: {:.1} W is {percent:.1}% of the {:.0} W limit",
                reading.power, settings.power_limit
            )));
        } else if percent > settings.warning_percentage {
            drafts.push(AlertDraft::warning(format!(
                "Power usage high: {:.1} W is {percent:.1}% of the {:.0} W limit",
                reading.power, settings.power_limit
            )));
        }
    }

    drafts
}

/// Alert carried by a device log line, if it is flagged.
pub fn from_log(log: &LogMessage) -> Option<AlertDraft> {
    if log.error {
        Some(AlertDraft::critical(format!("Device error: {}", log.message)))
    } else if log.warning {
        Some(AlertDraft::warning(format!("Device warning: {}", log.message)))
    } else {
        None
    }
}

/// Persists alert drafts and hands each stored alert to the notifier.
#[derive(Clone)]
pub struct AlertSink {
    store: Arc<dyn AlertStore>,
    notifier: Arc<dyn AlertNotifier>,
}

impl AlertSink {
    pub fn new(store: Arc<dyn AlertStore>, notifier: Arc<dyn AlertNotifier>) -> Self {
        Self { store, notifier }
    }

    /// Store every draft and return once they are persisted.
    ///
    /// Each notification runs in its own task; a slow or failing receiver
    /// never delays ingestion. Failures are logged, not returned.
    pub async fn raise(&self, device_id: &str, drafts: Vec<AlertDraft>) -> Result<Vec<Alert>> {
        let mut alerts = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let alert = self.store.create(device_id, draft).await?;
            self.notify_in_background(alert.clone());
            alerts.push(alert);
        }
        Ok(alerts)
    }

    fn notify_in_background(&self, alert: Alert) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&alert).await {
                warn!(
                    device_id = %alert.device_id,
                    alert_id = %alert.id,
                    error = %e,
                    "Alert notification failed"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::{
        db::models::{AlertType, ServiceType},
        store::MemoryStore,
    };

    fn settings(power_limit: f64) -> DeviceSettings {
        DeviceSettings {
            device_id: "dev1".into(),
            service_type: ServiceType::R1Va1300,
            power_limit,
            warning_percentage: 80.0,
            tax_rate: 0.0,
        }
    }

    fn reading(voltage: f64, power: f64) -> Reading {
        Reading {
            id: Uuid::new_v4(),
            device_id: "dev1".into(),
            reading_time: Utc::now(),
            voltage,
            current: power / voltage,
            power,
            energy: 1.0,
            frequency: Some(50.0),
            power_factor: Some(0.95),
            power_connected: true,
        }
    }

    fn types(drafts: &[AlertDraft]) -> Vec<AlertType> {
        drafts.iter().map(|d| d.alert_type).collect()
    }

    #[test]
    fn normal_reading_raises_nothing() {
        assert!(evaluate(&reading(220.0, 500.0), &settings(1000.0)).is_empty());
    }

    #[test]
    fn just_above_warning_threshold_is_warning() {
        let drafts = evaluate(&reading(220.0, 800.1), &settings(1000.0));
        assert_eq!(types(&drafts), vec![AlertType::Warning]);
    }

    #[test]
    fn exactly_at_critical_threshold_is_still_warning() {
        let drafts = evaluate(&reading(220.0, 950.0), &settings(1000.0));
        assert_eq!(types(&drafts), vec![AlertType::Warning]);
    }

    #[test]
    fn just_above_critical_threshold_is_critical() {
        let drafts = evaluate(&reading(220.0, 950.1), &settings(1000.0));
        assert_eq!(types(&drafts), vec![AlertType::Critical]);
        assert!(drafts[0].message.contains("95.0%"));
    }

    #[test]
    fn voltage_and_power_alert_independently() {
        let drafts = evaluate(&reading(245.0, 490.0), &settings(500.0));
        assert_eq!(types(&drafts), vec![AlertType::Warning, AlertType::Critical]);
        assert!(drafts[0].message.contains("245.0 V"));
    }

    #[test]
    fn voltage_beyond_hard_range_mentions_it() {
        let drafts = evaluate(&reading(180.0, 100.0), &settings(1000.0));
        assert_eq!(types(&drafts), vec![AlertType::Warning]);
        assert!(drafts[0].message.contains("safe operating range 190-250"));
    }

    #[test]
    fn band_edges_are_inside() {
        assert!(evaluate(&reading(200.0, 10.0), &settings(1000.0)).is_empty());
        assert!(evaluate(&reading(240.0, 10.0), &settings(1000.0)).is_empty());
    }

    #[test]
    fn disconnected_or_unlimited_devices_skip_checks() {
        let mut r = reading(0.0001, 0.0);
        r.power_connected = false;
        assert!(evaluate(&r, &settings(1000.0)).is_empty());
        assert!(evaluate(&reading(220.0, 5000.0), &settings(0.0)).is_empty());
    }

    #[test]
    fn log_flags_map_to_severity() {
        let mut log = LogMessage {
            device_id: "dev1".into(),
            message: "relay stuck".into(),
            error: true,
            warning: true,
        };
        assert_eq!(from_log(&log).unwrap().alert_type, AlertType::Critical);
        log.error = false;
        assert_eq!(from_log(&log).unwrap().alert_type, AlertType::Warning);
        log.warning = false;
        assert!(from_log(&log).is_none());
    }

    struct Failing(mpsc::UnboundedSender<Uuid>);

    #[async_trait]
    impl AlertNotifier for Failing {
        async fn notify(&self, alert: &Alert) -> Result<()> {
            let _ = self.0.send(alert.id);
            anyhow::bail!("receiver down")
        }
    }

    /// Never completes, like a receiver that accepted and went silent.
    struct Stalled;

    #[async_trait]
    impl AlertNotifier for Stalled {
        async fn notify(&self, _: &Alert) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn sink_persists_even_when_notification_fails() {
        let mem = MemoryStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = AlertSink::new(Arc::new(mem.clone()), Arc::new(Failing(tx)));

        let alerts = sink
            .raise("dev1", vec![AlertDraft::warning("a"), AlertDraft::critical("b")])
            .await
            .unwrap();

        assert_eq!(alerts.len(), 2);
        assert_eq!(mem.alerts_of("dev1").await.len(), 2);
        let mut notified = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        notified.sort();
        let mut expected: Vec<Uuid> = alerts.iter().map(|a| a.id).collect();
        expected.sort();
        assert_eq!(notified, expected);
    }

    #[tokio::test]
    async fn stalled_notifier_does_not_block_raise() {
        let mem = MemoryStore::new();
        let sink = AlertSink::new(Arc::new(mem.clone()), Arc::new(Stalled));

        let alerts = tokio::time::timeout(
            Duration::from_secs(1),
            sink.raise("dev1", vec![AlertDraft::critical("overload")]),
        )
        .await
        .expect("raise returned while the notifier hangs")
        .unwrap();

        assert_eq!(alerts.len(), 1);
        assert_eq!(mem.alerts_of("dev1").await.len(), 1);
    }
}
