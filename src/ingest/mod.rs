//! Inbound message handling: deduplicate, validate, route, and run each
//! message through recording, alerting and aggregation.
//!
//! Messages are processed one at a time in arrival order. A failure in one
//! message is logged and contained; the next message is processed normally.

pub mod messages;

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use self::messages::{
    parse_data, parse_json, parse_log, parse_status, sniff_device_id, DataMessage, LogMessage,
    StatusMessage, TelemetrySample, ValidationError,
};
use crate::{
    alerts::{self, AlertSink},
    db::models::{Alert, DeviceSettings, Reading},
    mqtt::models::{InboundMessage, Route, Topics},
    rejects::RejectArchive,
    store::Stores,
    telemetry::{
        device_state::{self, DeviceEvent, Transition},
        RecordError, TelemetryRecorder,
    },
    timesync::TimeSyncScheduler,
    ttl_cache::TtlCache,
    usage::{energy_delta, UsageAggregator},
};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<RecordError> for IngestError {
    fn from(e: RecordError) -> Self {
        match e {
            RecordError::UnknownDevice(id) => IngestError::UnknownDevice(id),
            RecordError::Store(e) => IngestError::Store(e),
        }
    }
}

/// Everything one telemetry sample produced.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub reading: Reading,
    pub alerts: Vec<Alert>,
    pub transition: Option<Transition>,
    /// kWh attributed to the usage counters.
    pub energy_delta: f64,
}

/// Recorder, alert evaluation and usage aggregation chained together.
#[derive(Clone)]
pub struct TelemetryPipeline {
    stores: Stores,
    recorder: TelemetryRecorder,
    alerts: AlertSink,
    usage: UsageAggregator,
    time_sync: Option<TimeSyncScheduler>,
}

impl TelemetryPipeline {
    pub fn new(
        stores: Stores,
        recorder: TelemetryRecorder,
        alerts: AlertSink,
        usage: UsageAggregator,
    ) -> Self {
        Self { stores, recorder, alerts, usage, time_sync: None }
    }

    /// Resync device clocks whenever a device comes back online.
    pub fn with_time_sync(mut self, scheduler: TimeSyncScheduler) -> Self {
        self.time_sync = Some(scheduler);
        self
    }

    pub fn recorder(&self) -> &TelemetryRecorder {
        &self.recorder
    }

    /// Record a validated sample, then alert and aggregate on it.
    ///
    /// Only recording failures are returned. Alert and usage failures are
    /// logged so that at most that single update is lost.
    pub async fn ingest_sample(&self, sample: TelemetrySample) -> Result<IngestOutcome, IngestError> {
        let outcome = self.recorder.record(sample).await?;
        let previous_energy = outcome.previous_energy();
        let reading = outcome.reading;
        let device_id = reading.device_id.as_str();

        let settings = match self.stores.devices.settings(device_id).await {
            Ok(Some(settings)) => settings,
            Ok(None) => DeviceSettings::fallback_for(&outcome.device),
            Err(e) => {
                error!(device_id = %device_id, error = %e, "Failed to load device settings");
                DeviceSettings::fallback_for(&outcome.device)
            }
        };

        let drafts = alerts::evaluate(&reading, &settings);
        let alerts = if drafts.is_empty() {
            Vec::new()
        } else {
            match self.alerts.raise(device_id, drafts).await {
                Ok(alerts) => alerts,
                Err(e) => {
                    error!(device_id = %device_id, error = %e, "Failed to store alerts");
                    Vec::new()
                }
            }
        };

        let delta = energy_delta(previous_energy, reading.energy);
        if let Err(e) = self
            .usage
            .apply(device_id, reading.reading_time, delta, settings.service_type)
            .await
        {
            error!(device_id = %device_id, error = %e, "Failed to update usage statistics");
        }

        if let Some(t) = outcome.transition {
            self.on_transition(device_id, t);
        }

        Ok(IngestOutcome {
            reading,
            alerts,
            transition: outcome.transition,
            energy_delta: delta,
        })
    }

    /// Validate a data payload and ingest it. Manual relay toggles are
    /// handled as status messages and yield `None`.
    pub async fn ingest_value(&self, value: &Value) -> Result<Option<IngestOutcome>, IngestError> {
        match parse_data(value)? {
            DataMessage::Telemetry(sample) => self.ingest_sample(sample).await.map(Some),
            DataMessage::ManualToggle(status) => {
                self.handle_status(status).await?;
                Ok(None)
            }
        }
    }

    /// Apply relay and connectivity updates reported by a device.
    pub async fn handle_status(&self, status: StatusMessage) -> Result<Option<Transition>, IngestError> {
        let device_id = status.device_id.as_str();
        let event = status.event()?.unwrap_or(DeviceEvent::DataReceived);

        if self.stores.devices.get(device_id).await?.is_none() {
            return Err(IngestError::UnknownDevice(device_id.to_owned()));
        }

        if let Some(relay) = status.relay_status {
            self.stores.devices.set_relay_state(device_id, relay).await?;
            info!(
                device_id = %device_id,
                relay,
                manual = status.is_manual_toggle(),
                "Relay state reported"
            );
        }

        let at = Utc::now();
        if event != DeviceEvent::ReportedOffline {
            self.stores.devices.record_contact(device_id, at, None).await?;
        }

        let details = json!({
            "status": status.status,
            "relay_status": status.relay_status,
            "source": status.source,
        });
        let transition = device_state::apply_event(&self.stores, device_id, event, details).await?;
        if let Some(t) = transition {
            self.on_transition(device_id, t);
        }
        Ok(transition)
    }

    /// Turn flagged device log lines into alerts.
    pub async fn handle_log(&self, log: LogMessage) -> Result<Vec<Alert>, IngestError> {
        let device_id = log.device_id.as_str();
        if self.stores.devices.get(device_id).await?.is_none() {
            return Err(IngestError::UnknownDevice(device_id.to_owned()));
        }
        info!(
            device_id = %device_id,
            error = log.error,
            warning = log.warning,
            message = %log.message,
            "Device log"
        );
        self.stores.devices.record_contact(device_id, Utc::now(), None).await?;

        match alerts::from_log(&log) {
            Some(draft) => Ok(self.alerts.raise(device_id, vec![draft]).await?),
            None => Ok(Vec::new()),
        }
    }

    fn on_transition(&self, device_id: &str, transition: Transition) {
        if !transition.came_online() {
            return;
        }
        if let Some(scheduler) = &self.time_sync {
            info!(device_id = %device_id, "Device back online; resyncing clock");
            scheduler.resync(device_id);
        }
    }
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Processed,
    Duplicate,
    Rejected,
    UnknownDevice,
    /// Topic has no handler (e.g. our own command echoes).
    Ignored,
    Failed,
}

type Fingerprint = (String, Vec<u8>);

pub struct MessageDispatcher {
    topics: Topics,
    pipeline: TelemetryPipeline,
    seen: Arc<TtlCache<Fingerprint, ()>>,
    rejects: Option<RejectArchive>,
}

impl MessageDispatcher {
    pub fn new(topics: Topics, pipeline: TelemetryPipeline, seen: Arc<TtlCache<Fingerprint, ()>>) -> Self {
        Self { topics, pipeline, seen, rejects: None }
    }

    pub fn with_reject_archive(mut self, archive: RejectArchive) -> Self {
        self.rejects = Some(archive);
        self
    }

    /// Processes inbound messages until the channel closes.
    /// Spawn this via `tokio::spawn`.
    pub async fn run(self, mut rx: mpsc::Receiver<InboundMessage>) {
        info!("Message dispatcher started");
        while let Some(msg) = rx.recv().await {
            self.dispatch(msg).await;
        }
        info!("Inbound channel closed; message dispatcher stopped");
    }

    /// Handle a single message. Never fails; the outcome is for callers that
    /// care (tests, metrics).
    pub async fn dispatch(&self, msg: InboundMessage) -> Dispatched {
        let Some(route) = self.topics.route(&msg.topic) else {
            debug!(topic = %msg.topic, "No handler for topic");
            return Dispatched::Ignored;
        };
        if let Route::Control { device_id } = &route {
            debug!(device_id = %device_id, "Ignoring command echo");
            return Dispatched::Ignored;
        }

        if !self.seen.insert_if_absent((msg.topic.clone(), msg.payload.clone()), ()) {
            debug!(topic = %msg.topic, "Duplicate message dropped");
            return Dispatched::Duplicate;
        }

        let result = match &route {
            Route::Data => match parse_json(&msg.payload) {
                Ok(value) => self.pipeline.ingest_value(&value).await.map(|_| ()),
                Err(e) => Err(e.into()),
            },
            Route::Status => match parse_status(&msg.payload) {
                Ok(status) => self.pipeline.handle_status(status).await.map(|_| ()),
                Err(e) => Err(e.into()),
            },
            Route::Logs => match parse_log(&msg.payload) {
                Ok(log) => self.pipeline.handle_log(log).await.map(|_| ()),
                Err(e) => Err(e.into()),
            },
            Route::Control { .. } => Ok(()),
        };

        match result {
            Ok(()) => Dispatched::Processed,
            Err(IngestError::Validation(e)) => {
                warn!(
                    topic = %msg.topic,
                    error = %e,
                    payload = %String::from_utf8_lossy(&msg.payload),
                    "Rejected invalid message"
                );
                if let Some(archive) = &self.rejects {
                    let device_id = sniff_device_id(&msg.payload);
                    archive.save(route_kind(&route), device_id.as_deref(), &msg.payload).await;
                }
                Dispatched::Rejected
            }
            Err(IngestError::UnknownDevice(device_id)) => {
                warn!(topic = %msg.topic, device_id = %device_id, "Message from unknown device dropped");
                Dispatched::UnknownDevice
            }
            Err(IngestError::Store(e)) => {
                error!(topic = %msg.topic, error = %e, "Failed to process message");
                Dispatched::Failed
            }
        }
    }
}

fn route_kind(route: &Route) -> &'static str {
    match route {
        Route::Data => "data",
        Route::Status => "status",
        Route::Logs => "logs",
        Route::Control { .. } => "control",
    }
}
