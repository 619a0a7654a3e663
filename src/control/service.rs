use std::{sync::Arc, time::Duration};

use serde_json::json;
use tokio::time;
use tracing::{error, info};

use crate::{
    db::models::DeviceConfig,
    mqtt::{models::DeviceCommand, CommandPublisher, MqttError},
    retry::{retry, RetryError, RetryPolicy},
    store::Stores,
    telemetry::device_state::{self, DeviceEvent},
};

/// Pause after a successful relay publish so the device can act on it.
const RELAY_ACK_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("command delivery failed: {0}")]
    Command(#[from] RetryError<MqttError>),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Issues outbound device commands and records their effect only after the
/// broker accepted them.
#[derive(Clone)]
pub struct ControlService {
    publisher: Arc<dyn CommandPublisher>,
    stores: Stores,
}

impl ControlService {
    pub fn new(publisher: Arc<dyn CommandPublisher>, stores: Stores) -> Self {
        Self { publisher, stores }
    }

    /// Switch the relay. `relay_state` is written only once the publish has
    /// succeeded and the acknowledgement grace period has passed.
    pub async fn set_relay(&self, device_id: &str, state: bool) -> Result<(), ControlError> {
        let command = DeviceCommand::SetRelay { set_relay: state };

        if let Err(e) = retry(&RetryPolicy::RELAY, |_| {
            self.publisher.send_command(device_id, &command)
        })
        .await
        {
            error!(device_id = %device_id, state, error = %e, "Relay command failed");
            return Err(e.into());
        }

        time::sleep(RELAY_ACK_GRACE).await;
        self.stores.devices.set_relay_state(device_id, state).await?;
        info!(device_id = %device_id, state, "Relay switched");
        Ok(())
    }

    /// Push new limits to the device. The device enters `configuring` and the
    /// limits are persisted only after the publish succeeded.
    pub async fn update_config(
        &self,
        device_id: &str,
        config: DeviceConfig,
    ) -> Result<(), ControlError> {
        validate_config(&config)?;
        let command = DeviceCommand::UpdateConfig { update_config: config };

        if let Err(e) = retry(&RetryPolicy::COMMAND, |_| {
            self.publisher.send_command(device_id, &command)
        })
        .await
        {
            error!(device_id = %device_id, error = %e, "Config push failed");
            return Err(e.into());
        }

        device_state::apply_event(
            &self.stores,
            device_id,
            DeviceEvent::ConfigPushed,
            json!({ "config": config }),
        )
        .await?;
        self.stores.devices.set_config(device_id, config).await?;
        info!(
            device_id = %device_id,
            power_limit = config.power_limit,
            current_limit = config.current_limit,
            "Device configuration pushed"
        );
        Ok(())
    }
}

fn validate_config(config: &DeviceConfig) -> Result<(), ControlError> {
    if !(config.power_limit > 0.0) {
        return Err(ControlError::InvalidConfig("power_limit must be positive".into()));
    }
    if !(config.current_limit > 0.0) {
        return Err(ControlError::InvalidConfig("current_limit must be positive".into()));
    }
    if !(config.warning_threshold_percent > 0.0 && config.warning_threshold_percent <= 100.0) {
        return Err(ControlError::InvalidConfig(
            "warning_threshold_percent must be within (0, 100]".into(),
        ));
    }
    Ok(())
}
