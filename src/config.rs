use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use chrono::FixedOffset;

use crate::{db::PoolSettings, mqtt::MqttConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_pool: PoolSettings,
    pub server_host: String,
    pub server_port: u16,
    pub mqtt: MqttConfig,
    /// Fixed local zone used for period boundaries, midnight scheduling and
    /// hour-of-day bucketing.
    pub local_offset: FixedOffset,
    /// Device that receives the daily `sync_time` command. Time sync is
    /// disabled when unset.
    pub time_sync_device_id: Option<String>,
    /// Window within which an identical `(topic, payload)` is a duplicate.
    pub dedup_ttl: Duration,
    pub dedup_max_entries: usize,
    pub dedup_sweep_interval: Duration,
    /// Connected devices silent for longer than this are marked disconnected.
    pub offline_after: Duration,
    pub liveness_interval: Duration,
    pub alert_webhook_url: Option<String>,
    pub alert_webhook_secret: Option<String>,
    /// Upper bound on one webhook delivery, connect included.
    pub alert_webhook_timeout: Duration,
    /// Where rejected payloads are archived. Archiving is off when unset.
    pub rejected_payload_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mqtt = MqttConfig {
            host: required("MQTT_HOST")?,
            port: parsed("MQTT_PORT", "1883")?,
            client_id: optional("MQTT_CLIENT_ID", "home-energy-gateway"),
            credentials: parse_credentials(
                std::env::var("MQTT_USERNAME").ok(),
                std::env::var("MQTT_PASSWORD").ok(),
            )?,
            topic_prefix: optional("MQTT_TOPIC_PREFIX", "energy"),
            keep_alive: secs("MQTT_KEEP_ALIVE_SECS", "30")?,
            connect_timeout: secs("MQTT_CONNECT_TIMEOUT_SECS", "10")?,
            publish_timeout: secs("MQTT_PUBLISH_TIMEOUT_SECS", "5")?,
            reconnect_backoff: secs("MQTT_RECONNECT_BACKOFF_SECS", "5")?,
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            db_pool: PoolSettings {
                max_connections: parsed("DB_MAX_CONNECTIONS", "10")?,
                acquire_timeout: secs("DB_ACQUIRE_TIMEOUT_SECS", "5")?,
            },
            server_host: optional("SERVER_HOST", "0.0.0.0"),
            server_port: parsed("SERVER_PORT", "8080")?,
            mqtt,
            local_offset: parse_offset(&optional("LOCAL_UTC_OFFSET_HOURS", "7"))?,
            time_sync_device_id: non_empty("TIME_SYNC_DEVICE_ID"),
            dedup_ttl: secs("DEDUP_TTL_SECS", "5")?,
            dedup_max_entries: parsed("DEDUP_MAX_ENTRIES", "10000")?,
            dedup_sweep_interval: secs("DEDUP_SWEEP_SECS", "60")?,
            offline_after: secs("OFFLINE_AFTER_SECS", "300")?,
            liveness_interval: secs("LIVENESS_INTERVAL_SECS", "60")?,
            alert_webhook_url: non_empty("ALERT_WEBHOOK_URL"),
            alert_webhook_secret: non_empty("ALERT_WEBHOOK_SECRET"),
            alert_webhook_timeout: secs("ALERT_WEBHOOK_TIMEOUT_SECS", "10")?,
            rejected_payload_dir: non_empty("REJECTED_PAYLOAD_DIR").map(PathBuf::from),
        })
    }
}

/// Parse a whole-hour UTC offset such as `"7"` or `"-5"`.
fn parse_offset(raw: &str) -> Result<FixedOffset> {
    let hours: i32 = raw
        .trim()
        .parse()
        .with_context(|| format!("LOCAL_UTC_OFFSET_HOURS must be an integer, got {raw:?}"))?;
    if !(-12..=14).contains(&hours) {
        bail!("LOCAL_UTC_OFFSET_HOURS must be within -12..=14, got {hours}");
    }
    FixedOffset::east_opt(hours * 3600)
        .with_context(|| format!("invalid UTC offset: {hours} hours"))
}

/// Username and password must be given together.
fn parse_credentials(
    username: Option<String>,
    password: Option<String>,
) -> Result<Option<(String, String)>> {
    match (username, password) {
        (Some(u), Some(p)) if !u.is_empty() => Ok(Some((u, p))),
        (None, None) => Ok(None),
        (Some(u), None) if u.is_empty() => Ok(None),
        _ => bail!("MQTT_USERNAME and MQTT_PASSWORD must be set together"),
    }
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required env var: {key}"))
}

fn optional(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(key: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    optional(key, default)
        .parse()
        .with_context(|| format!("{key} has an invalid value"))
}

fn secs(key: &str, default: &str) -> Result<Duration> {
    let n: u64 = parsed(key, default)?;
    if n == 0 {
        bail!("{key} must be a positive number of seconds");
    }
    Ok(Duration::from_secs(n))
}
