//! Delivery of persisted alerts to the outside world.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::db::models::{Alert, AlertType};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";

#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the log. Used when no webhook is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        match alert.alert_type {
            AlertType::Critical => warn!(
                device_id = %alert.device_id,
                alert_id = %alert.id,
                message = %alert.message,
                "Critical alert"
            ),
            AlertType::Warning => info!(
                device_id = %alert.device_id,
                alert_id = %alert.id,
                message = %alert.message,
                "Warning alert"
            ),
        }
        Ok(())
    }
}

/// POSTs each alert as JSON to a fixed URL.
///
/// Requests carry `X-Timestamp` (unix seconds) and, when a secret is set,
/// `X-Signature = hex(HMAC-SHA256(secret, "{timestamp}.{body}"))`.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: Client,
    url: String,
    secret: Option<String>,
}

impl WebhookNotifier {
    /// `timeout` bounds each delivery so an unresponsive receiver cannot hold
    /// a notification task open indefinitely.
    pub fn new(url: impl Into<String>, secret: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self {
            http,
            url: url.into(),
            secret,
        })
    }
}

#[async_trait]
impl AlertNotifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        let body = serde_json::to_vec(alert).context("failed to serialise alert")?;
        let timestamp = Utc::now().timestamp().to_string();

        let mut request = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(TIMESTAMP_HEADER, &timestamp);
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign(secret, &timestamp, &body));
        }

        let resp = request
            .body(body)
            .send()
            .await
            .with_context(|| format!("POST {}", self.url))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("webhook returned HTTP {status}");
        }
        debug!(alert_id = %alert.id, status = %status, "Alert delivered to webhook");
        Ok(())
    }
}

/// Lowercase hex HMAC-SHA256 over `"{timestamp}.{body}"`.
pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn signature_covers_timestamp_and_body() {
        let a = sign("secret", "1700000000", br#"{"id":1}"#);
        assert_eq!(a, sign("secret", "1700000000", br#"{"id":1}"#));
        assert_ne!(a, sign("secret", "1700000001", br#"{"id":1}"#));
        assert_ne!(a, sign("secret", "1700000000", br#"{"id":2}"#));
        assert_ne!(a, sign("other", "1700000000", br#"{"id":1}"#));
    }

    #[test]
    fn signature_is_hmac_of_joined_message() {
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(b"42.payload");
        let expected = hex::encode(mac.finalize().into_bytes());
        assert_eq!(sign("secret", "42", b"payload"), expected);
    }

    #[tokio::test]
    async fn silent_receiver_times_out() {
        // Accepts connections and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let notifier = WebhookNotifier::new(
            format!("http://{addr}/alerts"),
            Some("secret".into()),
            Duration::from_millis(200),
        )
        .unwrap();
        let alert = Alert {
            id: Uuid::new_v4(),
            device_id: "SN001".into(),
            alert_type: AlertType::Critical,
            message: "overload".into(),
            is_active: true,
            created_at: Utc::now(),
            resolved_at: None,
        };

        let result = tokio::time::timeout(Duration::from_secs(5), notifier.notify(&alert))
            .await
            .expect("delivery must give up on its own");
        assert!(result.is_err());
    }
}
