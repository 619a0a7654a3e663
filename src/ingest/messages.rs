//! Inbound payload shapes and their validation rules.
//!
//! Data topic:
//!   `{"deviceId": "SN001", "power_connected": true, "voltage": 221.4, "current": 1.2,
//!     "power": 250.1, "energy": 12.345, "frequency": 50.0, "pf": 0.94}`
//!
//! Status topic:
//!   `{"deviceId": "SN001", "status": "online"}`
//!   `{"deviceId": "SN001", "relay_status": true, "source": "button"}`
//!
//! Log topic:
//!   `{"deviceId": "SN001", "message": "brownout detected", "warning": true}`

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::telemetry::device_state::DeviceEvent;

/// Highest plausible line current for a household meter, in amperes.
pub const MAX_CURRENT_AMPS: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("payload is not valid JSON: {0}")]
    Json(String),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    Missing(&'static str),

    #[error("field `{0}` must be a non-empty string")]
    NotAString(&'static str),

    #[error("field `{0}` must be a number")]
    NotNumeric(&'static str),

    #[error("field `{0}` must be a boolean")]
    NotBoolean(&'static str),

    #[error("field `{field}` must be non-negative, got {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("field `{field}` is out of range: {value} exceeds {max}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        max: f64,
    },

    #[error("unknown device status {0:?}")]
    UnknownStatus(String),
}

/// A telemetry sample that passed validation. Electrical fields are already
/// zeroed when the supply is disconnected.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub device_id: String,
    pub power_connected: bool,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    /// Absent only when the supply is disconnected and the device omitted it.
    pub energy: Option<f64>,
    pub frequency: Option<f64>,
    pub power_factor: Option<f64>,
}

/// What a data-topic payload turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum DataMessage {
    Telemetry(TelemetrySample),
    /// Physical button toggle published on the data topic; handled as status.
    ManualToggle(StatusMessage),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusMessage {
    #[serde(rename = "deviceId", alias = "device_id")]
    pub device_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub relay_status: Option<bool>,
    #[serde(default)]
    pub source: Option<String>,
}

impl StatusMessage {
    pub fn is_manual_toggle(&self) -> bool {
        self.relay_status.is_some() && self.source.as_deref() == Some("button")
    }

    /// The connectivity event carried by `status`, if any.
    pub fn event(&self) -> Result<Option<DeviceEvent>, ValidationError> {
        let Some(status) = self.status.as_deref() else {
            return Ok(None);
        };
        match status.trim().to_ascii_lowercase().as_str() {
            "online" | "connected" => Ok(Some(DeviceEvent::ReportedOnline)),
            "offline" | "disconnected" => Ok(Some(DeviceEvent::ReportedOffline)),
            "configuring" => Ok(Some(DeviceEvent::ConfigPushed)),
            _ => Err(ValidationError::UnknownStatus(status.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogMessage {
    #[serde(rename = "deviceId", alias = "device_id")]
    pub device_id: String,
    pub message: String,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub warning: bool,
}

pub fn parse_json(payload: &[u8]) -> Result<Value, ValidationError> {
    serde_json::from_slice(payload).map_err(|e| ValidationError::Json(e.to_string()))
}

/// Validate a data-topic payload.
///
/// With `power_connected = true`, `voltage`, `current`, `power` and `energy`
/// must be present, numeric and non-negative. With `power_connected = false`
/// those readings are forced to zero and `frequency`/`pf` to null. Any
/// violation rejects the whole message.
pub fn parse_data(value: &Value) -> Result<DataMessage, ValidationError> {
    let obj = value.as_object().ok_or(ValidationError::NotAnObject)?;
    let device_id = device_id(obj)?;

    if obj.contains_key("relay_status")
        && obj.get("source").and_then(Value::as_str) == Some("button")
    {
        let status: StatusMessage = serde_json::from_value(value.clone())
            .map_err(|e| ValidationError::Json(e.to_string()))?;
        return Ok(DataMessage::ManualToggle(status));
    }

    let power_connected = match field(obj, &["power_connected", "powerConnected"]) {
        None => return Err(ValidationError::Missing("power_connected")),
        Some(v) => v.as_bool().ok_or(ValidationError::NotBoolean("power_connected"))?,
    };

    if !power_connected {
        return Ok(DataMessage::Telemetry(TelemetrySample {
            device_id,
            power_connected,
            voltage: 0.0,
            current: 0.0,
            power: 0.0,
            energy: optional_number(obj, "energy", &["energy"])?,
            frequency: None,
            power_factor: None,
        }));
    }

    let current = required_number(obj, "current")?;
    if current > MAX_CURRENT_AMPS {
        return Err(ValidationError::OutOfRange {
            field: "current",
            value: current,
            max: MAX_CURRENT_AMPS,
        });
    }

    let power_factor = optional_number(obj, "pf", &["pf", "power_factor"])?;
    if let Some(pf) = power_factor.filter(|pf| *pf > 1.0) {
        return Err(ValidationError::OutOfRange { field: "pf", value: pf, max: 1.0 });
    }

    Ok(DataMessage::Telemetry(TelemetrySample {
        device_id,
        power_connected,
        voltage: required_number(obj, "voltage")?,
        current,
        power: required_number(obj, "power")?,
        energy: Some(required_number(obj, "energy")?),
        frequency: optional_number(obj, "frequency", &["frequency"])?,
        power_factor,
    }))
}

pub fn parse_status(payload: &[u8]) -> Result<StatusMessage, ValidationError> {
    let status: StatusMessage =
        serde_json::from_slice(payload).map_err(|e| ValidationError::Json(e.to_string()))?;
    if status.device_id.trim().is_empty() {
        return Err(ValidationError::NotAString("deviceId"));
    }
    Ok(status)
}

pub fn parse_log(payload: &[u8]) -> Result<LogMessage, ValidationError> {
    let log: LogMessage =
        serde_json::from_slice(payload).map_err(|e| ValidationError::Json(e.to_string()))?;
    if log.device_id.trim().is_empty() {
        return Err(ValidationError::NotAString("deviceId"));
    }
    Ok(log)
}

/// Best-effort device id of an arbitrary payload, for logging rejects.
pub fn sniff_device_id(payload: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    let obj = value.as_object()?;
    device_id(obj).ok()
}

fn device_id(obj: &Map<String, Value>) -> Result<String, ValidationError> {
    match field(obj, &["deviceId", "device_id"]) {
        None => Err(ValidationError::Missing("deviceId")),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_owned()),
        Some(_) => Err(ValidationError::NotAString("deviceId")),
    }
}

/// First non-null value among `keys`.
fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn required_number(obj: &Map<String, Value>, name: &'static str) -> Result<f64, ValidationError> {
    optional_number(obj, name, &[name])?.ok_or(ValidationError::Missing(name))
}

fn optional_number(
    obj: &Map<String, Value>,
    name: &'static str,
    keys: &[&str],
) -> Result<Option<f64>, ValidationError> {
    let Some(v) = field(obj, keys) else {
        return Ok(None);
    };
    let n = v.as_f64().ok_or(ValidationError::NotNumeric(name))?;
    if !n.is_finite() {
        return Err(ValidationError::NotNumeric(name));
    }
    if n < 0.0 {
        return Err(ValidationError::Negative { field: name, value: n });
    }
    Ok(Some(n))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn telemetry(value: Value) -> TelemetrySample {
        match parse_data(&value).unwrap() {
            DataMessage::Telemetry(s) => s,
            other => panic!("expected telemetry, got {other:?}"),
        }
    }

    #[test]
    fn accepts_complete_sample() {
        let s = telemetry(json!({
            "deviceId": "SN001", "power_connected": true, "voltage": 245, "current": 2,
            "power": 490, "energy": 12.345, "frequency": 50.1, "pf": 0.97
        }));
        assert_eq!(s.device_id, "SN001");
        assert_eq!(s.voltage, 245.0);
        assert_eq!(s.energy, Some(12.345));
        assert_eq!(s.frequency, Some(50.1));
        assert_eq!(s.power_factor, Some(0.97));
    }

    #[test]
    fn disconnected_sample_is_zeroed_whatever_the_input() {
        let s = telemetry(json!({
            "deviceId": "SN001", "power_connected": false, "voltage": 230, "current": 3,
            "power": 700, "energy": 5.5, "frequency": 50, "pf": 0.9
        }));
        assert!(!s.power_connected);
        assert_eq!((s.voltage, s.current, s.power), (0.0, 0.0, 0.0));
        assert_eq!(s.frequency, None);
        assert_eq!(s.power_factor, None);
        assert_eq!(s.energy, Some(5.5));
    }

    #[test]
    fn disconnected_sample_skips_numeric_checks() {
        let s = telemetry(json!({ "deviceId": "SN001", "power_connected": false, "voltage": "n/a" }));
        assert_eq!(s.voltage, 0.0);
        assert_eq!(s.energy, None);
    }

    #[test]
    fn rejects_missing_device_id() {
        let err = parse_data(&json!({ "power_connected": true })).unwrap_err();
        assert_eq!(err, ValidationError::Missing("deviceId"));
    }

    #[test]
    fn rejects_missing_or_non_boolean_power_connected() {
        let err = parse_data(&json!({ "deviceId": "a", "voltage": 220 })).unwrap_err();
        assert_eq!(err, ValidationError::Missing("power_connected"));

        let err = parse_data(&json!({ "deviceId": "a", "power_connected": "yes" })).unwrap_err();
        assert_eq!(err, ValidationError::NotBoolean("power_connected"));
    }

    #[test]
    fn rejects_missing_required_reading() {
        let err = parse_data(&json!({
            "deviceId": "a", "power_connected": true, "voltage": 220, "current": 1, "power": 220
        }))
        .unwrap_err();
        assert_eq!(err, ValidationError::Missing("energy"));
    }

    #[test]
    fn rejects_non_numeric_and_negative_values() {
        let err = parse_data(&json!({
            "deviceId": "a", "power_connected": true, "voltage": "220", "current": 1,
            "power": 220, "energy": 1
        }))
        .unwrap_err();
        assert_eq!(err, ValidationError::NotNumeric("voltage"));

        let err = parse_data(&json!({
            "deviceId": "a", "power_connected": true, "voltage": 220, "current": 1,
            "power": -3, "energy": 1
        }))
        .unwrap_err();
        assert_eq!(err, ValidationError::Negative { field: "power", value: -3.0 });
    }

    #[test]
    fn rejects_implausible_current() {
        let err = parse_data(&json!({
            "deviceId": "a", "power_connected": true, "voltage": 220, "current": 250,
            "power": 220, "energy": 1
        }))
        .unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { field: "current", .. }));
    }

    #[test]
    fn button_toggle_bypasses_numeric_validation() {
        let msg = parse_data(&json!({
            "deviceId": "SN001", "relay_status": true, "source": "button", "voltage": "bad"
        }))
        .unwrap();
        match msg {
            DataMessage::ManualToggle(s) => {
                assert_eq!(s.device_id, "SN001");
                assert_eq!(s.relay_status, Some(true));
                assert!(s.is_manual_toggle());
            }
            other => panic!("expected manual toggle, got {other:?}"),
        }
    }

    #[test]
    fn status_words_map_to_events() {
        let status = parse_status(br#"{"deviceId":"a","status":"Offline"}"#).unwrap();
        assert_eq!(status.event().unwrap(), Some(DeviceEvent::ReportedOffline));

        let status = parse_status(br#"{"deviceId":"a","status":"sleeping"}"#).unwrap();
        assert!(matches!(status.event(), Err(ValidationError::UnknownStatus(_))));

        let status = parse_status(br#"{"deviceId":"a","relay_status":false}"#).unwrap();
        assert_eq!(status.event().unwrap(), None);
    }

    #[test]
    fn log_flags_default_to_false() {
        let log = parse_log(br#"{"deviceId":"a","message":"boot"}"#).unwrap();
        assert!(!log.error && !log.warning);
    }

    #[test]
    fn sniffs_device_id_from_rejected_payloads() {
        assert_eq!(sniff_device_id(br#"{"deviceId":"SN9","voltage":"x"}"#), Some("SN9".into()));
        assert_eq!(sniff_device_id(b"garbage"), None);
    }
}
