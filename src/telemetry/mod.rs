pub mod device_state;
pub mod service;

pub use device_state::{DeviceEvent, Transition};
pub use service::{RecordError, RecordOutcome, TelemetryRecorder};
