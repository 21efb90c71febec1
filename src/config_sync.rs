use crate::console::{ConsoleEvent, ConsoleSink};
use crate::models::{DeviceConfig, DeviceConfigPayload, MeasurementMode, THRESHOLD_COUNT};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Outbound side of the session, as seen by config sync.
pub trait Publisher: Send + Sync {
    /// Fire-and-forget publish; `false` when the message could not be queued.
    fn publish(&self, topic: &str, payload: &str) -> bool;
}

/// Who is writing the configuration. Only local edits go back out to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    LocalEdit,
    RemoteApply,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigField {
    Mode(MeasurementMode),
    /// 1-based threshold number, as on the wire.
    Threshold { number: usize, value: f64 },
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigSyncError {
    #[error("threshold number {0} is out of range 1..=5")]
    UnknownThreshold(usize),
    #[error("threshold value must be finite")]
    NonFinite,
}

pub struct ConfigSync {
    state: Mutex<DeviceConfig>,
    publisher: Arc<dyn Publisher>,
    topic: String,
    console: ConsoleSink,
}

impl ConfigSync {
    pub fn new(publisher: Arc<dyn Publisher>, topic: impl Into<String>, console: ConsoleSink) -> Self {
        Self {
            state: Mutex::new(DeviceConfig::default()),
            publisher,
            topic: topic.into(),
            console,
        }
    }

    pub fn current(&self) -> DeviceConfig {
        *self.state.lock()
    }

    /// Operator edit of a single field. Publishes the full configuration;
    /// returns whether the publish was queued.
    pub fn edit(&self, field: ConfigField) -> Result<bool, ConfigSyncError> {
        validate(&field)?;
        Ok(self.write(&[field], WriteOrigin::LocalEdit))
    }

    /// Applies a `config_update` object from the device. Each key is taken
    /// on its own: missing or unparsable keys leave their field alone, and an
    /// out-of-range mode is dropped without affecting the thresholds.
    pub fn apply_remote(&self, update: &Map<String, Value>) -> DeviceConfig {
        let mut fields = Vec::with_capacity(1 + THRESHOLD_COUNT);

        if let Some(raw) = update.get("measurement_mode") {
            match as_integer(raw).and_then(MeasurementMode::from_wire) {
                Some(mode) => fields.push(ConfigField::Mode(mode)),
                None => debug!("Ignoring out-of-range measurement_mode {}", raw),
            }
        }

        for number in 1..=THRESHOLD_COUNT {
            let key = format!("threshold_{number}");
            if let Some(raw) = update.get(&key) {
                match as_float(raw) {
                    Some(value) => fields.push(ConfigField::Threshold { number, value }),
                    None => warn!("Ignoring non-numeric {} value {}", key, raw),
                }
            }
        }

        self.write(&fields, WriteOrigin::RemoteApply);
        let config = self.current();
        self.console.emit(ConsoleEvent::ConfigApplied(config));
        config
    }

    /// Single point where configuration fields are written. Returns whether
    /// a publish was queued, which only ever happens for local edits.
    pub fn write(&self, fields: &[ConfigField], origin: WriteOrigin) -> bool {
        let snapshot = {
            let mut state = self.state.lock();
            for field in fields {
                match *field {
                    ConfigField::Mode(mode) => state.mode = mode,
                    ConfigField::Threshold { number, value } => {
                        if let Some(slot) = number.checked_sub(1).and_then(|i| state.thresholds.get_mut(i)) {
                            *slot = value;
                        }
                    }
                }
            }
            *state
        };

        match origin {
            WriteOrigin::RemoteApply => false,
            WriteOrigin::LocalEdit => self.publish(&snapshot),
        }
    }

    fn publish(&self, config: &DeviceConfig) -> bool {
        let payload = match serde_json::to_string(&DeviceConfigPayload::from(config)) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize device config: {}", e);
                return false;
            }
        };

        if self.publisher.publish(&self.topic, &payload) {
            self.console.emit(ConsoleEvent::ConfigSent {
                topic: self.topic.clone(),
                payload,
            });
            true
        } else {
            debug!("Config publish skipped; session not connected.");
            false
        }
    }
}

fn validate(field: &ConfigField) -> Result<(), ConfigSyncError> {
    match *field {
        ConfigField::Mode(_) => Ok(()),
        ConfigField::Threshold { number, value } => {
            if !(1..=THRESHOLD_COUNT).contains(&number) {
                return Err(ConfigSyncError::UnknownThreshold(number));
            }
            if !value.is_finite() {
                return Err(ConfigSyncError::NonFinite);
            }
            Ok(())
        }
    }
}

/// Integers, floats (truncated toward zero) and numeric strings.
fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    let parsed: Option<f64> = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}
