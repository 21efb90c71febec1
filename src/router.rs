use crate::config::Topics;
use crate::config_sync::ConfigSync;
use crate::console::{ConsoleEvent, ConsoleSink};
use crate::db::EventStore;
use crate::models::{event_timestamp, now_local, DeviceConfig, FireEvent, Metric, NewFireEvent, TelemetryReading};
use crate::mqtt_service::InboundHandler;
use crate::telemetry::TelemetryBuffers;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("empty payload")]
    Empty,
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload must be a JSON object")]
    NotAnObject,
}

/// `detection_data` body. Every key is optional.
#[derive(Debug, Deserialize)]
struct DetectionData {
    #[serde(rename = "tMin")]
    t_min: Option<f64>,
    #[serde(rename = "tMax")]
    t_max: Option<f64>,
    #[serde(rename = "tCenter")]
    t_center: Option<f64>,
    #[serde(rename = "fireDetected", default, deserialize_with = "detection_flag")]
    fire_detected: Option<bool>,
}

/// The firmware sends `0`/`1`; a JSON bool is accepted too.
fn detection_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Bool(flag) => Ok(Some(flag)),
        Value::Number(n) => n
            .as_f64()
            .map(|v| Some(v != 0.0))
            .ok_or_else(|| serde::de::Error::custom("fireDetected is not a finite number")),
        other => Err(serde::de::Error::custom(format!(
            "fireDetected must be a bool or number, got {other}"
        ))),
    }
}

/// Most recent temperature per metric across all detection messages.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct LastSeen {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub center: Option<f64>,
}

/// What a single inbound message turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Telemetry {
        readings: Vec<TelemetryReading>,
        event: Option<FireEvent>,
    },
    ConfigApplied(DeviceConfig),
    Forwarded,
    Diagnostic(String),
    StoreFault(String),
}

pub struct MessageRouter {
    topics: Topics,
    buffers: Arc<TelemetryBuffers>,
    store: Arc<EventStore>,
    sync: Arc<ConfigSync>,
    console: ConsoleSink,
    last_seen: Mutex<LastSeen>,
    fire_state: Mutex<Option<bool>>,
}

impl MessageRouter {
    pub fn new(
        topics: Topics,
        buffers: Arc<TelemetryBuffers>,
        store: Arc<EventStore>,
        sync: Arc<ConfigSync>,
        console: ConsoleSink,
    ) -> Self {
        Self {
            topics,
            buffers,
            store,
            sync,
            console,
            last_seen: Mutex::new(LastSeen::default()),
            fire_state: Mutex::new(None),
        }
    }

    /// Latest `fireDetected` value seen, if any.
    pub fn fire_state(&self) -> Option<bool> {
        *self.fire_state.lock()
    }

    pub fn last_seen(&self) -> LastSeen {
        *self.last_seen.lock()
    }

    /// Routes one message and reports the result to the console. Never fails:
    /// bad payloads become diagnostics.
    pub fn route(&self, topic: &str, payload: &[u8]) -> RouteOutcome {
        let outcome = if topic == self.topics.detection_data {
            match parse_object(payload) {
                Ok(body) => self.handle_detection_data(body),
                Err(e) => diagnostic(format!("Detection data message format error: {e}")),
            }
        } else if topic == self.topics.config_update {
            match parse_object(payload) {
                Ok(Value::Object(update)) => RouteOutcome::ConfigApplied(self.sync.apply_remote(&update)),
                Ok(_) => diagnostic(PayloadError::NotAnObject.to_string()),
                Err(e) => diagnostic(format!("Configuration update message format error: {e}")),
            }
        } else {
            RouteOutcome::Forwarded
        };

        self.report(topic, payload, &outcome);
        outcome
    }

    fn handle_detection_data(&self, body: Value) -> RouteOutcome {
        let data: DetectionData = match serde_json::from_value(body) {
            Ok(data) => data,
            Err(e) => return diagnostic(format!("Error processing detection data: {e}")),
        };

        let now = now_local();
        let readings: Vec<TelemetryReading> = [
            (Metric::Min, data.t_min),
            (Metric::Max, data.t_max),
            (Metric::Center, data.t_center),
        ]
        .into_iter()
        .filter_map(|(metric, value)| {
            value.map(|value| TelemetryReading {
                timestamp: now,
                metric,
                value,
            })
        })
        .collect();

        let last_seen = {
            let mut last_seen = self.last_seen.lock();
            for reading in &readings {
                self.buffers.record(*reading);
                match reading.metric {
                    Metric::Min => last_seen.min = Some(reading.value),
                    Metric::Max => last_seen.max = Some(reading.value),
                    Metric::Center => last_seen.center = Some(reading.value),
                }
            }
            *last_seen
        };

        let Some(fire_detected) = data.fire_detected else {
            return RouteOutcome::Telemetry { readings, event: None };
        };
        *self.fire_state.lock() = Some(fire_detected);

        // Temperatures missing from this message fall back to the last ones seen.
        let event = NewFireEvent {
            timestamp: event_timestamp(now),
            min_temp: last_seen.min,
            max_temp: last_seen.max,
            center_temp: last_seen.center,
            fire_detected,
            mode: self.sync.current().mode.label().to_string(),
        };
        if data.t_min.is_none() || data.t_max.is_none() || data.t_center.is_none() {
            debug!("Fire event recorded with carried-over temperatures: {:?}", last_seen);
        }

        match self.store.append(&event) {
            Ok(stored) => RouteOutcome::Telemetry {
                readings,
                event: Some(stored),
            },
            Err(e) => {
                error!("Failed to store fire event: {}", e);
                RouteOutcome::StoreFault(e.to_string())
            }
        }
    }

    fn report(&self, topic: &str, payload: &[u8], outcome: &RouteOutcome) {
        let event = match outcome {
            RouteOutcome::Telemetry { readings, event } => ConsoleEvent::Detection {
                readings: readings.clone(),
                event: event.clone(),
            },
            // ConfigSync reports its own apply.
            RouteOutcome::ConfigApplied(_) => return,
            RouteOutcome::Forwarded => ConsoleEvent::Received {
                topic: topic.to_string(),
                payload: String::from_utf8_lossy(payload).into_owned(),
            },
            RouteOutcome::Diagnostic(detail) => ConsoleEvent::Diagnostic(detail.clone()),
            RouteOutcome::StoreFault(detail) => ConsoleEvent::StoreFault(detail.clone()),
        };
        self.console.emit(event);
    }
}

impl InboundHandler for MessageRouter {
    fn handle(&self, topic: &str, payload: &[u8]) {
        let _ = self.route(topic, payload);
    }
}

fn parse_object(payload: &[u8]) -> Result<Value, PayloadError> {
    if payload.is_empty() {
        return Err(PayloadError::Empty);
    }
    let text = String::from_utf8(payload.to_vec())?;
    let value: Value = serde_json::from_str(&text)?;
    if !value.is_object() {
        return Err(PayloadError::NotAnObject);
    }
    Ok(value)
}

fn diagnostic(detail: String) -> RouteOutcome {
    warn!("{}", detail);
    RouteOutcome::Diagnostic(detail)
}
