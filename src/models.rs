use serde::{Deserialize, Serialize};
use std::fmt;
use time::macros::format_description;
use time::OffsetDateTime;

/// Wall-clock time in the local offset, falling back to UTC when the
/// offset cannot be determined (e.g. multi-threaded process on some platforms).
pub fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Formats a timestamp the way fire events are persisted (`YYYY-MM-DD HH:MM:SS`).
pub fn event_timestamp(at: OffsetDateTime) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    at.format(&format).unwrap_or_else(|_| at.unix_timestamp().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    Min,
    Max,
    Center,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Min, Metric::Max, Metric::Center];

    pub fn label(self) -> &'static str {
        match self {
            Metric::Min => "min",
            Metric::Max => "max",
            Metric::Center => "center",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "min" | "tMin" => Some(Metric::Min),
            "max" | "tMax" => Some(Metric::Max),
            "center" | "tCenter" => Some(Metric::Center),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryReading {
    pub timestamp: OffsetDateTime,
    pub metric: Metric,
    pub value: f64,
}

/// A stored fire-detection event. Temperatures are absent only when no
/// reading for that metric had ever been received when the event was logged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FireEvent {
    pub id: i64,
    pub timestamp: String,
    pub min_temp: Option<f64>,
    pub max_temp: Option<f64>,
    pub center_temp: Option<f64>,
    pub fire_detected: bool,
    pub mode: String,
}

/// An event before the store has assigned its identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFireEvent {
    pub timestamp: String,
    pub min_temp: Option<f64>,
    pub max_temp: Option<f64>,
    pub center_temp: Option<f64>,
    pub fire_detected: bool,
    pub mode: String,
}

/// Detection algorithm running on the device. Wire value is 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeasurementMode {
    #[default]
    Threshold,
    MachineLearning,
    TimeIntegration,
    Comprehensive,
}

impl MeasurementMode {
    /// Maps the 1-based wire value; anything outside 1..=4 is rejected.
    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Threshold),
            2 => Some(Self::MachineLearning),
            3 => Some(Self::TimeIntegration),
            4 => Some(Self::Comprehensive),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Self::Threshold => 0,
            Self::MachineLearning => 1,
            Self::TimeIntegration => 2,
            Self::Comprehensive => 3,
        }
    }

    pub fn wire_value(self) -> u8 {
        self.index() + 1
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Threshold => "Threshold",
            Self::MachineLearning => "Machine Learning",
            Self::TimeIntegration => "Time Integration",
            Self::Comprehensive => "Comprehensive",
        }
    }
}

impl fmt::Display for MeasurementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.wire_value())
    }
}

pub const THRESHOLD_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceConfig {
    pub mode: MeasurementMode,
    pub thresholds: [f64; THRESHOLD_COUNT],
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mode: MeasurementMode::Threshold,
            thresholds: [35.0, 0.8, 45.0, 0.6, 60.0],
        }
    }
}

/// Outbound wire form of [`DeviceConfig`].
#[derive(Debug, Serialize)]
pub struct DeviceConfigPayload {
    pub measurement_mode: u8,
    pub threshold_1: f64,
    pub threshold_2: f64,
    pub threshold_3: f64,
    pub threshold_4: f64,
    pub threshold_5: f64,
}

impl From<&DeviceConfig> for DeviceConfigPayload {
    fn from(config: &DeviceConfig) -> Self {
        let [t1, t2, t3, t4, t5] = config.thresholds;
        Self {
            measurement_mode: config.mode.wire_value(),
            threshold_1: t1,
            threshold_2: t2,
            threshold_3: t3,
            threshold_4: t4,
            threshold_5: t5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportScheme {
    #[default]
    #[serde(rename = "mqtt://")]
    Plain,
    #[serde(rename = "mqtts://")]
    Secure,
    #[serde(rename = "ws://")]
    WebSocket,
    #[serde(rename = "wss://")]
    SecureWebSocket,
}

impl TransportScheme {
    pub const ALL: [TransportScheme; 4] = [
        Self::Plain,
        Self::Secure,
        Self::WebSocket,
        Self::SecureWebSocket,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Plain => "mqtt://",
            Self::Secure => "mqtts://",
            Self::WebSocket => "ws://",
            Self::SecureWebSocket => "wss://",
        }
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, Self::WebSocket | Self::SecureWebSocket)
    }
}
