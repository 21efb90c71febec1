use crate::models::{Metric, TelemetryReading};
use parking_lot::RwLock;
use std::collections::VecDeque;
use time::OffsetDateTime;

pub const BUFFER_CAPACITY: usize = 512;

/// Fixed-capacity drop-oldest series for one metric.
///
/// Appends come from the session worker while the console reads snapshots
/// from its own task; readers always get a copy, never a live view.
#[derive(Debug)]
pub struct TelemetryBuffer {
    metric: Metric,
    capacity: usize,
    samples: RwLock<VecDeque<(OffsetDateTime, f64)>>,
}

impl TelemetryBuffer {
    pub fn new(metric: Metric) -> Self {
        Self::with_capacity(metric, BUFFER_CAPACITY)
    }

    pub fn with_capacity(metric: Metric, capacity: usize) -> Self {
        Self {
            metric,
            capacity,
            samples: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn append(&self, timestamp: OffsetDateTime, value: f64) {
        let mut samples = self.samples.write();
        samples.push_back((timestamp, value));
        while samples.len() > self.capacity {
            samples.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<(OffsetDateTime, f64)> {
        self.samples.read().iter().copied().collect()
    }

    pub fn latest(&self) -> Option<TelemetryReading> {
        self.samples.read().back().map(|&(timestamp, value)| TelemetryReading {
            timestamp,
            metric: self.metric,
            value,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The three tracked series. Created once at startup and shared for the
/// lifetime of the process.
#[derive(Debug)]
pub struct TelemetryBuffers {
    min: TelemetryBuffer,
    max: TelemetryBuffer,
    center: TelemetryBuffer,
}

impl Default for TelemetryBuffers {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryBuffers {
    pub fn new() -> Self {
        Self {
            min: TelemetryBuffer::new(Metric::Min),
            max: TelemetryBuffer::new(Metric::Max),
            center: TelemetryBuffer::new(Metric::Center),
        }
    }

    pub fn get(&self, metric: Metric) -> &TelemetryBuffer {
        match metric {
            Metric::Min => &self.min,
            Metric::Max => &self.max,
            Metric::Center => &self.center,
        }
    }

    pub fn record(&self, reading: TelemetryReading) {
        self.get(reading.metric).append(reading.timestamp, reading.value);
    }
}
