use crate::models::now_local;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use time::macros::format_description;
use time::OffsetDateTime;

pub const LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    System,
    Received,
    Sent,
    ConfigSent,
    ConfigUpdate,
    DetectionData,
    Error,
}

impl LogCategory {
    pub fn label(self) -> &'static str {
        match self {
            Self::System => "System",
            Self::Received => "Received",
            Self::Sent => "Sent",
            Self::ConfigSent => "Config Sent",
            Self::ConfigUpdate => "Config Update",
            Self::DetectionData => "Detection Data",
            Self::Error => "Error",
        }
    }

    /// Display color hint for the console.
    pub fn color(self) -> &'static str {
        match self {
            Self::System | Self::DetectionData => "blue",
            Self::Received => "black",
            Self::Sent => "purple",
            Self::ConfigSent => "orange",
            Self::ConfigUpdate => "green",
            Self::Error => "red",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: OffsetDateTime,
    pub category: LogCategory,
    /// Overrides the category's default color (e.g. green for a successful connect).
    pub color: &'static str,
    pub content: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let format = format_description!("[hour]:[minute]:[second]");
        let clock = self.timestamp.format(&format).map_err(|_| fmt::Error)?;
        write!(f, "[{}] [{}] {}", clock, self.category.label(), self.content)
    }
}

/// Capped notice log shown by the console. Oldest entries fall off once
/// the cap is reached.
#[derive(Debug)]
pub struct MessageLog {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLog {
    pub fn new() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, category: LogCategory, content: impl Into<String>) {
        self.push_colored(category, category.color(), content);
    }

    pub fn push_colored(&self, category: LogCategory, color: &'static str, content: impl Into<String>) {
        let entry = LogEntry {
            timestamp: now_local(),
            category,
            color,
            content: content.into(),
        };
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// The newest `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
