//! Bounded live log of gateway events, shown next to the readings.
use serde::Serialize;
use std::collections::VecDeque;

pub const DEFAULT_LOG_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// Monotonic milliseconds at which the entry was added.
    pub timestamp_ms: u64,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Adds an entry and forwards it to the `log` facade at info level.
    pub fn push(&mut self, timestamp_ms: u64, message: impl Into<String>) {
        let message = message.into();
        log::info!("{message}");
        self.entries.push_back(LogEntry {
            timestamp_ms,
            message,
        });
        if self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Drops the oldest entries until at most `target` remain.
    pub fn shrink(&mut self, target: usize) -> usize {
        let evicted = self.entries.len().saturating_sub(target);
        self.entries.drain(..evicted);
        evicted
    }
}
