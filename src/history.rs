//! Bounded, persisted history of meter readings.
//!
//! The history is a FIFO of at most [`MeasurementHistory::capacity`] readings
//! in chronological order. It is written to the key-value store as one record
//! (a count plus one entry per index) and validated entry by entry when read
//! back, so a corrupted record shrinks the history instead of failing startup.
use crate::{
    error::{Error, Result},
    traits::KeyValueStore,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Store key of the persisted history record.
pub const HISTORY_KEY: &str = "history";
/// Number of readings kept in memory and on flash.
pub const DEFAULT_CAPACITY: usize = 50;
/// Volumes at or above this value are treated as corrupted.
pub const MAX_VALID_VOLUME: f64 = 999_999.0;

/// One decoded meter reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Unix seconds if the wall clock was known, monotonic milliseconds otherwise.
    pub timestamp: u64,
    /// Meter volume in m³.
    pub volume: f64,
}

impl Reading {
    pub fn new(timestamp: u64, volume: f64) -> Self {
        Self { timestamp, volume }
    }

    /// A reading is only restored from the store if this holds.
    pub fn is_valid(&self) -> bool {
        self.timestamp > 0 && (0.0..MAX_VALID_VOLUME).contains(&self.volume)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryRecord {
    count: usize,
    #[serde(default)]
    entries: Vec<Option<Reading>>,
}

/// FIFO of the most recent readings.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementHistory {
    entries: VecDeque<Reading>,
    capacity: usize,
}

impl Default for MeasurementHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl MeasurementHistory {
    /// Creates an empty history. A capacity of zero is raised to one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a reading, evicting the oldest ones beyond capacity.
    pub fn append(&mut self, reading: Reading) {
        self.entries.push_back(reading);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// The most recent reading.
    pub fn latest(&self) -> Option<&Reading> {
        self.entries.back()
    }

    /// Readings from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Reading> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<Reading> {
        self.entries.iter().copied().collect()
    }

    /// Evicts the oldest readings until at most `target` remain.
    /// Returns the number of evicted readings.
    pub fn shrink(&mut self, target: usize) -> usize {
        let evicted = self.entries.len().saturating_sub(target);
        self.entries.drain(..evicted);
        evicted
    }

    /// Removes all readings.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Overwrites the persisted record with the current readings.
    pub fn save(&self, store: &mut dyn KeyValueStore) -> Result<()> {
        let skip = self.entries.len().saturating_sub(self.capacity);
        let entries: Vec<Option<Reading>> = self.entries.iter().skip(skip).copied().map(Some).collect();
        let record = HistoryRecord {
            count: entries.len(),
            entries,
        };
        let blob = serde_yaml::to_string(&record)?;
        store
            .put_blob(HISTORY_KEY, blob.as_bytes())
            .map_err(|source| Error::Store {
                key: HISTORY_KEY.to_string(),
                source,
            })?;
        log::debug!("History saved: {} entries", record.count);
        Ok(())
    }

    /// Restores the history from the store.
    ///
    /// The stored count is clamped to `capacity`, and entries that are
    /// missing or fail [`Reading::is_valid`] are dropped. An absent or
    /// unreadable record yields an empty history.
    pub fn load(store: &dyn KeyValueStore, capacity: usize) -> Self {
        let mut history = Self::with_capacity(capacity);
        let record = match store.get_blob(HISTORY_KEY) {
            Ok(Some(blob)) => match serde_yaml::from_slice::<HistoryRecord>(&blob) {
                Ok(record) => record,
                Err(error) => {
                    log::warn!("Discarding unreadable history record: {error}");
                    return history;
                }
            },
            Ok(None) => return history,
            Err(error) => {
                log::warn!("Cannot read history record: {error}");
                return history;
            }
        };

        let count = if record.count > history.capacity {
            log::warn!(
                "History record claims {} entries, limiting to {}",
                record.count,
                history.capacity
            );
            history.capacity
        } else {
            record.count
        };

        for index in 0..count {
            match record.entries.get(index).copied().flatten() {
                Some(reading) if reading.is_valid() => history.entries.push_back(reading),
                Some(reading) => log::debug!("Dropping invalid history entry {index}: {reading:?}"),
                None => log::debug!("History entry {index} is missing"),
            }
        }
        log::info!("Loaded {} of {} stored readings", history.len(), count);
        history
    }
}
