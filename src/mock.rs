//! In-memory doubles of the host capabilities, for tests and dry runs.
use crate::traits::{Broker, Clock, NetworkLink, Transport};
use std::cell::Cell;
use std::collections::{HashSet, VecDeque};
use std::io;

/// Serial bus with a scripted receive queue.
#[derive(Debug, Default)]
pub struct MockTransport {
    rx: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
    fail_writes: bool,
    /// Bytes appended to the receive queue after each successful write.
    reply: Option<Vec<u8>>,
}

impl MockTransport {
    /// Makes the device answer every request with `frame`.
    pub fn replying(frame: &[u8]) -> Self {
        Self {
            reply: Some(frame.to_vec()),
            ..Default::default()
        }
    }

    pub fn queue_rx(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    pub fn pending_rx(&self) -> usize {
        self.rx.len()
    }

    pub fn sent_frames(&self) -> &[Vec<u8>] {
        &self.sent
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }
}

impl Transport for MockTransport {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "port closed"));
        }
        self.sent.push(frame.to_vec());
        if let Some(reply) = &self.reply {
            self.rx.extend(reply);
        }
        Ok(())
    }

    fn available_bytes(&mut self) -> io::Result<usize> {
        Ok(self.rx.len())
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        self.rx
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "receive queue empty"))
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: Cell<u64>,
    wall_origin: Cell<Option<u64>>,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: Cell::new(now_ms),
            wall_origin: Cell::new(None),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.set(self.now_ms.get() + ms);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.set(now_ms);
    }

    /// Makes the wall clock known; it reads `epoch_seconds` at monotonic 0.
    pub fn set_wall_origin(&self, epoch_seconds: Option<u64>) {
        self.wall_origin.set(epoch_seconds);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }

    fn wall_seconds(&self) -> Option<u64> {
        self.wall_origin
            .get()
            .map(|origin| origin + self.now_ms.get() / 1000)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// Broker that records every accepted publish.
#[derive(Debug)]
pub struct RecordingBroker {
    connected: bool,
    failing_topics: HashSet<String>,
    published: Vec<Published>,
}

impl Default for RecordingBroker {
    fn default() -> Self {
        Self {
            connected: true,
            failing_topics: HashSet::new(),
            published: Vec::new(),
        }
    }
}

impl RecordingBroker {
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Makes publishes on `topic` fail.
    pub fn fail_topic(&mut self, topic: &str) {
        self.failing_topics.insert(topic.to_string());
    }

    pub fn published(&self) -> &[Published] {
        &self.published
    }

    pub fn topics(&self) -> Vec<&str> {
        self.published.iter().map(|p| p.topic.as_str()).collect()
    }

    /// Last payload accepted on `topic`.
    pub fn payload(&self, topic: &str) -> Option<&str> {
        self.published
            .iter()
            .rev()
            .find(|p| p.topic == topic)
            .map(|p| p.payload.as_str())
    }

    pub fn clear(&mut self) {
        self.published.clear();
    }
}

impl Broker for RecordingBroker {
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> bool {
        if !self.connected || self.failing_topics.contains(topic) {
            return false;
        }
        self.published.push(Published {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain,
        });
        true
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Network link with a settable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedLink {
    pub ready: bool,
    pub quality: i32,
}

impl Default for FixedLink {
    fn default() -> Self {
        Self {
            ready: true,
            quality: -60,
        }
    }
}

impl NetworkLink for FixedLink {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn quality(&self) -> i32 {
        self.quality
    }
}
