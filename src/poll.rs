//! Request/response state machine of the M-Bus poll cycle.
//!
//! A cycle starts by sending the request frame (periodically, or on a manual
//! trigger) and ends when the response window elapsed or the receive buffer
//! is full, whichever comes first. Every call into the machine is
//! non-blocking: it only drains the bytes the transport already holds.
use crate::{protocol::RequestFrame, stats::PollStats, traits::Transport};
use serde::Serialize;
use std::time::Duration;

/// Response window after the request frame was sent.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);
/// Receive buffer size; a long frame is at most 261 bytes, the volume
/// record sits well inside the first 256.
pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Idle,
    AwaitingResponse,
}

/// Answer to a manual poll request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerResult {
    Triggered,
    /// A cycle is already running; the request was dropped.
    Busy,
}

/// Receive buffer with a capacity fixed at construction.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    bytes: Vec<u8>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a byte; returns `false` (and drops it) once full.
    pub fn push(&mut self, byte: u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.bytes.push(byte);
        true
    }

    pub fn is_full(&self) -> bool {
        self.bytes.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// Result of a finished poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCycle {
    /// Everything received in the response window; empty on timeout.
    pub frame: Vec<u8>,
    pub response_time_ms: u64,
    /// Set if the request frame could not be written.
    pub write_error: Option<String>,
}

#[derive(Debug)]
struct PollSession {
    buffer: FrameBuffer,
    start_ms: u64,
    write_error: Option<String>,
}

#[derive(Debug)]
pub struct PollStateMachine {
    request: RequestFrame,
    response_timeout_ms: u64,
    state: PollState,
    session: PollSession,
    last_action_ms: Option<u64>,
}

impl PollStateMachine {
    /// Creates an idle machine whose first periodic poll is due immediately.
    pub fn new(request: RequestFrame, response_timeout: Duration, buffer_capacity: usize) -> Self {
        Self {
            request,
            response_timeout_ms: u64::try_from(response_timeout.as_millis()).unwrap_or(u64::MAX),
            state: PollState::Idle,
            session: PollSession {
                buffer: FrameBuffer::with_capacity(buffer_capacity),
                start_ms: 0,
                write_error: None,
            },
            last_action_ms: None,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn request(&self) -> &RequestFrame {
        &self.request
    }

    /// Bytes received so far in the running cycle.
    pub fn buffered(&self) -> &[u8] {
        self.session.buffer.as_slice()
    }

    /// Start of the running cycle, if any.
    pub fn session_start_ms(&self) -> Option<u64> {
        match self.state {
            PollState::AwaitingResponse => Some(self.session.start_ms),
            PollState::Idle => None,
        }
    }

    /// Whether a periodic poll is due at `now_ms`.
    pub fn is_due(&self, now_ms: u64, poll_interval: Duration) -> bool {
        let interval = u64::try_from(poll_interval.as_millis()).unwrap_or(u64::MAX);
        self.last_action_ms
            .is_none_or(|last| now_ms.saturating_sub(last) >= interval)
    }

    /// Starts a cycle right away unless one is already running.
    pub fn trigger(&mut self, now_ms: u64, transport: &mut dyn Transport) -> TriggerResult {
        match self.state {
            PollState::Idle => {
                self.start(now_ms, transport);
                TriggerResult::Triggered
            }
            PollState::AwaitingResponse => TriggerResult::Busy,
        }
    }

    /// Advances the machine by one scheduler tick.
    ///
    /// Returns the finished cycle when the response window closed or the
    /// buffer filled up during this tick; `stats` has been updated by then.
    pub fn step(
        &mut self,
        now_ms: u64,
        poll_interval: Duration,
        transport: &mut dyn Transport,
        stats: &mut PollStats,
    ) -> Option<CompletedCycle> {
        match self.state {
            PollState::Idle => {
                if self.is_due(now_ms, poll_interval) {
                    self.start(now_ms, transport);
                }
                None
            }
            PollState::AwaitingResponse => {
                self.drain(transport);
                let elapsed = now_ms.saturating_sub(self.session.start_ms);
                if elapsed >= self.response_timeout_ms || self.session.buffer.is_full() {
                    Some(self.complete(elapsed, stats))
                } else {
                    None
                }
            }
        }
    }

    fn start(&mut self, now_ms: u64, transport: &mut dyn Transport) {
        self.session.buffer.clear();
        self.session.start_ms = now_ms;
        self.session.write_error = match transport.write_frame(self.request.as_bytes()) {
            Ok(()) => None,
            Err(error) => {
                log::warn!("Cannot send M-Bus request: {error}");
                Some(error.to_string())
            }
        };
        self.last_action_ms = Some(now_ms);
        self.state = PollState::AwaitingResponse;
        log::debug!("M-Bus request sent, awaiting response");
    }

    fn drain(&mut self, transport: &mut dyn Transport) {
        while !self.session.buffer.is_full() {
            let available = match transport.available_bytes() {
                Ok(0) => return,
                Ok(available) => available,
                Err(error) => {
                    log::warn!("Cannot query M-Bus receive queue: {error}");
                    return;
                }
            };
            for _ in 0..available {
                if self.session.buffer.is_full() {
                    return;
                }
                match transport.read_byte() {
                    Ok(byte) => {
                        self.session.buffer.push(byte);
                    }
                    Err(error) => {
                        log::warn!("Cannot read from M-Bus: {error}");
                        return;
                    }
                }
            }
        }
    }

    fn complete(&mut self, response_time_ms: u64, stats: &mut PollStats) -> CompletedCycle {
        stats.record_cycle(response_time_ms);
        self.state = PollState::Idle;
        CompletedCycle {
            frame: self.session.buffer.as_slice().to_vec(),
            response_time_ms,
            write_error: self.session.write_error.take(),
        }
    }
}

impl Default for PollStateMachine {
    fn default() -> Self {
        Self::new(
            RequestFrame::default(),
            DEFAULT_RESPONSE_TIMEOUT,
            DEFAULT_BUFFER_CAPACITY,
        )
    }
}
