//! Poll statistics and error accounting.
use serde::Serialize;
use std::fmt;

/// Number of response bytes kept in the diagnostic hex dump.
pub const HEX_DUMP_BYTES: usize = 32;

/// Recoverable failure categories the gateway counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No byte arrived within the response window.
    BusTimeout,
    /// Bytes arrived but held no decodable volume record.
    DecodeFailure,
    /// The broker was unreachable or refused a publish.
    Publish,
    /// The upstream network link went down.
    LinkLoss,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::BusTimeout => "M-Bus timeout",
            ErrorKind::DecodeFailure => "M-Bus decode failure",
            ErrorKind::Publish => "Publish failure",
            ErrorKind::LinkLoss => "Link loss",
        };
        f.write_str(name)
    }
}

/// The most recently recorded error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
    /// Monotonic milliseconds at which the error was recorded.
    pub timestamp_ms: u64,
}

/// Monotonic error counters, reset only on request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorStats {
    pub bus_timeouts: u64,
    pub decode_failures: u64,
    pub publish_failures: u64,
    pub link_losses: u64,
    pub last_error: Option<LastError>,
}

impl ErrorStats {
    /// Counts an error and makes it the last error.
    pub fn record(&mut self, kind: ErrorKind, message: impl Into<String>, timestamp_ms: u64) {
        let counter = match kind {
            ErrorKind::BusTimeout => &mut self.bus_timeouts,
            ErrorKind::DecodeFailure => &mut self.decode_failures,
            ErrorKind::Publish => &mut self.publish_failures,
            ErrorKind::LinkLoss => &mut self.link_losses,
        };
        *counter = counter.saturating_add(1);
        let message = message.into();
        log::error!("{kind}: {message}");
        self.last_error = Some(LastError {
            kind,
            message,
            timestamp_ms,
        });
    }

    pub fn count(&self, kind: ErrorKind) -> u64 {
        match kind {
            ErrorKind::BusTimeout => self.bus_timeouts,
            ErrorKind::DecodeFailure => self.decode_failures,
            ErrorKind::Publish => self.publish_failures,
            ErrorKind::LinkLoss => self.link_losses,
        }
    }

    pub fn total(&self) -> u64 {
        self.bus_timeouts + self.decode_failures + self.publish_failures + self.link_losses
    }

    /// Zeroes the four counters. The last error record is kept.
    pub fn reset(&mut self) {
        self.bus_timeouts = 0;
        self.decode_failures = 0;
        self.publish_failures = 0;
        self.link_losses = 0;
    }
}

/// Counters of completed poll cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollStats {
    pub total_polls: u64,
    pub successful_polls: u64,
    /// Sum of all response times in milliseconds.
    pub total_response_time_ms: u64,
    pub last_response_time_ms: u64,
    /// Length of the last non-empty response.
    pub last_frame_len: usize,
    /// Leading bytes of the last non-empty response, hex encoded.
    pub last_hex_dump: String,
}

impl PollStats {
    /// Accounts one completed cycle.
    pub fn record_cycle(&mut self, response_time_ms: u64) {
        self.total_polls += 1;
        self.total_response_time_ms = self
            .total_response_time_ms
            .saturating_add(response_time_ms);
        self.last_response_time_ms = response_time_ms;
    }

    pub fn record_frame(&mut self, frame: &[u8]) {
        self.last_frame_len = frame.len();
        self.last_hex_dump = crate::protocol::hex_dump(frame, HEX_DUMP_BYTES);
    }

    pub fn record_success(&mut self) {
        self.successful_polls += 1;
    }

    /// Mean response time, or 0 before the first cycle.
    pub fn average_response_time_ms(&self) -> u64 {
        self.total_response_time_ms
            .checked_div(self.total_polls)
            .unwrap_or(0)
    }

    /// Share of successful cycles in percent, or 0 before the first cycle.
    pub fn success_rate(&self) -> f64 {
        if self.total_polls == 0 {
            0.0
        } else {
            self.successful_polls as f64 * 100.0 / self.total_polls as f64
        }
    }
}
