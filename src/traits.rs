//! Capabilities the gateway core consumes from its host.
//!
//! The core never opens ports, sockets or files itself. Everything with an
//! outside effect is reached through one of these traits so the same core runs
//! against a real serial line and broker in the daemon and against the doubles
//! in [`crate::mock`] in tests.
use std::io;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Half-duplex serial bus the meter is attached to.
pub trait Transport {
    /// Sends a complete frame.
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
    /// Number of received bytes that can be read without blocking.
    fn available_bytes(&mut self) -> io::Result<usize>;
    /// Reads one byte. Only called after `available_bytes` reported data.
    fn read_byte(&mut self) -> io::Result<u8>;
}

/// Time source of the gateway.
pub trait Clock {
    /// Monotonic milliseconds since an arbitrary origin.
    fn now_ms(&self) -> u64;
    /// Wall-clock seconds since the Unix epoch, if the time is known.
    fn wall_seconds(&self) -> Option<u64>;
}

/// Message broker the readings are published to.
pub trait Broker {
    /// Publishes `payload` on `topic`. Returns `false` if the broker did not
    /// accept the message.
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> bool;
    fn is_connected(&self) -> bool;
}

/// Upstream network link (e.g. the WLAN station interface).
pub trait NetworkLink {
    /// Whether the link is established.
    fn is_ready(&self) -> bool;
    /// Link quality metric published next to each reading (RSSI in dBm).
    fn quality(&self) -> i32;
}

/// Blob storage surviving restarts.
pub trait KeyValueStore {
    /// Returns the blob stored under `key`, or `None` if nothing was stored yet.
    fn get_blob(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
    /// Replaces the blob stored under `key`.
    fn put_blob(&mut self, key: &str, value: &[u8]) -> io::Result<()>;
}

/// [`Clock`] backed by the operating system.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn wall_seconds(&self) -> Option<u64> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|elapsed| elapsed.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let first = clock.now_ms();
        let second = clock.now_ms();
        assert!(second >= first);
        assert!(clock.wall_seconds().is_some_and(|secs| secs > 0));
    }
}
