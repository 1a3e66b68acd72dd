//! A library for polling an M-Bus gas meter and republishing its readings.
//!
//! The crate is built around [`gateway::GatewayCore`], a single-threaded
//! aggregate that a host drives with a periodic tick. Each tick advances the
//! poll state machine by one non-blocking step; a completed poll cycle is
//! decoded, published and appended to a bounded, persisted history.
//!
//! All outside effects go through the capability traits in [`traits`], so the
//! same core runs against a serial port and an MQTT broker in the `gasgw`
//! daemon and against the doubles in [`mock`] in tests.
//!
//! ## Features
//!
//! - **Protocol**: REQ_UD2 request frames and the BCD volume decoder (lenient or strict).
//! - **Poll State Machine**: Timeout and buffer bounded request/response cycles.
//! - **Measurement History**: FIFO of the last 50 readings, validated when restored.
//! - **Statistics**: Poll success rate, response times and per-kind error counters.
//! - **Publishing**: Volume, energy and diagnostics topics plus Home Assistant discovery.
//! - **Configuration**: Range checked tunables with a replace-with-default policy.
//!
//! ## Quick Start
//!
//! ```
//! use gasmeter_lib::{
//!     config::GatewayConfig,
//!     gateway::{CycleOutcome, GatewayCore, Io},
//!     mock::{FixedLink, ManualClock, MockTransport, RecordingBroker},
//!     poll::PollStateMachine,
//!     store::MemoryStore,
//! };
//!
//! let mut transport = MockTransport::replying(&[0x68, 0x0C, 0x13, 0x12, 0x34, 0x56, 0x07, 0x16]);
//! let clock = ManualClock::new(0);
//! let mut broker = RecordingBroker::default();
//! let mut store = MemoryStore::default();
//! let link = FixedLink::default();
//! let mut io = Io {
//!     transport: &mut transport,
//!     clock: &clock,
//!     broker: &mut broker,
//!     store: &mut store,
//!     link: &link,
//! };
//!
//! let mut core = GatewayCore::new(GatewayConfig::default(), PollStateMachine::default());
//! assert_eq!(core.tick(&mut io), None); // request sent
//! clock.advance(500);
//! let outcome = core.tick(&mut io);
//! assert!(matches!(outcome, Some(CycleOutcome::Reading { .. })));
//! assert_eq!(core.current().map(|r| r.volume), Some(7563.412));
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod history;
pub mod log_buffer;
pub mod mock;
pub mod poll;
pub mod protocol;
pub mod publish;
pub mod stats;
pub mod store;
pub mod traits;

#[cfg_attr(docsrs, doc(cfg(feature = "serial")))]
#[cfg(feature = "serial")]
pub mod serial;

pub use error::{Error, Result};
