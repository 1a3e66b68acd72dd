//! Scheduler loop driving the gateway core.
use crate::host::{self, HostLink};
use anyhow::{Context, Result};
use gasmeter_lib::{
    gateway::{CycleOutcome, GatewayCore, Io},
    publish::PublishOutcome,
    traits::{Broker, Clock, KeyValueStore, SystemClock, Transport},
};
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Scheduler period; bounds the latency of every poll step.
pub const TICK: Duration = Duration::from_millis(10);
const LINK_REFRESH_MS: u64 = 1_000;
const MEMORY_CHECK_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Lost,
    Reconnected,
    ReconnectFailed(String),
}

/// A broker the daemon keeps connected.
pub trait Uplink: Broker {
    /// Called once per tick; re-establishes the connection if needed.
    fn maintain(&mut self) -> Option<ConnectionEvent> {
        None
    }
}

/// Prints every message instead of sending it.
#[derive(Debug, Default)]
pub struct ConsoleBroker;

impl Broker for ConsoleBroker {
    fn publish(&mut self, topic: &str, payload: &str, _retain: bool) -> bool {
        println!("{topic}: {payload}");
        true
    }

    fn is_connected(&self) -> bool {
        true
    }
}

impl Uplink for ConsoleBroker {}

/// Accepts every message and drops it, for one-shot reads.
#[derive(Debug, Default)]
pub struct DiscardBroker;

impl Broker for DiscardBroker {
    fn publish(&mut self, topic: &str, _payload: &str, _retain: bool) -> bool {
        trace!("Discarding message for {topic}");
        true
    }

    fn is_connected(&self) -> bool {
        true
    }
}

pub fn run<U: Uplink>(
    running: &AtomicBool,
    core: &mut GatewayCore,
    transport: &mut dyn Transport,
    store: &mut dyn KeyValueStore,
    uplink: &mut U,
    link: &mut HostLink,
) -> Result<()> {
    let clock = SystemClock::new();
    let mut last_link_refresh = 0;
    let mut last_memory_check = 0;

    while running.load(Ordering::SeqCst) {
        let now_ms = clock.now_ms();
        if now_ms - last_link_refresh >= LINK_REFRESH_MS {
            link.refresh();
            last_link_refresh = now_ms;
        }

        match uplink.maintain() {
            Some(ConnectionEvent::Lost) => core.record_link_loss("Broker connection lost", now_ms),
            Some(ConnectionEvent::ReconnectFailed(error)) => {
                core.record_publish_error(format!("Broker reconnect failed: {error}"), now_ms)
            }
            Some(ConnectionEvent::Reconnected) => info!("Broker connection re-established"),
            None => {}
        }

        let mut io = Io {
            transport: &mut *transport,
            clock: &clock,
            broker: &mut *uplink,
            store: &mut *store,
            link: &*link,
        };
        if let Some(outcome) = core.tick(&mut io) {
            report(&outcome);
        }

        if now_ms - last_memory_check >= MEMORY_CHECK_MS {
            last_memory_check = now_ms;
            if let Some(free) = host::available_memory() {
                let relief = core
                    .relieve_memory_pressure(free, &mut *store)
                    .with_context(|| "Cannot persist history under memory pressure")?;
                if relief.log_entries > 0 || relief.readings > 0 {
                    warn!(
                        "Memory relief: dropped {} log entries and {} readings",
                        relief.log_entries, relief.readings
                    );
                }
            }
        }

        std::thread::sleep(TICK);
    }

    info!("Stopping, persisting history...");
    core.force_persist(store)
        .with_context(|| "Cannot persist history on shutdown")
}

fn report(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Timeout => debug!("Cycle ended without response"),
        CycleOutcome::DecodeFailed(error) => debug!("Cycle ended without reading: {error}"),
        CycleOutcome::Reading { reading, publish } => match publish {
            PublishOutcome::Published => debug!("Reading {:.3} m³ published", reading.volume),
            PublishOutcome::PartiallyPublished { failed } => {
                debug!("Reading {:.3} m³ published, failed topics: {failed:?}", reading.volume)
            }
            PublishOutcome::NotPublished => debug!("Reading {:.3} m³ kept locally", reading.volume),
        },
    }
}
