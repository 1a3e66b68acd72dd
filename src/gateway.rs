//! The gateway aggregate driven by the host's scheduler loop.
//!
//! [`GatewayCore`] owns all mutable state of the acquisition pipeline. The host
//! calls [`GatewayCore::tick`] repeatedly and passes its collaborators in an
//! [`Io`] bundle on every call, so the core itself holds no handles and never
//! blocks. One tick performs at most one bounded poll step plus the follow-up
//! work of a completed cycle (decode, publish, append, persist).
use crate::{
    config::{ConfigUpdate, GatewayConfig},
    error::Result,
    history::{MeasurementHistory, Reading, DEFAULT_CAPACITY},
    log_buffer::{LogBuffer, LogEntry},
    poll::{CompletedCycle, PollState, PollStateMachine, TriggerResult},
    protocol::{self, DecodeMode},
    publish::{self, Diagnostics, PublishOutcome},
    stats::{ErrorKind, ErrorStats, PollStats},
    traits::{Broker, Clock, KeyValueStore, NetworkLink, Transport},
};
use serde::Serialize;

/// The history is persisted after this many successful readings.
pub const PERSIST_EVERY: u32 = 10;

/// Below this much free memory the live log is trimmed.
pub const LOW_MEMORY_BYTES: usize = 10 * 1024;
/// Below this much free memory the history is trimmed as well.
pub const VERY_LOW_MEMORY_BYTES: usize = 5 * 1024;
/// Below this much free memory the history is persisted unconditionally.
pub const CRITICAL_MEMORY_BYTES: usize = 3 * 1024;
/// Number of oldest entries dropped per relief step.
pub const RELIEF_STEP: usize = 10;
const LOG_RELIEF_MIN_LEN: usize = 20;
const HISTORY_RELIEF_MIN_LEN: usize = 30;

/// Collaborators lent to the core for one call.
pub struct Io<'a> {
    pub transport: &'a mut dyn Transport,
    pub clock: &'a dyn Clock,
    pub broker: &'a mut dyn Broker,
    pub store: &'a mut dyn KeyValueStore,
    pub link: &'a dyn NetworkLink,
}

/// What a completed poll cycle produced.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No byte arrived in the response window.
    Timeout,
    /// Bytes arrived but held no volume record.
    DecodeFailed(protocol::Error),
    /// A reading was decoded and stored; `publish` tells how far it got.
    Reading {
        reading: Reading,
        publish: PublishOutcome,
    },
}

/// Entries removed by [`GatewayCore::relieve_memory_pressure`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryRelief {
    pub log_entries: usize,
    pub readings: usize,
    pub persisted: bool,
}

/// Read-only view for presentation layers.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub state: PollState,
    pub current: Option<Reading>,
    pub history: Vec<Reading>,
    pub poll: PollStats,
    pub average_response_time_ms: u64,
    pub success_rate: f64,
    pub errors: ErrorStats,
    pub config: GatewayConfig,
    pub log: Vec<LogEntry>,
}

#[derive(Debug)]
pub struct GatewayCore {
    config: GatewayConfig,
    poll: PollStateMachine,
    decode_mode: DecodeMode,
    history: MeasurementHistory,
    poll_stats: PollStats,
    errors: ErrorStats,
    log: LogBuffer,
    readings_since_persist: u32,
    link_ready: bool,
}

impl GatewayCore {
    /// Creates a core with an empty history.
    pub fn new(config: GatewayConfig, poll: PollStateMachine) -> Self {
        Self {
            config: config.validate(),
            poll,
            decode_mode: DecodeMode::default(),
            history: MeasurementHistory::default(),
            poll_stats: PollStats::default(),
            errors: ErrorStats::default(),
            log: LogBuffer::default(),
            readings_since_persist: 0,
            link_ready: false,
        }
    }

    /// Creates a core from the configuration and history persisted in `store`.
    pub fn load(store: &dyn KeyValueStore, poll: PollStateMachine) -> Self {
        let mut core = Self::new(GatewayConfig::load(store), poll);
        core.history = MeasurementHistory::load(store, DEFAULT_CAPACITY);
        core
    }

    pub fn with_decode_mode(mut self, mode: DecodeMode) -> Self {
        self.decode_mode = mode;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn history(&self) -> &MeasurementHistory {
        &self.history
    }

    pub fn current(&self) -> Option<&Reading> {
        self.history.latest()
    }

    pub fn poll_stats(&self) -> &PollStats {
        &self.poll_stats
    }

    pub fn errors(&self) -> &ErrorStats {
        &self.errors
    }

    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    pub fn state(&self) -> PollState {
        self.poll.state()
    }

    /// Runs one scheduler step. Returns the outcome of a cycle completed in
    /// this step, if any.
    pub fn tick(&mut self, io: &mut Io<'_>) -> Option<CycleOutcome> {
        let now_ms = io.clock.now_ms();
        self.observe_link(io.link.is_ready(), now_ms);

        let before = self.poll.state();
        let cycle = self.poll.step(
            now_ms,
            self.config.poll_interval,
            &mut *io.transport,
            &mut self.poll_stats,
        );
        if before == PollState::Idle && self.poll.state() == PollState::AwaitingResponse {
            self.log.push(now_ms, "M-Bus: poll started");
        }
        cycle.map(|cycle| self.finish_cycle(cycle, io, now_ms))
    }

    /// Starts a poll cycle now, unless one is running.
    pub fn trigger_poll(&mut self, io: &mut Io<'_>) -> TriggerResult {
        let now_ms = io.clock.now_ms();
        let result = self.poll.trigger(now_ms, &mut *io.transport);
        match result {
            TriggerResult::Triggered => self.log.push(now_ms, "M-Bus: manual poll started"),
            TriggerResult::Busy => log::debug!("Manual poll rejected, cycle in progress"),
        }
        result
    }

    /// Merges `update` into the configuration and persists the result.
    ///
    /// The merged configuration is active even if persisting it fails.
    pub fn apply_config(
        &mut self,
        update: &ConfigUpdate,
        store: &mut dyn KeyValueStore,
    ) -> Result<&GatewayConfig> {
        self.config = self.config.merge(update);
        log::info!(
            "Configuration applied, publishing to {}",
            self.config.topic
        );
        self.config.save(store)?;
        Ok(&self.config)
    }

    /// Zeroes the error counters.
    pub fn reset_errors(&mut self) {
        self.errors.reset();
        log::info!("Error counters reset");
    }

    /// Records a lost upstream link reported by the host.
    pub fn record_link_loss(&mut self, message: impl Into<String>, now_ms: u64) {
        self.errors.record(ErrorKind::LinkLoss, message, now_ms);
    }

    /// Records a transport failure of the broker connection.
    pub fn record_publish_error(&mut self, message: impl Into<String>, now_ms: u64) {
        self.errors.record(ErrorKind::Publish, message, now_ms);
    }

    pub fn shrink_history(&mut self, target: usize) -> usize {
        self.history.shrink(target)
    }

    pub fn shrink_log(&mut self, target: usize) -> usize {
        self.log.shrink(target)
    }

    /// Writes the history to the store right away.
    pub fn force_persist(&mut self, store: &mut dyn KeyValueStore) -> Result<()> {
        self.history.save(store)?;
        self.readings_since_persist = 0;
        Ok(())
    }

    /// Frees memory according to the reported free heap.
    pub fn relieve_memory_pressure(
        &mut self,
        free_bytes: usize,
        store: &mut dyn KeyValueStore,
    ) -> Result<MemoryRelief> {
        let mut relief = MemoryRelief::default();
        if free_bytes < LOW_MEMORY_BYTES {
            log::warn!("Low memory: {free_bytes} bytes free");
            if self.log.len() > LOG_RELIEF_MIN_LEN {
                relief.log_entries = self.log.shrink(self.log.len() - RELIEF_STEP);
            }
            if free_bytes < VERY_LOW_MEMORY_BYTES && self.history.len() > HISTORY_RELIEF_MIN_LEN {
                relief.readings = self.history.shrink(self.history.len() - RELIEF_STEP);
                relief.persisted = true;
            }
        }
        if free_bytes < CRITICAL_MEMORY_BYTES {
            log::error!("Critically low memory: {free_bytes} bytes free");
            relief.persisted = true;
        }
        if relief.persisted {
            self.force_persist(store)?;
        }
        Ok(relief)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.poll.state(),
            current: self.history.latest().copied(),
            history: self.history.to_vec(),
            poll: self.poll_stats.clone(),
            average_response_time_ms: self.poll_stats.average_response_time_ms(),
            success_rate: self.poll_stats.success_rate(),
            errors: self.errors.clone(),
            config: self.config.clone(),
            log: self.log.iter().cloned().collect(),
        }
    }

    fn observe_link(&mut self, ready: bool, now_ms: u64) {
        if self.link_ready && !ready {
            self.record_link_loss("Network link lost", now_ms);
        } else if !self.link_ready && ready {
            log::info!("Network link ready");
        }
        self.link_ready = ready;
    }

    fn finish_cycle(&mut self, cycle: CompletedCycle, io: &mut Io<'_>, now_ms: u64) -> CycleOutcome {
        if cycle.frame.is_empty() {
            let message = match cycle.write_error {
                Some(error) => format!("No response from meter, request not sent: {error}"),
                None => format!("No response from meter within {} ms", cycle.response_time_ms),
            };
            self.errors.record(ErrorKind::BusTimeout, message, now_ms);
            self.log.push(now_ms, "M-Bus: timeout");
            return CycleOutcome::Timeout;
        }

        self.poll_stats.record_frame(&cycle.frame);
        self.log.push(
            now_ms,
            format!(
                "M-Bus: response received ({} bytes, {} ms): {}",
                cycle.frame.len(),
                cycle.response_time_ms,
                self.poll_stats.last_hex_dump
            ),
        );

        let volume = match protocol::decode_volume(&cycle.frame, self.decode_mode) {
            Ok(volume) => volume,
            Err(error) => {
                self.errors.record(ErrorKind::DecodeFailure, error.to_string(), now_ms);
                return CycleOutcome::DecodeFailed(error);
            }
        };
        self.poll_stats.record_success();

        let reading = Reading::new(io.clock.wall_seconds().unwrap_or(now_ms), volume);
        let diagnostics = Diagnostics {
            link_quality: io.link.quality(),
            success_rate: self.poll_stats.success_rate(),
        };
        let publish = publish::on_reading(
            &reading,
            &self.config,
            diagnostics,
            &mut *io.broker,
            &mut self.errors,
            now_ms,
        );
        if publish.is_success() {
            self.log.push(now_ms, format!("Reading published: {volume:.2} m³"));
        }

        self.history.append(reading);
        self.readings_since_persist += 1;
        if self.readings_since_persist >= PERSIST_EVERY {
            match self.force_persist(&mut *io.store) {
                Ok(()) => log::debug!("History persisted"),
                Err(error) => {
                    log::error!("Cannot persist history: {error}");
                    self.log.push(now_ms, format!("History not persisted: {error}"));
                }
            }
        }

        CycleOutcome::Reading { reading, publish }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        history::HISTORY_KEY,
        mock::{FixedLink, ManualClock, MockTransport, RecordingBroker},
        store::MemoryStore,
    };
    use assert_matches::assert_matches;
    use std::time::Duration;

    const METER_FRAME: [u8; 11] = [
        0x68, 0x05, 0x05, 0x68, 0x08, 0x0C, 0x13, 0x12, 0x34, 0x56, 0x07,
    ];

    #[derive(Default)]
    struct Harness {
        transport: MockTransport,
        clock: ManualClock,
        broker: RecordingBroker,
        store: MemoryStore,
        link: FixedLink,
    }

    impl Harness {
        fn replying(frame: &[u8]) -> Self {
            Self {
                transport: MockTransport::replying(frame),
                ..Default::default()
            }
        }

        fn io(&mut self) -> Io<'_> {
            Io {
                transport: &mut self.transport,
                clock: &self.clock,
                broker: &mut self.broker,
                store: &mut self.store,
                link: &self.link,
            }
        }

        /// Runs ticks 10 ms apart until a cycle completes.
        fn run_cycle(&mut self, core: &mut GatewayCore) -> CycleOutcome {
            loop {
                if let Some(outcome) = core.tick(&mut self.io()) {
                    return outcome;
                }
                self.clock.advance(10);
            }
        }
    }

    fn core() -> GatewayCore {
        GatewayCore::new(GatewayConfig::default(), PollStateMachine::default())
    }

    #[test]
    fn end_to_end_reading() {
        let mut harness = Harness::replying(&METER_FRAME);
        let mut core = core();

        assert_eq!(core.tick(&mut harness.io()), None);
        assert_eq!(harness.transport.sent_frames(), [vec![0x10, 0x5B, 0x00, 0x5B, 0x16]]);

        harness.clock.set(10);
        assert_eq!(core.tick(&mut harness.io()), None);
        harness.clock.set(500);
        let outcome = core.tick(&mut harness.io());
        assert_matches!(
            outcome,
            Some(CycleOutcome::Reading { reading, publish: PublishOutcome::Published })
                if reading.volume == 7563.412 && reading.timestamp == 500
        );

        assert_eq!(harness.broker.payload("gasmeter/consumption"), Some("7563.41"));
        assert_eq!(harness.broker.payload("gasmeter/consumption_energy"), Some("75634.1"));
        assert_eq!(harness.broker.payload("gasmeter/consumption_wifi"), Some("-60"));
        assert_eq!(harness.broker.payload("gasmeter/consumption_mbus_rate"), Some("100.0"));
        assert_eq!(core.current().map(|r| r.volume), Some(7563.412));
        assert_eq!(core.poll_stats().successful_polls, 1);
        assert_eq!(core.poll_stats().last_frame_len, METER_FRAME.len());
        assert_eq!(core.state(), PollState::Idle);
        assert_eq!(core.errors().total(), 0);
    }

    #[test]
    fn silent_meter_counts_timeout() {
        let mut harness = Harness::default();
        let mut core = core();

        let outcome = harness.run_cycle(&mut core);
        assert_eq!(outcome, CycleOutcome::Timeout);
        assert_eq!(core.poll_stats().total_polls, 1);
        assert_eq!(core.errors().bus_timeouts, 1);
        assert_eq!(core.state(), PollState::Idle);
        assert!(core.history().is_empty());
        assert!(harness.broker.published().is_empty());
    }

    #[test]
    fn unreadable_response_counts_decode_failure() {
        let mut harness = Harness::replying(&[0xE5]);
        let mut core = core();

        let outcome = harness.run_cycle(&mut core);
        assert_matches!(outcome, CycleOutcome::DecodeFailed(protocol::Error::MarkerNotFound(1)));
        assert_eq!(core.errors().decode_failures, 1);
        assert_eq!(core.poll_stats().successful_polls, 0);
        assert_eq!(core.poll_stats().last_hex_dump, "E5");
    }

    #[test]
    fn strict_mode_rejects_bad_digits() {
        let mut harness = Harness::replying(&[0x0C, 0x13, 0x1A, 0x00, 0x00, 0x00]);
        let mut core = core().with_decode_mode(DecodeMode::Strict);
        assert_matches!(
            harness.run_cycle(&mut core),
            CycleOutcome::DecodeFailed(protocol::Error::InvalidBcdDigit { .. })
        );
    }

    #[test]
    fn write_failure_is_reported_as_timeout() {
        let mut harness = Harness::default();
        harness.transport.set_fail_writes(true);
        let mut core = core();

        assert_eq!(harness.run_cycle(&mut core), CycleOutcome::Timeout);
        assert_matches!(
            &core.errors().last_error,
            Some(e) if e.kind == ErrorKind::BusTimeout && e.message.contains("port closed")
        );
    }

    #[test]
    fn wall_clock_timestamps_readings() {
        let mut harness = Harness::replying(&METER_FRAME);
        harness.clock.set_wall_origin(Some(1_700_000_000));
        let mut core = core();

        assert_matches!(
            harness.run_cycle(&mut core),
            CycleOutcome::Reading { reading, .. } if reading.timestamp == 1_700_000_000
        );
    }

    #[test]
    fn history_is_persisted_every_tenth_reading() {
        let mut harness = Harness::replying(&METER_FRAME);
        harness.clock.set(1);
        let mut core = core();
        let interval = core.config().poll_interval.as_millis() as u64;

        for reading in 1..=10 {
            assert_matches!(harness.run_cycle(&mut core), CycleOutcome::Reading { .. });
            assert_eq!(harness.store.contains(HISTORY_KEY), reading == 10);
            harness.clock.advance(interval);
        }
        let restored = MeasurementHistory::load(&harness.store, DEFAULT_CAPACITY);
        assert_eq!(restored.len(), 10);
    }

    #[test]
    fn broker_offline_still_stores_reading() {
        let mut harness = Harness::replying(&METER_FRAME);
        harness.broker.set_connected(false);
        let mut core = core();

        assert_matches!(
            harness.run_cycle(&mut core),
            CycleOutcome::Reading { publish: PublishOutcome::NotPublished, .. }
        );
        assert_eq!(core.errors().publish_failures, 1);
        assert_eq!(core.history().len(), 1);
    }

    #[test]
    fn link_loss_is_counted_once_per_transition() {
        let mut harness = Harness::default();
        let mut core = core();

        core.tick(&mut harness.io());
        harness.link.ready = false;
        harness.clock.advance(10);
        core.tick(&mut harness.io());
        harness.clock.advance(10);
        core.tick(&mut harness.io());
        assert_eq!(core.errors().link_losses, 1);

        harness.link.ready = true;
        core.tick(&mut harness.io());
        harness.link.ready = false;
        core.tick(&mut harness.io());
        assert_eq!(core.errors().link_losses, 2);
    }

    #[test]
    fn manual_trigger_while_busy() {
        let mut harness = Harness::default();
        let mut core = core();

        harness.clock.set(100);
        assert_eq!(core.trigger_poll(&mut harness.io()), TriggerResult::Triggered);
        harness.clock.set(200);
        assert_eq!(core.trigger_poll(&mut harness.io()), TriggerResult::Busy);
        assert_eq!(harness.transport.sent_frames().len(), 1);

        // The cycle still ends 500 ms after the first trigger.
        harness.clock.set(599);
        assert_eq!(core.tick(&mut harness.io()), None);
        harness.clock.set(600);
        assert_eq!(core.tick(&mut harness.io()), Some(CycleOutcome::Timeout));
    }

    #[test]
    fn apply_config_validates_and_persists() {
        let mut store = MemoryStore::default();
        let mut core = core();
        let update = ConfigUpdate::from_json(r#"{"poll_interval": 1, "gas_calorific": 11.0}"#).unwrap();

        let applied = core.apply_config(&update, &mut store).unwrap();
        assert_eq!(applied.poll_interval, Duration::from_secs(30));
        assert_eq!(applied.calorific_value, 11.0);
        assert_eq!(GatewayConfig::load(&store).calorific_value, 11.0);

        store.set_fail_writes(true);
        let update = ConfigUpdate::from_json(r#"{"mqtt_topic": "home/gas"}"#).unwrap();
        assert!(core.apply_config(&update, &mut store).is_err());
        assert_eq!(core.config().topic, "home/gas");
    }

    #[test]
    fn load_restores_persisted_state() {
        let mut store = MemoryStore::default();
        let mut history = MeasurementHistory::default();
        history.append(Reading::new(1_700_000_000, 1234.5));
        history.save(&mut store).unwrap();
        GatewayConfig {
            topic: "meter/gas".to_string(),
            ..Default::default()
        }
        .save(&mut store)
        .unwrap();

        let core = GatewayCore::load(&store, PollStateMachine::default());
        assert_eq!(core.config().topic, "meter/gas");
        assert_eq!(core.current().map(|r| r.volume), Some(1234.5));
    }

    #[test]
    fn reset_errors_keeps_poll_stats() {
        let mut harness = Harness::default();
        let mut core = core();
        harness.run_cycle(&mut core);
        core.reset_errors();
        assert_eq!(core.errors().total(), 0);
        assert!(core.errors().last_error.is_some());
        assert_eq!(core.poll_stats().total_polls, 1);
    }

    #[test]
    fn memory_pressure_relief() {
        let mut store = MemoryStore::default();
        let mut core = core();
        for i in 1..=40 {
            core.history.append(Reading::new(i, i as f64));
        }
        for i in 0..30 {
            core.log.push(i, "event");
        }

        let relief = core.relieve_memory_pressure(64 * 1024, &mut store).unwrap();
        assert_eq!(relief, MemoryRelief::default());

        let relief = core.relieve_memory_pressure(8 * 1024, &mut store).unwrap();
        assert_eq!(relief.log_entries, 10);
        assert_eq!(relief.readings, 0);
        assert!(!store.contains(HISTORY_KEY));

        let relief = core.relieve_memory_pressure(4 * 1024, &mut store).unwrap();
        assert_eq!(relief.log_entries, 0);
        assert_eq!(relief.readings, 10);
        assert!(relief.persisted);
        assert_eq!(MeasurementHistory::load(&store, DEFAULT_CAPACITY).len(), 30);
    }

    #[test]
    fn shrink_and_force_persist() {
        let mut store = MemoryStore::default();
        let mut core = core();
        for i in 1..=20 {
            core.history.append(Reading::new(i, 1.0));
        }
        assert_eq!(core.shrink_history(5), 15);
        core.force_persist(&mut store).unwrap();
        assert_eq!(MeasurementHistory::load(&store, DEFAULT_CAPACITY).len(), 5);

        store.set_fail_writes(true);
        assert!(core.force_persist(&mut store).is_err());
    }

    #[test]
    fn snapshot_serializes() {
        let mut harness = Harness::replying(&METER_FRAME);
        let mut core = core();
        harness.run_cycle(&mut core);

        let json = serde_json::to_value(core.snapshot()).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["current"]["volume"], 7563.412);
        assert_eq!(json["poll"]["total_polls"], 1);
        assert_eq!(json["config"]["poll_interval"], "30s");
        assert_eq!(json["success_rate"], 100.0);
    }
}
