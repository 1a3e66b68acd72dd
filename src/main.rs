//! M-Bus Gas Meter Gateway CLI
//!
//! A command-line interface (CLI) application that polls a gas meter over a
//! wired M-Bus (via a serial level converter) and republishes its readings.
//!
//! This tool allows users to:
//! - Run a daemon that polls the meter periodically and publishes volume,
//!   energy and diagnostics either to the console or to an MQTT broker
//!   (including Home Assistant discovery).
//! - Poll the meter once and display the decoded volume.
//! - Decode a captured response frame offline.
//! - Inspect or clear the persisted measurement history.
//! - Inspect and change the persisted gateway configuration.
//!
//! The CLI leverages the `gasmeter_lib` crate for the protocol and the gateway core.

use anyhow::{Context, Result, bail};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use gasmeter_lib::{
    config::{ConfigUpdate, GatewayConfig},
    gateway::{CycleOutcome, GatewayCore, Io},
    history::{DEFAULT_CAPACITY, MeasurementHistory},
    poll::{DEFAULT_BUFFER_CAPACITY, PollStateMachine},
    protocol::{self as proto, DecodeMode},
    publish::Topics,
    serial::SerialTransport,
    stats::HEX_DUMP_BYTES,
    store::{FileStore, MemoryStore},
    traits::SystemClock,
};
use log::*;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, UNIX_EPOCH};
use std::panic;

mod commandline;
mod daemon;
mod host;
mod mqtt;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

fn open_store(data_dir: &Path) -> Result<FileStore> {
    FileStore::open(data_dir)
        .with_context(|| format!("Cannot open data directory {}", data_dir.display()))
}

fn open_transport(args: &commandline::CliArgs) -> Result<SerialTransport> {
    info!(
        "Opening M-Bus on {} (Address: {}, Baud: {})...",
        args.device, args.address, args.baud_rate
    );
    SerialTransport::open(&args.device, &args.baud_rate).with_context(|| {
        format!(
            "Cannot open serial port {} at baud {}",
            args.device, args.baud_rate
        )
    })
}

fn poll_state_machine(args: &commandline::CliArgs) -> PollStateMachine {
    PollStateMachine::new(
        proto::RequestFrame::req_ud2(args.address),
        args.timeout,
        DEFAULT_BUFFER_CAPACITY,
    )
}

fn decode_mode(strict: bool) -> DecodeMode {
    if strict {
        DecodeMode::Strict
    } else {
        DecodeMode::Lenient
    }
}

/// Wall-clock timestamps are shown as RFC 3339, uptime timestamps as duration.
fn format_timestamp(timestamp: u64) -> String {
    const EPOCH_SECONDS_2001: u64 = 1_000_000_000;
    if timestamp >= EPOCH_SECONDS_2001 {
        humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_secs(timestamp)).to_string()
    } else {
        format!(
            "{} after start",
            humantime::format_duration(Duration::from_millis(timestamp))
        )
    }
}

fn print_config(config: &GatewayConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(config).with_context(|| "Cannot format configuration")?;
    print!("{yaml}");
    Ok(())
}

/// Polls the meter once, without publishing or persisting anything.
fn handle_read(args: &commandline::CliArgs) -> Result<()> {
    let mut transport = open_transport(args)?;
    let mut core = GatewayCore::new(GatewayConfig::default(), poll_state_machine(args))
        .with_decode_mode(decode_mode(args.strict));
    let clock = SystemClock::new();
    let mut broker = daemon::DiscardBroker;
    let mut store = MemoryStore::default();
    let link = host::HostLink::new(None);
    let mut io = Io {
        transport: &mut transport,
        clock: &clock,
        broker: &mut broker,
        store: &mut store,
        link: &link,
    };

    core.trigger_poll(&mut io);
    let outcome = loop {
        if let Some(outcome) = core.tick(&mut io) {
            break outcome;
        }
        std::thread::sleep(daemon::TICK);
    };

    let stats = core.poll_stats();
    match outcome {
        CycleOutcome::Reading { reading, .. } => {
            println!("Volume: {:.3} m³", reading.volume);
            println!(
                "Response: {} bytes in {} ms",
                stats.last_frame_len, stats.last_response_time_ms
            );
            println!("Raw data: {}", stats.last_hex_dump);
            Ok(())
        }
        CycleOutcome::DecodeFailed(error) => {
            bail!("{error}, received: {}", stats.last_hex_dump)
        }
        CycleOutcome::Timeout => bail!(
            "No response from meter at address {} within {}",
            args.address,
            humantime::format_duration(args.timeout)
        ),
    }
}

fn handle_decode(frame: &[u8], strict: bool) -> Result<()> {
    info!("Executing: Decode {} byte frame", frame.len());
    let volume = proto::decode_volume(frame, decode_mode(strict))
        .with_context(|| format!("Cannot decode {}", proto::hex_dump(frame, HEX_DUMP_BYTES)))?;
    println!("Volume: {volume:.3} m³");
    Ok(())
}

fn handle_history(data_dir: &Path) -> Result<()> {
    let store = open_store(data_dir)?;
    let history = MeasurementHistory::load(&store, DEFAULT_CAPACITY);
    if history.is_empty() {
        println!("No readings stored.");
        return Ok(());
    }
    for reading in history.iter() {
        println!(
            "{:<28} {:>12.3} m³",
            format_timestamp(reading.timestamp),
            reading.volume
        );
    }
    println!("{} of {} readings", history.len(), history.capacity());
    Ok(())
}

fn handle_clear_history(data_dir: &Path) -> Result<()> {
    let mut store = open_store(data_dir)?;
    if !Confirm::new()
        .with_prompt("Delete all persisted readings?")
        .default(false)
        .show_default(true)
        .interact()?
    {
        info!("Clearing history aborted by user.");
        return Ok(());
    }
    MeasurementHistory::default()
        .save(&mut store)
        .with_context(|| "Cannot clear history")?;
    println!("History cleared.");
    Ok(())
}

fn handle_set_config(data_dir: &Path, command: &commandline::CliCommands) -> Result<()> {
    let commandline::CliCommands::SetConfig {
        json,
        poll_interval,
        calorific_value,
        correction_factor,
        topic,
    } = command
    else {
        unreachable!("Only called for SetConfig");
    };

    let mut update = match json {
        Some(document) => ConfigUpdate::from_json(document)
            .with_context(|| "Invalid JSON configuration document")?,
        None => ConfigUpdate::default(),
    };
    if let Some(poll_interval) = poll_interval {
        update.poll_interval = Some(poll_interval.as_secs());
    }
    if calorific_value.is_some() {
        update.calorific_value = *calorific_value;
    }
    if correction_factor.is_some() {
        update.correction_factor = *correction_factor;
    }
    if topic.is_some() {
        update.topic.clone_from(topic);
    }

    let mut store = open_store(data_dir)?;
    let mut core = GatewayCore::load(&store, PollStateMachine::default());
    let config = core
        .apply_config(&update, &mut store)
        .with_context(|| "Cannot save configuration")?;
    print_config(config)
}

fn handle_daemon(args: &commandline::CliArgs) -> Result<()> {
    let commandline::CliCommands::Daemon {
        poll_interval,
        interface,
        output,
    } = &args.command
    else {
        unreachable!("Only called for Daemon");
    };

    let mut store = open_store(&args.data_dir)?;
    let mut core = GatewayCore::load(&store, poll_state_machine(args))
        .with_decode_mode(decode_mode(args.strict));
    if let Some(poll_interval) = poll_interval {
        let update = ConfigUpdate {
            poll_interval: Some(poll_interval.as_secs()),
            ..Default::default()
        };
        core.apply_config(&update, &mut store)
            .with_context(|| "Cannot save poll interval")?;
    }
    info!(
        "Starting daemon mode: output={output:?}, interval={}",
        humantime::format_duration(core.config().poll_interval)
    );

    let mut transport = open_transport(args)?;
    let mut link = host::HostLink::new(interface.clone());

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
        trace!("Received Ctrl-C")
    })
    .with_context(|| "Error setting Ctrl-C handler")?;

    match output {
        commandline::DaemonOutput::Console => daemon::run(
            &running,
            &mut core,
            &mut transport,
            &mut store,
            &mut daemon::ConsoleBroker,
            &mut link,
        ),
        commandline::DaemonOutput::Mqtt { config_file } => {
            let config = mqtt::MqttConfig::load(config_file)?;
            trace!("MQTT config: {config:?}");
            let mut broker =
                mqtt::MqttBroker::connect(&config, Topics::new(&core.config().topic))?;
            daemon::run(
                &running,
                &mut core,
                &mut transport,
                &mut store,
                &mut broker,
                &mut link,
            )?;
            broker.go_offline()
        }
    }
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "M-Bus gas meter gateway started. Log level: {}",
        args.verbose.log_level_filter()
    );

    match &args.command {
        commandline::CliCommands::Daemon { .. } => handle_daemon(&args)?,
        commandline::CliCommands::Read => {
            info!("Executing: Read Volume");
            handle_read(&args)?;
        }
        commandline::CliCommands::Decode { frame } => handle_decode(&frame.0, args.strict)?,
        commandline::CliCommands::History => handle_history(&args.data_dir)?,
        commandline::CliCommands::ClearHistory => handle_clear_history(&args.data_dir)?,
        commandline::CliCommands::Config => {
            let store = open_store(&args.data_dir)?;
            print_config(&GatewayConfig::load(&store))?;
        }
        command @ commandline::CliCommands::SetConfig { .. } => {
            handle_set_config(&args.data_dir, command)?
        }
    }

    Ok(())
}
