use crate::mqtt::MqttConfig;
use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use gasmeter_lib::protocol as proto;
use std::path::PathBuf;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1") // Common default for Windows, though may vary.
    } else {
        String::from("/dev/ttyUSB0") // Common default for USB M-Bus level converters on Linux.
    }
}

fn parse_address(s: &str) -> Result<proto::Address, String> {
    let address_val =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid address format: {e}"))?;
    proto::Address::try_from(address_val).map_err(|e| e.to_string())
}

fn parse_baud_rate(s: &str) -> Result<proto::BaudRate, String> {
    let rate_val = s
        .parse::<u32>()
        .map_err(|e| format!("Invalid baud rate number format: {e}"))?;
    proto::BaudRate::try_from(rate_val).map_err(|e| e.to_string())
}

/// A captured frame given as hex digits, e.g. "68 0C 13 12 34 56 07 16".
#[derive(Debug, Clone, PartialEq)]
pub struct HexFrame(pub Vec<u8>);

fn parse_hex_frame(s: &str) -> Result<HexFrame, String> {
    let digits: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != ',')
        .collect();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(&digits);
    if digits.is_empty() {
        return Err(String::from("Expected hex digits, got none"));
    }
    hex::decode(digits)
        .map(HexFrame)
        .map_err(|e| format!("Invalid hex frame: {e}"))
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Print every published value to the standard output (console).
    Console,
    /// Publish the readings to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run in daemon mode: poll the meter periodically and publish every reading.
    /// Output can be directed to stdout or an MQTT broker.
    /// Stop with Ctrl-C; the history is persisted on exit.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Overrides the persisted poll interval (e.g., "30s", "2m").
        /// Allowed range is 10s to 5m, other values fall back to 30s.
        #[arg(value_parser = humantime::parse_duration, short, long, verbatim_doc_comment)]
        poll_interval: Option<Duration>,

        /// Network interface whose state and signal level are reported (e.g., "wlan0").
        #[arg(long)]
        interface: Option<String>,

        /// Specifies the output.
        #[command(subcommand)]
        output: DaemonOutput,
    },

    /// Poll the meter once and display the decoded volume.
    Read,

    /// Decode a captured response frame without accessing the bus.
    Decode {
        /// The frame as hex digits; spaces, colons and commas are ignored.
        #[arg(value_parser = parse_hex_frame)]
        frame: HexFrame,
    },

    /// Display the persisted measurement history.
    History,

    /// Delete all persisted readings.
    ClearHistory,

    /// Display the persisted gateway configuration.
    Config,

    /// Change the persisted gateway configuration.
    /// Values outside their allowed range are replaced by the default value.
    #[clap(verbatim_doc_comment)]
    SetConfig {
        /// A JSON document with the keys "poll_interval" (seconds),
        /// "gas_calorific", "gas_correction" and "mqtt_topic".
        /// Individual options below take precedence.
        #[arg(long, verbatim_doc_comment)]
        json: Option<String>,

        /// Poll interval (e.g., "30s", "1m"), allowed range 10s to 5m.
        #[arg(long, value_parser = humantime::parse_duration)]
        poll_interval: Option<Duration>,

        /// Gas calorific value in kWh/m³, allowed range 8.0 to 13.0.
        #[arg(long)]
        calorific_value: Option<f64>,

        /// Volume correction factor, allowed range 0.90 to 1.10.
        #[arg(long)]
        correction_factor: Option<f64>,

        /// Primary MQTT topic; derived topics get a suffix appended.
        #[arg(long)]
        topic: Option<String>,
    },
}

const fn about_text() -> &'static str {
    "M-Bus gas meter gateway - Poll a gas meter and publish its readings via MQTT."
}

#[derive(Parser, Debug)]
#[command(name="gasgw", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is off.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Serial port device name of the M-Bus level converter.
    /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
    #[arg(global = true, short, long, default_value_t = default_device_name(), verbatim_doc_comment)]
    pub device: String,

    /// Baud rate the meter is configured for.
    /// Supported values: 300, 2400, 9600.
    #[arg(global = true, long, default_value_t = proto::BaudRate::default(), value_parser = parse_baud_rate, verbatim_doc_comment)]
    pub baud_rate: proto::BaudRate,

    /// Primary M-Bus address of the meter (0 to 250, or 254 for broadcast).
    /// Can be specified in decimal or hexadecimal (e.g., "0xFE").
    #[arg(global = true, short, long, default_value_t = proto::Address::default(), value_parser = parse_address, verbatim_doc_comment)]
    pub address: proto::Address,

    /// Response window after the request frame was sent.
    /// Examples: "500ms", "1s".
    #[arg(global = true, long, default_value = "500ms", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,

    /// Directory holding the persisted configuration and history.
    #[arg(global = true, long, default_value = "gasgw-data")]
    pub data_dir: PathBuf,

    /// Reject responses containing BCD digits above 9.
    #[arg(global = true, long)]
    pub strict: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn hex_frames() {
        assert_eq!(
            parse_hex_frame("68 0C 13 12"),
            Ok(HexFrame(vec![0x68, 0x0C, 0x13, 0x12]))
        );
        assert_eq!(parse_hex_frame("0x0c13"), Ok(HexFrame(vec![0x0C, 0x13])));
        assert_eq!(parse_hex_frame("e5:16"), Ok(HexFrame(vec![0xE5, 0x16])));
        assert_matches!(parse_hex_frame("0C 1"), Err(_));
        assert_matches!(parse_hex_frame("ZZ"), Err(_));
        assert_matches!(parse_hex_frame(""), Err(_));
    }

    #[test]
    fn hex_frames_with_non_ascii_digits() {
        assert_matches!(parse_hex_frame("a\u{e9}b"), Err(_));
        assert_matches!(parse_hex_frame("0C \u{e9} 13"), Err(_));
        assert_matches!(parse_hex_frame("\u{ff10}\u{ff11}"), Err(_));
    }

    #[test]
    fn addresses_and_baud_rates() {
        assert_eq!(parse_address("0xFE"), Ok(proto::Address::BROADCAST));
        assert_eq!(parse_address("5").map(|a| *a), Ok(5));
        assert_matches!(parse_address("251"), Err(_));
        assert_eq!(parse_baud_rate("9600"), Ok(proto::BaudRate::B9600));
        assert_matches!(parse_baud_rate("19200"), Err(_));
    }

    #[test]
    fn global_options_after_subcommand() {
        let args = CliArgs::try_parse_from([
            "gasgw", "read", "--baud-rate", "300", "--address", "0x10", "--timeout", "1s",
        ])
        .unwrap();
        assert_eq!(args.command, CliCommands::Read);
        assert_eq!(args.baud_rate, proto::BaudRate::B300);
        assert_eq!(*args.address, 0x10);
        assert_eq!(args.timeout, Duration::from_secs(1));
    }
}
