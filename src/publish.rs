//! Turns a decoded reading into broker messages.
//!
//! The publish sequence is fixed: volume on the primary topic, then energy,
//! link quality and poll success rate on the derived topics. Every message is
//! retained. Only the volume is essential; if it is refused nothing else is
//! sent, and failures of the derived topics are counted but do not fail the
//! reading. Nothing is retried within a cycle, the next reading will be
//! published on its own.
use crate::{
    config::GatewayConfig,
    history::Reading,
    stats::{ErrorKind, ErrorStats},
    traits::Broker,
};
use serde_json::json;

pub const AVAILABILITY_ONLINE: &str = "online";
pub const AVAILABILITY_OFFLINE: &str = "offline";

/// Prefix Home Assistant listens on for discovery documents.
pub const DISCOVERY_PREFIX: &str = "homeassistant";

/// All topics derived from the primary topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub volume: String,
    pub energy: String,
    pub link_quality: String,
    pub mbus_rate: String,
    pub availability: String,
}

impl Topics {
    pub fn new(primary: &str) -> Self {
        Self {
            volume: primary.to_string(),
            energy: format!("{primary}_energy"),
            link_quality: format!("{primary}_wifi"),
            mbus_rate: format!("{primary}_mbus_rate"),
            availability: format!("{primary}_availability"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Every message was accepted.
    Published,
    /// The volume was accepted, the listed derived topics were not.
    PartiallyPublished { failed: Vec<String> },
    /// The volume was not accepted; nothing else was sent.
    NotPublished,
}

impl PublishOutcome {
    /// `true` if the volume reached the broker.
    pub fn is_success(&self) -> bool {
        !matches!(self, PublishOutcome::NotPublished)
    }
}

/// Energy in kWh for a volume in m³.
pub fn energy_kwh(volume: f64, config: &GatewayConfig) -> f64 {
    volume * config.calorific_value * config.correction_factor
}

/// Values sent next to the volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Diagnostics {
    pub link_quality: i32,
    /// Poll success rate in percent.
    pub success_rate: f64,
}

/// Publishes one reading and records every refused message in `errors`.
pub fn on_reading(
    reading: &Reading,
    config: &GatewayConfig,
    diagnostics: Diagnostics,
    broker: &mut dyn Broker,
    errors: &mut ErrorStats,
    now_ms: u64,
) -> PublishOutcome {
    let topics = Topics::new(&config.topic);

    if !broker.is_connected() {
        errors.record(ErrorKind::Publish, "Broker not connected", now_ms);
        return PublishOutcome::NotPublished;
    }

    let volume = format!("{:.2}", reading.volume);
    if !broker.publish(&topics.volume, &volume, true) {
        errors.record(
            ErrorKind::Publish,
            format!("Publish to {} refused", topics.volume),
            now_ms,
        );
        return PublishOutcome::NotPublished;
    }
    log::info!("Volume published: {volume} m³");

    let energy = format!("{:.1}", energy_kwh(reading.volume, config));
    let derived = [
        (&topics.energy, energy),
        (&topics.link_quality, diagnostics.link_quality.to_string()),
        (&topics.mbus_rate, format!("{:.1}", diagnostics.success_rate)),
    ];
    let mut failed = Vec::new();
    for (topic, payload) in derived {
        if broker.publish(topic, &payload, true) {
            log::debug!("Published {payload} to {topic}");
        } else {
            errors.record(ErrorKind::Publish, format!("Publish to {topic} refused"), now_ms);
            failed.push(topic.clone());
        }
    }

    if failed.is_empty() {
        PublishOutcome::Published
    } else {
        PublishOutcome::PartiallyPublished { failed }
    }
}

/// A retained message announcing one entity to Home Assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryMessage {
    pub topic: String,
    pub payload: String,
}

/// Builds the discovery documents for all published values.
///
/// `node_id` keeps the unique ids of several gateways apart.
pub fn discovery_messages(topics: &Topics, node_id: &str) -> Vec<DiscoveryMessage> {
    let device = json!({
        "ids": [node_id],
        "name": "Gas meter",
        "mdl": "M-Bus gas meter",
        "mf": "gasgw",
    });
    let sensor = |object: &str, name: &str, state_topic: &str, extra: serde_json::Value| {
        let mut config = json!({
            "name": name,
            "stat_t": state_topic,
            "avty_t": topics.availability,
            "uniq_id": format!("{node_id}_{object}"),
            "dev": device,
        });
        if let (Some(config), Some(extra)) = (config.as_object_mut(), extra.as_object()) {
            config.extend(extra.clone());
        }
        DiscoveryMessage {
            topic: format!("{DISCOVERY_PREFIX}/sensor/{node_id}_{object}/config"),
            payload: config.to_string(),
        }
    };

    vec![
        sensor(
            "volume",
            "Meter reading",
            &topics.volume,
            json!({
                "unit_of_meas": "m³",
                "dev_cla": "gas",
                "stat_cla": "total_increasing",
                "val_tpl": "{{ value|float }}",
            }),
        ),
        sensor(
            "energy",
            "Gas consumption",
            &topics.energy,
            json!({
                "unit_of_meas": "kWh",
                "dev_cla": "energy",
                "stat_cla": "total_increasing",
                "val_tpl": "{{ value|float }}",
            }),
        ),
        sensor(
            "link_quality",
            "Link quality",
            &topics.link_quality,
            json!({
                "unit_of_meas": "dBm",
                "dev_cla": "signal_strength",
                "val_tpl": "{{ value }}",
            }),
        ),
        sensor(
            "mbus_rate",
            "M-Bus rate",
            &topics.mbus_rate,
            json!({
                "unit_of_meas": "%",
                "val_tpl": "{{ value }}",
                "ic": "mdi:check-network",
            }),
        ),
        DiscoveryMessage {
            topic: format!("{DISCOVERY_PREFIX}/binary_sensor/{node_id}_online/config"),
            payload: json!({
                "name": "Online",
                "stat_t": topics.availability,
                "pl_on": AVAILABILITY_ONLINE,
                "pl_off": AVAILABILITY_OFFLINE,
                "dev_cla": "connectivity",
                "uniq_id": format!("{node_id}_online"),
                "dev": device,
            })
            .to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingBroker;
    use assert_matches::assert_matches;

    const DIAGNOSTICS: Diagnostics = Diagnostics {
        link_quality: -67,
        success_rate: 87.5,
    };

    fn publish(broker: &mut RecordingBroker, errors: &mut ErrorStats, volume: f64) -> PublishOutcome {
        on_reading(
            &Reading::new(1_700_000_000, volume),
            &GatewayConfig::default(),
            DIAGNOSTICS,
            broker,
            errors,
            42,
        )
    }

    #[test]
    fn publishes_in_fixed_order() {
        let mut broker = RecordingBroker::default();
        let mut errors = ErrorStats::default();
        assert_eq!(publish(&mut broker, &mut errors, 12.34), PublishOutcome::Published);
        assert_eq!(
            broker.topics(),
            [
                "gasmeter/consumption",
                "gasmeter/consumption_energy",
                "gasmeter/consumption_wifi",
                "gasmeter/consumption_mbus_rate",
            ]
        );
        let payloads: Vec<&str> = broker.published().iter().map(|p| p.payload.as_str()).collect();
        assert_eq!(payloads, ["12.34", "123.4", "-67", "87.5"]);
        assert!(broker.published().iter().all(|p| p.retain));
        assert_eq!(errors.total(), 0);
    }

    #[test]
    fn energy_uses_calorific_value_and_correction() {
        let config = GatewayConfig {
            calorific_value: 11.2,
            correction_factor: 0.95,
            ..Default::default()
        };
        let energy = energy_kwh(1000.0, &config);
        assert!((energy - 10_640.0).abs() < 1e-6);
    }

    #[test]
    fn refused_volume_skips_derived_topics() {
        let mut broker = RecordingBroker::default();
        broker.fail_topic("gasmeter/consumption");
        let mut errors = ErrorStats::default();
        assert_eq!(publish(&mut broker, &mut errors, 1.0), PublishOutcome::NotPublished);
        assert!(broker.published().is_empty());
        assert_eq!(errors.count(ErrorKind::Publish), 1);
    }

    #[test]
    fn disconnected_broker_is_a_publish_error() {
        let mut broker = RecordingBroker::default();
        broker.set_connected(false);
        let mut errors = ErrorStats::default();
        let outcome = publish(&mut broker, &mut errors, 1.0);
        assert!(!outcome.is_success());
        assert_eq!(errors.count(ErrorKind::Publish), 1);
        assert_matches!(&errors.last_error, Some(e) if e.message == "Broker not connected" && e.timestamp_ms == 42);
    }

    #[test]
    fn derived_failures_are_best_effort() {
        let mut broker = RecordingBroker::default();
        broker.fail_topic("gasmeter/consumption_energy");
        broker.fail_topic("gasmeter/consumption_mbus_rate");
        let mut errors = ErrorStats::default();
        let outcome = publish(&mut broker, &mut errors, 5.5);
        assert!(outcome.is_success());
        assert_matches!(outcome, PublishOutcome::PartiallyPublished { ref failed } if failed.len() == 2);
        assert_eq!(errors.count(ErrorKind::Publish), 2);
        assert_eq!(broker.topics(), ["gasmeter/consumption", "gasmeter/consumption_wifi"]);
    }

    #[test]
    fn discovery_documents() {
        let topics = Topics::new("home/gas");
        let messages = discovery_messages(&topics, "gasgw");
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].topic, "homeassistant/sensor/gasgw_volume/config");
        assert_eq!(messages[4].topic, "homeassistant/binary_sensor/gasgw_online/config");

        let volume: serde_json::Value = serde_json::from_str(&messages[0].payload).unwrap();
        assert_eq!(volume["stat_t"], "home/gas");
        assert_eq!(volume["avty_t"], "home/gas_availability");
        assert_eq!(volume["dev_cla"], "gas");
        assert_eq!(volume["dev"]["ids"][0], "gasgw");

        let online: serde_json::Value = serde_json::from_str(&messages[4].payload).unwrap();
        assert_eq!(online["stat_t"], "home/gas_availability");
        assert_eq!(online["pl_off"], "offline");
    }
}
