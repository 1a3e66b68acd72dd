//! MQTT uplink of the daemon.
use crate::daemon::{ConnectionEvent, Uplink};
use anyhow::{Context, Result};
use gasmeter_lib::{publish, traits::Broker};
use paho_mqtt as mqtt;
use serde::Deserialize;
use std::fs::File;
use std::time::{Duration, Instant};

/// Minimum time between two reconnection attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Client id; a random one is generated if absent.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Id that keeps the discovery entities of several gateways apart.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Quality of service code to use
    #[serde(default = "default_qos")]
    qos: u8,
}

fn default_node_id() -> String {
    String::from("gasgw")
}

fn default_qos() -> u8 {
    0
}

impl MqttConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "gasgw.yml";

    pub fn load(path: &str) -> Result<Self> {
        log::debug!("Loading MQTT config file from {path}");
        let file = File::open(path).with_context(|| format!("Cannot open {path}"))?;
        serde_yaml::from_reader(&file).with_context(|| format!("Cannot parse {path}"))
    }

    pub fn qos(&self) -> i32 {
        i32::from(self.qos.min(2))
    }

    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("gasgw-{:08x}", rand::random::<u32>()))
    }
}

/// Broker connection with availability announcement and throttled reconnects.
pub struct MqttBroker {
    client: mqtt::Client,
    conn_opts: mqtt::ConnectOptions,
    qos: i32,
    topics: publish::Topics,
    node_id: String,
    was_connected: bool,
    last_attempt: Instant,
}

impl MqttBroker {
    /// Connects to the broker. The availability topic gets an "offline" LWT.
    pub fn connect(config: &MqttConfig, topics: publish::Topics) -> Result<Self> {
        let create_opts = mqtt::CreateOptionsBuilder::new()
            .server_uri(config.url.clone())
            .client_id(config.client_id())
            .finalize();
        let mut client =
            mqtt::Client::new(create_opts).with_context(|| "Error creating mqtt client")?;
        client.set_timeout(Duration::from_secs(5));

        let will = mqtt::Message::new_retained(
            topics.availability.clone(),
            publish::AVAILABILITY_OFFLINE,
            config.qos(),
        );
        let mut conn_builder = mqtt::ConnectOptionsBuilder::new();
        let mut conn_builder = conn_builder
            .keep_alive_interval(Duration::from_secs(20))
            .clean_session(true)
            .will_message(will);
        if let Some(user_name) = &config.username {
            conn_builder = conn_builder.user_name(user_name)
        }
        if let Some(password) = &config.password {
            conn_builder = conn_builder.password(password)
        }
        let conn_opts = conn_builder.finalize();

        client
            .connect(conn_opts.clone())
            .with_context(|| format!("Mqtt client unable to connect to {}", config.url))?;

        let mut broker = Self {
            client,
            conn_opts,
            qos: config.qos(),
            topics,
            node_id: config.node_id.clone(),
            was_connected: true,
            last_attempt: Instant::now(),
        };
        broker.go_online();
        Ok(broker)
    }

    /// Announces availability and the discovery documents.
    fn go_online(&mut self) {
        let online = mqtt::Message::new_retained(
            self.topics.availability.clone(),
            publish::AVAILABILITY_ONLINE,
            self.qos,
        );
        if let Err(error) = self.client.publish(online) {
            log::warn!("Cannot publish availability: {error}");
        }
        for message in publish::discovery_messages(&self.topics, &self.node_id) {
            let discovery = mqtt::Message::new_retained(message.topic, message.payload, self.qos);
            if let Err(error) = self.client.publish(discovery) {
                log::warn!("Cannot publish discovery document: {error}");
            }
        }
        log::info!("Online, availability on {}", self.topics.availability);
    }

    /// Marks the gateway offline and disconnects.
    pub fn go_offline(self) -> Result<()> {
        let msg = mqtt::Message::new_retained(
            self.topics.availability.clone(),
            publish::AVAILABILITY_OFFLINE,
            self.qos,
        );
        self.client
            .publish(msg)
            .with_context(|| "Cannot publish mqtt message")?;
        self.client
            .disconnect(None)
            .with_context(|| "Error disconnect mqtt client")
    }
}

impl Broker for MqttBroker {
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> bool {
        let msg = if retain {
            mqtt::Message::new_retained(topic, payload, self.qos)
        } else {
            mqtt::Message::new(topic, payload, self.qos)
        };
        match self.client.publish(msg) {
            Ok(()) => true,
            Err(error) => {
                log::warn!("Cannot publish to {topic}: {error}");
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }
}

impl Uplink for MqttBroker {
    fn maintain(&mut self) -> Option<ConnectionEvent> {
        if self.client.is_connected() {
            self.was_connected = true;
            return None;
        }
        if self.was_connected {
            self.was_connected = false;
            self.last_attempt = Instant::now();
            return Some(ConnectionEvent::Lost);
        }
        if self.last_attempt.elapsed() < RECONNECT_INTERVAL {
            return None;
        }
        self.last_attempt = Instant::now();
        match self.client.connect(self.conn_opts.clone()) {
            Ok(_) => {
                self.was_connected = true;
                self.go_online();
                Some(ConnectionEvent::Reconnected)
            }
            Err(error) => Some(ConnectionEvent::ReconnectFailed(error.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config() {
        let config: MqttConfig = serde_yaml::from_str(
            "url: tcp://broker:1883\nusername: meter\npassword: secret\nqos: 1\n",
        )
        .unwrap();
        assert_eq!(config.url, "tcp://broker:1883");
        assert_eq!(config.username.as_deref(), Some("meter"));
        assert_eq!(config.qos(), 1);
        assert_eq!(config.node_id, "gasgw");
        assert!(config.client_id().starts_with("gasgw-"));
    }

    #[test]
    fn qos_is_limited() {
        let config: MqttConfig =
            serde_yaml::from_str("url: tcp://localhost\nqos: 7\nclient_id: fixed\n").unwrap();
        assert_eq!(config.qos(), 2);
        assert_eq!(config.client_id(), "fixed");
    }
}
