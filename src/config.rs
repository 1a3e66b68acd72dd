//! Gateway tunables and their validation.
//!
//! Invalid values are never rejected. A value outside its range is replaced
//! by the field's default (not clamped to the nearest bound), so a bad update
//! can never leave the gateway in an unusable state.
use crate::{
    error::{Error, Result},
    traits::KeyValueStore,
};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;

/// Store key of the persisted configuration record.
pub const CONFIG_KEY: &str = "config";

pub const POLL_INTERVAL_RANGE: RangeInclusive<Duration> =
    Duration::from_secs(10)..=Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Calorific value range in kWh/m³.
pub const CALORIFIC_VALUE_RANGE: RangeInclusive<f64> = 8.0..=13.0;
pub const DEFAULT_CALORIFIC_VALUE: f64 = 10.0;

/// Volume correction factor ("Z-Zahl") range.
pub const CORRECTION_FACTOR_RANGE: RangeInclusive<f64> = 0.90..=1.10;
pub const DEFAULT_CORRECTION_FACTOR: f64 = 1.0;

pub const DEFAULT_TOPIC: &str = "gasmeter/consumption";

/// Settings that influence polling and publishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Time between two poll cycles.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Gas calorific value in kWh/m³.
    pub calorific_value: f64,
    /// Volume correction factor.
    pub correction_factor: f64,
    /// Primary topic the volume is published on.
    pub topic: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            calorific_value: DEFAULT_CALORIFIC_VALUE,
            correction_factor: DEFAULT_CORRECTION_FACTOR,
            topic: DEFAULT_TOPIC.to_string(),
        }
    }
}

impl GatewayConfig {
    /// Returns a copy where every out-of-range value is replaced by its default.
    ///
    /// Validation is idempotent: `c.validate().validate() == c.validate()`.
    ///
    /// # Examples
    ///
    /// ```
    /// use gasmeter_lib::config::GatewayConfig;
    /// use std::time::Duration;
    ///
    /// let config = GatewayConfig {
    ///     poll_interval: Duration::from_secs(5),
    ///     calorific_value: 14.0,
    ///     ..Default::default()
    /// }
    /// .validate();
    /// assert_eq!(config.poll_interval, Duration::from_secs(30));
    /// assert_eq!(config.calorific_value, 10.0);
    /// ```
    pub fn validate(&self) -> Self {
        let poll_interval = if POLL_INTERVAL_RANGE.contains(&self.poll_interval) {
            self.poll_interval
        } else {
            log::warn!(
                "Poll interval {:?} out of range, using {:?}",
                self.poll_interval,
                DEFAULT_POLL_INTERVAL
            );
            DEFAULT_POLL_INTERVAL
        };
        let calorific_value = or_default(
            "calorific value",
            self.calorific_value,
            &CALORIFIC_VALUE_RANGE,
            DEFAULT_CALORIFIC_VALUE,
        );
        let correction_factor = or_default(
            "correction factor",
            self.correction_factor,
            &CORRECTION_FACTOR_RANGE,
            DEFAULT_CORRECTION_FACTOR,
        );
        let topic = match self.topic.trim() {
            "" => DEFAULT_TOPIC.to_string(),
            topic => topic.to_string(),
        };
        Self {
            poll_interval,
            calorific_value,
            correction_factor,
            topic,
        }
    }

    /// Loads the persisted configuration, falling back to defaults when the
    /// record is missing or unreadable. The result is always validated.
    pub fn load(store: &dyn KeyValueStore) -> Self {
        let record = match store.get_blob(CONFIG_KEY) {
            Ok(Some(blob)) => blob,
            Ok(None) => return Self::default(),
            Err(error) => {
                log::warn!("Cannot read configuration record: {error}");
                return Self::default();
            }
        };
        match serde_yaml::from_slice::<GatewayConfig>(&record) {
            Ok(config) => config.validate(),
            Err(error) => {
                log::warn!("Discarding unreadable configuration record: {error}");
                Self::default()
            }
        }
    }

    /// Validates and persists the configuration, returning what was stored.
    pub fn save(&self, store: &mut dyn KeyValueStore) -> Result<Self> {
        let config = self.validate();
        let record = serde_yaml::to_string(&config)?;
        store
            .put_blob(CONFIG_KEY, record.as_bytes())
            .map_err(|source| Error::Store {
                key: CONFIG_KEY.to_string(),
                source,
            })?;
        log::info!(
            "Configuration saved: poll interval {}, calorific value {}, correction factor {}",
            humantime::format_duration(config.poll_interval),
            config.calorific_value,
            config.correction_factor
        );
        Ok(config)
    }

    /// Merges an update into this configuration and validates the result.
    pub fn merge(&self, update: &ConfigUpdate) -> Self {
        let mut config = self.clone();
        if let Some(seconds) = update.poll_interval {
            config.poll_interval = Duration::from_secs(seconds);
        }
        if let Some(calorific_value) = update.calorific_value {
            config.calorific_value = calorific_value;
        }
        if let Some(correction_factor) = update.correction_factor {
            config.correction_factor = correction_factor;
        }
        if let Some(topic) = &update.topic {
            config.topic.clone_from(topic);
        }
        config.validate()
    }
}

fn or_default(name: &str, value: f64, range: &RangeInclusive<f64>, default: f64) -> f64 {
    if range.contains(&value) {
        value
    } else {
        log::warn!("The {name} {value} is out of range {range:?}, using {default}");
        default
    }
}

/// A partial configuration change as sent by a configuration front end.
///
/// Field names follow the JSON document of the dashboard; absent fields keep
/// their current value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConfigUpdate {
    /// Poll interval in seconds.
    #[serde(default)]
    pub poll_interval: Option<u64>,
    #[serde(default, rename = "gas_calorific")]
    pub calorific_value: Option<f64>,
    #[serde(default, rename = "gas_correction")]
    pub correction_factor: Option<f64>,
    #[serde(default, rename = "mqtt_topic")]
    pub topic: Option<String>,
}

impl ConfigUpdate {
    /// Parses a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
