// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration entries and the resolved per-session configuration.

use log::warn;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigError;

/// Reserved topic segment marking where the device identifier appears.
pub const DEVICE_PLACEHOLDER: &str = "{device}";

/// Name used when the entry does not configure one.
pub const DEFAULT_NAME: &str = "SleepAsAndroid";

/// Topic template used when the entry does not configure one.
pub const DEFAULT_TOPIC_TEMPLATE: &str = "SleepAsAndroid/{device}";

pub const DEFAULT_QOS: u8 = 0;

pub const KEY_NAME: &str = "name";
pub const KEY_QOS: &str = "qos";
pub const KEY_TOPIC_TEMPLATE: &str = "topic_template";
/// Legacy key of the 1.2.4 schema: the topic prefix in front of the device.
pub const KEY_ROOT_TOPIC: &str = "root_topic";
/// Legacy key of the 1.1.0 schema: a full literal state topic.
pub const KEY_TOPIC: &str = "topic";

/// A configuration entry as stored by the host.
///
/// `options` overrides `data`: every lookup consults `options` first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub entry_id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl ConfigEntry {
    pub fn new(entry_id: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            ..Default::default()
        }
    }

    /// Builder-style setter for a key in `data`.
    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Builder-style setter for a key in `options`.
    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    /// Looks a key up in `options`, then in `data`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.options.get(key).or_else(|| self.data.get(key))
    }

    /// Like [`ConfigEntry::get`] but only for string values.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// The configured name, or [`DEFAULT_NAME`].
    pub fn name(&self) -> String {
        self.get_str(KEY_NAME).unwrap_or(DEFAULT_NAME).to_string()
    }

    /// The configured topic template, or [`DEFAULT_TOPIC_TEMPLATE`].
    pub fn configured_topic(&self) -> String {
        match self.get_str(KEY_TOPIC_TEMPLATE) {
            Some(topic) => topic.to_string(),
            None => {
                warn!(
                    "[{}] No topic_template in configuration, using {DEFAULT_TOPIC_TEMPLATE}",
                    self.entry_id
                );
                DEFAULT_TOPIC_TEMPLATE.to_string()
            }
        }
    }

    /// The configured qos, or [`DEFAULT_QOS`]. Fails on out-of-range values.
    pub fn qos(&self) -> Result<u8, ConfigError> {
        match self.get(KEY_QOS).and_then(value_as_i64) {
            Some(raw) => validate_qos(raw),
            None => Ok(DEFAULT_QOS),
        }
    }
}

/// Accepts integer qos values stored either as JSON numbers or strings.
pub(crate) fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn validate_qos(raw: i64) -> Result<u8, ConfigError> {
    match raw {
        0..=2 => Ok(raw as u8),
        _ => Err(ConfigError::InvalidQos(raw)),
    }
}

/// Maps a validated qos integer onto the transport's QoS levels.
pub fn qos_level(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Resolved configuration of one session. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Prefix of every entity id created by the session.
    pub name: String,
    /// Subscription quality of service (0, 1 or 2).
    pub qos: u8,
    /// Topic containing the [`DEVICE_PLACEHOLDER`] segment.
    pub topic_template: String,
}

impl SessionConfig {
    /// Start building a config with the given name and default qos/topic.
    pub fn builder(name: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder {
            name: name.into(),
            qos: DEFAULT_QOS,
            topic_template: DEFAULT_TOPIC_TEMPLATE.to_string(),
        }
    }

    /// Resolves an entry, falling back to defaults for missing keys.
    pub fn resolve(entry: &ConfigEntry) -> Result<Self, ConfigError> {
        Ok(Self {
            name: entry.name(),
            qos: entry.qos()?,
            topic_template: entry.configured_topic(),
        })
    }

    /// The fields as stored in an entry's `options`.
    pub fn to_options(&self) -> Map<String, Value> {
        let mut options = Map::new();
        options.insert(KEY_NAME.into(), Value::String(self.name.clone()));
        options.insert(KEY_QOS.into(), Value::Number(self.qos.into()));
        options.insert(
            KEY_TOPIC_TEMPLATE.into(),
            Value::String(self.topic_template.clone()),
        );
        options
    }

    pub fn qos_level(&self) -> QoS {
        qos_level(self.qos)
    }
}

/// Builder for [`SessionConfig`].
pub struct SessionConfigBuilder {
    name: String,
    qos: u8,
    topic_template: String,
}

impl SessionConfigBuilder {
    pub fn qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    pub fn topic_template(mut self, topic_template: impl Into<String>) -> Self {
        self.topic_template = topic_template.into();
        self
    }

    /// Build the config, rejecting qos values above 2.
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        Ok(SessionConfig {
            name: self.name,
            qos: validate_qos(i64::from(self.qos))?,
            topic_template: self.topic_template,
        })
    }
}

/// Connection settings of the bundled MQTT client.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// MQTT broker hostname or IP.
    pub broker_host: String,
    /// MQTT broker port (default: 1883).
    pub port: u16,
    /// MQTT client ID.
    pub client_id: String,
    /// Optional MQTT username for authentication.
    pub username: Option<String>,
    /// Optional MQTT password for authentication.
    pub password: Option<String>,
    /// Keep-alive interval in seconds (default: 30).
    pub keep_alive_secs: u64,
}

impl BrokerConfig {
    /// Start building a broker config with the required fields.
    pub fn builder(
        broker_host: impl Into<String>,
        client_id: impl Into<String>,
    ) -> BrokerConfigBuilder {
        BrokerConfigBuilder {
            broker_host: broker_host.into(),
            client_id: client_id.into(),
            port: 1883,
            username: None,
            password: None,
            keep_alive_secs: 30,
        }
    }
}

/// Builder for [`BrokerConfig`].
pub struct BrokerConfigBuilder {
    broker_host: String,
    client_id: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    keep_alive_secs: u64,
}

impl BrokerConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn keep_alive_secs(mut self, secs: u64) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    /// Build the config.
    pub fn build(self) -> BrokerConfig {
        BrokerConfig {
            broker_host: self.broker_host,
            port: self.port,
            client_id: self.client_id,
            username: self.username,
            password: self.password,
            keep_alive_secs: self.keep_alive_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_options_override_data() {
        let entry = ConfigEntry::new("e1")
            .with_data(KEY_NAME, "from-data")
            .with_option(KEY_NAME, "from-options");

        assert_eq!(entry.name(), "from-options");
    }

    #[test]
    fn test_missing_keys_fall_back_to_defaults() {
        let config = SessionConfig::resolve(&ConfigEntry::new("e1")).unwrap();

        assert_eq!(config.name, DEFAULT_NAME);
        assert_eq!(config.qos, 0);
        assert_eq!(config.topic_template, DEFAULT_TOPIC_TEMPLATE);
    }

    #[test]
    fn test_qos_as_string_is_accepted() {
        let entry = ConfigEntry::new("e1").with_data(KEY_QOS, "2");
        assert_eq!(entry.qos().unwrap(), 2);
    }

    #[test]
    fn test_out_of_range_qos_is_rejected() {
        let entry = ConfigEntry::new("e1").with_option(KEY_QOS, 3);
        assert_eq!(entry.qos(), Err(ConfigError::InvalidQos(3)));

        assert!(SessionConfig::builder("bed").qos(7).build().is_err());
    }

    #[test]
    fn test_to_options_round_trips_through_resolve() {
        let config = SessionConfig::builder("bed")
            .qos(1)
            .topic_template("home/{device}/state")
            .build()
            .unwrap();

        let entry = ConfigEntry {
            entry_id: "e1".into(),
            data: Map::new(),
            options: config.to_options(),
        };
        assert_eq!(SessionConfig::resolve(&entry).unwrap(), config);
        assert_eq!(entry.get(KEY_QOS), Some(&json!(1)));
    }

    #[test]
    fn test_broker_builder_defaults() {
        let broker = BrokerConfig::builder("broker.local", "client-1")
            .username("user")
            .build();

        assert_eq!(broker.port, 1883);
        assert_eq!(broker.keep_alive_secs, 30);
        assert_eq!(broker.username.as_deref(), Some("user"));
        assert!(broker.password.is_none());
    }

    #[test]
    fn test_qos_level_mapping() {
        assert_eq!(qos_level(0), QoS::AtMostOnce);
        assert_eq!(qos_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_level(2), QoS::ExactlyOnce);
    }
}
