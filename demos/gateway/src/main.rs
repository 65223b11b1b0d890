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

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use sleep_as_android_mqtt::config::{KEY_NAME, KEY_QOS, KEY_ROOT_TOPIC, KEY_TOPIC, KEY_TOPIC_TEMPLATE};
use sleep_as_android_mqtt::{
    BrokerConfig, ConfigEntry, EntityPlatform, MemoryConfigStore, PlatformError, RumqttClient,
    Sensor, SensorSnapshot, SessionDeps, SessionTable,
};

/// Entity platform that prints sensor states to the log.
struct LogPlatform;

#[async_trait]
impl EntityPlatform for LogPlatform {
    async fn announce_new_entities(&self, entities: Vec<Arc<Sensor>>) -> Result<(), PlatformError> {
        for sensor in entities {
            info!("New sensor '{}' ({})", sensor.entity_id(), sensor.name());
        }
        Ok(())
    }

    async fn write_state(&self, snapshot: &SensorSnapshot) -> Result<(), PlatformError> {
        let attributes = serde_json::to_string(&snapshot.attributes)
            .map_err(|e| PlatformError::Rejected(e.to_string()))?;
        info!(
            "{} = {} {attributes}",
            snapshot.entity_id,
            snapshot.state.as_deref().unwrap_or("unknown")
        );
        Ok(())
    }
}

fn broker_from_env() -> Result<BrokerConfig> {
    let broker_url = env::var("MQTT_BROKER_URL").context("MQTT_BROKER_URL not set")?;
    let port = env::var("MQTT_PORT")
        .unwrap_or_else(|_| "1883".to_string())
        .parse::<u16>()
        .context("Invalid MQTT_PORT")?;
    let client_id = env::var("MQTT_CLIENT_ID")
        .unwrap_or_else(|_| format!("sleep-as-android-{}", uuid::Uuid::new_v4()));

    let mut builder = BrokerConfig::builder(broker_url, client_id).port(port);
    if let Ok(username) = env::var("MQTT_USERNAME") {
        builder = builder.username(username);
    }
    if let Ok(password) = env::var("MQTT_PASSWORD") {
        builder = builder.password(password);
    }
    Ok(builder.build())
}

/// Builds the configuration entry. Legacy variables produce an entry that
/// is migrated on startup.
fn entry_from_env() -> ConfigEntry {
    let mut entry = ConfigEntry::new(env::var("SESSION_ENTRY_ID").unwrap_or_else(|_| "default".into()));

    let string_keys = [
        ("SESSION_NAME", KEY_NAME),
        ("SESSION_TOPIC_TEMPLATE", KEY_TOPIC_TEMPLATE),
        ("SESSION_ROOT_TOPIC", KEY_ROOT_TOPIC),
        ("SESSION_TOPIC", KEY_TOPIC),
    ];
    for (var, key) in string_keys {
        if let Ok(value) = env::var(var) {
            entry = entry.with_option(key, value);
        }
    }
    if let Ok(qos) = env::var("SESSION_QOS") {
        entry = entry.with_option(KEY_QOS, qos);
    }
    entry
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    info!("Starting Sleep as Android gateway...");

    let broker = broker_from_env()?;
    let client = Arc::new(RumqttClient::connect(&broker));
    let store = Arc::new(MemoryConfigStore::new());
    let deps = SessionDeps::new(client.clone(), Arc::new(LogPlatform), store.clone());

    let table = SessionTable::new(deps);
    let entry = entry_from_env();
    let session = table.setup_entry(&entry).await?;
    info!(
        "Session '{}' listening on '{}'",
        session.entry_id(),
        session.template().wildcard_topic()
    );

    // Keep running until signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    table.shutdown_all().await;
    client.disconnect().await;
    if let Some(options) = store.options(&entry.entry_id) {
        info!("Migrated options (kept in memory only): {options:?}");
    }
    Ok(())
}
