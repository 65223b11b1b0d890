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

//! Per-device sensors from a templated MQTT topic.
//!
//! A session subscribes to a topic template such as
//! `SleepAsAndroid/{device}`, reads the device out of every incoming
//! topic, and routes the payload to that device's sensor, creating and
//! announcing the sensor the first time the device is seen. Entries written
//! by older releases are migrated to the current configuration schema once,
//! at startup.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sleep_as_android_mqtt::{
//!     BrokerConfig, ConfigEntry, MemoryConfigStore, RumqttClient, SessionDeps, SessionTable,
//! };
//!
//! let broker = BrokerConfig::builder("broker.local", "sleep-gateway").build();
//! let client = Arc::new(RumqttClient::connect(&broker));
//! let deps = SessionDeps::new(client, platform, Arc::new(MemoryConfigStore::new()));
//!
//! let table = SessionTable::new(deps);
//! let entry = ConfigEntry::new("entry-1")
//!     .with_option("name", "bed")
//!     .with_option("topic_template", "SleepAsAndroid/{device}");
//! table.setup_entry(&entry).await?;
//! ```

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod migration;
pub mod platform;
pub mod registry;
pub mod sensor;
pub mod session;
pub mod topic;

#[cfg(test)]
mod test_support;

pub use client::{IncomingMessage, MessagingClient, RumqttClient, SubscriptionHandle};
pub use config::{BrokerConfig, BrokerConfigBuilder, ConfigEntry, SessionConfig, SessionConfigBuilder};
pub use coordinator::{Delivery, SubscriptionCoordinator, SubscriptionState};
pub use error::{ConfigError, PlatformError, SessionError, TopicTemplateError};
pub use migration::{ConfigMigrator, MigrationState};
pub use platform::{ConfigStore, EntityPlatform, MemoryConfigStore};
pub use registry::SensorRegistry;
pub use sensor::{Sensor, SensorSnapshot};
pub use session::{Session, SessionDeps, SessionTable};
pub use topic::TopicTemplate;
