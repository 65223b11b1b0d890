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

//! One-shot upgrade of legacy configuration entries.
//!
//! Two older schemas exist:
//! - 1.1.0 stored the full state topic under `topic`; the device was the
//!   segment before the last one.
//! - 1.2.4 stored a `root_topic`; the device was appended as the last
//!   segment.
//!
//! The current schema stores `name`, `qos` and `topic_template`.

use log::{debug, info};
use serde_json::{Map, Value};

use crate::config::{
    validate_qos, value_as_i64, ConfigEntry, SessionConfig, DEVICE_PLACEHOLDER,
    KEY_NAME, KEY_QOS, KEY_ROOT_TOPIC, KEY_TOPIC, KEY_TOPIC_TEMPLATE,
};
use crate::error::{ConfigError, SessionError};
use crate::platform::ConfigStore;

/// Whether an entry still has to be migrated. Evaluated once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Current,
    PendingMigration,
}

impl MigrationState {
    /// Pending iff the entry's options carry no `topic_template`.
    pub fn evaluate(entry: &ConfigEntry) -> Self {
        if entry.options.contains_key(KEY_TOPIC_TEMPLATE) {
            MigrationState::Current
        } else {
            MigrationState::PendingMigration
        }
    }
}

/// Where a migrated topic template came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicSource {
    /// `root_topic` of the 1.2.4 schema.
    RootTopic,
    /// `topic` of the 1.1.0 schema.
    LiteralTopic,
    /// Nothing legacy found; the session's resolved topic was kept.
    Fallback,
}

/// Result of [`migrate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub config: SessionConfig,
    pub source: TopicSource,
}

/// Builds current-schema options from legacy ones.
///
/// `name` and `qos` are kept when present, otherwise `default_name` and
/// `default_qos` are used. The topic template comes from, in order: `root_topic`,
/// `topic` with its last segment replaced by the placeholder, and finally
/// `fallback_topic`.
pub fn migrate(
    old_options: &Map<String, Value>,
    default_name: &str,
    default_qos: u8,
    fallback_topic: &str,
) -> Result<Migration, ConfigError> {
    let name = old_options
        .get(KEY_NAME)
        .and_then(Value::as_str)
        .unwrap_or(default_name)
        .to_string();
    let qos = match old_options.get(KEY_QOS).and_then(value_as_i64) {
        Some(raw) => validate_qos(raw)?,
        None => default_qos,
    };

    let (topic_template, source) = if let Some(root) =
        old_options.get(KEY_ROOT_TOPIC).and_then(Value::as_str)
    {
        let topic = format!("{root}/{DEVICE_PLACEHOLDER}");
        info!("Found root_topic '{root}' from v1.2.4, replacing it with '{topic}'");
        (topic, TopicSource::RootTopic)
    } else if let Some(literal) = old_options.get(KEY_TOPIC).and_then(Value::as_str) {
        let prefix = match literal.rsplit_once('/') {
            Some((prefix, _last)) => prefix,
            None => "",
        };
        let topic = format!("{prefix}/{DEVICE_PLACEHOLDER}");
        info!("Found topic '{literal}' from v1.1.0, replacing it with '{topic}'");
        (topic, TopicSource::LiteralTopic)
    } else {
        info!("No topic from previous versions found, using '{fallback_topic}'");
        (fallback_topic.to_string(), TopicSource::Fallback)
    };

    Ok(Migration {
        config: SessionConfig {
            name,
            qos,
            topic_template,
        },
        source,
    })
}

/// Runs the migration of one entry at most once.
#[derive(Debug)]
pub struct ConfigMigrator {
    entry_id: String,
    state: MigrationState,
    planned: Option<Migration>,
}

impl ConfigMigrator {
    /// Evaluates the entry and, when pending, plans the migration.
    pub fn new(entry: &ConfigEntry) -> Result<Self, ConfigError> {
        let state = MigrationState::evaluate(entry);
        let planned = match state {
            MigrationState::Current => None,
            MigrationState::PendingMigration => {
                debug!("[{}] Old options are {:?}", entry.entry_id, entry.options);
                Some(migrate(
                    &entry.options,
                    &entry.name(),
                    entry.qos()?,
                    &entry.configured_topic(),
                )?)
            }
        };

        Ok(Self {
            entry_id: entry.entry_id.clone(),
            state,
            planned,
        })
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// The configuration the entry will have once migrated.
    pub fn planned(&self) -> Option<&Migration> {
        self.planned.as_ref()
    }

    /// Persists the planned options. Returns `true` if anything was written.
    ///
    /// After a successful run the state is [`MigrationState::Current`] for
    /// good; a failed write leaves it pending.
    pub async fn run(&mut self, store: &dyn ConfigStore) -> Result<bool, SessionError> {
        if self.state == MigrationState::Current {
            return Ok(false);
        }
        let Some(migration) = self.planned.as_ref() else {
            return Ok(false);
        };

        info!("[{}] Updating configuration...", self.entry_id);
        store
            .update_configuration(&self.entry_id, migration.config.to_options())
            .await
            .map_err(SessionError::Migration)?;

        self.state = MigrationState::Current;
        self.planned = None;
        info!("[{}] Configuration updated", self.entry_id);
        Ok(true)
    }
}
