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

//! Host-side collaborators: the entity platform and the configuration store.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::error::PlatformError;
use crate::sensor::{Sensor, SensorSnapshot};

/// The host's entity platform.
#[async_trait]
pub trait EntityPlatform: Send + Sync {
    /// Registers newly created sensors with the host. Resolves once the
    /// host has registered them and accepts state writes for them.
    async fn announce_new_entities(&self, entities: Vec<Arc<Sensor>>) -> Result<(), PlatformError>;

    /// Publishes a sensor's state. May fail with
    /// [`PlatformError::EntityNotYetRegistered`].
    async fn write_state(&self, snapshot: &SensorSnapshot) -> Result<(), PlatformError>;
}

/// Persistent storage of configuration entries.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Replaces the `options` of the entry `entry_id`.
    async fn update_configuration(&self, entry_id: &str, options: Map<String, Value>) -> Result<()>;
}

/// A [`ConfigStore`] that keeps the latest options per entry in memory.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    entries: DashMap<String, Map<String, Value>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The options last written for `entry_id`.
    pub fn options(&self, entry_id: &str) -> Option<Map<String, Value>> {
        self.entries.get(entry_id).map(|options| options.clone())
    }

    /// Number of updates recorded (one entry per id).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn update_configuration(&self, entry_id: &str, options: Map<String, Value>) -> Result<()> {
        self.entries.insert(entry_id.to_string(), options);
        Ok(())
    }
}
