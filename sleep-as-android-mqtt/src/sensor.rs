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

//! Per-device sensor fed by MQTT payloads.

use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::PlatformError;
use crate::platform::EntityPlatform;

/// Payload field holding the new sensor state.
pub const EVENT_FIELD: &str = "event";

/// Point-in-time view of a sensor, as written to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub entity_id: String,
    pub device_identity: String,
    pub name: String,
    pub state: Option<String>,
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Default)]
struct SensorState {
    state: Option<String>,
    attributes: Map<String, Value>,
}

/// A logical sensor for one device.
///
/// Sensors are created and owned by the
/// [`SensorRegistry`](crate::registry::SensorRegistry).
pub struct Sensor {
    entity_id: String,
    device_identity: String,
    name: String,
    current: RwLock<SensorState>,
    platform: Arc<dyn EntityPlatform>,
}

impl Sensor {
    pub(crate) fn new(
        session_name: &str,
        device_identity: &str,
        entity_id: String,
        platform: Arc<dyn EntityPlatform>,
    ) -> Self {
        Self {
            entity_id,
            device_identity: device_identity.to_string(),
            name: format!("{session_name} {device_identity}"),
            current: RwLock::new(SensorState::default()),
            platform,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn device_identity(&self) -> &str {
        &self.device_identity
    }

    /// Display name, `"<session name> <device>"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> Option<String> {
        self.current.read().await.state.clone()
    }

    pub async fn snapshot(&self) -> SensorSnapshot {
        let current = self.current.read().await;
        SensorSnapshot {
            entity_id: self.entity_id.clone(),
            device_identity: self.device_identity.clone(),
            name: self.name.clone(),
            state: current.state.clone(),
            attributes: current.attributes.clone(),
        }
    }

    /// Applies an MQTT payload and writes the new state to the host.
    ///
    /// The payload is a JSON object whose `event` string becomes the state;
    /// all other fields are kept as attributes. Anything else is logged
    /// and ignored.
    pub async fn process_message(&self, payload: &[u8]) -> Result<(), PlatformError> {
        let Some((event, attributes)) = parse_event(payload) else {
            warn!(
                "[{}] Ignoring payload without an '{EVENT_FIELD}' field: {}",
                self.entity_id,
                String::from_utf8_lossy(payload)
            );
            return Ok(());
        };

        debug!("[{}] New state '{event}'", self.entity_id);
        {
            let mut current = self.current.write().await;
            current.state = Some(event);
            current.attributes = attributes;
        }

        let snapshot = self.snapshot().await;
        self.platform.write_state(&snapshot).await
    }
}

impl std::fmt::Debug for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sensor")
            .field("entity_id", &self.entity_id)
            .field("device_identity", &self.device_identity)
            .finish_non_exhaustive()
    }
}

fn parse_event(payload: &[u8]) -> Option<(String, Map<String, Value>)> {
    let Value::Object(mut fields) = serde_json::from_slice::<Value>(payload).ok()? else {
        return None;
    };
    match fields.remove(EVENT_FIELD) {
        Some(Value::String(event)) => Some((event, fields)),
        _ => None,
    }
}
