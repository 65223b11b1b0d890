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

//! Device identity to sensor mapping.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};

use crate::platform::EntityPlatform;
use crate::sensor::Sensor;

/// Sensors of one session, keyed by device identity.
///
/// Entries are never removed; the registry lives as long as its session.
pub struct SensorRegistry {
    name: String,
    sensors: DashMap<String, Arc<Sensor>>,
    platform: Arc<dyn EntityPlatform>,
}

impl SensorRegistry {
    pub fn new(name: impl Into<String>, platform: Arc<dyn EntityPlatform>) -> Self {
        Self {
            name: name.into(),
            sensors: DashMap::new(),
            platform,
        }
    }

    /// Session name used as the entity id prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the sensor for `device_identity`, creating it on first sight.
    ///
    /// The boolean is `true` only for the call that created the sensor.
    /// Lookup and insert happen under the shard lock of the entry, so
    /// concurrent first messages for one device create a single sensor.
    pub fn get_or_create(&self, device_identity: &str) -> (Arc<Sensor>, bool) {
        match self.sensors.entry(device_identity.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                info!("[{}] New device, creating sensor for '{device_identity}'", self.name);
                let sensor = Arc::new(Sensor::new(
                    &self.name,
                    device_identity,
                    self.entity_id_for(device_identity),
                    self.platform.clone(),
                ));
                entry.insert(sensor.clone());
                (sensor, true)
            }
        }
    }

    pub fn get(&self, device_identity: &str) -> Option<Arc<Sensor>> {
        self.sensors.get(device_identity).map(|s| s.value().clone())
    }

    /// `name + "_" + device_identity`.
    pub fn entity_id_for(&self, device_identity: &str) -> String {
        let entity_id = format!("{}_{device_identity}", self.name);
        debug!("[{}] entity_id for '{device_identity}' is '{entity_id}'", self.name);
        entity_id
    }

    /// Inverse of [`SensorRegistry::entity_id_for`]: removes the first
    /// occurrence of `name + "_"`. Returns the input unchanged when it
    /// does not contain the prefix.
    pub fn device_identity_for(&self, entity_id: &str) -> String {
        entity_id.replacen(&format!("{}_", self.name), "", 1)
    }

    pub fn device_identities(&self) -> Vec<String> {
        self.sensors.iter().map(|s| s.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingPlatform;

    fn registry(name: &str) -> SensorRegistry {
        SensorRegistry::new(name, Arc::new(RecordingPlatform::new()))
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = registry("bed");

        let (first, created) = registry.get_or_create("phone1");
        assert!(created);
        let (second, created) = registry.get_or_create("phone1");
        assert!(!created);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(first.entity_id(), "bed_phone1");
    }

    #[test]
    fn test_distinct_devices_get_distinct_sensors() {
        let registry = registry("bed");

        let sensors: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|d| registry.get_or_create(d).0)
            .collect();

        assert_eq!(registry.len(), 4);
        for (i, left) in sensors.iter().enumerate() {
            for right in &sensors[i + 1..] {
                assert!(!Arc::ptr_eq(left, right));
            }
        }
        let mut ids = registry.device_identities();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_entity_id_round_trip() {
        let registry = registry("bed");

        for device in ["phone1", "pixel_7", "", "x/y"] {
            let entity_id = registry.entity_id_for(device);
            assert_eq!(registry.device_identity_for(&entity_id), device);
        }
    }

    #[test]
    fn test_device_identity_for_without_prefix() {
        let registry = registry("bed");
        assert_eq!(registry.device_identity_for("sensor_other"), "sensor_other");
        // Only the first occurrence is removed.
        assert_eq!(registry.device_identity_for("bed_bed_x"), "bed_x");
    }

    #[test]
    fn test_concurrent_first_sight_creates_one_sensor() {
        let registry = Arc::new(registry("bed"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.get_or_create("phone1").1)
            })
            .collect();

        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|created| *created)
            .count();

        assert_eq!(created, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_unknown_device() {
        let registry = registry("bed");
        assert!(registry.get("nope").is_none());
        assert!(registry.is_empty());
    }
}
