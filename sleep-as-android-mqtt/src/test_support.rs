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

//! In-memory collaborators for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::mpsc;

use crate::client::{IncomingMessage, MessagingClient, SubscriptionHandle};
use crate::error::PlatformError;
use crate::platform::EntityPlatform;
use crate::sensor::{Sensor, SensorSnapshot};
use crate::topic::topic_matches;

/// Records announcements and state writes.
pub(crate) struct RecordingPlatform {
    require_registration: bool,
    register_on_announce: bool,
    registered: Mutex<HashSet<String>>,
    events: Mutex<Vec<String>>,
    writes: Mutex<Vec<SensorSnapshot>>,
}

impl RecordingPlatform {
    /// Accepts every write.
    pub(crate) fn new() -> Self {
        Self::with_flags(false, true)
    }

    /// Rejects writes for entities that were not announced.
    pub(crate) fn requiring_registration() -> Self {
        Self::with_flags(true, true)
    }

    /// Rejects every write; announcing never completes registration.
    pub(crate) fn never_registering() -> Self {
        Self::with_flags(true, false)
    }

    fn with_flags(require_registration: bool, register_on_announce: bool) -> Self {
        Self {
            require_registration,
            register_on_announce,
            registered: Mutex::new(HashSet::new()),
            events: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// `"announce:<entity_id>"` and `"write:<entity_id>"` in call order.
    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn announced(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("announce:").map(str::to_string))
            .collect()
    }

    pub(crate) fn writes(&self) -> Vec<SensorSnapshot> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl EntityPlatform for RecordingPlatform {
    async fn announce_new_entities(&self, entities: Vec<Arc<Sensor>>) -> Result<(), PlatformError> {
        for sensor in entities {
            let entity_id = sensor.entity_id().to_string();
            self.events.lock().unwrap().push(format!("announce:{entity_id}"));
            if self.register_on_announce {
                self.registered.lock().unwrap().insert(entity_id);
            }
        }
        Ok(())
    }

    async fn write_state(&self, snapshot: &SensorSnapshot) -> Result<(), PlatformError> {
        if self.require_registration
            && !self.registered.lock().unwrap().contains(&snapshot.entity_id)
        {
            return Err(PlatformError::EntityNotYetRegistered {
                entity_id: snapshot.entity_id.clone(),
            });
        }
        self.events
            .lock()
            .unwrap()
            .push(format!("write:{}", snapshot.entity_id));
        self.writes.lock().unwrap().push(snapshot.clone());
        Ok(())
    }
}

type Subscription = (SubscriptionHandle, QoS, mpsc::Sender<IncomingMessage>);

/// A broker-less [`MessagingClient`].
pub(crate) struct MockClient {
    failing: AtomicBool,
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
    history: Mutex<Vec<(String, QoS)>>,
    unsubscribed: Mutex<Vec<SubscriptionHandle>>,
}

impl MockClient {
    pub(crate) fn new() -> Self {
        Self {
            failing: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            subscriptions: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing() -> Self {
        let client = Self::new();
        client.set_failing(true);
        client
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every subscribe request, successful or not.
    pub(crate) fn subscribe_requests(&self) -> Vec<(String, QoS)> {
        self.history.lock().unwrap().clone()
    }

    pub(crate) fn live_subscriptions(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    pub(crate) fn unsubscribed(&self) -> Vec<SubscriptionHandle> {
        self.unsubscribed.lock().unwrap().clone()
    }

    /// Delivers a message to every live subscription matching `topic`.
    pub(crate) async fn publish(&self, topic: &str, payload: &[u8]) {
        let sinks: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|(handle, _, _)| topic_matches(&handle.topic, topic))
            .map(|(_, _, sink)| sink.clone())
            .collect();

        for sink in sinks {
            let _ = sink.send(IncomingMessage::new(topic, payload.to_vec())).await;
        }
    }
}

#[async_trait]
impl MessagingClient for MockClient {
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        sink: mpsc::Sender<IncomingMessage>,
    ) -> Result<SubscriptionHandle> {
        self.history.lock().unwrap().push((topic.to_string(), qos));
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("broker refused subscription");
        }

        let handle = SubscriptionHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            topic: topic.to_string(),
        };
        self.subscriptions
            .lock()
            .unwrap()
            .push((handle.clone(), qos, sink));
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        self.subscriptions
            .lock()
            .unwrap()
            .retain(|(live, _, _)| live.id != handle.id);
        self.unsubscribed.lock().unwrap().push(handle);
        Ok(())
    }
}

/// Lets spawned tasks on the test runtime drain their queues.
pub(crate) async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}
