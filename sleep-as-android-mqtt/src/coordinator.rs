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

//! Wildcard subscription and per-message dispatch to device sensors.

use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use rumqttc::QoS;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::client::{IncomingMessage, MessagingClient, SubscriptionHandle};
use crate::error::{PlatformError, SessionError};
use crate::platform::EntityPlatform;
use crate::registry::SensorRegistry;
use crate::topic::TopicTemplate;

/// Messages buffered between the client and the dispatch task.
const MESSAGE_BUFFER: usize = 100;

/// Lifecycle of the coordinator's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    /// The last attempt was refused. Stays here until `subscribe` is
    /// called again.
    SubscribeFailed,
}

/// Outcome of routing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub device_identity: String,
    pub entity_id: String,
    /// Whether this message created (and announced) the sensor.
    pub created: bool,
}

struct ActiveSubscription {
    handle: SubscriptionHandle,
    task: JoinHandle<()>,
}

/// Owns the wildcard subscription of a session and routes its messages.
pub struct SubscriptionCoordinator {
    id: String,
    template: TopicTemplate,
    qos: QoS,
    registry: Arc<SensorRegistry>,
    client: Arc<dyn MessagingClient>,
    platform: Arc<dyn EntityPlatform>,
    state: watch::Sender<SubscriptionState>,
    active: Mutex<Option<ActiveSubscription>>,
}

impl SubscriptionCoordinator {
    pub fn new(
        id: impl Into<String>,
        template: TopicTemplate,
        qos: QoS,
        registry: Arc<SensorRegistry>,
        client: Arc<dyn MessagingClient>,
        platform: Arc<dyn EntityPlatform>,
    ) -> Self {
        Self {
            id: id.into(),
            template,
            qos,
            registry,
            client,
            platform,
            state: watch::Sender::new(SubscriptionState::Unsubscribed),
            active: Mutex::new(None),
        }
    }

    pub fn template(&self) -> &TopicTemplate {
        &self.template
    }

    pub fn registry(&self) -> &Arc<SensorRegistry> {
        &self.registry
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Subscribes to the template's wildcard topic.
    ///
    /// A previous subscription is released first. A refusal leaves the
    /// coordinator in [`SubscriptionState::SubscribeFailed`]; nothing is
    /// retried.
    pub async fn subscribe(self: &Arc<Self>) -> Result<SubscriptionHandle, SessionError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.release(previous).await;
        }

        self.state.send_replace(SubscriptionState::Subscribing);
        let topic = self.template.wildcard_topic();
        debug!(
            "[{}] Subscribing to '{topic}' (generated from '{}')",
            self.id,
            self.template.configured()
        );

        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
        match self.client.subscribe(topic, self.qos, tx).await {
            Ok(handle) => {
                let task = tokio::spawn(Self::dispatch_loop(Arc::downgrade(self), rx));
                *active = Some(ActiveSubscription {
                    handle: handle.clone(),
                    task,
                });
                self.state.send_replace(SubscriptionState::Subscribed);
                info!("[{}] Subscribed to '{topic}'", self.id);
                Ok(handle)
            }
            Err(source) => {
                self.state.send_replace(SubscriptionState::SubscribeFailed);
                error!("[{}] Could not subscribe to topic '{topic}': {source}", self.id);
                Err(SessionError::SubscribeFailed {
                    topic: topic.to_string(),
                    source,
                })
            }
        }
    }

    /// Releases the current subscription, if any.
    pub async fn unsubscribe(&self) {
        if let Some(previous) = self.active.lock().await.take() {
            self.release(previous).await;
        }
        self.state.send_replace(SubscriptionState::Unsubscribed);
    }

    async fn release(&self, previous: ActiveSubscription) {
        let topic = previous.handle.topic.clone();
        if let Err(e) = self.client.unsubscribe(previous.handle).await {
            warn!("[{}] Failed to release subscription to '{topic}': {e}", self.id);
        }
        previous.task.abort();
    }

    async fn dispatch_loop(coordinator: Weak<Self>, mut rx: mpsc::Receiver<IncomingMessage>) {
        while let Some(message) = rx.recv().await {
            let Some(coordinator) = coordinator.upgrade() else {
                break;
            };
            coordinator.on_message(message).await;
        }
    }

    /// Routes one message to the sensor of its device.
    ///
    /// A sensor seen for the first time is announced to the host before it
    /// processes the message. Writes rejected because the host has not
    /// registered the entity yet are dropped.
    pub async fn on_message(&self, message: IncomingMessage) -> Delivery {
        debug!("[{}] Got message on '{}'", self.id, message.topic);

        let device_identity = self.template.extract_device(&message.topic);
        let (sensor, created) = self.registry.get_or_create(&device_identity);

        if created {
            if let Err(e) = self.platform.announce_new_entities(vec![sensor.clone()]).await {
                error!(
                    "[{}] Failed to announce sensor '{}': {e}",
                    self.id,
                    sensor.entity_id()
                );
            }
        }

        match sensor.process_message(&message.payload).await {
            Ok(()) => {}
            Err(PlatformError::EntityNotYetRegistered { entity_id }) => {
                debug!("[{}] '{entity_id}' not registered yet, state write skipped", self.id);
            }
            Err(e) => {
                warn!(
                    "[{}] Failed to write state of '{}': {e}",
                    self.id,
                    sensor.entity_id()
                );
            }
        }

        Delivery {
            device_identity,
            entity_id: sensor.entity_id().to_string(),
            created,
        }
    }
}

/// Stops the dispatch task only. Call [`SubscriptionCoordinator::unsubscribe`]
/// (or `Session::shutdown`) first to release the client subscription;
/// otherwise the client drops the route once it finds the receiver gone.
impl Drop for SubscriptionCoordinator {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.task.abort();
        }
    }
}
