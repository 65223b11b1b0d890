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

//! Messaging client abstraction and its `rumqttc` implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, Event, Incoming, MqttOptions, Outgoing, QoS, SubAck, SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::BrokerConfig;
use crate::topic::topic_matches;

/// How long `subscribe` waits for the broker's SUBACK.
const SUBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// A message delivered on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl IncomingMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Identifies a live subscription so it can be released later.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub topic: String,
}

/// Publish/subscribe transport used by sessions.
///
/// Reliability (QoS handling, retained messages, reconnects) is the
/// implementation's concern.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Subscribes to `topic` and forwards every matching message to `sink`.
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        sink: mpsc::Sender<IncomingMessage>,
    ) -> Result<SubscriptionHandle>;

    /// Releases a subscription returned by [`MessagingClient::subscribe`].
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;
}

struct Route {
    filter: String,
    qos: QoS,
    sink: mpsc::Sender<IncomingMessage>,
}

type AckSender = oneshot::Sender<Result<()>>;

/// Subscribe requests waiting for their SUBACK.
///
/// rumqttc assigns packet ids inside the event loop, so requests are
/// matched to ids in the order the event loop sends them. `None` marks a
/// request nobody waits for (restored subscriptions).
#[derive(Default)]
struct PendingSubscribes {
    queued: VecDeque<Option<AckSender>>,
    awaiting: HashMap<u16, AckSender>,
}

impl PendingSubscribes {
    fn on_outgoing(&mut self, pkid: u16) {
        if let Some(Some(tx)) = self.queued.pop_front() {
            self.awaiting.insert(pkid, tx);
        }
    }

    fn on_suback(&mut self, ack: &SubAck) {
        if let Some(tx) = self.awaiting.remove(&ack.pkid) {
            let _ = tx.send(check_suback(ack));
        }
    }

    /// Requests already on the wire will not be acknowledged any more.
    fn on_connection_lost(&mut self) {
        self.awaiting.clear();
    }
}

fn lock_pending(pending: &StdMutex<PendingSubscribes>) -> MutexGuard<'_, PendingSubscribes> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fails when the broker refused any filter of the request.
fn check_suback(ack: &SubAck) -> Result<()> {
    if ack
        .return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
    {
        anyhow::bail!("broker refused subscription (pkid {})", ack.pkid);
    }
    Ok(())
}

/// [`MessagingClient`] backed by a `rumqttc` connection.
///
/// Several subscriptions may share a topic filter; the broker subscription
/// is dropped when the last of them is released. Routes whose receiver is
/// gone are pruned on the next matching message.
pub struct RumqttClient {
    client_id: String,
    client: AsyncClient,
    routes: Arc<DashMap<u64, Route>>,
    pending: Arc<StdMutex<PendingSubscribes>>,
    next_id: AtomicU64,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttClient {
    /// Connects to the broker and spawns the event loop. Must be called
    /// from within a Tokio runtime.
    pub fn connect(config: &BrokerConfig) -> Self {
        info!(
            "[{}] Connecting to MQTT broker {}:{}",
            config.client_id, config.broker_host, config.port
        );

        let mut mqtt_opts = MqttOptions::new(&config.client_id, &config.broker_host, config.port);
        mqtt_opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            mqtt_opts.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 100);
        let routes: Arc<DashMap<u64, Route>> = Arc::new(DashMap::new());
        let pending = Arc::new(StdMutex::new(PendingSubscribes::default()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let loop_routes = routes.clone();
        let loop_pending = pending.clone();
        let loop_client = client.clone();
        let client_id = config.client_id.clone();
        let handle = tokio::spawn(async move {
            info!("[{client_id}] MQTT event loop started");
            let mut connected_once = false;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("[{client_id}] Shutdown signal received");
                        break;
                    }
                    event = eventloop.poll() => {
                        match event {
                            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                                let message = IncomingMessage::new(publish.topic, publish.payload.to_vec());
                                let dead = dispatch(&loop_routes, message).await;
                                prune_routes(&client_id, &loop_client, &loop_routes, &dead);
                            }
                            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                                if connected_once && !ack.session_present {
                                    resubscribe_all(&client_id, &loop_client, &loop_routes, &loop_pending);
                                }
                                connected_once = true;
                            }
                            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                                lock_pending(&loop_pending).on_outgoing(pkid);
                            }
                            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                                lock_pending(&loop_pending).on_suback(&ack);
                            }
                            Ok(_) => {} // Ignore other events (PingResp, UnsubAck, etc.)
                            Err(e) => {
                                error!("[{client_id}] MQTT connection error: {e}");
                                lock_pending(&loop_pending).on_connection_lost();
                                // rumqttc reconnects on the next poll()
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }
        });

        Self {
            client_id: config.client_id.clone(),
            client,
            routes,
            pending,
            next_id: AtomicU64::new(1),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(handle)),
        }
    }

    /// Disconnects from the broker and stops the event loop.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("[{}] Disconnect request failed: {e}", self.client_id);
        }
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        self.routes.clear();
        let mut pending = lock_pending(&self.pending);
        pending.queued.clear();
        pending.on_connection_lost();
    }
}

#[async_trait]
impl MessagingClient for RumqttClient {
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        sink: mpsc::Sender<IncomingMessage>,
    ) -> Result<SubscriptionHandle> {
        // The route exists before the request so retained messages that
        // follow the SUBACK are not lost.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.routes.insert(
            id,
            Route {
                filter: topic.to_string(),
                qos,
                sink,
            },
        );

        let (ack_tx, ack_rx) = oneshot::channel();
        let queued = {
            let mut pending = lock_pending(&self.pending);
            let queued = self.client.try_subscribe(topic, qos);
            if queued.is_ok() {
                pending.queued.push_back(Some(ack_tx));
            }
            queued
        };
        if let Err(e) = queued {
            self.routes.remove(&id);
            anyhow::bail!("MQTT subscribe failed: {e}");
        }

        let acknowledged = match tokio::time::timeout(SUBACK_TIMEOUT, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(anyhow::anyhow!("connection lost before SUBACK")),
            Err(_) => Err(anyhow::anyhow!("no SUBACK within {SUBACK_TIMEOUT:?}")),
        };
        if let Err(e) = acknowledged {
            self.routes.remove(&id);
            anyhow::bail!("MQTT subscribe to '{topic}' failed: {e}");
        }

        debug!("[{}] Subscribed to '{topic}' (route {id})", self.client_id);
        Ok(SubscriptionHandle {
            id,
            topic: topic.to_string(),
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        if self.routes.remove(&handle.id).is_none() {
            warn!("[{}] Unknown subscription {}", self.client_id, handle.id);
            return Ok(());
        }

        let still_used = self.routes.iter().any(|r| r.filter == handle.topic);
        if !still_used {
            self.client
                .unsubscribe(&handle.topic)
                .await
                .map_err(|e| anyhow::anyhow!("MQTT unsubscribe failed: {e}"))?;
        }
        debug!("[{}] Released subscription to '{}'", self.client_id, handle.topic);
        Ok(())
    }
}

/// Forwards `message` to every route whose filter matches its topic.
/// Returns the ids of routes whose receiver is gone.
async fn dispatch(routes: &DashMap<u64, Route>, message: IncomingMessage) -> Vec<u64> {
    // Collect first so no map guard is held across an await.
    let sinks: Vec<_> = routes
        .iter()
        .filter(|r| topic_matches(&r.filter, &message.topic))
        .map(|r| (*r.key(), r.sink.clone()))
        .collect();

    let mut dead = Vec::new();
    for (id, sink) in sinks {
        if sink.send(message.clone()).await.is_err() {
            debug!("Receiver for '{}' is gone", message.topic);
            dead.push(id);
        }
    }
    dead
}

/// Drops dead routes and the broker subscriptions nobody else uses.
fn prune_routes(client_id: &str, client: &AsyncClient, routes: &DashMap<u64, Route>, dead: &[u64]) {
    for id in dead {
        let Some((_, route)) = routes.remove(id) else {
            continue;
        };
        if routes.iter().any(|r| r.filter == route.filter) {
            continue;
        }
        info!("[{client_id}] Dropping abandoned subscription to '{}'", route.filter);
        if let Err(e) = client.try_unsubscribe(&route.filter) {
            warn!("[{client_id}] Could not unsubscribe from '{}': {e}", route.filter);
        }
    }
}

/// Re-issues broker subscriptions after a reconnect without a session.
fn resubscribe_all(
    client_id: &str,
    client: &AsyncClient,
    routes: &DashMap<u64, Route>,
    pending: &StdMutex<PendingSubscribes>,
) {
    let mut filters: Vec<(String, QoS)> = routes
        .iter()
        .map(|r| (r.filter.clone(), r.qos))
        .collect();
    filters.sort_by(|a, b| a.0.cmp(&b.0));
    filters.dedup_by(|a, b| a.0 == b.0);

    let mut pending = lock_pending(pending);
    for (filter, qos) in filters {
        info!("[{client_id}] Restoring subscription to '{filter}'");
        match client.try_subscribe(&filter, qos) {
            Ok(()) => pending.queued.push_back(None),
            Err(e) => error!("[{client_id}] Could not restore subscription to '{filter}': {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(filter: &str) -> (Route, mpsc::Receiver<IncomingMessage>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Route {
                filter: filter.into(),
                qos: QoS::AtMostOnce,
                sink: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_dispatch_matches_filters() {
        let routes = DashMap::new();
        let (wildcard, mut wildcard_rx) = route("home/+/state");
        let (other, mut other_rx) = route("office/#");
        routes.insert(1, wildcard);
        routes.insert(2, other);

        dispatch(&routes, IncomingMessage::new("home/phone1/state", b"{}".to_vec())).await;

        let received = wildcard_rx.recv().await.unwrap();
        assert_eq!(received.topic, "home/phone1/state");
        assert_eq!(received.payload, b"{}");
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispatch_ignores_closed_receivers() {
        let routes = DashMap::new();
        let (closed, closed_rx) = route("#");
        let (open, mut open_rx) = route("#");
        drop(closed_rx);
        routes.insert(1, closed);
        routes.insert(2, open);

        let dead = dispatch(&routes, IncomingMessage::new("a/b", b"x".to_vec())).await;

        assert_eq!(dead, vec![1]);
        assert_eq!(open_rx.recv().await.unwrap().topic, "a/b");
    }

    #[tokio::test]
    async fn test_prune_removes_abandoned_routes() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);
        let routes = DashMap::new();
        let (closed, closed_rx) = route("home/+");
        let (shared, _shared_rx) = route("office/+");
        let (sibling, _sibling_rx) = route("office/+");
        drop(closed_rx);
        routes.insert(1, closed);
        routes.insert(2, shared);
        routes.insert(3, sibling);

        let dead = dispatch(&routes, IncomingMessage::new("home/phone1", b"{}".to_vec())).await;
        prune_routes("test", &client, &routes, &dead);

        assert!(routes.get(&1).is_none());
        assert_eq!(routes.len(), 2);

        // A filter still used by another route keeps its broker subscription.
        prune_routes("test", &client, &routes, &[2]);
        assert_eq!(routes.len(), 1);
        assert!(routes.get(&3).is_some());
    }

    fn suback(pkid: u16, return_codes: Vec<SubscribeReasonCode>) -> SubAck {
        SubAck { pkid, return_codes }
    }

    #[test]
    fn test_check_suback() {
        assert!(check_suback(&suback(1, vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)])).is_ok());
        assert!(check_suback(&suback(1, vec![SubscribeReasonCode::Failure])).is_err());
        assert!(check_suback(&suback(
            1,
            vec![
                SubscribeReasonCode::Success(QoS::AtMostOnce),
                SubscribeReasonCode::Failure,
            ],
        ))
        .is_err());
    }

    #[tokio::test]
    async fn test_refused_suback_reaches_waiting_subscriber() {
        let mut pending = PendingSubscribes::default();
        let (tx, rx) = oneshot::channel();
        pending.queued.push_back(Some(tx));

        pending.on_outgoing(7);
        pending.on_suback(&suback(7, vec![SubscribeReasonCode::Failure]));

        assert!(rx.await.unwrap().is_err());
        assert!(pending.awaiting.is_empty());
    }

    #[tokio::test]
    async fn test_sub_acks_matched_in_send_order() {
        let mut pending = PendingSubscribes::default();
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        pending.queued.push_back(Some(first_tx));
        // A restored subscription nobody waits for.
        pending.queued.push_back(None);
        pending.queued.push_back(Some(second_tx));

        pending.on_outgoing(1);
        pending.on_outgoing(2);
        pending.on_outgoing(3);
        pending.on_suback(&suback(3, vec![SubscribeReasonCode::Failure]));
        pending.on_suback(&suback(2, vec![SubscribeReasonCode::Failure]));
        pending.on_suback(&suback(1, vec![SubscribeReasonCode::Success(QoS::AtMostOnce)]));

        assert!(first_rx.await.unwrap().is_ok());
        assert!(second_rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_connection_loss_fails_waiting_subscriber() {
        let mut pending = PendingSubscribes::default();
        let (tx, rx) = oneshot::channel();
        pending.queued.push_back(Some(tx));
        pending.on_outgoing(4);

        pending.on_connection_lost();

        assert!(rx.await.is_err());
    }
}
