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

//! Sessions (one per configuration entry) and the table that owns them.

use std::sync::Arc;

use dashmap::DashMap;
use log::{error, info};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::client::{MessagingClient, SubscriptionHandle};
use crate::config::{ConfigEntry, SessionConfig};
use crate::coordinator::{SubscriptionCoordinator, SubscriptionState};
use crate::error::{ConfigError, SessionError};
use crate::migration::{ConfigMigrator, MigrationState};
use crate::platform::{ConfigStore, EntityPlatform};
use crate::registry::SensorRegistry;
use crate::topic::TopicTemplate;

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub client: Arc<dyn MessagingClient>,
    pub platform: Arc<dyn EntityPlatform>,
    pub store: Arc<dyn ConfigStore>,
}

impl SessionDeps {
    pub fn new(
        client: Arc<dyn MessagingClient>,
        platform: Arc<dyn EntityPlatform>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            client,
            platform,
            store,
        }
    }
}

/// One running instance bound to one configuration entry.
pub struct Session {
    entry_id: String,
    config: SessionConfig,
    migrator: Mutex<ConfigMigrator>,
    coordinator: Arc<SubscriptionCoordinator>,
    store: Arc<dyn ConfigStore>,
}

impl Session {
    /// Builds a session without subscribing.
    ///
    /// Entries without a current `topic_template` are configured as they
    /// will be after migration; the migration itself is persisted by
    /// [`Session::start`].
    pub fn new(entry: &ConfigEntry, deps: &SessionDeps) -> Result<Arc<Self>, SessionError> {
        info!("Setting up {}", entry.entry_id);

        let migrator = ConfigMigrator::new(entry)?;
        let config = match migrator.planned() {
            Some(migration) => migration.config.clone(),
            None => SessionConfig::resolve(entry)?,
        };
        let template = TopicTemplate::parse(&config.topic_template).map_err(ConfigError::from)?;

        let registry = Arc::new(SensorRegistry::new(config.name.clone(), deps.platform.clone()));
        let coordinator = Arc::new(SubscriptionCoordinator::new(
            entry.entry_id.clone(),
            template,
            config.qos_level(),
            registry,
            deps.client.clone(),
            deps.platform.clone(),
        ));

        Ok(Arc::new(Self {
            entry_id: entry.entry_id.clone(),
            config,
            migrator: Mutex::new(migrator),
            coordinator,
            store: deps.store.clone(),
        }))
    }

    /// Schedules the pending migration (if any) and the subscription.
    ///
    /// Returns immediately; the outcome is visible through
    /// [`Session::subscription_state`] or the returned handle.
    pub fn start(self: &Arc<Self>) -> JoinHandle<Result<(), SessionError>> {
        let session = self.clone();
        tokio::spawn(async move { session.run_startup().await })
    }

    async fn run_startup(&self) -> Result<(), SessionError> {
        let migrated = self.migrator.lock().await.run(self.store.as_ref()).await;
        if let Err(e) = &migrated {
            error!("[{}] {e}", self.entry_id);
        }

        self.coordinator.subscribe().await?;
        migrated.map(|_| ())
    }

    /// Drops the current subscription and subscribes again.
    pub async fn resubscribe(&self) -> Result<SubscriptionHandle, SessionError> {
        self.coordinator.subscribe().await
    }

    /// Releases the subscription. Sensors are kept until the session is
    /// dropped.
    pub async fn shutdown(&self) {
        info!("[{}] Shutting down", self.entry_id);
        self.coordinator.unsubscribe().await;
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    /// Effective configuration, after migration when one was pending.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn template(&self) -> &TopicTemplate {
        self.coordinator.template()
    }

    pub fn registry(&self) -> &Arc<SensorRegistry> {
        self.coordinator.registry()
    }

    pub fn coordinator(&self) -> &Arc<SubscriptionCoordinator> {
        &self.coordinator
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.coordinator.state()
    }

    pub fn watch_subscription(&self) -> watch::Receiver<SubscriptionState> {
        self.coordinator.watch_state()
    }

    pub async fn migration_state(&self) -> MigrationState {
        self.migrator.lock().await.state()
    }
}

struct ManagedSession {
    session: Arc<Session>,
    startup: JoinHandle<Result<(), SessionError>>,
}

impl ManagedSession {
    async fn stop(self) {
        self.startup.abort();
        self.session.shutdown().await;
    }
}

/// Live sessions keyed by configuration entry id.
pub struct SessionTable {
    deps: SessionDeps,
    sessions: DashMap<String, ManagedSession>,
}

impl SessionTable {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            deps,
            sessions: DashMap::new(),
        }
    }

    /// Creates and starts the session of `entry`, replacing any session
    /// already registered under the same entry id.
    pub async fn setup_entry(&self, entry: &ConfigEntry) -> Result<Arc<Session>, SessionError> {
        let session = Session::new(entry, &self.deps)?;
        let startup = session.start();

        let previous = self.sessions.insert(
            entry.entry_id.clone(),
            ManagedSession {
                session: session.clone(),
                startup,
            },
        );
        if let Some(previous) = previous {
            info!("[{}] Replacing existing session", entry.entry_id);
            previous.stop().await;
        }
        Ok(session)
    }

    /// Stops and forgets the session of `entry_id`. Returns `false` if none
    /// was registered.
    pub async fn unload_entry(&self, entry_id: &str) -> bool {
        match self.sessions.remove(entry_id) {
            Some((_, managed)) => {
                managed.stop().await;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, entry_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(entry_id).map(|m| m.session.clone())
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|m| m.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Stops every session.
    pub async fn shutdown_all(&self) {
        for entry_id in self.entry_ids() {
            self.unload_entry(&entry_id).await;
        }
    }
}
