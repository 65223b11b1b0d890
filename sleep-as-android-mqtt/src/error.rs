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

//! Error types shared across the crate.

use thiserror::Error;

/// A configured topic template that cannot be used for a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicTemplateError {
    #[error("topic template is empty")]
    Empty,

    #[error("topic template '{template}' has no '{placeholder}' segment")]
    MissingPlaceholder {
        template: String,
        placeholder: &'static str,
    },

    #[error("topic template '{template}' contains '{placeholder}' more than once")]
    DuplicatePlaceholder {
        template: String,
        placeholder: &'static str,
    },
}

/// Invalid values in a configuration entry.
///
/// Missing keys are not errors; they fall back to defaults when the
/// configuration is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("qos must be 0, 1 or 2 (got {0})")]
    InvalidQos(i64),

    #[error(transparent)]
    Template(#[from] TopicTemplateError),
}

/// Errors reported by the host entity platform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// The host has not finished registering the entity yet. Callers treat
    /// this as non-fatal.
    #[error("entity '{entity_id}' is not registered yet")]
    EntityNotYetRegistered { entity_id: String },

    #[error("host rejected request: {0}")]
    Rejected(String),
}

/// Errors surfaced by a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The messaging client refused the subscription. Not retried.
    #[error("subscribe to '{topic}' failed: {source}")]
    SubscribeFailed {
        topic: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("configuration migration failed: {0}")]
    Migration(#[source] anyhow::Error),
}
