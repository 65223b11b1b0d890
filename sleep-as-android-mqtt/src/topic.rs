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

//! Topic templates with a single device placeholder.
//!
//! A template such as `home/{device}/state` is turned into the subscription
//! filter `home/+/state`. The device of an incoming topic is read back by
//! segment position, so the filter and the template always have the same
//! number of segments.

use log::warn;

use crate::config::DEVICE_PLACEHOLDER;
use crate::error::TopicTemplateError;

/// MQTT single-level wildcard.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// MQTT multi-level wildcard.
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Device identity returned for topics too short to contain the device.
pub const UNKNOWN_DEVICE: &str = "unknown_device";

const SEPARATOR: char = '/';

/// A configured topic template and its derived subscription filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTemplate {
    configured: String,
    placeholder_index: usize,
    wildcard_topic: String,
}

impl TopicTemplate {
    /// Derives the placeholder position and wildcard topic.
    ///
    /// The index is the first segment equal to [`DEVICE_PLACEHOLDER`]. When
    /// no segment matches, the index falls back to 0 and that segment is
    /// replaced by the wildcard anyway. Use [`TopicTemplate::parse`] to
    /// reject such templates instead.
    pub fn derive(configured_topic: &str) -> Self {
        let mut segments: Vec<&str> = configured_topic.split(SEPARATOR).collect();

        let placeholder_index = match segments.iter().position(|s| *s == DEVICE_PLACEHOLDER) {
            Some(index) => index,
            None => {
                warn!(
                    "Topic '{configured_topic}' has no {DEVICE_PLACEHOLDER} segment, assuming the first segment"
                );
                0
            }
        };

        // split() always yields at least one segment.
        segments[placeholder_index] = SINGLE_LEVEL_WILDCARD;

        Self {
            configured: configured_topic.to_string(),
            placeholder_index,
            wildcard_topic: segments.join("/"),
        }
    }

    /// Like [`TopicTemplate::derive`], but the placeholder must appear
    /// exactly once as a full segment.
    pub fn parse(configured_topic: &str) -> Result<Self, TopicTemplateError> {
        if configured_topic.trim().is_empty() {
            return Err(TopicTemplateError::Empty);
        }

        let occurrences = configured_topic
            .split(SEPARATOR)
            .filter(|s| *s == DEVICE_PLACEHOLDER)
            .count();

        match occurrences {
            1 => Ok(Self::derive(configured_topic)),
            0 => Err(TopicTemplateError::MissingPlaceholder {
                template: configured_topic.to_string(),
                placeholder: DEVICE_PLACEHOLDER,
            }),
            _ => Err(TopicTemplateError::DuplicatePlaceholder {
                template: configured_topic.to_string(),
                placeholder: DEVICE_PLACEHOLDER,
            }),
        }
    }

    /// The template as configured.
    pub fn configured(&self) -> &str {
        &self.configured
    }

    /// Segment position of the placeholder.
    pub fn placeholder_index(&self) -> usize {
        self.placeholder_index
    }

    /// The filter to subscribe to.
    pub fn wildcard_topic(&self) -> &str {
        &self.wildcard_topic
    }

    /// Device identity of a concrete topic received on the wildcard filter.
    pub fn extract_device(&self, raw_topic: &str) -> String {
        extract_device(raw_topic, self.placeholder_index)
    }
}

/// Returns segment `placeholder_index` of `raw_topic`, or
/// [`UNKNOWN_DEVICE`] when the topic is too short. Never fails.
pub fn extract_device(raw_topic: &str, placeholder_index: usize) -> String {
    raw_topic
        .split(SEPARATOR)
        .nth(placeholder_index)
        .unwrap_or(UNKNOWN_DEVICE)
        .to_string()
}

/// MQTT topic filter matching (`+` and a trailing `#`).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_segments = filter.split(SEPARATOR);
    let mut topic_segments = topic.split(SEPARATOR);

    loop {
        match (filter_segments.next(), topic_segments.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
