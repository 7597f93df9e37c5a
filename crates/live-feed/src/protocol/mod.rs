// Copyright 2025 Chris Custine
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

//! Wire protocol for the live fix feed.
//!
//! Outbound traffic is a small set of JSON control frames that add or remove
//! subscriptions. Inbound traffic is JSON data frames discriminated by a
//! `type` field: position fixes and richer entity descriptions.

mod json;

pub use json::JsonFrameParser;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::{AreaKey, Subscription};

/// Errors that can occur while parsing an inbound frame.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for field '{field}': {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("malformed {kind} frame: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A single timestamped position sample for one tracked entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fix {
    /// Stable entity identifier. Fixes nested in a description may omit it.
    #[serde(alias = "deviceId", default)]
    pub aircraft_id: String,
    /// Time the position was measured.
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Altitude above mean sea level in feet.
    pub altitude_msl_feet: Option<i32>,
    /// Track over ground in degrees (0-360, north = 0).
    pub track_degrees: Option<f32>,
    /// Ground speed in knots.
    pub ground_speed_knots: Option<f32>,
    /// Climb rate in feet per minute.
    pub climb_fpm: Option<i32>,
    /// Whether the server considers the entity airborne/active.
    #[serde(rename = "active", default)]
    pub is_active: bool,
    /// Time the server received the packet.
    pub received_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aircraft_model: Option<String>,
}

/// Descriptive attributes for an entity, independent of its position.
///
/// Any field may be absent; absent or blank fields never erase known values
/// when merged into the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDescription {
    #[serde(alias = "aircraftId", alias = "deviceId")]
    pub id: String,
    pub registration: Option<String>,
    pub aircraft_model: Option<String>,
    pub competition_number: Option<String>,
    #[serde(alias = "aircraftTypeOgn")]
    pub aircraft_category: Option<String>,
    pub pilot_name: Option<String>,
    pub home_base_airport_ident: Option<String>,
    pub country_code: Option<String>,
    pub tracker_device_type: Option<String>,
    /// Latest known position, as carried by search results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_fix: Option<Fix>,
    /// Recent fixes used to seed the trail.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixes: Vec<Fix>,
}

impl EntityDescription {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// A decoded inbound data frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Fix(Fix),
    Description(EntityDescription),
}

/// Subscribe or unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

/// Outbound control frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    Device {
        action: SubscriptionAction,
        id: String,
    },
    Area {
        action: SubscriptionAction,
        latitude: i32,
        longitude: i32,
    },
}

impl ControlFrame {
    /// Build the frame that applies `action` to a subscription.
    #[must_use]
    pub fn new(action: SubscriptionAction, subscription: &Subscription) -> Self {
        match subscription {
            Subscription::Entity(id) => Self::Device {
                action,
                id: id.clone(),
            },
            Subscription::Area(AreaKey {
                latitude,
                longitude,
            }) => Self::Area {
                action,
                latitude: *latitude,
                longitude: *longitude,
            },
        }
    }

    #[must_use]
    pub fn subscribe(subscription: &Subscription) -> Self {
        Self::new(SubscriptionAction::Subscribe, subscription)
    }

    #[must_use]
    pub fn unsubscribe(subscription: &Subscription) -> Self {
        Self::new(SubscriptionAction::Unsubscribe, subscription)
    }

    #[must_use]
    pub fn action(&self) -> SubscriptionAction {
        match self {
            Self::Device { action, .. } | Self::Area { action, .. } => *action,
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Trait for frame parsers.
///
/// Returns `Ok(Some(frame))` for a recognised frame, `Ok(None)` for a valid
/// frame this client does not consume, or an error for malformed input.
pub trait Protocol {
    /// The message type produced by this parser.
    type Message;
    /// The error type for parsing failures.
    type Error;

    fn parse(&mut self, input: &[u8]) -> Result<Option<Self::Message>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_device_control_frame_json() {
        let frame = ControlFrame::subscribe(&Subscription::Entity("abc".to_string()));
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "device", "action": "subscribe", "id": "abc"})
        );
    }

    #[test]
    fn test_area_control_frame_json() {
        let frame = ControlFrame::unsubscribe(&Subscription::Area(AreaKey::new(45, -121)));
        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "area", "action": "unsubscribe", "latitude": 45, "longitude": -121})
        );
        assert_eq!(frame.action(), SubscriptionAction::Unsubscribe);
    }
}
