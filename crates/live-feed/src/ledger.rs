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

//! Subscription ledger.
//!
//! The ledger records which live subscriptions the client *wants*, whatever
//! the state of the connection. Disconnection never clears it; the
//! connection replays every entry after each successful (re)connect.
//!
//! Replay walks the ledger in its iteration order (entities sorted by ID,
//! then areas sorted by cell), not in the order the subscribe calls were
//! made. Ordering across a reconnect boundary is therefore relaxed: only
//! the final set is guaranteed.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::geo::Bounds;

/// A whole-degree area cell the server streams nearby traffic for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AreaKey {
    pub latitude: i32,
    pub longitude: i32,
}

/// Largest area set a single sync may request.
pub const MAX_AREA_CELLS: usize = 1024;

impl AreaKey {
    #[must_use]
    pub fn new(latitude: i32, longitude: i32) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// The cell containing a coordinate.
    #[must_use]
    pub fn containing(lat: f64, lon: f64) -> Self {
        Self::new(cell_latitude(lat), cell_longitude(lon))
    }

    /// Every cell a bounding box touches.
    ///
    /// Crossing the antimeridian wraps the longitude range.
    #[must_use]
    pub fn covering(bounds: &Bounds) -> Vec<Self> {
        let south = cell_latitude(bounds.south);
        let north = cell_latitude(bounds.north);
        let west = cell_longitude(bounds.west);
        let east = cell_longitude(bounds.east);

        let longitudes: Vec<i32> = if bounds.east >= bounds.west {
            (west..=east).collect()
        } else {
            (west..180).chain(-180..=east).collect()
        };

        let mut cells = Vec::new();
        for lat in south..=north {
            for &lon in &longitudes {
                cells.push(Self::new(lat, lon));
            }
        }
        cells
    }
}

// The north pole and the antimeridian close the last cell instead of opening a new one.
#[allow(clippy::cast_possible_truncation, reason = "clamped to +/-90")]
fn cell_latitude(lat: f64) -> i32 {
    lat.floor().clamp(-90.0, 89.0) as i32
}

#[allow(clippy::cast_possible_truncation, reason = "clamped to +/-180")]
fn cell_longitude(lon: f64) -> i32 {
    lon.floor().clamp(-180.0, 179.0) as i32
}

impl fmt::Display for AreaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "area.{}.{}", self.latitude, self.longitude)
    }
}

/// One desired live subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    /// Fixes for a single tracked entity.
    Entity(String),
    /// All traffic around an area cell.
    Area(AreaKey),
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(id) => write!(f, "device.{id}"),
            Self::Area(area) => area.fmt(f),
        }
    }
}

/// Result of reconciling the area set with a new desired set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AreaDiff {
    pub added: Vec<AreaKey>,
    pub removed: Vec<AreaKey>,
}

impl AreaDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Desired set of entity and area subscriptions.
///
/// Every mutation returns whether the set actually changed, so callers only
/// emit wire frames for real changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionLedger {
    entities: BTreeSet<String>,
    areas: BTreeSet<AreaKey>,
}

impl SubscriptionLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity subscription. Returns `false` if already present.
    pub fn add_entity(&mut self, id: &str) -> bool {
        if self.entities.contains(id) {
            return false;
        }
        self.entities.insert(id.to_owned())
    }

    /// Remove an entity subscription. Returns `false` if it was absent.
    pub fn remove_entity(&mut self, id: &str) -> bool {
        self.entities.remove(id)
    }

    /// Add an area subscription. Returns `false` if already present.
    pub fn add_area(&mut self, area: AreaKey) -> bool {
        self.areas.insert(area)
    }

    /// Remove an area subscription. Returns `false` if it was absent.
    pub fn remove_area(&mut self, area: AreaKey) -> bool {
        self.areas.remove(&area)
    }

    /// Replace the area set, returning what changed.
    pub fn sync_areas(&mut self, desired: impl IntoIterator<Item = AreaKey>) -> AreaDiff {
        let desired: BTreeSet<AreaKey> = desired.into_iter().collect();
        let diff = AreaDiff {
            added: desired.difference(&self.areas).copied().collect(),
            removed: self.areas.difference(&desired).copied().collect(),
        };
        self.areas = desired;
        diff
    }

    /// Drop every area subscription, returning the removed cells.
    pub fn clear_areas(&mut self) -> Vec<AreaKey> {
        std::mem::take(&mut self.areas).into_iter().collect()
    }

    #[must_use]
    pub fn contains_entity(&self, id: &str) -> bool {
        self.entities.contains(id)
    }

    #[must_use]
    pub fn contains_area(&self, area: AreaKey) -> bool {
        self.areas.contains(&area)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.areas.is_empty()
    }

    #[must_use]
    pub fn has_entities(&self) -> bool {
        !self.entities.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len() + self.areas.len()
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().map(String::as_str)
    }

    pub fn areas(&self) -> impl Iterator<Item = AreaKey> + '_ {
        self.areas.iter().copied()
    }

    /// Every entry in replay order.
    #[must_use]
    pub fn replay(&self) -> Vec<Subscription> {
        self.entities
            .iter()
            .cloned()
            .map(Subscription::Entity)
            .chain(self.areas.iter().copied().map(Subscription::Area))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_add_entity_is_idempotent() {
        let mut ledger = SubscriptionLedger::new();
        assert!(ledger.add_entity("A"));
        assert!(!ledger.add_entity("A"));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_remove_absent_entity() {
        let mut ledger = SubscriptionLedger::new();
        assert!(!ledger.remove_entity("A"));
        ledger.add_entity("A");
        assert!(ledger.remove_entity("A"));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_replay_order() {
        let mut ledger = SubscriptionLedger::new();
        ledger.add_area(AreaKey::new(45, -121));
        ledger.add_entity("B");
        ledger.add_entity("A");
        assert_eq!(
            ledger.replay(),
            vec![
                Subscription::Entity("A".to_string()),
                Subscription::Entity("B".to_string()),
                Subscription::Area(AreaKey::new(45, -121)),
            ]
        );
    }

    #[test]
    fn test_area_containing_floors() {
        assert_eq!(AreaKey::containing(45.7, -120.2), AreaKey::new(45, -121));
        assert_eq!(AreaKey::containing(-0.5, 0.5), AreaKey::new(-1, 0));
    }

    #[test]
    fn test_area_covering() {
        let cells = AreaKey::covering(&Bounds::new(46.2, 45.1, -120.5, -121.5));
        assert_eq!(cells.len(), 4);
        assert!(cells.contains(&AreaKey::new(45, -122)));
        assert!(cells.contains(&AreaKey::new(46, -121)));
    }

    #[test]
    fn test_area_covering_antimeridian() {
        let cells = AreaKey::covering(&Bounds::new(0.5, 0.2, -179.5, 179.5));
        assert_eq!(cells, vec![AreaKey::new(0, 179), AreaKey::new(0, -180)]);
    }

    #[test]
    fn test_area_covering_closes_at_edges() {
        let cells = AreaKey::covering(&Bounds::new(1.0, 0.5, 180.0, 179.5));
        assert_eq!(cells, vec![AreaKey::new(0, 179), AreaKey::new(1, 179)]);
        assert_eq!(AreaKey::containing(90.0, 180.0), AreaKey::new(89, 179));

        let world = AreaKey::covering(&Bounds::new(90.0, -90.0, 180.0, -180.0));
        assert_eq!(world.len(), 180 * 360);
    }

    #[test]
    fn test_sync_areas_diff() {
        let mut ledger = SubscriptionLedger::new();
        ledger.add_area(AreaKey::new(1, 1));
        ledger.add_area(AreaKey::new(2, 2));
        let diff = ledger.sync_areas([AreaKey::new(2, 2), AreaKey::new(3, 3)]);
        assert_eq!(diff.added, vec![AreaKey::new(3, 3)]);
        assert_eq!(diff.removed, vec![AreaKey::new(1, 1)]);
        assert!(ledger.contains_area(AreaKey::new(3, 3)));
        assert!(!ledger.contains_area(AreaKey::new(1, 1)));
    }

    #[test]
    fn test_clear_areas_keeps_entities() {
        let mut ledger = SubscriptionLedger::new();
        ledger.add_entity("A");
        ledger.add_area(AreaKey::new(1, 1));
        assert_eq!(ledger.clear_areas(), vec![AreaKey::new(1, 1)]);
        assert!(ledger.contains_entity("A"));
        assert!(!ledger.is_empty());
    }

    #[test]
    fn test_subscription_display() {
        assert_eq!(Subscription::Entity("X".into()).to_string(), "device.X");
        assert_eq!(Subscription::Area(AreaKey::new(4, -7)).to_string(), "area.4.-7");
    }
}
