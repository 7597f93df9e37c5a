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

//! Entity registry.
//!
//! Merges inbound fixes and descriptions into per-entity state and emits
//! change events. The newest *arrival* always becomes the current fix; the
//! trail is kept in timestamp order and pruned to a configurable window.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use log::debug;
use tokio::sync::broadcast;

use crate::protocol::{EntityDescription, Fix};

/// Descriptive attributes kept for an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityAttributes {
    pub registration: Option<String>,
    pub aircraft_model: Option<String>,
    pub competition_number: Option<String>,
    pub aircraft_category: Option<String>,
    pub pilot_name: Option<String>,
    pub home_base_airport_ident: Option<String>,
    pub country_code: Option<String>,
    pub tracker_device_type: Option<String>,
}

impl EntityAttributes {
    /// Merge non-blank fields from a description. Returns whether anything changed.
    fn merge(&mut self, desc: &EntityDescription) -> bool {
        let mut changed = false;
        changed |= merge_field(&mut self.registration, desc.registration.as_deref());
        changed |= merge_field(&mut self.aircraft_model, desc.aircraft_model.as_deref());
        changed |= merge_field(
            &mut self.competition_number,
            desc.competition_number.as_deref(),
        );
        changed |= merge_field(&mut self.aircraft_category, desc.aircraft_category.as_deref());
        changed |= merge_field(&mut self.pilot_name, desc.pilot_name.as_deref());
        changed |= merge_field(
            &mut self.home_base_airport_ident,
            desc.home_base_airport_ident.as_deref(),
        );
        changed |= merge_field(&mut self.country_code, desc.country_code.as_deref());
        changed |= merge_field(
            &mut self.tracker_device_type,
            desc.tracker_device_type.as_deref(),
        );
        changed
    }
}

fn merge_field(slot: &mut Option<String>, incoming: Option<&str>) -> bool {
    match incoming.map(str::trim) {
        Some(value) if !value.is_empty() && slot.as_deref() != Some(value) => {
            *slot = Some(value.to_owned());
            true
        }
        _ => false,
    }
}

/// A tracked aircraft or device.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: String,
    /// Most recently arrived fix.
    pub current_fix: Option<Fix>,
    /// Prior fixes in timestamp order, used for trails.
    pub history: VecDeque<Fix>,
    pub attributes: EntityAttributes,
    /// Local time of the last message for this entity.
    pub last_update: DateTime<Utc>,
}

impl Entity {
    fn new(id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            current_fix: None,
            history: VecDeque::new(),
            attributes: EntityAttributes::default(),
            last_update: now,
        }
    }

    /// Insert a fix into the trail at its timestamp position.
    ///
    /// A fix with the same timestamp as an existing entry replaces it.
    fn insert_history(&mut self, fix: Fix) {
        let idx = self
            .history
            .partition_point(|existing| existing.timestamp < fix.timestamp);
        match self.history.get(idx) {
            Some(existing) if existing.timestamp == fix.timestamp => self.history[idx] = fix,
            _ => self.history.insert(idx, fix),
        }
    }

    fn prune_history(&mut self, cutoff: DateTime<Utc>) {
        while self
            .history
            .front()
            .is_some_and(|oldest| oldest.timestamp < cutoff)
        {
            self.history.pop_front();
        }
    }
}

/// Events emitted by the registry when entity state changes.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// First message for a new entity.
    EntityCreated(String),
    /// A fix was applied.
    FixReceived(Fix),
    /// A description was merged.
    EntityReceived(EntityDescription),
    /// An entity was removed by an explicit idle sweep.
    EntityRemoved(String),
}

/// Configuration for the entity registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How far back trails reach.
    pub trail_window: Duration,
    /// Broadcast channel capacity for events.
    pub event_channel_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            trail_window: Duration::hours(2),
            event_channel_capacity: 256,
        }
    }
}

/// Registry of tracked entities.
pub struct EntityRegistry {
    entities: HashMap<String, Entity>,
    trail_window: Duration,
    feed_delay: Option<Duration>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("entity_count", &self.entities.len())
            .field("trail_window", &self.trail_window)
            .field("feed_delay", &self.feed_delay)
            .finish_non_exhaustive()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl EntityRegistry {
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            entities: HashMap::new(),
            trail_window: config.trail_window,
            feed_delay: None,
            event_tx,
        }
    }

    /// Apply a fix, pruning relative to the current wall clock.
    pub fn apply_fix(&mut self, fix: Fix) {
        self.apply_fix_at(fix, Utc::now());
    }

    /// Apply a fix, treating `now` as the local receipt time.
    pub fn apply_fix_at(&mut self, fix: Fix, now: DateTime<Utc>) {
        if let Some(received_at) = fix.received_at {
            self.feed_delay = Some(now - received_at);
        }

        let cutoff = now - self.trail_window;
        let entity = self.entry(&fix.aircraft_id, now);

        let attributes_changed = entity.attributes.merge(&EntityDescription {
            registration: fix.registration.clone(),
            aircraft_model: fix.aircraft_model.clone(),
            ..EntityDescription::new(fix.aircraft_id.clone())
        });
        if attributes_changed {
            debug!("Attributes for {} updated from fix", fix.aircraft_id);
        }

        entity.current_fix = Some(fix.clone());
        entity.insert_history(fix.clone());
        entity.prune_history(cutoff);
        entity.last_update = now;

        let _ = self.event_tx.send(RegistryEvent::FixReceived(fix));
    }

    /// Merge a description, pruning relative to the current wall clock.
    pub fn apply_description(&mut self, desc: EntityDescription) {
        self.apply_description_at(desc, Utc::now());
    }

    /// Merge a description and seed the trail from any fixes it carries.
    pub fn apply_description_at(&mut self, desc: EntityDescription, now: DateTime<Utc>) {
        let cutoff = now - self.trail_window;
        let entity = self.entry(&desc.id, now);

        entity.attributes.merge(&desc);

        let owned = |seeded: &Fix| {
            let mut fix = seeded.clone();
            if fix.aircraft_id.is_empty() {
                fix.aircraft_id.clone_from(&desc.id);
            }
            fix
        };
        for seeded in desc.fixes.iter().chain(desc.current_fix.as_ref()) {
            entity.insert_history(owned(seeded));
        }
        entity.prune_history(cutoff);

        if entity.current_fix.is_none() {
            entity.current_fix = desc
                .current_fix
                .as_ref()
                .map(owned)
                .or_else(|| entity.history.back().cloned());
        }
        entity.last_update = now;

        let _ = self.event_tx.send(RegistryEvent::EntityReceived(desc));
    }

    fn entry(&mut self, id: &str, now: DateTime<Utc>) -> &mut Entity {
        let event_tx = &self.event_tx;
        self.entities.entry(id.to_owned()).or_insert_with(|| {
            debug!("Tracking new entity {id}");
            let _ = event_tx.send(RegistryEvent::EntityCreated(id.to_owned()));
            Entity::new(id.to_owned(), now)
        })
    }

    /// Get an entity by ID.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Entities whose current fix is newer than `since` ago.
    #[must_use]
    pub fn list_active(&self, since: Duration) -> Vec<&Entity> {
        self.list_active_at(since, Utc::now())
    }

    #[must_use]
    pub fn list_active_at(&self, since: Duration, now: DateTime<Utc>) -> Vec<&Entity> {
        let threshold = now - since;
        self.entities
            .values()
            .filter(|entity| {
                entity
                    .current_fix
                    .as_ref()
                    .is_some_and(|fix| fix.timestamp > threshold)
            })
            .collect()
    }

    /// Prune every trail to the window.
    pub fn prune_history(&mut self) {
        self.prune_history_at(Utc::now());
    }

    pub fn prune_history_at(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.trail_window;
        for entity in self.entities.values_mut() {
            entity.prune_history(cutoff);
        }
    }

    /// Remove entities without a fix newer than `max_idle`.
    ///
    /// The registry never calls this itself; eviction is a caller policy.
    pub fn remove_idle(&mut self, max_idle: Duration) -> Vec<String> {
        self.remove_idle_at(max_idle, Utc::now())
    }

    pub fn remove_idle_at(&mut self, max_idle: Duration, now: DateTime<Utc>) -> Vec<String> {
        let threshold = now - max_idle;
        let removed: Vec<String> = self
            .entities
            .values()
            .filter(|entity| {
                entity
                    .current_fix
                    .as_ref()
                    .map_or(entity.last_update, |fix| fix.timestamp)
                    <= threshold
            })
            .map(|entity| entity.id.clone())
            .collect();

        for id in &removed {
            self.entities.remove(id);
            let _ = self.event_tx.send(RegistryEvent::EntityRemoved(id.clone()));
        }
        removed
    }

    /// Latest gap between server receipt and local receipt of a fix.
    #[must_use]
    pub fn feed_delay(&self) -> Option<Duration> {
        self.feed_delay
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Subscribe to registry events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn fix(id: &str, secs: i64) -> Fix {
        Fix {
            aircraft_id: id.to_string(),
            timestamp: at(secs),
            latitude: 45.0 + secs as f64 / 1000.0,
            longitude: -121.0,
            altitude_msl_feet: Some(5000),
            track_degrees: None,
            ground_speed_knots: None,
            climb_fpm: None,
            is_active: true,
            received_at: None,
            registration: None,
            aircraft_model: None,
        }
    }

    fn registry(window_secs: i64) -> EntityRegistry {
        EntityRegistry::new(RegistryConfig {
            trail_window: Duration::seconds(window_secs),
            ..Default::default()
        })
    }

    #[test]
    fn test_fixes_update_current_and_history() {
        let mut registry = registry(600);
        registry.apply_fix_at(fix("X", 0), at(0));
        registry.apply_fix_at(fix("X", 10), at(10));

        let entity = registry.get("X").unwrap();
        assert_eq!(entity.current_fix.as_ref().unwrap().timestamp, at(10));
        assert_eq!(entity.history.len(), 2);
    }

    #[test]
    fn test_history_pruned_outside_window() {
        let mut registry = registry(60);
        registry.apply_fix_at(fix("X", 0), at(0));
        registry.apply_fix_at(fix("X", 30), at(30));
        assert_eq!(registry.get("X").unwrap().history.len(), 2);

        registry.prune_history_at(at(75));
        let entity = registry.get("X").unwrap();
        assert_eq!(entity.history.len(), 1);
        assert_eq!(entity.history[0].timestamp, at(30));

        registry.prune_history_at(at(200));
        assert!(registry.get("X").unwrap().history.is_empty());
        assert!(registry.get("X").unwrap().current_fix.is_some());
    }

    #[test]
    fn test_out_of_order_fix_still_becomes_current() {
        let mut registry = registry(600);
        registry.apply_fix_at(fix("X", 20), at(20));
        registry.apply_fix_at(fix("X", 10), at(21));

        let entity = registry.get("X").unwrap();
        assert_eq!(entity.current_fix.as_ref().unwrap().timestamp, at(10));
        let times: Vec<_> = entity.history.iter().map(|f| f.timestamp).collect();
        assert_eq!(times, vec![at(10), at(20)]);
    }

    #[test]
    fn test_description_merge_is_non_destructive() {
        let mut registry = registry(600);
        registry.apply_description_at(
            EntityDescription {
                registration: Some("N123".to_string()),
                aircraft_model: Some("ASK 21".to_string()),
                ..EntityDescription::new("X")
            },
            at(0),
        );
        registry.apply_description_at(
            EntityDescription {
                registration: None,
                aircraft_model: Some("  ".to_string()),
                pilot_name: Some("Ada".to_string()),
                ..EntityDescription::new("X")
            },
            at(1),
        );

        let attrs = &registry.get("X").unwrap().attributes;
        assert_eq!(attrs.registration.as_deref(), Some("N123"));
        assert_eq!(attrs.aircraft_model.as_deref(), Some("ASK 21"));
        assert_eq!(attrs.pilot_name.as_deref(), Some("Ada"));
    }

    #[test]
    fn test_description_seeds_history() {
        let mut registry = registry(600);
        let seeded = fix("", 5);
        registry.apply_description_at(
            EntityDescription {
                fixes: vec![fix("X", 0), seeded],
                ..EntityDescription::new("X")
            },
            at(10),
        );

        let entity = registry.get("X").unwrap();
        assert_eq!(entity.history.len(), 2);
        assert!(entity.history.iter().all(|f| f.aircraft_id == "X"));
        assert_eq!(entity.current_fix.as_ref().unwrap().timestamp, at(5));
    }

    #[test]
    fn test_description_current_fix_becomes_position() {
        let mut registry = registry(600);
        registry.apply_description_at(
            EntityDescription {
                current_fix: Some(fix("", 8)),
                ..EntityDescription::new("X")
            },
            at(10),
        );

        let entity = registry.get("X").unwrap();
        let current = entity.current_fix.as_ref().unwrap();
        assert_eq!(current.aircraft_id, "X");
        assert_eq!(current.timestamp, at(8));
        assert_eq!(entity.history.len(), 1);
        assert_eq!(registry.list_active_at(Duration::seconds(60), at(10)).len(), 1);
    }

    #[test]
    fn test_seeding_keeps_live_current_fix() {
        let mut registry = registry(600);
        registry.apply_fix_at(fix("X", 50), at(50));
        registry.apply_description_at(
            EntityDescription {
                fixes: vec![fix("X", 40), fix("X", 50)],
                ..EntityDescription::new("X")
            },
            at(51),
        );

        let entity = registry.get("X").unwrap();
        assert_eq!(entity.current_fix.as_ref().unwrap().timestamp, at(50));
        assert_eq!(entity.history.len(), 2);
    }

    #[test]
    fn test_fix_carried_registration_merges() {
        let mut registry = registry(600);
        let mut first = fix("X", 0);
        first.registration = Some("D-1234".to_string());
        registry.apply_fix_at(first, at(0));
        registry.apply_fix_at(fix("X", 1), at(1));
        assert_eq!(
            registry.get("X").unwrap().attributes.registration.as_deref(),
            Some("D-1234")
        );
    }

    #[test]
    fn test_list_active() {
        let mut registry = registry(600);
        registry.apply_fix_at(fix("old", 0), at(0));
        registry.apply_fix_at(fix("new", 290), at(290));
        registry.apply_description_at(EntityDescription::new("nofix"), at(290));

        let active = registry.list_active_at(Duration::seconds(60), at(300));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "new");
    }

    #[test]
    fn test_feed_delay() {
        let mut registry = registry(600);
        let mut delayed = fix("X", 0);
        delayed.received_at = Some(at(1));
        registry.apply_fix_at(delayed, at(4));
        assert_eq!(registry.feed_delay(), Some(Duration::seconds(3)));
    }

    #[test]
    fn test_remove_idle() {
        let mut registry = registry(600);
        let mut events = registry.subscribe();
        registry.apply_fix_at(fix("old", 0), at(0));
        registry.apply_fix_at(fix("new", 100), at(100));

        let removed = registry.remove_idle_at(Duration::seconds(60), at(120));
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(registry.get("old").is_none());
        assert_eq!(registry.len(), 1);

        let mut saw_removed = false;
        while let Ok(event) = events.try_recv() {
            if let RegistryEvent::EntityRemoved(id) = event {
                saw_removed = id == "old";
            }
        }
        assert!(saw_removed);
    }

    #[test]
    fn test_events_emitted() {
        let mut registry = registry(600);
        let mut events = registry.subscribe();
        registry.apply_fix_at(fix("X", 0), at(0));

        assert!(matches!(events.try_recv(), Ok(RegistryEvent::EntityCreated(id)) if id == "X"));
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::FixReceived(f)) if f.aircraft_id == "X"));
    }
}
