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

//! Live telemetry synchronization for glider and aircraft tracking maps.
//!
//! Keeps a client's picture of where every aircraft is consistent with a
//! server-pushed stream while a viewport decides which slice of the world
//! is worth showing. The layers can be used on their own or together:
//!
//! - **Backoff**: reconnect delay policy
//! - **Ledger**: the desired subscription set, independent of the socket
//! - **Protocol**: control frames out, fix and description frames in
//! - **Connection**: WebSocket with reconnection and subscription replay
//! - **Registry**: per-entity current fix, trail and descriptive attributes
//! - **Viewport**: debounced, area-limited overlay fetching
//! - **Aggregation**: clustered vs individual aircraft batches
//!
//! # Quick Start
//!
//! ```no_run
//! use live_feed::{ClientConfig, ConnectionConfig, LiveFeedClient};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut client = LiveFeedClient::spawn(ClientConfig {
//!         connection: ConnectionConfig {
//!             url: "wss://glider.flights/data/fixes/live".to_string(),
//!             ..Default::default()
//!         },
//!         ..Default::default()
//!     });
//!
//!     client.subscribe("5f0c6c0e-3c36-4e0c-9d8a-0f5d7b1e2a11");
//!     while client.process_next().await {
//!         println!("tracking {} aircraft", client.entity_count());
//!     }
//! }
//! ```
//!
//! # Ledger Only
//!
//! ```
//! use live_feed::ledger::{AreaKey, SubscriptionLedger};
//!
//! let mut ledger = SubscriptionLedger::new();
//! assert!(ledger.add_entity("a1"));
//! assert!(!ledger.add_entity("a1"));
//! ledger.add_area(AreaKey::containing(45.6, -121.2));
//! assert_eq!(ledger.replay().len(), 2);
//! ```

pub mod aggregation;
pub mod backoff;
pub mod connection;
pub mod geo;
pub mod ledger;
pub mod protocol;
pub mod registry;
pub mod viewport;

use std::sync::{Arc, RwLock};

use log::debug;
use tokio::sync::broadcast;

pub use aggregation::{AggregationMode, AggregationSwitch, AircraftBatch, ClusterSummary, SearchResponse};
pub use backoff::BackoffPolicy;
pub use connection::{Connection, ConnectionConfig, ConnectionState, FeedEvent};
pub use geo::Bounds;
pub use ledger::{AreaKey, Subscription, SubscriptionLedger};
pub use protocol::{ControlFrame, EntityDescription, Fix, JsonFrameParser, ParseError, Protocol};
pub use registry::{Entity, EntityRegistry, RegistryConfig, RegistryEvent};
pub use viewport::{FetchError, OverlayConfig, OverlayEvent, OverlayKind, OverlaySource, ViewportController};

/// Configuration for the full-stack client.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub registry: RegistryConfig,
}

/// Full-stack client: connection, registry and aggregation gate.
///
/// Owns its connection; there is no process-wide instance. Dropping the
/// client stops the connection task.
pub struct LiveFeedClient {
    registry: Arc<RwLock<EntityRegistry>>,
    connection: Connection,
    aggregation: AggregationSwitch,
    event_tx: broadcast::Sender<FeedEvent>,
}

impl std::fmt::Debug for LiveFeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveFeedClient")
            .field("connection", &self.connection)
            .field("aggregation", &self.aggregation)
            .finish_non_exhaustive()
    }
}

impl LiveFeedClient {
    /// Spawn the connection task. Nothing connects until the first
    /// subscription or an explicit [`connect`](Self::connect).
    #[must_use]
    pub fn spawn(config: ClientConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.registry.event_channel_capacity.max(1));
        Self {
            registry: Arc::new(RwLock::new(EntityRegistry::new(config.registry))),
            connection: Connection::spawn(config.connection),
            aggregation: AggregationSwitch::new(),
            event_tx,
        }
    }

    /// Process the next connection event.
    ///
    /// Fixes and descriptions are merged into the registry before the event
    /// is re-published. Returns `false` once the connection task has stopped.
    ///
    /// ```no_run
    /// # use live_feed::{ClientConfig, LiveFeedClient};
    /// # async fn example() {
    /// let mut client = LiveFeedClient::spawn(ClientConfig::default());
    /// while client.process_next().await {}
    /// # }
    /// ```
    pub async fn process_next(&mut self) -> bool {
        let Some(event) = self.connection.recv().await else {
            return false;
        };

        match &event {
            FeedEvent::FixReceived(fix) => {
                if let Ok(mut registry) = self.registry.write() {
                    registry.apply_fix(fix.clone());
                }
            }
            FeedEvent::EntityReceived(desc) => {
                if let Ok(mut registry) = self.registry.write() {
                    registry.apply_description(desc.clone());
                }
            }
            FeedEvent::StateChanged(state) => debug!("Live feed state: {state:?}"),
            _ => {}
        }

        // No subscribers is fine.
        let _ = self.event_tx.send(event);
        true
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn subscribe(&self, id: impl Into<String>) {
        self.connection.subscribe(id);
    }

    pub fn unsubscribe(&self, id: impl Into<String>) {
        self.connection.unsubscribe(id);
    }

    /// Subscribe to the area cell containing the point.
    pub fn subscribe_area(&self, latitude: f64, longitude: f64) {
        self.connection
            .subscribe_area(AreaKey::containing(latitude, longitude));
    }

    pub fn unsubscribe_area(&self, latitude: f64, longitude: f64) {
        self.connection
            .unsubscribe_area(AreaKey::containing(latitude, longitude));
    }

    /// Subscribe to exactly the area cells covering `bounds`.
    pub fn follow_bounds(&self, bounds: &Bounds) {
        self.connection.follow_bounds(bounds);
    }

    /// Leave area mode; disconnects if no entity subscriptions remain.
    pub fn stop(&self) {
        self.connection.stop();
    }

    /// Record an aircraft search result, seeding the registry when the
    /// batch is individual.
    pub fn apply_batch(&mut self, batch: &AircraftBatch) -> AggregationMode {
        match self.registry.write() {
            Ok(mut registry) => self.aggregation.apply(batch, &mut registry),
            Err(_) => self.aggregation.mode(),
        }
    }

    /// Whether live fixes should be rendered (false while clustered).
    #[must_use]
    pub fn live_updates_enabled(&self) -> bool {
        self.aggregation.accepts_live_updates()
    }

    #[must_use]
    pub fn aggregation(&self) -> &AggregationSwitch {
        &self.aggregation
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Entity> {
        self.registry
            .read()
            .ok()
            .and_then(|registry| registry.get(id).cloned())
    }

    /// Entities with a fix newer than `since` ago.
    #[must_use]
    pub fn list_active(&self, since: chrono::Duration) -> Vec<Entity> {
        self.registry
            .read()
            .map(|registry| registry.list_active(since).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.registry.read().map(|registry| registry.len()).unwrap_or(0)
    }

    /// Evict entities idle for longer than `max_idle`.
    pub fn remove_idle(&self, max_idle: chrono::Duration) -> Vec<String> {
        self.registry
            .write()
            .map(|mut registry| registry.remove_idle(max_idle))
            .unwrap_or_default()
    }

    /// Latest server-to-client delay observed on a fix.
    #[must_use]
    pub fn feed_delay(&self) -> Option<chrono::Duration> {
        self.registry
            .read()
            .ok()
            .and_then(|registry| registry.feed_delay())
    }

    /// Shared registry handle.
    #[must_use]
    pub fn registry(&self) -> Arc<RwLock<EntityRegistry>> {
        Arc::clone(&self.registry)
    }

    /// Subscribe to registry change events.
    #[must_use]
    pub fn subscribe_registry(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry
            .read()
            .map(|registry| registry.subscribe())
            .unwrap_or_else(|_| {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            })
    }

    /// Subscribe to connection-level events as they are processed.
    #[must_use]
    pub fn subscribe_feed(&self) -> broadcast::Receiver<FeedEvent> {
        self.event_tx.subscribe()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Snapshot of the desired subscription set.
    #[must_use]
    pub fn subscriptions(&self) -> SubscriptionLedger {
        self.connection.subscriptions()
    }

    pub fn shutdown(&self) {
        self.connection.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_starts_disconnected() {
        let client = LiveFeedClient::spawn(ClientConfig::default());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert_eq!(client.entity_count(), 0);
        assert!(client.live_updates_enabled());
        assert!(client.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_clustered_batch_disables_live_updates() {
        let mut client = LiveFeedClient::spawn(ClientConfig::default());
        let mode = client.apply_batch(&AircraftBatch::Clustered(Vec::new()));
        assert_eq!(mode, AggregationMode::Clustered);
        assert!(!client.live_updates_enabled());

        let mode = client.apply_batch(&AircraftBatch::Individual(vec![EntityDescription::new("a1")]));
        assert_eq!(mode, AggregationMode::Individual);
        assert!(client.live_updates_enabled());
        assert!(client.get("a1").is_some());
    }

    #[tokio::test]
    async fn test_shutdown_ends_processing() {
        let mut client = LiveFeedClient::spawn(ClientConfig::default());
        client.shutdown();
        assert!(!client.process_next().await);
    }
}
