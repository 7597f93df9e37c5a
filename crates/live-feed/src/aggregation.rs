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

//! Clustered vs individual aircraft batches.
//!
//! The aircraft search endpoint decides per request whether to return
//! individual aircraft or density clusters. Clusters cannot be patched by
//! single-entity fixes, so while the last batch was clustered the live
//! update stream is held back from the renderer.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::geo::Bounds;
use crate::protocol::EntityDescription;
use crate::registry::{EntityRegistry, RegistryEvent};

/// A group of aircraft summarised by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub count: i64,
    pub bounds: Bounds,
}

/// One entry of an aircraft search response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SearchItem {
    Aircraft { data: Box<EntityDescription> },
    Cluster { data: ClusterSummary },
}

/// Body of the aircraft bounding-box search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub items: Vec<SearchItem>,
    pub total: i64,
    pub clustered: bool,
}

/// An aircraft batch, either individual aircraft or clusters, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum AircraftBatch {
    Individual(Vec<EntityDescription>),
    Clustered(Vec<ClusterSummary>),
}

impl AircraftBatch {
    #[must_use]
    pub fn mode(&self) -> AggregationMode {
        match self {
            Self::Individual(_) => AggregationMode::Individual,
            Self::Clustered(_) => AggregationMode::Clustered,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Individual(aircraft) => aircraft.len(),
            Self::Clustered(clusters) => clusters.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<SearchResponse> for AircraftBatch {
    fn from(response: SearchResponse) -> Self {
        let mut aircraft = Vec::new();
        let mut clusters = Vec::new();
        for item in response.items {
            match item {
                SearchItem::Aircraft { data } => aircraft.push(*data),
                SearchItem::Cluster { data } => clusters.push(data),
            }
        }

        if response.clustered {
            if !aircraft.is_empty() {
                debug!("Dropping {} aircraft from a clustered response", aircraft.len());
            }
            Self::Clustered(clusters)
        } else {
            if !clusters.is_empty() {
                warn!("Dropping {} clusters from an individual response", clusters.len());
            }
            Self::Individual(aircraft)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregationMode {
    #[default]
    Individual,
    Clustered,
}

/// Tracks the mode of the most recent batch and gates live updates.
#[derive(Debug, Default)]
pub struct AggregationSwitch {
    mode: AggregationMode,
}

impl AggregationSwitch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn mode(&self) -> AggregationMode {
        self.mode
    }

    /// Record a freshly fetched batch, seeding the registry when individual.
    pub fn apply(&mut self, batch: &AircraftBatch, registry: &mut EntityRegistry) -> AggregationMode {
        self.apply_at(batch, registry, Utc::now())
    }

    pub fn apply_at(
        &mut self,
        batch: &AircraftBatch,
        registry: &mut EntityRegistry,
        now: DateTime<Utc>,
    ) -> AggregationMode {
        let mode = batch.mode();
        if mode != self.mode {
            info!("Aircraft layer switched to {mode:?} mode");
        }
        self.mode = mode;

        if let AircraftBatch::Individual(aircraft) = batch {
            for description in aircraft {
                registry.apply_description_at(description.clone(), now);
            }
        }
        mode
    }

    /// Whether single-entity live updates may be rendered.
    #[must_use]
    pub fn accepts_live_updates(&self) -> bool {
        self.mode == AggregationMode::Individual
    }

    /// Whether a registry event should reach the renderer in the current mode.
    #[must_use]
    pub fn admits(&self, event: &RegistryEvent) -> bool {
        match event {
            RegistryEvent::EntityCreated(_)
            | RegistryEvent::FixReceived(_)
            | RegistryEvent::EntityReceived(_) => self.accepts_live_updates(),
            RegistryEvent::EntityRemoved(_) => true,
        }
    }
}
