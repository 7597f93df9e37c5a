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

//! Viewport-driven overlay controllers.
//!
//! Each overlay kind (airspaces, airports, receivers, runways) gets its own
//! [`ViewportController`]. The controller debounces viewport changes, hides
//! the overlay when the visible area is too large for that kind of data,
//! and otherwise fetches the features inside the viewport from an
//! [`OverlaySource`].

mod schedule;

pub use schedule::ScheduledTask;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::geo::Bounds;

/// Spatial overlay kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverlayKind {
    Airspaces,
    Airports,
    Receivers,
    Runways,
}

impl OverlayKind {
    pub const ALL: [Self; 4] = [
        Self::Airspaces,
        Self::Airports,
        Self::Receivers,
        Self::Runways,
    ];

    /// Collection name, as used in data endpoint paths.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Airspaces => "airspaces",
            Self::Airports => "airports",
            Self::Receivers => "receivers",
            Self::Runways => "runways",
        }
    }

    /// Threshold and debounce tuned to the density of each kind.
    #[must_use]
    pub fn default_config(self) -> OverlayConfig {
        let (max_area_sq_miles, debounce_ms) = match self {
            Self::Airspaces => (100_000.0, 500),
            Self::Airports => (25_000.0, 300),
            Self::Receivers => (5_000.0, 300),
            Self::Runways => (1_000.0, 300),
        };
        OverlayConfig {
            max_area_sq_miles,
            debounce: Duration::from_millis(debounce_ms),
        }
    }
}

impl fmt::Display for OverlayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-overlay tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayConfig {
    /// The overlay is shown only while the viewport is strictly smaller.
    pub max_area_sq_miles: f64,
    pub debounce: Duration,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

/// Provides overlay features for a bounding box.
#[async_trait]
pub trait OverlaySource: Send + Sync + 'static {
    type Feature: Clone + Send + Sync + 'static;

    async fn fetch(
        &self,
        kind: OverlayKind,
        bounds: Bounds,
    ) -> Result<Vec<Self::Feature>, FetchError>;
}

/// What a debounced check should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Hidden → Shown: fetch and show.
    Show,
    /// Already shown: fetch for the new bounds.
    Refresh,
    /// Shown → Hidden: clear the dataset.
    Hide,
    /// Hidden and staying hidden.
    Idle,
}

/// Pure visibility decision for one check.
#[must_use]
pub fn decide(visible: bool, area_sq_miles: f64, max_area_sq_miles: f64, enabled: bool) -> Decision {
    let should_show = enabled && area_sq_miles < max_area_sq_miles;
    match (visible, should_show) {
        (false, true) => Decision::Show,
        (true, true) => Decision::Refresh,
        (true, false) => Decision::Hide,
        (false, false) => Decision::Idle,
    }
}

/// Published when an overlay's rendered state changes.
#[derive(Debug, Clone)]
pub enum OverlayEvent<F> {
    Shown(Arc<Vec<F>>),
    Updated(Arc<Vec<F>>),
    Hidden,
    Disposed,
}

struct OverlayState<F> {
    visible: bool,
    dataset: Arc<Vec<F>>,
    /// Bumped on every check and on dispose; stale executions compare against it.
    generation: u64,
    disposed: bool,
}

struct Inner<S: OverlaySource> {
    kind: OverlayKind,
    config: OverlayConfig,
    source: Arc<S>,
    state: Mutex<OverlayState<S::Feature>>,
    event_tx: broadcast::Sender<OverlayEvent<S::Feature>>,
}

impl<S: OverlaySource> Inner<S> {
    fn lock(&self) -> MutexGuard<'_, OverlayState<S::Feature>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn execute(&self, bounds: Bounds, enabled: bool, generation: u64) {
        let visible = {
            let state = self.lock();
            if state.disposed || state.generation != generation {
                return;
            }
            state.visible
        };

        let area = bounds.area_sq_miles();
        match decide(visible, area, self.config.max_area_sq_miles, enabled) {
            Decision::Idle => {
                debug!("{} overlay stays hidden ({area:.0} sq mi)", self.kind);
            }
            Decision::Hide => {
                {
                    let mut state = self.lock();
                    state.visible = false;
                    state.dataset = Arc::new(Vec::new());
                }
                info!("Hiding {} overlay ({area:.0} sq mi)", self.kind);
                let _ = self.event_tx.send(OverlayEvent::Hidden);
            }
            decision @ (Decision::Show | Decision::Refresh) => {
                let features = match self.source.fetch(self.kind, bounds).await {
                    Ok(features) => features,
                    Err(e) => {
                        warn!("Failed to fetch {} overlay: {e}", self.kind);
                        return;
                    }
                };
                let dataset = Arc::new(features);
                {
                    let mut state = self.lock();
                    if state.disposed || state.generation != generation {
                        debug!("Discarding stale {} overlay fetch", self.kind);
                        return;
                    }
                    state.visible = true;
                    state.dataset = Arc::clone(&dataset);
                }
                debug!("{} overlay has {} features", self.kind, dataset.len());
                let event = if decision == Decision::Show {
                    info!("Showing {} overlay", self.kind);
                    OverlayEvent::Shown(dataset)
                } else {
                    OverlayEvent::Updated(dataset)
                };
                let _ = self.event_tx.send(event);
            }
        }
    }
}

/// Show/hide controller for one overlay kind.
pub struct ViewportController<S: OverlaySource> {
    inner: Arc<Inner<S>>,
    timer: ScheduledTask,
}

impl<S: OverlaySource> fmt::Debug for ViewportController<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ViewportController")
            .field("kind", &self.inner.kind)
            .field("visible", &state.visible)
            .field("features", &state.dataset.len())
            .field("disposed", &state.disposed)
            .finish_non_exhaustive()
    }
}

impl<S: OverlaySource> ViewportController<S> {
    #[must_use]
    pub fn new(kind: OverlayKind, config: OverlayConfig, source: Arc<S>) -> Self {
        let (event_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                kind,
                config,
                source,
                state: Mutex::new(OverlayState {
                    visible: false,
                    dataset: Arc::new(Vec::new()),
                    generation: 0,
                    disposed: false,
                }),
                event_tx,
            }),
            timer: ScheduledTask::new(),
        }
    }

    /// Controller with the kind's default threshold and debounce.
    #[must_use]
    pub fn with_defaults(kind: OverlayKind, source: Arc<S>) -> Self {
        Self::new(kind, kind.default_config(), source)
    }

    /// Re-evaluate the overlay for a new viewport or setting.
    ///
    /// Debounced: only the last call within the debounce interval runs.
    pub fn check_and_update(&self, bounds: Bounds, enabled: bool) {
        let generation = {
            let mut state = self.inner.lock();
            if state.disposed {
                warn!("check_and_update on disposed {} controller", self.inner.kind);
                return;
            }
            state.generation += 1;
            state.generation
        };

        let inner = Arc::clone(&self.inner);
        self.timer.schedule(self.inner.config.debounce, async move {
            inner.execute(bounds, enabled, generation).await;
        });
    }

    /// Cancel pending work and drop the rendered dataset. Idempotent.
    pub fn dispose(&self) {
        {
            let mut state = self.inner.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.visible = false;
            state.dataset = Arc::new(Vec::new());
            state.generation += 1;
        }
        self.timer.cancel();
        debug!("Disposed {} controller", self.inner.kind);
        let _ = self.inner.event_tx.send(OverlayEvent::Disposed);
    }

    #[must_use]
    pub fn kind(&self) -> OverlayKind {
        self.inner.kind
    }

    #[must_use]
    pub fn config(&self) -> OverlayConfig {
        self.inner.config
    }

    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.inner.lock().visible
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Whether a debounced check is waiting or a fetch is in flight.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.timer.is_pending()
    }

    /// Current dataset; empty while hidden.
    #[must_use]
    pub fn dataset(&self) -> Arc<Vec<S::Feature>> {
        Arc::clone(&self.inner.lock().dataset)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent<S::Feature>> {
        self.inner.event_tx.subscribe()
    }
}

impl<S: OverlaySource> Drop for ViewportController<S> {
    fn drop(&mut self) {
        self.dispose();
    }
}
