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

//! Application configuration management.
//!
//! Persistent settings are stored in TOML via `confy`. Every field has a
//! serde default so older config files keep loading as fields are added.

use std::time::Duration;

use live_feed::{BackoffPolicy, ConnectionConfig, OverlayConfig, OverlayKind, RegistryConfig};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "soar-live";

/// Default live feed WebSocket endpoint
pub const DEFAULT_FEED_URL: &str = live_feed::connection::DEFAULT_FEED_URL;

/// Default REST API base URL
pub const DEFAULT_API_URL: &str = "http://localhost:1337";

/// Settings for one spatial overlay
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OverlaySettings {
    /// Whether the overlay is enabled at all
    pub enabled: bool,

    /// Hide the overlay when the viewport is at least this large
    pub max_area_sq_miles: f64,

    /// Debounce interval for viewport changes
    pub debounce_ms: u64,
}

impl OverlaySettings {
    fn for_kind(kind: OverlayKind) -> Self {
        let defaults = kind.default_config();
        Self {
            enabled: true,
            max_area_sq_miles: defaults.max_area_sq_miles,
            debounce_ms: u64::try_from(defaults.debounce.as_millis()).unwrap_or(u64::MAX),
        }
    }

    #[must_use]
    pub fn overlay_config(&self) -> OverlayConfig {
        OverlayConfig {
            max_area_sq_miles: self.max_area_sq_miles,
            debounce: Duration::from_millis(self.debounce_ms),
        }
    }
}

/// Application configuration stored in TOML format
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    /// Configuration schema version for migrations
    #[serde(default = "default_config_version")]
    pub config_version: u32,

    /// Live feed WebSocket URL
    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// REST API base URL for overlays and aircraft search
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// First reconnect delay; later attempts double it
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Delay between opening the socket and replaying subscriptions
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// How far back aircraft trails reach
    #[serde(default = "default_trail_window_minutes")]
    pub trail_window_minutes: i64,

    /// Aircraft without a fix for this long are dropped from the display
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: i64,

    #[serde(default = "default_airspaces")]
    pub airspaces: OverlaySettings,

    #[serde(default = "default_airports")]
    pub airports: OverlaySettings,

    #[serde(default = "default_receivers")]
    pub receivers: OverlaySettings,

    #[serde(default = "default_runways")]
    pub runways: OverlaySettings,

    /// Aircraft ids followed across sessions
    #[serde(default)]
    pub watchlist: Vec<String>,
}

// Default value functions for serde
fn default_config_version() -> u32 {
    1
}

fn default_feed_url() -> String {
    DEFAULT_FEED_URL.to_string()
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    live_feed::backoff::DEFAULT_MAX_ATTEMPTS
}

fn default_settle_delay_ms() -> u64 {
    100
}

fn default_trail_window_minutes() -> i64 {
    120
}

fn default_idle_timeout_minutes() -> i64 {
    30
}

fn default_airspaces() -> OverlaySettings {
    OverlaySettings::for_kind(OverlayKind::Airspaces)
}

fn default_airports() -> OverlaySettings {
    OverlaySettings::for_kind(OverlayKind::Airports)
}

fn default_receivers() -> OverlaySettings {
    OverlaySettings::for_kind(OverlayKind::Receivers)
}

fn default_runways() -> OverlaySettings {
    OverlaySettings::for_kind(OverlayKind::Runways)
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            feed_url: default_feed_url(),
            api_url: default_api_url(),
            backoff_base_ms: default_backoff_base_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            settle_delay_ms: default_settle_delay_ms(),
            trail_window_minutes: default_trail_window_minutes(),
            idle_timeout_minutes: default_idle_timeout_minutes(),
            airspaces: default_airspaces(),
            airports: default_airports(),
            receivers: default_receivers(),
            runways: default_runways(),
            watchlist: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from disk, creating it with defaults if missing
    pub fn load() -> Result<Self, confy::ConfyError> {
        confy::load(APP_NAME, "config")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<(), confy::ConfyError> {
        confy::store(APP_NAME, "config", self)
    }

    /// Get the config file path for display to user
    pub fn get_config_path() -> Result<std::path::PathBuf, confy::ConfyError> {
        confy::get_configuration_file_path(APP_NAME, "config")
    }

    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.feed_url.clone(),
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.backoff_base_ms),
                self.max_reconnect_attempts,
            ),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            ..ConnectionConfig::default()
        }
    }

    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            trail_window: chrono::Duration::minutes(self.trail_window_minutes),
            ..RegistryConfig::default()
        }
    }

    #[must_use]
    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.idle_timeout_minutes)
    }

    #[must_use]
    pub fn overlay(&self, kind: OverlayKind) -> &OverlaySettings {
        match kind {
            OverlayKind::Airspaces => &self.airspaces,
            OverlayKind::Airports => &self.airports,
            OverlayKind::Receivers => &self.receivers,
            OverlayKind::Runways => &self.runways,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"feed_url": "wss://example.org/data/fixes/live"}"#).unwrap();
        assert_eq!(config.feed_url, "wss://example.org/data/fixes/live");
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.runways, default_runways());
        assert!(config.watchlist.is_empty());
    }

    #[test]
    fn test_connection_config() {
        let config = AppConfig {
            backoff_base_ms: 250,
            max_reconnect_attempts: 3,
            ..AppConfig::default()
        };
        let connection = config.connection_config();
        assert_eq!(connection.backoff.base_delay, Duration::from_millis(250));
        assert_eq!(connection.backoff.max_attempts, 3);
        assert_eq!(connection.settle_delay, Duration::from_millis(100));
        assert_eq!(connection.url, DEFAULT_FEED_URL);
    }

    #[test]
    fn test_overlay_defaults_match_library() {
        for kind in OverlayKind::ALL {
            assert_eq!(config_for(kind), kind.default_config());
        }
    }

    fn config_for(kind: OverlayKind) -> OverlayConfig {
        AppConfig::default().overlay(kind).overlay_config()
    }

    #[test]
    fn test_registry_config() {
        let config = AppConfig::default();
        assert_eq!(config.registry_config().trail_window, chrono::Duration::hours(2));
        assert_eq!(config.idle_timeout(), chrono::Duration::minutes(30));
    }
}
