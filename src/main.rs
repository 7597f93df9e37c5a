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

//! Headless live tracking client.
//!
//! Restores the watchlist, follows it over the live feed, drives the
//! overlay controllers for an optional viewport and logs a status line.

mod config;
mod overlays;
mod status;
mod watchlist;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use live_feed::viewport::OverlayEvent;
use live_feed::{Bounds, ClientConfig, LiveFeedClient, OverlayKind, ViewportController};
use log::{debug, error, info, warn};
use tokio::sync::broadcast::error::RecvError;

use crate::config::AppConfig;
use crate::overlays::HttpOverlaySource;
use crate::status::StatusTracker;
use crate::watchlist::Watchlist;

#[derive(Parser, Debug)]
#[command(name = "soar-live", version, about = "Follow live glider and aircraft positions")]
struct Cli {
    /// Live feed WebSocket URL (overrides the config file)
    #[arg(long)]
    feed_url: Option<String>,

    /// REST API base URL (overrides the config file)
    #[arg(long)]
    api_url: Option<String>,

    /// Viewport as north,south,east,west in degrees
    #[arg(long, value_parser = parse_bounds, allow_hyphen_values = true)]
    bounds: Option<Bounds>,

    /// Stream all traffic inside --bounds, not just the watchlist
    #[arg(long, requires = "bounds")]
    follow_area: bool,

    /// Add an aircraft id to the persisted watchlist
    #[arg(long = "watch", value_name = "ID")]
    watch: Vec<String>,

    /// Remove an aircraft id from the persisted watchlist
    #[arg(long = "unwatch", value_name = "ID")]
    unwatch: Vec<String>,

    /// Seconds between status lines
    #[arg(long, default_value_t = 30)]
    status_interval: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_bounds(value: &str) -> Result<Bounds, String> {
    let parts: Vec<f64> = value
        .split(',')
        .map(|part| part.trim().parse::<f64>().map_err(|e| format!("{part:?}: {e}")))
        .collect::<Result<_, _>>()?;
    let [north, south, east, west] = parts[..] else {
        return Err("expected north,south,east,west".to_string());
    };
    let bounds = Bounds::new(north, south, east, west);
    if bounds.is_valid() {
        Ok(bounds)
    } else {
        Err(format!("invalid bounds: {value}"))
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

fn load_config(cli: &Cli) -> AppConfig {
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!("Failed to load config, using defaults: {e}");
        AppConfig::default()
    });
    if let Ok(path) = AppConfig::get_config_path() {
        debug!("Config file: {}", path.display());
    }

    let mut watchlist = Watchlist::restore(&config.watchlist);
    for id in &cli.watch {
        if watchlist.add(id) {
            info!("Watching {id}");
        }
    }
    for id in &cli.unwatch {
        if watchlist.remove(id) {
            info!("No longer watching {id}");
        }
    }
    if !watchlist.is_empty() {
        info!("Following {} watched aircraft", watchlist.len());
    }
    if watchlist.ids() != config.watchlist.as_slice() {
        config.watchlist = watchlist.ids().to_vec();
        if let Err(e) = config.save() {
            warn!("Failed to save watchlist: {e}");
        }
    }

    if let Some(url) = &cli.feed_url {
        config.feed_url.clone_from(url);
    }
    if let Some(url) = &cli.api_url {
        config.api_url.clone_from(url);
    }
    config
}

fn spawn_overlay_logger(controller: &ViewportController<HttpOverlaySource>) {
    let kind = controller.kind();
    let mut events = controller.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(OverlayEvent::Shown(features)) => {
                    info!("{kind}: showing {} features", features.len());
                }
                Ok(OverlayEvent::Updated(features)) => {
                    debug!("{kind}: refreshed with {} features", features.len());
                }
                Ok(OverlayEvent::Hidden) => info!("{kind}: hidden"),
                Ok(OverlayEvent::Disposed) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => debug!("{kind}: skipped {skipped} events"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli);
    info!("Starting soar-live against {}", config.feed_url);

    let mut client = LiveFeedClient::spawn(ClientConfig {
        connection: config.connection_config(),
        registry: config.registry_config(),
    });
    for id in &config.watchlist {
        client.subscribe(id.clone());
    }

    let source = Arc::new(HttpOverlaySource::new(&config.api_url)?);
    let controllers: Vec<ViewportController<HttpOverlaySource>> = OverlayKind::ALL
        .into_iter()
        .map(|kind| {
            let controller = ViewportController::new(
                kind,
                config.overlay(kind).overlay_config(),
                Arc::clone(&source),
            );
            spawn_overlay_logger(&controller);
            controller
        })
        .collect();

    if let Some(bounds) = cli.bounds {
        info!("Viewport covers {:.0} sq mi", bounds.area_sq_miles());
        for controller in &controllers {
            controller.check_and_update(bounds, config.overlay(controller.kind()).enabled);
        }

        match source.search_aircraft(bounds).await {
            Ok(batch) => {
                let count = batch.len();
                let mode = client.apply_batch(&batch);
                info!("Loaded {count} aircraft items ({mode:?})");
            }
            Err(e) => warn!("Aircraft search failed: {e}"),
        }

        if cli.follow_area {
            client.follow_bounds(&bounds);
        }
    }

    if config.watchlist.is_empty() && !cli.follow_area {
        info!("Watchlist is empty; connecting without subscriptions");
        client.connect();
    }

    let mut status = StatusTracker::new();
    let mut feed_events = client.subscribe_feed();
    let mut registry_events = client.subscribe_registry();
    let mut ticker = tokio::time::interval(Duration::from_secs(cli.status_interval.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for ctrl-c: {e}");
                }
                info!("Shutting down");
                break;
            }
            alive = client.process_next() => {
                if !alive {
                    warn!("Live feed task stopped");
                    break;
                }
            }
            Ok(event) = registry_events.recv() => {
                if client.aggregation().admits(&event) {
                    debug!("Render {event:?}");
                }
            }
            _ = ticker.tick() => {
                let evicted = client.remove_idle(config.idle_timeout());
                if !evicted.is_empty() {
                    debug!("Evicted {} idle aircraft", evicted.len());
                }
                info!("{}", status.summary(client.entity_count(), client.feed_delay()));
                if let Some(error) = status.last_error() {
                    debug!("Last feed error: {error}");
                }
                if status.is_abandoned() {
                    warn!("Live feed gave up reconnecting; restart to try again");
                }
            }
        }

        while let Ok(event) = feed_events.try_recv() {
            let before = status.status();
            status.observe(&event);
            if status.status() != before {
                info!("Feed {}", status.status());
            }
        }
    }

    for controller in &controllers {
        controller.dispose();
    }
    client.disconnect();
    client.shutdown();
    Ok(())
}
