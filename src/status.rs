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

//! User-facing feed status.

use std::fmt;

use chrono::Duration;
use live_feed::{ConnectionState, FeedEvent};

/// What the user sees about the live feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Live,
    Reconnecting { attempt: u32, max_attempts: u32 },
    Offline,
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => f.write_str("live"),
            Self::Reconnecting {
                attempt,
                max_attempts,
            } => write!(f, "reconnecting ({attempt} of {max_attempts})"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

/// Folds connection events into a status summary.
#[derive(Debug, Clone)]
pub struct StatusTracker {
    status: FeedStatus,
    /// Set once reconnection has been given up.
    abandoned: bool,
    last_error: Option<String>,
    message_count: u64,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: FeedStatus::Offline,
            abandoned: false,
            last_error: None,
            message_count: 0,
        }
    }

    pub fn observe(&mut self, event: &FeedEvent) {
        match event {
            FeedEvent::StateChanged(ConnectionState::Connected) => {
                self.status = FeedStatus::Live;
                self.abandoned = false;
                self.last_error = None;
            }
            FeedEvent::StateChanged(ConnectionState::Disconnected) => {
                self.status = FeedStatus::Offline;
            }
            FeedEvent::Reconnecting {
                attempt,
                max_attempts,
                ..
            } => {
                self.status = FeedStatus::Reconnecting {
                    attempt: *attempt,
                    max_attempts: *max_attempts,
                };
            }
            FeedEvent::ReconnectAbandoned { .. } => {
                self.status = FeedStatus::Offline;
                self.abandoned = true;
            }
            FeedEvent::ConnectionError(message) => {
                self.last_error = Some(message.clone());
            }
            FeedEvent::FixReceived(_) | FeedEvent::EntityReceived(_) => {
                self.message_count += 1;
            }
            _ => {}
        }
    }

    #[must_use]
    pub fn status(&self) -> FeedStatus {
        self.status
    }

    /// Whether the feed gave up and needs an explicit reconnect.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// One-line status for the log.
    #[must_use]
    pub fn summary(&self, aircraft: usize, feed_delay: Option<Duration>) -> String {
        let mut line = format!("{} | {aircraft} aircraft | {} messages", self.status, self.message_count);
        if let Some(delay) = feed_delay {
            line.push_str(" | delay ");
            line.push_str(&format_delay(delay));
        }
        if self.abandoned {
            line.push_str(" | gave up reconnecting");
        }
        line
    }
}

/// Human-readable feed delay.
#[must_use]
pub fn format_delay(delay: Duration) -> String {
    let millis = delay.num_milliseconds().max(0);
    if millis < 1000 {
        format!("{millis} ms")
    } else if millis < 60_000 {
        format!("{}.{} s", millis / 1000, (millis % 1000) / 100)
    } else {
        format!("{} min", millis / 60_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_follows_events() {
        let mut tracker = StatusTracker::new();
        assert_eq!(tracker.status(), FeedStatus::Offline);

        tracker.observe(&FeedEvent::StateChanged(ConnectionState::Connected));
        assert_eq!(tracker.status(), FeedStatus::Live);

        tracker.observe(&FeedEvent::Reconnecting {
            attempt: 2,
            max_attempts: 5,
            delay: std::time::Duration::from_secs(2),
        });
        assert_eq!(tracker.status().to_string(), "reconnecting (2 of 5)");

        tracker.observe(&FeedEvent::ReconnectAbandoned { attempts: 5 });
        assert_eq!(tracker.status(), FeedStatus::Offline);
        assert!(tracker.is_abandoned());

        tracker.observe(&FeedEvent::StateChanged(ConnectionState::Connected));
        assert!(!tracker.is_abandoned());
    }

    #[test]
    fn test_errors_recorded() {
        let mut tracker = StatusTracker::new();
        tracker.observe(&FeedEvent::ConnectionError("refused".to_string()));
        assert_eq!(tracker.last_error(), Some("refused"));
        assert_eq!(tracker.status(), FeedStatus::Offline);
    }

    #[test]
    fn test_format_delay() {
        assert_eq!(format_delay(Duration::milliseconds(250)), "250 ms");
        assert_eq!(format_delay(Duration::milliseconds(1250)), "1.2 s");
        assert_eq!(format_delay(Duration::minutes(3)), "3 min");
        assert_eq!(format_delay(Duration::milliseconds(-20)), "0 ms");
    }

    #[test]
    fn test_summary() {
        let tracker = StatusTracker::new();
        assert_eq!(
            tracker.summary(3, Some(Duration::milliseconds(400))),
            "offline | 3 aircraft | 0 messages | delay 400 ms"
        );
    }
}
