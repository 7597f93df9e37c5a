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

//! Persisted aircraft watchlist.

use log::warn;
use uuid::Uuid;

/// Validated, deduplicated list of aircraft ids to follow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watchlist {
    ids: Vec<String>,
}

impl Watchlist {
    /// Rebuild from persisted entries.
    ///
    /// Entries are trimmed and must be UUIDs; the first occurrence of a
    /// duplicate wins. Invalid entries are logged and dropped.
    #[must_use]
    pub fn restore(raw: &[String]) -> Self {
        let mut watchlist = Self::default();
        for entry in raw {
            watchlist.add(entry);
        }
        watchlist
    }

    /// Add an id. Returns `false` if it is invalid or already present.
    pub fn add(&mut self, id: &str) -> bool {
        let Some(id) = normalize(id) else {
            return false;
        };
        if self.ids.contains(&id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let Some(id) = normalize(id) else {
            return false;
        };
        let before = self.ids.len();
        self.ids.retain(|existing| *existing != id);
        self.ids.len() != before
    }

    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

fn normalize(id: &str) -> Option<String> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return None;
    }
    match Uuid::parse_str(trimmed) {
        Ok(uuid) => Some(uuid.hyphenated().to_string()),
        Err(e) => {
            warn!("Ignoring invalid watchlist entry {trimmed:?}: {e}");
            None
        }
    }
}
