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

//! Geographic helpers shared by the ledger, viewport and aggregation layers.

use serde::{Deserialize, Serialize};

/// Statute miles per degree of latitude.
const MILES_PER_DEGREE: f64 = 69.0;

/// A latitude/longitude bounding box in degrees.
///
/// `west > east` describes a box that crosses the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Bounds {
    #[must_use]
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Self {
        Self {
            north,
            south,
            east,
            west,
        }
    }

    /// Longitude span in degrees, accounting for antimeridian crossing.
    #[must_use]
    pub fn lon_span(&self) -> f64 {
        if self.east >= self.west {
            self.east - self.west
        } else {
            360.0 - (self.west - self.east)
        }
    }

    /// Latitude span in degrees.
    #[must_use]
    pub fn lat_span(&self) -> f64 {
        (self.north - self.south).max(0.0)
    }

    /// Center point as (lat, lon).
    #[must_use]
    pub fn center(&self) -> (f64, f64) {
        let lat = (self.north + self.south) / 2.0;
        let mut lon = self.west + self.lon_span() / 2.0;
        if lon > 180.0 {
            lon -= 360.0;
        }
        (lat, lon)
    }

    /// Approximate visible area in square statute miles.
    ///
    /// Good enough for threshold decisions, not for measurement.
    #[must_use]
    pub fn area_sq_miles(&self) -> f64 {
        let (center_lat, _) = self.center();
        let height = self.lat_span() * MILES_PER_DEGREE;
        let width = self.lon_span() * MILES_PER_DEGREE * center_lat.to_radians().cos().abs();
        height * width
    }

    /// Whether the point lies inside the box.
    #[must_use]
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        if lat < self.south || lat > self.north {
            return false;
        }
        if self.east >= self.west {
            lon >= self.west && lon <= self.east
        } else {
            lon >= self.west || lon <= self.east
        }
    }

    /// Whether the coordinates are within valid ranges and ordered.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.north)
            && (-90.0..=90.0).contains(&self.south)
            && (-180.0..=180.0).contains(&self.east)
            && (-180.0..=180.0).contains(&self.west)
            && self.south < self.north
    }
}
