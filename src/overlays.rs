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

//! REST collaborator for overlays and aircraft search.

use std::time::Duration;

use async_trait::async_trait;
use live_feed::{AircraftBatch, Bounds, FetchError, OverlayKind, OverlaySource, SearchResponse};
use log::debug;
use serde::Deserialize;
use serde_json::Value;

/// Standard `{ "data": ... }` wrapper used by the data endpoints.
#[derive(Debug, Deserialize)]
struct DataResponse {
    data: Value,
}

/// Overlay features and aircraft batches over HTTP.
#[derive(Debug, Clone)]
pub struct HttpOverlaySource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpOverlaySource {
    pub fn new(base_url: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("soar-live/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, collection: &str) -> String {
        format!("{}/data/{collection}", self.base_url)
    }

    async fn get_json(&self, collection: &str, bounds: Bounds) -> Result<Value, FetchError> {
        let url = self.url(collection);
        debug!("GET {url} {bounds:?}");
        let response = self
            .client
            .get(&url)
            .query(&bounds_query(bounds))
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| FetchError::Request(e.to_string()))?;
        response
            .json::<Value>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }

    /// Aircraft inside `bounds`, individual or clustered as the server decides.
    pub async fn search_aircraft(&self, bounds: Bounds) -> Result<AircraftBatch, FetchError> {
        let body = self.get_json("aircraft", bounds).await?;
        let response: SearchResponse =
            serde_json::from_value(body).map_err(|e| FetchError::Decode(e.to_string()))?;
        Ok(response.into())
    }
}

#[async_trait]
impl OverlaySource for HttpOverlaySource {
    type Feature = Value;

    async fn fetch(&self, kind: OverlayKind, bounds: Bounds) -> Result<Vec<Value>, FetchError> {
        let body = self.get_json(kind.as_str(), bounds).await?;
        features_from_body(body)
    }
}

fn bounds_query(bounds: Bounds) -> [(&'static str, f64); 4] {
    [
        ("north", bounds.north),
        ("south", bounds.south),
        ("east", bounds.east),
        ("west", bounds.west),
    ]
}

/// Pull the feature list out of a data response.
///
/// Accepts a plain list or a GeoJSON feature collection under `data`.
fn features_from_body(body: Value) -> Result<Vec<Value>, FetchError> {
    let DataResponse { data } =
        serde_json::from_value(body).map_err(|e| FetchError::Decode(e.to_string()))?;
    match data {
        Value::Array(items) => Ok(items),
        Value::Object(mut collection) => match collection.remove("features") {
            Some(Value::Array(features)) => Ok(features),
            _ => Err(FetchError::Decode(
                "expected a list or a feature collection".to_string(),
            )),
        },
        other => Err(FetchError::Decode(format!("unexpected data: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_list() {
        let features = features_from_body(json!({"data": [{"ident": "KSFO"}, {"ident": "KOAK"}]})).unwrap();
        assert_eq!(features.len(), 2);
    }

    #[test]
    fn test_feature_collection() {
        let body = json!({"data": {"type": "FeatureCollection", "features": [{"type": "Feature"}]}});
        assert_eq!(features_from_body(body).unwrap().len(), 1);
    }

    #[test]
    fn test_unexpected_body() {
        assert!(matches!(
            features_from_body(json!({"data": 3})),
            Err(FetchError::Decode(_))
        ));
        assert!(matches!(
            features_from_body(json!({"error": "nope"})),
            Err(FetchError::Decode(_))
        ));
    }

    #[test]
    fn test_url_and_query() {
        let source = HttpOverlaySource::new("http://localhost:1337/").unwrap();
        assert_eq!(source.url("runways"), "http://localhost:1337/data/runways");
        let query = bounds_query(Bounds::new(46.0, 45.0, -121.0, -122.0));
        assert_eq!(query[0], ("north", 46.0));
        assert_eq!(query[3], ("west", -122.0));
    }
}
