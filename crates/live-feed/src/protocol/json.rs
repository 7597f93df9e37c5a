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

//! JSON data frame parser.
//!
//! Frame format:
//! ```text
//! {"type":"fix","aircraftId":"...","timestamp":"...","latitude":..,"longitude":..,...}
//! {"type":"aircraft","id":"...","registration":"...","fixes":[...]}
//! ```

use serde_json::Value;

use super::{EntityDescription, Fix, InboundFrame, ParseError, Protocol};

/// Parser for the live feed's JSON data frames.
#[derive(Debug, Default)]
pub struct JsonFrameParser;

impl JsonFrameParser {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Parse a text frame.
    pub fn parse_text(&mut self, text: &str) -> Result<Option<InboundFrame>, ParseError> {
        parse_frame(text)
    }
}

impl Protocol for JsonFrameParser {
    type Message = InboundFrame;
    type Error = ParseError;

    fn parse(&mut self, input: &[u8]) -> Result<Option<InboundFrame>, ParseError> {
        let text = std::str::from_utf8(input)
            .map_err(|e| ParseError::InvalidFormat(format!("invalid UTF-8: {e}")))?;
        parse_frame(text)
    }
}

fn parse_frame(text: &str) -> Result<Option<InboundFrame>, ParseError> {
    let value: Value = serde_json::from_str(text.trim())
        .map_err(|e| ParseError::InvalidFormat(e.to_string()))?;

    if !value.is_object() {
        return Err(ParseError::InvalidFormat("frame is not a JSON object".to_string()));
    }

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingField("type"))?
        .to_owned();

    match kind.as_str() {
        "fix" => {
            let fix: Fix = serde_json::from_value(value)
                .map_err(|source| ParseError::Malformed { kind: "fix", source })?;
            validate_fix(&fix)?;
            Ok(Some(InboundFrame::Fix(fix)))
        }
        "aircraft" | "device" => {
            let description: EntityDescription = serde_json::from_value(value)
                .map_err(|source| ParseError::Malformed {
                    kind: "description",
                    source,
                })?;
            if description.id.trim().is_empty() {
                return Err(ParseError::MissingField("id"));
            }
            for fix in &description.fixes {
                validate_position(fix)?;
            }
            Ok(Some(InboundFrame::Description(description)))
        }
        _ => Ok(None),
    }
}

fn validate_fix(fix: &Fix) -> Result<(), ParseError> {
    if fix.aircraft_id.trim().is_empty() {
        return Err(ParseError::MissingField("aircraftId"));
    }
    validate_position(fix)
}

fn validate_position(fix: &Fix) -> Result<(), ParseError> {
    if !(-90.0..=90.0).contains(&fix.latitude) {
        return Err(ParseError::InvalidValue {
            field: "latitude",
            value: fix.latitude.to_string(),
        });
    }
    if !(-180.0..=180.0).contains(&fix.longitude) {
        return Err(ParseError::InvalidValue {
            field: "longitude",
            value: fix.longitude.to_string(),
        });
    }
    Ok(())
}
