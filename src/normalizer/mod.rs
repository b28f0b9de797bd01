// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Conversion of raw transport messages into [`Reading`]s.
//!
//! Normalization is pure and never aborts a stream: a payload that fails
//! validation is reported as a `MalformedMessage` diagnostic and only that
//! message is skipped.
//!
//! Relay payloads must be JSON objects. Two shapes are accepted:
//!
//! ```text
//! {"ts": 1418130537020, "readings": [{"meaning": "noiseLevel", "value": 42}]}
//! {"ts": 1418130537020, "snd_level": 42}
//! ```
//!
//! When present, `ts` must be a number of milliseconds since the Unix epoch,
//! and `readings` must be an array of objects each carrying a string
//! `meaning` and a `value`. Direct payloads are opaque non-empty bytes.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::IgnoredAny;
use serde_json::{Map, Value};

use crate::error::NormalizeError;
use crate::transport::RawMessage;
use crate::types::{DeviceRef, Payload, Reading, TransportKind};

/// One entry of the `readings` array; `value` may be any JSON value.
#[derive(Deserialize)]
struct ReadingEntry {
    meaning: String,
    #[serde(rename = "value")]
    _value: IgnoredAny,
}

/// Normalizes a raw message received for `device`.
///
/// # Errors
///
/// Returns [`NormalizeError`] if the payload is empty or, for relay devices,
/// not a well-formed JSON reading object.
///
/// # Examples
///
/// ```
/// use sensorlink::DeviceRef;
/// use sensorlink::normalizer::normalize;
/// use serde_json::json;
/// use sensorlink::transport::RawMessage;
///
/// let device = DeviceRef::relay("mic-1", "Office mic");
/// let raw = RawMessage::new("mic-1", "/v1/mic-1/data", r#"{"ts": 1418130537020, "snd_level": 42}"#);
///
/// let reading = normalize(&raw, &device).unwrap();
/// assert_eq!(reading.value("snd_level"), Some(&json!(42)));
/// assert!(reading.recorded_at().is_some());
/// ```
pub fn normalize(raw: &RawMessage, device: &DeviceRef) -> Result<Reading, NormalizeError> {
    if raw.payload().is_empty() {
        return Err(NormalizeError::Empty);
    }

    let (payload, recorded_at) = match device.transport() {
        TransportKind::Relay => {
            let object = parse_object(raw.payload())?;
            let recorded_at = timestamp(&object)?;
            validate_readings(&object)?;
            (Payload::Structured(Value::Object(object)), recorded_at)
        }
        TransportKind::Direct => (Payload::Bytes(raw.payload().clone()), None),
    };

    Ok(Reading::new(
        device.id(),
        raw.topic(),
        payload,
        raw.received_at(),
        recorded_at,
    ))
}

fn parse_object(bytes: &[u8]) -> Result<Map<String, Value>, NormalizeError> {
    match serde_json::from_slice(bytes)? {
        Value::Object(object) => Ok(object),
        other => Err(NormalizeError::NotAnObject(json_type(&other))),
    }
}

fn timestamp(object: &Map<String, Value>) -> Result<Option<DateTime<Utc>>, NormalizeError> {
    let Some(ts) = object.get("ts") else {
        return Ok(None);
    };

    let millis = ts.as_i64().ok_or_else(|| NormalizeError::InvalidField {
        field: "ts",
        message: format!("expected integer milliseconds, found {}", json_type(ts)),
    })?;

    DateTime::from_timestamp_millis(millis)
        .map(Some)
        .ok_or_else(|| NormalizeError::InvalidField {
            field: "ts",
            message: format!("{millis} is out of range"),
        })
}

fn validate_readings(object: &Map<String, Value>) -> Result<(), NormalizeError> {
    let Some(readings) = object.get("readings") else {
        return Ok(());
    };

    let invalid = |message: String| NormalizeError::InvalidField {
        field: "readings",
        message,
    };
    let entries = Vec::<ReadingEntry>::deserialize(readings).map_err(|e| invalid(e.to_string()))?;
    match entries.iter().position(|entry| entry.meaning.trim().is_empty()) {
        Some(index) => Err(invalid(format!("entry {index} has an empty meaning"))),
        None => Ok(()),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay() -> DeviceRef {
        DeviceRef::relay("d1", "Sensor")
    }

    fn raw(payload: &'static str) -> RawMessage {
        RawMessage::new("d1", "/v1/d1/data", payload)
    }

    #[test]
    fn structured_readings_array() {
        let reading = normalize(
            &raw(r#"{"ts":1418130537020,"readings":[{"meaning":"temperature","value":21.5}]}"#),
            &relay(),
        )
        .unwrap();

        assert_eq!(reading.device_id(), "d1");
        assert_eq!(reading.topic(), "/v1/d1/data");
        assert_eq!(reading.value("temperature"), Some(&Value::from(21.5)));
        assert_eq!(
            reading.recorded_at().map(|t| t.timestamp_millis()),
            Some(1_418_130_537_020)
        );
    }

    #[test]
    fn flat_object_without_timestamp() {
        let reading = normalize(&raw(r#"{"snd_level": 17}"#), &relay()).unwrap();
        assert_eq!(reading.value("snd_level"), Some(&Value::from(17)));
        assert!(reading.recorded_at().is_none());
    }

    #[test]
    fn empty_payload_is_rejected() {
        let err = normalize(&raw(""), &relay()).unwrap_err();
        assert!(matches!(err, NormalizeError::Empty));
    }

    #[test]
    fn invalid_json_is_rejected() {
        let err = normalize(&raw("{not json"), &relay()).unwrap_err();
        assert!(matches!(err, NormalizeError::Json(_)));
    }

    #[test]
    fn non_object_is_rejected() {
        let err = normalize(&raw("[1, 2]"), &relay()).unwrap_err();
        assert_eq!(err.to_string(), "expected a JSON object, found array");
    }

    #[test]
    fn non_numeric_timestamp_is_rejected() {
        let err = normalize(&raw(r#"{"ts": "yesterday"}"#), &relay()).unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidField { field: "ts", .. }));
    }

    #[test]
    fn readings_must_be_array_of_entries() {
        let err = normalize(&raw(r#"{"readings": 3}"#), &relay()).unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::InvalidField {
                field: "readings",
                ..
            }
        ));

        let err = normalize(&raw(r#"{"readings": [{"value": 1}]}"#), &relay()).unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::InvalidField {
                field: "readings",
                ..
            }
        ));

        let err = normalize(&raw(r#"{"readings": [{"meaning": "temperature"}]}"#), &relay())
            .unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidField { field: "readings", .. }));

        let err = normalize(
            &raw(r#"{"readings": [{"meaning": "noiseLevel", "value": 1}, {"meaning": " ", "value": 2}]}"#),
            &relay(),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid field readings: entry 1 has an empty meaning"
        );
    }

    #[test]
    fn reading_values_may_be_any_json() {
        let payload = r#"{"readings": [{"meaning": "location", "value": {"lat": 52.5, "lon": 13.4}}, {"meaning": "flag", "value": null}]}"#;
        assert!(normalize(&raw(payload), &relay()).is_ok());
    }

    #[test]
    fn direct_payload_is_kept_as_bytes() {
        let device = DeviceRef::direct("d1", "Tag");
        let message = RawMessage::new("d1", "gatt/0x0024", &b"\x2a\x00"[..]);
        let reading = normalize(&message, &device).unwrap();

        assert_eq!(reading.payload().as_bytes(), Some(&b"\x2a\x00"[..]));
        assert_eq!(reading.topic(), "gatt/0x0024");
        assert!(reading.recorded_at().is_none());
    }
}
