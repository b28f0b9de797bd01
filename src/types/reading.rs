// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Normalized telemetry readings.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// The body of a reading.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A JSON object as published through the relay.
    Structured(Value),
    /// Raw bytes as notified over a direct radio link.
    Bytes(Bytes),
}

impl Payload {
    /// Returns the JSON object if this is a structured payload.
    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Structured(value) => Some(value),
            Self::Bytes(_) => None,
        }
    }

    /// Returns the raw bytes if this is a binary payload.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Structured(_) => None,
            Self::Bytes(bytes) => Some(bytes),
        }
    }
}

/// One named measurement inside a structured reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement<'a> {
    /// What the value means (e.g. `temperature`, `noiseLevel`).
    pub meaning: &'a str,
    /// The measured value.
    pub value: &'a Value,
}

/// One normalized telemetry message.
///
/// Readings are produced by the normalizer for every inbound message and
/// handed to each interested callback by reference.
///
/// Structured payloads come in two shapes, both understood by
/// [`Reading::value`]:
///
/// ```text
/// {"ts": 1418130537020, "readings": [{"meaning": "noiseLevel", "value": 42}]}
/// {"ts": 1418130537020, "snd_level": 42}
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    device_id: String,
    topic: String,
    payload: Payload,
    received_at: DateTime<Utc>,
    recorded_at: Option<DateTime<Utc>>,
}

impl Reading {
    pub(crate) fn new(
        device_id: impl Into<String>,
        topic: impl Into<String>,
        payload: Payload,
        received_at: DateTime<Utc>,
        recorded_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            topic: topic.into(),
            payload,
            received_at,
            recorded_at,
        }
    }

    /// Returns the id of the device that produced this reading.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the transport-level topic or characteristic the message arrived on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the payload.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Returns when the backend received the message.
    #[must_use]
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Returns the device-side timestamp, if the payload carried one.
    #[must_use]
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.recorded_at
    }

    /// Returns all named measurements of a structured payload.
    #[must_use]
    pub fn measurements(&self) -> Vec<Measurement<'_>> {
        let Some(Value::Object(object)) = self.payload.as_json() else {
            return Vec::new();
        };

        if let Some(Value::Array(readings)) = object.get("readings") {
            return readings
                .iter()
                .filter_map(|entry| {
                    let meaning = entry.get("meaning")?.as_str()?;
                    let value = entry.get("value")?;
                    Some(Measurement { meaning, value })
                })
                .collect();
        }

        object
            .iter()
            .filter(|(key, _)| key.as_str() != "ts")
            .map(|(meaning, value)| Measurement {
                meaning: meaning.as_str(),
                value,
            })
            .collect()
    }

    /// Returns the value of the measurement with the given meaning.
    ///
    /// # Examples
    ///
    /// ```
    /// # use sensorlink::normalizer::normalize;
    /// # use sensorlink::transport::RawMessage;
    /// # use sensorlink::DeviceRef;
    /// let device = DeviceRef::relay("mic-1", "Microphone");
    /// let raw = RawMessage::new(
    ///     "mic-1",
    ///     "/v1/mic-1/data",
    ///     r#"{"ts": 1418130537020, "readings": [{"meaning": "noiseLevel", "value": 42}]}"#,
    /// );
    /// let reading = normalize(&raw, &device).unwrap();
    /// assert_eq!(reading.value("noiseLevel").and_then(|v| v.as_i64()), Some(42));
    /// ```
    #[must_use]
    pub fn value(&self, meaning: &str) -> Option<&Value> {
        self.measurements()
            .into_iter()
            .find(|m| m.meaning == meaning)
            .map(|m| m.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn structured(value: Value) -> Reading {
        Reading::new("d1", "t", Payload::Structured(value), Utc::now(), None)
    }

    #[test]
    fn value_from_readings_array() {
        let reading = structured(json!({
            "readings": [
                {"meaning": "temperature", "value": 21.5},
                {"meaning": "humidity", "value": 40}
            ]
        }));
        assert_eq!(reading.value("humidity"), Some(&json!(40)));
        assert_eq!(reading.measurements().len(), 2);
    }

    #[test]
    fn value_from_flat_object_skips_timestamp() {
        let reading = structured(json!({"ts": 1, "snd_level": 42}));
        assert_eq!(reading.value("snd_level"), Some(&json!(42)));
        assert!(reading.value("ts").is_none());
    }

    #[test]
    fn binary_payload_has_no_measurements() {
        let reading = Reading::new(
            "d1",
            "gatt/0x0025",
            Payload::Bytes(Bytes::from_static(&[0x4b, 0x00])),
            Utc::now(),
            None,
        );
        assert!(reading.measurements().is_empty());
        assert_eq!(reading.payload().as_bytes(), Some(&[0x4b, 0x00][..]));
    }
}
