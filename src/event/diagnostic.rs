// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Diagnostic event types.

use crate::types::TransportKind;

use super::StreamId;

/// Advisory events published by the stream manager.
///
/// Diagnostics never stop delivery on their own. They report conditions the
/// application may want to react to, such as re-subscribing after an
/// authentication failure.
///
/// # Examples
///
/// ```
/// use sensorlink::event::Diagnostic;
///
/// let event = Diagnostic::dropped("mic-1", None, 12);
/// assert_eq!(event.device_ids(), vec!["mic-1"]);
/// assert!(!event.is_connection());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// Messages were discarded because a bounded queue overflowed.
    DroppedMessages {
        /// The device whose messages were dropped.
        device_id: String,
        /// The stream whose inbox overflowed, `None` for a backend feed.
        stream: Option<StreamId>,
        /// How many messages were dropped since the last report.
        count: usize,
    },

    /// A payload could not be normalized and was skipped.
    MalformedMessage {
        /// The device that sent the payload.
        device_id: String,
        /// The topic the payload arrived on.
        topic: String,
        /// Why the payload was rejected.
        reason: String,
    },

    /// The backend rejected the credential; subscribers must re-subscribe.
    AuthExpired {
        /// The transport that rejected the credential.
        transport: TransportKind,
        /// Devices served by the failed backend.
        devices: Vec<String>,
        /// Streams depending on the failed backend.
        streams: Vec<StreamId>,
    },

    /// A backend connection dropped unexpectedly.
    BackendDisconnected {
        /// The transport whose connection dropped.
        transport: TransportKind,
        /// Devices served by the backend.
        devices: Vec<String>,
        /// Streams depending on the backend.
        streams: Vec<StreamId>,
        /// Description of the failure.
        error: String,
        /// Whether automatic reconnection is still in progress.
        reconnecting: bool,
    },

    /// A backend connection was re-established after a disconnect.
    BackendReconnected {
        /// The transport that reconnected.
        transport: TransportKind,
        /// The attempt that succeeded (0-based).
        attempt: u32,
    },
}

impl Diagnostic {
    /// Creates a dropped messages event.
    #[must_use]
    pub fn dropped(device_id: impl Into<String>, stream: Option<StreamId>, count: usize) -> Self {
        Self::DroppedMessages {
            device_id: device_id.into(),
            stream,
            count,
        }
    }

    /// Creates a malformed message event.
    #[must_use]
    pub fn malformed(
        device_id: impl Into<String>,
        topic: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedMessage {
            device_id: device_id.into(),
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Returns the devices this event concerns.
    #[must_use]
    pub fn device_ids(&self) -> Vec<&str> {
        match self {
            Self::DroppedMessages { device_id, .. } | Self::MalformedMessage { device_id, .. } => {
                vec![device_id.as_str()]
            }
            Self::AuthExpired { devices, .. } | Self::BackendDisconnected { devices, .. } => {
                devices.iter().map(String::as_str).collect()
            }
            Self::BackendReconnected { .. } => Vec::new(),
        }
    }

    /// Returns `true` if the event concerns the given stream.
    #[must_use]
    pub fn affects_stream(&self, id: StreamId) -> bool {
        match self {
            Self::DroppedMessages { stream, .. } => stream.is_none_or(|s| s == id),
            Self::AuthExpired { streams, .. } | Self::BackendDisconnected { streams, .. } => {
                streams.contains(&id)
            }
            Self::MalformedMessage { .. } | Self::BackendReconnected { .. } => false,
        }
    }

    /// Returns `true` if this is a connection-level event.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::AuthExpired { .. }
                | Self::BackendDisconnected { .. }
                | Self::BackendReconnected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_events_name_one_device() {
        let event = Diagnostic::malformed("d2", "/v1/d2/data", "empty payload");
        assert_eq!(event.device_ids(), vec!["d2"]);
        assert!(!event.is_connection());
    }

    #[test]
    fn disconnect_affects_listed_streams_only() {
        let affected = StreamId::new();
        let event = Diagnostic::BackendDisconnected {
            transport: TransportKind::Relay,
            devices: vec!["d1".to_string(), "d2".to_string()],
            streams: vec![affected],
            error: "connection reset".to_string(),
            reconnecting: false,
        };

        assert!(event.is_connection());
        assert!(event.affects_stream(affected));
        assert!(!event.affects_stream(StreamId::new()));
        assert_eq!(event.device_ids(), vec!["d1", "d2"]);
    }

    #[test]
    fn feed_drops_affect_every_stream() {
        let event = Diagnostic::dropped("d1", None, 3);
        assert!(event.affects_stream(StreamId::new()));
    }
}
