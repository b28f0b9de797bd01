// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `sensorlink` library.
//!
//! Subscribe-time failures are returned synchronously as [`Error`]. Runtime
//! failures (malformed payloads, dropped messages, lost connections) never
//! surface here; they are published as
//! [`Diagnostic`](crate::event::Diagnostic) events instead.

use std::time::Duration;

use thiserror::Error;

use crate::types::TransportKind;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// No transport backend is registered for the requested kind.
    #[error("no transport registered for {0}")]
    UnsupportedTransport(TransportKind),

    /// The backend serving a device could not be reached.
    #[error("device {device_id} is unreachable: {source}")]
    DeviceUnreachable {
        /// The device that could not be reached.
        device_id: String,
        /// The underlying connection failure.
        #[source]
        source: ConnectError,
    },

    /// The backend rejected the credential carried by the stream context.
    #[error("authentication expired, subscribe again with a fresh credential")]
    AuthExpired,

    /// The stream handle was already stopped.
    #[error("stream has been stopped")]
    StreamStopped,

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Maps a connection failure for `device_id` to the error returned by `subscribe`.
    pub(crate) fn from_connect(device_id: &str, source: ConnectError) -> Self {
        match source {
            ConnectError::AuthRejected => Self::AuthExpired,
            source => Self::DeviceUnreachable {
                device_id: device_id.to_string(),
                source,
            },
        }
    }

    /// Returns `true` if retrying the same subscribe call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DeviceUnreachable { .. })
    }
}

/// Errors raised while opening or maintaining a transport connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The connection was not established within the connect timeout.
    #[error("connection timed out after {} ms", .0.as_millis())]
    Timeout(Duration),

    /// The remote end refused the connection.
    #[error("connection refused: {0}")]
    Refused(String),

    /// The remote end rejected the credential.
    #[error("authentication rejected")]
    AuthRejected,

    /// An I/O failure on the underlying link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend has been closed and cannot deliver anymore.
    #[error("transport closed")]
    Closed,

    /// The device could not be resolved through the directory.
    #[error("device lookup failed: {0}")]
    Lookup(#[from] DirectoryError),

    /// MQTT client request failed.
    #[cfg(feature = "relay")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

/// Errors produced by the message normalizer.
///
/// These never abort a stream: the offending message is dropped and a
/// `MalformedMessage` diagnostic is published.
#[derive(Debug, Error)]
pub enum NormalizeError {
    /// The payload was empty.
    #[error("empty payload")]
    Empty,

    /// The payload is not valid JSON.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload is valid JSON but not an object.
    #[error("expected a JSON object, found {0}")]
    NotAnObject(&'static str),

    /// A field has an unexpected shape.
    #[error("invalid field {field}: {message}")]
    InvalidField {
        /// The offending field.
        field: &'static str,
        /// Description of the problem.
        message: String,
    },
}

/// Errors from the device metadata directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// HTTP request failed.
    #[cfg(feature = "http")]
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The directory does not know the device.
    #[error("device not found: {0}")]
    NotFound(String),

    /// The credential was rejected by the directory.
    #[error("unauthorized")]
    Unauthorized,

    /// The directory answered with an unexpected status code.
    #[error("unexpected status {0}")]
    Status(u16),

    /// The directory record could not be interpreted.
    #[error("invalid device record: {0}")]
    InvalidRecord(String),
}

/// Errors in configuration values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required value is missing.
    #[error("missing value: {0}")]
    Missing(String),

    /// A value could not be parsed.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// The configuration key.
        key: String,
        /// The rejected value.
        value: String,
    },

    /// An address or URL is malformed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_transport_display() {
        let err = Error::UnsupportedTransport(TransportKind::Direct);
        assert_eq!(err.to_string(), "no transport registered for direct");
    }

    #[test]
    fn auth_rejection_maps_to_auth_expired() {
        let err = Error::from_connect("dev-1", ConnectError::AuthRejected);
        assert!(matches!(err, Error::AuthExpired));
        assert!(!err.is_transient());
    }

    #[test]
    fn timeout_maps_to_device_unreachable() {
        let err = Error::from_connect("dev-1", ConnectError::Timeout(Duration::from_secs(10)));
        assert!(err.is_transient());
        assert_eq!(
            err.to_string(),
            "device dev-1 is unreachable: connection timed out after 10000 ms"
        );
    }

    #[test]
    fn normalize_error_display() {
        let err = NormalizeError::InvalidField {
            field: "readings",
            message: "expected an array".to_string(),
        };
        assert_eq!(err.to_string(), "invalid field readings: expected an array");
    }

    #[test]
    fn error_from_config_error() {
        let err: Error = ConfigError::Missing("SENSORLINK_RELAY_URL".to_string()).into();
        assert!(matches!(err, Error::Config(ConfigError::Missing(_))));
    }
}
