// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transport backends.
//!
//! A transport backend owns one connection (an MQTT session for the relay, a
//! GATT link for a direct device) and turns what arrives on it into
//! per-device [`RawFeed`]s. The stream manager never talks to a connection
//! directly: it asks a [`TransportFactory`] for a backend, calls
//! [`Transport::open`] and [`Transport::deliver`], and watches
//! [`Transport::status`] to drive reconnection.
//!
//! # Backends
//!
//! - [`relay`] - Cloud relay over MQTT, one connection shared by every device
//! - [`direct`] - Short-range radio link, one connection per device

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::context::StreamContext;
use crate::error::ConnectError;
use crate::types::{DeviceRef, TransportKind};

pub mod direct;
mod feed;
#[cfg(feature = "direct")]
pub mod gatttool;
#[cfg(feature = "relay")]
pub mod relay;

pub use feed::{FeedSender, RawFeed, feed};

/// A message as it came off the wire, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    device_id: String,
    topic: String,
    payload: Bytes,
    received_at: DateTime<Utc>,
}

impl RawMessage {
    /// Creates a raw message stamped with the current time.
    pub fn new(
        device_id: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Returns the device the message belongs to.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the topic or characteristic the message arrived on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the raw payload.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns when the message was received.
    #[must_use]
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

/// Link status reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkStatus {
    /// Not connected (initial state, or closed on request).
    #[default]
    Down,
    /// Connected and delivering.
    Up,
    /// The connection dropped unexpectedly.
    Lost(String),
    /// The remote end rejected the credential.
    AuthRejected,
}

/// How backends of one transport kind are shared between devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sharing {
    /// One backend multiplexes every device of this kind subscribed with the
    /// same credential.
    PerTransport,
    /// Each device gets its own backend, whatever the credential.
    PerDevice,
}

/// Per-backend link settings derived from the stream configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOptions {
    /// Upper bound for [`Transport::open`].
    pub connect_timeout: Duration,
    /// Capacity of every feed handed out by [`Transport::deliver`].
    pub queue_capacity: usize,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            queue_capacity: 100,
        }
    }
}

/// One concrete connection delivering device messages.
///
/// Implementations own their connection inside a spawned task and must never
/// block the caller beyond the connect timeout.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Returns the transport kind.
    fn kind(&self) -> TransportKind;

    /// Establishes the connection.
    ///
    /// Returns immediately if already connected. Safe to call again after a
    /// failure or a lost connection; devices delivered before are resumed.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Timeout`] if the link is not up within the
    /// connect timeout, [`ConnectError::AuthRejected`] if the credential was
    /// refused, or another [`ConnectError`] describing the failure.
    async fn open(&self) -> Result<(), ConnectError>;

    /// Starts delivering messages for `device`.
    ///
    /// Calling it again for the same device replaces (and ends) the previous
    /// feed.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot route the device.
    async fn deliver(&self, device: &DeviceRef) -> Result<RawFeed, ConnectError>;

    /// Stops delivering messages for a device and ends its feed.
    async fn release(&self, device_id: &str);

    /// Closes the connection and ends every feed. Idempotent.
    async fn close(&self);

    /// Returns a watch on the link status.
    fn status(&self) -> watch::Receiver<LinkStatus>;
}

/// Creates backends of one transport kind.
pub trait TransportFactory: Send + Sync + fmt::Debug {
    /// Returns the transport kind this factory serves.
    fn kind(&self) -> TransportKind;

    /// Returns how backends are shared between devices.
    fn sharing(&self) -> Sharing;

    /// Creates an unopened backend for `device`.
    ///
    /// Called while the subscription registry is locked: must not perform
    /// I/O. `shutdown` is cancelled by the manager to force teardown.
    fn create(
        &self,
        device: &DeviceRef,
        context: &StreamContext,
        options: &LinkOptions,
        shutdown: CancellationToken,
    ) -> Arc<dyn Transport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_message_accessors() {
        let msg = RawMessage::new("d1", "/v1/d1/data", &b"{}"[..]);
        assert_eq!(msg.device_id(), "d1");
        assert_eq!(msg.topic(), "/v1/d1/data");
        assert_eq!(&msg.payload()[..], b"{}");
    }

    #[test]
    fn link_status_defaults_to_down() {
        assert_eq!(LinkStatus::default(), LinkStatus::Down);
    }
}
