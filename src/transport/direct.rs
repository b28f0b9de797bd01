// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Direct short-range radio backend.
//!
//! Each direct device gets its own [`DirectTransport`] holding one GATT link.
//! The link itself is abstracted behind [`GattConnector`] and [`GattSession`]
//! so the backend logic does not depend on a particular Bluetooth stack; the
//! `gatttool` driver in [`super::gatttool`] is the default implementation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::StreamContext;
use crate::error::ConnectError;
use crate::types::{DeviceRef, TransportKind};

use super::{
    FeedSender, LinkOptions, LinkStatus, RawFeed, RawMessage, Sharing, Transport,
    TransportFactory, feed,
};

/// A value notified by the device on one characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The attribute handle the value was notified on.
    pub handle: u16,
    /// The notified value.
    pub value: Bytes,
}

impl Notification {
    /// Returns the topic name used for readings from this characteristic.
    #[must_use]
    pub fn topic(&self) -> String {
        format!("gatt/0x{:04x}", self.handle)
    }
}

/// Opens GATT links to devices.
#[async_trait]
pub trait GattConnector: Send + Sync + fmt::Debug {
    /// Connects to the device at `address` and enables notifications.
    ///
    /// # Errors
    ///
    /// Returns error if the link cannot be established.
    async fn connect(&self, address: &str) -> Result<Box<dyn GattSession>, ConnectError>;
}

/// An established GATT link, exclusively owned by the backend's reader task.
#[async_trait]
pub trait GattSession: Send {
    /// Waits for the next notification; `Ok(None)` once the link closed.
    ///
    /// Must be cancel-safe.
    ///
    /// # Errors
    ///
    /// Returns error if the link failed.
    async fn next_notification(&mut self) -> Result<Option<Notification>, ConnectError>;

    /// Tears the link down.
    async fn disconnect(&mut self);
}

/// Creates one [`DirectTransport`] per direct device.
#[derive(Debug, Clone)]
pub struct DirectFactory {
    connector: Arc<dyn GattConnector>,
}

impl DirectFactory {
    /// Creates a factory using the given link driver.
    #[must_use]
    pub fn new(connector: Arc<dyn GattConnector>) -> Self {
        Self { connector }
    }

    /// Creates a factory using the `gatttool` driver.
    #[cfg(feature = "direct")]
    #[must_use]
    pub fn gatttool(config: super::gatttool::GattConfig) -> Self {
        Self::new(Arc::new(super::gatttool::GatttoolConnector::new(config)))
    }
}

impl TransportFactory for DirectFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn sharing(&self) -> Sharing {
        Sharing::PerDevice
    }

    fn create(
        &self,
        device: &DeviceRef,
        _context: &StreamContext,
        options: &LinkOptions,
        shutdown: CancellationToken,
    ) -> Arc<dyn Transport> {
        Arc::new(DirectTransport::new(
            device.clone(),
            Arc::clone(&self.connector),
            *options,
            shutdown,
        ))
    }
}

struct Reader {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// The direct backend: one GATT link to one device.
#[derive(Clone)]
pub struct DirectTransport {
    inner: Arc<DirectInner>,
}

struct DirectInner {
    device: DeviceRef,
    connector: Arc<dyn GattConnector>,
    options: LinkOptions,
    shutdown: CancellationToken,
    feed: Mutex<Option<FeedSender>>,
    reader: Mutex<Option<Reader>>,
    status: watch::Sender<LinkStatus>,
    open_lock: tokio::sync::Mutex<()>,
}

impl DirectTransport {
    /// Creates an unopened backend for `device`.
    #[must_use]
    pub fn new(
        device: DeviceRef,
        connector: Arc<dyn GattConnector>,
        options: LinkOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(LinkStatus::Down);
        Self {
            inner: Arc::new(DirectInner {
                device,
                connector,
                options,
                shutdown,
                feed: Mutex::new(None),
                reader: Mutex::new(None),
                status,
                open_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

impl DirectInner {
    fn forward(&self, notification: Notification) {
        let Some(sender) = self.feed.lock().clone() else {
            tracing::trace!(device = %self.device.id(), "No feed, notification discarded");
            return;
        };
        let message = RawMessage::new(self.device.id(), notification.topic(), notification.value);
        sender.push(message);
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn open(&self) -> Result<(), ConnectError> {
        let _guard = self.inner.open_lock.lock().await;

        if self.inner.shutdown.is_cancelled() {
            return Err(ConnectError::Closed);
        }
        if *self.inner.status.borrow() == LinkStatus::Up {
            return Ok(());
        }

        if let Some(old) = self.inner.reader.lock().take() {
            old.token.cancel();
        }

        let address = self.inner.device.address();
        let timeout = self.inner.options.connect_timeout;
        let session = match tokio::time::timeout(timeout, self.inner.connector.connect(address))
            .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                tracing::warn!(device = %self.inner.device, error = %e, "Failed to open direct link");
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(device = %self.inner.device, "Direct link timed out");
                return Err(ConnectError::Timeout(timeout));
            }
        };

        let token = self.inner.shutdown.child_token();
        let task = tokio::spawn(read_notifications(
            session,
            Arc::clone(&self.inner),
            token.clone(),
        ));
        *self.inner.reader.lock() = Some(Reader { token, task });
        self.inner.status.send_replace(LinkStatus::Up);

        tracing::info!(device = %self.inner.device, address = %address, "Direct link established");
        Ok(())
    }

    async fn deliver(&self, device: &DeviceRef) -> Result<RawFeed, ConnectError> {
        if device.id() != self.inner.device.id() {
            return Err(ConnectError::Refused(format!(
                "direct link to {} cannot deliver {}",
                self.inner.device.id(),
                device.id()
            )));
        }

        let (sender, feed) = feed(self.inner.options.queue_capacity);
        if let Some(previous) = self.inner.feed.lock().replace(sender) {
            previous.close();
        }
        tracing::debug!(device = %device.id(), "Direct feed opened");
        Ok(feed)
    }

    async fn release(&self, device_id: &str) {
        if device_id != self.inner.device.id() {
            return;
        }
        if let Some(sender) = self.inner.feed.lock().take() {
            sender.close();
            tracing::debug!(device = %device_id, "Direct feed released");
        }
    }

    async fn close(&self) {
        let reader = self.inner.reader.lock().take();
        self.inner.status.send_replace(LinkStatus::Down);
        if let Some(sender) = self.inner.feed.lock().take() {
            sender.close();
        }

        let Some(reader) = reader else {
            return;
        };

        // The reader task disconnects the session when cancelled
        reader.token.cancel();
        if let Err(e) = reader.task.await {
            tracing::warn!(device = %self.inner.device, error = %e, "Direct reader task failed");
        }
        tracing::info!(device = %self.inner.device, "Direct link closed");
    }

    fn status(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }
}

impl fmt::Debug for DirectTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectTransport")
            .field("device", &self.inner.device)
            .field("status", &*self.inner.status.borrow())
            .finish()
    }
}

/// Owns the GATT session and forwards notifications until cancelled or lost.
async fn read_notifications(
    mut session: Box<dyn GattSession>,
    inner: Arc<DirectInner>,
    token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            () = token.cancelled() => break,
            next = session.next_notification() => next,
        };

        let reason = match next {
            Ok(Some(notification)) => {
                inner.forward(notification);
                continue;
            }
            Ok(None) => {
                tracing::info!(device = %inner.device, "Device closed the direct link");
                "link closed by device".to_string()
            }
            Err(e) => {
                tracing::error!(device = %inner.device, error = %e, "Direct link failed");
                e.to_string()
            }
        };
        if !token.is_cancelled() {
            inner.status.send_replace(LinkStatus::Lost(reason));
        }
        break;
    }

    session.disconnect().await;
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    #[derive(Debug)]
    struct ScriptedConnector {
        sessions: Mutex<VecDeque<mpsc::UnboundedReceiver<Notification>>>,
    }

    struct ScriptedSession {
        rx: mpsc::UnboundedReceiver<Notification>,
    }

    #[async_trait]
    impl GattConnector for ScriptedConnector {
        async fn connect(&self, _address: &str) -> Result<Box<dyn GattSession>, ConnectError> {
            match self.sessions.lock().pop_front() {
                Some(rx) => Ok(Box::new(ScriptedSession { rx })),
                None => Err(ConnectError::Refused("no device in range".to_string())),
            }
        }
    }

    #[async_trait]
    impl GattSession for ScriptedSession {
        async fn next_notification(&mut self) -> Result<Option<Notification>, ConnectError> {
            Ok(self.rx.recv().await)
        }

        async fn disconnect(&mut self) {
            self.rx.close();
        }
    }

    fn transport(
        sessions: Vec<mpsc::UnboundedReceiver<Notification>>,
    ) -> (DirectTransport, CancellationToken) {
        let shutdown = CancellationToken::new();
        let connector = Arc::new(ScriptedConnector {
            sessions: Mutex::new(sessions.into()),
        });
        let transport = DirectTransport::new(
            DeviceRef::direct("mic-1", "Mic").with_address("AA:BB:CC:DD:EE:FF"),
            connector,
            LinkOptions {
                connect_timeout: Duration::from_secs(1),
                queue_capacity: 8,
            },
            shutdown.clone(),
        );
        (transport, shutdown)
    }

    fn notification(value: &'static [u8]) -> Notification {
        Notification {
            handle: 0x24,
            value: Bytes::from_static(value),
        }
    }

    #[test]
    fn notification_topic_names_handle() {
        assert_eq!(notification(b"x").topic(), "gatt/0x0024");
    }

    #[tokio::test]
    async fn forwards_notifications_to_feed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (transport, _) = transport(vec![rx]);
        transport.open().await.unwrap();
        let mut feed = transport
            .deliver(&DeviceRef::direct("mic-1", "Mic"))
            .await
            .unwrap();

        tx.send(notification(b"\x2a")).unwrap();
        let message = feed.next().await.unwrap();
        assert_eq!(message.device_id(), "mic-1");
        assert_eq!(message.topic(), "gatt/0x0024");
        assert_eq!(&message.payload()[..], b"\x2a");
    }

    #[tokio::test]
    async fn refuses_other_devices() {
        let (transport, _) = transport(Vec::new());
        let result = transport.deliver(&DeviceRef::direct("other", "Other")).await;
        assert!(matches!(result, Err(ConnectError::Refused(_))));
    }

    #[tokio::test]
    async fn link_loss_updates_status() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (transport, _) = transport(vec![rx]);
        transport.open().await.unwrap();
        let mut status = transport.status();
        assert_eq!(*status.borrow_and_update(), LinkStatus::Up);

        drop(tx);
        status.changed().await.unwrap();
        assert!(matches!(*status.borrow(), LinkStatus::Lost(_)));
    }

    #[tokio::test]
    async fn reopen_after_loss_uses_new_session() {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let (transport, _) = transport(vec![rx1, rx2]);
        transport.open().await.unwrap();
        let mut feed = transport
            .deliver(&DeviceRef::direct("mic-1", "Mic"))
            .await
            .unwrap();

        let mut status = transport.status();
        drop(tx1);
        status
            .wait_for(|s| matches!(s, LinkStatus::Lost(_)))
            .await
            .unwrap();

        transport.open().await.unwrap();
        tx2.send(notification(b"\x01")).unwrap();
        assert_eq!(&feed.next().await.unwrap().payload()[..], b"\x01");
    }

    #[tokio::test]
    async fn open_failure_is_reported() {
        let (transport, _) = transport(Vec::new());
        assert!(matches!(
            transport.open().await,
            Err(ConnectError::Refused(_))
        ));
        assert_eq!(*transport.status().borrow(), LinkStatus::Down);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_feed() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let (transport, _) = transport(vec![rx]);
        transport.open().await.unwrap();
        let mut feed = transport
            .deliver(&DeviceRef::direct("mic-1", "Mic"))
            .await
            .unwrap();

        transport.close().await;
        transport.close().await;

        assert!(feed.next().await.is_none());
        assert_eq!(*transport.status().borrow(), LinkStatus::Down);
    }

    #[tokio::test]
    async fn open_after_shutdown_fails() {
        let (transport, shutdown) = transport(Vec::new());
        shutdown.cancel();
        assert!(matches!(transport.open().await, Err(ConnectError::Closed)));
    }
}
