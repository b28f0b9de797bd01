// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Manager-side wrapper around one transport backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OnceCell, watch};
use tokio_util::sync::CancellationToken;

use crate::error::ConnectError;
use crate::subscription::BackendId;
use crate::transport::Transport;
use crate::types::{DeviceRef, TransportKind};

use super::delivery;
use super::stream_manager::ManagerInner;
use super::supervisor;

/// Connection state of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, not connected.
    Idle,
    /// Opening or re-opening the connection.
    Connecting,
    /// Connected and delivering.
    Connected,
    /// Shutting down.
    Closing,
    /// Gave up; the backend is no longer selected for new subscriptions.
    Failed,
}

impl ConnectionState {
    /// Returns `true` if the backend is delivering.
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

pub(crate) struct BackendHandle {
    id: BackendId,
    kind: TransportKind,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    /// Set once the first `open` succeeded.
    opened: OnceCell<()>,
    /// Cancels every task tied to this backend.
    shutdown: CancellationToken,
    closed: AtomicBool,
    /// Stop tokens of the per-device fan-out tasks.
    feeds: Mutex<HashMap<String, CancellationToken>>,
    /// Held across every feed open and close of this backend.
    feed_gate: tokio::sync::Mutex<()>,
}

impl BackendHandle {
    pub(crate) fn new(
        id: BackendId,
        kind: TransportKind,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            id,
            kind,
            transport,
            state,
            opened: OnceCell::new(),
            shutdown,
            closed: AtomicBool::new(false),
            feeds: Mutex::new(HashMap::new()),
            feed_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn id(&self) -> BackendId {
        self.id
    }

    pub(crate) fn kind(&self) -> TransportKind {
        self.kind
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Opens the backend once; concurrent callers share the same attempt.
    ///
    /// A failed attempt leaves the handle unopened so the next caller retries.
    pub(crate) async fn ensure_open(
        self: &Arc<Self>,
        inner: &Arc<ManagerInner>,
    ) -> Result<(), ConnectError> {
        if self.shutdown.is_cancelled() || self.state() == ConnectionState::Failed {
            return Err(ConnectError::Closed);
        }

        self.opened
            .get_or_try_init(|| async {
                self.set_state(ConnectionState::Connecting);
                match self.transport.open().await {
                    Ok(()) => {
                        self.set_state(ConnectionState::Connected);
                        tokio::spawn(supervisor::supervise(
                            Arc::downgrade(inner),
                            Arc::clone(self),
                            self.transport.status(),
                        ));
                        tracing::debug!(backend = self.id, transport = %self.kind, "Backend opened");
                        Ok(())
                    }
                    Err(e) => {
                        self.set_state(ConnectionState::Idle);
                        Err(e)
                    }
                }
            })
            .await
            .map(|_| ())
    }

    /// Starts delivering a device and spawns its fan-out task.
    ///
    /// Does nothing if the feed is already open or no active subscription
    /// wants it anymore. The registry is read under the feed gate, so a close
    /// decided earlier cannot tear down the feed opened here.
    pub(crate) async fn open_feed(
        self: &Arc<Self>,
        inner: &Arc<ManagerInner>,
        device: &DeviceRef,
    ) -> Result<(), ConnectError> {
        let _gate = self.feed_gate.lock().await;
        let wanted = inner.registry().feed_wanted(self.id, device.id());
        if !wanted || self.feeds.lock().contains_key(device.id()) {
            return Ok(());
        }

        let feed = self.transport.deliver(device).await?;
        let stop = self.shutdown.child_token();
        self.feeds
            .lock()
            .insert(device.id().to_string(), stop.clone());

        tokio::spawn(delivery::fan_out(
            Arc::downgrade(inner),
            self.id,
            device.clone(),
            feed,
            stop,
        ));
        tracing::debug!(backend = self.id, device = %device.id(), "Feed opened");
        Ok(())
    }

    /// Stops delivering a device unless a subscription wants it again.
    pub(crate) async fn close_feed(&self, inner: &ManagerInner, device_id: &str) {
        let _gate = self.feed_gate.lock().await;
        let wanted = inner.registry().feed_wanted(self.id, device_id);
        if wanted {
            tracing::debug!(backend = self.id, device = %device_id, "Feed still wanted, kept open");
            return;
        }
        let Some(stop) = self.feeds.lock().remove(device_id) else {
            return;
        };
        stop.cancel();
        self.transport.release(device_id).await;
        tracing::debug!(backend = self.id, device = %device_id, "Feed closed");
    }

    /// Closes the backend, forcing teardown after `close_timeout`.
    pub(crate) async fn shutdown(&self, close_timeout: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ConnectionState::Closing);

        for (_, stop) in self.feeds.lock().drain() {
            stop.cancel();
        }

        if tokio::time::timeout(close_timeout, self.transport.close())
            .await
            .is_err()
        {
            tracing::warn!(
                backend = self.id,
                transport = %self.kind,
                timeout_ms = close_timeout.as_millis(),
                "Backend close timed out, forcing teardown"
            );
        }

        self.shutdown.cancel();
        self.set_state(ConnectionState::Idle);
        tracing::info!(backend = self.id, transport = %self.kind, "Backend closed");
    }

    /// Forces teardown without waiting; used where no runtime is available.
    pub(crate) fn abort(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.cancel();
            self.set_state(ConnectionState::Idle);
        }
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
