// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Caller-owned control over one stream.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::event::StreamId;
use crate::subscription::{Inbox, ReadingCallback, SubscriptionId};
use crate::types::DeviceRef;

use super::backend_handle::BackendHandle;
use super::delivery;
use super::stream_manager::ManagerInner;

type StreamSubscription = (SubscriptionId, Arc<BackendHandle>, DeviceRef);

/// Flags and membership shared with the stream's dispatch task.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    started: AtomicBool,
    stopped: AtomicBool,
    devices: Mutex<HashSet<String>>,
}

impl StreamState {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn contains(&self, device_id: &str) -> bool {
        self.devices.lock().contains(device_id)
    }
}

/// Handle controlling the delivery of one stream.
///
/// Returned by [`StreamManager::subscribe`](super::StreamManager::subscribe).
/// Readings flow to the callback between [`start`](Self::start) and
/// [`stop`](Self::stop). Dropping the handle stops the stream.
///
/// # Examples
///
/// ```no_run
/// # use sensorlink::manager::StreamManager;
/// # use sensorlink::{DeviceRef, StreamContext};
/// # async fn example(manager: StreamManager) -> sensorlink::Result<()> {
/// let devices = [DeviceRef::relay("mic-1", "Office"), DeviceRef::relay("mic-2", "Lab")];
/// let handle = manager
///     .subscribe(&StreamContext::new(), devices, |reading| println!("{reading:?}"))
///     .await?;
///
/// handle.start().await?;
/// handle.unsubscribe("mic-2").await;
/// handle.stop().await;
/// assert!(handle.start().await.is_err());
/// # Ok(())
/// # }
/// ```
pub struct StreamHandle {
    id: StreamId,
    inner: Arc<ManagerInner>,
    state: Arc<StreamState>,
    inbox: Arc<Inbox>,
    callback: ReadingCallback,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl StreamHandle {
    pub(crate) fn new(
        id: StreamId,
        inner: Arc<ManagerInner>,
        devices: impl IntoIterator<Item = String>,
        inbox: Arc<Inbox>,
        callback: ReadingCallback,
    ) -> Self {
        let state = StreamState {
            devices: Mutex::new(devices.into_iter().collect()),
            ..StreamState::default()
        };
        Self {
            id,
            inner,
            state: Arc::new(state),
            inbox,
            callback,
            dispatch: Mutex::new(None),
        }
    }

    /// Returns the stream identifier used in diagnostics.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Returns the ids of the devices still part of the stream, sorted.
    #[must_use]
    pub fn devices(&self) -> Vec<String> {
        let mut devices: Vec<_> = self.state.devices.lock().iter().cloned().collect();
        devices.sort();
        devices
    }

    /// Returns `true` once [`start`](Self::start) succeeded.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state.started.load(Ordering::Acquire)
    }

    /// Returns `true` once [`stop`](Self::stop) was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.is_stopped()
    }

    /// Starts delivering readings to the callback.
    ///
    /// Idempotent: calling it on a started stream does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamStopped`] after [`stop`](Self::stop) or a
    /// manager shutdown, [`Error::DeviceUnreachable`] if a backend cannot be
    /// (re)connected, or [`Error::AuthExpired`] if a backend rejected the
    /// credential. A failed start can be retried.
    pub async fn start(&self) -> Result<()> {
        if self.state.is_stopped() || self.inbox.is_closed() {
            return Err(Error::StreamStopped);
        }
        if self.state.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let subscriptions = self.inner.registry().stream_subscriptions(self.id);
        for (_, backend, device) in &subscriptions {
            if let Err(e) = backend.ensure_open(&self.inner).await {
                self.state.started.store(false, Ordering::Release);
                return Err(Error::from_connect(device.id(), e));
            }
        }

        self.spawn_dispatch();

        let demands: Vec<_> = {
            let mut registry = self.inner.registry();
            subscriptions
                .iter()
                .filter_map(|(id, ..)| registry.activate(*id))
                .collect()
        };

        for demand in demands {
            if let Err(e) = demand.backend.open_feed(&self.inner, &demand.device).await {
                tracing::warn!(
                    stream = %self.id,
                    device = %demand.device.id(),
                    error = %e,
                    "Failed to open device feed"
                );
                self.deactivate(&subscriptions).await;
                self.state.started.store(false, Ordering::Release);
                return Err(Error::from_connect(demand.device.id(), e));
            }
        }

        tracing::info!(stream = %self.id, devices = subscriptions.len(), "Stream started");
        Ok(())
    }

    /// Stops the stream and releases its subscriptions.
    ///
    /// Backends left without subscribers are closed, waiting at most the
    /// close timeout before forcing teardown. Once this returns no queued
    /// reading reaches the callback anymore. The one reading the dispatch
    /// task had already taken may still be delivered, so a single callback
    /// invocation can begin or finish after `stop` returns.
    /// Idempotent, and safe to call from a task spawned by the callback.
    pub async fn stop(&self) {
        if self.state.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inbox.close();
        // The dispatch task exits on its own once the inbox is closed
        drop(self.dispatch.lock().take());

        let ids = self.subscription_ids();
        self.inner.release(&ids).await;
        self.state.devices.lock().clear();
        tracing::info!(stream = %self.id, subscriptions = ids.len(), "Stream stopped");
    }

    /// Removes one device from the stream.
    ///
    /// Its feed and backend are closed when no other stream uses them.
    /// Returns `true` if the device was part of the stream.
    pub async fn unsubscribe(&self, device_id: &str) -> bool {
        if !self.state.devices.lock().remove(device_id) {
            return false;
        }
        self.inbox.discard(device_id);

        let id = self.inner.registry().find(self.id, device_id);
        if let Some(id) = id {
            self.inner.release(&[id]).await;
        }
        tracing::debug!(stream = %self.id, device = %device_id, "Device unsubscribed");
        true
    }

    fn spawn_dispatch(&self) {
        let mut dispatch = self.dispatch.lock();
        if dispatch.is_none() {
            *dispatch = Some(tokio::spawn(delivery::dispatch(
                self.id,
                Arc::clone(&self.inbox),
                Arc::clone(&self.state),
                Arc::clone(&self.callback),
                self.inner.bus().clone(),
            )));
        }
    }

    /// Reverts the activations made by a failed start.
    async fn deactivate(&self, subscriptions: &[StreamSubscription]) {
        let unused: Vec<_> = {
            let mut registry = self.inner.registry();
            subscriptions
                .iter()
                .filter_map(|(id, ..)| registry.deactivate(*id))
                .collect()
        };
        for (backend, device_id) in unused {
            backend.close_feed(&self.inner, &device_id).await;
        }
    }

    fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.inner
            .registry()
            .stream_subscriptions(self.id)
            .into_iter()
            .map(|(id, ..)| id)
            .collect()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.state.stopped.store(true, Ordering::Release);
        self.inbox.close();
        let ids = self.subscription_ids();
        self.inner.release_detached(&ids);
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("devices", &self.devices())
            .field("started", &self.is_started())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
