// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stream manager coordinating subscriptions and transport backends.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::context::StreamContext;
use crate::error::{ConfigError, ConnectError, Error, Result};
use crate::event::{Diagnostic, DiagnosticBus, StreamId};
use crate::subscription::{
    BackendId, BackendKey, Inbox, Removal, SubscriptionId, SubscriptionRegistry,
};
use crate::transport::TransportFactory;
use crate::types::{DeviceRef, Reading, TransportKind};

#[cfg(feature = "direct")]
use crate::transport::direct::DirectFactory;
#[cfg(feature = "direct")]
use crate::transport::gatttool::GattConfig;
#[cfg(feature = "relay")]
use crate::transport::relay::{RELAY_URL_ENV, RelayConfig, RelayFactory};

use super::backend_handle::{BackendHandle, ConnectionState};
use super::stream_config::StreamConfig;
use super::stream_handle::StreamHandle;

pub(crate) type Registry = SubscriptionRegistry<Arc<BackendHandle>>;

/// State shared by the manager, its handles and its background tasks.
///
/// Background tasks hold it weakly so a dropped manager stops them.
#[derive(Debug)]
pub(crate) struct ManagerInner {
    registry: Mutex<Registry>,
    bus: DiagnosticBus,
    config: StreamConfig,
    factories: HashMap<TransportKind, Arc<dyn TransportFactory>>,
}

impl ManagerInner {
    pub(crate) fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub(crate) fn bus(&self) -> &DiagnosticBus {
        &self.bus
    }

    pub(crate) fn publish(&self, event: Diagnostic) {
        self.bus.publish(event);
    }

    /// Locks the registry. Never hold the guard across an `.await`.
    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock()
    }

    pub(crate) fn sinks_for(&self, backend: BackendId, device_id: &str) -> Vec<Arc<Inbox>> {
        self.registry.lock().sinks_for(backend, device_id)
    }

    pub(crate) fn dependents(&self, backend: BackendId) -> (Vec<String>, Vec<StreamId>) {
        self.registry.lock().dependents(backend)
    }

    /// Marks a backend failed and removes it from selection.
    ///
    /// Returns the devices and streams that depended on it.
    pub(crate) fn retire(&self, backend: &BackendHandle) -> (Vec<String>, Vec<StreamId>) {
        backend.set_state(ConnectionState::Failed);
        let mut registry = self.registry.lock();
        registry.retire(backend.id());
        registry.dependents(backend.id())
    }

    /// Removes subscriptions and closes whatever they left unused.
    pub(crate) async fn release(&self, ids: &[SubscriptionId]) {
        let removals = self.remove(ids);
        self.finish_removals(removals).await;
    }

    /// Like [`release`](Self::release), without awaiting the teardown.
    ///
    /// Used from `Drop`; falls back to a forced teardown outside a runtime.
    pub(crate) fn release_detached(self: &Arc<Self>, ids: &[SubscriptionId]) {
        let removals = self.remove(ids);
        if removals.is_empty() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = Arc::clone(self);
                runtime.spawn(async move { inner.finish_removals(removals).await });
            }
            Err(_) => {
                for removal in removals.into_iter().filter(|r| r.close_backend) {
                    removal.backend.abort();
                }
            }
        }
    }

    fn remove(&self, ids: &[SubscriptionId]) -> Vec<Removal<Arc<BackendHandle>>> {
        let mut registry = self.registry.lock();
        ids.iter().filter_map(|id| registry.remove(*id)).collect()
    }

    async fn finish_removals(&self, removals: Vec<Removal<Arc<BackendHandle>>>) {
        for removal in removals {
            if removal.close_backend {
                removal.backend.shutdown(self.config.close_timeout).await;
            } else if removal.close_feed {
                removal.backend.close_feed(self, &removal.device_id).await;
            }
        }
    }

    fn factory(&self, kind: TransportKind) -> Result<&Arc<dyn TransportFactory>> {
        self.factories
            .get(&kind)
            .ok_or(Error::UnsupportedTransport(kind))
    }
}

/// Manager for live telemetry streams.
///
/// The `StreamManager` turns "give me the readings of these devices" into
/// transport connections: it selects or creates the backend serving each
/// device, shares connections between subscribers, fans readings out to
/// every interested stream and tears backends down when nobody needs them
/// anymore.
///
/// # Features
///
/// - **Connection Sharing**: one relay connection per credential serves every
///   relay device
/// - **Uniform Delivery**: one callback type for every transport
/// - **Backpressure**: bounded per-device queues that drop the oldest reading
/// - **Auto-Reconnection**: configurable backoff on connection loss
/// - **Diagnostics**: drops, malformed payloads and link events on a channel
///
/// # Examples
///
/// ```no_run
/// use sensorlink::manager::StreamManager;
/// use sensorlink::transport::relay::RelayConfig;
/// use sensorlink::{Credential, DeviceRef, StreamContext};
///
/// #[tokio::main]
/// async fn main() -> sensorlink::Result<()> {
///     let manager = StreamManager::builder()
///         .relay(RelayConfig::from_url("mqtt://relay.example.com:1883")?)
///         .build();
///
///     let mut diagnostics = manager.diagnostics();
///     tokio::spawn(async move {
///         while let Ok(event) = diagnostics.recv().await {
///             eprintln!("diagnostic: {event:?}");
///         }
///     });
///
///     let context = StreamContext::new().with_credential(Credential::bearer("token"));
///     let handle = manager
///         .subscribe(&context, [DeviceRef::relay("mic-1", "Office mic")], |reading| {
///             println!("{}: {:?}", reading.device_id(), reading.payload());
///         })
///         .await?;
///
///     handle.start().await?;
///     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
///     handle.stop().await;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct StreamManager {
    inner: Arc<ManagerInner>,
}

impl StreamManager {
    /// Returns a builder for configuring a manager.
    #[must_use]
    pub fn builder() -> StreamManagerBuilder {
        StreamManagerBuilder::default()
    }

    /// Creates a manager from `SENSORLINK_*` environment variables.
    ///
    /// The relay backend is registered when `SENSORLINK_RELAY_URL` is set;
    /// the `gatttool` direct backend is always registered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is set but invalid.
    pub fn from_env() -> Result<Self> {
        #[allow(unused_mut)]
        let mut builder = Self::builder().config(StreamConfig::from_env()?);

        #[cfg(feature = "relay")]
        if std::env::var_os(RELAY_URL_ENV).is_some() {
            builder = builder.relay(RelayConfig::from_env()?);
        }
        #[cfg(feature = "direct")]
        {
            builder = builder.gatttool(GattConfig::default());
        }

        Ok(builder.build())
    }

    /// Subscribes a stream to a set of devices.
    ///
    /// Devices are de-duplicated by id. Every device is attached to the
    /// backend serving its transport (created if needed) and each distinct
    /// backend is connected before this returns. Delivery begins with
    /// [`StreamHandle::start`].
    ///
    /// The callback runs on the stream's own dispatch task, once per reading.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedTransport`] if no backend is registered for a
    ///   device's transport; nothing is created in that case.
    /// - [`Error::DeviceUnreachable`] if a backend cannot connect within the
    ///   connect timeout.
    /// - [`Error::AuthExpired`] if a backend rejected the credential.
    ///
    /// On error every subscription made by this call is rolled back.
    pub async fn subscribe<I, F>(
        &self,
        context: &StreamContext,
        devices: I,
        callback: F,
    ) -> Result<StreamHandle>
    where
        I: IntoIterator<Item = DeviceRef>,
        F: Fn(&Reading) + Send + Sync + 'static,
    {
        let mut seen = HashSet::new();
        let devices: Vec<DeviceRef> = devices
            .into_iter()
            .filter(|device| seen.insert(device.id().to_string()))
            .collect();

        // Validate every transport before touching the registry
        let factories = devices
            .iter()
            .map(|device| self.inner.factory(device.transport()).map(Arc::clone))
            .collect::<Result<Vec<_>>>()?;

        let stream = StreamId::new();
        let inbox = Arc::new(Inbox::new(self.inner.config.queue_capacity));
        let options = self.inner.config.link_options();

        let mut backends: Vec<(Arc<BackendHandle>, String)> = Vec::new();
        {
            let mut registry = self.inner.registry.lock();
            for (device, factory) in devices.iter().zip(&factories) {
                let key = BackendKey::new(factory.sharing(), device, context.credential());
                let (_, backend) = registry.subscribe(
                    key,
                    device.clone(),
                    stream,
                    Arc::clone(&inbox),
                    |backend_id| {
                        let shutdown = CancellationToken::new();
                        let transport =
                            factory.create(device, context, &options, shutdown.clone());
                        tracing::debug!(backend = backend_id, transport = %device.transport(), "Creating backend");
                        Arc::new(BackendHandle::new(
                            backend_id,
                            device.transport(),
                            transport,
                            shutdown,
                        ))
                    },
                );
                if !backends.iter().any(|(b, _)| b.id() == backend.id()) {
                    backends.push((backend, device.id().to_string()));
                }
            }
        }

        // From here on, dropping the handle rolls the subscriptions back
        let handle = StreamHandle::new(
            stream,
            Arc::clone(&self.inner),
            devices.iter().map(|d| d.id().to_string()),
            inbox,
            Arc::new(callback),
        );

        for (backend, device_id) in &backends {
            if let Err(e) = backend.ensure_open(&self.inner).await {
                tracing::warn!(
                    stream = %stream,
                    device = %device_id,
                    transport = %backend.kind(),
                    error = %e,
                    "Backend connection failed, rolling back subscribe"
                );
                handle.stop().await;
                return Err(Error::from_connect(device_id, e));
            }
        }

        tracing::info!(
            stream = %stream,
            devices = devices.len(),
            backends = backends.len(),
            "Stream subscribed"
        );
        Ok(handle)
    }

    /// Subscribes a stream to devices known only by id.
    ///
    /// Ids are resolved through the directory of `context` before any
    /// subscription is attempted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the context has no directory,
    /// [`Error::DeviceUnreachable`] if a lookup fails, or any error of
    /// [`subscribe`](Self::subscribe).
    pub async fn subscribe_ids<I, S, F>(
        &self,
        context: &StreamContext,
        ids: I,
        callback: F,
    ) -> Result<StreamHandle>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&Reading) + Send + Sync + 'static,
    {
        let directory = context
            .directory()
            .ok_or_else(|| ConfigError::Missing("device directory".into()))?;

        let mut devices = Vec::new();
        for id in ids {
            let id = id.as_ref();
            let device = directory
                .lookup(context.credential(), id)
                .await
                .map_err(|e| Error::DeviceUnreachable {
                    device_id: id.to_string(),
                    source: ConnectError::Lookup(e),
                })?;
            devices.push(device);
        }

        self.subscribe(context, devices, callback).await
    }

    /// Removes one device from a stream.
    ///
    /// Returns `true` if the device was part of the stream.
    pub async fn unsubscribe(&self, handle: &StreamHandle, device_id: &str) -> bool {
        handle.unsubscribe(device_id).await
    }

    /// Returns a receiver for diagnostic events.
    #[must_use]
    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.inner.bus.subscribe()
    }

    /// Returns the number of live backends.
    #[must_use]
    pub fn backend_count(&self) -> usize {
        self.inner.registry.lock().backend_count()
    }

    /// Returns the number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.lock().subscription_count()
    }

    /// Returns the state of the active backend serving a device.
    ///
    /// Returns `None` if no subscription references the device, or if its
    /// backend failed and was retired.
    #[must_use]
    pub fn backend_state(&self, device_id: &str) -> Option<ConnectionState> {
        self.inner
            .registry
            .lock()
            .backend_for_device(device_id)
            .map(|backend| backend.state())
    }

    /// Stops every stream and closes every backend.
    ///
    /// Handles created before remain valid but deliver nothing; starting
    /// them fails with [`Error::StreamStopped`].
    pub async fn shutdown(&self) {
        let (inboxes, ids) = {
            let registry = self.inner.registry.lock();
            (registry.inboxes(), registry.subscription_ids())
        };
        for inbox in inboxes {
            inbox.close();
        }
        self.inner.release(&ids).await;
        tracing::info!(subscriptions = ids.len(), "Stream manager shut down");
    }
}

/// Builder for [`StreamManager`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use sensorlink::manager::{StreamConfig, StreamManager};
/// use sensorlink::transport::relay::RelayConfig;
///
/// let manager = StreamManager::builder()
///     .config(StreamConfig::default().with_connect_timeout(Duration::from_secs(3)))
///     .relay(RelayConfig::new("localhost", 1883))
///     .build();
///
/// assert_eq!(manager.backend_count(), 0);
/// ```
#[derive(Debug, Default)]
pub struct StreamManagerBuilder {
    config: StreamConfig,
    factories: HashMap<TransportKind, Arc<dyn TransportFactory>>,
}

impl StreamManagerBuilder {
    /// Sets the stream configuration.
    #[must_use]
    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a backend factory, replacing any previous one of its kind.
    #[must_use]
    pub fn transport(mut self, factory: impl TransportFactory + 'static) -> Self {
        self.factories.insert(factory.kind(), Arc::new(factory));
        self
    }

    /// Registers the MQTT relay backend.
    #[cfg(feature = "relay")]
    #[must_use]
    pub fn relay(self, config: RelayConfig) -> Self {
        self.transport(RelayFactory::new(config))
    }

    /// Registers the `gatttool` direct backend.
    #[cfg(feature = "direct")]
    #[must_use]
    pub fn gatttool(self, config: GattConfig) -> Self {
        self.transport(DirectFactory::gatttool(config))
    }

    /// Builds the manager.
    #[must_use]
    pub fn build(self) -> StreamManager {
        let bus = DiagnosticBus::with_capacity(self.config.diagnostics_capacity);
        StreamManager {
            inner: Arc::new(ManagerInner {
                registry: Mutex::new(Registry::new()),
                bus,
                config: self.config,
                factories: self.factories,
            }),
        }
    }
}
