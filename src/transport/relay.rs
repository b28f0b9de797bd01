// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cloud relay backend over MQTT.
//!
//! One [`RelayTransport`] holds one MQTT session and multiplexes every relay
//! device over it: each delivered device adds a subscription to its data
//! topic, and publishes are routed to the matching device feed by exact topic
//! match.
//!
//! # Examples
//!
//! ```
//! use sensorlink::transport::relay::RelayConfig;
//!
//! let config = RelayConfig::from_url("mqtt://broker.example.com:1884").unwrap();
//! assert_eq!(config.host(), "broker.example.com");
//! assert_eq!(config.port(), 1884);
//! assert_eq!(config.topic_for("mic-1"), "/v1/mic-1/data");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::{Credential, StreamContext};
use crate::error::{ConfigError, ConnectError};
use crate::types::{DeviceRef, TransportKind};

use super::{
    FeedSender, LinkOptions, LinkStatus, RawFeed, RawMessage, Sharing, Transport,
    TransportFactory, feed,
};

/// Global counter for generating unique client IDs.
static RELAY_CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Environment variable holding the relay broker URL.
pub const RELAY_URL_ENV: &str = "SENSORLINK_RELAY_URL";

const DEFAULT_TOPIC_TEMPLATE: &str = "/v1/{device_id}/data";

/// Configuration for the relay MQTT connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    host: String,
    port: u16,
    keep_alive: Duration,
    topic_template: String,
    client_id_prefix: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            keep_alive: Duration::from_secs(30),
            topic_template: DEFAULT_TOPIC_TEMPLATE.to_string(),
            client_id_prefix: "sensorlink".to_string(),
        }
    }
}

impl RelayConfig {
    /// Creates a configuration for the given broker host and port.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Parses a broker URL (`mqtt://host:port`, `tcp://host:port` or `host[:port]`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] if the host is empty or the
    /// port is not a number.
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let (host, port) = parse_broker_url(url)?;
        Ok(Self::new(host, port))
    }

    /// Reads the broker URL from `SENSORLINK_RELAY_URL`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if the variable is not set, or an
    /// address error if it cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let url = lookup(RELAY_URL_ENV).ok_or_else(|| ConfigError::Missing(RELAY_URL_ENV.into()))?;
        Self::from_url(&url)
    }

    /// Sets the keep-alive interval (default: 30 seconds).
    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Sets the data topic template; `{device_id}` is replaced by the device id.
    #[must_use]
    pub fn with_topic_template(mut self, template: impl Into<String>) -> Self {
        self.topic_template = template.into();
        self
    }

    /// Sets the prefix of generated MQTT client ids.
    #[must_use]
    pub fn with_client_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.client_id_prefix = prefix.into();
        self
    }

    /// Returns the broker host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the broker port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the keep-alive interval.
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// Returns the data topic for a device.
    #[must_use]
    pub fn topic_for(&self, device_id: &str) -> String {
        self.topic_template.replace("{device_id}", device_id)
    }

    fn next_client_id(&self) -> String {
        let counter = RELAY_CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}_{}", self.client_id_prefix, std::process::id(), counter)
    }
}

/// Parses a broker URL into host and port (default port 1883).
fn parse_broker_url(url: &str) -> Result<(String, u16), ConfigError> {
    let url = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url)
        .trim_end_matches('/');

    let (host, port) = if let Some((h, p)) = url.rsplit_once(':') {
        let port = p
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(format!("invalid port: {p}")))?;
        (h.to_string(), port)
    } else {
        (url.to_string(), 1883)
    };

    if host.is_empty() {
        return Err(ConfigError::InvalidAddress(
            "broker host is required".to_string(),
        ));
    }

    Ok((host, port))
}

/// Creates one shared [`RelayTransport`] per manager.
#[derive(Debug, Clone)]
pub struct RelayFactory {
    config: RelayConfig,
}

impl RelayFactory {
    /// Creates a factory connecting to the configured broker.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for RelayFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn sharing(&self) -> Sharing {
        Sharing::PerTransport
    }

    fn create(
        &self,
        _device: &DeviceRef,
        context: &StreamContext,
        options: &LinkOptions,
        shutdown: CancellationToken,
    ) -> Arc<dyn Transport> {
        Arc::new(RelayTransport::new(
            self.config.clone(),
            context.credential().cloned(),
            *options,
            shutdown,
        ))
    }
}

/// A device whose data topic is subscribed on the relay.
struct WatchedTopic {
    device_id: String,
    sender: FeedSender,
}

/// A live MQTT session: the client plus the task polling its event loop.
struct Session {
    client: AsyncClient,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// The relay backend: one MQTT session shared by every relay device.
#[derive(Clone)]
pub struct RelayTransport {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    config: RelayConfig,
    credential: Option<Credential>,
    options: LinkOptions,
    /// Cancelled by the manager to force teardown.
    shutdown: CancellationToken,
    session: Mutex<Option<Session>>,
    /// Watched topics by exact topic string.
    watched: RwLock<HashMap<String, WatchedTopic>>,
    status: watch::Sender<LinkStatus>,
    /// Serializes concurrent `open` calls.
    open_lock: tokio::sync::Mutex<()>,
}

impl RelayTransport {
    /// Creates an unopened relay backend.
    #[must_use]
    pub fn new(
        config: RelayConfig,
        credential: Option<Credential>,
        options: LinkOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(LinkStatus::Down);
        Self {
            inner: Arc::new(RelayInner {
                config,
                credential,
                options,
                shutdown,
                session: Mutex::new(None),
                watched: RwLock::new(HashMap::new()),
                status,
                open_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Returns the number of watched device topics.
    #[must_use]
    pub fn watched_count(&self) -> usize {
        self.inner.watched.read().len()
    }

    fn current_client(&self) -> Option<AsyncClient> {
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|session| session.client.clone())
    }

    fn mqtt_options(&self) -> MqttOptions {
        let config = &self.inner.config;
        let client_id = config.next_client_id();
        let mut mqtt_options = MqttOptions::new(&client_id, &config.host, config.port);
        mqtt_options.set_keep_alive(config.keep_alive);
        mqtt_options.set_clean_session(true);

        if let Some(credential) = &self.inner.credential {
            let user = credential.user().unwrap_or(&client_id);
            mqtt_options.set_credentials(user, credential.token());
        }
        mqtt_options
    }

    async fn subscribe_watched(&self, client: &AsyncClient) -> Result<(), ConnectError> {
        let topics: Vec<String> = self.inner.watched.read().keys().cloned().collect();
        for topic in topics {
            client.subscribe(&topic, QoS::AtLeastOnce).await?;
            tracing::debug!(topic = %topic, "Resubscribed device topic");
        }
        Ok(())
    }
}

impl RelayInner {
    /// Routes an incoming publish to the device feed watching its topic.
    fn route(&self, topic: &str, payload: Bytes) {
        let watched = self.watched.read();
        let Some(entry) = watched.get(topic) else {
            tracing::trace!(topic = %topic, "No device watches topic");
            return;
        };

        tracing::trace!(topic = %topic, device = %entry.device_id, "Routing relay message");
        if !entry
            .sender
            .push(RawMessage::new(entry.device_id.clone(), topic, payload))
        {
            tracing::trace!(device = %entry.device_id, "Feed closed, message discarded");
        }
    }

    fn close_feeds(&self) {
        for (_, entry) in self.watched.write().drain() {
            entry.sender.close();
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    async fn open(&self) -> Result<(), ConnectError> {
        let _guard = self.inner.open_lock.lock().await;

        if self.inner.shutdown.is_cancelled() {
            return Err(ConnectError::Closed);
        }
        if *self.inner.status.borrow() == LinkStatus::Up {
            return Ok(());
        }

        // Discard a previous session whose connection was lost
        if let Some(old) = self.inner.session.lock().take() {
            old.token.cancel();
        }

        let (client, event_loop) = AsyncClient::new(self.mqtt_options(), 10);
        let token = self.inner.shutdown.child_token();
        let (connack_tx, connack_rx) = oneshot::channel();

        let task = tokio::spawn(handle_relay_events(
            event_loop,
            Arc::clone(&self.inner),
            token.clone(),
            connack_tx,
        ));

        let timeout = self.inner.options.connect_timeout;
        let connected = match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectError::Refused(
                "MQTT event loop terminated unexpectedly".to_string(),
            )),
            Err(_) => Err(ConnectError::Timeout(timeout)),
        };

        if let Err(e) = connected {
            token.cancel();
            tracing::warn!(
                host = %self.inner.config.host,
                port = %self.inner.config.port,
                error = %e,
                "Failed to connect to relay broker"
            );
            return Err(e);
        }

        if let Err(e) = self.subscribe_watched(&client).await {
            token.cancel();
            return Err(e);
        }

        *self.inner.session.lock() = Some(Session {
            client,
            token,
            task,
        });
        self.inner.status.send_replace(LinkStatus::Up);

        tracing::info!(
            host = %self.inner.config.host,
            port = %self.inner.config.port,
            "Connected to relay broker"
        );
        Ok(())
    }

    async fn deliver(&self, device: &DeviceRef) -> Result<RawFeed, ConnectError> {
        let topic = self.inner.config.topic_for(device.id());
        let (sender, feed) = feed(self.inner.options.queue_capacity);

        let previous = self.inner.watched.write().insert(
            topic.clone(),
            WatchedTopic {
                device_id: device.id().to_string(),
                sender,
            },
        );
        if let Some(previous) = previous {
            previous.sender.close();
        }

        // While disconnected the topic is picked up by the next `open`
        if *self.inner.status.borrow() == LinkStatus::Up
            && let Some(client) = self.current_client()
            && let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await
        {
            if let Some(entry) = self.inner.watched.write().remove(&topic) {
                entry.sender.close();
            }
            return Err(e.into());
        }

        tracing::debug!(device = %device.id(), topic = %topic, "Subscribed device topic");
        Ok(feed)
    }

    async fn release(&self, device_id: &str) {
        let topic = self.inner.config.topic_for(device_id);
        let Some(entry) = self.inner.watched.write().remove(&topic) else {
            return;
        };
        entry.sender.close();

        if let Some(client) = self.current_client()
            && let Err(e) = client.unsubscribe(&topic).await
        {
            tracing::warn!(topic = %topic, error = %e, "Failed to unsubscribe device topic");
        }

        tracing::debug!(device = %device_id, topic = %topic, "Unsubscribed device topic");
    }

    async fn close(&self) {
        let session = self.inner.session.lock().take();
        self.inner.status.send_replace(LinkStatus::Down);
        self.inner.close_feeds();

        let Some(session) = session else {
            return;
        };

        tracing::info!(
            host = %self.inner.config.host,
            port = %self.inner.config.port,
            "Disconnecting from relay broker"
        );

        // The event loop exits once the DISCONNECT packet went out
        if let Err(e) = session.client.disconnect().await {
            tracing::warn!(error = %e, "Failed to send MQTT disconnect");
            session.token.cancel();
        }
        if let Err(e) = session.task.await {
            tracing::warn!(error = %e, "Relay event loop task failed");
        }
        session.token.cancel();
    }

    fn status(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }
}

impl fmt::Debug for RelayTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayTransport")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("status", &*self.inner.status.borrow())
            .field("watched", &self.watched_count())
            .finish()
    }
}

fn is_auth_rejection(error: &ConnectionError) -> bool {
    matches!(
        error,
        ConnectionError::ConnectionRefused(
            ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword
        )
    )
}

/// Polls the MQTT event loop until the session is cancelled or the
/// connection ends.
async fn handle_relay_events(
    mut event_loop: EventLoop,
    inner: Arc<RelayInner>,
    token: CancellationToken,
    connack_tx: oneshot::Sender<Result<(), ConnectError>>,
) {
    let mut connack_tx = Some(connack_tx);

    loop {
        let event = tokio::select! {
            () = token.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                tracing::debug!(?connack, "Relay broker acknowledged connection");
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                tracing::debug!(?suback, "Relay subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                inner.route(&publish.topic, publish.payload);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("Relay session closed");
                break;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::info!("Relay broker closed the connection");
                if !token.is_cancelled() {
                    inner
                        .status
                        .send_replace(LinkStatus::Lost("broker sent DISCONNECT".to_string()));
                }
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let auth = is_auth_rejection(&e);
                if let Some(tx) = connack_tx.take() {
                    let error = if auth {
                        ConnectError::AuthRejected
                    } else {
                        ConnectError::Refused(e.to_string())
                    };
                    let _ = tx.send(Err(error));
                    break;
                }

                if !token.is_cancelled() {
                    tracing::error!(error = %e, "Relay event loop error");
                    let status = if auth {
                        LinkStatus::AuthRejected
                    } else {
                        LinkStatus::Lost(e.to_string())
                    };
                    inner.status.send_replace(status);
                }
                break;
            }
        }
    }
}
