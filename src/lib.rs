// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `sensorlink` - Live sensor readings from IoT devices.
//!
//! This library streams telemetry from remote devices to a callback,
//! regardless of how the device delivers it: through a cloud relay speaking
//! MQTT, or over a direct short-range radio (BLE/GATT) link.
//!
//! # Supported Transports
//!
//! - **Relay**: one MQTT connection multiplexes every relay device; each
//!   device publishes JSON readings on its own topic
//! - **Direct**: one GATT link per device, delivering opaque notification
//!   bytes (driven through `gatttool`, or any [`GattConnector`](transport::direct::GattConnector))
//!
//! # Features
//!
//! - **Shared connections**: concurrent subscribers of a device share one link
//! - **Deterministic lifecycle**: `subscribe`, `start`, `unsubscribe`, `stop`
//! - **Backpressure**: bounded per-device queues dropping the oldest reading
//! - **Diagnostics**: drops, malformed payloads, disconnects and expired
//!   credentials on a broadcast channel
//!
//! # Quick Start
//!
//! ```no_run
//! use sensorlink::manager::StreamManager;
//! use sensorlink::transport::relay::RelayConfig;
//! use sensorlink::{Credential, DeviceRef, StreamContext};
//!
//! #[tokio::main]
//! async fn main() -> sensorlink::Result<()> {
//!     let manager = StreamManager::builder()
//!         .relay(RelayConfig::from_url("mqtt://relay.example.com:1883")?)
//!         .build();
//!
//!     let context = StreamContext::new().with_credential(Credential::bearer("token"));
//!     let devices = [
//!         DeviceRef::relay("mic-1", "Office microphone"),
//!         DeviceRef::relay("mic-2", "Lab microphone"),
//!     ];
//!
//!     let handle = manager
//!         .subscribe(&context, devices, |reading| {
//!             if let Some(level) = reading.value("snd_level") {
//!                 println!("{}: {level}", reading.device_id());
//!             }
//!         })
//!         .await?;
//!
//!     handle.start().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     handle.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Resolving Devices by Id
//!
//! ```no_run
//! use std::sync::Arc;
//! use sensorlink::directory::HttpDirectory;
//! use sensorlink::manager::StreamManager;
//! use sensorlink::{Credential, StreamContext};
//!
//! # async fn example(manager: StreamManager) -> sensorlink::Result<()> {
//! let context = StreamContext::new()
//!     .with_credential(Credential::bearer("token"))
//!     .with_directory(Arc::new(HttpDirectory::from_env()?));
//!
//! let handle = manager
//!     .subscribe_ids(&context, ["mic-1", "tag-7"], |reading| println!("{reading:?}"))
//!     .await?;
//! handle.start().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Diagnostics
//!
//! ```no_run
//! use sensorlink::Diagnostic;
//! use sensorlink::manager::StreamManager;
//!
//! # fn example(manager: &StreamManager) {
//! let mut diagnostics = manager.diagnostics();
//! tokio::spawn(async move {
//!     while let Ok(event) = diagnostics.recv().await {
//!         if let Diagnostic::AuthExpired { devices, .. } = &event {
//!             eprintln!("credential expired for {devices:?}, subscribe again");
//!         }
//!     }
//! });
//! # }
//! ```
//!
//! # Logging
//!
//! The library logs through [`tracing`] and never installs a subscriber.

pub mod context;
pub mod directory;
pub mod error;
pub mod event;
pub mod manager;
pub mod normalizer;
pub mod subscription;
pub mod transport;
pub mod types;

pub use context::{Credential, StreamContext};
pub use directory::{DeviceDirectory, StaticDirectory};
pub use error::{ConfigError, ConnectError, DirectoryError, Error, NormalizeError, Result};
pub use event::{Diagnostic, DiagnosticBus, StreamId};
pub use manager::{
    ConnectionState, ReconnectionPolicy, StreamConfig, StreamHandle, StreamManager,
    StreamManagerBuilder,
};
pub use subscription::{ReadingCallback, SubscriptionId};
pub use types::{DeviceRef, Measurement, Payload, Reading, TransportKind};
