// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stream manager for live device telemetry.
//!
//! This module provides the entry point of the library: a [`StreamManager`]
//! accepting subscriptions and a [`StreamHandle`] per subscribed stream.
//!
//! # Overview
//!
//! - **Backend selection**: each device is attached to the backend its
//!   transport factory selects; relay devices share one connection, direct
//!   devices get one link each
//! - **Reference counting**: a backend lives exactly as long as at least one
//!   subscription references it
//! - **Fan-out**: one raw message becomes one reading delivered to every
//!   stream subscribed to the device
//! - **Supervision**: lost connections are re-opened per
//!   [`ReconnectionPolicy`]; failures surface as diagnostics
//!
//! # Lifecycle
//!
//! ```text
//! subscribe() ──► backends connected ──► start() ──► readings flow
//!                                                        │
//!                     unsubscribe(device) / stop() / drop ◄┘
//! ```
//!
//! # Examples
//!
//! ```no_run
//! use sensorlink::manager::{ReconnectionPolicy, StreamConfig, StreamManager};
//! use sensorlink::transport::relay::RelayConfig;
//! use sensorlink::{DeviceRef, StreamContext};
//!
//! #[tokio::main]
//! async fn main() -> sensorlink::Result<()> {
//!     let config = StreamConfig::default()
//!         .with_reconnection(ReconnectionPolicy::new().with_max_retries(10));
//!
//!     let manager = StreamManager::builder()
//!         .config(config)
//!         .relay(RelayConfig::from_env()?)
//!         .build();
//!
//!     let handle = manager
//!         .subscribe(&StreamContext::new(), [DeviceRef::relay("mic-1", "Office")], |r| {
//!             println!("{:?}", r.measurements());
//!         })
//!         .await?;
//!     handle.start().await?;
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

mod backend_handle;
mod delivery;
mod stream_config;
mod stream_handle;
mod stream_manager;
mod supervisor;

pub use backend_handle::ConnectionState;
pub use stream_config::{
    CLOSE_TIMEOUT_ENV, CONNECT_TIMEOUT_ENV, QUEUE_CAPACITY_ENV, ReconnectionPolicy, StreamConfig,
};
pub use stream_handle::StreamHandle;
pub use stream_manager::{StreamManager, StreamManagerBuilder};
