// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Diagnostic channel for stream observability.
//!
//! Runtime conditions that must not abort delivery are reported as
//! [`Diagnostic`] events on a [`DiagnosticBus`], a tokio broadcast channel
//! any number of listeners can subscribe to.
//!
//! # Examples
//!
//! ```
//! use sensorlink::event::{Diagnostic, DiagnosticBus};
//!
//! let bus = DiagnosticBus::new();
//! let mut rx = bus.subscribe();
//!
//! bus.publish(Diagnostic::malformed("mic-1", "/v1/mic-1/data", "empty payload"));
//! ```

mod diagnostic;
mod event_bus;
mod stream_id;

pub(crate) use event_bus::DEFAULT_CHANNEL_CAPACITY;

pub use diagnostic::Diagnostic;
pub use event_bus::DiagnosticBus;
pub use stream_id::StreamId;
