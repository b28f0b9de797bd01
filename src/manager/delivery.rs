// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Delivery tasks.
//!
//! Readings flow through two task kinds:
//!
//! - a fan-out task per (backend, device) drains the raw feed, normalizes
//!   every message once and pushes the shared reading into the inbox of each
//!   stream subscribed to that device;
//! - a dispatch task per stream handle pops its inbox and invokes the
//!   callback, so a slow callback only delays its own stream.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;

use crate::event::{Diagnostic, DiagnosticBus, StreamId};
use crate::normalizer::normalize;
use crate::subscription::{BackendId, Inbox, ReadingCallback};
use crate::transport::RawFeed;
use crate::types::{DeviceRef, Reading};

use super::stream_handle::StreamState;
use super::stream_manager::ManagerInner;

/// Drains one device feed until it ends or `stop` is cancelled.
pub(crate) async fn fan_out(
    manager: Weak<ManagerInner>,
    backend: BackendId,
    device: DeviceRef,
    mut feed: RawFeed,
    stop: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            () = stop.cancelled() => break,
            raw = feed.next() => raw,
        };
        let Some(raw) = raw else {
            break;
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };

        let dropped = feed.take_dropped();
        if dropped > 0 {
            tracing::warn!(device = %device.id(), dropped, "Feed overflow, oldest messages dropped");
            manager.publish(Diagnostic::dropped(device.id(), None, dropped));
        }

        match normalize(&raw, &device) {
            Ok(reading) => {
                let reading = Arc::new(reading);
                for inbox in manager.sinks_for(backend, device.id()) {
                    inbox.push(Arc::clone(&reading));
                }
            }
            Err(e) => {
                tracing::warn!(
                    device = %device.id(),
                    topic = %raw.topic(),
                    error = %e,
                    "Dropping malformed message"
                );
                manager.publish(Diagnostic::malformed(device.id(), raw.topic(), e.to_string()));
            }
        }
    }
    tracing::debug!(backend, device = %device.id(), "Fan-out task finished");
}

/// Invokes the stream callback for every reading until the inbox closes.
pub(crate) async fn dispatch(
    stream: StreamId,
    inbox: Arc<Inbox>,
    state: Arc<StreamState>,
    callback: ReadingCallback,
    bus: DiagnosticBus,
) {
    while let Some(delivery) = inbox.pop().await {
        let device_id = delivery.reading.device_id();
        if delivery.dropped > 0 {
            tracing::warn!(
                stream = %stream,
                device = %device_id,
                dropped = delivery.dropped,
                "Stream queue overflow, oldest readings dropped"
            );
            bus.publish(Diagnostic::dropped(device_id, Some(stream), delivery.dropped));
        }

        // Not atomic with `stop`: this one reading may still be delivered
        // after `stop` returns
        if state.is_stopped() || !state.contains(device_id) {
            continue;
        }

        let reading: &Reading = &delivery.reading;
        if catch_unwind(AssertUnwindSafe(|| callback(reading))).is_err() {
            tracing::error!(stream = %stream, device = %device_id, "Reading callback panicked");
        }
    }
    tracing::debug!(stream = %stream, "Dispatch task finished");
}
