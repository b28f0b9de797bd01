// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Broadcast channel for diagnostics.

use tokio::sync::broadcast;

use super::Diagnostic;

/// Default channel capacity for the diagnostic bus.
pub(crate) const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Bus broadcasting [`Diagnostic`] events to any number of listeners.
///
/// Publishing never blocks. A listener that falls more than the channel
/// capacity behind receives `RecvError::Lagged` and skips the oldest events.
///
/// # Examples
///
/// ```
/// use sensorlink::event::{Diagnostic, DiagnosticBus};
///
/// let bus = DiagnosticBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(Diagnostic::dropped("mic-1", None, 4));
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct DiagnosticBus {
    sender: broadcast::Sender<Diagnostic>,
}

impl DiagnosticBus {
    /// Creates a new bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a new bus buffering up to `capacity` events per listener.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns a receiver for all events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Diagnostic> {
        self.sender.subscribe()
    }

    /// Returns the number of active listeners.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publishes an event; silently discarded when nobody listens.
    pub fn publish(&self, event: Diagnostic) {
        tracing::trace!(?event, "Publishing diagnostic");
        let _ = self.sender.send(event);
    }
}

impl Default for DiagnosticBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_bus_has_no_subscribers() {
        assert_eq!(DiagnosticBus::new().subscriber_count(), 0);
    }

    #[test]
    fn dropping_receiver_decrements_count() {
        let bus = DiagnosticBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = DiagnosticBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(Diagnostic::malformed("d1", "t", "bad"));

        assert_eq!(rx1.recv().await.unwrap().device_ids(), vec!["d1"]);
        assert_eq!(rx2.recv().await.unwrap().device_ids(), vec!["d1"]);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        DiagnosticBus::new().publish(Diagnostic::dropped("d1", None, 1));
    }

    #[test]
    fn clone_shares_channel() {
        let bus = DiagnosticBus::with_capacity(8);
        let other = bus.clone();
        let _rx = bus.subscribe();
        assert_eq!(other.subscriber_count(), 1);
    }
}
