// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-stream delivery inbox.
//!
//! Every stream handle owns one inbox holding a bounded queue per device.
//! Fan-out tasks push readings in; the handle's dispatch task pops them out
//! round-robin across devices so a chatty device cannot starve a quiet one.
//! Per device, readings come out in the order they went in.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::types::Reading;

/// A reading ready for dispatch.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub(crate) reading: Arc<Reading>,
    /// Readings of the same device evicted since the previous delivery.
    pub(crate) dropped: usize,
}

#[derive(Debug, Default)]
struct DeviceQueue {
    items: VecDeque<Arc<Reading>>,
    dropped: usize,
}

#[derive(Debug, Default)]
struct InboxState {
    queues: HashMap<String, DeviceQueue>,
    /// Devices with pending readings, in service order.
    ready: VecDeque<String>,
    closed: bool,
}

#[derive(Debug)]
pub(crate) struct Inbox {
    state: Mutex<InboxState>,
    notify: Notify,
    capacity: usize,
}

impl Inbox {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(InboxState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Queues a reading, evicting the device's oldest one when full.
    ///
    /// Returns `false` if the inbox is closed.
    pub(crate) fn push(&self, reading: Arc<Reading>) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }

            let device_id = reading.device_id().to_string();
            let queue = state.queues.entry(device_id.clone()).or_default();
            let was_idle = queue.items.is_empty();
            if queue.items.len() >= self.capacity {
                queue.items.pop_front();
                queue.dropped += 1;
            }
            queue.items.push_back(reading);

            if was_idle {
                state.ready.push_back(device_id);
            }
        }
        self.notify.notify_one();
        true
    }

    /// Waits for the next reading; `None` once the inbox is closed.
    pub(crate) async fn pop(&self) -> Option<Delivery> {
        loop {
            if let Some(delivery) = self.try_pop()? {
                return Some(delivery);
            }
            self.notify.notified().await;
        }
    }

    /// Returns `None` if closed, `Some(None)` if empty.
    fn try_pop(&self) -> Option<Option<Delivery>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }

        let InboxState { queues, ready, .. } = &mut *state;
        while let Some(device_id) = ready.pop_front() {
            let Some(queue) = queues.get_mut(&device_id) else {
                continue;
            };
            let Some(reading) = queue.items.pop_front() else {
                continue;
            };
            let dropped = std::mem::take(&mut queue.dropped);
            if !queue.items.is_empty() {
                ready.push_back(device_id);
            }
            return Some(Some(Delivery { reading, dropped }));
        }
        Some(None)
    }

    /// Discards everything queued for a device.
    pub(crate) fn discard(&self, device_id: &str) {
        let mut state = self.state.lock();
        state.queues.remove(device_id);
        state.ready.retain(|id| id != device_id);
    }

    /// Closes the inbox and discards everything queued.
    pub(crate) fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.queues.clear();
            state.ready.clear();
        }
        self.notify.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.state.lock().queues.values().map(|q| q.items.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::types::Payload;

    fn reading(device: &str, n: i64) -> Arc<Reading> {
        Arc::new(Reading::new(
            device,
            "t",
            Payload::Structured(json!({ "n": n })),
            Utc::now(),
            None,
        ))
    }

    fn n(delivery: &Delivery) -> i64 {
        delivery
            .reading
            .value("n")
            .and_then(serde_json::Value::as_i64)
            .unwrap()
    }

    #[tokio::test]
    async fn round_robin_across_devices() {
        let inbox = Inbox::new(10);
        inbox.push(reading("a", 1));
        inbox.push(reading("a", 2));
        inbox.push(reading("a", 3));
        inbox.push(reading("b", 10));

        let order: Vec<(String, i64)> = {
            let mut out = Vec::new();
            for _ in 0..4 {
                let d = inbox.pop().await.unwrap();
                out.push((d.reading.device_id().to_string(), n(&d)));
            }
            out
        };

        assert_eq!(
            order,
            vec![
                ("a".to_string(), 1),
                ("b".to_string(), 10),
                ("a".to_string(), 2),
                ("a".to_string(), 3),
            ]
        );
    }

    #[tokio::test]
    async fn overflow_reports_dropped_with_next_delivery() {
        let inbox = Inbox::new(2);
        for i in 0..5 {
            inbox.push(reading("a", i));
        }

        let first = inbox.pop().await.unwrap();
        assert_eq!(first.dropped, 3);
        assert_eq!(n(&first), 3);

        let second = inbox.pop().await.unwrap();
        assert_eq!(second.dropped, 0);
        assert_eq!(n(&second), 4);
    }

    #[tokio::test]
    async fn discard_removes_one_device() {
        let inbox = Inbox::new(4);
        inbox.push(reading("a", 1));
        inbox.push(reading("b", 2));
        inbox.discard("a");

        assert_eq!(inbox.pending(), 1);
        assert_eq!(inbox.pop().await.unwrap().reading.device_id(), "b");
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumer() {
        let inbox = Arc::new(Inbox::new(4));
        let consumer = {
            let inbox = Arc::clone(&inbox);
            tokio::spawn(async move { inbox.pop().await.is_none() })
        };

        tokio::task::yield_now().await;
        inbox.close();

        assert!(consumer.await.unwrap());
        assert!(!inbox.push(reading("a", 1)));
    }
}
