// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded per-device message feeds.
//!
//! A feed is the lazy sequence of raw messages a backend delivers for one
//! device. Producers never block: once the queue holds `capacity` messages,
//! each new message evicts the oldest unconsumed one and the eviction is
//! counted so the consumer can report it.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::RawMessage;

/// Single-consumer queue with drop-oldest overflow.
#[derive(Debug)]
pub(crate) struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    dropped: usize,
    closed: bool,
}

impl<T> BoundedQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Appends an item, evicting the oldest one when full.
    ///
    /// Returns `false` if the queue is closed and the item was discarded.
    pub(crate) fn push(&self, item: T) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.dropped += 1;
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Waits for the next item; `None` once the queue is closed.
    pub(crate) async fn recv(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Returns and resets the number of evicted items.
    pub(crate) fn take_dropped(&self) -> usize {
        std::mem::take(&mut self.state.lock().dropped)
    }

    /// Closes the queue, discarding anything still buffered.
    pub(crate) fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.clear();
        }
        self.notify.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}

/// Producer side of a feed, held by a backend's connection task.
#[derive(Debug, Clone)]
pub struct FeedSender {
    queue: Arc<BoundedQueue<RawMessage>>,
}

impl FeedSender {
    /// Queues a message for delivery.
    ///
    /// Never blocks. Returns `false` if the feed has been closed.
    pub fn push(&self, message: RawMessage) -> bool {
        self.queue.push(message)
    }

    /// Ends the feed. The consumer observes the end on its next read.
    pub fn close(&self) {
        self.queue.close();
    }

    /// Returns `true` once either side closed the feed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

/// Consumer side of a feed: the lazy sequence of raw messages for one device.
///
/// The sequence is infinite while the backend is connected and ends for good
/// once closed; it cannot be restarted.
#[derive(Debug)]
pub struct RawFeed {
    queue: Arc<BoundedQueue<RawMessage>>,
}

impl RawFeed {
    /// Waits for the next message; `None` once the feed ended.
    pub async fn next(&mut self) -> Option<RawMessage> {
        self.queue.recv().await
    }

    /// Returns how many messages were evicted since the last call.
    pub fn take_dropped(&mut self) -> usize {
        self.queue.take_dropped()
    }

    /// Returns the number of buffered messages.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for RawFeed {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// Creates a connected feed pair buffering up to `capacity` messages.
///
/// # Examples
///
/// ```
/// use sensorlink::transport::{feed, RawMessage};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let (tx, mut rx) = feed(2);
/// for n in 0..3 {
///     tx.push(RawMessage::new("d1", "t", format!("{{\"n\": {n}}}")));
/// }
///
/// // The oldest message was evicted
/// assert_eq!(rx.take_dropped(), 1);
/// assert_eq!(&rx.next().await.unwrap().payload()[..], b"{\"n\": 1}");
/// # }
/// ```
#[must_use]
pub fn feed(capacity: usize) -> (FeedSender, RawFeed) {
    let queue = Arc::new(BoundedQueue::new(capacity));
    (
        FeedSender {
            queue: Arc::clone(&queue),
        },
        RawFeed { queue },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn preserves_arrival_order() {
        let queue = BoundedQueue::new(10);
        for n in 0..5 {
            assert!(queue.push(n));
        }
        for n in 0..5 {
            assert_eq!(queue.recv().await, Some(n));
        }
    }

    #[tokio::test]
    async fn overflow_evicts_oldest() {
        let queue = BoundedQueue::new(3);
        for n in 0..5 {
            queue.push(n);
        }

        assert_eq!(queue.take_dropped(), 2);
        assert_eq!(queue.take_dropped(), 0);
        assert_eq!(queue.recv().await, Some(2));
        assert_eq!(queue.recv().await, Some(3));
        assert_eq!(queue.recv().await, Some(4));
    }

    #[tokio::test]
    async fn close_ends_sequence_and_rejects_pushes() {
        let queue = BoundedQueue::new(3);
        queue.push(1);
        queue.close();

        assert_eq!(queue.recv().await, None);
        assert!(!queue.push(2));
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn recv_wakes_on_push() {
        let queue = Arc::new(BoundedQueue::new(3));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.recv().await })
        };

        tokio::task::yield_now().await;
        queue.push(7);

        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn dropping_consumer_closes_feed() {
        let (tx, rx) = feed(4);
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.push(RawMessage::new("d1", "t", "{}")));
    }
}
