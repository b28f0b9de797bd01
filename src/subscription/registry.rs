// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bookkeeping of subscriptions and the backends serving them.
//!
//! The registry is plain data guarded by the manager's lock: it never performs
//! I/O. Operations that require closing a feed or a backend return what has to
//! be closed, and the caller does it after releasing the lock.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::context::Credential;
use crate::event::StreamId;
use crate::transport::Sharing;
use crate::types::{DeviceRef, TransportKind};

use super::inbox::Inbox;

/// Unique identifier for a subscription.
///
/// One subscription links one device to one stream handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Returns the raw ID value.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sub({})", self.0)
    }
}

pub(crate) type BackendId = u64;

/// Selection key for reusing a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum BackendKey {
    /// The backend shared by every device of a transport opened with the
    /// same credential.
    Shared(TransportKind, Option<Credential>),
    /// The backend dedicated to one device.
    Device(TransportKind, String),
}

impl BackendKey {
    pub(crate) fn new(
        sharing: Sharing,
        device: &DeviceRef,
        credential: Option<&Credential>,
    ) -> Self {
        match sharing {
            Sharing::PerTransport => Self::Shared(device.transport(), credential.cloned()),
            Sharing::PerDevice => Self::Device(device.transport(), device.id().to_string()),
        }
    }
}

#[derive(Debug)]
struct Subscription {
    device: DeviceRef,
    stream: StreamId,
    backend: BackendId,
    inbox: Arc<Inbox>,
    active: bool,
}

#[derive(Debug)]
struct BackendEntry<H> {
    handle: H,
    key: BackendKey,
    ref_count: usize,
    /// Active subscriptions per device; a feed is open while positive.
    feeds: HashMap<String, usize>,
}

/// A feed that must be opened after the lock is released.
#[derive(Debug)]
pub(crate) struct FeedDemand<H> {
    pub(crate) backend: H,
    pub(crate) device: DeviceRef,
}

/// What a removal left behind for the caller to close.
#[derive(Debug)]
pub(crate) struct Removal<H> {
    pub(crate) device_id: String,
    pub(crate) backend: H,
    /// The device feed is no longer used by anyone.
    pub(crate) close_feed: bool,
    /// The backend is no longer referenced by anyone.
    pub(crate) close_backend: bool,
}

/// Subscriptions, backends and the index selecting backends for reuse.
#[derive(Debug)]
pub(crate) struct SubscriptionRegistry<H> {
    next_subscription: u64,
    next_backend: BackendId,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    backends: HashMap<BackendId, BackendEntry<H>>,
    selection: HashMap<BackendKey, BackendId>,
}

impl<H> Default for SubscriptionRegistry<H> {
    fn default() -> Self {
        Self {
            next_subscription: 1,
            next_backend: 1,
            subscriptions: HashMap::new(),
            backends: HashMap::new(),
            selection: HashMap::new(),
        }
    }
}

impl<H: Clone> SubscriptionRegistry<H> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription on the backend selected by `key`.
    ///
    /// `create` builds a new backend handle when none is selectable; it runs
    /// under the caller's lock and must not perform I/O.
    pub(crate) fn subscribe(
        &mut self,
        key: BackendKey,
        device: DeviceRef,
        stream: StreamId,
        inbox: Arc<Inbox>,
        create: impl FnOnce(BackendId) -> H,
    ) -> (SubscriptionId, H) {
        let backend_id = match self.selection.get(&key) {
            Some(id) => *id,
            None => {
                let id = self.next_backend;
                self.next_backend += 1;
                self.selection.insert(key.clone(), id);
                id
            }
        };

        let entry = self
            .backends
            .entry(backend_id)
            .or_insert_with(|| BackendEntry {
                handle: create(backend_id),
                key,
                ref_count: 0,
                feeds: HashMap::new(),
            });
        entry.ref_count += 1;
        let handle = entry.handle.clone();

        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscriptions.insert(
            id,
            Subscription {
                device,
                stream,
                backend: backend_id,
                inbox,
                active: false,
            },
        );

        (id, handle)
    }

    /// Marks a subscription active; returns a feed to open if it is the
    /// first active subscription for its device on its backend.
    pub(crate) fn activate(&mut self, id: SubscriptionId) -> Option<FeedDemand<H>> {
        let sub = self.subscriptions.get_mut(&id)?;
        if sub.active {
            return None;
        }
        let entry = self.backends.get_mut(&sub.backend)?;
        sub.active = true;

        let count = entry.feeds.entry(sub.device.id().to_string()).or_insert(0);
        *count += 1;
        (*count == 1).then(|| FeedDemand {
            backend: entry.handle.clone(),
            device: sub.device.clone(),
        })
    }

    /// Reverts [`activate`](Self::activate); returns the backend whose feed
    /// must be closed if nobody else uses it.
    pub(crate) fn deactivate(&mut self, id: SubscriptionId) -> Option<(H, String)> {
        let sub = self.subscriptions.get_mut(&id)?;
        if !sub.active {
            return None;
        }
        sub.active = false;
        let entry = self.backends.get_mut(&sub.backend)?;
        decrement_feed(&mut entry.feeds, sub.device.id())
            .then(|| (entry.handle.clone(), sub.device.id().to_string()))
    }

    /// Removes a subscription and reports what became unused.
    pub(crate) fn remove(&mut self, id: SubscriptionId) -> Option<Removal<H>> {
        let sub = self.subscriptions.remove(&id)?;
        let entry = self.backends.get_mut(&sub.backend)?;
        let device_id = sub.device.id().to_string();

        let close_feed = sub.active && decrement_feed(&mut entry.feeds, &device_id);
        entry.ref_count = entry.ref_count.saturating_sub(1);
        let handle = entry.handle.clone();

        let close_backend = entry.ref_count == 0;
        if close_backend
            && let Some(entry) = self.backends.remove(&sub.backend)
            && self.selection.get(&entry.key) == Some(&sub.backend)
        {
            self.selection.remove(&entry.key);
        }

        Some(Removal {
            device_id,
            backend: handle,
            close_feed,
            close_backend,
        })
    }

    /// Makes a backend unselectable so later subscribers get a fresh one.
    pub(crate) fn retire(&mut self, backend: BackendId) {
        if let Some(entry) = self.backends.get(&backend)
            && self.selection.get(&entry.key) == Some(&backend)
        {
            self.selection.remove(&entry.key);
        }
    }

    /// Returns the inboxes of active subscriptions for a device on a backend.
    pub(crate) fn sinks_for(&self, backend: BackendId, device_id: &str) -> Vec<Arc<Inbox>> {
        self.subscriptions
            .values()
            .filter(|s| s.active && s.backend == backend && s.device.id() == device_id)
            .map(|s| Arc::clone(&s.inbox))
            .collect()
    }

    /// Returns `true` while an active subscription needs the device feed.
    pub(crate) fn feed_wanted(&self, backend: BackendId, device_id: &str) -> bool {
        self.backends
            .get(&backend)
            .is_some_and(|entry| entry.feeds.contains_key(device_id))
    }

    /// Returns the selectable backend currently serving a device.
    pub(crate) fn backend_for_device(&self, device_id: &str) -> Option<H> {
        self.subscriptions
            .values()
            .filter(|s| s.device.id() == device_id)
            .filter_map(|s| Some((s.backend, self.backends.get(&s.backend)?)))
            .find(|(id, entry)| self.selection.get(&entry.key) == Some(id))
            .map(|(_, entry)| entry.handle.clone())
    }

    /// Returns the devices and streams depending on a backend.
    pub(crate) fn dependents(&self, backend: BackendId) -> (Vec<String>, Vec<StreamId>) {
        let mut devices = Vec::new();
        let mut streams = Vec::new();
        let mut seen_devices = HashSet::new();
        let mut seen_streams = HashSet::new();

        for sub in self.subscriptions.values().filter(|s| s.backend == backend) {
            if seen_devices.insert(sub.device.id()) {
                devices.push(sub.device.id().to_string());
            }
            if seen_streams.insert(sub.stream) {
                streams.push(sub.stream);
            }
        }
        devices.sort();
        (devices, streams)
    }

    /// Returns the subscriptions of a stream, with their backend and device.
    pub(crate) fn stream_subscriptions(
        &self,
        stream: StreamId,
    ) -> Vec<(SubscriptionId, H, DeviceRef)> {
        let mut subs: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.stream == stream)
            .filter_map(|(id, s)| {
                let entry = self.backends.get(&s.backend)?;
                Some((*id, entry.handle.clone(), s.device.clone()))
            })
            .collect();
        subs.sort_by_key(|(id, _, _)| *id);
        subs
    }

    /// Finds the subscription linking a stream to a device.
    pub(crate) fn find(&self, stream: StreamId, device_id: &str) -> Option<SubscriptionId> {
        self.subscriptions
            .iter()
            .find(|(_, s)| s.stream == stream && s.device.id() == device_id)
            .map(|(id, _)| *id)
    }

    /// Returns every subscription id.
    pub(crate) fn subscription_ids(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<_> = self.subscriptions.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Returns the inbox of every stream with at least one subscription.
    pub(crate) fn inboxes(&self) -> Vec<Arc<Inbox>> {
        let mut seen = HashSet::new();
        self.subscriptions
            .values()
            .filter(|s| seen.insert(s.stream))
            .map(|s| Arc::clone(&s.inbox))
            .collect()
    }

    pub(crate) fn backend_count(&self) -> usize {
        self.backends.len()
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Returns the reference count of a backend (0 if unknown).
    #[cfg(test)]
    pub(crate) fn ref_count(&self, backend: BackendId) -> usize {
        self.backends.get(&backend).map_or(0, |e| e.ref_count)
    }
}

/// Decrements a device feed count; returns `true` when it reached zero.
fn decrement_feed(feeds: &mut HashMap<String, usize>, device_id: &str) -> bool {
    let Some(count) = feeds.get_mut(device_id) else {
        return false;
    };
    *count = count.saturating_sub(1);
    if *count == 0 {
        feeds.remove(device_id);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Registry = SubscriptionRegistry<BackendId>;

    fn inbox() -> Arc<Inbox> {
        Arc::new(Inbox::new(4))
    }

    fn relay(id: &str) -> DeviceRef {
        DeviceRef::relay(id, id)
    }

    fn subscribe(
        reg: &mut Registry,
        sharing: Sharing,
        device: DeviceRef,
        stream: StreamId,
    ) -> (SubscriptionId, BackendId) {
        let key = BackendKey::new(sharing, &device, None);
        reg.subscribe(key, device, stream, inbox(), |id| id)
    }

    #[test]
    fn shared_backend_is_reused() {
        let mut reg = Registry::new();
        let (s1, s2) = (StreamId::new(), StreamId::new());
        let (_, b1) = subscribe(&mut reg, Sharing::PerTransport, relay("d1"), s1);
        let (_, b2) = subscribe(&mut reg, Sharing::PerTransport, relay("d2"), s2);

        assert_eq!(b1, b2);
        assert_eq!(reg.backend_count(), 1);
        assert_eq!(reg.ref_count(b1), 2);
    }

    #[test]
    fn shared_backend_is_scoped_to_credential() {
        let mut reg = Registry::new();
        let alice = Credential::bearer("alice");
        let mut subscribe_as = |credential: Option<&Credential>, device_id: &str| {
            let device = relay(device_id);
            let key = BackendKey::new(Sharing::PerTransport, &device, credential);
            reg.subscribe(key, device, StreamId::new(), inbox(), |id| id).1
        };

        let b1 = subscribe_as(Some(&alice), "d1");
        let b2 = subscribe_as(Some(&alice), "d2");
        let b3 = subscribe_as(Some(&Credential::bearer("bob")), "d1");
        let b4 = subscribe_as(None, "d9");

        assert_eq!(b1, b2);
        assert_ne!(b1, b3);
        assert_ne!(b1, b4);
        assert_ne!(b3, b4);
        assert_eq!(reg.backend_count(), 3);
    }

    #[test]
    fn per_device_backend_ignores_credential() {
        let device = DeviceRef::direct("a", "A");
        let alice = Credential::bearer("alice");
        assert_eq!(
            BackendKey::new(Sharing::PerDevice, &device, Some(&alice)),
            BackendKey::new(Sharing::PerDevice, &device, None)
        );
    }

    #[test]
    fn per_device_backends_are_distinct() {
        let mut reg = Registry::new();
        let stream = StreamId::new();
        let a = DeviceRef::direct("a", "A");
        let (_, b1) = subscribe(&mut reg, Sharing::PerDevice, a.clone(), stream);
        let (_, b2) = subscribe(&mut reg, Sharing::PerDevice, DeviceRef::direct("b", "B"), stream);
        let (_, b3) = subscribe(&mut reg, Sharing::PerDevice, a, StreamId::new());

        assert_ne!(b1, b2);
        assert_eq!(b1, b3);
        assert_eq!(reg.backend_count(), 2);
    }

    #[test]
    fn feed_opened_once_per_device() {
        let mut reg = Registry::new();
        let (s1, b) = subscribe(&mut reg, Sharing::PerTransport, relay("d1"), StreamId::new());
        let (s2, _) = subscribe(&mut reg, Sharing::PerTransport, relay("d1"), StreamId::new());

        let demand = reg.activate(s1).unwrap();
        assert_eq!(demand.backend, b);
        assert_eq!(demand.device.id(), "d1");
        assert!(reg.activate(s2).is_none());
        assert!(reg.activate(s1).is_none());
        assert_eq!(reg.sinks_for(b, "d1").len(), 2);
        assert!(reg.feed_wanted(b, "d1"));
        assert!(!reg.feed_wanted(b, "d2"));
    }

    #[test]
    fn removal_closes_feed_then_backend() {
        let mut reg = Registry::new();
        let (s1, b) = subscribe(&mut reg, Sharing::PerTransport, relay("d1"), StreamId::new());
        let (s2, _) = subscribe(&mut reg, Sharing::PerTransport, relay("d1"), StreamId::new());
        reg.activate(s1);
        reg.activate(s2);

        let first = reg.remove(s1).unwrap();
        assert!(!first.close_feed);
        assert!(!first.close_backend);
        assert_eq!(reg.ref_count(b), 1);
        assert!(reg.feed_wanted(b, "d1"));

        let second = reg.remove(s2).unwrap();
        assert!(second.close_feed);
        assert!(second.close_backend);
        assert_eq!(reg.backend_count(), 0);
        assert!(reg.remove(s2).is_none());
    }

    #[test]
    fn inactive_removal_does_not_close_feed() {
        let mut reg = Registry::new();
        let (s1, _) = subscribe(&mut reg, Sharing::PerTransport, relay("d1"), StreamId::new());
        let removal = reg.remove(s1).unwrap();
        assert!(!removal.close_feed);
        assert!(removal.close_backend);
    }

    #[test]
    fn deactivate_reverts_activation() {
        let mut reg = Registry::new();
        let (s1, b) = subscribe(&mut reg, Sharing::PerTransport, relay("d1"), StreamId::new());
        reg.activate(s1);

        assert_eq!(reg.deactivate(s1), Some((b, "d1".to_string())));
        assert!(!reg.feed_wanted(b, "d1"));
        assert!(reg.deactivate(s1).is_none());
        assert!(reg.sinks_for(b, "d1").is_empty());
        assert!(reg.activate(s1).is_some());
    }

    #[test]
    fn retired_backend_is_not_selected_again() {
        let mut reg = Registry::new();
        let (_, b1) = subscribe(&mut reg, Sharing::PerTransport, relay("d1"), StreamId::new());
        reg.retire(b1);
        assert!(reg.backend_for_device("d1").is_none());

        let (_, b2) = subscribe(&mut reg, Sharing::PerTransport, relay("d1"), StreamId::new());
        assert_ne!(b1, b2);
        assert_eq!(reg.backend_count(), 2);
        assert_eq!(reg.backend_for_device("d1"), Some(b2));
    }

    #[test]
    fn stream_queries() {
        let mut reg = Registry::new();
        let stream = StreamId::new();
        let other = StreamId::new();
        let (s1, b) = subscribe(&mut reg, Sharing::PerTransport, relay("d1"), stream);
        let (s2, _) = subscribe(&mut reg, Sharing::PerTransport, relay("d2"), stream);
        subscribe(&mut reg, Sharing::PerTransport, relay("d1"), other);

        let ids: Vec<_> = reg
            .stream_subscriptions(stream)
            .into_iter()
            .map(|(id, ..)| id)
            .collect();
        assert_eq!(ids, vec![s1, s2]);
        assert_eq!(reg.find(stream, "d2"), Some(s2));
        assert_eq!(reg.find(stream, "d3"), None);

        let (devices, streams) = reg.dependents(b);
        assert_eq!(devices, vec!["d1", "d2"]);
        assert_eq!(streams.len(), 2);
        assert_eq!(reg.inboxes().len(), 2);
        assert_eq!(reg.subscription_count(), 3);
    }
}
