// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subscription bookkeeping.
//!
//! A subscription links one device to one stream handle. The registry tracks
//! which backend serves each subscription, how many subscriptions reference
//! each backend, and which stream inboxes want the readings of each device.
//!
//! - [`SubscriptionId`] - Unique identifier of one (device, stream) link
//! - [`ReadingCallback`] - The callback type invoked for every reading

mod inbox;
mod registry;

use std::sync::Arc;

use crate::types::Reading;

pub(crate) use inbox::Inbox;
pub(crate) use registry::{BackendId, BackendKey, FeedDemand, Removal, SubscriptionRegistry};
pub use registry::SubscriptionId;

/// Type alias for reading callbacks.
///
/// Callbacks run on the stream's dispatch task; a slow callback delays only
/// its own stream.
pub type ReadingCallback = Arc<dyn Fn(&Reading) + Send + Sync>;
