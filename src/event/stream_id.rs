// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stream handle identifier type.

use std::fmt;

use uuid::Uuid;

/// Unique identifier of a [`StreamHandle`](crate::StreamHandle).
///
/// Diagnostics that concern a specific group of subscriptions carry this id
/// so applications can tell which stream was affected.
///
/// # Examples
///
/// ```
/// use sensorlink::event::StreamId;
///
/// let id = StreamId::new();
/// println!("Stream: {id}");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Creates a new unique stream identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 characters are enough to tell streams apart in logs
        let short = &self.0.to_string()[..8];
        write!(f, "StreamId({short}...)")
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for StreamId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_creates_unique_ids() {
        assert_ne!(StreamId::new(), StreamId::new());
    }

    #[test]
    fn debug_format_is_shortened() {
        let debug = format!("{:?}", StreamId::new());
        assert!(debug.starts_with("StreamId("));
        assert!(debug.ends_with("...)"));
    }

    #[test]
    fn display_is_full_uuid() {
        let uuid = Uuid::parse_str("a1a2a3a4-b1b2-c1c2-d1d2-d3d4d5d6d7d8").unwrap();
        assert_eq!(
            StreamId::from(uuid).to_string(),
            "a1a2a3a4-b1b2-c1c2-d1d2-d3d4d5d6d7d8"
        );
    }
}
