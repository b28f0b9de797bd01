// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device metadata lookup.
//!
//! A [`DeviceDirectory`] resolves a device id into a [`DeviceRef`] carrying
//! its name and transport hint. It is used by
//! [`StreamManager::subscribe_ids`](crate::StreamManager::subscribe_ids);
//! callers that already hold device references never need one.
//!
//! - [`StaticDirectory`] - In-memory directory, handy for tests and fixed fleets
//! - [`HttpDirectory`] - REST lookup against the device cloud (feature `http`)

#[cfg(feature = "http")]
mod http;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::context::Credential;
use crate::error::DirectoryError;
use crate::types::DeviceRef;

#[cfg(feature = "http")]
pub use http::{API_URL_ENV, HttpDirectory};

/// Resolves device ids into device references.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Looks a device up.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::NotFound`] for unknown ids, or another
    /// [`DirectoryError`] if the lookup itself failed.
    async fn lookup(
        &self,
        credential: Option<&Credential>,
        device_id: &str,
    ) -> Result<DeviceRef, DirectoryError>;
}

/// A directory backed by a fixed set of devices.
///
/// # Examples
///
/// ```
/// use sensorlink::DeviceRef;
/// use sensorlink::directory::{DeviceDirectory, StaticDirectory};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let directory = StaticDirectory::new([DeviceRef::relay("mic-1", "Office mic")]);
/// let device = directory.lookup(None, "mic-1").await.unwrap();
/// assert_eq!(device.name(), "Office mic");
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    devices: HashMap<String, DeviceRef>,
}

impl StaticDirectory {
    /// Creates a directory holding the given devices.
    #[must_use]
    pub fn new(devices: impl IntoIterator<Item = DeviceRef>) -> Self {
        Self {
            devices: devices
                .into_iter()
                .map(|device| (device.id().to_string(), device))
                .collect(),
        }
    }

    /// Adds or replaces a device.
    pub fn insert(&mut self, device: DeviceRef) {
        self.devices.insert(device.id().to_string(), device);
    }

    /// Returns the number of known devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns `true` if the directory is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[async_trait]
impl DeviceDirectory for StaticDirectory {
    async fn lookup(
        &self,
        _credential: Option<&Credential>,
        device_id: &str,
    ) -> Result<DeviceRef, DirectoryError> {
        self.devices
            .get(device_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(device_id.to_string()))
    }
}
