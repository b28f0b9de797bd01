// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! REST device directory.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::context::Credential;
use crate::error::{ConfigError, DirectoryError};
use crate::types::{DeviceRef, TransportKind};

use super::DeviceDirectory;

/// Environment variable holding the directory base URL.
pub const API_URL_ENV: &str = "SENSORLINK_API_URL";

/// A device record as returned by `GET {base}/devices/{id}`.
#[derive(Debug, Deserialize)]
struct DeviceRecord {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    transport: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

impl DeviceRecord {
    fn into_device(self) -> Result<DeviceRef, DirectoryError> {
        let transport = match self.transport.as_deref() {
            Some(hint) => hint
                .parse::<TransportKind>()
                .map_err(|e| DirectoryError::InvalidRecord(e.to_string()))?,
            None => TransportKind::Relay,
        };

        let name = self.name.unwrap_or_else(|| self.id.clone());
        let device = DeviceRef::new(self.id, name, transport);
        Ok(match self.address {
            Some(address) => device.with_address(address),
            None => device,
        })
    }
}

/// Resolves devices through the device cloud REST API.
///
/// The credential of the stream context, if any, is sent as a bearer token.
///
/// # Examples
///
/// ```no_run
/// use sensorlink::directory::{DeviceDirectory, HttpDirectory};
/// use sensorlink::Credential;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let directory = HttpDirectory::new("https://api.example.com")?;
/// let credential = Credential::bearer("token");
/// let device = directory.lookup(Some(&credential), "mic-1").await?;
/// println!("{device}");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    base_url: String,
    client: Client,
}

impl HttpDirectory {
    /// Default request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a directory for the given API base URL.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>) -> Result<Self, DirectoryError> {
        Self::with_timeout(base_url, Self::DEFAULT_TIMEOUT)
    }

    /// Creates a directory with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be created.
    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DirectoryError> {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, client })
    }

    /// Reads the base URL from `SENSORLINK_API_URL`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if the variable is not set.
    pub fn from_env() -> Result<Self, crate::Error> {
        let base_url =
            std::env::var(API_URL_ENV).map_err(|_| ConfigError::Missing(API_URL_ENV.into()))?;
        Self::new(base_url).map_err(|e| {
            crate::Error::Config(ConfigError::InvalidValue {
                key: API_URL_ENV.to_string(),
                value: e.to_string(),
            })
        })
    }

    /// Returns the API base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn device_url(&self, device_id: &str) -> String {
        format!("{}/devices/{}", self.base_url, urlencoding::encode(device_id))
    }
}

#[async_trait]
impl DeviceDirectory for HttpDirectory {
    async fn lookup(
        &self,
        credential: Option<&Credential>,
        device_id: &str,
    ) -> Result<DeviceRef, DirectoryError> {
        let url = self.device_url(device_id);
        tracing::debug!(url = %url, "Looking up device");

        let mut request = self.client.get(&url);
        if let Some(credential) = credential {
            request = request.bearer_auth(credential.token());
        }
        let response = request.send().await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(DirectoryError::Unauthorized);
            }
            StatusCode::NOT_FOUND => return Err(DirectoryError::NotFound(device_id.to_string())),
            status if !status.is_success() => return Err(DirectoryError::Status(status.as_u16())),
            _ => {}
        }

        let record: DeviceRecord = response.json().await?;
        let device = record.into_device()?;
        tracing::debug!(device = %device, transport = %device.transport(), "Resolved device");
        Ok(device)
    }
}
