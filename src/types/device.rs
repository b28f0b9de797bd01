// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subscribable device references.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The delivery path a device is reachable through.
///
/// # Examples
///
/// ```
/// use sensorlink::TransportKind;
///
/// let kind: TransportKind = "mqtt".parse().unwrap();
/// assert_eq!(kind, TransportKind::Relay);
/// assert_eq!(TransportKind::Direct.to_string(), "direct");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Cloud-mediated publish/subscribe relay.
    Relay,
    /// Short-range radio link straight to the device.
    Direct,
}

impl TransportKind {
    /// Returns the lowercase name of the transport kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Relay => "relay",
            Self::Direct => "direct",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relay" | "mqtt" | "cloud" | "pubnub" => Ok(Self::Relay),
            "direct" | "ble" | "bluetooth" | "gatt" => Ok(Self::Direct),
            other => Err(ConfigError::InvalidValue {
                key: "transport".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// An immutable reference to one subscribable device.
///
/// Two references with the same `id` denote the same device; the transport
/// hint decides which backend serves it.
///
/// # Examples
///
/// ```
/// use sensorlink::{DeviceRef, TransportKind};
///
/// let mic = DeviceRef::relay("4f2c", "Wunderbar MIC");
/// assert_eq!(mic.transport(), TransportKind::Relay);
///
/// let gyro = DeviceRef::direct("9a01", "Wunderbar GYRO").with_address("F2:EE:50:45:39:74");
/// assert_eq!(gyro.address(), "F2:EE:50:45:39:74");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceRef {
    id: String,
    name: String,
    transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    address: Option<String>,
}

impl DeviceRef {
    /// Creates a device reference with an explicit transport hint.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            transport,
            address: None,
        }
    }

    /// Creates a reference to a device reached through the cloud relay.
    #[must_use]
    pub fn relay(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, TransportKind::Relay)
    }

    /// Creates a reference to a device reached over a direct radio link.
    #[must_use]
    pub fn direct(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, TransportKind::Direct)
    }

    /// Sets the radio address used by direct links.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Returns the device identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the human readable device name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the transport hint.
    #[must_use]
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Returns the radio address, falling back to the device id.
    #[must_use]
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.id)
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_transport_aliases() {
        assert_eq!("MQTT".parse::<TransportKind>().unwrap(), TransportKind::Relay);
        assert_eq!("ble".parse::<TransportKind>().unwrap(), TransportKind::Direct);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn address_defaults_to_id() {
        let device = DeviceRef::direct("C3:18:9B:AF:F6:F1", "bridge");
        assert_eq!(device.address(), "C3:18:9B:AF:F6:F1");
    }

    #[test]
    fn deserialize_without_address() {
        let device: DeviceRef =
            serde_json::from_str(r#"{"id":"d1","name":"mic","transport":"relay"}"#).unwrap();
        assert_eq!(device, DeviceRef::relay("d1", "mic"));
    }

    #[test]
    fn display_shows_name_and_id() {
        let device = DeviceRef::relay("d1", "Kitchen");
        assert_eq!(device.to_string(), "Kitchen (d1)");
    }
}
