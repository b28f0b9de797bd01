// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! GATT link driver backed by the BlueZ `gatttool` command.
//!
//! The driver runs
//! `gatttool -t <type> -b <address> --char-write-req -a <handle> -n 0100 --listen`,
//! which writes the client characteristic configuration descriptor to enable
//! notifications and then prints one line per notification:
//!
//! ```text
//! Characteristic value was written successfully
//! Notification handle = 0x0024 value: 2a 00 1f
//! ```

use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

use crate::error::ConnectError;

use super::direct::{GattConnector, GattSession, Notification};

const HANDSHAKE_MARKER: &str = "written successfully";

/// Bluetooth LE address type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressType {
    /// Public device address.
    Public,
    /// Random device address (most sensor tags).
    #[default]
    Random,
}

impl AddressType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Random => "random",
        }
    }
}

/// Configuration for the `gatttool` link driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattConfig {
    program: String,
    adapter: Option<String>,
    address_type: AddressType,
    notify_handle: u16,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            program: "gatttool".to_string(),
            adapter: None,
            address_type: AddressType::Random,
            notify_handle: 0x0025,
        }
    }
}

impl GattConfig {
    /// Sets the path of the `gatttool` executable.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Sets the HCI adapter (e.g. `hci1`).
    #[must_use]
    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = Some(adapter.into());
        self
    }

    /// Sets the address type (default: random).
    #[must_use]
    pub fn with_address_type(mut self, address_type: AddressType) -> Self {
        self.address_type = address_type;
        self
    }

    /// Sets the configuration descriptor handle that enables notifications.
    #[must_use]
    pub fn with_notify_handle(mut self, handle: u16) -> Self {
        self.notify_handle = handle;
        self
    }

    /// Returns the notification descriptor handle.
    #[must_use]
    pub fn notify_handle(&self) -> u16 {
        self.notify_handle
    }

    fn args(&self, address: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(12);
        if let Some(adapter) = &self.adapter {
            args.extend(["-i".to_string(), adapter.clone()]);
        }
        args.extend([
            "-t".to_string(),
            self.address_type.as_str().to_string(),
            "-b".to_string(),
            address.to_string(),
            "--char-write-req".to_string(),
            "-a".to_string(),
            format!("0x{:04x}", self.notify_handle),
            "-n".to_string(),
            "0100".to_string(),
            "--listen".to_string(),
        ]);
        args
    }
}

/// Opens GATT links by spawning `gatttool`.
#[derive(Debug, Clone, Default)]
pub struct GatttoolConnector {
    config: GattConfig,
}

impl GatttoolConnector {
    /// Creates a connector with the given configuration.
    #[must_use]
    pub fn new(config: GattConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl GattConnector for GatttoolConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn GattSession>, ConnectError> {
        let mut child = Command::new(&self.config.program)
            .args(self.config.args(address))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectError::Refused("gatttool stdout unavailable".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            match lines.next_line().await? {
                Some(line) if line.contains(HANDSHAKE_MARKER) => break,
                Some(line) if is_failure(&line) => {
                    let _ = child.kill().await;
                    return Err(ConnectError::Refused(line.trim().to_string()));
                }
                Some(line) => tracing::trace!(line = %line, "gatttool output"),
                None => {
                    return Err(ConnectError::Refused(
                        "gatttool exited before notifications were enabled".to_string(),
                    ));
                }
            }
        }

        tracing::debug!(address = %address, "Notifications enabled");
        Ok(Box::new(GatttoolSession { child, lines }))
    }
}

struct GatttoolSession {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

#[async_trait]
impl GattSession for GatttoolSession {
    async fn next_notification(&mut self) -> Result<Option<Notification>, ConnectError> {
        while let Some(line) = self.lines.next_line().await? {
            if let Some(notification) = parse_notification(&line) {
                return Ok(Some(notification));
            }
            tracing::trace!(line = %line, "Ignoring gatttool output");
        }
        Ok(None)
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "gatttool already exited");
        }
    }
}

fn is_failure(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("error") || lower.contains("failed") || lower.contains("refused")
}

/// Parses a `Notification handle = 0x0024 value: 2a 00` line.
///
/// Indications use the same format and are accepted too.
fn parse_notification(line: &str) -> Option<Notification> {
    let rest = line
        .trim()
        .strip_prefix("Notification handle = ")
        .or_else(|| line.trim().strip_prefix("Indication handle = "))?;
    let (handle, value) = rest.split_once("value:")?;

    let handle = handle.trim();
    let handle = handle.strip_prefix("0x").unwrap_or(handle);
    let handle = u16::from_str_radix(handle, 16).ok()?;

    let value = value
        .split_whitespace()
        .map(|byte| u8::from_str_radix(byte, 16).ok())
        .collect::<Option<Vec<u8>>>()?;

    Some(Notification {
        handle,
        value: Bytes::from(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_notification_line() {
        let n = parse_notification("Notification handle = 0x0024 value: 2a 00 1f ").unwrap();
        assert_eq!(n.handle, 0x24);
        assert_eq!(n.value, Bytes::from_static(&[0x2a, 0x00, 0x1f]));
    }

    #[test]
    fn parses_indication_line() {
        let n = parse_notification("Indication handle = 0x0030 value: ff").unwrap();
        assert_eq!(n.handle, 0x30);
        assert_eq!(n.value, Bytes::from_static(&[0xff]));
    }

    #[test]
    fn rejects_other_lines() {
        assert!(parse_notification("Characteristic value was written successfully").is_none());
        assert!(parse_notification("Notification handle = 0xzz value: 00").is_none());
        assert!(parse_notification("Notification handle = 0x0024 value: 0g").is_none());
    }

    #[test]
    fn detects_failures() {
        assert!(is_failure("connect error: Connection refused (111)"));
        assert!(is_failure("Characteristic Write Request failed: Attribute can't be written"));
        assert!(!is_failure("Characteristic value was written successfully"));
    }

    #[test]
    fn builds_command_arguments() {
        let config = GattConfig::default()
            .with_adapter("hci1")
            .with_notify_handle(0x0f);
        let args = config.args("AA:BB:CC:DD:EE:FF");
        assert_eq!(
            args,
            vec![
                "-i",
                "hci1",
                "-t",
                "random",
                "-b",
                "AA:BB:CC:DD:EE:FF",
                "--char-write-req",
                "-a",
                "0x000f",
                "-n",
                "0100",
                "--listen",
            ]
        );
    }

    #[tokio::test]
    async fn missing_program_fails_to_connect() {
        let connector = GatttoolConnector::new(
            GattConfig::default().with_program("/nonexistent/sensorlink-gatttool"),
        );
        let result = connector.connect("AA:BB:CC:DD:EE:FF").await;
        assert!(matches!(result, Err(ConnectError::Io(_))));
    }
}
