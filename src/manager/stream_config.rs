// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration types for the stream manager.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::event::DEFAULT_CHANNEL_CAPACITY;
use crate::transport::LinkOptions;

/// Environment variable overriding the connect timeout, in milliseconds.
pub const CONNECT_TIMEOUT_ENV: &str = "SENSORLINK_CONNECT_TIMEOUT_MS";
/// Environment variable overriding the close timeout, in milliseconds.
pub const CLOSE_TIMEOUT_ENV: &str = "SENSORLINK_CLOSE_TIMEOUT_MS";
/// Environment variable overriding the per-device queue capacity.
pub const QUEUE_CAPACITY_ENV: &str = "SENSORLINK_QUEUE_CAPACITY";

/// Timeouts, queue sizes and reconnection behavior of a stream manager.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use sensorlink::manager::{ReconnectionPolicy, StreamConfig};
///
/// let config = StreamConfig::default()
///     .with_connect_timeout(Duration::from_secs(5))
///     .with_queue_capacity(500)
///     .with_reconnection(ReconnectionPolicy::disabled());
///
/// assert_eq!(config.queue_capacity, 500);
/// assert!(!config.reconnection.should_retry(0));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Upper bound for establishing a backend connection.
    pub connect_timeout: Duration,
    /// Upper bound for a graceful backend close before it is forced.
    pub close_timeout: Duration,
    /// Per-device capacity of feeds and stream inboxes.
    pub queue_capacity: usize,
    /// Capacity of the diagnostic broadcast channel.
    pub diagnostics_capacity: usize,
    /// Reconnection policy for lost backend connections.
    pub reconnection: ReconnectionPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            queue_capacity: 100,
            diagnostics_capacity: DEFAULT_CHANNEL_CAPACITY,
            reconnection: ReconnectionPolicy::default(),
        }
    }
}

impl StreamConfig {
    /// Sets the connect timeout (default: 10 seconds).
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the close timeout (default: 5 seconds).
    #[must_use]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Sets the per-device queue capacity (default: 100).
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Sets the diagnostic channel capacity.
    #[must_use]
    pub fn with_diagnostics_capacity(mut self, capacity: usize) -> Self {
        self.diagnostics_capacity = capacity.max(1);
        self
    }

    /// Sets the reconnection policy.
    #[must_use]
    pub fn with_reconnection(mut self, policy: ReconnectionPolicy) -> Self {
        self.reconnection = policy;
        self
    }

    /// Applies `SENSORLINK_*` environment overrides to the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a variable is set but cannot
    /// be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup` on top of this configuration.
    pub(crate) fn overlay(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(ms) = parse_var::<u64>(&lookup, CONNECT_TIMEOUT_ENV)? {
            self.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, CLOSE_TIMEOUT_ENV)? {
            self.close_timeout = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, QUEUE_CAPACITY_ENV)? {
            if capacity == 0 {
                return Err(ConfigError::InvalidValue {
                    key: QUEUE_CAPACITY_ENV.to_string(),
                    value: capacity.to_string(),
                });
            }
            self.queue_capacity = capacity;
        }
        Ok(self)
    }

    pub(crate) fn link_options(&self) -> LinkOptions {
        LinkOptions {
            connect_timeout: self.connect_timeout,
            queue_capacity: self.queue_capacity,
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        })
}

/// Exponential backoff for re-opening lost backends.
///
/// The delay starts at `initial_delay` and doubles after every failed
/// attempt, capped at `max_delay`. After `max_retries` failures the backend
/// is marked failed.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use sensorlink::manager::ReconnectionPolicy;
///
/// let policy = ReconnectionPolicy::new()
///     .with_max_retries(3)
///     .with_initial_delay(Duration::from_millis(500));
///
/// assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
/// assert!(!policy.should_retry(3));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectionPolicy {
    /// Attempts before giving up; 0 disables reconnection.
    pub max_retries: u32,
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound of the delay.
    pub max_delay: Duration,
}

impl ReconnectionPolicy {
    /// Creates a policy with default settings (5 attempts, 1s to 30s).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a policy that never reconnects.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default().with_max_retries(0)
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Returns the delay to wait before attempt `attempt` (0-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Returns `true` if attempt `attempt` (0-based) should be made.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}
