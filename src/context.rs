// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Explicit per-subscription client context.
//!
//! Everything a subscription needs from the outside world (the credential
//! attached to relay connections and the directory used to look devices up)
//! travels in a [`StreamContext`] passed to
//! [`StreamManager::subscribe`](crate::StreamManager::subscribe). There is no
//! process-wide session, so independent managers can coexist.

use std::fmt;
use std::sync::Arc;

use crate::directory::DeviceDirectory;

/// A bearer credential issued by the authentication provider.
///
/// The library never refreshes credentials. When a backend rejects one, an
/// `AuthExpired` diagnostic is published and the caller subscribes again with
/// a fresh context.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    user: Option<String>,
    token: String,
}

impl Credential {
    /// Creates a bearer credential.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            user: None,
            token: token.into(),
        }
    }

    /// Sets the user name presented alongside the token.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Returns the user name, if any.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Returns the token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Client context handed to every subscribe call.
///
/// # Examples
///
/// ```
/// use sensorlink::{Credential, StreamContext};
///
/// let ctx = StreamContext::new().with_credential(Credential::bearer("token"));
/// assert_eq!(ctx.credential().map(|c| c.token()), Some("token"));
/// ```
#[derive(Clone, Default)]
pub struct StreamContext {
    credential: Option<Credential>,
    directory: Option<Arc<dyn DeviceDirectory>>,
}

impl StreamContext {
    /// Creates an anonymous context without directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the credential.
    #[must_use]
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Sets the directory used to resolve device ids.
    #[must_use]
    pub fn with_directory(mut self, directory: Arc<dyn DeviceDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Returns the credential, if any.
    #[must_use]
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Returns the device directory, if any.
    #[must_use]
    pub fn directory(&self) -> Option<&Arc<dyn DeviceDirectory>> {
        self.directory.as_ref()
    }
}

impl fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamContext")
            .field("credential", &self.credential)
            .field("has_directory", &self.directory.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_token() {
        let credential = Credential::bearer("s3cr3t").with_user("app");
        let debug = format!("{credential:?}");
        assert!(!debug.contains("s3cr3t"));
        assert!(debug.contains("app"));
    }

    #[test]
    fn default_context_is_anonymous() {
        let ctx = StreamContext::new();
        assert!(ctx.credential().is_none());
        assert!(ctx.directory().is_none());
    }
}
