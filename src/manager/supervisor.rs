// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Backend supervision: reconnection and failure reporting.

use std::sync::{Arc, Weak};

use tokio::sync::watch;

use crate::error::ConnectError;
use crate::event::Diagnostic;
use crate::transport::LinkStatus;

use super::backend_handle::{BackendHandle, ConnectionState};
use super::stream_manager::ManagerInner;

/// Watches a backend's link status until the backend shuts down.
///
/// A lost link is re-opened with exponential backoff. When the retries are
/// exhausted, or the credential is rejected, the backend is marked failed
/// and retired so later subscribers get a fresh one.
///
/// `status` must be subscribed before the task is spawned so no change made
/// in between is missed.
pub(crate) async fn supervise(
    manager: Weak<ManagerInner>,
    backend: Arc<BackendHandle>,
    mut status: watch::Receiver<LinkStatus>,
) {
    let shutdown = backend.shutdown_token().clone();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }

        let current = status.borrow_and_update().clone();
        let Some(manager) = manager.upgrade() else {
            return;
        };

        match current {
            LinkStatus::Up | LinkStatus::Down => {}
            LinkStatus::AuthRejected => {
                fail_auth(&manager, &backend);
                return;
            }
            LinkStatus::Lost(reason) => {
                if !reconnect(&manager, &backend, &reason).await {
                    return;
                }
                // Skip the status updates made by our own reconnect
                status.borrow_and_update();
            }
        }
    }
}

/// Re-opens a lost backend; returns `false` if supervision should end.
async fn reconnect(manager: &Arc<ManagerInner>, backend: &Arc<BackendHandle>, reason: &str) -> bool {
    let policy = manager.config().reconnection;
    let shutdown = backend.shutdown_token().clone();
    let (devices, streams) = manager.dependents(backend.id());
    tracing::warn!(
        backend = backend.id(),
        transport = %backend.kind(),
        error = %reason,
        reconnecting = policy.should_retry(0),
        "Backend connection lost"
    );
    if policy.should_retry(0) {
        backend.set_state(ConnectionState::Connecting);
        manager.publish(Diagnostic::BackendDisconnected {
            transport: backend.kind(),
            devices,
            streams,
            error: reason.to_string(),
            reconnecting: true,
        });
    }

    let mut attempt = 0;
    let mut last_error = reason.to_string();
    while policy.should_retry(attempt) {
        let delay = policy.delay_for_attempt(attempt);
        tracing::debug!(
            backend = backend.id(),
            attempt,
            delay_ms = delay.as_millis(),
            "Reconnecting backend"
        );

        tokio::select! {
            () = shutdown.cancelled() => return false,
            () = tokio::time::sleep(delay) => {}
        }

        let result = tokio::select! {
            () = shutdown.cancelled() => return false,
            result = backend.transport().open() => result,
        };

        match result {
            Ok(()) => {
                backend.set_state(ConnectionState::Connected);
                tracing::info!(backend = backend.id(), attempt, "Backend reconnected");
                manager.publish(Diagnostic::BackendReconnected {
                    transport: backend.kind(),
                    attempt,
                });
                return true;
            }
            Err(ConnectError::AuthRejected) => {
                fail_auth(manager, backend);
                return false;
            }
            Err(e) => {
                tracing::warn!(backend = backend.id(), attempt, error = %e, "Reconnect attempt failed");
                last_error = e.to_string();
                attempt += 1;
            }
        }
    }

    let (devices, streams) = manager.retire(backend);
    tracing::error!(
        backend = backend.id(),
        transport = %backend.kind(),
        attempts = attempt,
        error = %last_error,
        "Backend failed, giving up"
    );
    manager.publish(Diagnostic::BackendDisconnected {
        transport: backend.kind(),
        devices,
        streams,
        error: last_error,
        reconnecting: false,
    });
    false
}

fn fail_auth(manager: &Arc<ManagerInner>, backend: &Arc<BackendHandle>) {
    let (devices, streams) = manager.retire(backend);
    tracing::warn!(
        backend = backend.id(),
        transport = %backend.kind(),
        "Backend rejected the credential"
    );
    manager.publish(Diagnostic::AuthExpired {
        transport: backend.kind(),
        devices,
        streams,
    });
}
