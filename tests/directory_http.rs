// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for the REST device directory using wiremock.

use std::sync::Arc;

use sensorlink::directory::{DeviceDirectory, HttpDirectory};
use sensorlink::manager::StreamManager;
use sensorlink::{ConnectError, Credential, DirectoryError, Error, StreamContext, TransportKind};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount(server: &MockServer, device_path: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(device_path))
        .respond_with(response)
        .mount(server)
        .await;
}

// ============================================================================
// Lookup
// ============================================================================

mod lookup {
    use super::*;

    #[tokio::test]
    async fn resolves_device_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/devices/mic-1"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "mic-1",
                "name": "Office microphone",
                "transport": "relay"
            })))
            .mount(&server)
            .await;

        let directory = HttpDirectory::new(server.uri()).unwrap();
        let credential = Credential::bearer("secret");
        let device = directory.lookup(Some(&credential), "mic-1").await.unwrap();

        assert_eq!(device.id(), "mic-1");
        assert_eq!(device.name(), "Office microphone");
        assert_eq!(device.transport(), TransportKind::Relay);
    }

    #[tokio::test]
    async fn resolves_direct_device_address() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/devices/tag-7",
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "tag-7",
                "name": "Freezer tag",
                "transport": "direct",
                "address": "F2:EE:50:45:39:74"
            })),
        )
        .await;

        let directory = HttpDirectory::new(server.uri()).unwrap();
        let device = directory.lookup(None, "tag-7").await.unwrap();

        assert_eq!(device.transport(), TransportKind::Direct);
        assert_eq!(device.address(), "F2:EE:50:45:39:74");
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let server = MockServer::start().await;
        mount(&server, "/devices/ghost", ResponseTemplate::new(404)).await;

        let directory = HttpDirectory::new(server.uri()).unwrap();
        let err = directory.lookup(None, "ghost").await.unwrap_err();

        assert!(matches!(err, DirectoryError::NotFound(ref id) if id == "ghost"));
    }

    #[tokio::test]
    async fn rejected_credential_is_unauthorized() {
        let server = MockServer::start().await;
        mount(&server, "/devices/mic-1", ResponseTemplate::new(401)).await;

        let directory = HttpDirectory::new(server.uri()).unwrap();
        let err = directory
            .lookup(Some(&Credential::bearer("expired")), "mic-1")
            .await
            .unwrap_err();

        assert!(matches!(err, DirectoryError::Unauthorized));
    }

    #[tokio::test]
    async fn server_error_reports_status() {
        let server = MockServer::start().await;
        mount(&server, "/devices/mic-1", ResponseTemplate::new(503)).await;

        let directory = HttpDirectory::new(server.uri()).unwrap();
        let err = directory.lookup(None, "mic-1").await.unwrap_err();

        assert!(matches!(err, DirectoryError::Status(503)));
    }

    #[tokio::test]
    async fn unparsable_body_is_a_request_error() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/devices/mic-1",
            ResponseTemplate::new(200).set_body_string("not json"),
        )
        .await;

        let directory = HttpDirectory::new(server.uri()).unwrap();
        let err = directory.lookup(None, "mic-1").await.unwrap_err();

        assert!(matches!(err, DirectoryError::Request(_)));
    }
}

// ============================================================================
// subscribe_ids
// ============================================================================

mod subscribe_ids {
    use super::*;

    #[tokio::test]
    async fn lookup_failure_is_device_unreachable() {
        let server = MockServer::start().await;
        mount(&server, "/devices/ghost", ResponseTemplate::new(404)).await;

        let context = StreamContext::new()
            .with_directory(Arc::new(HttpDirectory::new(server.uri()).unwrap()));
        let manager = StreamManager::builder().build();

        let err = manager
            .subscribe_ids(&context, ["ghost"], |_| {})
            .await
            .unwrap_err();

        match err {
            Error::DeviceUnreachable { device_id, source } => {
                assert_eq!(device_id, "ghost");
                assert!(matches!(
                    source,
                    ConnectError::Lookup(DirectoryError::NotFound(_))
                ));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(manager.subscription_count(), 0);
    }

    #[tokio::test]
    async fn missing_directory_is_a_config_error() {
        let manager = StreamManager::builder().build();

        let err = manager
            .subscribe_ids(&StreamContext::new(), ["mic-1"], |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
    }
}
