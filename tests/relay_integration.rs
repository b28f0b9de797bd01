// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for the relay backend using mockforge-mqtt.

use std::time::Duration;

use mockforge_mqtt::broker::MqttConfig;
use mockforge_mqtt::start_mqtt_server;
use sensorlink::manager::{ConnectionState, StreamConfig, StreamManager};
use sensorlink::transport::relay::RelayConfig;
use sensorlink::{DeviceRef, Error, StreamContext};
use tokio::time::sleep;

/// Helper to find an available port for testing.
fn get_test_port() -> u16 {
    use std::sync::atomic::{AtomicU16, Ordering};
    static PORT_COUNTER: AtomicU16 = AtomicU16::new(18950);
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Starts a mock MQTT broker on the given port.
async fn start_mock_broker(port: u16) {
    let config = MqttConfig {
        port,
        host: "127.0.0.1".to_string(),
        ..Default::default()
    };

    tokio::spawn(async move {
        let _ = start_mqtt_server(config).await;
    });

    // Give the broker time to bind
    sleep(Duration::from_millis(500)).await;
}

fn manager_for(port: u16) -> StreamManager {
    StreamManager::builder()
        .config(StreamConfig::default().with_connect_timeout(Duration::from_secs(3)))
        .relay(RelayConfig::new("127.0.0.1", port))
        .build()
}

// ============================================================================
// Connection
// ============================================================================

mod connection {
    use super::*;

    #[tokio::test]
    async fn subscribe_connects_backend() {
        let port = get_test_port();
        start_mock_broker(port).await;
        let manager = manager_for(port);

        let handle = manager
            .subscribe(&StreamContext::new(), [DeviceRef::relay("mic-1", "Mic")], |_| {})
            .await
            .expect("subscribe should connect to the broker");

        assert_eq!(manager.backend_count(), 1);
        assert_eq!(manager.subscription_count(), 1);
        assert_eq!(manager.backend_state("mic-1"), Some(ConnectionState::Connected));

        handle.start().await.expect("start should subscribe the topic");
        assert!(handle.is_started());

        handle.stop().await;
        assert_eq!(manager.backend_count(), 0);
    }

    #[tokio::test]
    async fn unreachable_broker_fails_subscribe() {
        let manager = StreamManager::builder()
            .config(StreamConfig::default().with_connect_timeout(Duration::from_secs(2)))
            .relay(RelayConfig::new("127.0.0.1", 1))
            .build();

        let err = manager
            .subscribe(&StreamContext::new(), [DeviceRef::relay("mic-1", "Mic")], |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DeviceUnreachable { ref device_id, .. } if device_id == "mic-1"));
        assert!(err.is_transient());
        assert_eq!(manager.backend_count(), 0);
        assert_eq!(manager.subscription_count(), 0);
    }
}

// ============================================================================
// Sharing
// ============================================================================

mod sharing {
    use super::*;

    #[tokio::test]
    async fn relay_devices_share_one_connection() {
        let port = get_test_port();
        start_mock_broker(port).await;
        let manager = manager_for(port);
        let context = StreamContext::new();

        let first = manager
            .subscribe(
                &context,
                [DeviceRef::relay("mic-1", "Mic 1"), DeviceRef::relay("mic-2", "Mic 2")],
                |_| {},
            )
            .await
            .unwrap();
        let second = manager
            .subscribe(&context, [DeviceRef::relay("mic-1", "Mic 1")], |_| {})
            .await
            .unwrap();

        assert_eq!(manager.backend_count(), 1);
        assert_eq!(manager.subscription_count(), 3);

        first.start().await.unwrap();
        second.start().await.unwrap();

        first.stop().await;
        assert_eq!(manager.backend_count(), 1);
        assert_eq!(manager.subscription_count(), 1);

        second.stop().await;
        assert_eq!(manager.backend_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let port = get_test_port();
        start_mock_broker(port).await;
        let manager = manager_for(port);

        let handle = manager
            .subscribe(&StreamContext::new(), [DeviceRef::relay("mic-1", "Mic")], |_| {})
            .await
            .unwrap();
        handle.start().await.unwrap();

        manager.shutdown().await;

        assert_eq!(manager.backend_count(), 0);
        assert_eq!(manager.subscription_count(), 0);
        assert!(matches!(handle.start().await, Err(Error::StreamStopped)));
    }
}
