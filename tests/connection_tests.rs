use std::sync::Arc;
use std::time::Duration;

use agv_bridge::config::ReconnectPolicy;
use agv_bridge::connection::{ConnectionSettings, MessageHandler};
use agv_bridge::{BridgeError, ConnectionManager, ConnectionStatus, InMemoryTransport, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{sleep, Instant};

const SUBSCRIPTIONS: [&str; 2] = ["bridge/actions", "meili/v2/Roboligent/+/connection"];

#[derive(Default)]
struct Recorder {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle_message(&self, topic: String, payload: Vec<u8>) {
        self.messages.lock().push((topic, payload));
    }
}

fn settings() -> ConnectionSettings {
    ConnectionSettings {
        connect_timeout: Duration::from_secs(2),
        reconnect_delay: Duration::from_secs(1),
        max_attempts: 3,
        publish_timeout: Duration::from_secs(1),
        health_check_interval: Duration::from_secs(5),
        ..ConnectionSettings::default()
    }
}

fn manager(transport: &InMemoryTransport, settings: ConnectionSettings) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(
        Arc::new(transport.clone()),
        settings,
        SUBSCRIPTIONS.iter().map(|s| s.to_string()).collect(),
    ))
}

async fn settle() {
    sleep(Duration::from_millis(20)).await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_then_succeeds() {
    let transport = InMemoryTransport::new();
    transport.fail_next_connects(2);
    let manager = manager(&transport, settings());

    let started = Instant::now();
    manager.connect().await.unwrap();

    assert_eq!(transport.connect_attempts(), 3);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(manager.status(), ConnectionStatus::Connected);
    assert_eq!(transport.subscriptions().len(), SUBSCRIPTIONS.len());
}

#[tokio::test(start_paused = true)]
async fn test_connect_gives_up_after_max_attempts() {
    let transport = InMemoryTransport::new();
    transport.fail_next_connects(10);
    let manager = manager(&transport, settings());

    let err = manager.connect().await.unwrap_err();

    assert!(matches!(err, BridgeError::ConnectFailed { attempts: 3, .. }));
    assert!(err.is_transport());
    assert_eq!(transport.connect_attempts(), 3);
    assert_eq!(manager.status(), ConnectionStatus::ConnectionFailed);
    assert!(transport.subscriptions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_connect_attempt_times_out() {
    let transport = InMemoryTransport::new();
    transport.set_connect_delay(Duration::from_secs(30));
    let manager = manager(
        &transport,
        ConnectionSettings {
            max_attempts: 1,
            ..settings()
        },
    );

    let started = Instant::now();
    let err = manager.connect().await.unwrap_err();

    match err {
        BridgeError::ConnectFailed { attempts, last_error } => {
            assert_eq!(attempts, 1);
            assert!(last_error.contains("timed out"), "{last_error}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_retry_wait() {
    let transport = InMemoryTransport::new();
    transport.fail_next_connects(10);
    let manager = manager(
        &transport,
        ConnectionSettings {
            reconnect_delay: Duration::from_secs(60),
            ..settings()
        },
    );

    let connecting = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.connect().await })
    };
    sleep(Duration::from_millis(100)).await;
    manager.stop().await;

    let result = connecting.await.unwrap();
    assert!(matches!(result, Err(BridgeError::Cancelled)));
    assert_eq!(transport.connect_attempts(), 1);
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_failed_subscription_is_not_fatal() {
    let transport = InMemoryTransport::new();
    transport.fail_subscription("bridge/actions");
    let manager = manager(&transport, settings());

    manager.connect().await.unwrap();

    assert!(manager.is_connected());
    let subscribed: Vec<String> = transport.subscriptions().into_iter().map(|(t, _)| t).collect();
    assert_eq!(subscribed, vec!["meili/v2/Roboligent/+/connection".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_publish_requires_connection() {
    let transport = InMemoryTransport::new();
    let manager = manager(&transport, settings());

    let err = manager.publish("t", b"{}".to_vec()).await.unwrap_err();

    assert!(matches!(err, BridgeError::NotConnected));
    assert!(transport.published().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_publish_timeout_and_transport_errors() {
    let transport = InMemoryTransport::new();
    let manager = manager(&transport, settings());
    manager.connect().await.unwrap();

    manager.publish("a/b", b"{}".to_vec()).await.unwrap();
    assert_eq!(transport.published_to("a/b").len(), 1);

    transport.set_publish_delay(Duration::from_secs(10));
    let err = manager.publish("a/b", b"{}".to_vec()).await.unwrap_err();
    assert!(matches!(err, BridgeError::PublishTimeout { .. }));

    transport.set_publish_delay(Duration::ZERO);
    transport.set_fail_publish(true);
    let err = manager.publish("a/b", b"{}".to_vec()).await.unwrap_err();
    assert!(matches!(err, BridgeError::Transport(_)));
    assert_eq!(transport.published_to("a/b").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_messages_reach_handler() {
    let transport = InMemoryTransport::new();
    let manager = manager(&transport, settings());
    let recorder = Arc::new(Recorder::default());
    manager.connect().await.unwrap();
    manager.start(recorder.clone()).unwrap();

    transport.inject("bridge/actions", "DEX0001:init");
    settle().await;

    let messages = recorder.messages.lock().clone();
    assert_eq!(messages, vec![("bridge/actions".to_string(), b"DEX0001:init".to_vec())]);
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_is_rejected() {
    let transport = InMemoryTransport::new();
    let manager = manager(&transport, settings());
    manager.start(Arc::new(Recorder::default())).unwrap();

    let err = manager.start(Arc::new(Recorder::default())).unwrap_err();
    assert!(matches!(err, BridgeError::AlreadyStarted));
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_and_restore_resubscribes() {
    let transport = InMemoryTransport::new();
    let manager = manager(&transport, settings());
    manager.connect().await.unwrap();
    manager.start(Arc::new(Recorder::default())).unwrap();

    transport.drop_connection("keepalive timeout");
    settle().await;
    assert_eq!(manager.status(), ConnectionStatus::ConnectionLost);
    assert_eq!(manager.reconnect_count(), 1);
    assert!(matches!(
        manager.publish("x", Vec::new()).await,
        Err(BridgeError::NotConnected)
    ));
    // The transport owns reconnection by default.
    assert_eq!(transport.connect_attempts(), 1);

    transport.restore_connection();
    settle().await;
    assert_eq!(manager.status(), ConnectionStatus::Connected);
    assert_eq!(transport.subscriptions().len(), 2 * SUBSCRIPTIONS.len());

    transport.drop_connection("again");
    settle().await;
    assert_eq!(manager.reconnect_count(), 2);
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_managed_reconnect_after_loss() {
    let transport = InMemoryTransport::new();
    let manager = manager(
        &transport,
        ConnectionSettings {
            reconnect_policy: ReconnectPolicy::Managed,
            ..settings()
        },
    );
    manager.connect().await.unwrap();
    manager.start(Arc::new(Recorder::default())).unwrap();

    transport.drop_connection("broker restarted");
    settle().await;

    assert_eq!(transport.connect_attempts(), 2);
    assert_eq!(manager.reconnect_count(), 1);
    assert_eq!(manager.status(), ConnectionStatus::Connected);
    assert_eq!(transport.subscriptions().len(), 2 * SUBSCRIPTIONS.len());
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_health_check_counts_consecutive_failures() {
    let transport = InMemoryTransport::new();
    let manager = manager(&transport, settings());
    manager.connect().await.unwrap();
    assert!(manager.check_health());

    // Event loop not running, so only the transport notices the drop.
    transport.drop_connection("silent");
    for expected in 1..=4 {
        assert!(!manager.check_health());
        assert_eq!(manager.consecutive_health_failures(), expected);
    }

    transport.restore_connection();
    assert!(manager.check_health());
    assert_eq!(manager.consecutive_health_failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_health_check_rearms_managed_reconnect() {
    let transport = InMemoryTransport::new();
    transport.fail_next_connects(1);
    let manager = manager(
        &transport,
        ConnectionSettings {
            max_attempts: 1,
            reconnect_policy: ReconnectPolicy::Managed,
            ..settings()
        },
    );
    assert!(manager.connect().await.is_err());
    assert_eq!(manager.status(), ConnectionStatus::ConnectionFailed);

    assert!(!manager.check_health());
    settle().await;

    assert_eq!(manager.status(), ConnectionStatus::Connected);
    assert_eq!(transport.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent_and_ends_loops() {
    let transport = InMemoryTransport::new();
    let manager = manager(&transport, settings());
    let recorder = Arc::new(Recorder::default());
    manager.connect().await.unwrap();
    manager.start(recorder.clone()).unwrap();

    manager.stop().await;
    manager.stop().await;

    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert!(!transport.is_connected());

    transport.inject("bridge/actions", "late");
    settle().await;
    assert!(recorder.messages.lock().is_empty());
}


#[tokio::test]
async fn test_stop_right_after_start_returns() {
    let transport = InMemoryTransport::new();
    let manager = manager(&transport, settings());
    manager.connect().await.unwrap();
    manager.start(Arc::new(Recorder::default())).unwrap();

    let stopped = tokio::time::timeout(Duration::from_secs(3), manager.stop()).await;

    assert!(stopped.is_ok(), "stop did not return");
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_finished_reconnect_tasks_are_pruned() {
    let transport = InMemoryTransport::new();
    let manager = manager(
        &transport,
        ConnectionSettings {
            reconnect_policy: ReconnectPolicy::Managed,
            ..settings()
        },
    );
    manager.connect().await.unwrap();
    manager.start(Arc::new(Recorder::default())).unwrap();

    for _ in 0..5 {
        transport.drop_connection("flapping");
        settle().await;
        assert_eq!(manager.status(), ConnectionStatus::Connected);
    }

    assert_eq!(transport.connect_attempts(), 6);
    // Event loop, health loop and the most recent reconnect.
    assert_eq!(manager.tracked_tasks(), 3);
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_slow_connect_disconnects() {
    let transport = InMemoryTransport::new();
    transport.set_connect_delay(Duration::from_secs(1));
    let manager = manager(
        &transport,
        ConnectionSettings {
            connect_timeout: Duration::from_secs(5),
            ..settings()
        },
    );

    let connecting = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.connect().await })
    };
    sleep(Duration::from_millis(100)).await;
    manager.stop().await;

    let result = connecting.await.unwrap();
    assert!(matches!(result, Err(BridgeError::Cancelled)));
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert!(!transport.is_connected());
    assert!(transport.subscriptions().is_empty());
}
