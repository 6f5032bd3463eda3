//! End-to-end behaviour of the provider manager
//!
//! Lifecycle events, transparent retries, priority scheduling, queue
//! expiry, health-driven reconnects and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use broker_core::{
    BrokerConfig, BrokerError, BrokerEvent, BrokerMetrics, CompletionRequest, ConnectionState,
    ErrorCode, ExecutionConfig, HealthConfig, NoopMetrics, Priority, ProviderConfig,
    ProviderManager, QueueConfig, RetryConfig, StreamingToken,
};
use common::{drain_names, pool_config, wait_for, TestFactory};

fn quiet_config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.maintenance_interval_ms = 600_000;
    config.retry = RetryConfig {
        max_retries: 3,
        base_delay_ms: 10,
        max_delay_ms: 100,
        jitter_factor: 0.0,
    };
    config
}

/// Dispatch one scheduled request at a time
fn serial_config() -> BrokerConfig {
    let mut config = quiet_config();
    config.execution = ExecutionConfig {
        max_concurrent: 1,
        task_timeout_ms: 0,
    };
    config
}

async fn manager_with(
    factory: &TestFactory,
    config: BrokerConfig,
    min_size: usize,
    max_size: usize,
) -> Arc<ProviderManager> {
    let manager = ProviderManager::new(config, Arc::new(factory.clone()), Arc::new(NoopMetrics));
    manager
        .initialize_provider("p1", "test", ProviderConfig::default(), pool_config(min_size, max_size))
        .await
        .unwrap();
    manager
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_initialize_emits_lifecycle_events() {
    let factory = TestFactory::new();
    let manager = ProviderManager::new(quiet_config(), Arc::new(factory.clone()), Arc::new(NoopMetrics));
    let mut rx = manager.subscribe();

    let connections = manager
        .initialize_provider("p1", "test", ProviderConfig::default(), pool_config(2, 3))
        .await
        .unwrap();
    assert_eq!(connections, 2);

    let names: Vec<_> = drain_names(&mut rx)
        .into_iter()
        .filter(|name| *name != "stateEntered")
        .collect();
    assert_eq!(
        names,
        vec![
            "stateChanged",
            "connectionAdded",
            "connectionAdded",
            "stateChanged",
            "providerInitialized",
        ]
    );
    assert_eq!(manager.provider_state("p1"), Some(ConnectionState::Connected));
    manager.dispose().await;
}

#[tokio::test]
async fn test_refused_backend_leaves_provider_in_error() {
    let factory = TestFactory::new();
    factory.backend.refuse_connect.store(true, std::sync::atomic::Ordering::SeqCst);
    let manager = ProviderManager::new(quiet_config(), Arc::new(factory.clone()), Arc::new(NoopMetrics));

    let err = manager
        .initialize_provider("p1", "test", ProviderConfig::default(), pool_config(1, 2))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONNECTION_FAILED");
    assert_eq!(manager.provider_state("p1"), Some(ConnectionState::Error));
    assert!(manager.pool_stats("p1").is_none());

    let snapshot = manager.state_snapshot("p1").unwrap();
    assert_eq!(snapshot.last_error.unwrap().code, ErrorCode::NetworkError);
    manager.dispose().await;
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_transparently() {
    let factory = TestFactory::new();
    let metrics = Arc::new(BrokerMetrics::new());
    let manager = ProviderManager::new(quiet_config(), Arc::new(factory.clone()), metrics.clone());
    manager
        .initialize_provider("p1", "test", ProviderConfig::default(), pool_config(1, 1))
        .await
        .unwrap();

    factory.backend.fail_next(ErrorCode::RateLimited, 2);
    let response = manager
        .generate_completion("p1", &CompletionRequest::new("retry me"))
        .await
        .unwrap();

    assert_eq!(response.content, "RETRY ME");
    assert_eq!(factory.backend.calls(), 3);
    assert_eq!(manager.pool_stats("p1").unwrap().in_use, 0);

    let summary = metrics.summary("p1").unwrap();
    assert_eq!(summary.total_requests, 3);
    assert_eq!(summary.successful_requests, 1);
    assert_eq!(summary.failed_requests, 2);
    manager.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_authentication_failure_is_not_retried() {
    let factory = TestFactory::new();
    let manager = manager_with(&factory, quiet_config(), 1, 1).await;

    factory.backend.fail_next(ErrorCode::AuthenticationFailed, 1);
    let err = manager
        .generate_completion("p1", &CompletionRequest::new("nope"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "AUTHENTICATION_FAILED");
    assert_eq!(factory.backend.calls(), 1);
    manager.dispose().await;
}

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_scheduled_requests_follow_priority() {
    let factory = TestFactory::new();
    let config = serial_config();
    let manager = manager_with(&factory, config, 1, 1).await;
    // Let the dispatcher park on the empty queue
    tokio::time::sleep(Duration::from_millis(10)).await;

    let scheduled = vec![
        manager.schedule("p1", CompletionRequest::new("low"), Priority::Low).unwrap(),
        manager.schedule("p1", CompletionRequest::new("high-1"), Priority::High).unwrap(),
        manager.schedule("p1", CompletionRequest::new("normal"), Priority::Normal).unwrap(),
        manager.schedule("p1", CompletionRequest::new("high-2"), Priority::High).unwrap(),
    ];
    for request in scheduled {
        request.response().await.unwrap();
    }

    assert_eq!(factory.backend.prompts(), vec!["high-1", "high-2", "normal", "low"]);
    assert_eq!(manager.queue_stats().total, 0);
    assert_eq!(manager.queue_stats().active, 0);
    manager.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_queued_request_times_out() {
    let factory = TestFactory::new();
    let mut config = serial_config();
    config.queue = QueueConfig {
        queue_timeout_ms: 500,
        ..QueueConfig::default()
    };
    let manager = manager_with(&factory, config, 1, 1).await;
    let mut rx = manager.subscribe();

    // Hold the only connection so the first request blocks in acquire
    let held = manager.acquire("p1").await.unwrap();
    let first = manager.schedule("p1", CompletionRequest::new("first"), Priority::Normal).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = manager.schedule("p1", CompletionRequest::new("second"), Priority::Normal).unwrap();
    let second_id = second.id();

    let err = second.response().await.unwrap_err();
    assert!(matches!(err, BrokerError::QueueTimeout { .. }));
    assert_eq!(err.code(), "QUEUE_TIMEOUT");
    let event = wait_for(&mut rx, Duration::from_secs(1), |e| {
        matches!(e, BrokerEvent::QueueTimeout { .. })
    })
    .await;
    assert!(
        matches!(event, Some(BrokerEvent::QueueTimeout { request_id, .. }) if request_id == second_id)
    );

    manager.release(held).await;
    assert_eq!(first.response().await.unwrap().content, "FIRST");
    assert_eq!(factory.backend.prompts(), vec!["first"]);
    manager.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_queued_request() {
    let factory = TestFactory::new();
    let config = serial_config();
    let manager = manager_with(&factory, config, 1, 1).await;

    let held = manager.acquire("p1").await.unwrap();
    let first = manager.schedule("p1", CompletionRequest::new("first"), Priority::Normal).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = manager.schedule("p1", CompletionRequest::new("second"), Priority::Low).unwrap();

    assert!(manager.cancel(second.id()));
    assert!(!manager.cancel(second.id()));
    assert_eq!(second.response().await.unwrap_err().code(), "CANCELLED");

    manager.release(held).await;
    first.response().await.unwrap();
    assert_eq!(factory.backend.prompts(), vec!["first"]);
    manager.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_running_request_frees_connection() {
    let factory = TestFactory::new();
    let manager = manager_with(&factory, serial_config(), 1, 1).await;

    factory.backend.set_latency(Duration::from_secs(5));
    let running = manager.schedule("p1", CompletionRequest::new("slow"), Priority::Normal).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.pool_stats("p1").unwrap().in_use, 1);

    assert!(manager.cancel(running.id()));
    assert_eq!(running.response().await.unwrap_err().code(), "CANCELLED");

    factory.backend.set_latency(Duration::ZERO);
    let response = manager
        .generate_completion("p1", &CompletionRequest::new("next"))
        .await
        .unwrap();
    assert_eq!(response.content, "NEXT");
    assert_eq!(manager.pool_stats("p1").unwrap().in_use, 0);
    manager.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_release_frees_connection() {
    let factory = TestFactory::new();
    let manager = manager_with(&factory, serial_config(), 1, 1).await;

    // The call itself is instant; the post-call health check is not
    factory.backend.set_health_delay(Duration::from_secs(5));
    let running = manager.schedule("p1", CompletionRequest::new("quick"), Priority::Normal).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(factory.backend.prompts(), vec!["quick"]);
    assert_eq!(manager.pool_stats("p1").unwrap().in_use, 1);

    assert!(manager.cancel(running.id()));
    assert_eq!(running.response().await.unwrap_err().code(), "CANCELLED");

    factory.backend.set_health_delay(Duration::ZERO);
    let lease = manager.acquire("p1").await.unwrap();
    let stats = manager.pool_stats("p1").unwrap();
    assert_eq!((stats.size, stats.in_use), (1, 1));
    manager.release(lease).await;
    assert_eq!(manager.pool_stats("p1").unwrap().idle, 1);
    manager.dispose().await;
}

#[tokio::test]
async fn test_schedule_requires_connected_provider() {
    let factory = TestFactory::new();
    let manager = ProviderManager::new(quiet_config(), Arc::new(factory), Arc::new(NoopMetrics));

    let err = manager
        .schedule("missing", CompletionRequest::new("hi"), Priority::High)
        .unwrap_err();
    assert_eq!(err.code(), "PROVIDER_NOT_ACTIVE");
    manager.dispose().await;
}

// =============================================================================
// Streaming
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_stream_holds_connection_until_finished() {
    let factory = TestFactory::new();
    factory.backend.set_stream_gap(Duration::from_millis(200));
    let manager = manager_with(&factory, quiet_config(), 1, 1).await;

    let mut stream = manager
        .stream_completion("p1", &CompletionRequest::new("one"))
        .await
        .unwrap();
    assert_eq!(manager.pool_stats("p1").unwrap().in_use, 1);

    // The only connection is busy streaming
    let blocked = tokio::time::timeout(
        Duration::from_millis(50),
        manager.stream_completion("p1", &CompletionRequest::new("two")),
    )
    .await;
    assert!(blocked.is_err());

    let mut tokens = Vec::new();
    while let Some(token) = stream.recv().await {
        tokens.push(token);
    }
    assert_eq!(tokens.len(), 2);
    assert!(matches!(tokens.last(), Some(StreamingToken::Complete { message }) if message == "one"));
    assert_eq!(manager.pool_stats("p1").unwrap().in_use, 0);
    manager.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_dropped_stream_releases_connection() {
    let factory = TestFactory::new();
    factory.backend.set_stream_gap(Duration::from_secs(30));
    let manager = manager_with(&factory, quiet_config(), 1, 1).await;

    let mut stream = manager
        .stream_completion("p1", &CompletionRequest::new("abandoned"))
        .await
        .unwrap();
    assert!(matches!(stream.recv().await, Some(StreamingToken::Token(_))));
    drop(stream);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let stats = manager.pool_stats("p1").unwrap();
    assert_eq!((stats.in_use, stats.idle), (0, 1));
    manager.dispose().await;
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_critical_health_triggers_reconnect() {
    let factory = TestFactory::new();
    let mut config = quiet_config();
    config.health = HealthConfig {
        check_interval_ms: 1_000,
        warning_threshold: 2,
        probe_timeout_ms: 500,
        auto_reconnect: true,
    };
    let manager = manager_with(&factory, config, 1, 2).await;
    let mut rx = manager.subscribe();
    manager.start_health_monitor();

    factory.backend.set_healthy(false);
    let critical = wait_for(&mut rx, Duration::from_secs(10), |e| {
        matches!(e, BrokerEvent::HealthCritical { .. })
    })
    .await;
    assert!(matches!(
        critical,
        Some(BrokerEvent::HealthCritical { warning_count: 2, .. })
    ));

    let reconnecting = wait_for(&mut rx, Duration::from_secs(5), |e| {
        matches!(
            e,
            BrokerEvent::StateChanged {
                current: ConnectionState::Reconnecting,
                ..
            }
        )
    })
    .await;
    assert!(reconnecting.is_some());

    // The backend is still down, so the rebuild fails
    let failed = wait_for(&mut rx, Duration::from_secs(5), |e| {
        matches!(
            e,
            BrokerEvent::StateChanged {
                previous: ConnectionState::Reconnecting,
                current: ConnectionState::Error,
                ..
            }
        )
    })
    .await;
    assert!(failed.is_some());
    assert_eq!(manager.provider_state("p1"), Some(ConnectionState::Error));

    let health = manager.provider_health("p1").unwrap();
    assert!(!health.record.is_healthy);
    manager.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_manual_recovery_after_backend_returns() {
    let factory = TestFactory::new();
    let manager = manager_with(&factory, quiet_config(), 2, 2).await;

    factory.backend.set_healthy(false);
    assert!(manager.recover_provider("p1").await.is_err());
    assert_eq!(manager.provider_state("p1"), Some(ConnectionState::Error));

    factory.backend.set_healthy(true);
    // A provider in error is brought back by removing and re-initializing it
    assert!(manager.remove_provider("p1").await);
    let connections = manager
        .initialize_provider("p1", "test", ProviderConfig::default(), pool_config(2, 2))
        .await
        .unwrap();
    assert_eq!(connections, 2);
    assert_eq!(manager.provider_state("p1"), Some(ConnectionState::Connected));
    manager.dispose().await;
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_dispose_fails_pending_work() {
    let factory = TestFactory::new();
    let config = serial_config();
    let manager = manager_with(&factory, config, 1, 1).await;

    let held = manager.acquire("p1").await.unwrap();
    let running = manager.schedule("p1", CompletionRequest::new("running"), Priority::Normal).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let queued = manager.schedule("p1", CompletionRequest::new("queued"), Priority::Normal).unwrap();

    manager.dispose().await;
    drop(held);

    assert_eq!(queued.response().await.unwrap_err().code(), "CANCELLED");
    assert!(running.response().await.is_err());
    assert_eq!(manager.provider_state("p1"), Some(ConnectionState::Disconnected));

    let err = manager
        .initialize_provider("p2", "test", ProviderConfig::default(), pool_config(1, 1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_INITIALIZED");
    assert!(factory.backend.prompts().is_empty());
}
