//! Wireless link scenarios
//!
//! Exercises the link manager against the scripted radio: failure
//! classification, the reconnect gate and its backoff growth, and recovery
//! after the breaker has opened.

use edgelink::config::WifiConfig;
use edgelink::error::{ErrorKind, WirelessError};
use edgelink::resilience::{BackoffConfig, CircuitBreakerConfig, CircuitState, ReconnectDecision};
use edgelink::testing::{CountingWatchdog, FixedTimeSource, ManualClock, MockRadio, RecordingErrorSink};
use edgelink::wireless::{LinkStatus, WirelessConnectionManager, WirelessManagerOptions};
use edgelink::NodeContext;
use std::sync::Arc;
use std::time::Duration;

struct Node {
    manager: WirelessConnectionManager<MockRadio>,
    clock: ManualClock,
    errors: Arc<RecordingErrorSink>,
    ctx: NodeContext,
}

fn node(radio: MockRadio, threshold: u32) -> Node {
    let clock = ManualClock::new();
    let errors = Arc::new(RecordingErrorSink::new());
    let ctx = NodeContext::system()
        .with_clock(Arc::new(clock.clone()))
        .with_error_sink(errors.clone())
        .with_watchdog(Arc::new(CountingWatchdog::new()))
        .with_time_source(Arc::new(FixedTimeSource::new(1_700_000_000)));
    let options = WirelessManagerOptions {
        connect_timeout: Duration::from_millis(20),
        poll_interval: Duration::from_millis(5),
        breaker: CircuitBreakerConfig::new(threshold, Duration::from_secs(60), Duration::from_secs(10)),
        backoff: BackoffConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        },
    };

    Node {
        manager: WirelessConnectionManager::new(radio, options, ctx.clone()),
        clock,
        errors,
        ctx,
    }
}

#[tokio::test]
async fn test_wrong_passphrase_is_classified_and_reported() {
    // Arrange
    let mut node = node(MockRadio::new().failing_with(LinkStatus::AuthRejected), 10);

    // Act
    let err = node
        .manager
        .connect(WifiConfig::new("orchard", "wrong"))
        .await
        .unwrap_err();

    // Assert
    assert!(matches!(err, WirelessError::AuthenticationRejected { ref ssid } if ssid == "orchard"));
    assert_eq!(node.errors.count(ErrorKind::AuthenticationRejected), 1);
    assert!(!node.manager.is_connected());
    assert_eq!(node.manager.signal_strength(), None);
}

#[tokio::test]
async fn test_reconnect_interval_doubles_until_capped() {
    // Arrange
    let mut node = node(MockRadio::new().failing_with(LinkStatus::NetworkNotFound), 100);
    let _ = node.manager.connect(WifiConfig::new("orchard", "pw")).await;

    // Act / Assert: each failed attempt doubles the wait, capped at 8s
    let mut observed = Vec::new();
    for _ in 0..5 {
        let delay = node.manager.backoff().current_delay();
        observed.push(delay);

        node.clock.advance_ms(delay.as_millis() as u64 - 1);
        assert!(matches!(
            node.manager.reconnect().await.unwrap(),
            ReconnectDecision::BackoffPending { .. }
        ));

        node.clock.advance_ms(1);
        assert!(node.manager.reconnect().await.is_err());
    }

    let secs: Vec<u64> = observed.iter().map(|d| d.as_secs()).collect();
    assert_eq!(secs, vec![1, 2, 4, 8, 8]);
    assert_eq!(node.manager.backoff().attempts(), 5);
}

#[tokio::test]
async fn test_open_breaker_blocks_until_probe_then_recovers() {
    // Arrange: threshold 2 trips after the initial connect plus one retry
    let mut node = node(MockRadio::new().failing_with(LinkStatus::ConnectFailed), 2);
    let _ = node.manager.connect(WifiConfig::new("orchard", "pw")).await;
    node.clock.advance_ms(1_000);
    let _ = node.manager.reconnect().await;
    assert_eq!(node.manager.breaker().state(), CircuitState::Open);

    // Act: ticks inside the recovery window never touch the radio
    let begins = node.manager.radio().begin_calls();
    node.clock.advance_ms(30_000);
    assert!(!node.manager.tick().await);
    assert_eq!(node.manager.radio().begin_calls(), begins);

    node.manager.radio_mut().set_failure(None);
    node.clock.advance_ms(30_000);
    let up = node.manager.tick().await;

    // Assert
    assert!(up);
    assert_eq!(node.manager.breaker().state(), CircuitState::Closed);
    assert_eq!(node.manager.backoff().current_delay(), Duration::from_secs(1));
    assert_eq!(node.ctx.metrics.snapshot().circuit_trips, 1);
}

#[tokio::test]
async fn test_link_loss_is_counted_and_recovered() {
    // Arrange
    let mut node = node(MockRadio::new().with_rssi(-48), 10);
    node.manager.connect(WifiConfig::new("orchard", "pw")).await.unwrap();
    assert!(node.manager.tick().await);
    assert_eq!(node.manager.signal_strength(), Some(-48));

    // Act
    node.manager.radio_mut().drop_link();
    node.clock.advance_ms(1_000);
    let up = node.manager.tick().await;

    // Assert
    assert!(up);
    let metrics = node.ctx.metrics.snapshot();
    assert_eq!(metrics.link.losses, 1);
    assert_eq!(metrics.link.connect_attempts, 2);
    assert_eq!(node.errors.count(ErrorKind::UnexpectedDisconnect), 1);
}
