//! Integration tests for multi-session arbitration
//!
//! Drives a `SessionManager` with a manual mock accelerometer and checks the
//! effective configuration, the device reconfigurations it causes, and the
//! `propertyChanged` notifications delivered to each session.

use sensord::error::{ErrorCode, SensorError};
use sensord::hardware::MockSensor;
use sensord::network::SessionManager;
use sensord::sensor::catalog::DataRange;
use sensord::sensor::session::{Property, PropertyChanged, SessionId, SessionState};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};

async fn setup() -> (SessionManager, Arc<MockSensor>) {
    let manager = SessionManager::new(16, 32);
    let mock = Arc::new(MockSensor::accelerometer().manual());
    manager
        .register_sensor("accel", None, mock.clone())
        .await
        .unwrap();
    (manager, mock)
}

async fn open(manager: &SessionManager, client: &str) -> (SessionId, UnboundedReceiver<PropertyChanged>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (id, _buffer) = manager.open("accel", client, Some(tx)).await.unwrap();
    (id, rx)
}

fn drain(rx: &mut UnboundedReceiver<PropertyChanged>) -> Vec<Property> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event.property);
    }
    seen
}

#[tokio::test]
async fn test_interval_is_minimum_of_running_sessions() {
    let (manager, _mock) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let (a, _rx_a) = open(&manager, "alice").await;
    let (b, _rx_b) = open(&manager, "bob").await;

    channel.set_interval(a, 200).await.unwrap();
    channel.set_interval(b, 50).await.unwrap();
    assert_eq!(channel.effective().await.interval, None);

    channel.start(a).await.unwrap();
    assert_eq!(channel.effective().await.interval, Some(200));

    channel.start(b).await.unwrap();
    assert_eq!(channel.effective().await.interval, Some(50));

    // Stopping the session holding the minimum hands the device back.
    channel.stop(b).await.unwrap();
    assert_eq!(channel.effective().await.interval, Some(200));

    channel.stop(a).await.unwrap();
    assert_eq!(channel.effective().await.interval, None);
}

#[tokio::test]
async fn test_release_of_minimum_holder_rearbitrates() {
    let (manager, mock) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let (a, mut rx_a) = open(&manager, "alice").await;
    let (b, _rx_b) = open(&manager, "bob").await;

    channel.start(a).await.unwrap();
    channel.set_interval(b, 20).await.unwrap();
    channel.start(b).await.unwrap();
    assert_eq!(channel.effective().await.interval, Some(20));
    drain(&mut rx_a);

    manager.release(b).await.unwrap();
    assert_eq!(channel.effective().await.interval, Some(100));
    assert_eq!(drain(&mut rx_a), vec![Property::Interval]);
    assert_eq!(
        mock.last_configuration().await.and_then(|c| c.interval),
        Some(100)
    );
}

#[tokio::test]
async fn test_interval_snapping_and_clearing() {
    let (manager, _mock) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let (a, _rx) = open(&manager, "alice").await;

    // Equidistant from the 10 and 20 ms entries: the earlier one wins.
    channel.set_interval(a, 15).await.unwrap();
    assert_eq!(channel.interval(a).await.unwrap(), Some(10));

    channel.set_interval(a, 57).await.unwrap();
    assert_eq!(channel.interval(a).await.unwrap(), Some(60));

    let err = channel.set_interval(a, 5000).await.unwrap_err();
    assert!(matches!(err, SensorError::InvalidParameter(_)));
    assert_eq!(channel.interval(a).await.unwrap(), Some(60));
    assert_eq!(channel.error(a).await.unwrap().code, ErrorCode::InvalidParameter);

    channel.set_interval(a, 0).await.unwrap();
    assert_eq!(channel.interval(a).await.unwrap(), None);
    assert_eq!(channel.error(a).await.unwrap().code, ErrorCode::None);
}

#[tokio::test]
async fn test_notify_before_return() {
    let (manager, _mock) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let (a, mut rx_a) = open(&manager, "alice").await;
    let (b, mut rx_b) = open(&manager, "bob").await;

    channel.start(a).await.unwrap();
    assert_eq!(drain(&mut rx_a), vec![Property::Interval]);

    channel.set_interval(b, 50).await.unwrap();
    channel.start(b).await.unwrap();

    // Both notifications are queued by the time start() has returned.
    assert_eq!(
        rx_a.try_recv().unwrap(),
        PropertyChanged {
            session_id: a,
            property: Property::Interval
        }
    );
    assert_eq!(
        rx_b.try_recv().unwrap(),
        PropertyChanged {
            session_id: b,
            property: Property::Interval
        }
    );
}

#[tokio::test]
async fn test_no_spurious_reconfiguration_or_broadcast() {
    let (manager, mock) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let (a, mut rx_a) = open(&manager, "alice").await;
    let (b, mut rx_b) = open(&manager, "bob").await;

    assert_eq!(mock.configure_count(), 0);

    channel.start(a).await.unwrap();
    assert_eq!(mock.configure_count(), 1);
    assert_eq!(drain(&mut rx_a), vec![Property::Interval]);

    // Asking for what the device already does changes nothing.
    channel.set_interval(a, 100).await.unwrap();
    assert_eq!(mock.configure_count(), 1);
    assert!(drain(&mut rx_a).is_empty());

    // Requests of a session that is not Running do not count.
    channel.set_interval(b, 50).await.unwrap();
    channel.set_standby_override(b, true).await.unwrap();
    assert_eq!(mock.configure_count(), 1);
    assert!(drain(&mut rx_a).is_empty());
    assert!(drain(&mut rx_b).is_empty());

    channel.start(b).await.unwrap();
    assert_eq!(mock.configure_count(), 2);
    let expected = vec![Property::Interval, Property::StandbyOverride];
    assert_eq!(drain(&mut rx_a), expected);
    assert_eq!(drain(&mut rx_b), expected);

    // A stopped session is no longer notified.
    channel.stop(b).await.unwrap();
    assert_eq!(mock.configure_count(), 3);
    assert_eq!(drain(&mut rx_a), expected);
    assert!(drain(&mut rx_b).is_empty());

    let history = mock.history().await;
    let intervals: Vec<_> = history.iter().map(|c| c.interval).collect();
    assert_eq!(intervals, vec![Some(100), Some(50), Some(100)]);
}

#[tokio::test]
async fn test_standby_override_is_logical_or() {
    let (manager, _mock) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let (a, _rx_a) = open(&manager, "alice").await;
    let (b, _rx_b) = open(&manager, "bob").await;

    assert!(channel.set_standby_override(a, true).await.unwrap());
    channel.start(a).await.unwrap();
    channel.start(b).await.unwrap();
    assert!(channel.effective().await.standby_override);

    channel.stop(a).await.unwrap();
    assert!(!channel.effective().await.standby_override);
    assert!(channel.standby_override(a).await.unwrap());
}

#[tokio::test]
async fn test_data_range_stack_three_deep() {
    let (manager, _mock) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let ranges = channel.available_data_ranges();
    let (a, _rx) = open(&manager, "alice").await;
    channel.start(a).await.unwrap();

    assert_eq!(channel.current_data_range(a).await.unwrap(), ranges[0]);

    channel.set_data_range_index(a, 1).await.unwrap();
    channel.set_data_range_index(a, 2).await.unwrap();
    channel.set_data_range_index(a, 0).await.unwrap();
    assert_eq!(channel.current_data_range(a).await.unwrap(), ranges[0]);

    channel.remove_data_range_request(a).await.unwrap();
    assert_eq!(channel.current_data_range(a).await.unwrap(), ranges[2]);

    channel.remove_data_range_request(a).await.unwrap();
    assert_eq!(channel.current_data_range(a).await.unwrap(), ranges[1]);

    channel.remove_data_range_request(a).await.unwrap();
    assert_eq!(channel.current_data_range(a).await.unwrap(), ranges[0]);

    // Popping an empty stack is a no-op.
    channel.remove_data_range_request(a).await.unwrap();
    assert_eq!(channel.current_data_range(a).await.unwrap(), ranges[0]);
}

#[tokio::test]
async fn test_data_range_most_recent_request_wins() {
    let (manager, _mock) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let ranges = channel.available_data_ranges();
    let (a, mut rx_a) = open(&manager, "alice").await;
    let (b, _rx_b) = open(&manager, "bob").await;
    channel.start(a).await.unwrap();
    channel.start(b).await.unwrap();
    drain(&mut rx_a);

    channel.set_data_range_index(a, 1).await.unwrap();
    channel.set_data_range_index(b, 2).await.unwrap();
    assert_eq!(channel.effective().await.data_range, ranges[2]);
    assert_eq!(
        drain(&mut rx_a),
        vec![Property::DataRange, Property::DataRange]
    );

    // Alice's stack empties without touching Bob's newer request.
    channel.remove_data_range_request(a).await.unwrap();
    assert_eq!(channel.effective().await.data_range, ranges[2]);
    assert!(drain(&mut rx_a).is_empty());

    channel.remove_data_range_request(b).await.unwrap();
    assert_eq!(channel.effective().await.data_range_index, 0);
    assert_eq!(drain(&mut rx_a), vec![Property::DataRange]);
}

#[tokio::test]
async fn test_set_data_range_index_round_trips() {
    let (manager, _mock) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let ranges = channel.available_data_ranges();
    let (a, _rx) = open(&manager, "alice").await;

    for (index, range) in ranges.iter().enumerate() {
        channel.set_data_range_index(a, index).await.unwrap();
        assert_eq!(channel.current_data_range(a).await.unwrap(), *range);
    }

    let err = channel
        .set_data_range_index(a, ranges.len())
        .await
        .unwrap_err();
    assert!(matches!(err, SensorError::InvalidParameter(_)));
}

#[tokio::test]
async fn test_request_data_range_maps_onto_catalog() {
    let (manager, _mock) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let ranges = channel.available_data_ranges();
    let (a, _rx) = open(&manager, "alice").await;

    channel
        .request_data_range(a, DataRange::new(-3000.0, 3000.0, 0.0))
        .await
        .unwrap();
    assert_eq!(channel.current_data_range(a).await.unwrap(), ranges[1]);

    let err = channel
        .request_data_range(a, DataRange::new(-10000.0, 10000.0, 0.0))
        .await
        .unwrap_err();
    assert!(matches!(err, SensorError::InvalidParameter(_)));
    assert_eq!(channel.current_data_range(a).await.unwrap(), ranges[1]);
}

#[tokio::test]
async fn test_failed_reconfiguration_rolls_back() {
    let (manager, mock) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let (a, mut rx_a) = open(&manager, "alice").await;

    mock.fail_next_configure();
    let err = channel.start(a).await.unwrap_err();
    assert!(matches!(err, SensorError::ChannelClosed(_)));
    assert_eq!(channel.state_of(a).await.unwrap(), SessionState::Created);
    assert_eq!(channel.effective().await.interval, None);
    assert_eq!(channel.error(a).await.unwrap().code, ErrorCode::ChannelClosed);
    assert!(drain(&mut rx_a).is_empty());

    channel.start(a).await.unwrap();
    assert_eq!(channel.state_of(a).await.unwrap(), SessionState::Running);
    assert_eq!(channel.error(a).await.unwrap().code, ErrorCode::None);
}

#[tokio::test]
async fn test_lifecycle_edges() {
    let (manager, mock) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let (a, _rx) = open(&manager, "alice").await;

    // stop() before start() leaves the session Created.
    channel.stop(a).await.unwrap();
    assert_eq!(channel.state_of(a).await.unwrap(), SessionState::Created);

    channel.start(a).await.unwrap();
    channel.start(a).await.unwrap();
    assert_eq!(channel.running_count().await, 1);

    channel.stop(a).await.unwrap();
    assert_eq!(channel.state_of(a).await.unwrap(), SessionState::Stopped);

    let (b, _rx_b) = open(&manager, "bob").await;
    channel.set_interval(b, 50).await.unwrap();
    channel.start(b).await.unwrap();
    channel.start(a).await.unwrap();
    assert_eq!(channel.effective().await.interval, Some(50));

    manager.release(a).await.unwrap();
    let effective = channel.effective().await;
    let reconfigurations = mock.configure_count();

    // A second release fails and leaves the sensor exactly as it was.
    assert!(matches!(
        manager.release(a).await,
        Err(SensorError::InvalidSession(id)) if id == a
    ));
    assert_eq!(channel.effective().await, effective);
    assert_eq!(mock.configure_count(), reconfigurations);
    assert_eq!(channel.running_count().await, 1);
    assert!(matches!(
        channel.set_interval(a, 50).await,
        Err(SensorError::InvalidSession(_))
    ));
}

#[tokio::test]
async fn test_device_loss_blocks_start() {
    let (manager, _mock) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let (a, _rx_a) = open(&manager, "alice").await;
    let (b, _rx_b) = open(&manager, "bob").await;
    channel.start(a).await.unwrap();

    manager.device_lost("accel").await.unwrap();
    assert_eq!(channel.error(a).await.unwrap().code, ErrorCode::ChannelClosed);
    assert!(matches!(
        channel.start(b).await,
        Err(SensorError::ChannelClosed(_))
    ));

    manager.device_restored("accel").await.unwrap();
    channel.start(b).await.unwrap();
    assert_eq!(channel.running_count().await, 2);
}

#[tokio::test]
async fn test_accel_scenario_without_spurious_broadcast() {
    let (manager, mock) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let (a, mut rx_a) = open(&manager, "alice").await;
    let (b, mut rx_b) = open(&manager, "bob").await;

    channel.set_interval(a, 100).await.unwrap();
    channel.start(a).await.unwrap();
    assert_eq!(channel.effective().await.interval, Some(100));
    drain(&mut rx_a);

    channel.set_interval(b, 50).await.unwrap();
    channel.start(b).await.unwrap();
    assert_eq!(channel.effective().await.interval, Some(50));
    assert_eq!(drain(&mut rx_a), vec![Property::Interval]);
    assert_eq!(drain(&mut rx_b), vec![Property::Interval]);
    let configured = mock.configure_count();

    // B alone still implies 50 ms: nothing to reconfigure or announce.
    channel.stop(a).await.unwrap();
    assert_eq!(channel.effective().await.interval, Some(50));
    assert_eq!(mock.configure_count(), configured);
    assert!(drain(&mut rx_a).is_empty());
    assert!(drain(&mut rx_b).is_empty());
}
