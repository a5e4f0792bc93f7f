//! Integration tests for the sample path
//!
//! Samples are injected through the mock's `SampleSink` and read back from
//! the session buffers the manager hands out, checking fan-out, overflow
//! accounting and downsampling.

use sensord::error::ErrorCode;
use sensord::hardware::{MockSensor, SampleSink};
use sensord::network::SessionManager;
use sensord::sensor::frame::{Frame, XyzSample};
use std::sync::Arc;

fn sample(n: i32) -> XyzSample {
    XyzSample {
        timestamp_us: 1_000 * n as u64,
        x: n,
        y: -n,
        z: 1000,
    }
}

async fn setup() -> (SessionManager, SampleSink) {
    let manager = SessionManager::new(8, 16);
    let mock = Arc::new(MockSensor::accelerometer().manual());
    manager
        .register_sensor("accel", None, mock.clone())
        .await
        .unwrap();
    let sink = mock.sink().await.unwrap();
    (manager, sink)
}

#[tokio::test]
async fn test_samples_reach_running_sessions_only() {
    let (manager, sink) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let (a, buf_a) = manager.open("accel", "alice", None).await.unwrap();
    let (_b, buf_b) = manager.open("accel", "bob", None).await.unwrap();

    channel.start(a).await.unwrap();
    for n in 0..3 {
        assert!(sink.push_sample(&sample(n)));
    }

    let drained = buf_a.drain();
    assert_eq!(drained.frames.len(), 3);
    assert_eq!(XyzSample::decode(&drained.frames[2]), sample(2));
    assert!(buf_b.drain().frames.is_empty());
}

#[tokio::test]
async fn test_malformed_sample_is_dropped() {
    let (manager, sink) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let (a, buf) = manager.open("accel", "alice", None).await.unwrap();
    channel.start(a).await.unwrap();

    sink.push(bytes::Bytes::from_static(&[0u8; 7]));
    assert!(buf.is_empty());
}

#[tokio::test]
async fn test_overflow_is_counted_and_acknowledged() {
    let (manager, sink) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let (a, buf) = manager.open("accel", "alice", None).await.unwrap();

    channel.set_buffer_size(a, 4).await.unwrap();
    assert_eq!(channel.buffer_size(a).await.unwrap(), 4);
    channel.start(a).await.unwrap();

    for n in 0..10 {
        sink.push_sample(&sample(n));
    }
    assert_eq!(buf.len(), 4);

    let error = channel.error(a).await.unwrap();
    assert_eq!(error.code, ErrorCode::Overflow);

    let drained = buf.drain();
    assert_eq!(drained.overflow, Some(6));
    // The oldest samples are kept; the rejected ones were the newest.
    assert_eq!(XyzSample::decode(&drained.frames[0]), sample(0));

    // Reading the error does not clear it, the next mutating call does.
    assert_eq!(channel.error(a).await.unwrap().code, ErrorCode::Overflow);
    channel.set_downsampling(a, false).await.unwrap();
    assert_eq!(channel.error(a).await.unwrap().code, ErrorCode::None);
}

#[tokio::test]
async fn test_downsampling_keeps_newest_in_order() {
    let (manager, sink) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let (a, buf) = manager.open("accel", "alice", None).await.unwrap();

    channel.set_buffer_size(a, 4).await.unwrap();
    channel.set_downsampling(a, true).await.unwrap();
    assert!(channel.downsampling(a).await.unwrap());
    channel.start(a).await.unwrap();

    for n in 0..10 {
        sink.push_sample(&sample(n));
    }

    let drained = buf.drain();
    assert_eq!(drained.overflow, None);
    assert!(drained.frames.len() <= 4);
    let stamps: Vec<u64> = drained
        .frames
        .iter()
        .map(|f| XyzSample::decode(f).timestamp())
        .collect();
    assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(stamps.last().copied(), Some(sample(9).timestamp()));
    assert_eq!(channel.error(a).await.unwrap().code, ErrorCode::None);
}

#[tokio::test]
async fn test_buffer_settings_resolve_against_catalog() {
    let (manager, _sink) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let (a, buf) = manager.open("accel", "alice", None).await.unwrap();

    assert_eq!(channel.buffer_size(a).await.unwrap(), 16);
    assert!(channel.set_buffer_size(a, 5000).await.is_err());

    channel.set_buffer_interval(a, 250).await.unwrap();
    assert_eq!(channel.buffer_interval(a).await.unwrap(), 250);
    assert_eq!(buf.policy().interval.as_millis(), 250);

    channel.set_buffer_interval(a, 0).await.unwrap();
    assert_eq!(channel.buffer_interval(a).await.unwrap(), 0);
}

#[tokio::test]
async fn test_device_loss_suspends_and_marks_buffers() {
    let (manager, sink) = setup().await;
    let channel = manager.sensor("accel").await.unwrap();
    let (a, buf) = manager.open("accel", "alice", None).await.unwrap();
    channel.start(a).await.unwrap();

    sink.push_sample(&sample(1));
    sink.device_lost().await;
    assert!(channel.is_device_lost().await);
    sink.push_sample(&sample(2));
    assert!(buf.is_empty());

    let drained = buf.drain();
    assert!(drained.device_lost);
    assert!(drained.frames.is_empty());

    sink.device_restored().await;
    sink.push_sample(&sample(3));
    assert_eq!(buf.drain().frames.len(), 1);
}

#[tokio::test]
async fn test_sink_disconnects_after_shutdown() {
    let (manager, sink) = setup().await;
    assert!(sink.is_connected());
    manager.shutdown().await;
    assert!(!sink.is_connected());
    assert!(!sink.push_sample(&sample(0)));
}
