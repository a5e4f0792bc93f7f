//! Concurrent access to sessions and sensors
//!
//! Setters on one sensor are serialized by its channel, and nothing one
//! sensor does (a slow device reconfiguration, an `open` waiting on it) may
//! hold up calls on another sensor.

use sensord::hardware::MockSensor;
use sensord::network::SessionManager;
use sensord::sensor::arbitration::arbitrate_sessions;
use sensord::sensor::session::SessionId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

const INTERVALS: [u32; 6] = [10, 20, 50, 100, 250, 500];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_setters_leave_consistent_state() {
    let manager = SessionManager::new(16, 32);
    let mock = Arc::new(MockSensor::accelerometer().manual());
    manager
        .register_sensor("accel", None, mock.clone())
        .await
        .unwrap();
    let channel = manager.sensor("accel").await.unwrap();

    let mut ids: Vec<SessionId> = Vec::new();
    for n in 0..6 {
        let (id, _) = manager.open("accel", &format!("client-{n}"), None).await.unwrap();
        channel.start(id).await.unwrap();
        ids.push(id);
    }

    let mut tasks = Vec::new();
    for (n, id) in ids.iter().copied().enumerate() {
        let channel = channel.clone();
        tasks.push(tokio::spawn(async move {
            for k in 0..25 {
                let interval = INTERVALS[(n + k) % INTERVALS.len()];
                channel.set_interval(id, interval).await.unwrap();
                channel.set_standby_override(id, (n + k) % 4 == 0).await.unwrap();
                match k % 5 {
                    0 | 2 => channel.set_data_range_index(id, (n + k) % 3).await.unwrap(),
                    4 => channel.remove_data_range_request(id).await.unwrap(),
                    _ => {}
                }
                if k % 7 == 3 {
                    channel.stop(id).await.unwrap();
                    channel.start(id).await.unwrap();
                }
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut sessions = Vec::new();
    for id in &ids {
        sessions.push(channel.session(*id).await.unwrap());
    }
    let expected = arbitrate_sessions(channel.catalog(), sessions.iter());
    let effective = channel.effective().await;

    assert_eq!(effective, expected);
    assert_eq!(mock.last_configuration().await, Some(effective));
}

#[tokio::test]
async fn test_slow_sensor_does_not_delay_other_sensors() {
    let manager = SessionManager::new(16, 32);
    let slow = Arc::new(
        MockSensor::accelerometer()
            .manual()
            .with_configure_delay(Duration::from_millis(800)),
    );
    manager.register_sensor("slow", None, slow).await.unwrap();
    manager
        .register_sensor("fast", None, Arc::new(MockSensor::accelerometer().manual()))
        .await
        .unwrap();

    let (s, _) = manager.open("slow", "alice", None).await.unwrap();
    let (f, _) = manager.open("fast", "bob", None).await.unwrap();
    manager.channel(f).await.unwrap().start(f).await.unwrap();

    // Hold the slow sensor inside a device reconfiguration...
    let starting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.channel(s).await.unwrap().start(s).await })
    };
    sleep(Duration::from_millis(50)).await;

    // ...and queue an open behind it.
    let opening = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.open("slow", "carol", None).await })
    };
    sleep(Duration::from_millis(50)).await;

    let began = Instant::now();
    let fast = manager.channel_for(f, "bob").await.unwrap();
    fast.set_interval(f, 50).await.unwrap();
    let elapsed = began.elapsed();
    assert!(elapsed < Duration::from_millis(200), "fast sensor waited {elapsed:?}");
    assert_eq!(fast.effective().await.interval, Some(50));

    timeout(Duration::from_secs(5), starting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let (opened, _) = timeout(Duration::from_secs(5), opening)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(manager.is_open(opened).await);
    assert_eq!(manager.session_count().await, 3);
}

#[tokio::test]
async fn test_open_racing_release_of_client_leaves_no_orphan() {
    let manager = SessionManager::new(16, 32);
    manager
        .register_sensor(
            "slow",
            None,
            Arc::new(
                MockSensor::accelerometer()
                    .manual()
                    .with_configure_delay(Duration::from_millis(300)),
            ),
        )
        .await
        .unwrap();
    let channel = manager.sensor("slow").await.unwrap();

    let (s, _) = manager.open("slow", "alice", None).await.unwrap();
    let starting = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.start(s).await })
    };
    sleep(Duration::from_millis(50)).await;

    let opening = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.open("slow", "carol", None).await })
    };
    sleep(Duration::from_millis(50)).await;
    manager.release_client("carol").await;

    starting.await.unwrap().unwrap();
    let result = opening.await.unwrap();
    assert!(result.is_err());
    assert_eq!(manager.session_count().await, 1);
    assert_eq!(channel.session_ids().await, vec![s]);
}
