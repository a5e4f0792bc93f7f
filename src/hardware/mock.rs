//! Mock Hardware Implementations
//!
//! Provides simulated sensor devices for running the daemon and its tests
//! without physical hardware.
//!
//! # Available Mocks
//!
//! - `MockSensor::accelerometer()` - three-axis samples around 1 g on Z
//! - `MockSensor::als()` - ambient light readings around 300 lux
//!
//! A mock streams samples at the effective interval while at least one
//! session is Running and idles otherwise. `manual()` turns the generator
//! off so tests can inject exact samples through [`MockSensor::sink`].

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::hardware::adaptor::{DeviceAdaptor, SampleSink};
use crate::sensor::arbitration::EffectiveConfiguration;
use crate::sensor::catalog::{CapabilityCatalog, DataRange, IntegerRange};
use crate::sensor::frame::{SensorType, TimedUnsigned, XyzSample};

// =============================================================================
// Catalogs
// =============================================================================

/// Catalog of a typical MEMS accelerometer (values in mG).
pub fn accelerometer_catalog() -> CapabilityCatalog {
    CapabilityCatalog {
        intervals: vec![
            DataRange::point(10.0),
            DataRange::point(20.0),
            DataRange::new(50.0, 1000.0, 10.0),
        ],
        data_ranges: vec![
            DataRange::new(-2048.0, 2048.0, 1.0),
            DataRange::new(-4096.0, 4096.0, 2.0),
            DataRange::new(-8192.0, 8192.0, 4.0),
        ],
        buffer_intervals: vec![IntegerRange::new(1, 60_000)],
        buffer_sizes: vec![IntegerRange::new(1, 1), IntegerRange::new(2, 1024)],
        hw_buffering: false,
        default_interval: 100,
        default_data_range: 0,
    }
}

/// Catalog of an ambient light sensor (values in lux).
pub fn als_catalog() -> CapabilityCatalog {
    CapabilityCatalog {
        intervals: vec![DataRange::new(100.0, 1000.0, 100.0)],
        data_ranges: vec![DataRange::new(0.0, 65535.0, 1.0)],
        buffer_intervals: vec![IntegerRange::new(1, 60_000)],
        buffer_sizes: vec![IntegerRange::new(1, 64)],
        hw_buffering: false,
        default_interval: 200,
        default_data_range: 0,
    }
}

// =============================================================================
// MockSensor
// =============================================================================

/// Configurations kept by [`MockSensor::history`]; older ones are dropped.
pub const HISTORY_LIMIT: usize = 64;

/// Simulated sensor device.
pub struct MockSensor {
    sensor_type: SensorType,
    catalog: CapabilityCatalog,
    streaming: bool,
    config_tx: watch::Sender<Option<u32>>,
    sink: RwLock<Option<SampleSink>>,
    task: RwLock<Option<JoinHandle<()>>>,
    history: RwLock<VecDeque<EffectiveConfiguration>>,
    configure_delay: Option<Duration>,
    configure_calls: AtomicU64,
    fail_next_configure: AtomicBool,
}

impl MockSensor {
    /// Mock for any known sensor type, with a matching default catalog.
    pub fn for_type(sensor_type: SensorType) -> Self {
        let catalog = match sensor_type {
            SensorType::Als | SensorType::Proximity => als_catalog(),
            SensorType::Accelerometer | SensorType::Magnetometer | SensorType::Gyroscope => {
                accelerometer_catalog()
            }
        };
        let (config_tx, _) = watch::channel(None);
        Self {
            sensor_type,
            catalog,
            streaming: true,
            config_tx,
            sink: RwLock::new(None),
            task: RwLock::new(None),
            history: RwLock::new(VecDeque::new()),
            configure_delay: None,
            configure_calls: AtomicU64::new(0),
            fail_next_configure: AtomicBool::new(false),
        }
    }

    /// Accelerometer mock.
    pub fn accelerometer() -> Self {
        Self::for_type(SensorType::Accelerometer)
    }

    /// Ambient light mock.
    pub fn als() -> Self {
        Self::for_type(SensorType::Als)
    }

    /// Disable the sample generator.
    pub fn manual(mut self) -> Self {
        self.streaming = false;
        self
    }

    /// Replace the advertised catalog.
    pub fn with_catalog(mut self, catalog: CapabilityCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Make every `configure` call take `delay`, like a slow bus.
    pub fn with_configure_delay(mut self, delay: Duration) -> Self {
        self.configure_delay = Some(delay);
        self
    }

    /// Sink the daemon attached, for injecting samples.
    pub async fn sink(&self) -> Option<SampleSink> {
        self.sink.read().await.clone()
    }

    /// Number of `configure` calls received, failed ones included.
    pub fn configure_count(&self) -> u64 {
        self.configure_calls.load(Ordering::SeqCst)
    }

    /// The last [`HISTORY_LIMIT`] configurations applied, oldest first.
    pub async fn history(&self) -> Vec<EffectiveConfiguration> {
        self.history.read().await.iter().copied().collect()
    }

    /// Most recently applied configuration.
    pub async fn last_configuration(&self) -> Option<EffectiveConfiguration> {
        self.history.read().await.back().copied()
    }

    /// Make the next `configure` call fail.
    pub fn fail_next_configure(&self) {
        self.fail_next_configure.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceAdaptor for MockSensor {
    fn sensor_type(&self) -> SensorType {
        self.sensor_type
    }

    fn catalog(&self) -> CapabilityCatalog {
        self.catalog.clone()
    }

    fn description(&self) -> String {
        format!("Simulated {}", self.sensor_type)
    }

    async fn attach(&self, sink: SampleSink) -> Result<()> {
        *self.sink.write().await = Some(sink.clone());
        if !self.streaming {
            return Ok(());
        }

        let sensor_type = self.sensor_type;
        let config_rx = self.config_tx.subscribe();
        let handle = tokio::spawn(generate(sensor_type, sink, config_rx));
        if let Some(old) = self.task.write().await.replace(handle) {
            old.abort();
        }
        info!(sensor_type = %self.sensor_type, "mock sensor attached");
        Ok(())
    }

    async fn configure(&self, config: &EffectiveConfiguration) -> Result<()> {
        self.configure_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.configure_delay {
            sleep(delay).await;
        }
        if self.fail_next_configure.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("MockSensor: simulated configuration failure"));
        }
        {
            let mut history = self.history.write().await;
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(*config);
        }
        self.config_tx.send_replace(config.interval);
        debug!(interval = ?config.interval, range = config.data_range_index, "mock sensor configured");
        Ok(())
    }

    async fn detach(&self) -> Result<()> {
        if let Some(handle) = self.task.write().await.take() {
            handle.abort();
        }
        *self.sink.write().await = None;
        Ok(())
    }
}

/// Sample generator: idles while the interval is `None`.
async fn generate(sensor_type: SensorType, sink: SampleSink, mut config_rx: watch::Receiver<Option<u32>>) {
    let epoch_us = chrono::Utc::now().timestamp_micros().max(0) as u64;
    let started = Instant::now();

    loop {
        let interval = *config_rx.borrow_and_update();
        match interval {
            None => {
                if config_rx.changed().await.is_err() {
                    break;
                }
            }
            Some(ms) => {
                tokio::select! {
                    _ = sleep(Duration::from_millis(u64::from(ms.max(1)))) => {
                        let timestamp_us = epoch_us + started.elapsed().as_micros() as u64;
                        if !push_sample(sensor_type, &sink, timestamp_us) {
                            break;
                        }
                    }
                    changed = config_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!(sensor_type = %sensor_type, "mock generator stopped");
}

fn push_sample(sensor_type: SensorType, sink: &SampleSink, timestamp_us: u64) -> bool {
    let mut rng = rand::thread_rng();
    match sensor_type {
        SensorType::Accelerometer | SensorType::Magnetometer | SensorType::Gyroscope => {
            sink.push_sample(&XyzSample {
                timestamp_us,
                x: rng.gen_range(-20..=20),
                y: rng.gen_range(-20..=20),
                z: 1000 + rng.gen_range(-20..=20),
            })
        }
        SensorType::Als | SensorType::Proximity => sink.push_sample(&TimedUnsigned {
            timestamp_us,
            value: 300 + rng.gen_range(0..=50),
        }),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
