//! Device adaptor seam
//!
//! The daemon never talks to a kernel sensor interface itself. Each physical
//! (or simulated) device is wrapped in a [`DeviceAdaptor`], which:
//!
//! - advertises its [`CapabilityCatalog`]
//! - accepts the arbitrated [`EffectiveConfiguration`] via `configure`
//! - pushes encoded samples into the [`SampleSink`] it was attached to
//!
//! # Contract
//!
//! - `configure` is called inside the sensor's critical section, only when
//!   the effective configuration actually changed. An `interval` of `None`
//!   means no session is Running; whether the device idles or powers down is
//!   up to the adaptor.
//! - Returning an error from `configure` rolls back the control call that
//!   triggered it.
//! - Pushing into the sink never blocks on clients.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Weak};

use crate::sensor::arbitration::EffectiveConfiguration;
use crate::sensor::catalog::CapabilityCatalog;
use crate::sensor::channel::SensorChannel;
use crate::sensor::frame::{Frame, SensorType};

/// A source of samples for one sensor.
#[async_trait]
pub trait DeviceAdaptor: Send + Sync {
    /// Sensor type produced by this device
    fn sensor_type(&self) -> SensorType;

    /// Capability catalog, ordered by efficiency where it matters
    fn catalog(&self) -> CapabilityCatalog;

    /// Human readable description
    fn description(&self) -> String {
        format!("{} adaptor", self.sensor_type())
    }

    /// Start delivering samples into `sink`.
    async fn attach(&self, sink: SampleSink) -> Result<()>;

    /// Apply a new effective configuration to the device.
    async fn configure(&self, config: &EffectiveConfiguration) -> Result<()>;

    /// Stop delivering samples. Called when the sensor is unregistered.
    async fn detach(&self) -> Result<()> {
        Ok(())
    }
}

/// Handle through which an adaptor delivers samples.
///
/// Holds a weak reference so an adaptor can outlive its sensor without
/// keeping it alive; pushes after the sensor is gone report `false`.
#[derive(Clone)]
pub struct SampleSink {
    channel: Weak<SensorChannel>,
    frame_size: usize,
}

impl SampleSink {
    pub(crate) fn new(channel: &Arc<SensorChannel>) -> Self {
        Self {
            frame_size: channel.sensor_type().frame_size(),
            channel: Arc::downgrade(channel),
        }
    }

    /// Record size the sensor expects.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Whether the sensor is still registered.
    pub fn is_connected(&self) -> bool {
        self.channel.strong_count() > 0
    }

    /// Deliver one encoded sample to every Running session.
    pub fn push(&self, frame: Bytes) -> bool {
        match self.channel.upgrade() {
            Some(channel) => {
                channel.push_frame(frame);
                true
            }
            None => false,
        }
    }

    /// Encode and deliver a typed sample.
    pub fn push_sample<T: Frame>(&self, sample: &T) -> bool {
        self.push(Bytes::from(sample.to_bytes()))
    }

    /// Report that the physical device stopped responding.
    pub async fn device_lost(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.device_lost().await;
        }
    }

    /// Report that the device is back.
    pub async fn device_restored(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.device_restored().await;
        }
    }
}
