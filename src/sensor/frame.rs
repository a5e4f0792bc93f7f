//! Fixed-size sample records
//!
//! A frame's size is a function of the sensor type alone. Both ends know it
//! before any data flows, so the data channel never negotiates lengths per
//! record. All records are little-endian.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A fixed-size binary sample record.
pub trait Frame: Sized + Clone + Send + 'static {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Write exactly `SIZE` bytes into `buf`.
    fn encode(&self, buf: &mut [u8]);

    /// Decode from exactly `SIZE` bytes.
    fn decode(buf: &[u8]) -> Self;

    /// Capture time in microseconds.
    fn timestamp(&self) -> u64;

    /// Encode into a fresh buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        self.encode(&mut buf);
        buf
    }
}

/// Three-axis sample (accelerometer, magnetometer, gyroscope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct XyzSample {
    /// Capture time in microseconds
    pub timestamp_us: u64,
    /// X axis
    pub x: i32,
    /// Y axis
    pub y: i32,
    /// Z axis
    pub z: i32,
}

impl Frame for XyzSample {
    const SIZE: usize = 20;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.timestamp_us.to_le_bytes());
        buf[8..12].copy_from_slice(&self.x.to_le_bytes());
        buf[12..16].copy_from_slice(&self.y.to_le_bytes());
        buf[16..20].copy_from_slice(&self.z.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            timestamp_us: u64::from_le_bytes(le8(&buf[0..8])),
            x: i32::from_le_bytes(le4(&buf[8..12])),
            y: i32::from_le_bytes(le4(&buf[12..16])),
            z: i32::from_le_bytes(le4(&buf[16..20])),
        }
    }

    fn timestamp(&self) -> u64 {
        self.timestamp_us
    }
}

/// Scalar sample (ambient light, proximity, temperature).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimedUnsigned {
    /// Capture time in microseconds
    pub timestamp_us: u64,
    /// Reading
    pub value: u32,
}

impl Frame for TimedUnsigned {
    const SIZE: usize = 12;

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.timestamp_us.to_le_bytes());
        buf[8..12].copy_from_slice(&self.value.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            timestamp_us: u64::from_le_bytes(le8(&buf[0..8])),
            value: u32::from_le_bytes(le4(&buf[8..12])),
        }
    }

    fn timestamp(&self) -> u64 {
        self.timestamp_us
    }
}

fn le8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    out
}

fn le4(bytes: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(bytes);
    out
}

/// Sensor types known to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    /// Three-axis acceleration
    Accelerometer,
    /// Three-axis magnetic field
    Magnetometer,
    /// Three-axis angular rate
    Gyroscope,
    /// Ambient light
    Als,
    /// Proximity
    Proximity,
}

impl SensorType {
    /// Record size on the data channel.
    pub fn frame_size(self) -> usize {
        match self {
            SensorType::Accelerometer | SensorType::Magnetometer | SensorType::Gyroscope => {
                XyzSample::SIZE
            }
            SensorType::Als | SensorType::Proximity => TimedUnsigned::SIZE,
        }
    }

    /// Name used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            SensorType::Accelerometer => "accelerometer",
            SensorType::Magnetometer => "magnetometer",
            SensorType::Gyroscope => "gyroscope",
            SensorType::Als => "als",
            SensorType::Proximity => "proximity",
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accelerometer" => Ok(SensorType::Accelerometer),
            "magnetometer" => Ok(SensorType::Magnetometer),
            "gyroscope" => Ok(SensorType::Gyroscope),
            "als" => Ok(SensorType::Als),
            "proximity" => Ok(SensorType::Proximity),
            other => Err(format!("unknown sensor type '{}'", other)),
        }
    }
}
