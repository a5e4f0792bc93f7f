//! # sensord
//!
//! A sensor sharing daemon. Many client sessions may open the same physical
//! sensor; each asks for its own interval, data range and standby behaviour,
//! and the daemon arbitrates those requests into the single configuration
//! the device actually runs at. Samples fan out to every Running session
//! over a per-session binary data socket with its own buffering policy.
//!
//! ## Crate Structure
//!
//! - **`sensor`**: capability catalogs, record formats, sessions and the
//!   arbitration engine. `sensor::channel::SensorChannel` is the per-sensor
//!   critical section every state change goes through.
//! - **`data`**: per-session sample queues (`SessionBuffer`) with overflow and
//!   downsampling policy, and the framing used on data sockets.
//! - **`hardware`**: the `DeviceAdaptor` trait and simulated devices.
//! - **`network`**: the control protocol, the `SessionManager` registry, the
//!   control server and per-session data endpoints.
//! - **`client`**: the client library (`SensorClient`, `SensorSession`,
//!   `DataReader`).
//! - **`config`**: figment-based daemon configuration.
//! - **`error`**: `SensorError` and the wire error codes.
//! - **`tracing_config`**: tracing subscriber setup.

pub mod client;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod network;
pub mod sensor;
pub mod tracing_config;

pub use error::{ErrorCode, SensorError, SensorResult};
