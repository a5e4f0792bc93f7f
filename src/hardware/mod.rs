//! Device adaptors
//!
//! The daemon talks to devices only through [`adaptor::DeviceAdaptor`].
//! `mock` provides simulated devices for the default configuration and tests.

pub mod adaptor;
pub mod mock;

pub use adaptor::{DeviceAdaptor, SampleSink};
pub use mock::MockSensor;
