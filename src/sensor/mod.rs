//! Sensor model: capabilities, record formats, sessions and arbitration.
//!
//! - **`catalog`**: what a sensor advertises and how requests snap onto it
//! - **`frame`**: fixed-size binary records carried on the data channel
//! - **`session`**: per-session state and requests
//! - **`arbitration`**: reduction of Running requests to one device configuration
//! - **`channel`**: the per-sensor critical section tying the above together

pub mod arbitration;
pub mod catalog;
pub mod channel;
pub mod frame;
pub mod session;

pub use arbitration::EffectiveConfiguration;
pub use catalog::{CapabilityCatalog, DataRange, IntegerRange};
pub use channel::SensorChannel;
pub use frame::{Frame, SensorType};
pub use session::{Property, PropertyChanged, SessionId, SessionState};
