//! Sample buffering and the binary data channel.
pub mod framing;
pub mod session_buffer;

pub use framing::{FrameReader, FrameWriter};
pub use session_buffer::{BufferPolicy, SessionBuffer};
