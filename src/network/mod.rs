//! Control plane: wire protocol, session registry, control server and the
//! per-session data sockets.
pub mod data_endpoint;
pub mod protocol;
pub mod server_actor;
pub mod session;

pub use protocol::{ControlCall, ControlReply, Envelope};
pub use server_actor::ControlServer;
pub use session::SessionManager;
