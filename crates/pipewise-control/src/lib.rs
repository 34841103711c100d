// ABOUTME: Control channel used by supervisors to query worker readiness.
// ABOUTME: Provides the ControlChannel trait, a socket client, and a status responder server.

pub mod channel;
pub mod error;
pub mod server;

pub use channel::{
    probe_ready, ControlChannel, ControlCommand, ControlReply, ControlRequest,
    SocketControlChannel,
};
pub use error::ControlError;
pub use server::{serve_connection, serve_tcp};

#[cfg(unix)]
pub use server::serve_unix;
