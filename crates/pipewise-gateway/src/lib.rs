// ABOUTME: Gateway dispatch layer: streams client requests to workers with bounded in-flight windows.
// ABOUTME: Exposes the transport seam, a JSON-line TCP transport, and the prefetch dispatcher.

pub mod dispatcher;
pub mod error;
pub mod tcp;
pub mod transport;

pub use dispatcher::{DispatchSettings, PrefetchDispatcher};
pub use error::TransportError;
pub use transport::{Envelope, TransportReceiver, TransportSender};
