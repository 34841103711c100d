// ABOUTME: Transport seam between the dispatcher and the wire.
// ABOUTME: Defines the request/response envelope and the async send/receive traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::TransportError;

/// One message on the wire. Workers echo `request_id` on the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: String,
    #[serde(default)]
    pub body: Value,
}

impl Envelope {
    /// Wrap `body` under a freshly minted request id.
    pub fn new(body: Value) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            body,
        }
    }

    /// Response envelope echoing `request_id`.
    pub fn reply(request_id: impl Into<String>, body: Value) -> Self {
        Self {
            request_id: request_id.into(),
            body,
        }
    }
}

/// Outbound half of a transport. Shared by concurrent sends.
#[async_trait]
pub trait TransportSender: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Inbound half of a transport.
#[async_trait]
pub trait TransportReceiver: Send {
    /// Next message, or `None` once the peer has closed.
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError>;
}
