// ABOUTME: Blocking control-channel client for worker status probes.
// ABOUTME: Sends one JSON line per request and reads one JSON line back, bounded by a timeout.

use std::time::Duration;

use pipewise_core::{run_blocking, ControlAddress};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::ControlError;

/// Commands understood by a worker's control endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
    Status,
}

/// One control request line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlRequest {
    pub command: ControlCommand,
}

/// One control reply line.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlReply {
    pub is_ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ControlReply {
    pub fn ready() -> Self {
        Self {
            is_ready: true,
            detail: None,
        }
    }

    pub fn not_ready(detail: impl Into<String>) -> Self {
        Self {
            is_ready: false,
            detail: Some(detail.into()),
        }
    }
}

/// Request/reply access to worker control endpoints.
///
/// Calls block the current thread for at most `timeout`.
pub trait ControlChannel: Send + Sync {
    fn request(
        &self,
        address: &ControlAddress,
        command: ControlCommand,
        timeout: Duration,
    ) -> Result<ControlReply, ControlError>;
}

/// Control channel over TCP or unix sockets, speaking JSON lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketControlChannel;

impl SocketControlChannel {
    pub fn new() -> Self {
        Self
    }

    /// Async form of [`ControlChannel::request`], for callers already on a runtime.
    pub async fn request_async(
        &self,
        address: &ControlAddress,
        command: ControlCommand,
        timeout: Duration,
    ) -> Result<ControlReply, ControlError> {
        tokio::time::timeout(timeout, exchange(address, command))
            .await
            .map_err(|_| ControlError::Timeout(timeout))?
    }
}

impl ControlChannel for SocketControlChannel {
    fn request(
        &self,
        address: &ControlAddress,
        command: ControlCommand,
        timeout: Duration,
    ) -> Result<ControlReply, ControlError> {
        run_blocking(self.request_async(address, command, timeout))?
    }
}

/// Probe readiness once. Any failure counts as not ready.
pub fn probe_ready(
    channel: &dyn ControlChannel,
    address: &ControlAddress,
    timeout: Duration,
) -> bool {
    match channel.request(address, ControlCommand::Status, timeout) {
        Ok(reply) => reply.is_ready,
        Err(e) => {
            tracing::debug!(address = %address, error = %e, "Status probe failed");
            false
        }
    }
}

async fn exchange(
    address: &ControlAddress,
    command: ControlCommand,
) -> Result<ControlReply, ControlError> {
    let unreachable = |source| ControlError::Unreachable {
        address: address.to_string(),
        source,
    };

    match address {
        ControlAddress::Tcp { .. } => {
            let target = address
                .dial_target()
                .ok_or_else(|| ControlError::Unsupported(address.to_string()))?;
            let stream = tokio::net::TcpStream::connect(&target)
                .await
                .map_err(unreachable)?;
            exchange_on(stream, command).await
        }
        #[cfg(unix)]
        ControlAddress::Ipc(path) => {
            let stream = tokio::net::UnixStream::connect(path)
                .await
                .map_err(unreachable)?;
            exchange_on(stream, command).await
        }
        #[cfg(not(unix))]
        ControlAddress::Ipc(_) => Err(ControlError::Unsupported(address.to_string())),
    }
}

async fn exchange_on<S>(stream: S, command: ControlCommand) -> Result<ControlReply, ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);

    let request = serde_json::to_string(&ControlRequest { command })
        .map_err(|e| ControlError::Malformed(e.to_string()))?
        + "\n";
    writer.write_all(request.as_bytes()).await?;
    writer.flush().await?;

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(ControlError::Closed);
    }
    serde_json::from_str(line.trim()).map_err(|e| ControlError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedChannel(Result<ControlReply, ()>);

    impl ControlChannel for FixedChannel {
        fn request(
            &self,
            _address: &ControlAddress,
            _command: ControlCommand,
            timeout: Duration,
        ) -> Result<ControlReply, ControlError> {
            self.0.clone().map_err(|_| ControlError::Timeout(timeout))
        }
    }

    fn addr() -> ControlAddress {
        "tcp://127.0.0.1:1".parse().unwrap()
    }

    #[test]
    fn test_request_wire_format() {
        let line = serde_json::to_string(&ControlRequest {
            command: ControlCommand::Status,
        })
        .unwrap();
        assert_eq!(line, r#"{"command":"STATUS"}"#);
    }

    #[test]
    fn test_reply_detail_is_optional() {
        let reply: ControlReply = serde_json::from_str(r#"{"is_ready":true}"#).unwrap();
        assert_eq!(reply, ControlReply::ready());
    }

    #[test]
    fn test_probe_ready_reflects_reply() {
        let timeout = Duration::from_millis(10);
        assert!(probe_ready(&FixedChannel(Ok(ControlReply::ready())), &addr(), timeout));
        assert!(!probe_ready(
            &FixedChannel(Ok(ControlReply::not_ready("loading"))),
            &addr(),
            timeout
        ));
    }

    #[test]
    fn test_probe_failure_is_not_ready() {
        assert!(!probe_ready(
            &FixedChannel(Err(())),
            &addr(),
            Duration::from_millis(10)
        ));
    }
}
