// ABOUTME: JSON-line transport over TCP.
// ABOUTME: One envelope per line in each direction; malformed inbound lines are skipped.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;

use crate::error::TransportError;
use crate::transport::{Envelope, TransportReceiver, TransportSender};

/// Connect to a worker pool endpoint and split the stream into transport halves.
pub async fn connect(addr: impl ToSocketAddrs) -> Result<(TcpSender, TcpReceiver), TransportError> {
    let stream = TcpStream::connect(addr).await?;
    Ok(split(stream))
}

pub fn split(stream: TcpStream) -> (TcpSender, TcpReceiver) {
    let (reader, writer) = stream.into_split();
    (
        TcpSender {
            writer: Arc::new(Mutex::new(writer)),
        },
        TcpReceiver {
            lines: BufReader::new(reader).lines(),
        },
    )
}

#[derive(Clone)]
pub struct TcpSender {
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

#[async_trait]
impl TransportSender for TcpSender {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let line = serde_json::to_string(&envelope)? + "\n";
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

pub struct TcpReceiver {
    lines: Lines<BufReader<OwnedReadHalf>>,
}

#[async_trait]
impl TransportReceiver for TcpReceiver {
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed message"),
            }
        }
        Ok(None)
    }
}
