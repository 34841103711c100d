// ABOUTME: Control endpoint server answering status probes for a worker.
// ABOUTME: Each connection reads JSON request lines and writes one JSON reply per line.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::channel::{ControlCommand, ControlReply, ControlRequest};
use crate::error::ControlError;

/// Serve control requests on a TCP listener until the listener fails.
pub async fn serve_tcp<F>(listener: TcpListener, responder: F) -> Result<(), ControlError>
where
    F: Fn(ControlCommand) -> ControlReply + Send + Sync + 'static,
{
    if let Ok(local) = listener.local_addr() {
        tracing::info!(address = %local, "Control endpoint listening");
    }
    let responder = Arc::new(responder);

    loop {
        let (stream, _) = listener.accept().await?;
        let responder = Arc::clone(&responder);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, move |cmd| (*responder)(cmd)).await {
                tracing::warn!(error = %e, "Control connection error");
            }
        });
    }
}

/// Serve control requests on a unix socket path, replacing any stale socket file.
#[cfg(unix)]
pub async fn serve_unix<F>(path: std::path::PathBuf, responder: F) -> Result<(), ControlError>
where
    F: Fn(ControlCommand) -> ControlReply + Send + Sync + 'static,
{
    let _ = std::fs::remove_file(&path);
    let listener = tokio::net::UnixListener::bind(&path)?;
    tracing::info!(path = %path.display(), "Control endpoint listening");
    let responder = Arc::new(responder);

    loop {
        let (stream, _) = listener.accept().await?;
        let responder = Arc::clone(&responder);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, move |cmd| (*responder)(cmd)).await {
                tracing::warn!(error = %e, "Control connection error");
            }
        });
    }
}

/// Answer requests on one connection until the peer closes it.
pub async fn serve_connection<S, F>(stream: S, responder: F) -> Result<(), ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(ControlCommand) -> ControlReply,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let reply = match serde_json::from_str::<ControlRequest>(line.trim()) {
            Ok(request) => responder(request.command),
            Err(e) => {
                tracing::debug!(error = %e, "Rejecting malformed control request");
                ControlReply::not_ready(format!("malformed request: {e}"))
            }
        };
        let reply_json = serde_json::to_string(&reply)
            .map_err(|e| ControlError::Malformed(e.to_string()))?
            + "\n";
        writer.write_all(reply_json.as_bytes()).await?;
        writer.flush().await?;
        line.clear();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_answers_each_line() {
        let (client, server) = tokio::io::duplex(1024);
        let handle = tokio::spawn(serve_connection(server, |_| ControlReply::ready()));

        let (reader, mut writer) = tokio::io::split(client);
        writer
            .write_all(b"{\"command\":\"STATUS\"}\nnot json\n")
            .await
            .unwrap();
        writer.shutdown().await.unwrap();

        let mut lines = BufReader::new(reader).lines();
        let first: ControlReply =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(first.is_ready);

        let second: ControlReply =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(!second.is_ready);
        assert!(second.detail.unwrap().contains("malformed"));

        handle.await.unwrap().unwrap();
    }
}
