//! Out-of-process provider reached over a Unix-domain socket.
//!
//! Wire format is newline-delimited JSON in both directions:
//!
//! - host -> provider: `{"type":"request","callId":..,"appId":..,"content":{..}}`
//!   and `{"type":"release","callId":..,"appId":..}`
//! - provider -> host: `{"callId":..?,"appId":..?,"content":{..}}`

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{CapabilityProvider, HostContext, ProviderCallback, ProviderError};

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OutboundFrame<'a> {
    #[serde(rename_all = "camelCase")]
    Request {
        call_id: &'a str,
        app_id: &'a str,
        content: Value,
    },
    #[serde(rename_all = "camelCase")]
    Release { call_id: &'a str, app_id: &'a str },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundFrame {
    call_id: Option<String>,
    app_id: Option<String>,
    content: Value,
}

struct Connection {
    lines_tx: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Provider adapter speaking NDJSON over a Unix socket.
pub struct SocketProvider {
    id: String,
    socket_path: PathBuf,
    modules: Vec<String>,
    conn: Mutex<Option<Connection>>,
}

impl SocketProvider {
    pub fn new(
        id: impl Into<String>,
        socket_path: impl Into<PathBuf>,
        modules: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            socket_path: socket_path.into(),
            modules,
            conn: Mutex::new(None),
        }
    }

    async fn send_line(&self, line: String) -> Result<(), ProviderError> {
        let guard = self.conn.lock().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| ProviderError::Unavailable(format!("{} is not connected", self.id)))?;
        conn.lines_tx
            .send(line)
            .map_err(|_| ProviderError::Unavailable(format!("{} connection closed", self.id)))
    }
}

fn encode(frame: &OutboundFrame<'_>) -> Result<String, ProviderError> {
    let mut line =
        serde_json::to_string(frame).map_err(|e| ProviderError::Malformed(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

fn content_text(content: Value) -> String {
    match content {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[async_trait]
impl CapabilityProvider for SocketProvider {
    async fn init(
        &self,
        _ctx: &HostContext,
        callback: ProviderCallback,
    ) -> Result<(), ProviderError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| ProviderError::Init(format!("{}: {e}", self.socket_path.display())))?;
        let (read_half, mut write_half) = stream.into_split();
        let (lines_tx, mut lines_rx) = mpsc::unbounded_channel::<String>();

        let provider = self.id.clone();
        let writer = tokio::spawn(async move {
            while let Some(line) = lines_rx.recv().await {
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    warn!(provider = %provider, error = %e, "Provider socket write failed");
                    break;
                }
            }
        });

        let provider = self.id.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match serde_json::from_str::<InboundFrame>(&line) {
                        Ok(frame) => {
                            let delivered = callback.on_callback(
                                frame.call_id.as_deref(),
                                frame.app_id.as_deref(),
                                content_text(frame.content),
                            );
                            if !delivered {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(provider = %provider, error = %e, "Malformed provider frame");
                        }
                    },
                    Ok(None) => {
                        info!(provider = %provider, "Provider socket closed");
                        break;
                    }
                    Err(e) => {
                        warn!(provider = %provider, error = %e, "Provider socket read failed");
                        break;
                    }
                }
            }
        });

        let previous = self.conn.lock().await.replace(Connection {
            lines_tx,
            reader,
            writer,
        });
        if let Some(old) = previous {
            old.reader.abort();
            old.writer.abort();
        }

        info!(provider = %self.id, socket = %self.socket_path.display(), "Provider socket connected");
        Ok(())
    }

    fn list_modules(&self) -> Vec<String> {
        self.modules.clone()
    }

    async fn request(
        &self,
        _ctx: &HostContext,
        call_id: &str,
        app_id: &str,
        payload: &str,
    ) -> Result<i32, ProviderError> {
        let content: Value =
            serde_json::from_str(payload).map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let line = encode(&OutboundFrame::Request {
            call_id,
            app_id,
            content,
        })?;
        self.send_line(line).await?;
        debug!(provider = %self.id, call_id, app_id, "Request written to provider socket");
        Ok(0)
    }

    async fn release_app(
        &self,
        _ctx: &HostContext,
        call_id: &str,
        app_id: &str,
    ) -> Result<(), ProviderError> {
        let line = encode(&OutboundFrame::Release { call_id, app_id })?;
        self.send_line(line).await
    }

    async fn release_all(&self, _ctx: &HostContext) -> Result<(), ProviderError> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.reader.abort();
            // Dropping the sender lets the writer flush queued lines and exit.
            drop(conn.lines_tx);
            if let Err(e) = conn.writer.await {
                debug!(provider = %self.id, error = %e, "Provider writer task ended abnormally");
            }
        }
        Ok(())
    }
}
