//! Newline-delimited JSON bridge between a script host and [`Host`].
//!
//! Each inbound line is a tagged [`InboundFrame`]. Replies and pushes leave
//! as [`OutboundFrame`] lines on the writer as they are produced.
//!
//! Requests and stops for one (call, app) run in order on that app's own
//! worker task, so a provider that stalls holds up only the app that asked.
//! Call phase frames are applied as they are read.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callcap_core::AppRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::call::CallPhase;
use crate::host::Host;
use crate::routing::{ReplyChannel, ReplyError, SubscriptionKey};

/// How long an ending call or input EOF waits for queued app work.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One line read from the script host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundFrame {
    #[serde(rename_all = "camelCase")]
    Request {
        call_id: String,
        app_id: String,
        request: AppRequest,
    },
    #[serde(rename_all = "camelCase")]
    CallState { call_id: String, state: CallPhase },
    #[serde(rename_all = "camelCase")]
    AppStopped { call_id: String, app_id: String },
    #[serde(rename_all = "camelCase")]
    CallEnded { call_id: String },
}

/// One line written to the script host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    pub call_id: String,
    pub app_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<Value>,
}

#[derive(Debug, Clone, Copy)]
enum FrameKind {
    Response,
    Notify,
}

/// A reply channel that frames payloads for one (call, app) onto the writer queue.
struct FramedChannel {
    call_id: String,
    app_id: String,
    kind: FrameKind,
    out: mpsc::UnboundedSender<String>,
}

impl FramedChannel {
    fn new(
        call_id: &str,
        app_id: &str,
        kind: FrameKind,
        out: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            call_id: call_id.to_string(),
            app_id: app_id.to_string(),
            kind,
            out,
        }
    }
}

#[async_trait]
impl ReplyChannel for FramedChannel {
    async fn deliver(&self, payload: String) -> Result<(), ReplyError> {
        let body = serde_json::from_str(&payload).unwrap_or(Value::String(payload));
        let (response, notify) = match self.kind {
            FrameKind::Response => (Some(body), None),
            FrameKind::Notify => (None, Some(body)),
        };
        let frame = OutboundFrame {
            call_id: self.call_id.clone(),
            app_id: self.app_id.clone(),
            response,
            notify,
        };
        let line =
            serde_json::to_string(&frame).map_err(|e| ReplyError::Failed(e.to_string()))?;
        self.out.send(line).map_err(|_| ReplyError::Closed)
    }
}

enum AppWork {
    Request(AppRequest),
    Stopped,
}

struct AppWorker {
    queue: mpsc::UnboundedSender<AppWork>,
    task: JoinHandle<()>,
}

fn spawn_worker(
    host: Arc<Host>,
    key: SubscriptionKey,
    out: mpsc::UnboundedSender<String>,
) -> AppWorker {
    let (queue, mut work) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        while let Some(item) = work.recv().await {
            match item {
                AppWork::Request(request) => {
                    let reply = FramedChannel::new(
                        &key.call_id,
                        &key.app_id,
                        FrameKind::Response,
                        out.clone(),
                    );
                    let replied = host
                        .dispatch(&key.call_id, &key.app_id, request, Some(Arc::new(reply)))
                        .await;
                    debug!(%key, replied, "Request handled");
                }
                AppWork::Stopped => {
                    host.app_stopped(&key.call_id, &key.app_id).await;
                    break;
                }
            }
        }
    });
    AppWorker { queue, task }
}

/// Wait for a retired worker to finish its queue; cancel it past the deadline.
async fn drain(key: &SubscriptionKey, mut task: JoinHandle<()>) {
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(%key, error = %e, "Mini-app worker failed"),
        Err(_) => {
            warn!(%key, "Mini-app worker still busy, cancelling");
            task.abort();
        }
    }
}

struct Bridge {
    host: Arc<Host>,
    out: mpsc::UnboundedSender<String>,
    workers: HashMap<SubscriptionKey, AppWorker>,
    retiring: JoinSet<()>,
}

impl Bridge {
    fn new(host: Arc<Host>, out: mpsc::UnboundedSender<String>) -> Self {
        Self {
            host,
            out,
            workers: HashMap::new(),
            retiring: JoinSet::new(),
        }
    }

    fn enqueue(&mut self, call_id: &str, app_id: &str, item: AppWork) {
        let worker = self
            .workers
            .entry(SubscriptionKey::new(call_id, app_id))
            .or_insert_with_key(|key| {
                spawn_worker(Arc::clone(&self.host), key.clone(), self.out.clone())
            });
        if worker.queue.send(item).is_err() {
            warn!(call_id, app_id, "Mini-app worker gone, dropping frame");
        }
    }

    /// Stop feeding a worker and wait for it in the background.
    fn retire(&mut self, key: &SubscriptionKey) {
        if let Some(AppWorker { queue, task }) = self.workers.remove(key) {
            drop(queue);
            let key = key.clone();
            self.retiring.spawn(async move { drain(&key, task).await });
        }
    }

    async fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let frame = match serde_json::from_str::<InboundFrame>(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Skipping unparseable frame");
                return;
            }
        };

        match frame {
            InboundFrame::Request {
                call_id,
                app_id,
                request,
            } => {
                if !self.host.links().is_attached(&call_id, &app_id).await {
                    let link =
                        FramedChannel::new(&call_id, &app_id, FrameKind::Notify, self.out.clone());
                    self.host.attach_app(&call_id, &app_id, Arc::new(link)).await;
                }
                self.enqueue(&call_id, &app_id, AppWork::Request(request));
            }
            InboundFrame::CallState { call_id, state } => {
                self.host.set_call_phase(&call_id, state).await;
            }
            InboundFrame::AppStopped { call_id, app_id } => {
                self.enqueue(&call_id, &app_id, AppWork::Stopped);
                self.retire(&SubscriptionKey::new(call_id, app_id));
            }
            InboundFrame::CallEnded { call_id } => {
                let keys: Vec<SubscriptionKey> = self
                    .workers
                    .keys()
                    .filter(|key| key.call_id == call_id)
                    .cloned()
                    .collect();
                let tasks: Vec<_> = keys
                    .into_iter()
                    .filter_map(|key| self.workers.remove(&key).map(|w| (key, w.task)))
                    .collect();
                let host = Arc::clone(&self.host);
                self.retiring.spawn(async move {
                    for (key, task) in tasks {
                        drain(&key, task).await;
                    }
                    host.call_ended(&call_id).await;
                });
            }
        }
    }
}

/// Serve frames from `reader` until EOF, writing output lines to `writer`.
///
/// At EOF, queued app work is given a short time to finish and its output
/// is written before returning.
pub async fn run_stdio<R, W>(host: Arc<Host>, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let mut bridge = Bridge::new(host, out_tx);
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                bridge.handle_line(&line).await;
            }
            Some(text) = out_rx.recv() => {
                write_line(&mut writer, &text).await?;
            }
            Some(joined) = bridge.retiring.join_next(), if !bridge.retiring.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Bridge teardown task failed");
                }
            }
        }
    }

    let open: Vec<SubscriptionKey> = bridge.workers.keys().cloned().collect();
    for key in &open {
        bridge.retire(key);
    }
    loop {
        tokio::select! {
            joined = bridge.retiring.join_next() => {
                match joined {
                    Some(Err(e)) => warn!(error = %e, "Bridge teardown task failed"),
                    Some(Ok(())) => {}
                    None => break,
                }
            }
            Some(text) = out_rx.recv() => {
                write_line(&mut writer, &text).await?;
            }
        }
    }

    flush_queued(&mut out_rx, &mut writer).await?;
    info!("Stdio bridge reached end of input");
    Ok(())
}

async fn flush_queued<W>(
    out: &mut mpsc::UnboundedReceiver<String>,
    writer: &mut W,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Ok(text) = out.try_recv() {
        write_line(writer, &text).await?;
    }
    Ok(())
}

async fn write_line<W>(writer: &mut W, text: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(text.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
