//! Bidirectional transports for the bridge.
//!
//! All transports speak newline-delimited JSON-RPC frames. The stream
//! transport drives any `AsyncRead`/`AsyncWrite` pair (child-process stdio,
//! in-memory duplex); the HTTP transport POSTs one frame per request.
//! Responses are correlated to requests through a pending map keyed by the
//! numeric request id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use weft_kernel::EngineError;

use crate::protocol::{
    JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcPayload, JsonRpcRequest,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_QUEUE_DEPTH: usize = 256;

/// One side of a JSON-RPC session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request and waits for the matching response. Transport and
    /// JSON-RPC protocol failures surface as `network` errors.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, EngineError>;

    /// Sends a notification; no response is expected.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), EngineError>;
}

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, EngineError>>>>>;

/// Line-delimited JSON-RPC over any byte stream.
pub struct StreamTransport {
    write_tx: mpsc::Sender<String>,
    pending: Pending,
    next_id: AtomicI64,
    alive: Arc<AtomicBool>,
    timeout: Duration,
}

impl StreamTransport {
    /// Spawns reader and writer tasks over the given halves.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (write_tx, mut write_rx) = mpsc::channel::<String>(WRITE_QUEUE_DEPTH);

        let alive_writer = Arc::clone(&alive);
        let mut writer = writer;
        tokio::spawn(async move {
            while let Some(line) = write_rx.recv().await {
                if !alive_writer.load(Ordering::SeqCst) {
                    break;
                }
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.flush().await.is_err()
                {
                    alive_writer.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        let pending_reader = Arc::clone(&pending);
        let alive_reader = Arc::clone(&alive);
        let mut reader = BufReader::new(reader);
        tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => {
                        alive_reader.store(false, Ordering::SeqCst);
                        break;
                    }
                    Ok(_) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcMessage>(&line) {
                            Ok(JsonRpcMessage::Response(response)) => {
                                if let JsonRpcId::Number(id) = response.id {
                                    let tx = pending_reader.lock().ok().and_then(|mut p| p.remove(&id));
                                    if let Some(tx) = tx {
                                        let _ = tx.send(map_payload(response.payload));
                                    }
                                }
                            }
                            Ok(JsonRpcMessage::Notification(n)) => {
                                tracing::debug!(method = %n.method, "ignoring notification");
                            }
                            Ok(JsonRpcMessage::Request(_)) => {}
                            Err(e) => {
                                tracing::debug!(error = %e, raw = %line.trim(), "unparseable frame");
                            }
                        }
                    }
                }
            }
            if let Ok(mut p) = pending_reader.lock() {
                p.clear();
            }
        });

        Self {
            write_tx,
            pending,
            next_id: AtomicI64::new(1),
            alive,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn closed_err() -> EngineError {
        EngineError::network("connection_closed", "transport connection closed")
    }
}

fn map_payload(payload: JsonRpcPayload) -> Result<Value, EngineError> {
    match payload {
        JsonRpcPayload::Success { result } => Ok(result),
        JsonRpcPayload::Error { error } => Err(EngineError::network(
            "rpc_error",
            error.message.clone(),
        )
        .with_context("rpc_code", error.code)),
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, EngineError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Self::closed_err());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(JsonRpcId::Number(id), method, params);
        let line = format!(
            "{}\n",
            serde_json::to_string(&request).map_err(EngineError::wrap)?
        );

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| EngineError::system("internal", "pending map lock poisoned"))?
            .insert(id, tx);

        if self.write_tx.send(line).await.is_err() {
            if let Ok(mut p) = self.pending.lock() {
                p.remove(&id);
            }
            return Err(Self::closed_err());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Self::closed_err()),
            Err(_) => {
                if let Ok(mut p) = self.pending.lock() {
                    p.remove(&id);
                }
                Err(EngineError::network("timeout", "request timed out")
                    .with_context("method", method)
                    .with_context("timeout_ms", self.timeout.as_millis() as i64))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), EngineError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Self::closed_err());
        }
        let notification = JsonRpcNotification::new(method, params);
        let line = format!(
            "{}\n",
            serde_json::to_string(&notification).map_err(EngineError::wrap)?
        );
        self.write_tx
            .send(line)
            .await
            .map_err(|_| Self::closed_err())
    }
}

/// Transport over a spawned child process's stdio.
pub struct StdioTransport {
    inner: StreamTransport,
    // Held so kill_on_drop tears the child down with the transport.
    _child: tokio::process::Child,
}

impl StdioTransport {
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, EngineError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::network("spawn_failed", e.to_string())
                    .with_context("program", program)
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::network("spawn_failed", "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::network("spawn_failed", "child stdout unavailable"))?;
        Ok(Self {
            inner: StreamTransport::new(stdout, stdin),
            _child: child,
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, EngineError> {
        self.inner.request(method, params).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), EngineError> {
        self.inner.notify(method, params).await
    }
}

/// Transport that POSTs one JSON-RPC frame per request.
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
    next_id: AtomicI64,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| EngineError::network("client_init", e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
            next_id: AtomicI64::new(1),
        })
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<Value, EngineError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                EngineError::network("request_failed", e.to_string())
                    .with_context("endpoint", self.endpoint.as_str())
            })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::network("http_error", body)
                .with_context("status", status as i64)
                .with_context("endpoint", self.endpoint.as_str()));
        }
        response
            .json()
            .await
            .map_err(|e| EngineError::network("protocol_error", e.to_string()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(JsonRpcId::Number(id), method, params);
        let body = self.post(&request).await?;
        let message: JsonRpcMessage = serde_json::from_value(body)
            .map_err(|e| EngineError::network("protocol_error", e.to_string()))?;
        match message {
            JsonRpcMessage::Response(response) if response.id == JsonRpcId::Number(id) => {
                map_payload(response.payload)
            }
            _ => Err(EngineError::network(
                "protocol_error",
                "missing response for request id",
            )
            .with_context("id", id)),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), EngineError> {
        let notification = JsonRpcNotification::new(method, params);
        let _ = self.post(&notification).await?;
        Ok(())
    }
}

/// Connects by address scheme: `cmd:<program> [args...]` spawns a stdio
/// peer, `http://`/`https://` targets an HTTP endpoint.
pub fn connect(addr: &str) -> Result<Arc<dyn Transport>, EngineError> {
    if let Some(command) = addr.strip_prefix("cmd:") {
        let mut fields = command.split_whitespace().map(str::to_string);
        let program = fields.next().ok_or_else(|| {
            EngineError::validation("invalid_input", "cmd: missing program")
        })?;
        let args: Vec<String> = fields.collect();
        return Ok(Arc::new(StdioTransport::spawn(&program, &args)?));
    }
    if addr.starts_with("http://") || addr.starts_with("https://") {
        return Ok(Arc::new(HttpTransport::new(addr)?));
    }
    Err(
        EngineError::validation("invalid_input", "unsupported transport address")
            .with_context("addr", addr),
    )
}

/// In-memory session: a client-side transport plus the server-side stream to
/// hand to [`crate::server::McpServer::serve_connection`].
pub fn in_memory_pair() -> (StreamTransport, tokio::io::DuplexStream) {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let (read_half, write_half) = tokio::io::split(client_side);
    (StreamTransport::new(read_half, write_half), server_side)
}
