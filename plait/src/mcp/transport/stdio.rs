//! Stdio transport: spawn the server process and speak newline-delimited
//! JSON-RPC over its pipes.
//!
//! A reader task demultiplexes responses by `id` into per-request oneshot
//! channels and publishes notifications; a writer task owns stdin so requests,
//! notifications and the reader's own replies (`roots/list`) share one sink.
//! EOF or process exit fails every pending request with a connection error.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};
use tracing::{debug, warn};

use crate::error::McpError;
use crate::mcp::jsonrpc::{
    JsonRpcMessage, NotificationMessage, RequestMessage, ResultMessage,
};

/// Environment variables forwarded to every spawned server by default; spec
/// `env` entries are layered on top. Provider API keys are deliberately not in
/// this list.
const DEFAULT_ENV_KEYS: [&str; 10] = [
    "HOME", "PATH", "SHELL", "USER", "LOGNAME", "TERM", "LANG", "LC_ALL", "TMPDIR", "XDG_DATA_HOME",
];

fn default_environment() -> HashMap<String, String> {
    DEFAULT_ENV_KEYS
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect()
}

type PendingMap = Arc<DashMap<String, oneshot::Sender<ResultMessage>>>;

/// Duplex channel to one stdio MCP server.
pub struct StdioTransport {
    outgoing: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    notifications: std::sync::Mutex<Option<mpsc::UnboundedReceiver<NotificationMessage>>>,
    child: TokioMutex<Option<Child>>,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
}

impl StdioTransport {
    /// Spawns the server process with the sanitized argv and opens the channel.
    ///
    /// The child inherits a minimal default environment plus the explicit
    /// `env` entries. When `stderr_verbose` is false the child's stderr is
    /// discarded for quiet UX; when true it is inherited.
    pub fn spawn(
        argv: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&std::path::Path>,
        stderr_verbose: bool,
    ) -> Result<Self, McpError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| McpError::config("empty argv for stdio transport"))?;

        let mut merged_env = default_environment();
        merged_env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(merged_env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if stderr_verbose {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            McpError::connection(format!("failed to spawn '{}': {}", program, e))
                .with_context("transport_type", "stdio")
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::connection("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::connection("child stdout unavailable"))?;

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let (notif_tx, notif_rx) = mpsc::unbounded_channel::<NotificationMessage>();
        let pending: PendingMap = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        // Writer task: sole owner of the child's stdin.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = outgoing_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader task: demultiplex responses by id, publish notifications,
        // answer server-initiated roots/list with empty roots.
        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);
        let reader_outgoing = outgoing_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match JsonRpcMessage::parse(&line) {
                            Ok(JsonRpcMessage::Result(result)) => {
                                let key = result.id.to_string();
                                if let Some((_, tx)) = reader_pending.remove(&key) {
                                    let _ = tx.send(result);
                                } else {
                                    debug!(id = %key, "response without pending request");
                                }
                            }
                            Ok(JsonRpcMessage::Request(req)) if req.method == "roots/list" => {
                                let reply =
                                    ResultMessage::success(req.id, json!({ "roots": [] }));
                                let _ = reader_outgoing.send(reply.to_wire().to_string());
                            }
                            Ok(JsonRpcMessage::Request(req)) => {
                                debug!(method = %req.method, "ignoring server-initiated request");
                            }
                            Ok(JsonRpcMessage::Notification(n)) => {
                                let _ = notif_tx.send(n);
                            }
                            Err(e) => warn!(error = %e, "unparseable frame from server"),
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            // Process lost: fail everything still in flight.
            reader_closed.store(true, Ordering::SeqCst);
            for entry in reader_pending.iter().map(|e| e.key().clone()).collect::<Vec<_>>() {
                if let Some((_, tx)) = reader_pending.remove(&entry) {
                    drop(tx);
                }
            }
        });

        Ok(Self {
            outgoing: outgoing_tx,
            pending,
            notifications: std::sync::Mutex::new(Some(notif_rx)),
            child: TokioMutex::new(Some(child)),
            closed,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Takes the notification stream; callable once.
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<NotificationMessage>> {
        self.notifications.lock().ok().and_then(|mut g| g.take())
    }

    /// Sends one request and awaits its response within the deadline.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<ResultMessage, McpError> {
        if self.is_closed() {
            return Err(McpError::connection("stdio transport closed"));
        }
        let id = format!("plait-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let request = RequestMessage::new(id.as_str(), method, params);
        let line = serde_json::to_string(&request)
            .map_err(|e| McpError::connection(format!("serialize request: {}", e)))?;
        if self.outgoing.send(line).is_err() {
            self.pending.remove(&id);
            return Err(McpError::connection("stdio transport closed"));
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(McpError::connection(
                "connection lost while waiting for response",
            )),
            Err(_) => {
                self.pending.remove(&id);
                Err(McpError::timeout(method, deadline))
            }
        }
    }

    /// Fire-and-forget notification.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(McpError::connection("stdio transport closed"));
        }
        let notification = NotificationMessage::new(method, params);
        let line = serde_json::to_string(&notification)
            .map_err(|e| McpError::connection(format!("serialize notification: {}", e)))?;
        self.outgoing
            .send(line)
            .map_err(|_| McpError::connection("stdio transport closed"))
    }

    /// Idempotent release: kills the child and fails pending requests.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.pending.remove(&key);
        }
    }
}
