// Protocol client: drives one agent subprocess over line-delimited JSON-RPC
//
// The agent is spawned with piped stdio. One reader task owns stdout and
// routes every decoded line: responses complete pending requests, agent
// requests get answered inline, notifications fan out to registered
// handlers. stderr is drained to the log so a chatty agent cannot block.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::acp::message::{Envelope, OutgoingRequest, OutgoingResponse};
use crate::error::{ForemanError, Result};

pub const PROTOCOL_VERSION: u64 = 1;

type NotificationHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Lifecycle and adjudication events, observable via `take_events`.
#[derive(Debug)]
pub enum ClientEvent {
    /// The agent process is up and the handshake begins.
    Connected,
    /// The agent is gone, either by our disconnect or on its own.
    Disconnected { reason: String },
    /// One line of the agent's stderr.
    Stderr(String),
    /// A permission request awaiting `send_permission_response`. Only
    /// emitted in manual mode with an event listener attached.
    PermissionRequested { id: Value, params: Value },
}

#[derive(Debug, Clone)]
pub struct ProtocolClientConfig {
    pub binary: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub request_timeout_ms: u64,
    /// How long disconnect waits for the agent to exit after stdin closes
    /// before killing it.
    pub shutdown_grace_ms: u64,
    /// When true, agent permission requests are granted with the first
    /// allow option; when false they are declined.
    pub auto_approve_permissions: bool,
}

impl Default for ProtocolClientConfig {
    fn default() -> Self {
        Self {
            binary: String::new(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            request_timeout_ms: 120_000,
            shutdown_grace_ms: 5_000,
            auto_approve_permissions: true,
        }
    }
}

struct Shared {
    connected: AtomicBool,
    next_id: AtomicU64,
    pending: StdMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    handlers: StdMutex<HashMap<String, Vec<(u64, NotificationHandler)>>>,
    next_handler_token: AtomicU64,
    stdin: Mutex<Option<ChildStdin>>,
    auto_approve_permissions: bool,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    /// Whether anyone took the event receiver. Permission requests are only
    /// forwarded when someone is there to answer them.
    events_taken: AtomicBool,
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }

    fn reject_all_pending(&self, make_error: impl Fn() -> ForemanError) {
        let drained: Vec<(u64, oneshot::Sender<Result<Value>>)> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().collect()
        };
        for (id, sender) in drained {
            log::debug!("[Protocol] Rejecting pending request {}", id);
            let _ = sender.send(Err(make_error()));
        }
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ForemanError::NotConnected)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

pub struct ProtocolClient {
    config: ProtocolClientConfig,
    shared: Arc<Shared>,
    child: Arc<Mutex<Option<Child>>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
}

impl ProtocolClient {
    pub fn new(config: ProtocolClientConfig) -> Self {
        let auto_approve = config.auto_approve_permissions;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                pending: StdMutex::new(HashMap::new()),
                handlers: StdMutex::new(HashMap::new()),
                next_handler_token: AtomicU64::new(1),
                stdin: Mutex::new(None),
                auto_approve_permissions: auto_approve,
                events_tx,
                events_taken: AtomicBool::new(false),
            }),
            child: Arc::new(Mutex::new(None)),
            reader_task: StdMutex::new(None),
            events_rx: StdMutex::new(Some(events_rx)),
        }
    }

    /// Take the lifecycle event stream. Can be taken once; afterwards the
    /// client forwards permission requests here instead of answering them
    /// itself (in manual mode).
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        let rx = self
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if rx.is_some() {
            self.shared.events_taken.store(true, Ordering::SeqCst);
        }
        rx
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a response. Visible for diagnostics.
    pub fn pending_count(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Spawn the agent process and start the reader task.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        log::info!(
            "[Protocol] Spawning agent: {} {}",
            self.config.binary,
            self.config.args.join(" ")
        );

        let mut command = Command::new(&self.config.binary);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| ForemanError::Spawn {
            binary: self.config.binary.clone(),
            reason: e.to_string(),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| ForemanError::Spawn {
            binary: self.config.binary.clone(),
            reason: "stdout not captured".to_string(),
        })?;
        let stderr = child.stderr.take();
        let stdin = child.stdin.take().ok_or_else(|| ForemanError::Spawn {
            binary: self.config.binary.clone(),
            reason: "stdin not captured".to_string(),
        })?;

        *self.shared.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        self.shared.connected.store(true, Ordering::SeqCst);

        if let Some(stderr) = stderr {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("[Agent stderr] {}", line);
                    shared.emit(ClientEvent::Stderr(line));
                }
            });
        }

        let shared = Arc::clone(&self.shared);
        let child_slot = Arc::clone(&self.child);
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(envelope) = Envelope::decode(&line) {
                    dispatch(&shared, envelope).await;
                }
            }

            // Stdout closed: the agent exited or was killed. Anything still
            // pending will never be answered.
            let was_connected = shared.connected.swap(false, Ordering::SeqCst);
            let code = {
                let mut guard = child_slot.lock().await;
                match guard.as_mut() {
                    Some(child) => child.wait().await.ok().and_then(|s| s.code()),
                    None => None,
                }
            };
            log::info!("[Protocol] Agent exited with code {:?}", code);
            if was_connected {
                shared.emit(ClientEvent::Disconnected {
                    reason: match code {
                        Some(c) => format!("agent exited with code {}", c),
                        None => "agent exited".to_string(),
                    },
                });
            }
            shared.reject_all_pending(|| ForemanError::AgentExited { code });
        });
        *self
            .reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);

        self.shared.emit(ClientEvent::Connected);

        // The connection is only usable once the handshake succeeds; a
        // client that cannot initialize is torn back down.
        if let Err(e) = self.handshake().await {
            log::error!("[Protocol] Handshake failed: {}", e);
            let _ = self.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    /// Send a request and wait for its response. A request made while
    /// disconnected is rejected immediately; a request that outlives the
    /// timeout is abandoned and its pending entry removed.
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if !self.is_connected() {
            return Err(ForemanError::NotConnected);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .shared
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            pending.insert(id, tx);
        }

        let request = OutgoingRequest::new(id, method, params);
        let encoded = serde_json::to_string(&request)?;
        if let Err(e) = self.shared.write_line(&encoded).await {
            self.remove_pending(id);
            return Err(e);
        }

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ForemanError::NotConnected),
            Err(_) => {
                self.remove_pending(id);
                Err(ForemanError::RequestTimeout {
                    method: method.to_string(),
                    timeout_ms: self.config.request_timeout_ms,
                })
            }
        }
    }

    /// Register a handler for a notification method. Returns a token for
    /// later removal. Handlers run on the reader task; they must not block.
    pub fn on_notification(
        &self,
        method: impl Into<String>,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> u64 {
        let token = self.shared.next_handler_token.fetch_add(1, Ordering::SeqCst);
        let mut handlers = self
            .shared
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        handlers
            .entry(method.into())
            .or_default()
            .push((token, Arc::new(handler)));
        token
    }

    pub fn remove_notification_handler(&self, token: u64) {
        let mut handlers = self
            .shared
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for list in handlers.values_mut() {
            list.retain(|(t, _)| *t != token);
        }
        handlers.retain(|_, list| !list.is_empty());
    }

    /// Protocol handshake, run as the final step of `connect`.
    async fn handshake(&self) -> Result<Value> {
        self.send_request(
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION")
                },
                "clientCapabilities": {
                    "fs": { "readTextFile": true, "writeTextFile": true }
                }
            })),
        )
        .await
    }

    /// Create a session rooted at the given directory. Returns the session id.
    pub async fn new_session(&self, cwd: &str) -> Result<String> {
        let result = self
            .send_request(
                "session/new",
                Some(json!({ "cwd": cwd, "mcpServers": [] })),
            )
            .await?;
        result
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ForemanError::Protocol {
                code: -32603,
                message: "session/new response missing sessionId".to_string(),
            })
    }

    /// Send a user prompt into a session and wait for the turn to end.
    pub async fn prompt(&self, session_id: &str, text: &str) -> Result<Value> {
        self.send_request(
            "session/prompt",
            Some(json!({
                "sessionId": session_id,
                "prompt": [{ "type": "text", "text": text }]
            })),
        )
        .await
    }

    /// Graceful shutdown: reject everything pending, close stdin to signal
    /// the agent, give it the grace period, then kill.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.shared.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("[Protocol] Disconnecting agent");
        self.shared.emit(ClientEvent::Disconnected {
            reason: "client disconnect".to_string(),
        });

        self.shared
            .reject_all_pending(|| ForemanError::Disconnecting);

        // Dropping stdin sends EOF, the agent's cue to exit.
        *self.shared.stdin.lock().await = None;

        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    log::info!("[Protocol] Agent exited: {:?}", status.code());
                }
                Ok(Err(e)) => {
                    log::warn!("[Protocol] Wait failed: {}", e);
                }
                Err(_) => {
                    log::warn!("[Protocol] Agent ignored shutdown, killing");
                    let _ = child.kill().await;
                }
            }
        }
        *guard = None;
        drop(guard);

        let handle = self
            .reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        Ok(())
    }

    /// Answer a forwarded `PermissionRequested` event. `Some(option_id)`
    /// selects that option; `None` cancels the request.
    pub async fn send_permission_response(&self, id: Value, option: Option<&str>) -> Result<()> {
        let response = match option {
            Some(option_id) => OutgoingResponse::success(
                id,
                json!({ "outcome": { "outcome": "selected", "optionId": option_id } }),
            ),
            None => OutgoingResponse::success(id, json!({ "outcome": { "outcome": "cancelled" } })),
        };
        let encoded = serde_json::to_string(&response)?;
        self.shared.write_line(&encoded).await
    }

    fn remove_pending(&self, id: u64) {
        let mut pending = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        pending.remove(&id);
    }
}

async fn dispatch(shared: &Arc<Shared>, envelope: Envelope) {
    match envelope {
        Envelope::Response { id, result, error } => {
            let sender = {
                let mut pending = shared.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.remove(&id)
            };
            let Some(sender) = sender else {
                // Timed out or never ours; drop it.
                log::debug!("[Protocol] Response for unknown request {}", id);
                return;
            };
            let outcome = match error {
                Some(error) => Err(ForemanError::Protocol {
                    code: error.code,
                    message: error.message,
                }),
                None => Ok(result.unwrap_or(Value::Null)),
            };
            let _ = sender.send(outcome);
        }
        Envelope::ServerRequest { id, method, params } => {
            // In manual mode, permission requests are forwarded to whoever
            // took the event stream; the answer comes back through
            // `send_permission_response`. Without a listener, declining is
            // the only safe answer.
            if method == "session/request_permission"
                && !shared.auto_approve_permissions
                && shared.events_taken.load(Ordering::SeqCst)
            {
                log::info!("[Protocol] Forwarding permission request for adjudication");
                shared.emit(ClientEvent::PermissionRequested { id, params });
                return;
            }
            let response = answer_server_request(shared, id, &method, &params);
            match serde_json::to_string(&response) {
                Ok(encoded) => {
                    if let Err(e) = shared.write_line(&encoded).await {
                        log::warn!("[Protocol] Failed to answer '{}': {}", method, e);
                    }
                }
                Err(e) => log::warn!("[Protocol] Failed to encode response: {}", e),
            }
        }
        Envelope::Notification { method, params } => {
            let handlers: Vec<NotificationHandler> = {
                let map = shared.handlers.lock().unwrap_or_else(|e| e.into_inner());
                map.get(&method)
                    .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                    .unwrap_or_default()
            };
            for handler in handlers {
                // A panicking handler must not take the reader task down.
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    handler(&params)
                }));
                if result.is_err() {
                    log::error!("[Protocol] Notification handler for '{}' panicked", method);
                }
            }
        }
    }
}

fn answer_server_request(shared: &Shared, id: Value, method: &str, params: &Value) -> OutgoingResponse {
    match method {
        "session/request_permission" => {
            if shared.auto_approve_permissions {
                let option_id = pick_allow_option(params);
                log::info!(
                    "[Protocol] Auto-approving permission request (option {:?})",
                    option_id
                );
                OutgoingResponse::success(
                    id,
                    json!({
                        "outcome": {
                            "outcome": "selected",
                            "optionId": option_id.unwrap_or_else(|| "allow".to_string()),
                        }
                    }),
                )
            } else {
                log::info!("[Protocol] Declining permission request (manual mode)");
                OutgoingResponse::success(id, json!({ "outcome": { "outcome": "cancelled" } }))
            }
        }
        other => {
            log::warn!("[Protocol] Unsupported agent request: {}", other);
            OutgoingResponse::failure(id, -32601, format!("unsupported method: {}", other))
        }
    }
}

/// First option the agent marked as an allow kind, if any.
fn pick_allow_option(params: &Value) -> Option<String> {
    let options = params.get("options")?.as_array()?;
    options
        .iter()
        .find(|o| {
            o.get("kind")
                .and_then(|k| k.as_str())
                .map(|k| k.starts_with("allow"))
                .unwrap_or(false)
        })
        .or_else(|| options.first())
        .and_then(|o| o.get("optionId"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
