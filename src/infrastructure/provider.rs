use crate::application::catalog::qualified_id;
use crate::application::dispatch::{RemoteError, RemoteInvoker};
use crate::config::ProviderConfig;
use crate::types::{ProviderRef, ToolDescriptor};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to spawn provider '{provider}': {source}")]
    Spawn {
        provider: String,
        #[source]
        source: std::io::Error,
    },
    #[error("provider '{provider}' transport error: {message}")]
    Transport { provider: String, message: String },
    #[error("provider '{provider}' sent invalid JSON: {source}")]
    InvalidJson {
        provider: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("provider '{provider}' returned error {code}: {message}")]
    Rpc {
        provider: String,
        code: i64,
        message: String,
    },
    #[error("provider '{provider}' terminated unexpectedly")]
    Terminated { provider: String },
    #[error("provider '{provider}' request timed out")]
    Timeout { provider: String },
    #[error("provider '{provider}' is not connected")]
    NotConnected { provider: String },
}

/// Long-lived connection to one remote capability provider: a child process
/// spoken to over line-delimited JSON-RPC on stdio. Shared across
/// conversations.
#[derive(Clone)]
pub struct ProviderLink {
    inner: Arc<LinkInner>,
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, ProviderError>>>;

struct LinkInner {
    config: ProviderConfig,
    child: AsyncMutex<Option<Child>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: Mutex<PendingMap>,
    id_counter: AtomicU64,
    request_timeout: Duration,
}

/// Removes a pending request entry when the request future completes or is
/// dropped, so an abandoned call never leaves its sender in the map.
struct PendingGuard<'a> {
    pending: &'a Mutex<PendingMap>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

impl ProviderLink {
    pub fn new(config: ProviderConfig, request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                config,
                child: AsyncMutex::new(None),
                writer: AsyncMutex::new(None),
                pending: Mutex::new(HashMap::new()),
                id_counter: AtomicU64::new(1),
                request_timeout,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Spawn the provider process and run the initialize handshake.
    pub async fn connect(&self) -> Result<(), ProviderError> {
        self.inner.connect().await
    }

    /// Fetch the provider's tool list, namespaced with the provider name so
    /// tools from different providers never collide in the catalog.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ProviderError> {
        let result = self.inner.request("tools/list", json!({})).await?;
        let provider = self.name();
        let mut descriptors = Vec::new();
        if let Some(tools) = result.get("tools").and_then(Value::as_array) {
            for tool in tools {
                let Some(name) = tool.get("name").and_then(Value::as_str) else {
                    continue;
                };
                descriptors.push(ToolDescriptor {
                    id: qualified_id(provider, name),
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: tool.get("inputSchema").cloned().unwrap_or(Value::Null),
                    examples: Vec::new(),
                    eager: false,
                    provider: ProviderRef::Remote(provider.to_string()),
                });
            }
        }
        info!(provider, tools = descriptors.len(), "Listed provider tools");
        Ok(descriptors)
    }

    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ProviderError> {
        let params = json!({
            "name": tool,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            }
        });
        self.inner.request("tools/call", params).await
    }

    /// Kill the provider process and fail any in-flight requests. Safe to
    /// call on an already-disconnected link.
    pub async fn disconnect(&self) {
        self.inner.teardown().await;
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }
}

impl LinkInner {
    async fn connect(self: &Arc<Self>) -> Result<(), ProviderError> {
        {
            let child = self.child.lock().await;
            if child.is_some() {
                return Ok(());
            }
        }

        let mut command = Command::new(&self.config.command);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.config.workdir {
            command.current_dir(dir);
        }
        if !self.config.args.is_empty() {
            command.args(&self.config.args);
        }
        for (key, value) in &self.config.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ProviderError::Spawn {
            provider: self.config.name.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.transport_error("failed to capture provider stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.transport_error("failed to capture provider stdout"))?;

        {
            let mut writer = self.writer.lock().await;
            *writer = Some(BufWriter::new(stdin));
        }
        {
            let mut slot = self.child.lock().await;
            *slot = Some(child);
        }

        let reader = Arc::clone(self);
        tokio::spawn(async move {
            reader.reader_loop(stdout).await;
        });

        match self.handshake().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.teardown().await;
                Err(err)
            }
        }
    }

    async fn handshake(self: &Arc<Self>) -> Result<(), ProviderError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        self.request("initialize", params).await?;
        self.notify("notifications/initialized", json!({})).await?;
        Ok(())
    }

    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(item) = lines.next_line().await {
            let Some(raw) = item else { break };
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(message) => self.route_inbound(message).await,
                Err(source) => {
                    warn!(
                        provider = %self.config.name,
                        line = trimmed,
                        %source,
                        "Ignoring non-JSON line from provider"
                    );
                }
            }
        }
        self.teardown().await;
    }

    async fn route_inbound(&self, message: Value) {
        let id = message.get("id").and_then(Value::as_u64);
        let is_request = message.get("method").is_some();
        match (id, is_request) {
            (Some(id), false) => self.resolve_pending(id, message).await,
            (Some(id), true) => {
                let method = message
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if method == "ping" {
                    let _ = self.write(&json!({ "jsonrpc": "2.0", "id": id, "result": {} })).await;
                } else {
                    warn!(provider = %self.config.name, method, "Provider sent unsupported request");
                    let error = json!({
                        "code": -32601,
                        "message": format!("client does not implement method '{method}'"),
                    });
                    let _ = self
                        .write(&json!({ "jsonrpc": "2.0", "id": id, "error": error }))
                        .await;
                }
            }
            (None, true) => {
                let method = message
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                debug!(provider = %self.config.name, method, "Provider notification");
            }
            (None, false) => {}
        }
    }

    async fn resolve_pending(&self, id: u64, message: Value) {
        let sender = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&id),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            debug!(provider = %self.config.name, id, "Response for unknown request");
            return;
        };

        let outcome = if let Some(error) = message.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32000);
            let text = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            Err(ProviderError::Rpc {
                provider: self.config.name.clone(),
                code,
                message: text,
            })
        } else {
            Ok(message.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = sender.send(outcome);
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        {
            let child = self.child.lock().await;
            if child.is_none() {
                return Err(ProviderError::NotConnected {
                    provider: self.config.name.clone(),
                });
            }
        }

        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        self.write(&payload).await?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProviderError::Terminated {
                provider: self.config.name.clone(),
            }),
            Err(_) => Err(ProviderError::Timeout {
                provider: self.config.name.clone(),
            }),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), ProviderError> {
        self.write(&json!({ "jsonrpc": "2.0", "method": method, "params": params }))
            .await
    }

    async fn write(&self, message: &Value) -> Result<(), ProviderError> {
        let encoded = serde_json::to_string(message).map_err(|source| ProviderError::InvalidJson {
            provider: self.config.name.clone(),
            source,
        })?;

        let mut writer = self.writer.lock().await;
        let stream = writer
            .as_mut()
            .ok_or_else(|| self.transport_error("writer not initialised"))?;
        for chunk in [encoded.as_bytes(), b"\n"] {
            stream
                .write_all(chunk)
                .await
                .map_err(|source| self.transport_error(source.to_string()))?;
        }
        stream
            .flush()
            .await
            .map_err(|source| self.transport_error(source.to_string()))?;
        Ok(())
    }

    async fn teardown(&self) {
        {
            let mut writer = self.writer.lock().await;
            *writer = None;
        }
        {
            let mut slot = self.child.lock().await;
            if let Some(mut child) = slot.take() {
                if let Err(err) = child.kill().await {
                    debug!(
                        provider = %self.config.name,
                        %err,
                        "Failed to kill provider process (may have already exited)"
                    );
                }
                let _ = child.wait().await;
            }
        }

        if let Ok(mut pending) = self.pending.lock() {
            for (_, sender) in pending.drain() {
                let _ = sender.send(Err(ProviderError::Terminated {
                    provider: self.config.name.clone(),
                }));
            }
        }
    }

    fn transport_error(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::Transport {
            provider: self.config.name.clone(),
            message: message.into(),
        }
    }
}

/// All connected providers plus the tool descriptors they contributed.
pub struct ProviderPool {
    links: HashMap<String, ProviderLink>,
}

impl ProviderPool {
    /// Connect every configured provider with bounded retry and backoff.
    /// A provider that never comes up is skipped with a warning: its tools
    /// are simply absent from the catalog rather than failing the session.
    pub async fn connect_all(
        configs: Vec<ProviderConfig>,
        request_timeout: Duration,
    ) -> (Self, Vec<ToolDescriptor>) {
        let mut links = HashMap::new();
        let mut descriptors = Vec::new();

        for config in configs {
            let link = ProviderLink::new(config, request_timeout);
            match bring_up(&link).await {
                Ok(tools) => {
                    info!(provider = %link.name(), tools = tools.len(), "Provider connected");
                    descriptors.extend(tools);
                    links.insert(link.name().to_string(), link);
                }
                Err(err) => {
                    warn!(
                        provider = %link.name(),
                        %err,
                        "Provider failed to connect; its tools will not be registered"
                    );
                }
            }
        }

        (Self { links }, descriptors)
    }

    pub async fn shutdown(&self) {
        for link in self.links.values() {
            link.disconnect().await;
        }
    }
}

async fn bring_up(link: &ProviderLink) -> Result<Vec<ToolDescriptor>, ProviderError> {
    let mut backoff = CONNECT_BACKOFF;
    let mut last_err = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match link.connect().await {
            Ok(()) => return link.list_tools().await,
            Err(err) => {
                debug!(provider = %link.name(), attempt, %err, "Provider connect attempt failed");
                last_err = Some(err);
                if attempt < CONNECT_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ProviderError::NotConnected {
        provider: link.name().to_string(),
    }))
}

#[async_trait]
impl RemoteInvoker for ProviderPool {
    async fn invoke_tool(
        &self,
        provider: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, RemoteError> {
        let Some(link) = self.links.get(provider) else {
            return Err(RemoteError::Unavailable {
                provider: provider.to_string(),
                message: format!("provider '{provider}' is not connected"),
            });
        };

        match link.call_tool(tool, arguments).await {
            Ok(result) => {
                let is_error = result
                    .get("isError")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if is_error {
                    Err(RemoteError::Rejected {
                        provider: provider.to_string(),
                        message: extract_text(&result)
                            .unwrap_or_else(|| "provider reported a tool error".to_string()),
                    })
                } else {
                    Ok(result)
                }
            }
            Err(err @ ProviderError::Rpc { .. }) => Err(RemoteError::Rejected {
                provider: provider.to_string(),
                message: err.to_string(),
            }),
            Err(err) => Err(RemoteError::Unavailable {
                provider: provider.to_string(),
                message: err.to_string(),
            }),
        }
    }
}

fn extract_text(result: &Value) -> Option<String> {
    let blocks = result.get("content").and_then(Value::as_array)?;
    for block in blocks {
        let is_text = block
            .get("type")
            .and_then(Value::as_str)
            .map(|kind| kind.eq_ignore_ascii_case("text"))
            .unwrap_or(false);
        if is_text {
            if let Some(text) = block.get("text").and_then(Value::as_str) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
    }
    None
}
