//! MCP (Model Context Protocol) client: per-server connections and the
//! manager that aggregates them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::jsonrpc::{RpcClient, RpcError, RpcNotification, DEFAULT_REQUEST_TIMEOUT};
use crate::tools::{ToolDescriptor, QUALIFIED_SEPARATOR};
use crate::transport::{SseTransport, StdioTransport, Transport, TransportError};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const MAX_TOOL_PAGES: usize = 64;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpTransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        /// POST endpoint; when absent the server's `endpoint` event decides.
        #[serde(default)]
        message_url: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub transport: McpTransportConfig,
}

impl McpServerConfig {
    pub fn validate(&self) -> Result<(), McpError> {
        if self.id.trim().is_empty() {
            return Err(McpError::InvalidConfig("server id is empty".to_string()));
        }
        if self.id.contains(QUALIFIED_SEPARATOR) {
            return Err(McpError::InvalidConfig(format!(
                "server id '{}' must not contain '{}'",
                self.id, QUALIFIED_SEPARATOR
            )));
        }
        match &self.transport {
            McpTransportConfig::Stdio { command, .. } if command.trim().is_empty() => Err(
                McpError::InvalidConfig(format!("server '{}' has an empty command", self.id)),
            ),
            McpTransportConfig::Sse { url, .. } if url.trim().is_empty() => Err(
                McpError::InvalidConfig(format!("server '{}' has an empty URL", self.id)),
            ),
            _ => Ok(()),
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpEvent {
    StateChanged {
        server_id: String,
        state: ConnectionState,
    },
    ToolsChanged {
        server_id: String,
        count: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP server '{0}' is not connected")]
    NotConnected(String),
    #[error("unknown MCP server '{0}'")]
    UnknownServer(String),
    #[error("invalid MCP server config: {0}")]
    InvalidConfig(String),
    #[error("MCP handshake failed: {0}")]
    Handshake(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeResult {
    #[serde(default)]
    protocol_version: Option<String>,
    #[serde(default)]
    server_info: Option<ServerInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolsPage {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallToolResult {
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    structured_content: Option<Value>,
    #[serde(default)]
    is_error: bool,
}

/// Text output of a remote tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

fn render_content(result: &CallToolResult) -> String {
    let parts: Vec<String> = result
        .content
        .iter()
        .map(|item| match item.get("type").and_then(Value::as_str) {
            Some("text") => item
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Some("image") => format!(
                "[image: {}]",
                item.get("mimeType").and_then(Value::as_str).unwrap_or("unknown")
            ),
            Some("resource") => {
                let resource = item.get("resource");
                match resource.and_then(|r| r.get("text")).and_then(Value::as_str) {
                    Some(text) => text.to_string(),
                    None => format!(
                        "[resource: {}]",
                        resource
                            .and_then(|r| r.get("uri"))
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                    ),
                }
            }
            Some(other) => format!("[{} content]", other),
            None => item.to_string(),
        })
        .collect();

    if parts.is_empty() {
        if let Some(structured) = &result.structured_content {
            return structured.to_string();
        }
    }
    parts.join("\n")
}

/// The connect attempt in progress. `disconnect` bumps the generation so a
/// handshake that finishes afterwards knows it was abandoned.
#[derive(Default)]
struct Attempt {
    generation: u64,
    client: Option<Arc<RpcClient>>,
}

/// One configured MCP server and its live connection, if any.
pub struct McpConnection {
    config: McpServerConfig,
    state: Mutex<ConnectionState>,
    attempt: Mutex<Attempt>,
    client: Mutex<Option<Arc<RpcClient>>>,
    tools: Mutex<Vec<ToolDescriptor>>,
    server_info: Mutex<Option<ServerInfo>>,
    events: mpsc::UnboundedSender<McpEvent>,
    request_timeout: Duration,
}

impl McpConnection {
    pub fn new(
        config: McpServerConfig,
        events: mpsc::UnboundedSender<McpEvent>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            attempt: Mutex::new(Attempt::default()),
            client: Mutex::new(None),
            tools: Mutex::new(Vec::new()),
            server_info: Mutex::new(None),
            events,
            request_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.lock().clone()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.lock().clone()
    }

    fn set_state(&self, state: ConnectionState) {
        {
            let mut current = self.state.lock();
            if *current == state {
                return;
            }
            *current = state.clone();
        }
        log::info!("MCP server '{}': {:?}", self.config.id, state);
        let _ = self.events.send(McpEvent::StateChanged {
            server_id: self.config.id.clone(),
            state,
        });
    }

    fn fail(&self, message: String) {
        if let Some(client) = self.client.lock().take() {
            client.disconnect();
        }
        self.tools.lock().clear();
        self.set_state(ConnectionState::Error(message));
    }

    /// Build the configured transport and run the handshake.
    pub async fn connect(self: &Arc<Self>) -> Result<(), McpError> {
        if let Err(e) = self.config.validate() {
            self.set_state(ConnectionState::Error(e.to_string()));
            return Err(e);
        }
        let generation = self.begin_attempt();

        let transport: Result<Arc<dyn Transport>, TransportError> = match &self.config.transport {
            McpTransportConfig::Stdio { command, args, env } => {
                StdioTransport::spawn(command, args, env).map(|t| Arc::new(t) as Arc<dyn Transport>)
            }
            McpTransportConfig::Sse {
                url,
                message_url,
                headers,
            } => SseTransport::connect(url, message_url.as_deref(), headers)
                .await
                .map(|t| Arc::new(t) as Arc<dyn Transport>),
        };

        match transport {
            Ok(transport) => self.handshake(transport, generation).await,
            Err(_) if !self.is_current(generation) => {
                Err(McpError::NotConnected(self.config.id.clone()))
            }
            Err(e) => {
                log::warn!("MCP server '{}' failed to connect: {}", self.config.id, e);
                self.fail(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Run the handshake over an already-open transport.
    pub async fn connect_with(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<(), McpError> {
        let generation = self.begin_attempt();
        self.handshake(transport, generation).await
    }

    fn begin_attempt(&self) -> u64 {
        self.disconnect();
        let generation = self.attempt.lock().generation;
        self.set_state(ConnectionState::Connecting);
        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.attempt.lock().generation == generation
    }

    async fn handshake(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        generation: u64,
    ) -> Result<(), McpError> {
        let abandoned = || McpError::NotConnected(self.config.id.clone());

        let (note_tx, note_rx) = mpsc::unbounded_channel();
        let client = match RpcClient::with_timeout(transport.clone(), note_tx, self.request_timeout) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                transport.close();
                if !self.is_current(generation) {
                    return Err(abandoned());
                }
                self.fail(e.to_string());
                return Err(e.into());
            }
        };
        {
            let mut attempt = self.attempt.lock();
            if attempt.generation != generation {
                client.disconnect();
                return Err(abandoned());
            }
            attempt.client = Some(client.clone());
        }

        let outcome = Self::initialize(&client).await;

        let mut attempt = self.attempt.lock();
        if attempt.generation != generation {
            drop(attempt);
            log::info!("MCP server '{}' was disconnected during the handshake", self.config.id);
            client.disconnect();
            return Err(abandoned());
        }
        attempt.client = None;

        match outcome {
            Ok((info, tools)) => {
                log::info!(
                    "MCP server '{}' ready ({} tools, server {:?})",
                    self.config.id,
                    tools.len(),
                    info
                );
                *self.server_info.lock() = info;
                let count = tools.len();
                *self.tools.lock() = tools;
                *self.client.lock() = Some(client.clone());
                // Still under the attempt lock so a racing disconnect lands after this.
                self.set_state(ConnectionState::Connected);
                drop(attempt);
                let _ = self.events.send(McpEvent::ToolsChanged {
                    server_id: self.config.id.clone(),
                    count,
                });
                tokio::spawn(Self::watch(Arc::downgrade(self), client, note_rx));
                Ok(())
            }
            Err(e) => {
                drop(attempt);
                log::warn!("MCP server '{}' handshake failed: {}", self.config.id, e);
                client.disconnect();
                self.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn initialize(
        client: &RpcClient,
    ) -> Result<(Option<ServerInfo>, Vec<ToolDescriptor>), McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "Vireo",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = client.call("initialize", Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpError::Handshake(format!("invalid initialize result: {}", e)))?;
        if let Some(version) = &init.protocol_version {
            if version != PROTOCOL_VERSION {
                log::debug!("MCP server negotiated protocol version {}", version);
            }
        }

        client.notify("notifications/initialized", None)?;

        let tools = Self::fetch_tools(client).await?;
        Ok((init.server_info, tools))
    }

    async fn fetch_tools(client: &RpcClient) -> Result<Vec<ToolDescriptor>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = match &cursor {
                Some(cursor) => serde_json::json!({ "cursor": cursor }),
                None => serde_json::json!({}),
            };
            let result = client.call("tools/list", Some(params)).await?;
            let page: ToolsPage = serde_json::from_value(result)
                .map_err(|e| McpError::Handshake(format!("invalid tools/list result: {}", e)))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
        log::warn!("tools/list pagination exceeded {} pages, truncating", MAX_TOOL_PAGES);
        Ok(tools)
    }

    /// Follows server notifications for the life of one client, and notices
    /// when the server goes away on its own.
    async fn watch(
        this: Weak<Self>,
        client: Arc<RpcClient>,
        mut notifications: mpsc::UnboundedReceiver<RpcNotification>,
    ) {
        while let Some(note) = notifications.recv().await {
            let Some(conn) = this.upgrade() else {
                return;
            };
            match note.method.as_str() {
                "notifications/tools/list_changed" => match Self::fetch_tools(&client).await {
                    Ok(tools) => {
                        let count = tools.len();
                        *conn.tools.lock() = tools;
                        let _ = conn.events.send(McpEvent::ToolsChanged {
                            server_id: conn.config.id.clone(),
                            count,
                        });
                    }
                    Err(e) => log::warn!("Failed to refresh tools for '{}': {}", conn.config.id, e),
                },
                other => log::debug!("MCP notification from '{}': {}", conn.config.id, other),
            }
        }

        // The receive loop ended. If nobody asked for that, report it.
        let Some(conn) = this.upgrade() else {
            return;
        };
        let still_current = conn
            .client
            .lock()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &client));
        if still_current {
            log::warn!("MCP server '{}' closed the connection", conn.config.id);
            conn.fail("server closed the connection".to_string());
        }
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, McpError> {
        let client = self
            .client
            .lock()
            .clone()
            .ok_or_else(|| McpError::NotConnected(self.config.id.clone()))?;

        let result = client
            .call(
                "tools/call",
                Some(serde_json::json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        let parsed: CallToolResult = serde_json::from_value(result)
            .map_err(|e| RpcError::Malformed(format!("invalid tools/call result: {}", e)))?;
        Ok(ToolOutput {
            content: render_content(&parsed),
            is_error: parsed.is_error,
        })
    }

    /// Tear down the transport and fail every in-flight call, including a
    /// handshake still in progress. Idempotent.
    pub fn disconnect(&self) {
        let handshaking = {
            let mut attempt = self.attempt.lock();
            attempt.generation += 1;
            attempt.client.take()
        };
        if let Some(client) = handshaking {
            client.disconnect();
        }
        let client = self.client.lock().take();
        if let Some(client) = client {
            client.disconnect();
        }
        self.tools.lock().clear();
        if !matches!(self.state(), ConnectionState::Error(_)) {
            self.set_state(ConnectionState::Disconnected);
        }
    }
}

/// All configured MCP servers, keyed by server id.
pub struct McpManager {
    connections: RwLock<HashMap<String, Arc<McpConnection>>>,
    events: mpsc::UnboundedSender<McpEvent>,
    request_timeout: Duration,
}

impl McpManager {
    pub fn new(events: mpsc::UnboundedSender<McpEvent>) -> Self {
        Self::with_request_timeout(events, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_request_timeout(events: mpsc::UnboundedSender<McpEvent>, request_timeout: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            events,
            request_timeout,
        }
    }

    /// Register (or replace) a server without connecting it.
    pub fn add(&self, config: McpServerConfig) -> Arc<McpConnection> {
        let conn = Arc::new(McpConnection::new(
            config.clone(),
            self.events.clone(),
            self.request_timeout,
        ));
        let previous = self.connections.write().insert(config.id.clone(), conn.clone());
        if let Some(previous) = previous {
            previous.disconnect();
        }
        conn
    }

    pub fn remove(&self, server_id: &str) -> bool {
        let removed = self.connections.write().remove(server_id);
        match removed {
            Some(conn) => {
                conn.disconnect();
                true
            }
            None => false,
        }
    }

    pub fn connection(&self, server_id: &str) -> Option<Arc<McpConnection>> {
        self.connections.read().get(server_id).cloned()
    }

    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn states(&self) -> Vec<(String, ConnectionState)> {
        self.server_ids()
            .into_iter()
            .filter_map(|id| self.connection(&id).map(|c| (id, c.state())))
            .collect()
    }

    /// Make the registry match `configs`: drop servers that disappeared or
    /// were disabled, replace changed ones, then connect everything enabled
    /// that is not already connected.
    pub async fn sync(&self, configs: &[McpServerConfig]) {
        let wanted: HashMap<&str, &McpServerConfig> = configs
            .iter()
            .filter(|c| c.enabled)
            .map(|c| (c.id.as_str(), c))
            .collect();

        for id in self.server_ids() {
            if !wanted.contains_key(id.as_str()) {
                log::info!("MCP server '{}' removed from config", id);
                self.remove(&id);
            }
        }
        for config in wanted.values() {
            let unchanged = self
                .connection(&config.id)
                .is_some_and(|c| c.config() == *config);
            if !unchanged {
                self.add((*config).clone());
            }
        }
        self.connect_all().await;
    }

    pub async fn connect(&self, server_id: &str) -> Result<(), McpError> {
        let conn = self
            .connection(server_id)
            .ok_or_else(|| McpError::UnknownServer(server_id.to_string()))?;
        conn.connect().await
    }

    /// Connect every server that is not connected yet, concurrently. Failures
    /// only affect their own server's state.
    pub async fn connect_all(&self) {
        let pending: Vec<Arc<McpConnection>> = self
            .connections
            .read()
            .values()
            .filter(|c| c.state() != ConnectionState::Connected && c.config().enabled)
            .cloned()
            .collect();

        let handles: Vec<_> = pending
            .into_iter()
            .map(|conn| tokio::spawn(async move { conn.connect().await }))
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("MCP connect task panicked: {}", e);
            }
        }
    }

    /// Register `config` and handshake over a caller-provided transport.
    pub async fn attach(
        &self,
        config: McpServerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(), McpError> {
        config.validate()?;
        let conn = self.add(config);
        conn.connect_with(transport).await
    }

    pub fn disconnect_all(&self) {
        let conns: Vec<Arc<McpConnection>> = self.connections.read().values().cloned().collect();
        for conn in conns {
            conn.disconnect();
        }
    }

    /// Every tool of every connected server, with its server id, ordered by
    /// server id.
    pub fn tools(&self) -> Vec<(String, ToolDescriptor)> {
        let mut out = Vec::new();
        for id in self.server_ids() {
            let Some(conn) = self.connection(&id) else {
                continue;
            };
            if conn.state() != ConnectionState::Connected {
                continue;
            }
            out.extend(conn.tools().into_iter().map(|tool| (id.clone(), tool)));
        }
        out
    }

    pub async fn call(
        &self,
        server_id: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolOutput, McpError> {
        let conn = self
            .connection(server_id)
            .ok_or_else(|| McpError::UnknownServer(server_id.to_string()))?;
        conn.call_tool(tool, arguments).await
    }
}

impl Drop for McpManager {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}
