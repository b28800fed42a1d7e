//! Tool catalog and dispatcher: browser-native tools plus every tool of
//! every connected MCP server, behind one `dispatch` entry point.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::deadline::{self, Interrupted};
use crate::jsonrpc::DEFAULT_REQUEST_TIMEOUT;
use crate::mcp::McpManager;

/// Separates server id and tool name in a remote tool's qualified name.
pub const QUALIFIED_SEPARATOR: char = '.';

pub const NATIVE_TOOL_TIMEOUT: Duration = Duration::from_secs(15);

const DEFAULT_READ_PAGE_CHARS: usize = 20_000;

const READ_PAGE_SCRIPT: &str = "document.body ? document.body.innerText : ''";

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(tool_call_id: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_call_id: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            content: content.into(),
            is_error: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Native browser tools
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserTool {
    ListTabs,
    OpenTab,
    CloseTab,
    SwitchTab,
    Navigate,
    ReadPage,
    RunScript,
    SplitTabs,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ListTabsArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
struct OpenTabArgs {
    /// Address to load in the new tab.
    url: String,
    /// Open without switching to the new tab.
    #[serde(default)]
    background: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct TabArgs {
    /// Id of the tab, as reported by list_tabs.
    tab_id: u64,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct NavigateArgs {
    url: String,
    /// Tab to navigate; the focused tab when omitted.
    #[serde(default)]
    tab_id: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReadPageArgs {
    /// Tab to read; the focused tab when omitted.
    #[serde(default)]
    tab_id: Option<u64>,
    /// Truncate the text to this many characters.
    #[serde(default)]
    max_chars: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RunScriptArgs {
    /// JavaScript source. The value of the last expression is returned.
    script: String,
    #[serde(default)]
    tab_id: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SplitTabsArgs {
    left_tab_id: u64,
    right_tab_id: u64,
}

fn schema_of<T: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| empty_object_schema());
    if let Some(map) = schema.as_object_mut() {
        map.remove("$schema");
        map.remove("title");
        map.entry("properties")
            .or_insert_with(|| Value::Object(Default::default()));
    }
    schema
}

impl BrowserTool {
    pub const ALL: [BrowserTool; 8] = [
        BrowserTool::ListTabs,
        BrowserTool::OpenTab,
        BrowserTool::CloseTab,
        BrowserTool::SwitchTab,
        BrowserTool::Navigate,
        BrowserTool::ReadPage,
        BrowserTool::RunScript,
        BrowserTool::SplitTabs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BrowserTool::ListTabs => "list_tabs",
            BrowserTool::OpenTab => "open_tab",
            BrowserTool::CloseTab => "close_tab",
            BrowserTool::SwitchTab => "switch_tab",
            BrowserTool::Navigate => "navigate",
            BrowserTool::ReadPage => "read_page",
            BrowserTool::RunScript => "run_script",
            BrowserTool::SplitTabs => "split_tabs",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    pub fn description(self) -> &'static str {
        match self {
            BrowserTool::ListTabs => "List the open tabs with their ids, titles and URLs.",
            BrowserTool::OpenTab => "Open a URL in a new tab.",
            BrowserTool::CloseTab => "Close a tab by id.",
            BrowserTool::SwitchTab => "Focus a tab by id.",
            BrowserTool::Navigate => "Load a URL in an existing tab.",
            BrowserTool::ReadPage => "Return the visible text of a page.",
            BrowserTool::RunScript => "Run JavaScript in a page and return the result.",
            BrowserTool::SplitTabs => "Show two tabs side by side in split view.",
        }
    }

    pub fn input_schema(self) -> Value {
        match self {
            BrowserTool::ListTabs => schema_of::<ListTabsArgs>(),
            BrowserTool::OpenTab => schema_of::<OpenTabArgs>(),
            BrowserTool::CloseTab | BrowserTool::SwitchTab => schema_of::<TabArgs>(),
            BrowserTool::Navigate => schema_of::<NavigateArgs>(),
            BrowserTool::ReadPage => schema_of::<ReadPageArgs>(),
            BrowserTool::RunScript => schema_of::<RunScriptArgs>(),
            BrowserTool::SplitTabs => schema_of::<SplitTabsArgs>(),
        }
    }

    pub fn descriptor(self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// A tool name resolved once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolName {
    Native(BrowserTool),
    Remote { server_id: String, tool: String },
}

impl ToolName {
    /// Native names win; anything else must be `serverId.toolName`, split on
    /// the first separator so tool names may themselves contain dots.
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(tool) = BrowserTool::from_name(name) {
            return Some(ToolName::Native(tool));
        }
        let (server_id, tool) = name.split_once(QUALIFIED_SEPARATOR)?;
        if server_id.is_empty() || tool.is_empty() {
            return None;
        }
        Some(ToolName::Remote {
            server_id: server_id.to_string(),
            tool: tool.to_string(),
        })
    }

    pub fn qualify(server_id: &str, tool: &str) -> String {
        format!("{}{}{}", server_id, QUALIFIED_SEPARATOR, tool)
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolName::Native(tool) => f.write_str(tool.name()),
            ToolName::Remote { server_id, tool } => {
                write!(f, "{}{}{}", server_id, QUALIFIED_SEPARATOR, tool)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Browser seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabSummary {
    pub id: u64,
    pub title: String,
    pub url: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space: Option<String>,
}

/// What the native tools need from the browser. Tab operations complete
/// synchronously; script evaluation is answered later by the frontend.
pub trait BrowserHost: Send + Sync {
    fn list_tabs(&self) -> Vec<TabSummary>;
    fn open_tab(&self, url: &str, background: bool) -> Result<TabSummary, String>;
    fn close_tab(&self, tab_id: u64) -> Result<(), String>;
    fn switch_tab(&self, tab_id: u64) -> Result<(), String>;
    fn navigate(&self, tab_id: Option<u64>, url: &str) -> Result<TabSummary, String>;
    fn split_tabs(&self, left: u64, right: u64) -> Result<(), String>;
    fn evaluate_script(
        &self,
        tab_id: Option<u64>,
        script: &str,
    ) -> oneshot::Receiver<Result<String, String>>;
}

// ---------------------------------------------------------------------------
// OpenAI tool format
// ---------------------------------------------------------------------------

pub fn to_openai_tool(tool: &ToolDescriptor) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

pub fn from_openai_tool(value: &Value) -> Option<ToolDescriptor> {
    if value.get("type").and_then(Value::as_str) != Some("function") {
        return None;
    }
    let function = value.get("function")?;
    Some(ToolDescriptor {
        name: function.get("name")?.as_str()?.to_string(),
        description: function
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        input_schema: function
            .get("parameters")
            .cloned()
            .unwrap_or_else(empty_object_schema),
    })
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

fn parse_args<T: DeserializeOwned>(tool: BrowserTool, arguments: &Value) -> Result<T, String> {
    let normalized = match arguments {
        Value::Null => Value::Object(Default::default()),
        // Some models send arguments as a JSON-encoded string.
        Value::String(raw) => serde_json::from_str(raw).unwrap_or_else(|_| arguments.clone()),
        other => other.clone(),
    };
    serde_json::from_value(normalized)
        .map_err(|e| format!("Invalid arguments for {}: {}", tool.name(), e))
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}\n[truncated at {} characters]", &text[..cut], max_chars),
        None => text.to_string(),
    }
}

pub struct ToolDispatcher {
    host: Option<Arc<dyn BrowserHost>>,
    mcp: Arc<McpManager>,
    native_timeout: Duration,
    remote_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(host: Option<Arc<dyn BrowserHost>>, mcp: Arc<McpManager>) -> Self {
        Self {
            host,
            mcp,
            native_timeout: NATIVE_TOOL_TIMEOUT,
            remote_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_native_timeout(mut self, timeout: Duration) -> Self {
        self.native_timeout = timeout;
        self
    }

    pub fn mcp(&self) -> &Arc<McpManager> {
        &self.mcp
    }

    /// Enabled native tools (only when a browser is attached) followed by
    /// every tool of every connected MCP server under its qualified name.
    pub fn available_tools(&self, enabled: &[BrowserTool]) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = match self.host {
            Some(_) => BrowserTool::ALL
                .into_iter()
                .filter(|tool| enabled.contains(tool))
                .map(BrowserTool::descriptor)
                .collect(),
            None => Vec::new(),
        };
        tools.extend(self.mcp.tools().into_iter().map(|(server_id, tool)| ToolDescriptor {
            name: ToolName::qualify(&server_id, &tool.name),
            description: tool.description,
            input_schema: tool.input_schema,
        }));
        tools
    }

    /// Execute one call. Every failure is folded into an error result for
    /// the model to read.
    pub async fn dispatch(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        let Some(name) = ToolName::parse(&call.name) else {
            log::warn!("Model requested unknown tool '{}'", call.name);
            return ToolResult::error(&call.id, format!("Unknown tool '{}'", call.name));
        };

        let outcome = match &name {
            ToolName::Native(tool) => {
                match deadline::race(self.native_timeout, cancel, self.run_native(*tool, &call.arguments)).await {
                    Ok(result) => result.map(|content| (content, false)),
                    Err(interrupted) => Err(format!("Tool '{}' {}", name, interrupted)),
                }
            }
            ToolName::Remote { server_id, tool } => {
                let arguments = match &call.arguments {
                    Value::Null => Value::Object(Default::default()),
                    other => other.clone(),
                };
                match deadline::race(
                    self.remote_timeout,
                    cancel,
                    self.mcp.call(server_id, tool, arguments),
                )
                .await
                {
                    Ok(Ok(output)) => Ok((output.content, output.is_error)),
                    Ok(Err(e)) => Err(format!("Tool '{}' failed: {}", name, e)),
                    Err(Interrupted::Cancelled) => Err(format!("Tool '{}' cancelled", name)),
                    Err(e @ Interrupted::TimedOut(_)) => Err(format!("Tool '{}' {}", name, e)),
                }
            }
        };

        match outcome {
            Ok((content, is_error)) => ToolResult {
                tool_call_id: call.id.clone(),
                content,
                is_error,
            },
            Err(message) => {
                log::warn!("{}", message);
                ToolResult::error(&call.id, message)
            }
        }
    }

    async fn run_native(&self, tool: BrowserTool, arguments: &Value) -> Result<String, String> {
        let host = self
            .host
            .as_ref()
            .ok_or_else(|| "No browser window is attached".to_string())?;

        match tool {
            BrowserTool::ListTabs => {
                let _: ListTabsArgs = parse_args(tool, arguments)?;
                serde_json::to_string_pretty(&host.list_tabs()).map_err(|e| e.to_string())
            }
            BrowserTool::OpenTab => {
                let args: OpenTabArgs = parse_args(tool, arguments)?;
                if args.url.trim().is_empty() {
                    return Err("url must not be empty".to_string());
                }
                let tab = host.open_tab(&args.url, args.background)?;
                serde_json::to_string(&tab).map_err(|e| e.to_string())
            }
            BrowserTool::CloseTab => {
                let args: TabArgs = parse_args(tool, arguments)?;
                host.close_tab(args.tab_id)?;
                Ok(format!("Closed tab {}", args.tab_id))
            }
            BrowserTool::SwitchTab => {
                let args: TabArgs = parse_args(tool, arguments)?;
                host.switch_tab(args.tab_id)?;
                Ok(format!("Switched to tab {}", args.tab_id))
            }
            BrowserTool::Navigate => {
                let args: NavigateArgs = parse_args(tool, arguments)?;
                let tab = host.navigate(args.tab_id, &args.url)?;
                serde_json::to_string(&tab).map_err(|e| e.to_string())
            }
            BrowserTool::ReadPage => {
                let args: ReadPageArgs = parse_args(tool, arguments)?;
                let text = Self::evaluate(host.as_ref(), args.tab_id, READ_PAGE_SCRIPT).await?;
                Ok(truncate_chars(
                    &text,
                    args.max_chars.unwrap_or(DEFAULT_READ_PAGE_CHARS),
                ))
            }
            BrowserTool::RunScript => {
                let args: RunScriptArgs = parse_args(tool, arguments)?;
                Self::evaluate(host.as_ref(), args.tab_id, &args.script).await
            }
            BrowserTool::SplitTabs => {
                let args: SplitTabsArgs = parse_args(tool, arguments)?;
                host.split_tabs(args.left_tab_id, args.right_tab_id)?;
                Ok(format!(
                    "Split view: tab {} | tab {}",
                    args.left_tab_id, args.right_tab_id
                ))
            }
        }
    }

    async fn evaluate(host: &dyn BrowserHost, tab_id: Option<u64>, script: &str) -> Result<String, String> {
        host.evaluate_script(tab_id, script)
            .await
            .map_err(|_| "Script request was dropped by the browser".to_string())?
    }
}
