//! Bounded agentic loop: send the conversation to a chat provider, execute
//! requested tool calls, feed results back, repeat.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::deadline::{self, Interrupted};
use crate::tools::{BrowserTool, ToolCall, ToolDescriptor, ToolDispatcher, ToolResult};

/// Provider round trips per turn. Settings may lower it, never raise it.
pub const DEFAULT_MAX_ITERATIONS: usize = 20;
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Results carried by a tool message, keyed by call id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool(tool_results: Vec<ToolResult>) -> Self {
        Self {
            tool_results,
            ..Self::plain(Role::Tool, String::new())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDescriptor>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" => FinishReason::Stop,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("could not decode provider response: {0}")]
    Decode(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("provider timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("no provider configured: {0}")]
    NotConfigured(String),
}

/// A chat-completions backend. Streamed text goes out as
/// [`AgentEvent::TextDelta`] on `events` while the response accumulates.
pub trait ChatProvider: Send + Sync {
    fn complete(
        &self,
        request: ChatRequest,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> impl Future<Output = Result<ChatResponse, ProviderError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Sending,
    AwaitingResponse,
    ToolCallsPending,
    ExecutingTools,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    IterationLimit,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    State { state: LoopState },
    TextDelta { text: String },
    ToolCallStarted { id: String, name: String },
    ToolCallFinished { result: ToolResult },
    TurnFinished { outcome: TurnOutcome },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub system_prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub max_iterations: usize,
    pub provider_timeout: Duration,
    pub enabled_tools: Vec<BrowserTool>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful assistant built into the Vireo web browser. \
                            Use the available tools to inspect and control browser tabs."
                .to_string(),
            model: String::new(),
            temperature: 0.7,
            max_tokens: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            enabled_tools: BrowserTool::ALL.to_vec(),
        }
    }
}

pub struct AgentLoop<P> {
    provider: P,
    dispatcher: Arc<ToolDispatcher>,
    settings: AgentSettings,
    conversation: Conversation,
    events: mpsc::UnboundedSender<AgentEvent>,
    state: LoopState,
    cancel: CancellationToken,
}

impl<P: ChatProvider> AgentLoop<P> {
    pub fn new(
        provider: P,
        dispatcher: Arc<ToolDispatcher>,
        settings: AgentSettings,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Self {
        Self {
            provider,
            dispatcher,
            settings,
            conversation: Conversation::new(),
            events,
            state: LoopState::Idle,
            cancel: CancellationToken::new(),
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: AgentSettings) {
        self.settings = settings;
    }

    /// Token that cancels the current turn (or the next one, when idle).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn reset(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.conversation.clear();
        self.set_state(LoopState::Idle);
    }

    fn set_state(&mut self, state: LoopState) {
        self.state = state;
        let _ = self.events.send(AgentEvent::State { state });
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }

    fn build_request(&self) -> ChatRequest {
        let mut messages = Vec::with_capacity(self.conversation.len() + 1);
        if !self.settings.system_prompt.is_empty() {
            messages.push(ChatMessage::system(self.settings.system_prompt.clone()));
        }
        messages.extend(self.conversation.messages().iter().cloned());
        ChatRequest {
            model: self.settings.model.clone(),
            messages,
            tools: self.dispatcher.available_tools(&self.settings.enabled_tools),
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        }
    }

    /// Run one user turn to completion. Failures end up in the conversation
    /// as an assistant message; the returned outcome says how the turn ended.
    pub async fn send_message(&mut self, text: &str) -> TurnOutcome {
        let cancel = self.cancel.clone();
        self.conversation.push(ChatMessage::user(text));

        let outcome = self.run_turn(&cancel).await;
        match &outcome {
            TurnOutcome::Failed(message) => {
                log::warn!("Agent turn failed: {}", message);
                self.conversation
                    .push(ChatMessage::assistant(format!("Something went wrong: {}", message)));
            }
            TurnOutcome::Cancelled => {
                self.conversation.push(ChatMessage::assistant("Request cancelled."));
            }
            TurnOutcome::Completed | TurnOutcome::IterationLimit => {}
        }

        self.set_state(LoopState::Idle);
        self.emit(AgentEvent::TurnFinished {
            outcome: outcome.clone(),
        });
        if cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        outcome
    }

    async fn run_turn(&mut self, cancel: &CancellationToken) -> TurnOutcome {
        let max_iterations = self.settings.max_iterations.clamp(1, DEFAULT_MAX_ITERATIONS);

        for iteration in 1..=max_iterations {
            self.set_state(LoopState::Sending);
            let request = self.build_request();
            self.set_state(LoopState::AwaitingResponse);

            let response = match deadline::race(
                self.settings.provider_timeout,
                cancel,
                self.provider.complete(request, self.events.clone()),
            )
            .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(ProviderError::Cancelled)) | Err(Interrupted::Cancelled) => {
                    return TurnOutcome::Cancelled
                }
                Ok(Err(e)) => return TurnOutcome::Failed(e.to_string()),
                Err(Interrupted::TimedOut(after)) => {
                    return TurnOutcome::Failed(ProviderError::TimedOut(after).to_string())
                }
            };

            if response.finish_reason != FinishReason::ToolCalls || response.tool_calls.is_empty() {
                self.conversation.push(ChatMessage::assistant(response.content));
                return TurnOutcome::Completed;
            }

            if iteration == max_iterations {
                log::warn!(
                    "Agent stopped after {} provider round trips with tool calls still pending",
                    max_iterations
                );
                let content = if response.content.trim().is_empty() {
                    format!(
                        "Stopped after {} rounds of tool calls without a final answer.",
                        max_iterations
                    )
                } else {
                    response.content
                };
                self.conversation.push(ChatMessage::assistant(content));
                return TurnOutcome::IterationLimit;
            }

            self.set_state(LoopState::ToolCallsPending);
            self.set_state(LoopState::ExecutingTools);
            let mut results = Vec::with_capacity(response.tool_calls.len());
            for call in &response.tool_calls {
                self.emit(AgentEvent::ToolCallStarted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                });
                let result = self.dispatcher.dispatch(call, cancel).await;
                self.emit(AgentEvent::ToolCallFinished {
                    result: result.clone(),
                });
                results.push(result);
            }

            // The call/result pair goes in together.
            self.conversation
                .push(ChatMessage::assistant_with_calls(response.content, response.tool_calls));
            self.conversation.push(ChatMessage::tool(results));

            if cancel.is_cancelled() {
                return TurnOutcome::Cancelled;
            }
        }

        TurnOutcome::IterationLimit
    }
}
