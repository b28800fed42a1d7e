//! OpenAI-compatible chat-completions provider with streamed responses.

use std::collections::BTreeMap;
use std::future::Future;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::agent::{
    AgentEvent, ChatMessage, ChatProvider, ChatRequest, ChatResponse, FinishReason, ProviderError, Role,
};
use crate::config::ProviderConfig;
use crate::tools::{to_openai_tool, ToolCall};
use crate::transport::SseDecoder;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_ERROR_BODY: usize = 2_000;

pub struct OpenAiProvider {
    agent: ureq::Agent,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiProvider {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, ProviderError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ProviderError::NotConfigured("base URL is empty".to_string()));
        }
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_connect(Some(CONNECT_TIMEOUT))
            .http_status_as_error(false)
            .build()
            .into();
        Ok(Self {
            agent,
            base_url,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        Self::new(&config.base_url, config.api_key.clone())
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// Marks the blocking request as abandoned when the async side is dropped.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl ChatProvider for OpenAiProvider {
    fn complete(
        &self,
        request: ChatRequest,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> impl Future<Output = Result<ChatResponse, ProviderError>> + Send {
        let agent = self.agent.clone();
        let endpoint = self.endpoint();
        let api_key = self.api_key.clone();
        let body = request_body(&request);

        async move {
            let abandoned = Arc::new(AtomicBool::new(false));
            let _guard = AbandonOnDrop(abandoned.clone());
            tokio::task::spawn_blocking(move || {
                stream_completion(&agent, &endpoint, api_key.as_deref(), &body, &events, &abandoned)
            })
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?
        }
    }
}

fn stream_completion(
    agent: &ureq::Agent,
    endpoint: &str,
    api_key: Option<&str>,
    body: &Value,
    events: &mpsc::UnboundedSender<AgentEvent>,
    abandoned: &AtomicBool,
) -> Result<ChatResponse, ProviderError> {
    let payload = serde_json::to_vec(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
    let mut request = agent
        .post(endpoint)
        .header("Content-Type", "application/json")
        .header("Accept", "text/event-stream");
    if let Some(key) = api_key {
        request = request.header("Authorization", format!("Bearer {}", key));
    }

    log::debug!("POST {} ({} bytes)", endpoint, payload.len());
    let response = request
        .send(&payload[..])
        .map_err(|e| ProviderError::Http(e.to_string()))?;

    let status = response.status().as_u16();
    let is_event_stream = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"));
    let mut body = response.into_body();

    if !(200..300).contains(&status) {
        let text = body.read_to_string().unwrap_or_default();
        let truncated: String = text.chars().take(MAX_ERROR_BODY).collect();
        return Err(ProviderError::Status {
            status,
            body: truncated,
        });
    }

    if !is_event_stream {
        // Some servers ignore `stream: true` and answer with one JSON body.
        let text = body
            .read_to_string()
            .map_err(|e| ProviderError::Http(e.to_string()))?;
        let value: Value =
            serde_json::from_str(&text).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let response = parse_completion(&value)?;
        if !response.content.is_empty() {
            let _ = events.send(AgentEvent::TextDelta {
                text: response.content.clone(),
            });
        }
        return Ok(response);
    }

    let mut reader = std::io::BufReader::new(body.into_reader());
    let mut decoder = SseDecoder::new();
    let mut accumulator = StreamAccumulator::new();
    let mut line = String::new();
    loop {
        if abandoned.load(Ordering::SeqCst) {
            return Err(ProviderError::Cancelled);
        }
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| ProviderError::Http(e.to_string()))?;
        let event = if read == 0 {
            decoder.finish()
        } else {
            decoder.push_line(&line)
        };
        if let Some(event) = event {
            if let Some(delta) = accumulator.push_data(&event.data)? {
                let _ = events.send(AgentEvent::TextDelta { text: delta });
            }
        }
        if read == 0 || accumulator.is_done() {
            break;
        }
    }
    Ok(accumulator.finish())
}

// ---------------------------------------------------------------------------
// Request encoding
// ---------------------------------------------------------------------------

pub fn request_body(request: &ChatRequest) -> Value {
    let mut body = serde_json::json!({
        "model": request.model,
        "messages": encode_messages(&request.messages),
        "stream": true,
        "temperature": request.temperature,
    });
    if let Some(map) = body.as_object_mut() {
        if !request.tools.is_empty() {
            map.insert(
                "tools".to_string(),
                Value::Array(request.tools.iter().map(to_openai_tool).collect()),
            );
        }
        if let Some(max_tokens) = request.max_tokens {
            map.insert("max_tokens".to_string(), Value::from(max_tokens));
        }
    }
    body
}

/// Tool messages expand into one wire message per result.
pub fn encode_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::System => out.push(serde_json::json!({"role": "system", "content": message.content})),
            Role::User => out.push(serde_json::json!({"role": "user", "content": message.content})),
            Role::Assistant if message.tool_calls.is_empty() => {
                out.push(serde_json::json!({"role": "assistant", "content": message.content}))
            }
            Role::Assistant => {
                let calls: Vec<Value> = message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        serde_json::json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            },
                        })
                    })
                    .collect();
                let content = if message.content.is_empty() {
                    Value::Null
                } else {
                    Value::String(message.content.clone())
                };
                out.push(serde_json::json!({
                    "role": "assistant",
                    "content": content,
                    "tool_calls": calls,
                }));
            }
            Role::Tool => {
                for result in &message.tool_results {
                    out.push(serde_json::json!({
                        "role": "tool",
                        "tool_call_id": result.tool_call_id,
                        "content": result.content,
                    }));
                }
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Response decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if value.is_object() => value,
        _ => {
            log::warn!("Unparseable tool arguments, passing them through raw");
            serde_json::json!({ "_raw": raw })
        }
    }
}

fn generated_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// Merges streamed `chat.completion.chunk` deltas into one response.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    tool_calls: BTreeMap<u64, PartialToolCall>,
    finish_reason: Option<FinishReason>,
    done: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one SSE `data` payload. Returns the text delta it carried, if any.
    pub fn push_data(&mut self, data: &str) -> Result<Option<String>, ProviderError> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(None);
        }
        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }

        let chunk: Value = serde_json::from_str(data).map_err(|e| ProviderError::Decode(e.to_string()))?;
        if let Some(error) = chunk.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(ProviderError::Decode(message));
        }

        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            return Ok(None);
        };
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(FinishReason::parse(reason));
        }
        let Some(delta) = choice.get("delta") else {
            return Ok(None);
        };

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for (position, call) in calls.iter().enumerate() {
                let index = call
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or(position as u64);
                let entry = self.tool_calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    entry.id = id.to_string();
                }
                if let Some(function) = call.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        entry.name.push_str(name);
                    }
                    if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
                        entry.arguments.push_str(arguments);
                    }
                }
            }
        }

        match delta.get("content").and_then(Value::as_str) {
            Some(text) if !text.is_empty() => {
                self.content.push_str(text);
                Ok(Some(text.to_string()))
            }
            _ => Ok(None),
        }
    }

    pub fn finish(self) -> ChatResponse {
        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .into_values()
            .filter(|call| !call.name.is_empty())
            .map(|call| ToolCall {
                id: if call.id.is_empty() {
                    generated_call_id()
                } else {
                    call.id
                },
                arguments: parse_arguments(&call.arguments),
                name: call.name,
            })
            .collect();

        let finish_reason = match self.finish_reason {
            Some(reason) => reason,
            None if !tool_calls.is_empty() => FinishReason::ToolCalls,
            None => FinishReason::Stop,
        };
        ChatResponse {
            content: self.content,
            tool_calls,
            finish_reason,
        }
    }
}

/// Decode a non-streamed `chat.completion` body.
pub fn parse_completion(value: &Value) -> Result<ChatResponse, ProviderError> {
    let choice = value
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| ProviderError::Decode("response has no choices".to_string()))?;
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let mut accumulator = StreamAccumulator::new();
    accumulator.content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for (index, call) in calls.iter().enumerate() {
            let function = call.get("function");
            let text = |key: &str| {
                function
                    .and_then(|f| f.get(key))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            accumulator.tool_calls.insert(
                index as u64,
                PartialToolCall {
                    id: call.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                    name: text("name"),
                    arguments: text("arguments"),
                },
            );
        }
    }
    accumulator.finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(FinishReason::parse);
    Ok(accumulator.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolDescriptor, ToolResult};
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn request(messages: Vec<ChatMessage>, tools: Vec<ToolDescriptor>) -> ChatRequest {
        ChatRequest {
            model: "test-model".into(),
            messages,
            tools,
            temperature: 0.2,
            max_tokens: Some(256),
        }
    }

    #[test]
    fn tool_messages_expand_per_result() {
        let call = ToolCall {
            id: "call_a".into(),
            name: "open_tab".into(),
            arguments: serde_json::json!({"url": "https://a.example"}),
        };
        let messages = vec![
            ChatMessage::user("open a"),
            ChatMessage::assistant_with_calls("", vec![call]),
            ChatMessage::tool(vec![
                ToolResult::ok("call_a", "opened"),
                ToolResult::error("call_b", "failed"),
            ]),
        ];
        let wire = encode_messages(&messages);
        assert_eq!(wire.len(), 4);
        assert_eq!(wire[1]["content"], Value::Null);
        assert_eq!(wire[1]["tool_calls"][0]["function"]["name"], "open_tab");
        let args: Value =
            serde_json::from_str(wire[1]["tool_calls"][0]["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(args["url"], "https://a.example");
        assert_eq!(wire[2], serde_json::json!({"role": "tool", "tool_call_id": "call_a", "content": "opened"}));
        assert_eq!(wire[3]["tool_call_id"], "call_b");
    }

    #[test]
    fn request_body_omits_empty_tools() {
        let body = request_body(&request(vec![ChatMessage::user("hi")], Vec::new()));
        assert!(body.get("tools").is_none());
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 256);

        let tools = vec![ToolDescriptor {
            name: "fs.read".into(),
            description: "Read a file".into(),
            input_schema: serde_json::json!({"type": "object"}),
        }];
        let body = request_body(&request(vec![ChatMessage::user("hi")], tools));
        assert_eq!(body["tools"][0]["function"]["name"], "fs.read");
    }

    #[test]
    fn accumulator_merges_text_and_indexed_tool_fragments() {
        let mut acc = StreamAccumulator::new();
        let chunks = [
            r#"{"choices":[{"delta":{"content":"Let me "}}]}"#,
            r#"{"choices":[{"delta":{"content":"check."}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"list_tabs","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_2","function":{"name":"open_tab","arguments":"{\"url\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"arguments":"\"https://x.example\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ];
        let mut deltas = Vec::new();
        for chunk in chunks {
            if let Some(delta) = acc.push_data(chunk).unwrap() {
                deltas.push(delta);
            }
        }
        assert_eq!(deltas, vec!["Let me ", "check."]);
        assert!(!acc.is_done());
        acc.push_data("[DONE]").unwrap();
        assert!(acc.is_done());

        let response = acc.finish();
        assert_eq!(response.content, "Let me check.");
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.tool_calls.len(), 2);
        assert_eq!(response.tool_calls[0].arguments, serde_json::json!({}));
        assert_eq!(response.tool_calls[1].id, "call_2");
        assert_eq!(
            response.tool_calls[1].arguments,
            serde_json::json!({"url": "https://x.example"})
        );
    }

    #[test]
    fn broken_arguments_and_missing_ids_are_tolerated() {
        let mut acc = StreamAccumulator::new();
        acc.push_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"navigate","arguments":"{not json"}}]}}]}"#,
        )
        .unwrap();
        let response = acc.finish();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        let call = &response.tool_calls[0];
        assert!(call.id.starts_with("call_"));
        assert_eq!(call.arguments, serde_json::json!({"_raw": "{not json"}));
    }

    #[test]
    fn stream_errors_surface() {
        let mut acc = StreamAccumulator::new();
        let err = acc
            .push_data(r#"{"error":{"message":"rate limited"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("rate limited"));
        assert!(acc.push_data("not json").is_err());
    }

    #[test]
    fn non_streamed_completion_parses() {
        let body = serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "c1", "type": "function",
                                    "function": {"name": "list_tabs", "arguments": "{}"}}]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let response = parse_completion(&body).unwrap();
        assert_eq!(response.content, "");
        assert_eq!(response.tool_calls[0].name, "list_tabs");
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert!(parse_completion(&serde_json::json!({})).is_err());
    }

    #[test]
    fn empty_base_url_is_not_configured() {
        assert!(matches!(
            OpenAiProvider::new("  ", None),
            Err(ProviderError::NotConfigured(_))
        ));
        let provider = OpenAiProvider::new("http://localhost:11434/v1/", Some(String::new())).unwrap();
        assert_eq!(provider.endpoint(), "http://localhost:11434/v1/chat/completions");
        assert!(provider.api_key.is_none());
    }

    /// One-shot HTTP server: reads a request, answers with `response`.
    fn serve_once(response: &'static str) -> (String, std::thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if received.len() >= header_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();
            String::from_utf8_lossy(&received).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn streams_a_completion_over_http() {
        let (base, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n\
             data: [DONE]\n\n",
        );
        let provider = OpenAiProvider::new(&base, Some("sk-test".into())).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let response = provider
            .complete(request(vec![ChatMessage::user("hi")], Vec::new()), tx)
            .await
            .unwrap();
        assert_eq!(response.content, "Hello");
        assert_eq!(response.finish_reason, FinishReason::Stop);

        let mut deltas = Vec::new();
        while let Ok(AgentEvent::TextDelta { text }) = rx.try_recv() {
            deltas.push(text);
        }
        assert_eq!(deltas, vec!["Hel", "lo"]);

        let raw = server.join().unwrap();
        assert!(raw.starts_with("POST /chat/completions"));
        assert!(raw.to_ascii_lowercase().contains("authorization: bearer sk-test"));
    }

    #[tokio::test]
    async fn error_status_is_reported_with_body() {
        let (base, _server) = serve_once(
            "HTTP/1.1 401 Unauthorized\r\nContent-Type: application/json\r\nContent-Length: 24\r\nConnection: close\r\n\r\n\
             {\"error\":\"invalid key\"} ",
        );
        let provider = OpenAiProvider::new(&base, None).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = provider
            .complete(request(vec![ChatMessage::user("hi")], Vec::new()), tx)
            .await
            .unwrap_err();
        match err {
            ProviderError::Status { status, body } => {
                assert_eq!(status, 401);
                assert!(body.contains("invalid key"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
