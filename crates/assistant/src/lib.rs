//! Chat-completion client for the outreach assistant, plus the resubmission
//! loop that drives a model through tool calls until it settles on a final
//! structured reply.
//!
//! The assistant itself is an external collaborator: this crate only defines
//! the wire shapes and the dispatch loop. Which model serves a given
//! prospect, and how its replies get routed to a Telegram account, is the
//! caller's concern.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("assistant request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("assistant reply did not contain a structured JSON reply: {0:?}")]
    Malformed(String),
    #[error("tool `{0}` is not available to the assistant")]
    UnknownTool(String),
    #[error("tool `{name}` failed: {detail}")]
    ToolFailed { name: String, detail: String },
    #[error("exceeded {0} tool-call rounds without a final reply")]
    TooManyRounds(u32),
}

/// Role in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a chat conversation, in the OpenAI-compatible shape
/// most self-hosted and hosted chat-completion endpoints accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self { role: ChatRole::Assistant, content: None, tool_calls, tool_call_id: None }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: ChatRole::Tool, content: Some(content.into()), tool_calls: vec![], tool_call_id: Some(tool_call_id.into()) }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_tool_call_type")]
    pub r#type: String,
    pub function: ToolCallFunction,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Response from a single chat-completion round.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
}

/// A chat-completion backend. Implementations own their own transport and
/// model selection; the dispatcher only ever calls `chat`.
#[async_trait]
pub trait Assistant: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse, AssistantError>;
}

/// Executes a named tool call and returns its textual result, to be fed back
/// to the model as a `tool` message.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, arguments: &serde_json::Value) -> Result<String, AssistantError>;
}

const DEFAULT_MAX_ROUNDS: u32 = 6;

/// Drives an [`Assistant`] through zero or more tool-call rounds, resubmitting
/// tool outputs until the model responds with no function-call items left,
/// then parses that final content as a [`StructuredReply`].
pub struct Dispatcher<'a> {
    assistant: &'a dyn Assistant,
    max_rounds: u32,
}

impl<'a> Dispatcher<'a> {
    pub fn new(assistant: &'a dyn Assistant) -> Self {
        Self { assistant, max_rounds: DEFAULT_MAX_ROUNDS }
    }

    pub fn with_max_rounds(assistant: &'a dyn Assistant, max_rounds: u32) -> Self {
        Self { assistant, max_rounds }
    }

    pub async fn run(
        &self,
        mut messages: Vec<ChatMessage>,
        tools: &dyn ToolExecutor,
    ) -> Result<StructuredReply, AssistantError> {
        for _ in 0..self.max_rounds {
            let response = self.assistant.chat(&messages).await?;

            if response.tool_calls.is_empty() {
                return extract_json_output::<StructuredReply>(&response.content)
                    .ok_or_else(|| AssistantError::Malformed(response.content.clone()));
            }

            messages.push(ChatMessage::assistant_tool_calls(response.tool_calls.clone()));
            for call in &response.tool_calls {
                let result = tools.execute(&call.function.name, &call.function.arguments).await?;
                messages.push(ChatMessage::tool_result(call.id.clone(), result));
            }
        }
        Err(AssistantError::TooManyRounds(self.max_rounds))
    }
}

/// The structured reply contract the assistant must settle on once it is
/// done calling tools: whether to send anything, whether it attached a
/// file, whether it is waiting on the prospect before concluding the turn,
/// and which buffered message it is answering.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StructuredReply {
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub send: bool,
    #[serde(default)]
    pub file: bool,
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub reply: i64,
}

/// Extracts the first valid JSON value from a model response: a fenced
/// ```` ```json ... ``` ```` block if present, otherwise the span between
/// the first `{` and the last `}`.
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(json_start) = after_fence.find(|c: char| !c.is_whitespace()) {
            let json_body = &after_fence[json_start..];
            if let Some(fence_end) = json_body.find("```") {
                let json_str = json_body[..fence_end].trim();
                if let Ok(val) = serde_json::from_str(json_str) {
                    return Some(val);
                }
            }
        }
    }

    let trimmed = response.trim();
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                let candidate = &trimmed[start..=end];
                if let Ok(val) = serde_json::from_str(candidate) {
                    return Some(val);
                }
            }
        }
    }

    None
}

fn messages_to_openai(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            let mut obj = serde_json::Map::new();
            let role = match m.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
                ChatRole::Tool => "tool",
            };
            obj.insert("role".to_string(), serde_json::Value::String(role.to_string()));
            if let Some(content) = &m.content {
                obj.insert("content".to_string(), serde_json::Value::String(content.clone()));
            }
            if !m.tool_calls.is_empty() {
                obj.insert("tool_calls".to_string(), serde_json::to_value(&m.tool_calls).unwrap_or_default());
            }
            if let Some(id) = &m.tool_call_id {
                obj.insert("tool_call_id".to_string(), serde_json::Value::String(id.clone()));
            }
            serde_json::Value::Object(obj)
        })
        .collect()
}

fn parse_openai_chat_response(body: &serde_json::Value) -> Result<ChatResponse, AssistantError> {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| AssistantError::Malformed(body.to_string()))?;
    let message = choice.get("message").ok_or_else(|| AssistantError::Malformed(body.to_string()))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(|tc| tc.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| serde_json::from_value::<ToolCall>(v.clone()).ok())
                .map(|mut call| {
                    if let serde_json::Value::String(raw) = &call.function.arguments {
                        if let Ok(parsed) = serde_json::from_str(raw) {
                            call.function.arguments = parsed;
                        }
                    }
                    call
                })
                .collect()
        })
        .unwrap_or_default();

    let finish_reason = choice
        .get("finish_reason")
        .and_then(|r| r.as_str())
        .unwrap_or("stop")
        .to_string();

    Ok(ChatResponse { content, tool_calls, finish_reason })
}

/// Talks to an OpenAI-compatible `/chat/completions` endpoint over HTTP.
/// Works against a hosted router or a local compatible server; which one is
/// just a matter of `base_url`.
#[derive(Debug, Clone)]
pub struct HttpAssistant {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpAssistant {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self { client, base_url: base_url.into(), api_key, model: model.into() }
    }
}

#[async_trait]
impl Assistant for HttpAssistant {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatResponse, AssistantError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = serde_json::json!({
            "model": self.model,
            "messages": messages_to_openai(messages),
        });

        let mut request = self.client.post(&url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let body: serde_json::Value = response.error_for_status()?.json().await?;
        parse_openai_chat_response(&body)
    }
}

/// A canned-response assistant for tests and local `doctor` runs: returns
/// whatever reply was queued, regardless of the conversation so far.
#[derive(Default)]
pub struct MockAssistant {
    pub responses: std::sync::Mutex<Vec<ChatResponse>>,
}

impl MockAssistant {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self { responses: std::sync::Mutex::new(responses) }
    }
}

#[async_trait]
impl Assistant for MockAssistant {
    async fn chat(&self, _messages: &[ChatMessage]) -> Result<ChatResponse, AssistantError> {
        let mut queue = self.responses.lock().unwrap();
        if queue.is_empty() {
            return Ok(ChatResponse {
                content: r#"{"answer":"","send":false,"file":false,"wait":true,"reply":0}"#.to_string(),
                tool_calls: vec![],
                finish_reason: "stop".to_string(),
            });
        }
        Ok(queue.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_output_from_fenced_block() {
        let raw = "Sure!\n```json\n{\"answer\":\"hi\",\"send\":true,\"file\":false,\"wait\":false,\"reply\":3}\n```";
        let out = extract_json_output::<StructuredReply>(raw).unwrap();
        assert_eq!(out.answer, "hi");
        assert!(out.send);
        assert_eq!(out.reply, 3);
    }

    #[test]
    fn extract_json_output_from_bare_json() {
        let raw = r#"{"answer":"ok","send":false,"file":false,"wait":true,"reply":1}"#;
        let out = extract_json_output::<StructuredReply>(raw).unwrap();
        assert!(out.wait);
        assert!(!out.send);
    }

    #[test]
    fn extract_json_output_returns_none_without_json() {
        let raw = "just plain text, no braces here";
        assert!(extract_json_output::<StructuredReply>(raw).is_none());
    }

    #[test]
    fn extract_json_output_picks_outermost_braces() {
        let raw = r#"noise { "answer": "a {nested} value", "send": true, "file": false, "wait": false, "reply": 0 } trailing"#;
        let out = extract_json_output::<StructuredReply>(raw).unwrap();
        assert_eq!(out.answer, "a {nested} value");
    }

    struct EchoTool;

    #[async_trait]
    impl ToolExecutor for EchoTool {
        async fn execute(&self, name: &str, arguments: &serde_json::Value) -> Result<String, AssistantError> {
            Ok(format!("{name}:{arguments}"))
        }
    }

    #[tokio::test]
    async fn dispatcher_resubmits_tool_calls_until_final_reply() {
        let tool_round = ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "call-1".to_string(),
                r#type: "function".to_string(),
                function: ToolCallFunction { name: "get_link".to_string(), arguments: serde_json::json!({"key": "pricing"}) },
            }],
            finish_reason: "tool_calls".to_string(),
        };
        let final_round = ChatResponse {
            content: r#"{"answer":"here you go","send":true,"file":false,"wait":false,"reply":0}"#.to_string(),
            tool_calls: vec![],
            finish_reason: "stop".to_string(),
        };
        let assistant = MockAssistant::new(vec![tool_round, final_round]);
        let dispatcher = Dispatcher::new(&assistant);

        let reply = dispatcher
            .run(vec![ChatMessage::user("hi")], &EchoTool)
            .await
            .unwrap();

        assert_eq!(reply.answer, "here you go");
        assert!(reply.send);
    }

    #[tokio::test]
    async fn dispatcher_gives_up_after_max_rounds() {
        let looping = ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: "call-1".to_string(),
                r#type: "function".to_string(),
                function: ToolCallFunction { name: "get_link".to_string(), arguments: serde_json::json!({}) },
            }],
            finish_reason: "tool_calls".to_string(),
        };
        let assistant = MockAssistant::new(vec![looping.clone(), looping.clone(), looping]);
        let dispatcher = Dispatcher::with_max_rounds(&assistant, 3);

        let err = dispatcher
            .run(vec![ChatMessage::user("hi")], &EchoTool)
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::TooManyRounds(3)));
    }

    #[tokio::test]
    async fn dispatcher_errors_on_malformed_final_reply() {
        let assistant = MockAssistant::new(vec![ChatResponse {
            content: "not json at all".to_string(),
            tool_calls: vec![],
            finish_reason: "stop".to_string(),
        }]);
        let dispatcher = Dispatcher::new(&assistant);
        let err = dispatcher
            .run(vec![ChatMessage::user("hi")], &EchoTool)
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::Malformed(_)));
    }
}
