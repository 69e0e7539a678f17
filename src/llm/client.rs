//! The provider-neutral client surface: conversation types, tool
//! definitions, streaming chunks, and the [`Client`] trait every dialect
//! adapter implements.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the language-model client surface.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Missing or invalid configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The provider returned a non-2xx payload.
    #[error("API error {status}: {body}")]
    Provider { status: u16, body: String },

    /// Network-level failure reaching the provider.
    #[error("request failed: {0}")]
    Transport(String),

    /// Unparseable wire data, or a response with no choices.
    #[error("invalid response: {0}")]
    Protocol(String),

    /// The caller cancelled the operation or its deadline passed.
    /// Matched by identity; never retried.
    #[error("operation cancelled")]
    Cancelled,
}

/// A conversation turn role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    #[default]
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// One conversation turn.
///
/// A turn with role [`Role::Tool`] carries the `tool_call_id` binding it to
/// the assistant tool call that produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            ..Default::default()
        }
    }

    /// A tool-result turn answering the call with the given id.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

/// The model requesting a tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Opaque JSON object of arguments.
    pub arguments: serde_json::Value,
}

/// A tool the model can call, described by a JSON Schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema object for the arguments.
    pub parameters: serde_json::Value,
}

/// Input to a [`Client::chat`] or [`Client::stream`] call.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDef>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub stop: Vec<String>,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    #[default]
    Unknown,
}

impl FinishReason {
    /// Map a chat-completions finish reason.
    pub fn from_openai(reason: &str) -> Self {
        match reason {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Unknown,
        }
    }

    /// Map a messages-dialect stop reason onto the shared enum.
    pub fn from_anthropic(reason: &str) -> Self {
        match reason {
            "end_turn" | "stop_sequence" => FinishReason::Stop,
            "max_tokens" => FinishReason::Length,
            "tool_use" => FinishReason::ToolCalls,
            _ => FinishReason::Unknown,
        }
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// The model's complete response.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub finish_reason: FinishReason,
}

/// A single piece of a streaming response.
///
/// The stream is finite and ends with exactly one terminal chunk:
/// [`StreamChunk::Done`] or [`StreamChunk::Error`].
#[derive(Debug)]
pub enum StreamChunk {
    Text(String),
    ToolCall(ToolCall),
    Done(FinishReason),
    Error(LlmError),
}

/// The finite chunk sequence returned by [`Client::stream`].
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// Information about the connected model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    pub context_window: usize,
    pub supports_tools: bool,
    pub supports_vision: bool,
}

/// The interface for calling language models. Implementations reconcile
/// wire-protocol differences between providers.
#[async_trait]
pub trait Client: Send + Sync {
    /// Send a conversation and return the model's complete response.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError>;

    /// Send a conversation and return a finite stream of chunks ending with
    /// a terminal chunk. Adapters may emit the whole response as one text /
    /// tool-call batch followed by `Done`.
    async fn stream(&self, req: &ChatRequest) -> Result<ChunkStream, LlmError>;

    /// Information about the connected model.
    fn model_info(&self) -> &ModelInfo;

    /// Reachability probe with no side effects.
    async fn ping(&self) -> Result<(), LlmError>;

    /// Release pooled connections.
    async fn close(&self);
}

/// Build the fallback stream shared by both adapters: the full response as
/// one text chunk, one chunk per tool call, then `Done`.
pub(crate) fn response_as_chunks(resp: ChatResponse) -> ChunkStream {
    let mut chunks = Vec::new();
    if !resp.content.is_empty() {
        chunks.push(StreamChunk::Text(resp.content));
    }
    for tc in resp.tool_calls {
        chunks.push(StreamChunk::ToolCall(tc));
    }
    chunks.push(StreamChunk::Done(resp.finish_reason));
    Box::pin(tokio_stream::iter(chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), "\"tool\"");
    }

    #[test]
    fn test_tool_result_binds_call_id() {
        let msg = Message::tool_result("call-1", "file-read", "1: hello");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(msg.name.as_deref(), Some("file-read"));
    }

    #[test]
    fn test_finish_reason_mappings() {
        assert_eq!(FinishReason::from_openai("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::from_openai("length"), FinishReason::Length);
        assert_eq!(FinishReason::from_openai("tool_calls"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::from_anthropic("end_turn"), FinishReason::Stop);
        assert_eq!(FinishReason::from_anthropic("max_tokens"), FinishReason::Length);
        assert_eq!(FinishReason::from_anthropic("tool_use"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::from_anthropic("stop_sequence"), FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_response_as_chunks_ends_with_done() {
        let resp = ChatResponse {
            content: "hello".to_string(),
            tool_calls: vec![ToolCall {
                id: "a".to_string(),
                name: "vcs-status".to_string(),
                arguments: serde_json::json!({}),
            }],
            usage: None,
            finish_reason: FinishReason::ToolCalls,
        };

        let chunks: Vec<StreamChunk> = response_as_chunks(resp).collect().await;
        assert_eq!(chunks.len(), 3);
        assert!(matches!(chunks[0], StreamChunk::Text(_)));
        assert!(matches!(chunks[1], StreamChunk::ToolCall(_)));
        assert!(matches!(chunks[2], StreamChunk::Done(FinishReason::ToolCalls)));
    }
}
