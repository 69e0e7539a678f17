//! Language-model client surface.
//!
//! A uniform [`Client`] trait over two wire dialects:
//! - **chat-completions** (`api_type = "openai"` / `"openai-compatible"`):
//!   Ollama, vLLM, OpenAI, Azure, LiteLLM, local proxies.
//! - **messages** (`api_type = "anthropic"`): Claude endpoints and
//!   compatible proxies.
//!
//! [`create_client`] builds the right adapter from an [`ApiConfig`];
//! [`with_retry`] layers the backoff decorator on top.

mod anthropic;
mod client;
mod openai;
mod retry;

pub use anthropic::AnthropicClient;
pub use client::{
    ChatRequest, ChatResponse, ChunkStream, Client, FinishReason, LlmError, Message, ModelInfo,
    Role, StreamChunk, ToolCall, ToolDef, Usage,
};
pub use openai::OpenAiClient;
pub use retry::{is_retryable, with_retry, RetryConfig};

use std::sync::Arc;

use crate::config::ApiConfig;

/// Construct a client from API configuration, dispatching on `api_type`.
/// `api_key` values of the form `$NAME` are resolved from the environment.
pub fn create_client(cfg: &ApiConfig) -> Result<Arc<dyn Client>, LlmError> {
    let api_type = cfg.api_type.trim().to_lowercase();
    if api_type.is_empty() {
        return Err(LlmError::Config("api_type is required".to_string()));
    }

    match api_type.as_str() {
        "openai" | "openai-compatible" => Ok(Arc::new(OpenAiClient::new(cfg)?)),
        "anthropic" => Ok(Arc::new(AnthropicClient::new(cfg)?)),
        other => Err(LlmError::Config(format!("unsupported api_type: {other:?}"))),
    }
}
