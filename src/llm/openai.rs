//! Chat-completions dialect adapter.
//!
//! Works with any endpoint speaking the OpenAI chat-completions format:
//! Ollama, vLLM, OpenAI, Azure, LiteLLM, and local proxies. The system turn
//! rides in the messages array and tool results use `role: "tool"` with a
//! `tool_call_id`.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::ApiConfig;
use crate::llm::client::{
    response_as_chunks, ChatRequest, ChatResponse, ChunkStream, Client, FinishReason, LlmError,
    Message, ModelInfo, Role, ToolCall, ToolDef, Usage,
};

/// Client for OpenAI-compatible chat-completions endpoints.
#[derive(Debug)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    headers: Vec<(String, String)>,
    info: ModelInfo,
}

impl OpenAiClient {
    /// Create a client for a chat-completions endpoint.
    pub fn new(cfg: &ApiConfig) -> Result<Self, LlmError> {
        if cfg.base_url.trim().is_empty() {
            return Err(LlmError::Config(format!(
                "base_url is required for api_type {:?}",
                cfg.api_type
            )));
        }
        if cfg.model.trim().is_empty() {
            return Err(LlmError::Config("model is required".to_string()));
        }

        let api_key = cfg
            .resolve_api_key()
            .map_err(|e| LlmError::Config(e.to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.model.clone(),
            headers: cfg.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            info: ModelInfo {
                id: cfg.model.clone(),
                provider: detect_provider(&cfg.base_url),
                context_window: cfg.context_window,
                supports_tools: cfg.supports_tools,
                supports_vision: cfg.supports_vision,
            },
        })
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let key = self.api_key.expose_secret();
        if !key.is_empty() {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }
        req
    }
}

#[async_trait]
impl Client for OpenAiClient {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let body = WireRequest {
            model: self.model.clone(),
            messages: req.messages.iter().map(WireMessage::from).collect(),
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            stop: if req.stop.is_empty() { None } else { Some(req.stop.clone()) },
            tools: if req.tools.is_empty() {
                None
            } else {
                Some(req.tools.iter().map(WireTool::from).collect())
            },
        };

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .apply_headers(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(LlmError::Provider {
                status: status.as_u16(),
                body: text,
            });
        }

        let wire: WireResponse = serde_json::from_str(&text)
            .map_err(|e| LlmError::Protocol(format!("decoding response: {e}")))?;

        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Protocol("no choices in response".to_string()))?;

        let mut result = ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: FinishReason::from_openai(choice.finish_reason.as_deref().unwrap_or("")),
            ..Default::default()
        };

        for tc in choice.message.tool_calls.unwrap_or_default() {
            let arguments = serde_json::from_str(&tc.function.arguments)
                .unwrap_or_else(|_| serde_json::Value::Object(Default::default()));
            result.tool_calls.push(ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments,
            });
        }

        if let Some(u) = wire.usage {
            result.usage = Some(Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            });
        }

        Ok(result)
    }

    async fn stream(&self, req: &ChatRequest) -> Result<ChunkStream, LlmError> {
        // Emit the complete response as a single text/tool-call batch
        // followed by the terminal chunk.
        let resp = self.chat(req).await?;
        Ok(response_as_chunks(resp))
    }

    fn model_info(&self) -> &ModelInfo {
        &self.info
    }

    async fn ping(&self) -> Result<(), LlmError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .apply_headers(self.http.get(&url))
            .send()
            .await
            .map_err(|e| LlmError::Transport(format!("endpoint unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Provider {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        // reqwest drops pooled connections with the client.
    }
}

/// Guess the provider from the endpoint URL, for `ModelInfo`.
pub(crate) fn detect_provider(base_url: &str) -> String {
    let url = base_url.to_lowercase();
    if url.contains("ollama") || url.contains(":11434") {
        "ollama"
    } else if url.contains("openai.com") {
        "openai"
    } else if url.contains("anthropic.com") {
        "anthropic"
    } else if url.contains(":8000") {
        "vllm"
    } else {
        "openai-compatible"
    }
    .to_string()
}

// --- wire format ---

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        let tool_calls = if msg.tool_calls.is_empty() {
            None
        } else {
            Some(
                msg.tool_calls
                    .iter()
                    .map(|tc| WireToolCall {
                        id: tc.id.clone(),
                        call_type: "function".to_string(),
                        function: WireFunctionCall {
                            name: tc.name.clone(),
                            arguments: tc.arguments.to_string(),
                        },
                    })
                    .collect(),
            )
        };

        Self {
            role: msg.role.as_str().to_string(),
            content: msg.content.clone(),
            tool_call_id: if msg.role == Role::Tool {
                msg.tool_call_id.clone()
            } else {
                None
            },
            name: msg.name.clone(),
            tool_calls,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: WireFunction,
}

impl From<&ToolDef> for WireTool {
    fn from(def: &ToolDef) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: WireFunction {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters: def.parameters.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}
