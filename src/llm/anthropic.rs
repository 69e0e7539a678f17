//! Messages dialect adapter.
//!
//! The messages dialect differs from chat-completions in four ways this
//! adapter reconciles: the system turn is a top-level field, tool results
//! are `tool_result` content blocks on a user turn, tool calls are
//! `tool_use` content blocks, and auth rides in `x-api-key` plus an API
//! version header.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::ApiConfig;
use crate::llm::client::{
    response_as_chunks, ChatRequest, ChatResponse, ChunkStream, Client, FinishReason, LlmError,
    Message, ModelInfo, Role, ToolCall, ToolDef, Usage,
};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Client for the messages API dialect.
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
    headers: Vec<(String, String)>,
    info: ModelInfo,
}

impl AnthropicClient {
    /// Create a client for a messages-dialect endpoint. `base_url` defaults
    /// to the canonical host when unset.
    pub fn new(cfg: &ApiConfig) -> Result<Self, LlmError> {
        if cfg.model.trim().is_empty() {
            return Err(LlmError::Config("model is required".to_string()));
        }

        let base_url = if cfg.base_url.trim().is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            cfg.base_url.trim_end_matches('/').to_string()
        };

        let api_key = cfg
            .resolve_api_key()
            .map_err(|e| LlmError::Config(e.to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Ok(Self {
            http,
            base_url,
            api_key,
            model: cfg.model.clone(),
            max_tokens: if cfg.max_tokens > 0 { cfg.max_tokens } else { DEFAULT_MAX_TOKENS },
            headers: cfg.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            info: ModelInfo {
                id: cfg.model.clone(),
                provider: "anthropic".to_string(),
                context_window: cfg.context_window,
                supports_tools: cfg.supports_tools,
                supports_vision: cfg.supports_vision,
            },
        })
    }
}

#[async_trait]
impl Client for AnthropicClient {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let (system, rest) = split_system_messages(&req.messages);

        let body = WireRequest {
            model: self.model.clone(),
            max_tokens: req.max_tokens.unwrap_or(self.max_tokens),
            temperature: req.temperature,
            stop_sequences: if req.stop.is_empty() { None } else { Some(req.stop.clone()) },
            system: if system.is_empty() { None } else { Some(system) },
            messages: rest.iter().map(|m| convert_message(m)).collect(),
            tools: if req.tools.is_empty() {
                None
            } else {
                Some(req.tools.iter().map(WireTool::from).collect())
            },
        };

        let url = format!("{}/v1/messages", self.base_url);
        let mut request = self
            .http
            .post(&url)
            .header("anthropic-version", API_VERSION)
            .json(&body);
        let key = self.api_key.expose_secret();
        if !key.is_empty() {
            request = request.header("x-api-key", key.as_str());
        }
        for (k, v) in &self.headers {
            request = request.header(k, v);
        }

        let response = request
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

        let mut result = ChatResponse {
            finish_reason: FinishReason::from_anthropic(wire.stop_reason.as_deref().unwrap_or("")),
            ..Default::default()
        };

        for block in wire.content {
            match block.block_type.as_str() {
                "text" => {
                    if !result.content.is_empty() {
                        result.content.push('\n');
                    }
                    result.content.push_str(&block.text);
                }
                "tool_use" => {
                    result.tool_calls.push(ToolCall {
                        id: block.id,
                        name: block.name,
                        arguments: block
                            .input
                            .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
                    });
                }
                _ => {}
            }
        }

        if let Some(u) = wire.usage {
            result.usage = Some(Usage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
                total_tokens: u.input_tokens + u.output_tokens,
            });
        }

        Ok(result)
    }

    async fn stream(&self, req: &ChatRequest) -> Result<ChunkStream, LlmError> {
        let resp = self.chat(req).await?;
        Ok(response_as_chunks(resp))
    }

    fn model_info(&self) -> &ModelInfo {
        &self.info
    }

    async fn ping(&self) -> Result<(), LlmError> {
        // No models endpoint in this dialect; send a minimal one-token chat.
        let probe = ChatRequest {
            messages: vec![Message::user("ping")],
            max_tokens: Some(1),
            ..Default::default()
        };
        self.chat(&probe).await.map(|_| ())
    }

    async fn close(&self) {}
}

/// Fold every system turn into the top-level system field, preserving the
/// remaining turns in order.
fn split_system_messages(messages: &[Message]) -> (String, Vec<&Message>) {
    let mut system = String::new();
    let mut rest = Vec::new();
    for msg in messages {
        if msg.role == Role::System {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(&msg.content);
        } else {
            rest.push(msg);
        }
    }
    (system, rest)
}

fn convert_message(msg: &Message) -> WireMessage {
    if msg.role == Role::Tool {
        // Tool results ride as a tool_result block on a user turn.
        return WireMessage {
            role: "user".to_string(),
            content: WireContent::Blocks(vec![WireBlock::ToolResult {
                tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                content: msg.content.clone(),
            }]),
        };
    }

    if !msg.tool_calls.is_empty() {
        let mut blocks = Vec::new();
        if !msg.content.is_empty() {
            blocks.push(WireBlock::Text {
                text: msg.content.clone(),
            });
        }
        for tc in &msg.tool_calls {
            blocks.push(WireBlock::ToolUse {
                id: tc.id.clone(),
                name: tc.name.clone(),
                input: tc.arguments.clone(),
            });
        }
        return WireMessage {
            role: msg.role.as_str().to_string(),
            content: WireContent::Blocks(blocks),
        };
    }

    WireMessage {
        role: msg.role.as_str().to_string(),
        content: WireContent::Text(msg.content.clone()),
    }
}

// --- wire format ---

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: WireContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Blocks(Vec<WireBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

impl From<&ToolDef> for WireTool {
    fn from(def: &ToolDef) -> Self {
        Self {
            name: def.name.clone(),
            description: def.description.clone(),
            input_schema: def.parameters.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<WireResponseBlock>,
    stop_reason: Option<String>,
    usage: Option<WireUsage>,
}

/// Response content block. Kept as a loose struct so unknown block types
/// pass through without a decode failure.
#[derive(Debug, Deserialize)]
struct WireResponseBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    input: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AnthropicClient {
        AnthropicClient::new(&ApiConfig {
            api_type: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_base_url_defaults_to_canonical_host() {
        let c = client();
        assert_eq!(c.base_url, DEFAULT_BASE_URL);
        assert_eq!(c.model_info().provider, "anthropic");
    }

    #[test]
    fn test_system_messages_are_folded() {
        let messages = vec![
            Message::system("first"),
            Message::user("hi"),
            Message::system("second"),
        ];
        let (system, rest) = split_system_messages(&messages);
        assert_eq!(system, "first\n\nsecond");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].role, Role::User);
    }

    #[test]
    fn test_tool_result_becomes_user_block() {
        let msg = Message::tool_result("toolu_1", "file-read", "1: hello");
        let wire = convert_message(&msg);
        assert_eq!(wire.role, "user");
        let json = serde_json::to_value(&wire.content).unwrap();
        assert_eq!(json[0]["type"], "tool_result");
        assert_eq!(json[0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn test_assistant_tool_calls_become_tool_use_blocks() {
        let msg = Message::assistant_with_tool_calls(
            "working on it",
            vec![ToolCall {
                id: "toolu_2".to_string(),
                name: "vcs-status".to_string(),
                arguments: serde_json::json!({}),
            }],
        );
        let wire = convert_message(&msg);
        let json = serde_json::to_value(&wire.content).unwrap();
        assert_eq!(json[0]["type"], "text");
        assert_eq!(json[1]["type"], "tool_use");
        assert_eq!(json[1]["name"], "vcs-status");
    }

    #[test]
    fn test_unknown_response_blocks_are_tolerated() {
        let raw = r#"{
            "content": [
                {"type": "thinking", "thinking": "..."},
                {"type": "text", "text": "done"},
                {"type": "tool_use", "id": "toolu_3", "name": "file-read", "input": {"path": "a"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 3, "output_tokens": 7}
        }"#;
        let wire: WireResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(wire.content.len(), 3);
        assert_eq!(wire.stop_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn test_max_tokens_default() {
        let c = client();
        assert_eq!(c.max_tokens, DEFAULT_MAX_TOKENS);
    }
}
