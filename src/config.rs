//! Configuration for the LLM client, the Nostr publishing stack, and the
//! environment feature flags the core consumes.
//!
//! Config structs are plain serde types so the embedding binary can load
//! them from whatever format it prefers. Secrets (API keys, local signing
//! keys) are referenced as `$NAME` environment indirections and resolved
//! only at client construction time.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default per-HTTP-request timeout for LLM calls.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Environment flag gating the Nostr dual-write bridge.
pub const ENV_NOSTR_ENABLED: &str = "GT_NOSTR_ENABLED";
/// Environment override for the heartbeat cadence, in seconds.
pub const ENV_HEARTBEAT_INTERVAL: &str = "GT_HEARTBEAT_INTERVAL_SECONDS";
/// Bearer token for the remote tool server.
pub const ENV_MCP_TOKEN: &str = "GT_MCP_TOKEN";

// Flags consumed by the role agents built on this core; recognized here so
// every feature switch lives in one place.
pub const ENV_EVENTS_LOCAL: &str = "GT_EVENTS_LOCAL";
pub const ENV_FEED_CURATOR: &str = "GT_FEED_CURATOR";
pub const ENV_CONVOY_LOCAL: &str = "GT_CONVOY_LOCAL";
pub const ENV_MAIL_LOCAL: &str = "GT_MAIL_LOCAL";
pub const ENV_NUDGE_LOCAL: &str = "GT_NUDGE_LOCAL";

/// Errors raised while validating or resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("api_type is required")]
    MissingApiType,

    #[error("base_url is required for api_type {0:?}")]
    MissingBaseUrl(String),

    #[error("model is required")]
    MissingModel,

    #[error("unsupported api_type: {0:?}")]
    UnsupportedApiType(String),

    #[error("invalid api_key reference: {0:?}")]
    InvalidApiKey(String),
}

/// Configuration for one language-model endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Wire dialect: "openai" / "openai-compatible" or "anthropic".
    pub api_type: String,

    /// Endpoint base URL. Required for the chat-completions dialect;
    /// the messages dialect defaults to its canonical host.
    #[serde(default)]
    pub base_url: String,

    /// Model identifier sent with every request.
    #[serde(default)]
    pub model: String,

    /// Literal key, or `$NAME` to read the key from the environment.
    #[serde(default)]
    pub api_key: String,

    /// Per-HTTP-request timeout. Defaults to 300 seconds when zero.
    #[serde(default)]
    pub timeout_seconds: u64,

    /// Forwarded to the provider when non-zero.
    #[serde(default)]
    pub max_tokens: u32,

    /// Forwarded to the provider when set.
    #[serde(default)]
    pub temperature: Option<f64>,

    /// Stop sequences forwarded to the provider.
    #[serde(default)]
    pub stop: Vec<String>,

    /// Extra request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Model context window, when known. Zero means unreported.
    #[serde(default)]
    pub context_window: usize,

    #[serde(default)]
    pub supports_tools: bool,

    #[serde(default)]
    pub supports_vision: bool,
}

impl ApiConfig {
    /// Per-request timeout with the default applied.
    pub fn request_timeout(&self) -> Duration {
        if self.timeout_seconds > 0 {
            Duration::from_secs(self.timeout_seconds)
        } else {
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)
        }
    }

    /// Resolve the configured API key, following a `$NAME` indirection
    /// through the environment. An empty key resolves to an empty secret
    /// (local endpoints often need none).
    pub fn resolve_api_key(&self) -> Result<SecretString, ConfigError> {
        let raw = self.api_key.trim();
        if raw.is_empty() {
            return Ok(SecretString::new(String::new()));
        }
        if let Some(name) = raw.strip_prefix('$') {
            if name.is_empty() {
                return Err(ConfigError::InvalidApiKey(self.api_key.clone()));
            }
            return Ok(SecretString::new(env::var(name).unwrap_or_default()));
        }
        Ok(SecretString::new(raw.to_string()))
    }
}

/// Signing backend selection for one identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignerConfig {
    /// "remote" (session signer over the signing protocol) or "local".
    #[serde(default)]
    pub kind: String,

    /// Signer service URL for the remote backend.
    #[serde(default)]
    pub remote_url: String,

    /// Hex-encoded secret key for the local backend (development only).
    #[serde(default)]
    pub local_key: String,
}

/// One provisioned agent identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub pubkey: String,
    #[serde(default)]
    pub signer: SignerConfig,
    #[serde(default)]
    pub profile: Option<HashMap<String, String>>,
}

/// Periodic-task cadences for the publishing stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NostrDefaults {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_spool_drain_interval")]
    pub spool_drain_interval_seconds: u64,
    #[serde(default = "default_convoy_recompute_interval")]
    pub convoy_recompute_interval_seconds: u64,
    #[serde(default = "default_issue_mirror_interval")]
    pub issue_mirror_interval_seconds: u64,
}

fn default_heartbeat_interval() -> u64 {
    60
}
fn default_spool_drain_interval() -> u64 {
    300
}
fn default_convoy_recompute_interval() -> u64 {
    120
}
fn default_issue_mirror_interval() -> u64 {
    300
}

impl Default for NostrDefaults {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval(),
            spool_drain_interval_seconds: default_spool_drain_interval(),
            convoy_recompute_interval_seconds: default_convoy_recompute_interval(),
            issue_mirror_interval_seconds: default_issue_mirror_interval(),
        }
    }
}

/// Configuration for the Nostr publishing stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NostrConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub read_relays: Vec<String>,

    #[serde(default)]
    pub write_relays: Vec<String>,

    /// Relays preferred for private messages.
    #[serde(default)]
    pub dm_relays: Vec<String>,

    /// Content-addressed blob servers (consumed by clients of the core).
    #[serde(default)]
    pub blossom_servers: Vec<String>,

    /// Role name → identity.
    #[serde(default)]
    pub identities: HashMap<String, IdentityConfig>,

    #[serde(default)]
    pub defaults: NostrDefaults,
}

/// True when the named environment flag is set to a truthy value.
pub fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Whether Nostr publishing is enabled for this process.
pub fn nostr_enabled() -> bool {
    env_flag(ENV_NOSTR_ENABLED)
}

/// Heartbeat-cadence override from the environment, if any.
pub fn heartbeat_interval_override() -> Option<Duration> {
    env::var(ENV_HEARTBEAT_INTERVAL)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

/// Bearer token for the remote tool server, if configured.
pub fn mcp_token_from_env() -> Option<String> {
    env::var(ENV_MCP_TOKEN).ok().filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_request_timeout_default() {
        let cfg = ApiConfig::default();
        assert_eq!(cfg.request_timeout(), Duration::from_secs(300));

        let cfg = ApiConfig {
            timeout_seconds: 30,
            ..Default::default()
        };
        assert_eq!(cfg.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_resolve_api_key_literal() {
        let cfg = ApiConfig {
            api_key: "sk-literal".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.resolve_api_key().unwrap().expose_secret(), "sk-literal");
    }

    #[test]
    fn test_resolve_api_key_env_indirection() {
        std::env::set_var("GASTOWN_TEST_KEY", "from-env");
        let cfg = ApiConfig {
            api_key: "$GASTOWN_TEST_KEY".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.resolve_api_key().unwrap().expose_secret(), "from-env");
    }

    #[test]
    fn test_resolve_api_key_bare_dollar_is_invalid() {
        let cfg = ApiConfig {
            api_key: "$".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            cfg.resolve_api_key(),
            Err(ConfigError::InvalidApiKey(_))
        ));
    }

    #[test]
    fn test_resolve_api_key_empty_is_empty_secret() {
        let cfg = ApiConfig::default();
        assert_eq!(cfg.resolve_api_key().unwrap().expose_secret(), "");
    }

    #[test]
    fn test_nostr_defaults() {
        let d = NostrDefaults::default();
        assert_eq!(d.heartbeat_interval_seconds, 60);
        assert_eq!(d.spool_drain_interval_seconds, 300);
    }

    #[test]
    fn test_nostr_config_deserializes_with_missing_fields() {
        let cfg: NostrConfig = serde_json::from_str(r#"{"enabled": true}"#).unwrap();
        assert!(cfg.enabled);
        assert!(cfg.write_relays.is_empty());
        assert_eq!(cfg.defaults.heartbeat_interval_seconds, 60);
    }
}
