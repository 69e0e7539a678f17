//! Remote tool server.
//!
//! Exposes the worktree executor over HTTP so agents on other machines can
//! reach local repos, the issue store, and orchestrator commands. The
//! surface is four endpoints: health, tool listing, tool calls, and an SSE
//! liveness stream. With a bearer token configured, every endpoint except
//! health requires it; without one the server runs open (development).

pub mod discovery;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, Sse};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use crate::llm::{ToolCall, ToolDef};
use crate::tools::Executor;

pub use discovery::{local_ip, Discovery, ServiceInfo};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 9500;
/// Graceful-shutdown drain deadline.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on a single remote tool call; tool calls can be slow.
const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(300);
/// SSE heartbeat cadence.
const SSE_HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

/// Errors from server startup and shutdown.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("binding {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("server is not running")]
    NotRunning,
}

/// Tool server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address. Defaults to localhost on [`DEFAULT_PORT`].
    pub addr: SocketAddr,
    /// Bearer token; `None` runs the server open.
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            auth_token: crate::config::mcp_token_from_env(),
        }
    }
}

struct ServerState {
    executor: Arc<Executor>,
    /// Registration order; `tools/list` emits it verbatim.
    tools: Vec<ToolDef>,
    auth_token: Option<String>,
    started: AtomicBool,
}

/// HTTP server exposing the executor's tool catalog to remote agents.
pub struct ToolServer {
    state: Arc<ServerState>,
    config: ServerConfig,
    bound_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ToolServer {
    /// Create a server over an executor with the full tool catalog.
    pub fn new(executor: Arc<Executor>, config: ServerConfig) -> Self {
        Self::with_tools(executor, crate::tools::catalog(), config)
    }

    /// Create a server over an explicit (possibly filtered) catalog.
    pub fn with_tools(executor: Arc<Executor>, tools: Vec<ToolDef>, config: ServerConfig) -> Self {
        Self {
            state: Arc::new(ServerState {
                executor,
                tools,
                auth_token: config.auth_token.clone(),
                started: AtomicBool::new(false),
            }),
            config,
            bound_addr: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        let state = self.state.clone();

        let protected = Router::new()
            .route("/mcp/tools/list", get(handle_tools_list).post(handle_tools_list))
            .route("/mcp/tools/call", post(handle_tools_call))
            .route("/mcp/sse", get(handle_sse))
            .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

        let app = Router::new()
            .route("/mcp/health", get(handle_health))
            .merge(protected)
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.addr,
                source,
            })?;
        let bound = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: self.config.addr,
            source,
        })?;
        self.bound_addr = Some(bound);
        state.started.store(true, Ordering::SeqCst);

        tracing::info!(addr = %bound, tools = state.tools.len(), "tool server listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("tool server shutting down");
                })
                .await
            {
                tracing::error!(error = %e, "tool server error");
            }
        });
        self.handle = Some(handle);

        Ok(())
    }

    /// Signal shutdown and drain in-flight requests, aborting past the
    /// drain deadline.
    pub async fn shutdown(&mut self) {
        self.state.started.store(false, Ordering::SeqCst);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("tool server did not drain in time");
                abort.abort();
            }
        }
    }

    /// The bound address once the server has started.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }
}

async fn require_bearer(
    State(state): State<Arc<ServerState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(token) = &state.auth_token {
        let expected = format!("Bearer {token}");
        let presented = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }
    Ok(next.run(req).await)
}

async fn handle_health(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "tools": state.tools.len(),
        "started": state.started.load(Ordering::SeqCst),
        "work_dir": state.executor.work_dir().display().to_string(),
    }))
}

#[derive(Serialize)]
struct ToolListEntry<'a> {
    name: &'a str,
    description: &'a str,
    #[serde(rename = "inputSchema")]
    input_schema: &'a serde_json::Value,
}

async fn handle_tools_list(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    let tools: Vec<ToolListEntry> = state
        .tools
        .iter()
        .map(|t| ToolListEntry {
            name: &t.name,
            description: &t.description,
            input_schema: &t.parameters,
        })
        .collect();
    Json(serde_json::json!({ "tools": tools }))
}

#[derive(Debug, Deserialize)]
struct ToolCallRequest {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ToolCallResponse {
    content: Vec<ToolContent>,
    #[serde(rename = "isError", skip_serializing_if = "std::ops::Not::not")]
    is_error: bool,
}

#[derive(Debug, Serialize)]
struct ToolContent {
    #[serde(rename = "type")]
    content_type: &'static str,
    text: String,
}

fn text_response(text: String, is_error: bool) -> Json<ToolCallResponse> {
    Json(ToolCallResponse {
        content: vec![ToolContent {
            content_type: "text",
            text,
        }],
        is_error,
    })
}

async fn handle_tools_call(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<ToolCallRequest>,
) -> Json<ToolCallResponse> {
    if !state.tools.iter().any(|t| t.name == req.name) {
        return text_response(format!("Unknown tool: {}", req.name), true);
    }

    let call = ToolCall {
        id: format!("mcp-{}", req.name),
        name: req.name.clone(),
        arguments: req.arguments,
    };

    match tokio::time::timeout(TOOL_CALL_TIMEOUT, state.executor.execute(&call)).await {
        Ok(Ok(output)) => text_response(output, false),
        Ok(Err(err)) => text_response(format!("Error: {err}"), true),
        Err(_) => text_response(
            format!("Error: tool call timed out after {TOOL_CALL_TIMEOUT:?}"),
            true,
        ),
    }
}

async fn handle_sse(
    State(_state): State<Arc<ServerState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let connected = tokio_stream::once(Ok(Event::default()
        .event("connected")
        .data(r#"{"status":"ok"}"#)));

    let ticks = IntervalStream::new(tokio::time::interval_at(
        tokio::time::Instant::now() + SSE_HEARTBEAT_PERIOD,
        SSE_HEARTBEAT_PERIOD,
    ))
    .map(|_| {
        let data = serde_json::json!({ "time": chrono::Utc::now().to_rfc3339() });
        Ok(Event::default().event("heartbeat").data(data.to_string()))
    });

    Sse::new(connected.chain(ticks))
}
