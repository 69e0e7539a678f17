//! The think-act-observe loop driving one autonomous worker.
//!
//! The loop owns a capacity-1 work queue: a worker handles one task at a
//! time and `assign_work` fails fast with `Busy` while a task is running.
//! Each iteration calls the model, executes any requested tool calls in
//! order, and folds the results back into the conversation. Tool failures
//! become tool-result text so the model can recover; model failures, the
//! token budget, and the iteration bound terminate the task but leave the
//! loop alive.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::agent::context::ContextManager;
use crate::llm::{ChatRequest, Client, LlmError, Message, ToolDef};
use crate::tools::{Executor, ToolError};

/// Maximum think-act-observe cycles per task.
pub const DEFAULT_MAX_ITERATIONS: u32 = 50;
/// Token budget per task.
pub const DEFAULT_MAX_TOKENS_PER_TASK: u64 = 200_000;
/// How long the loop idles before logging and re-arming.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Deadline for a single tool execution.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);
/// How long `stop` waits for the loop to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);
/// Heartbeat callback cadence, in iterations.
const HEARTBEAT_EVERY: u32 = 5;

/// Loop lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Idle,
    Working,
    Stopped,
    Error,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopState::Idle => "idle",
            LoopState::Working => "working",
            LoopState::Stopped => "stopped",
            LoopState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Periodic progress callback: `(state, iteration, total_tokens)`.
pub type HeartbeatHook = Arc<dyn Fn(LoopState, u32, u64) + Send + Sync>;
/// Task-settled callback: `(task, iterations, total_tokens, error)`.
pub type TaskCompleteHook = Arc<dyn Fn(&str, u32, u64, Option<&AgentError>) + Send + Sync>;

/// Loop behavior knobs. Zero values select the defaults.
#[derive(Clone, Default)]
pub struct AgentLoopConfig {
    /// System message prepended to every conversation.
    pub system_prompt: String,
    pub max_iterations: u32,
    pub max_tokens_per_task: u64,
    pub idle_timeout: Duration,
    pub tool_timeout: Duration,
    /// Agent role (polecat, witness, refinery, ...).
    pub role: String,
    pub rig_name: String,
    /// Full agent address, e.g. "rig/polecats/Toast".
    pub actor: String,
    pub on_heartbeat: Option<HeartbeatHook>,
    pub on_task_complete: Option<TaskCompleteHook>,
}

/// Errors that settle a task or reject a loop operation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent is already working on a task")]
    Busy,

    #[error("agent loop is stopped")]
    Stopped,

    #[error("agent loop did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error("token budget exceeded: {used} > {limit}")]
    TokenBudgetExceeded { used: u64, limit: u64 },

    #[error("max iterations ({0}) reached without completion")]
    MaxIterationsExceeded(u32),

    #[error("model call failed at iteration {iteration}: {source}")]
    Model {
        iteration: u32,
        #[source]
        source: LlmError,
    },

    #[error("task cancelled")]
    Cancelled,
}

/// Snapshot of the loop for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub state: LoopState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    pub iteration: u32,
    pub total_tokens: u64,
    pub started_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Inner {
    state: LoopState,
    current_task: Option<String>,
    iteration: u32,
    total_tokens: u64,
    started_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
    last_error: Option<String>,
}

/// Orchestrates the think-act-observe cycle for one API-mode agent. The
/// model runs remotely; tools execute locally in the worktree.
pub struct AgentLoop {
    client: Arc<dyn Client>,
    executor: Arc<Executor>,
    tools: Vec<ToolDef>,
    config: AgentLoopConfig,
    context: ContextManager,

    inner: Mutex<Inner>,
    work_tx: mpsc::Sender<String>,
    work_rx: Mutex<Option<mpsc::Receiver<String>>>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    done_tx: Mutex<Option<oneshot::Sender<()>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl AgentLoop {
    /// Create a loop over a client and executor. The tool catalog defaults
    /// to the full set; restrict it with [`AgentLoop::with_tools`].
    pub fn new(client: Arc<dyn Client>, executor: Arc<Executor>, mut config: AgentLoopConfig) -> Self {
        if config.max_iterations == 0 {
            config.max_iterations = DEFAULT_MAX_ITERATIONS;
        }
        if config.max_tokens_per_task == 0 {
            config.max_tokens_per_task = DEFAULT_MAX_TOKENS_PER_TASK;
        }
        if config.idle_timeout.is_zero() {
            config.idle_timeout = DEFAULT_IDLE_TIMEOUT;
        }
        if config.tool_timeout.is_zero() {
            config.tool_timeout = DEFAULT_TOOL_TIMEOUT;
        }

        let context = ContextManager::new(client.model_info().context_window);
        let (work_tx, work_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();

        Self {
            client,
            executor,
            tools: crate::tools::catalog(),
            config,
            context,
            inner: Mutex::new(Inner {
                state: LoopState::Stopped,
                current_task: None,
                iteration: 0,
                total_tokens: 0,
                started_at: Utc::now(),
                last_active: Utc::now(),
                last_error: None,
            }),
            work_tx,
            work_rx: Mutex::new(Some(work_rx)),
            cancel_tx,
            cancel_rx,
            done_tx: Mutex::new(Some(done_tx)),
            done_rx: Mutex::new(Some(done_rx)),
        }
    }

    /// Replace the tool catalog offered to the model.
    pub fn with_tools(mut self, tools: Vec<ToolDef>) -> Self {
        self.tools = tools;
        self
    }

    /// Run the loop until stopped. Spawn this on a task; it transitions to
    /// idle immediately and to working whenever a task arrives.
    pub async fn run(&self) {
        let Some(mut work_rx) = self.work_rx.lock().unwrap().take() else {
            tracing::warn!("agent loop already running");
            return;
        };
        let done_tx = self.done_tx.lock().unwrap().take();

        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = LoopState::Idle;
            inner.started_at = Utc::now();
            inner.last_active = Utc::now();
        }

        tracing::info!(
            actor = %self.config.actor,
            role = %self.config.role,
            rig = %self.config.rig_name,
            "agent loop started"
        );

        let mut cancel_rx = self.cancel_rx.clone();
        let idle = tokio::time::sleep(self.config.idle_timeout);
        tokio::pin!(idle);

        loop {
            if *cancel_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = cancel_rx.changed() => {
                    tracing::info!("agent loop cancelled, stopping");
                    break;
                }

                _ = &mut idle => {
                    tracing::info!(timeout = ?self.config.idle_timeout, "idle timeout reached, still waiting for work");
                    idle.as_mut()
                        .reset(tokio::time::Instant::now() + self.config.idle_timeout);
                }

                task = work_rx.recv() => {
                    let Some(task) = task else { break };
                    self.handle_task(&mut cancel_rx, &task).await;
                    idle.as_mut()
                        .reset(tokio::time::Instant::now() + self.config.idle_timeout);
                }
            }
        }

        self.inner.lock().unwrap().state = LoopState::Stopped;
        drop(done_tx);
    }

    /// Hand a task to the running loop. Non-blocking: fails with `Busy`
    /// while a task is in flight and `Stopped` once the loop is down.
    pub fn assign_work(&self, task: impl Into<String>) -> Result<(), AgentError> {
        let state = self.inner.lock().unwrap().state;
        match state {
            LoopState::Stopped => return Err(AgentError::Stopped),
            LoopState::Working => return Err(AgentError::Busy),
            _ => {}
        }

        self.work_tx.try_send(task.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AgentError::Busy,
            mpsc::error::TrySendError::Closed(_) => AgentError::Stopped,
        })
    }

    /// Cancel the loop and wait for it to wind down.
    pub async fn stop(&self) -> Result<(), AgentError> {
        if self.inner.lock().unwrap().state == LoopState::Stopped {
            return Ok(());
        }

        let _ = self.cancel_tx.send(true);

        let done_rx = self.done_rx.lock().unwrap().take();
        if let Some(done_rx) = done_rx {
            match tokio::time::timeout(STOP_TIMEOUT, done_rx).await {
                Ok(_) => Ok(()),
                Err(_) => Err(AgentError::StopTimeout(STOP_TIMEOUT)),
            }
        } else {
            Ok(())
        }
    }

    /// Current loop status.
    pub fn status(&self) -> LoopStatus {
        let inner = self.inner.lock().unwrap();
        LoopStatus {
            state: inner.state,
            current_task: inner.current_task.clone(),
            iteration: inner.iteration,
            total_tokens: inner.total_tokens,
            started_at: inner.started_at,
            last_active: inner.last_active,
            error: inner.last_error.clone(),
        }
    }

    /// True while the loop is idle or working.
    pub fn is_running(&self) -> bool {
        matches!(
            self.inner.lock().unwrap().state,
            LoopState::Idle | LoopState::Working
        )
    }

    async fn handle_task(&self, cancel_rx: &mut watch::Receiver<bool>, task: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = LoopState::Working;
            inner.current_task = Some(task.to_string());
            inner.iteration = 0;
            inner.total_tokens = 0;
            inner.last_active = Utc::now();
        }

        let result = self.run_task(cancel_rx, task).await;

        let (iterations, total_tokens) = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = LoopState::Idle;
            inner.current_task = None;
            inner.last_active = Utc::now();
            if let Err(err) = &result {
                inner.last_error = Some(err.to_string());
            }
            (inner.iteration, inner.total_tokens)
        };

        if let Err(err) = &result {
            tracing::error!(error = %err, "task failed");
        }

        if let Some(hook) = &self.config.on_task_complete {
            hook(task, iterations, total_tokens, result.as_ref().err());
        }
    }

    /// One task through the think-act-observe cycle.
    async fn run_task(
        &self,
        cancel_rx: &mut watch::Receiver<bool>,
        task: &str,
    ) -> Result<(), AgentError> {
        let mut messages = Vec::new();
        if !self.config.system_prompt.is_empty() {
            messages.push(Message::system(&self.config.system_prompt));
        }
        messages.push(Message::user(task));

        for i in 1..=self.config.max_iterations {
            if *cancel_rx.borrow() {
                return Err(AgentError::Cancelled);
            }

            {
                let mut inner = self.inner.lock().unwrap();
                inner.iteration = i;
                inner.last_active = Utc::now();
            }

            if self.context.needs_truncation(&messages) {
                tracing::info!(iteration = i, "context window pressure, truncating");
                messages = self.context.truncate(&messages);
            }

            // Think: call the model. Cancellation drops the in-flight call.
            let req = ChatRequest {
                messages: messages.clone(),
                tools: self.tools.clone(),
                ..Default::default()
            };
            let resp = tokio::select! {
                _ = cancel_rx.changed() => return Err(AgentError::Cancelled),
                r = self.client.chat(&req) => {
                    r.map_err(|source| AgentError::Model { iteration: i, source })?
                }
            };

            if let Some(usage) = resp.usage {
                let total = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.total_tokens += usage.total_tokens;
                    inner.total_tokens
                };
                if total > self.config.max_tokens_per_task {
                    return Err(AgentError::TokenBudgetExceeded {
                        used: total,
                        limit: self.config.max_tokens_per_task,
                    });
                }
            }

            messages.push(Message::assistant_with_tool_calls(
                resp.content.clone(),
                resp.tool_calls.clone(),
            ));

            // No tool calls: the model is done with the task.
            if resp.tool_calls.is_empty() {
                let total = self.inner.lock().unwrap().total_tokens;
                tracing::info!(iterations = i, total_tokens = total, "task complete");
                return Ok(());
            }

            // Act: execute each tool call in the order the model returned
            // them, each under a fresh deadline.
            for tc in &resp.tool_calls {
                let result = match tokio::time::timeout(
                    self.config.tool_timeout,
                    self.executor.execute(tc),
                )
                .await
                {
                    Ok(Ok(output)) => output,
                    Ok(Err(err)) => {
                        tracing::warn!(tool = %tc.name, error = %err, "tool error");
                        format!("Error executing {}: {}", tc.name, err)
                    }
                    Err(_) => {
                        let err = ToolError::Timeout {
                            duration: self.config.tool_timeout,
                            output: String::new(),
                        };
                        tracing::warn!(tool = %tc.name, error = %err, "tool error");
                        format!("Error executing {}: {}", tc.name, err)
                    }
                };

                // Observe: fold the result back into the conversation.
                messages.push(Message::tool_result(tc.id.clone(), tc.name.clone(), result));
            }

            if i % HEARTBEAT_EVERY == 0 {
                if let Some(hook) = &self.config.on_heartbeat {
                    let total = self.inner.lock().unwrap().total_tokens;
                    hook(LoopState::Working, i, total);
                }
            }
        }

        Err(AgentError::MaxIterationsExceeded(self.config.max_iterations))
    }
}
