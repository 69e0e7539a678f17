//! The think-act-observe agent loop and its context-window management.

mod context;
mod worker;

pub use context::{
    estimate_conversation_tokens, estimate_message_tokens, estimate_tokens, ContextManager,
    CONTEXT_RESERVE, DEFAULT_CONTEXT_WINDOW, TOKENS_PER_CHAR,
};
pub use worker::{
    AgentError, AgentLoop, AgentLoopConfig, HeartbeatHook, LoopState, LoopStatus,
    TaskCompleteHook, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_ITERATIONS, DEFAULT_MAX_TOKENS_PER_TASK,
    DEFAULT_TOOL_TIMEOUT,
};
