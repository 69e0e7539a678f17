//! Context-window tracking and conversation truncation.
//!
//! Token estimation is deliberately cheap: a character-count heuristic plus
//! fixed per-turn and per-tool-call overheads. Truncation keeps the leading
//! system turn and a trailing suffix, replacing the dropped middle with one
//! synthetic summary turn. The summary rides as a user turn so both wire
//! dialects accept it.

use std::collections::BTreeMap;

use crate::llm::{Message, Role};

/// Assumed window when the model does not report one.
pub const DEFAULT_CONTEXT_WINDOW: usize = 128_000;
/// Fraction of the window reserved for the response.
pub const CONTEXT_RESERVE: f64 = 0.15;
/// Rough tokens-per-character estimate (~3.5 chars per token for code).
pub const TOKENS_PER_CHAR: f64 = 0.28;

/// Trailing turns always preserved by truncation.
const MIN_KEEP_END: usize = 6;
/// Character cap applied to oversized tool results.
const MAX_TOOL_RESULT_CHARS: usize = 2000;
const TOOL_RESULT_MARKER: &str = "\n... (truncated for context window)";

/// Tracks conversation size against the usable context window.
#[derive(Debug, Clone)]
pub struct ContextManager {
    context_window: usize,
    max_tokens: usize,
}

impl ContextManager {
    /// Create a manager for the given window. Zero selects the default.
    pub fn new(context_window: usize) -> Self {
        let window = if context_window == 0 {
            DEFAULT_CONTEXT_WINDOW
        } else {
            context_window
        };
        Self {
            context_window: window,
            max_tokens: (window as f64 * (1.0 - CONTEXT_RESERVE)) as usize,
        }
    }

    /// Usable tokens after the response reserve.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// True when the conversation likely exceeds the usable window.
    pub fn needs_truncation(&self, messages: &[Message]) -> bool {
        estimate_conversation_tokens(messages) > self.max_tokens
    }

    /// Reduce a conversation to fit the usable window.
    ///
    /// Keeps the leading system turn (if present) and the trailing
    /// [`MIN_KEEP_END`] turns; the dropped middle is replaced by one
    /// synthetic user turn summarizing what was removed. If the result is
    /// still over budget, oversized tool results are trimmed. Idempotent:
    /// a conversation that fits is returned unchanged.
    pub fn truncate(&self, messages: &[Message]) -> Vec<Message> {
        if !self.needs_truncation(messages) {
            return messages.to_vec();
        }

        if messages.len() <= MIN_KEEP_END + 1 {
            // Too short to drop turns; only trim oversized tool results.
            return trim_tool_results(messages);
        }

        let mut result = Vec::new();

        let start_idx = if messages.first().map(|m| m.role) == Some(Role::System) {
            result.push(messages[0].clone());
            1
        } else {
            0
        };

        let keep_from = (messages.len() - MIN_KEEP_END).max(start_idx);

        if keep_from > start_idx {
            let dropped = &messages[start_idx..keep_from];
            let mut summary = format!("[{} earlier messages summarized]\n", dropped.len());
            summary.push_str(&summarize_messages(dropped));
            result.push(Message::user(summary));
        }

        result.extend_from_slice(&messages[keep_from..]);

        if self.needs_truncation(&result) {
            result = trim_tool_results(&result);
        }

        result
    }

    /// Human-readable context usage line for logs and status output.
    pub fn usage_report(&self, messages: &[Message]) -> String {
        let current = estimate_conversation_tokens(messages);
        let pct = current as f64 / self.max_tokens as f64 * 100.0;
        format!(
            "Context: ~{}/{} tokens ({:.0}% of usable window, {} total)",
            current, self.max_tokens, pct, self.context_window
        )
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Rough token count for a string.
pub fn estimate_tokens(s: &str) -> usize {
    (s.len() as f64 * TOKENS_PER_CHAR) as usize
}

/// Estimated tokens for one turn, including role and tool-call overhead.
pub fn estimate_message_tokens(msg: &Message) -> usize {
    let mut tokens = estimate_tokens(&msg.content);
    tokens += 4;
    for tc in &msg.tool_calls {
        tokens += estimate_tokens(&tc.name);
        tokens += estimate_tokens(&tc.arguments.to_string());
        tokens += 10;
    }
    if msg.tool_call_id.is_some() {
        tokens += 10;
    }
    tokens
}

/// Estimated tokens for a whole conversation.
pub fn estimate_conversation_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Trim tool-result turns whose content exceeds the per-result cap.
fn trim_tool_results(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|msg| {
            if msg.role == Role::Tool && msg.content.len() > MAX_TOOL_RESULT_CHARS {
                let mut cut = MAX_TOOL_RESULT_CHARS;
                while cut > 0 && !msg.content.is_char_boundary(cut) {
                    cut -= 1;
                }
                let mut trimmed = msg.clone();
                trimmed.content = format!("{}{}", &msg.content[..cut], TOOL_RESULT_MARKER);
                trimmed
            } else {
                msg.clone()
            }
        })
        .collect()
}

/// Count the dropped turns by role, with a per-tool-name call histogram.
fn summarize_messages(messages: &[Message]) -> String {
    let mut user_msgs = 0;
    let mut assistant_msgs = 0;
    let mut tool_results = 0;
    let mut tool_calls = 0;
    let mut by_tool: BTreeMap<&str, usize> = BTreeMap::new();

    for msg in messages {
        match msg.role {
            Role::User => user_msgs += 1,
            Role::Assistant => {
                assistant_msgs += 1;
                tool_calls += msg.tool_calls.len();
                for tc in &msg.tool_calls {
                    *by_tool.entry(tc.name.as_str()).or_default() += 1;
                }
            }
            Role::Tool => tool_results += 1,
            Role::System => {}
        }
    }

    let mut out = String::new();
    if user_msgs > 0 {
        out.push_str(&format!("- {user_msgs} user messages\n"));
    }
    if assistant_msgs > 0 {
        out.push_str(&format!("- {assistant_msgs} assistant responses\n"));
    }
    if tool_results > 0 {
        out.push_str(&format!("- {tool_results} tool results\n"));
    }
    if tool_calls > 0 {
        let breakdown: Vec<String> = by_tool
            .iter()
            .map(|(name, count)| format!("{name}({count})"))
            .collect();
        out.push_str(&format!("- {} tool calls: {}\n", tool_calls, breakdown.join(", ")));
    }
    out
}
