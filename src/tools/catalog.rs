//! The fixed tool catalog exposed to agents.
//!
//! These definitions are served to API-mode agents as function-calling
//! tools and to remote agents through the tool server. The catalog order is
//! the registration order and is stable; `tools/list` emits it verbatim.

use serde_json::json;

use crate::llm::ToolDef;

/// The full tool catalog, in registration order.
pub fn catalog() -> Vec<ToolDef> {
    vec![
        ToolDef {
            name: "planner-context".to_string(),
            description: "Read the current work assignment and surrounding context. \
                          Call this first when starting work."
                .to_string(),
            parameters: json!({"type": "object", "properties": {}, "required": []}),
        },
        ToolDef {
            name: "mark-done".to_string(),
            description: "Mark the current task as complete. Commits work and signals \
                          the supervising agent."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "Completion summary describing what was done"
                    }
                },
                "required": ["message"]
            }),
        },
        ToolDef {
            name: "issue-show".to_string(),
            description: "Show details of a tracked issue: status, description, \
                          dependencies, and comments."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "id": {
                        "type": "string",
                        "description": "The issue identifier (e.g., 'gt-abc123')"
                    }
                },
                "required": ["id"]
            }),
        },
        ToolDef {
            name: "issue-list".to_string(),
            description: "List tracked issues with optional status or label filters.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "status": {
                        "type": "string",
                        "description": "Filter by status: open, in-progress, closed"
                    },
                    "label": {
                        "type": "string",
                        "description": "Filter by label"
                    }
                },
                "required": []
            }),
        },
        ToolDef {
            name: "issue-update".to_string(),
            description: "Update a tracked issue's status or add a comment.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "id": {
                        "type": "string",
                        "description": "The issue identifier"
                    },
                    "status": {
                        "type": "string",
                        "description": "New status: open, in-progress, closed"
                    },
                    "comment": {
                        "type": "string",
                        "description": "Optional comment to add"
                    }
                },
                "required": ["id"]
            }),
        },
        ToolDef {
            name: "vcs-diff".to_string(),
            description: "Show the diff of current changes in the working directory.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "staged": {
                        "type": "boolean",
                        "description": "If true, show staged changes only"
                    },
                    "path": {
                        "type": "string",
                        "description": "Optional path to restrict the diff to"
                    }
                },
                "required": []
            }),
        },
        ToolDef {
            name: "vcs-status".to_string(),
            description: "Show the short status of the working directory.".to_string(),
            parameters: json!({"type": "object", "properties": {}, "required": []}),
        },
        ToolDef {
            name: "vcs-commit".to_string(),
            description: "Stage changes and commit with a message.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "Commit message"
                    },
                    "paths": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Optional specific paths to stage (default: all)"
                    }
                },
                "required": ["message"]
            }),
        },
        ToolDef {
            name: "file-read".to_string(),
            description: "Read file contents with line numbers. Supports an optional \
                          1-based line range."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path relative to the working directory"
                    },
                    "start_line": {
                        "type": "integer",
                        "description": "Optional 1-based start line"
                    },
                    "end_line": {
                        "type": "integer",
                        "description": "Optional 1-based end line"
                    }
                },
                "required": ["path"]
            }),
        },
        ToolDef {
            name: "file-write".to_string(),
            description: "Write content to a file. Creates parent directories if needed."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path relative to the working directory"
                    },
                    "content": {
                        "type": "string",
                        "description": "Content to write"
                    }
                },
                "required": ["path", "content"]
            }),
        },
        ToolDef {
            name: "file-edit".to_string(),
            description: "Apply a search-and-replace edit to a file. Replaces the first \
                          occurrence of the search text (exact match, not regex)."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path relative to the working directory"
                    },
                    "search": {
                        "type": "string",
                        "description": "Text to find (exact match)"
                    },
                    "replace": {
                        "type": "string",
                        "description": "Replacement text"
                    }
                },
                "required": ["path", "search", "replace"]
            }),
        },
        ToolDef {
            name: "file-list".to_string(),
            description: "List files and directories in a path, like 'ls' or 'find'.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Directory to list (default: working directory root)"
                    },
                    "recursive": {
                        "type": "boolean",
                        "description": "If true, list recursively"
                    },
                    "pattern": {
                        "type": "string",
                        "description": "Optional glob pattern applied to file names"
                    }
                },
                "required": []
            }),
        },
        ToolDef {
            name: "file-search".to_string(),
            description: "Search file contents across the working tree using grep-like \
                          matching."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": {
                        "type": "string",
                        "description": "Search pattern (regex supported)"
                    },
                    "path": {
                        "type": "string",
                        "description": "Optional path to restrict the search to"
                    },
                    "include": {
                        "type": "string",
                        "description": "Optional file glob to include (e.g., '*.rs')"
                    }
                },
                "required": ["pattern"]
            }),
        },
        ToolDef {
            name: "shell-exec".to_string(),
            description: "Execute a shell command in the working directory. Use sparingly; \
                          prefer the specific tools when one fits."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "Shell command to execute"
                    },
                    "timeout_seconds": {
                        "type": "integer",
                        "description": "Maximum execution time in seconds (default: 120)"
                    }
                },
                "required": ["command"]
            }),
        },
        ToolDef {
            name: "mail-send".to_string(),
            description: "Send a message to another agent or a broadcast channel.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "to": {
                        "type": "string",
                        "description": "Recipient address (e.g., 'rig/witness' or 'rig/polecats/Name')"
                    },
                    "subject": {
                        "type": "string",
                        "description": "Message subject"
                    },
                    "body": {
                        "type": "string",
                        "description": "Message body"
                    }
                },
                "required": ["to", "subject"]
            }),
        },
        ToolDef {
            name: "mail-read".to_string(),
            description: "Read messages from the agent's mailbox.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "count": {
                        "type": "integer",
                        "description": "Maximum number of messages to return (default: 10)"
                    },
                    "unread_only": {
                        "type": "boolean",
                        "description": "If true, only return unread messages"
                    }
                },
                "required": []
            }),
        },
    ]
}

/// Names of every tool in the catalog, in registration order.
pub fn tool_names() -> Vec<String> {
    catalog().into_iter().map(|t| t.name).collect()
}

/// Restrict the catalog to the allowed names. An empty allow-list returns
/// the full catalog.
pub fn filter_catalog(allowed: &[String]) -> Vec<ToolDef> {
    if allowed.is_empty() {
        return catalog();
    }
    catalog()
        .into_iter()
        .filter(|t| allowed.iter().any(|a| a == &t.name))
        .collect()
}
