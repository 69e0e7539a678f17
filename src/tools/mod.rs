//! Tool catalog and the worktree-sandboxed executor.

mod catalog;
mod executor;

pub use catalog::{catalog, filter_catalog, tool_names};
pub use executor::{
    Executor, ToolError, DEFAULT_SHELL_TIMEOUT, MAX_FILE_READ_SIZE, MAX_OUTPUT_SIZE,
};
