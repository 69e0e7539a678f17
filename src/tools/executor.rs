//! Sandboxed tool-call execution inside a git worktree.
//!
//! Every path argument is normalized and checked against the worktree under
//! symlink resolution before any filesystem access; every subprocess runs
//! with the worktree as its working directory and the orchestrator identity
//! exported in the environment. Output is capped and stderr is folded in
//! behind a `STDERR:` marker.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::llm::ToolCall;

/// Default timeout for shell commands and subprocess tools.
pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(120);
/// Maximum file size `file-read` will open (10 MB).
pub const MAX_FILE_READ_SIZE: u64 = 10 * 1024 * 1024;
/// Maximum tool output size (100 KB); longer output is truncated.
pub const MAX_OUTPUT_SIZE: usize = 100 * 1024;

const TRUNCATION_MARKER: &str = "\n... (truncated)";

/// Errors surfaced by tool execution. Inside the agent loop these become
/// tool-result text so the model can recover; they only propagate as errors
/// to direct callers such as the tool server.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("path {path:?} is outside working directory")]
    PathOutsideWorktree { path: String },

    #[error("file too large ({size} bytes, max {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("search text not found in {0}")]
    SearchTextNotFound(String),

    /// Non-zero exit. Partial output is preserved in the message so the
    /// model sees what the command printed before failing.
    #[error("command failed with exit code {exit_code}: {output}")]
    SubprocessFailed { exit_code: i32, output: String },

    /// Deadline exceeded while a subprocess was running. Output captured up
    /// to that point is preserved.
    #[error("command timed out after {duration:?}")]
    Timeout { duration: Duration, output: String },
}

/// Executes tool calls against one worktree.
#[derive(Debug, Clone)]
pub struct Executor {
    work_dir: PathBuf,
    rig_name: String,
    town_root: String,
    actor: String,
    role: String,
}

impl Executor {
    /// Create an executor sandboxed to `work_dir`.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            rig_name: String::new(),
            town_root: String::new(),
            actor: String::new(),
            role: "worker".to_string(),
        }
    }

    pub fn with_rig(mut self, rig_name: impl Into<String>) -> Self {
        self.rig_name = rig_name.into();
        self
    }

    pub fn with_town_root(mut self, town_root: impl Into<String>) -> Self {
        self.town_root = town_root.into();
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// The worktree this executor is sandboxed to.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Run one tool call and return its output text.
    pub async fn execute(&self, call: &ToolCall) -> Result<String, ToolError> {
        match call.name.as_str() {
            "planner-context" => self.exec_planner_context().await,
            "mark-done" => self.exec_mark_done(&call.arguments).await,
            "issue-show" => self.exec_issue_show(&call.arguments).await,
            "issue-list" => self.exec_issue_list(&call.arguments).await,
            "issue-update" => self.exec_issue_update(&call.arguments).await,
            "vcs-diff" => self.exec_vcs_diff(&call.arguments).await,
            "vcs-status" => self.exec_vcs_status().await,
            "vcs-commit" => self.exec_vcs_commit(&call.arguments).await,
            "file-read" => self.exec_file_read(&call.arguments).await,
            "file-write" => self.exec_file_write(&call.arguments).await,
            "file-edit" => self.exec_file_edit(&call.arguments).await,
            "file-list" => self.exec_file_list(&call.arguments).await,
            "file-search" => self.exec_file_search(&call.arguments).await,
            "shell-exec" => self.exec_shell(&call.arguments).await,
            "mail-send" => self.exec_mail_send(&call.arguments).await,
            "mail-read" => self.exec_mail_read(&call.arguments).await,
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    // --- subprocess tools ---

    async fn exec_planner_context(&self) -> Result<String, ToolError> {
        self.run_command("gt", &["prime"], DEFAULT_SHELL_TIMEOUT).await
    }

    async fn exec_mark_done(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        #[derive(Deserialize)]
        struct Params {
            message: String,
        }
        let params: Params = parse_args("mark-done", args)?;
        if params.message.is_empty() {
            return Err(ToolError::InvalidArguments(
                "mark-done requires a message".to_string(),
            ));
        }
        self.run_command("gt", &["done", "-m", params.message.as_str()], DEFAULT_SHELL_TIMEOUT)
            .await
    }

    async fn exec_issue_show(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        #[derive(Deserialize)]
        struct Params {
            id: String,
        }
        let params: Params = parse_args("issue-show", args)?;
        if params.id.is_empty() {
            return Err(ToolError::InvalidArguments("issue-show requires id".to_string()));
        }
        self.run_command("bd", &["show", params.id.as_str()], DEFAULT_SHELL_TIMEOUT).await
    }

    async fn exec_issue_list(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            status: String,
            #[serde(default)]
            label: String,
        }
        let params: Params = parse_optional_args(args);
        let mut cmd_args = vec!["list"];
        if !params.status.is_empty() {
            cmd_args.extend(["--status", params.status.as_str()]);
        }
        if !params.label.is_empty() {
            cmd_args.extend(["--label", params.label.as_str()]);
        }
        self.run_command("bd", &cmd_args, DEFAULT_SHELL_TIMEOUT).await
    }

    async fn exec_issue_update(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        #[derive(Deserialize)]
        struct Params {
            id: String,
            #[serde(default)]
            status: String,
            #[serde(default)]
            comment: String,
        }
        let params: Params = parse_args("issue-update", args)?;
        if params.id.is_empty() {
            return Err(ToolError::InvalidArguments("issue-update requires id".to_string()));
        }
        let mut cmd_args = vec!["update", params.id.as_str()];
        if !params.status.is_empty() {
            cmd_args.extend(["--status", params.status.as_str()]);
        }
        if !params.comment.is_empty() {
            cmd_args.extend(["--comment", params.comment.as_str()]);
        }
        self.run_command("bd", &cmd_args, DEFAULT_SHELL_TIMEOUT).await
    }

    async fn exec_vcs_diff(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            staged: bool,
            #[serde(default)]
            path: String,
        }
        let params: Params = parse_optional_args(args);
        let mut cmd_args = vec!["diff".to_string()];
        if params.staged {
            cmd_args.push("--staged".to_string());
        }
        if !params.path.is_empty() {
            let safe = self.safe_path(&params.path)?;
            cmd_args.push("--".to_string());
            cmd_args.push(safe.to_string_lossy().into_owned());
        }
        let arg_refs: Vec<&str> = cmd_args.iter().map(|s| s.as_str()).collect();
        self.run_command("git", &arg_refs, DEFAULT_SHELL_TIMEOUT).await
    }

    async fn exec_vcs_status(&self) -> Result<String, ToolError> {
        self.run_command("git", &["status", "--short"], DEFAULT_SHELL_TIMEOUT).await
    }

    async fn exec_vcs_commit(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        #[derive(Deserialize)]
        struct Params {
            message: String,
            #[serde(default)]
            paths: Vec<String>,
        }
        let params: Params = parse_args("vcs-commit", args)?;
        if params.message.is_empty() {
            return Err(ToolError::InvalidArguments(
                "vcs-commit requires a message".to_string(),
            ));
        }

        if params.paths.is_empty() {
            self.run_command("git", &["add", "-A"], DEFAULT_SHELL_TIMEOUT).await?;
        } else {
            let mut add_args = vec!["add".to_string()];
            for p in &params.paths {
                let safe = self.safe_path(p)?;
                add_args.push(safe.to_string_lossy().into_owned());
            }
            let arg_refs: Vec<&str> = add_args.iter().map(|s| s.as_str()).collect();
            self.run_command("git", &arg_refs, DEFAULT_SHELL_TIMEOUT).await?;
        }

        self.run_command("git", &["commit", "-m", params.message.as_str()], DEFAULT_SHELL_TIMEOUT)
            .await
    }

    // --- file tools ---

    async fn exec_file_read(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        #[derive(Deserialize)]
        struct Params {
            path: String,
            #[serde(default)]
            start_line: usize,
            #[serde(default)]
            end_line: usize,
        }
        let params: Params = parse_args("file-read", args)?;
        if params.path.is_empty() {
            return Err(ToolError::InvalidArguments("file-read requires path".to_string()));
        }

        let abs = self.safe_path(&params.path)?;

        let meta = tokio::fs::metadata(&abs).await.map_err(|_| {
            ToolError::InvalidArguments(format!("file not found: {}", params.path))
        })?;
        if meta.len() > MAX_FILE_READ_SIZE {
            return Err(ToolError::FileTooLarge {
                size: meta.len(),
                max: MAX_FILE_READ_SIZE,
            });
        }

        let content = tokio::fs::read_to_string(&abs).await.map_err(|e| {
            ToolError::InvalidArguments(format!("reading file: {e}"))
        })?;

        let lines: Vec<&str> = content.lines().collect();

        if params.start_line > 0 || params.end_line > 0 {
            let start = params.start_line.max(1);
            let end = if params.end_line < 1 || params.end_line > lines.len() {
                lines.len()
            } else {
                params.end_line
            };
            if start > lines.len() {
                return Err(ToolError::InvalidArguments(format!(
                    "start_line {} exceeds file length {}",
                    start,
                    lines.len()
                )));
            }
            let mut out = String::new();
            for (i, line) in lines.iter().enumerate().take(end).skip(start - 1) {
                out.push_str(&format!("{}: {}\n", i + 1, line));
            }
            return Ok(cap_output(out));
        }

        let mut out = String::new();
        for (i, line) in lines.iter().enumerate() {
            out.push_str(&format!("{}: {}\n", i + 1, line));
        }
        Ok(cap_output(out))
    }

    async fn exec_file_write(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        #[derive(Deserialize)]
        struct Params {
            path: String,
            content: String,
        }
        let params: Params = parse_args("file-write", args)?;
        if params.path.is_empty() {
            return Err(ToolError::InvalidArguments("file-write requires path".to_string()));
        }

        let abs = self.safe_path(&params.path)?;

        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::InvalidArguments(format!("creating directories: {e}"))
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o755));
            }
        }

        tokio::fs::write(&abs, params.content.as_bytes())
            .await
            .map_err(|e| ToolError::InvalidArguments(format!("writing file: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&abs, std::fs::Permissions::from_mode(0o644));
        }

        Ok(format!("Wrote {} bytes to {}", params.content.len(), params.path))
    }

    async fn exec_file_edit(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        #[derive(Deserialize)]
        struct Params {
            path: String,
            search: String,
            #[serde(default)]
            replace: String,
        }
        let params: Params = parse_args("file-edit", args)?;
        if params.path.is_empty() || params.search.is_empty() {
            return Err(ToolError::InvalidArguments(
                "file-edit requires path and search".to_string(),
            ));
        }

        let abs = self.safe_path(&params.path)?;

        let content = tokio::fs::read_to_string(&abs).await.map_err(|e| {
            ToolError::InvalidArguments(format!("reading file: {e}"))
        })?;

        if !content.contains(&params.search) {
            return Err(ToolError::SearchTextNotFound(params.path));
        }

        let new_content = content.replacen(&params.search, &params.replace, 1);
        tokio::fs::write(&abs, new_content.as_bytes())
            .await
            .map_err(|e| ToolError::InvalidArguments(format!("writing file: {e}")))?;

        Ok(format!("Applied edit to {}", params.path))
    }

    async fn exec_file_list(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            path: String,
            #[serde(default)]
            recursive: bool,
            #[serde(default)]
            pattern: String,
        }
        let params: Params = parse_optional_args(args);

        let dir = if params.path.is_empty() {
            self.work_dir.clone()
        } else {
            self.safe_path(&params.path)?
        };

        let mut entries = Vec::new();
        collect_entries(&self.work_dir, &dir, &params.pattern, params.recursive, &mut entries)?;

        if entries.is_empty() {
            return Ok("(empty directory)".to_string());
        }

        let mut out = String::new();
        for (is_dir, rel) in entries {
            let prefix = if is_dir { "d " } else { "  " };
            out.push_str(prefix);
            out.push_str(&rel);
            out.push('\n');
        }
        Ok(cap_output(out))
    }

    async fn exec_file_search(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        #[derive(Deserialize)]
        struct Params {
            pattern: String,
            #[serde(default)]
            path: String,
            #[serde(default)]
            include: String,
        }
        let params: Params = parse_args("file-search", args)?;
        if params.pattern.is_empty() {
            return Err(ToolError::InvalidArguments(
                "file-search requires pattern".to_string(),
            ));
        }

        let search_dir = if params.path.is_empty() {
            self.work_dir.clone()
        } else {
            self.safe_path(&params.path)?
        };

        let include_arg;
        let mut cmd_args = vec!["-rn", "--color=never"];
        if !params.include.is_empty() {
            include_arg = format!("--include={}", params.include);
            cmd_args.push(include_arg.as_str());
        }
        cmd_args.push(params.pattern.as_str());
        let dir_str = search_dir.to_string_lossy().into_owned();
        cmd_args.push(dir_str.as_str());

        // grep exits 1 when nothing matches; that is not an error.
        match self.run_command("grep", &cmd_args, DEFAULT_SHELL_TIMEOUT).await {
            Ok(output) => Ok(output),
            Err(ToolError::SubprocessFailed { output, .. }) if output.trim().is_empty() => {
                Ok("(no matches found)".to_string())
            }
            Err(ToolError::SubprocessFailed { output, .. }) => Ok(cap_output(output)),
            Err(e) => Err(e),
        }
    }

    async fn exec_shell(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        #[derive(Deserialize)]
        struct Params {
            command: String,
            #[serde(default)]
            timeout_seconds: u64,
        }
        let params: Params = parse_args("shell-exec", args)?;
        if params.command.is_empty() {
            return Err(ToolError::InvalidArguments(
                "shell-exec requires command".to_string(),
            ));
        }

        let timeout = if params.timeout_seconds > 0 {
            Duration::from_secs(params.timeout_seconds)
        } else {
            DEFAULT_SHELL_TIMEOUT
        };

        self.run_command("bash", &["-l", "-c", params.command.as_str()], timeout).await
    }

    async fn exec_mail_send(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        #[derive(Deserialize)]
        struct Params {
            to: String,
            subject: String,
            #[serde(default)]
            body: String,
        }
        let params: Params = parse_args("mail-send", args)?;
        if params.to.is_empty() || params.subject.is_empty() {
            return Err(ToolError::InvalidArguments(
                "mail-send requires 'to' and 'subject'".to_string(),
            ));
        }

        let mut cmd_args = vec!["mail", "send", "--to", params.to.as_str(), "--subject", params.subject.as_str()];
        if !params.body.is_empty() {
            cmd_args.extend(["--body", params.body.as_str()]);
        }
        self.run_command("gt", &cmd_args, DEFAULT_SHELL_TIMEOUT).await
    }

    async fn exec_mail_read(&self, args: &serde_json::Value) -> Result<String, ToolError> {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            count: u32,
            #[serde(default)]
            unread_only: bool,
        }
        let params: Params = parse_optional_args(args);

        let count_str;
        let mut cmd_args = vec!["mail", "read"];
        if params.count > 0 {
            count_str = params.count.to_string();
            cmd_args.extend(["--count", count_str.as_str()]);
        }
        if params.unread_only {
            cmd_args.push("--unread");
        }
        self.run_command("gt", &cmd_args, DEFAULT_SHELL_TIMEOUT).await
    }

    // --- helpers ---

    /// Run a command in the worktree with the orchestrator identity in the
    /// environment. Stdout and stderr are captured; stderr is appended
    /// behind a `STDERR:` marker; output is capped.
    async fn run_command(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<String, ToolError> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(&self.work_dir)
            .env("GT_ROLE", &self.role)
            .env("GT_RIG", &self.rig_name)
            .env("GT_TOWN_ROOT", &self.town_root)
            .env("GT_ROOT", &self.town_root)
            .env("GT_ACTOR", &self.actor)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ToolError::SubprocessFailed {
            exit_code: -1,
            output: format!("spawning {program}: {e}"),
        })?;

        // Drain both pipes incrementally into shared buffers so a chatty
        // child cannot block on a full pipe, and so a timeout can return
        // whatever was captured up to that point.
        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = tokio::spawn(drain_pipe(child.stdout.take(), stdout_buf.clone()));
        let stderr_task = tokio::spawn(drain_pipe(child.stderr.take(), stderr_buf.clone()));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(ToolError::SubprocessFailed {
                    exit_code: -1,
                    output: format!("waiting for {program}: {e}"),
                })
            }
            Err(_) => {
                let _ = child.start_kill();
                // Orphaned grandchildren can keep the pipes open; give the
                // drain tasks a short grace period, then snapshot.
                let grace = Duration::from_secs(1);
                let _ = tokio::time::timeout(grace, stdout_task).await;
                let _ = tokio::time::timeout(grace, stderr_task).await;
                let output = assemble_output(
                    std::mem::take(&mut *stdout_buf.lock().unwrap()),
                    std::mem::take(&mut *stderr_buf.lock().unwrap()),
                );
                return Err(ToolError::Timeout { duration: timeout, output });
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;
        let output = assemble_output(
            std::mem::take(&mut *stdout_buf.lock().unwrap()),
            std::mem::take(&mut *stderr_buf.lock().unwrap()),
        );

        if !status.success() {
            return Err(ToolError::SubprocessFailed {
                exit_code: status.code().unwrap_or(-1),
                output,
            });
        }

        Ok(output)
    }

    /// Normalize a tool path argument and verify it stays inside the
    /// worktree under symlink resolution. Falls back to the parent (then
    /// the literal path) when the target does not exist yet.
    fn safe_path(&self, path: &str) -> Result<PathBuf, ToolError> {
        let candidate = Path::new(path);
        let abs = if candidate.is_absolute() {
            clean_path(candidate)
        } else {
            clean_path(&self.work_dir.join(candidate))
        };

        let resolved = match abs.canonicalize() {
            Ok(r) => r,
            Err(_) => {
                let parent_resolved = abs.parent().and_then(|p| p.canonicalize().ok());
                match (parent_resolved, abs.file_name()) {
                    (Some(parent), Some(name)) => parent.join(name),
                    _ => abs.clone(),
                }
            }
        };

        let resolved_root = self
            .work_dir
            .canonicalize()
            .unwrap_or_else(|_| self.work_dir.clone());

        if resolved.strip_prefix(&resolved_root).is_err() {
            return Err(ToolError::PathOutsideWorktree {
                path: path.to_string(),
            });
        }

        Ok(abs)
    }
}

/// Read a pipe to EOF in chunks, appending to a shared buffer as data
/// arrives.
async fn drain_pipe<R>(pipe: Option<R>, buf: Arc<Mutex<Vec<u8>>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else { return };
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.lock().unwrap().extend_from_slice(&chunk[..n]),
        }
    }
}

/// Parse required tool arguments, mapping missing fields to the argument
/// error surface.
fn parse_args<T: serde::de::DeserializeOwned>(
    tool: &str,
    args: &serde_json::Value,
) -> Result<T, ToolError> {
    serde_json::from_value(args.clone())
        .map_err(|e| ToolError::InvalidArguments(format!("parsing {tool} args: {e}")))
}

/// Parse optional tool arguments, defaulting on any shape mismatch.
fn parse_optional_args<T: serde::de::DeserializeOwned + Default>(args: &serde_json::Value) -> T {
    serde_json::from_value(args.clone()).unwrap_or_default()
}

/// Lexically clean a path: fold `.` away and resolve `..` against the
/// components before it. Root-level `..` on an absolute path stays at root.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !path.is_absolute() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Join stdout and stderr into one tool result, capped at the output limit.
fn assemble_output(stdout: Vec<u8>, stderr: Vec<u8>) -> String {
    let mut output = String::from_utf8_lossy(&stdout).into_owned();
    if !stderr.is_empty() {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str("STDERR: ");
        output.push_str(&String::from_utf8_lossy(&stderr));
    }
    cap_output(output)
}

/// Truncate output at the cap on a character boundary and add the marker.
fn cap_output(mut s: String) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s;
    }
    let mut cut = MAX_OUTPUT_SIZE;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    s.push_str(TRUNCATION_MARKER);
    s
}

/// Walk a directory, collecting `(is_dir, relative_path)` pairs. Entries
/// under the source-control metadata directory are skipped; the glob
/// pattern applies to file names. Entries within each directory are sorted
/// so listings are deterministic.
fn collect_entries(
    root: &Path,
    dir: &Path,
    pattern: &str,
    recursive: bool,
    entries: &mut Vec<(bool, String)>,
) -> Result<(), ToolError> {
    let read = std::fs::read_dir(dir)
        .map_err(|e| ToolError::InvalidArguments(format!("reading directory: {e}")))?;

    let mut children: Vec<_> = read.filter_map(|e| e.ok()).collect();
    children.sort_by_key(|e| e.file_name());

    for entry in children {
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        if rel.starts_with(".git") {
            continue;
        }

        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let name = entry.file_name().to_string_lossy().into_owned();

        if pattern.is_empty() || glob_match(pattern, &name) {
            entries.push((is_dir, rel));
        }

        if recursive && is_dir {
            collect_entries(root, &path, pattern, true, entries)?;
        }
    }

    Ok(())
}

/// Shell-style name matching supporting `*` and `?`.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn matches(p: &[char], n: &[char]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                matches(&p[1..], n) || (!n.is_empty() && matches(p, &n[1..]))
            }
            (Some('?'), Some(_)) => matches(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc == nc => matches(&p[1..], &n[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    matches(&p, &n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "test-call".to_string(),
            name: name.to_string(),
            arguments: args,
        }
    }

    fn executor(dir: &TempDir) -> Executor {
        Executor::new(dir.path())
            .with_rig("testrig")
            .with_actor("testrig/polecats/Nux")
            .with_role("polecat")
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let dir = TempDir::new().unwrap();
        let err = executor(&dir)
            .execute(&call("no-such-tool", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn test_file_read_numbers_lines() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("README.md"), "hello\nworld\n").unwrap();

        let out = executor(&dir)
            .execute(&call("file-read", serde_json::json!({"path": "README.md"})))
            .await
            .unwrap();
        assert!(out.contains("1: hello"));
        assert!(out.contains("2: world"));
    }

    #[tokio::test]
    async fn test_file_read_line_range() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a\nb\nc\nd\n").unwrap();

        let out = executor(&dir)
            .execute(&call(
                "file-read",
                serde_json::json!({"path": "f.txt", "start_line": 2, "end_line": 3}),
            ))
            .await
            .unwrap();
        assert_eq!(out, "2: b\n3: c\n");
    }

    #[tokio::test]
    async fn test_file_read_start_past_end_is_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "only\n").unwrap();

        let err = executor(&dir)
            .execute(&call(
                "file-read",
                serde_json::json!({"path": "f.txt", "start_line": 10}),
            ))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceeds file length"));
    }

    #[tokio::test]
    async fn test_path_traversal_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = executor(&dir)
            .execute(&call(
                "file-read",
                serde_json::json!({"path": "../../etc/passwd"}),
            ))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside working directory"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_is_rejected() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();

        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let err = executor(&dir)
            .execute(&call(
                "file-read",
                serde_json::json!({"path": "link/secret.txt"}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PathOutsideWorktree { .. }));
    }

    #[tokio::test]
    async fn test_file_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let out = executor(&dir)
            .execute(&call(
                "file-write",
                serde_json::json!({"path": "a/b/c.txt", "content": "nested"}),
            ))
            .await
            .unwrap();
        assert!(out.contains("6 bytes"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a/b/c.txt")).unwrap(),
            "nested"
        );
    }

    #[tokio::test]
    async fn test_file_write_to_new_file_passes_path_check() {
        // The sandbox check must not reject paths that do not exist yet.
        let dir = TempDir::new().unwrap();
        executor(&dir)
            .execute(&call(
                "file-write",
                serde_json::json!({"path": "new.txt", "content": "x"}),
            ))
            .await
            .unwrap();
        assert!(dir.path().join("new.txt").exists());
    }

    #[tokio::test]
    async fn test_file_edit_replaces_first_occurrence() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "aaa bbb aaa").unwrap();

        executor(&dir)
            .execute(&call(
                "file-edit",
                serde_json::json!({"path": "f.txt", "search": "aaa", "replace": "zzz"}),
            ))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "zzz bbb aaa"
        );
    }

    #[tokio::test]
    async fn test_file_edit_unmatched_search_leaves_file_unchanged() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "original").unwrap();

        let err = executor(&dir)
            .execute(&call(
                "file-edit",
                serde_json::json!({"path": "f.txt", "search": "missing", "replace": "x"}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::SearchTextNotFound(_)));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "original"
        );
    }

    #[tokio::test]
    async fn test_file_list_skips_git_and_marks_dirs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.rs"), "").unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "").unwrap();

        let out = executor(&dir)
            .execute(&call("file-list", serde_json::json!({})))
            .await
            .unwrap();
        assert!(out.contains("  main.rs"));
        assert!(out.contains("d src"));
        assert!(!out.contains(".git"));
    }

    #[tokio::test]
    async fn test_file_list_pattern_filters_names() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.rs"), "").unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();

        let out = executor(&dir)
            .execute(&call("file-list", serde_json::json!({"pattern": "*.rs"})))
            .await
            .unwrap();
        assert!(out.contains("a.rs"));
        assert!(!out.contains("b.txt"));
    }

    #[tokio::test]
    async fn test_file_list_recursive() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        std::fs::write(dir.path().join("sub/deep/leaf.txt"), "").unwrap();

        let out = executor(&dir)
            .execute(&call("file-list", serde_json::json!({"recursive": true})))
            .await
            .unwrap();
        assert!(out.contains("sub/deep/leaf.txt"));
    }

    #[tokio::test]
    async fn test_file_list_empty_directory() {
        let dir = TempDir::new().unwrap();
        let out = executor(&dir)
            .execute(&call("file-list", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(out, "(empty directory)");
    }

    #[tokio::test]
    async fn test_file_search_no_matches_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "nothing here").unwrap();

        let out = executor(&dir)
            .execute(&call(
                "file-search",
                serde_json::json!({"pattern": "needle-that-does-not-exist"}),
            ))
            .await
            .unwrap();
        assert_eq!(out, "(no matches found)");
    }

    #[tokio::test]
    async fn test_file_search_finds_content() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "the needle is here\n").unwrap();

        let out = executor(&dir)
            .execute(&call("file-search", serde_json::json!({"pattern": "needle"})))
            .await
            .unwrap();
        assert!(out.contains("needle"));
    }

    #[tokio::test]
    async fn test_shell_exec_captures_stdout_and_stderr() {
        let dir = TempDir::new().unwrap();
        let out = executor(&dir)
            .execute(&call(
                "shell-exec",
                serde_json::json!({"command": "echo out; echo err >&2"}),
            ))
            .await
            .unwrap();
        assert!(out.contains("out"));
        assert!(out.contains("STDERR: err"));
    }

    #[tokio::test]
    async fn test_shell_exec_exports_identity() {
        let dir = TempDir::new().unwrap();
        let out = executor(&dir)
            .execute(&call(
                "shell-exec",
                serde_json::json!({"command": "echo $GT_ROLE/$GT_RIG/$GT_ACTOR"}),
            ))
            .await
            .unwrap();
        assert!(out.contains("polecat/testrig/testrig/polecats/Nux"));
    }

    #[tokio::test]
    async fn test_shell_exec_runs_in_worktree() {
        let dir = TempDir::new().unwrap();
        let out = executor(&dir)
            .execute(&call("shell-exec", serde_json::json!({"command": "pwd"})))
            .await
            .unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(out.contains(canonical.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_shell_exec_timeout_preserves_partial_output() {
        let dir = TempDir::new().unwrap();
        let err = executor(&dir)
            .execute(&call(
                "shell-exec",
                serde_json::json!({"command": "echo started; sleep 5", "timeout_seconds": 1}),
            ))
            .await
            .unwrap_err();
        match err {
            ToolError::Timeout { duration, output } => {
                assert_eq!(duration, Duration::from_secs(1));
                assert!(output.contains("started"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shell_exec_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let err = executor(&dir)
            .execute(&call("shell-exec", serde_json::json!({"command": "exit 3"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::SubprocessFailed { exit_code: 3, .. }));
    }

    #[tokio::test]
    async fn test_missing_required_argument() {
        let dir = TempDir::new().unwrap();
        let err = executor(&dir)
            .execute(&call("file-read", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(Path::new("/a/b/../c")), PathBuf::from("/a/c"));
        assert_eq!(clean_path(Path::new("/a/./b")), PathBuf::from("/a/b"));
        assert_eq!(clean_path(Path::new("/../x")), PathBuf::from("/x"));
        assert_eq!(clean_path(Path::new("../x")), PathBuf::from("../x"));
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*.rs", "main.rs"));
        assert!(!glob_match("*.rs", "main.go"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "abbc"));
        assert!(glob_match("*", "anything"));
    }

    #[test]
    fn test_cap_output_respects_char_boundaries() {
        let long = "é".repeat(MAX_OUTPUT_SIZE);
        let capped = cap_output(long);
        assert!(capped.ends_with(TRUNCATION_MARKER));
        assert!(capped.len() <= MAX_OUTPUT_SIZE + TRUNCATION_MARKER.len());
    }
}
