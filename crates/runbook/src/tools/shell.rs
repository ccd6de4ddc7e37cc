//! Sandboxed shell tool.
//!
//! Runs commands through the platform shell, either in the foreground
//! (captured stdout/stderr/exit code with a timeout) or as a background
//! session whose output streams into bounded ring buffers. Background
//! sessions live in an explicit id-keyed store owned by this tool; the
//! underlying process handle never leaves it, and callers interact only
//! through `wait`, `view`, `kill`, `list` and `cleanup`.
//!
//! Sandboxing is pattern-based command denylisting, not OS isolation:
//! obviously destructive commands are refused before a process is ever
//! spawned.

use super::{Tool, ToolContext, ToolDefinition, ToolResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cap per output stream, oldest lines evicted first.
const MAX_OUTPUT_LINES: usize = 1000;

/// Foreground exec budget when the caller does not set one.
const DEFAULT_EXEC_TIMEOUT_MS: u64 = 30_000;

/// `wait` poll interval.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period between terminate and forceful kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Finished sessions older than this are dropped by `cleanup`.
const DEFAULT_SESSION_MAX_AGE_MS: u64 = 3_600_000;

/// Destructive command fragments refused outright. Matched against the
/// lowercased command string.
const BLOCKED_COMMAND_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "rm -rf ~",
    "--no-preserve-root",
    "mkfs",
    "of=/dev/",
    "> /dev/sd",
    "> /dev/nvme",
    ":(){",
    "format c:",
    "del /f /s /q c:",
    "rd /s /q c:",
];

#[derive(Debug, Deserialize)]
#[serde(
    tag = "action",
    rename_all = "lowercase",
    rename_all_fields = "camelCase"
)]
enum ShellParams {
    Exec {
        command: String,
        #[serde(default)]
        background: bool,
        timeout_ms: Option<u64>,
        cwd: Option<String>,
    },
    Wait {
        session_id: String,
        timeout_ms: Option<u64>,
    },
    View {
        session_id: String,
        lines: Option<usize>,
    },
    Kill {
        session_id: String,
    },
    List,
    Cleanup {
        max_age_ms: Option<u64>,
    },
}

/// One background session's bookkeeping. The process handle itself is
/// owned by the waiter task; `kill_tx` is the only way to reach it.
struct ShellSession {
    command: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    is_running: bool,
    exit_code: Option<i32>,
    stdout: VecDeque<String>,
    stderr: VecDeque<String>,
    truncated: bool,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ShellSession {
    fn tail(&self, lines: usize) -> (Vec<String>, Vec<String>) {
        let take = |buf: &VecDeque<String>| {
            buf.iter()
                .skip(buf.len().saturating_sub(lines))
                .cloned()
                .collect()
        };
        (take(&self.stdout), take(&self.stderr))
    }
}

/// Listing entry returned by the `list` action.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub command: String,
    pub is_running: bool,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

type SessionMap = Arc<Mutex<HashMap<String, ShellSession>>>;

pub struct ShellTool {
    sessions: SessionMap,
}

impl ShellTool {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn check_command(command: &str) -> Result<(), String> {
        let lowered = command.to_lowercase();
        for pattern in BLOCKED_COMMAND_PATTERNS {
            if lowered.contains(pattern) {
                return Err(format!(
                    "blocked: command matches destructive pattern '{pattern}'"
                ));
            }
        }
        Ok(())
    }

    fn shell_command(command: &str, cwd: Option<&str>, ctx: &ToolContext) -> Command {
        #[cfg(target_os = "windows")]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        };
        #[cfg(not(target_os = "windows"))]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        } else if let Some(dir) = &ctx.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn exec_foreground(
        &self,
        command: &str,
        timeout_ms: Option<u64>,
        cwd: Option<&str>,
        ctx: &ToolContext,
    ) -> ToolResult {
        let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_EXEC_TIMEOUT_MS));
        let mut child = match Self::shell_command(command, cwd, ctx).spawn() {
            Ok(child) => child,
            Err(e) => return ToolResult::fail(format!("failed to spawn command: {e}")),
        };

        let stdout_buf = Arc::new(Mutex::new((VecDeque::new(), false)));
        let stderr_buf = Arc::new(Mutex::new((VecDeque::new(), false)));
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(pump_lines(out, stdout_buf.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(pump_lines(err, stderr_buf.clone())));

        let (exit_code, timed_out) = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => (status.code(), false),
                Err(e) => return ToolResult::fail(format!("failed to wait for command: {e}")),
            },
            _ = tokio::time::sleep(timeout) => {
                // The command is failed for control-flow purposes; the
                // process itself is reaped asynchronously.
                let _ = child.start_kill();
                (None, true)
            }
        };

        // Let the pump tasks drain whatever made it through the pipes.
        if let Some(task) = stdout_task {
            let _ = tokio::time::timeout(Duration::from_millis(250), task).await;
        }
        if let Some(task) = stderr_task {
            let _ = tokio::time::timeout(Duration::from_millis(250), task).await;
        }

        let (stdout, stdout_truncated) = drain_buffer(&stdout_buf);
        let (stderr, stderr_truncated) = drain_buffer(&stderr_buf);
        let data = json!({
            "stdout": stdout.join("\n"),
            "stderr": stderr.join("\n"),
            "exitCode": exit_code,
            "timedOut": timed_out,
            "truncated": stdout_truncated || stderr_truncated,
        });

        if timed_out {
            let mut result =
                ToolResult::fail(format!("command timed out after {}ms", timeout.as_millis()));
            result.data = Some(data);
            result
        } else if exit_code == Some(0) {
            ToolResult::ok(data)
        } else {
            let mut result = ToolResult::fail(format!(
                "command exited with code {}",
                exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into())
            ));
            result.data = Some(data);
            result
        }
    }

    async fn exec_background(
        &self,
        command: &str,
        cwd: Option<&str>,
        ctx: &ToolContext,
    ) -> ToolResult {
        let mut child = match Self::shell_command(command, cwd, ctx).spawn() {
            Ok(child) => child,
            Err(e) => return ToolResult::fail(format!("failed to spawn command: {e}")),
        };

        let session_id = Uuid::new_v4().to_string();
        let (kill_tx, kill_rx) = oneshot::channel();
        {
            let mut sessions = match self.sessions.lock() {
                Ok(sessions) => sessions,
                Err(_) => return ToolResult::fail("session store poisoned"),
            };
            sessions.insert(
                session_id.clone(),
                ShellSession {
                    command: command.to_string(),
                    started_at: Utc::now(),
                    finished_at: None,
                    is_running: true,
                    exit_code: None,
                    stdout: VecDeque::new(),
                    stderr: VecDeque::new(),
                    truncated: false,
                    kill_tx: Some(kill_tx),
                },
            );
        }

        if let Some(out) = child.stdout.take() {
            tokio::spawn(pump_session_lines(
                out,
                self.sessions.clone(),
                session_id.clone(),
                StreamKind::Stdout,
            ));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(pump_session_lines(
                err,
                self.sessions.clone(),
                session_id.clone(),
                StreamKind::Stderr,
            ));
        }

        let sessions = self.sessions.clone();
        let waiter_id = session_id.clone();
        tokio::spawn(async move {
            let exit_code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = kill_rx => {
                    debug!(session_id = %waiter_id, "terminating background session");
                    let _ = child.start_kill();
                    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                        Ok(status) => status.ok().and_then(|s| s.code()),
                        Err(_) => {
                            warn!(session_id = %waiter_id, "session did not exit within grace period, forcing kill");
                            let _ = child.kill().await;
                            None
                        }
                    }
                }
            };
            if let Ok(mut sessions) = sessions.lock() {
                if let Some(session) = sessions.get_mut(&waiter_id) {
                    session.is_running = false;
                    session.exit_code = exit_code;
                    session.finished_at = Some(Utc::now());
                }
            }
            info!(session_id = %waiter_id, exit_code = ?exit_code, "background session finished");
        });

        ToolResult::ok(json!({"sessionId": session_id, "background": true}))
    }

    async fn wait_session(&self, session_id: &str, timeout_ms: Option<u64>) -> ToolResult {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(timeout_ms.unwrap_or(60_000));
        loop {
            let snapshot = {
                let sessions = match self.sessions.lock() {
                    Ok(sessions) => sessions,
                    Err(_) => return ToolResult::fail("session store poisoned"),
                };
                match sessions.get(session_id) {
                    Some(session) => Some((session.is_running, session.exit_code)),
                    None => None,
                }
            };
            let (is_running, exit_code) = match snapshot {
                Some(s) => s,
                None => return ToolResult::fail(format!("session '{session_id}' not found")),
            };

            if !is_running {
                return self.view_session(session_id, None, Some(exit_code));
            }
            if tokio::time::Instant::now() >= deadline {
                // Partial output with the stillRunning marker; not an error.
                let mut result = self.view_session(session_id, None, None);
                if let Some(data) = result.data.as_mut().and_then(|d| d.as_object_mut()) {
                    data.insert("stillRunning".to_string(), Value::Bool(true));
                }
                return result;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    fn view_session(
        &self,
        session_id: &str,
        lines: Option<usize>,
        exit_code: Option<Option<i32>>,
    ) -> ToolResult {
        let sessions = match self.sessions.lock() {
            Ok(sessions) => sessions,
            Err(_) => return ToolResult::fail("session store poisoned"),
        };
        let session = match sessions.get(session_id) {
            Some(session) => session,
            None => return ToolResult::fail(format!("session '{session_id}' not found")),
        };
        let (stdout, stderr) = session.tail(lines.unwrap_or(MAX_OUTPUT_LINES));
        ToolResult::ok(json!({
            "sessionId": session_id,
            "command": session.command,
            "isRunning": session.is_running,
            "exitCode": exit_code.unwrap_or(session.exit_code),
            "stdout": stdout.join("\n"),
            "stderr": stderr.join("\n"),
            "truncated": session.truncated,
        }))
    }

    fn kill_session(&self, session_id: &str) -> ToolResult {
        let mut sessions = match self.sessions.lock() {
            Ok(sessions) => sessions,
            Err(_) => return ToolResult::fail("session store poisoned"),
        };
        let session = match sessions.get_mut(session_id) {
            Some(session) => session,
            None => return ToolResult::fail(format!("session '{session_id}' not found")),
        };
        if !session.is_running {
            return ToolResult::ok(json!({
                "sessionId": session_id,
                "alreadyFinished": true,
                "exitCode": session.exit_code,
            }));
        }
        match session.kill_tx.take() {
            Some(tx) => {
                let _ = tx.send(());
                ToolResult::ok(json!({
                    "sessionId": session_id,
                    "killed": true,
                    "graceMs": KILL_GRACE.as_millis() as u64,
                }))
            }
            None => ToolResult::ok(json!({"sessionId": session_id, "killed": false})),
        }
    }

    fn list_sessions(&self) -> ToolResult {
        let sessions = match self.sessions.lock() {
            Ok(sessions) => sessions,
            Err(_) => return ToolResult::fail("session store poisoned"),
        };
        let mut summaries: Vec<SessionSummary> = sessions
            .iter()
            .map(|(id, session)| SessionSummary {
                session_id: id.clone(),
                command: session.command.clone(),
                is_running: session.is_running,
                exit_code: session.exit_code,
                started_at: session.started_at,
                finished_at: session.finished_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        ToolResult::ok(json!({"sessions": summaries}))
    }

    fn cleanup_sessions(&self, max_age_ms: Option<u64>) -> ToolResult {
        let max_age = chrono::Duration::milliseconds(
            max_age_ms.unwrap_or(DEFAULT_SESSION_MAX_AGE_MS) as i64,
        );
        let cutoff = Utc::now() - max_age;
        let mut sessions = match self.sessions.lock() {
            Ok(sessions) => sessions,
            Err(_) => return ToolResult::fail("session store poisoned"),
        };
        let before = sessions.len();
        sessions.retain(|_, session| {
            session.is_running || session.finished_at.map(|t| t > cutoff).unwrap_or(true)
        });
        let removed = before - sessions.len();
        debug!(removed, "cleaned up finished shell sessions");
        ToolResult::ok(json!({"removed": removed, "remaining": sessions.len()}))
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Reads lines from a foreground pipe into a `(ring, truncated)` pair.
async fn pump_lines(
    reader: impl tokio::io::AsyncRead + Unpin,
    buffer: Arc<Mutex<(VecDeque<String>, bool)>>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Ok(mut buf) = buffer.lock() {
            if buf.0.len() >= MAX_OUTPUT_LINES {
                buf.0.pop_front();
                buf.1 = true;
            }
            buf.0.push_back(line);
        }
    }
}

fn drain_buffer(buffer: &Arc<Mutex<(VecDeque<String>, bool)>>) -> (Vec<String>, bool) {
    buffer
        .lock()
        .map(|buf| (buf.0.iter().cloned().collect(), buf.1))
        .unwrap_or_default()
}

/// Reads lines from a background session pipe into the session's ring
/// buffer. Each session is only ever written by its own pump tasks.
async fn pump_session_lines(
    reader: impl tokio::io::AsyncRead + Unpin,
    sessions: SessionMap,
    session_id: String,
    kind: StreamKind,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Ok(mut sessions) = sessions.lock() {
            if let Some(session) = sessions.get_mut(&session_id) {
                let buf = match kind {
                    StreamKind::Stdout => &mut session.stdout,
                    StreamKind::Stderr => &mut session.stderr,
                };
                if buf.len() >= MAX_OUTPUT_LINES {
                    buf.pop_front();
                    session.truncated = true;
                }
                buf.push_back(line);
            }
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "shell".to_string(),
            description: "Run shell commands in the foreground or as background sessions \
                          with bounded output capture"
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["exec", "wait", "view", "kill", "list", "cleanup"],
                    },
                    "command": {"type": "string"},
                    "background": {"type": "boolean"},
                    "timeoutMs": {"type": "integer"},
                    "cwd": {"type": "string"},
                    "sessionId": {"type": "string"},
                    "lines": {"type": "integer"},
                    "maxAgeMs": {"type": "integer"},
                },
                "required": ["action"],
            }),
        }
    }

    fn validate(&self, params: &Value) -> Result<(), String> {
        let parsed: ShellParams =
            serde_json::from_value(params.clone()).map_err(|e| e.to_string())?;
        if let ShellParams::Exec { command, .. } = &parsed {
            if command.trim().is_empty() {
                return Err("command must not be empty".to_string());
            }
            Self::check_command(command)?;
        }
        Ok(())
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let parsed: ShellParams = match serde_json::from_value(params) {
            Ok(parsed) => parsed,
            Err(e) => return ToolResult::fail(format!("invalid shell parameters: {e}")),
        };

        match parsed {
            ShellParams::Exec {
                command,
                background,
                timeout_ms,
                cwd,
            } => {
                // Validation runs again here so direct callers get the
                // same denylist as registry-mediated calls.
                if let Err(e) = Self::check_command(&command) {
                    return ToolResult::fail(e);
                }
                if background {
                    self.exec_background(&command, cwd.as_deref(), ctx).await
                } else {
                    self.exec_foreground(&command, timeout_ms, cwd.as_deref(), ctx)
                        .await
                }
            }
            ShellParams::Wait {
                session_id,
                timeout_ms,
            } => self.wait_session(&session_id, timeout_ms).await,
            ShellParams::View { session_id, lines } => self.view_session(&session_id, lines, None),
            ShellParams::Kill { session_id } => self.kill_session(&session_id),
            ShellParams::List => self.list_sessions(),
            ShellParams::Cleanup { max_age_ms } => self.cleanup_sessions(max_age_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolContext {
        ToolContext::default()
    }

    #[test]
    fn test_destructive_commands_blocked() {
        for cmd in [
            "rm -rf /",
            "sudo rm -rf /*",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            ":(){ :|:& };:",
        ] {
            let err = ShellTool::check_command(cmd).unwrap_err();
            assert!(err.contains("blocked"), "{cmd} should be blocked: {err}");
        }
    }

    #[test]
    fn test_ordinary_commands_allowed() {
        for cmd in ["echo hello", "ls -la", "cargo build", "rm -rf target"] {
            assert!(ShellTool::check_command(cmd).is_ok(), "{cmd} should pass");
        }
    }

    #[test]
    fn test_validate_rejects_missing_action() {
        let tool = ShellTool::new();
        assert!(tool.validate(&json!({"command": "echo hi"})).is_err());
        assert!(tool
            .validate(&json!({"action": "exec", "command": ""}))
            .is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_captures_output_and_exit_code() {
        let tool = ShellTool::new();
        let result = tool
            .execute(
                json!({"action": "exec", "command": "echo out; echo err >&2; exit 3"}),
                &ctx(),
            )
            .await;
        assert!(!result.success);
        let data = result.data.unwrap();
        assert_eq!(data["stdout"], "out");
        assert_eq!(data["stderr"], "err");
        assert_eq!(data["exitCode"], 3);
        assert_eq!(data["timedOut"], false);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_success() {
        let tool = ShellTool::new();
        let result = tool
            .execute(json!({"action": "exec", "command": "echo hello"}), &ctx())
            .await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()["stdout"], "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_timeout_returns_partial_output() {
        let tool = ShellTool::new();
        let result = tool
            .execute(
                json!({"action": "exec", "command": "echo started; sleep 10", "timeoutMs": 200}),
                &ctx(),
            )
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        let data = result.data.unwrap();
        assert_eq!(data["timedOut"], true);
        assert_eq!(data["stdout"], "started");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_session_lifecycle() {
        let tool = ShellTool::new();
        let result = tool
            .execute(
                json!({"action": "exec", "command": "echo bg done", "background": true}),
                &ctx(),
            )
            .await;
        assert!(result.success);
        let session_id = result.data.unwrap()["sessionId"]
            .as_str()
            .unwrap()
            .to_string();

        let result = tool
            .execute(
                json!({"action": "wait", "sessionId": session_id, "timeoutMs": 5000}),
                &ctx(),
            )
            .await;
        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["isRunning"], false);
        assert_eq!(data["exitCode"], 0);
        assert_eq!(data["stdout"], "bg done");

        // list includes the completed session
        let result = tool.execute(json!({"action": "list"}), &ctx()).await;
        let sessions = result.data.unwrap()["sessions"].as_array().unwrap().len();
        assert_eq!(sessions, 1);

        // cleanup with zero max age removes it
        let result = tool
            .execute(json!({"action": "cleanup", "maxAgeMs": 0}), &ctx())
            .await;
        assert_eq!(result.data.unwrap()["removed"], 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_timeout_flags_still_running() {
        let tool = ShellTool::new();
        let result = tool
            .execute(
                json!({"action": "exec", "command": "sleep 30", "background": true}),
                &ctx(),
            )
            .await;
        let session_id = result.data.unwrap()["sessionId"]
            .as_str()
            .unwrap()
            .to_string();

        let result = tool
            .execute(
                json!({"action": "wait", "sessionId": session_id, "timeoutMs": 150}),
                &ctx(),
            )
            .await;
        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["stillRunning"], true);

        // kill resolves the session
        let result = tool
            .execute(json!({"action": "kill", "sessionId": session_id}), &ctx())
            .await;
        assert!(result.success);

        let result = tool
            .execute(
                json!({"action": "wait", "sessionId": session_id, "timeoutMs": 7000}),
                &ctx(),
            )
            .await;
        assert_eq!(result.data.unwrap()["isRunning"], false);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let tool = ShellTool::new();
        let result = tool
            .execute(json!({"action": "view", "sessionId": "nope"}), &ctx())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not found"));
    }
}
