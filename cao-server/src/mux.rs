//! Terminal multiplexer adapter.
//!
//! Everything the server knows about tmux lives behind [`MuxClient`]. The real
//! driver shells out to the `tmux` binary; [`FakeMux`] is an in-memory double
//! used by the orchestration tests to script pane content deterministically.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;

/// Maximum keystroke chunk sent in one `send-keys` invocation. Long messages
/// are split at whitespace so the wrapped TUI's input handling keeps up.
const SEND_KEYS_CHUNK: usize = 100;
/// Pause between chunks; submitting the Enter immediately after a large paste
/// loses the keypress in some agent TUIs.
const SEND_KEYS_CHUNK_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("terminal multiplexer unavailable: {0}")]
    Unavailable(String),
    #[error("session '{0}' already exists")]
    SessionExists(String),
    #[error("session '{0}' not found")]
    SessionMissing(String),
    #[error("multiplexer command failed: {0}")]
    ExecFailure(String),
}

#[async_trait]
pub trait MuxClient: Send + Sync {
    /// Start a detached session running `initial_command` under `cwd`, with
    /// the given environment variables exported into the session.
    async fn create(
        &self,
        session_name: &str,
        cwd: &str,
        initial_command: &str,
        env: &[(String, String)],
    ) -> Result<(), MuxError>;

    async fn send_keys(
        &self,
        session_name: &str,
        text: &str,
        append_enter: bool,
    ) -> Result<(), MuxError>;

    /// Capture the last `tail_lines` of the session's active pane.
    async fn capture(&self, session_name: &str, tail_lines: usize) -> Result<String, MuxError>;

    async fn kill(&self, session_name: &str) -> Result<(), MuxError>;

    async fn exists(&self, session_name: &str) -> bool;

    async fn list(&self) -> Result<Vec<String>, MuxError>;
}

/// Split `text` into chunks of roughly [`SEND_KEYS_CHUNK`] bytes, breaking at
/// the first whitespace at or after the target position.
fn chunk_keys(text: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let target = start + SEND_KEYS_CHUNK;
        if target >= text.len() {
            chunks.push(&text[start..]);
            break;
        }
        match text[target..].find(char::is_whitespace) {
            Some(offset) => {
                let split = target + offset;
                chunks.push(&text[start..split]);
                start = split;
            }
            None => {
                chunks.push(&text[start..]);
                break;
            }
        }
    }
    chunks
}

/// Shell-quote a value for inclusion in the session's bootstrap command line.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Drives the `tmux` binary. Sessions are created detached with a fixed
/// 200x50 geometry so pane captures are stable regardless of whether a human
/// has attached.
pub struct TmuxClient;

impl TmuxClient {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, MuxError> {
        Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(|e| MuxError::Unavailable(format!("failed to run tmux: {e}")))
    }

    async fn run_checked(&self, args: &[&str]) -> Result<std::process::Output, MuxError> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MuxError::ExecFailure(format!(
                "tmux {} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(output)
    }
}

impl Default for TmuxClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MuxClient for TmuxClient {
    async fn create(
        &self,
        session_name: &str,
        cwd: &str,
        initial_command: &str,
        env: &[(String, String)],
    ) -> Result<(), MuxError> {
        if self.exists(session_name).await {
            return Err(MuxError::SessionExists(session_name.to_string()));
        }

        // Export the environment inside the session's shell line so it reaches
        // the agent process, then exec the provider command.
        let mut shell_cmd = String::new();
        for (key, value) in env {
            shell_cmd.push_str(&format!("export {key}={}; ", shell_quote(value)));
        }
        shell_cmd.push_str(initial_command);

        self.run_checked(&[
            "new-session",
            "-d",
            "-s",
            session_name,
            "-x",
            "200",
            "-y",
            "50",
            "-c",
            cwd,
            &shell_cmd,
        ])
        .await?;

        tracing::info!(
            target = "cao::mux",
            session = %session_name,
            cwd = %cwd,
            "created session"
        );
        Ok(())
    }

    async fn send_keys(
        &self,
        session_name: &str,
        text: &str,
        append_enter: bool,
    ) -> Result<(), MuxError> {
        if !self.exists(session_name).await {
            return Err(MuxError::SessionMissing(session_name.to_string()));
        }

        let chunks = chunk_keys(text);
        let chunked = chunks.len() > 1;
        for chunk in chunks {
            // -l sends the literal text without key-name interpretation.
            self.run_checked(&["send-keys", "-t", session_name, "-l", chunk])
                .await?;
            if chunked {
                tokio::time::sleep(SEND_KEYS_CHUNK_DELAY).await;
            }
        }
        if append_enter {
            self.run_checked(&["send-keys", "-t", session_name, "Enter"])
                .await?;
        }
        Ok(())
    }

    async fn capture(&self, session_name: &str, tail_lines: usize) -> Result<String, MuxError> {
        if !self.exists(session_name).await {
            return Err(MuxError::SessionMissing(session_name.to_string()));
        }
        let from = format!("-{tail_lines}");
        let output = self
            .run_checked(&["capture-pane", "-p", "-t", session_name, "-S", &from])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn kill(&self, session_name: &str) -> Result<(), MuxError> {
        if !self.exists(session_name).await {
            return Err(MuxError::SessionMissing(session_name.to_string()));
        }
        self.run_checked(&["kill-session", "-t", session_name])
            .await?;
        tracing::info!(target = "cao::mux", session = %session_name, "killed session");
        Ok(())
    }

    async fn exists(&self, session_name: &str) -> bool {
        self.run(&["has-session", "-t", session_name])
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn list(&self) -> Result<Vec<String>, MuxError> {
        let output = self.run(&["list-sessions", "-F", "#{session_name}"]).await?;
        if !output.status.success() {
            // tmux exits non-zero when no server is running; treat as empty.
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FakePane {
    lines: Vec<String>,
    sent: Vec<String>,
    alive: bool,
}

/// In-memory mux used by the test suites. Tests script pane content with
/// [`FakeMux::append_line`] and inspect injected keystrokes with
/// [`FakeMux::sent_keys`].
#[derive(Default)]
pub struct FakeMux {
    panes: Mutex<HashMap<String, FakePane>>,
    /// When true, `create` fails with `Unavailable` (launch-failure tests).
    pub refuse_create: std::sync::atomic::AtomicBool,
}

impl FakeMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line to a session's pane, as if the agent had printed it.
    pub fn append_line(&self, session_name: &str, line: &str) {
        let mut panes = self.panes.lock();
        if let Some(pane) = panes.get_mut(session_name) {
            pane.lines.push(line.to_string());
        }
    }

    /// All keystroke payloads injected into a session, in order.
    pub fn sent_keys(&self, session_name: &str) -> Vec<String> {
        self.panes
            .lock()
            .get(session_name)
            .map(|pane| pane.sent.clone())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.panes.lock().values().filter(|p| p.alive).count()
    }
}

#[async_trait]
impl MuxClient for FakeMux {
    async fn create(
        &self,
        session_name: &str,
        _cwd: &str,
        _initial_command: &str,
        _env: &[(String, String)],
    ) -> Result<(), MuxError> {
        if self.refuse_create.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(MuxError::Unavailable("scripted failure".to_string()));
        }
        let mut panes = self.panes.lock();
        if panes.get(session_name).is_some_and(|p| p.alive) {
            return Err(MuxError::SessionExists(session_name.to_string()));
        }
        panes.insert(
            session_name.to_string(),
            FakePane {
                lines: vec!["$".to_string()],
                sent: Vec::new(),
                alive: true,
            },
        );
        Ok(())
    }

    async fn send_keys(
        &self,
        session_name: &str,
        text: &str,
        _append_enter: bool,
    ) -> Result<(), MuxError> {
        let mut panes = self.panes.lock();
        let pane = panes
            .get_mut(session_name)
            .filter(|p| p.alive)
            .ok_or_else(|| MuxError::SessionMissing(session_name.to_string()))?;
        pane.sent.push(text.to_string());
        // Echo the injection the way a terminal would, one pane line per
        // input line.
        for line in text.lines() {
            pane.lines.push(line.to_string());
        }
        Ok(())
    }

    async fn capture(&self, session_name: &str, tail_lines: usize) -> Result<String, MuxError> {
        let panes = self.panes.lock();
        let pane = panes
            .get(session_name)
            .filter(|p| p.alive)
            .ok_or_else(|| MuxError::SessionMissing(session_name.to_string()))?;
        let start = pane.lines.len().saturating_sub(tail_lines);
        Ok(pane.lines[start..].join("\n"))
    }

    async fn kill(&self, session_name: &str) -> Result<(), MuxError> {
        let mut panes = self.panes.lock();
        match panes.get_mut(session_name) {
            Some(pane) if pane.alive => {
                pane.alive = false;
                Ok(())
            }
            _ => Err(MuxError::SessionMissing(session_name.to_string())),
        }
    }

    async fn exists(&self, session_name: &str) -> bool {
        self.panes
            .lock()
            .get(session_name)
            .is_some_and(|p| p.alive)
    }

    async fn list(&self) -> Result<Vec<String>, MuxError> {
        Ok(self
            .panes
            .lock()
            .iter()
            .filter(|(_, p)| p.alive)
            .map(|(name, _)| name.clone())
            .collect())
    }
}
