//! Injector/Reader: turns "run this task" into keystrokes and watches the
//! pane to decide when the turn ended.
//!
//! The reader is the only source of status transitions out of BUSY. One poll
//! task runs per live terminal; it captures the pane tail, strips ANSI, and
//! matches (in priority order) the error marker, the completion marker, and
//! the provider's ready prompt.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{
    bus::MessageBus,
    config::ServerConfig,
    error::{OrchestratorError, Result},
    mux::MuxClient,
    output::{
        completion_marker, error_marker, extract_task_result, find_marker_line, marker_suffix,
        normalize_line_endings, strip_ansi,
    },
    registry::{MarkerDisposition, Message, Registry, TerminalStatus},
};

#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
    pub history_lines: usize,
}

impl From<&ServerConfig> for ReaderConfig {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval,
            idle_timeout: cfg.idle_timeout,
            history_lines: cfg.history_lines,
        }
    }
}

/// Serializes keystroke submission per terminal and owns the injection
/// protocol (body + sentinel suffix).
pub struct Injector {
    registry: Arc<Registry>,
    mux: Arc<dyn MuxClient>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Injector {
    pub fn new(registry: Arc<Registry>, mux: Arc<dyn MuxClient>) -> Self {
        Self {
            registry,
            mux,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn submit(&self, id: &str, session_name: &str, text: &str) -> Result<()> {
        // The injection (keystrokes + Enter) must land as one unit; the
        // per-terminal lock keeps concurrent submissions from interleaving.
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        if let Err(err) = self.mux.send_keys(session_name, text, true).await {
            tracing::warn!(
                target = "cao::reader",
                terminal = %id,
                error = %err,
                "keystroke injection failed"
            );
            let _ = self.registry.update_status(id, TerminalStatus::Error);
            return Err(OrchestratorError::from(err).with_terminal(id));
        }
        Ok(())
    }

    /// Inject a task into an IDLE (or recovered ERROR) terminal. Marks it
    /// BUSY, then submits the body — with the marker suffix when the caller
    /// wants completion detection. Returns the marker sequence number.
    pub async fn inject_task(&self, id: &str, body: &str, with_markers: bool) -> Result<u64> {
        let state = self.registry.get(id)?;
        self.registry.update_status(id, TerminalStatus::Busy)?;
        self.registry
            .set_current_task(id, Some(summarize(body)))?;

        let (seq, text) = if with_markers {
            let seq = self
                .registry
                .begin_marker_task(id, MarkerDisposition::Complete)?;
            (seq, format!("{body} {}", marker_suffix(id, seq)))
        } else {
            (0, body.to_string())
        };

        self.submit(id, &state.session_name, &text).await?;
        tracing::info!(
            target = "cao::reader",
            terminal = %id,
            with_markers,
            "injected task"
        );
        Ok(seq)
    }

    /// Deliver a queued inbox message. The registry already moved the
    /// terminal to BUSY when it popped the message off the inbox. Delivered
    /// messages carry the marker suffix so the follow-up turn's end is
    /// detectable too.
    pub async fn deliver_message(&self, message: &Message) -> Result<()> {
        let id = &message.to_id;
        let state = self.registry.get(id)?;
        let seq = self
            .registry
            .begin_marker_task(id, MarkerDisposition::Idle)?;
        let text = format!(
            "[message from {}] {} {}",
            message.from_id,
            message.body,
            marker_suffix(id, seq)
        );
        self.registry
            .set_current_task(id, Some(summarize(&message.body)))?;
        self.submit(id, &state.session_name, &text).await?;
        tracing::info!(
            target = "cao::reader",
            terminal = %id,
            from = %message.from_id,
            "delivered inbox message"
        );
        Ok(())
    }
}

fn summarize(body: &str) -> String {
    let line = body.lines().next().unwrap_or_default();
    let mut summary: String = line.chars().take(120).collect();
    if summary.len() < line.len() {
        summary.push('…');
    }
    summary
}

/// True when the last non-empty pane line is the provider's ready prompt.
fn at_ready_prompt(clean: &str, ready: &regex::Regex) -> bool {
    clean
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .is_some_and(|line| ready.is_match(line))
}

/// Spawn the background poll loop for one terminal. Exits when the terminal
/// dies or its mux session disappears.
pub fn spawn_reader(
    registry: Arc<Registry>,
    mux: Arc<dyn MuxClient>,
    bus: Arc<MessageBus>,
    id: String,
    cfg: ReaderConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cfg.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut busy_since: Option<Instant> = None;

        loop {
            interval.tick().await;

            let Ok(state) = registry.get(&id) else { break };
            if state.status == TerminalStatus::Dead {
                break;
            }

            if !mux.exists(&state.session_name).await {
                tracing::info!(
                    target = "cao::reader",
                    terminal = %id,
                    session = %state.session_name,
                    "session disappeared; marking dead"
                );
                let _ = registry.update_status(&id, TerminalStatus::Dead);
                break;
            }

            let raw = match mux.capture(&state.session_name, cfg.history_lines).await {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::debug!(target = "cao::reader", terminal = %id, error = %err, "capture failed");
                    continue;
                }
            };
            let clean = normalize_line_endings(&strip_ansi(&raw));
            let ready = state.provider.ready_pattern();

            match state.status {
                TerminalStatus::Busy => {
                    if busy_since.is_none() {
                        busy_since = Some(Instant::now());
                    }
                    // Let the injection echo land before trusting the pane;
                    // a capture racing the keystrokes still shows the old
                    // prompt as the last line.
                    let dwell = elapsed_since(&state.last_status_at);
                    if dwell < cfg.poll_interval {
                        continue;
                    }

                    let (seq, disposition) = registry
                        .marker_task(&id)
                        .unwrap_or((0, MarkerDisposition::Idle));
                    let done = completion_marker(&id, seq);
                    let fail = error_marker(&id, seq);
                    let done_at = (seq > 0)
                        .then(|| find_marker_line(&clean, &done))
                        .flatten();
                    let fail_at = (seq > 0)
                        .then(|| find_marker_line(&clean, &fail))
                        .flatten();

                    // Both markers present: the later-positioned one wins.
                    let failed = match (done_at, fail_at) {
                        (Some(d), Some(f)) => f > d,
                        (None, Some(_)) => true,
                        _ => false,
                    };

                    if failed {
                        let payload = extract_task_result(&clean, &fail);
                        let _ = registry.set_last_output(&id, payload);
                        let _ = registry.update_status(&id, TerminalStatus::Error);
                        busy_since = None;
                        continue;
                    }
                    if done_at.is_some() {
                        let result = extract_task_result(&clean, &done);
                        let _ = registry.set_last_output(&id, result);
                        let _ = registry.set_current_task(&id, None);
                        busy_since = None;
                        match disposition {
                            MarkerDisposition::Complete => {
                                let _ = registry.update_status(&id, TerminalStatus::Completed);
                            }
                            // A delivered message was just a conversation
                            // turn; the idle edge lets the next one out.
                            MarkerDisposition::Idle => {
                                if let Ok(change) =
                                    registry.update_status(&id, TerminalStatus::Idle)
                                {
                                    if change.entered_idle() {
                                        bus.flush_idle(&id).await;
                                    }
                                }
                            }
                        }
                        continue;
                    }
                    if at_ready_prompt(&clean, ready) {
                        if let Ok(change) = registry.update_status(&id, TerminalStatus::Idle) {
                            busy_since = None;
                            if change.entered_idle() {
                                bus.flush_idle(&id).await;
                            }
                        }
                        continue;
                    }
                    if busy_since.is_some_and(|t| t.elapsed() > cfg.idle_timeout) {
                        tracing::warn!(
                            target = "cao::reader",
                            terminal = %id,
                            "no recognizable output within the reader deadline"
                        );
                        let _ = registry
                            .set_last_output(&id, "reader timeout: no output recognized".into());
                        let _ = registry.update_status(&id, TerminalStatus::Error);
                        busy_since = None;
                    }
                }
                TerminalStatus::Starting | TerminalStatus::Error => {
                    busy_since = None;
                    if at_ready_prompt(&clean, ready) {
                        if let Ok(change) = registry.update_status(&id, TerminalStatus::Idle) {
                            if change.entered_idle() {
                                bus.flush_idle(&id).await;
                            }
                        }
                    }
                }
                TerminalStatus::Idle | TerminalStatus::Completed => {
                    busy_since = None;
                }
                TerminalStatus::Dead => break,
            }
        }

        tracing::debug!(target = "cao::reader", terminal = %id, "reader loop exited");
    })
}

/// Elapsed wall-clock time since a chrono timestamp, saturating at zero.
fn elapsed_since(since: &chrono::DateTime<chrono::Utc>) -> Duration {
    (chrono::Utc::now() - *since).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{at_ready_prompt, summarize};
    use crate::provider::ProviderKind;

    #[test]
    fn ready_prompt_must_be_last_nonempty_line() {
        let ready = ProviderKind::QCli.ready_pattern();
        assert!(at_ready_prompt("earlier output\n> \n", ready));
        assert!(!at_ready_prompt("> \nstill printing things", ready));
    }

    #[test]
    fn summarize_truncates_to_first_line() {
        assert_eq!(summarize("fix the bug\nin detail"), "fix the bug");
        let long = "x".repeat(300);
        assert!(summarize(&long).chars().count() <= 121);
    }
}
