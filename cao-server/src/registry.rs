//! Terminal registry: the authoritative `id → TerminalState` map.
//!
//! All status transitions, inbox mutations, and lookups go through one
//! `parking_lot::Mutex`; hold time is O(1) and the lock is never held across
//! mux I/O or awaits. Status edges are published on a per-terminal watch
//! channel so handoff waiters and readers can park without polling the map.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    error::{ErrorKind, OrchestratorError, Result},
    provider::ProviderKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Starting,
    Idle,
    Busy,
    Completed,
    Error,
    Dead,
}

impl TerminalStatus {
    /// The legal transition edges. Anything else is `invalid-transition`;
    /// writing the current status again is a no-op, not an edge.
    pub fn can_transition_to(self, next: TerminalStatus) -> bool {
        use TerminalStatus::*;
        matches!(
            (self, next),
            (Starting, Idle | Error | Dead)
                | (Idle, Busy | Error | Dead)
                | (Busy, Idle | Completed | Error | Dead)
                | (Completed, Dead)
                | (Error, Idle | Busy | Dead)
        )
    }

    /// Statuses that refuse new inbox messages. COMPLETED terminals are about
    /// to be killed, so they count as gone.
    pub fn refuses_messages(self) -> bool {
        matches!(self, TerminalStatus::Dead | TerminalStatus::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    System,
    Result,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from_id: String,
    pub to_id: String,
    pub body: String,
    pub kind: MessageKind,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminalState {
    pub id: String,
    pub session_name: String,
    pub agent_profile: String,
    pub provider: ProviderKind,
    pub cwd: String,
    pub status: TerminalStatus,
    pub inbox: VecDeque<Message>,
    pub current_task: Option<String>,
    /// Extracted result of the most recent completed (or errored) task.
    pub last_output: Option<String>,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_status_at: DateTime<Utc>,
}

/// Result of a status write. `previous == current` means the write was a
/// no-op and no edge was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub previous: TerminalStatus,
    pub current: TerminalStatus,
}

impl StatusChange {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }

    /// True when this write crossed a `* → IDLE` edge (the bus delivery
    /// trigger).
    pub fn entered_idle(&self) -> bool {
        self.changed() && self.current == TerminalStatus::Idle
    }
}

/// What the reader does with the terminal when it sees the completion marker
/// of the current turn. Handed-off tasks complete; delivered inbox messages
/// are ordinary conversation turns and return the terminal to IDLE so the
/// next queued message can go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerDisposition {
    Complete,
    Idle,
}

struct TerminalEntry {
    state: TerminalState,
    status_tx: watch::Sender<TerminalStatus>,
    /// Incremented per marker-bearing injection; embedded in the markers so
    /// a stale marker from an earlier turn never satisfies a later one.
    task_seq: u64,
    marker_disposition: MarkerDisposition,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<HashMap<String, TerminalEntry>>,
}

fn slugify(profile: &str) -> String {
    let slug: String = profile
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "agent".to_string()
    } else {
        slug
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a terminal id and record its initial STARTING state. Does not
    /// touch the mux; launching is the orchestrator's job.
    pub fn new_terminal(
        &self,
        agent_profile: &str,
        provider: ProviderKind,
        cwd: &str,
        parent_id: Option<&str>,
    ) -> TerminalState {
        let uuid = Uuid::new_v4().simple().to_string();
        let id = uuid[..8].to_string();
        let session_name = format!("cao-{}-{}", slugify(agent_profile), &uuid[8..14]);
        let now = Utc::now();
        let state = TerminalState {
            id: id.clone(),
            session_name,
            agent_profile: agent_profile.to_string(),
            provider,
            cwd: cwd.to_string(),
            status: TerminalStatus::Starting,
            inbox: VecDeque::new(),
            current_task: None,
            last_output: None,
            parent_id: parent_id.map(str::to_string),
            created_at: now,
            last_status_at: now,
        };
        let (status_tx, _) = watch::channel(TerminalStatus::Starting);
        self.inner.lock().insert(
            id.clone(),
            TerminalEntry {
                state: state.clone(),
                status_tx,
                task_seq: 0,
                marker_disposition: MarkerDisposition::Idle,
            },
        );
        tracing::info!(
            target = "cao::registry",
            terminal = %state.id,
            session = %state.session_name,
            profile = %state.agent_profile,
            provider = %state.provider,
            "registered terminal"
        );
        state
    }

    fn with_entry<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut TerminalEntry) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner.lock();
        let entry = inner.get_mut(id).ok_or_else(|| {
            OrchestratorError::not_found(format!("terminal '{id}'")).with_terminal(id)
        })?;
        f(entry)
    }

    pub fn get(&self, id: &str) -> Result<TerminalState> {
        self.with_entry(id, |entry| Ok(entry.state.clone()))
    }

    pub fn list(&self) -> Vec<TerminalState> {
        let inner = self.inner.lock();
        let mut all: Vec<TerminalState> = inner.values().map(|e| e.state.clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Apply a status transition, enforcing the FSM. Same-status writes are
    /// accepted and emit no edge.
    pub fn update_status(&self, id: &str, next: TerminalStatus) -> Result<StatusChange> {
        let change = self.with_entry(id, |entry| {
            let previous = entry.state.status;
            if previous == next {
                return Ok(StatusChange { previous, current: next });
            }
            if !previous.can_transition_to(next) {
                return Err(OrchestratorError::new(
                    ErrorKind::InvalidTransition,
                    format!("illegal transition {previous:?} -> {next:?}"),
                )
                .with_terminal(id));
            }
            entry.state.status = next;
            entry.state.last_status_at = Utc::now();
            if next == TerminalStatus::Dead {
                // Dead inboxes are frozen and discarded.
                entry.state.inbox.clear();
            }
            let _ = entry.status_tx.send(next);
            Ok(StatusChange { previous, current: next })
        })?;
        if change.changed() {
            tracing::debug!(
                target = "cao::registry",
                terminal = %id,
                from = ?change.previous,
                to = ?change.current,
                "status transition"
            );
        }
        Ok(change)
    }

    /// Append a message to the terminal's inbox. Returns the queue position
    /// and the recipient's status at enqueue time.
    pub fn enqueue(&self, id: &str, message: Message) -> Result<(usize, TerminalStatus)> {
        self.with_entry(id, |entry| {
            let status = entry.state.status;
            if status.refuses_messages() {
                return Err(OrchestratorError::new(
                    ErrorKind::DeadRecipient,
                    format!("terminal '{id}' no longer accepts messages"),
                )
                .with_terminal(id));
            }
            entry.state.inbox.push_back(message);
            Ok((entry.state.inbox.len() - 1, status))
        })
    }

    /// Pop the head of the inbox if and only if the terminal is IDLE. The pop
    /// and the IDLE→BUSY transition happen in the same critical section, so
    /// at most one message comes off per idle edge even under concurrent
    /// flush attempts.
    pub fn pop_ready(&self, id: &str) -> Option<Message> {
        let mut inner = self.inner.lock();
        let entry = inner.get_mut(id)?;
        if entry.state.status != TerminalStatus::Idle || entry.state.inbox.is_empty() {
            return None;
        }
        let message = entry.state.inbox.pop_front();
        entry.state.status = TerminalStatus::Busy;
        entry.state.last_status_at = Utc::now();
        let _ = entry.status_tx.send(TerminalStatus::Busy);
        message
    }

    pub fn set_current_task(&self, id: &str, task: Option<String>) -> Result<()> {
        self.with_entry(id, |entry| {
            entry.state.current_task = task;
            Ok(())
        })
    }

    pub fn set_last_output(&self, id: &str, output: String) -> Result<()> {
        self.with_entry(id, |entry| {
            entry.state.last_output = Some(output);
            Ok(())
        })
    }

    /// Allocate the next marker sequence number for an injection and record
    /// what the completion marker means for this turn.
    pub fn begin_marker_task(&self, id: &str, disposition: MarkerDisposition) -> Result<u64> {
        self.with_entry(id, |entry| {
            entry.task_seq += 1;
            entry.marker_disposition = disposition;
            Ok(entry.task_seq)
        })
    }

    /// The in-flight marker sequence and its disposition. Sequence 0 means no
    /// marker-bearing injection has happened yet.
    pub fn marker_task(&self, id: &str) -> Result<(u64, MarkerDisposition)> {
        self.with_entry(id, |entry| Ok((entry.task_seq, entry.marker_disposition)))
    }

    /// Mark the terminal DEAD and drop its inbox. Idempotent: removing an
    /// already-dead terminal succeeds. The entry itself is kept so the id is
    /// never reused and stays observable.
    pub fn remove(&self, id: &str) -> Result<TerminalState> {
        self.with_entry(id, |entry| {
            if entry.state.status != TerminalStatus::Dead {
                entry.state.status = TerminalStatus::Dead;
                entry.state.last_status_at = Utc::now();
                entry.state.inbox.clear();
                let _ = entry.status_tx.send(TerminalStatus::Dead);
            }
            Ok(entry.state.clone())
        })
    }

    pub fn subscribe(&self, id: &str) -> Result<watch::Receiver<TerminalStatus>> {
        self.with_entry(id, |entry| Ok(entry.status_tx.subscribe()))
    }

    /// Park until the terminal's status satisfies `pred`, bounded by an
    /// optional timeout. Holds no lock while waiting.
    pub async fn wait_for_status(
        &self,
        id: &str,
        timeout: Option<Duration>,
        mut pred: impl FnMut(TerminalStatus) -> bool,
    ) -> Result<TerminalStatus> {
        let mut rx = self.subscribe(id)?;
        let wait = rx.wait_for(|status| pred(*status));
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(OrchestratorError::new(
                        ErrorKind::Timeout,
                        format!("timed out waiting on terminal '{id}'"),
                    )
                    .with_terminal(id))
                }
            },
            None => wait.await,
        };
        match outcome {
            Ok(status) => Ok(*status),
            Err(_) => Err(OrchestratorError::internal(format!(
                "status channel for terminal '{id}' closed"
            ))
            .with_terminal(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{Message, MessageKind, Registry, TerminalStatus};
    use crate::provider::ProviderKind;

    fn msg(to: &str, body: &str) -> Message {
        Message {
            from_id: "sender01".into(),
            to_id: to.into(),
            body: body.into(),
            kind: MessageKind::User,
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn ids_are_unique_and_sessions_prefixed() {
        let registry = Registry::new();
        let a = registry.new_terminal("reviewer", ProviderKind::QCli, "/tmp", None);
        let b = registry.new_terminal("reviewer", ProviderKind::QCli, "/tmp", None);
        assert_ne!(a.id, b.id);
        assert!(a.session_name.starts_with("cao-reviewer-"));
        assert_ne!(a.session_name, b.session_name);
    }

    #[test]
    fn fsm_rejects_illegal_transitions() {
        let registry = Registry::new();
        let t = registry.new_terminal("dev", ProviderKind::QCli, "/tmp", None);

        // STARTING -> COMPLETED is not an edge.
        let err = registry
            .update_status(&t.id, TerminalStatus::Completed)
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidTransition);

        registry.update_status(&t.id, TerminalStatus::Idle).unwrap();
        registry.update_status(&t.id, TerminalStatus::Busy).unwrap();
        registry
            .update_status(&t.id, TerminalStatus::Completed)
            .unwrap();
        // COMPLETED only goes to DEAD.
        assert!(registry
            .update_status(&t.id, TerminalStatus::Idle)
            .is_err());
        registry.update_status(&t.id, TerminalStatus::Dead).unwrap();
        // DEAD is terminal.
        assert!(registry
            .update_status(&t.id, TerminalStatus::Idle)
            .is_err());
    }

    #[test]
    fn same_status_write_is_a_noop() {
        let registry = Registry::new();
        let t = registry.new_terminal("dev", ProviderKind::QCli, "/tmp", None);
        registry.update_status(&t.id, TerminalStatus::Idle).unwrap();
        let change = registry.update_status(&t.id, TerminalStatus::Idle).unwrap();
        assert!(!change.changed());
        assert!(!change.entered_idle());
    }

    #[test]
    fn idle_edge_is_flagged() {
        let registry = Registry::new();
        let t = registry.new_terminal("dev", ProviderKind::QCli, "/tmp", None);
        let change = registry.update_status(&t.id, TerminalStatus::Idle).unwrap();
        assert!(change.entered_idle());
    }

    #[test]
    fn inbox_accepts_while_starting_and_refuses_when_dead() {
        let registry = Registry::new();
        let t = registry.new_terminal("dev", ProviderKind::QCli, "/tmp", None);

        let (pos, status) = registry.enqueue(&t.id, msg(&t.id, "early")).unwrap();
        assert_eq!(pos, 0);
        assert_eq!(status, TerminalStatus::Starting);

        registry.remove(&t.id).unwrap();
        let err = registry.enqueue(&t.id, msg(&t.id, "late")).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::DeadRecipient);
    }

    #[test]
    fn completed_terminal_refuses_messages() {
        let registry = Registry::new();
        let t = registry.new_terminal("dev", ProviderKind::QCli, "/tmp", None);
        registry.update_status(&t.id, TerminalStatus::Idle).unwrap();
        registry.update_status(&t.id, TerminalStatus::Busy).unwrap();
        registry
            .update_status(&t.id, TerminalStatus::Completed)
            .unwrap();
        let err = registry.enqueue(&t.id, msg(&t.id, "x")).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::DeadRecipient);
    }

    #[test]
    fn pop_ready_only_fires_when_idle_and_marks_busy() {
        let registry = Registry::new();
        let t = registry.new_terminal("dev", ProviderKind::QCli, "/tmp", None);
        registry.enqueue(&t.id, msg(&t.id, "m1")).unwrap();
        registry.enqueue(&t.id, msg(&t.id, "m2")).unwrap();

        // Still STARTING: nothing pops.
        assert!(registry.pop_ready(&t.id).is_none());

        registry.update_status(&t.id, TerminalStatus::Idle).unwrap();
        let first = registry.pop_ready(&t.id).unwrap();
        assert_eq!(first.body, "m1");
        assert_eq!(registry.get(&t.id).unwrap().status, TerminalStatus::Busy);

        // BUSY now: second message stays queued.
        assert!(registry.pop_ready(&t.id).is_none());

        registry.update_status(&t.id, TerminalStatus::Idle).unwrap();
        let second = registry.pop_ready(&t.id).unwrap();
        assert_eq!(second.body, "m2");
        assert!(registry.get(&t.id).unwrap().inbox.is_empty());
    }

    #[test]
    fn remove_is_idempotent_and_clears_inbox() {
        let registry = Registry::new();
        let t = registry.new_terminal("dev", ProviderKind::QCli, "/tmp", None);
        registry.enqueue(&t.id, msg(&t.id, "pending")).unwrap();
        let dead = registry.remove(&t.id).unwrap();
        assert_eq!(dead.status, TerminalStatus::Dead);
        assert!(dead.inbox.is_empty());
        // Second removal still succeeds.
        registry.remove(&t.id).unwrap();
    }

    #[test]
    fn marker_seq_increments_and_tracks_disposition() {
        use super::MarkerDisposition;

        let registry = Registry::new();
        let t = registry.new_terminal("dev", ProviderKind::QCli, "/tmp", None);
        assert_eq!(
            registry
                .begin_marker_task(&t.id, MarkerDisposition::Complete)
                .unwrap(),
            1
        );
        assert_eq!(
            registry
                .begin_marker_task(&t.id, MarkerDisposition::Idle)
                .unwrap(),
            2
        );
        let (seq, disposition) = registry.marker_task(&t.id).unwrap();
        assert_eq!(seq, 2);
        assert_eq!(disposition, MarkerDisposition::Idle);
    }

    #[tokio::test]
    async fn wait_for_status_sees_transitions() {
        let registry = std::sync::Arc::new(Registry::new());
        let t = registry.new_terminal("dev", ProviderKind::QCli, "/tmp", None);

        let waiter = {
            let registry = registry.clone();
            let id = t.id.clone();
            tokio::spawn(async move {
                registry
                    .wait_for_status(&id, None, |s| s == TerminalStatus::Idle)
                    .await
            })
        };

        tokio::task::yield_now().await;
        registry.update_status(&t.id, TerminalStatus::Idle).unwrap();
        let status = waiter.await.unwrap().unwrap();
        assert_eq!(status, TerminalStatus::Idle);
    }

    #[tokio::test]
    async fn wait_for_status_times_out() {
        let registry = Registry::new();
        let t = registry.new_terminal("dev", ProviderKind::QCli, "/tmp", None);
        let err = registry
            .wait_for_status(
                &t.id,
                Some(std::time::Duration::from_millis(20)),
                |s| s == TerminalStatus::Completed,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Timeout);
    }
}
