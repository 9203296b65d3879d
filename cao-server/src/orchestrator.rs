//! Orchestration primitives: handoff, assign, send-message, shutdown.
//!
//! A handoff parks its caller on the callee's status channel and holds no
//! lock while waiting, so concurrent handoffs against distinct terminals
//! never serialize against each other.

use std::sync::Arc;

use chrono::Utc;

use crate::{
    bus::{DeliveryOutcome, MessageBus},
    config::ServerConfig,
    error::{ErrorKind, OrchestratorError, Result},
    mux::MuxClient,
    output::{extract_last_message, normalize_line_endings, strip_ansi},
    provider::ProviderKind,
    reader::{spawn_reader, Injector, ReaderConfig},
    registry::{Message, MessageKind, Registry, TerminalState, TerminalStatus},
};

#[derive(Debug, Clone)]
pub struct CreateTerminalRequest {
    pub agent_profile: String,
    pub provider: Option<ProviderKind>,
    pub cwd: Option<String>,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HandoffRequest {
    pub from_id: Option<String>,
    pub agent_profile: String,
    pub provider: Option<ProviderKind>,
    pub body: String,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HandoffOutcome {
    pub terminal_id: String,
    pub output: String,
    pub status: TerminalStatus,
}

#[derive(Debug, Clone)]
pub struct AssignRequest {
    pub from_id: Option<String>,
    pub agent_profile: String,
    pub provider: Option<ProviderKind>,
    pub body: String,
    pub cwd: Option<String>,
    pub callback: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    Full,
    Last,
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    mux: Arc<dyn MuxClient>,
    injector: Arc<Injector>,
    bus: Arc<MessageBus>,
    config: ServerConfig,
}

impl Orchestrator {
    pub fn new(registry: Arc<Registry>, mux: Arc<dyn MuxClient>, config: ServerConfig) -> Self {
        let injector = Arc::new(Injector::new(registry.clone(), mux.clone()));
        let bus = Arc::new(MessageBus::new(registry.clone(), injector.clone()));
        Self {
            registry,
            mux,
            injector,
            bus,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn resolve_provider(&self, requested: Option<ProviderKind>, parent: Option<&str>) -> ProviderKind {
        requested
            .or_else(|| {
                parent.and_then(|id| self.registry.get(id).ok().map(|state| state.provider))
            })
            .unwrap_or_default()
    }

    fn resolve_cwd(&self, requested: Option<String>, parent: Option<&str>) -> String {
        requested
            .or_else(|| parent.and_then(|id| self.registry.get(id).ok().map(|state| state.cwd)))
            .unwrap_or_else(|| {
                std::env::current_dir()
                    .map(|dir| dir.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| "/".to_string())
            })
    }

    /// Allocate a terminal, start its mux session, and spawn its reader.
    /// Returns with the terminal still in STARTING; callers that need the
    /// ready prompt use [`Orchestrator::wait_ready`].
    pub async fn create_terminal(&self, req: CreateTerminalRequest) -> Result<TerminalState> {
        let provider = self.resolve_provider(req.provider, req.parent_id.as_deref());
        let cwd = self.resolve_cwd(req.cwd, req.parent_id.as_deref());
        let state = self
            .registry
            .new_terminal(&req.agent_profile, provider, &cwd, req.parent_id.as_deref());

        let env = vec![("CAO_TERMINAL_ID".to_string(), state.id.clone())];
        let command = provider.launch_command(&req.agent_profile);
        if let Err(err) = self
            .mux
            .create(&state.session_name, &cwd, &command, &env)
            .await
        {
            // Nothing to inspect when the session never came up.
            let _ = self.registry.remove(&state.id);
            return Err(OrchestratorError::new(
                ErrorKind::LaunchFailure,
                format!("failed to start session '{}': {err}", state.session_name),
            )
            .with_terminal(&state.id));
        }

        spawn_reader(
            self.registry.clone(),
            self.mux.clone(),
            self.bus.clone(),
            state.id.clone(),
            ReaderConfig::from(&self.config),
        );
        Ok(state)
    }

    /// Block until the terminal's agent shows its ready prompt. A startup
    /// timeout marks the terminal ERROR (the session stays up for
    /// inspection) and surfaces as `launch-failure`.
    pub async fn wait_ready(&self, id: &str) -> Result<()> {
        let status = self
            .registry
            .wait_for_status(id, Some(self.config.startup_timeout), |status| {
                matches!(
                    status,
                    TerminalStatus::Idle | TerminalStatus::Error | TerminalStatus::Dead
                )
            })
            .await;

        match status {
            Ok(TerminalStatus::Idle) => Ok(()),
            Ok(other) => Err(OrchestratorError::new(
                ErrorKind::LaunchFailure,
                format!("terminal entered {other:?} before becoming ready"),
            )
            .with_terminal(id)),
            Err(err) if err.kind == ErrorKind::Timeout => {
                let _ = self.registry.update_status(id, TerminalStatus::Error);
                Err(OrchestratorError::new(
                    ErrorKind::LaunchFailure,
                    "agent did not become ready within the startup timeout",
                )
                .with_terminal(id))
            }
            Err(err) => Err(err),
        }
    }

    /// Synchronous delegation: spawn, run, await the result, clean up.
    pub async fn handoff(&self, req: HandoffRequest) -> Result<HandoffOutcome> {
        let state = self
            .create_terminal(CreateTerminalRequest {
                agent_profile: req.agent_profile,
                provider: req.provider,
                cwd: req.cwd,
                parent_id: req.from_id,
            })
            .await?;
        let id = state.id.clone();

        self.wait_ready(&id).await?;
        self.injector.inject_task(&id, &req.body, true).await?;

        let final_status = self
            .registry
            .wait_for_status(&id, self.config.handoff_timeout, |status| {
                matches!(
                    status,
                    TerminalStatus::Completed | TerminalStatus::Error | TerminalStatus::Dead
                )
            })
            .await
            .map_err(|err| {
                if err.kind == ErrorKind::Timeout {
                    let _ = self.registry.update_status(&id, TerminalStatus::Error);
                }
                err
            })?;

        let output = self.registry.get(&id)?.last_output.unwrap_or_default();
        match final_status {
            TerminalStatus::Completed => {
                // Graceful exit first; the kill mops up whatever remains.
                let _ = self
                    .mux
                    .send_keys(&state.session_name, state.provider.exit_command(), true)
                    .await;
                let _ = self.mux.kill(&state.session_name).await;
                let _ = self.registry.remove(&id);
                tracing::info!(target = "cao::orchestrator", terminal = %id, "handoff completed");
                Ok(HandoffOutcome {
                    terminal_id: id,
                    output,
                    status: TerminalStatus::Completed,
                })
            }
            TerminalStatus::Error => {
                // Left alive for inspection.
                tracing::warn!(target = "cao::orchestrator", terminal = %id, "handoff errored");
                Ok(HandoffOutcome {
                    terminal_id: id,
                    output,
                    status: TerminalStatus::Error,
                })
            }
            _ => Err(OrchestratorError::internal(
                "terminal died before finishing the handed-off task",
            )
            .with_terminal(&id)),
        }
    }

    /// Asynchronous delegation: spawn, run, return immediately. The worker is
    /// told to report back to the callback terminal over the message bus.
    pub async fn assign(&self, req: AssignRequest) -> Result<TerminalState> {
        let callback = req.callback.clone().or_else(|| req.from_id.clone());
        let state = self
            .create_terminal(CreateTerminalRequest {
                agent_profile: req.agent_profile,
                provider: req.provider,
                cwd: req.cwd,
                parent_id: req.from_id,
            })
            .await?;

        self.wait_ready(&state.id).await?;

        let body = match callback {
            Some(cb) => format!(
                "{} When you finish, send your result to terminal {cb} using the send_message tool.",
                req.body
            ),
            None => req.body,
        };
        self.injector.inject_task(&state.id, &body, false).await?;
        tracing::info!(target = "cao::orchestrator", terminal = %state.id, "task assigned");
        self.registry.get(&state.id)
    }

    pub async fn send_message(
        &self,
        from_id: &str,
        to_id: &str,
        body: &str,
        kind: MessageKind,
    ) -> Result<DeliveryOutcome> {
        self.bus
            .send(Message {
                from_id: from_id.to_string(),
                to_id: to_id.to_string(),
                body: body.to_string(),
                kind,
                enqueued_at: Utc::now(),
            })
            .await
    }

    /// Kill the terminal's session and mark it DEAD. Idempotent.
    pub async fn shutdown_terminal(&self, id: &str) -> Result<()> {
        let state = self.registry.get(id)?;
        if state.status != TerminalStatus::Dead {
            let _ = self.mux.kill(&state.session_name).await;
        }
        self.registry.remove(id)?;
        tracing::info!(target = "cao::orchestrator", terminal = %id, "terminal shut down");
        Ok(())
    }

    /// Shut down every live terminal. Returns the ids that were killed.
    pub async fn shutdown_all(&self) -> Vec<String> {
        let mut killed = Vec::new();
        for state in self.registry.list() {
            if state.status != TerminalStatus::Dead
                && self.shutdown_terminal(&state.id).await.is_ok()
            {
                killed.push(state.id);
            }
        }
        killed
    }

    /// Captured pane text, ANSI-stripped. `Last` mode extracts the agent's
    /// most recent message (falling back to the stored task result).
    pub async fn output(&self, id: &str, mode: OutputMode) -> Result<String> {
        let state = self.registry.get(id)?;
        let raw = self
            .mux
            .capture(&state.session_name, self.config.history_lines)
            .await
            .map_err(|err| OrchestratorError::from(err).with_terminal(id))?;
        let clean = normalize_line_endings(&strip_ansi(&raw));
        match mode {
            OutputMode::Full => Ok(clean),
            OutputMode::Last => Ok(extract_last_message(&clean, state.provider.ready_pattern())
                .or(state.last_output)
                .unwrap_or_default()),
        }
    }
}
