//! Cron-driven flow scheduler.
//!
//! A single tick task scans the flow store every `scheduler_tick` and fires
//! whatever is due. Script failures are recorded on the flow and never take
//! the scheduler down; `next_fire_at` advances whether or not the firing
//! spawned anything, so missed slots collapse instead of catching up.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::{
    error::Result,
    flow::{interpolate, run_script, FlowStore},
    orchestrator::{AssignRequest, Orchestrator},
};

pub struct FlowScheduler {
    store: Arc<FlowStore>,
    orchestrator: Arc<Orchestrator>,
    tick: Duration,
}

impl FlowScheduler {
    pub fn new(store: Arc<FlowStore>, orchestrator: Arc<Orchestrator>, tick: Duration) -> Self {
        Self {
            store,
            orchestrator,
            tick,
        }
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(target = "cao::scheduler", tick_secs = this.tick.as_secs(), "flow scheduler started");
            loop {
                interval.tick().await;
                this.run_due(Utc::now()).await;
            }
        })
    }

    /// Fire every enabled flow whose `next_fire_at` has arrived.
    pub async fn run_due(&self, now: DateTime<Utc>) {
        for def in self.store.due(now) {
            match self.fire(&def.name).await {
                Ok(Some(terminal_id)) => {
                    tracing::info!(
                        target = "cao::scheduler",
                        flow = %def.name,
                        terminal = %terminal_id,
                        "flow fired"
                    );
                }
                Ok(None) => {
                    tracing::info!(
                        target = "cao::scheduler",
                        flow = %def.name,
                        "flow skipped by script gate"
                    );
                }
                Err(err) => {
                    self.store.record_error(&def.name, &err.to_string());
                    tracing::warn!(
                        target = "cao::scheduler",
                        flow = %def.name,
                        error = %err,
                        "flow firing failed"
                    );
                }
            }
            // Advance regardless of outcome; the next slot is computed from
            // now, never from the missed one.
            self.store.advance(&def.name, now);
        }
    }

    /// Execute one firing: script gate, template interpolation, assign.
    /// Returns the spawned terminal id, or `None` when the gate said no.
    pub async fn fire(&self, name: &str) -> Result<Option<String>> {
        let def = self.store.get(name)?;

        let values = match &def.script {
            Some(path) => {
                let gate = run_script(path).await?;
                if !gate.execute {
                    return Ok(None);
                }
                gate.output
            }
            None => HashMap::new(),
        };

        let prompt = interpolate(&def.prompt_template, &values);
        let state = self
            .orchestrator
            .assign(AssignRequest {
                from_id: None,
                agent_profile: def.agent_profile.clone(),
                provider: def.provider,
                body: prompt,
                cwd: None,
                callback: None,
            })
            .await?;
        Ok(Some(state.id))
    }
}
