//! Orchestration server for interactive CLI coding agents.
//!
//! Each agent runs inside its own tmux session. The server owns the set of
//! live terminals, serializes terminal I/O through a controlled
//! injection/readback protocol, routes inter-terminal messages through
//! per-terminal inboxes, and exposes the handoff / assign / send-message
//! primitives over a loopback HTTP control plane. A cron-driven flow
//! scheduler spawns terminals on time triggers.

use std::sync::Arc;

use anyhow::Context;

pub mod api;
pub mod bus;
pub mod config;
pub mod error;
pub mod flow;
pub mod mux;
pub mod orchestrator;
pub mod output;
pub mod profile;
pub mod provider;
pub mod reader;
pub mod registry;
pub mod scheduler;

use api::ApiState;
use config::ServerConfig;
use flow::FlowStore;
use mux::{MuxClient, TmuxClient};
use orchestrator::Orchestrator;
use registry::Registry;
use scheduler::FlowScheduler;

/// Run the orchestration server until the process is stopped. Live terminals
/// are deliberately left running on exit: the mux sessions outlive us, and
/// `cao shutdown` is the explicit way to kill them.
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let registry = Arc::new(Registry::new());
    let mux: Arc<dyn MuxClient> = Arc::new(TmuxClient::new());
    let orchestrator = Arc::new(Orchestrator::new(registry, mux, config.clone()));

    let flows = Arc::new(
        FlowStore::open(&config.flows_dir)
            .with_context(|| format!("failed to open flow store at {}", config.flows_dir.display()))?,
    );
    let scheduler = Arc::new(FlowScheduler::new(
        flows.clone(),
        orchestrator.clone(),
        config.scheduler_tick,
    ));
    scheduler.spawn();

    let app = api::router(ApiState {
        orchestrator,
        flows,
        scheduler,
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
    tracing::info!(
        target = "cao::server",
        host = %config.host,
        port = config.port,
        "control plane listening"
    );
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
