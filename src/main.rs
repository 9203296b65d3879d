use std::{net::IpAddr, path::PathBuf, process::ExitCode, time::Duration};

mod client;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;

use cao_server::{config::ServerConfig, profile::ProfileStore, provider::ProviderKind};
use client::{CaoClient, ClientError};

#[derive(Debug, Parser)]
#[command(name = "cao")]
#[command(about = "CLI Agent Orchestrator: brokers interactive coding agents in tmux sessions")]
#[command(version)]
struct Cli {
    /// Control-plane base URL.
    #[arg(long, global = true, default_value = "http://127.0.0.1:9889")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the orchestration server.
    Serve(ServeCommand),
    /// Launch a new agent terminal.
    Launch(LaunchCommand),
    /// List the live terminals.
    Team,
    /// Kill one terminal, or all of them.
    Shutdown(ShutdownCommand),
    /// Manage scheduled flows.
    Flow(FlowCommand),
    /// Install the built-in agent profiles.
    Install,
    /// List the supported providers.
    Providers,
}

#[derive(Debug, clap::Args)]
struct ServeCommand {
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(long, default_value_t = 9889)]
    port: u16,

    #[arg(long)]
    flows_dir: Option<PathBuf>,

    #[arg(long)]
    profiles_dir: Option<PathBuf>,

    /// Reader poll cadence in milliseconds.
    #[arg(long, default_value_t = 500)]
    poll_interval: u64,

    /// Seconds to wait for a launched agent's ready prompt.
    #[arg(long, default_value_t = 60)]
    startup_timeout: u64,

    /// Optional bound on handoff waits, in seconds.
    #[arg(long)]
    handoff_timeout: Option<u64>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, clap::Args)]
struct LaunchCommand {
    /// Agent profile to launch.
    #[arg(long)]
    agent: String,

    #[arg(long)]
    provider: Option<String>,

    #[arg(long)]
    cwd: Option<String>,
}

#[derive(Debug, clap::Args)]
struct ShutdownCommand {
    /// Terminal id to shut down.
    #[arg(long, conflicts_with = "all", required_unless_present = "all")]
    id: Option<String>,

    /// Shut down every live terminal.
    #[arg(long)]
    all: bool,
}

#[derive(Debug, clap::Args)]
struct FlowCommand {
    #[command(subcommand)]
    action: FlowAction,
}

#[derive(Debug, Subcommand)]
enum FlowAction {
    /// Register a flow from a markdown file.
    Add { file: PathBuf },
    List,
    /// Fire a flow now (the script gate still applies).
    Run { name: String },
    Enable { name: String },
    Disable { name: String },
    Remove { name: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<ClientError>()
                .map(ClientError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = CaoClient::new(&cli.server);
    match cli.command {
        Commands::Serve(cmd) => serve(cmd).await,
        Commands::Launch(cmd) => {
            let terminal = client
                .create_terminal(&cmd.agent, cmd.provider.as_deref(), cmd.cwd.as_deref())
                .await?;
            println!(
                "launched terminal {} (session {})",
                field(&terminal, "id"),
                field(&terminal, "session_name")
            );
            Ok(())
        }
        Commands::Team => {
            let terminals = client.list_terminals().await?;
            if terminals.is_empty() {
                println!("no terminals");
                return Ok(());
            }
            println!("{:<10} {:<20} {:<12} {:<10}", "ID", "AGENT", "PROVIDER", "STATUS");
            for t in terminals {
                println!(
                    "{:<10} {:<20} {:<12} {:<10}",
                    field(&t, "id"),
                    field(&t, "agent_profile"),
                    field(&t, "provider"),
                    field(&t, "status"),
                );
            }
            Ok(())
        }
        Commands::Shutdown(cmd) => {
            if cmd.all {
                let terminals = client.list_terminals().await?;
                let mut killed = 0;
                for t in terminals {
                    let id = field(&t, "id");
                    if field(&t, "status") != "dead" && !id.is_empty() {
                        client.delete_terminal(&id).await?;
                        killed += 1;
                    }
                }
                println!("shut down {killed} terminal(s)");
            } else if let Some(id) = cmd.id {
                client.delete_terminal(&id).await?;
                println!("shut down terminal {id}");
            } else {
                anyhow::bail!("pass --id <terminal> or --all");
            }
            Ok(())
        }
        Commands::Flow(cmd) => flow(client, cmd.action).await,
        Commands::Install => {
            let store = ProfileStore::open(ServerConfig::default().profiles_dir)
                .context("failed to open profile store")?;
            let installed = store.install_builtins()?;
            if installed.is_empty() {
                println!("all built-in profiles already installed");
            } else {
                println!("installed profiles: {}", installed.join(", "));
            }
            Ok(())
        }
        Commands::Providers => {
            for provider in ProviderKind::ALL {
                println!("{provider}");
            }
            Ok(())
        }
    }
}

async fn serve(cmd: ServeCommand) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cmd.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ServerConfig::default();
    config.host = cmd.host;
    config.port = cmd.port;
    config.poll_interval = Duration::from_millis(cmd.poll_interval);
    config.startup_timeout = Duration::from_secs(cmd.startup_timeout);
    config.handoff_timeout = cmd.handoff_timeout.map(Duration::from_secs);
    if let Some(dir) = cmd.flows_dir {
        config.flows_dir = dir;
    }
    if let Some(dir) = cmd.profiles_dir {
        config.profiles_dir = dir;
    }
    cao_server::run_server(config).await
}

async fn flow(client: CaoClient, action: FlowAction) -> anyhow::Result<()> {
    match action {
        FlowAction::Add { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let result = client.add_flow(&content).await?;
            println!("registered flow {}", field(&result, "name"));
        }
        FlowAction::List => {
            let flows = client.list_flows().await?;
            if flows.is_empty() {
                println!("no flows");
                return Ok(());
            }
            println!(
                "{:<24} {:<16} {:<20} {:<8} {}",
                "NAME", "SCHEDULE", "AGENT", "ENABLED", "NEXT FIRE"
            );
            for f in flows {
                println!(
                    "{:<24} {:<16} {:<20} {:<8} {}",
                    field(&f, "name"),
                    field(&f, "schedule"),
                    field(&f, "agent_profile"),
                    field(&f, "enabled"),
                    field(&f, "next_fire_at"),
                );
            }
        }
        FlowAction::Run { name } => {
            let result = client.run_flow(&name).await?;
            match result.get("terminal_id").and_then(Value::as_str) {
                Some(id) => println!("flow '{name}' spawned terminal {id}"),
                None => println!("flow '{name}' skipped by its script gate"),
            }
        }
        FlowAction::Enable { name } => {
            client.set_flow_enabled(&name, true).await?;
            println!("enabled flow {name}");
        }
        FlowAction::Disable { name } => {
            client.set_flow_enabled(&name, false).await?;
            println!("disabled flow {name}");
        }
        FlowAction::Remove { name } => {
            client.delete_flow(&name).await?;
            println!("removed flow {name}");
        }
    }
    Ok(())
}

/// Stringify a JSON field for table output; booleans and numbers print bare.
fn field(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
