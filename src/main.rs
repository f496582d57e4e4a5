//! BayServer - main entry point.
//!
//! Without `--agent-id` the process is the monitor: it binds the control
//! listener and launches the agents, either as threads of this process or
//! as child processes re-running this executable. With `--agent-id` the
//! process is one such child agent.

use bayserver_core::agent::{
    run_child_agent, validate_ports, AgentLauncher, AgentRegistry, PortMode, ProcessLauncher,
    ThreadLauncher, UsageBoard,
};
use bayserver_core::control::{GrandAgentMonitor, MonitorHandle};
use bayserver_core::docker::ConfiguredPort;
use bayserver_core::types::{AgentId, PortConfig};
use bayserver_core::{Config, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "bayserver", version, about = "Multiplexed application server")]
struct Cli {
    /// JSON configuration file.
    #[arg(long, env = "BAYSERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Number of agents (overrides server.agents).
    #[arg(long)]
    agents: Option<usize>,

    /// Run all agents as threads of one process.
    #[arg(long)]
    single: bool,

    /// Extra h1 listening address; may be repeated.
    #[arg(long = "port")]
    ports: Vec<String>,

    /// Run as the agent with this id (set by the monitor).
    #[arg(long)]
    agent_id: Option<i32>,

    /// Control port of the monitor (set by the monitor).
    #[arg(long, default_value_t = 0)]
    monitor_port: u16,

    /// How a child agent binds its ports (set by the monitor).
    #[arg(long, value_enum, default_value_t = PortMode::Open)]
    port_mode: PortMode,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(agents) = cli.agents {
        config.server.agents = agents;
    }
    if cli.single {
        config.server.multi_core = false;
    }
    config.ports.extend(cli.ports.iter().map(|addr| PortConfig {
        addr: addr.clone(),
        protocol: "h1".to_string(),
        secure: false,
        permit: Vec::new(),
        lenient: false,
    }));
    config.validate()?;
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("bayserver: {}", e);
            return ExitCode::from(2);
        }
    };
    bayserver_core::observability::init_tracing(&config.observability);

    match cli.agent_id {
        Some(agent_id) => run_agent_process(AgentId::new(agent_id), &cli, config),
        None => run_monitor_process(config),
    }
}

fn run_agent_process(agent_id: AgentId, cli: &Cli, config: Arc<Config>) -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(agent = %agent_id, "cannot build runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run_child_agent(agent_id, cli.monitor_port, cli.port_mode, config)) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(status) => ExitCode::from(u8::try_from(status).unwrap_or(1)),
        Err(e) => {
            tracing::error!(agent = %agent_id, "agent failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_monitor_process(config: Arc<Config>) -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("cannot build runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run_monitor(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("server failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_monitor(config: Arc<Config>) -> Result<()> {
    let ports = ConfiguredPort::from_config(&config.ports, config.warp.as_ref())?;
    for port in &ports {
        tracing::info!(port = %port.addr(), secure = port.secure(), "serving");
    }

    let launcher: Arc<dyn AgentLauncher> = if config.server.multi_core {
        validate_ports(&ports)?;
        Arc::new(ProcessLauncher::current()?)
    } else {
        let registry = AgentRegistry::new();
        let usage = Arc::new(UsageBoard::new());
        registry.add_listener(usage.clone());
        Arc::new(ThreadLauncher::bind(Arc::clone(&config), registry, usage)?)
    };

    let (monitor, handle) = GrandAgentMonitor::bind(config.server.clone(), launcher).await?;
    tokio::spawn(forward_signals(handle));
    monitor.run().await
}

/// Ctrl-C and SIGTERM stop every agent; SIGHUP reloads certificates.
async fn forward_signals(handle: MonitorHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut term), Ok(mut hangup)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        ) else {
            tracing::warn!("cannot install signal handlers");
            return;
        };
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = term.recv() => break,
                _ = hangup.recv() => {
                    let _ = handle.reload_cert(None);
                }
            }
        }
    }
    #[cfg(not(unix))]
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }

    tracing::info!("stop requested");
    if handle.shutdown_all().is_err() {
        tracing::debug!("monitor already stopped");
    }
}
