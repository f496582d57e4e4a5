//! Starting agents: in-process threads or child processes.

use async_trait::async_trait;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};

use super::registry::{AgentRegistry, UsageBoard};
use super::{AgentMode, GrandAgent};
use crate::control::CommandReceiver;
use crate::docker::{ConfiguredPort, Port};
use crate::types::{AgentId, Config, Error, Result};

/// Flags the monitor appends when it spawns an agent process.
pub const AGENT_ID_FLAG: &str = "--agent-id";
pub const MONITOR_PORT_FLAG: &str = "--monitor-port";
pub const PORT_MODE_FLAG: &str = "--port-mode";

const SPAWN_FLAGS: [&str; 3] = [AGENT_ID_FLAG, MONITOR_PORT_FLAG, PORT_MODE_FLAG];

/// How an agent process obtains its listening sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum PortMode {
    /// Bind the ports exclusively.
    Open,
    /// Bind the ports shared with sibling agents (`SO_REUSEPORT`).
    Receive,
}

impl PortMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PortMode::Open => "open",
            PortMode::Receive => "receive",
        }
    }
}

/// Starts one agent that connects back to the monitor on `monitor_port`.
#[async_trait]
pub trait AgentLauncher: Send + Sync + Debug {
    async fn launch(&self, agent_id: AgentId, monitor_port: u16) -> Result<()>;
}

/// Drop the spawn flags (both `--flag value` and `--flag=value` forms) from
/// a parent argument list.
pub fn child_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut skip_value = false;
    for arg in args {
        if skip_value {
            skip_value = false;
            continue;
        }
        if SPAWN_FLAGS.contains(&arg.as_str()) {
            skip_value = true;
            continue;
        }
        let with_value = SPAWN_FLAGS.iter().any(|flag| {
            arg.strip_prefix(flag)
                .is_some_and(|rest| rest.starts_with('='))
        });
        if !with_value {
            out.push(arg.clone());
        }
    }
    out
}

/// Bind a listening socket, optionally shared with other processes.
pub fn bind_port(addr: SocketAddr, reuse_port: bool) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuseport(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket
        .bind(addr)
        .map_err(|e| Error::config(format!("cannot bind {}: {}", addr, e)))?;
    Ok(socket.listen(1024)?)
}

/// Check every port can be bound before any agent is started.
pub fn validate_ports(ports: &[Arc<dyn Port>]) -> Result<()> {
    for port in ports {
        let listener = bind_port(port.addr(), true)?;
        tracing::debug!(port = %port.addr(), "port validated");
        drop(listener);
    }
    Ok(())
}

// =============================================================================
// Child processes
// =============================================================================

/// Spawns `bayserver` child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    exe: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(exe: PathBuf, args: Vec<String>) -> Self {
        Self { exe, args }
    }

    /// Launcher re-running the current executable with the current
    /// arguments.
    pub fn current() -> Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            std::env::args().skip(1).collect(),
        ))
    }

    pub fn command_args(&self, agent_id: AgentId, monitor_port: u16) -> Vec<String> {
        let mut args = child_args(&self.args);
        args.extend([
            AGENT_ID_FLAG.to_string(),
            agent_id.to_string(),
            MONITOR_PORT_FLAG.to_string(),
            monitor_port.to_string(),
            PORT_MODE_FLAG.to_string(),
            PortMode::Receive.as_str().to_string(),
        ]);
        args
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn launch(&self, agent_id: AgentId, monitor_port: u16) -> Result<()> {
        let mut child = tokio::process::Command::new(&self.exe)
            .args(self.command_args(agent_id, monitor_port))
            .stdin(Stdio::null())
            .spawn()?;
        tracing::info!(agent = %agent_id, pid = ?child.id(), "agent process spawned");
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(agent = %agent_id, %status, "agent process exited"),
                Err(e) => tracing::warn!(agent = %agent_id, "waiting for agent process failed: {}", e),
            }
        });
        Ok(())
    }
}

/// Entry point of an agent process.
pub async fn run_child_agent(
    agent_id: AgentId,
    monitor_port: u16,
    port_mode: PortMode,
    config: Arc<Config>,
) -> Result<i32> {
    let ports = ConfiguredPort::from_config(&config.ports, config.warp.as_ref())?;
    let receiver = CommandReceiver::connect(agent_id, monitor_port).await?;

    let registry = AgentRegistry::new();
    let usage = Arc::new(UsageBoard::new());
    registry.add_listener(usage.clone());

    let mut agent = GrandAgent::new(agent_id, AgentMode::MultiCore, &config, registry)
        .with_usage_board(usage)
        .with_receiver(receiver)
        .with_forker(Arc::new(ProcessLauncher::current()?), monitor_port);
    for port in ports {
        let listener = bind_port(port.addr(), port_mode == PortMode::Receive)?;
        agent.anchor(listener, port)?;
    }
    Ok(agent.run().await)
}

// =============================================================================
// In-process threads
// =============================================================================

/// Runs each agent on its own OS thread with a current-thread runtime. All
/// agents accept on clones of the same listening sockets.
#[derive(Debug)]
pub struct ThreadLauncher {
    config: Arc<Config>,
    ports: Vec<Arc<dyn Port>>,
    listeners: Vec<std::net::TcpListener>,
    registry: AgentRegistry,
    usage: Arc<UsageBoard>,
}

impl ThreadLauncher {
    /// Bind the configured ports once for every agent to share.
    pub fn bind(config: Arc<Config>, registry: AgentRegistry, usage: Arc<UsageBoard>) -> Result<Self> {
        let ports = ConfiguredPort::from_config(&config.ports, config.warp.as_ref())?;
        let listeners = ports
            .iter()
            .map(|port| {
                let listener = std::net::TcpListener::bind(port.addr())
                    .map_err(|e| Error::config(format!("cannot bind {}: {}", port.addr(), e)))?;
                listener.set_nonblocking(true)?;
                Ok(listener)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            ports,
            listeners,
            registry,
            usage,
        })
    }

    /// Addresses actually bound (port 0 resolved).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect()
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }
}

#[async_trait]
impl AgentLauncher for ThreadLauncher {
    async fn launch(&self, agent_id: AgentId, monitor_port: u16) -> Result<()> {
        let listeners = self
            .listeners
            .iter()
            .map(std::net::TcpListener::try_clone)
            .collect::<std::io::Result<Vec<_>>>()?;
        let ports = self.ports.clone();
        let config = Arc::clone(&self.config);
        let registry = self.registry.clone();
        let usage = Arc::clone(&self.usage);

        std::thread::Builder::new()
            .name(format!("agent-{}", agent_id))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!(agent = %agent_id, "cannot build agent runtime: {}", e);
                        return;
                    }
                };
                let status = runtime.block_on(run_thread_agent(
                    agent_id,
                    monitor_port,
                    config,
                    ports.into_iter().zip(listeners).collect(),
                    registry,
                    usage,
                ));
                tracing::debug!(agent = %agent_id, status, "agent thread finished");
            })?;
        Ok(())
    }
}

async fn run_thread_agent(
    agent_id: AgentId,
    monitor_port: u16,
    config: Arc<Config>,
    anchors: Vec<(Arc<dyn Port>, std::net::TcpListener)>,
    registry: AgentRegistry,
    usage: Arc<UsageBoard>,
) -> i32 {
    let receiver = match CommandReceiver::connect(agent_id, monitor_port).await {
        Ok(receiver) => receiver,
        Err(e) => {
            tracing::error!(agent = %agent_id, "agent cannot start: {}", e);
            return 1;
        }
    };
    let mut agent = GrandAgent::new(agent_id, AgentMode::SingleProcess, &config, registry)
        .with_usage_board(usage)
        .with_receiver(receiver);
    for (port, listener) in anchors {
        let anchored = TcpListener::from_std(listener)
            .map_err(Error::from)
            .and_then(|listener| agent.anchor(listener, port));
        if let Err(e) = anchored {
            tracing::error!(agent = %agent_id, "cannot anchor port: {}", e);
            return 1;
        }
    }
    agent.run().await
}
