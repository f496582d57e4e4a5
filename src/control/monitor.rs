//! Parent-side supervisor of the agents.
//!
//! The monitor owns one control connection per live agent. Connections are
//! read by per-connection tasks that report back over a channel; the
//! monitor itself is an actor driven by those reports and by
//! [`MonitorHandle`] commands.
//!
//! An agent whose channel reports CLOSE, EOF or an error is considered
//! gone and, unless the finale flag is set, is replaced by a fresh launch
//! under the same id.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::frame::{read_frame, write_frame, CommandCode, CommandFrame};
use crate::agent::AgentLauncher;
use crate::types::{AgentId, Error, Result, ServerConfig};

/// Commands accepted by a running monitor.
#[derive(Debug)]
pub enum MonitorCommand {
    ReloadCert(Option<AgentId>),
    PrintUsage(Option<AgentId>),
    Shutdown(AgentId),
    Abort(AgentId),
    ShutdownAll,
    AbortAll,
    Snapshot(oneshot::Sender<MonitorSnapshot>),
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSnapshot {
    /// Agents with a live control channel.
    pub agents: Vec<AgentId>,
    /// Launched agents that have not connected yet.
    pub pending: Vec<AgentId>,
    /// Total number of launches, replacements included.
    pub launches: u64,
    pub finale: bool,
}

/// Cloneable front of a running monitor.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    tx: mpsc::UnboundedSender<MonitorCommand>,
    port: u16,
}

impl MonitorHandle {
    /// Loopback port agents connect back to.
    pub fn port(&self) -> u16 {
        self.port
    }

    fn send(&self, command: MonitorCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::control("monitor is gone"))
    }

    /// Send RELOAD_CERT to one agent, or to all with `None`.
    pub fn reload_cert(&self, agent: Option<AgentId>) -> Result<()> {
        self.send(MonitorCommand::ReloadCert(agent))
    }

    /// Send MEM_USAGE to one agent, or to all with `None`.
    pub fn print_usage(&self, agent: Option<AgentId>) -> Result<()> {
        self.send(MonitorCommand::PrintUsage(agent))
    }

    pub fn shutdown(&self, agent: AgentId) -> Result<()> {
        self.send(MonitorCommand::Shutdown(agent))
    }

    pub fn abort(&self, agent: AgentId) -> Result<()> {
        self.send(MonitorCommand::Abort(agent))
    }

    pub fn shutdown_all(&self) -> Result<()> {
        self.send(MonitorCommand::ShutdownAll)
    }

    pub fn abort_all(&self) -> Result<()> {
        self.send(MonitorCommand::AbortAll)
    }

    pub async fn snapshot(&self) -> Result<MonitorSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(MonitorCommand::Snapshot(tx))?;
        rx.await.map_err(|_| Error::control("monitor is gone"))
    }
}

/// Reports from connection tasks. `serial` tells a replaced connection
/// from the current one.
#[derive(Debug)]
enum ChannelEvent {
    Joined {
        agent_id: AgentId,
        serial: u64,
        writer: OwnedWriteHalf,
    },
    Frame {
        agent_id: AgentId,
        serial: u64,
        frame: CommandFrame,
    },
    Lost {
        agent_id: AgentId,
        serial: u64,
    },
}

enum MonitorEvent {
    Accepted(std::io::Result<TcpStream>),
    Channel(ChannelEvent),
    Command(MonitorCommand),
    Deadline,
}

#[derive(Debug)]
struct AgentChannel {
    serial: u64,
    writer: OwnedWriteHalf,
}

#[derive(Debug)]
pub struct GrandAgentMonitor {
    config: ServerConfig,
    launcher: Arc<dyn AgentLauncher>,
    listener: TcpListener,
    port: u16,
    channels: BTreeMap<AgentId, AgentChannel>,
    pending: BTreeSet<AgentId>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    commands: mpsc::UnboundedReceiver<MonitorCommand>,
    next_serial: u64,
    launches: u64,
    /// Teardown command broadcast by `shutdown_all`/`abort_all`.
    finale: Option<CommandCode>,
    deadline: Option<Instant>,
}

impl GrandAgentMonitor {
    /// Bind the control listener. Agents are launched by [`run`](Self::run).
    pub async fn bind(config: ServerConfig, launcher: Arc<dyn AgentLauncher>) -> Result<(Self, MonitorHandle)> {
        let listener = TcpListener::bind(&config.control_addr)
            .await
            .map_err(|e| Error::config(format!("cannot bind control address {}: {}", config.control_addr, e)))?;
        let port = listener.local_addr()?.port();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (tx, commands) = mpsc::unbounded_channel();
        tracing::info!(port, agents = config.agents, "monitor listening");

        let monitor = Self {
            config,
            launcher,
            listener,
            port,
            channels: BTreeMap::new(),
            pending: BTreeSet::new(),
            events_tx,
            events,
            commands,
            next_serial: 0,
            launches: 0,
            finale: None,
            deadline: None,
        };
        Ok((monitor, MonitorHandle { tx, port }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Launch the configured agents and supervise them until every agent
    /// is gone after `shutdown_all`/`abort_all`, or the wait window closes.
    pub async fn run(mut self) -> Result<()> {
        for n in 1..=self.config.agents {
            let agent_id = AgentId::new(i32::try_from(n).map_err(|_| Error::config("too many agents"))?);
            self.launch(agent_id).await?;
        }

        loop {
            if self.finale.is_some() && self.channels.is_empty() && self.pending.is_empty() {
                tracing::info!("all agents stopped");
                return Ok(());
            }

            let deadline = self.deadline;
            let event = tokio::select! {
                accepted = self.listener.accept() => MonitorEvent::Accepted(accepted.map(|(stream, _)| stream)),
                Some(event) = self.events.recv() => MonitorEvent::Channel(event),
                Some(command) = self.commands.recv() => MonitorEvent::Command(command),
                _ = sleep_until(deadline) => MonitorEvent::Deadline,
            };

            match event {
                MonitorEvent::Accepted(Ok(stream)) => self.spawn_channel(stream),
                MonitorEvent::Accepted(Err(e)) => tracing::warn!("control accept failed: {}", e),
                MonitorEvent::Channel(event) => self.on_channel_event(event).await,
                MonitorEvent::Command(command) => self.on_command(command).await,
                MonitorEvent::Deadline => {
                    tracing::warn!(
                        left = self.channels.len(),
                        "agents did not stop within the wait window"
                    );
                    return Ok(());
                }
            }
        }
    }

    async fn launch(&mut self, agent_id: AgentId) -> Result<()> {
        self.launches += 1;
        self.pending.insert(agent_id);
        tracing::info!(agent = %agent_id, launch = self.launches, "launching agent");
        if let Err(e) = self.launcher.launch(agent_id, self.port).await {
            self.pending.remove(&agent_id);
            return Err(e);
        }
        Ok(())
    }

    /// Read the handshake and then every frame of one control connection.
    fn spawn_channel(&mut self, stream: TcpStream) {
        self.next_serial += 1;
        let serial = self.next_serial;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            let (mut reader, writer) = stream.into_split();
            let agent_id = match read_frame(&mut reader).await {
                Ok(Some(hello)) if hello.cmd == CommandCode::Ok => AgentId::new(i32::from(hello.arg1())),
                Ok(other) => {
                    tracing::warn!(frame = ?other, "control connection without handshake");
                    return;
                }
                Err(e) => {
                    tracing::warn!("control handshake failed: {}", e);
                    return;
                }
            };
            if events
                .send(ChannelEvent::Joined {
                    agent_id,
                    serial,
                    writer,
                })
                .is_err()
            {
                return;
            }
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(frame)) => {
                        if events
                            .send(ChannelEvent::Frame {
                                agent_id,
                                serial,
                                frame,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(agent = %agent_id, "control read failed: {}", e);
                        break;
                    }
                }
            }
            let _ = events.send(ChannelEvent::Lost { agent_id, serial });
        });
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Joined {
                agent_id,
                serial,
                writer,
            } => {
                self.pending.remove(&agent_id);
                tracing::info!(agent = %agent_id, "agent joined");
                self.channels.insert(agent_id, AgentChannel { serial, writer });
                if let Some(cmd) = self.finale {
                    // joined after the broadcast went out
                    self.send_to(agent_id, CommandFrame::new(cmd)).await;
                }
            }
            ChannelEvent::Frame {
                agent_id,
                serial,
                frame,
            } => match frame.cmd {
                CommandCode::Ok => tracing::trace!(agent = %agent_id, "agent acknowledged"),
                CommandCode::Close => {
                    tracing::info!(agent = %agent_id, "agent closing");
                    self.agent_gone(agent_id, serial).await;
                }
                _ => tracing::warn!(agent = %agent_id, frame = %frame, "unexpected frame from agent"),
            },
            ChannelEvent::Lost { agent_id, serial } => {
                self.agent_gone(agent_id, serial).await;
            }
        }
    }

    async fn agent_gone(&mut self, agent_id: AgentId, serial: u64) {
        match self.channels.get(&agent_id) {
            Some(channel) if channel.serial == serial => {}
            _ => return,
        }
        self.channels.remove(&agent_id);
        if self.finale.is_some() {
            tracing::debug!(agent = %agent_id, "agent left during finale");
            return;
        }
        tracing::warn!(agent = %agent_id, "agent lost, launching a replacement");
        if let Err(e) = self.launch(agent_id).await {
            tracing::error!(agent = %agent_id, "cannot replace agent: {}", e);
        }
    }

    async fn on_command(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::ReloadCert(target) => {
                self.send_to_some(target, CommandFrame::new(CommandCode::ReloadCert))
                    .await
            }
            MonitorCommand::PrintUsage(target) => {
                self.send_to_some(target, CommandFrame::new(CommandCode::MemUsage))
                    .await
            }
            MonitorCommand::Shutdown(agent_id) => {
                self.send_to(agent_id, CommandFrame::new(CommandCode::Shutdown))
                    .await
            }
            MonitorCommand::Abort(agent_id) => {
                self.send_to(agent_id, CommandFrame::new(CommandCode::Abort))
                    .await
            }
            MonitorCommand::ShutdownAll => self.finale(CommandCode::Shutdown).await,
            MonitorCommand::AbortAll => self.finale(CommandCode::Abort).await,
            MonitorCommand::Snapshot(reply) => {
                let _ = reply.send(MonitorSnapshot {
                    agents: self.channels.keys().copied().collect(),
                    pending: self.pending.iter().copied().collect(),
                    launches: self.launches,
                    finale: self.finale.is_some(),
                });
            }
        }
    }

    /// Suppress replacements, broadcast `cmd`, and arm the forced exit.
    async fn finale(&mut self, cmd: CommandCode) {
        if self.finale.is_none() {
            self.deadline = Some(Instant::now() + self.config.shutdown_wait);
            tracing::info!(command = %cmd, wait = ?self.config.shutdown_wait, "stopping all agents");
        }
        self.finale = Some(cmd);
        self.send_to_some(None, CommandFrame::new(cmd)).await;
    }

    async fn send_to_some(&mut self, target: Option<AgentId>, frame: CommandFrame) {
        match target {
            Some(agent_id) => self.send_to(agent_id, frame).await,
            None => {
                let ids: Vec<AgentId> = self.channels.keys().copied().collect();
                for agent_id in ids {
                    self.send_to(agent_id, frame).await;
                }
            }
        }
    }

    async fn send_to(&mut self, agent_id: AgentId, frame: CommandFrame) {
        let Some(channel) = self.channels.get_mut(&agent_id) else {
            tracing::warn!(agent = %agent_id, frame = %frame, "no such agent");
            return;
        };
        tracing::debug!(agent = %agent_id, frame = %frame, "command sent");
        if let Err(e) = write_frame(&mut channel.writer, frame).await {
            tracing::warn!(agent = %agent_id, "cannot send {}: {}", frame, e);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Launcher whose agents are plain tasks speaking the control protocol.
    #[derive(Debug, Default)]
    struct ScriptedLauncher {
        launched: Mutex<Vec<AgentId>>,
    }

    #[async_trait]
    impl AgentLauncher for ScriptedLauncher {
        async fn launch(&self, agent_id: AgentId, monitor_port: u16) -> Result<()> {
            self.launched.lock().unwrap().push(agent_id);
            tokio::spawn(async move {
                let mut receiver = super::super::CommandReceiver::connect(agent_id, monitor_port)
                    .await
                    .unwrap();
                while let Ok(Some(frame)) = receiver.recv().await {
                    if matches!(frame.cmd, CommandCode::Shutdown | CommandCode::Abort) {
                        receiver.send_close().await.unwrap();
                        let _ = receiver.finish().await;
                        return;
                    }
                    receiver.send_ok().await.unwrap();
                }
            });
            Ok(())
        }
    }

    fn config(agents: usize) -> ServerConfig {
        ServerConfig {
            agents,
            multi_core: false,
            control_addr: "127.0.0.1:0".into(),
            shutdown_wait: Duration::from_secs(5),
            abort_grace: Duration::from_millis(10),
        }
    }

    async fn wait_for(handle: &MonitorHandle, check: impl Fn(&MonitorSnapshot) -> bool) -> MonitorSnapshot {
        for _ in 0..200 {
            let snapshot = handle.snapshot().await.unwrap();
            if check(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("monitor never reached the expected state");
    }

    #[tokio::test]
    async fn shutdown_of_one_agent_launches_a_replacement() {
        let launcher = Arc::new(ScriptedLauncher::default());
        let (monitor, handle) = GrandAgentMonitor::bind(config(2), launcher.clone()).await.unwrap();
        let running = tokio::spawn(monitor.run());

        wait_for(&handle, |s| s.agents.len() == 2).await;
        handle.shutdown(AgentId::new(1)).unwrap();
        let snapshot = wait_for(&handle, |s| s.launches == 3 && s.agents.len() == 2).await;
        assert_eq!(snapshot.agents, vec![AgentId::new(1), AgentId::new(2)]);
        assert_eq!(
            *launcher.launched.lock().unwrap(),
            vec![AgentId::new(1), AgentId::new(2), AgentId::new(1)]
        );

        handle.shutdown_all().unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(launcher.launched.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn finale_suppresses_replacements() {
        let launcher = Arc::new(ScriptedLauncher::default());
        let (monitor, handle) = GrandAgentMonitor::bind(config(1), launcher.clone()).await.unwrap();
        let running = tokio::spawn(monitor.run());

        wait_for(&handle, |s| s.agents.len() == 1).await;
        handle.abort_all().unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
        assert!(handle.snapshot().await.is_err());
    }

    /// Launcher whose agents connect only once `gate` is opened, and record
    /// the first command they receive.
    #[derive(Debug, Default)]
    struct GatedLauncher {
        gate: Arc<tokio::sync::Notify>,
        received: Arc<Mutex<Vec<CommandCode>>>,
    }

    #[async_trait]
    impl AgentLauncher for GatedLauncher {
        async fn launch(&self, agent_id: AgentId, monitor_port: u16) -> Result<()> {
            let gate = Arc::clone(&self.gate);
            let received = Arc::clone(&self.received);
            tokio::spawn(async move {
                gate.notified().await;
                let mut receiver = super::super::CommandReceiver::connect(agent_id, monitor_port)
                    .await
                    .unwrap();
                if let Ok(Some(frame)) = receiver.recv().await {
                    received.lock().unwrap().push(frame.cmd);
                }
                receiver.send_close().await.unwrap();
                let _ = receiver.finish().await;
            });
            Ok(())
        }
    }

    #[tokio::test]
    async fn late_joiner_gets_the_finale_command() {
        let launcher = Arc::new(GatedLauncher::default());
        let (monitor, handle) = GrandAgentMonitor::bind(config(1), launcher.clone()).await.unwrap();
        let running = tokio::spawn(monitor.run());

        wait_for(&handle, |s| s.pending == vec![AgentId::new(1)]).await;
        handle.abort_all().unwrap();
        wait_for(&handle, |s| s.finale).await;
        launcher.gate.notify_one();

        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(*launcher.received.lock().unwrap(), vec![CommandCode::Abort]);
    }
}
