//! GrandAgent: the per-core unit of execution.
//!
//! An agent owns one [`Multiplexer`], one set of [`AgentStores`] and the
//! accept path of its anchored (listening) ports. It is a single-threaded
//! reactor: every letter, command and tick is handled to completion before
//! the next one is looked at, so ships and tours need no locking.
//!
//! ```text
//!   driver tasks ──Letter──▶ ┌──────────────┐
//!   monitor ──CommandFrame─▶ │  GrandAgent  │──▶ Multiplexer ──▶ Transporter ──▶ Ship
//!   interval ──────tick────▶ └──────────────┘
//! ```

mod launcher;
mod registry;
mod stores;

pub use launcher::{
    bind_port, child_args, run_child_agent, validate_ports, AgentLauncher, PortMode,
    ProcessLauncher, ThreadLauncher, AGENT_ID_FLAG, MONITOR_PORT_FLAG, PORT_MODE_FLAG,
};
pub use registry::{AgentInfo, AgentRegistry, LifecycleListener, StoreUsage, UsageBoard};
pub use stores::AgentStores;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::control::{CommandFrame, CommandReceiver, Directive};
use crate::docker::Port;
use crate::multiplexer::Multiplexer;
use crate::rudder::{Letter, Rudder};
use crate::types::{AgentConfig, AgentId, Config, Error, Result, RudderId};

/// Whether the agent lives in its own OS process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    /// Own process: aborting lets in-flight I/O flush for a grace window,
    /// then the process exits.
    MultiCore,
    /// Thread inside the monitor's process: aborting cleans up at once.
    SingleProcess,
}

enum AgentEvent {
    Letter(Letter),
    Command(Result<Option<CommandFrame>>),
    Tick,
    Cancelled,
}

#[derive(Debug)]
pub struct GrandAgent {
    agent_id: AgentId,
    mode: AgentMode,
    config: AgentConfig,
    abort_grace: Duration,
    mux: Multiplexer,
    stores: AgentStores,
    letters: mpsc::UnboundedReceiver<Letter>,
    anchors: HashMap<RudderId, Arc<dyn Port>>,
    ports: Vec<Arc<dyn Port>>,
    accepting: bool,
    receiver: Option<CommandReceiver>,
    registry: AgentRegistry,
    usage: Option<Arc<UsageBoard>>,
    forker: Option<(Arc<dyn AgentLauncher>, u16)>,
    cancel: CancellationToken,
    aborted: bool,
    exit_status: i32,
}

impl GrandAgent {
    /// Create the agent and its stores, then announce it to the registry's
    /// lifecycle listeners.
    pub fn new(agent_id: AgentId, mode: AgentMode, config: &Config, registry: AgentRegistry) -> Self {
        let (tx, letters) = mpsc::unbounded_channel();
        let mux = Multiplexer::new(
            agent_id,
            config.agent.net_multiplexer,
            tx,
            config.agent.read_buffer_size,
        );
        let stores = AgentStores::new(agent_id, &config.agent);
        if !registry.register(agent_id, mode == AgentMode::MultiCore) {
            tracing::warn!(agent = %agent_id, "agent id already registered");
        }
        tracing::info!(agent = %agent_id, mode = ?mode, "agent started");

        Self {
            agent_id,
            mode,
            config: config.agent.clone(),
            abort_grace: config.server.abort_grace,
            mux,
            stores,
            letters,
            anchors: HashMap::new(),
            ports: Vec::new(),
            accepting: true,
            receiver: None,
            registry,
            usage: None,
            forker: None,
            cancel: CancellationToken::new(),
            aborted: false,
            exit_status: 0,
        }
    }

    pub fn with_receiver(mut self, receiver: CommandReceiver) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn with_usage_board(mut self, board: Arc<UsageBoard>) -> Self {
        self.usage = Some(board);
        self
    }

    /// Launcher used by FORK commands, and the monitor port children
    /// report to.
    pub fn with_forker(mut self, launcher: Arc<dyn AgentLauncher>, monitor_port: u16) -> Self {
        self.forker = Some((launcher, monitor_port));
        self
    }

    /// Start accepting on `listener` for `port`. Must be called inside the
    /// agent's runtime.
    pub fn anchor(&mut self, listener: TcpListener, port: Arc<dyn Port>) -> Result<()> {
        let local = listener.local_addr().ok();
        let id = self.mux.add_listener(listener)?;
        tracing::info!(agent = %self.agent_id, rudder = %id, addr = ?local, protocol = port.protocol(), "port anchored");
        if !self.ports.iter().any(|p| Arc::ptr_eq(p, &port)) {
            self.ports.push(Arc::clone(&port));
        }
        self.anchors.insert(id, port);
        Ok(())
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn stores(&self) -> &AgentStores {
        &self.stores
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    /// Token that stops the agent gracefully when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // =========================================================================
    // Main loop
    // =========================================================================

    /// Run until shut down or aborted. Returns the exit status.
    pub async fn run(mut self) -> i32 {
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.aborted {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => AgentEvent::Cancelled,
                letter = self.letters.recv() => match letter {
                    Some(letter) => AgentEvent::Letter(letter),
                    None => AgentEvent::Cancelled,
                },
                frame = next_command(&mut self.receiver) => AgentEvent::Command(frame),
                _ = tick.tick() => AgentEvent::Tick,
            };

            match event {
                AgentEvent::Letter(letter) => self.on_letter(letter).await,
                AgentEvent::Command(Ok(Some(frame))) => self.on_command(frame).await,
                AgentEvent::Command(Ok(None)) => {
                    tracing::info!(agent = %self.agent_id, "monitor closed the control channel");
                    self.receiver = None;
                    self.shutdown().await;
                }
                AgentEvent::Command(Err(e)) => {
                    tracing::warn!(agent = %self.agent_id, "control channel failed: {}", e);
                    self.receiver = None;
                    self.shutdown().await;
                }
                AgentEvent::Tick => {
                    let now = Instant::now().into_std();
                    if let Err(e) = self.mux.check_timeouts(now, &mut self.stores) {
                        self.on_error(e).await;
                    }
                }
                AgentEvent::Cancelled => self.shutdown().await,
            }
        }
        tracing::info!(agent = %self.agent_id, status = self.exit_status, "agent finished");
        self.exit_status
    }

    async fn on_letter(&mut self, letter: Letter) {
        let result = match letter {
            Letter::Accepted { rudder, result } => self.on_accepted(rudder, result),
            letter => self.mux.dispatch(letter, &mut self.stores),
        };
        if let Err(e) = result {
            self.on_error(e).await;
        }
    }

    async fn on_error(&mut self, err: Error) {
        if err.is_fatal() {
            self.abort(Some(err), 1).await;
        } else {
            tracing::warn!(agent = %self.agent_id, "{}", err);
        }
    }

    // =========================================================================
    // Accept path
    // =========================================================================

    fn on_accepted(
        &mut self,
        listener: RudderId,
        result: io::Result<(TcpStream, SocketAddr)>,
    ) -> Result<()> {
        let Some(port) = self.anchors.get(&listener).cloned() else {
            // listener already closed
            return Ok(());
        };
        match result {
            Ok((stream, peer)) => self.admit(stream, peer, port)?,
            Err(e) => tracing::warn!(agent = %self.agent_id, rudder = %listener, "accept failed: {}", e),
        }
        if self.accepting {
            self.mux.req_accept(listener)?;
        }
        Ok(())
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr, port: Arc<dyn Port>) -> Result<()> {
        if !self.stores.has_ship_capacity() {
            tracing::warn!(
                agent = %self.agent_id,
                peer = %peer,
                max_ships = self.config.max_ships,
                "inbound ship limit reached, connection refused"
            );
            return Ok(());
        }
        if !port.check_admitted(Some(peer)) {
            tracing::info!(agent = %self.agent_id, peer = %peer, "peer not admitted");
            return Ok(());
        }
        let _ = stream.set_nodelay(true);

        let id = self.mux.next_rudder_id();
        let ship = self.stores.open_inbound(id, &port, Some(peer))?;
        let rudder = Rudder::stream(id, stream, Some(peer), self.mux.letters());
        self.mux
            .add_rudder_state(rudder, Some(port.create_transporter(ship)))?;
        tracing::debug!(agent = %self.agent_id, rudder = %id, ship = %ship, peer = %peer, "connection accepted");
        self.mux.req_read(id)
    }

    fn stop_accepting(&mut self) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        for (id, _) in self.anchors.drain() {
            self.mux.req_close(id);
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn on_command(&mut self, frame: CommandFrame) {
        tracing::debug!(agent = %self.agent_id, frame = %frame, "command received");
        let directive = Directive::from_frame(&frame);
        let result = match directive {
            Directive::ReloadCert => {
                self.reload_cert();
                Ok(())
            }
            Directive::PrintUsage => {
                self.print_usage();
                Ok(())
            }
            Directive::Shutdown => {
                self.shutdown().await;
                Ok(())
            }
            Directive::Abort => {
                self.abort(None, 1).await;
                Ok(())
            }
            Directive::Fork(new_id) => self.fork(new_id).await,
            Directive::Ignore => {
                tracing::warn!(agent = %self.agent_id, frame = %frame, "unexpected command");
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(agent = %self.agent_id, frame = %frame, "command failed: {}", e);
        }
        if directive.tears_down() {
            return;
        }
        if let Some(receiver) = self.receiver.as_mut() {
            if let Err(e) = receiver.send_ok().await {
                tracing::warn!(agent = %self.agent_id, "cannot acknowledge command: {}", e);
            }
        }
    }

    pub fn reload_cert(&self) {
        for port in &self.ports {
            if let Err(e) = port.reload_cert() {
                tracing::error!(agent = %self.agent_id, port = %port.addr(), "certificate reload failed: {}", e);
            }
        }
    }

    pub fn print_usage(&self) {
        let usage = self.stores.usage();
        tracing::info!(
            agent = %self.agent_id,
            rudders = self.mux.rudder_count(),
            "{}",
            usage
        );
        if let Some(board) = &self.usage {
            board.publish(usage);
        }
    }

    /// Spawn a new agent process with id `new_id`.
    pub async fn fork(&self, new_id: AgentId) -> Result<()> {
        if self.mode != AgentMode::MultiCore {
            return Err(Error::control("fork is only available to agent processes"));
        }
        let (launcher, monitor_port) = self
            .forker
            .clone()
            .ok_or_else(|| Error::control("agent has no launcher to fork with"))?;
        tracing::info!(agent = %self.agent_id, new_agent = %new_id, "forking agent");
        launcher.launch(new_id, monitor_port).await
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Stop accepting, then abort without error.
    pub async fn shutdown(&mut self) {
        if self.aborted {
            return;
        }
        tracing::info!(agent = %self.agent_id, "shutting down");
        self.stop_accepting();
        self.abort(None, 0).await;
    }

    /// Tear the agent down. `err` marks a fatal condition.
    pub async fn abort(&mut self, err: Option<Error>, status: i32) {
        if self.aborted {
            return;
        }
        match &err {
            Some(e) => tracing::error!(agent = %self.agent_id, status, "agent aborted: {}", e),
            None => tracing::info!(agent = %self.agent_id, status, "agent stopping"),
        }
        self.aborted = true;
        self.exit_status = status;

        self.registry.unregister(self.agent_id);
        if let Some(receiver) = self.receiver.as_mut() {
            if let Err(e) = receiver.send_close().await {
                tracing::debug!(agent = %self.agent_id, "cannot send CLOSE: {}", e);
            }
        }
        self.stop_accepting();

        if self.mode == AgentMode::MultiCore {
            self.drain(self.abort_grace).await;
        }
        self.mux.close_all();
        if let Some(receiver) = self.receiver.take() {
            let _ = receiver.finish().await;
        }
    }

    /// Keep driving I/O until every rudder is gone or `grace` elapses.
    async fn drain(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while self.mux.rudder_count() > 0 {
            let letter = tokio::select! {
                letter = self.letters.recv() => letter,
                _ = tokio::time::sleep_until(deadline) => None,
            };
            let Some(letter) = letter else {
                break;
            };
            if matches!(letter, Letter::Accepted { .. }) {
                continue;
            }
            if let Err(e) = self.mux.dispatch(letter, &mut self.stores) {
                tracing::debug!(agent = %self.agent_id, "error while draining: {}", e);
            }
        }
        tracing::debug!(agent = %self.agent_id, left = self.mux.rudder_count(), "drain finished");
    }
}

async fn next_command(receiver: &mut Option<CommandReceiver>) -> Result<Option<CommandFrame>> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{ConfiguredPort, RouteCity};
    use crate::types::PortConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn port() -> Arc<dyn Port> {
        let config = PortConfig {
            addr: "127.0.0.1:0".into(),
            protocol: "h1".into(),
            secure: false,
            permit: Vec::new(),
            lenient: false,
        };
        Arc::new(ConfiguredPort::new(&config, Arc::new(RouteCity::from_config(None))).unwrap())
    }

    #[tokio::test]
    async fn serves_until_cancelled() {
        let registry = AgentRegistry::new();
        let mut agent = GrandAgent::new(
            AgentId::new(1),
            AgentMode::SingleProcess,
            &Config::default(),
            registry.clone(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        agent.anchor(listener, port()).unwrap();
        assert!(registry.contains(AgentId::new(1)));

        let cancel = agent.cancel_token();
        let client = async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client
                .write_all(b"GET /ping HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            let mut response = String::new();
            client.read_to_string(&mut response).await.unwrap();
            cancel.cancel();
            response
        };

        let (status, response) = tokio::join!(agent.run(), client);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
        assert_eq!(status, 0);
        assert!(!registry.contains(AgentId::new(1)));
    }

    #[tokio::test]
    async fn fork_needs_an_agent_process() {
        let agent = GrandAgent::new(
            AgentId::new(2),
            AgentMode::SingleProcess,
            &Config::default(),
            AgentRegistry::new(),
        );
        assert!(matches!(
            agent.fork(AgentId::new(3)).await,
            Err(Error::Control(_))
        ));
    }
}
