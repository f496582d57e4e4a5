//! Configuration structures.
//!
//! Configuration is loaded from a JSON file (or defaulted) and overridden by
//! command-line flags in the binary.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};

/// Global server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Process model configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-agent limits and timeouts.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Listening ports.
    #[serde(default)]
    pub ports: Vec<PortConfig>,

    /// Reverse-proxy route (optional).
    #[serde(default)]
    pub warp: Option<WarpConfig>,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the agents cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.agents == 0 {
            return Err(Error::config("server.agents must be at least 1"));
        }
        if self.server.agents > u16::MAX as usize {
            return Err(Error::config("server.agents does not fit a control frame"));
        }
        if self.agent.max_ships == 0 || self.agent.max_tours == 0 {
            return Err(Error::config("agent.max_ships and agent.max_tours must be positive"));
        }
        if self.agent.read_buffer_size == 0 {
            return Err(Error::config("agent.read_buffer_size must be positive"));
        }
        for port in &self.ports {
            port.socket_addr()?;
            if port.protocol != "h1" {
                return Err(Error::config(format!(
                    "port {}: unsupported protocol {}",
                    port.addr, port.protocol
                )));
            }
        }
        if let Some(warp) = &self.warp {
            if !warp.prefix.starts_with('/') {
                return Err(Error::config("warp.prefix must start with '/'"));
            }
        }
        Ok(())
    }
}

/// Process model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Number of grand agents.
    pub agents: usize,

    /// Run each agent in its own OS process (otherwise one thread each).
    pub multi_core: bool,

    /// Bind address of the monitor's control listener (loopback).
    pub control_addr: String,

    /// Wait window before the monitor gives up on agents after shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_wait: Duration,

    /// Grace window an aborted agent process keeps running to flush I/O.
    #[serde(with = "humantime_serde")]
    pub abort_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            agents: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            multi_core: true,
            control_addr: "127.0.0.1:0".to_string(),
            shutdown_wait: Duration::from_secs(5),
            abort_grace: Duration::from_secs(3),
        }
    }
}

/// Which multiplexer strategy an agent drives its network rudders with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MultiplexerKind {
    /// One read at a time, explicit pause/resume.
    Valve,
    /// Always re-issue the next read (no flow control).
    Pigeon,
}

/// Per-agent limits and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum concurrent inbound connections per agent.
    pub max_ships: usize,

    /// Maximum concurrent tours per agent (admission control).
    pub max_tours: usize,

    /// Mid-request idle timeout. Zero or negative disables it.
    pub socket_timeout_secs: i64,

    /// Idle-between-requests timeout. Zero or negative disables it.
    pub keep_timeout_secs: i64,

    /// Bytes requested per rudder read; also the request-content credit.
    pub read_buffer_size: usize,

    /// Interval of the timeout sweep.
    #[serde(with = "humantime_serde")]
    pub tick: Duration,

    /// Multiplexer strategy for network rudders.
    pub net_multiplexer: MultiplexerKind,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_ships: 1024,
            max_tours: 1024,
            socket_timeout_secs: 300,
            keep_timeout_secs: 20,
            read_buffer_size: 8192,
            tick: Duration::from_secs(1),
            net_multiplexer: MultiplexerKind::Valve,
        }
    }
}

/// One listening port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    /// Bind address, e.g. `0.0.0.0:2020`.
    pub addr: String,

    /// Inbound protocol (`h1`).
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Whether TLS is terminated in front of this port.
    #[serde(default)]
    pub secure: bool,

    /// Allowed peers: an address, a whole-octet prefix such as `10.0.`,
    /// or a CIDR block such as `10.0.0.0/8`. Empty admits everyone.
    #[serde(default)]
    pub permit: Vec<String>,

    /// Keep the connection open after a malformed request: answer it with
    /// an error response and go on decoding.
    #[serde(default)]
    pub lenient: bool,
}

fn default_protocol() -> String {
    "h1".to_string()
}

impl PortConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.addr
            .parse()
            .map_err(|e| Error::config(format!("invalid port address {}: {}", self.addr, e)))
    }
}

/// Reverse-proxy route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarpConfig {
    /// Upstream `host:port`.
    pub upstream: String,

    /// Request path prefix routed to the upstream.
    #[serde(default = "default_warp_prefix")]
    pub prefix: String,

    /// Upstream idle timeout. Zero or negative disables it.
    #[serde(default = "default_warp_timeout")]
    pub timeout_secs: i64,
}

fn default_warp_prefix() -> String {
    "/".to_string()
}

fn default_warp_timeout() -> i64 {
    60
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
