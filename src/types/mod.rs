//! Core types for the server.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (AgentId, RudderId, ShipId, TourKey, ...)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for the process model, agents and ports

mod config;
mod errors;
mod ids;

pub use config::{
    AgentConfig, Config, MultiplexerKind, ObservabilityConfig, PortConfig, ServerConfig,
    WarpConfig,
};
pub use errors::{Error, Result};
pub use ids::{AgentId, ObjectId, RudderId, ShipId, TourId, TourKey};
