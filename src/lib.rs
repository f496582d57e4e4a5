//! # BayServer Core - Multiplexed Application Server Runtime
//!
//! Rust implementation of the BayServer core providing:
//! - Grand agents: one event loop per thread or process, supervised by a monitor
//! - Rudders and multiplexers (Valve / Pigeon) over non-blocking sockets
//! - Pooled ships (inbound connections, outbound warp connections)
//! - Pooled tours (one request/response each) with stale-handle detection
//! - A fixed-frame control channel between the monitor and its agents
//!
//! ## Architecture
//!
//! Every agent owns all of its mutable state and is driven by letters posted
//! by rudder driver tasks:
//! ```text
//!                         ┌───────────────────────────────┐
//!   control frames  ───▶  │          GrandAgent           │
//!                         │  ┌───────────┐ ┌───────────┐  │
//!   rudder letters  ───▶  │  │Multiplexer│ │  Stores   │  │
//!                         │  │ (rudders) │ │ships/tours│  │
//!                         │  └───────────┘ └───────────┘  │
//!                         └───────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod agent;
pub mod control;
pub mod docker;
pub mod multiplexer;
pub mod pool;
pub mod protocol;
pub mod rudder;
pub mod ship;
pub mod tour;
pub mod transporter;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
