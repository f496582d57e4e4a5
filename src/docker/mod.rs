//! Routing collaborators: ports, cities and clubs.
//!
//! A `Port` describes one listening endpoint and hands out protocol handlers
//! and transporters for connections accepted on it. A `City` maps a request
//! URI to the `Club` that serves it. Clubs either answer into `tour.res`
//! directly or ask for the request to be warped to an upstream server.

mod echo;
mod port;
mod warp;

pub use echo::EchoClub;
pub use port::{ConfiguredPort, RouteCity};
pub use warp::WarpClub;

use bytes::Bytes;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::protocol::InboundHandler;
use crate::tour::Tour;
use crate::transporter::{ShipRef, Transporter};
use crate::types::Result;

/// Upstream a tour should be relayed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarpTarget {
    /// `host:port` of the upstream server.
    pub upstream: String,
    /// Upstream idle timeout; zero or less disables it.
    pub timeout_secs: i64,
}

/// What a club did with an arriving tour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    /// The club produced (or is producing) the response itself.
    Served,
    /// Relay the request to an upstream.
    Warp(WarpTarget),
}

/// Request consumer.
pub trait Club: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Called once the request head is known and the tour is running.
    fn arrive(&self, tour: &mut Tour) -> Result<Arrival>;

    /// Request body bytes for a served tour.
    fn content(&self, tour: &mut Tour, data: Bytes) -> Result<()> {
        tour.req.received += data.len();
        Ok(())
    }

    /// The request body is complete.
    fn end_content(&self, tour: &mut Tour) -> Result<()> {
        tour.req.ended = true;
        Ok(())
    }
}

/// Virtual host.
pub trait City: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn find_club(&self, uri: &str) -> Option<Arc<dyn Club>>;
}

/// Listening endpoint.
pub trait Port: Send + Sync + Debug {
    fn addr(&self) -> SocketAddr;

    fn protocol(&self) -> &str;

    fn secure(&self) -> bool;

    /// Whether a peer may connect at all.
    fn check_admitted(&self, peer: Option<SocketAddr>) -> bool;

    fn find_city(&self, host: &str) -> Option<Arc<dyn City>>;

    /// Fresh protocol handler for an accepted connection.
    fn new_handler(&self) -> Box<dyn InboundHandler>;

    fn create_transporter(&self, ship: ShipRef) -> Transporter {
        Transporter::server(ship, self.secure())
    }

    /// Re-read certificate material. Plain ports have nothing to do.
    fn reload_cert(&self) -> Result<()> {
        Ok(())
    }
}
