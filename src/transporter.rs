//! Transporters: glue between multiplexer events and ships.
//!
//! A transporter is attached to one rudder state and knows which ship sits
//! on top of it. It forwards byte-level events to that ship and classifies
//! what the ship reports back into a `NextAction` for the multiplexer.

use bytes::Bytes;
use std::fmt;
use std::io;

use crate::agent::AgentStores;
use crate::multiplexer::Multiplexer;
use crate::types::{Error, ObjectId, Result, RudderId, ShipId};

/// How many handler swaps a single buffer may trigger.
const MAX_UPGRADES: usize = 4;

/// What the multiplexer should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Keep reading.
    Continue,
    /// Consumer is full; stop reading until resumed (Valve only).
    Suspend,
    /// Close the connection once queued writes are out.
    Close,
}

impl NextAction {
    /// Combine two actions, keeping the more restrictive one.
    pub fn merge(self, other: NextAction) -> NextAction {
        match (self, other) {
            (NextAction::Close, _) | (_, NextAction::Close) => NextAction::Close,
            (NextAction::Suspend, _) | (_, NextAction::Suspend) => NextAction::Suspend,
            _ => NextAction::Continue,
        }
    }
}

/// Result of handing one buffer to a ship.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Bytes consumed.
    Continue(NextAction),
    /// The ship swapped its protocol handler; the same bytes must be
    /// dispatched again.
    Upgrade,
    /// Malformed wire data.
    ProtocolFault(Error),
    /// Terminal I/O fault.
    IoFault(io::Error),
}

impl ReadOutcome {
    /// Classify a handler error. Invariant violations are not outcomes and
    /// are handed back to propagate to the agent.
    pub fn classify(err: Error) -> std::result::Result<ReadOutcome, Error> {
        match err {
            Error::Protocol(_) | Error::Http { .. } => Ok(ReadOutcome::ProtocolFault(err)),
            Error::Io(e) => Ok(ReadOutcome::IoFault(e)),
            other => Err(other),
        }
    }
}

/// Ship a transporter drives. The ship id guards against the slot having
/// been recycled for another connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipRef {
    Inbound { object: ObjectId, ship_id: ShipId },
    Warp { object: ObjectId, ship_id: ShipId },
}

impl ShipRef {
    pub fn inbound(object: ObjectId, ship_id: ShipId) -> Self {
        ShipRef::Inbound { object, ship_id }
    }

    pub fn warp(object: ObjectId, ship_id: ShipId) -> Self {
        ShipRef::Warp { object, ship_id }
    }

    pub fn object(&self) -> ObjectId {
        match self {
            ShipRef::Inbound { object, .. } | ShipRef::Warp { object, .. } => *object,
        }
    }

    pub fn ship_id(&self) -> ShipId {
        match self {
            ShipRef::Inbound { ship_id, .. } | ShipRef::Warp { ship_id, .. } => *ship_id,
        }
    }
}

impl fmt::Display for ShipRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShipRef::Inbound { object, ship_id } => write!(f, "inbound#{}@{}", ship_id, object),
            ShipRef::Warp { object, ship_id } => write!(f, "warp#{}@{}", ship_id, object),
        }
    }
}

/// Plain or secure stream transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Plain,
    Secure,
}

#[derive(Debug)]
pub struct Transporter {
    ship: ShipRef,
    kind: TransportKind,
    server_mode: bool,
}

impl Transporter {
    /// Transporter for an accepted connection.
    pub fn server(ship: ShipRef, secure: bool) -> Self {
        Self {
            ship,
            kind: if secure {
                TransportKind::Secure
            } else {
                TransportKind::Plain
            },
            server_mode: true,
        }
    }

    /// Transporter for an outbound connection.
    pub fn client(ship: ShipRef, secure: bool) -> Self {
        Self {
            server_mode: false,
            ..Self::server(ship, secure)
        }
    }

    pub fn ship(&self) -> ShipRef {
        self.ship
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn is_secure(&self) -> bool {
        self.kind == TransportKind::Secure
    }

    pub fn is_server_mode(&self) -> bool {
        self.server_mode
    }

    pub fn on_connect(
        &mut self,
        rudder: RudderId,
        mux: &mut Multiplexer,
        stores: &mut AgentStores,
    ) -> Result<NextAction> {
        tracing::trace!(rudder = %rudder, ship = %self.ship, "connected");
        let action = match self.ship {
            ShipRef::Warp { .. } => stores.with_warp(self.ship, |ship, stores| {
                ship.notify_connect(mux, stores)
            })?,
            ShipRef::Inbound { .. } => {
                return Err(Error::sink(format!(
                    "connect event on inbound rudder {}",
                    rudder
                )))
            }
        };
        Ok(action.unwrap_or(NextAction::Close))
    }

    /// Hand one read result to the ship. An empty buffer is end of stream.
    pub fn on_read(
        &mut self,
        rudder: RudderId,
        buf: Bytes,
        mux: &mut Multiplexer,
        stores: &mut AgentStores,
    ) -> Result<NextAction> {
        if buf.is_empty() {
            tracing::trace!(rudder = %rudder, ship = %self.ship, "eof");
            return self.notify_eof(mux, stores);
        }

        let mut upgrades = 0;
        loop {
            let outcome = match self.ship {
                ShipRef::Inbound { .. } => stores.with_inbound(self.ship, |ship, stores| {
                    ship.notify_read(&buf, mux, stores)
                })?,
                ShipRef::Warp { .. } => stores.with_warp(self.ship, |ship, stores| {
                    ship.notify_read(&buf, mux, stores)
                })?,
            };
            let Some(outcome) = outcome else {
                // ship already released
                return Ok(NextAction::Close);
            };

            match outcome {
                ReadOutcome::Continue(action) => return Ok(action),
                ReadOutcome::Upgrade => {
                    upgrades += 1;
                    if upgrades > MAX_UPGRADES {
                        return Err(Error::sink(format!(
                            "rudder {}: handler upgraded {} times on one buffer",
                            rudder, upgrades
                        )));
                    }
                    tracing::debug!(rudder = %rudder, ship = %self.ship, "protocol upgraded");
                }
                ReadOutcome::ProtocolFault(e) => {
                    tracing::debug!(rudder = %rudder, ship = %self.ship, "protocol fault: {}", e);
                    let keep = self.server_mode && self.notify_protocol_error(e, mux, stores)?;
                    return Ok(if keep {
                        NextAction::Continue
                    } else {
                        NextAction::Close
                    });
                }
                ReadOutcome::IoFault(e) => {
                    self.on_error(rudder, e, mux, stores)?;
                    return Ok(NextAction::Close);
                }
            }
        }
    }

    /// The ship may continue with work it held back.
    pub fn on_resume(
        &mut self,
        rudder: RudderId,
        mux: &mut Multiplexer,
        stores: &mut AgentStores,
    ) -> Result<NextAction> {
        tracing::trace!(rudder = %rudder, ship = %self.ship, "resume");
        match self.ship {
            ShipRef::Inbound { .. } => Ok(stores
                .with_inbound(self.ship, |ship, stores| ship.drain_pending(mux, stores))?
                .unwrap_or(NextAction::Close)),
            ShipRef::Warp { .. } => Ok(NextAction::Continue),
        }
    }

    /// Report an I/O fault. The caller closes the rudder afterwards.
    pub fn on_error(
        &mut self,
        rudder: RudderId,
        err: io::Error,
        mux: &mut Multiplexer,
        stores: &mut AgentStores,
    ) -> Result<()> {
        tracing::debug!(rudder = %rudder, ship = %self.ship, "io error: {}", err);
        match self.ship {
            ShipRef::Inbound { .. } => {
                stores.with_inbound(self.ship, |ship, _| ship.notify_error(&err))?;
            }
            ShipRef::Warp { .. } => {
                stores.with_warp(self.ship, |ship, stores| ship.notify_error(&err, mux, stores))?;
            }
        }
        Ok(())
    }

    pub fn on_closed(
        &mut self,
        rudder: RudderId,
        mux: &mut Multiplexer,
        stores: &mut AgentStores,
    ) -> Result<()> {
        tracing::trace!(rudder = %rudder, ship = %self.ship, "closed");
        match self.ship {
            ShipRef::Inbound { .. } => {
                stores.with_inbound(self.ship, |ship, stores| ship.notify_close(stores))?;
            }
            ShipRef::Warp { .. } => {
                stores.with_warp(self.ship, |ship, stores| ship.notify_close(mux, stores))?;
            }
        }
        Ok(())
    }

    /// True if the ship considers `elapsed_sec` of idleness a timeout.
    pub fn check_timeout(&self, elapsed_sec: i64, stores: &mut AgentStores) -> Result<bool> {
        match self.ship {
            ShipRef::Inbound { object, ship_id } => Ok(stores
                .inbound_ships
                .get(object)
                .filter(|ship| ship.ship_id() == ship_id)
                .is_some_and(|ship| ship.check_timeout(elapsed_sec))),
            ShipRef::Warp { object, ship_id } => Ok(stores
                .warp_ships
                .get_mut(object)
                .filter(|ship| ship.ship_id() == ship_id)
                .is_some_and(|ship| ship.check_timeout(elapsed_sec))),
        }
    }

    fn notify_eof(&mut self, mux: &mut Multiplexer, stores: &mut AgentStores) -> Result<NextAction> {
        let action = match self.ship {
            ShipRef::Inbound { .. } => {
                stores.with_inbound(self.ship, |ship, _| Ok(ship.notify_eof()))?
            }
            ShipRef::Warp { .. } => {
                stores.with_warp(self.ship, |ship, stores| ship.notify_eof(mux, stores))?
            }
        };
        Ok(action.unwrap_or(NextAction::Close))
    }

    fn notify_protocol_error(
        &mut self,
        err: Error,
        mux: &mut Multiplexer,
        stores: &mut AgentStores,
    ) -> Result<bool> {
        let keep = match self.ship {
            ShipRef::Inbound { .. } => stores.with_inbound(self.ship, |ship, _| {
                ship.notify_protocol_error(&err, mux)
            })?,
            ShipRef::Warp { .. } => None,
        };
        Ok(keep.unwrap_or(false))
    }
}
