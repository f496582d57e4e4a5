//! Ships: pooled per-connection actors.
//!
//! A ship is either idle in its pool (uninitialized, no rudder) or active
//! (initialized, bound to exactly one rudder). `InboundShip` serves an
//! accepted connection; `WarpShip` drives an outbound connection to an
//! upstream server on behalf of inbound tours.

mod inbound;
mod warp;

pub use inbound::InboundShip;
pub use warp::{WarpEntry, WarpShip};

use crate::types::{AgentId, Error, ObjectId, Result, RudderId, ShipId};

/// Identity and timeout state shared by every ship kind.
#[derive(Debug)]
pub struct ShipCore {
    object_id: ObjectId,
    ship_id: ShipId,
    agent_id: AgentId,
    rudder: Option<RudderId>,
    initialized: bool,
    keeping: bool,
    socket_timeout_sec: i64,
    keep_timeout_sec: i64,
    release_requested: bool,
}

impl ShipCore {
    pub fn new(object_id: ObjectId) -> Self {
        Self {
            object_id,
            ship_id: ShipId::IDLE,
            agent_id: AgentId::UNASSIGNED,
            rudder: None,
            initialized: false,
            keeping: false,
            socket_timeout_sec: 0,
            keep_timeout_sec: 0,
            release_requested: false,
        }
    }

    /// Bind the ship to a rudder. Allowed once per lease.
    pub fn init(&mut self, agent_id: AgentId, ship_id: ShipId, rudder: RudderId) -> Result<()> {
        if self.initialized {
            return Err(Error::sink(format!(
                "ship {} initialized twice (ship id {})",
                self.object_id, self.ship_id
            )));
        }
        self.agent_id = agent_id;
        self.ship_id = ship_id;
        self.rudder = Some(rudder);
        self.initialized = true;
        Ok(())
    }

    pub fn set_timeouts(&mut self, socket_timeout_sec: i64, keep_timeout_sec: i64) {
        self.socket_timeout_sec = socket_timeout_sec;
        self.keep_timeout_sec = keep_timeout_sec;
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::sink(format!(
                "ship {} used while idle",
                self.object_id
            )))
        }
    }

    /// Rudder of an initialized ship.
    pub fn rudder(&self) -> Result<RudderId> {
        self.rudder
            .filter(|_| self.initialized)
            .ok_or_else(|| Error::sink(format!("ship {} has no rudder", self.object_id)))
    }

    /// Timeout check: `keep_timeout_sec` while keeping, `socket_timeout_sec`
    /// otherwise. A threshold of zero or less never expires.
    pub fn check_timeout(&self, duration_sec: i64) -> bool {
        let threshold = if self.keeping {
            self.keep_timeout_sec
        } else {
            self.socket_timeout_sec
        };
        threshold > 0 && duration_sec >= threshold
    }

    /// Ask the owning store to recycle this ship once the current callback
    /// returns.
    pub fn request_release(&mut self) {
        self.release_requested = true;
    }

    pub fn release_requested(&self) -> bool {
        self.release_requested
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn ship_id(&self) -> ShipId {
        self.ship_id
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_keeping(&self) -> bool {
        self.keeping
    }

    pub fn set_keeping(&mut self, keeping: bool) {
        self.keeping = keeping;
    }

    pub fn reset(&mut self) {
        *self = ShipCore::new(self.object_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(socket: i64, keep: i64) -> ShipCore {
        let mut core = ShipCore::new(ObjectId::new(0));
        core.init(AgentId::new(1), ShipId::new(7), RudderId::new(3))
            .unwrap();
        core.set_timeouts(socket, keep);
        core
    }

    #[test]
    fn timeout_boundary_uses_socket_timeout() {
        let core = core(30, 5);
        assert!(!core.check_timeout(29));
        assert!(core.check_timeout(30));
        assert!(core.check_timeout(31));
    }

    #[test]
    fn timeout_boundary_uses_keep_timeout_while_keeping() {
        let mut core = core(30, 5);
        core.set_keeping(true);
        assert!(!core.check_timeout(4));
        assert!(core.check_timeout(5));
    }

    #[test]
    fn non_positive_threshold_disables_timeout() {
        let core = core(0, -1);
        assert!(!core.check_timeout(i64::MAX));
    }

    #[test]
    fn init_twice_is_fatal() {
        let mut core = core(1, 1);
        let err = core
            .init(AgentId::new(1), ShipId::new(8), RudderId::new(4))
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(core.ship_id(), ShipId::new(7));
    }

    #[test]
    fn idle_ship_refuses_use() {
        let mut core = core(1, 1);
        core.reset();
        assert!(core.ensure_initialized().unwrap_err().is_fatal());
        assert!(core.rudder().is_err());
        assert_eq!(core.ship_id(), ShipId::IDLE);
    }
}
