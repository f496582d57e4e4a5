//! Per-agent object stores.
//!
//! Everything an agent leases (inbound ships, warp ships, tours) lives here.
//! Ships are driven through [`AgentStores::with_inbound`] and
//! [`AgentStores::with_warp`], which check the ship out of its pool for the
//! duration of the callback so the callback can use the remaining stores.

use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use super::registry::StoreUsage;
use crate::docker::{Port, WarpTarget};
use crate::multiplexer::{Multiplexer, WriteCallback, WriteUnit};
use crate::observability::{AccessLog, TourLogger};
use crate::pool::ObjectStore;
use crate::protocol::H1WarpHandler;
use crate::ship::{InboundShip, WarpEntry, WarpShip};
use crate::tour::TourStore;
use crate::transporter::{ShipRef, Transporter};
use crate::types::{AgentConfig, AgentId, Error, ObjectId, Result, RudderId, ShipId, TourKey};

#[derive(Debug)]
pub struct AgentStores {
    agent_id: AgentId,
    config: AgentConfig,
    pub inbound_ships: ObjectStore<InboundShip>,
    pub warp_ships: ObjectStore<WarpShip>,
    pub tours: TourStore,
    pub(crate) logger: Arc<dyn TourLogger>,
    last_ship_id: u32,
}

impl AgentStores {
    pub fn new(agent_id: AgentId, config: &AgentConfig) -> Self {
        Self {
            agent_id,
            config: config.clone(),
            inbound_ships: ObjectStore::new("inbound ships", InboundShip::new),
            warp_ships: ObjectStore::new("warp ships", WarpShip::new),
            tours: TourStore::new(config.max_tours),
            logger: Arc::new(AccessLog),
            last_ship_id: 0,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn TourLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn logger(&self) -> &Arc<dyn TourLogger> {
        &self.logger
    }

    /// Ship ids are unique per agent lifetime modulo wrap; zero marks idle.
    pub fn next_ship_id(&mut self) -> ShipId {
        self.last_ship_id = self.last_ship_id.wrapping_add(1);
        if self.last_ship_id == 0 {
            self.last_ship_id = 1;
        }
        ShipId::new(self.last_ship_id)
    }

    pub fn has_ship_capacity(&self) -> bool {
        self.inbound_ships.active_count() < self.config.max_ships
    }

    // =========================================================================
    // Ship access
    // =========================================================================

    /// Run `f` on the inbound ship behind `ship`.
    ///
    /// Returns `Ok(None)` if the reference is stale (the slot was recycled or
    /// returned). A ship that requested release during `f` goes back to its
    /// pool afterwards.
    pub fn with_inbound<R>(
        &mut self,
        ship: ShipRef,
        f: impl FnOnce(&mut InboundShip, &mut AgentStores) -> Result<R>,
    ) -> Result<Option<R>> {
        let ShipRef::Inbound { object, ship_id } = ship else {
            return Err(Error::sink(format!("{} is not an inbound ship", ship)));
        };
        match self.inbound_ships.get(object) {
            Some(s) if s.ship_id() == ship_id => {}
            _ => return Ok(None),
        }
        let mut checked_out = self.inbound_ships.checkout(object)?;
        let result = f(&mut checked_out, self);
        let release = checked_out.core().release_requested();
        self.inbound_ships.checkin(object, checked_out)?;
        if release {
            self.release_inbound(object)?;
        }
        result.map(Some)
    }

    /// Warp counterpart of [`AgentStores::with_inbound`].
    pub fn with_warp<R>(
        &mut self,
        ship: ShipRef,
        f: impl FnOnce(&mut WarpShip, &mut AgentStores) -> Result<R>,
    ) -> Result<Option<R>> {
        let ShipRef::Warp { object, ship_id } = ship else {
            return Err(Error::sink(format!("{} is not a warp ship", ship)));
        };
        match self.warp_ships.get(object) {
            Some(s) if s.ship_id() == ship_id => {}
            _ => return Ok(None),
        }
        let mut checked_out = self.warp_ships.checkout(object)?;
        let result = f(&mut checked_out, self);
        let release = checked_out.core().release_requested();
        self.warp_ships.checkin(object, checked_out)?;
        if release {
            self.release_warp(object)?;
        }
        result.map(Some)
    }

    pub fn release_inbound(&mut self, object: ObjectId) -> Result<()> {
        tracing::debug!(agent = %self.agent_id, object = %object, "inbound ship released");
        self.inbound_ships.return_object(object)
    }

    pub fn release_warp(&mut self, object: ObjectId) -> Result<()> {
        tracing::debug!(agent = %self.agent_id, object = %object, "warp ship released");
        self.warp_ships.return_object(object)
    }

    // =========================================================================
    // Lifecycle helpers
    // =========================================================================

    /// Lease and initialize an inbound ship for an accepted connection.
    pub fn open_inbound(
        &mut self,
        rudder: RudderId,
        port: &Arc<dyn Port>,
        peer: Option<SocketAddr>,
    ) -> Result<ShipRef> {
        let object = self.inbound_ships.rent()?;
        let ship_id = self.next_ship_id();
        let ship = self
            .inbound_ships
            .get_mut(object)
            .ok_or_else(|| Error::sink(format!("rented ship {} is missing", object)))?;
        ship.init(
            self.agent_id,
            ship_id,
            rudder,
            Arc::clone(port),
            peer,
            &self.config,
        )?;
        Ok(ShipRef::inbound(object, ship_id))
    }

    /// Open an upstream connection for the tour `key` and send its request
    /// head. The head is buffered in the warp ship until connected.
    pub fn start_warp(
        &mut self,
        target: &WarpTarget,
        origin: ShipRef,
        key: TourKey,
        mux: &mut Multiplexer,
    ) -> Result<()> {
        let object = self.warp_ships.rent()?;
        let ship_id = self.next_ship_id();
        let rudder = mux.next_rudder_id();
        let ship = self
            .warp_ships
            .get_mut(object)
            .ok_or_else(|| Error::sink(format!("rented warp ship {} is missing", object)))?;
        ship.init(
            self.agent_id,
            ship_id,
            rudder,
            target,
            Box::new(H1WarpHandler::new()),
        )?;

        let tour = self
            .tours
            .get_mut(key)
            .ok_or_else(|| Error::sink(format!("warp started for inactive tour {}", key)))?;
        let warp_id = ship.next_warp_id();
        let mut head = BytesMut::new();
        ship.encode_request(warp_id, tour, &mut head)?;
        ship.start_warp_tour(
            warp_id,
            WarpEntry {
                key,
                tour_id: tour.tour_id(),
                origin,
                responded: false,
            },
        )?;
        tour.set_warp(object);
        ship.post(WriteUnit::new(head.freeze()), mux)?;

        tracing::debug!(
            agent = %self.agent_id,
            key = %key,
            upstream = %target.upstream,
            rudder = %rudder,
            "warping tour"
        );
        let secure = tour.req.secure;
        mux.req_connect(
            rudder,
            target.upstream.clone(),
            Transporter::client(ShipRef::warp(object, ship_id), secure),
        )
    }

    /// Send request content to the warp ship relaying it. If the ship is
    /// gone the callback sees a `NotConnected` error.
    pub fn post_warp(
        &mut self,
        warp: ObjectId,
        data: Bytes,
        on_done: Option<WriteCallback>,
        mux: &mut Multiplexer,
    ) -> Result<()> {
        let mut unit = WriteUnit::new(data);
        if let Some(on_done) = on_done {
            unit = unit.on_done(on_done);
        }
        match self.warp_ships.get_mut(warp) {
            Some(ship) => ship.post(unit, mux),
            None => {
                unit.complete(&Err(io::ErrorKind::NotConnected.into()));
                Ok(())
            }
        }
    }

    pub fn usage(&self) -> StoreUsage {
        StoreUsage {
            agent_id: self.agent_id,
            inbound_ships: self.inbound_ships.usage(),
            warp_ships: self.warp_ships.usage(),
            tours: self.tours.usage(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{ConfiguredPort, RouteCity};
    use crate::types::PortConfig;

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

    #[test]
    fn ship_ids_skip_zero_on_wrap() {
        let mut stores = AgentStores::new(AgentId::new(1), &AgentConfig::default());
        stores.last_ship_id = u32::MAX;
        assert_eq!(stores.next_ship_id(), ShipId::new(1));
    }

    #[test]
    fn recycled_slot_rejects_old_reference() {
        let mut stores = AgentStores::new(AgentId::new(1), &AgentConfig::default());
        let port = port();
        let first = stores.open_inbound(RudderId::new(1), &port, None).unwrap();
        stores.release_inbound(first.object()).unwrap();
        let second = stores.open_inbound(RudderId::new(2), &port, None).unwrap();

        assert_eq!(first.object(), second.object());
        assert_ne!(first.ship_id(), second.ship_id());
        assert!(stores.with_inbound(first, |_, _| Ok(())).unwrap().is_none());
        assert!(stores.with_inbound(second, |_, _| Ok(())).unwrap().is_some());
    }

    #[test]
    fn wrong_ship_kind_is_fatal() {
        let mut stores = AgentStores::new(AgentId::new(1), &AgentConfig::default());
        let bogus = ShipRef::warp(ObjectId::new(0), ShipId::new(1));
        assert!(stores.with_inbound(bogus, |_, _| Ok(())).unwrap_err().is_fatal());
    }

    #[test]
    fn capacity_follows_max_ships() {
        let config = AgentConfig {
            max_ships: 1,
            ..AgentConfig::default()
        };
        let mut stores = AgentStores::new(AgentId::new(1), &config);
        assert!(stores.has_ship_capacity());
        stores.open_inbound(RudderId::new(1), &port(), None).unwrap();
        assert!(!stores.has_ship_capacity());
        assert_eq!(stores.usage().inbound_ships.active, 1);
    }

    #[test]
    fn post_to_missing_warp_fails_the_callback() {
        let mut stores = AgentStores::new(AgentId::new(1), &AgentConfig::default());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut mux = Multiplexer::new(
            AgentId::new(1),
            crate::types::MultiplexerKind::Valve,
            tx,
            64,
        );
        let seen = std::rc::Rc::new(std::cell::Cell::new(false));
        let flag = std::rc::Rc::clone(&seen);
        stores
            .post_warp(
                ObjectId::new(4),
                Bytes::from_static(b"body"),
                Some(Box::new(move |r: &io::Result<usize>| flag.set(r.is_err()))),
                &mut mux,
            )
            .unwrap();
        assert!(seen.get());
    }
}
