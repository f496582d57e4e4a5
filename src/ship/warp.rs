//! Ship for an outbound upstream connection.
//!
//! A warp ship relays requests of inbound tours to one upstream server.
//! Bytes posted before the connection is established are buffered and
//! flushed in order once it is. Each tour is correlated by a warp id.

use bytes::BytesMut;
use std::collections::HashMap;
use std::io;

use super::ShipCore;
use crate::agent::AgentStores;
use crate::docker::WarpTarget;
use crate::multiplexer::{Multiplexer, WriteUnit};
use crate::pool::Reusable;
use crate::protocol::{reason_phrase, WarpEvent, WarpHandler};
use crate::rudder::Letter;
use crate::tour::Tour;
use crate::transporter::{NextAction, ReadOutcome, ShipRef};
use crate::types::{AgentId, Error, ObjectId, Result, RudderId, ShipId, TourId, TourKey};

/// A tour being relayed by a warp ship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarpEntry {
    pub key: TourKey,
    pub tour_id: TourId,
    /// Inbound ship that owns the tour.
    pub origin: ShipRef,
    /// Whether upstream bytes have been relayed for this tour.
    pub responded: bool,
}

#[derive(Debug)]
pub struct WarpShip {
    core: ShipCore,
    handler: Option<Box<dyn WarpHandler>>,
    tour_map: HashMap<u16, WarpEntry>,
    cmd_buf: Vec<WriteUnit>,
    connected: bool,
    timed_out: bool,
    upstream: String,
    last_warp_id: u16,
}

impl WarpShip {
    pub fn new(object_id: ObjectId) -> Self {
        Self {
            core: ShipCore::new(object_id),
            handler: None,
            tour_map: HashMap::new(),
            cmd_buf: Vec::new(),
            connected: false,
            timed_out: false,
            upstream: String::new(),
            last_warp_id: 0,
        }
    }

    pub fn init(
        &mut self,
        agent_id: AgentId,
        ship_id: ShipId,
        rudder: RudderId,
        target: &WarpTarget,
        handler: Box<dyn WarpHandler>,
    ) -> Result<()> {
        self.core.init(agent_id, ship_id, rudder)?;
        self.core.set_timeouts(target.timeout_secs, target.timeout_secs);
        self.handler = Some(handler);
        self.upstream = target.upstream.clone();
        tracing::debug!(agent = %agent_id, ship = %ship_id, rudder = %rudder, upstream = %self.upstream, "warp ship started");
        Ok(())
    }

    pub fn core(&self) -> &ShipCore {
        &self.core
    }

    pub fn ship_id(&self) -> ShipId {
        self.core.ship_id()
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn tour_count(&self) -> usize {
        self.tour_map.len()
    }

    pub fn buffered_writes(&self) -> usize {
        self.cmd_buf.len()
    }

    pub fn entry(&self, warp_id: u16) -> Option<&WarpEntry> {
        self.tour_map.get(&warp_id)
    }

    /// Expiry marks the ship timed out so pending tours are answered 504.
    pub fn check_timeout(&mut self, duration_sec: i64) -> bool {
        let expired = self.core.check_timeout(duration_sec);
        if expired {
            self.timed_out = true;
        }
        expired
    }

    /// Next correlation id; zero is never handed out.
    pub fn next_warp_id(&mut self) -> u16 {
        self.last_warp_id = self.last_warp_id.wrapping_add(1);
        if self.last_warp_id == 0 {
            self.last_warp_id = 1;
        }
        self.last_warp_id
    }

    /// Register a tour under `warp_id`. A duplicate id is an invariant
    /// violation and leaves the existing entry in place.
    pub fn start_warp_tour(&mut self, warp_id: u16, entry: WarpEntry) -> Result<()> {
        self.core.ensure_initialized()?;
        if self.tour_map.contains_key(&warp_id) {
            return Err(Error::sink(format!(
                "warp ship {}: warp id {} already in use",
                self.core.ship_id(),
                warp_id
            )));
        }
        tracing::debug!(ship = %self.core.ship_id(), warp_id, key = %entry.key, "warp tour started");
        self.tour_map.insert(warp_id, entry);
        Ok(())
    }

    pub fn encode_request(&mut self, warp_id: u16, tour: &Tour, out: &mut BytesMut) -> Result<()> {
        self.handler
            .as_deref_mut()
            .ok_or_else(|| Error::sink("warp ship has no handler"))?
            .encode_request(warp_id, tour, out)
    }

    /// Queue bytes for the upstream, buffering until connected.
    pub fn post(&mut self, unit: WriteUnit, mux: &mut Multiplexer) -> Result<()> {
        self.core.ensure_initialized()?;
        if self.connected {
            mux.req_write(self.core.rudder()?, unit)
        } else {
            self.cmd_buf.push(unit);
            Ok(())
        }
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    pub fn notify_connect(&mut self, mux: &mut Multiplexer, _stores: &mut AgentStores) -> Result<NextAction> {
        self.core.ensure_initialized()?;
        self.connected = true;
        let rudder = self.core.rudder()?;
        tracing::debug!(ship = %self.core.ship_id(), upstream = %self.upstream, buffered = self.cmd_buf.len(), "upstream connected");
        for unit in std::mem::take(&mut self.cmd_buf) {
            mux.req_write(rudder, unit)?;
        }
        Ok(NextAction::Continue)
    }

    pub fn notify_read(
        &mut self,
        buf: &[u8],
        mux: &mut Multiplexer,
        stores: &mut AgentStores,
    ) -> Result<ReadOutcome> {
        self.core.ensure_initialized()?;
        let handler = self
            .handler
            .as_deref_mut()
            .ok_or_else(|| Error::sink("warp ship has no handler"))?;
        let events = match handler.bytes_received(buf) {
            Ok(events) => events,
            Err(e) => return ReadOutcome::classify(e),
        };
        self.relay(events, mux, stores)?;
        Ok(ReadOutcome::Continue(NextAction::Continue))
    }

    /// Upstream closed its side: finish what it sent and close.
    pub fn notify_eof(&mut self, mux: &mut Multiplexer, stores: &mut AgentStores) -> Result<NextAction> {
        self.drain_handler(mux, stores)?;
        self.fail_all(mux, stores)?;
        Ok(NextAction::Close)
    }

    pub fn notify_error(&mut self, err: &io::Error, mux: &mut Multiplexer, stores: &mut AgentStores) -> Result<()> {
        tracing::debug!(ship = %self.core.ship_id(), upstream = %self.upstream, "upstream error: {}", err);
        self.fail_all(mux, stores)
    }

    pub fn notify_close(&mut self, mux: &mut Multiplexer, stores: &mut AgentStores) -> Result<()> {
        self.core.ensure_initialized()?;
        self.drain_handler(mux, stores)?;
        self.fail_all(mux, stores)?;
        let aborted: io::Result<usize> = Err(io::ErrorKind::NotConnected.into());
        for unit in self.cmd_buf.drain(..) {
            unit.complete(&aborted);
        }
        self.core.request_release();
        Ok(())
    }

    // =========================================================================
    // Relay
    // =========================================================================

    fn drain_handler(&mut self, mux: &mut Multiplexer, stores: &mut AgentStores) -> Result<()> {
        let events = match self.handler.as_deref_mut() {
            Some(handler) => handler.on_eof(),
            None => Vec::new(),
        };
        self.relay(events, mux, stores)
    }

    fn relay(&mut self, events: Vec<WarpEvent>, mux: &mut Multiplexer, stores: &mut AgentStores) -> Result<()> {
        for event in events {
            match event {
                WarpEvent::Data { warp_id, data } => {
                    let Some(entry) = self.tour_map.get_mut(&warp_id) else {
                        tracing::debug!(ship = %self.core.ship_id(), warp_id, "data for unknown warp id dropped");
                        continue;
                    };
                    let Some(tour) = live_tour(stores, entry) else {
                        continue;
                    };
                    tour.res.send_raw(data)?;
                    entry.responded = true;
                    let entry = entry.clone();
                    flush_origin(&entry, mux, stores)?;
                }
                WarpEvent::End { warp_id } => {
                    let Some(entry) = self.tour_map.remove(&warp_id) else {
                        continue;
                    };
                    self.finish_entry(&entry, mux, stores)?;
                }
            }
        }
        Ok(())
    }

    /// Answer every tour still waiting on this ship.
    fn fail_all(&mut self, mux: &mut Multiplexer, stores: &mut AgentStores) -> Result<()> {
        let mut entries: Vec<(u16, WarpEntry)> = self.tour_map.drain().collect();
        entries.sort_by_key(|(id, _)| *id);
        for (_, entry) in entries {
            self.finish_entry(&entry, mux, stores)?;
        }
        Ok(())
    }

    fn finish_entry(&self, entry: &WarpEntry, mux: &mut Multiplexer, stores: &mut AgentStores) -> Result<()> {
        let Some(tour) = live_tour(stores, entry) else {
            return Ok(());
        };
        if !entry.responded && !tour.res.headers_sent() {
            let status = if self.timed_out { 504 } else { 502 };
            tracing::debug!(ship = %self.core.ship_id(), key = %entry.key, status, upstream = %self.upstream, "upstream gave no response");
            tour.res.send_error(status, reason_phrase(status))?;
        } else if !tour.res.is_ended() {
            tour.res.end()?;
        }
        if let Some(rudder) = tour.rudder() {
            // content credit held by unsent uploads is gone with this ship
            let _ = mux.letters().send(Letter::Resume { rudder });
        }
        flush_origin(entry, mux, stores)
    }
}

/// The tour of `entry`, if it is still the same tour.
fn live_tour<'a>(stores: &'a mut AgentStores, entry: &WarpEntry) -> Option<&'a mut Tour> {
    stores
        .tours
        .get_mut(entry.key)
        .filter(|tour| tour.tour_id() == entry.tour_id)
}

fn flush_origin(entry: &WarpEntry, mux: &mut Multiplexer, stores: &mut AgentStores) -> Result<()> {
    let key = entry.key;
    stores.with_inbound(entry.origin, |ship, stores| {
        ship.flush_tour(key, mux, stores).map(|_| ())
    })?;
    Ok(())
}

impl Reusable for WarpShip {
    fn reset(&mut self) -> Result<()> {
        if !self.tour_map.is_empty() {
            return Err(Error::sink(format!(
                "warp ship {} recycled with {} tours",
                self.core.ship_id(),
                self.tour_map.len()
            )));
        }
        self.core.reset();
        if let Some(handler) = self.handler.as_deref_mut() {
            handler.reset();
        }
        self.handler = None;
        self.cmd_buf.clear();
        self.connected = false;
        self.timed_out = false;
        self.upstream.clear();
        self.last_warp_id = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::H1WarpHandler;

    fn ship() -> WarpShip {
        let mut ship = WarpShip::new(ObjectId::new(0));
        let target = WarpTarget {
            upstream: "127.0.0.1:9".into(),
            timeout_secs: 10,
        };
        ship.init(
            AgentId::new(1),
            ShipId::new(5),
            RudderId::new(9),
            &target,
            Box::new(H1WarpHandler::new()),
        )
        .unwrap();
        ship
    }

    fn entry(req_key: u16) -> WarpEntry {
        WarpEntry {
            key: TourKey::new(ShipId::new(1), req_key),
            tour_id: TourId::new(req_key as u32),
            origin: ShipRef::inbound(ObjectId::new(0), ShipId::new(1)),
            responded: false,
        }
    }

    #[test]
    fn duplicate_warp_id_keeps_the_first_entry() {
        let mut ship = ship();
        ship.start_warp_tour(1, entry(1)).unwrap();
        let err = ship.start_warp_tour(1, entry(2)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(ship.tour_count(), 1);
        assert_eq!(ship.entry(1), Some(&entry(1)));
    }

    #[test]
    fn warp_ids_skip_zero() {
        let mut ship = ship();
        ship.last_warp_id = u16::MAX;
        assert_eq!(ship.next_warp_id(), 1);
        assert_eq!(ship.next_warp_id(), 2);
    }

    #[test]
    fn timeout_marks_the_ship() {
        let mut ship = ship();
        assert!(!ship.check_timeout(9));
        assert!(!ship.is_timed_out());
        assert!(ship.check_timeout(10));
        assert!(ship.is_timed_out());
    }

    #[test]
    fn reset_requires_an_empty_tour_map() {
        let mut ship = ship();
        ship.start_warp_tour(1, entry(1)).unwrap();
        assert!(ship.reset().is_err());
        ship.tour_map.clear();
        ship.reset().unwrap();
        assert!(!ship.core().is_initialized());
        assert!(ship.upstream().is_empty());
    }

    #[test]
    fn start_on_idle_ship_is_fatal() {
        let mut idle = WarpShip::new(ObjectId::new(3));
        assert!(idle.start_warp_tour(1, entry(1)).unwrap_err().is_fatal());
    }
}
