//! Ship for an accepted connection.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use super::ShipCore;
use crate::agent::AgentStores;
use crate::docker::{Arrival, Port};
use crate::multiplexer::{Multiplexer, WriteCallback};
use crate::protocol::{reason_phrase, Decoded, InboundEvent, InboundHandler};
use crate::pool::Reusable;
use crate::rudder::Letter;
use crate::tour::{IdCheck, RequestHead, TourStore};
use crate::transporter::{NextAction, ReadOutcome, ShipRef};
use crate::types::{AgentConfig, AgentId, Error, ObjectId, Result, RudderId, ShipId, TourKey};

#[derive(Debug)]
pub struct InboundShip {
    core: ShipCore,
    port: Option<Arc<dyn Port>>,
    handler: Option<Box<dyn InboundHandler>>,
    active_tours: Vec<TourKey>,
    /// Decoded events not handled yet. A request waits here while an
    /// earlier tour of this connection is still active.
    pending: VecDeque<InboundEvent>,
    draining: bool,
    need_end: bool,
    peer: Option<SocketAddr>,
    buffer_limit: usize,
}

impl InboundShip {
    pub fn new(object_id: ObjectId) -> Self {
        Self {
            core: ShipCore::new(object_id),
            port: None,
            handler: None,
            active_tours: Vec::new(),
            pending: VecDeque::new(),
            draining: false,
            need_end: false,
            peer: None,
            buffer_limit: 0,
        }
    }

    pub fn init(
        &mut self,
        agent_id: AgentId,
        ship_id: ShipId,
        rudder: RudderId,
        port: Arc<dyn Port>,
        peer: Option<SocketAddr>,
        config: &AgentConfig,
    ) -> Result<()> {
        self.core.init(agent_id, ship_id, rudder)?;
        self.core
            .set_timeouts(config.socket_timeout_secs, config.keep_timeout_secs);
        self.handler = Some(port.new_handler());
        self.port = Some(port);
        self.peer = peer;
        self.buffer_limit = config.read_buffer_size;
        tracing::debug!(agent = %agent_id, ship = %ship_id, rudder = %rudder, peer = ?peer, "inbound ship started");
        Ok(())
    }

    pub fn core(&self) -> &ShipCore {
        &self.core
    }

    pub fn object_id(&self) -> ObjectId {
        self.core.object_id()
    }

    pub fn ship_id(&self) -> ShipId {
        self.core.ship_id()
    }

    pub fn ship_ref(&self) -> ShipRef {
        ShipRef::inbound(self.core.object_id(), self.core.ship_id())
    }

    pub fn active_tours(&self) -> &[TourKey] {
        &self.active_tours
    }

    pub fn need_end(&self) -> bool {
        self.need_end
    }

    pub fn is_secure(&self) -> bool {
        self.port.as_ref().is_some_and(|p| p.secure())
    }

    pub fn check_timeout(&self, duration_sec: i64) -> bool {
        self.core.check_timeout(duration_sec)
    }

    /// Replace the protocol handler.
    pub fn set_handler(&mut self, handler: Box<dyn InboundHandler>) {
        self.handler = Some(handler);
    }

    fn handler_mut(&mut self) -> Result<&mut (dyn InboundHandler + 'static)> {
        let object = self.core.object_id();
        self.handler
            .as_deref_mut()
            .ok_or_else(|| Error::sink(format!("inbound ship {} has no handler", object)))
    }

    // =========================================================================
    // Tours
    // =========================================================================

    /// Look up the active tour for `req_key`, or rent and initialize a fresh
    /// one when `rent` is set. `Ok(None)` means "not active" (without
    /// `rent`) or "no capacity" (with it).
    pub fn get_tour(
        &mut self,
        tours: &mut TourStore,
        req_key: u16,
        force: bool,
        rent: bool,
    ) -> Result<Option<TourKey>> {
        self.core.ensure_initialized()?;
        let key = TourKey::new(self.core.ship_id(), req_key);
        if tours.contains(key) {
            if !self.active_tours.contains(&key) {
                return Err(Error::sink(format!(
                    "tour {} is active but not owned by ship {}",
                    key,
                    self.core.ship_id()
                )));
            }
            return Ok(Some(key));
        }
        if !rent {
            return Ok(None);
        }

        let rudder = self.core.rudder()?;
        let secure = self.is_secure();
        let Some(tour) = tours.rent(key, force)? else {
            return Ok(None);
        };
        tour.init(self.core.object_id(), rudder, self.peer, secure, self.buffer_limit)?;
        self.active_tours.push(key);
        Ok(Some(key))
    }

    /// Give a tour back to the store. If the connection is already gone and
    /// this was the last tour, the ship asks to be recycled.
    pub fn return_tour(&mut self, key: TourKey, tours: &mut TourStore) -> Result<()> {
        let pos = self
            .active_tours
            .iter()
            .position(|k| *k == key)
            .ok_or_else(|| {
                Error::sink(format!(
                    "tour {} returned to ship {} that does not own it",
                    key,
                    self.core.ship_id()
                ))
            })?;
        self.active_tours.remove(pos);
        tours.return_tour(key)?;
        if self.need_end && self.active_tours.is_empty() {
            tracing::debug!(ship = %self.core.ship_id(), "last draining tour returned");
            self.core.request_release();
        }
        Ok(())
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    pub fn notify_read(
        &mut self,
        buf: &[u8],
        mux: &mut Multiplexer,
        stores: &mut AgentStores,
    ) -> Result<ReadOutcome> {
        self.core.ensure_initialized()?;
        let decoded = match self.handler_mut()?.bytes_received(buf) {
            Ok(decoded) => decoded,
            Err(e) => return ReadOutcome::classify(e),
        };

        match decoded {
            Decoded::Upgrade(handler) => {
                tracing::debug!(ship = %self.core.ship_id(), to = handler.protocol(), "handler upgraded");
                self.handler = Some(handler);
                Ok(ReadOutcome::Upgrade)
            }
            Decoded::Events(events) => {
                self.pending.extend(events);
                self.drain_pending(mux, stores).map(ReadOutcome::Continue)
            }
        }
    }

    /// Handle queued events in arrival order. Responses on one connection
    /// must leave in request order, so a request (or a fault) is not
    /// started while an earlier tour is still active; the read side is
    /// suspended until that tour ends.
    pub fn drain_pending(&mut self, mux: &mut Multiplexer, stores: &mut AgentStores) -> Result<NextAction> {
        self.core.ensure_initialized()?;
        self.draining = true;
        let result = self.drain_events(mux, stores);
        self.draining = false;
        result
    }

    fn drain_events(&mut self, mux: &mut Multiplexer, stores: &mut AgentStores) -> Result<NextAction> {
        let mut next = NextAction::Continue;
        while let Some(event) = self.pending.front() {
            let starts_request = matches!(
                event,
                InboundEvent::Request { .. } | InboundEvent::Malformed { .. }
            );
            if starts_request && !self.active_tours.is_empty() {
                tracing::trace!(ship = %self.core.ship_id(), queued = self.pending.len(), "request waits for the previous tour");
                return Ok(next.merge(NextAction::Suspend));
            }
            let Some(event) = self.pending.pop_front() else {
                break;
            };
            let action = match event {
                InboundEvent::Request { req_key, head } => {
                    self.start_request(req_key, head, mux, stores)?
                }
                InboundEvent::Content { req_key, data } => {
                    self.post_content(req_key, data, mux, stores)?
                }
                InboundEvent::EndOfRequest { req_key } => {
                    self.end_request(req_key, mux, stores)?
                }
                InboundEvent::Malformed { status, reason } => {
                    self.answer_malformed(status, &reason, mux)?
                }
            };
            next = next.merge(action);
            if next == NextAction::Close {
                self.pending.clear();
                break;
            }
        }
        Ok(next)
    }

    pub fn notify_eof(&mut self) -> NextAction {
        tracing::debug!(ship = %self.core.ship_id(), "client closed its side");
        NextAction::Close
    }

    pub fn notify_error(&mut self, err: &io::Error) -> Result<()> {
        tracing::debug!(ship = %self.core.ship_id(), "connection error: {}", err);
        Ok(())
    }

    /// Answer a protocol fault. Returns true if the connection stays open.
    pub fn notify_protocol_error(&mut self, err: &Error, mux: &mut Multiplexer) -> Result<bool> {
        let rudder = self.core.rudder()?;
        let handler = self.handler_mut()?;
        let lenient = handler.lenient();
        let response = handler.error_response(err.to_http_status());
        if lenient {
            handler.reset();
        }
        mux.write(rudder, response)?;
        Ok(lenient)
    }

    fn answer_malformed(&mut self, status: u16, reason: &str, mux: &mut Multiplexer) -> Result<NextAction> {
        let rudder = self.core.rudder()?;
        tracing::debug!(ship = %self.core.ship_id(), status, "malformed request: {}", reason);
        let handler = self.handler_mut()?;
        let lenient = handler.lenient();
        mux.write(rudder, handler.error_response(status))?;
        if lenient {
            return Ok(NextAction::Continue);
        }
        mux.req_end(rudder)?;
        Ok(NextAction::Close)
    }

    /// The connection is gone: abort every tour. Tours still draining an
    /// upstream stay until they return themselves.
    pub fn notify_close(&mut self, stores: &mut AgentStores) -> Result<()> {
        self.core.ensure_initialized()?;
        self.pending.clear();
        for key in self.active_tours.clone() {
            let Some(tour) = stores.tours.get_mut(key) else {
                continue;
            };
            if tour.req_abort(IdCheck::NoCheck)? {
                self.return_tour(key, &mut stores.tours)?;
            }
        }
        if self.active_tours.is_empty() {
            self.core.request_release();
        } else {
            tracing::debug!(
                ship = %self.core.ship_id(),
                draining = self.active_tours.len(),
                "connection closed with zombie tours"
            );
            self.need_end = true;
        }
        Ok(())
    }

    // =========================================================================
    // Request flow
    // =========================================================================

    fn start_request(
        &mut self,
        req_key: u16,
        head: RequestHead,
        mux: &mut Multiplexer,
        stores: &mut AgentStores,
    ) -> Result<NextAction> {
        self.core.set_keeping(false);
        let Some(key) = self.get_tour(&mut stores.tours, req_key, false, true)? else {
            tracing::warn!(
                ship = %self.core.ship_id(),
                uri = %head.uri,
                "tour store exhausted, refusing request"
            );
            let rudder = self.core.rudder()?;
            let refusal = self.handler_mut()?.error_response(503);
            mux.write(rudder, refusal)?;
            mux.req_end(rudder)?;
            return Ok(NextAction::Close);
        };

        let tour = stores
            .tours
            .get_mut(key)
            .ok_or_else(|| Error::sink(format!("rented tour {} vanished", key)))?;
        tour.req.apply(head);
        tour.go(IdCheck::NoCheck)?;
        tracing::debug!(tour = %tour.tour_id(), key = %key, method = %tour.req.method, uri = %tour.req.uri, "tour started");

        if let Err(e) = self.route(key, mux, stores) {
            self.answer_error(key, e, stores)?;
        }
        self.flush_tour(key, mux, stores)
    }

    fn route(&mut self, key: TourKey, mux: &mut Multiplexer, stores: &mut AgentStores) -> Result<()> {
        let port = self
            .port
            .clone()
            .ok_or_else(|| Error::sink("inbound ship has no port"))?;
        let origin = self.ship_ref();
        let tour = stores
            .tours
            .get_mut(key)
            .ok_or_else(|| Error::sink(format!("tour {} vanished", key)))?;
        let city = port
            .find_city(&tour.req.host)
            .ok_or_else(|| Error::http(404, format!("no city for host {:?}", tour.req.host)))?;
        let club = city
            .find_club(&tour.req.uri)
            .ok_or_else(|| Error::http(404, format!("no club for {}", tour.req.uri)))?;
        tour.set_club(Arc::clone(&club));

        match club.arrive(tour)? {
            Arrival::Served => Ok(()),
            Arrival::Warp(target) => stores.start_warp(&target, origin, key, mux),
        }
    }

    fn post_content(
        &mut self,
        req_key: u16,
        data: Bytes,
        mux: &mut Multiplexer,
        stores: &mut AgentStores,
    ) -> Result<NextAction> {
        let Some(key) = self.get_tour(&mut stores.tours, req_key, false, false)? else {
            // already answered; the rest of the body is dropped
            return Ok(NextAction::Continue);
        };
        let tour = stores
            .tours
            .get_mut(key)
            .ok_or_else(|| Error::sink(format!("tour {} vanished", key)))?;
        if !tour.is_running() {
            return Ok(NextAction::Continue);
        }

        let len = data.len();
        if let Some(warp) = tour.warp() {
            tour.req.received += len;
            let credit = tour.req.credit.clone();
            let room = credit.acquire(len);
            let letters = mux.letters();
            let rudder = self.core.rudder()?;
            let on_done: WriteCallback = Box::new(move |_: &io::Result<usize>| {
                if credit.release(len) {
                    let _ = letters.send(Letter::Resume { rudder });
                }
            });
            stores.post_warp(warp, data, Some(on_done), mux)?;
            return Ok(if room {
                NextAction::Continue
            } else {
                NextAction::Suspend
            });
        }

        let club = tour
            .club()
            .ok_or_else(|| Error::sink(format!("running tour {} has no club", key)))?;
        if let Err(e) = club.content(tour, data) {
            self.answer_error(key, e, stores)?;
        }
        self.flush_tour(key, mux, stores)
    }

    fn end_request(
        &mut self,
        req_key: u16,
        mux: &mut Multiplexer,
        stores: &mut AgentStores,
    ) -> Result<NextAction> {
        let Some(key) = self.get_tour(&mut stores.tours, req_key, false, false)? else {
            return Ok(NextAction::Continue);
        };
        let tour = stores
            .tours
            .get_mut(key)
            .ok_or_else(|| Error::sink(format!("tour {} vanished", key)))?;
        if tour.warp().is_some() || !tour.is_running() {
            tour.req.ended = true;
            return Ok(NextAction::Continue);
        }
        let club = tour
            .club()
            .ok_or_else(|| Error::sink(format!("running tour {} has no club", key)))?;
        if let Err(e) = club.end_content(tour) {
            self.answer_error(key, e, stores)?;
        }
        self.flush_tour(key, mux, stores)
    }

    /// Convert a non-fatal error into an error response on the tour.
    fn answer_error(&mut self, key: TourKey, err: Error, stores: &mut AgentStores) -> Result<()> {
        if err.is_fatal() {
            return Err(err);
        }
        let status = err.to_http_status();
        tracing::debug!(key = %key, status, "request failed: {}", err);
        match stores.tours.get_mut(key) {
            Some(tour) => tour.res.send_error(status, reason_phrase(status)),
            None => Ok(()),
        }
    }

    /// Encode and write what the tour has produced. When the response is
    /// complete the tour is logged and returned, and the connection either
    /// waits for the next request or ends.
    pub fn flush_tour(
        &mut self,
        key: TourKey,
        mux: &mut Multiplexer,
        stores: &mut AgentStores,
    ) -> Result<NextAction> {
        let rudder = self.core.rudder()?;
        let Some(tour) = stores.tours.get_mut(key) else {
            return Ok(NextAction::Continue);
        };
        let parts = tour.res.take_parts();
        let discard = self.need_end || tour.is_zombie() || tour.is_aborted();

        let handler = self
            .handler
            .as_deref_mut()
            .ok_or_else(|| Error::sink("inbound ship has no handler"))?;
        if !discard && !parts.is_empty() {
            let mut out = BytesMut::new();
            for part in &parts {
                handler.encode(part, tour, &mut out)?;
            }
            if !out.is_empty() {
                mux.write(rudder, out.freeze())?;
            }
        }
        if !tour.res.is_ended() {
            return Ok(NextAction::Continue);
        }

        let keep_alive = !discard && handler.keep_alive(tour);
        tour.finish()?;
        if tour.is_ended() {
            stores.logger.log(tour);
        }
        self.return_tour(key, &mut stores.tours)?;

        if self.need_end {
            return Ok(NextAction::Continue);
        }
        if keep_alive {
            if self.active_tours.is_empty() {
                self.core.set_keeping(true);
                if !self.pending.is_empty() && !self.draining {
                    let _ = mux.letters().send(Letter::Resume { rudder });
                }
            }
            Ok(NextAction::Continue)
        } else {
            mux.req_end(rudder)?;
            Ok(NextAction::Close)
        }
    }
}

impl Reusable for InboundShip {
    fn reset(&mut self) -> Result<()> {
        if !self.active_tours.is_empty() {
            return Err(Error::sink(format!(
                "inbound ship {} recycled with {} active tours",
                self.core.ship_id(),
                self.active_tours.len()
            )));
        }
        self.core.reset();
        self.port = None;
        self.handler = None;
        self.pending.clear();
        self.draining = false;
        self.need_end = false;
        self.peer = None;
        self.buffer_limit = 0;
        Ok(())
    }
}
