//! Tours: pooled per-request actors.
//!
//! A tour carries one request (`req`) and its response (`res`) through the
//! club that serves it. Tours are leased from the per-agent `TourStore` and
//! every state change goes through `Tour::change_state`, which re-checks the
//! caller's tour id so a stale handle to a recycled tour is caught.

mod req;
mod res;
mod store;

pub use req::{ContentCredit, RequestHead, TourReq};
pub use res::{ResPart, TourRes};
pub use store::TourStore;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::docker::Club;
use crate::pool::Reusable;
use crate::types::{Error, ObjectId, Result, RudderId, ShipId, TourId, TourKey};

/// Tour lifecycle state.
///
/// State transitions:
/// ```text
/// UNINITIALIZED → PREPARING → RUNNING → ENDED
///                     ↓          ↓  ↘
///                  ABORTED ← ── ┘   ZOMBIE → ENDED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TourState {
    Uninitialized,
    Preparing,
    Running,
    Aborted,
    Ended,
    Zombie,
}

impl TourState {
    /// Check if transition is valid.
    pub fn can_transition_to(self, to: TourState) -> bool {
        match (self, to) {
            (TourState::Uninitialized, TourState::Preparing) => true,
            // PREPARING
            (TourState::Preparing, TourState::Running) => true,
            (TourState::Preparing, TourState::Aborted) => true,
            (TourState::Preparing, TourState::Ended) => true, // rejected before go
            // RUNNING
            (TourState::Running, TourState::Ended) => true,
            (TourState::Running, TourState::Aborted) => true,
            (TourState::Running, TourState::Zombie) => true, // connection died, draining
            // ZOMBIE
            (TourState::Zombie, TourState::Ended) => true,
            _ => false,
        }
    }

    /// Check if the tour still owns its request.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TourState::Preparing | TourState::Running | TourState::Zombie
        )
    }
}

/// Tour id check passed to guarded operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdCheck {
    /// The caller's remembered tour id must match.
    Exact(TourId),
    /// Owning infrastructure only.
    NoCheck,
}

/// Pooled per-request actor.
#[derive(Debug)]
pub struct Tour {
    object_id: ObjectId,
    tour_id: TourId,
    key: Option<TourKey>,
    ship_id: ShipId,
    ship_object: Option<ObjectId>,
    rudder: Option<RudderId>,
    state: TourState,
    started_at: Option<Instant>,
    club: Option<Arc<dyn Club>>,
    warp: Option<ObjectId>,

    pub req: TourReq,
    pub res: TourRes,
}

impl Tour {
    pub fn new(object_id: ObjectId) -> Self {
        Self {
            object_id,
            tour_id: TourId::INVALID,
            key: None,
            ship_id: ShipId::IDLE,
            ship_object: None,
            rudder: None,
            state: TourState::Uninitialized,
            started_at: None,
            club: None,
            warp: None,
            req: TourReq::default(),
            res: TourRes::default(),
        }
    }

    /// Called by the store when the tour is leased.
    pub(crate) fn assign(&mut self, tour_id: TourId, key: TourKey) {
        self.tour_id = tour_id;
        self.key = Some(key);
    }

    /// Bind the leased tour to its inbound ship. UNINITIALIZED → PREPARING.
    pub fn init(
        &mut self,
        ship_object: ObjectId,
        rudder: RudderId,
        remote: Option<SocketAddr>,
        secure: bool,
        buffer_limit: usize,
    ) -> Result<()> {
        let key = self
            .key
            .ok_or_else(|| Error::sink(format!("tour {} initialized before rent", self.object_id)))?;
        self.change_state(IdCheck::NoCheck, TourState::Preparing)?;
        self.ship_id = key.ship_id();
        self.ship_object = Some(ship_object);
        self.rudder = Some(rudder);
        self.req.remote = remote;
        self.req.secure = secure;
        self.req.credit = ContentCredit::new(buffer_limit);
        Ok(())
    }

    /// PREPARING → RUNNING.
    pub fn go(&mut self, check: IdCheck) -> Result<()> {
        self.change_state(check, TourState::Running)?;
        self.started_at = Some(Instant::now());
        Ok(())
    }

    /// Single guarded setter for every state change.
    pub fn change_state(&mut self, check: IdCheck, to: TourState) -> Result<()> {
        self.check_id(check)?;
        if !self.state.can_transition_to(to) {
            return Err(Error::sink(format!(
                "tour {}: invalid transition {:?} -> {:?}",
                self.tour_id, self.state, to
            )));
        }
        tracing::trace!(tour = %self.tour_id, from = ?self.state, to = ?to, "tour state");
        self.state = to;
        Ok(())
    }

    pub fn check_id(&self, check: IdCheck) -> Result<()> {
        match check {
            IdCheck::NoCheck => Ok(()),
            IdCheck::Exact(id) if id == self.tour_id && self.state != TourState::Uninitialized => {
                Ok(())
            }
            IdCheck::Exact(id) => Err(Error::sink(format!(
                "stale tour reference: expected {}, tour is {}",
                id, self.tour_id
            ))),
        }
    }

    /// Ask the tour to stop because its connection is gone.
    ///
    /// Returns true if the tour can be returned right away. A running tour
    /// whose content is still being produced elsewhere (a warp upstream)
    /// becomes a zombie and is returned once draining finishes.
    pub fn req_abort(&mut self, check: IdCheck) -> Result<bool> {
        match self.state {
            TourState::Preparing => {
                self.change_state(check, TourState::Aborted)?;
                Ok(true)
            }
            TourState::Running if self.warp.is_some() => {
                self.change_state(check, TourState::Zombie)?;
                Ok(false)
            }
            TourState::Running => {
                self.change_state(check, TourState::Aborted)?;
                Ok(true)
            }
            TourState::Zombie => Ok(false),
            TourState::Aborted | TourState::Ended => Ok(true),
            TourState::Uninitialized => Err(Error::sink(format!(
                "abort requested on uninitialized tour {}",
                self.object_id
            ))),
        }
    }

    /// Mark the response complete. Aborted tours stay aborted.
    pub fn finish(&mut self) -> Result<()> {
        match self.state {
            TourState::Aborted | TourState::Ended => Ok(()),
            _ => self.change_state(IdCheck::NoCheck, TourState::Ended),
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn tour_id(&self) -> TourId {
        self.tour_id
    }

    pub fn key(&self) -> Option<TourKey> {
        self.key
    }

    pub fn ship_id(&self) -> ShipId {
        self.ship_id
    }

    pub fn ship_object(&self) -> Option<ObjectId> {
        self.ship_object
    }

    pub fn rudder(&self) -> Option<RudderId> {
        self.rudder
    }

    pub fn state(&self) -> TourState {
        self.state
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn is_preparing(&self) -> bool {
        self.state == TourState::Preparing
    }

    pub fn is_running(&self) -> bool {
        self.state == TourState::Running
    }

    pub fn is_zombie(&self) -> bool {
        self.state == TourState::Zombie
    }

    pub fn is_aborted(&self) -> bool {
        self.state == TourState::Aborted
    }

    pub fn is_ended(&self) -> bool {
        self.state == TourState::Ended
    }

    pub fn club(&self) -> Option<Arc<dyn Club>> {
        self.club.clone()
    }

    pub fn set_club(&mut self, club: Arc<dyn Club>) {
        self.club = Some(club);
    }

    /// Warp ship carrying this tour upstream, if any.
    pub fn warp(&self) -> Option<ObjectId> {
        self.warp
    }

    pub fn set_warp(&mut self, warp: ObjectId) {
        self.warp = Some(warp);
    }
}

impl Reusable for Tour {
    fn reset(&mut self) -> Result<()> {
        self.tour_id = TourId::INVALID;
        self.key = None;
        self.ship_id = ShipId::IDLE;
        self.ship_object = None;
        self.rudder = None;
        self.state = TourState::Uninitialized;
        self.started_at = None;
        self.club = None;
        self.warp = None;
        self.req.reset();
        self.res.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leased() -> Tour {
        let mut tour = Tour::new(ObjectId::new(0));
        tour.assign(TourId::new(5), TourKey::new(ShipId::new(9), 1));
        tour.init(ObjectId::new(3), RudderId::new(1), None, false, 1024)
            .unwrap();
        tour
    }

    #[test]
    fn happy_path() {
        let mut tour = leased();
        assert!(tour.is_preparing());
        assert_eq!(tour.ship_id(), ShipId::new(9));
        tour.go(IdCheck::Exact(TourId::new(5))).unwrap();
        assert!(tour.is_running());
        assert!(tour.started_at().is_some());
        tour.finish().unwrap();
        assert!(tour.is_ended());
    }

    #[test]
    fn stale_id_is_rejected() {
        let mut tour = leased();
        let err = tour.go(IdCheck::Exact(TourId::new(4))).unwrap_err();
        assert!(err.is_fatal());
        assert!(tour.is_preparing());
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut tour = leased();
        assert!(tour
            .change_state(IdCheck::NoCheck, TourState::Zombie)
            .is_err());
        tour.go(IdCheck::NoCheck).unwrap();
        assert!(tour.go(IdCheck::NoCheck).is_err());
    }

    #[test]
    fn init_before_rent_is_rejected() {
        let mut tour = Tour::new(ObjectId::new(0));
        assert!(tour
            .init(ObjectId::new(0), RudderId::new(1), None, false, 16)
            .is_err());
    }

    #[test]
    fn abort_of_warp_tour_becomes_zombie() {
        let mut tour = leased();
        tour.set_warp(ObjectId::new(2));
        tour.go(IdCheck::NoCheck).unwrap();
        assert!(!tour.req_abort(IdCheck::NoCheck).unwrap());
        assert!(tour.is_zombie());
        tour.finish().unwrap();
        assert!(tour.is_ended());
    }

    #[test]
    fn abort_of_local_tour_is_immediate() {
        let mut tour = leased();
        assert!(tour.req_abort(IdCheck::NoCheck).unwrap());
        assert!(tour.is_aborted());
        tour.finish().unwrap();
        assert!(tour.is_aborted());
    }

    #[test]
    fn reset_clears_identity() {
        let mut tour = leased();
        tour.reset().unwrap();
        assert_eq!(tour.state(), TourState::Uninitialized);
        assert_eq!(tour.tour_id(), TourId::INVALID);
        assert!(tour.check_id(IdCheck::Exact(TourId::INVALID)).is_err());
    }
}
