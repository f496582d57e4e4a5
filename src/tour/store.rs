//! Per-agent tour pool with admission control.

use std::collections::HashMap;

use super::Tour;
use crate::pool::{ObjectStore, PoolUsage};
use crate::types::{Error, ObjectId, Result, TourId, TourKey};

/// Pool of tours keyed by `TourKey`.
///
/// `max_count` caps the number of simultaneously active tours; a non-forced
/// rent beyond it reports "no capacity" instead of queueing.
#[derive(Debug)]
pub struct TourStore {
    pool: ObjectStore<Tour>,
    active: HashMap<TourKey, ObjectId>,
    max_count: usize,
    last_tour_id: u32,
}

impl TourStore {
    pub fn new(max_count: usize) -> Self {
        Self {
            pool: ObjectStore::new("tour", Tour::new),
            active: HashMap::new(),
            max_count,
            last_tour_id: 0,
        }
    }

    /// Lease a tour for `key`.
    ///
    /// Returns `Ok(None)` when `force` is false and the store is at capacity.
    /// Renting a key that is already active is an invariant violation.
    pub fn rent(&mut self, key: TourKey, force: bool) -> Result<Option<&mut Tour>> {
        if self.active.contains_key(&key) {
            return Err(Error::sink(format!("tour key {} rented twice", key)));
        }
        if !force && self.active.len() >= self.max_count {
            tracing::debug!(key = %key, max = self.max_count, "tour store at capacity");
            return Ok(None);
        }

        let id = self.pool.rent()?;
        self.active.insert(key, id);
        let tour_id = self.next_tour_id();
        let tour = self
            .pool
            .get_mut(id)
            .ok_or_else(|| Error::sink(format!("rented tour {} vanished", id)))?;
        tour.assign(tour_id, key);
        Ok(Some(tour))
    }

    /// Give back the tour leased for `key`.
    pub fn return_tour(&mut self, key: TourKey) -> Result<()> {
        let id = self
            .active
            .remove(&key)
            .ok_or_else(|| Error::sink(format!("returned tour key {} is not active", key)))?;
        self.pool.return_object(id)
    }

    pub fn get(&self, key: TourKey) -> Option<&Tour> {
        self.active.get(&key).and_then(|id| self.pool.get(*id))
    }

    pub fn get_mut(&mut self, key: TourKey) -> Option<&mut Tour> {
        let id = *self.active.get(&key)?;
        self.pool.get_mut(id)
    }

    pub fn contains(&self, key: TourKey) -> bool {
        self.active.contains_key(&key)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn usage(&self) -> PoolUsage {
        self.pool.usage()
    }

    fn next_tour_id(&mut self) -> TourId {
        self.last_tour_id = self.last_tour_id.wrapping_add(1);
        if self.last_tour_id == 0 {
            self.last_tour_id = 1;
        }
        TourId::new(self.last_tour_id)
    }
}
