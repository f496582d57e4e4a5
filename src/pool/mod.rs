//! Free-list object pools.
//!
//! `ObjectStore<T>` is an arena of reusable objects addressed by `ObjectId`.
//! Objects are created on demand, never dropped while the store lives, and
//! recycled through a free list. Ships and tours are kept here and every
//! other component refers to them by id.
//!
//! An active object can be *checked out* (moved out of its slot) while it is
//! being driven, so that it can borrow the rest of the agent's stores at the
//! same time. It must be checked back in before it can be returned.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Error, ObjectId, Result};

/// Objects that can be recycled by an `ObjectStore`.
pub trait Reusable {
    /// Return the object to its idle shape. Failing keeps it active.
    fn reset(&mut self) -> Result<()>;
}

/// Counters reported by `printUsage`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub name: String,
    pub active: usize,
    pub free: usize,
}

impl fmt::Display for PoolUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: active={} free={}", self.name, self.active, self.free)
    }
}

/// Free-list pool of reusable objects.
#[derive(Debug)]
pub struct ObjectStore<T> {
    name: &'static str,
    slots: Vec<Option<T>>,
    free: Vec<ObjectId>,
    active: HashSet<ObjectId>,
    factory: fn(ObjectId) -> T,
}

impl<T: Reusable> ObjectStore<T> {
    pub fn new(name: &'static str, factory: fn(ObjectId) -> T) -> Self {
        Self {
            name,
            slots: Vec::new(),
            free: Vec::new(),
            active: HashSet::new(),
            factory,
        }
    }

    /// Lease an object, reusing a free one when possible.
    pub fn rent(&mut self) -> Result<ObjectId> {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let id = ObjectId::new(self.slots.len());
                self.slots.push(Some((self.factory)(id)));
                id
            }
        };
        if !self.active.insert(id) {
            return Err(Error::sink(format!(
                "{}: object {} rented while still active",
                self.name, id
            )));
        }
        Ok(id)
    }

    /// Give an object back. Returning an object that is not active (never
    /// rented, or already returned) is an invariant violation.
    pub fn return_object(&mut self, id: ObjectId) -> Result<()> {
        if !self.active.contains(&id) {
            return Err(Error::sink(format!(
                "{}: returned object {} is not active",
                self.name, id
            )));
        }
        let object = self
            .slots
            .get_mut(id.get())
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                Error::sink(format!(
                    "{}: returned object {} is checked out",
                    self.name, id
                ))
            })?;
        object.reset()?;
        self.active.remove(&id);
        self.free.push(id);
        Ok(())
    }

    /// Move an active object out of its slot.
    pub fn checkout(&mut self, id: ObjectId) -> Result<T> {
        if !self.active.contains(&id) {
            return Err(Error::sink(format!(
                "{}: object {} is not active",
                self.name, id
            )));
        }
        self.slots
            .get_mut(id.get())
            .and_then(Option::take)
            .ok_or_else(|| Error::sink(format!("{}: object {} already checked out", self.name, id)))
    }

    /// Put a checked-out object back into its slot.
    pub fn checkin(&mut self, id: ObjectId, object: T) -> Result<()> {
        match self.slots.get_mut(id.get()) {
            Some(slot) if slot.is_none() => {
                *slot = Some(object);
                Ok(())
            }
            _ => Err(Error::sink(format!(
                "{}: object {} was not checked out",
                self.name, id
            ))),
        }
    }

    pub fn get(&self, id: ObjectId) -> Option<&T> {
        if !self.active.contains(&id) {
            return None;
        }
        self.slots.get(id.get()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut T> {
        if !self.active.contains(&id) {
            return None;
        }
        self.slots.get_mut(id.get()).and_then(Option::as_mut)
    }

    pub fn is_active(&self, id: ObjectId) -> bool {
        self.active.contains(&id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn active_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.active.iter().copied().collect();
        ids.sort();
        ids
    }

    pub fn usage(&self) -> PoolUsage {
        PoolUsage {
            name: self.name.to_string(),
            active: self.active.len(),
            free: self.free.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug)]
    struct Packet {
        id: ObjectId,
        len: usize,
        pinned: bool,
    }

    impl Packet {
        fn new(id: ObjectId) -> Self {
            Self {
                id,
                len: 0,
                pinned: false,
            }
        }
    }

    impl Reusable for Packet {
        fn reset(&mut self) -> Result<()> {
            if self.pinned {
                return Err(Error::sink("packet still pinned"));
            }
            self.len = 0;
            Ok(())
        }
    }

    fn store() -> ObjectStore<Packet> {
        ObjectStore::new("packet", Packet::new)
    }

    #[test]
    fn reuses_returned_objects() {
        let mut store = store();
        let a = store.rent().unwrap();
        store.get_mut(a).unwrap().len = 42;
        store.return_object(a).unwrap();

        let b = store.rent().unwrap();
        assert_eq!(a, b);
        assert_eq!(store.get(b).unwrap().len, 0);
        assert_eq!(store.get(b).unwrap().id, b);
    }

    #[test]
    fn double_return_is_rejected() {
        let mut store = store();
        let a = store.rent().unwrap();
        store.return_object(a).unwrap();
        let err = store.return_object(a).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn returning_unknown_object_is_rejected() {
        let mut store = store();
        assert!(store.return_object(ObjectId::new(7)).is_err());
    }

    #[test]
    fn failed_reset_keeps_object_active() {
        let mut store = store();
        let a = store.rent().unwrap();
        store.get_mut(a).unwrap().pinned = true;
        assert!(store.return_object(a).is_err());
        assert!(store.is_active(a));

        store.get_mut(a).unwrap().pinned = false;
        store.return_object(a).unwrap();
        assert!(!store.is_active(a));
    }

    #[test]
    fn checkout_and_checkin() {
        let mut store = store();
        let a = store.rent().unwrap();
        let packet = store.checkout(a).unwrap();
        assert!(store.get(a).is_none());
        assert!(store.checkout(a).is_err());
        assert!(store.return_object(a).is_err());
        store.checkin(a, packet).unwrap();
        assert!(store.get(a).is_some());
        assert!(store.checkin(a, Packet::new(a)).is_err());
    }

    #[test]
    fn usage_counts() {
        let mut store = store();
        let a = store.rent().unwrap();
        let _b = store.rent().unwrap();
        store.return_object(a).unwrap();
        let usage = store.usage();
        assert_eq!(usage.active, 1);
        assert_eq!(usage.free, 1);
        assert_eq!(usage.to_string(), "packet: active=1 free=1");
    }

    proptest! {
        #[test]
        fn rent_never_yields_an_active_object(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
            let mut store = store();
            let mut held: Vec<ObjectId> = Vec::new();
            for rent in ops {
                if rent || held.is_empty() {
                    let id = store.rent().unwrap();
                    prop_assert!(!held.contains(&id));
                    held.push(id);
                } else {
                    let id = held.remove(held.len() / 2);
                    store.return_object(id).unwrap();
                }
                prop_assert_eq!(store.active_count(), held.len());
            }
        }
    }
}
