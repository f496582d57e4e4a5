//! Strongly-typed identifiers.
//!
//! Every handle that crosses a module boundary is a small copyable newtype so
//! a ship id can never be passed where a tour id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a numeric ID newtype wrapper.
///
/// Generates: struct, `new()`, `get()`, Display, Serialize, Deserialize.
macro_rules! define_id {
    ($name:ident, $inner:ty) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name($inner);

        impl $name {
            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(AgentId, i32);
define_id!(RudderId, u64);
define_id!(ObjectId, usize);
define_id!(ShipId, u32);
define_id!(TourId, u32);

impl AgentId {
    /// Sentinel for "not yet assigned".
    pub const UNASSIGNED: AgentId = AgentId(-1);

    pub fn is_assigned(self) -> bool {
        self.0 >= 0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::UNASSIGNED
    }
}

impl ShipId {
    /// Ship id of an idle (pooled) ship.
    pub const IDLE: ShipId = ShipId(0);
}

impl TourId {
    /// Tour id of an uninitialized tour.
    pub const INVALID: TourId = TourId(0);
}

/// Key of an active tour: owning ship id in the high bits, the
/// request-scoped key (stream id, request counter) in the low 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TourKey(u64);

impl TourKey {
    pub const fn new(ship_id: ShipId, req_key: u16) -> Self {
        Self(((ship_id.get() as u64) << 16) | req_key as u64)
    }

    pub const fn ship_id(self) -> ShipId {
        ShipId::new((self.0 >> 16) as u32)
    }

    pub const fn req_key(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Display for TourKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.ship_id(), self.req_key())
    }
}
