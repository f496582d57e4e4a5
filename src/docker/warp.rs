use super::{Arrival, Club, WarpTarget};
use crate::tour::Tour;
use crate::types::{Result, WarpConfig};

/// Relays requests to an upstream HTTP/1.x server.
#[derive(Debug, Clone)]
pub struct WarpClub {
    target: WarpTarget,
}

impl WarpClub {
    pub fn new(upstream: impl Into<String>, timeout_secs: i64) -> Self {
        Self {
            target: WarpTarget {
                upstream: upstream.into(),
                timeout_secs,
            },
        }
    }

    pub fn from_config(config: &WarpConfig) -> Self {
        Self::new(config.upstream.clone(), config.timeout_secs)
    }

    pub fn target(&self) -> &WarpTarget {
        &self.target
    }
}

impl Club for WarpClub {
    fn name(&self) -> &str {
        "warp"
    }

    fn arrive(&self, _tour: &mut Tour) -> Result<Arrival> {
        Ok(Arrival::Warp(self.target.clone()))
    }
}
