//! Replica membership of a partition, as seen by repair.

use parking_lot::RwLock;
use rfix_types::HaType;

/// Source of the peers to reconcile against.
///
/// Consulted once per fragment attempt, so membership changes take effect on
/// the next attempt.
pub trait Topology: Send + Sync {
    fn remote_hosts(&self) -> Vec<String>;
    fn ha_type(&self) -> HaType;
}

/// Fixed membership that can be replaced at runtime.
#[derive(Debug, Default)]
pub struct StaticTopology {
    inner: RwLock<(Vec<String>, HaType)>,
}

impl StaticTopology {
    #[must_use]
    pub fn new(hosts: Vec<String>, ha_type: HaType) -> Self {
        Self {
            inner: RwLock::new((hosts, ha_type)),
        }
    }

    pub fn set_hosts(&self, hosts: Vec<String>) {
        self.inner.write().0 = hosts;
    }

    pub fn set_ha_type(&self, ha_type: HaType) {
        self.inner.write().1 = ha_type;
    }
}

impl Topology for StaticTopology {
    fn remote_hosts(&self) -> Vec<String> {
        self.inner.read().0.clone()
    }

    fn ha_type(&self) -> HaType {
        self.inner.read().1
    }
}
