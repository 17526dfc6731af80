//! Address → tunnel routing table
//!
//! Exclusive ownership: at most one tunnel is bound under any address at any
//! time, first-bound wins. Unbinding is conditional on the caller still being
//! the registered owner, so the teardown of a stale connection can never
//! evict the address binding of the tunnel that replaced it.

use crate::tunnel::Tunnel;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use osaurus_proto::AgentAddress;
use std::sync::Arc;
use tracing::debug;

/// Process-wide routing table: addresses and live tunnels.
pub struct TunnelRegistry {
    by_address: DashMap<AgentAddress, Arc<Tunnel>>,
    by_tunnel: DashMap<String, Arc<Tunnel>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            by_address: DashMap::new(),
            by_tunnel: DashMap::new(),
        }
    }

    /// Track an authenticated tunnel.
    pub fn attach(&self, tunnel: &Arc<Tunnel>) {
        self.by_tunnel
            .insert(tunnel.id().to_string(), tunnel.clone());
    }

    /// Stop tracking a tunnel (part of teardown).
    pub fn detach(&self, tunnel: &Tunnel) {
        self.by_tunnel.remove(tunnel.id());
    }

    /// Bind `address` to `tunnel` and add it to the tunnel's owned set.
    ///
    /// Returns `false` without any change when the address is already bound
    /// to a different tunnel.
    pub fn register(&self, tunnel: &Arc<Tunnel>, address: AgentAddress) -> bool {
        match self.by_address.entry(address.clone()) {
            Entry::Occupied(slot) => {
                if slot.get().id() == tunnel.id() {
                    // Already ours; keep the owned set consistent.
                    tunnel.add_agent_local(address);
                    true
                } else {
                    debug!(%address, "address already bound to another tunnel");
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(tunnel.clone());
                tunnel.add_agent_local(address);
                true
            }
        }
    }

    /// Remove `address` from the tunnel's owned set, and drop the address
    /// binding only if it still points at this tunnel.
    pub fn unregister(&self, tunnel: &Tunnel, address: &AgentAddress) {
        tunnel.remove_agent_local(address);
        self.by_address
            .remove_if(address, |_, bound| bound.id() == tunnel.id());
    }

    /// The tunnel currently serving `address`, if any.
    pub fn lookup(&self, address: &AgentAddress) -> Option<Arc<Tunnel>> {
        self.by_address.get(address).map(|slot| slot.value().clone())
    }

    pub fn active_tunnels(&self) -> usize {
        self.by_tunnel.len()
    }

    pub fn active_agents(&self) -> usize {
        self.by_address.len()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
