use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::bail;
use anyhow::Result;
use tracing::error;

use crate::models::peer::session::PeerSession;
use crate::models::peer::PeerId;

#[derive(Debug, Clone)]
struct RegisteredPeer {
    session: Arc<PeerSession>,

    /// Outbound group the peer was counted in when it was registered, so that
    /// removal decrements exactly the counter that was incremented.
    group: Option<String>,
}

/// Connected peers, banned hosts and outbound group counts.
///
/// Owned by the router; nothing else mutates it.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    inbound: HashMap<PeerId, RegisteredPeer>,
    outbound: HashMap<PeerId, RegisteredPeer>,
    persistent: HashMap<PeerId, RegisteredPeer>,
    banned: HashMap<IpAddr, SystemTime>,
    outbound_groups: HashMap<String, usize>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connected peers across all three maps.
    pub fn count(&self) -> usize {
        self.inbound.len() + self.outbound.len() + self.persistent.len()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.inbound.contains_key(&id)
            || self.outbound.contains_key(&id)
            || self.persistent.contains_key(&id)
    }

    fn map_for(&mut self, session: &PeerSession) -> &mut HashMap<PeerId, RegisteredPeer> {
        if session.is_inbound() {
            &mut self.inbound
        } else if session.is_persistent() {
            &mut self.persistent
        } else {
            &mut self.outbound
        }
    }

    /// Register a session. Outbound sessions are counted in `group`.
    ///
    /// Returns false if a session with the same id is already registered.
    pub fn insert(&mut self, session: Arc<PeerSession>, group: Option<String>) -> bool {
        if self.contains(session.id()) {
            return false;
        }

        let group = if session.is_inbound() { None } else { group };
        if let Some(key) = &group {
            *self.outbound_groups.entry(key.clone()).or_default() += 1;
        }

        let id = session.id();
        self.map_for(&session)
            .insert(id, RegisteredPeer { session, group });
        true
    }

    /// Unregister the session with `id`, wherever it is. Decrements the
    /// group it was counted in, if any.
    pub fn remove(&mut self, id: PeerId) -> Option<Arc<PeerSession>> {
        let removed = self
            .inbound
            .remove(&id)
            .or_else(|| self.outbound.remove(&id))
            .or_else(|| self.persistent.remove(&id))?;

        if let Some(key) = &removed.group {
            self.decrement_group(key);
        }

        Some(removed.session)
    }

    fn decrement_group(&mut self, key: &str) {
        match self.outbound_groups.get_mut(key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.outbound_groups.remove(key);
            }
            None => error!("Outbound group {key} decremented below zero"),
        }
    }

    pub fn outbound_group_count(&self, key: &str) -> usize {
        self.outbound_groups.get(key).copied().unwrap_or(0)
    }

    /// All connected sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PeerSession>> {
        self.inbound
            .values()
            .chain(self.outbound.values())
            .chain(self.persistent.values())
            .map(|peer| &peer.session)
    }

    pub fn inbound(&self) -> impl Iterator<Item = &Arc<PeerSession>> {
        self.inbound.values().map(|peer| &peer.session)
    }

    /// Outbound sessions that are not persistent.
    pub fn outbound(&self) -> impl Iterator<Item = &Arc<PeerSession>> {
        self.outbound.values().map(|peer| &peer.session)
    }

    pub fn persistent(&self) -> impl Iterator<Item = &Arc<PeerSession>> {
        self.persistent.values().map(|peer| &peer.session)
    }

    pub fn ban(&mut self, host: IpAddr, until: SystemTime) {
        self.banned.insert(host, until);
    }

    pub fn ban_expiry(&self, host: &IpAddr) -> Option<SystemTime> {
        self.banned.get(host).copied()
    }

    pub fn unban(&mut self, host: &IpAddr) {
        self.banned.remove(host);
    }

    /// Verify that no peer is registered twice and that the group counters
    /// agree with the registered peers.
    pub fn check_invariants(&self) -> Result<()> {
        let maps = [&self.inbound, &self.outbound, &self.persistent];
        for (i, map) in maps.iter().enumerate() {
            for other in maps.iter().skip(i + 1) {
                if let Some(id) = map.keys().find(|id| other.contains_key(id)) {
                    bail!("Peer {id} is registered in more than one map");
                }
            }
        }

        let mut expected: HashMap<&str, usize> = HashMap::new();
        for key in maps
            .iter()
            .flat_map(|map| map.values())
            .filter_map(|peer| peer.group.as_deref())
        {
            *expected.entry(key).or_default() += 1;
        }
        let actual: HashMap<&str, usize> = self
            .outbound_groups
            .iter()
            .map(|(key, count)| (key.as_str(), *count))
            .collect();
        if expected != actual {
            bail!("Outbound group counts {actual:?} do not match registered peers {expected:?}");
        }

        Ok(())
    }
}
