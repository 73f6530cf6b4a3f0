//! Known peers and their display names
//!
//! [`PeerDirectory`] is owned by the discovery subsystem; the UI side gets
//! a shared handle with read and rename access. Peers are never removed
//! here, pruning is the consumer's business.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::RwLock;

/// A discovered device on the local network.
///
/// Identity is the address alone: two records with the same address are
/// the same peer no matter what they are called.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: IpAddr,
    pub name: Option<String>,
}

impl PeerInfo {
    pub fn new(address: IpAddr, name: Option<&str>) -> Self {
        Self {
            address,
            name: normalize(name),
        }
    }

    /// Replace the display name; empty and whitespace-only mean "none".
    pub fn set_name(&mut self, name: Option<&str>) {
        self.name = normalize(name);
    }
}

fn normalize(name: Option<&str>) -> Option<String> {
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

impl PartialEq for PeerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for PeerInfo {}

impl Hash for PeerInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Set of known peers keyed by address.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<IpAddr, PeerInfo>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting of `address`. A fresh name updates the existing
    /// record in place; a nameless sighting keeps whatever name is known.
    /// Returns `true` when the peer was not seen before.
    pub fn upsert(&self, address: IpAddr, name: Option<&str>) -> bool {
        let mut peers = self.peers.write().expect("peer directory lock poisoned");
        match peers.get_mut(&address) {
            Some(existing) => {
                if let Some(name) = normalize(name) {
                    existing.name = Some(name);
                }
                false
            }
            None => {
                peers.insert(address, PeerInfo::new(address, name));
                true
            }
        }
    }

    /// Local rename override; unlike [`upsert`](Self::upsert), `None`
    /// clears the name.
    pub fn rename(&self, address: IpAddr, name: Option<&str>) -> bool {
        let mut peers = self.peers.write().expect("peer directory lock poisoned");
        match peers.get_mut(&address) {
            Some(peer) => {
                peer.set_name(name);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, address: IpAddr) -> Option<PeerInfo> {
        self.peers
            .read()
            .expect("peer directory lock poisoned")
            .get(&address)
            .cloned()
    }

    /// All known peers, in no particular order.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .expect("peer directory lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().expect("peer directory lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
