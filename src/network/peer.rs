//! Peer table for the relay
//!
//! Tracks every known remote peer, one record per peer id. Records are
//! created on first contact, merged in place on repeat contact and evicted
//! oldest-first once the table is full.
//!
//! Recipient selection is deliberately randomized (a shuffled window of the
//! closest peers) so an attacker cannot predict or monopolise a peer's
//! outbound gossip.

use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of tracked peers
pub const MAX_PEERS: usize = 4096;

/// Size of the closest-peer window that selection shuffles
pub const SELECTION_WINDOW: usize = 16;

/// Default number of recipients per selection
pub const DEFAULT_FANOUT: usize = 3;

// =============================================================================
// Errors
// =============================================================================

/// Peer admission errors
#[derive(Error, Debug, PartialEq)]
pub enum PeerError {
    #[error("Missing required peer field: {0}")]
    MissingField(&'static str),
}

// =============================================================================
// NAT Type
// =============================================================================

/// NAT behaviour of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    /// Not classified yet
    #[default]
    Unknown,
    /// Publicly reachable
    Static,
    /// NAT preserves the source port
    Easy,
    /// NAT remaps the port per destination
    Hard,
}

impl NatType {
    pub fn is_known(self) -> bool {
        self != NatType::Unknown
    }

    /// Static or easy: reachable on a predictable port
    pub fn is_easy(self) -> bool {
        matches!(self, NatType::Static | NatType::Easy)
    }

    pub fn is_hard(self) -> bool {
        self == NatType::Hard
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NatType::Unknown => "unknown",
            NatType::Static => "static",
            NatType::Easy => "easy",
            NatType::Hard => "hard",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Remote Peer
// =============================================================================

/// A known remote peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePeer {
    pub peer_id: String,
    pub address: String,
    pub port: u16,
    pub nat_type: NatType,
    pub cluster_id: Option<String>,
    /// Last correlation nonce this peer acknowledged
    pub ping_id: Option<String>,
    /// Responsiveness heuristic: `last_update - last_request`
    pub distance: i64,
    pub last_update: u64,
    pub last_request: u64,
    /// A hole punch towards this peer is in progress
    #[serde(skip)]
    pub connecting: bool,
}

impl RemotePeer {
    /// Construct a peer record, validating the required fields.
    ///
    /// Peers without a cluster are bootstrap contacts and default to static.
    pub fn new(
        peer_id: &str,
        address: &str,
        port: u16,
        cluster_id: Option<String>,
        nat_type: Option<NatType>,
        now: u64,
    ) -> Result<Self, PeerError> {
        if peer_id.is_empty() {
            return Err(PeerError::MissingField("peer_id"));
        }
        if address.is_empty() {
            return Err(PeerError::MissingField("address"));
        }
        if port == 0 {
            return Err(PeerError::MissingField("port"));
        }

        let default_nat = if cluster_id.is_none() {
            NatType::Static
        } else {
            NatType::Unknown
        };

        Ok(Self {
            peer_id: peer_id.to_string(),
            address: address.to_string(),
            port,
            nat_type: nat_type.unwrap_or(default_nat),
            cluster_id,
            ping_id: None,
            distance: 0,
            last_update: now,
            last_request: 0,
            connecting: false,
        })
    }

    pub fn is_at(&self, address: &str, port: u16) -> bool {
        self.address == address && self.port == port
    }

    /// Bootstrap contacts carry no cluster and are trusted
    pub fn is_trusted(&self) -> bool {
        self.cluster_id.is_none()
    }
}

// =============================================================================
// Peer Table
// =============================================================================

/// One record per peer id, bounded by `max_peers`
#[derive(Debug, Clone)]
pub struct PeerTable {
    peers: Vec<RemotePeer>,
    max_peers: usize,
}

impl PeerTable {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: Vec::new(),
            max_peers: max_peers.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.iter()
    }

    pub fn get(&self, peer_id: &str) -> Option<&RemotePeer> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut RemotePeer> {
        self.peers.iter_mut().find(|p| p.peer_id == peer_id)
    }

    pub fn find_at(&self, address: &str, port: u16) -> Option<&RemotePeer> {
        self.peers.iter().find(|p| p.is_at(address, port))
    }

    pub fn find_at_mut(&mut self, address: &str, port: u16) -> Option<&mut RemotePeer> {
        self.peers.iter_mut().find(|p| p.is_at(address, port))
    }

    pub fn find_by_ping_id_mut(&mut self, ping_id: &str) -> Option<&mut RemotePeer> {
        self.peers
            .iter_mut()
            .find(|p| p.ping_id.as_deref() == Some(ping_id))
    }

    /// Whether a trusted (cluster-less) peer is known at this address
    pub fn is_trusted_address(&self, address: &str) -> bool {
        self.peers
            .iter()
            .any(|p| p.address == address && p.is_trusted())
    }

    /// Insert a prepared record (seeds, restored state), replacing any with the same id
    pub fn insert(&mut self, peer: RemotePeer) {
        if let Some(existing) = self.get_mut(&peer.peer_id) {
            *existing = peer;
            return;
        }
        self.make_room();
        self.peers.push(peer);
    }

    pub fn retain<F: FnMut(&RemotePeer) -> bool>(&mut self, f: F) {
        self.peers.retain(f);
    }

    /// Create or merge the record for `peer_id`, observed at `address:port`.
    ///
    /// On repeat contact the distance heuristic is recomputed from the
    /// previous exchange before the timestamps move forward.
    pub fn upsert(
        &mut self,
        peer_id: &str,
        nat_type: Option<NatType>,
        cluster_id: Option<String>,
        port: u16,
        address: &str,
        now: u64,
    ) -> Result<&mut RemotePeer, PeerError> {
        match self.peers.iter().position(|p| p.peer_id == peer_id) {
            Some(index) => {
                let peer = &mut self.peers[index];
                if address.is_empty() || port == 0 {
                    return Err(PeerError::MissingField(if port == 0 {
                        "port"
                    } else {
                        "address"
                    }));
                }

                peer.distance = peer.last_update as i64 - peer.last_request as i64;
                peer.address = address.to_string();
                peer.port = port;
                peer.last_update = now;
                if let Some(nat) = nat_type.filter(|n| n.is_known()) {
                    peer.nat_type = nat;
                }
                if cluster_id.is_some() {
                    peer.cluster_id = cluster_id;
                }
                Ok(peer)
            }
            None => {
                let peer = RemotePeer::new(peer_id, address, port, cluster_id, nat_type, now)?;
                self.make_room();
                self.peers.push(peer);
                let last = self.peers.len() - 1;
                Ok(&mut self.peers[last])
            }
        }
    }

    /// Select up to `n` recipients from the whole table
    pub fn select<R: Rng + ?Sized>(
        &self,
        local_nat: NatType,
        cluster_id: Option<&str>,
        n: usize,
        rng: &mut R,
    ) -> Vec<RemotePeer> {
        select_peers(&self.peers, local_nat, cluster_id, n, rng)
    }

    fn make_room(&mut self) {
        while self.peers.len() >= self.max_peers {
            let oldest = self
                .peers
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.last_update)
                .map(|(i, _)| i);

            match oldest {
                Some(index) => {
                    let evicted = self.peers.remove(index);
                    log::debug!("Evicted oldest peer {}", evicted.peer_id);
                }
                None => break,
            }
        }
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new(MAX_PEERS)
    }
}

/// Pick up to `n` recipients from `list`.
///
/// Hard-NAT candidates are excluded when the local peer is behind a hard NAT,
/// unclassified peers are dropped, and the closest `SELECTION_WINDOW` peers
/// are shuffled. If the list holds a member of `cluster_id` and none was
/// picked, one member is substituted in (or appended when there is room).
pub fn select_peers<R: Rng + ?Sized>(
    list: &[RemotePeer],
    local_nat: NatType,
    cluster_id: Option<&str>,
    n: usize,
    rng: &mut R,
) -> Vec<RemotePeer> {
    if n == 0 {
        return Vec::new();
    }

    let reachable: Vec<&RemotePeer> = list
        .iter()
        .filter(|p| !(local_nat.is_hard() && p.nat_type.is_hard()))
        .collect();

    let mut candidates: Vec<&RemotePeer> = reachable
        .iter()
        .copied()
        .filter(|p| p.nat_type.is_known())
        .collect();
    candidates.sort_by_key(|p| p.distance);
    candidates.truncate(SELECTION_WINDOW);
    candidates.shuffle(rng);
    candidates.truncate(n);

    if let Some(cluster) = cluster_id {
        let in_cluster = |p: &&RemotePeer| p.cluster_id.as_deref() == Some(cluster);
        let has_member = candidates.iter().any(in_cluster);
        let member = reachable
            .iter()
            .copied()
            .filter(in_cluster)
            .find(|m| !candidates.iter().any(|c| c.peer_id == m.peer_id));

        if let (false, Some(member)) = (has_member, member) {
            if candidates.len() >= n {
                candidates[0] = member;
            } else {
                candidates.push(member);
            }
        }
    }

    candidates.into_iter().cloned().collect()
}

// =============================================================================
// Tests
// =============================================================================
