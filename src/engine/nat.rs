//! NAT classification and hole punching
//!
//! Reflection: two reachable peers are pinged with the same correlation id
//! and report back the address and port they observed. One of them also
//! answers on the test port, which only a publicly reachable peer receives.
//!
//! - Reply seen on the test port: static
//! - Both replies observed the local port: easy
//! - The observed port differs between peers: hard
//!
//! Hole punching pairs peers by NAT class. An easy peer facing a hard one
//! sprays correlated pings at random ports of the remote address until the
//! remote answers; a hard peer facing an easy one replays a fixed burst.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::{Rng, RngCore};

use crate::crypto::nonce;
use crate::engine::{short_id, EngineError, Peer, Task};
use crate::network::codec;
use crate::network::packet::{Introduction, Message, Packet, Probe};
use crate::network::peer::NatType;

/// Attempts before an easy-to-hard punch gives up
pub const MAX_PUNCH_ATTEMPTS: u32 = 512;

/// Interval between punch attempts (ms)
pub const PUNCH_INTERVAL: u64 = 10;

/// Ports in the hard-to-easy burst
pub const BDP_BURST: usize = 256;

// =============================================================================
// Port Generator
// =============================================================================

/// Random, non-repeating probe ports that never hit the local or test port
#[derive(Debug, Clone)]
pub struct PortGenerator {
    used: HashSet<u16>,
}

impl PortGenerator {
    pub fn new(local_port: u16, test_port: u16) -> Self {
        let mut used = HashSet::new();
        used.insert(0);
        used.insert(local_port);
        used.insert(test_port);
        Self { used }
    }

    pub fn next<R: RngCore + ?Sized>(&mut self, rng: &mut R) -> u16 {
        if self.used.len() > usize::from(u16::MAX) {
            return rng.gen_range(1..=u16::MAX);
        }
        loop {
            let port = rng.gen_range(1..=u16::MAX);
            if self.used.insert(port) {
                return port;
            }
        }
    }
}

/// State of an easy-to-hard punch in progress
#[derive(Debug, Clone)]
pub(crate) struct Punch {
    pub peer_id: String,
    pub address: String,
    pub ping_id: String,
    pub data: Vec<u8>,
    pub attempt: u32,
    pub ports: PortGenerator,
    /// The introduction that started the punch
    pub packet: Packet,
}

impl Peer {
    // =========================================================================
    // Reflection
    // =========================================================================

    /// Ask two reachable peers what address and port they see us on
    pub fn request_reflection(&mut self) {
        if self.is_closing() || self.config.introducer {
            return;
        }

        let mut candidates: Vec<_> = self
            .peers
            .iter()
            .filter(|p| p.nat_type.is_easy())
            .cloned()
            .collect();
        candidates.shuffle(&mut *self.rng);

        let ping_id = nonce(&mut *self.rng);
        let probe = Probe {
            peer_id: self.peer_id.clone(),
            ping_id: Some(ping_id),
            is_reflection: true,
            ..Default::default()
        };

        log::debug!(
            "Reflection request from {} via {} peers",
            short_id(&self.peer_id),
            candidates.len().min(2)
        );

        for (i, peer) in candidates.iter().take(2).enumerate() {
            let mut probe = probe.clone();
            if i == 1 {
                probe.test_port = Some(self.config.test_port);
            }
            if let Err(e) = self.ping(peer, probe) {
                self.hooks.on_error(&e);
            }
        }
    }

    /// Handle a reflection pong from `address:port`
    pub(crate) fn on_reflection(&mut self, probe: &Probe, port: u16, address: &str) {
        let previous = self.nat_type;
        let observed_address = probe.address.clone();
        let observed_port = probe.port;

        let now = self.now();
        if let Some(peer) = self.peers.find_at_mut(address, port) {
            peer.ping_id = probe.ping_id.clone();
            peer.last_update = now;
        }

        if observed_address.is_some()
            && observed_address == self.address
            && probe.test_port == Some(self.config.test_port)
        {
            self.reflection_id = None;
            self.nat_type = NatType::Static;
            self.port = observed_port.or(self.port);
            self.nat_changed(previous);
            return;
        }

        if probe.test_port.is_none() && probe.ping_id.is_some() {
            // a different id means a newer round: the old one lost a reply
            if probe.ping_id != self.reflection_id {
                self.reflection_id = probe.ping_id.clone();
            } else {
                if observed_address.is_some() && observed_address == self.address {
                    self.nat_type = if observed_port == self.port {
                        NatType::Easy
                    } else {
                        NatType::Hard
                    };
                }
                self.reflection_id = None;
            }
        }

        if observed_address.is_some() {
            self.address = observed_address;
        }
        if observed_port.is_some() {
            self.port = observed_port;
        }
        self.nat_changed(previous);
    }

    fn nat_changed(&mut self, previous: NatType) {
        if previous == self.nat_type {
            return;
        }
        log::info!(
            "Relay {} NAT type {} -> {} ({}:{})",
            short_id(&self.peer_id),
            previous,
            self.nat_type,
            self.address.as_deref().unwrap_or("?"),
            self.port.unwrap_or(0)
        );
        self.hooks.on_nat(self.nat_type);
        if let Err(e) = self.join() {
            self.hooks.on_error(&e);
        }
    }

    // =========================================================================
    // Hole Punching
    // =========================================================================

    /// Try to connect to a peer we were introduced to by `address:port`
    pub(crate) fn connect_introduced(
        &mut self,
        intro: &Introduction,
        packet: &Packet,
        port: u16,
        address: &str,
    ) -> Result<(), EngineError> {
        let (Some(remote_address), Some(remote_port)) = (intro.address.clone(), intro.port) else {
            return Ok(());
        };
        let Some(peer) = self.set_peer(packet, remote_port, &remote_address) else {
            return Ok(());
        };
        if peer.connecting {
            return Ok(());
        }
        if let Err(e) = self.negotiate_cache(packet, port, address) {
            self.hooks.on_error(&e);
        }

        let remote_nat = intro.nat_type.unwrap_or_default();
        let local_nat = self.nat_type;
        let ping_id = nonce(&mut *self.rng);

        let connection_ping = Packet::new(Message::Ping(Probe {
            peer_id: self.peer_id.clone(),
            nat_type: Some(local_nat).filter(|n| n.is_known()),
            is_connection: true,
            ping_id: Some(ping_id.clone()),
            ..Default::default()
        }))
        .with_cluster(self.cluster_id.clone());

        if local_nat.is_easy() && remote_nat.is_hard() {
            log::debug!(
                "Punching {} ({}) from easy side",
                short_id(&peer.peer_id),
                remote_address
            );
            if let Some(p) = self.peers.get_mut(&peer.peer_id) {
                p.connecting = true;
            }
            let punch = Punch {
                peer_id: peer.peer_id.clone(),
                address: remote_address,
                ping_id,
                data: codec::encode(&connection_ping)?,
                attempt: 0,
                ports: PortGenerator::new(self.config.port, self.config.test_port),
                packet: packet.clone(),
            };
            self.punch(punch);
            return Ok(());
        }

        if local_nat.is_hard() && remote_nat.is_easy() {
            log::debug!(
                "Bursting {} ports at {} from hard side",
                BDP_BURST,
                remote_address
            );
            if self.bdp_cache.is_empty() {
                let mut ports = PortGenerator::new(self.config.port, self.config.test_port);
                self.bdp_cache = (0..BDP_BURST).map(|_| ports.next(&mut *self.rng)).collect();
            }
            let data = codec::encode(&connection_ping)?;
            for port in self.bdp_cache.clone() {
                self.send(&data, port, &remote_address);
            }
            return Ok(());
        }

        let probe = Probe {
            peer_id: self.peer_id.clone(),
            nat_type: Some(local_nat).filter(|n| n.is_known()),
            is_connection: true,
            ping_id: intro.ping_id.clone().or(Some(ping_id)),
            ..Default::default()
        };
        self.ping(&peer, probe)
    }

    /// One easy-to-hard punch attempt
    pub(crate) fn punch(&mut self, mut punch: Punch) {
        if self.is_closing() {
            return;
        }

        if punch.attempt >= MAX_PUNCH_ATTEMPTS {
            log::debug!("Punch to {} gave up", short_id(&punch.peer_id));
            if let Some(p) = self.peers.get_mut(&punch.peer_id) {
                p.connecting = false;
            }
            return;
        }
        punch.attempt += 1;

        let now = self.now();
        let paired = self.peers.find_by_ping_id_mut(&punch.ping_id).map(|pair| {
            pair.last_update = now;
            pair.clone()
        });

        if let Some(pair) = paired {
            if let Some(p) = self.peers.get_mut(&punch.peer_id) {
                p.connecting = false;
            }
            log::debug!(
                "Punch to {} succeeded after {} attempts",
                short_id(&pair.peer_id),
                punch.attempt
            );
            self.on_connection(&pair, &punch.packet, pair.port, &pair.address);
            return;
        }

        let port = punch.ports.next(&mut *self.rng);
        self.send(&punch.data, port, &punch.address);
        self.timers.schedule(now + PUNCH_INTERVAL, Task::Punch(punch));
    }
}
