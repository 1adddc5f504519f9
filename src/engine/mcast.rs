//! Gossip multicast and cache negotiation

use crate::engine::{EngineError, Peer, Task};
use crate::network::codec;
use crate::network::packet::{AskMessage, Endpoint, Message, Packet};
use crate::network::peer::{select_peers, RemotePeer, DEFAULT_FANOUT};

/// Spacing between the staggered sends of one multicast (ms)
pub const MCAST_STAGGER: u64 = 10;

/// Extra least-hopped packets offered during negotiation
pub const NEGOTIATE_EXTRA: usize = 3;

impl Peer {
    /// Send `packet` to a few selected peers.
    ///
    /// Peers listed in `ignore` or in the packet's own traversal history are
    /// never chosen. `taxed` marks a relay re-broadcast: the wire hop
    /// counter is incremented once more on the way out.
    pub(crate) fn mcast(
        &mut self,
        packet: &Packet,
        mut ignore: Vec<Endpoint>,
        taxed: bool,
    ) -> Result<(), EngineError> {
        if self.is_closing() {
            return Ok(());
        }

        ignore.extend(packet.message.history().iter().cloned());
        let list: Vec<RemotePeer> = self
            .peers
            .iter()
            .filter(|p| !ignore.iter().any(|e| p.is_at(&e.address, e.port)))
            .cloned()
            .collect();

        let targets = select_peers(
            &list,
            self.nat_type,
            packet.cluster_id.as_deref(),
            DEFAULT_FANOUT,
            &mut *self.rng,
        );
        if targets.is_empty() {
            log::trace!("No multicast targets for {}", packet.packet_id);
            return Ok(());
        }

        let mut data = codec::encode(packet)?;
        if taxed {
            data = codec::add_hops(&data)?;
        }

        let now = self.now();
        for (i, peer) in targets.into_iter().enumerate() {
            let task = Task::McastSend {
                packet_id: packet.packet_id.clone(),
                address: peer.address,
                port: peer.port,
                data: data.clone(),
            };
            self.timers
                .schedule(now + MCAST_STAGGER * (i as u64 + 1), task);
        }
        Ok(())
    }

    /// Exchange chain boundaries with the peer at `address:port`.
    ///
    /// A peer reporting an empty cache is sent everything. Otherwise it is
    /// asked for what precedes our tails and follows our heads, and offered
    /// a few of our least-travelled packets.
    pub(crate) fn negotiate_cache(
        &mut self,
        packet: &Packet,
        port: u16,
        address: &str,
    ) -> Result<(), EngineError> {
        let mut known: Vec<&Packet> = self.cache.iter().map(|(_, p)| p).collect();
        known.sort_by_key(|p| p.hops);

        if packet.message.cache_size() == Some(0) {
            let all: Vec<Vec<u8>> = known
                .iter()
                .map(|p| codec::encode(p))
                .collect::<Result<_, _>>()?;
            log::debug!("Sending {} packets to empty peer {}:{}", all.len(), address, port);
            for data in all {
                self.send(&data, port, address);
            }
            return Ok(());
        }

        let mut to_send: Vec<Packet> = Vec::new();

        for tail in self.cache.tails() {
            if let Some(previous) = &tail.previous_id {
                to_send.push(self.ask(previous, tail.cluster_id.clone(), true));
            }
        }

        for head in self.cache.heads() {
            if to_send.iter().any(|p| p.packet_id == head.packet_id) {
                continue;
            }
            to_send.push(self.ask(&head.packet_id, head.cluster_id.clone(), false));
        }

        let mut extra = 0;
        for p in known {
            if extra >= NEGOTIATE_EXTRA {
                break;
            }
            if !to_send.iter().any(|s| s.packet_id == p.packet_id) {
                extra += 1;
                to_send.push(p.clone());
            }
        }

        for p in &to_send {
            let data = codec::encode(p)?;
            self.send(&data, port, address);
        }
        Ok(())
    }

    /// An Ask for `packet_id`, backward (`tail`) or forward along its chain
    pub(crate) fn ask(&self, packet_id: &str, cluster_id: Option<String>, tail: bool) -> Packet {
        Packet::new(Message::Ask(AskMessage {
            peer_id: Some(self.peer_id.clone()),
            tail,
        }))
        .with_cluster(cluster_id)
        .with_id(packet_id)
    }
}
