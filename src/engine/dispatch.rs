//! Inbound message dispatch
//!
//! Every datagram is rate limited, decoded, passed through the firewall
//! hook and routed by packet type. Handler failures are reported through
//! `on_error` at this boundary and never escape it.

use rand::Rng;

use crate::engine::{short_id, EngineError, Peer, Task, QUERY_TTL};
use crate::network::codec;
use crate::network::packet::{
    AskMessage, Endpoint, Introduction, Message, Packet, Payload, Probe, QueryMessage,
};
use crate::network::peer::{NatType, DEFAULT_FANOUT};

/// Longest traversal history a query carries
pub const MAX_QUERY_HISTORY: usize = 16;

/// Peers a join is introduced to
pub const JOIN_INTRODUCTIONS: usize = 6;

impl Peer {
    /// Handle one datagram received from `address:port`
    pub fn on_message(&mut self, data: &[u8], port: u16, address: &str) {
        if !self.rate_limit(data, port, address) {
            return;
        }

        let packet = match codec::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("Dropping malformed datagram from {}:{}: {}", address, port, e);
                return;
            }
        };

        if !self.hooks.firewall(&packet, port, address) {
            log::trace!("Firewall dropped {} from {}:{}", packet.packet_type().name(), address, port);
            return;
        }
        self.hooks.on_data(&packet, port, address);

        log::trace!(
            "{} <- {} from {}:{}",
            short_id(&self.peer_id),
            packet.packet_type().name(),
            address,
            port
        );

        let result = match packet.message.clone() {
            Message::Ping(probe) => self.on_ping(&packet, &probe, port, address),
            Message::Pong(probe) => self.on_pong(&packet, &probe, port, address),
            Message::Intro(intro) => self.connect_introduced(&intro, &packet, port, address),
            Message::Join(intro) => self.on_join(&packet, &intro, port, address),
            Message::Ask(ask) => self.on_ask(&packet, &ask, port, address),
            Message::Answer(_) => self.on_answer(packet, port, address),
            Message::Publish(_) => self.on_pub(packet, port, address, false),
            Message::Query(query) => self.on_query(packet, query, port, address),
        };

        if let Err(e) = result {
            self.hooks.on_error(&e);
        }
    }

    /// Admit or reject a datagram by its sender's credit
    fn rate_limit(&mut self, data: &[u8], port: u16, address: &str) -> bool {
        if self.peers.is_trusted_address(address) {
            return true;
        }
        let hooks = &mut self.hooks;
        self.limits
            .admit(address, || hooks.limit(data, port, address))
    }

    // =========================================================================
    // Ping / Pong
    // =========================================================================

    fn on_ping(&mut self, packet: &Packet, probe: &Probe, port: u16, address: &str) -> Result<(), EngineError> {
        self.last_update = self.now();
        let peer = self.set_peer(packet, port, address);

        if probe.is_heartbeat {
            if probe.cluster_id.is_some() {
                self.negotiate_cache(packet, port, address)?;
            }
            return Ok(());
        }

        let mut pong = Probe {
            peer_id: self.peer_id.clone(),
            cache_size: Some(self.cache.len()),
            ping_id: probe.ping_id.clone(),
            address: Some(address.to_string()),
            port: Some(port),
            ..Default::default()
        };

        if probe.is_reflection {
            pong.is_reflection = true;
        } else {
            pong.nat_type = Some(self.nat_type).filter(|n| n.is_known());
        }

        if let (true, Some(peer)) = (probe.is_connection, &peer) {
            pong.is_connection = true;
            pong.address = self.address.clone();
            pong.port = self.port;
            self.on_connection(peer, packet, port, address);
        }

        let reply = Packet::new(Message::Pong(pong.clone())).with_cluster(self.cluster_id.clone());
        self.send_packet(&reply, port, address)?;

        if let Some(test_port) = probe.test_port {
            pong.test_port = Some(test_port);
            let reply = Packet::new(Message::Pong(pong)).with_cluster(self.cluster_id.clone());
            self.send_packet(&reply, test_port, address)?;
        }
        Ok(())
    }

    fn on_pong(&mut self, packet: &Packet, probe: &Probe, port: u16, address: &str) -> Result<(), EngineError> {
        let now = self.now();
        self.last_update = now;

        if probe.is_connection {
            let (Some(remote_address), Some(remote_port)) = (probe.address.as_deref(), probe.port) else {
                return Ok(());
            };
            let Some(peer) = self.set_peer(packet, remote_port, remote_address) else {
                return Ok(());
            };
            let peer = match self.peers.get_mut(&peer.peer_id) {
                Some(entry) => {
                    entry.last_update = now;
                    if probe.ping_id.is_some() {
                        entry.ping_id = probe.ping_id.clone();
                    }
                    entry.clone()
                }
                None => peer,
            };
            self.on_connection(&peer, packet, port, address);
            return Ok(());
        }

        if probe.is_reflection && self.nat_type != NatType::Static {
            self.on_reflection(probe, port, address);
        } else if self.peers.find_at(address, port).is_none() {
            if let Some(peer) = self.set_peer(packet, port, address) {
                self.on_connection(&peer, packet, port, address);
            }
        } else {
            self.set_peer(packet, port, address);
        }
        Ok(())
    }

    // =========================================================================
    // Join
    // =========================================================================

    /// Register a joining peer and introduce it to a few known peers
    fn on_join(&mut self, packet: &Packet, join: &Introduction, port: u16, address: &str) -> Result<(), EngineError> {
        self.last_update = self.now();
        self.set_peer(packet, port, address);

        if join.peer_id.is_empty() || join.peer_id == self.peer_id {
            return Ok(());
        }
        let joiner_address = join.address.clone().unwrap_or_else(|| address.to_string());
        let joiner_port = join.port.unwrap_or(port);
        let joiner_nat = join.nat_type.unwrap_or_default();

        let intro_to_peer = Packet::new(Message::Intro(Introduction {
            peer_id: join.peer_id.clone(),
            nat_type: join.nat_type,
            cluster_id: join.cluster_id.clone(),
            address: Some(joiner_address.clone()),
            port: Some(joiner_port),
            ping_id: None,
        }))
        .with_cluster(join.cluster_id.clone());
        let intro_to_peer = codec::encode(&intro_to_peer)?;

        let candidates = self.select(packet.cluster_id.as_deref(), JOIN_INTRODUCTIONS);
        let now = self.now();

        for peer in candidates {
            if peer.peer_id == self.peer_id || peer.peer_id == join.peer_id {
                continue;
            }
            if !peer.nat_type.is_known() {
                continue;
            }
            // two hard NATs cannot be punched through
            if peer.nat_type.is_hard() && joiner_nat.is_hard() {
                continue;
            }

            let intro_to_joiner = Packet::new(Message::Intro(Introduction {
                peer_id: peer.peer_id.clone(),
                nat_type: Some(peer.nat_type),
                cluster_id: peer.cluster_id.clone(),
                address: Some(peer.address.clone()),
                port: Some(peer.port),
                ping_id: None,
            }))
            .with_cluster(peer.cluster_id.clone());

            log::debug!(
                "Introducing {} <-> {}",
                short_id(&join.peer_id),
                short_id(&peer.peer_id)
            );

            let delay = self.rng.gen_range(0..=2u64);
            let task = Task::IntroPair {
                joiner: (joiner_address.clone(), joiner_port, codec::encode(&intro_to_joiner)?),
                peer: (peer.address, peer.port, intro_to_peer.clone()),
            };
            self.timers.schedule(now + delay, task);
        }
        Ok(())
    }

    // =========================================================================
    // Publish / Answer
    // =========================================================================

    /// Store a publish and re-flood it if accepted. Returns nothing for duplicates.
    fn on_pub(&mut self, mut packet: Packet, port: u16, address: &str, answer: bool) -> Result<(), EngineError> {
        packet.hops += if packet.cluster_id == self.cluster_id { 2 } else { 1 };

        let Some(packet) = packet.as_publish() else {
            return Ok(());
        };
        if !self.cache.insert(&packet.packet_id, packet.clone()) {
            log::trace!("Duplicate packet {}", short_id(&packet.packet_id));
            return Ok(());
        }
        self.hooks.on_pub(&packet, port, address);

        if answer {
            self.continue_sync(&packet, port, address)?;
        }

        let accepted = match self.hooks.predicate_open_packet(&packet, port, address) {
            Some(accepted) => accepted,
            None => self.open_packet(&packet, port, address)?,
        };

        if packet.hops > self.config.max_hops || !accepted {
            return Ok(());
        }
        self.mcast(
            &packet,
            vec![Endpoint {
                address: address.to_string(),
                port,
            }],
            true,
        )
    }

    /// Open a packet addressed to a held key, composing fragments first.
    /// False when the key is not held or fragments are still missing.
    fn open_packet(&mut self, packet: &Packet, port: u16, address: &str) -> Result<bool, EngineError> {
        let Some(to) = packet.to.as_deref() else {
            return Ok(false);
        };
        if !self.encryption.has(to) {
            return Ok(false);
        }

        let composed = if packet.is_fragment() {
            self.cache.compose(packet)
        } else {
            Some(packet.clone())
        };

        let Some(mut composed) = composed else {
            let cluster_id = packet.cluster_id.clone();
            for peer in self.select(cluster_id.as_deref(), DEFAULT_FANOUT) {
                self.negotiate_cache(packet, peer.port, &peer.address)?;
            }
            return Ok(false);
        };

        let Some(sealed) = composed.message.payload().and_then(Payload::as_bytes) else {
            return Ok(false);
        };
        let opened = self.encryption.open(sealed, to)?;
        composed.message = Message::Publish(Payload::Bytes(opened));

        if composed.index == -1 {
            self.hooks.on_packet(&composed, port, address);
        }
        Ok(true)
    }

    fn on_answer(&mut self, packet: Packet, port: u16, address: &str) -> Result<(), EngineError> {
        self.on_pub(packet, port, address, true)
    }

    /// After an answer, ask for whatever is still missing around it
    fn continue_sync(&mut self, packet: &Packet, port: u16, address: &str) -> Result<(), EngineError> {
        if let Some(previous) = packet.previous_id.as_deref() {
            if !self.cache.contains(previous) {
                let ask = self.ask(previous, packet.cluster_id.clone(), true);
                self.send_packet(&ask, port, address)?;
            }
        }
        if let Some(next) = packet.next_id.as_deref() {
            if !self.cache.contains(next) {
                let ask = self.ask(next, packet.cluster_id.clone(), false);
                self.send_packet(&ask, port, address)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Ask
    // =========================================================================

    fn on_ask(&mut self, packet: &Packet, ask: &AskMessage, port: u16, address: &str) -> Result<(), EngineError> {
        let replies: Vec<Packet> = if ask.tail {
            self.cache
                .get(&packet.packet_id)
                .and_then(Packet::as_answer)
                .into_iter()
                .collect()
        } else {
            self.cache
                .each_from(&packet.packet_id)
                .into_iter()
                .filter_map(Packet::as_answer)
                .collect()
        };

        for reply in &replies {
            self.send_packet(reply, port, address)?;
        }
        Ok(())
    }

    // =========================================================================
    // Query
    // =========================================================================

    fn on_query(&mut self, mut packet: Packet, mut query: QueryMessage, port: u16, address: &str) -> Result<(), EngineError> {
        if self.queries.contains_key(&packet.packet_id) {
            return Ok(());
        }
        self.queries.insert(packet.packet_id.clone(), QUERY_TTL);

        if self.hooks.on_query(&packet, port, address) {
            return Ok(());
        }
        if packet.hops > self.config.max_hops {
            return Ok(());
        }

        // no history entry until the public address is known
        if let Some(own_address) = self.address.clone() {
            query.history.push(Endpoint {
                address: own_address,
                port: self.port.unwrap_or(self.config.port),
            });
        }
        while query.history.len() > MAX_QUERY_HISTORY {
            query.history.remove(0);
        }
        packet.message = Message::Query(query);

        self.mcast(
            &packet,
            vec![Endpoint {
                address: address.to_string(),
                port,
            }],
            true,
        )
    }
}
