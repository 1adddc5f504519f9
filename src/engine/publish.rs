//! Packet chain builder
//!
//! A publish becomes one packet, or a header plus ordered fragments when the
//! (sealed) payload exceeds `MAX_FRAGMENT_SIZE`. Ids chain the fragments
//! together and the clock continues the parent's chain.

use serde::Serialize;

use crate::crypto::{chained_id, sha256_hex};
use crate::engine::{EngineError, Peer};
use crate::network::codec::CodecError;
use crate::network::packet::{FragmentHeader, Message, Packet, Payload, MAX_FRAGMENT_SIZE};

/// Arguments of `Peer::publish`
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Destination public key (hex)
    pub to: Option<String>,
    pub cluster_id: Option<String>,
    pub message: Vec<u8>,
    /// Parent packet this publish continues
    pub packet: Option<Packet>,
    /// Explicit successor id for the last packet
    pub next_id: Option<String>,
    /// Carried in the fragment header
    pub meta: serde_json::Value,
    /// Passed to the `prepare_message` hook
    pub peer_id: Option<String>,
}

impl PublishOptions {
    pub fn new(to: impl Into<String>, message: impl Into<Vec<u8>>) -> Self {
        Self {
            to: Some(to.into()),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Publish a structured value, serialized as JSON
    pub fn json<T: Serialize>(to: impl Into<String>, value: &T) -> Result<Self, EngineError> {
        let message = serde_json::to_vec(value).map_err(CodecError::from)?;
        Ok(Self::new(to, message))
    }

    pub fn cluster(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }

    pub fn after(mut self, parent: Packet) -> Self {
        self.packet = Some(parent);
        self
    }
}

impl Peer {
    /// Publish a payload to the holders of `options.to`
    pub fn publish(&mut self, options: PublishOptions) -> Result<Vec<Packet>, EngineError> {
        if self.is_closing() {
            return Err(EngineError::Closed);
        }
        let to = options.to.ok_or(EngineError::MissingDestination)?;

        let message = match self
            .hooks
            .prepare_message(&options.message, options.peer_id.as_deref())
        {
            Some(prepared) => prepared,
            None => self.encryption.seal(&options.message, &to)?,
        };

        let parent = options.packet.as_ref();
        let parent_id = parent.map(|p| p.packet_id.as_str());
        // unparented publishes start fresh chains
        let sibling_clock = parent_id.and_then(|id| self.cache.siblings(id).map(|p| p.clock).max());
        let base = parent.map_or(0, |p| p.clock).max(sibling_clock.unwrap_or(0));

        let payloads = if message.len() > MAX_FRAGMENT_SIZE {
            let chunks: Vec<Payload> = message
                .chunks(MAX_FRAGMENT_SIZE)
                .map(|chunk| Payload::Bytes(chunk.to_vec()))
                .collect();
            let mut payloads = vec![Payload::Header(FragmentHeader {
                meta: options.meta.clone(),
                peer_id: self.peer_id.clone(),
                size: message.len(),
                indexes: chunks.len(),
            })];
            payloads.extend(chunks);
            payloads
        } else {
            vec![Payload::Bytes(message)]
        };

        let now = self.now();
        let fragmented = payloads.len() > 1;
        let mut packets: Vec<Packet> = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                let mut packet = Packet::new(Message::Publish(payload))
                    .with_cluster(options.cluster_id.clone());
                packet.to = Some(to.clone());
                packet.clock = base + i as u64 + 1;
                packet.timestamp = now;
                if fragmented {
                    packet.index = i as i32;
                }
                packet
            })
            .collect();

        self.link(&mut packets, parent_id, options.next_id);

        log::debug!(
            "Publishing {} packet(s) from {} (head {})",
            packets.len(),
            crate::engine::short_id(&self.peer_id),
            crate::engine::short_id(&packets[0].packet_id)
        );

        let port = self.port.unwrap_or(self.config.port);
        let address = self.address.clone().unwrap_or_default();
        for packet in &packets {
            if self.cache.insert(&packet.packet_id, packet.clone()) {
                self.hooks.on_packet(packet, port, &address);
            }
            self.unpublished
                .insert(packet.packet_id.clone(), options.cluster_id.clone());
            self.mcast(packet, Vec::new(), false)?;
        }

        Ok(packets)
    }

    /// Assign ids and chain links
    fn link(&self, packets: &mut [Packet], parent_id: Option<&str>, next_id: Option<String>) {
        let digests: Vec<Vec<u8>> = packets
            .iter()
            .map(|p| p.message.payload().map(Payload::digest_bytes).unwrap_or_default())
            .collect();

        let head_id = sha256_hex(&digests[0]);
        packets[0].packet_id = head_id.clone();
        packets[0].previous_id = parent_id.map(str::to_string);

        for i in 1..packets.len() {
            let id = chained_id(&packets[i - 1].packet_id, &digests[i]);
            packets[i - 1].next_id = Some(id.clone());
            packets[i].packet_id = id;
            // every fragment points back at the header
            packets[i].previous_id = Some(head_id.clone());
        }

        if let Some(last) = packets.last_mut() {
            last.next_id = next_id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::engine::{Config, ManualClock};
    use crate::network::transport::MemoryTransport;

    fn engine() -> Peer {
        Peer::new(Config::default(), MemoryTransport::new())
            .unwrap()
            .with_clock(ManualClock::new(1_000))
    }

    #[test]
    fn test_publish_requires_destination() {
        let mut peer = engine();
        let result = peer.publish(PublishOptions {
            message: b"x".to_vec(),
            ..Default::default()
        });
        assert!(matches!(result, Err(EngineError::MissingDestination)));
    }

    #[test]
    fn test_small_publish_single_packet() {
        let mut peer = engine();
        let to = peer.public_key();
        let packets = peer.publish(PublishOptions::new(to.clone(), b"hello".to_vec())).unwrap();

        assert_eq!(packets.len(), 1);
        let packet = &packets[0];
        assert_eq!(packet.index, -1);
        assert_eq!(packet.clock, 1);
        assert_eq!(packet.timestamp, 1_000);
        assert_eq!(packet.to.as_deref(), Some(to.as_str()));
        assert!(peer.cache().contains(&packet.packet_id));
        assert!(peer.unpublished().contains_key(&packet.packet_id));

        let sealed = packet.message.payload().unwrap().as_bytes().unwrap();
        assert_eq!(packet.packet_id, sha256_hex(sealed));
        assert_eq!(peer.encryption.open(sealed, &to).unwrap(), b"hello");
    }

    #[test]
    fn test_large_publish_fragments_and_chains() {
        let mut peer = engine();
        let cluster = KeyPair::generate();
        let to = peer.add_key(cluster);
        let payload = vec![7u8; 3000];

        let packets = peer.publish(PublishOptions::new(to, payload)).unwrap();

        // 3000 bytes sealed is 3061: a header plus three fragments
        assert_eq!(packets.len(), 4);
        let header = packets[0].message.payload().unwrap().header().unwrap();
        assert_eq!(header.size, 3061);
        assert_eq!(header.indexes, 3);
        assert_eq!(header.peer_id, peer.peer_id());

        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(packet.index, i as i32);
            assert_eq!(packet.clock, i as u64 + 1);
            if i > 0 {
                assert_eq!(packet.previous_id.as_deref(), Some(packets[0].packet_id.as_str()));
                let bytes = packet.message.payload().unwrap().as_bytes().unwrap();
                assert_eq!(packet.packet_id, chained_id(&packets[i - 1].packet_id, bytes));
                assert_eq!(packets[i - 1].next_id.as_deref(), Some(packet.packet_id.as_str()));
            }
        }
        assert!(packets[3].next_id.is_none());

        let composed = peer.cache().compose(&packets[2]).unwrap();
        let sealed = composed.message.payload().unwrap().as_bytes().unwrap();
        assert_eq!(sealed.len(), 3061);
    }

    #[test]
    fn test_clock_continues_parent_and_siblings() {
        let mut peer = engine();
        let to = peer.public_key();

        let parent = peer.publish(PublishOptions::new(to.clone(), b"a".to_vec())).unwrap();
        let parent = parent[0].clone();

        let first = peer
            .publish(PublishOptions::new(to.clone(), b"b".to_vec()).after(parent.clone()))
            .unwrap();
        assert_eq!(first[0].clock, 2);
        assert_eq!(first[0].previous_id.as_deref(), Some(parent.packet_id.as_str()));

        // a concurrent sibling continues past the highest known fork
        let second = peer
            .publish(PublishOptions::new(to, b"c".to_vec()).after(parent))
            .unwrap();
        assert_eq!(second[0].clock, 3);
    }

    #[test]
    fn test_unrelated_roots_each_start_at_one() {
        let mut peer = engine();
        let to = peer.public_key();

        for body in [b"x".to_vec(), b"y".to_vec(), b"z".to_vec()] {
            let packets = peer.publish(PublishOptions::new(to.clone(), body)).unwrap();
            assert_eq!(packets[0].clock, 1);
            assert!(packets[0].previous_id.is_none());
        }
        assert_eq!(peer.cache().len(), 3);
    }
}
