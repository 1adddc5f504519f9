//! Content-addressable packet cache
//!
//! Packets are stored by packet id and remembered in insertion order, which
//! is also the eviction order once the cache is full. On top of plain
//! storage the cache understands chains: which packets are heads (nothing
//! known after them), which are tails (their predecessor is missing) and how
//! to stitch a fragmented publish back together.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::network::packet::{Message, Packet, Payload};

/// Default packet capacity
pub const DEFAULT_CACHE_SIZE: usize = 16_384;

#[derive(Debug, Clone)]
pub struct Cache {
    data: HashMap<String, Packet>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Cache {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Rebuild a cache from persisted `(id, packet)` pairs, keeping their order
    pub fn from_entries(entries: Vec<(String, Packet)>, capacity: usize) -> Self {
        let mut cache = Self::new(capacity);
        for (id, packet) in entries {
            cache.insert(&id, packet);
        }
        cache
    }

    /// Store a packet. Returns false for empty ids and duplicates.
    pub fn insert(&mut self, id: &str, packet: Packet) -> bool {
        if id.is_empty() || self.data.contains_key(id) {
            return false;
        }

        while self.data.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.data.remove(&oldest);
                }
                None => break,
            }
        }

        self.order.push_back(id.to_string());
        self.data.insert(id.to_string(), packet);
        true
    }

    pub fn get(&self, id: &str) -> Option<&Packet> {
        self.data.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.data.contains_key(id)
    }

    pub fn delete(&mut self, id: &str) -> Option<Packet> {
        let packet = self.data.remove(id)?;
        self.order.retain(|entry| entry != id);
        Some(packet)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterate `(id, packet)` pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Packet)> {
        self.order
            .iter()
            .filter_map(move |id| self.data.get(id).map(|packet| (id, packet)))
    }

    /// Owned `(id, packet)` pairs in insertion order, for persistence
    pub fn entries(&self) -> Vec<(String, Packet)> {
        self.iter()
            .map(|(id, packet)| (id.clone(), packet.clone()))
            .collect()
    }

    /// Packets that continue `previous_id`
    pub fn siblings<'a>(&'a self, previous_id: &'a str) -> impl Iterator<Item = &'a Packet> {
        self.iter()
            .map(|(_, packet)| packet)
            .filter(move |packet| packet.previous_id.as_deref() == Some(previous_id))
    }

    /// Last known packet of every chain: nothing cached follows it
    pub fn heads(&self) -> Vec<&Packet> {
        let parents: HashSet<&str> = self
            .data
            .values()
            .filter_map(|packet| packet.previous_id.as_deref())
            .collect();

        self.iter()
            .map(|(_, packet)| packet)
            .filter(|packet| !parents.contains(packet.packet_id.as_str()))
            .filter(|packet| match packet.next_id.as_deref() {
                Some(next) => !self.contains(next),
                None => true,
            })
            .collect()
    }

    /// Packets whose predecessor is not cached
    pub fn tails(&self) -> Vec<&Packet> {
        self.iter()
            .map(|(_, packet)| packet)
            .filter(|packet| match packet.previous_id.as_deref() {
                Some(previous) => !self.contains(previous),
                None => false,
            })
            .collect()
    }

    /// The packet `id` followed by everything cached after it, breadth first
    pub fn each_from(&self, id: &str) -> Vec<&Packet> {
        let mut children: HashMap<&str, Vec<&Packet>> = HashMap::new();
        for (_, packet) in self.iter() {
            if let Some(previous) = packet.previous_id.as_deref() {
                children.entry(previous).or_default().push(packet);
            }
        }

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut out = Vec::new();

        if let Some(start) = self.get(id) {
            queue.push_back(start);
        }

        while let Some(packet) = queue.pop_front() {
            if !visited.insert(packet.packet_id.as_str()) {
                continue;
            }
            out.push(packet);
            if let Some(next) = children.get(packet.packet_id.as_str()) {
                queue.extend(next.iter().copied());
            }
        }

        out
    }

    /// Reassemble a fragmented publish from any of its fragments.
    ///
    /// Returns the header packet carrying the joined payload as plain bytes
    /// with `index` reset to -1, or `None` while fragments are missing.
    pub fn compose(&self, packet: &Packet) -> Option<Packet> {
        let header_packet = if packet.index == 0 {
            packet
        } else {
            self.get(packet.previous_id.as_deref()?)?
        };

        let header = header_packet.message.payload()?.header()?;
        let mut parts: Vec<Option<&[u8]>> = vec![None; header.indexes];

        for (_, fragment) in self.iter() {
            if fragment.previous_id.as_deref() != Some(header_packet.packet_id.as_str()) {
                continue;
            }
            let Ok(slot) = usize::try_from(fragment.index) else {
                continue;
            };
            if slot == 0 || slot > header.indexes {
                continue;
            }
            if let Some(bytes) = fragment.message.payload().and_then(Payload::as_bytes) {
                parts[slot - 1] = Some(bytes);
            }
        }

        let mut joined = Vec::with_capacity(header.size);
        for part in parts {
            joined.extend_from_slice(part?);
        }

        if joined.len() != header.size {
            log::debug!(
                "Fragment size mismatch for {}: {} != {}",
                header_packet.packet_id,
                joined.len(),
                header.size
            );
            return None;
        }

        let mut composed = header_packet.clone();
        composed.message = Message::Publish(Payload::Bytes(joined));
        composed.index = -1;
        Some(composed)
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::FragmentHeader;

    fn publish(id: &str, previous: Option<&str>, bytes: &[u8]) -> Packet {
        let mut packet = Packet::new(Message::Publish(Payload::Bytes(bytes.to_vec()))).with_id(id);
        packet.previous_id = previous.map(str::to_string);
        packet
    }

    fn fragmented(payload: &[u8]) -> Vec<Packet> {
        let chunks: Vec<&[u8]> = payload.chunks(4).collect();
        let mut header = Packet::new(Message::Publish(Payload::Header(FragmentHeader {
            meta: serde_json::Value::Null,
            peer_id: "origin".to_string(),
            size: payload.len(),
            indexes: chunks.len(),
        })))
        .with_id("h");
        header.index = 0;

        let mut packets = vec![header];
        for (i, chunk) in chunks.iter().enumerate() {
            let mut fragment = publish(&format!("f{}", i + 1), Some("h"), chunk);
            fragment.index = i as i32 + 1;
            packets.push(fragment);
        }
        packets
    }

    #[test]
    fn test_insert_deduplicates() {
        let mut cache = Cache::new(8);
        assert!(cache.insert("a", publish("a", None, b"1")));
        assert!(!cache.insert("a", publish("a", None, b"2")));
        assert!(!cache.insert("", publish("", None, b"3")));

        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get("a").unwrap().message.payload().unwrap().as_bytes(),
            Some(&b"1"[..])
        );
    }

    #[test]
    fn test_eviction_in_insertion_order() {
        let mut cache = Cache::new(2);
        cache.insert("a", publish("a", None, b"1"));
        cache.insert("b", publish("b", None, b"2"));
        cache.insert("c", publish("c", None, b"3"));

        assert!(cache.get("a").is_none());
        let ids: Vec<&String> = cache.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["b", "c"]);

        cache.delete("b");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.entries()[0].0, "c");
    }

    #[test]
    fn test_heads_and_tails() {
        let mut cache = Cache::new(8);
        cache.insert("a", publish("a", None, b"1"));
        cache.insert("b", publish("b", Some("a"), b"2"));
        cache.insert("d", publish("d", Some("missing"), b"3"));

        let heads: Vec<&str> = cache.heads().iter().map(|p| p.packet_id.as_str()).collect();
        assert_eq!(heads, vec!["b", "d"]);

        let tails: Vec<&str> = cache.tails().iter().map(|p| p.packet_id.as_str()).collect();
        assert_eq!(tails, vec!["d"]);
    }

    #[test]
    fn test_each_from_walks_forward() {
        let mut cache = Cache::new(8);
        cache.insert("a", publish("a", None, b"1"));
        cache.insert("b", publish("b", Some("a"), b"2"));
        cache.insert("c", publish("c", Some("b"), b"3"));
        cache.insert("x", publish("x", None, b"4"));

        let ids: Vec<&str> = cache.each_from("b").iter().map(|p| p.packet_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(cache.each_from("nope").is_empty());
    }

    #[test]
    fn test_compose_fragments() {
        let payload = b"0123456789";
        let packets = fragmented(payload);
        let mut cache = Cache::new(16);

        // missing fragments: nothing to compose yet
        cache.insert("h", packets[0].clone());
        cache.insert("f1", packets[1].clone());
        assert!(cache.compose(&packets[1]).is_none());

        for packet in &packets[2..] {
            cache.insert(&packet.packet_id, packet.clone());
        }

        let composed = cache.compose(&packets[2]).unwrap();
        assert_eq!(composed.packet_id, "h");
        assert_eq!(composed.index, -1);
        assert_eq!(
            composed.message.payload().unwrap().as_bytes(),
            Some(&payload[..])
        );
        assert_eq!(cache.compose(&packets[0]).unwrap(), composed);
    }

    #[test]
    fn test_siblings() {
        let mut cache = Cache::new(8);
        cache.insert("a", publish("a", None, b"1"));
        cache.insert("b", publish("b", Some("a"), b"2"));
        cache.insert("c", publish("c", Some("a"), b"3"));

        assert_eq!(cache.siblings("a").count(), 2);
        assert_eq!(cache.siblings("b").count(), 0);
    }
}
