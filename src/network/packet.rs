//! Packet types for the relay protocol
//!
//! Every datagram carries exactly one `Packet`. The header fields (ids,
//! chain links, clock, hops) are shared; the body is a closed `Message`
//! sum type so the dispatcher can match exhaustively on packet kind.

use serde::{Deserialize, Serialize};

use crate::network::peer::NatType;

/// Default lifetime of a cached packet (6 hours)
pub const PACKET_TTL: u64 = 6 * 60 * 60 * 1000;

/// Largest message carried by a single publish packet; bigger payloads are fragmented
pub const MAX_FRAGMENT_SIZE: usize = 1024;

/// Packet kinds, with their wire tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Ping = 1,
    Pong = 2,
    Intro = 3,
    Join = 4,
    Ask = 5,
    Answer = 6,
    Publish = 7,
    Query = 8,
}

impl PacketType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Ping),
            2 => Some(Self::Pong),
            3 => Some(Self::Intro),
            4 => Some(Self::Join),
            5 => Some(Self::Ask),
            6 => Some(Self::Answer),
            7 => Some(Self::Publish),
            8 => Some(Self::Query),
            _ => None,
        }
    }

    /// Get type name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "Ping",
            Self::Pong => "Pong",
            Self::Intro => "Intro",
            Self::Join => "Join",
            Self::Ask => "Ask",
            Self::Answer => "Answer",
            Self::Publish => "Publish",
            Self::Query => "Query",
        }
    }
}

/// An (address, port) pair recorded in a query's traversal history
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

/// Body of Ping and Pong packets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    /// Sender's peer id
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_type: Option<NatType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    /// Correlation nonce, echoed in the reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_id: Option<String>,
    #[serde(default)]
    pub is_reflection: bool,
    #[serde(default)]
    pub is_connection: bool,
    #[serde(default)]
    pub is_heartbeat: bool,
    /// Port the reflection reply should also be sent to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<usize>,
    /// Observed (reflection) or declared (connection) address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Body of Join and Intro packets: a peer announcing itself or being introduced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Introduction {
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_type: Option<NatType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_id: Option<String>,
}

/// Body of Ask packets; the requested id is the packet's own `packet_id`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AskMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// Walk backward (single packet) instead of forward along the chain
    #[serde(default)]
    pub tail: bool,
}

/// First packet of a fragmented publish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentHeader {
    #[serde(default)]
    pub meta: serde_json::Value,
    /// Origin peer id
    pub peer_id: String,
    /// Total payload size in bytes
    pub size: usize,
    /// Number of body fragments
    pub indexes: usize,
}

/// Body of Publish and Answer packets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    Bytes(#[serde(with = "hex")] Vec<u8>),
    Header(FragmentHeader),
}

impl Payload {
    /// Bytes the packet id is computed over
    pub fn digest_bytes(&self) -> Vec<u8> {
        match self {
            Payload::Bytes(bytes) => bytes.clone(),
            Payload::Header(header) => serde_json::to_vec(header).unwrap_or_default(),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(bytes) => Some(bytes),
            Payload::Header(_) => None,
        }
    }

    pub fn header(&self) -> Option<&FragmentHeader> {
        match self {
            Payload::Header(header) => Some(header),
            Payload::Bytes(_) => None,
        }
    }
}

/// Body of Query packets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// Peers this query already passed through
    #[serde(default)]
    pub history: Vec<Endpoint>,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Type-specific packet body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "lowercase")]
pub enum Message {
    Ping(Probe),
    Pong(Probe),
    Intro(Introduction),
    Join(Introduction),
    Ask(AskMessage),
    Answer(Payload),
    Publish(Payload),
    Query(QueryMessage),
}

impl Message {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Message::Ping(_) => PacketType::Ping,
            Message::Pong(_) => PacketType::Pong,
            Message::Intro(_) => PacketType::Intro,
            Message::Join(_) => PacketType::Join,
            Message::Ask(_) => PacketType::Ask,
            Message::Answer(_) => PacketType::Answer,
            Message::Publish(_) => PacketType::Publish,
            Message::Query(_) => PacketType::Query,
        }
    }

    /// Peer id announced by the sender, if the body carries one
    pub fn peer_id(&self) -> Option<&str> {
        let id = match self {
            Message::Ping(p) | Message::Pong(p) => Some(p.peer_id.as_str()),
            Message::Intro(i) | Message::Join(i) => Some(i.peer_id.as_str()),
            Message::Ask(a) => a.peer_id.as_deref(),
            Message::Query(q) => q.peer_id.as_deref(),
            Message::Answer(p) | Message::Publish(p) => p.header().map(|h| h.peer_id.as_str()),
        };
        id.filter(|id| !id.is_empty())
    }

    pub fn nat_type(&self) -> Option<NatType> {
        match self {
            Message::Ping(p) | Message::Pong(p) => p.nat_type,
            Message::Intro(i) | Message::Join(i) => i.nat_type,
            _ => None,
        }
    }

    /// Cache size reported by the sender (probes only)
    pub fn cache_size(&self) -> Option<usize> {
        match self {
            Message::Ping(p) | Message::Pong(p) => p.cache_size,
            _ => None,
        }
    }

    pub fn history(&self) -> &[Endpoint] {
        match self {
            Message::Query(q) => &q.history,
            _ => &[],
        }
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Message::Answer(p) | Message::Publish(p) => Some(p),
            _ => None,
        }
    }
}

/// A relay packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Content hash identifying this packet
    #[serde(default)]
    pub packet_id: String,
    #[serde(default)]
    pub cluster_id: Option<String>,
    /// Per-chain monotonic counter
    #[serde(default)]
    pub clock: u64,
    /// Relay count; the wire header value is authoritative
    #[serde(default)]
    pub hops: u32,
    #[serde(default)]
    pub previous_id: Option<String>,
    #[serde(default)]
    pub next_id: Option<String>,
    /// Fragment position, -1 if unfragmented
    #[serde(default = "unfragmented")]
    pub index: i32,
    /// Destination key for publish/answer payloads
    #[serde(default)]
    pub to: Option<String>,
    /// Creation time (ms since epoch), drives the cache TTL
    #[serde(default)]
    pub timestamp: u64,
    pub message: Message,
}

fn unfragmented() -> i32 {
    -1
}

impl Packet {
    /// Create a packet with default header fields
    pub fn new(message: Message) -> Self {
        Self {
            packet_id: String::new(),
            cluster_id: None,
            clock: 0,
            hops: 0,
            previous_id: None,
            next_id: None,
            index: -1,
            to: None,
            timestamp: 0,
            message,
        }
    }

    pub fn with_cluster(mut self, cluster_id: Option<String>) -> Self {
        self.cluster_id = cluster_id;
        self
    }

    pub fn with_id(mut self, packet_id: impl Into<String>) -> Self {
        self.packet_id = packet_id.into();
        self
    }

    pub fn packet_type(&self) -> PacketType {
        self.message.packet_type()
    }

    pub fn is_fragment(&self) -> bool {
        self.index > -1
    }

    /// A publish packet carrying a payload (answers are stored as publishes)
    pub fn as_publish(&self) -> Option<Packet> {
        match &self.message {
            Message::Publish(_) => Some(self.clone()),
            Message::Answer(payload) => {
                let mut packet = self.clone();
                packet.message = Message::Publish(payload.clone());
                Some(packet)
            }
            _ => None,
        }
    }

    /// The same packet re-labelled as an answer
    pub fn as_answer(&self) -> Option<Packet> {
        let payload = self.message.payload()?.clone();
        let mut packet = self.clone();
        packet.message = Message::Answer(payload);
        Some(packet)
    }
}
