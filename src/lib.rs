//! Stream Relay: a UDP gossip relay with NAT traversal
//!
//! This crate provides:
//! - NAT classification by reflection (static, easy, hard)
//! - Introductions and UDP hole punching between peers
//! - Flood publishing with hop budgets and per-address rate limiting
//! - Causally linked, fragmented and sealed packet chains
//! - Cache negotiation so reconnecting peers catch up
//! - JSON state persistence
//!
//! # Example
//!
//! ```rust
//! use stream_relay::engine::{Config, Peer, PublishOptions};
//! use stream_relay::network::MemoryTransport;
//!
//! let transport = MemoryTransport::new();
//! let mut peer = Peer::new(Config::default(), transport.clone()).unwrap();
//!
//! // Seal a message for our own key
//! let to = peer.public_key();
//! let packets = peer.publish(PublishOptions::new(to, b"hello".to_vec())).unwrap();
//! assert_eq!(packets.len(), 1);
//! assert!(peer.cache().contains(&packets[0].packet_id));
//! ```

pub mod crypto;
pub mod engine;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use crypto::{Encryption, KeyPair};
pub use engine::{Config, EngineError, Hooks, NoHooks, Peer, PublishOptions, SeedPeer};
pub use network::{
    MemoryTransport, Message, NatType, Node, NodeHandle, Packet, PacketType, RemotePeer,
    Transport, UdpTransport,
};
pub use storage::{Cache, PersistedState, Storage, StorageConfig};
