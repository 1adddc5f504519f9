//! Networking module for the relay
//!
//! Provides:
//! - Packet types and wire codec
//! - Peer table with NAT classification
//! - Per-address rate limiting
//! - Datagram transports and the tokio node driver

pub mod codec;
pub mod limiter;
pub mod node;
pub mod packet;
pub mod peer;
pub mod transport;

pub use codec::{add_hops, decode, encode, peek_type, CodecError, PacketCodec};
pub use limiter::RateLimiter;
pub use node::{Node, NodeHandle};
pub use packet::{
    AskMessage, Endpoint, FragmentHeader, Introduction, Message, Packet, PacketType, Payload,
    Probe, QueryMessage, MAX_FRAGMENT_SIZE, PACKET_TTL,
};
pub use peer::{select_peers, NatType, PeerError, PeerTable, RemotePeer};
pub use transport::{Datagram, MemoryTransport, Transport, TransportError, UdpTransport};
