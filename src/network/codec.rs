//! Wire codec for relay packets
//!
//! Frame layout: `MAGIC (4) | type (1) | hops (4, BE) | length (4, BE) | JSON body`.
//! The hop counter lives in the fixed header so relays can tax a packet
//! with `add_hops` without decoding the body.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::network::packet::{Packet, PacketType};

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x53, 0x52, 0x4C, 0x59]; // "SRLY"

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 13;

/// Largest UDP payload we will emit
pub const MAX_PACKET_SIZE: usize = 65_507;

const TYPE_OFFSET: usize = 4;
const HOPS_OFFSET: usize = 5;
const LEN_OFFSET: usize = 9;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),
    #[error("Invalid magic bytes")]
    BadMagic,
    #[error("Unknown packet type: {0}")]
    UnknownType(u8),
    #[error("Header type {header:?} does not match body type {body:?}")]
    TypeMismatch { header: PacketType, body: PacketType },
    #[error("Frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Packet codec for length-prefixed framing
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl<'a> Encoder<&'a Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &'a Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(item)?;
        if HEADER_LEN + body.len() > MAX_PACKET_SIZE {
            return Err(CodecError::TooLarge(HEADER_LEN + body.len()));
        }

        dst.reserve(HEADER_LEN + body.len());
        dst.put_slice(&MAGIC);
        dst.put_u8(item.packet_type() as u8);
        dst.put_u32(item.hops);
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);

        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if src[..TYPE_OFFSET] != MAGIC {
            return Err(CodecError::BadMagic);
        }

        let tag = src[TYPE_OFFSET];
        let kind = PacketType::from_u8(tag).ok_or(CodecError::UnknownType(tag))?;
        let hops = read_u32(&src[HOPS_OFFSET..LEN_OFFSET]);
        let len = read_u32(&src[LEN_OFFSET..HEADER_LEN]) as usize;

        if src.len() < HEADER_LEN + len {
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(len);

        let mut packet: Packet = serde_json::from_slice(&body)?;
        if packet.packet_type() != kind {
            return Err(CodecError::TypeMismatch {
                header: kind,
                body: packet.packet_type(),
            });
        }
        packet.hops = hops;

        Ok(Some(packet))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Encode a packet into a single datagram
pub fn encode(packet: &Packet) -> Result<Vec<u8>, CodecError> {
    let mut buf = BytesMut::new();
    PacketCodec.encode(packet, &mut buf)?;
    Ok(buf.to_vec())
}

/// Decode one datagram
pub fn decode(data: &[u8]) -> Result<Packet, CodecError> {
    let mut buf = BytesMut::from(data);
    PacketCodec
        .decode(&mut buf)?
        .ok_or(CodecError::TooShort(data.len()))
}

/// Packet type of an encoded frame, without decoding the body
pub fn peek_type(data: &[u8]) -> Result<PacketType, CodecError> {
    check_header(data)?;
    let tag = data[TYPE_OFFSET];
    PacketType::from_u8(tag).ok_or(CodecError::UnknownType(tag))
}

/// Increment the wire hop counter of an encoded frame
pub fn add_hops(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    check_header(data)?;
    let hops = read_u32(&data[HOPS_OFFSET..LEN_OFFSET]).saturating_add(1);

    let mut out = data.to_vec();
    out[HOPS_OFFSET..LEN_OFFSET].copy_from_slice(&hops.to_be_bytes());
    Ok(out)
}

fn check_header(data: &[u8]) -> Result<(), CodecError> {
    if data.len() < HEADER_LEN {
        return Err(CodecError::TooShort(data.len()));
    }
    if data[..TYPE_OFFSET] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::{Message, Payload, Probe};

    fn ping() -> Packet {
        Packet::new(Message::Ping(Probe {
            peer_id: "peer-a".to_string(),
            ping_id: Some("p1".to_string()),
            ..Default::default()
        }))
        .with_cluster(Some("cluster".to_string()))
    }

    #[test]
    fn test_packet_codec() {
        let packet = ping();
        let data = encode(&packet).unwrap();
        assert_eq!(&data[..4], &MAGIC);
        assert_eq!(peek_type(&data).unwrap(), PacketType::Ping);

        let decoded = decode(&data).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_add_hops_without_decoding() {
        let mut packet = Packet::new(Message::Publish(Payload::Bytes(b"data".to_vec())));
        packet.hops = 4;
        let data = encode(&packet).unwrap();

        let taxed = add_hops(&add_hops(&data).unwrap()).unwrap();
        assert_eq!(taxed.len(), data.len());
        assert_eq!(decode(&taxed).unwrap().hops, 6);
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(matches!(decode(b"SRL"), Err(CodecError::TooShort(3))));

        let mut data = encode(&ping()).unwrap();
        data[0] = b'X';
        assert!(matches!(decode(&data), Err(CodecError::BadMagic)));
        assert!(add_hops(&data).is_err());

        let mut data = encode(&ping()).unwrap();
        data[TYPE_OFFSET] = 42;
        assert!(matches!(decode(&data), Err(CodecError::UnknownType(42))));

        let mut data = encode(&ping()).unwrap();
        data[TYPE_OFFSET] = PacketType::Pong as u8;
        assert!(matches!(decode(&data), Err(CodecError::TypeMismatch { .. })));

        let data = encode(&ping()).unwrap();
        assert!(matches!(
            decode(&data[..data.len() - 1]),
            Err(CodecError::TooShort(_))
        ));
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let packet = Packet::new(Message::Publish(Payload::Bytes(vec![0u8; MAX_PACKET_SIZE])));
        assert!(matches!(encode(&packet), Err(CodecError::TooLarge(_))));
    }
}
