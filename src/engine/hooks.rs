//! Application callbacks and override points
//!
//! Every method has a default, so an application only implements what it
//! needs. Hooks run synchronously on the engine's thread.

use crate::engine::EngineError;
use crate::network::packet::Packet;
use crate::network::peer::{NatType, RemotePeer};

pub trait Hooks: Send {
    fn on_listening(&mut self) {}

    /// Once per heartbeat
    fn on_interval(&mut self) {}

    /// A cached packet expired and was evicted
    fn on_delete(&mut self, _packet: &Packet) {}

    /// A packet was delivered locally (opened, or published by this peer)
    fn on_packet(&mut self, _packet: &Packet, _port: u16, _address: &str) {}

    /// A publish or answer was stored
    fn on_pub(&mut self, _packet: &Packet, _port: u16, _address: &str) {}

    /// Return true when the query was answered and must not be re-flooded
    fn on_query(&mut self, _packet: &Packet, _port: u16, _address: &str) -> bool {
        false
    }

    fn on_connect(&mut self, _peer: &RemotePeer, _packet: &Packet, _port: u16, _address: &str) {}

    fn on_nat(&mut self, _nat_type: NatType) {}

    fn on_error(&mut self, error: &EngineError) {
        log::warn!("Relay error: {}", error);
    }

    /// Every admitted, decoded packet
    fn on_data(&mut self, _packet: &Packet, _port: u16, _address: &str) {}

    /// Return false to drop the packet before dispatch
    fn firewall(&mut self, _packet: &Packet, _port: u16, _address: &str) -> bool {
        true
    }

    /// Consulted once a sender is over its credit; true admits the datagram
    fn limit(&mut self, _data: &[u8], _port: u16, _address: &str) -> bool {
        false
    }

    /// Decide whether a stored publish is accepted for re-flooding.
    /// `None` falls back to opening it with a held key.
    fn predicate_open_packet(&mut self, _packet: &Packet, _port: u16, _address: &str) -> Option<bool> {
        None
    }

    /// Transform an outgoing payload. `None` seals it for the destination key.
    fn prepare_message(&mut self, _message: &[u8], _peer_id: Option<&str>) -> Option<Vec<u8>> {
        None
    }
}

/// Hooks that keep every default
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl Hooks for NoHooks {}
