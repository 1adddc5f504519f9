//! Cryptographic utilities for the relay
//!
//! This module provides:
//! - SHA-256 packet ids and chained fragment ids
//! - secp256k1 key management
//! - Payload sealing for published packets

pub mod encryption;
pub mod hash;
pub mod keys;

pub use encryption::{CryptoError, Encryption};
pub use hash::{chained_id, nonce, sha256, sha256_hex, PACKET_ID_LEN};
pub use keys::{public_key_from_hex, KeyError, KeyPair};
