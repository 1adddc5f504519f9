//! Content hashing for packet identifiers
//!
//! Packet ids are hex-encoded SHA-256 digests. A chain head is identified by
//! the digest of its message; every later fragment is identified by the
//! digest of its predecessor's id combined with the digest of its own message,
//! so an id commits to everything that came before it in the chain.

use sha2::{Digest, Sha256};

/// Length of a hex-encoded packet id
pub const PACKET_ID_LEN: usize = 64;

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Computes SHA-256 hash and returns it as a hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Id of a chained fragment: `hash(hash(previous_id) + hash(message))`
pub fn chained_id(previous_id: &str, message: &[u8]) -> String {
    let mut joined = sha256_hex(previous_id.as_bytes());
    joined.push_str(&sha256_hex(message));
    sha256_hex(joined.as_bytes())
}

/// Random correlation token (ping ids, reflection ids)
pub fn nonce<R: rand::RngCore + ?Sized>(rng: &mut R) -> String {
    let mut bytes = [0u8; 8];
    rng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_sha256() {
        let data = b"hello world";
        let hash = sha256(data);
        assert_eq!(hash.len(), 32);
        assert_eq!(
            sha256_hex(data),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(sha256_hex(data).len(), PACKET_ID_LEN);
    }

    #[test]
    fn test_chained_id_depends_on_predecessor() {
        let a = chained_id("aaaa", b"body");
        let b = chained_id("bbbb", b"body");
        assert_ne!(a, b);
        assert_eq!(a, chained_id("aaaa", b"body"));
        assert_ne!(a, sha256_hex(b"body"));
    }

    #[test]
    fn test_nonce_is_hex() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = nonce(&mut rng);
        assert_eq!(n.len(), 16);
        assert!(hex::decode(&n).is_ok());
        assert_ne!(n, nonce(&mut rng));
    }
}
