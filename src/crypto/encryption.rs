//! Payload encryption for published packets
//!
//! A keyring of secp256k1 key pairs indexed by hex public key. Publishing
//! to a key seals the payload so only holders of the matching secret can
//! open it: an ephemeral key agrees a shared secret with the destination
//! (ECDH), HKDF-SHA256 stretches it into a ChaCha20-Poly1305 key.
//!
//! Sealed layout: `ephemeral_pub (33) | nonce (12) | ciphertext + tag`.

use std::collections::HashMap;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use secp256k1::{ecdh::SharedSecret, PublicKey};
use sha2::Sha256;
use thiserror::Error;

use super::keys::{public_key_from_hex, KeyPair};

const PUBLIC_KEY_SIZE: usize = 33;
const NONCE_SIZE: usize = 12;
const SEAL_INFO: &[u8] = b"stream-relay/seal/v1";

/// Encryption errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("No key held for {0}")]
    UnknownKey(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Encryption failed")]
    Encryption,
    #[error("Decryption failed: {0}")]
    Decryption(String),
}

/// Keyring used to seal and open packet payloads
#[derive(Debug, Clone)]
pub struct Encryption {
    /// The peer's own key pair
    local: KeyPair,
    /// Every key pair this peer can open, by hex public key
    keys: HashMap<String, KeyPair>,
}

impl Encryption {
    /// Create a keyring around an optional existing key pair
    pub fn new(keys: Option<KeyPair>) -> Self {
        let local = keys.unwrap_or_else(KeyPair::generate);
        let mut ring = HashMap::new();
        ring.insert(local.public_key_hex(), local.clone());
        Self { local, keys: ring }
    }

    /// Hex public key of the local key pair
    pub fn public_key(&self) -> String {
        self.local.public_key_hex()
    }

    /// Add a shared key pair (e.g. a cluster key); returns its public key
    pub fn add(&mut self, pair: KeyPair) -> String {
        let public = pair.public_key_hex();
        self.keys.insert(public.clone(), pair);
        public
    }

    /// Whether the secret for `key` is held
    pub fn has(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }

    /// Seal `plaintext` so that only holders of `key` can open it
    pub fn seal(&self, plaintext: &[u8], key: &str) -> Result<Vec<u8>, CryptoError> {
        let recipient =
            public_key_from_hex(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let ephemeral = KeyPair::generate();
        let shared = SharedSecret::new(&recipient, &ephemeral.secret_key);
        let ephemeral_pub = ephemeral.public_key.serialize();
        let cipher = cipher_for(&shared, &ephemeral_pub)?;

        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut sealed = Vec::with_capacity(PUBLIC_KEY_SIZE + NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&ephemeral_pub);
        sealed.extend_from_slice(&nonce);
        sealed.append(&mut ciphertext);
        Ok(sealed)
    }

    /// Open a payload sealed for `key`
    pub fn open(&self, sealed: &[u8], key: &str) -> Result<Vec<u8>, CryptoError> {
        let pair = self
            .keys
            .get(key)
            .ok_or_else(|| CryptoError::UnknownKey(key.to_string()))?;

        if sealed.len() < PUBLIC_KEY_SIZE + NONCE_SIZE {
            return Err(CryptoError::Decryption("ciphertext too short".to_string()));
        }

        let (ephemeral_pub, rest) = sealed.split_at(PUBLIC_KEY_SIZE);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);
        let ephemeral = PublicKey::from_slice(ephemeral_pub)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;

        let shared = SharedSecret::new(&ephemeral, &pair.secret_key);
        let cipher = cipher_for(&shared, ephemeral_pub)?;

        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decryption("authentication failed".to_string()))
    }
}

fn cipher_for(shared: &SharedSecret, salt: &[u8]) -> Result<ChaCha20Poly1305, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), &shared.secret_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(SEAL_INFO, &mut key)
        .map_err(|_| CryptoError::Encryption)?;
    Ok(ChaCha20Poly1305::new(&key.into()))
}
