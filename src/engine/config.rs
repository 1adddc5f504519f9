//! Engine configuration

use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::network::limiter::DEFAULT_RATE_LIMIT;
use crate::network::packet::PACKET_TTL;
use crate::network::peer::MAX_PEERS;
use crate::storage::cache::DEFAULT_CACHE_SIZE;
use crate::storage::StorageError;

/// Default main port
pub const DEFAULT_PORT: u16 = 9777;

/// Default port that only publicly reachable peers can be reached on
pub const DEFAULT_TEST_PORT: u16 = 9778;

/// Keepalive window and heartbeat period (ms)
pub const KEEP_ALIVE: u64 = 29_000;

/// Relay budget of a gossip packet
pub const DEFAULT_MAX_HOPS: u32 = 16;

/// A bootstrap contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPeer {
    pub address: String,
    pub port: u16,
    pub peer_id: String,
}

/// Relay engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Main UDP port
    pub port: u16,
    /// Secondary port probed by reflection to detect a static address
    pub test_port: u16,
    /// Heartbeat period, also the idle timeout for clustered peers (ms)
    pub keepalive: u64,
    /// Introducers are static and never reflect
    pub introducer: bool,
    /// Known public address
    pub address: Option<String>,
    pub cluster_id: Option<String>,
    /// Defaults to the hash of the public key
    pub peer_id: Option<String>,
    /// Hex secret key; generated when absent
    pub keys: Option<String>,
    pub max_hops: u32,
    /// Lifetime of cached packets (ms)
    pub packet_ttl: u64,
    pub rate_limit: u32,
    pub max_peers: usize,
    pub cache_size: usize,
    pub seeds: Vec<SeedPeer>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            test_port: DEFAULT_TEST_PORT,
            keepalive: KEEP_ALIVE,
            introducer: false,
            address: None,
            cluster_id: None,
            peer_id: None,
            keys: None,
            max_hops: DEFAULT_MAX_HOPS,
            packet_ttl: PACKET_TTL,
            rate_limit: DEFAULT_RATE_LIMIT,
            max_peers: MAX_PEERS,
            cache_size: DEFAULT_CACHE_SIZE,
            seeds: Vec::new(),
        }
    }
}

impl Config {
    /// Load a JSON configuration file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        let file = fs::File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 9777);
        assert_eq!(config.test_port, 9778);
        assert_eq!(config.keepalive, 29_000);
        assert_eq!(config.max_hops, 16);
        assert_eq!(config.rate_limit, 2048);
        assert_eq!(config.max_peers, 4096);
        assert!(!config.introducer);
    }

    #[test]
    fn test_load_partial_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("relay.json");
        fs::write(
            &path,
            r#"{"port": 4000, "introducer": true, "seeds": [{"address": "1.2.3.4", "port": 9777, "peer_id": "abc"}]}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.port, 4000);
        assert!(config.introducer);
        assert_eq!(config.test_port, DEFAULT_TEST_PORT);
        assert_eq!(config.seeds[0].peer_id, "abc");

        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }
}
