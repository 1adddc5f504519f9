//! The relay peer engine
//!
//! `Peer` is a synchronous state machine: datagrams go in through
//! `on_message`, deferred work comes due through `poll_timers`, and every
//! outbound datagram leaves through the injected `Transport`. Time,
//! randomness and application callbacks are injected as well, so the same
//! engine runs under the tokio `Node` driver or inside a simulated network.

pub mod config;
pub mod dispatch;
pub mod heartbeat;
pub mod hooks;
pub mod mcast;
pub mod nat;
pub mod publish;
pub mod timer;


use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use thiserror::Error;

use crate::crypto::{nonce, sha256_hex, CryptoError, Encryption, KeyError, KeyPair};
use crate::network::codec::{self, CodecError};
use crate::network::limiter::RateLimiter;
use crate::network::packet::{Introduction, Message, Packet, Probe, QueryMessage};
use crate::network::peer::{NatType, PeerError, PeerTable, RemotePeer, DEFAULT_FANOUT};
use crate::network::transport::{Transport, TransportError};
use crate::storage::{Cache, PersistedState, StorageError};

pub use config::{Config, SeedPeer, DEFAULT_MAX_HOPS, DEFAULT_PORT, DEFAULT_TEST_PORT, KEEP_ALIVE};
pub use hooks::{Hooks, NoHooks};
pub use nat::PortGenerator;
pub use publish::PublishOptions;
pub use timer::{Clock, ManualClock, SystemClock, TimerQueue};

/// Ping retry delays after the first send (ms)
pub const PING_RETRIES: [u64; 3] = [500, 4_000, 8_000];

/// Heartbeat ticks a query id is remembered for
pub const QUERY_TTL: u32 = 32;

/// Delay before unpublished packets are re-sent after a reconnect (ms)
pub const REPUBLISH_DELAY: u64 = 1024;

/// Engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("A destination key is required to publish")]
    MissingDestination,
    #[error("Engine is closed")]
    Closed,
}

/// Deferred engine work
#[derive(Debug, Clone)]
pub(crate) enum Task {
    Heartbeat,
    PingRetry {
        peer_id: String,
        address: String,
        port: u16,
        data: Vec<u8>,
        ping_id: Option<String>,
        sent_at: u64,
    },
    McastSend {
        packet_id: String,
        address: String,
        port: u16,
        data: Vec<u8>,
    },
    Punch(nat::Punch),
    IntroPair {
        joiner: (String, u16, Vec<u8>),
        peer: (String, u16, Vec<u8>),
    },
    Republish,
}

/// A relay peer
pub struct Peer {
    pub(crate) config: Config,
    pub(crate) peer_id: String,
    pub(crate) cluster_id: Option<String>,
    pub(crate) nat_type: NatType,
    pub(crate) address: Option<String>,
    pub(crate) port: Option<u16>,
    /// Pending NAT probe correlation token
    pub(crate) reflection_id: Option<String>,
    pub(crate) peers: PeerTable,
    pub(crate) cache: Cache,
    /// Packet id -> cluster id, until a send is confirmed
    pub(crate) unpublished: HashMap<String, Option<String>>,
    /// Query id -> remaining heartbeat ticks
    pub(crate) queries: HashMap<String, u32>,
    pub(crate) limits: RateLimiter,
    /// Burst ports for punching out of a hard NAT
    pub(crate) bdp_cache: Vec<u16>,
    pub(crate) encryption: Encryption,
    pub(crate) timers: TimerQueue<Task>,
    pub(crate) last_update: u64,
    pub(crate) listening: bool,
    transport: Box<dyn Transport>,
    clock: Box<dyn Clock>,
    pub(crate) rng: Box<dyn RngCore + Send>,
    pub(crate) hooks: Box<dyn Hooks>,
}

impl Peer {
    /// Create an engine from configuration.
    ///
    /// The resolved peer id and secret key are written back into the config
    /// so a persisted state restores the same identity.
    pub fn new<T: Transport + 'static>(mut config: Config, transport: T) -> Result<Self, EngineError> {
        let keys = match config.keys.as_deref() {
            Some(secret) => KeyPair::from_private_key_hex(secret)?,
            None => KeyPair::generate(),
        };
        config.keys = Some(keys.private_key_hex());
        let peer_id = config.peer_id.clone().unwrap_or_else(|| keys.peer_id());
        config.peer_id = Some(peer_id.clone());

        let mut peers = PeerTable::new(config.max_peers);
        for seed in &config.seeds {
            match RemotePeer::new(&seed.peer_id, &seed.address, seed.port, None, None, 0) {
                Ok(peer) => peers.insert(peer),
                Err(e) => log::warn!("Ignoring seed {}:{}: {}", seed.address, seed.port, e),
            }
        }

        let (nat_type, port) = if config.introducer {
            (NatType::Static, Some(config.port))
        } else {
            (NatType::Unknown, None)
        };

        Ok(Self {
            peer_id,
            cluster_id: config.cluster_id.clone(),
            nat_type,
            address: config.address.clone(),
            port,
            reflection_id: None,
            peers,
            cache: Cache::new(config.cache_size),
            unpublished: HashMap::new(),
            queries: HashMap::new(),
            limits: RateLimiter::new(config.rate_limit),
            bdp_cache: Vec::new(),
            encryption: Encryption::new(Some(keys)),
            timers: TimerQueue::new(),
            last_update: 0,
            listening: false,
            transport: Box::new(transport),
            clock: Box::new(SystemClock),
            rng: Box::new(StdRng::from_entropy()),
            hooks: Box::new(NoHooks),
            config,
        })
    }

    /// Reconstruct an engine from persisted state
    pub fn restore<T: Transport + 'static>(
        state: PersistedState,
        transport: T,
    ) -> Result<Self, EngineError> {
        let mut peer = Self::new(state.config, transport)?;
        peer.cache = Cache::from_entries(state.data, peer.config.cache_size);
        peer.unpublished = state.unpublished;
        log::info!(
            "Restored {} cached packets ({} unpublished)",
            peer.cache.len(),
            peer.unpublished.len()
        );
        Ok(peer)
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_rng<R: RngCore + Send + 'static>(mut self, rng: R) -> Self {
        self.rng = Box::new(rng);
        self
    }

    pub fn with_hooks<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn set_hooks<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks = Box::new(hooks);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn cluster_id(&self) -> Option<&str> {
        self.cluster_id.as_deref()
    }

    pub fn nat_type(&self) -> NatType {
        self.nat_type
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn public_key(&self) -> String {
        self.encryption.public_key()
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn unpublished(&self) -> &HashMap<String, Option<String>> {
        &self.unpublished
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn is_closing(&self) -> bool {
        self.timers.is_closed()
    }

    /// Hold a shared key pair (e.g. a cluster key); returns its public key
    pub fn add_key(&mut self, pair: KeyPair) -> String {
        self.encryption.add(pair)
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Snapshot for persistence
    pub fn state(&self) -> PersistedState {
        PersistedState {
            config: self.config.clone(),
            data: self.cache.entries(),
            unpublished: self.unpublished.clone(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// The sockets are bound: start the heartbeat (which also reflects)
    pub fn start(&mut self) {
        if self.listening || self.is_closing() {
            return;
        }
        self.listening = true;
        log::info!(
            "Relay {} listening (nat={}, introducer={})",
            short_id(&self.peer_id),
            self.nat_type,
            self.config.introducer
        );
        self.hooks.on_listening();
        let now = self.now();
        self.timers.schedule(now, Task::Heartbeat);
    }

    /// Stop: cancel every scheduled task and refuse new ones
    pub fn close(&mut self) {
        if !self.is_closing() {
            log::info!("Relay {} closing", short_id(&self.peer_id));
        }
        self.timers.close();
    }

    /// Earliest deadline the driver should wake up for
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    /// Run every task that is due
    pub fn poll_timers(&mut self) {
        let now = self.now();
        while let Some(task) = self.timers.pop_due(now) {
            self.run_task(task);
        }
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::Heartbeat => self.heartbeat(),
            Task::PingRetry {
                peer_id,
                address,
                port,
                data,
                ping_id,
                sent_at,
            } => self.retry_ping(&peer_id, &address, port, &data, ping_id.as_deref(), sent_at),
            Task::McastSend {
                packet_id,
                address,
                port,
                data,
            } => {
                if self.send(&data, port, &address) {
                    self.unpublished.remove(&packet_id);
                }
            }
            Task::Punch(punch) => self.punch(punch),
            Task::IntroPair { joiner, peer } => {
                self.send(&peer.2, peer.1, &peer.0);
                self.send(&joiner.2, joiner.1, &joiner.0);
            }
            Task::Republish => self.republish(),
        }
    }

    /// Announce this peer (and its cluster) to selected peers
    pub fn join(&mut self) -> Result<(), EngineError> {
        if self.is_closing() {
            return Err(EngineError::Closed);
        }
        let Some(port) = self.port else {
            log::debug!("Join skipped: public port not known yet");
            return Ok(());
        };

        let packet = Packet::new(Message::Join(Introduction {
            peer_id: self.peer_id.clone(),
            nat_type: Some(self.nat_type).filter(|n| n.is_known()),
            cluster_id: self.cluster_id.clone(),
            address: self.address.clone(),
            port: Some(port),
            ping_id: None,
        }))
        .with_cluster(self.cluster_id.clone());
        let data = codec::encode(&packet)?;

        let cluster_id = self.cluster_id.clone();
        for peer in self.select(cluster_id.as_deref(), DEFAULT_FANOUT) {
            self.send(&data, peer.port, &peer.address);
        }
        Ok(())
    }

    /// The network came back: rejoin, then re-send what was never confirmed
    pub fn reconnect(&mut self) -> Result<(), EngineError> {
        self.join()?;
        let now = self.now();
        self.timers.schedule(now + REPUBLISH_DELAY, Task::Republish);
        Ok(())
    }

    fn republish(&mut self) {
        let pending: Vec<String> = self.unpublished.keys().cloned().collect();
        log::debug!("Re-publishing {} unconfirmed packets", pending.len());

        for packet_id in pending {
            if let Some(packet) = self.cache.get(&packet_id).cloned() {
                if let Err(e) = self.mcast(&packet, Vec::new(), false) {
                    self.hooks.on_error(&e);
                }
            }
        }
    }

    /// Flood a query through the network
    pub fn query(&mut self, body: serde_json::Value) -> Result<Packet, EngineError> {
        if self.is_closing() {
            return Err(EngineError::Closed);
        }

        let message = QueryMessage {
            peer_id: Some(self.peer_id.clone()),
            history: Vec::new(),
            body,
        };
        let mut seed = serde_json::to_vec(&message).map_err(CodecError::from)?;
        seed.extend_from_slice(nonce(&mut *self.rng).as_bytes());

        let mut packet = Packet::new(Message::Query(message))
            .with_cluster(self.cluster_id.clone())
            .with_id(sha256_hex(&seed));
        packet.timestamp = self.now();

        self.queries.insert(packet.packet_id.clone(), QUERY_TTL);
        self.mcast(&packet, Vec::new(), false)?;
        Ok(packet)
    }

    // =========================================================================
    // Shared helpers
    // =========================================================================

    /// Send one datagram; failures are reported through `on_error`
    pub(crate) fn send(&mut self, data: &[u8], port: u16, address: &str) -> bool {
        match self.transport.send(data, port, address) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Send to {}:{} failed: {}", address, port, e);
                let error = EngineError::from(e);
                self.hooks.on_error(&error);
                false
            }
        }
    }

    pub(crate) fn send_packet(&mut self, packet: &Packet, port: u16, address: &str) -> Result<bool, EngineError> {
        let data = codec::encode(packet)?;
        Ok(self.send(&data, port, address))
    }

    /// Select recipients from the whole peer table
    pub(crate) fn select(&mut self, cluster_id: Option<&str>, n: usize) -> Vec<RemotePeer> {
        self.peers
            .select(self.nat_type, cluster_id, n, &mut *self.rng)
    }

    /// Upsert the sender of `packet`, observed at `address:port`
    pub(crate) fn set_peer(&mut self, packet: &Packet, port: u16, address: &str) -> Option<RemotePeer> {
        if self.address.as_deref() == Some(address) && self.port == Some(port) {
            return None;
        }
        let peer_id = packet.message.peer_id()?;
        if peer_id == self.peer_id {
            return None;
        }

        let now = self.now();
        match self.peers.upsert(
            peer_id,
            packet.message.nat_type(),
            packet.cluster_id.clone(),
            port,
            address,
            now,
        ) {
            Ok(peer) => Some(peer.clone()),
            Err(e) => {
                log::debug!("Peer {} not admitted: {}", short_id(peer_id), e);
                None
            }
        }
    }

    /// Send a ping, retried on a fixed backoff until the peer answers
    pub(crate) fn ping(&mut self, peer: &RemotePeer, probe: Probe) -> Result<(), EngineError> {
        if self.is_closing() {
            return Ok(());
        }

        let ping_id = probe.ping_id.clone();
        let packet = Packet::new(Message::Ping(probe)).with_cluster(self.cluster_id.clone());
        let data = codec::encode(&packet)?;

        let now = self.now();
        self.send(&data, peer.port, &peer.address);
        if let Some(p) = self.peers.get_mut(&peer.peer_id) {
            p.last_request = now;
        }

        let token = self.timers.child_token();
        for delay in PING_RETRIES {
            let task = Task::PingRetry {
                peer_id: peer.peer_id.clone(),
                address: peer.address.clone(),
                port: peer.port,
                data: data.clone(),
                ping_id: ping_id.clone(),
                sent_at: now,
            };
            self.timers.schedule_with(now + delay, task, token.clone());
        }
        Ok(())
    }

    fn retry_ping(
        &mut self,
        peer_id: &str,
        address: &str,
        port: u16,
        data: &[u8],
        ping_id: Option<&str>,
        sent_at: u64,
    ) {
        let answered = self.peers.get(peer_id).map_or(false, |p| match ping_id {
            Some(id) => p.ping_id.as_deref() == Some(id),
            None => p.last_update > sent_at,
        });
        if answered {
            return;
        }

        let now = self.now();
        self.send(data, port, address);
        if let Some(p) = self.peers.get_mut(peer_id) {
            p.last_request = now;
        }
    }

    /// A connection was established with `peer`
    pub(crate) fn on_connection(&mut self, peer: &RemotePeer, packet: &Packet, port: u16, address: &str) {
        if self.is_closing() || self.config.introducer {
            return;
        }
        log::debug!(
            "Connected {} <-> {} ({}:{})",
            short_id(&self.peer_id),
            short_id(&peer.peer_id),
            peer.address,
            peer.port
        );
        if let Err(e) = self.negotiate_cache(packet, port, address) {
            self.hooks.on_error(&e);
        }
        self.hooks.on_connect(peer, packet, port, address);
    }
}

/// Abbreviated id for logs
pub(crate) fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
