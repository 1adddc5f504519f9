//! Tokio node driver
//!
//! Owns the UDP sockets and drives a `Peer`: datagrams from either socket go
//! to `on_message`, the engine's outbound queue is written to the main
//! socket, the loop sleeps until the next timer deadline, and application
//! requests arrive as `Command`s from any number of `NodeHandle`s.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use crate::engine::{Config, EngineError, Peer, PublishOptions};
use crate::network::codec::MAX_PACKET_SIZE;
use crate::network::packet::Packet;
use crate::network::peer::RemotePeer;
use crate::network::transport::{send_outbound, Outbound, TransportError, UdpTransport};
use crate::storage::PersistedState;

/// Command queue depth
const COMMAND_BUFFER: usize = 64;

/// Longest idle wait when nothing is scheduled
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Requests from `NodeHandle` to the running node
#[derive(Debug)]
pub enum Command {
    Publish(PublishOptions, oneshot::Sender<Result<Vec<Packet>, EngineError>>),
    Query(serde_json::Value, oneshot::Sender<Result<Packet, EngineError>>),
    Join(oneshot::Sender<Result<(), EngineError>>),
    Reconnect(oneshot::Sender<Result<(), EngineError>>),
    Peers(oneshot::Sender<Vec<RemotePeer>>),
    State(oneshot::Sender<PersistedState>),
    Close,
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable client of a running `Node`
#[derive(Debug, Clone)]
pub struct NodeHandle {
    tx: mpsc::Sender<Command>,
}

impl NodeHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| EngineError::Closed)?;
        response.await.map_err(|_| EngineError::Closed)
    }

    pub async fn publish(&self, options: PublishOptions) -> Result<Vec<Packet>, EngineError> {
        self.request(|reply| Command::Publish(options, reply)).await?
    }

    pub async fn query(&self, body: serde_json::Value) -> Result<Packet, EngineError> {
        self.request(|reply| Command::Query(body, reply)).await?
    }

    pub async fn join(&self) -> Result<(), EngineError> {
        self.request(Command::Join).await?
    }

    pub async fn reconnect(&self) -> Result<(), EngineError> {
        self.request(Command::Reconnect).await?
    }

    pub async fn peers(&self) -> Result<Vec<RemotePeer>, EngineError> {
        self.request(Command::Peers).await
    }

    pub async fn state(&self) -> Result<PersistedState, EngineError> {
        self.request(Command::State).await
    }

    /// Ask the node to stop; `Node::run` then returns the engine
    pub async fn close(&self) -> Result<(), EngineError> {
        self.tx
            .send(Command::Close)
            .await
            .map_err(|_| EngineError::Closed)
    }
}

// =============================================================================
// Node
// =============================================================================

/// A peer bound to its UDP sockets
pub struct Node {
    peer: Peer,
    socket: UdpSocket,
    /// Receives reflection replies; absent when the test port is 0
    test_socket: Option<UdpSocket>,
    /// Datagrams the engine sent, in order
    outbox: mpsc::UnboundedReceiver<Outbound>,
    commands: mpsc::Receiver<Command>,
}

impl Node {
    /// Bind a fresh peer
    pub async fn bind(config: Config) -> Result<(Self, NodeHandle), EngineError> {
        Self::restore(PersistedState {
            config,
            ..Default::default()
        })
        .await
    }

    /// Bind a peer restored from persisted state.
    ///
    /// A configured port of 0 binds an ephemeral port, which is then written
    /// back into the configuration.
    pub async fn restore(mut state: PersistedState) -> Result<(Self, NodeHandle), EngineError> {
        let socket = bind_socket(state.config.port).await?;
        state.config.port = socket.local_addr().map_err(TransportError::from)?.port();

        let test_socket = if state.config.test_port == 0 {
            None
        } else {
            match bind_socket(state.config.test_port).await {
                Ok(test) => Some(test),
                Err(e) => {
                    log::warn!("Test port {} unavailable: {}", state.config.test_port, e);
                    None
                }
            }
        };

        let (transport, outbox) = UdpTransport::channel();
        let peer = Peer::restore(state, transport)?;
        log::info!(
            "Bound relay {} on port {}",
            peer.peer_id(),
            peer.config().port
        );

        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let node = Self {
            peer,
            socket,
            test_socket,
            outbox,
            commands,
        };
        Ok((node, NodeHandle { tx }))
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Configure the engine (hooks, keys) before running
    pub fn peer_mut(&mut self) -> &mut Peer {
        &mut self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr, EngineError> {
        Ok(self.socket.local_addr().map_err(TransportError::from)?)
    }

    /// Drive the engine until it is closed, then hand it back
    pub async fn run(self) -> Result<Peer, EngineError> {
        let Node {
            mut peer,
            socket,
            test_socket,
            mut outbox,
            mut commands,
        } = self;

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let mut test_buf = vec![0u8; MAX_PACKET_SIZE];

        peer.start();

        while !peer.is_closing() {
            let wait = match peer.next_deadline() {
                Some(deadline) => Duration::from_millis(deadline.saturating_sub(peer.now())),
                None => IDLE_WAIT,
            };

            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => deliver(&mut peer, &buf[..len], from),
                    Err(e) => log::debug!("Receive error: {}", e),
                },
                received = recv_optional(test_socket.as_ref(), &mut test_buf) => match received {
                    Ok((len, from)) => deliver(&mut peer, &test_buf[..len], from),
                    Err(e) => log::debug!("Test port receive error: {}", e),
                },
                Some(outbound) = outbox.recv() => write(&socket, &outbound).await,
                _ = tokio::time::sleep(wait) => peer.poll_timers(),
                command = commands.recv() => match command {
                    Some(command) => execute(&mut peer, command),
                    None => peer.close(),
                },
            }
        }

        // whatever was sent before closing still goes out
        while let Ok(outbound) = outbox.try_recv() {
            write(&socket, &outbound).await;
        }

        log::info!("Relay {} stopped", peer.peer_id());
        Ok(peer)
    }
}

async fn bind_socket(port: u16) -> Result<UdpSocket, EngineError> {
    Ok(UdpSocket::bind(("0.0.0.0", port))
        .await
        .map_err(TransportError::from)?)
}

async fn recv_optional(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

async fn write(socket: &UdpSocket, outbound: &Outbound) {
    if let Err(e) = send_outbound(socket, outbound).await {
        log::debug!("Send to {} failed: {}", outbound.target, e);
    }
}

fn deliver(peer: &mut Peer, data: &[u8], from: SocketAddr) {
    peer.on_message(data, from.port(), &from.ip().to_string());
}

fn execute(peer: &mut Peer, command: Command) {
    // a dropped receiver only means the caller stopped waiting
    match command {
        Command::Publish(options, reply) => {
            let _ = reply.send(peer.publish(options));
        }
        Command::Query(body, reply) => {
            let _ = reply.send(peer.query(body));
        }
        Command::Join(reply) => {
            let _ = reply.send(peer.join());
        }
        Command::Reconnect(reply) => {
            let _ = reply.send(peer.reconnect());
        }
        Command::Peers(reply) => {
            let _ = reply.send(peer.peers().iter().cloned().collect());
        }
        Command::State(reply) => {
            let _ = reply.send(peer.state());
        }
        Command::Close => peer.close(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SeedPeer;
    use crate::network::codec;
    use crate::network::packet::{Message, Probe};

    fn local_config() -> Config {
        Config {
            port: 0,
            test_port: 0,
            introducer: true,
            address: Some("127.0.0.1".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_node_answers_ping_and_closes() {
        let (node, handle) = Node::bind(local_config()).await.unwrap();
        let port = node.local_addr().unwrap().port();
        assert_ne!(port, 0);
        assert_eq!(node.peer().config().port, port);

        let running = tokio::spawn(node.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ping = Packet::new(Message::Ping(Probe {
            peer_id: "client".to_string(),
            ping_id: Some("p-1".to_string()),
            ..Default::default()
        }));
        client
            .send_to(&codec::encode(&ping).unwrap(), ("127.0.0.1", port))
            .await
            .unwrap();

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let Message::Pong(pong) = codec::decode(&buf[..len]).unwrap().message else {
            panic!("expected a pong");
        };
        assert_eq!(pong.ping_id.as_deref(), Some("p-1"));

        let peers = handle.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id, "client");

        handle.close().await.unwrap();
        let peer = running.await.unwrap().unwrap();
        assert!(peer.is_closing());
        assert!(matches!(handle.join().await, Err(EngineError::Closed)));
    }

    #[tokio::test]
    async fn test_first_heartbeat_reaches_seed() {
        let seed = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = Config {
            port: 0,
            test_port: 0,
            seeds: vec![SeedPeer {
                address: "127.0.0.1".to_string(),
                port: seed.local_addr().unwrap().port(),
                peer_id: "seed".to_string(),
            }],
            ..Default::default()
        };
        let (node, handle) = Node::bind(config).await.unwrap();
        let running = tokio::spawn(node.run());

        // a reflection ping and a heartbeat ping, sent as soon as the loop starts
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let mut kinds = Vec::new();
        for _ in 0..2 {
            let (len, _) = tokio::time::timeout(Duration::from_secs(5), seed.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let Message::Ping(probe) = codec::decode(&buf[..len]).unwrap().message else {
                panic!("expected a ping");
            };
            kinds.push((probe.is_reflection, probe.is_heartbeat));
        }
        assert!(kinds.contains(&(true, false)));
        assert!(kinds.contains(&(false, true)));

        handle.close().await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_publish_through_handle() {
        let (node, handle) = Node::bind(local_config()).await.unwrap();
        let to = node.peer().public_key();
        let running = tokio::spawn(node.run());

        let packets = handle
            .publish(PublishOptions::new(to, b"through the handle".to_vec()))
            .await
            .unwrap();
        assert_eq!(packets.len(), 1);

        let state = handle.state().await.unwrap();
        assert!(state
            .data
            .iter()
            .any(|(id, _)| id == &packets[0].packet_id));

        handle.close().await.unwrap();
        running.await.unwrap().unwrap();
    }
}
