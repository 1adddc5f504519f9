//! Datagram transports
//!
//! The engine only ever hands a finished datagram to a `Transport`; how it
//! reaches the wire is up to the implementation. `UdpTransport` queues
//! datagrams for the node loop, which writes them once the socket is
//! writable. `MemoryTransport` queues datagrams in memory so whole networks
//! can be simulated deterministically.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Transport closed")]
    Closed,
}

/// Outbound half of a datagram socket
pub trait Transport: Send {
    fn send(&self, data: &[u8], port: u16, address: &str) -> Result<(), TransportError>;
}

impl<T: Transport + Sync> Transport for Arc<T> {
    fn send(&self, data: &[u8], port: u16, address: &str) -> Result<(), TransportError> {
        (**self).send(data, port, address)
    }
}

/// Resolve a literal `address:port` pair
pub fn socket_addr(address: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let ip: IpAddr = address
        .parse()
        .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;
    Ok(SocketAddr::new(ip, port))
}

// =============================================================================
// UDP
// =============================================================================

/// A datagram waiting for the socket
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub target: SocketAddr,
    pub data: Vec<u8>,
}

/// Queues datagrams for the task that owns the UDP socket
#[derive(Debug, Clone)]
pub struct UdpTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl UdpTransport {
    /// A transport and the queue its datagrams arrive on
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for UdpTransport {
    fn send(&self, data: &[u8], port: u16, address: &str) -> Result<(), TransportError> {
        let target = socket_addr(address, port)?;
        self.tx
            .send(Outbound {
                target,
                data: data.to_vec(),
            })
            .map_err(|_| TransportError::Closed)
    }
}

/// Write one queued datagram, waiting until the socket is writable
pub async fn send_outbound(socket: &UdpSocket, outbound: &Outbound) -> Result<(), TransportError> {
    let sent = socket.send_to(&outbound.data, outbound.target).await?;
    if sent != outbound.data.len() {
        return Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            format!(
                "short send to {}: {} of {} bytes",
                outbound.target,
                sent,
                outbound.data.len()
            ),
        )));
    }
    Ok(())
}

// =============================================================================
// In-memory
// =============================================================================

/// A datagram queued by `MemoryTransport`
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    pub address: String,
    pub port: u16,
    pub data: Vec<u8>,
}

/// Queues outbound datagrams for a simulator to deliver
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    outbox: Arc<Mutex<Vec<Datagram>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued datagram
    pub fn drain(&self) -> Vec<Datagram> {
        self.outbox
            .lock()
            .map(|mut queue| std::mem::take(&mut *queue))
            .unwrap_or_default()
    }

    pub fn pending(&self) -> usize {
        self.outbox.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    /// Make every subsequent send fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Transport for MemoryTransport {
    fn send(&self, data: &[u8], port: u16, address: &str) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if address.is_empty() || port == 0 {
            return Err(TransportError::InvalidAddress(format!("{}:{}", address, port)));
        }

        let mut queue = self.outbox.lock().map_err(|_| TransportError::Closed)?;
        queue.push(Datagram {
            address: address.to_string(),
            port,
            data: data.to_vec(),
        });
        Ok(())
    }
}
