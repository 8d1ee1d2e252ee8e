pub mod binding;
pub mod listener;
pub mod lookup;
pub mod stateless;

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use codec::{
    Error,
    crypto::{RETRY_KEY_LENGTH, RetryKey},
    header::Cid,
};
use rand::Rng;

use crate::stateless::StatelessContext;

/// One received or outgoing UDP payload with its addressing.
///
/// Ownership transfers into the binding for the duration of the receive
/// callback; dropping the datagram returns it to the datapath.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub bytes: Bytes,
}

/// The raw UDP I/O surface the binding sends through.
pub trait Datapath: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddr;
    fn send_to(&self, remote: SocketAddr, payload: Bytes) -> std::io::Result<()>;
}

/// A connection as the binding sees it: something datagram sub-chains
/// can be enqueued to. The state machine behind it lives elsewhere.
///
/// References handed out by the lookup table are `Arc` clones; a clone
/// taken under the table lock is the snapshot that outlives the
/// observation, and dropping it is the release.
pub trait Connection: Send + Sync + 'static {
    fn receive(&self, datagrams: Vec<Datagram>);
    fn unreachable(&self, remote: SocketAddr);
}

/// Everything known about a handshake at the moment the binding asks
/// for a connection to be created.
#[derive(Debug, Clone, Copy)]
pub struct NewConnection {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    /// The client-chosen Dest-CID the connection is initially reachable
    /// under.
    pub dest_cid: Cid,
    pub source_cid: Cid,
    pub version: u32,
    /// Present when the Initial carried a valid Retry token; the CID
    /// the client used before it was redirected.
    pub orig_dest_cid: Option<Cid>,
}

/// The session layer's side of the contract.
pub trait Handler: Send + Sync + 'static {
    type Connection: Connection;

    /// Consulted before stateless admission and connection creation;
    /// overloaded workers shed both.
    fn is_overloaded(&self) -> bool {
        false
    }

    /// Create the per-connection state for an accepted handshake, or
    /// `None` when the session layer cannot (resource exhaustion). The
    /// binding drops the triggering sub-chain in that case.
    fn create_connection(&self, info: &NewConnection) -> Option<Arc<Self::Connection>>;

    /// Hand an admitted stateless operation to a worker. The worker
    /// later drives it through `process_stateless_operation`.
    fn dispatch_stateless(&self, ctx: Arc<StatelessContext>);
}

pub struct EndpointOptions {
    /// Fraction of total memory, in 1/65535 units, that handshake state
    /// may consume before new Initials must present a Retry token.
    pub retry_memory_limit: u16,
    /// Total memory estimate in bytes. Zero disables the Retry gate.
    pub total_memory: u64,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            retry_memory_limit: 65,
            total_memory: 0,
        }
    }
}

/// Process-wide state shared by every binding: the Retry token AEAD key
/// and the handshake memory accounting behind the Retry gate.
///
/// Modeled as an explicit context object threaded through
/// initialization rather than ambient globals.
pub struct Endpoint {
    retry_key: RetryKey,
    retry_memory_limit: u16,
    total_memory: u64,
    handshake_memory: AtomicU64,
}

impl Endpoint {
    pub fn new(options: EndpointOptions) -> Result<Arc<Self>, Error> {
        let mut key = [0u8; RETRY_KEY_LENGTH];
        rand::rng().fill(&mut key);

        Ok(Arc::new(Self {
            retry_key: RetryKey::new(&key)?,
            retry_memory_limit: options.retry_memory_limit,
            total_memory: options.total_memory,
            handshake_memory: AtomicU64::new(0),
        }))
    }

    pub fn retry_key(&self) -> &RetryKey {
        &self.retry_key
    }

    /// Account memory taken by a connection still in handshake.
    pub fn add_handshake_memory(&self, bytes: u64) {
        self.handshake_memory.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Release accounting once a handshake completes or fails.
    pub fn release_handshake_memory(&self, bytes: u64) {
        self.handshake_memory.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn handshake_memory(&self) -> u64 {
        self.handshake_memory.load(Ordering::Relaxed)
    }

    /// Whether aggregate handshake memory has crossed the configured
    /// fraction of total memory.
    pub fn retry_required(&self) -> bool {
        if self.total_memory == 0 {
            return false;
        }

        let limit =
            self.total_memory as u128 * self.retry_memory_limit as u128 / u16::MAX as u128;
        self.handshake_memory.load(Ordering::Relaxed) as u128 >= limit
    }
}
