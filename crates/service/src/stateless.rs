use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;

use crate::Datagram;

/// Age at which a pending stateless operation is evicted.
pub const STATELESS_OP_EXPIRATION_MS: u64 = 3000;

/// Upper bound on pending stateless operations per binding.
pub const MAX_BINDING_STATELESS_OPERATIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatelessKind {
    VersionNegotiation,
    Retry,
    StatelessReset,
}

/// One admitted stateless response, waiting for a worker.
///
/// Removed from the table on expiration or on completion, whichever
/// comes first; the memory itself goes when the last reference drops,
/// which is whichever transition happens last.
#[derive(Debug)]
pub struct StatelessContext {
    pub remote: SocketAddr,
    pub kind: StatelessKind,
    /// The datagram that provoked the response; the builders re-read
    /// its header.
    pub datagram: Datagram,
    created: Instant,
    processed: AtomicBool,
    expired: AtomicBool,
}

impl StatelessContext {
    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Relaxed)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AdmitError {
    MaxOperations,
    AlreadyPending,
}

impl std::fmt::Display for AdmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxOperations => write!(f, "max binding operations"),
            Self::AlreadyPending => write!(f, "already in stateless oper table"),
        }
    }
}

struct Inner {
    fifo: VecDeque<Arc<StatelessContext>>,
    by_remote: HashMap<SocketAddr, Arc<StatelessContext>>,
}

/// Pending stateless responses of one binding.
///
/// Bounds the amplification work an unauthenticated peer can provoke:
/// at most one in-flight response per remote address, a hard cap on the
/// total, and lazy TTL eviction on each admission. All of it under one
/// dispatch mutex; work under the lock is O(capacity).
pub struct StatelessTable {
    inner: Mutex<Inner>,
    capacity: usize,
    expiration: Duration,
}

impl StatelessTable {
    pub fn new(capacity: usize, expiration: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                fifo: VecDeque::with_capacity(capacity),
                by_remote: HashMap::with_capacity(capacity),
            }),
            capacity,
            expiration,
        }
    }

    /// Admit a response for this remote, evicting expired entries
    /// first. The FIFO is creation-ordered, so the walk stops at the
    /// first live entry.
    ///
    /// # Test
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use bytes::Bytes;
    /// use quic_endpoint_service::{
    ///     Datagram,
    ///     stateless::{AdmitError, StatelessKind, StatelessTable},
    /// };
    ///
    /// let table = StatelessTable::new(16, Duration::from_millis(3000));
    ///
    /// let datagram = Datagram {
    ///     local: "127.0.0.1:4433".parse().unwrap(),
    ///     remote: "127.0.0.1:50000".parse().unwrap(),
    ///     bytes: Bytes::from_static(&[0x40, 0x00]),
    /// };
    ///
    /// let ctx = table
    ///     .try_admit(datagram.clone(), StatelessKind::StatelessReset)
    ///     .unwrap();
    ///
    /// assert_eq!(
    ///     table
    ///         .try_admit(datagram, StatelessKind::StatelessReset)
    ///         .unwrap_err(),
    ///     AdmitError::AlreadyPending,
    /// );
    ///
    /// table.release(&ctx);
    /// assert!(table.is_empty());
    /// ```
    pub fn try_admit(
        &self,
        datagram: Datagram,
        kind: StatelessKind,
    ) -> Result<Arc<StatelessContext>, AdmitError> {
        let remote = datagram.remote;
        let mut inner = self.inner.lock();

        let now = Instant::now();
        loop {
            match inner.fifo.front() {
                Some(head) if now.duration_since(head.created) >= self.expiration => {}
                _ => break,
            }

            if let Some(head) = inner.fifo.pop_front() {
                head.expired.store(true, Ordering::Relaxed);
                inner.by_remote.remove(&head.remote);
            }
        }

        if inner.fifo.len() >= self.capacity {
            return Err(AdmitError::MaxOperations);
        }

        if inner.by_remote.contains_key(&remote) {
            return Err(AdmitError::AlreadyPending);
        }

        let ctx = Arc::new(StatelessContext {
            remote,
            kind,
            datagram,
            created: now,
            processed: AtomicBool::new(false),
            expired: AtomicBool::new(false),
        });

        inner.fifo.push_back(ctx.clone());
        inner.by_remote.insert(remote, ctx.clone());
        Ok(ctx)
    }

    /// Mark an operation processed and take it out of the table unless
    /// the expiration walk already did.
    pub fn release(&self, ctx: &Arc<StatelessContext>) {
        ctx.processed.store(true, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        if !ctx.expired.load(Ordering::Relaxed) {
            let same = inner
                .by_remote
                .get(&ctx.remote)
                .map(|it| Arc::ptr_eq(it, ctx))
                .unwrap_or(false);
            if same {
                inner.by_remote.remove(&ctx.remote);
            }

            inner.fifo.retain(|it| !Arc::ptr_eq(it, ctx));
        }
    }

    /// Unconditional drain at binding teardown. Legal because no new
    /// receive up-calls can arrive by then.
    pub fn drain(&self) {
        let mut inner = self.inner.lock();
        for ctx in inner.fifo.drain(..) {
            ctx.expired.store(true, Ordering::Relaxed);
        }

        inner.by_remote.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
