use std::{cmp::Ordering, net::SocketAddr, ops::Deref, sync::Arc};

use parking_lot::{Condvar, Mutex, RwLock};

/// A liveness guard: while acquired, the guarded object cannot finish
/// tearing down. `run_down` closes the guard against new acquisitions
/// and blocks until the live ones drain.
pub struct Rundown {
    state: Mutex<RundownState>,
    waiter: Condvar,
}

#[derive(Default)]
struct RundownState {
    refs: usize,
    closed: bool,
}

impl Default for Rundown {
    fn default() -> Self {
        Self {
            state: Mutex::new(RundownState::default()),
            waiter: Condvar::new(),
        }
    }
}

impl Rundown {
    /// # Test
    ///
    /// ```
    /// use quic_endpoint_service::listener::Rundown;
    ///
    /// let rundown = Rundown::default();
    ///
    /// assert!(rundown.acquire());
    /// rundown.release();
    ///
    /// rundown.run_down();
    /// assert!(!rundown.acquire());
    /// ```
    pub fn acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }

        state.refs += 1;
        true
    }

    pub fn release(&self) {
        let mut state = self.state.lock();
        state.refs -= 1;

        if state.refs == 0 && state.closed {
            self.waiter.notify_all();
        }
    }

    pub fn run_down(&self) {
        let mut state = self.state.lock();
        state.closed = true;

        while state.refs > 0 {
            self.waiter.wait(&mut state);
        }
    }
}

/// One registered listener: an optional local address restriction (none
/// means any family, an unspecified address means any address within
/// the family) and the ALPN it serves.
pub struct Listener {
    local: Option<SocketAddr>,
    alpn: Vec<u8>,
    rundown: Rundown,
}

impl Listener {
    pub fn new(local: Option<SocketAddr>, alpn: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            local,
            alpn: alpn.to_vec(),
            rundown: Rundown::default(),
        })
    }

    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn alpn(&self) -> &[u8] {
        &self.alpn
    }

    // INET6 sorts before INET sorts before unrestricted.
    fn family_rank(&self) -> u8 {
        match self.local {
            Some(addr) if addr.is_ipv6() => 2,
            Some(_) => 1,
            None => 0,
        }
    }

    fn is_wildcard(&self) -> bool {
        self.local.map(|it| it.ip().is_unspecified()).unwrap_or(true)
    }

    /// Whether a handshake arriving on `local` may be served here.
    fn compatible(&self, local: SocketAddr) -> bool {
        match self.local {
            None => true,
            Some(addr) => {
                addr.is_ipv6() == local.is_ipv6()
                    && (addr.ip().is_unspecified() || addr.ip() == local.ip())
            }
        }
    }

    fn same_slot(&self, other: &Listener) -> bool {
        self.local == other.local && self.alpn == other.alpn
    }
}

fn order(a: &Listener, b: &Listener) -> Ordering {
    b.family_rank()
        .cmp(&a.family_rank())
        .then(a.is_wildcard().cmp(&b.is_wildcard()))
        .then(a.local.cmp(&b.local))
        .then(a.alpn.cmp(&b.alpn))
}

/// A selected listener, holding its rundown guard until dropped.
pub struct ListenerGuard {
    listener: Arc<Listener>,
}

impl Deref for ListenerGuard {
    type Target = Listener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.listener.rundown.release();
    }
}

/// The ordered set of listeners bound to one binding.
///
/// Kept sorted by (family descending, specific before wildcard, address,
/// ALPN); equal keys stay in registration order because new entries are
/// placed at the end of their equivalence group. Readers share the lock
/// during selection; registration takes it exclusively.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<Listener>>>,
}

impl ListenerRegistry {
    /// Register a listener; rejects a duplicate of the same family,
    /// wildcardness, address and ALPN.
    pub fn register(&self, listener: &Arc<Listener>) -> bool {
        let mut listeners = self.listeners.write();

        if listeners.iter().any(|it| it.same_slot(listener)) {
            return false;
        }

        let position = listeners.partition_point(|it| order(it, listener) != Ordering::Greater);
        listeners.insert(position, listener.clone());
        true
    }

    /// Unregister a listener and wait out in-flight selections that
    /// still hold its guard.
    pub fn unregister(&self, listener: &Arc<Listener>) {
        {
            let mut listeners = self.listeners.write();
            listeners.retain(|it| !Arc::ptr_eq(it, listener));
        }

        listener.rundown.run_down();
    }

    pub fn has_any(&self) -> bool {
        !self.listeners.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Pick the listener for a handshake.
    ///
    /// The client's ALPN list is the outer loop: its preference order
    /// is authoritative, the registry order only breaks ties within one
    /// ALPN.
    pub fn select(&self, local: SocketAddr, alpn_list: &[&[u8]]) -> Option<ListenerGuard> {
        let listeners = self.listeners.read();

        for alpn in alpn_list {
            for listener in listeners.iter() {
                if listener.alpn() == *alpn
                    && listener.compatible(local)
                    && listener.rundown.acquire()
                {
                    return Some(ListenerGuard {
                        listener: listener.clone(),
                    });
                }
            }
        }

        None
    }

    /// Snapshot for trace enumeration.
    pub fn snapshot(&self) -> Vec<Arc<Listener>> {
        self.listeners.read().clone()
    }
}
