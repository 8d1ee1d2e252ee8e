use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// The type of information passed in the statistics channel.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedBytes(usize),
    ReceivedPkts(usize),
    SendPkts(usize),
    VersionNegotiationPkts(usize),
    RetryPkts(usize),
    StatelessResetPkts(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-interface counters.
pub struct Counts<T> {
    pub received_bytes: T,
    pub received_pkts: T,
    pub send_pkts: T,
    pub version_negotiation_pkts: T,
    pub retry_pkts: T,
    pub stateless_reset_pkts: T,
}

impl Default for Counts<Count> {
    fn default() -> Self {
        Self {
            received_bytes: Count::default(),
            received_pkts: Count::default(),
            send_pkts: Count::default(),
            version_negotiation_pkts: Count::default(),
            retry_pkts: Count::default(),
            stateless_reset_pkts: Count::default(),
        }
    }
}

impl<T: Number> Counts<T> {
    /// # Example
    ///
    /// ```
    /// use quic_endpoint::statistics::*;
    ///
    /// let counts = Counts::default();
    ///
    /// counts.add(&Stats::ReceivedBytes(100));
    /// assert_eq!(counts.received_bytes.get(), 100);
    ///
    /// counts.add(&Stats::ReceivedPkts(1));
    /// assert_eq!(counts.received_pkts.get(), 1);
    ///
    /// counts.add(&Stats::RetryPkts(1));
    /// assert_eq!(counts.retry_pkts.get(), 1);
    /// ```
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedBytes(v) => self.received_bytes.add(*v),
            Stats::ReceivedPkts(v) => self.received_pkts.add(*v),
            Stats::SendPkts(v) => self.send_pkts.add(*v),
            Stats::VersionNegotiationPkts(v) => self.version_negotiation_pkts.add(*v),
            Stats::RetryPkts(v) => self.retry_pkts.add(*v),
            Stats::StatelessResetPkts(v) => self.stateless_reset_pkts.add(*v),
        }
    }
}

/// Per-interface statistics of the whole endpoint.
#[derive(Default, Clone)]
pub struct Statistics(Arc<RwLock<AHashMap<SocketAddr, Arc<Counts<Count>>>>>);

impl Statistics {
    /// Add an interface to the watch list.
    ///
    /// # Example
    ///
    /// ```
    /// use quic_endpoint::statistics::*;
    ///
    /// let statistics = Statistics::default();
    /// let addr = "127.0.0.1:4433".parse().unwrap();
    ///
    /// statistics.register(addr);
    /// assert_eq!(statistics.get(&addr).is_some(), true);
    /// ```
    pub fn register(&self, addr: SocketAddr) {
        self.0.write().insert(addr, Default::default());
    }

    pub fn unregister(&self, addr: &SocketAddr) {
        self.0.write().remove(addr);
    }

    /// Obtain a snapshot of an interface's counters.
    pub fn get(&self, addr: &SocketAddr) -> Option<Counts<usize>> {
        self.0.read().get(addr).map(|counts| Counts {
            received_bytes: counts.received_bytes.get(),
            received_pkts: counts.received_pkts.get(),
            send_pkts: counts.send_pkts.get(),
            version_negotiation_pkts: counts.version_negotiation_pkts.get(),
            retry_pkts: counts.retry_pkts.get(),
            stateless_reset_pkts: counts.stateless_reset_pkts.get(),
        })
    }

    /// Get a reporter handle for an interface. Held by each worker;
    /// reports update the shared counters without further lookups.
    ///
    /// # Example
    ///
    /// ```
    /// use quic_endpoint::statistics::*;
    ///
    /// let statistics = Statistics::default();
    /// let addr = "127.0.0.1:4433".parse().unwrap();
    ///
    /// statistics.register(addr);
    ///
    /// let reporter = statistics.get_reporter(&addr);
    /// reporter.send(&[Stats::ReceivedBytes(100)]);
    ///
    /// assert_eq!(statistics.get(&addr).unwrap().received_bytes, 100);
    /// ```
    pub fn get_reporter(&self, addr: &SocketAddr) -> StatisticsReporter {
        StatisticsReporter {
            counts: self.0.read().get(addr).cloned(),
        }
    }
}

/// Statistics reporter for one interface.
#[derive(Clone)]
pub struct StatisticsReporter {
    counts: Option<Arc<Counts<Count>>>,
}

impl StatisticsReporter {
    pub fn send(&self, reports: &[Stats]) {
        if let Some(counts) = &self.counts {
            for report in reports {
                counts.add(report);
            }
        }
    }
}
