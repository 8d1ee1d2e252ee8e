use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use service::{Connection, Datagram, Handler, NewConnection, stateless::StatelessContext};
use tokio::sync::mpsc::UnboundedSender;

/// The session layer's stand-in: accepts connections as counting sinks
/// and routes admitted stateless operations to the worker thread. The
/// real per-connection machinery (handshake, streams) plugs in behind
/// the same `Handler` contract.
pub struct Observer {
    stateless: UnboundedSender<Arc<StatelessContext>>,
}

impl Observer {
    pub fn new(stateless: UnboundedSender<Arc<StatelessContext>>) -> Self {
        Self { stateless }
    }
}

impl Handler for Observer {
    type Connection = EndpointConnection;

    fn create_connection(&self, info: &NewConnection) -> Option<Arc<EndpointConnection>> {
        log::info!(
            "new connection: remote={}, cid={:?}, version={:#010x}, retried={}",
            info.remote,
            info.dest_cid,
            info.version,
            info.orig_dest_cid.is_some(),
        );

        Some(Arc::new(EndpointConnection {
            received: AtomicUsize::new(0),
        }))
    }

    fn dispatch_stateless(&self, ctx: Arc<StatelessContext>) {
        // The receiver only goes away at process teardown; a failed
        // send just drops the context, which releases it.
        let _ = self.stateless.send(ctx);
    }
}

/// A connection as this shell sees it: a sink that counts what the
/// demultiplexer delivers.
pub struct EndpointConnection {
    received: AtomicUsize,
}

impl Connection for EndpointConnection {
    fn receive(&self, datagrams: Vec<Datagram>) {
        self.received.fetch_add(datagrams.len(), Ordering::Relaxed);

        for datagram in &datagrams {
            log::trace!(
                "connection datagram: remote={}, size={}",
                datagram.remote,
                datagram.bytes.len()
            );
        }
    }

    fn unreachable(&self, remote: std::net::SocketAddr) {
        log::warn!("connection unreachable: remote={}", remote);
    }
}
