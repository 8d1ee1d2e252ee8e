use std::{
    io::ErrorKind::ConnectionReset,
    net::{SocketAddr, UdpSocket},
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use service::{
    Datagram, Datapath, Endpoint,
    binding::{Binding, BindingOptions},
    listener::Listener,
    stateless::StatelessKind,
};
use tokio::sync::mpsc::unbounded_channel;

use crate::{
    config::{Config, Interface},
    observer::Observer,
    statistics::{Statistics, Stats},
};

/// One bound UDP socket, shared by the receive threads and the
/// stateless worker.
pub struct UdpDatapath {
    socket: UdpSocket,
    local: SocketAddr,
}

impl Datapath for UdpDatapath {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn send_to(&self, remote: SocketAddr, payload: Bytes) -> std::io::Result<()> {
        self.socket.send_to(&payload, remote).map(|_| ())
    }
}

/// Start every configured interface.
pub fn start(config: &Arc<Config>, statistics: &Statistics) -> Result<()> {
    let endpoint = Endpoint::new(service::EndpointOptions {
        retry_memory_limit: config.endpoint.retry_memory_limit,
        total_memory: config.endpoint.total_memory,
    })?;

    for interface in &config.server.interfaces {
        run_interface(config, statistics, &endpoint, interface)?;
    }

    Ok(())
}

/// Bind one socket, build its binding, and spawn the thread group:
/// a stateless worker plus one receive thread per core.
fn run_interface(
    config: &Arc<Config>,
    statistics: &Statistics,
    endpoint: &Arc<Endpoint>,
    interface: &Interface,
) -> Result<()> {
    let socket = UdpSocket::bind(interface.listen)?;
    let local = socket.local_addr()?;
    statistics.register(local);

    let datapath = Arc::new(UdpDatapath {
        socket: socket.try_clone()?,
        local,
    });

    let (sender, mut receiver) = unbounded_channel();

    let mut options = BindingOptions::new(endpoint.clone(), datapath, Observer::new(sender));
    options.remote = interface.remote;
    options.share = interface.share;
    options.stateless_capacity = config.endpoint.max_stateless_operations;
    options.stateless_expiration =
        Duration::from_millis(config.endpoint.stateless_operation_expiration);
    let binding = Binding::new(options);

    if !binding.is_exclusive() {
        for alpn in &interface.alpn {
            let listener = Listener::new(Some(local), alpn.as_bytes());
            if !binding.register_listener(&listener) {
                log::warn!("duplicate listener: interface={}, alpn={}", local, alpn);
            }
        }
    }

    // The stateless worker: drains admitted operations, builds the
    // response datagrams, sends them.
    {
        let binding = binding.clone();
        let reporter = statistics.get_reporter(&local);

        thread::spawn(move || {
            while let Some(ctx) = receiver.blocking_recv() {
                let kind = ctx.kind;
                if !binding.process_stateless_operation(&ctx) {
                    continue;
                }

                reporter.send(&[
                    Stats::SendPkts(1),
                    match kind {
                        StatelessKind::VersionNegotiation => Stats::VersionNegotiationPkts(1),
                        StatelessKind::Retry => Stats::RetryPkts(1),
                        StatelessKind::StatelessReset => Stats::StatelessResetPkts(1),
                    },
                ]);
            }
        });
    }

    // Try to bind receive threads to cores; if that fails, fall back
    // to the plain thread group.
    for core_id in core_affinity::get_core_ids()
        .map(|items| {
            items
                .into_iter()
                .take(config.server.max_threads)
                .map(Some)
                .collect::<Vec<_>>()
        })
        .unwrap_or_else(|| (0..config.server.max_threads).map(|_| None).collect::<Vec<_>>())
    {
        let socket = socket.try_clone()?;
        let binding = binding.clone();
        let reporter = statistics.get_reporter(&local);
        let mtu = config.server.mtu;

        thread::spawn(move || {
            if let Some(core_id) = core_id {
                let _ = core_affinity::set_for_current(core_id);
            }

            let mut buffer = BytesMut::zeroed(mtu * 2);

            loop {
                // Note: An error is also reported when a remote host is
                // shut down; only connection resets are survivable.
                let (size, remote) = match socket.recv_from(&mut buffer) {
                    Err(e) if e.kind() != ConnectionReset => break,
                    Ok((size, remote)) => (size, remote),
                    _ => continue,
                };

                reporter.send(&[Stats::ReceivedBytes(size), Stats::ReceivedPkts(1)]);
                log::trace!("udp socket receive: size={}, remote={:?}", size, remote);

                binding.receive(vec![Datagram {
                    local,
                    remote,
                    bytes: Bytes::copy_from_slice(&buffer[..size]),
                }]);
            }

            log::error!("udp receive thread exit: interface={:?}", local);
        });
    }

    log::info!(
        "endpoint listening: listen={}, exclusive={}, alpn={:?}",
        local,
        binding.is_exclusive(),
        interface.alpn
    );

    Ok(())
}
