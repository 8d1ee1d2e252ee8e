use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::sleep,
    time::Duration,
};

use anyhow::Result;
use bytes::Bytes;
use codec::{
    QUIC_VERSION_DRAFT_23,
    crypto::RETRY_TOKEN_LENGTH,
    header::{Cid, FIXED_BIT, FORM_BIT, Header, LongType},
    is_reserved_version,
};
use parking_lot::Mutex;
use quic_endpoint_service::{
    Connection, Datagram, Datapath, Endpoint, EndpointOptions, Handler, NewConnection,
    binding::{Binding, BindingOptions},
    listener::Listener,
    stateless::StatelessContext,
};

const CLIENT_DEST_CID: [u8; 8] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];
const CLIENT_SOURCE_CID: [u8; 8] = [0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8];

struct TestDatapath {
    local: SocketAddr,
    sent: Mutex<Vec<(SocketAddr, Bytes)>>,
}

impl TestDatapath {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            local: "127.0.0.1:4433".parse().unwrap(),
            sent: Default::default(),
        })
    }

    fn take_sent(&self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Datapath for TestDatapath {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn send_to(&self, remote: SocketAddr, payload: Bytes) -> std::io::Result<()> {
        self.sent.lock().push((remote, payload));
        Ok(())
    }
}

#[derive(Default)]
struct TestConnection {
    received: Mutex<Vec<Datagram>>,
    unreachable: Mutex<Vec<SocketAddr>>,
}

impl Connection for TestConnection {
    fn receive(&self, datagrams: Vec<Datagram>) {
        self.received.lock().extend(datagrams);
    }

    fn unreachable(&self, remote: SocketAddr) {
        self.unreachable.lock().push(remote);
    }
}

#[derive(Default)]
struct TestHandler {
    accept: AtomicBool,
    overloaded: AtomicBool,
    created: Mutex<Vec<(NewConnection, Arc<TestConnection>)>>,
    pending: Mutex<Vec<Arc<StatelessContext>>>,
}

impl Handler for TestHandler {
    type Connection = TestConnection;

    fn is_overloaded(&self) -> bool {
        self.overloaded.load(Ordering::Relaxed)
    }

    fn create_connection(&self, info: &NewConnection) -> Option<Arc<TestConnection>> {
        if !self.accept.load(Ordering::Relaxed) {
            return None;
        }

        let conn = Arc::new(TestConnection::default());
        self.created.lock().push((*info, conn.clone()));
        Some(conn)
    }

    fn dispatch_stateless(&self, ctx: Arc<StatelessContext>) {
        self.pending.lock().push(ctx);
    }
}

type TestBinding = Binding<TestHandler, TestDatapath>;

fn make_binding(endpoint: Arc<Endpoint>, datapath: Arc<TestDatapath>) -> Arc<TestBinding> {
    let mut options = BindingOptions::new(endpoint, datapath, TestHandler::default());
    options.handler.accept.store(true, Ordering::Relaxed);
    Binding::new(options)
}

/// Drive every dispatched stateless operation through the worker path.
fn process_pending(binding: &TestBinding) -> usize {
    let pending = std::mem::take(&mut *binding.handler().pending.lock());
    let count = pending.len();

    for ctx in pending {
        binding.process_stateless_operation(&ctx);
    }

    count
}

fn initial_datagram(version: u32, dest_cid: &[u8], source_cid: &[u8], token: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; 1200];
    bytes[0] = 0xc3;
    bytes[1..5].copy_from_slice(&version.to_be_bytes());

    let mut offset = 5;
    bytes[offset] = dest_cid.len() as u8;
    offset += 1;
    bytes[offset..offset + dest_cid.len()].copy_from_slice(dest_cid);
    offset += dest_cid.len();

    bytes[offset] = source_cid.len() as u8;
    offset += 1;
    bytes[offset..offset + source_cid.len()].copy_from_slice(source_cid);
    offset += source_cid.len();

    assert!(token.len() < 64);
    bytes[offset] = token.len() as u8;
    offset += 1;
    bytes[offset..offset + token.len()].copy_from_slice(token);
    bytes
}

fn short_datagram(dest_cid: &[u8], length: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; length];
    bytes[0] = 0x41;
    bytes[1..1 + dest_cid.len()].copy_from_slice(dest_cid);
    bytes
}

fn datagram(binding: &TestBinding, remote: SocketAddr, bytes: Vec<u8>) -> Datagram {
    Datagram {
        local: binding.local_addr(),
        remote,
        bytes: Bytes::from(bytes),
    }
}

#[test]
fn test_version_negotiation_trigger() -> Result<()> {
    let datapath = TestDatapath::new();
    let binding = make_binding(Endpoint::new(EndpointOptions::default())?, datapath.clone());

    let listener = Listener::new(None, b"h3");
    assert!(binding.register_listener(&listener));

    let remote: SocketAddr = "203.0.113.9:50000".parse()?;
    binding.receive(vec![datagram(
        &binding,
        remote,
        initial_datagram(0xdeadbeef, &CLIENT_DEST_CID, &CLIENT_SOURCE_CID, &[]),
    )]);

    assert_eq!(process_pending(&binding), 1);

    let sent = datapath.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, remote);

    let header = Header::decode(&sent[0].1, 0)?;
    assert_eq!(header.version(), Some(0));
    assert_eq!(header.dest_cid(), &CLIENT_SOURCE_CID);

    let Header::Long {
        source_cid,
        payload,
        ..
    } = header
    else {
        panic!("expected long header");
    };

    assert_eq!(source_cid, &CLIENT_DEST_CID);

    // Reserved version first, the supported list after it.
    let advertised = payload
        .chunks(4)
        .map(|it| u32::from_be_bytes(it.try_into().unwrap()))
        .collect::<Vec<_>>();

    assert_eq!(advertised.len(), 2);
    assert!(is_reserved_version(advertised[0]));
    assert_eq!(advertised[0], binding.reserved_version());
    assert_eq!(advertised[1], QUIC_VERSION_DRAFT_23);

    binding.unregister_listener(&listener);
    Ok(())
}

#[test]
fn test_retry_under_memory_pressure() -> Result<()> {
    let endpoint = Endpoint::new(EndpointOptions {
        retry_memory_limit: u16::MAX,
        total_memory: 1000,
    })?;
    endpoint.add_handshake_memory(1000);
    assert!(endpoint.retry_required());

    let datapath = TestDatapath::new();
    let binding = make_binding(endpoint.clone(), datapath.clone());

    let listener = Listener::new(None, b"h3");
    assert!(binding.register_listener(&listener));

    let remote: SocketAddr = "203.0.113.9:50000".parse()?;
    binding.receive(vec![datagram(
        &binding,
        remote,
        initial_datagram(
            QUIC_VERSION_DRAFT_23,
            &CLIENT_DEST_CID,
            &CLIENT_SOURCE_CID,
            &[],
        ),
    )]);

    // No connection yet, a Retry instead.
    assert!(binding.handler().created.lock().is_empty());
    assert_eq!(process_pending(&binding), 1);

    let sent = datapath.take_sent();
    assert_eq!(sent.len(), 1);

    let header = Header::decode(&sent[0].1, 0)?;
    assert_eq!(header.long_type(), Some(LongType::Retry));
    assert_eq!(header.dest_cid(), &CLIENT_SOURCE_CID);

    let Header::Long {
        source_cid,
        payload,
        ..
    } = header
    else {
        panic!("expected long header");
    };

    assert_eq!(source_cid.len(), 8);
    let server_cid = source_cid.to_vec();

    // ODCID field carries the client's original Dest-CID, the rest is
    // the sealed token of the fixed size.
    assert_eq!(payload[0] as usize, CLIENT_DEST_CID.len());
    assert_eq!(&payload[1..9], &CLIENT_DEST_CID);

    let token = &payload[9..];
    assert_eq!(token.len(), RETRY_TOKEN_LENGTH);

    // The follow-up Initial echoes the token under the server CID and
    // passes the gate; the connection carries the original Dest-CID.
    binding.receive(vec![datagram(
        &binding,
        remote,
        initial_datagram(
            QUIC_VERSION_DRAFT_23,
            &server_cid,
            &CLIENT_SOURCE_CID,
            token,
        ),
    )]);

    let created = binding.handler().created.lock();
    assert_eq!(created.len(), 1);
    assert_eq!(
        created[0].0.orig_dest_cid,
        Some(Cid::from_slice(&CLIENT_DEST_CID)?),
    );
    drop(created);

    binding.unregister_listener(&listener);
    Ok(())
}

#[test]
fn test_retry_token_from_wrong_address_drops() -> Result<()> {
    let endpoint = Endpoint::new(EndpointOptions {
        retry_memory_limit: u16::MAX,
        total_memory: 1000,
    })?;
    endpoint.add_handshake_memory(1000);

    let datapath = TestDatapath::new();
    let binding = make_binding(endpoint.clone(), datapath.clone());

    let listener = Listener::new(None, b"h3");
    assert!(binding.register_listener(&listener));

    let remote: SocketAddr = "203.0.113.9:50000".parse()?;
    binding.receive(vec![datagram(
        &binding,
        remote,
        initial_datagram(
            QUIC_VERSION_DRAFT_23,
            &CLIENT_DEST_CID,
            &CLIENT_SOURCE_CID,
            &[],
        ),
    )]);
    process_pending(&binding);

    let sent = datapath.take_sent();
    let Header::Long {
        source_cid,
        payload,
        ..
    } = Header::decode(&sent[0].1, 0)?
    else {
        panic!("expected long header");
    };

    let server_cid = source_cid.to_vec();
    let token = payload[9..].to_vec();

    // Same token, different source address: dropped, no connection, no
    // response.
    let elsewhere: SocketAddr = "198.51.100.2:40000".parse()?;
    binding.receive(vec![datagram(
        &binding,
        elsewhere,
        initial_datagram(
            QUIC_VERSION_DRAFT_23,
            &server_cid,
            &CLIENT_SOURCE_CID,
            &token,
        ),
    )]);

    assert!(binding.handler().created.lock().is_empty());
    assert_eq!(process_pending(&binding), 0);
    assert!(datapath.take_sent().is_empty());

    binding.unregister_listener(&listener);
    Ok(())
}

#[test]
fn test_stateless_reset() -> Result<()> {
    let datapath = TestDatapath::new();
    let binding = make_binding(Endpoint::new(EndpointOptions::default())?, datapath.clone());

    let remote: SocketAddr = "203.0.113.9:50000".parse()?;
    binding.receive(vec![datagram(
        &binding,
        remote,
        short_datagram(&CLIENT_DEST_CID, 1200),
    )]);

    assert_eq!(process_pending(&binding), 1);

    let sent = datapath.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, remote);

    let reset = &sent[0].1;
    assert!(reset.len() >= 42 && reset.len() <= 49);
    assert!(reset.len() < 1200);
    assert_eq!(reset[0] & FORM_BIT, 0);
    assert_ne!(reset[0] & FIXED_BIT, 0);
    assert_eq!(
        &reset[reset.len() - 16..],
        &binding.stateless_reset_token(&CLIENT_DEST_CID),
    );

    Ok(())
}

#[test]
fn test_stateless_reset_never_on_exclusive_binding() -> Result<()> {
    let datapath = TestDatapath::new();
    let remote: SocketAddr = "203.0.113.9:50000".parse()?;

    let mut options = BindingOptions::new(
        Endpoint::new(EndpointOptions::default())?,
        datapath.clone(),
        TestHandler::default(),
    );
    options.remote = Some(remote);
    let binding = Binding::new(options);
    assert!(binding.is_exclusive());

    // Short headers on an exclusive binding carry no CID at all.
    binding.receive(vec![datagram(&binding, remote, short_datagram(&[], 1200))]);

    assert_eq!(binding.pending_stateless_operations(), 0);
    assert_eq!(process_pending(&binding), 0);
    assert!(datapath.take_sent().is_empty());
    Ok(())
}

#[test]
fn test_duplicate_stateless_operation_rejected() -> Result<()> {
    let datapath = TestDatapath::new();
    let binding = make_binding(Endpoint::new(EndpointOptions::default())?, datapath.clone());

    let listener = Listener::new(None, b"h3");
    assert!(binding.register_listener(&listener));

    let remote: SocketAddr = "203.0.113.9:50000".parse()?;
    let packet = initial_datagram(0xdeadbeef, &CLIENT_DEST_CID, &CLIENT_SOURCE_CID, &[]);

    binding.receive(vec![datagram(&binding, remote, packet.clone())]);
    sleep(Duration::from_millis(10));
    binding.receive(vec![datagram(&binding, remote, packet)]);

    // Second admission for the same remote is rejected while the first
    // is still pending.
    assert_eq!(binding.pending_stateless_operations(), 1);
    assert_eq!(process_pending(&binding), 1);
    assert_eq!(datapath.take_sent().len(), 1);

    binding.unregister_listener(&listener);
    Ok(())
}

#[test]
fn test_stateless_operation_expiration_readmits() -> Result<()> {
    let datapath = TestDatapath::new();

    let mut options = BindingOptions::new(
        Endpoint::new(EndpointOptions::default())?,
        datapath.clone(),
        TestHandler::default(),
    );
    options.stateless_expiration = Duration::from_millis(5);
    let binding = Binding::new(options);

    let listener = Listener::new(None, b"h3");
    assert!(binding.register_listener(&listener));

    let remote: SocketAddr = "203.0.113.9:50000".parse()?;
    let packet = initial_datagram(0xdeadbeef, &CLIENT_DEST_CID, &CLIENT_SOURCE_CID, &[]);

    binding.receive(vec![datagram(&binding, remote, packet.clone())]);
    assert_eq!(binding.pending_stateless_operations(), 1);

    // Once the first operation ages out, the same remote is admitted
    // again.
    sleep(Duration::from_millis(20));
    binding.receive(vec![datagram(&binding, remote, packet)]);
    assert_eq!(binding.pending_stateless_operations(), 1);

    let pending = std::mem::take(&mut *binding.handler().pending.lock());
    assert_eq!(pending.len(), 2);
    assert!(pending[0].is_expired());
    assert!(!pending[1].is_expired());

    for ctx in &pending {
        binding.process_stateless_operation(ctx);
        assert!(ctx.is_processed());
    }

    binding.unregister_listener(&listener);
    Ok(())
}

#[test]
fn test_stateless_operation_cardinality_bound() -> Result<()> {
    let datapath = TestDatapath::new();
    let binding = make_binding(Endpoint::new(EndpointOptions::default())?, datapath.clone());

    let listener = Listener::new(None, b"h3");
    assert!(binding.register_listener(&listener));

    // Distinct remotes, one operation each; the 17th hits the cap.
    for port in 0..20u16 {
        let remote: SocketAddr = format!("203.0.113.9:{}", 50000 + port).parse()?;
        binding.receive(vec![datagram(
            &binding,
            remote,
            initial_datagram(0xdeadbeef, &CLIENT_DEST_CID, &CLIENT_SOURCE_CID, &[]),
        )]);
    }

    assert_eq!(binding.pending_stateless_operations(), 16);
    assert_eq!(process_pending(&binding), 16);

    binding.unregister_listener(&listener);
    Ok(())
}

#[test]
fn test_handshake_ordered_before_data() -> Result<()> {
    let datapath = TestDatapath::new();
    let binding = make_binding(Endpoint::new(EndpointOptions::default())?, datapath.clone());

    let listener = Listener::new(None, b"h3");
    assert!(binding.register_listener(&listener));

    let remote: SocketAddr = "203.0.113.9:50000".parse()?;
    let burst = vec![
        datagram(&binding, remote, short_datagram(&CLIENT_DEST_CID, 100)),
        datagram(
            &binding,
            remote,
            initial_datagram(
                QUIC_VERSION_DRAFT_23,
                &CLIENT_DEST_CID,
                &CLIENT_SOURCE_CID,
                &[],
            ),
        ),
        datagram(&binding, remote, short_datagram(&CLIENT_DEST_CID, 120)),
    ];

    binding.receive(burst);

    // One sub-chain, the Initial hoisted to its head, so creation saw a
    // handshake packet and all three datagrams arrived in order
    // [handshake, data, data].
    let created = binding.handler().created.lock();
    assert_eq!(created.len(), 1);

    let received = created[0].1.received.lock();
    assert_eq!(received.len(), 3);
    assert_eq!(received[0].bytes.len(), 1200);
    assert_eq!(received[1].bytes.len(), 100);
    assert_eq!(received[2].bytes.len(), 120);
    drop(received);

    let conn = created[0].1.clone();
    drop(created);

    binding.remove_connection(&conn);
    binding.unregister_listener(&listener);
    Ok(())
}

#[test]
fn test_delivery_to_registered_cid() -> Result<()> {
    let datapath = TestDatapath::new();
    let binding = make_binding(Endpoint::new(EndpointOptions::default())?, datapath.clone());

    let conn = Arc::new(TestConnection::default());
    assert!(binding.add_source_cid(&CLIENT_DEST_CID, &conn));

    // Second registration under the same ID collides.
    let other = Arc::new(TestConnection::default());
    assert!(!binding.add_source_cid(&CLIENT_DEST_CID, &other));

    let remote: SocketAddr = "203.0.113.9:50000".parse()?;
    binding.receive(vec![datagram(
        &binding,
        remote,
        short_datagram(&CLIENT_DEST_CID, 64),
    )]);

    assert_eq!(conn.received.lock().len(), 1);
    assert!(other.received.lock().is_empty());

    // No stateless reset was produced for a known CID.
    assert_eq!(binding.pending_stateless_operations(), 0);

    binding.remove_source_cid(&CLIENT_DEST_CID);
    binding.receive(vec![datagram(
        &binding,
        remote,
        short_datagram(&CLIENT_DEST_CID, 64),
    )]);
    assert_eq!(conn.received.lock().len(), 1);

    Ok(())
}

#[test]
fn test_initial_collision_keeps_existing_connection() -> Result<()> {
    let datapath = TestDatapath::new();
    let binding = make_binding(Endpoint::new(EndpointOptions::default())?, datapath.clone());

    let listener = Listener::new(None, b"h3");
    assert!(binding.register_listener(&listener));

    let existing = Arc::new(TestConnection::default());
    assert!(binding.add_source_cid(&CLIENT_DEST_CID, &existing));

    let remote: SocketAddr = "203.0.113.9:50000".parse()?;
    binding.receive(vec![datagram(
        &binding,
        remote,
        initial_datagram(
            QUIC_VERSION_DRAFT_23,
            &CLIENT_DEST_CID,
            &CLIENT_SOURCE_CID,
            &[],
        ),
    )]);

    // The lookup hit wins before any creation happens.
    assert!(binding.handler().created.lock().is_empty());
    assert_eq!(existing.received.lock().len(), 1);

    binding.remove_connection(&existing);
    binding.unregister_listener(&listener);
    Ok(())
}

#[test]
fn test_listener_selection() -> Result<()> {
    let datapath = TestDatapath::new();
    let binding = make_binding(Endpoint::new(EndpointOptions::default())?, datapath.clone());

    let wildcard = Listener::new(None, b"h3");
    let specific = Listener::new(Some("[::1]:4433".parse()?), b"h3");
    let h2 = Listener::new(None, b"h2");

    assert!(binding.register_listener(&wildcard));
    assert!(binding.register_listener(&specific));
    assert!(binding.register_listener(&h2));

    // Duplicate registration rejects.
    assert!(!binding.register_listener(&Listener::new(None, b"h3")));

    // Family-specific sorts ahead of the unrestricted listener inside
    // the "h3" group.
    let local: SocketAddr = "[::1]:4433".parse()?;
    {
        let selected = binding
            .select_listener(local, &[b"h2".as_slice(), b"h3".as_slice()])
            .unwrap();
        assert_eq!(selected.alpn(), b"h2");
    }

    {
        let selected = binding
            .select_listener(local, &[b"h3".as_slice()])
            .unwrap();
        assert_eq!(selected.local(), Some("[::1]:4433".parse()?));
    }

    // A v4 local never matches the v6-specific listener.
    {
        let selected = binding
            .select_listener("127.0.0.1:4433".parse()?, &[b"h3".as_slice()])
            .unwrap();
        assert_eq!(selected.local(), None);
    }

    assert!(
        binding
            .select_listener(local, &[b"smtp".as_slice()])
            .is_none()
    );

    binding.unregister_listener(&wildcard);
    binding.unregister_listener(&specific);
    binding.unregister_listener(&h2);
    Ok(())
}

#[test]
fn test_unsupported_version_without_listener_drops() -> Result<()> {
    let datapath = TestDatapath::new();
    let binding = make_binding(Endpoint::new(EndpointOptions::default())?, datapath.clone());

    let remote: SocketAddr = "203.0.113.9:50000".parse()?;
    binding.receive(vec![datagram(
        &binding,
        remote,
        initial_datagram(0xdeadbeef, &CLIENT_DEST_CID, &CLIENT_SOURCE_CID, &[]),
    )]);

    assert_eq!(binding.pending_stateless_operations(), 0);
    assert!(datapath.take_sent().is_empty());
    Ok(())
}

#[test]
fn test_short_cid_policy() -> Result<()> {
    let datapath = TestDatapath::new();
    let binding = make_binding(Endpoint::new(EndpointOptions::default())?, datapath.clone());

    let listener = Listener::new(None, b"h3");
    assert!(binding.register_listener(&listener));

    // A 4-byte Dest-CID is below the shared-binding minimum; no
    // connection and no stateless response come out of it.
    let remote: SocketAddr = "203.0.113.9:50000".parse()?;
    binding.receive(vec![datagram(
        &binding,
        remote,
        initial_datagram(
            QUIC_VERSION_DRAFT_23,
            &[1, 2, 3, 4],
            &CLIENT_SOURCE_CID,
            &[],
        ),
    )]);

    assert!(binding.handler().created.lock().is_empty());
    assert_eq!(binding.pending_stateless_operations(), 0);

    binding.unregister_listener(&listener);
    Ok(())
}

#[test]
fn test_overloaded_worker_sheds_work() -> Result<()> {
    let datapath = TestDatapath::new();
    let binding = make_binding(Endpoint::new(EndpointOptions::default())?, datapath.clone());

    let listener = Listener::new(None, b"h3");
    assert!(binding.register_listener(&listener));
    binding.handler().overloaded.store(true, Ordering::Relaxed);

    let remote: SocketAddr = "203.0.113.9:50000".parse()?;
    binding.receive(vec![
        datagram(
            &binding,
            remote,
            initial_datagram(0xdeadbeef, &CLIENT_DEST_CID, &CLIENT_SOURCE_CID, &[]),
        ),
        datagram(
            &binding,
            remote,
            initial_datagram(
                QUIC_VERSION_DRAFT_23,
                &CLIENT_DEST_CID,
                &CLIENT_SOURCE_CID,
                &[],
            ),
        ),
    ]);

    assert_eq!(binding.pending_stateless_operations(), 0);
    assert!(binding.handler().created.lock().is_empty());

    binding.unregister_listener(&listener);
    Ok(())
}

#[test]
fn test_partitioning_grows_with_first_listener() -> Result<()> {
    let datapath = TestDatapath::new();
    let binding = make_binding(Endpoint::new(EndpointOptions::default())?, datapath.clone());

    let conn = Arc::new(TestConnection::default());
    assert!(binding.add_source_cid(&CLIENT_DEST_CID, &conn));

    let listener = Listener::new(None, b"h3");
    assert!(binding.register_listener(&listener));

    // Entries registered before the growth stay reachable after it.
    let remote: SocketAddr = "203.0.113.9:50000".parse()?;
    binding.receive(vec![datagram(
        &binding,
        remote,
        short_datagram(&CLIENT_DEST_CID, 64),
    )]);
    assert_eq!(conn.received.lock().len(), 1);

    binding.remove_connection(&conn);
    binding.unregister_listener(&listener);
    Ok(())
}

#[test]
fn test_move_source_cids_between_bindings() -> Result<()> {
    let endpoint = Endpoint::new(EndpointOptions::default())?;
    let src = make_binding(endpoint.clone(), TestDatapath::new());
    let dst = make_binding(endpoint, TestDatapath::new());

    let conn = Arc::new(TestConnection::default());
    assert!(src.add_source_cid(&CLIENT_DEST_CID, &conn));
    assert!(src.add_source_cid(&CLIENT_SOURCE_CID, &conn));

    src.move_source_cids(&dst, &conn);

    let remote: SocketAddr = "203.0.113.9:50000".parse()?;
    src.receive(vec![datagram(&src, remote, short_datagram(&CLIENT_DEST_CID, 64))]);
    assert!(conn.received.lock().is_empty());

    dst.receive(vec![datagram(&dst, remote, short_datagram(&CLIENT_DEST_CID, 64))]);
    dst.receive(vec![datagram(&dst, remote, short_datagram(&CLIENT_SOURCE_CID, 64))]);
    assert_eq!(conn.received.lock().len(), 2);

    dst.remove_connection(&conn);
    Ok(())
}

#[test]
fn test_unreachable_on_pinned_binding() -> Result<()> {
    let datapath = TestDatapath::new();
    let remote: SocketAddr = "203.0.113.9:50000".parse()?;

    let mut options = BindingOptions::new(
        Endpoint::new(EndpointOptions::default())?,
        datapath.clone(),
        TestHandler::default(),
    );
    options.remote = Some(remote);
    options.share = true;
    let binding = Binding::new(options);
    assert!(!binding.is_exclusive());

    let conn = Arc::new(TestConnection::default());
    assert!(binding.add_source_cid(&CLIENT_DEST_CID, &conn));

    binding.unreachable(remote);
    assert_eq!(conn.unreachable.lock().as_slice(), &[remote]);

    binding.remove_connection(&conn);
    binding.unreachable(remote);
    assert_eq!(conn.unreachable.lock().len(), 1);

    Ok(())
}

#[test]
fn test_reset_tokens_differ_across_bindings() -> Result<()> {
    let endpoint = Endpoint::new(EndpointOptions::default())?;
    let a = make_binding(endpoint.clone(), TestDatapath::new());
    let b = make_binding(endpoint, TestDatapath::new());

    let token = a.stateless_reset_token(&CLIENT_DEST_CID);
    assert_eq!(token, a.stateless_reset_token(&CLIENT_DEST_CID));
    assert_ne!(token, b.stateless_reset_token(&CLIENT_DEST_CID));
    Ok(())
}

#[test]
fn test_close_drains_stateless_table() -> Result<()> {
    let datapath = TestDatapath::new();
    let binding = make_binding(Endpoint::new(EndpointOptions::default())?, datapath.clone());

    let listener = Listener::new(None, b"h3");
    assert!(binding.register_listener(&listener));

    let remote: SocketAddr = "203.0.113.9:50000".parse()?;
    binding.receive(vec![datagram(
        &binding,
        remote,
        initial_datagram(0xdeadbeef, &CLIENT_DEST_CID, &CLIENT_SOURCE_CID, &[]),
    )]);
    assert_eq!(binding.pending_stateless_operations(), 1);

    binding.unregister_listener(&listener);
    binding.close();
    assert_eq!(binding.pending_stateless_operations(), 0);
    Ok(())
}
