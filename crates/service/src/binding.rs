use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::BytesMut;
use codec::{
    Error, MIN_INITIAL_CONNECTION_ID_LENGTH, MIN_INITIAL_PACKET_LENGTH,
    MIN_STATELESS_RESET_PACKET_LENGTH, RECOMMENDED_STATELESS_RESET_PACKET_LENGTH,
    SERVER_CHOSEN_CID_LENGTH, STATELESS_RESET_TOKEN_LENGTH, SUPPORTED_VERSIONS, builder,
    crypto::{RESET_KEY_LENGTH, ResetKey, RetryToken},
    header::{Cid, Header, LongType, initial_token},
    is_version_supported, reserved_version,
};
use rand::Rng;

use crate::{
    Connection, Datagram, Datapath, Endpoint, Handler, NewConnection,
    listener::{Listener, ListenerGuard, ListenerRegistry},
    lookup::{Insert, LookupTable},
    stateless::{
        MAX_BINDING_STATELESS_OPERATIONS, STATELESS_OP_EXPIRATION_MS, StatelessContext,
        StatelessKind, StatelessTable,
    },
};

pub struct BindingOptions<H, D> {
    pub endpoint: Arc<Endpoint>,
    pub datapath: Arc<D>,
    pub handler: H,
    /// Pinned remote 2-tuple of a client-style binding.
    pub remote: Option<SocketAddr>,
    /// Whether other connections may share the binding. A pinned,
    /// unshared binding is exclusive: no connection IDs, no stateless
    /// reset.
    pub share: bool,
    pub stateless_capacity: usize,
    pub stateless_expiration: Duration,
}

impl<H, D> BindingOptions<H, D> {
    pub fn new(endpoint: Arc<Endpoint>, datapath: Arc<D>, handler: H) -> Self {
        Self {
            endpoint,
            datapath,
            handler,
            remote: None,
            share: false,
            stateless_capacity: MAX_BINDING_STATELESS_OPERATIONS,
            stateless_expiration: Duration::from_millis(STATELESS_OP_EXPIRATION_MS),
        }
    }
}

/// The parsed, validated view of one received datagram. Never outlives
/// the datagram it came from.
#[derive(Debug, Clone, Copy)]
struct Packet {
    dest_cid: Cid,
    source_cid: Cid,
    version: u32,
    long: bool,
    initial: bool,
}

enum RetryCheck {
    Proceed { orig_dest_cid: Option<Cid> },
    Retry,
    Drop(&'static str),
}

/// The 1:1 companion of one UDP socket: owns the listener registry, the
/// CID lookup table and the stateless operation table, and classifies
/// every received datagram into delivery, connection creation, a
/// stateless response, or a diagnosed drop.
///
/// Passive: every entry point is bounded, non-blocking work driven by
/// the datapath's dispatch threads and the stateless worker.
pub struct Binding<H, D>
where
    H: Handler,
    D: Datapath,
{
    endpoint: Arc<Endpoint>,
    datapath: Arc<D>,
    handler: H,
    local: SocketAddr,
    remote: Option<SocketAddr>,
    exclusive: bool,
    reset_key: ResetKey,
    reserved_version: u32,
    listeners: ListenerRegistry,
    lookup: LookupTable<H::Connection>,
    stateless: StatelessTable,
}

impl<H, D> Binding<H, D>
where
    H: Handler,
    D: Datapath,
{
    pub fn new(options: BindingOptions<H, D>) -> Arc<Self> {
        let mut rng = rand::rng();

        let mut salt = [0u8; RESET_KEY_LENGTH];
        rng.fill(&mut salt);

        Arc::new(Self {
            local: options.datapath.local_addr(),
            exclusive: options.remote.is_some() && !options.share,
            remote: options.remote,
            reset_key: ResetKey::new(&salt),
            reserved_version: reserved_version(rng.random()),
            listeners: ListenerRegistry::default(),
            lookup: LookupTable::default(),
            stateless: StatelessTable::new(
                options.stateless_capacity,
                options.stateless_expiration,
            ),
            endpoint: options.endpoint,
            datapath: options.datapath,
            handler: options.handler,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The first advertised entry of every Version Negotiation this
    /// binding emits. Reserved-pattern, drawn once per binding.
    pub fn reserved_version(&self) -> u32 {
        self.reserved_version
    }

    /// The stateless reset token this binding derives for a connection
    /// ID. Stable for the binding's lifetime.
    pub fn stateless_reset_token(&self, cid: &[u8]) -> [u8; STATELESS_RESET_TOKEN_LENGTH] {
        self.reset_key.token(cid)
    }

    /// Length of the Dest-CIDs this binding hands out, and therefore of
    /// the Dest-CID on every received short header.
    fn local_cid_length(&self) -> usize {
        if self.exclusive {
            0
        } else {
            SERVER_CHOSEN_CID_LENGTH
        }
    }

    pub fn pending_stateless_operations(&self) -> usize {
        self.stateless.len()
    }

    /// Register a listener. The first listener also grows the lookup
    /// table to full partitioning; if that fails the registration is
    /// rolled back.
    pub fn register_listener(&self, listener: &Arc<Listener>) -> bool {
        if !self.listeners.register(listener) {
            return false;
        }

        if !self.lookup.maximize_partitioning(num_cpus::get()) {
            self.listeners.unregister(listener);
            return false;
        }

        true
    }

    pub fn unregister_listener(&self, listener: &Arc<Listener>) {
        self.listeners.unregister(listener);
    }

    /// Pick the listener serving a handshake, honoring the client's
    /// ALPN preference order.
    pub fn select_listener(&self, local: SocketAddr, alpn_list: &[&[u8]]) -> Option<ListenerGuard> {
        self.listeners.select(local, alpn_list)
    }

    /// Register a further source CID for a connection. `false` on
    /// collision; the table is unchanged in that case.
    pub fn add_source_cid(&self, cid: &[u8], conn: &Arc<H::Connection>) -> bool {
        let cid = match Cid::from_slice(cid) {
            Ok(cid) => cid,
            Err(_) => return false,
        };

        matches!(
            self.lookup.insert(cid, self.remote, conn),
            Insert::Inserted
        )
    }

    pub fn remove_source_cid(&self, cid: &[u8]) {
        if let Ok(cid) = Cid::from_slice(cid) {
            self.lookup.remove(&cid);
        }
    }

    /// Drop every CID of a connection from this binding.
    pub fn remove_connection(&self, conn: &Arc<H::Connection>) {
        self.lookup.remove_all(conn);
    }

    /// Re-home a connection's CIDs onto another binding.
    pub fn move_source_cids(&self, dst: &Binding<H, D>, conn: &Arc<H::Connection>) {
        self.lookup.move_all(conn, &dst.lookup);
    }

    /// ICMP unreachable notification from the datapath. Only pinned
    /// bindings can attribute it to a connection.
    pub fn unreachable(&self, remote: SocketAddr) {
        if self.remote.is_none() {
            return;
        }

        if let Some(conn) = self.lookup.find_by_remote(&remote) {
            conn.unreachable(remote);
        }
    }

    /// The datapath receive callback. Splits the burst into per-CID
    /// sub-chains and hands each one to `deliver`; dropped datagrams
    /// are returned to the datapath by falling out of scope.
    pub fn receive(&self, datagrams: Vec<Datagram>) {
        let mut chain: Vec<(Datagram, Packet)> = Vec::new();

        for datagram in datagrams {
            let packet = match self.preprocess(&datagram) {
                Some(packet) => packet,
                None => continue,
            };

            if let Some((_, head)) = chain.first() {
                if head.dest_cid != packet.dest_cid {
                    self.deliver(std::mem::take(&mut chain));
                }
            }

            chain.push((datagram, packet));
        }

        if !chain.is_empty() {
            self.deliver(chain);
        }
    }

    /// Validate the invariant header and the binding's CID-length
    /// policy, and divert unknown versions to Version Negotiation.
    /// Returns the parsed packet for datagrams that continue into
    /// demultiplexing.
    fn preprocess(&self, datagram: &Datagram) -> Option<Packet> {
        let header = match Header::decode(&datagram.bytes, self.local_cid_length()) {
            Ok(header) => header,
            Err(_) => {
                log::debug!("dropped packet: reason=invalid header, remote={}", datagram.remote);
                return None;
            }
        };

        let dest_cid = header.dest_cid();
        if self.exclusive {
            if header.is_long() && !dest_cid.is_empty() {
                log::debug!(
                    "dropped packet: reason=cid on exclusive binding, remote={}",
                    datagram.remote
                );
                return None;
            }
        } else if header.is_long() && dest_cid.len() < MIN_INITIAL_CONNECTION_ID_LENGTH {
            log::debug!(
                "dropped packet: reason=cid too short, remote={}",
                datagram.remote
            );
            return None;
        }

        let mut packet = Packet {
            dest_cid: Cid::from_slice(dest_cid).ok()?,
            source_cid: Cid::EMPTY,
            version: 0,
            long: false,
            initial: false,
        };

        let Header::Long {
            version,
            source_cid,
            ..
        } = header
        else {
            return Some(packet);
        };

        if version == 0 {
            // A Version Negotiation itself; a server has no use for it.
            log::debug!(
                "dropped packet: reason=version negotiation, remote={}",
                datagram.remote
            );
            return None;
        }

        if !is_version_supported(version) {
            if self.listeners.has_any() {
                self.queue_stateless_operation(StatelessKind::VersionNegotiation, datagram);
            } else {
                log::debug!(
                    "dropped packet: reason=unsupported version, remote={}",
                    datagram.remote
                );
            }

            return None;
        }

        packet.long = true;
        packet.version = version;
        packet.source_cid = Cid::from_slice(source_cid).ok()?;

        if header.long_type() == Some(LongType::Initial) {
            if datagram.bytes.len() < MIN_INITIAL_PACKET_LENGTH {
                log::debug!(
                    "dropped packet: reason=initial too small, remote={}",
                    datagram.remote
                );
                return None;
            }

            packet.initial = true;
        }

        Some(packet)
    }

    /// Whether the head of a sub-chain may create a connection: a
    /// supported-version Initial, and someone listening.
    fn should_create_connection(&self, packet: &Packet) -> bool {
        packet.long && packet.initial && self.listeners.has_any()
    }

    /// The memory-pressure Retry gate. Under the limit everything
    /// proceeds; over it an Initial must carry a valid token.
    fn should_retry(&self, datagram: &Datagram, packet: &Packet) -> RetryCheck {
        if !self.endpoint.retry_required() {
            return RetryCheck::Proceed {
                orig_dest_cid: None,
            };
        }

        let token = match Header::decode(&datagram.bytes, self.local_cid_length()) {
            Ok(Header::Long { payload, .. }) => match initial_token(payload) {
                Ok(token) => token,
                Err(_) => return RetryCheck::Drop("malformed token"),
            },
            _ => return RetryCheck::Drop("malformed token"),
        };

        if token.is_empty() {
            return RetryCheck::Retry;
        }

        let token = match self.endpoint.retry_key().open(&packet.dest_cid, token) {
            Ok(token) => token,
            Err(_) => return RetryCheck::Drop("invalid retry token"),
        };

        if token.remote != datagram.remote {
            return RetryCheck::Drop("retry token address mismatch");
        }

        if token.orig_cid.len() < MIN_INITIAL_CONNECTION_ID_LENGTH {
            return RetryCheck::Drop("retry token cid too short");
        }

        RetryCheck::Proceed {
            orig_dest_cid: Some(token.orig_cid),
        }
    }

    /// Deliver one sub-chain: to its connection if the Dest-CID is
    /// known, otherwise through the stateless and creation gates.
    /// Handshake packets go first so a stray data packet at the front
    /// of a burst cannot mask the Initial behind it.
    fn deliver(&self, mut chain: Vec<(Datagram, Packet)>) {
        chain.sort_by_key(|(_, packet)| !packet.long);
        let head = chain[0].1;

        if let Some(conn) = self.lookup.find_by_cid(&head.dest_cid) {
            conn.receive(chain.into_iter().map(|(datagram, _)| datagram).collect());
            return;
        }

        if !self.should_create_connection(&head) {
            self.queue_stateless_reset(&chain[0].0, &head);
            return;
        }

        let orig_dest_cid = match self.should_retry(&chain[0].0, &head) {
            RetryCheck::Retry => {
                self.queue_stateless_operation(StatelessKind::Retry, &chain[0].0);
                return;
            }
            RetryCheck::Drop(reason) => {
                log::debug!(
                    "dropped packet: reason={}, remote={}",
                    reason,
                    chain[0].0.remote
                );
                return;
            }
            RetryCheck::Proceed { orig_dest_cid } => orig_dest_cid,
        };

        if self.handler.is_overloaded() {
            log::debug!(
                "dropped packet: reason=worker overloaded, remote={}",
                chain[0].0.remote
            );
            return;
        }

        let info = NewConnection {
            local: chain[0].0.local,
            remote: chain[0].0.remote,
            dest_cid: head.dest_cid,
            source_cid: head.source_cid,
            version: head.version,
            orig_dest_cid,
        };

        let Some(conn) = self.handler.create_connection(&info) else {
            log::debug!(
                "dropped packet: reason=connection creation failed, remote={}",
                info.remote
            );
            return;
        };

        // The connection becomes findable here and not before; a
        // colliding insert means someone else won the race and the
        // half-born connection is reclaimed by dropping it.
        match self.lookup.insert(head.dest_cid, self.remote, &conn) {
            Insert::Inserted => {
                conn.receive(chain.into_iter().map(|(datagram, _)| datagram).collect())
            }
            Insert::Collided(existing) => {
                existing.receive(chain.into_iter().map(|(datagram, _)| datagram).collect())
            }
        }
    }

    /// Admit a stateless reset for an unattributable packet, when one
    /// is allowed at all: never on exclusive bindings (no CID, no
    /// derivable token), never for long headers (the peer has not
    /// learned the token yet), and never when the trigger is too short
    /// to answer below its own length.
    fn queue_stateless_reset(&self, datagram: &Datagram, packet: &Packet) {
        if self.exclusive || packet.long {
            return;
        }

        if datagram.bytes.len() <= MIN_STATELESS_RESET_PACKET_LENGTH {
            log::debug!(
                "dropped packet: reason=too short for stateless reset, remote={}",
                datagram.remote
            );
            return;
        }

        self.queue_stateless_operation(StatelessKind::StatelessReset, datagram);
    }

    fn queue_stateless_operation(&self, kind: StatelessKind, datagram: &Datagram) {
        if self.handler.is_overloaded() {
            log::debug!(
                "dropped packet: reason=worker overloaded, remote={}",
                datagram.remote
            );
            return;
        }

        match self.stateless.try_admit(datagram.clone(), kind) {
            Ok(ctx) => self.handler.dispatch_stateless(ctx),
            Err(e) => {
                log::debug!("dropped packet: reason={}, remote={}", e, datagram.remote)
            }
        }
    }

    /// Build and send one admitted stateless response, then release it.
    /// Called from a worker, never from the receive path. Returns
    /// whether a datagram went out.
    pub fn process_stateless_operation(&self, ctx: &Arc<StatelessContext>) -> bool {
        let mut bytes = BytesMut::with_capacity(1500);

        let built = match ctx.kind {
            StatelessKind::VersionNegotiation => self.build_version_negotiation(ctx, &mut bytes),
            StatelessKind::Retry => self.build_retry(ctx, &mut bytes),
            StatelessKind::StatelessReset => self.build_stateless_reset(ctx, &mut bytes),
        };

        let sent = match built {
            Ok(()) => match self.datapath.send_to(ctx.remote, bytes.freeze()) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("stateless send failed: remote={}, error={}", ctx.remote, e);
                    false
                }
            },
            Err(e) => {
                log::debug!(
                    "stateless operation failed: remote={}, error={}",
                    ctx.remote,
                    e
                );
                false
            }
        };

        self.stateless.release(ctx);
        sent
    }

    fn build_version_negotiation(
        &self,
        ctx: &Arc<StatelessContext>,
        bytes: &mut BytesMut,
    ) -> Result<(), Error> {
        let Header::Long {
            dest_cid,
            source_cid,
            ..
        } = Header::decode(&ctx.datagram.bytes, self.local_cid_length())?
        else {
            return Err(Error::InvalidInput);
        };

        builder::version_negotiation(
            bytes,
            rand::rng().random(),
            dest_cid,
            source_cid,
            self.reserved_version,
            &SUPPORTED_VERSIONS,
        );

        Ok(())
    }

    fn build_retry(&self, ctx: &Arc<StatelessContext>, bytes: &mut BytesMut) -> Result<(), Error> {
        let Header::Long {
            version,
            dest_cid,
            source_cid,
            ..
        } = Header::decode(&ctx.datagram.bytes, self.local_cid_length())?
        else {
            return Err(Error::InvalidInput);
        };

        let mut rng = rand::rng();

        let mut id = [0u8; SERVER_CHOSEN_CID_LENGTH];
        rng.fill(&mut id);
        let server_cid = Cid::from_slice(&id)?;

        let token = RetryToken {
            remote: ctx.remote,
            orig_cid: Cid::from_slice(dest_cid)?,
        };

        let sealed = self.endpoint.retry_key().seal(&server_cid, &token)?;
        builder::retry(
            bytes,
            rng.random(),
            version,
            source_cid,
            server_cid.as_slice(),
            dest_cid,
            &sealed,
        );

        Ok(())
    }

    fn build_stateless_reset(
        &self,
        ctx: &Arc<StatelessContext>,
        bytes: &mut BytesMut,
    ) -> Result<(), Error> {
        let header = Header::decode(&ctx.datagram.bytes, self.local_cid_length())?;
        if header.is_long() {
            return Err(Error::InvalidInput);
        }

        let token = self.reset_key.token(header.dest_cid());

        let mut rng = rand::rng();

        // Recommended length plus three bits of entropy, strictly below
        // the trigger and never below the minimum.
        let length = (RECOMMENDED_STATELESS_RESET_PACKET_LENGTH
            + (rng.random::<u8>() & 0x07) as usize)
            .min(ctx.datagram.bytes.len() - 1);
        if length < MIN_STATELESS_RESET_PACKET_LENGTH {
            return Err(Error::InvalidInput);
        }

        let mut random = vec![0u8; length];
        rng.fill(random.as_mut_slice());

        builder::stateless_reset(bytes, &random, header.key_phase(), &token);
        Ok(())
    }

    /// Teardown, after the datapath has quiesced: no receive up-call
    /// can arrive anymore, so the stateless table drains
    /// unconditionally. Listeners and connections must already be gone.
    pub fn close(&self) {
        self.stateless.drain();

        debug_assert!(
            self.listeners.is_empty(),
            "binding closed with registered listeners"
        );
        debug_assert!(
            self.lookup.is_empty(),
            "binding closed with live connections"
        );
    }
}
