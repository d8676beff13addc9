//! Per-socket demultiplexer and admission gate. The router owns the socket
//! and both connection tables; connections reach the network only through
//! the router's sync loop. One thread drives one router.

use crate::keys::KeyRing;
use crate::logging::{self, Logger};
use crate::net::buffer::BufferPool;
use crate::net::connection::{
    Connection, ConnectionEvent, ConnectionLimits, ConnectionOptions, DEFAULT_PING_INTERVAL_MS,
    DEFAULT_RTT_MS,
};
use crate::net::socket::Datagram;
use crate::net::wire::{self, Handshake, PacketKind, Prefix, RejectBody, RejectCode};
use crate::shared::{ErrorType, NetworkError, NetworkResult};
use crate::time::timestamp_millis;
use crate::{ConnectionId, StreamId};
use hashbrown::HashMap;
use indexmap::IndexSet;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 1024;
pub const DEFAULT_BIND_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_STOP_GRACE_MS: u64 = 1_000;

/// Attempts at rolling a fresh non-zero connection id.
const ID_ATTEMPTS: u32 = 30;

/// Strikes after which a source is dropped without inspection.
const DELINQUENCY_LIMIT: u32 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RouterState {
    Create,
    Bind,
    Listen,
    StopNotify,
    Close,
    End,
    CloseError,
    Error,
}

impl RouterState {
    #[inline]
    pub fn terminal(self) -> bool {
        match self {
            RouterState::End | RouterState::Error => true,
            _ => false,
        }
    }
}

pub type ScreenCallback = Rc<dyn Fn(&[u8], SocketAddr) -> bool>;

/// Per-router policy: what traffic is admitted and with which keys.
#[derive(Clone)]
pub struct RouterPolicy {
    pub allow_incoming: bool,
    pub allow_outgoing: bool,
    /// Accept OPENs whose sealed body travels in the clear.
    pub allow_unsafe_open: bool,
    /// Run the whole session unencrypted. Test deployments only.
    pub allow_unsafe_packet: bool,
    pub max_connections: u32,
    pub keys: KeyRing,
    pub bind_timeout_ms: u64,
    pub emtu: usize,
    pub rtt_ms: u64,
    pub ping_interval_ms: u64,
    pub limits: ConnectionLimits,
}

impl Default for RouterPolicy {
    fn default() -> RouterPolicy {
        RouterPolicy {
            allow_incoming: true,
            allow_outgoing: true,
            allow_unsafe_open: false,
            allow_unsafe_packet: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            keys: KeyRing::default(),
            bind_timeout_ms: DEFAULT_BIND_TIMEOUT_MS,
            emtu: wire::DEFAULT_EMTU,
            rtt_ms: DEFAULT_RTT_MS,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            limits: ConnectionLimits::default(),
        }
    }
}

/// Application-facing router events, drained after every sync.
#[derive(Debug)]
pub enum RouterEvent {
    /// The router began binding.
    Started,
    /// The socket is bound and datagrams flow.
    Listening,
    /// An inbound connection completed its handshake.
    Accepted(ConnectionId),
    /// An outbound connection completed its handshake.
    Connected(ConnectionId),
    /// An outbound connection failed before establishing.
    ConnectFailed(ConnectionId, ErrorType),
    /// A connection ended and left the tables.
    Disconnected(ConnectionId),
    /// The peer moved to a new address.
    AddressChanged(ConnectionId, SocketAddr),
    /// A complete inbound stream message.
    Message {
        conn: ConnectionId,
        stream: StreamId,
        bytes: Vec<u8>,
    },
    StreamClosed(ConnectionId, StreamId),
    /// An authenticated FORWARD payload.
    Forward(ConnectionId, Vec<u8>),
    /// The peer rejected a connection.
    Rejected(ConnectionId, RejectBody),
    /// A connection-level fault. The connection may survive it.
    ConnectionError(ConnectionId, ErrorType),
    /// A router-level fault (malformed datagram, socket trouble).
    Error(ErrorType),
    /// The router reached END.
    Stopped,
}

pub struct Router<S: Datagram> {
    log: Logger,
    socket: S,
    policy: RouterPolicy,
    state: RouterState,

    conns: HashMap<ConnectionId, Connection>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
    live: IndexSet<ConnectionId>,
    delinquency: HashMap<SocketAddr, u32>,

    /// Recently ended ids, kept out of circulation for one RTT.
    retired: Vec<(ConnectionId, Instant)>,

    screen: Option<ScreenCallback>,
    id_source: Box<dyn FnMut() -> u32>,

    bind_deadline: Option<Instant>,
    stop_deadline: Option<Instant>,

    pool: BufferPool,
    events: Vec<RouterEvent>,
}

impl<S: Datagram> Router<S> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(socket: S, policy: RouterPolicy, log: L) -> Router<S> {
        let emtu = policy.emtu;

        Router {
            log: logging::child_or_discard(log.into()),
            socket,
            policy,
            state: RouterState::Create,
            conns: HashMap::new(),
            by_addr: HashMap::new(),
            live: IndexSet::new(),
            delinquency: HashMap::new(),
            retired: Vec::new(),
            screen: None,
            id_source: Box::new(crate::crypto::random_u32),
            bind_deadline: None,
            stop_deadline: None,
            pool: BufferPool::new(emtu.max(wire::EMTU_MAX)),
            events: Vec::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> RouterState {
        self.state
    }

    /// Installs the per-OPEN admission hook: routing blob plus source address
    /// in, verdict out. Without one every screened OPEN is admitted.
    pub fn screen(&mut self, callback: ScreenCallback) {
        self.screen = Some(callback);
    }

    /// Replaces the id generator. Test seam.
    pub(crate) fn id_source(&mut self, source: Box<dyn FnMut() -> u32>) {
        self.id_source = source;
    }

    /// Strike count currently held against a source.
    pub fn strikes(&self, source: SocketAddr) -> u32 {
        self.delinquency.get(&source).copied().unwrap_or(0)
    }

    /// Direct access to one connection, e.g. to open streams on it.
    pub fn connection(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    /// Drains the events accumulated since the last call.
    pub fn events(&mut self) -> impl Iterator<Item = RouterEvent> + '_ {
        self.events.drain(..)
    }

    // -- lifecycle ----------------------------------------------------------

    /// CREATE -> BIND. Binding usually completes inside this call; when the
    /// socket is not ready yet, sync retries until the bind timeout.
    pub fn start(&mut self, now: Instant) -> NetworkResult<()> {
        if self.state != RouterState::Create {
            return Err(NetworkError::Fatal(ErrorType::StateViolation));
        }

        self.state = RouterState::Bind;
        self.events.push(RouterEvent::Started);
        self.bind_deadline = Some(now + Duration::from_millis(self.policy.bind_timeout_ms));
        self.try_bind(now);

        Ok(())
    }

    fn try_bind(&mut self, now: Instant) {
        match self.socket.bind() {
            Ok(()) => {
                logging::debug!(self.log, "socket bound"; "context" => "try_bind");
                self.state = RouterState::Listen;
                self.bind_deadline = None;
                self.events.push(RouterEvent::Listening);
            }
            Err(NetworkError::Wait) => {
                if self.bind_deadline.map_or(false, |deadline| now >= deadline) {
                    self.fault(ErrorType::Timeout);
                }
            }
            Err(NetworkError::Fatal(error)) => self.fault(error),
        }
    }

    /// LISTEN -> STOP_NOTIFY. Every connection gets the grace window to run
    /// its NOTIFY exchange; stragglers are killed when it lapses.
    pub fn stop(&mut self, grace_ms: u64, now: Instant) -> NetworkResult<()> {
        if self.state != RouterState::Listen {
            return Err(NetworkError::Fatal(ErrorType::StateViolation));
        }

        logging::debug!(self.log, "stopping router";
                        "context" => "stop",
                        "connections" => self.conns.len(),
                        "grace_ms" => grace_ms);

        self.state = RouterState::StopNotify;
        self.stop_deadline = Some(now + Duration::from_millis(grace_ms));

        let ids: Vec<_> = self.live.iter().copied().collect();
        for id in ids {
            let pending = {
                let conn = self.conns.get_mut(&id).expect("live connection in table");
                let pending = conn.initiator() && !conn.announced();
                let _ = conn.close(now);
                pending
            };

            // Pending outbound handshakes cannot finish any more.
            if pending {
                self.events.push(RouterEvent::ConnectFailed(id, ErrorType::Timeout));
            }

            self.flush_connection(id);
        }

        Ok(())
    }

    fn fault(&mut self, error: ErrorType) {
        logging::error!(self.log, "router fault";
                        "context" => "fault",
                        "state" => ?self.state,
                        "error" => ?error);

        self.state = if self.state == RouterState::Close {
            RouterState::CloseError
        } else {
            RouterState::Error
        };

        self.socket.close();
        self.events.push(RouterEvent::Error(error));
    }

    // -- outbound -----------------------------------------------------------

    /// Starts an outbound connection. Completion is observed as a
    /// `Connected` or `ConnectFailed` event carrying the returned id.
    pub fn connect(
        &mut self,
        dest: SocketAddr,
        mut options: ConnectionOptions,
        now: Instant,
    ) -> NetworkResult<ConnectionId> {
        if !self.policy.allow_outgoing {
            return Err(NetworkError::Fatal(ErrorType::StateViolation));
        }

        if self.state != RouterState::Listen && self.state != RouterState::Bind {
            return Err(NetworkError::Fatal(ErrorType::StateViolation));
        }

        if self.conns.len() as u32 >= self.policy.max_connections {
            return Err(NetworkError::Fatal(ErrorType::RouterBusy));
        }

        let id = self.allocate_id(now)?;

        options.encrypted = !self.policy.allow_unsafe_packet;
        if options.sign_pair.is_none() {
            options.sign_pair = self.policy.keys.sign_pair();
        }

        let conn = Connection::connect(id, dest, options, Some(&self.log), now)?;

        self.conns.insert(id, conn);
        self.by_addr.insert(dest, id);
        self.live.insert(id);
        self.flush_connection(id);

        Ok(id)
    }

    /// Random non-zero id, rerolled on collision.
    fn allocate_id(&mut self, now: Instant) -> NetworkResult<ConnectionId> {
        let rtt = Duration::from_millis(self.policy.rtt_ms);
        self.retired.retain(|&(_, at)| now.duration_since(at) < rtt);

        for _ in 0..ID_ATTEMPTS {
            let id = (self.id_source)();

            if id == 0 || self.conns.contains_key(&id) {
                continue;
            }

            if self.retired.iter().any(|&(retired, _)| retired == id) {
                continue;
            }

            return Ok(id);
        }

        logging::error!(self.log, "Unable to create a unique id"; "context" => "allocate_id");
        Err(NetworkError::Fatal(ErrorType::IdExhausted))
    }

    // -- sync loop ----------------------------------------------------------

    /// One scheduling quantum: service the socket, drive timers, flush
    /// queues, reap ended connections. The caller decides the cadence.
    pub fn sync(&mut self, now: Instant) {
        match self.state {
            RouterState::Bind => {
                self.try_bind(now);
                return;
            }
            RouterState::Listen | RouterState::StopNotify => (),
            _ => return,
        }

        // Drain the socket.
        loop {
            let mut buf = self.pool.take();

            match self.socket.recv(&mut buf) {
                Ok((len, source)) => {
                    let datagram = &buf[..len.min(buf.len())];
                    self.admit(datagram, source, now);
                }
                Err(NetworkError::Wait) => {
                    self.pool.put(buf);
                    break;
                }
                Err(NetworkError::Fatal(error)) => {
                    self.pool.put(buf);
                    self.fault(error);
                    return;
                }
            }

            self.pool.put(buf);
        }

        // Drive every connection's timers and queues.
        let ids: Vec<_> = self.live.iter().copied().collect();
        for id in ids {
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.tick(now);
            }
            self.flush_connection(id);
        }

        self.reap(now);

        if self.state == RouterState::StopNotify {
            let lapsed = self.stop_deadline.map_or(false, |deadline| now >= deadline);

            if lapsed {
                let ids: Vec<_> = self.live.iter().copied().collect();
                for id in ids {
                    if let Some(conn) = self.conns.get_mut(&id) {
                        conn.kill(now);
                    }
                    self.flush_connection(id);
                }
                self.reap(now);
            }

            if self.conns.is_empty() {
                self.finish_stop();
            }
        }
    }

    fn finish_stop(&mut self) {
        self.state = RouterState::Close;
        self.socket.close();

        logging::debug!(self.log, "router stopped"; "context" => "finish_stop");

        self.state = RouterState::End;
        self.stop_deadline = None;
        self.events.push(RouterEvent::Stopped);
    }

    // -- admission ----------------------------------------------------------

    /// The per-datagram gauntlet of §4.2: delinquency, length lint, flag
    /// policy, then dispatch to a connection.
    fn admit(&mut self, datagram: &[u8], source: SocketAddr, now: Instant) {
        if self.strikes(source) > DELINQUENCY_LIMIT {
            logging::trace!(self.log, "dropping datagram from delinquent source";
                            "context" => "admit",
                            "source" => %source);
            return;
        }

        if datagram.len() < wire::PREFIX_SIZE {
            self.strike(source, ErrorType::MalformedPacket);
            return;
        }

        let prefix = match Prefix::read(datagram) {
            Some(prefix) => prefix,
            None => {
                self.strike(source, ErrorType::MalformedPacket);
                return;
            }
        };

        let kind = match prefix.kind() {
            Some(kind) => kind,
            None => {
                self.strike(source, ErrorType::MalformedPacket);
                return;
            }
        };

        let min_len = kind.min_len(prefix.encrypted());
        let length_ok = if kind.fixed_len() {
            datagram.len() == min_len
        } else {
            datagram.len() >= min_len
        };

        if !length_ok {
            self.strike(source, ErrorType::MalformedPacket);
            return;
        }

        // The encrypted flag must agree with the policy.
        let expect_encrypted = if kind == PacketKind::Open {
            !self.policy.allow_unsafe_open
        } else {
            !self.policy.allow_unsafe_packet
        };

        if kind != PacketKind::Reject && prefix.encrypted() != expect_encrypted {
            self.strike(source, ErrorType::MalformedPacket);
            return;
        }

        // OPEN has no identity yet; everything else addresses one. Rejects of
        // a never-admitted OPEN also carry id zero and route by source.
        if kind == PacketKind::Open {
            if prefix.id != 0 {
                self.strike(source, ErrorType::MalformedPacket);
                return;
            }
            self.admit_open(datagram, prefix, source, now);
        } else if kind == PacketKind::Reject && prefix.id == 0 {
            match self.by_addr.get(&source).copied() {
                Some(id) => self.deliver(id, datagram, prefix, source, now),
                None => self.strike(source, ErrorType::MalformedPacket),
            }
        } else {
            if prefix.id == 0 {
                self.strike(source, ErrorType::MalformedPacket);
                return;
            }
            self.dispatch(datagram, prefix, source, now);
        }
    }

    fn admit_open(&mut self, datagram: &[u8], prefix: Prefix, source: SocketAddr, now: Instant) {
        // A duplicate OPEN from a known source folds into its connection.
        if let Some(&id) = self.by_addr.get(&source) {
            self.deliver(id, datagram, prefix, source, now);
            return;
        }

        if !self.policy.allow_incoming {
            logging::debug!(self.log, "dropping open, incoming disabled";
                            "context" => "admit_open",
                            "source" => %source);
            return;
        }

        let parsed = match Handshake::parse_open(datagram) {
            Ok(parsed) => parsed,
            Err(_) => {
                self.strike(source, ErrorType::MalformedPacket);
                return;
            }
        };

        if let Some(screen) = &self.screen {
            if !screen(parsed.routing, source) {
                logging::debug!(self.log, "open rejected by screen";
                                "context" => "admit_open",
                                "source" => %source);
                self.strike(source, ErrorType::ProtocolViolation);
                return;
            }
        }

        if self.conns.len() as u32 >= self.policy.max_connections {
            self.send_reject(source, RejectCode::Busy, "router at capacity", datagram.len());
            return;
        }

        let id = match self.allocate_id(now) {
            Ok(id) => id,
            Err(NetworkError::Fatal(error)) => {
                self.events.push(RouterEvent::Error(error));
                return;
            }
            Err(NetworkError::Wait) => return,
        };

        let options = ConnectionOptions {
            encrypted: !self.policy.allow_unsafe_packet,
            open_pair: self.policy.keys.open_pair(),
            sign_pair: self.policy.keys.sign_pair(),
            limits: self.policy.limits,
            rtt_ms: self.policy.rtt_ms,
            ping_interval_ms: self.policy.ping_interval_ms,
            emtu: self.policy.emtu,
            ..ConnectionOptions::default()
        };

        let conn = Connection::accept(id, source, options, Some(&self.log), now);

        logging::debug!(self.log, "admitting open";
                        "context" => "admit_open",
                        "conn_id" => id,
                        "source" => %source);

        self.conns.insert(id, conn);
        self.by_addr.insert(source, id);
        self.live.insert(id);

        self.deliver(id, datagram, prefix, source, now);
    }

    fn dispatch(&mut self, datagram: &[u8], prefix: Prefix, source: SocketAddr, now: Instant) {
        if self.conns.contains_key(&prefix.id) {
            self.deliver(prefix.id, datagram, prefix, source, now);
        } else {
            // Reply only when it cannot amplify.
            self.send_reject(source, RejectCode::Invalid, "unknown id", datagram.len());
            self.strike(source, ErrorType::ProtocolViolation);
        }
    }

    fn deliver(&mut self, id: ConnectionId, datagram: &[u8], prefix: Prefix, source: SocketAddr, now: Instant) {
        let result = self
            .conns
            .get_mut(&id)
            .expect("delivered connection in table")
            .handle_datagram(datagram, prefix, source, now);

        match result {
            Ok(()) => (),
            // Replays drop silently; it could be the network dawdling.
            Err(NetworkError::Fatal(ErrorType::Replay)) => {
                logging::trace!(self.log, "replay dropped";
                                "context" => "deliver",
                                "conn_id" => id,
                                "sequence" => prefix.sequence);
            }
            Err(NetworkError::Fatal(error)) => self.strike(source, error),
            Err(NetworkError::Wait) => (),
        }

        self.flush_connection(id);
        self.reap(now);
    }

    /// Sends the connection's queued datagrams and surfaces its events.
    fn flush_connection(&mut self, id: ConnectionId) {
        let (addr, datagrams, events) = match self.conns.get_mut(&id) {
            Some(conn) => {
                let mut datagrams = Vec::new();
                while let Some(datagram) = conn.pop_outgoing() {
                    datagrams.push(datagram);
                }
                let events: Vec<_> = conn.events().collect();
                (conn.peer_addr(), datagrams, events)
            }
            None => return,
        };

        for datagram in datagrams {
            if let Err(error) = self.socket.send(addr, &datagram) {
                if error != NetworkError::Wait {
                    logging::warn!(self.log, "send failed";
                                   "context" => "flush_connection",
                                   "conn_id" => id,
                                   "error" => ?error);
                }
            }
        }

        for event in events {
            let initiator = self
                .conns
                .get(&id)
                .map(Connection::initiator)
                .unwrap_or(false);

            let mapped = match event {
                ConnectionEvent::Connected => {
                    if initiator {
                        RouterEvent::Connected(id)
                    } else {
                        RouterEvent::Accepted(id)
                    }
                }
                ConnectionEvent::Message { stream, bytes } => {
                    RouterEvent::Message { conn: id, stream, bytes }
                }
                ConnectionEvent::AddressChanged(addr) => {
                    self.by_addr.retain(|_, &mut other| other != id);
                    self.by_addr.insert(addr, id);
                    RouterEvent::AddressChanged(id, addr)
                }
                ConnectionEvent::Rejected(body) => RouterEvent::Rejected(id, body),
                ConnectionEvent::Forward(bytes) => RouterEvent::Forward(id, bytes),
                ConnectionEvent::StreamClosed(stream) => RouterEvent::StreamClosed(id, stream),
                ConnectionEvent::Error(error) => {
                    let announced = self
                        .conns
                        .get(&id)
                        .map(Connection::announced)
                        .unwrap_or(true);

                    if initiator && !announced {
                        RouterEvent::ConnectFailed(id, error)
                    } else {
                        RouterEvent::ConnectionError(id, error)
                    }
                }
                ConnectionEvent::Closed => RouterEvent::Disconnected(id),
            };

            self.events.push(mapped);
        }
    }

    /// Removes ended connections from both tables and retires their ids.
    fn reap(&mut self, now: Instant) {
        let ended: Vec<_> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.state().terminal())
            .map(|(&id, _)| id)
            .collect();

        for id in ended {
            self.flush_connection(id);

            self.conns.remove(&id);
            self.by_addr.retain(|_, &mut other| other != id);
            self.live.remove(&id);
            self.retired.push((id, now));

            logging::debug!(self.log, "connection reaped";
                            "context" => "reap",
                            "conn_id" => id);
        }
    }

    fn strike(&mut self, source: SocketAddr, error: ErrorType) {
        let strikes = self.delinquency.entry(source).or_insert(0);
        *strikes += 1;

        logging::warn!(self.log, "striking source";
                       "context" => "strike",
                       "source" => %source,
                       "strikes" => *strikes,
                       "error" => ?error);

        self.events.push(RouterEvent::Error(error));
    }

    /// Clear REJECT, sent only when the reply cannot exceed the offending
    /// datagram (amplification bound).
    fn send_reject(&mut self, source: SocketAddr, code: RejectCode, message: &str, request_len: usize) {
        let body = RejectBody {
            timestamp: timestamp_millis(),
            code,
            message: message.to_owned(),
        };

        if let Ok(datagram) = wire::mk_reject(0, 0, &body, None) {
            if datagram.len() <= request_len {
                let _ = self.socket.send(source, &datagram);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::{MemoryHub, MemorySocket};
    use std::cell::RefCell;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn server_policy(keys: &KeyRing) -> RouterPolicy {
        RouterPolicy {
            allow_incoming: true,
            allow_outgoing: false,
            keys: keys.clone(),
            ..RouterPolicy::default()
        }
    }

    fn client_policy() -> RouterPolicy {
        RouterPolicy {
            allow_incoming: false,
            allow_outgoing: true,
            ..RouterPolicy::default()
        }
    }

    fn started<S: Datagram>(mut router: Router<S>, now: Instant) -> Router<S> {
        router.start(now).unwrap();
        assert_eq!(router.state(), RouterState::Listen);
        router
    }

    fn connect_options(keys: &KeyRing) -> ConnectionOptions {
        ConnectionOptions {
            peer_open_key: keys.open_public.as_ref().map(|key| **key),
            ..ConnectionOptions::default()
        }
    }

    struct Pair {
        server: Router<MemorySocket>,
        client: Router<MemorySocket>,
        now: Instant,
    }

    fn mk_pair() -> Pair {
        let now = Instant::now();
        let hub = MemoryHub::new();
        let keys = KeyRing::generate_open();

        let server = started(
            Router::new(MemorySocket::new(&hub, addr(42_443)), server_policy(&keys), None),
            now,
        );
        let client = started(
            Router::new(MemorySocket::new(&hub, addr(42_001)), client_policy(), None),
            now,
        );

        let mut pair = Pair { server, client, now };
        let id = pair
            .client
            .connect(addr(42_443), connect_options(&keys), now)
            .unwrap();
        assert_ne!(id, 0);
        pair
    }

    /// Alternates syncs until the hub drains.
    fn settle(pair: &mut Pair, rounds: usize) {
        for _ in 0..rounds {
            pair.server.sync(pair.now);
            pair.client.sync(pair.now);
        }
    }

    fn drain<S: Datagram>(router: &mut Router<S>) -> Vec<RouterEvent> {
        router.events().collect()
    }

    #[test]
    fn test_end_to_end_handshake() {
        let mut pair = mk_pair();
        settle(&mut pair, 4);

        let server_events = drain(&mut pair.server);
        let client_events = drain(&mut pair.client);

        assert!(
            server_events.iter().any(|event| matches!(event, RouterEvent::Accepted(_))),
            "server accepts: {:?}",
            server_events
        );
        assert!(
            client_events.iter().any(|event| matches!(event, RouterEvent::Connected(_))),
            "client connects: {:?}",
            client_events
        );
    }

    #[test]
    fn test_echo_stream_roundtrip() {
        let mut pair = mk_pair();
        settle(&mut pair, 4);

        let client_id = drain(&mut pair.client)
            .into_iter()
            .find_map(|event| match event {
                RouterEvent::Connected(id) => Some(id),
                _ => None,
            })
            .expect("client connected");

        let server_id = drain(&mut pair.server)
            .into_iter()
            .find_map(|event| match event {
                RouterEvent::Accepted(id) => Some(id),
                _ => None,
            })
            .expect("server accepted");

        // Client sends over a fresh reliable ordered stream.
        {
            let conn = pair.client.connection(client_id).unwrap();
            let stream = conn.mk_stream(None, true, true).unwrap();
            conn.stream_send(stream, b"Hello, world!", pair.now).unwrap();
        }
        pair.client.sync(pair.now);
        pair.server.sync(pair.now);

        // Server application echoes what it received.
        let received = drain(&mut pair.server)
            .into_iter()
            .find_map(|event| match event {
                RouterEvent::Message { bytes, .. } => Some(bytes),
                _ => None,
            })
            .expect("server received message");
        assert_eq!(received, b"Hello, world!".to_vec());

        {
            let conn = pair.server.connection(server_id).unwrap();
            let stream = conn.mk_stream(None, true, true).unwrap();
            conn.stream_send(stream, &received, pair.now).unwrap();
        }
        pair.server.sync(pair.now);
        pair.client.sync(pair.now);

        let echoed = drain(&mut pair.client)
            .into_iter()
            .find_map(|event| match event {
                RouterEvent::Message { bytes, .. } => Some(bytes),
                _ => None,
            })
            .expect("client received echo");
        assert_eq!(echoed, b"Hello, world!".to_vec());
        assert_eq!(echoed.len(), 13);
    }

    #[test]
    fn test_unsafe_open_round_trip() {
        let now = Instant::now();
        let hub = MemoryHub::new();

        let server_policy = RouterPolicy {
            allow_incoming: true,
            allow_outgoing: false,
            allow_unsafe_open: true,
            allow_unsafe_packet: true,
            ..RouterPolicy::default()
        };
        let client_policy = RouterPolicy {
            allow_incoming: false,
            allow_outgoing: true,
            allow_unsafe_packet: true,
            ..RouterPolicy::default()
        };

        let mut server = started(
            Router::new(MemorySocket::new(&hub, addr(42_000)), server_policy, None),
            now,
        );
        let mut client = started(
            Router::new(MemorySocket::new(&hub, addr(42_002)), client_policy, None),
            now,
        );

        // No preshared key: the OPEN goes out in the clear.
        client.connect(addr(42_000), ConnectionOptions::default(), now).unwrap();

        for _ in 0..4 {
            server.sync(now);
            client.sync(now);
        }

        assert!(drain(&mut server).iter().any(|event| matches!(event, RouterEvent::Accepted(_))));
        assert!(drain(&mut client).iter().any(|event| matches!(event, RouterEvent::Connected(_))));
    }

    #[test]
    fn test_bad_control_byte_strikes() {
        let now = Instant::now();
        let hub = MemoryHub::new();
        let keys = KeyRing::generate_open();

        let mut server = started(
            Router::new(MemorySocket::new(&hub, addr(42_443)), server_policy(&keys), None),
            now,
        );

        let mut rogue = MemorySocket::new(&hub, addr(42_900));
        rogue.bind().unwrap();
        rogue.send(addr(42_443), &[0x7F, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();

        server.sync(now);

        let events = drain(&mut server);
        assert!(
            events.iter().any(|event| matches!(event, RouterEvent::Error(ErrorType::MalformedPacket))),
            "{:?}",
            events
        );
        assert_eq!(server.strikes(addr(42_900)), 1);
        assert_eq!(server.conns.len(), 0);
    }

    #[test]
    fn test_short_datagram_strikes() {
        let now = Instant::now();
        let hub = MemoryHub::new();
        let keys = KeyRing::generate_open();

        let mut server = started(
            Router::new(MemorySocket::new(&hub, addr(42_443)), server_policy(&keys), None),
            now,
        );

        let mut rogue = MemorySocket::new(&hub, addr(42_900));
        rogue.bind().unwrap();
        rogue.send(addr(42_443), &[0u8; wire::PREFIX_SIZE - 1]).unwrap();

        server.sync(now);
        assert_eq!(server.strikes(addr(42_900)), 1);
    }

    #[test]
    fn test_delinquent_source_dropped_silently() {
        let now = Instant::now();
        let hub = MemoryHub::new();
        let keys = KeyRing::generate_open();

        let mut server = started(
            Router::new(MemorySocket::new(&hub, addr(42_443)), server_policy(&keys), None),
            now,
        );

        let mut rogue = MemorySocket::new(&hub, addr(42_900));
        rogue.bind().unwrap();

        for _ in 0..4 {
            rogue.send(addr(42_443), &[0x7F, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
            server.sync(now);
        }

        // Two strikes registered, further datagrams no longer inspected.
        assert_eq!(server.strikes(addr(42_900)), 2);
    }

    #[test]
    fn test_zero_id_non_open_strikes() {
        let now = Instant::now();
        let hub = MemoryHub::new();
        let keys = KeyRing::generate_open();

        let mut server = started(
            Router::new(MemorySocket::new(&hub, addr(42_443)), server_policy(&keys), None),
            now,
        );

        let mut rogue = MemorySocket::new(&hub, addr(42_900));
        rogue.bind().unwrap();

        // A well-formed encrypted PING with id zero.
        let mut datagram = vec![0u8; PacketKind::Ping.min_len(true)];
        datagram[0] = PacketKind::Ping as u8 | wire::ENCRYPTED_FLAG;
        rogue.send(addr(42_443), &datagram).unwrap();

        server.sync(now);
        assert_eq!(server.strikes(addr(42_900)), 1);
    }

    #[test]
    fn test_unknown_id_rejected_without_amplification() {
        let now = Instant::now();
        let hub = MemoryHub::new();
        let keys = KeyRing::generate_open();

        let mut server = started(
            Router::new(MemorySocket::new(&hub, addr(42_443)), server_policy(&keys), None),
            now,
        );

        let mut rogue = MemorySocket::new(&hub, addr(42_900));
        rogue.bind().unwrap();

        let mut datagram = vec![0u8; PacketKind::Ping.min_len(true)];
        datagram[0] = PacketKind::Ping as u8 | wire::ENCRYPTED_FLAG;
        datagram[4] = 9; // non-zero id
        rogue.send(addr(42_443), &datagram).unwrap();

        server.sync(now);

        let mut buf = [0u8; 1024];
        let (len, _) = rogue.recv(&mut buf).unwrap();

        // The REJECT is no larger than what was sent in.
        assert!(len <= datagram.len());
        let prefix = Prefix::read(&buf[..len]).unwrap();
        assert_eq!(prefix.kind(), Some(PacketKind::Reject));
        assert_eq!(server.strikes(addr(42_900)), 1);
    }

    #[test]
    fn test_screen_veto() {
        let now = Instant::now();
        let hub = MemoryHub::new();
        let keys = KeyRing::generate_open();

        let mut server = started(
            Router::new(MemorySocket::new(&hub, addr(42_443)), server_policy(&keys), None),
            now,
        );
        let seen: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        server.screen(Rc::new(move |routing, _source| {
            log.borrow_mut().push(routing.to_vec());
            false
        }));

        let mut client = started(
            Router::new(MemorySocket::new(&hub, addr(42_001)), client_policy(), None),
            now,
        );

        let mut options = connect_options(&keys);
        options.routing = b"lobby-7".to_vec();
        client.connect(addr(42_443), options, now).unwrap();

        for _ in 0..3 {
            client.sync(now);
            server.sync(now);
        }

        // The screen saw the routing blob and the open never became a connection.
        assert_eq!(seen.borrow().as_slice(), &[b"lobby-7".to_vec()]);
        assert_eq!(server.conns.len(), 0);
        assert_eq!(server.strikes(addr(42_001)), 1);
    }

    #[test]
    fn test_busy_router_rejects() {
        let now = Instant::now();
        let hub = MemoryHub::new();
        let keys = KeyRing::generate_open();

        let mut policy = server_policy(&keys);
        policy.max_connections = 0;

        let mut server = started(
            Router::new(MemorySocket::new(&hub, addr(42_443)), policy, None),
            now,
        );
        let mut client = started(
            Router::new(MemorySocket::new(&hub, addr(42_001)), client_policy(), None),
            now,
        );

        let id = client.connect(addr(42_443), connect_options(&keys), now).unwrap();

        for _ in 0..3 {
            client.sync(now);
            server.sync(now);
        }

        let events = drain(&mut client);
        assert!(
            events.iter().any(|event| matches!(
                event,
                RouterEvent::Rejected(conn, body) if *conn == id && body.code == RejectCode::Busy
            )),
            "{:?}",
            events
        );
    }

    #[test]
    fn test_id_collision_exhaustion() {
        let now = Instant::now();
        let hub = MemoryHub::new();
        let keys = KeyRing::generate_open();

        let mut client = started(
            Router::new(MemorySocket::new(&hub, addr(42_001)), client_policy(), None),
            now,
        );
        client.id_source(Box::new(|| 7));

        let first = client.connect(addr(42_443), connect_options(&keys), now).unwrap();
        assert_eq!(first, 7);

        let result = client.connect(addr(42_444), connect_options(&keys), now);
        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::IdExhausted));
        assert_eq!(client.conns.len(), 1);
    }

    #[test]
    fn test_retired_id_not_reused_within_rtt() {
        let now = Instant::now();
        let hub = MemoryHub::new();

        let mut client = started(
            Router::new(MemorySocket::new(&hub, addr(42_001)), client_policy(), None),
            now,
        );

        client.retired.push((7, now));
        client.id_source(Box::new({
            let mut calls = 0u32;
            move || {
                calls += 1;
                if calls < ID_ATTEMPTS { 7 } else { 8 }
            }
        }));

        // 7 is quarantined, the roll falls through to 8.
        assert_eq!(client.allocate_id(now).unwrap(), 8);

        // One RTT later the id is free again.
        let later = now + Duration::from_millis(DEFAULT_RTT_MS);
        client.id_source(Box::new(|| 7));
        assert_eq!(client.allocate_id(later).unwrap(), 7);
    }

    #[test]
    fn test_encrypted_flag_must_match_policy() {
        let now = Instant::now();
        let hub = MemoryHub::new();

        let policy = RouterPolicy {
            allow_incoming: true,
            allow_outgoing: false,
            allow_unsafe_open: true,
            allow_unsafe_packet: true,
            ..RouterPolicy::default()
        };
        let mut server = started(
            Router::new(MemorySocket::new(&hub, addr(42_080)), policy, None),
            now,
        );

        let mut rogue = MemorySocket::new(&hub, addr(42_900));
        rogue.bind().unwrap();

        // An encrypted-flagged PING against a fully unsafe router.
        let mut datagram = vec![0u8; PacketKind::Ping.min_len(true)];
        datagram[0] = PacketKind::Ping as u8 | wire::ENCRYPTED_FLAG;
        datagram[4] = 1;
        rogue.send(addr(42_080), &datagram).unwrap();

        server.sync(now);
        assert_eq!(server.strikes(addr(42_900)), 1);
    }

    #[test]
    fn test_open_with_nonzero_id_strikes() {
        let now = Instant::now();
        let hub = MemoryHub::new();
        let keys = KeyRing::generate_open();

        let mut server = started(
            Router::new(MemorySocket::new(&hub, addr(42_443)), server_policy(&keys), None),
            now,
        );

        let mut rogue = MemorySocket::new(&hub, addr(42_900));
        rogue.bind().unwrap();

        let mut datagram = vec![0u8; PacketKind::Open.min_len(true)];
        datagram[0] = PacketKind::Open as u8 | wire::ENCRYPTED_FLAG;
        datagram[4] = 3;
        rogue.send(addr(42_443), &datagram).unwrap();

        server.sync(now);
        assert_eq!(server.strikes(addr(42_900)), 1);
        assert_eq!(server.conns.len(), 0);
    }

    #[test]
    fn test_graceful_stop() {
        let mut pair = mk_pair();
        settle(&mut pair, 4);
        drain(&mut pair.server);
        drain(&mut pair.client);

        pair.server.stop(500, pair.now).unwrap();
        assert_eq!(pair.server.state(), RouterState::StopNotify);

        // NOTIFY flows to the client, the confirm comes back.
        settle(&mut pair, 3);

        assert_eq!(pair.server.state(), RouterState::End);
        let events = drain(&mut pair.server);
        assert!(events.iter().any(|event| matches!(event, RouterEvent::Stopped)));
        assert!(events.iter().any(|event| matches!(event, RouterEvent::Disconnected(_))));
    }

    #[test]
    fn test_stop_grace_forces_hard_close() {
        let mut pair = mk_pair();
        settle(&mut pair, 4);

        pair.server.stop(500, pair.now).unwrap();

        // The client never answers: past the grace window the server kills.
        let later = pair.now + Duration::from_millis(501);
        pair.server.sync(later);

        assert_eq!(pair.server.state(), RouterState::End);
        assert!(drain(&mut pair.server).iter().any(|event| matches!(event, RouterEvent::Stopped)));
    }

    #[test]
    fn test_outgoing_disallowed() {
        let now = Instant::now();
        let hub = MemoryHub::new();
        let keys = KeyRing::generate_open();

        let mut server = started(
            Router::new(MemorySocket::new(&hub, addr(42_443)), server_policy(&keys), None),
            now,
        );

        let result = server.connect(addr(42_001), ConnectionOptions::default(), now);
        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::StateViolation));
    }

    #[test]
    fn test_replay_is_silent() {
        let mut pair = mk_pair();
        settle(&mut pair, 4);
        drain(&mut pair.server);
        drain(&mut pair.client);

        // Force a keepalive ping out of the client, pull the raw bytes off
        // the wire, then feed them to the server twice.
        let later = pair.now + Duration::from_millis(DEFAULT_PING_INTERVAL_MS + 1);
        pair.client.sync(later);

        let mut tap = [0u8; 2048];
        let (len, source) = pair.server.socket.recv(&mut tap).unwrap();
        let datagram = tap[..len].to_vec();

        pair.server.admit(&datagram, source, later);
        let strikes_after_first = pair.server.strikes(source);
        drain(&mut pair.server);

        pair.server.admit(&datagram, source, later);

        // The replay neither strikes nor surfaces an error.
        assert_eq!(pair.server.strikes(source), strikes_after_first);
        let events = drain(&mut pair.server);
        assert!(
            !events.iter().any(|event| matches!(event, RouterEvent::Error(_))),
            "{:?}",
            events
        );
    }

    #[test]
    fn test_address_change_updates_table() {
        let mut pair = mk_pair();
        settle(&mut pair, 4);
        drain(&mut pair.server);

        let server_id = *pair.server.by_addr.get(&addr(42_001)).unwrap();

        // Client keepalive ping, but replayed from a different source port.
        let later = pair.now + Duration::from_millis(DEFAULT_PING_INTERVAL_MS + 1);
        pair.client.sync(later);

        let mut tap = [0u8; 2048];
        let (len, _) = pair.server.socket.recv(&mut tap).unwrap();
        let roaming = addr(42_777);
        pair.server.admit(&tap[..len], roaming, later);

        assert_eq!(pair.server.by_addr.get(&roaming), Some(&server_id));
        assert!(pair.server.by_addr.get(&addr(42_001)).is_none());

        let events = drain(&mut pair.server);
        assert!(events.iter().any(|event| matches!(
            event,
            RouterEvent::AddressChanged(id, source) if *id == server_id && *source == roaming
        )));
    }
}
