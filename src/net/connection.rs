//! One end of one peer relationship: handshake, cryptographic session,
//! replay protection, retries, keepalive and teardown. A connection never
//! touches the socket; it queues datagrams and events which its owning
//! router drains on every sync.

use crate::crypto::{self, Nonce};
use crate::logging::{self, Logger};
use crate::net::buffer::BufferPool;
use crate::net::retry::{Retry, RetryTick, CHALLENGE_MAX_MS, OPEN_MAX_MS, PING_MAX_MS};
use crate::net::stream::{Stream, StreamEvent, StreamFrame, StreamKind, DEFAULT_MAX_STREAMS, HEADER_MAX};
use crate::net::window::SequenceWindow;
use crate::net::wire::{self, BoxCtx, Handshake, OpenBody, PacketKind, PingBody, Prefix, RejectBody, RejectCode, RenewBody, TimestampBody};
use crate::shared::{ErrorType, NetworkError, NetworkResult};
use crate::time::timestamp_millis;
use crate::{ConnectionId, StreamId, PROTOCOL_VERSION};
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const DEFAULT_RTT_MS: u64 = 500;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 20_000;
pub const PING_INTERVAL_MIN_MS: u64 = 15_000;
pub const PING_INTERVAL_MAX_MS: u64 = 3_600_000;

pub const DEFAULT_MAX_CURRENCY: u32 = 128;
pub const DEFAULT_CURRENCY_REGEN: u32 = 16;
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1 << 20;

/// Outbound sequence level at which a connection starts the RENEW exchange.
pub const SEQUENCE_RENEW_THRESHOLD: u32 = u32::max_value() - (1 << 16);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Start,
    Open,
    Challenge,
    Ping,
    Ready,
    ReadyPing,
    Notify,
    Disconnect,
    DisconnectError,
    End,
    Error,
}

impl ConnectionState {
    /// Established states carry application traffic.
    #[inline]
    pub fn established(self) -> bool {
        match self {
            ConnectionState::Ready | ConnectionState::ReadyPing | ConnectionState::Ping => true,
            _ => false,
        }
    }

    #[inline]
    pub fn terminal(self) -> bool {
        match self {
            ConnectionState::End | ConnectionState::Error => true,
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Role {
    Initiator,
    Responder,
}

/// Negotiable per-connection limits, advertised during the handshake.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnectionLimits {
    pub max_currency: u32,
    pub currency_regen: u32,
    pub max_streams: u32,
    pub max_message_size: u32,
}

impl Default for ConnectionLimits {
    fn default() -> ConnectionLimits {
        ConnectionLimits {
            max_currency: DEFAULT_MAX_CURRENCY,
            currency_regen: DEFAULT_CURRENCY_REGEN,
            max_streams: DEFAULT_MAX_STREAMS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

pub type VerifyCallback = Rc<dyn Fn(&[u8], &[u8]) -> bool>;
pub type AddressVeto = Rc<dyn Fn(SocketAddr) -> bool>;

/// Per-connection configuration. Cheap to clone; callbacks are shared.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Whether post-handshake packets are boxed. Unsafe routers turn this off.
    pub encrypted: bool,
    /// The responder's well-known open key. None means the OPEN travels in
    /// the clear (the responder must allow unsafe opens).
    pub peer_open_key: Option<[u8; crypto::KEY_SIZE]>,
    /// The keypair OPENs addressed to us unseal with (responder side).
    pub open_pair: Option<crypto::BoxKeyPair>,
    pub sign_pair: Option<crypto::SignKeyPair>,
    /// The peer's signature verification key.
    pub peer_sign_key: Option<[u8; crypto::SIGN_KEY_SIZE]>,
    /// Custom signature validation; receives the signed region and the
    /// signature. Takes precedence over `peer_sign_key`.
    pub verify: Option<VerifyCallback>,
    /// Veto for peer address changes.
    pub address_veto: Option<AddressVeto>,
    pub routing: Vec<u8>,
    pub limits: ConnectionLimits,
    pub rtt_ms: u64,
    pub ping_interval_ms: u64,
    pub emtu: usize,
}

impl Default for ConnectionOptions {
    fn default() -> ConnectionOptions {
        ConnectionOptions {
            encrypted: true,
            peer_open_key: None,
            open_pair: None,
            sign_pair: None,
            peer_sign_key: None,
            verify: None,
            address_veto: None,
            routing: Vec::new(),
            limits: ConnectionLimits::default(),
            rtt_ms: DEFAULT_RTT_MS,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            emtu: wire::DEFAULT_EMTU,
        }
    }
}

/// What a connection reports to the application.
#[derive(Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    /// The handshake completed; the connection is established.
    Connected,
    /// A complete inbound stream message.
    Message { stream: StreamId, bytes: Vec<u8> },
    /// The peer's address changed and was accepted.
    AddressChanged(SocketAddr),
    /// The peer rejected us.
    Rejected(RejectBody),
    /// An authenticated FORWARD payload.
    Forward(Vec<u8>),
    /// A stream finished its close exchange.
    StreamClosed(StreamId),
    /// A non-fatal or fatal fault; the state reflects which.
    Error(ErrorType),
    /// The connection reached END.
    Closed,
}

pub struct Connection {
    log: Logger,
    state: ConnectionState,
    role: Role,

    self_id: ConnectionId,
    peer_id: ConnectionId,
    peer_addr: SocketAddr,

    session: crypto::BoxKeyPair,
    peer_key: Option<[u8; crypto::KEY_SIZE]>,
    self_nonce: Nonce,
    peer_nonce: Option<Nonce>,

    options: ConnectionOptions,

    peer_version: u16,
    peer_timestamp: u64,
    peer_limits: ConnectionLimits,

    rtt_ms: u64,
    sent_count: u32,
    recv_count: u32,

    sequence: u32,
    window: SequenceWindow,

    retry: Option<Retry>,
    ready_deadline: Option<Instant>,

    ping_random: Nonce,
    ping_time: u64,
    ping_sent_at: Option<Instant>,
    last_peer_ping_time: u64,
    announced: bool,

    // Saved datagrams for retransmission and signature binding.
    open_datagram: Option<Vec<u8>>,
    challenge_datagram: Option<Vec<u8>>,
    ping_datagram: Option<Vec<u8>>,
    notify_datagram: Option<Vec<u8>>,

    // Pending RENEW: the replacement nonce until the peer confirms.
    renew_nonce: Option<Nonce>,

    streams: HashMap<StreamId, Stream>,
    next_stream: StreamId,
    currency: u32,
    last_regen: Instant,

    pool: BufferPool,
    outgoing: VecDeque<Vec<u8>>,
    events: VecDeque<ConnectionEvent>,
}

impl Connection {
    /// Creates the initiator end and queues the first OPEN datagram.
    pub fn connect<'a, L: Into<Option<&'a Logger>>>(
        self_id: ConnectionId,
        peer_addr: SocketAddr,
        options: ConnectionOptions,
        log: L,
        now: Instant,
    ) -> NetworkResult<Connection> {
        let mut conn = Connection::new(self_id, peer_addr, Role::Initiator, options, log.into(), now);

        let open = wire::mk_open(
            conn.next_sequence(),
            PROTOCOL_VERSION,
            &conn.options.routing.clone(),
            &conn.self_open_body(),
            conn.options.peer_open_key.as_ref(),
            conn.options.sign_pair.as_ref().map(|pair| &pair.secret),
        )?;

        logging::debug!(conn.log, "opening connection";
                        "context" => "connect",
                        "conn_id" => conn.self_id,
                        "peer" => %peer_addr,
                        "sealed" => conn.options.peer_open_key.is_some());

        conn.push_datagram(open.clone());
        conn.open_datagram = Some(open);
        conn.set_state(ConnectionState::Open, now);
        conn.retry = Some(Retry::start(now, conn.rtt_ms, OPEN_MAX_MS));

        Ok(conn)
    }

    /// Creates the responder end, armed to answer an OPEN.
    pub fn accept<'a, L: Into<Option<&'a Logger>>>(
        self_id: ConnectionId,
        peer_addr: SocketAddr,
        options: ConnectionOptions,
        log: L,
        now: Instant,
    ) -> Connection {
        let mut conn = Connection::new(self_id, peer_addr, Role::Responder, options, log.into(), now);
        conn.set_state(ConnectionState::Challenge, now);
        conn
    }

    fn new(
        self_id: ConnectionId,
        peer_addr: SocketAddr,
        role: Role,
        mut options: ConnectionOptions,
        log: Option<&Logger>,
        now: Instant,
    ) -> Connection {
        let emtu = options.emtu;
        options.ping_interval_ms = options
            .ping_interval_ms
            .max(PING_INTERVAL_MIN_MS)
            .min(PING_INTERVAL_MAX_MS);

        Connection {
            log: logging::child_or_discard(log),
            state: ConnectionState::Start,
            role,
            self_id,
            peer_id: 0,
            peer_addr,
            session: crypto::BoxKeyPair::generate(),
            peer_key: None,
            self_nonce: crypto::random_nonce(),
            peer_nonce: None,
            peer_version: PROTOCOL_VERSION,
            peer_timestamp: 0,
            peer_limits: options.limits,
            rtt_ms: options.rtt_ms,
            options,
            sent_count: 0,
            recv_count: 0,
            sequence: 0,
            window: SequenceWindow::new(),
            retry: None,
            ready_deadline: None,
            ping_random: [0u8; crypto::NONCE_SIZE],
            ping_time: 0,
            ping_sent_at: None,
            last_peer_ping_time: 0,
            announced: false,
            open_datagram: None,
            challenge_datagram: None,
            ping_datagram: None,
            notify_datagram: None,
            renew_nonce: None,
            streams: HashMap::new(),
            next_stream: 0,
            currency: 0,
            last_regen: now,
            pool: BufferPool::new(emtu),
            outgoing: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.self_id
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub fn rtt_ms(&self) -> u64 {
        self.rtt_ms
    }

    /// The wire version the peer announced in its handshake.
    #[inline]
    pub fn peer_version(&self) -> u16 {
        self.peer_version
    }

    /// Drains one queued outbound datagram.
    #[inline]
    pub fn pop_outgoing(&mut self) -> Option<Vec<u8>> {
        self.outgoing.pop_front()
    }

    /// Drains the accumulated application events.
    #[inline]
    pub fn events(&mut self) -> impl Iterator<Item = ConnectionEvent> + '_ {
        self.events.drain(..)
    }

    /// True while any stream holds unsent or unacknowledged data.
    pub fn has_pending_streams(&self) -> bool {
        self.streams.values().any(Stream::has_pending)
    }

    /// True for the end that sent the OPEN.
    #[inline]
    pub fn initiator(&self) -> bool {
        self.role == Role::Initiator
    }

    /// True once `Connected` has been emitted.
    #[inline]
    pub fn announced(&self) -> bool {
        self.announced
    }

    // -- state machine plumbing ---------------------------------------------

    /// Transition hub. Exit hooks cancel timers so a stale retry can never
    /// fire against the new state; enter hooks arm the new state's timers.
    fn set_state(&mut self, next: ConnectionState, now: Instant) {
        let prev = self.state;

        if prev == next {
            return;
        }

        // Exit hooks.
        self.retry = None;
        match prev {
            ConnectionState::Ready | ConnectionState::ReadyPing => self.ready_deadline = None,
            _ => (),
        }

        self.state = next;

        // Enter hooks.
        match next {
            ConnectionState::Ready => {
                self.ready_deadline =
                    Some(now + Duration::from_millis(self.options.ping_interval_ms * 3 / 2));
            }
            ConnectionState::ReadyPing => {
                self.ready_deadline =
                    Some(now + Duration::from_millis(self.options.ping_interval_ms));
            }
            ConnectionState::End => self.events.push_back(ConnectionEvent::Closed),
            _ => (),
        }

        logging::debug!(self.log, "state transition";
                        "context" => "set_state",
                        "conn_id" => self.self_id,
                        "from" => ?prev,
                        "to" => ?next);
    }

    fn fail(&mut self, error: ErrorType, now: Instant) {
        logging::warn!(self.log, "connection failed";
                       "context" => "fail",
                       "conn_id" => self.self_id,
                       "error" => ?error);

        self.events.push_back(ConnectionEvent::Error(error));
        self.set_state(ConnectionState::Error, now);
    }

    #[inline]
    fn next_sequence(&mut self) -> u32 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }

    fn push_datagram(&mut self, datagram: Vec<u8>) {
        self.sent_count = self.sent_count.wrapping_add(1);
        self.outgoing.push_back(datagram);
    }

    fn self_open_body(&self) -> OpenBody {
        OpenBody {
            hash: [0u8; crypto::HASH_SIZE],
            reply_id: self.self_id,
            timestamp: timestamp_millis(),
            nonce: self.self_nonce,
            public_key: self.session.public,
            max_currency: self.options.limits.max_currency,
            currency_regen: self.options.limits.currency_regen,
            max_streams: self.options.limits.max_streams,
            max_message_size: self.options.limits.max_message_size,
        }
    }

    /// Outbound box context: our nonce, the peer's public key, our secret.
    fn out_ctx(&self) -> Option<BoxCtx> {
        if !self.options.encrypted {
            return None;
        }

        Some(BoxCtx {
            nonce: &self.self_nonce,
            public_key: self.peer_key.as_ref().expect("peer key before encrypted send"),
            secret_key: &self.session.secret,
        })
    }

    /// Inbound box context: the peer's nonce and public key, our secret.
    fn in_ctx(&self) -> NetworkResult<Option<BoxCtx>> {
        if !self.options.encrypted {
            return Ok(None);
        }

        match (&self.peer_nonce, &self.peer_key) {
            (Some(nonce), Some(key)) => Ok(Some(BoxCtx {
                nonce,
                public_key: key,
                secret_key: &self.session.secret,
            })),
            _ => Err(NetworkError::Fatal(ErrorType::StateViolation)),
        }
    }

    // -- inbound ------------------------------------------------------------

    /// Consumes one inbound datagram. `Fatal(Replay)` means silent drop; any
    /// other fatal error is the router's cue to strike the source.
    pub fn handle_datagram(
        &mut self,
        datagram: &[u8],
        prefix: Prefix,
        source: SocketAddr,
        now: Instant,
    ) -> NetworkResult<()> {
        if self.state.terminal() {
            return Ok(());
        }

        let kind = prefix
            .kind()
            .ok_or(NetworkError::Fatal(ErrorType::MalformedPacket))?;

        // A known id speaking from a new address proves nothing until a PING
        // authenticates; everything else from a foreign source is dropped.
        if source != self.peer_addr && kind != PacketKind::Ping && kind != PacketKind::Open {
            logging::debug!(self.log, "dropping datagram from foreign source";
                            "context" => "handle_datagram",
                            "conn_id" => self.self_id,
                            "source" => %source);
            return Ok(());
        }

        let result = match kind {
            PacketKind::Open => self.handle_open(datagram, &prefix, now),
            PacketKind::Challenge => self.handle_challenge(datagram, &prefix, now),
            PacketKind::Response => Err(NetworkError::Fatal(ErrorType::StateViolation)),
            PacketKind::Reject => self.handle_reject(datagram, &prefix, now),
            _ => self.handle_boxed(kind, datagram, &prefix, source, now),
        };

        if result.is_ok() {
            self.recv_count = self.recv_count.wrapping_add(1);
        }

        result
    }

    /// Replay window plus authenticated decrypt, committing only on success.
    fn firewall(&mut self, datagram: &[u8], prefix: &Prefix) -> NetworkResult<Vec<u8>> {
        self.window.check(prefix.sequence)?;

        let plain = {
            let ctx = self.in_ctx()?;
            wire::un_boxed(datagram, prefix, ctx.as_ref())?
        };

        self.window.commit(prefix.sequence);
        Ok(plain)
    }

    fn handle_open(&mut self, datagram: &[u8], prefix: &Prefix, now: Instant) -> NetworkResult<()> {
        if self.role != Role::Responder {
            return Err(NetworkError::Fatal(ErrorType::StateViolation));
        }

        // A duplicate of the OPEN we already answered just loses its reply;
        // resend the challenge. A different second OPEN is a violation.
        if let Some(saved) = &self.open_datagram {
            if saved.as_slice() == datagram {
                if let Some(challenge) = self.challenge_datagram.clone() {
                    logging::debug!(self.log, "resending challenge for duplicate open";
                                    "context" => "handle_open",
                                    "conn_id" => self.self_id);
                    self.push_datagram(challenge);
                }
                return Ok(());
            }

            self.reject(RejectCode::Violation, "OPEN does not match the original", now);
            self.fail(ErrorType::ProtocolViolation, now);
            return Err(NetworkError::Fatal(ErrorType::ProtocolViolation));
        }

        if self.state != ConnectionState::Challenge {
            return Err(NetworkError::Fatal(ErrorType::StateViolation));
        }

        let parsed = Handshake::parse_open(datagram)?;
        self.peer_version = parsed.version;

        if parsed.version != PROTOCOL_VERSION {
            self.reject(RejectCode::Version, "unsupported version", now);
            self.fail(ErrorType::VersionMismatch, now);
            return Err(NetworkError::Fatal(ErrorType::VersionMismatch));
        }

        if !self.verify_handshake(&parsed, None) {
            return Err(NetworkError::Fatal(ErrorType::AuthFailure));
        }

        self.window.check(prefix.sequence)?;
        let body = parsed.body(self.options.open_pair.as_ref())?;
        self.window.commit(prefix.sequence);

        self.peer_id = body.reply_id;
        self.peer_key = Some(body.public_key);
        self.peer_nonce = Some(body.nonce);
        self.peer_timestamp = body.timestamp;
        self.peer_limits = ConnectionLimits {
            max_currency: body.max_currency,
            currency_regen: body.currency_regen,
            max_streams: body.max_streams,
            max_message_size: body.max_message_size,
        };
        self.currency = body.max_currency;

        let challenge = wire::mk_challenge(
            self.peer_id,
            self.next_sequence(),
            &self.self_open_body(),
            if self.options.encrypted {
                Some(&body.public_key)
            } else {
                None
            },
            self.options.sign_pair.as_ref().map(|pair| &pair.secret),
            datagram,
        )?;

        logging::debug!(self.log, "answering open";
                        "context" => "handle_open",
                        "conn_id" => self.self_id,
                        "peer_id" => self.peer_id,
                        "routing_len" => parsed.routing.len());

        self.open_datagram = Some(datagram.to_vec());
        self.push_datagram(challenge.clone());
        self.challenge_datagram = Some(challenge);
        self.retry = Some(Retry::start(now, self.rtt_ms, CHALLENGE_MAX_MS));

        Ok(())
    }

    fn handle_challenge(&mut self, datagram: &[u8], prefix: &Prefix, now: Instant) -> NetworkResult<()> {
        if self.role != Role::Initiator {
            return Err(NetworkError::Fatal(ErrorType::StateViolation));
        }

        if self.state != ConnectionState::Open {
            // Delayed duplicate after the handshake advanced.
            return Ok(());
        }

        let parsed = Handshake::parse_challenge(datagram)?;
        let open = self.open_datagram.clone().expect("initiator keeps its open");

        if !self.verify_handshake(&parsed, Some(&open)) {
            logging::warn!(self.log, "Unable to verify CHALLENGE signature";
                           "context" => "handle_challenge",
                           "conn_id" => self.self_id);
            self.fail(ErrorType::AuthFailure, now);
            return Err(NetworkError::Fatal(ErrorType::AuthFailure));
        }

        self.window.check(prefix.sequence)?;
        let body = parsed.body(Some(&self.session))?;
        self.window.commit(prefix.sequence);

        self.peer_id = body.reply_id;
        self.peer_key = Some(body.public_key);
        self.peer_nonce = Some(body.nonce);
        self.peer_timestamp = body.timestamp;
        self.peer_limits = ConnectionLimits {
            max_currency: body.max_currency,
            currency_regen: body.currency_regen,
            max_streams: body.max_streams,
            max_message_size: body.max_message_size,
        };
        self.currency = body.max_currency;

        self.set_state(ConnectionState::Ping, now);
        self.send_ping(now)?;
        self.retry = Some(Retry::start(now, self.rtt_ms, PING_MAX_MS));

        Ok(())
    }

    /// Validates a handshake signature through the callback, the configured
    /// key, or the zero block when signing is disabled.
    fn verify_handshake(&self, parsed: &Handshake, bound: Option<&[u8]>) -> bool {
        if let Some(verify) = &self.options.verify {
            let region: Vec<u8> = match bound {
                Some(prior) => {
                    let mut region = prior.to_vec();
                    region.extend_from_slice(parsed.signed_region());
                    region
                }
                None => parsed.signed_region().to_vec(),
            };
            return verify(&region, parsed.signature());
        }

        match &self.options.peer_sign_key {
            Some(key) => parsed.verify(key, bound),
            // No verification configured: the signature region is ignored.
            None => true,
        }
    }

    fn handle_reject(&mut self, datagram: &[u8], prefix: &Prefix, now: Instant) -> NetworkResult<()> {
        self.window.check(prefix.sequence)?;

        let body = wire::un_reject(datagram, prefix, Some(&self.session))?;
        self.window.commit(prefix.sequence);

        logging::warn!(self.log, "peer rejected connection";
                       "context" => "handle_reject",
                       "conn_id" => self.self_id,
                       "code" => ?body.code,
                       "message" => %body.message);

        self.events.push_back(ConnectionEvent::Rejected(body));
        self.set_state(ConnectionState::Error, now);
        Ok(())
    }

    fn handle_boxed(
        &mut self,
        kind: PacketKind,
        datagram: &[u8],
        prefix: &Prefix,
        source: SocketAddr,
        now: Instant,
    ) -> NetworkResult<()> {
        let plain = self.firewall(datagram, prefix)?;

        // Only an authenticated PING may migrate the peer address.
        if source != self.peer_addr {
            if kind != PacketKind::Ping {
                return Ok(());
            }

            if let Some(veto) = &self.options.address_veto {
                if !veto(source) {
                    logging::warn!(self.log, "address change vetoed";
                                   "context" => "handle_boxed",
                                   "conn_id" => self.self_id,
                                   "source" => %source);
                    return Ok(());
                }
            }

            logging::debug!(self.log, "peer address changed";
                            "context" => "handle_boxed",
                            "conn_id" => self.self_id,
                            "from" => %self.peer_addr,
                            "to" => %source);

            self.peer_addr = source;
            self.events.push_back(ConnectionEvent::AddressChanged(source));
        }

        match kind {
            PacketKind::Ping => self.handle_ping(&plain, now),
            PacketKind::Stream => self.handle_stream(&plain, now),
            PacketKind::Forward => self.handle_forward(&plain),
            PacketKind::Renew => self.handle_renew(&plain, now),
            PacketKind::RenewConfirm => self.handle_renew_confirm(&plain),
            PacketKind::Notify => {
                TimestampBody::read(&plain[..])?;
                self.send_control(PacketKind::NotifyConfirm, now)?;
                self.close_streams();
                self.set_state(ConnectionState::End, now);
                Ok(())
            }
            PacketKind::NotifyConfirm => {
                TimestampBody::read(&plain[..])?;
                if self.state == ConnectionState::Notify {
                    self.set_state(ConnectionState::Disconnect, now);
                    self.set_state(ConnectionState::End, now);
                }
                Ok(())
            }
            PacketKind::Kill => {
                TimestampBody::read(&plain[..])?;
                self.send_control(PacketKind::KillConfirm, now)?;
                self.set_state(ConnectionState::End, now);
                Ok(())
            }
            PacketKind::KillConfirm => Ok(()),
            _ => Err(NetworkError::Fatal(ErrorType::StateViolation)),
        }
    }

    fn handle_ping(&mut self, plain: &[u8], now: Instant) -> NetworkResult<()> {
        let body = PingBody::read(plain)?;

        let echo_of_ours = body.random == self.ping_random && body.timestamp == self.ping_time;

        if !echo_of_ours {
            // Peer-initiated pings must carry a strictly increasing timestamp.
            if body.timestamp <= self.last_peer_ping_time {
                return Err(NetworkError::Fatal(ErrorType::AuthFailure));
            }
            self.last_peer_ping_time = body.timestamp;
        }

        match self.state {
            // Responder: the first valid ping completes the handshake. Its
            // timestamp cannot predate the OPEN that started it.
            ConnectionState::Challenge => {
                if body.timestamp < self.peer_timestamp {
                    return Err(NetworkError::Fatal(ErrorType::AuthFailure));
                }

                self.echo_ping(&body, now)?;
                self.set_state(ConnectionState::Ready, now);
                self.announce();
                Ok(())
            }
            // Initiator: our echo came back.
            ConnectionState::Ping if echo_of_ours => {
                if let Some(sent_at) = self.ping_sent_at.take() {
                    let sample = now.duration_since(sent_at).as_millis() as u64;
                    self.rtt_ms = ((self.rtt_ms * 7) + sample.max(1)) / 8;
                }

                self.set_state(ConnectionState::ReadyPing, now);
                self.announce();
                Ok(())
            }
            ConnectionState::Ready | ConnectionState::ReadyPing if !echo_of_ours => {
                self.echo_ping(&body, now)?;

                // Answering resets the silence timer.
                let grace = Duration::from_millis(self.options.ping_interval_ms * 3 / 2);
                self.ready_deadline = Some(now + grace);
                Ok(())
            }
            ConnectionState::Ping if !echo_of_ours => {
                // Crossed pings: answer and keep waiting for our echo.
                self.echo_ping(&body, now)
            }
            _ => Ok(()),
        }
    }

    /// Emits `Connected` exactly once per connection.
    fn announce(&mut self) {
        if !self.announced {
            self.announced = true;
            self.events.push_back(ConnectionEvent::Connected);
        }
    }

    fn echo_ping(&mut self, body: &PingBody, _now: Instant) -> NetworkResult<()> {
        let reply = PingBody {
            random: body.random,
            timestamp: body.timestamp,
            rtt_ms: self.rtt_ms as u32,
            sent: self.sent_count,
            received: self.recv_count,
        };

        let mut plain = [0u8; PingBody::SIZE];
        reply.write(&mut plain[..])?;

        let sequence = self.next_sequence();
        let datagram = {
            let ctx = self.out_ctx();
            wire::mk_boxed(PacketKind::Ping, self.peer_id, sequence, &plain, ctx.as_ref())?
        };

        self.push_datagram(datagram);
        Ok(())
    }

    fn send_ping(&mut self, now: Instant) -> NetworkResult<()> {
        crypto::random_bytes(&mut self.ping_random);
        let timestamp = timestamp_millis().max(self.ping_time + 1);
        self.ping_time = timestamp;
        self.ping_sent_at = Some(now);

        let body = PingBody {
            random: self.ping_random,
            timestamp,
            rtt_ms: self.rtt_ms as u32,
            sent: self.sent_count,
            received: self.recv_count,
        };

        let mut plain = [0u8; PingBody::SIZE];
        body.write(&mut plain[..])?;

        let sequence = self.next_sequence();
        let datagram = {
            let ctx = self.out_ctx();
            wire::mk_boxed(PacketKind::Ping, self.peer_id, sequence, &plain, ctx.as_ref())?
        };

        self.push_datagram(datagram.clone());
        self.ping_datagram = Some(datagram);
        Ok(())
    }

    fn handle_stream(&mut self, plain: &[u8], now: Instant) -> NetworkResult<()> {
        if !self.state.established() {
            return Err(NetworkError::Fatal(ErrorType::StateViolation));
        }

        let frame = StreamFrame::read(plain)?;
        let id = frame.stream();

        if !self.streams.contains_key(&id) {
            if self.streams.len() as u32 >= self.options.limits.max_streams {
                return Err(NetworkError::Fatal(ErrorType::StreamLimit));
            }

            // Peer-initiated stream: reliability is evident from the frame,
            // ordering defaults on until the peer reconfigures.
            let reliable = match &frame {
                StreamFrame::Data { validate, .. } => *validate,
                _ => true,
            };
            let kind = StreamKind::from_flags(reliable, true);
            self.streams.insert(id, Stream::new(id, kind, self.umtu()));
        }

        let events = self
            .streams
            .get_mut(&id)
            .expect("stream just ensured")
            .handle_frame(frame)?;

        for event in events {
            match event {
                StreamEvent::Message(bytes) => {
                    self.events.push_back(ConnectionEvent::Message { stream: id, bytes })
                }
                StreamEvent::Acked(packets) => {
                    let cap = self.peer_limits.max_currency;
                    self.currency = (self.currency + packets).min(cap);
                }
                StreamEvent::Closed => {
                    self.events.push_back(ConnectionEvent::StreamClosed(id));
                }
            }
        }

        self.pump_streams(now)?;
        Ok(())
    }

    fn handle_forward(&mut self, plain: &[u8]) -> NetworkResult<()> {
        let (routing_len, varint_len) = wire::read_varint(plain, wire::VARINT_MAX_OCTETS)
            .ok_or(NetworkError::Fatal(ErrorType::MalformedPacket))?;

        let payload_at = varint_len
            .checked_add(routing_len as usize)
            .filter(|&at| at <= plain.len())
            .ok_or(NetworkError::Fatal(ErrorType::MalformedPacket))?;

        self.events
            .push_back(ConnectionEvent::Forward(plain[payload_at..].to_vec()));
        Ok(())
    }

    fn handle_renew(&mut self, plain: &[u8], now: Instant) -> NetworkResult<()> {
        let body = RenewBody::read(plain)?;

        // Confirm under the current session parameters, then swap.
        let confirm = RenewBody {
            timestamp: timestamp_millis(),
            nonce: body.nonce,
        };

        let mut out = [0u8; RenewBody::SIZE];
        confirm.write(&mut out[..])?;

        let sequence = self.next_sequence();
        let datagram = {
            let ctx = self.out_ctx();
            wire::mk_boxed(PacketKind::RenewConfirm, self.peer_id, sequence, &out, ctx.as_ref())?
        };
        self.push_datagram(datagram);

        logging::debug!(self.log, "peer renewed session";
                        "context" => "handle_renew",
                        "conn_id" => self.self_id,
                        "max_seen" => self.window.max_seen());

        self.peer_nonce = Some(body.nonce);
        self.window.renew();
        let _ = now;
        Ok(())
    }

    fn handle_renew_confirm(&mut self, plain: &[u8]) -> NetworkResult<()> {
        let body = RenewBody::read(plain)?;

        if let Some(nonce) = self.renew_nonce.take() {
            if nonce == body.nonce {
                // The peer switched over; our next packet restarts at zero.
                self.self_nonce = nonce;
                self.sequence = 0;

                logging::debug!(self.log, "session renewed";
                                "context" => "handle_renew_confirm",
                                "conn_id" => self.self_id);
            } else {
                self.renew_nonce = Some(nonce);
            }
        }

        Ok(())
    }

    fn reject(&mut self, code: RejectCode, message: &str, _now: Instant) {
        let body = RejectBody {
            timestamp: timestamp_millis(),
            code,
            message: message.to_owned(),
        };

        let sequence = self.next_sequence();
        let result = wire::mk_reject(self.peer_id, sequence, &body, self.peer_key.as_ref());

        if let Ok(datagram) = result {
            self.push_datagram(datagram);
        }
    }

    fn send_control(&mut self, kind: PacketKind, _now: Instant) -> NetworkResult<()> {
        let body = TimestampBody { timestamp: timestamp_millis() };

        let mut plain = [0u8; TimestampBody::SIZE];
        body.write(&mut plain[..])?;

        let sequence = self.next_sequence();
        let datagram = {
            let ctx = self.out_ctx();
            wire::mk_boxed(kind, self.peer_id, sequence, &plain, ctx.as_ref())?
        };

        self.push_datagram(datagram);
        Ok(())
    }

    // -- streams ------------------------------------------------------------

    /// Application payload that fits one STREAM datagram.
    #[inline]
    pub fn umtu(&self) -> usize {
        let crypt = if self.options.encrypted { crypto::MAC_SIZE } else { 0 };
        self.options.emtu - wire::PREFIX_SIZE - crypt - HEADER_MAX
    }

    /// Opens a stream. Initiators allocate even ids, responders odd, so the
    /// two ends never collide; explicit ids must respect that parity.
    pub fn mk_stream(
        &mut self,
        id: Option<StreamId>,
        reliable: bool,
        ordered: bool,
    ) -> NetworkResult<StreamId> {
        if !self.state.established() {
            return Err(NetworkError::Fatal(ErrorType::StateViolation));
        }

        if self.streams.len() as u32 >= self.peer_limits.max_streams {
            return Err(NetworkError::Fatal(ErrorType::StreamLimit));
        }

        let parity = match self.role {
            Role::Initiator => 0,
            Role::Responder => 1,
        };

        let id = match id {
            Some(id) => {
                if id % 2 != parity || self.streams.contains_key(&id) {
                    return Err(NetworkError::Fatal(ErrorType::StateViolation));
                }
                id
            }
            None => {
                let mut candidate = self.next_stream * 2 + parity;
                while self.streams.contains_key(&candidate) {
                    self.next_stream += 1;
                    candidate = self.next_stream * 2 + parity;
                }
                self.next_stream += 1;
                candidate
            }
        };

        let kind = StreamKind::from_flags(reliable, ordered);
        self.streams.insert(id, Stream::new(id, kind, self.umtu()));

        Ok(id)
    }

    /// Queues a message on a stream and pumps the wire.
    pub fn stream_send(&mut self, id: StreamId, bytes: &[u8], now: Instant) -> NetworkResult<()> {
        if bytes.len() as u64 > u64::from(self.peer_limits.max_message_size) {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(NetworkError::Fatal(ErrorType::StateViolation))?;

        stream.send(bytes, now)?;
        self.pump_streams(now)
    }

    /// Starts a close exchange on a stream.
    pub fn stream_close(&mut self, id: StreamId, now: Instant) -> NetworkResult<()> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(NetworkError::Fatal(ErrorType::StateViolation))?;

        stream.close();
        self.pump_streams(now)
    }

    /// Requests the peer to pause or resume a stream.
    pub fn stream_backpressure(&mut self, id: StreamId, on: bool, now: Instant) -> NetworkResult<()> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(NetworkError::Fatal(ErrorType::StateViolation))?;

        stream.set_backpressure(on);
        self.pump_streams(now)
    }

    /// Moves stream frames onto the wire while currency lasts. Control frames
    /// ride free; data frames spend one unit each.
    fn pump_streams(&mut self, now: Instant) -> NetworkResult<()> {
        if !self.state.established() {
            return Ok(());
        }

        let resend_after = Duration::from_millis(self.rtt_ms * 2);
        let mut frames = Vec::new();

        for stream in self.streams.values_mut() {
            loop {
                let allow_data = self.currency > 0;

                match stream.poll_frame(now, resend_after, allow_data) {
                    Some(frame) => {
                        if frame.is_data() {
                            self.currency -= 1;
                        }
                        frames.push(frame);
                    }
                    None => break,
                }
            }
        }

        for frame in frames {
            let mut plain = self.pool.take();
            plain.clear();
            frame.write(&mut plain)?;

            let sequence = self.next_sequence();
            let datagram = {
                let ctx = self.out_ctx();
                wire::mk_boxed(PacketKind::Stream, self.peer_id, sequence, &plain, ctx.as_ref())?
            };

            self.pool.put(plain);
            self.push_datagram(datagram);
        }

        Ok(())
    }

    fn close_streams(&mut self) {
        for stream in self.streams.values_mut() {
            stream.close();
        }
    }

    // -- teardown -----------------------------------------------------------

    /// Graceful close: streams first, then the NOTIFY exchange.
    pub fn close(&mut self, now: Instant) -> NetworkResult<()> {
        if self.state.terminal() || self.state == ConnectionState::Notify {
            return Ok(());
        }

        if !self.state.established() {
            self.kill(now);
            return Ok(());
        }

        self.close_streams();
        let _ = self.pump_streams(now);

        self.send_control(PacketKind::Notify, now)?;
        self.notify_datagram = self.outgoing.back().cloned();
        self.set_state(ConnectionState::Notify, now);
        self.retry = Some(Retry::start(now, self.rtt_ms, PING_MAX_MS));

        Ok(())
    }

    /// Hard close. Data still buffered on streams is reported as an error.
    pub fn kill(&mut self, now: Instant) {
        if self.state.terminal() {
            return;
        }

        if self.has_pending_streams() {
            self.events.push_back(ConnectionEvent::Error(ErrorType::StateViolation));
        }

        if self.state.established() {
            let _ = self.send_control(PacketKind::Kill, now);
        }

        self.set_state(ConnectionState::End, now);
    }

    // -- timers -------------------------------------------------------------

    /// Drives retries, keepalive and currency regeneration. Called from the
    /// router's sync loop.
    pub fn tick(&mut self, now: Instant) {
        if self.state.terminal() {
            return;
        }

        self.regen_currency(now);

        if let Some(mut retry) = self.retry.take() {
            match retry.due(now) {
                RetryTick::Idle => self.retry = Some(retry),
                RetryTick::Fire => {
                    self.retry = Some(retry);
                    self.refire(now);
                }
                RetryTick::TimedOut => self.on_retry_timeout(now),
            }
        }

        if let Some(deadline) = self.ready_deadline {
            if now >= deadline {
                match self.state {
                    // Our turn to ping.
                    ConnectionState::ReadyPing => {
                        self.set_state(ConnectionState::Ping, now);
                        if self.send_ping(now).is_err() {
                            self.fail(ErrorType::Crypto, now);
                            return;
                        }
                        self.retry = Some(Retry::start(now, self.rtt_ms, PING_MAX_MS));
                    }
                    // The peer went silent.
                    ConnectionState::Ready => self.fail(ErrorType::Timeout, now),
                    _ => self.ready_deadline = None,
                }
            }
        }

        if self.sequence >= SEQUENCE_RENEW_THRESHOLD
            && self.renew_nonce.is_none()
            && self.state.established()
        {
            let _ = self.start_renew(now);
        }

        if self.state.established() {
            let _ = self.pump_streams(now);
        }
    }

    fn refire(&mut self, now: Instant) {
        let datagram = match self.state {
            ConnectionState::Open => self.open_datagram.clone(),
            ConnectionState::Challenge => self.challenge_datagram.clone(),
            ConnectionState::Ping => self.ping_datagram.clone(),
            ConnectionState::Notify => self.notify_datagram.clone(),
            _ => None,
        };

        match datagram {
            Some(datagram) => {
                logging::trace!(self.log, "retransmitting";
                                "context" => "refire",
                                "conn_id" => self.self_id,
                                "state" => ?self.state,
                                "len" => datagram.len());
                self.push_datagram(datagram);
            }
            None => {
                let _ = now;
                self.retry = None;
            }
        }
    }

    fn on_retry_timeout(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Open | ConnectionState::Challenge | ConnectionState::Ping => {
                self.fail(ErrorType::Timeout, now)
            }
            ConnectionState::Notify => {
                // The peer never confirmed; drop the hard way.
                self.set_state(ConnectionState::DisconnectError, now);
                self.set_state(ConnectionState::End, now);
            }
            _ => (),
        }
    }

    fn regen_currency(&mut self, now: Instant) {
        let rtt = Duration::from_millis(self.rtt_ms.max(1));

        while now.duration_since(self.last_regen) >= rtt {
            self.last_regen += rtt;
            self.currency =
                (self.currency + self.peer_limits.currency_regen).min(self.peer_limits.max_currency);
        }
    }

    fn start_renew(&mut self, now: Instant) -> NetworkResult<()> {
        let nonce = crypto::random_nonce();

        let body = RenewBody { timestamp: timestamp_millis(), nonce };
        let mut plain = [0u8; RenewBody::SIZE];
        body.write(&mut plain[..])?;

        let sequence = self.next_sequence();
        let datagram = {
            let ctx = self.out_ctx();
            wire::mk_boxed(PacketKind::Renew, self.peer_id, sequence, &plain, ctx.as_ref())?
        };

        logging::debug!(self.log, "starting session renew";
                        "context" => "start_renew",
                        "conn_id" => self.self_id,
                        "sequence" => sequence);

        self.renew_nonce = Some(nonce);
        self.push_datagram(datagram);
        let _ = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn pipe(from: &mut Connection, to: &mut Connection, now: Instant) -> usize {
        let mut moved = 0;
        while let Some(datagram) = from.pop_outgoing() {
            let prefix = Prefix::read(&datagram).unwrap();
            let _ = to.handle_datagram(&datagram, prefix, from_addr(from), now);
            moved += 1;
        }
        moved
    }

    fn from_addr(conn: &Connection) -> SocketAddr {
        // The test peers sit on fixed ports; the connection's own address is
        // whatever its peer dialled, so derive it from the id instead.
        addr(40_000 + (conn.id() % 1000) as u16)
    }

    fn server_options(open_pair: &crypto::BoxKeyPair) -> ConnectionOptions {
        ConnectionOptions {
            open_pair: Some(open_pair.clone()),
            ..ConnectionOptions::default()
        }
    }

    fn client_options(open_key: [u8; crypto::KEY_SIZE]) -> ConnectionOptions {
        ConnectionOptions {
            peer_open_key: Some(open_key),
            ..ConnectionOptions::default()
        }
    }

    /// Runs the full handshake and returns the established pair.
    fn establish() -> (Connection, Connection, Instant) {
        let now = Instant::now();
        let open_pair = crypto::BoxKeyPair::generate();

        let mut client =
            Connection::connect(1, addr(40_002), client_options(open_pair.public), None, now)
                .unwrap();
        let mut server = Connection::accept(2, addr(40_001), server_options(&open_pair), None, now);

        // OPEN -> CHALLENGE -> PING -> echo PING
        assert_eq!(pipe(&mut client, &mut server, now), 1);
        assert_eq!(pipe(&mut server, &mut client, now), 1);
        assert_eq!(pipe(&mut client, &mut server, now), 1);
        assert_eq!(pipe(&mut server, &mut client, now), 1);

        assert_eq!(server.state(), ConnectionState::Ready);
        assert_eq!(client.state(), ConnectionState::ReadyPing);

        let client_events: Vec<_> = client.events().collect();
        let server_events: Vec<_> = server.events().collect();
        assert!(client_events.contains(&ConnectionEvent::Connected));
        assert!(server_events.contains(&ConnectionEvent::Connected));

        (client, server, now)
    }

    #[test]
    fn test_handshake_establishes_both_ends() {
        let (client, server, _) = establish();

        assert_eq!(client.peer_id, 2);
        assert_eq!(server.peer_id, 1);
        assert!(client.peer_key.is_some());
        assert!(server.peer_nonce.is_some());
    }

    #[test]
    fn test_handshake_within_three_round_trips() {
        // Datagram count is the proxy for round trips in a lossless channel:
        // OPEN, CHALLENGE, PING, PING echo is two round trips.
        let now = Instant::now();
        let open_pair = crypto::BoxKeyPair::generate();

        let mut client =
            Connection::connect(1, addr(40_002), client_options(open_pair.public), None, now)
                .unwrap();
        let mut server = Connection::accept(2, addr(40_001), server_options(&open_pair), None, now);

        let mut exchanged = 0;
        for _ in 0..3 {
            exchanged += pipe(&mut client, &mut server, now);
            exchanged += pipe(&mut server, &mut client, now);
        }

        assert_eq!(exchanged, 4);
        assert!(client.state().established());
        assert!(server.state().established());
    }

    #[test]
    fn test_signed_handshake() {
        let now = Instant::now();
        let open_pair = crypto::BoxKeyPair::generate();
        let client_sign = crypto::SignKeyPair::generate();
        let server_sign = crypto::SignKeyPair::generate();

        let client_options = ConnectionOptions {
            peer_open_key: Some(open_pair.public),
            sign_pair: Some(client_sign.clone()),
            peer_sign_key: Some(server_sign.public),
            ..ConnectionOptions::default()
        };
        let server_options = ConnectionOptions {
            open_pair: Some(open_pair.clone()),
            sign_pair: Some(server_sign.clone()),
            peer_sign_key: Some(client_sign.public),
            ..ConnectionOptions::default()
        };

        let mut client = Connection::connect(1, addr(40_002), client_options, None, now).unwrap();
        let mut server = Connection::accept(2, addr(40_001), server_options, None, now);

        pipe(&mut client, &mut server, now);
        assert_eq!(server.state(), ConnectionState::Challenge);
        assert!(server.peer_key.is_some(), "signed open accepted");

        pipe(&mut server, &mut client, now);
        assert_eq!(client.state(), ConnectionState::Ping);
    }

    #[test]
    fn test_challenge_signature_mismatch_errors() {
        let now = Instant::now();
        let open_pair = crypto::BoxKeyPair::generate();
        let server_sign = crypto::SignKeyPair::generate();
        let wrong_key = crypto::SignKeyPair::generate();

        let client_options = ConnectionOptions {
            peer_open_key: Some(open_pair.public),
            peer_sign_key: Some(wrong_key.public),
            ..ConnectionOptions::default()
        };
        let server_options = ConnectionOptions {
            open_pair: Some(open_pair.clone()),
            sign_pair: Some(server_sign),
            ..ConnectionOptions::default()
        };

        let mut client = Connection::connect(1, addr(40_002), client_options, None, now).unwrap();
        let mut server = Connection::accept(2, addr(40_001), server_options, None, now);

        pipe(&mut client, &mut server, now);
        pipe(&mut server, &mut client, now);

        assert_eq!(client.state(), ConnectionState::Error);
        let events: Vec<_> = client.events().collect();
        assert!(events.contains(&ConnectionEvent::Error(ErrorType::AuthFailure)));
    }

    #[test]
    fn test_duplicate_open_resends_challenge() {
        let now = Instant::now();
        let open_pair = crypto::BoxKeyPair::generate();

        let mut client =
            Connection::connect(1, addr(40_002), client_options(open_pair.public), None, now)
                .unwrap();
        let mut server = Connection::accept(2, addr(40_001), server_options(&open_pair), None, now);

        let open = client.pop_outgoing().unwrap();
        let prefix = Prefix::read(&open).unwrap();

        server.handle_datagram(&open, prefix, addr(40_001), now).unwrap();
        let first = server.pop_outgoing().unwrap();

        // The same OPEN again: the challenge is retransmitted verbatim.
        server.handle_datagram(&open, prefix, addr(40_001), now).unwrap();
        let second = server.pop_outgoing().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_mismatched_second_open_rejects() {
        let now = Instant::now();
        let open_pair = crypto::BoxKeyPair::generate();

        let mut client =
            Connection::connect(1, addr(40_002), client_options(open_pair.public), None, now)
                .unwrap();
        let mut other =
            Connection::connect(3, addr(40_002), client_options(open_pair.public), None, now)
                .unwrap();
        let mut server = Connection::accept(2, addr(40_001), server_options(&open_pair), None, now);

        let open = client.pop_outgoing().unwrap();
        let prefix = Prefix::read(&open).unwrap();
        server.handle_datagram(&open, prefix, addr(40_001), now).unwrap();
        server.pop_outgoing().unwrap();

        let second = other.pop_outgoing().unwrap();
        let prefix = Prefix::read(&second).unwrap();
        let result = server.handle_datagram(&second, prefix, addr(40_001), now);

        assert_eq!(result, Err(NetworkError::Fatal(ErrorType::ProtocolViolation)));
        assert_eq!(server.state(), ConnectionState::Error);

        // A REJECT went out before the teardown.
        let reject = server.pop_outgoing().unwrap();
        let reject_prefix = Prefix::read(&reject).unwrap();
        assert_eq!(reject_prefix.kind(), Some(PacketKind::Reject));
    }

    #[test]
    fn test_replayed_ping_dropped_silently() {
        let (mut client, mut server, now) = establish();

        // Capture a fresh ping from the client.
        client.send_ping(now).unwrap();
        let ping = client.pop_outgoing().unwrap();
        let prefix = Prefix::read(&ping).unwrap();

        server.handle_datagram(&ping, prefix, client_addr(), now).unwrap();

        // Replay: rejected with the replay marker, which routers drop quietly.
        let result = server.handle_datagram(&ping, prefix, client_addr(), now);
        assert_eq!(result, Err(NetworkError::Fatal(ErrorType::Replay)));

        let events: Vec<_> = server.events().collect();
        assert!(events.is_empty(), "replay must not surface events");
    }

    fn client_addr() -> SocketAddr {
        addr(40_001)
    }

    #[test]
    fn test_sequence_monotonic() {
        let (mut client, _, now) = establish();

        let before = client.sequence;
        client.send_ping(now).unwrap();
        client.send_ping(now).unwrap();
        assert_eq!(client.sequence, before + 2);
    }

    #[test]
    fn test_stream_message_roundtrip() {
        let (mut client, mut server, now) = establish();

        let id = client.mk_stream(None, true, true).unwrap();
        client.stream_send(id, b"Hello, world!", now).unwrap();

        pipe(&mut client, &mut server, now);

        let events: Vec<_> = server.events().collect();
        assert!(events.contains(&ConnectionEvent::Message {
            stream: id,
            bytes: b"Hello, world!".to_vec()
        }));

        // The ack flows back and refunds the sender.
        let currency_before = client.currency;
        pipe(&mut server, &mut client, now);
        assert!(client.currency >= currency_before);
    }

    #[test]
    fn test_large_message_fragments() {
        let (mut client, mut server, now) = establish();

        let id = client.mk_stream(None, true, true).unwrap();
        let payload: Vec<u8> = (0..5000).map(|value| value as u8).collect();
        client.stream_send(id, &payload, now).unwrap();

        pipe(&mut client, &mut server, now);

        let events: Vec<_> = server.events().collect();
        let delivered = events.iter().find_map(|event| match event {
            ConnectionEvent::Message { bytes, .. } => Some(bytes.clone()),
            _ => None,
        });

        assert_eq!(delivered.unwrap(), payload);
    }

    #[test]
    fn test_stream_id_parity() {
        let (mut client, mut server, _) = establish();

        let client_id = client.mk_stream(None, true, true).unwrap();
        let server_id = server.mk_stream(None, true, true).unwrap();

        assert_eq!(client_id % 2, 0);
        assert_eq!(server_id % 2, 1);

        // Wrong parity is refused.
        assert!(client.mk_stream(Some(3), true, true).is_err());
        assert!(server.mk_stream(Some(4), true, true).is_err());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let (mut client, _, now) = establish();

        let id = client.mk_stream(None, true, true).unwrap();
        let oversized = vec![0u8; (client.peer_limits.max_message_size + 1) as usize];

        assert_eq!(
            client.stream_send(id, &oversized, now).unwrap_err(),
            NetworkError::Fatal(ErrorType::PayloadTooLarge)
        );
    }

    #[test]
    fn test_notify_teardown() {
        let (mut client, mut server, now) = establish();

        client.close(now).unwrap();
        assert_eq!(client.state(), ConnectionState::Notify);

        pipe(&mut client, &mut server, now);
        assert_eq!(server.state(), ConnectionState::End);

        pipe(&mut server, &mut client, now);
        assert_eq!(client.state(), ConnectionState::End);

        let events: Vec<_> = client.events().collect();
        assert!(events.contains(&ConnectionEvent::Closed));
    }

    #[test]
    fn test_kill_with_buffered_data_emits_error() {
        let (mut client, _, now) = establish();

        let id = client.mk_stream(None, true, true).unwrap();
        client.stream_send(id, b"buffered", now).unwrap();

        client.kill(now);
        assert_eq!(client.state(), ConnectionState::End);

        let events: Vec<_> = client.events().collect();
        assert!(events.contains(&ConnectionEvent::Error(ErrorType::StateViolation)));
        assert!(events.contains(&ConnectionEvent::Closed));
    }

    #[test]
    fn test_open_retry_resends_same_datagram() {
        let now = Instant::now();
        let open_pair = crypto::BoxKeyPair::generate();

        let mut client =
            Connection::connect(1, addr(40_002), client_options(open_pair.public), None, now)
                .unwrap();

        let first = client.pop_outgoing().unwrap();

        let later = now + Duration::from_millis(DEFAULT_RTT_MS + 1);
        client.tick(later);

        let resent = client.pop_outgoing().unwrap();
        assert_eq!(first, resent);
    }

    #[test]
    fn test_open_retry_times_out() {
        let now = Instant::now();
        let open_pair = crypto::BoxKeyPair::generate();

        let mut client =
            Connection::connect(1, addr(40_002), client_options(open_pair.public), None, now)
                .unwrap();

        client.tick(now + Duration::from_millis(OPEN_MAX_MS + 1));

        assert_eq!(client.state(), ConnectionState::Error);
        let events: Vec<_> = client.events().collect();
        assert!(events.contains(&ConnectionEvent::Error(ErrorType::Timeout)));
    }

    #[test]
    fn test_ready_silence_times_out() {
        let (_, mut server, now) = establish();

        let lapse = now + Duration::from_millis(DEFAULT_PING_INTERVAL_MS * 2);
        server.tick(lapse);

        assert_eq!(server.state(), ConnectionState::Error);
    }

    #[test]
    fn test_ready_ping_cycle() {
        let (mut client, mut server, now) = establish();

        // The keepalive timer elapses on the pinger's side.
        let lapse = now + Duration::from_millis(DEFAULT_PING_INTERVAL_MS + 1);
        client.tick(lapse);
        assert_eq!(client.state(), ConnectionState::Ping);

        pipe(&mut client, &mut server, lapse);
        assert_eq!(server.state(), ConnectionState::Ready);

        pipe(&mut server, &mut client, lapse);
        assert_eq!(client.state(), ConnectionState::ReadyPing);
    }

    #[test]
    fn test_address_change_via_ping() {
        let (mut client, mut server, now) = establish();

        client.send_ping(now).unwrap();
        let ping = client.pop_outgoing().unwrap();
        let prefix = Prefix::read(&ping).unwrap();

        let roaming = addr(41_999);
        server.handle_datagram(&ping, prefix, roaming, now).unwrap();

        assert_eq!(server.peer_addr(), roaming);
        let events: Vec<_> = server.events().collect();
        assert!(events.contains(&ConnectionEvent::AddressChanged(roaming)));
    }

    #[test]
    fn test_address_change_vetoed() {
        let now = Instant::now();
        let open_pair = crypto::BoxKeyPair::generate();

        let mut client =
            Connection::connect(1, addr(40_002), client_options(open_pair.public), None, now)
                .unwrap();
        let mut server_options = server_options(&open_pair);
        server_options.address_veto = Some(Rc::new(|_| false));
        let mut server = Connection::accept(2, addr(40_001), server_options, None, now);

        pipe(&mut client, &mut server, now);
        pipe(&mut server, &mut client, now);
        pipe(&mut client, &mut server, now);
        pipe(&mut server, &mut client, now);

        let original = server.peer_addr();
        client.send_ping(now).unwrap();
        let ping = client.pop_outgoing().unwrap();
        let prefix = Prefix::read(&ping).unwrap();

        server.handle_datagram(&ping, prefix, addr(41_999), now).unwrap();
        assert_eq!(server.peer_addr(), original);
    }

    #[test]
    fn test_non_ping_from_foreign_source_ignored() {
        let (mut client, mut server, now) = establish();

        client.send_control(PacketKind::Notify, now).unwrap();
        let notify = client.pop_outgoing().unwrap();
        let prefix = Prefix::read(&notify).unwrap();

        server.handle_datagram(&notify, prefix, addr(41_999), now).unwrap();

        // The notify from the wrong address did nothing.
        assert!(server.state().established());
    }

    #[test]
    fn test_renew_resets_sequence() {
        let (mut client, mut server, now) = establish();

        client.sequence = SEQUENCE_RENEW_THRESHOLD;
        client.tick(now);

        assert!(client.renew_nonce.is_some());
        pipe(&mut client, &mut server, now);
        pipe(&mut server, &mut client, now);

        assert!(client.renew_nonce.is_none());
        assert!(client.sequence < 16);
        assert_eq!(server.window.max_seen(), 0);

        // Traffic keeps flowing under the renewed session.
        client.send_ping(now).unwrap();
        let ping = client.pop_outgoing().unwrap();
        let prefix = Prefix::read(&ping).unwrap();
        server.handle_datagram(&ping, prefix, client_addr(), now).unwrap();
    }

    #[test]
    fn test_reject_surfaces_to_application() {
        let now = Instant::now();
        let open_pair = crypto::BoxKeyPair::generate();

        let mut client =
            Connection::connect(1, addr(40_002), client_options(open_pair.public), None, now)
                .unwrap();

        let body = RejectBody {
            timestamp: timestamp_millis(),
            code: RejectCode::Busy,
            message: "router at capacity".to_owned(),
        };
        let reject = wire::mk_reject(1, 0, &body, Some(&client.session.public)).unwrap();
        let prefix = Prefix::read(&reject).unwrap();

        client.handle_datagram(&reject, prefix, addr(40_002), now).unwrap();

        assert_eq!(client.state(), ConnectionState::Error);
        let events: Vec<_> = client.events().collect();
        assert!(events.iter().any(|event| matches!(
            event,
            ConnectionEvent::Rejected(body) if body.code == RejectCode::Busy
        )));
    }

    #[test]
    fn test_currency_regenerates() {
        let (mut client, _, now) = establish();

        client.currency = 0;
        client.tick(now + Duration::from_millis(client.rtt_ms + 1));

        assert_eq!(client.currency, client.peer_limits.currency_regen);
    }

    #[test]
    fn test_unsafe_mode_roundtrip() {
        let now = Instant::now();

        let unsafe_options = || ConnectionOptions {
            encrypted: false,
            ..ConnectionOptions::default()
        };

        let mut client = Connection::connect(1, addr(40_002), unsafe_options(), None, now).unwrap();
        let mut server = Connection::accept(2, addr(40_001), unsafe_options(), None, now);

        pipe(&mut client, &mut server, now);
        pipe(&mut server, &mut client, now);
        pipe(&mut client, &mut server, now);
        pipe(&mut server, &mut client, now);

        assert!(client.state().established());
        assert!(server.state().established());

        let id = client.mk_stream(None, true, true).unwrap();
        client.stream_send(id, b"clear text", now).unwrap();
        pipe(&mut client, &mut server, now);

        let events: Vec<_> = server.events().collect();
        assert!(events.contains(&ConnectionEvent::Message {
            stream: id,
            bytes: b"clear text".to_vec()
        }));
    }
}
