//! Policy wrappers over the router: a server accepts and never dials, a
//! client dials exactly one peer and never accepts.

use crate::logging::Logger;
use crate::net::connection::{Connection, ConnectionOptions};
use crate::net::router::{Router, RouterEvent, RouterPolicy, RouterState};
use crate::net::socket::{Datagram, UdpDatagram};
use crate::shared::{ErrorType, NetworkError, NetworkResult};
use crate::ConnectionId;
use std::net::SocketAddr;
use std::time::Instant;

/// Incoming-only endpoint.
pub struct Server<S: Datagram> {
    router: Router<S>,
}

impl Server<UdpDatagram> {
    /// Binds a UDP server on the given address.
    pub fn bind<'a, L: Into<Option<&'a Logger>>>(
        addr: SocketAddr,
        policy: RouterPolicy,
        log: L,
        now: Instant,
    ) -> NetworkResult<Server<UdpDatagram>> {
        let mut server = Server::new(UdpDatagram::new(addr)?, policy, log);
        server.router.start(now)?;
        Ok(server)
    }
}

impl<S: Datagram> Server<S> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(socket: S, mut policy: RouterPolicy, log: L) -> Server<S> {
        policy.allow_incoming = true;
        policy.allow_outgoing = false;

        Server {
            router: Router::new(socket, policy, log),
        }
    }

    #[inline]
    pub fn router(&mut self) -> &mut Router<S> {
        &mut self.router
    }

    #[inline]
    pub fn start(&mut self, now: Instant) -> NetworkResult<()> {
        self.router.start(now)
    }

    #[inline]
    pub fn sync(&mut self, now: Instant) {
        self.router.sync(now)
    }

    #[inline]
    pub fn events(&mut self) -> impl Iterator<Item = RouterEvent> + '_ {
        self.router.events()
    }

    #[inline]
    pub fn connection(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.router.connection(id)
    }

    #[inline]
    pub fn stop(&mut self, grace_ms: u64, now: Instant) -> NetworkResult<()> {
        self.router.stop(grace_ms, now)
    }
}

/// Outgoing-only endpoint holding at most one connection.
pub struct Client<S: Datagram> {
    router: Router<S>,
    conn: Option<ConnectionId>,
}

impl Client<UdpDatagram> {
    /// Creates a UDP client bound to the given local address.
    pub fn open<'a, L: Into<Option<&'a Logger>>>(
        local: SocketAddr,
        policy: RouterPolicy,
        log: L,
        now: Instant,
    ) -> NetworkResult<Client<UdpDatagram>> {
        let mut client = Client::new(UdpDatagram::new(local)?, policy, log);
        client.router.start(now)?;
        Ok(client)
    }
}

impl<S: Datagram> Client<S> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(socket: S, mut policy: RouterPolicy, log: L) -> Client<S> {
        policy.allow_incoming = false;
        policy.allow_outgoing = true;
        policy.max_connections = 1;

        Client {
            router: Router::new(socket, policy, log),
            conn: None,
        }
    }

    #[inline]
    pub fn router(&mut self) -> &mut Router<S> {
        &mut self.router
    }

    #[inline]
    pub fn start(&mut self, now: Instant) -> NetworkResult<()> {
        self.router.start(now)
    }

    /// Dials the server. A client carries a single connection for its whole
    /// life; a second dial is refused.
    pub fn connect(
        &mut self,
        dest: SocketAddr,
        options: ConnectionOptions,
        now: Instant,
    ) -> NetworkResult<ConnectionId> {
        if self.conn.is_some() {
            return Err(NetworkError::Fatal(ErrorType::StateViolation));
        }

        let id = self.router.connect(dest, options, now)?;
        self.conn = Some(id);
        Ok(id)
    }

    /// The single connection, while it lives.
    pub fn connection(&mut self) -> Option<&mut Connection> {
        let id = self.conn?;
        self.router.connection(id)
    }

    #[inline]
    pub fn sync(&mut self, now: Instant) {
        self.router.sync(now)
    }

    #[inline]
    pub fn events(&mut self) -> impl Iterator<Item = RouterEvent> + '_ {
        self.router.events()
    }

    /// Gracefully closes the connection and stops the router.
    pub fn close(&mut self, grace_ms: u64, now: Instant) -> NetworkResult<()> {
        if self.router.state() == RouterState::Listen {
            self.router.stop(grace_ms, now)?;
        }
        Ok(())
    }
}
