//! Datagram socket seam. The router only ever talks to the `Datagram` trait;
//! production binds a non-blocking UDP socket through mio, tests wire routers
//! together through an in-memory hub.

use crate::shared::{ErrorType, NetworkError, NetworkResult};
use hashbrown::HashMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

/// An unconnected datagram socket. `recv` and `send` never block; both report
/// `Wait` when the operation cannot complete right now.
pub trait Datagram {
    fn bind(&mut self) -> NetworkResult<()>;
    fn recv(&mut self, buf: &mut [u8]) -> NetworkResult<(usize, SocketAddr)>;
    fn send(&mut self, dest: SocketAddr, data: &[u8]) -> NetworkResult<usize>;
    fn close(&mut self);
    fn is_closed(&self) -> bool;
    fn local_addr(&self) -> NetworkResult<SocketAddr>;
}

/// UDP socket registered on a private mio poll.
pub struct UdpDatagram {
    addr: SocketAddr,
    socket: Option<mio::net::UdpSocket>,
    poll: mio::Poll,
    events: mio::Events,
}

impl UdpDatagram {
    const TOKEN: mio::Token = mio::Token(0);

    pub fn new(addr: SocketAddr) -> NetworkResult<UdpDatagram> {
        Ok(UdpDatagram {
            addr,
            socket: None,
            poll: mio::Poll::new()?,
            events: mio::Events::with_capacity(64),
        })
    }

    /// Parks the caller until the socket is ready or the timeout elapses.
    /// Purely an efficiency aid for application drive loops.
    pub fn wait(&mut self, timeout: Duration) -> NetworkResult<()> {
        self.poll.poll(&mut self.events, Some(timeout))?;
        Ok(())
    }
}

impl Datagram for UdpDatagram {
    fn bind(&mut self) -> NetworkResult<()> {
        let socket = mio::net::UdpSocket::bind(&self.addr)?;

        self.poll.register(
            &socket,
            Self::TOKEN,
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )?;

        self.socket = Some(socket);
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> NetworkResult<(usize, SocketAddr)> {
        match &self.socket {
            Some(socket) => socket.recv_from(buf).map_err(Into::into),
            None => Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::NotConnected))),
        }
    }

    fn send(&mut self, dest: SocketAddr, data: &[u8]) -> NetworkResult<usize> {
        match &self.socket {
            Some(socket) => socket.send_to(data, &dest).map_err(Into::into),
            None => Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::NotConnected))),
        }
    }

    fn close(&mut self) {
        self.socket = None;
    }

    fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    fn local_addr(&self) -> NetworkResult<SocketAddr> {
        match &self.socket {
            Some(socket) => socket.local_addr().map_err(Into::into),
            None => Ok(self.addr),
        }
    }
}

/// Shared in-memory switchboard. Every bound `MemorySocket` owns an inbound
/// queue keyed by its address; `send` enqueues at the destination, datagrams
/// to unknown addresses vanish exactly like UDP.
pub struct MemoryHub {
    queues: HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
}

impl MemoryHub {
    pub fn new() -> Rc<RefCell<MemoryHub>> {
        Rc::new(RefCell::new(MemoryHub { queues: HashMap::new() }))
    }
}

pub struct MemorySocket {
    hub: Rc<RefCell<MemoryHub>>,
    addr: SocketAddr,
    bound: bool,
    closed: bool,
}

impl MemorySocket {
    pub fn new(hub: &Rc<RefCell<MemoryHub>>, addr: SocketAddr) -> MemorySocket {
        MemorySocket {
            hub: Rc::clone(hub),
            addr,
            bound: false,
            closed: false,
        }
    }
}

impl Datagram for MemorySocket {
    fn bind(&mut self) -> NetworkResult<()> {
        let mut hub = self.hub.borrow_mut();

        if hub.queues.contains_key(&self.addr) {
            return Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::AddrInUse)));
        }

        hub.queues.insert(self.addr, VecDeque::new());
        self.bound = true;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> NetworkResult<(usize, SocketAddr)> {
        if self.closed || !self.bound {
            return Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::NotConnected)));
        }

        let mut hub = self.hub.borrow_mut();
        let queue = hub
            .queues
            .get_mut(&self.addr)
            .ok_or(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::NotConnected)))?;

        match queue.pop_front() {
            Some((source, data)) => {
                if data.len() > buf.len() {
                    // Oversized datagrams truncate, as UDP does.
                    buf.copy_from_slice(&data[..buf.len()]);
                    Ok((buf.len(), source))
                } else {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok((data.len(), source))
                }
            }
            None => Err(NetworkError::Wait),
        }
    }

    fn send(&mut self, dest: SocketAddr, data: &[u8]) -> NetworkResult<usize> {
        if self.closed || !self.bound {
            return Err(NetworkError::Fatal(ErrorType::Io(io::ErrorKind::NotConnected)));
        }

        let mut hub = self.hub.borrow_mut();

        if let Some(queue) = hub.queues.get_mut(&dest) {
            queue.push_back((self.addr, data.to_vec()));
        }

        Ok(data.len())
    }

    fn close(&mut self) {
        if self.bound {
            self.hub.borrow_mut().queues.remove(&self.addr);
        }
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn local_addr(&self) -> NetworkResult<SocketAddr> {
        Ok(self.addr)
    }
}
