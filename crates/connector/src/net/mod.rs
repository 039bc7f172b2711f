//! Networking core of the outbound connector.
use std::net::SocketAddr;
use std::{io, net};

pub use reactor::{Reactor, Waker};
pub use time::{LocalDuration, LocalTime};

pub mod error;
pub mod reactor;
pub mod time;

/// Keys identifying entries in the reactor's source table.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Source {
    /// The socket of a queued connection request, keyed by peer address.
    Request(net::Ipv6Addr),
    /// The cross-thread waker.
    Waker,
}

/// Used to wake the event loop, for example when a command is ready to be
/// processed by the connector.
pub trait NetWaker: Send + Sync + Clone {
    /// Wake up! Call this after sending a command to make sure the command is processed
    /// in a timely fashion.
    fn wake(&self) -> io::Result<()>;
}

/// Begin a non-blocking connect to `addr`.
///
/// A connect still in flight when this returns is not an error: the
/// socket reports the outcome through writability and `SO_ERROR` once it
/// settles. Each attempt gets a fresh socket.
pub fn dial(addr: &SocketAddr) -> Result<net::TcpStream, io::Error> {
    use socket2::{Domain, Socket, Type};

    let sock = Socket::new(Domain::for_address(*addr), Type::STREAM, None)?;
    sock.set_nonblocking(true)?;

    if let Err(e) = sock.connect(&(*addr).into()) {
        let in_flight = e.raw_os_error() == Some(libc::EINPROGRESS)
            || e.kind() == io::ErrorKind::WouldBlock;
        if !in_flight {
            return Err(e);
        }
    }
    Ok(sock.into())
}

/// Create the unconnected, non-blocking UDP socket of a lookup exchange.
pub fn udp_socket() -> Result<net::UdpSocket, io::Error> {
    let sock = net::UdpSocket::bind((net::Ipv6Addr::UNSPECIFIED, 0))?;

    sock.set_nonblocking(true)?;

    Ok(sock)
}
