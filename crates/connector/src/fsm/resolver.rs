//! Reverse lookup of overlay names.
//!
//! Before the first connection attempt to a peer whose overlay name is
//! not in the hosts db, the connector can try to obtain the long-form
//! name through a reverse PTR lookup. Two interchangeable strategies
//! exist: an anonymous UDP exchange with one of the overlay's
//! nameservers, and a hand-off to the daemon's resolver service. The
//! strategy is chosen when the connector is built.

use std::io;
use std::net::Ipv6Addr;

use tracing::{debug, info, warn};

use crate::common::peer::{HostsDirectory, Origin};
use crate::fsm::queue::{Lookup, Request, Stream};
use crate::net::{self, LocalDuration, LocalTime};

/// Queries sent per lookup before giving up.
pub const LOOKUP_MAX_RETRY: u32 = 3;
/// Time to wait for a nameserver response before retransmitting.
pub const LOOKUP_RETRY_TIMEOUT: LocalDuration = LocalDuration::from_secs(10);
/// Traditional DNS datagram size.
const PACKET_SIZE: usize = 512;

/// Progress of a reverse lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Still waiting for an answer.
    Pending,
    /// The overlay name is now available from the hosts db.
    Resolved,
    /// The lookup cannot complete.
    Failed,
}

/// Wire codec for reverse PTR queries.
///
/// Implemented by the daemon's DNS message layer; the connector treats
/// queries and responses as opaque datagrams.
pub trait PtrCodec {
    /// Build a PTR query for the reversed address into `buf`. Returns the
    /// number of bytes written.
    fn query(&self, addr: &Ipv6Addr, txid: u16, buf: &mut [u8]) -> io::Result<usize>;

    /// Validate a response to the query `txid` and record the name it
    /// carries in the hosts db, tagged with the nameserver's origin.
    fn response(&self, buf: &[u8], txid: u16, addr: &Ipv6Addr, origin: Origin) -> io::Result<()>;
}

/// The daemon's out-of-band resolver front-end.
///
/// Queries complete in the background; the service signals completion by
/// waking the connector through its handle, at which point the name is
/// expected in the hosts db.
pub trait ResolverService {
    /// Dispatch a reverse query for `addr`. Returns `false` if no query
    /// could be issued.
    fn query(&self, addr: &Ipv6Addr) -> bool;
}

/// A reverse-lookup strategy driven by the request state machine.
///
/// `initiate` only attaches lookup state (and possibly a socket) to the
/// request; the state machine owns the lifecycle transitions around it.
pub trait NameResolver {
    /// Start a lookup for the request's address.
    ///
    /// On error the request is left untouched and the state machine
    /// proceeds straight to the connect path.
    fn initiate(&mut self, req: &mut Request) -> io::Result<()>;

    /// Periodic check from the state scan. Handles retransmissions;
    /// returns [`Resolution::Failed`] once the retry budget is spent.
    fn poll(&mut self, req: &mut Request, now: LocalTime) -> Resolution;

    /// A datagram arrived on the lookup socket.
    fn on_event(&mut self, req: &mut Request) -> Resolution;
}

/// Reverse lookup through an anonymous UDP exchange.
///
/// Each request gets its own non-blocking UDP socket and transaction id.
/// Responses must come from the queried nameserver; datagrams from
/// anywhere else fail the lookup.
pub struct UdpProbe<H, X> {
    hosts: H,
    codec: X,
    ns_port: u16,
    rng: fastrand::Rng,
}

impl<H: HostsDirectory, X: PtrCodec> UdpProbe<H, X> {
    /// Create a probe picking nameservers from `hosts` on port `ns_port`.
    pub fn new(hosts: H, codec: X, ns_port: u16, rng: fastrand::Rng) -> Self {
        Self {
            hosts,
            codec,
            ns_port,
            rng,
        }
    }

    /// Send (or re-send) the query of the lookup attached to `req`.
    fn send(&self, req: &Request) -> io::Result<()> {
        let (lookup, sock) = match (req.lookup, req.sock.as_ref().and_then(Stream::udp)) {
            (Some(lookup), Some(sock)) => (lookup, sock),
            _ => return Err(io::Error::from(io::ErrorKind::NotConnected)),
        };
        let mut buf = [0u8; PACKET_SIZE];
        let len = self.codec.query(&req.addr, lookup.txid, &mut buf)?;

        let n = sock.send_to(&buf[..len], lookup.ns)?;
        if n < len {
            warn!(target: "resolver", "{}: query truncated: {} < {}", req.addr, n, len);
        }
        info!(target: "resolver", "{}: query sent to nameserver {}", req.addr, lookup.ns);

        Ok(())
    }
}

impl<H: HostsDirectory, X: PtrCodec> NameResolver for UdpProbe<H, X> {
    fn initiate(&mut self, req: &mut Request) -> io::Result<()> {
        let Some((ns, origin)) = self.hosts.nameserver() else {
            warn!(target: "resolver", "no nameserver available");
            return Err(io::Error::from(io::ErrorKind::NotFound));
        };
        let sock = net::udp_socket()?;
        debug!(target: "resolver", "{}: created lookup socket", req.addr);

        req.lookup = Some(Lookup {
            ns: (ns, self.ns_port).into(),
            origin,
            txid: self.rng.u16(..),
        });
        req.sock = Some(Stream::Udp(sock));

        if let Err(e) = self.send(req) {
            req.sock = None;
            req.lookup = None;
            return Err(e);
        }
        Ok(())
    }

    fn poll(&mut self, req: &mut Request, now: LocalTime) -> Resolution {
        if now < req.restart_time {
            // Keep waiting for the response.
            return Resolution::Pending;
        }
        if req.retry < LOOKUP_MAX_RETRY && self.send(req).is_ok() {
            req.retry += 1;
            req.restart_time = now + LOOKUP_RETRY_TIMEOUT;
            info!(target: "resolver", "{}: query re-sent, retry = {}", req.addr, req.retry);

            return Resolution::Pending;
        }
        Resolution::Failed
    }

    fn on_event(&mut self, req: &mut Request) -> Resolution {
        let (lookup, sock) = match (req.lookup, req.sock.as_ref().and_then(Stream::udp)) {
            (Some(lookup), Some(sock)) => (lookup, sock),
            _ => return Resolution::Failed,
        };
        let mut buf = [0u8; PACKET_SIZE];

        match sock.recv_from(&mut buf) {
            Ok((len, from)) => {
                debug!(target: "resolver", "{}: received {} bytes, checking identity", req.addr, len);

                if from.ip() != lookup.ns.ip() || from.port() != lookup.ns.port() {
                    warn!(target: "resolver", "{}: sender socket address does not match", req.addr);
                    return Resolution::Failed;
                }
                match self
                    .codec
                    .response(&buf[..len], lookup.txid, &req.addr, lookup.origin)
                {
                    Ok(()) => Resolution::Resolved,
                    Err(e) => {
                        warn!(target: "resolver", "{}: invalid response: {}", req.addr, e);
                        Resolution::Failed
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Resolution::Pending,
            Err(e) => {
                warn!(target: "resolver", "{}: failed to receive response: {}", req.addr, e);
                Resolution::Failed
            }
        }
    }
}

/// Reverse lookup through the daemon's resolver service.
///
/// No socket is attached to the request; the service answers out of band
/// into the hosts db and wakes the connector, whose next scan finds the
/// name.
pub struct CallbackResolver<H, S> {
    hosts: H,
    service: S,
}

impl<H: HostsDirectory, S: ResolverService> CallbackResolver<H, S> {
    /// Create a resolver handing queries to `service`.
    pub fn new(hosts: H, service: S) -> Self {
        Self { hosts, service }
    }
}

impl<H: HostsDirectory, S: ResolverService> NameResolver for CallbackResolver<H, S> {
    fn initiate(&mut self, req: &mut Request) -> io::Result<()> {
        info!(target: "resolver", "{}: signalling resolver", req.addr);

        if self.service.query(&req.addr) {
            Ok(())
        } else {
            Err(io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn poll(&mut self, req: &mut Request, now: LocalTime) -> Resolution {
        // The name may have arrived out of band in the meantime.
        if self.hosts.name(&req.addr).is_some() {
            debug!(target: "resolver", "{}: name found", req.addr);
            return Resolution::Resolved;
        }
        if now < req.restart_time {
            return Resolution::Pending;
        }
        if req.retry < LOOKUP_MAX_RETRY {
            req.retry += 1;
            req.restart_time = now + LOOKUP_RETRY_TIMEOUT;

            return Resolution::Pending;
        }
        Resolution::Failed
    }

    fn on_event(&mut self, _req: &mut Request) -> Resolution {
        // No socket is attached to callback lookups.
        Resolution::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct TestHosts {
        names: Mutex<Vec<(Ipv6Addr, String)>>,
        ns: Mutex<Option<(Ipv6Addr, Origin)>>,
    }

    impl HostsDirectory for TestHosts {
        fn refresh(&self) {}

        fn name(&self, addr: &Ipv6Addr) -> Option<String> {
            self.names
                .lock()
                .unwrap()
                .iter()
                .find(|(a, _)| a == addr)
                .map(|(_, n)| n.clone())
        }

        fn nameserver(&self) -> Option<(Ipv6Addr, Origin)> {
            *self.ns.lock().unwrap()
        }
    }

    /// Codec that frames queries as `txid || address` and treats response
    /// payloads after the txid as the resolved name.
    struct TestCodec {
        hosts: Arc<TestHosts>,
    }

    impl PtrCodec for TestCodec {
        fn query(&self, addr: &Ipv6Addr, txid: u16, buf: &mut [u8]) -> io::Result<usize> {
            buf[..2].copy_from_slice(&txid.to_be_bytes());
            buf[2..18].copy_from_slice(&addr.octets());
            Ok(18)
        }

        fn response(
            &self,
            buf: &[u8],
            txid: u16,
            addr: &Ipv6Addr,
            _origin: Origin,
        ) -> io::Result<()> {
            if buf.len() < 2 || buf[..2] != txid.to_be_bytes() {
                return Err(io::Error::from(io::ErrorKind::InvalidData));
            }
            let name = String::from_utf8(buf[2..].to_vec())
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
            self.hosts.names.lock().unwrap().push((*addr, name));
            Ok(())
        }
    }

    fn peer() -> Ipv6Addr {
        Ipv6Addr::new(0xfd87, 0xd87e, 0xeb43, 0, 0, 0, 0, 0x42)
    }

    fn probe_with_ns() -> (UdpProbe<Arc<TestHosts>, TestCodec>, Arc<TestHosts>, UdpSocket) {
        let ns = UdpSocket::bind("[::1]:0").unwrap();
        let port = ns.local_addr().unwrap().port();

        let hosts = Arc::new(TestHosts::default());
        *hosts.ns.lock().unwrap() = Some((Ipv6Addr::LOCALHOST, Origin::Hosts));

        let codec = TestCodec {
            hosts: hosts.clone(),
        };
        let probe = UdpProbe::new(hosts.clone(), codec, port, fastrand::Rng::with_seed(7));

        (probe, hosts, ns)
    }

    #[test]
    fn test_initiate_without_nameserver_fails() {
        let hosts = Arc::new(TestHosts::default());
        let codec = TestCodec {
            hosts: hosts.clone(),
        };
        let mut probe = UdpProbe::new(hosts, codec, 8053, fastrand::Rng::with_seed(7));
        let mut req = Request::new(peer(), false);

        assert!(probe.initiate(&mut req).is_err());
        assert!(req.sock.is_none());
        assert!(req.lookup.is_none());
    }

    #[test]
    fn test_valid_response_resolves() {
        let (mut probe, hosts, ns) = probe_with_ns();
        let mut req = Request::new(peer(), false);

        probe.initiate(&mut req).unwrap();
        assert!(req.sock.is_some());

        // Echo the transaction id back with a name attached.
        let mut buf = [0u8; PACKET_SIZE];
        let (_, from) = ns.recv_from(&mut buf).unwrap();
        let mut reply = buf[..2].to_vec();
        reply.extend_from_slice(b"peer.onion");
        ns.send_to(&reply, from).unwrap();

        // The response takes a moment to come back over loopback.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            match probe.on_event(&mut req) {
                Resolution::Resolved => break,
                Resolution::Pending if std::time::Instant::now() < deadline => {
                    std::thread::sleep(std::time::Duration::from_millis(10))
                }
                other => panic!("lookup did not resolve: {:?}", other),
            }
        }
        assert_eq!(hosts.name(&peer()).as_deref(), Some("peer.onion"));
    }

    #[test]
    fn test_mismatched_source_fails() {
        let (mut probe, _hosts, ns) = probe_with_ns();
        let mut req = Request::new(peer(), false);

        probe.initiate(&mut req).unwrap();

        let mut buf = [0u8; PACKET_SIZE];
        let (_, from) = ns.recv_from(&mut buf).unwrap();

        // Reply from a different socket than the one queried.
        let rogue = UdpSocket::bind("[::1]:0").unwrap();
        let mut reply = buf[..2].to_vec();
        reply.extend_from_slice(b"peer.onion");
        rogue.send_to(&reply, from).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            match probe.on_event(&mut req) {
                Resolution::Failed => break,
                Resolution::Pending if std::time::Instant::now() < deadline => {
                    std::thread::sleep(std::time::Duration::from_millis(10))
                }
                other => panic!("rogue response was accepted: {:?}", other),
            }
        }
    }

    #[test]
    fn test_poll_retransmits_then_fails() {
        let (mut probe, _hosts, ns) = probe_with_ns();
        let mut req = Request::new(peer(), false);
        let mut now = LocalTime::from_secs(1_000_000);

        probe.initiate(&mut req).unwrap();
        req.restart_time = now + LOOKUP_RETRY_TIMEOUT;

        for retry in 1..=LOOKUP_MAX_RETRY {
            assert_eq!(probe.poll(&mut req, now), Resolution::Pending);

            now = now + LOOKUP_RETRY_TIMEOUT + LocalDuration::from_secs(1);
            assert_eq!(probe.poll(&mut req, now), Resolution::Pending);
            assert_eq!(req.retry, retry);
        }
        now = now + LOOKUP_RETRY_TIMEOUT + LocalDuration::from_secs(1);
        assert_eq!(probe.poll(&mut req, now), Resolution::Failed);

        // One initial query plus the retransmissions.
        let mut count = 0;
        let mut buf = [0u8; PACKET_SIZE];
        ns.set_nonblocking(true).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while count < 1 + LOOKUP_MAX_RETRY && std::time::Instant::now() < deadline {
            if ns.recv_from(&mut buf).is_ok() {
                count += 1;
            } else {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }
        assert_eq!(count, 1 + LOOKUP_MAX_RETRY);
    }

    #[test]
    fn test_callback_resolver_finds_name_out_of_band() {
        struct NoopService;
        impl ResolverService for NoopService {
            fn query(&self, _addr: &Ipv6Addr) -> bool {
                true
            }
        }
        let hosts = Arc::new(TestHosts::default());
        let mut resolver = CallbackResolver::new(hosts.clone(), NoopService);
        let mut req = Request::new(peer(), false);
        let now = LocalTime::from_secs(1_000_000);

        resolver.initiate(&mut req).unwrap();
        assert!(req.sock.is_none());

        req.restart_time = now + LOOKUP_RETRY_TIMEOUT;
        assert_eq!(resolver.poll(&mut req, now), Resolution::Pending);

        hosts
            .names
            .lock()
            .unwrap()
            .push((peer(), "peer.onion".into()));
        assert_eq!(resolver.poll(&mut req, now), Resolution::Resolved);
    }
}
