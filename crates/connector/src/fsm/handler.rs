//! Outbound connection state machine.
//!
//! Each queued request walks the same lifecycle: learn the peer's overlay
//! name (optionally through a reverse lookup), start a non-blocking
//! connect to the proxy, run the SOCKS handshake over readiness events,
//! and hand the established stream to the peer registry. Failures put the
//! request back to [`State::New`] with a backoff; temporary requests are
//! dropped once the retry budget is spent.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Ipv6Addr, SocketAddr};

use tracing::{debug, error, info, trace, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::Resolver;

use crate::common::peer::{HostsDirectory, NameDeriver, PeerRegistry};
use crate::common::time::Clock;
use crate::fsm::queue::{Request, RequestQueue, State, Stream};
use crate::fsm::resolver::{NameResolver, Resolution, LOOKUP_RETRY_TIMEOUT};
use crate::fsm::socks;
use crate::net::{self, LocalDuration, LocalTime, Source};

/// Time between connection attempts to the same peer.
pub const CONNECT_RETRY_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);
/// Attempts granted to a temporary request before it is dropped.
pub const MAX_RETRY: u32 = 3;

/// Connection mode towards the anonymizing network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// SOCKS4a CONNECT with a hostname destination.
    Socks4a,
    /// RFC 1928 SOCKS5, "no authentication" only.
    #[default]
    Socks5,
    /// Plain TCP to a resolved endpoint, no proxy in between.
    Direct,
}

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection mode.
    pub mode: Mode,
    /// Proxy endpoint. `None` disables the connector entirely.
    pub proxy: Option<SocketAddr>,
    /// TCP port requested at the destination.
    pub dest_port: u16,
    /// UDP port of the overlay's nameservers.
    pub ns_port: u16,
    /// Identity sent in the SOCKS4a user field.
    pub username: String,
    /// Suffix appended to derived overlay names.
    pub domain: String,
    /// Consult the hosts db for overlay names.
    pub hosts_lookup: bool,
    /// Reverse-look-up unknown overlay names before the first attempt.
    /// Requires `hosts_lookup`, since resolved names land in the hosts db.
    pub dns_lookup: bool,
    /// The local address is randomly chosen; loopback probing is skipped.
    pub rand_addr: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            proxy: None,
            dest_port: 8060,
            ns_port: 8053,
            username: String::new(),
            domain: ".onion".to_owned(),
            hosts_lookup: true,
            dns_lookup: false,
            rand_addr: false,
        }
    }
}

/// A command or request that can be sent to the connector.
pub enum Command {
    /// Request an outbound connection to a peer.
    Connect {
        /// Peer overlay address.
        addr: Ipv6Addr,
        /// Retry indefinitely instead of giving up after [`MAX_RETRY`]
        /// attempts.
        permanent: bool,
    },
    /// Force a pass over the queue without carrying a request.
    Wakeup,
    /// Write a human-readable dump of the queue, terminated by a NUL
    /// byte, to the given stream.
    DumpQueue(File),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { addr, permanent } => {
                write!(f, "Connect({}, permanent = {})", addr, permanent)
            }
            Self::Wakeup => write!(f, "Wakeup"),
            Self::DumpQueue(_) => write!(f, "DumpQueue(..)"),
        }
    }
}

/// The outbound connector's state machine.
///
/// Owns the request queue. Driven by the reactor, which calls [`scan`][a]
/// once per iteration and [`socket_writable`][b]/[`socket_readable`][c]
/// per readiness event.
///
/// [a]: StateMachine::scan
/// [b]: StateMachine::socket_writable
/// [c]: StateMachine::socket_readable
pub struct StateMachine<P, H, D, C> {
    /// Connector configuration.
    pub config: Config,
    queue: RequestQueue,
    registry: P,
    hosts: H,
    names: D,
    resolver: Box<dyn NameResolver + Send>,
    clock: C,
}

impl<P, H, D, C> StateMachine<P, H, D, C>
where
    P: PeerRegistry,
    H: HostsDirectory,
    D: NameDeriver,
    C: Clock,
{
    /// Create a new state machine.
    pub fn new(
        config: Config,
        registry: P,
        hosts: H,
        names: D,
        resolver: Box<dyn NameResolver + Send>,
        clock: C,
    ) -> Self {
        Self {
            config,
            queue: RequestQueue::new(),
            registry,
            hosts,
            names,
            resolver,
            clock,
        }
    }

    /// Iterate over the outstanding requests, in queue order.
    pub fn requests(&self) -> impl Iterator<Item = &Request> {
        self.queue.iter()
    }

    /// Process a user command.
    pub fn command(&mut self, cmd: Command) {
        debug!(target: "connector", "Received command: {:?}", cmd);

        match cmd {
            Command::Connect { addr, permanent } => {
                if !self.queue.push(Request::new(addr, permanent)) {
                    debug!(target: "connector", "{}: request already queued", addr);
                }
            }
            Command::Wakeup => {}
            Command::DumpQueue(mut file) => {
                if let Err(e) = self.output_queue(&mut file) {
                    error!(target: "connector", "Error writing the queue dump: {}", e);
                }
            }
        }
    }

    /// Write one text line per queued request, ending with a NUL byte.
    pub fn output_queue(&self, out: &mut impl Write) -> io::Result<()> {
        for (i, req) in self.queue.iter().enumerate() {
            writeln!(
                out,
                "{}: {}, {}{}, state = {}, {}({}), retry = {}, connect_time = {}, restart_time = {}",
                i,
                req.addr,
                self.names.derive(&req.addr),
                self.config.domain,
                req.state as u8,
                if req.permanent { "PERMANENT" } else { "TEMPORARY" },
                req.permanent as u8,
                req.retry,
                req.connect_time.as_secs(),
                req.restart_time.as_secs(),
            )?;
        }
        out.write_all(&[0])
    }

    /// Advance every queued request one scheduling step.
    pub fn scan(&mut self, sources: &mut popol::Sources<Source>) {
        let now = self.clock.local_time();

        for addr in self.queue.addrs() {
            let Some(state) = self.queue.get(&addr).map(|r| r.state) else {
                continue;
            };
            match state {
                State::New => self.attempt(&addr, sources, now),
                State::LookupSent => self.poll_lookup(&addr, sources, now),
                // Waiting on socket readiness; nothing to schedule.
                State::Connecting
                | State::Socks4aRequestSent
                | State::Socks5GreetingSent
                | State::Socks5RequestSent => {}
                State::Delete => {
                    trace!(target: "connector", "{}: ignoring request marked for deletion", addr)
                }
                State::Ready => {
                    error!(target: "connector", "{}: unexpected state {:?} in queue", addr, state);
                    self.reset(&addr, sources);
                }
            }
        }
    }

    /// Unlink every request marked for deletion.
    pub fn reap(&mut self) {
        self.queue.reap();
    }

    /// Service a writability event. Only meaningful while a connect is in
    /// progress.
    pub fn socket_writable(&mut self, addr: &Ipv6Addr, sources: &mut popol::Sources<Source>) {
        let Some(state) = self.queue.get(addr).map(|r| r.state) else {
            return;
        };
        if state != State::Connecting {
            debug!(target: "connector", "{}: writable in state {:?}", addr, state);
            return;
        }
        // A non-blocking connect reports its outcome through the socket
        // error once the socket becomes writable.
        let so_error = match self
            .queue
            .get(addr)
            .and_then(|r| r.sock.as_ref())
            .and_then(Stream::tcp)
        {
            Some(stream) => stream.take_error(),
            None => return,
        };
        match so_error {
            Ok(None) => {}
            Ok(Some(e)) => {
                error!(target: "connector", "{}: connect failed: {}", addr, e);
                self.reschedule(addr, sources);
                return;
            }
            Err(e) => {
                error!(target: "connector", "{}: could not read the socket error: {}", addr, e);
                self.reschedule(addr, sources);
                return;
            }
        }
        match self.config.mode {
            Mode::Socks4a => {
                let (name, _) = self.hostname(addr);
                info!(target: "connector", "{}: requesting \"{}\" from the proxy", addr, name);

                let frame =
                    socks::socks4a::connect(&self.config.username, &name, self.config.dest_port);
                if self.send_frame(addr, &frame).is_err() {
                    self.reschedule(addr, sources);
                    return;
                }
                self.await_reply(addr, sources, State::Socks4aRequestSent);
            }
            Mode::Socks5 => {
                if self.send_frame(addr, &socks::socks5::greeting()).is_err() {
                    self.reschedule(addr, sources);
                    return;
                }
                self.await_reply(addr, sources, State::Socks5GreetingSent);
            }
            Mode::Direct => {
                // No handshake needed; the tunnel is up.
                self.conclude(addr, sources);
            }
        }
    }

    /// Service a readability event: a handshake reply or a lookup
    /// response arrived.
    pub fn socket_readable(&mut self, addr: &Ipv6Addr, sources: &mut popol::Sources<Source>) {
        let Some(req) = self.queue.get(addr) else {
            return;
        };
        // The socket may have been dropped by the writability handler of
        // the same iteration.
        if req.sock.is_none() {
            debug!(target: "connector", "{}: stale event in state {:?}", addr, req.state);
            return;
        }
        let state = req.state;
        match state {
            State::Socks4aRequestSent => {
                let mut buf = [0u8; socks::socks4a::REPLY_LEN];
                let n = match self.read_frame(addr, &mut buf) {
                    Ok(n) => n,
                    Err(_) => {
                        self.reschedule(addr, sources);
                        return;
                    }
                };
                match socks::socks4a::reply(&buf[..n]) {
                    Ok(()) => {
                        info!(target: "connector", "{}: proxy connection established", addr);
                        self.conclude(addr, sources);
                    }
                    Err(e) => {
                        error!(target: "connector", "{}: handshake failed: {}", addr, e);
                        self.reschedule(addr, sources);
                    }
                }
            }
            State::Socks5GreetingSent => {
                let mut buf = [0u8; socks::socks5::GREETING_REPLY_LEN];
                let n = match self.read_frame(addr, &mut buf) {
                    Ok(n) => n,
                    Err(_) => {
                        self.reschedule(addr, sources);
                        return;
                    }
                };
                if let Err(e) = socks::socks5::greeting_reply(&buf[..n]) {
                    error!(target: "connector", "{}: method selection failed: {}", addr, e);
                    self.reschedule(addr, sources);
                    return;
                }
                // Methods agreed on; send the actual request.
                let (name, _) = self.hostname(addr);
                info!(target: "connector", "{}: requesting \"{}\" from the proxy", addr, name);

                match socks::socks5::connect(&name, self.config.dest_port) {
                    Ok(frame) => {
                        if self.send_frame(addr, &frame).is_err() {
                            self.reschedule(addr, sources);
                            return;
                        }
                        if let Some(req) = self.queue.get_mut(addr) {
                            req.state = State::Socks5RequestSent;
                        }
                    }
                    Err(e) => {
                        error!(target: "connector", "{}: cannot encode request: {}", addr, e);
                        self.reschedule(addr, sources);
                    }
                }
            }
            State::Socks5RequestSent => {
                let mut buf = [0u8; socks::socks5::REPLY_MAX];
                let n = match self.read_frame(addr, &mut buf) {
                    Ok(n) => n,
                    Err(_) => {
                        self.reschedule(addr, sources);
                        return;
                    }
                };
                match socks::socks5::reply(&buf[..n]) {
                    Ok(()) => {
                        info!(target: "connector", "{}: proxy connection established", addr);
                        self.conclude(addr, sources);
                    }
                    Err(e) => {
                        error!(target: "connector", "{}: handshake failed: {}", addr, e);
                        self.reschedule(addr, sources);
                    }
                }
            }
            State::LookupSent => {
                let Some(req) = self.queue.get_mut(addr) else {
                    return;
                };
                match self.resolver.on_event(req) {
                    Resolution::Pending => {}
                    Resolution::Resolved => {
                        info!(target: "connector", "{}: got a valid lookup response, reconnecting", addr);
                        if req.sock.take().is_some() {
                            sources.unregister(&Source::Request(*addr));
                        }
                        req.lookup = None;
                        req.state = State::New;
                        req.retry = 0;
                        req.restart_time = LocalTime::default();
                    }
                    Resolution::Failed => {
                        debug!(target: "connector", "{}: closing lookup socket", addr);
                        if req.sock.take().is_some() {
                            sources.unregister(&Source::Request(*addr));
                        }
                        req.lookup = None;
                        req.state = State::Delete;
                    }
                }
            }
            State::Delete => {
                debug!(target: "connector", "{}: request already marked for deletion", addr)
            }
            State::New | State::Connecting | State::Ready => {
                error!(target: "connector", "{}: readable in unexpected state {:?}", addr, state);
                self.reset(addr, sources);
            }
        }
    }

    /// Schedule a fresh attempt for a request in [`State::New`].
    fn attempt(&mut self, addr: &Ipv6Addr, sources: &mut popol::Sources<Source>, now: LocalTime) {
        {
            let Some(req) = self.queue.get_mut(addr) else {
                return;
            };
            if now < req.restart_time {
                trace!(target: "connector", "{}: next attempt not before {}", addr, req.restart_time);
                return;
            }
            req.retry += 1;
            if !req.permanent && req.retry > MAX_RETRY {
                info!(
                    target: "connector",
                    "{}: temporary request failed {} time(s), dropping", addr, req.retry - 1
                );
                req.state = State::Delete;
                return;
            }
        }

        // Try to learn the peer's long-form name before the first attempt.
        let (retry, skip_lookup) = match self.queue.get(addr) {
            Some(req) => (req.retry, req.skip_lookup),
            None => return,
        };
        if self.config.dns_lookup
            && retry <= 1
            && !skip_lookup
            && !self.hostname_known(addr)
            && self.start_lookup(addr, sources, now)
        {
            return;
        }

        let Some(dest) = self.target(addr) else {
            return;
        };
        debug!(target: "connector", "{}: dialing {}", addr, dest);

        let Some(req) = self.queue.get_mut(addr) else {
            return;
        };
        req.connect_time = now;

        match net::dial(&dest) {
            Ok(stream) => {
                sources.register(Source::Request(*addr), &stream, popol::interest::WRITE);
                req.sock = Some(Stream::Tcp(stream));
                req.state = State::Connecting;
            }
            Err(e) => {
                error!(
                    target: "connector",
                    "{}: connect to {} failed: {}, retrying in {}",
                    addr, dest, e, CONNECT_RETRY_TIMEOUT
                );
                self.reschedule(addr, sources);
            }
        }
    }

    /// Kick off a reverse lookup. Returns whether one is now in flight.
    fn start_lookup(
        &mut self,
        addr: &Ipv6Addr,
        sources: &mut popol::Sources<Source>,
        now: LocalTime,
    ) -> bool {
        let Some(req) = self.queue.get_mut(addr) else {
            return false;
        };
        match self.resolver.initiate(req) {
            Ok(()) => {
                info!(target: "connector", "{}: reverse lookup started", addr);
                req.state = State::LookupSent;
                req.retry = 0;
                req.restart_time = now + LOOKUP_RETRY_TIMEOUT;
                if let Some(sock) = &req.sock {
                    sources.register(Source::Request(*addr), sock, popol::interest::READ);
                }
                true
            }
            Err(e) => {
                warn!(target: "connector", "{}: could not start reverse lookup: {}", addr, e);
                false
            }
        }
    }

    /// Check on a lookup in flight; retransmissions and timeouts are the
    /// resolver's business, the fallback transition is ours.
    fn poll_lookup(
        &mut self,
        addr: &Ipv6Addr,
        sources: &mut popol::Sources<Source>,
        now: LocalTime,
    ) {
        let Some(req) = self.queue.get_mut(addr) else {
            return;
        };
        match self.resolver.poll(req, now) {
            Resolution::Pending => {}
            Resolution::Resolved => {
                info!(target: "connector", "{}: reverse lookup complete, reconnecting", addr);
                if req.sock.take().is_some() {
                    sources.unregister(&Source::Request(*addr));
                }
                req.lookup = None;
                req.state = State::New;
                req.retry = 0;
                req.restart_time = LocalTime::default();
            }
            Resolution::Failed => {
                info!(
                    target: "connector",
                    "{}: reverse lookup failed, continuing with the derived name", addr
                );
                if req.sock.take().is_some() {
                    sources.unregister(&Source::Request(*addr));
                }
                req.lookup = None;
                req.state = State::New;
                req.restart_time = LocalTime::default();
                // Counts as a spent attempt, and keeps the stale counter
                // from re-triggering the lookup branch.
                req.retry = 1;
                req.skip_lookup = true;
            }
        }
    }

    /// Close the current attempt and retry after the backoff period.
    fn reschedule(&mut self, addr: &Ipv6Addr, sources: &mut popol::Sources<Source>) {
        info!(target: "connector", "{}: rescheduling request", addr);

        let now = self.clock.local_time();
        self.reset(addr, sources);

        if let Some(req) = self.queue.get_mut(addr) {
            req.restart_time = now + CONNECT_RETRY_TIMEOUT;
        }
    }

    /// Flip interest from WRITE to READ after a handshake frame has been
    /// sent, and move the request to `state` while awaiting the reply.
    fn await_reply(
        &mut self,
        addr: &Ipv6Addr,
        sources: &mut popol::Sources<Source>,
        state: State,
    ) {
        let Some(req) = self.queue.get_mut(addr) else {
            return;
        };
        sources.unset(&Source::Request(*addr), popol::interest::WRITE);
        sources.set(&Source::Request(*addr), popol::interest::READ);
        req.state = state;
    }

    /// Drop the socket and return the request to [`State::New`].
    fn reset(&mut self, addr: &Ipv6Addr, sources: &mut popol::Sources<Source>) {
        let Some(req) = self.queue.get_mut(addr) else {
            return;
        };
        if req.sock.take().is_some() {
            sources.unregister(&Source::Request(*addr));
        }
        req.restart_time = LocalTime::default();
        req.state = State::New;
    }

    /// Hand the established stream over to the peer registry and retire
    /// the request.
    fn conclude(&mut self, addr: &Ipv6Addr, sources: &mut popol::Sources<Source>) {
        let now = self.clock.local_time();
        let Some(req) = self.queue.get_mut(addr) else {
            return;
        };
        let Some(Stream::Tcp(stream)) = req.sock.take() else {
            return;
        };
        sources.unregister(&Source::Request(*addr));
        req.state = State::Delete;

        debug!(target: "connector", "{}: activating peer", addr);
        self.registry
            .insert(stream, *addr, req.permanent, now - req.connect_time);

        // The first keepalive goes out right away.
        if !self.registry.keepalive(addr) {
            error!(target: "connector", "{}: newly inserted peer not found", addr);
        }
    }

    /// Write a complete handshake frame; a short write is a failure.
    fn send_frame(&self, addr: &Ipv6Addr, frame: &[u8]) -> io::Result<()> {
        let Some(mut stream) = self
            .queue
            .get(addr)
            .and_then(|r| r.sock.as_ref())
            .and_then(Stream::tcp)
        else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        match stream.write(frame) {
            Ok(n) if n == frame.len() => {
                trace!(target: "connector", "{}: sent {} handshake bytes", addr, n);
                Ok(())
            }
            Ok(n) => {
                error!(
                    target: "connector",
                    "{}: handshake frame truncated to {} of {} bytes", addr, n, frame.len()
                );
                Err(io::Error::from(io::ErrorKind::WriteZero))
            }
            Err(e) => {
                error!(
                    target: "connector",
                    "{}: error writing {} bytes: {}", addr, frame.len(), e
                );
                Err(e)
            }
        }
    }

    /// Read a handshake reply; returns the number of bytes received.
    fn read_frame(&self, addr: &Ipv6Addr, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut stream) = self
            .queue
            .get(addr)
            .and_then(|r| r.sock.as_ref())
            .and_then(Stream::tcp)
        else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        match stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                error!(target: "connector", "{}: error reading handshake reply: {}", addr, e);
                Err(e)
            }
        }
    }

    /// The overlay name used for a peer: the hosts db entry when enabled
    /// and present, otherwise the derived name with the domain suffix.
    /// The boolean tells whether the name came from the hosts db.
    fn hostname(&self, addr: &Ipv6Addr) -> (String, bool) {
        if self.config.hosts_lookup {
            self.hosts.refresh();
            if let Some(name) = self.hosts.name(addr) {
                return (name, true);
            }
        }
        let mut name = self.names.derive(addr);
        name.push_str(&self.config.domain);

        (name, false)
    }

    /// Whether the hosts db already stores a name for the peer.
    fn hostname_known(&self, addr: &Ipv6Addr) -> bool {
        self.config.hosts_lookup && {
            self.hosts.refresh();
            self.hosts.name(addr).is_some()
        }
    }

    /// TCP endpoint of the next attempt: the proxy, or the peer's own
    /// endpoint in direct mode.
    fn target(&self, addr: &Ipv6Addr) -> Option<SocketAddr> {
        if self.config.mode == Mode::Direct {
            let (name, from_hosts) = self.hostname(addr);
            if !from_hosts {
                warn!(
                    target: "connector",
                    "{}: no destination name known for a direct connection", addr
                );
                return None;
            }
            match self.resolve(&name) {
                Ok(dest) => Some(dest),
                Err(e) => {
                    warn!(target: "connector", "{}: no address found for \"{}\": {}", addr, name, e);
                    None
                }
            }
        } else {
            let proxy = self.config.proxy;
            if proxy.is_none() {
                debug!(target: "connector", "{}: no proxy endpoint configured", addr);
            }
            proxy
        }
    }

    /// Resolve a destination name through the system resolver.
    fn resolve(&self, name: &str) -> Result<SocketAddr, net::error::Error> {
        let resolver = Resolver::new(ResolverConfig::default(), ResolverOpts::default())?;
        let response = resolver.lookup_ip(name)?;
        let ip = response.iter().next().ok_or_else(|| {
            net::error::Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "resolver returned no addresses",
            ))
        })?;

        Ok(SocketAddr::new(ip, self.config.dest_port))
    }
}
