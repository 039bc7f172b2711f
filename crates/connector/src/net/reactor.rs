//! Poll-based reactor. This is a single-threaded reactor using a `poll`
//! loop to drive the connector's state machine.
use std::io;
use std::net::Ipv6Addr;
use std::sync::Arc;

use flume as chan;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::common::peer::{HostsDirectory, NameDeriver, PeerRegistry};
use crate::common::time::Clock;
use crate::fsm::handler::{Command, StateMachine};
use crate::fsm::resolver::LOOKUP_RETRY_TIMEOUT;
use crate::net::{error::Error, LocalDuration, NetWaker, Source};

/// Maximum amount of time to wait for i/o. Bounds the latency of
/// termination checks and lookup retransmissions.
const WAIT_TIMEOUT: LocalDuration = LOOKUP_RETRY_TIMEOUT;

#[derive(Clone)]
pub struct Waker(Arc<popol::Waker>);

impl Waker {
    fn new(sources: &mut popol::Sources<Source>) -> io::Result<Self> {
        let waker = Arc::new(popol::Waker::new(sources, Source::Waker)?);

        Ok(Self(waker))
    }
}

impl NetWaker for Waker {
    fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

/// A single-threaded non-blocking reactor.
pub struct Reactor {
    sources: popol::Sources<Source>,
    waker: Waker,
    events: Vec<popol::Event<Source>>,
}

impl Reactor {
    /// Construct a new reactor.
    pub fn new() -> Result<Self, io::Error> {
        let mut sources = popol::Sources::new();
        let waker = Waker::new(&mut sources)?;

        Ok(Self {
            sources,
            waker,
            events: Vec::with_capacity(32),
        })
    }

    /// Return a new waker.
    ///
    /// Used to wake up the main event loop.
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Run the connector with the reactor. Returns once cancelled.
    pub fn run<P, H, D, C>(
        &mut self,
        machine: &mut StateMachine<P, H, D, C>,
        commands: &chan::Receiver<Command>,
        cancellation: CancellationToken,
    ) -> Result<(), Error>
    where
        P: PeerRegistry,
        H: HostsDirectory,
        D: NameDeriver,
        C: Clock,
    {
        loop {
            if cancellation.is_cancelled() {
                trace!(target: "net", "Reactor cancelled");
                return Ok(());
            }
            self.step(machine, commands)?;
        }
    }

    /// A single reactor iteration: scan the queue, wait for readiness,
    /// consume a command, dispatch socket events, reap.
    pub fn step<P, H, D, C>(
        &mut self,
        machine: &mut StateMachine<P, H, D, C>,
        commands: &chan::Receiver<Command>,
    ) -> Result<(), Error>
    where
        P: PeerRegistry,
        H: HostsDirectory,
        D: NameDeriver,
        C: Clock,
    {
        machine.scan(&mut self.sources);

        trace!(
            target: "net",
            "Polling {} source(s), waking up in {:?}..",
            self.sources.len(),
            WAIT_TIMEOUT
        );

        match self
            .sources
            .wait_timeout(&mut self.events, WAIT_TIMEOUT.into())
        {
            Ok(n) => {
                trace!(target: "net", "Woke up with {} source(s) ready", n);

                // Socket events are deferred until the command, if any,
                // has been consumed.
                let mut ready: Vec<(Ipv6Addr, bool, bool)> = Vec::with_capacity(n);

                for event in self.events.drain(..) {
                    match &event.key {
                        Source::Waker => {
                            trace!(
                                target: "net",
                                "Woken up by waker ({} command(s))",
                                commands.len()
                            );
                            popol::Waker::reset(event.source).ok();

                            // One command per wakeup; re-arm the waker so
                            // any queued remainder is seen by the next
                            // iteration.
                            if let Ok(cmd) = commands.try_recv() {
                                machine.command(cmd);
                            }
                            if !commands.is_empty() {
                                self.waker.wake().ok();
                            }
                        }
                        Source::Request(addr) => {
                            let addr = *addr;

                            if event.is_invalid() {
                                // File descriptor was closed and is invalid.
                                // Nb. This shouldn't happen. It means the source wasn't
                                // properly unregistered, or there is a duplicate source.
                                error!(target: "net", "{}: socket is invalid, removing", addr);

                                self.sources.unregister(&Source::Request(addr));
                                continue;
                            }
                            if event.is_error() || event.is_hangup() {
                                // Let the subsequent read fail.
                                trace!(target: "net", "{}: socket error triggered: {:?}", addr, event);
                            }
                            ready.push((addr, event.is_writable(), event.is_readable()));
                        }
                    }
                }
                for (addr, writable, readable) in ready {
                    if writable {
                        machine.socket_writable(&addr, &mut self.sources);
                    }
                    if readable {
                        machine.socket_readable(&addr, &mut self.sources);
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                // Backoff and lookup timers are checked by the next scan.
            }
            Err(err) => return Err(err.into()),
        }

        machine.reap();

        Ok(())
    }
}
