//! The connector's client library: wires the state machine, the reactor
//! and the cross-thread handle together.
mod error;
pub use error::Error;
pub mod handle;
pub use handle::Handle;
mod probe;
pub use probe::probe;

use flume as chan;
use tokio_util::sync::CancellationToken;

use crate::common::peer::{HostsDirectory, NameDeriver, PeerRegistry};
use crate::common::time::Clock;
use crate::fsm::handler::{Command, Config, StateMachine};
use crate::fsm::queue::Request;
use crate::fsm::resolver::NameResolver;
use crate::net::{Reactor, Waker};

/// A pre-wired connector: state machine, reactor and command channel.
///
/// The connector runs as a dedicated worker; the daemon's other threads
/// talk to it exclusively through cloned [`Handle`]s.
pub struct Connector<P, H, D, C> {
    machine: StateMachine<P, H, D, C>,
    reactor: Reactor,
    commands: chan::Receiver<Command>,
    handle: Handle<Waker>,
}

impl<P, H, D, C> Connector<P, H, D, C>
where
    P: PeerRegistry,
    H: HostsDirectory,
    D: NameDeriver,
    C: Clock,
{
    /// Create a new connector.
    pub fn new(
        config: Config,
        registry: P,
        hosts: H,
        names: D,
        resolver: Box<dyn NameResolver + Send>,
        clock: C,
    ) -> Result<Self, Error> {
        let (commands_tx, commands_rx) = chan::unbounded::<Command>();
        let reactor = Reactor::new()?;

        // With no proxy endpoint the connector is disabled: requests are
        // dropped at the handle.
        let enabled = config.proxy.is_some();
        let handle = Handle {
            commands: commands_tx,
            waker: reactor.waker(),
            enabled,
        };
        let machine = StateMachine::new(config, registry, hosts, names, resolver, clock);

        Ok(Self {
            machine,
            reactor,
            commands: commands_rx,
            handle,
        })
    }

    /// Create a new handle to communicate with the connector.
    pub fn handle(&self) -> Handle<Waker> {
        self.handle.clone()
    }

    /// Iterate over the outstanding requests, in queue order.
    pub fn requests(&self) -> impl Iterator<Item = &Request> {
        self.machine.requests()
    }

    /// Drive a single reactor iteration. Useful for embedders running the
    /// connector from their own loop.
    pub fn step(&mut self) -> Result<(), Error> {
        self.reactor
            .step(&mut self.machine, &self.commands)
            .map_err(Error::Net)
    }

    /// Run the connector. Blocks until cancelled; callers give it a
    /// dedicated thread.
    pub fn run(mut self, cancellation: CancellationToken) {
        let result = self
            .reactor
            .run(&mut self.machine, &self.commands, cancellation);

        if let Err(e) = result {
            tracing::error!(target: "connector", "Connector is down. Reactor run error: {}", e);
        }
    }
}
