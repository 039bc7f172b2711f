//! Connector handles are cloned into the daemon's other threads to post
//! work to the reactor.
use std::fs::File;
use std::net::Ipv6Addr;

use flume as chan;
use thiserror::Error;
use tracing::debug;

use crate::fsm::handler::Command;
use crate::net::NetWaker;

/// An error resulting from a handle method.
#[derive(Error, Debug)]
pub enum Error {
    /// The command channel disconnected.
    #[error("command channel disconnected")]
    Disconnected,
    /// An I/O error occured.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl<T> From<chan::SendError<T>> for Error {
    fn from(_: chan::SendError<T>) -> Self {
        Self::Disconnected
    }
}

/// A handle for communicating with the connector.
///
/// Cheap to clone. All methods return quickly; the actual work happens on
/// the reactor thread.
#[derive(Clone)]
pub struct Handle<W: NetWaker> {
    pub(crate) commands: chan::Sender<Command>,
    pub(crate) waker: W,
    pub(crate) enabled: bool,
}

impl<W: NetWaker> Handle<W> {
    /// Send a command to the command channel, and wake up the event loop.
    fn command(&self, cmd: Command) -> Result<(), Error> {
        self.commands.send(cmd)?;
        self.waker.wake()?;

        Ok(())
    }

    /// Request an outbound connection to `addr`.
    ///
    /// Duplicate requests are ignored by the reactor. When the connector
    /// is disabled, requests are silently dropped.
    pub fn request(&self, addr: Ipv6Addr, permanent: bool) -> Result<(), Error> {
        if !self.enabled {
            debug!(target: "connector", "{}: connector disabled, dropping request", addr);
            return Ok(());
        }
        debug!(target: "connector", "{}: queueing connection request", addr);

        self.command(Command::Connect { addr, permanent })
    }

    /// Force a reactor pass.
    ///
    /// Resolver services use this to signal that the hosts db changed.
    pub fn wake(&self) -> Result<(), Error> {
        self.command(Command::Wakeup)
    }

    /// Ask the reactor to write a dump of its queue, one line per entry
    /// followed by a NUL byte, to the given stream.
    pub fn dump_queue(&self, out: File) -> Result<(), Error> {
        self.command(Command::DumpQueue(out))
    }
}
