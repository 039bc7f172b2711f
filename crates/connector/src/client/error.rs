//! Connector error module.
use std::io;

use thiserror::Error;

/// A client error.
#[derive(Error, Debug)]
pub enum Error {
    /// An error occuring from a connector handle.
    #[error(transparent)]
    Handle(#[from] crate::client::handle::Error),
    /// An error coming from the networking sub-system.
    #[error(transparent)]
    Net(#[from] crate::net::error::Error),
    /// An I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A protocol error during the proxy handshake.
    #[error("handshake failed: {0}")]
    Handshake(#[from] crate::fsm::socks::Error),
    /// No proxy endpoint is configured.
    #[error("connector is disabled")]
    Disabled,
    /// Probing is pointless with a randomized local address.
    #[error("loopback probe skipped: local address is randomized")]
    LoopbackSkipped,
    /// Terminated before the operation completed.
    #[error("terminated")]
    Terminated,
}
