//! Connector networking errors.

use std::io;

use thiserror::Error;

/// An error occuring in the connector's networking code.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A system resolver error.
    #[error("name resolution error: {0}")]
    Resolve(#[from] trust_dns_resolver::error::ResolveError),

    /// A channel send or receive error.
    #[error("channel error: {0}")]
    Channel(Box<dyn std::error::Error + Send + Sync + 'static>),
}
