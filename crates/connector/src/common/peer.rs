//! Contracts between the connector and the rest of the daemon.

use std::net::{Ipv6Addr, TcpStream};
use std::sync::Arc;

use crate::net::LocalDuration;

/// Provenance of a hosts-db or nameserver entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Parsed from the local hosts file.
    Hosts,
    /// Learned from a remote nameserver.
    Network,
    /// Statically configured.
    Config,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hosts => write!(f, "hosts"),
            Self::Network => write!(f, "network"),
            Self::Config => write!(f, "config"),
        }
    }
}

/// The daemon's table of established tunnels.
///
/// The connector hands every successfully negotiated connection over to
/// the registry, which owns it from that point on. Locking is internal to
/// the registry; the connector never holds its locks across a blocking
/// call.
pub trait PeerRegistry {
    /// Take ownership of an established connection, together with the
    /// request metadata and the time the connect took.
    fn insert(&self, stream: TcpStream, addr: Ipv6Addr, permanent: bool, elapsed: LocalDuration);

    /// Send the initial keepalive to a previously inserted peer.
    ///
    /// Returns `false` if the peer is unknown to the registry.
    fn keepalive(&self, addr: &Ipv6Addr) -> bool;
}

/// The daemon's hosts database.
///
/// Stores overlay names keyed by address, and the nameservers usable for
/// reverse lookups. Shared across threads; implementations synchronize
/// internally.
pub trait HostsDirectory {
    /// Reload the backing file if it changed on disk.
    fn refresh(&self);

    /// Look up the overlay name stored for an address.
    fn name(&self, addr: &Ipv6Addr) -> Option<String>;

    /// Pick a nameserver usable for reverse lookups.
    fn nameserver(&self) -> Option<(Ipv6Addr, Origin)>;
}

/// Deterministic derivation of an overlay name from a peer address.
///
/// The derived name is the short form, without the configured domain
/// suffix.
pub trait NameDeriver {
    /// Derive the overlay name of `addr`.
    fn derive(&self, addr: &Ipv6Addr) -> String;
}

impl<T: PeerRegistry + ?Sized> PeerRegistry for Arc<T> {
    fn insert(&self, stream: TcpStream, addr: Ipv6Addr, permanent: bool, elapsed: LocalDuration) {
        self.as_ref().insert(stream, addr, permanent, elapsed)
    }

    fn keepalive(&self, addr: &Ipv6Addr) -> bool {
        self.as_ref().keepalive(addr)
    }
}

impl<T: HostsDirectory + ?Sized> HostsDirectory for Arc<T> {
    fn refresh(&self) {
        self.as_ref().refresh()
    }

    fn name(&self, addr: &Ipv6Addr) -> Option<String> {
        self.as_ref().name(addr)
    }

    fn nameserver(&self) -> Option<(Ipv6Addr, Origin)> {
        self.as_ref().nameserver()
    }
}

impl<T: NameDeriver + ?Sized> NameDeriver for Arc<T> {
    fn derive(&self, addr: &Ipv6Addr) -> String {
        self.as_ref().derive(addr)
    }
}
