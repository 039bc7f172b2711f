//! Outbound SOCKS connector of the tunnelcat overlay daemon.
//!
//! tunnelcat transports IPv6 packets between peers by tunnelling each
//! peer's traffic through a SOCKS proxy into an anonymizing network such
//! as Tor or I2P. This crate implements the outbound half of that: given
//! a peer's overlay address, it opens a TCP connection through the proxy
//! (or directly, when so configured) to that peer, runs the SOCKS
//! handshake, and hands the established connection to the daemon's peer
//! registry.
//!
//! The connector is a single-threaded poll reactor. Other threads submit
//! work through a [`Handle`]:
//!
//! ```no_run
//! use std::thread;
//! use tokio_util::sync::CancellationToken;
//! use tunnelcat_connector::{common::time::LocalClock, fsm::resolver::CallbackResolver};
//! use tunnelcat_connector::{Config, Connector};
//! # use std::net::{Ipv6Addr, TcpStream};
//! # use tunnelcat_connector::common::peer::{HostsDirectory, NameDeriver, Origin, PeerRegistry};
//! # use tunnelcat_connector::fsm::resolver::ResolverService;
//! # use tunnelcat_connector::net::LocalDuration;
//! # #[derive(Clone)]
//! # struct Daemon;
//! # impl PeerRegistry for Daemon {
//! #     fn insert(&self, _: TcpStream, _: Ipv6Addr, _: bool, _: LocalDuration) {}
//! #     fn keepalive(&self, _: &Ipv6Addr) -> bool { true }
//! # }
//! # impl HostsDirectory for Daemon {
//! #     fn refresh(&self) {}
//! #     fn name(&self, _: &Ipv6Addr) -> Option<String> { None }
//! #     fn nameserver(&self) -> Option<(Ipv6Addr, Origin)> { None }
//! # }
//! # impl NameDeriver for Daemon {
//! #     fn derive(&self, _: &Ipv6Addr) -> String { String::new() }
//! # }
//! # impl ResolverService for Daemon {
//! #     fn query(&self, _: &Ipv6Addr) -> bool { false }
//! # }
//!
//! let config = Config {
//!     proxy: Some(([127, 0, 0, 1], 9050).into()),
//!     ..Config::default()
//! };
//! let resolver = Box::new(CallbackResolver::new(Daemon, Daemon));
//! let connector =
//!     Connector::new(config, Daemon, Daemon, Daemon, resolver, LocalClock).unwrap();
//!
//! let handle = connector.handle();
//! let cancellation = CancellationToken::new();
//! let token = cancellation.clone();
//!
//! thread::spawn(move || connector.run(token));
//! handle
//!     .request("fd87:d87e:eb43::1234".parse::<Ipv6Addr>().unwrap(), true)
//!     .unwrap();
//! ```
pub mod client;
pub mod common;
pub mod fsm;
pub mod net;

pub use client::{Connector, Handle};
pub use fsm::handler::{Command, Config, Mode};
