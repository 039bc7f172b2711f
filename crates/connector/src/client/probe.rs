//! Blocking one-shot probe of the proxy, used at daemon startup.
//!
//! The probe owns its own connection and never touches the shared request
//! queue; it runs on whichever thread calls it and retries until it
//! succeeds or is cancelled.
use std::io::{Read, Write};
use std::net::{Ipv6Addr, TcpStream};
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::Error;
use crate::common::peer::{HostsDirectory, NameDeriver};
use crate::fsm::handler::{Config, Mode};
use crate::fsm::socks;

/// Pause between failed probe rounds.
const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Synchronously verify that the proxy is reachable and can route back to
/// our own overlay address.
///
/// Blocks until a connection is fully established and returns it, or
/// fails permanently: with a randomized local address the loopback probe
/// cannot work and the call returns [`Error::LoopbackSkipped`] after the
/// first successful connect.
pub fn probe<H, D>(
    config: &Config,
    hosts: &H,
    names: &D,
    addr: &Ipv6Addr,
    cancellation: &CancellationToken,
) -> Result<TcpStream, Error>
where
    H: HostsDirectory,
    D: NameDeriver,
{
    let Some(proxy) = config.proxy else {
        return Err(Error::Disabled);
    };
    let name = hostname(config, hosts, names, addr);

    loop {
        if cancellation.is_cancelled() {
            debug!(target: "connector", "termination requested");
            return Err(Error::Terminated);
        }
        match TcpStream::connect(proxy) {
            Ok(stream) => {
                info!(target: "connector", "Connected to the proxy at {}", proxy);

                if config.rand_addr {
                    info!(target: "connector", "Loopback probe not possible with a randomized address");
                    return Err(Error::LoopbackSkipped);
                }
                match handshake(config, stream, &name) {
                    Ok(stream) => {
                        info!(target: "connector", "Proxy connection to \"{}\" ready", name);
                        return Ok(stream);
                    }
                    Err(e) => error!(target: "connector", "Proxy handshake failed: {}", e),
                }
            }
            Err(e) => {
                error!(
                    target: "connector",
                    "Could not connect to the proxy (i.e. Tor/I2P) at {}: {}. Please check!",
                    proxy, e
                );
            }
        }
        info!(target: "connector", "Restarting in a moment..");
        thread::sleep(RETRY_DELAY);
    }
}

/// Drive the configured handshake over a blocking stream.
fn handshake(config: &Config, mut stream: TcpStream, name: &str) -> Result<TcpStream, Error> {
    match config.mode {
        Mode::Socks4a => {
            let frame = socks::socks4a::connect(&config.username, name, config.dest_port);
            stream.write_all(&frame)?;

            let mut buf = [0u8; socks::socks4a::REPLY_LEN];
            stream.read_exact(&mut buf)?;
            socks::socks4a::reply(&buf)?;
        }
        Mode::Socks5 => {
            stream.write_all(&socks::socks5::greeting())?;

            let mut buf = [0u8; socks::socks5::GREETING_REPLY_LEN];
            stream.read_exact(&mut buf)?;
            socks::socks5::greeting_reply(&buf)?;

            let frame = socks::socks5::connect(name, config.dest_port)?;
            stream.write_all(&frame)?;

            let mut buf = [0u8; socks::socks5::REPLY_MAX];
            let n = stream.read(&mut buf)?;
            socks::socks5::reply(&buf[..n])?;
        }
        // Nothing to negotiate with the endpoint itself.
        Mode::Direct => {}
    }
    Ok(stream)
}

/// Our own overlay name, for the loopback request.
fn hostname<H: HostsDirectory, D: NameDeriver>(
    config: &Config,
    hosts: &H,
    names: &D,
    addr: &Ipv6Addr,
) -> String {
    if config.hosts_lookup {
        hosts.refresh();
        if let Some(name) = hosts.name(addr) {
            return name;
        }
    }
    let mut name = names.derive(addr);
    name.push_str(&config.domain);

    name
}
