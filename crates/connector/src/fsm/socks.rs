//! SOCKS wire formats. SOCKS5 is defined in RFC 1928; SOCKS4a is its
//! hostname-capable predecessor.
//!
//! The connector only ever plays the client role, only uses the CONNECT
//! command, and only offers the "no authentication" method. Frames are
//! built and parsed byte-exact; anything unexpected on the wire is an
//! error and the request is retried from scratch.

use thiserror::Error;

/// A malformed or unsuccessful SOCKS exchange.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The destination name does not fit the frame.
    #[error("destination name too long: {0} bytes")]
    NameTooLong(usize),

    /// The reply is shorter than the protocol requires.
    #[error("truncated reply: {0} of {1} bytes")]
    Truncated(usize, usize),

    /// The reply carries an unexpected version or reserved byte.
    #[error("unexpected protocol version {0}")]
    Version(u8),

    /// The proxy refused the request with the given status code.
    #[error("request rejected, reason = {0}")]
    Rejected(u8),
}

pub mod socks4a {
    //! SOCKS4a client frames.
    use super::Error;

    /// Version marker of SOCKS4 requests.
    const VERSION: u8 = 4;
    /// The CONNECT command.
    const CMD_CONNECT: u8 = 1;
    /// Status code of a granted request.
    const GRANTED: u8 = 90;
    /// Size of a SOCKS4a reply.
    pub const REPLY_LEN: usize = 8;

    /// Build a CONNECT request for a hostname destination.
    ///
    /// The invalid destination address `0.0.0.1` marks the 4a extension:
    /// it tells the proxy to read the destination from the trailing
    /// NUL-terminated hostname instead.
    pub fn connect(username: &str, host: &str, port: u16) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + username.len() + host.len());

        buf.push(VERSION);
        buf.push(CMD_CONNECT);
        buf.extend_from_slice(&port.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 1]);
        buf.extend_from_slice(username.as_bytes());
        buf.push(0);
        buf.extend_from_slice(host.as_bytes());
        buf.push(0);

        buf
    }

    /// Check a reply. Replies carry a zero version byte; status 90 means
    /// the request was granted.
    pub fn reply(buf: &[u8]) -> Result<(), Error> {
        if buf.len() < REPLY_LEN {
            return Err(Error::Truncated(buf.len(), REPLY_LEN));
        }
        if buf[0] != 0 {
            return Err(Error::Version(buf[0]));
        }
        if buf[1] != GRANTED {
            return Err(Error::Rejected(buf[1]));
        }
        Ok(())
    }
}

pub mod socks5 {
    //! SOCKS5 client frames.
    use super::Error;

    /// Protocol version marker.
    const VERSION: u8 = 5;
    /// The CONNECT command.
    const CMD_CONNECT: u8 = 1;
    /// Address type of a domain-name destination.
    const ATYP_DOMAIN: u8 = 3;
    /// The "no authentication" method.
    const METHOD_NONE: u8 = 0;
    /// Longest domain name representable in a request.
    pub const MAX_NAME_LEN: usize = 255;
    /// Size of a method-selection reply.
    pub const GREETING_REPLY_LEN: usize = 2;
    /// Largest possible reply, with a domain-name bound address.
    pub const REPLY_MAX: usize = 4 + 1 + MAX_NAME_LEN + 2;

    /// The method-selection greeting: one method offered, no
    /// authentication.
    pub fn greeting() -> [u8; 3] {
        [VERSION, 1, METHOD_NONE]
    }

    /// Check a method-selection reply.
    pub fn greeting_reply(buf: &[u8]) -> Result<(), Error> {
        if buf.len() < GREETING_REPLY_LEN {
            return Err(Error::Truncated(buf.len(), GREETING_REPLY_LEN));
        }
        if buf[0] != VERSION {
            return Err(Error::Version(buf[0]));
        }
        if buf[1] != METHOD_NONE {
            return Err(Error::Rejected(buf[1]));
        }
        Ok(())
    }

    /// Build a CONNECT request with a domain-name destination.
    pub fn connect(host: &str, port: u16) -> Result<Vec<u8>, Error> {
        if host.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong(host.len()));
        }
        let mut buf = Vec::with_capacity(7 + host.len());

        buf.push(VERSION);
        buf.push(CMD_CONNECT);
        buf.push(0);
        buf.push(ATYP_DOMAIN);
        buf.push(host.len() as u8);
        buf.extend_from_slice(host.as_bytes());
        buf.extend_from_slice(&port.to_be_bytes());

        Ok(buf)
    }

    /// Check a CONNECT reply. Only the status byte is interpreted; the
    /// bound address and port are ignored.
    pub fn reply(buf: &[u8]) -> Result<(), Error> {
        if buf.len() < 4 {
            return Err(Error::Truncated(buf.len(), 4));
        }
        if buf[0] != VERSION || buf[2] != 0 {
            return Err(Error::Version(buf[0]));
        }
        if buf[1] != 0 {
            return Err(Error::Rejected(buf[1]));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{QuickCheck, TestResult};

    /// Parse the destination back out of a SOCKS5 CONNECT request.
    fn socks5_connect_dest(buf: &[u8]) -> Option<(String, u16)> {
        if buf.len() < 7 || buf[0] != 5 || buf[1] != 1 || buf[2] != 0 || buf[3] != 3 {
            return None;
        }
        let len = buf[4] as usize;
        if buf.len() != 7 + len {
            return None;
        }
        let host = String::from_utf8(buf[5..5 + len].to_vec()).ok()?;
        let port = u16::from_be_bytes([buf[5 + len], buf[6 + len]]);

        Some((host, port))
    }

    #[test]
    fn test_socks4a_request_layout() {
        let buf = socks4a::connect("tc", "peer.onion", 8060);

        assert_eq!(&buf[..8], &[4, 1, 0x1f, 0x7c, 0, 0, 0, 1]);
        assert_eq!(&buf[8..11], b"tc\0");
        assert_eq!(&buf[11..], b"peer.onion\0");
    }

    #[test]
    fn test_socks4a_reply() {
        assert_eq!(socks4a::reply(&[0, 90, 0, 0, 0, 0, 0, 0]), Ok(()));
        assert_eq!(
            socks4a::reply(&[0, 91, 0, 0, 0, 0, 0, 0]),
            Err(Error::Rejected(91))
        );
        assert_eq!(
            socks4a::reply(&[4, 90, 0, 0, 0, 0, 0, 0]),
            Err(Error::Version(4))
        );
        assert_eq!(socks4a::reply(&[0, 90, 0]), Err(Error::Truncated(3, 8)));
    }

    #[test]
    fn test_socks5_greeting() {
        assert_eq!(socks5::greeting(), [5, 1, 0]);
        assert_eq!(socks5::greeting_reply(&[5, 0]), Ok(()));
        assert_eq!(socks5::greeting_reply(&[5, 0xff]), Err(Error::Rejected(0xff)));
        assert_eq!(socks5::greeting_reply(&[4, 0]), Err(Error::Version(4)));
        assert_eq!(socks5::greeting_reply(&[5]), Err(Error::Truncated(1, 2)));
    }

    #[test]
    fn test_socks5_reply() {
        assert_eq!(socks5::reply(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]), Ok(()));
        assert_eq!(
            socks5::reply(&[5, 4, 0, 1, 0, 0, 0, 0, 0, 0]),
            Err(Error::Rejected(4))
        );
        assert_eq!(
            socks5::reply(&[5, 0, 1, 1, 0, 0, 0, 0, 0, 0]),
            Err(Error::Version(5))
        );
        assert_eq!(socks5::reply(&[5, 0, 0]), Err(Error::Truncated(3, 4)));
    }

    #[test]
    fn test_socks5_name_too_long() {
        let host = "a".repeat(socks5::MAX_NAME_LEN + 1);

        assert_eq!(
            socks5::connect(&host, 8060),
            Err(Error::NameTooLong(socks5::MAX_NAME_LEN + 1))
        );
    }

    #[test]
    fn prop_socks5_connect_roundtrip() {
        fn prop(host: String, port: u16) -> TestResult {
            if host.len() > socks5::MAX_NAME_LEN {
                return TestResult::discard();
            }
            let buf = socks5::connect(&host, port).unwrap();

            TestResult::from_bool(socks5_connect_dest(&buf) == Some((host, port)))
        }
        QuickCheck::new()
            .tests(1000)
            .quickcheck(prop as fn(String, u16) -> TestResult);
    }
}
