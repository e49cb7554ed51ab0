//! Network endpoint: a URL kept verbatim plus its resolved socket address.

use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{Error, Result};

/// A remote endpoint.
///
/// The URL string is preserved exactly as configured or as returned by
/// discovery; only the `host:port` tail is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: String,
    addr: SocketAddr,
}

impl Endpoint {
    /// Parse a `scheme://host:port` URL.
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
        let port: u16 = port.parse().map_err(|_| Error::InvalidUrl(url.to_string()))?;
        if host.is_empty() {
            return Err(Error::InvalidUrl(url.to_string()));
        }
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| Error::InvalidUrl(url.to_string()))?
            .next()
            .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
        Ok(Self { url: url.to_string(), addr })
    }

    /// The original URL string.
    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The resolved socket address.
    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_preserves_url() {
        let ep = Endpoint::parse("tcp://127.0.0.1:9000").unwrap();
        assert_eq!(ep.url(), "tcp://127.0.0.1:9000");
        assert_eq!(ep.addr().port(), 9000);
        assert!(ep.addr().ip().is_loopback());
    }

    #[test]
    fn test_parse_custom_scheme() {
        // Discovery hands back whatever scheme the server advertises; only
        // host and port matter to the transport.
        let ep = Endpoint::parse("tcp+bench://127.0.0.1:9").unwrap();
        assert_eq!(ep.url(), "tcp+bench://127.0.0.1:9");
        assert_eq!(ep.addr().port(), 9);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Endpoint::parse("not a url").is_err());
        assert!(Endpoint::parse("tcp://").is_err());
        assert!(Endpoint::parse("tcp://127.0.0.1").is_err());
        assert!(Endpoint::parse("tcp://127.0.0.1:notaport").is_err());
        assert!(Endpoint::parse("tcp://:9000").is_err());
    }
}
