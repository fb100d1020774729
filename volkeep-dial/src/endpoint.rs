//! Endpoint address parsing.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::DialError;

pub(crate) const UNIX_PREFIX: &str = "unix://";
const TCP_PREFIX: &str = "tcp://";

/// Transport scheme of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Unix-domain socket; the address is a filesystem path.
    Unix,
    /// TCP; the address is `host:port`.
    Tcp,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unix => "unix",
            Self::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved endpoint: transport scheme plus connection target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: Scheme,
    address: String,
}

impl Endpoint {
    /// Parse `unix://<path>`, `tcp://<host>:<port>` or `<host>:<port>`.
    pub fn parse(endpoint: &str) -> Result<Self, DialError> {
        if let Some(path) = endpoint.strip_prefix(UNIX_PREFIX) {
            if path.is_empty() {
                return Err(DialError::invalid_endpoint(endpoint));
            }
            return Ok(Self {
                scheme: Scheme::Unix,
                address: path.to_string(),
            });
        }

        let address = match endpoint.strip_prefix(TCP_PREFIX) {
            Some(address) => address,
            None if endpoint.contains("://") => return Err(DialError::invalid_endpoint(endpoint)),
            None => endpoint,
        };

        if !is_host_port(address) {
            return Err(DialError::invalid_endpoint(endpoint));
        }

        Ok(Self {
            scheme: Scheme::Tcp,
            address: address.to_string(),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Connection target: a socket path for Unix, `host:port` for TCP.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Socket path of a Unix endpoint.
    pub fn path(&self) -> Option<&Path> {
        match self.scheme {
            Scheme::Unix => Some(Path::new(&self.address)),
            Scheme::Tcp => None,
        }
    }

    /// Unix-domain endpoints never leave the host.
    pub fn is_local(&self) -> bool {
        self.scheme == Scheme::Unix
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address)
    }
}

impl FromStr for Endpoint {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// `host:port` with a non-empty host and a valid u16 port. IPv6 hosts must be
/// bracketed.
fn is_host_port(address: &str) -> bool {
    let Some((host, port)) = address.rsplit_once(':') else {
        return false;
    };
    if port.parse::<u16>().is_err() {
        return false;
    }
    if let Some(inner) = host.strip_prefix('[') {
        return inner.strip_suffix(']').is_some_and(|h| !h.is_empty());
    }
    !host.is_empty() && !host.contains(':') && !host.contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_unix_absolute_path() {
        let endpoint = Endpoint::parse("unix:///var/run/csi/csi.sock").unwrap();
        assert_eq!(endpoint.scheme(), Scheme::Unix);
        assert_eq!(endpoint.address(), "/var/run/csi/csi.sock");
        assert_eq!(endpoint.path(), Some(Path::new("/var/run/csi/csi.sock")));
        assert!(endpoint.is_local());
    }

    #[test]
    fn parse_unix_relative_path() {
        let endpoint = Endpoint::parse("unix://csi.sock").unwrap();
        assert_eq!(endpoint.address(), "csi.sock");
    }

    #[test]
    fn parse_unix_empty_path() {
        assert!(Endpoint::parse("unix://").is_err());
    }

    #[test]
    fn parse_tcp_scheme() {
        let endpoint = Endpoint::parse("tcp://127.0.0.1:10000").unwrap();
        assert_eq!(endpoint.scheme(), Scheme::Tcp);
        assert_eq!(endpoint.address(), "127.0.0.1:10000");
        assert!(!endpoint.is_local());
        assert_eq!(endpoint.path(), None);
    }

    #[test]
    fn parse_bare_host_port_defaults_to_tcp() {
        let endpoint = Endpoint::parse("10.0.0.1:50051").unwrap();
        assert_eq!(endpoint.scheme(), Scheme::Tcp);
        assert_eq!(endpoint.address(), "10.0.0.1:50051");
    }

    #[test]
    fn parse_hostname_and_ipv6() {
        assert!(Endpoint::parse("controller.local:9000").is_ok());
        let endpoint = Endpoint::parse("tcp://[::1]:50051").unwrap();
        assert_eq!(endpoint.address(), "[::1]:50051");
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        let err = Endpoint::parse("http://localhost:80").unwrap_err();
        assert!(matches!(err, DialError::InvalidEndpoint { .. }));
    }

    #[test]
    fn parse_rejects_missing_or_bad_port() {
        assert!(Endpoint::parse("localhost").is_err());
        assert!(Endpoint::parse("tcp://localhost:").is_err());
        assert!(Endpoint::parse("localhost:notaport").is_err());
        assert!(Endpoint::parse("localhost:99999").is_err());
        assert!(Endpoint::parse(":50051").is_err());
        assert!(Endpoint::parse("::1:50051").is_err());
    }

    #[test]
    fn display_is_canonical() {
        let endpoint: Endpoint = "10.0.0.1:50051".parse().unwrap();
        assert_eq!(endpoint.to_string(), "tcp://10.0.0.1:50051");
        let endpoint: Endpoint = "unix:///tmp/s.sock".parse().unwrap();
        assert_eq!(endpoint.to_string(), "unix:///tmp/s.sock");
    }
}
