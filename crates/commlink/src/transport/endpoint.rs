//! Transport endpoints and the any-address rewrite convention.
//!
//! Endpoints are written `tcp://host:port`. A host of `*` or `0.0.0.0` (or
//! `::`) is a wildcard: servers bind it on every interface and advertise it
//! as-is, and clients rewrite it to the host they are already connected to.

use crate::config::CommConfig;
use crate::error::{CommError, Result};
use rand::Rng;
use std::net::{SocketAddr, TcpListener};
use tracing::debug;

pub const TCP_SCHEME: &str = "tcp://";

/// True when `target` is a literal transport address rather than a
/// discovery key.
pub fn is_literal(target: &str) -> bool {
    target.starts_with(TCP_SCHEME)
}

/// A `tcp://host:port` address. Wildcard hosts (`*`, `0.0.0.0`) are kept
/// as written so they can be rewritten against a connected address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `tcp://host:port`. The port is taken after the last colon so
    /// bracketed IPv6 hosts parse too.
    ///
    /// Fails with [`CommError::InvalidEndpoint`] on any other scheme, an
    /// empty host or a port outside `u16`.
    pub fn parse(address: &str) -> Result<Self> {
        let rest = address
            .strip_prefix(TCP_SCHEME)
            .ok_or_else(|| CommError::InvalidEndpoint(address.to_string()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| CommError::InvalidEndpoint(address.to_string()))?;
        if host.is_empty() {
            return Err(CommError::InvalidEndpoint(address.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| CommError::InvalidEndpoint(address.to_string()))?;
        Ok(Self::new(host, port))
    }

    /// Endpoint of a bound or peer socket address.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::new(v4.ip().to_string(), v4.port()),
            SocketAddr::V6(v6) => Self::new(format!("[{}]", v6.ip()), v6.port()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// True for hosts that mean every local interface.
    pub fn is_any_host(&self) -> bool {
        matches!(self.host.as_str(), "*" | "0.0.0.0" | "::" | "[::]")
    }

    /// `host:port` suitable for `bind`/`connect`, with `*` mapped to IPv4 any.
    pub fn socket_addr_string(&self) -> String {
        let host = if self.host == "*" { "0.0.0.0" } else { self.host.as_str() };
        format!("{}:{}", host, self.port)
    }

    /// Replace a wildcard host with the host of `connected`, keeping the port.
    pub fn rewrite_any(&self, connected: &Endpoint) -> Endpoint {
        if self.is_any_host() {
            Endpoint::new(connected.host.clone(), self.port)
        } else {
            self.clone()
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}:{}", TCP_SCHEME, self.host, self.port)
    }
}

/// Rewrite a server-advertised address against the address the client is
/// connected through.
pub fn rewrite_any_address(advertised: &str, connected: &str) -> Result<String> {
    let advertised = Endpoint::parse(advertised)?;
    let connected = Endpoint::parse(connected)?;
    Ok(advertised.rewrite_any(&connected).to_string())
}

/// Bind a listener on `address`, or scan successive local ports when no
/// address is given.
///
/// The returned endpoint keeps the requested host (wildcards included) and
/// carries the port actually bound.
pub fn bind_listener(address: Option<&str>) -> Result<(TcpListener, Endpoint)> {
    match address {
        Some(address) => {
            let endpoint = Endpoint::parse(address)?;
            let listener = TcpListener::bind(endpoint.socket_addr_string()).map_err(|e| {
                CommError::Transport {
                    message: format!("Failed to bind {}", endpoint),
                    source: Some(e),
                }
            })?;
            let port = listener.local_addr()?.port();
            Ok((listener, Endpoint::new(endpoint.host, port)))
        }
        None => scan_local_ports(),
    }
}

fn scan_local_ports() -> Result<(TcpListener, Endpoint)> {
    let span = u32::from(CommConfig::AUTO_BIND_PORT_MAX - CommConfig::AUTO_BIND_PORT_MIN);
    let start = rand::rng().random_range(0..span);

    for attempt in 0..CommConfig::AUTO_BIND_ATTEMPTS as u32 {
        let port = CommConfig::AUTO_BIND_PORT_MIN as u32 + (start + attempt) % span;
        let endpoint = Endpoint::new(CommConfig::AUTO_BIND_HOST, port as u16);
        match TcpListener::bind(endpoint.socket_addr_string()) {
            Ok(listener) => return Ok((listener, endpoint)),
            Err(e) => debug!("Port {} unavailable: {}", port, e),
        }
    }

    Err(CommError::Transport {
        message: format!(
            "No free local port after {} attempts",
            CommConfig::AUTO_BIND_ATTEMPTS
        ),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        let endpoint = Endpoint::parse("tcp://10.0.0.5:9100").unwrap();
        assert_eq!(endpoint.host(), "10.0.0.5");
        assert_eq!(endpoint.port(), 9100);
        assert_eq!(endpoint.to_string(), "tcp://10.0.0.5:9100");
    }

    #[test]
    fn test_parse_rejects_keys_and_bad_ports() {
        assert!(Endpoint::parse("engine_control").is_err());
        assert!(Endpoint::parse("tcp://host:notaport").is_err());
        assert!(Endpoint::parse("tcp://:9000").is_err());
    }

    #[test]
    fn test_literal_detection() {
        assert!(is_literal("tcp://127.0.0.1:1"));
        assert!(!is_literal("engine"));
    }

    #[test]
    fn test_rewrite_any_keeps_port() {
        let rewritten = rewrite_any_address("tcp://*:7001", "tcp://192.168.1.20:7000").unwrap();
        assert_eq!(rewritten, "tcp://192.168.1.20:7001");
        let rewritten = rewrite_any_address("tcp://0.0.0.0:7002", "tcp://host.local:7000").unwrap();
        assert_eq!(rewritten, "tcp://host.local:7002");
    }

    #[test]
    fn test_rewrite_leaves_concrete_host() {
        let rewritten = rewrite_any_address("tcp://10.1.1.1:7001", "tcp://192.168.1.20:7000").unwrap();
        assert_eq!(rewritten, "tcp://10.1.1.1:7001");
    }

    #[test]
    fn test_wildcard_socket_addr() {
        assert_eq!(Endpoint::new("*", 80).socket_addr_string(), "0.0.0.0:80");
    }

    #[test]
    fn test_auto_bind_finds_free_port() {
        let (listener, endpoint) = bind_listener(None).unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), endpoint.port());
        assert!(endpoint.port() >= CommConfig::AUTO_BIND_PORT_MIN);
        assert!(endpoint.port() < CommConfig::AUTO_BIND_PORT_MAX);
    }

    #[test]
    fn test_bind_port_zero_reports_actual_port() {
        let (_listener, endpoint) = bind_listener(Some("tcp://127.0.0.1:0")).unwrap();
        assert_ne!(endpoint.port(), 0);
    }
}
