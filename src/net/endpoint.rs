//! Endpoint resolution

use crate::net::error::NetError;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tokio::net::lookup_host;

/// Address and port of a remote node, as seen on the socket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            address: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.address, self.port)
    }
}

/// Resolve `address` to a socket address, picking an IPv4 result first when
/// `prefer_ipv4` is set and an IPv6 result first otherwise.
pub async fn resolve(address: &str, port: u16, prefer_ipv4: bool) -> Result<SocketAddr, NetError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let candidates: Vec<SocketAddr> = lookup_host((address, port))
        .await
        .map_err(|e| NetError::InvalidEndpoint(format!("{}: {}", address, e)))?
        .collect();

    candidates
        .iter()
        .find(|addr| addr.is_ipv4() == prefer_ipv4)
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| NetError::InvalidEndpoint(address.to_string()))
}
