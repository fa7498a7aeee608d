//! Endpoint management
use crate::{RegistryError, Result};
use if_addrs::IfAddr;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TTL: u64 = 10;
pub const DEFAULT_NETWORK: &str = "tcp";

/// Network location of a service instance.
///
/// `addr` is a `host:port` string; IPv6 hosts must be bracketed (`[::1]:9000`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub addr: String,
    /// Liveness budget in seconds for lease-based stores
    pub ttl: u64,
    pub network: String,
    pub tls: bool,
    pub key_file: Option<String>,
    pub cert_file: Option<String>,
    pub ca_file: Option<String>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            addr: ":8080".to_string(),
            ttl: DEFAULT_TTL,
            network: DEFAULT_NETWORK.to_string(),
            tls: false,
            key_file: None,
            cert_file: None,
            ca_file: None,
        }
    }
}

impl Endpoint {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    /// Host part of the address, empty for `:port` forms
    pub fn host(&self) -> &str {
        match self.addr.rsplit_once(':') {
            Some((host, _)) => host,
            None => &self.addr,
        }
    }

    /// Port part of the address; an address without a port means 80
    pub fn port(&self) -> Result<u16> {
        match self.addr.rsplit_once(':') {
            Some((_, port)) => port
                .parse::<u16>()
                .map_err(|_| RegistryError::InvalidAddress(self.addr.clone())),
            None => Ok(80),
        }
    }

    pub fn has_unspecified_host(&self) -> bool {
        matches!(self.host(), "" | "0.0.0.0" | "::" | "[::]")
    }

    /// Host other instances can reach, substituting a local interface
    /// address for wildcard binds.
    pub fn advertise_host(&self) -> String {
        if self.has_unspecified_host() {
            local_ip()
        } else {
            self.host().to_string()
        }
    }
}

/// First non-loopback IPv4 interface address, or `0.0.0.0`
pub fn local_ip() -> String {
    if_addrs::get_if_addrs()
        .ok()
        .and_then(|addrs| {
            addrs
                .into_iter()
                .find(|iface| !iface.is_loopback() && matches!(iface.addr, IfAddr::V4(_)))
                .and_then(|iface| match iface.addr {
                    IfAddr::V4(addr) => Some(addr.ip.to_string()),
                    _ => None,
                })
        })
        .unwrap_or_else(|| "0.0.0.0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoint() {
        let ep = Endpoint::default();
        assert_eq!(ep.addr, ":8080");
        assert_eq!(ep.ttl, 10);
        assert_eq!(ep.network, "tcp");
        assert!(!ep.tls);
    }

    #[test]
    fn test_host_and_port() {
        let ep = Endpoint::new("10.0.0.1:9000");
        assert_eq!(ep.host(), "10.0.0.1");
        assert_eq!(ep.port().unwrap(), 9000);

        let ep = Endpoint::new("[::1]:7000");
        assert_eq!(ep.host(), "[::1]");
        assert_eq!(ep.port().unwrap(), 7000);
    }

    #[test]
    fn test_missing_port_defaults_to_80() {
        let ep = Endpoint::new("example.internal");
        assert_eq!(ep.host(), "example.internal");
        assert_eq!(ep.port().unwrap(), 80);
    }

    #[test]
    fn test_bad_port_is_invalid_address() {
        let ep = Endpoint::new("10.0.0.1:http");
        assert!(matches!(ep.port(), Err(RegistryError::InvalidAddress(_))));
    }

    #[test]
    fn test_unspecified_host() {
        assert!(Endpoint::new(":8080").has_unspecified_host());
        assert!(Endpoint::new("0.0.0.0:8080").has_unspecified_host());
        assert!(!Endpoint::new("127.0.0.1:8080").has_unspecified_host());
        assert_eq!(Endpoint::new("127.0.0.1:8080").advertise_host(), "127.0.0.1");
        assert!(!Endpoint::new(":8080").advertise_host().is_empty());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let ep: Endpoint = serde_json::from_str(r#"{"addr":"10.0.0.2:80"}"#).unwrap();
        assert_eq!(ep.ttl, DEFAULT_TTL);
        assert_eq!(ep.network, DEFAULT_NETWORK);
    }
}
