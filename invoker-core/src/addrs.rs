//! Addresses under which this node may appear in a host list

use crate::types::Host;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Default service answering with the caller's public address
pub const DEFAULT_PUBLIC_IP_URL: &str = "https://api.ipify.org";

const PUBLIC_IP_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors while discovering node addresses
#[derive(Error, Debug)]
pub enum AddressError {
    #[error("Failed to get public IP: {0}")]
    PublicIp(#[from] reqwest::Error),

    #[error("Public IP service returned {0:?}, not an address")]
    InvalidPublicIp(String),

    #[error("Failed to list local interfaces: {0}")]
    Interfaces(#[from] std::io::Error),
}

/// The node's externally routable address plus its local IPv4 addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddresses {
    /// Identity of this node in reconciliation pages
    pub public: Host,
    /// Non-loopback IPv4 interface addresses
    pub local: Vec<Host>,
}

impl NodeAddresses {
    pub fn new(public: impl Into<Host>, local: Vec<Host>) -> Self {
        Self {
            public: public.into(),
            local,
        }
    }

    /// Public address first, then local ones
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.public.as_str()).chain(self.local.iter().map(String::as_str))
    }

    pub fn contains(&self, host: &str) -> bool {
        self.iter().any(|addr| addr == host)
    }

    /// True if any entry of `hosts` is one of this node's addresses
    pub fn is_listed_in(&self, hosts: &[Host]) -> bool {
        self.position_in(hosts).is_some()
    }

    /// Index of the first entry of `hosts` naming this node
    pub fn position_in(&self, hosts: &[Host]) -> Option<usize> {
        hosts.iter().position(|h| self.contains(h))
    }

    /// Query the public address and enumerate local interfaces
    pub async fn discover(public_ip_url: &str) -> Result<Self, AddressError> {
        let public = public_ip(public_ip_url).await?;
        let local = local_ipv4_addrs()?;
        info!("Addrs: public={} local={:?}", public, local);
        Ok(Self { public, local })
    }
}

/// Ask an HTTP echo service for this node's public address
pub async fn public_ip(url: &str) -> Result<Host, AddressError> {
    let client = reqwest::Client::builder().timeout(PUBLIC_IP_TIMEOUT).build()?;
    let body = client.get(url).send().await?.error_for_status()?.text().await?;
    let ip = body.trim();

    debug!("Addrs: {} answered {:?}", url, ip);
    match ip.parse::<IpAddr>() {
        Ok(addr) => Ok(addr.to_string()),
        Err(_) => Err(AddressError::InvalidPublicIp(ip.to_string())),
    }
}

/// All non-loopback IPv4 interface addresses
pub fn local_ipv4_addrs() -> Result<Vec<Host>, AddressError> {
    let addrs = if_addrs::get_if_addrs()?
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(v4) => Some(v4.to_string()),
            IpAddr::V6(_) => None,
        })
        .collect();
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_public_and_local() {
        let addrs = NodeAddresses::new("34.1.2.3", vec!["10.0.0.1".to_string()]);
        assert!(addrs.contains("34.1.2.3"));
        assert!(addrs.contains("10.0.0.1"));
        assert!(!addrs.contains("10.0.0.2"));

        let hosts = vec!["10.0.0.2".to_string(), "10.0.0.1".to_string()];
        assert!(addrs.is_listed_in(&hosts));
        assert!(!addrs.is_listed_in(&["10.0.0.3".to_string()]));
    }

    #[test]
    fn test_local_addrs_skip_loopback() {
        let addrs = local_ipv4_addrs().unwrap();
        assert!(addrs.iter().all(|a| a != "127.0.0.1"));
        assert!(addrs.iter().all(|a| a.parse::<std::net::Ipv4Addr>().is_ok()));
    }
}
