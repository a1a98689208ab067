//! Address ranges accepted by the sweep, plus local subnet detection.

use crate::error::DiscoveryError;
use if_addrs::{get_if_addrs, IfAddr};
use std::fmt;
use std::net::Ipv4Addr;
use tracing::debug;

const MIN_PREFIX: u8 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressRange {
    /// A single address or hostname.
    Host(String),
    /// IPv4 CIDR block, prefix between /24 and /32.
    Block { network: Ipv4Addr, prefix: u8 },
}

impl AddressRange {
    pub fn parse(raw: &str) -> Result<Self, DiscoveryError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(DiscoveryError::Validation("network range is empty".into()));
        }

        let Some((addr, prefix)) = raw.split_once('/') else {
            if raw.contains(char::is_whitespace) {
                return Err(DiscoveryError::Validation(format!("invalid host '{raw}'")));
            }
            return Ok(AddressRange::Host(raw.to_string()));
        };

        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| DiscoveryError::Validation(format!("invalid network address '{addr}'")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| DiscoveryError::Validation(format!("invalid prefix '{prefix}'")))?;
        if !(MIN_PREFIX..=32).contains(&prefix) {
            return Err(DiscoveryError::Validation(format!(
                "prefix /{prefix} is outside /{MIN_PREFIX}../32"
            )));
        }
        Ok(AddressRange::Block {
            network: mask(addr, prefix),
            prefix,
        })
    }

    /// Addresses to probe. Blocks wider than /31 skip network and broadcast.
    pub fn hosts(&self) -> Vec<String> {
        match self {
            AddressRange::Host(host) => vec![host.clone()],
            AddressRange::Block { network, prefix } => {
                let base = u32::from(*network);
                let size = 1u32 << (32 - u32::from(*prefix));
                let span = if *prefix >= 31 { 0..size } else { 1..size - 1 };
                span.map(|offset| Ipv4Addr::from(base + offset).to_string())
                    .collect()
            }
        }
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressRange::Host(host) => f.write_str(host),
            AddressRange::Block { network, prefix } => write!(f, "{network}/{prefix}"),
        }
    }
}

fn mask(addr: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    let bits = u32::MAX << (32 - u32::from(prefix));
    Ipv4Addr::from(u32::from(addr) & bits)
}

pub fn fallback_range() -> AddressRange {
    AddressRange::Block {
        network: Ipv4Addr::new(192, 168, 1, 0),
        prefix: 24,
    }
}

/// The /24 around the first non-loopback, non-link-local IPv4 interface.
pub fn local_subnet() -> Result<Option<AddressRange>, DiscoveryError> {
    for iface in get_if_addrs()? {
        if iface.is_loopback() {
            continue;
        }
        if let IfAddr::V4(v4) = &iface.addr {
            if v4.ip.is_link_local() {
                continue;
            }
            debug!(interface = %iface.name, ip = %v4.ip, "local subnet detected");
            return Ok(Some(AddressRange::Block {
                network: mask(v4.ip, 24),
                prefix: 24,
            }));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slash_24_skips_network_and_broadcast() {
        let range = AddressRange::parse("10.0.5.77/24").unwrap();
        assert_eq!(range.to_string(), "10.0.5.0/24");
        let hosts = range.hosts();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts.first().map(String::as_str), Some("10.0.5.1"));
        assert_eq!(hosts.last().map(String::as_str), Some("10.0.5.254"));
    }

    #[test]
    fn test_narrow_blocks() {
        assert_eq!(AddressRange::parse("10.0.0.9/32").unwrap().hosts(), vec!["10.0.0.9"]);
        assert_eq!(AddressRange::parse("10.0.0.8/31").unwrap().hosts().len(), 2);
        assert_eq!(AddressRange::parse("10.0.0.0/30").unwrap().hosts(), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_hosts_pass_through() {
        assert_eq!(
            AddressRange::parse("broker.local").unwrap(),
            AddressRange::Host("broker.local".into())
        );
        assert_eq!(AddressRange::parse("::1").unwrap().hosts(), vec!["::1"]);
    }

    #[test]
    fn test_invalid_ranges() {
        for raw in ["", "10.0.0.0/16", "10.0.0.0/33", "nope/24", "10.0.0.0/x", "two words"] {
            assert!(
                matches!(AddressRange::parse(raw), Err(DiscoveryError::Validation(_))),
                "{raw} should be rejected"
            );
        }
    }
}
