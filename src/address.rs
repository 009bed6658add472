//! Private address selection for the virtual interface
//!
//! Four fixed private blocks are candidates. Any block that already holds
//! an address bound on the host is skipped so the virtual interface never
//! collides with an existing route.

use crate::error::{Result, VpnError};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Address plan for one interface establishment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateAddress {
    /// Address assigned to the virtual interface
    pub interface_ip: Ipv4Addr,
    /// Base of the routed subnet
    pub subnet_base: Ipv4Addr,
    pub prefix_length: u8,
    /// Gateway and DNS address served by the packet router
    pub router_ip: Ipv4Addr,
}

impl PrivateAddress {
    const fn new(a: u8, b: u8, c: u8, prefix_length: u8) -> Self {
        Self {
            interface_ip: Ipv4Addr::new(a, b, c, 1),
            subnet_base: Ipv4Addr::new(a, b, c, 0),
            prefix_length,
            router_ip: Ipv4Addr::new(a, b, c, 2),
        }
    }

    /// The routed subnet
    pub fn subnet(&self) -> Ipv4Net {
        // Candidate prefixes are all <= 32
        Ipv4Net::new(self.subnet_base, self.prefix_length)
            .unwrap_or_else(|_| Ipv4Net::from(self.subnet_base))
    }

    /// Range that disqualifies this block when a host address falls in it
    fn reserved_range(&self) -> Ipv4Net {
        if self.subnet_base.is_link_local() {
            // Hosts bind link-local addresses anywhere in 169.254/16
            Ipv4Net::new(Ipv4Addr::new(169, 254, 0, 0), 16).unwrap_or_else(|_| self.subnet())
        } else {
            self.subnet()
        }
    }
}

impl std::fmt::Display for PrivateAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} (router {})",
            self.interface_ip, self.prefix_length, self.router_ip
        )
    }
}

/// Candidate blocks in priority order
pub const CANDIDATES: [PrivateAddress; 4] = [
    PrivateAddress::new(10, 0, 0, 8),
    PrivateAddress::new(172, 16, 0, 12),
    PrivateAddress::new(192, 168, 0, 16),
    PrivateAddress::new(169, 254, 1, 24),
];

/// Pick a block using the addresses currently bound on the host
pub fn select() -> Result<PrivateAddress> {
    let host_addresses = host_ipv4_addresses()?;
    select_from(&host_addresses)
}

/// Pick the first candidate whose range holds none of `host_addresses`
pub fn select_from(host_addresses: &[Ipv4Addr]) -> Result<PrivateAddress> {
    let mut eligible = CANDIDATES.to_vec();
    for address in host_addresses {
        eligible.retain(|candidate| !candidate.reserved_range().contains(address));
    }

    eligible.first().copied().ok_or_else(|| {
        VpnError::NoAddressAvailable("every private block is in use on this host".to_string())
    })
}

/// Enumerate IPv4 addresses bound to every host interface
pub fn host_ipv4_addresses() -> Result<Vec<Ipv4Addr>> {
    let interfaces = local_ip_address::list_afinet_netifas().map_err(|e| {
        VpnError::NoAddressAvailable(format!("failed to enumerate interfaces: {e}"))
    })?;

    if interfaces.is_empty() {
        return Err(VpnError::NoAddressAvailable(
            "no network interfaces visible".to_string(),
        ));
    }

    let addresses: Vec<Ipv4Addr> = interfaces
        .into_iter()
        .filter_map(|(name, ip)| match ip {
            std::net::IpAddr::V4(v4) => {
                log::trace!("Host address {v4} on {name}");
                Some(v4)
            }
            std::net::IpAddr::V6(_) => None,
        })
        .collect();

    Ok(addresses)
}
