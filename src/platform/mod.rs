//! Platform virtual-interface API
//!
//! The platform materializes the virtual interface and hands back its
//! descriptor. It also lets the tunnel engine exempt its own sockets from
//! being routed into that interface.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::os::fd::{OwnedFd, RawFd};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::TunPlatform;

/// Everything the platform needs to build the interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSpec {
    pub name: String,
    pub mtu: u16,
    pub address: Ipv4Addr,
    pub prefix_length: u8,
    pub routes: Vec<Ipv4Net>,
    pub dns_servers: Vec<Ipv4Addr>,
}

impl InterfaceSpec {
    /// Netmask matching `prefix_length`
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Net::new(self.address, self.prefix_length)
            .map(|net| net.netmask())
            .unwrap_or(Ipv4Addr::BROADCAST)
    }
}

/// Platform virtual-interface operations
pub trait VirtualInterfacePlatform: Send + Sync {
    /// Materialize the interface; `None` when the platform refuses
    fn establish(&self, spec: &InterfaceSpec) -> Option<OwnedFd>;

    /// Exempt a socket from routing through the interface
    fn protect(&self, fd: RawFd) -> bool;

    /// Undo side effects of `establish` once the descriptor is closed
    fn release(&self, _spec: &InterfaceSpec) {}
}
