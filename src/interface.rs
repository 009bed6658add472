//! Virtual interface and packet routing manager
//!
//! The manager exclusively owns the interface descriptor and the packet
//! router's thread. Routing can be started and stopped many times while one
//! interface stays established, so every routing cycle receives its own
//! duplicate of the descriptor; the router closes that copy when it exits and
//! the original stays with the manager until teardown.

use crate::address::{self, PrivateAddress};
use crate::config::Config;
use crate::error::{Result, VpnError};
use crate::platform::{InterfaceSpec, VirtualInterfacePlatform};
use crate::router::{PacketRouter, RouterParams, RouterShutdown};
use ipnet::Ipv4Net;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

/// Set while an `InterfaceRoutingManager` is alive in this process
static MANAGER_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Constant interface and routing parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingSettings {
    pub interface_name: String,
    pub mtu: u16,
    pub netmask: Ipv4Addr,
    pub proxy_host: Ipv4Addr,
    pub secondary_proxy_address: SocketAddrV4,
    pub transparent_dns: bool,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for RoutingSettings {
    fn from(config: &Config) -> Self {
        Self {
            interface_name: config.interface.name.clone(),
            mtu: config.interface.mtu,
            netmask: config.interface.netmask,
            proxy_host: config.routing.proxy_host,
            secondary_proxy_address: config.routing.secondary_proxy_address,
            transparent_dns: config.routing.transparent_dns,
        }
    }
}

/// Handle the engine uses to keep its own sockets out of the tunnel
#[derive(Clone)]
pub struct SocketProtector {
    platform: Arc<dyn VirtualInterfacePlatform>,
}

impl SocketProtector {
    pub fn new(platform: Arc<dyn VirtualInterfacePlatform>) -> Self {
        Self { platform }
    }

    pub fn protect(&self, fd: RawFd) -> bool {
        self.platform.protect(fd)
    }
}

impl std::fmt::Debug for SocketProtector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketProtector").finish_non_exhaustive()
    }
}

/// A running packet router
struct RouterThread {
    shutdown: Arc<RouterShutdown>,
    thread: JoinHandle<()>,
    proxy_address: SocketAddrV4,
}

/// Everything owned for one established interface
struct RoutingHandle {
    interface_fd: OwnedFd,
    address: PrivateAddress,
    spec: InterfaceSpec,
    router: Option<RouterThread>,
}

impl RoutingHandle {
    /// Forget a router whose thread ended without being terminated
    fn reap_exited_router(&mut self) {
        if !self.router.as_ref().is_some_and(|r| r.thread.is_finished()) {
            return;
        }
        if let Some(router) = self.router.take() {
            log::warn!(
                "Packet router for {} exited on its own",
                router.proxy_address
            );
            InterfaceRoutingManager::join_router(router);
        }
    }
}

type AddressSelector = fn() -> Result<PrivateAddress>;

/// Owner of the virtual interface and the packet router
pub struct InterfaceRoutingManager {
    platform: Arc<dyn VirtualInterfacePlatform>,
    router: Arc<dyn PacketRouter>,
    settings: RoutingSettings,
    selector: AddressSelector,
    handle: Mutex<Option<RoutingHandle>>,
}

impl InterfaceRoutingManager {
    /// Take the process-wide manager slot
    ///
    /// # Errors
    /// Returns `AlreadyActive` while another manager is alive.
    pub fn acquire(
        platform: Arc<dyn VirtualInterfacePlatform>,
        router: Arc<dyn PacketRouter>,
        settings: RoutingSettings,
    ) -> Result<Self> {
        if MANAGER_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(VpnError::AlreadyActive);
        }

        Ok(Self {
            platform,
            router,
            settings,
            selector: address::select,
            handle: Mutex::new(None),
        })
    }

    /// Replace the host address probe used by `establish`
    pub fn with_address_selector(mut self, selector: AddressSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn settings(&self) -> &RoutingSettings {
        &self.settings
    }

    /// Protector bound to this manager's platform
    pub fn protector(&self) -> SocketProtector {
        SocketProtector::new(Arc::clone(&self.platform))
    }

    /// Establish the virtual interface
    ///
    /// # Errors
    /// `NoAddressAvailable` when every private block is taken,
    /// `PermissionRevoked` when the platform refuses, `InvalidState` when an
    /// interface is already established.
    pub fn establish(&self) -> Result<PrivateAddress> {
        let mut handle = self.lock();
        if handle.is_some() {
            return Err(VpnError::InvalidState(
                "virtual interface already established".to_string(),
            ));
        }

        let address = (self.selector)()?;
        let spec = InterfaceSpec {
            name: self.settings.interface_name.clone(),
            mtu: self.settings.mtu,
            address: address.interface_ip,
            prefix_length: address.prefix_length,
            routes: vec![Ipv4Net::default(), address.subnet()],
            dns_servers: vec![address.router_ip],
        };

        let interface_fd = self.platform.establish(&spec).ok_or_else(|| {
            VpnError::PermissionRevoked(format!(
                "platform refused to establish {}",
                spec.name
            ))
        })?;

        log::info!("Virtual interface established with {address}");
        *handle = Some(RoutingHandle {
            interface_fd,
            address,
            spec,
            router: None,
        });
        Ok(address)
    }

    /// Stop routing and release the interface; safe to call at any time
    pub fn teardown(&self) {
        let mut guard = self.lock();
        let Some(mut handle) = guard.take() else {
            return;
        };

        if let Some(router) = handle.router.take() {
            Self::join_router(router);
        }

        close_descriptor(handle.interface_fd);
        self.platform.release(&handle.spec);
        log::info!("Virtual interface {} torn down", handle.spec.name);
    }

    /// Start the packet router against `local_proxy_port`
    ///
    /// Returns whether a router was started. Missing interface, port 0, or an
    /// already running router are logged and ignored.
    pub fn start_routing(&self, local_proxy_port: u16) -> bool {
        let mut guard = self.lock();
        let Some(handle) = guard.as_mut() else {
            log::warn!("Cannot start routing: no interface established");
            return false;
        };
        if local_proxy_port == 0 {
            log::warn!("Cannot start routing: invalid local proxy port");
            return false;
        }
        handle.reap_exited_router();
        if handle.router.is_some() {
            log::debug!("Routing already active");
            return false;
        }

        let router_fd = match handle.interface_fd.try_clone() {
            Ok(fd) => fd,
            Err(e) => {
                log::error!("Failed to duplicate interface descriptor: {e}");
                return false;
            }
        };

        let proxy_address = SocketAddrV4::new(self.settings.proxy_host, local_proxy_port);
        let params = RouterParams {
            interface_fd: router_fd,
            mtu: self.settings.mtu,
            router_address: handle.address.router_ip,
            netmask: self.settings.netmask,
            proxy_address,
            secondary_proxy_address: self.settings.secondary_proxy_address,
            transparent_dns: self.settings.transparent_dns,
        };

        let shutdown = Arc::new(RouterShutdown::new());
        let router = Arc::clone(&self.router);
        let thread_shutdown = Arc::clone(&shutdown);
        let spawned = std::thread::Builder::new()
            .name("packet-router".to_string())
            .spawn(move || {
                if let Err(e) = router.run(params, &thread_shutdown) {
                    log::error!("Packet router stopped: {e}");
                }
            });

        match spawned {
            Ok(thread) => {
                log::info!("Routing through proxy {proxy_address}");
                handle.router = Some(RouterThread {
                    shutdown,
                    thread,
                    proxy_address,
                });
                true
            }
            Err(e) => {
                log::error!("Failed to spawn packet router thread: {e}");
                false
            }
        }
    }

    /// Stop the packet router and wait for its thread to exit
    pub fn stop_routing(&self) -> bool {
        let mut guard = self.lock();
        let Some(router) = guard.as_mut().and_then(|h| h.router.take()) else {
            return false;
        };
        Self::join_router(router);
        true
    }

    pub fn is_established(&self) -> bool {
        self.lock().is_some()
    }

    pub fn is_routing(&self) -> bool {
        self.lock().as_mut().is_some_and(|h| {
            h.reap_exited_router();
            h.router.is_some()
        })
    }

    /// Address plan of the established interface
    pub fn private_address(&self) -> Option<PrivateAddress> {
        self.lock().as_ref().map(|h| h.address)
    }

    /// Proxy the router is currently forwarding to
    pub fn proxy_address(&self) -> Option<SocketAddrV4> {
        let mut guard = self.lock();
        let handle = guard.as_mut()?;
        handle.reap_exited_router();
        handle.router.as_ref().map(|r| r.proxy_address)
    }

    fn join_router(router: RouterThread) {
        router.shutdown.terminate();
        if router.thread.join().is_err() {
            log::error!("Packet router thread panicked");
        }
        log::info!("Routing through {} stopped", router.proxy_address);
    }

    fn lock(&self) -> MutexGuard<'_, Option<RoutingHandle>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for InterfaceRoutingManager {
    fn drop(&mut self) {
        self.teardown();
        MANAGER_ACTIVE.store(false, Ordering::Release);
    }
}

#[cfg(unix)]
fn close_descriptor(fd: OwnedFd) {
    use std::os::fd::IntoRawFd;

    let raw = fd.into_raw_fd();
    // SAFETY: `raw` came from an OwnedFd and is closed exactly once
    if unsafe { libc::close(raw) } != 0 {
        log::warn!(
            "Closing interface descriptor {raw} failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn close_descriptor(fd: OwnedFd) {
    drop(fd);
}
