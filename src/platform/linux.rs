//! Linux TUN platform
//!
//! Creates the interface with the `tun` crate and installs routes with
//! `ip`. The default route lives in a dedicated table selected by a policy
//! rule that skips sockets carrying the protect mark, so protected engine
//! sockets keep using the host's own routes. An optional bypass uid gets a
//! higher priority rule onto the main table, for a proxy that runs as its
//! own user and never marks its sockets.

use super::{InterfaceSpec, VirtualInterfacePlatform};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::process::Command;

const BYPASS_RULE_PRIORITY: u32 = 9000;
const TUNNEL_RULE_PRIORITY: u32 = 9001;

/// TUN-backed platform for Linux hosts
#[derive(Debug, Clone)]
pub struct TunPlatform {
    fwmark: u32,
    bypass_uid: Option<u32>,
}

impl TunPlatform {
    /// `fwmark` marks protected sockets and doubles as the routing table id
    pub fn new(fwmark: u32) -> Self {
        Self {
            fwmark,
            bypass_uid: None,
        }
    }

    /// Keep every socket owned by `uid` on the host's main table
    pub fn with_bypass_uid(mut self, uid: Option<u32>) -> Self {
        self.bypass_uid = uid;
        self
    }

    /// `ip rule <action>` arguments sending unmarked traffic to the tunnel
    fn tunnel_rule(&self, action: &str) -> Vec<String> {
        vec![
            "rule".to_string(),
            action.to_string(),
            "not".to_string(),
            "fwmark".to_string(),
            format!("0x{:x}", self.fwmark),
            "table".to_string(),
            self.fwmark.to_string(),
            "priority".to_string(),
            TUNNEL_RULE_PRIORITY.to_string(),
        ]
    }

    /// `ip rule <action>` arguments exempting the bypass user, if any
    fn bypass_rule(&self, action: &str) -> Option<Vec<String>> {
        let uid = self.bypass_uid?;
        Some(vec![
            "rule".to_string(),
            action.to_string(),
            "uidrange".to_string(),
            format!("{uid}-{uid}"),
            "lookup".to_string(),
            "main".to_string(),
            "priority".to_string(),
            BYPASS_RULE_PRIORITY.to_string(),
        ])
    }

    fn remove_rules(&self) {
        run_ip(&self.tunnel_rule("del"));
        if let Some(rule) = self.bypass_rule("del") {
            run_ip(&rule);
        }
    }

    fn create_device(&self, spec: &InterfaceSpec) -> Option<OwnedFd> {
        let mut config = tun::Configuration::default();
        config
            .name(&spec.name)
            .address(spec.address)
            .netmask(spec.netmask())
            .mtu(i32::from(spec.mtu))
            .up();

        let device = match tun::create(&config) {
            Ok(device) => device,
            Err(e) => {
                log::error!("Failed to create TUN interface '{}': {e}", spec.name);
                return None;
            }
        };

        // Keep our own descriptor; the interface lives while any copy is open
        // SAFETY: the device is alive for the duration of the borrow
        let fd = unsafe { BorrowedFd::borrow_raw(device.as_raw_fd()) }.try_clone_to_owned();
        match fd {
            Ok(fd) => Some(fd),
            Err(e) => {
                log::error!("Failed to duplicate TUN descriptor: {e}");
                None
            }
        }
    }

    fn install_routes(&self, spec: &InterfaceSpec) -> bool {
        let table = self.fwmark.to_string();

        for route in &spec.routes {
            let destination = if route.prefix_len() == 0 {
                "default".to_string()
            } else {
                route.to_string()
            };
            let mut args = vec![
                "route".to_string(),
                "replace".to_string(),
                destination,
                "dev".to_string(),
                spec.name.clone(),
            ];
            if route.prefix_len() == 0 {
                args.extend(["table".to_string(), table.clone()]);
            }
            if !run_ip(&args) {
                return false;
            }
        }

        self.remove_rules();
        if let Some(rule) = self.bypass_rule("add") {
            if !run_ip(&rule) {
                return false;
            }
        }
        // Everything without the protect mark goes through the tunnel table
        if !run_ip(&self.tunnel_rule("add")) {
            return false;
        }

        for dns in &spec.dns_servers {
            let status = Command::new("resolvectl")
                .args(["dns", spec.name.as_str(), dns.to_string().as_str()])
                .output();
            match status {
                Ok(out) if out.status.success() => {
                    log::debug!("DNS {dns} configured on {}", spec.name);
                }
                Ok(out) => log::warn!(
                    "resolvectl failed for {}: {}",
                    spec.name,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
                Err(e) => log::warn!("resolvectl unavailable, DNS left unchanged: {e}"),
            }
        }

        true
    }
}

impl VirtualInterfacePlatform for TunPlatform {
    fn establish(&self, spec: &InterfaceSpec) -> Option<OwnedFd> {
        let fd = self.create_device(spec)?;
        if !self.install_routes(spec) {
            log::error!("Failed to route traffic into {}", spec.name);
            self.release(spec);
            return None;
        }
        log::info!(
            "Interface {} up: {}/{} mtu {}",
            spec.name,
            spec.address,
            spec.prefix_length,
            spec.mtu
        );
        Some(fd)
    }

    fn protect(&self, fd: RawFd) -> bool {
        let mark = self.fwmark;
        // SAFETY: setsockopt reads `size_of::<u32>()` bytes from `mark`
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_MARK,
                &mark as *const u32 as *const libc::c_void,
                std::mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            log::warn!(
                "Failed to protect socket {fd}: {}",
                std::io::Error::last_os_error()
            );
        }
        rc == 0
    }

    fn release(&self, spec: &InterfaceSpec) {
        self.remove_rules();
        run_ip(&[
            "route".to_string(),
            "flush".to_string(),
            "table".to_string(),
            self.fwmark.to_string(),
        ]);
        log::debug!("Released routing for {}", spec.name);
    }
}

fn run_ip(args: &[String]) -> bool {
    match Command::new("ip").args(args).output() {
        Ok(out) if out.status.success() => true,
        Ok(out) => {
            log::warn!(
                "ip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            );
            false
        }
        Err(e) => {
            log::warn!("Failed to run ip {}: {e}", args.join(" "));
            false
        }
    }
}
