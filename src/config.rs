//! Configuration module for the tunnel session host
//!
//! This module provides TOML-based configuration parsing and validation.
//! Every section has serde defaults so a minimal file is enough.

use crate::error::{Result, VpnError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::str::FromStr;

/// Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Egress region requested on start (empty = best available)
    #[serde(default)]
    pub egress_region: String,
    /// Path of the durable settings file
    #[serde(default = "default_settings_path")]
    pub settings_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            egress_region: String::new(),
            settings_path: default_settings_path(),
        }
    }
}

/// Virtual interface settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Interface name requested from the platform
    #[serde(default = "default_interface_name")]
    pub name: String,
    /// MTU value
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Netmask handed to the packet router
    #[serde(default = "default_netmask")]
    pub netmask: Ipv4Addr,
    /// Firewall mark applied to protected sockets (Linux)
    #[serde(default = "default_fwmark")]
    pub fwmark: u32,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: default_interface_name(),
            mtu: default_mtu(),
            netmask: default_netmask(),
            fwmark: default_fwmark(),
        }
    }
}

/// Packet routing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Host the local proxy listens on
    #[serde(default = "default_proxy_host")]
    pub proxy_host: Ipv4Addr,
    /// Fixed secondary proxy (UDP gateway) address
    #[serde(default = "default_secondary_proxy")]
    pub secondary_proxy_address: SocketAddrV4,
    /// Let the router answer DNS through the secondary proxy
    #[serde(default = "default_true")]
    pub transparent_dns: bool,
    /// Packet router executable
    #[serde(default = "default_router_command")]
    pub router_command: String,
    /// Extra arguments appended to the router command line
    #[serde(default)]
    pub router_args: Vec<String>,
    /// User whose sockets keep the host routes, e.g. the local proxy's user
    #[serde(default)]
    pub bypass_uid: Option<u32>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            proxy_host: default_proxy_host(),
            secondary_proxy_address: default_secondary_proxy(),
            transparent_dns: true,
            router_command: default_router_command(),
            router_args: Vec::new(),
            bypass_uid: None,
        }
    }
}

/// Settings for the static local proxy engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyEngineConfig {
    /// SOCKS port of the already-running local proxy
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    /// Optional HTTP port of the local proxy
    #[serde(default)]
    pub http_port: Option<u16>,
}

impl Default for ProxyEngineConfig {
    fn default() -> Self {
        Self {
            socks_port: default_socks_port(),
            http_port: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub engine: ProxyEngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| VpnError::Config(format!("Failed to read config file: {e}")))?;

        <Self as FromStr>::from_str(&contents)
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| VpnError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.interface.name.is_empty() || self.interface.name.len() >= 16 {
            return Err(VpnError::Config(
                "Interface name must be 1 to 15 characters".to_string(),
            ));
        }

        if self.interface.mtu < 576 || self.interface.mtu > 9000 {
            return Err(VpnError::Config(
                "MTU must be between 576 and 9000".to_string(),
            ));
        }

        if ipnet::ipv4_mask_to_prefix(self.interface.netmask).is_err() {
            return Err(VpnError::Config(format!(
                "Netmask {} is not contiguous",
                self.interface.netmask
            )));
        }

        if self.routing.secondary_proxy_address.port() == 0 {
            return Err(VpnError::Config(
                "Secondary proxy port cannot be zero".to_string(),
            ));
        }

        if self.routing.router_command.is_empty() {
            return Err(VpnError::Config(
                "Router command cannot be empty".to_string(),
            ));
        }

        if self.routing.bypass_uid == Some(0) {
            return Err(VpnError::Config(
                "Bypass uid cannot be root, the tunnel would carry nothing from this host's services"
                    .to_string(),
            ));
        }

        if self.engine.socks_port == 0 {
            return Err(VpnError::Config("SOCKS port cannot be zero".to_string()));
        }

        if self.session.settings_path.is_empty() {
            return Err(VpnError::Config(
                "Settings path cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = VpnError;

    fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| VpnError::Config(format!("Failed to parse TOML: {e}")))
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_settings_path() -> String {
    "tunnel-session-settings.toml".to_string()
}

fn default_interface_name() -> String {
    "tun0".to_string()
}

fn default_mtu() -> u16 {
    1500
}

fn default_netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 255, 255, 0)
}

fn default_fwmark() -> u32 {
    0x5453
}

fn default_proxy_host() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

fn default_secondary_proxy() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7300)
}

fn default_router_command() -> String {
    "tun2socks".to_string()
}

fn default_socks_port() -> u16 {
    1080
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parsing() {
        let toml_content = r#"
[session]
egress_region = "US"
settings_path = "/var/lib/tunnel-session/settings.toml"

[interface]
name = "tun7"
mtu = 1400

[routing]
secondary_proxy_address = "127.0.0.1:7400"
transparent_dns = false
router_command = "/usr/bin/tun2socks"
bypass_uid = 995

[engine]
socks_port = 1081
http_port = 8118

[logging]
level = "debug"
"#;

        let config = toml_content
            .parse::<Config>()
            .expect("Failed to parse config");
        assert_eq!(config.session.egress_region, "US");
        assert_eq!(config.interface.name, "tun7");
        assert_eq!(config.interface.mtu, 1400);
        assert_eq!(config.routing.bypass_uid, Some(995));
        assert_eq!(config.interface.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(
            config.routing.secondary_proxy_address,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7400)
        );
        assert!(!config.routing.transparent_dns);
        assert_eq!(config.engine.socks_port, 1081);
        assert_eq!(config.engine.http_port, Some(8118));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = "".parse::<Config>().expect("Failed to parse empty config");
        assert_eq!(config.interface.mtu, 1500);
        assert_eq!(config.routing.secondary_proxy_address.port(), 7300);
        assert!(config.routing.transparent_dns);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.interface.mtu = 100;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.interface.netmask = Ipv4Addr::new(255, 0, 255, 0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.socks_port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.routing.bypass_uid = Some(0);
        assert!(config.validate().is_err());
        config.routing.bypass_uid = Some(995);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        let parsed: Config = text.parse().unwrap();
        assert_eq!(parsed.interface.name, config.interface.name);
        assert_eq!(parsed.routing.router_command, config.routing.router_command);
    }
}
