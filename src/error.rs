//! Error types for tunnel session management
//!
//! Two kinds of error live here. [`VpnError`] is returned from fallible
//! operations (configuration, settings, interface establishment). [`ErrorCode`]
//! is the session error taxonomy recorded into the published session state;
//! those never propagate to the caller that started the session.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for session operations
#[derive(Error, Debug)]
pub enum VpnError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistent settings errors
    #[error("Settings error: {0}")]
    Settings(String),

    /// No private address block is free on this host
    #[error("No private address available: {0}")]
    NoAddressAvailable(String),

    /// The platform refused to materialize the virtual interface
    #[error("Interface permission revoked or not prepared: {0}")]
    PermissionRevoked(String),

    /// A second routing manager was requested while one is alive
    #[error("Routing manager already active")]
    AlreadyActive,

    /// Tunnel engine errors
    #[error("Engine error: {0}")]
    Engine(String),

    /// Packet router errors
    #[error("Router error: {0}")]
    Router(String),

    /// The controller task has exited
    #[error("Session controller is gone")]
    ControllerGone,

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid state errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, VpnError>;

/// Helper trait for converting errors to VpnError
pub trait IntoVpnError<T> {
    fn into_vpn_error(self, context: &str) -> Result<T>;
}

impl<T, E> IntoVpnError<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn into_vpn_error(self, context: &str) -> Result<T> {
        self.map_err(|e| VpnError::Other(format!("{context}: {e}")))
    }
}

impl From<toml::de::Error> for VpnError {
    fn from(err: toml::de::Error) -> Self {
        VpnError::Config(format!("TOML parsing error: {err}"))
    }
}

impl From<toml::ser::Error> for VpnError {
    fn from(err: toml::ser::Error) -> Self {
        VpnError::Config(format!("TOML serialization error: {err}"))
    }
}

impl From<serde_json::Error> for VpnError {
    fn from(err: serde_json::Error) -> Self {
        VpnError::Other(format!("JSON error: {err}"))
    }
}

/// Session error codes recorded in the published state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoAddressAvailable,
    PermissionRevokedOrNotPrepared,
    ProxyPortNotConfigured,
    SocksPortInUse,
    HttpPortInUse,
    TunnelStartFailed,
    TunnelRestartFailed,
    Unexpected,
}

impl ErrorCode {
    /// Short human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::NoAddressAvailable => "no private address block available",
            ErrorCode::PermissionRevokedOrNotPrepared => {
                "interface permission revoked or not prepared"
            }
            ErrorCode::ProxyPortNotConfigured => "local proxy port not configured",
            ErrorCode::SocksPortInUse => "SOCKS proxy port in use",
            ErrorCode::HttpPortInUse => "HTTP proxy port in use",
            ErrorCode::TunnelStartFailed => "tunnel start failed",
            ErrorCode::TunnelRestartFailed => "tunnel restart failed",
            ErrorCode::Unexpected => "unexpected error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl From<&VpnError> for ErrorCode {
    fn from(error: &VpnError) -> Self {
        match error {
            VpnError::NoAddressAvailable(_) => ErrorCode::NoAddressAvailable,
            VpnError::PermissionRevoked(_) => ErrorCode::PermissionRevokedOrNotPrepared,
            VpnError::Engine(_) => ErrorCode::TunnelStartFailed,
            _ => ErrorCode::Unexpected,
        }
    }
}
