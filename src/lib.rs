//! tunnel-session - single tunnel session manager
//!
//! Brings up a virtual network interface, routes device traffic into a local
//! proxy through a packet-router subprocess, tracks the session status and
//! distributes it to any number of observers.
//!
//! ## What This Crate Provides
//! - Private address selection for the virtual interface
//! - Interface and packet router lifetime management
//! - Immutable session state snapshots with named transitions
//! - Subscriber registry with in-process and JSON-lines observers
//! - The session controller state machine
//! - TOML configuration and durable settings
//!
//! ## What Your Application Supplies
//! - A [`engine::TunnelEngine`] doing the actual protocol work
//! - A [`platform::VirtualInterfacePlatform`] (a Linux TUN one is bundled)
//! - A [`router::PacketRouter`] (an external-command one is bundled)

pub mod address;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod interface;
pub mod platform;
pub mod router;
pub mod settings;
pub mod state;
pub mod subscriber;

#[cfg(test)]
mod test_support;

// Re-export core types
pub use config::Config;
pub use controller::{LifecycleState, SessionController};
pub use engine::{EngineEvent, EngineEventSink, ProxyKind, TunnelEngine};
pub use error::{ErrorCode, Result, VpnError};
pub use interface::{InterfaceRoutingManager, RoutingSettings};
pub use settings::{SettingsStore, TunnelParameters};
pub use state::{SessionEvent, SessionState, SessionStateStore, Transition};
pub use subscriber::{StateObserver, Subscriber, SubscriberRegistry};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
