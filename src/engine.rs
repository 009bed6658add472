//! Tunnel engine collaborator
//!
//! The engine does the actual protocol work and runs its own local proxy.
//! It reports progress through an [`EngineEventSink`]; every event carries
//! the generation of the session it was started for, so the controller can
//! drop notifications that arrive after that session ended.

use crate::config::ProxyEngineConfig;
use crate::controller::Command;
use crate::error::{Result, VpnError};
use crate::interface::SocketProtector;
use crate::settings::TunnelParameters;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Local proxy flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// Primary proxy; the packet router forwards to it
    Socks,
    /// Secondary proxy
    Http,
}

/// Notifications from the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Connecting,
    Connected,
    ClientRegion(String),
    ServerRegion(String),
    BytesTransferred { sent: u64, received: u64 },
    RateLimits {
        upstream: Option<u64>,
        downstream: Option<u64>,
    },
    AvailableRegions(Vec<String>),
    ListeningPort { which: ProxyKind, port: u16 },
    PortInUse { which: ProxyKind, port: u16 },
    WaitingForNetwork(bool),
    ApplicationParameters(serde_json::Map<String, serde_json::Value>),
}

/// Everything the engine needs for one (re)start
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub parameters: TunnelParameters,
    /// Keeps the engine's own sockets out of the tunnel
    pub protector: SocketProtector,
}

/// Channel back into the session controller
#[derive(Clone)]
pub struct EngineEventSink {
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl EngineEventSink {
    pub(crate) fn new(generation: u64, commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            generation,
            commands,
        }
    }

    /// Session generation this sink is bound to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event; returns `false` once the controller is gone
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.commands
            .send(Command::Engine {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

impl std::fmt::Debug for EngineEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineEventSink")
            .field("generation", &self.generation)
            .finish()
    }
}

/// External tunnel engine
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Begin tunneling; events keep flowing through `events` afterwards
    async fn start_tunneling(&self, config: EngineConfig, events: EngineEventSink) -> Result<()>;

    async fn stop(&self);

    /// Reconnect with new parameters inside the running session
    async fn restart(&self, config: EngineConfig) -> Result<()>;
}

/// Engine for a local proxy that is already running
///
/// Nothing is negotiated: the engine checks the SOCKS port accepts
/// connections, reports the configured ports and declares the session
/// connected.
#[derive(Debug)]
pub struct StaticProxyEngine {
    proxy_host: Ipv4Addr,
    config: ProxyEngineConfig,
    probe_timeout: Duration,
    sink: Mutex<Option<EngineEventSink>>,
}

impl StaticProxyEngine {
    pub fn new(proxy_host: Ipv4Addr, config: ProxyEngineConfig) -> Self {
        Self {
            proxy_host,
            config,
            probe_timeout: Duration::from_secs(5),
            sink: Mutex::new(None),
        }
    }

    async fn probe(&self) -> Result<()> {
        let address = SocketAddrV4::new(self.proxy_host, self.config.socks_port);
        match tokio::time::timeout(self.probe_timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(VpnError::Engine(format!(
                "Local proxy at {address} is not reachable: {e}"
            ))),
            Err(_) => Err(VpnError::Engine(format!(
                "Timed out connecting to local proxy at {address}"
            ))),
        }
    }

    async fn announce(&self, parameters: &TunnelParameters, sink: &EngineEventSink) -> Result<()> {
        self.probe().await?;

        sink.emit(EngineEvent::ListeningPort {
            which: ProxyKind::Socks,
            port: self.config.socks_port,
        });
        if let Some(port) = self.config.http_port {
            sink.emit(EngineEvent::ListeningPort {
                which: ProxyKind::Http,
                port,
            });
        }
        if !parameters.egress_region.is_empty() {
            sink.emit(EngineEvent::ServerRegion(parameters.egress_region.clone()));
        }
        sink.emit(EngineEvent::Connected);
        Ok(())
    }

    fn current_sink(&self) -> Option<EngineEventSink> {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TunnelEngine for StaticProxyEngine {
    async fn start_tunneling(&self, config: EngineConfig, events: EngineEventSink) -> Result<()> {
        log::info!(
            "Using local proxy {}:{} (region '{}')",
            self.proxy_host,
            self.config.socks_port,
            config.parameters.egress_region
        );
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(events.clone());
        self.announce(&config.parameters, &events).await
    }

    async fn stop(&self) {
        if self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            log::debug!("Static proxy engine released");
        }
    }

    async fn restart(&self, config: EngineConfig) -> Result<()> {
        let sink = self
            .current_sink()
            .ok_or_else(|| VpnError::InvalidState("engine was never started".to_string()))?;
        self.announce(&config.parameters, &sink).await
    }
}
