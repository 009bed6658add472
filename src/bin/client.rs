//! tunnel-session binary
//!
//! Routes this host's traffic into an already-running local SOCKS proxy
//! through a TUN interface and an external packet router, printing every
//! session state change until interrupted.

use log::{debug, error, info, warn};
use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tunnel_session::{
    config::Config,
    engine::StaticProxyEngine,
    error::{Result, VpnError},
    interface::{InterfaceRoutingManager, RoutingSettings},
    router::CommandRouter,
    settings::{FileSettingsStore, TunnelParameters},
    state::SessionEvent,
    SessionController,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }
    let config_path = if args.len() > 2 && args[1] == "--config" {
        args[2].as_str()
    } else if args.len() > 1 && !args[1].starts_with("--") {
        args[1].as_str()
    } else {
        "tunnel-session.toml"
    };

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();
    info!("Starting {} v{}", tunnel_session::NAME, tunnel_session::VERSION);
    info!("Loaded configuration from: {config_path}");

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        process::exit(1);
    }
    if let Err(e) = check_privileges() {
        error!("{e}");
        process::exit(1);
    }

    let controller = build_controller(&config)?;
    let mut observer = controller.subscribe();

    let params = if config.session.egress_region.is_empty() {
        None
    } else {
        Some(TunnelParameters::new(config.session.egress_region.clone()))
    };
    controller.start(params)?;

    info!("Session running. Press Ctrl+C to stop.");
    let shutdown = setup_shutdown_handler();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            snapshot = observer.recv() => {
                let Some(snapshot) = snapshot else {
                    warn!("State observer closed");
                    break;
                };
                display_state(&snapshot);
            }
        }
    }

    info!("Stopping session...");
    if let Err(e) = controller.shutdown().await {
        error!("Error during shutdown: {e}");
    }
    while let Some(snapshot) = observer.try_recv() {
        display_state(&snapshot);
    }
    info!("Session stopped");

    Ok(())
}

#[cfg(target_os = "linux")]
fn build_controller(config: &Config) -> Result<SessionController> {
    use tunnel_session::platform::TunPlatform;

    if config.routing.bypass_uid.is_none() {
        warn!(
            "No [routing] bypass_uid set: the local proxy must mark its sockets with fwmark 0x{:x} or its traffic loops back into the tunnel",
            config.interface.fwmark
        );
    }
    let platform = Arc::new(
        TunPlatform::new(config.interface.fwmark).with_bypass_uid(config.routing.bypass_uid),
    );
    let router = Arc::new(CommandRouter::new(
        config.routing.router_command.clone(),
        config.routing.router_args.clone(),
    ));
    let manager =
        InterfaceRoutingManager::acquire(platform, router, RoutingSettings::from(config))?;
    let engine = Arc::new(StaticProxyEngine::new(
        config.routing.proxy_host,
        config.engine.clone(),
    ));
    let settings = Arc::new(FileSettingsStore::new(&config.session.settings_path));
    debug!("Settings stored in {}", config.session.settings_path);

    Ok(SessionController::spawn(manager, engine, settings))
}

#[cfg(not(target_os = "linux"))]
fn build_controller(_config: &Config) -> Result<SessionController> {
    Err(VpnError::Config(
        "No virtual interface platform is available on this OS".to_string(),
    ))
}

/// Load configuration from file or create default
fn load_config(config_path: &str) -> Result<Config> {
    if Path::new(config_path).exists() {
        return Config::from_file(config_path);
    }

    eprintln!("Config file '{config_path}' not found, creating default configuration");
    let config = Config::default();
    let config_toml = config.to_toml()?;
    if let Err(e) = fs::write(config_path, config_toml) {
        eprintln!("Failed to write default config file: {e}");
    }
    Ok(config)
}

/// Print one snapshot
fn display_state(state: &tunnel_session::SessionState) {
    let event = state
        .event
        .map(|e| e.description())
        .unwrap_or("Unknown");
    let mut line = format!("[{event}]");

    if let Some(region) = &state.connected_server_region {
        line.push_str(&format!(" region={region}"));
    }
    if let Some(port) = state.local_proxy_port {
        line.push_str(&format!(" proxy_port={port}"));
    }
    if state.event == Some(SessionEvent::Connected) {
        line.push_str(&format!(
            " sent={} received={}",
            state.bytes_sent, state.bytes_received
        ));
    }
    if state.waiting_for_network {
        line.push_str(" (waiting for network)");
    }
    if let Some(err) = &state.last_error {
        line.push_str(&format!(" error={}", err.code));
        if let Some(context) = &err.context_data {
            line.push_str(&format!(" ({context})"));
        }
    }
    println!("{line}");
}

/// Wait for Ctrl+C or SIGTERM
async fn setup_shutdown_handler() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        debug!("Received SIGTERM");
                    }
                    Err(e) => {
                        warn!("Cannot listen for SIGTERM: {e}");
                        futures::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                futures::future::pending::<()>().await;
            }
        } => {}
    }
}

/// Creating the TUN interface and routes needs root
#[cfg(unix)]
fn check_privileges() -> Result<()> {
    // SAFETY: getuid has no preconditions
    let uid = unsafe { libc::getuid() };
    if uid != 0 {
        return Err(VpnError::Config(
            "This program requires root privileges to create the TUN interface. Please run with sudo."
                .to_string(),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_privileges() -> Result<()> {
    Ok(())
}

/// Print usage information
fn print_usage() {
    println!("tunnel-session v{}", tunnel_session::VERSION);
    println!("Route all traffic through a local SOCKS proxy");
    println!();
    println!("USAGE:");
    println!("    tunnel-session [CONFIG_FILE]");
    println!("    tunnel-session --config CONFIG_FILE");
    println!();
    println!("ARGS:");
    println!("    CONFIG_FILE    Path to configuration file (default: tunnel-session.toml)");
    println!();
    println!("CONFIG FORMAT:");
    println!("    TOML with [session], [interface], [routing], [engine] and [logging]");
    println!("    sections. A default config is written when none exists.");
    println!("    Set [routing] bypass_uid to the proxy's user so its own traffic");
    println!("    bypasses the tunnel.");
    println!();
    println!("PRIVILEGES:");
    println!("    Requires root to create the TUN interface and install routes.");
}
