//! Session controller
//!
//! Commands are queued to a single actor task and handled strictly one at
//! a time. A started session runs on its own task which brings the
//! interface and engine up, then parks until the actor signals shutdown and
//! finally runs the cleanup path. Engine events are queued to the same actor
//! and carry the generation of the session they belong to.
//!
//! Lifecycle: `Stopped -> Starting -> Running -> Stopping -> Stopped`.

use crate::engine::{EngineConfig, EngineEvent, EngineEventSink, ProxyKind, TunnelEngine};
use crate::error::{ErrorCode, IntoVpnError, Result, VpnError};
use crate::interface::InterfaceRoutingManager;
use crate::settings::{SettingsStore, TunnelParameters};
use crate::state::{SessionEvent, SessionState, SessionStateStore, Transition};
use crate::subscriber::{self, StateObserver, SubscriberRegistry};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl LifecycleState {
    /// Whether a session task is alive and not yet asked to stop
    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::Running)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Messages processed by the controller actor
#[derive(Debug)]
pub(crate) enum Command {
    Start(Option<TunnelParameters>),
    Stop,
    UpdateParameters(TunnelParameters),
    Revoked,
    Shutdown(Option<oneshot::Sender<()>>),
    Engine { generation: u64, event: EngineEvent },
    SessionStarted { generation: u64 },
    SessionFailed { generation: u64 },
    SessionFinished { generation: u64 },
}

/// Handle to the session controller actor
///
/// Dropping the handle stops any running session and ends the actor.
pub struct SessionController {
    commands: mpsc::UnboundedSender<Command>,
    lifecycle: watch::Receiver<LifecycleState>,
    registry: Arc<SubscriberRegistry>,
    manager: Arc<InterfaceRoutingManager>,
    actor: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Spawn the controller on the current tokio runtime
    pub fn spawn(
        manager: InterfaceRoutingManager,
        engine: Arc<dyn TunnelEngine>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        let store = Arc::new(SessionStateStore::default());
        let registry = Arc::new(SubscriberRegistry::new(store));
        let manager = Arc::new(manager);

        match settings.load_available_regions() {
            Ok(Some(regions)) => {
                registry.publish(Transition::SetAvailableRegions(regions));
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to load available regions: {e}"),
        }

        let (commands, rx) = mpsc::unbounded_channel();
        let (lifecycle_tx, lifecycle) = watch::channel(LifecycleState::Stopped);

        let actor = ControllerActor {
            commands: commands.clone(),
            lifecycle: lifecycle_tx,
            registry: Arc::clone(&registry),
            manager: Arc::clone(&manager),
            engine,
            settings,
            generation: 0,
            parameters: TunnelParameters::default(),
            session_shutdown: None,
            exit_requested: false,
            exit_reply: None,
        };
        let actor = tokio::spawn(actor.run(rx));

        Self {
            commands,
            lifecycle,
            registry,
            manager,
            actor: Some(actor),
        }
    }

    /// Start a session, persisting `params` first when given
    pub fn start(&self, params: Option<TunnelParameters>) -> Result<()> {
        self.send(Command::Start(params))
    }

    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// Apply new parameters, restarting the engine when they changed
    pub fn update_parameters(&self, params: TunnelParameters) -> Result<()> {
        self.send(Command::UpdateParameters(params))
    }

    /// The platform withdrew permission for the virtual interface
    pub fn revoked(&self) -> Result<()> {
        self.send(Command::Revoked)
    }

    /// Stop any session, publish `Exiting` and end the actor
    pub async fn shutdown(mut self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(Some(tx)))?;
        rx.await.map_err(|_| VpnError::ControllerGone)?;
        if let Some(actor) = self.actor.take() {
            actor.await.into_vpn_error("controller task failed")?;
        }
        Ok(())
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    /// Wait until the lifecycle reaches `state`
    pub async fn wait_for(&self, state: LifecycleState) -> Result<()> {
        let mut lifecycle = self.lifecycle.clone();
        lifecycle
            .wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| VpnError::ControllerGone)
    }

    /// Current session snapshot
    pub fn state(&self) -> Arc<SessionState> {
        self.registry.store().current()
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn routing_manager(&self) -> &Arc<InterfaceRoutingManager> {
        &self.manager
    }

    /// Register an in-process observer
    pub fn subscribe(&self) -> StateObserver {
        let (subscriber, observer) = subscriber::channel();
        self.registry.register(subscriber);
        observer
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| VpnError::ControllerGone)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if self.actor.is_some() {
            let _ = self.commands.send(Command::Shutdown(None));
        }
    }
}

/// State owned by the actor task
struct ControllerActor {
    commands: mpsc::UnboundedSender<Command>,
    lifecycle: watch::Sender<LifecycleState>,
    registry: Arc<SubscriberRegistry>,
    manager: Arc<InterfaceRoutingManager>,
    engine: Arc<dyn TunnelEngine>,
    settings: Arc<dyn SettingsStore>,
    generation: u64,
    parameters: TunnelParameters,
    session_shutdown: Option<watch::Sender<bool>>,
    exit_requested: bool,
    exit_reply: Option<oneshot::Sender<()>>,
}

impl ControllerActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            log::trace!("Handling {command:?} while {}", self.state());
            if self.handle(command).await {
                break;
            }
        }
        log::debug!("Session controller exited");
    }

    fn state(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    fn set_state(&self, state: LifecycleState) {
        log::debug!("Lifecycle {} -> {state}", self.state());
        self.lifecycle.send_replace(state);
    }

    /// Returns `true` once the actor should exit
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Start(params) => self.on_start(params).await,
            Command::Stop => self.on_stop().await,
            Command::UpdateParameters(params) => self.on_update_parameters(params).await,
            Command::Revoked => self.on_revoked(),
            Command::Shutdown(reply) => {
                self.exit_requested = true;
                if reply.is_some() {
                    self.exit_reply = reply;
                }
                match self.state() {
                    LifecycleState::Stopped => return self.finish_exit().await,
                    LifecycleState::Starting | LifecycleState::Running => self.begin_stop(),
                    LifecycleState::Stopping => {}
                }
            }
            Command::Engine { generation, event } => self.on_engine_event(generation, event).await,
            Command::SessionStarted { generation } => {
                if generation == self.generation && self.state() == LifecycleState::Starting {
                    self.set_state(LifecycleState::Running);
                }
            }
            Command::SessionFailed { generation } => {
                if generation == self.generation {
                    self.begin_stop();
                }
            }
            Command::SessionFinished { generation } => {
                if generation == self.generation {
                    self.session_shutdown = None;
                    self.set_state(LifecycleState::Stopped);
                    log::info!("Session {generation} stopped");
                    if self.exit_requested {
                        return self.finish_exit().await;
                    }
                }
            }
        }
        false
    }

    async fn on_start(&mut self, params: Option<TunnelParameters>) {
        if self.exit_requested {
            log::debug!("Ignoring start: controller is exiting");
            return;
        }
        if self.state() != LifecycleState::Stopped {
            log::debug!("Ignoring start while {}", self.state());
            return;
        }

        self.parameters = match params {
            Some(params) => {
                self.persist_parameters(params.clone()).await;
                params
            }
            None => match self.with_settings(|s| s.load_stored_parameters()).await {
                Ok(stored) => stored.unwrap_or_default(),
                Err(e) => {
                    log::warn!("Failed to load tunnel parameters: {e}");
                    TunnelParameters::default()
                }
            },
        };

        self.generation += 1;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.session_shutdown = Some(shutdown_tx);
        self.set_state(LifecycleState::Starting);
        // Published before any later command can record an error
        self.registry.publish(Transition::BeginSession);
        log::info!(
            "Starting session {} (region '{}')",
            self.generation,
            self.parameters.egress_region
        );

        let session = SessionTask {
            generation: self.generation,
            parameters: self.parameters.clone(),
            registry: Arc::clone(&self.registry),
            manager: Arc::clone(&self.manager),
            engine: Arc::clone(&self.engine),
            commands: self.commands.clone(),
            shutdown: shutdown_rx,
        };
        tokio::spawn(session.run());
    }

    async fn on_stop(&mut self) {
        match self.state() {
            LifecycleState::Starting | LifecycleState::Running => self.begin_stop(),
            LifecycleState::Stopping => log::debug!("Already stopping"),
            LifecycleState::Stopped => {
                // Make sure nothing from an earlier session is left behind
                self.settle_interface().await;
            }
        }
    }

    async fn on_update_parameters(&mut self, params: TunnelParameters) {
        let state = self.state();
        if matches!(state, LifecycleState::Starting | LifecycleState::Stopping) {
            log::debug!("Ignoring parameter update while {state}");
            return;
        }

        self.persist_parameters(params.clone()).await;
        if state == LifecycleState::Stopped {
            return;
        }

        if !self.parameters.requires_restart(&params) {
            log::debug!("Parameters unchanged, no restart needed");
            return;
        }
        self.parameters = params;
        self.restart().await;
    }

    /// Reconnect the engine without leaving `Running`
    async fn restart(&mut self) {
        log::info!(
            "Restarting session {} for region '{}'",
            self.generation,
            self.parameters.egress_region
        );

        self.stop_routing().await;
        self.registry
            .publish(Transition::SetEvent(Some(SessionEvent::Connecting)));

        let config = EngineConfig {
            parameters: self.parameters.clone(),
            protector: self.manager.protector(),
        };
        if let Err(e) = self.engine.restart(config).await {
            log::error!("Tunnel restart failed: {e}");
            self.registry.publish(Transition::SetError {
                code: ErrorCode::TunnelRestartFailed,
                context: Some(e.to_string()),
            });
            self.begin_stop();
        }
    }

    fn on_revoked(&mut self) {
        log::warn!("Interface permission revoked");
        self.registry.publish(Transition::SetError {
            code: ErrorCode::PermissionRevokedOrNotPrepared,
            context: None,
        });
        self.begin_stop();
    }

    /// Move an active session to `Stopping` and cancel its task
    fn begin_stop(&mut self) {
        if !self.state().is_active() {
            return;
        }
        self.set_state(LifecycleState::Stopping);
        self.registry
            .publish(Transition::SetEvent(Some(SessionEvent::Stopping)));
        if let Some(shutdown) = &self.session_shutdown {
            shutdown.send_replace(true);
        }
    }

    async fn on_engine_event(&mut self, generation: u64, event: EngineEvent) {
        let state = self.state();
        if generation != self.generation || !state.is_active() {
            log::debug!("Dropping {event:?} from session {generation} while {state}");
            return;
        }

        match event {
            EngineEvent::Connecting => {
                if state == LifecycleState::Running {
                    self.registry
                        .publish(Transition::SetEvent(Some(SessionEvent::Connecting)));
                } else {
                    log::debug!("Ignoring connecting notification while {state}");
                }
            }
            EngineEvent::Connected => self.on_connected(),
            EngineEvent::ClientRegion(region) => {
                self.registry.publish(Transition::SetClientRegion(region));
            }
            EngineEvent::ServerRegion(region) => {
                self.registry.publish(Transition::SetServerRegion(region));
            }
            EngineEvent::BytesTransferred { sent, received } => {
                self.registry
                    .publish(Transition::AddBytesTransferred { sent, received });
            }
            EngineEvent::RateLimits {
                upstream,
                downstream,
            } => {
                self.registry.publish(Transition::SetRateLimits {
                    upstream,
                    downstream,
                });
            }
            EngineEvent::AvailableRegions(regions) => {
                let stored = regions.clone();
                if let Err(e) = self
                    .with_settings(move |s| s.store_available_regions(&stored))
                    .await
                {
                    log::warn!("Failed to persist available regions: {e}");
                }
                self.registry
                    .publish(Transition::SetAvailableRegions(regions));
            }
            EngineEvent::ListeningPort { which, port } => {
                let transition = match which {
                    ProxyKind::Socks => Transition::SetLocalProxyPort(port),
                    ProxyKind::Http => Transition::SetSecondaryProxyPort(port),
                };
                self.registry.publish(transition);
            }
            EngineEvent::PortInUse { which, port } => {
                let code = match which {
                    ProxyKind::Socks => ErrorCode::SocksPortInUse,
                    ProxyKind::Http => ErrorCode::HttpPortInUse,
                };
                log::error!("Local proxy port {port} already in use");
                self.registry.publish(Transition::SetError {
                    code,
                    context: Some(port.to_string()),
                });
                self.begin_stop();
            }
            EngineEvent::WaitingForNetwork(waiting) => {
                self.registry
                    .publish(Transition::SetWaitingForNetwork(waiting));
            }
            EngineEvent::ApplicationParameters(params) => {
                self.registry
                    .publish(Transition::SetApplicationParameters(params));
            }
        }
    }

    fn on_connected(&mut self) {
        self.registry.publish(Transition::ClearError);
        let snapshot = self
            .registry
            .publish(Transition::SetEvent(Some(SessionEvent::Connected)));

        match snapshot.local_proxy_port {
            Some(port) => {
                self.manager.start_routing(port);
            }
            None => {
                log::error!("Connected without a local proxy port");
                self.registry.publish(Transition::SetError {
                    code: ErrorCode::ProxyPortNotConfigured,
                    context: None,
                });
                self.begin_stop();
            }
        }
    }

    /// Run a settings store operation off the actor task
    async fn with_settings<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SettingsStore) -> Result<T> + Send + 'static,
    {
        let settings = Arc::clone(&self.settings);
        tokio::task::spawn_blocking(move || op(settings.as_ref()))
            .await
            .into_vpn_error("settings task failed")?
    }

    async fn persist_parameters(&self, params: TunnelParameters) {
        if let Err(e) = self.with_settings(move |s| s.store_parameters(&params)).await {
            log::warn!("Failed to persist tunnel parameters: {e}");
        }
    }

    async fn stop_routing(&self) {
        let manager = Arc::clone(&self.manager);
        if let Err(e) = tokio::task::spawn_blocking(move || manager.stop_routing()).await {
            log::error!("Stopping routing failed: {e}");
        }
    }

    async fn settle_interface(&self) {
        let manager = Arc::clone(&self.manager);
        if let Err(e) = tokio::task::spawn_blocking(move || manager.teardown()).await {
            log::error!("Interface teardown failed: {e}");
        }
    }

    async fn finish_exit(&mut self) -> bool {
        self.settle_interface().await;
        self.registry
            .publish(Transition::SetEvent(Some(SessionEvent::Exiting)));
        if let Some(reply) = self.exit_reply.take() {
            let _ = reply.send(());
        }
        true
    }
}

/// Work for one session, from bring-up to cleanup
struct SessionTask {
    generation: u64,
    parameters: TunnelParameters,
    registry: Arc<SubscriberRegistry>,
    manager: Arc<InterfaceRoutingManager>,
    engine: Arc<dyn TunnelEngine>,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: watch::Receiver<bool>,
}

impl SessionTask {
    async fn run(mut self) {
        let generation = self.generation;
        match self.bring_up().await {
            Ok(true) => self.notify(Command::SessionStarted { generation }),
            Ok(false) => log::debug!("Session {generation} cancelled during start"),
            Err((code, _)) if *self.shutdown.borrow() => {
                // The reason for stopping is already recorded
                log::warn!("Session {generation} failed while stopping: {code}");
            }
            Err((code, context)) => {
                log::error!("Session {generation} failed to start: {code}");
                self.registry.publish(Transition::SetError { code, context });
                self.notify(Command::SessionFailed { generation });
            }
        }

        wait_for_shutdown(&mut self.shutdown).await;
        self.clean_up().await;
        self.notify(Command::SessionFinished { generation });
    }

    /// Establish the interface and start the engine
    ///
    /// Returns `Ok(false)` when cancelled before the engine came up.
    async fn bring_up(&mut self) -> std::result::Result<bool, (ErrorCode, Option<String>)> {
        // Not cancellable: teardown must never overtake establishment
        let manager = Arc::clone(&self.manager);
        let established = tokio::task::spawn_blocking(move || manager.establish())
            .await
            .map_err(|e| (ErrorCode::Unexpected, Some(e.to_string())))?;
        let address = established.map_err(|e| (ErrorCode::from(&e), Some(e.to_string())))?;
        log::debug!("Session {} using {address}", self.generation);

        if *self.shutdown.borrow() {
            return Ok(false);
        }

        let config = EngineConfig {
            parameters: self.parameters.clone(),
            protector: self.manager.protector(),
        };
        let sink = EngineEventSink::new(self.generation, self.commands.clone());

        let engine = Arc::clone(&self.engine);
        tokio::select! {
            started = engine.start_tunneling(config, sink) => started
                .map(|()| true)
                .map_err(|e| (ErrorCode::TunnelStartFailed, Some(e.to_string()))),
            () = wait_for_shutdown(&mut self.shutdown) => Ok(false),
        }
    }

    /// Runs exactly once per session, whatever ended it
    async fn clean_up(&self) {
        self.engine.stop().await;

        let manager = Arc::clone(&self.manager);
        let cleaned = tokio::task::spawn_blocking(move || {
            manager.stop_routing();
            manager.teardown();
        })
        .await;
        if let Err(e) = cleaned {
            log::error!("Session {} cleanup failed: {e}", self.generation);
        }

        self.registry.publish(Transition::Reset);
    }

    fn notify(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::debug!("Controller gone before session {} ended", self.generation);
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
