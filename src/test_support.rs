//! Test doubles shared by the unit tests

use crate::address;
use crate::engine::{EngineConfig, EngineEvent, EngineEventSink, TunnelEngine};
use crate::error::{Result, VpnError};
use crate::interface::{InterfaceRoutingManager, RoutingSettings};
use crate::platform::{InterfaceSpec, VirtualInterfacePlatform};
use crate::router::{PacketRouter, RouterParams, RouterShutdown};
use crate::settings::TunnelParameters;
use crate::state::{SessionEvent, SessionState};
use crate::subscriber::StateObserver;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Serializes tests that acquire the process-wide routing manager
pub fn manager_lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Acquire the routing manager, waiting for a previous test's runtime to
/// release it
pub fn acquire_manager(
    platform: Arc<MockPlatform>,
    router: Arc<MockRouter>,
) -> InterfaceRoutingManager {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match InterfaceRoutingManager::acquire(
            platform.clone(),
            router.clone(),
            RoutingSettings::default(),
        ) {
            Ok(manager) => {
                return manager
                    .with_address_selector(|| address::select_from(&[Ipv4Addr::LOCALHOST]))
            }
            Err(VpnError::AlreadyActive) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("failed to acquire routing manager: {e}"),
        }
    }
}

/// Platform handing out temporary files as interface descriptors
#[derive(Default)]
pub struct MockPlatform {
    refuse: AtomicBool,
    established: AtomicUsize,
    released: AtomicUsize,
    last_spec: Mutex<Option<InterfaceSpec>>,
    protected: Mutex<Vec<RawFd>>,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refusing() -> Arc<Self> {
        let platform = Self::default();
        platform.refuse.store(true, Ordering::SeqCst);
        Arc::new(platform)
    }

    pub fn establish_count(&self) -> usize {
        self.established.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn last_spec(&self) -> Option<InterfaceSpec> {
        self.last_spec.lock().unwrap().clone()
    }

    pub fn protected(&self) -> Vec<RawFd> {
        self.protected.lock().unwrap().clone()
    }
}

impl VirtualInterfacePlatform for MockPlatform {
    fn establish(&self, spec: &InterfaceSpec) -> Option<OwnedFd> {
        if self.refuse.load(Ordering::SeqCst) {
            return None;
        }
        self.established.fetch_add(1, Ordering::SeqCst);
        *self.last_spec.lock().unwrap() = Some(spec.clone());
        tempfile::tempfile().ok().map(OwnedFd::from)
    }

    fn protect(&self, fd: RawFd) -> bool {
        self.protected.lock().unwrap().push(fd);
        true
    }

    fn release(&self, _spec: &InterfaceSpec) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// What the mock router saw for one cycle
#[derive(Debug, Clone)]
pub struct SeenParams {
    pub router_address: Ipv4Addr,
    pub proxy_address: std::net::SocketAddrV4,
    pub secondary_proxy_address: std::net::SocketAddrV4,
    pub transparent_dns: bool,
    pub descriptor_valid: bool,
}

/// Router that blocks until terminated
#[derive(Default)]
pub struct MockRouter {
    exit_early: AtomicBool,
    runs: AtomicUsize,
    exits: AtomicUsize,
    seen: Mutex<Vec<SeenParams>>,
}

impl MockRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Router that returns as soon as it starts, like a crashed child
    pub fn exiting() -> Arc<Self> {
        let router = Self::default();
        router.exit_early.store(true, Ordering::SeqCst);
        Arc::new(router)
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn exit_count(&self) -> usize {
        self.exits.load(Ordering::SeqCst)
    }

    pub fn last_params(&self) -> Option<SeenParams> {
        self.seen.lock().unwrap().last().cloned()
    }

    pub fn all_descriptors_were_valid(&self) -> bool {
        self.seen.lock().unwrap().iter().all(|p| p.descriptor_valid)
    }

    /// Poll until at least `count` runs started
    pub fn wait_for_runs(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.run_count() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.run_count() >= count
    }
}

impl PacketRouter for MockRouter {
    fn run(&self, params: RouterParams, shutdown: &RouterShutdown) -> Result<()> {
        let raw = params.interface_fd.as_raw_fd();
        // SAFETY: fcntl(F_GETFD) only inspects the descriptor
        let descriptor_valid = unsafe { libc::fcntl(raw, libc::F_GETFD) } >= 0;
        self.seen.lock().unwrap().push(SeenParams {
            router_address: params.router_address,
            proxy_address: params.proxy_address,
            secondary_proxy_address: params.secondary_proxy_address,
            transparent_dns: params.transparent_dns,
            descriptor_valid,
        });
        self.runs.fetch_add(1, Ordering::SeqCst);

        if !self.exit_early.load(Ordering::SeqCst) {
            shutdown.wait();
        }
        drop(params);
        self.exits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Engine driven by the test through the captured sink
#[derive(Default)]
pub struct MockEngine {
    fail_start: AtomicBool,
    fail_restart: AtomicBool,
    hold_stop: AtomicBool,
    stop_gate: tokio::sync::Notify,
    starts: AtomicUsize,
    stops: AtomicUsize,
    restarts: AtomicUsize,
    sink: Mutex<Option<EngineEventSink>>,
    parameters: Mutex<Vec<TunnelParameters>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_start() -> Arc<Self> {
        let engine = Self::default();
        engine.fail_start.store(true, Ordering::SeqCst);
        Arc::new(engine)
    }

    pub fn fail_restarts(&self) {
        self.fail_restart.store(true, Ordering::SeqCst);
    }

    /// Make `stop` wait until `release_stop` is called
    pub fn hold_stops(&self) {
        self.hold_stop.store(true, Ordering::SeqCst);
    }

    pub fn release_stop(&self) {
        self.stop_gate.notify_one();
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Parameters passed to every start and restart, in order
    pub fn parameters(&self) -> Vec<TunnelParameters> {
        self.parameters.lock().unwrap().clone()
    }

    /// Sink captured from the last start
    pub fn sink(&self) -> EngineEventSink {
        self.sink
            .lock()
            .unwrap()
            .clone()
            .expect("engine was not started")
    }

    pub fn emit(&self, event: EngineEvent) -> bool {
        self.sink().emit(event)
    }
}

#[async_trait]
impl TunnelEngine for MockEngine {
    async fn start_tunneling(&self, config: EngineConfig, events: EngineEventSink) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.parameters.lock().unwrap().push(config.parameters);
        *self.sink.lock().unwrap() = Some(events);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(VpnError::Engine("dial failed".to_string()));
        }
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.hold_stop.load(Ordering::SeqCst) {
            self.stop_gate.notified().await;
        }
    }

    async fn restart(&self, config: EngineConfig) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.parameters.lock().unwrap().push(config.parameters);
        if self.fail_restart.load(Ordering::SeqCst) {
            return Err(VpnError::Engine("reconnect refused".to_string()));
        }
        Ok(())
    }
}

/// Receive snapshots until one satisfies `predicate`
pub async fn wait_for_state(
    observer: &mut StateObserver,
    predicate: impl Fn(&SessionState) -> bool,
) -> Arc<SessionState> {
    let wait = async {
        loop {
            match observer.recv().await {
                Some(state) if predicate(&state) => return state,
                Some(_) => {}
                None => panic!("observer closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for state")
}

/// Receive snapshots until the event matches
pub async fn wait_for_event(observer: &mut StateObserver, event: SessionEvent) -> Arc<SessionState> {
    wait_for_state(observer, |s| s.event == Some(event)).await
}

/// Poll `condition` for up to two seconds
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
