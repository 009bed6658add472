//! Full session flow against in-memory collaborators

use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tunnel_session::address;
use tunnel_session::engine::EngineConfig;
use tunnel_session::platform::{InterfaceSpec, VirtualInterfacePlatform};
use tunnel_session::router::{PacketRouter, RouterParams, RouterShutdown};
use tunnel_session::settings::MemorySettingsStore;
use tunnel_session::subscriber::JsonLineSubscriber;
use tunnel_session::{
    EngineEvent, EngineEventSink, ErrorCode, InterfaceRoutingManager, LifecycleState, ProxyKind,
    Result, RoutingSettings, SessionController, SessionEvent, SessionState, SettingsStore,
    StateObserver, Subscriber, TunnelEngine, TunnelParameters,
};

#[derive(Default)]
struct FilePlatform {
    established: AtomicUsize,
    released: AtomicUsize,
}

impl VirtualInterfacePlatform for FilePlatform {
    fn establish(&self, _spec: &InterfaceSpec) -> Option<OwnedFd> {
        self.established.fetch_add(1, Ordering::SeqCst);
        tempfile::tempfile().ok().map(OwnedFd::from)
    }

    fn protect(&self, _fd: RawFd) -> bool {
        true
    }

    fn release(&self, _spec: &InterfaceSpec) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingRouter {
    proxies: Mutex<Vec<SocketAddrV4>>,
    exits: AtomicUsize,
}

impl PacketRouter for RecordingRouter {
    fn run(&self, params: RouterParams, shutdown: &RouterShutdown) -> Result<()> {
        self.proxies.lock().unwrap().push(params.proxy_address);
        shutdown.wait();
        self.exits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedEngine {
    sink: Mutex<Option<EngineEventSink>>,
    regions: Mutex<Vec<String>>,
    stops: AtomicUsize,
}

impl ScriptedEngine {
    fn emit(&self, event: EngineEvent) {
        let sink = self.sink.lock().unwrap().clone().expect("engine not started");
        assert!(sink.emit(event));
    }
}

#[async_trait]
impl TunnelEngine for ScriptedEngine {
    async fn start_tunneling(&self, config: EngineConfig, events: EngineEventSink) -> Result<()> {
        self.regions
            .lock()
            .unwrap()
            .push(config.parameters.egress_region);
        *self.sink.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    async fn restart(&self, _config: EngineConfig) -> Result<()> {
        Ok(())
    }
}

async fn next_matching(
    observer: &mut StateObserver,
    predicate: impl Fn(&SessionState) -> bool,
) -> Arc<SessionState> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = observer.recv().await.expect("observer closed");
            if predicate(&state) {
                return state;
            }
        }
    })
    .await
    .expect("timed out waiting for state")
}

#[tokio::test]
async fn test_socks_port_conflict_ends_session() {
    let _ = env_logger::builder().is_test(true).try_init();

    let platform = Arc::new(FilePlatform::default());
    let router = Arc::new(RecordingRouter::default());
    let engine = Arc::new(ScriptedEngine::default());
    let settings = Arc::new(MemorySettingsStore::new());

    let manager =
        InterfaceRoutingManager::acquire(platform.clone(), router.clone(), RoutingSettings::default())
            .unwrap()
            .with_address_selector(|| address::select_from(&[Ipv4Addr::new(192, 168, 1, 20)]));
    let controller = SessionController::spawn(manager, engine.clone(), settings.clone());
    let mut observer = controller.subscribe();
    let json_lines = Arc::new(JsonLineSubscriber::new(Vec::new()));
    assert!(controller.registry().register(json_lines.clone()));

    controller
        .start(Some(TunnelParameters::new("US")))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), controller.wait_for(LifecycleState::Running))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(engine.regions.lock().unwrap().as_slice(), ["US"]);
    assert_eq!(
        settings.load_stored_parameters().unwrap(),
        Some(TunnelParameters::new("US"))
    );

    engine.emit(EngineEvent::ListeningPort {
        which: ProxyKind::Socks,
        port: 1080,
    });
    engine.emit(EngineEvent::Connected);

    let connected = next_matching(&mut observer, |s| s.event == Some(SessionEvent::Connected)).await;
    assert_eq!(connected.local_proxy_port, Some(1080));

    let manager = Arc::clone(controller.routing_manager());
    let routed = async {
        while !manager.is_routing() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), routed).await.unwrap();
    assert_eq!(
        manager.proxy_address(),
        Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1080))
    );
    assert_eq!(
        manager.private_address().map(|a| a.interface_ip),
        Some(Ipv4Addr::new(10, 0, 0, 1))
    );

    engine.emit(EngineEvent::PortInUse {
        which: ProxyKind::Socks,
        port: 1080,
    });

    next_matching(&mut observer, |s| s.event == Some(SessionEvent::Stopping)).await;
    let stopped = next_matching(&mut observer, |s| s.event == Some(SessionEvent::Stopped)).await;
    let error = stopped.last_error.clone().expect("error preserved");
    assert_eq!(error.code, ErrorCode::SocksPortInUse);
    assert_eq!(error.context_data.as_deref(), Some("1080"));

    tokio::time::timeout(Duration::from_secs(5), controller.wait_for(LifecycleState::Stopped))
        .await
        .unwrap()
        .unwrap();
    assert!(!manager.is_routing());
    assert!(!manager.is_established());
    assert_eq!(router.exits.load(Ordering::SeqCst), 1);
    assert_eq!(platform.released.load(Ordering::SeqCst), 1);
    assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
    assert_eq!(*router.proxies.lock().unwrap(), vec![SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1080)]);

    drop(manager);
    let registry = Arc::clone(controller.registry());
    controller.shutdown().await.unwrap();
    let last = next_matching(&mut observer, |s| s.event == Some(SessionEvent::Exiting)).await;
    assert_eq!(
        last.last_error.as_ref().map(|e| e.code),
        Some(ErrorCode::SocksPortInUse)
    );

    assert!(registry.unregister(json_lines.id()));
    assert_serialized_history(json_lines);
}

/// The serialized observer saw the same ordered history
fn assert_serialized_history(subscriber: Arc<JsonLineSubscriber<Vec<u8>>>) {
    let subscriber = Arc::try_unwrap(subscriber)
        .ok()
        .expect("subscriber still shared");
    let output = String::from_utf8(subscriber.into_inner().expect("writer finished")).unwrap();
    let events: Vec<Option<SessionEvent>> = output
        .lines()
        .map(|l| serde_json::from_str::<SessionState>(l).unwrap().event)
        .collect();

    assert_eq!(events.first(), Some(&Some(SessionEvent::Stopped)));
    let connected = events
        .iter()
        .position(|e| *e == Some(SessionEvent::Connected))
        .unwrap();
    let stopping = events
        .iter()
        .rposition(|e| *e == Some(SessionEvent::Stopping))
        .unwrap();
    assert!(connected < stopping);
    assert_eq!(events.last(), Some(&Some(SessionEvent::Exiting)));
}
