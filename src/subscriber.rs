//! State observers and the registry that feeds them
//!
//! The registry lock also serializes [`SubscriberRegistry::publish`], so
//! every subscriber sees snapshots in the order the store produced them.
//! Subscribers whose endpoint has gone away are pruned during delivery.

use crate::state::{SessionState, SessionStateStore, Transition};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::mpsc;

/// Identity used for duplicate detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocate a process-unique id
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        SubscriberId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "subscriber#{}", self.0)
    }
}

/// Why a delivery did not happen
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The observer's endpoint no longer exists
    #[error("subscriber endpoint is gone")]
    EndpointGone,

    /// Any other failure; the subscriber is kept
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Receiver of session state snapshots
///
/// `deliver` is called with the registry lock held and must not block for
/// long.
pub trait Subscriber: Send + Sync {
    fn id(&self) -> SubscriberId;

    fn deliver(&self, snapshot: &Arc<SessionState>) -> Result<(), DeliveryError>;
}

/// Registry of connected observers
pub struct SubscriberRegistry {
    store: Arc<SessionStateStore>,
    subscribers: Mutex<Vec<Arc<dyn Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn new(store: Arc<SessionStateStore>) -> Self {
        Self {
            store,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Store backing this registry
    pub fn store(&self) -> &Arc<SessionStateStore> {
        &self.store
    }

    /// Register a subscriber and send it the current snapshot
    ///
    /// Returns `false` when the subscriber was already registered or its
    /// endpoint vanished before the first delivery.
    pub fn register(&self, subscriber: Arc<dyn Subscriber>) -> bool {
        let mut subscribers = self.lock();
        let id = subscriber.id();
        if subscribers.iter().any(|s| s.id() == id) {
            log::debug!("{id} already registered");
            return false;
        }

        let snapshot = self.store.current();
        match subscriber.deliver(&snapshot) {
            Ok(()) => {}
            Err(DeliveryError::EndpointGone) => {
                log::debug!("{id} went away before registration completed");
                return false;
            }
            Err(e) => log::warn!("Initial delivery to {id} failed: {e}"),
        }

        subscribers.push(subscriber);
        log::debug!("{id} registered ({} total)", subscribers.len());
        true
    }

    /// Remove a subscriber; unknown ids are ignored
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id() != id);
        let removed = subscribers.len() != before;
        if removed {
            log::debug!("{id} unregistered");
        }
        removed
    }

    /// Deliver a snapshot to every registered subscriber
    pub fn broadcast(&self, snapshot: &Arc<SessionState>) {
        let mut subscribers = self.lock();
        Self::deliver_all(&mut subscribers, snapshot);
    }

    /// Apply a transition to the store and broadcast the result
    pub fn publish(&self, transition: Transition) -> Arc<SessionState> {
        let mut subscribers = self.lock();
        let snapshot = self.store.apply(transition);
        Self::deliver_all(&mut subscribers, &snapshot);
        snapshot
    }

    /// Number of registered subscribers
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn deliver_all(subscribers: &mut Vec<Arc<dyn Subscriber>>, snapshot: &Arc<SessionState>) {
        subscribers.retain(|subscriber| match subscriber.deliver(snapshot) {
            Ok(()) => true,
            Err(DeliveryError::EndpointGone) => {
                log::debug!("Pruning {}: endpoint gone", subscriber.id());
                false
            }
            Err(e) => {
                log::warn!("Delivery to {} failed: {e}", subscriber.id());
                true
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn Subscriber>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process subscriber backed by an unbounded channel
pub struct ChannelSubscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<Arc<SessionState>>,
}

impl Subscriber for ChannelSubscriber {
    fn id(&self) -> SubscriberId {
        self.id
    }

    fn deliver(&self, snapshot: &Arc<SessionState>) -> Result<(), DeliveryError> {
        self.tx
            .send(Arc::clone(snapshot))
            .map_err(|_| DeliveryError::EndpointGone)
    }
}

/// Create a connected subscriber / observer pair
pub fn channel() -> (Arc<ChannelSubscriber>, StateObserver) {
    let id = SubscriberId::next();
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(ChannelSubscriber { id, tx }),
        StateObserver {
            id,
            rx,
            disconnected: false,
            pending_unknown: false,
        },
    )
}

/// Receiving end of a [`ChannelSubscriber`]
pub struct StateObserver {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<Arc<SessionState>>,
    disconnected: bool,
    pending_unknown: bool,
}

impl StateObserver {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next snapshot
    ///
    /// After [`disconnect`](Self::disconnect) this yields a single unknown
    /// snapshot and then `None`.
    pub async fn recv(&mut self) -> Option<Arc<SessionState>> {
        if self.pending_unknown {
            self.pending_unknown = false;
            return Some(Arc::new(SessionState::unknown()));
        }
        if self.disconnected {
            return None;
        }
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<Arc<SessionState>> {
        if self.pending_unknown {
            self.pending_unknown = false;
            return Some(Arc::new(SessionState::unknown()));
        }
        if self.disconnected {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Intentionally leave the registry
    pub fn disconnect(&mut self, registry: &SubscriberRegistry) {
        if self.disconnected {
            return;
        }
        registry.unregister(self.id);
        self.rx.close();
        self.disconnected = true;
        self.pending_unknown = true;
    }
}

/// Subscriber writing one JSON snapshot per line to a byte stream
///
/// Writes happen on a dedicated thread, so a stalled reader never holds up
/// the registry. A broken pipe or reset on that thread marks the endpoint
/// gone and the next delivery reports it.
pub struct JsonLineSubscriber<W> {
    id: SubscriberId,
    lines: Option<mpsc::UnboundedSender<Vec<u8>>>,
    gone: Arc<AtomicBool>,
    writer: Option<JoinHandle<W>>,
}

impl<W: Write + Send + 'static> JsonLineSubscriber<W> {
    pub fn new(writer: W) -> Self {
        let id = SubscriberId::next();
        let (tx, rx) = mpsc::unbounded_channel();
        let gone = Arc::new(AtomicBool::new(false));

        let thread_gone = Arc::clone(&gone);
        let spawned = thread::Builder::new()
            .name("json-lines".to_string())
            .spawn(move || write_lines(writer, rx, &thread_gone));
        let (lines, writer) = match spawned {
            Ok(handle) => (Some(tx), Some(handle)),
            Err(e) => {
                log::error!("Cannot start writer for {id}: {e}");
                gone.store(true, Ordering::SeqCst);
                (None, None)
            }
        };

        Self {
            id,
            lines,
            gone,
            writer,
        }
    }

    /// Flush every queued line and recover the underlying writer
    ///
    /// Returns `None` when the writer thread never started or panicked.
    pub fn into_inner(mut self) -> Option<W> {
        self.lines.take();
        self.writer.take()?.join().ok()
    }
}

fn write_lines<W: Write>(
    mut writer: W,
    mut lines: mpsc::UnboundedReceiver<Vec<u8>>,
    gone: &AtomicBool,
) -> W {
    while let Some(line) = lines.blocking_recv() {
        let written = writer
            .write_all(&line)
            .and_then(|()| writer.flush())
            .map_err(classify_io_error);
        match written {
            Ok(()) => {}
            Err(DeliveryError::EndpointGone) => {
                log::debug!("JSON line reader went away");
                gone.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => log::warn!("Writing JSON line failed: {e}"),
        }
    }
    writer
}

impl<W: Write + Send + 'static> Subscriber for JsonLineSubscriber<W> {
    fn id(&self) -> SubscriberId {
        self.id
    }

    fn deliver(&self, snapshot: &Arc<SessionState>) -> Result<(), DeliveryError> {
        if self.gone.load(Ordering::SeqCst) {
            return Err(DeliveryError::EndpointGone);
        }
        let mut line = serde_json::to_vec(snapshot.as_ref())
            .map_err(|e| DeliveryError::Failed(e.to_string()))?;
        line.push(b'\n');

        match &self.lines {
            Some(lines) => lines.send(line).map_err(|_| DeliveryError::EndpointGone),
            None => Err(DeliveryError::EndpointGone),
        }
    }
}

fn classify_io_error(err: io::Error) -> DeliveryError {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => DeliveryError::EndpointGone,
        _ => DeliveryError::Failed(err.to_string()),
    }
}
