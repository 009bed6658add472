//! Session state snapshots and the store that owns the current one
//!
//! A [`SessionState`] is never mutated after it is published. Every change
//! goes through a named [`Transition`] which builds a brand-new snapshot from
//! the previous one, and [`SessionStateStore::apply`] swaps it in under a
//! single lock so transitions are totally ordered.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Connectivity event reported to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    Stopped,
    Connecting,
    Connected,
    Stopping,
    Exiting,
}

impl SessionEvent {
    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            SessionEvent::Stopped => "Stopped",
            SessionEvent::Connecting => "Connecting...",
            SessionEvent::Connected => "Connected",
            SessionEvent::Stopping => "Stopping...",
            SessionEvent::Exiting => "Exiting",
        }
    }
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Last error recorded for the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub code: ErrorCode,
    /// Free-form context, e.g. the conflicting port number
    pub context_data: Option<String>,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

/// Immutable snapshot of the session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// `None` while the state is unknown to the observer
    pub event: Option<SessionEvent>,
    pub waiting_for_network: bool,
    pub client_region: Option<String>,
    pub connected_server_region: Option<String>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub upstream_rate_limit: Option<u64>,
    pub downstream_rate_limit: Option<u64>,
    pub available_regions: Vec<String>,
    pub local_proxy_port: Option<u16>,
    pub secondary_proxy_port: Option<u16>,
    pub application_parameters: serde_json::Map<String, serde_json::Value>,
    pub last_error: Option<LastError>,
}

impl SessionState {
    /// Initial state of a freshly constructed controller
    pub fn stopped() -> Self {
        Self {
            event: Some(SessionEvent::Stopped),
            ..Self::default()
        }
    }

    /// Snapshot with no known event, sent when an observer drops its channel
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.event == Some(SessionEvent::Connected)
    }

    /// Total bytes transferred in both directions
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }

    /// Serialize the snapshot for out-of-process observers
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Named state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    SetEvent(Option<SessionEvent>),
    SetWaitingForNetwork(bool),
    SetClientRegion(String),
    SetServerRegion(String),
    /// Additive, never replaces the counters
    AddBytesTransferred { sent: u64, received: u64 },
    SetRateLimits {
        upstream: Option<u64>,
        downstream: Option<u64>,
    },
    SetLocalProxyPort(u16),
    SetSecondaryProxyPort(u16),
    SetApplicationParameters(serde_json::Map<String, serde_json::Value>),
    SetAvailableRegions(Vec<String>),
    /// Stamped with the current time when applied
    SetError {
        code: ErrorCode,
        context: Option<String>,
    },
    ClearError,
    /// Back to `Stopped`, keeping available regions and the last error
    Reset,
    /// Fresh counters, no error and `Connecting`, as one snapshot
    BeginSession,
}

impl Transition {
    /// Build the successor of `state`
    pub fn apply(self, state: &SessionState) -> SessionState {
        let mut next = state.clone();
        match self {
            Transition::SetEvent(event) => next.event = event,
            Transition::SetWaitingForNetwork(waiting) => next.waiting_for_network = waiting,
            Transition::SetClientRegion(region) => next.client_region = Some(region),
            Transition::SetServerRegion(region) => next.connected_server_region = Some(region),
            Transition::AddBytesTransferred { sent, received } => {
                next.bytes_sent = next.bytes_sent.saturating_add(sent);
                next.bytes_received = next.bytes_received.saturating_add(received);
            }
            Transition::SetRateLimits {
                upstream,
                downstream,
            } => {
                next.upstream_rate_limit = upstream;
                next.downstream_rate_limit = downstream;
            }
            Transition::SetLocalProxyPort(port) => next.local_proxy_port = Some(port),
            Transition::SetSecondaryProxyPort(port) => next.secondary_proxy_port = Some(port),
            Transition::SetApplicationParameters(params) => next.application_parameters = params,
            Transition::SetAvailableRegions(regions) => next.available_regions = regions,
            Transition::SetError { code, context } => {
                next.last_error = Some(LastError {
                    code,
                    context_data: context,
                    timestamp_ms: now_millis(),
                })
            }
            Transition::ClearError => next.last_error = None,
            Transition::Reset => {
                next = SessionState {
                    available_regions: std::mem::take(&mut next.available_regions),
                    last_error: next.last_error.take(),
                    ..SessionState::stopped()
                }
            }
            Transition::BeginSession => {
                next = SessionState {
                    event: Some(SessionEvent::Connecting),
                    available_regions: std::mem::take(&mut next.available_regions),
                    ..SessionState::default()
                }
            }
        }
        next
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Holder of the single authoritative snapshot
#[derive(Debug)]
pub struct SessionStateStore {
    current: Mutex<Arc<SessionState>>,
}

impl SessionStateStore {
    pub fn new(initial: SessionState) -> Self {
        Self {
            current: Mutex::new(Arc::new(initial)),
        }
    }

    /// Get the current snapshot
    pub fn current(&self) -> Arc<SessionState> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a transition and return the snapshot it produced
    pub fn apply(&self, transition: Transition) -> Arc<SessionState> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(transition.apply(&current));
        *current = Arc::clone(&next);
        next
    }
}

impl Default for SessionStateStore {
    fn default() -> Self {
        Self::new(SessionState::stopped())
    }
}
