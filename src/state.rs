//! Runtime state tracking for configured services.
//!
//! The [`StateManager`] owns the canonical lifecycle state per service id and
//! is the only component allowed to write it. Every accepted transition is
//! broadcast to subscribers; invalid transitions are rejected and emit
//! nothing.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::errors::GatewayError;

/// Capacity of the per-subscriber event ring. A subscriber that falls more
/// than this many events behind loses the oldest ones, never stalling the
/// state manager.
const EVENT_BUFFER: usize = 64;

// ─── ServiceState ────────────────────────────────────────────────────────────

/// Lifecycle state of one configured service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    /// Adapter constructed, no session.
    Stopped,
    /// A start was requested; the handshake is in flight.
    Starting,
    /// Protocol initialization completed.
    Running,
    /// The session failed and was not explicitly stopped.
    Error,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// The allowed-edge table.
///
/// Start: `STOPPED/ERROR → STARTING`. Handshake outcome: `STARTING → RUNNING`
/// or `STARTING → ERROR`. Session failure: `RUNNING → ERROR`. Explicit stop:
/// any non-stopped state `→ STOPPED`. Everything else, including same-state
/// writes, is invalid.
pub fn transition_allowed(from: ServiceState, to: ServiceState) -> bool {
    use ServiceState::*;
    matches!(
        (from, to),
        (Stopped, Starting)
            | (Error, Starting)
            | (Starting, Running)
            | (Starting, Error)
            | (Running, Error)
            | (Starting, Stopped)
            | (Running, Stopped)
            | (Error, Stopped)
    )
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// One accepted state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateEvent {
    pub service_id: String,
    pub from: ServiceState,
    pub to: ServiceState,
}

// ─── StateManager ───────────────────────────────────────────────────────────

/// Concurrency-safe keyed store of service states with transition fan-out.
///
/// The store mutex is never held across an `.await`, so transitions for
/// different service ids only contend for constant-time map access. Event
/// delivery uses a broadcast ring: slow subscribers drop their oldest events
/// instead of back-pressuring the emitter, and a subscription opened after a
/// transition never observes it.
pub struct StateManager {
    states: Mutex<HashMap<String, ServiceState>>,
    events: broadcast::Sender<StateEvent>,
}

impl StateManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            states: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Current state for a service; unknown ids read as `STOPPED`.
    pub fn get(&self, id: &str) -> ServiceState {
        self.states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .copied()
            .unwrap_or(ServiceState::Stopped)
    }

    /// Record a service at `STOPPED` without emitting an event.
    ///
    /// Called once when an adapter is constructed. A no-op for known ids.
    pub fn register(&self, id: &str) {
        self.states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(id.to_string())
            .or_insert(ServiceState::Stopped);
    }

    /// Forget a service entirely (config reload removed it).
    pub fn remove(&self, id: &str) {
        self.states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id);
    }

    /// Apply a transition, validating it against the allowed-edge table.
    ///
    /// An accepted transition emits exactly one event. A rejected one emits
    /// nothing and surfaces `InvalidTransition` to the caller.
    pub fn set(&self, id: &str, to: ServiceState) -> Result<(), GatewayError> {
        let event = {
            let mut states = self
                .states
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let from = states.get(id).copied().unwrap_or(ServiceState::Stopped);

            if !transition_allowed(from, to) {
                return Err(GatewayError::InvalidTransition {
                    service: id.to_string(),
                    from,
                    to,
                });
            }

            states.insert(id.to_string(), to);
            StateEvent {
                service_id: id.to_string(),
                from,
                to,
            }
        };

        tracing::debug!(
            service = %event.service_id,
            from = %event.from,
            to = %event.to,
            "service state transition"
        );

        // Send fails only when no subscriber exists, which is fine.
        let _ = self.events.send(event);
        Ok(())
    }

    /// Subscribe to all transitions accepted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Snapshot of all known service states.
    pub fn snapshot(&self) -> HashMap<String, ServiceState> {
        self.states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
