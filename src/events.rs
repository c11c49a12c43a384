//! Observable side effects for UI and logging collaborators.
//!
//! Events are fanned out over a `tokio::sync::broadcast` channel. Emitting
//! never blocks and never fails: with no subscribers the event is dropped,
//! and slow subscribers observe `RecvError::Lagged` instead of stalling the
//! data path.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Which tier an event or error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Cache,
    Remote,
    Local,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cache => write!(f, "cache"),
            Self::Remote => write!(f, "remote"),
            Self::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum HandlerEvent {
    #[serde(rename_all = "camelCase")]
    MigrationCompleted { legacy_key: String, new_key: String },
    CircuitOpened { circuit: String },
    CircuitClosed { circuit: String },
    SyncItemDeadLettered { key: String, attempts: u32 },
    QuotaExceeded { tier: Tier },
}

impl HandlerEvent {
    /// Stable event name (`circuit-opened`, ...).
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::MigrationCompleted { .. } => "migration-completed",
            Self::CircuitOpened { .. } => "circuit-opened",
            Self::CircuitClosed { .. } => "circuit-closed",
            Self::SyncItemDeadLettered { .. } => "sync-item-dead-lettered",
            Self::QuotaExceeded { .. } => "quota-exceeded",
        }
    }
}

/// Cloneable broadcast sender shared by every component that emits events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HandlerEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: HandlerEvent) {
        trace!(event = event.name(), "Emitting handler event");
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HandlerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
