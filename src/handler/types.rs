//! Public types for the data handler.

use thiserror::Error;

use crate::config::ConfigError;
use crate::events::Tier;
use crate::key::KeyError;
use crate::storage::traits::StorageError;

/// Handler lifecycle state.
///
/// Use [`super::DataHandler::state()`] to check the current state or
/// [`super::DataHandler::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerState {
    /// Just created, nothing opened yet
    Created,
    /// Validating config, rebuilding the sync queue
    Initializing,
    /// All components built, worker not yet started
    Ready,
    /// Serving requests, background worker active
    Running,
    /// Worker stopping, final drain in progress
    ShuttingDown,
    /// No further operations accepted
    Closed,
}

impl HandlerState {
    /// Whether API calls are still accepted.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::ShuttingDown | Self::Closed)
    }
}

impl std::fmt::Display for HandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Errors surfaced by the public API.
///
/// A read miss is not an error: reads return `Ok(None)`. Remote failures
/// never show up here on their own; they only surface as part of
/// [`HandlerError::AllTiersFailed`] once the local tier has failed too.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    /// Value could not be encoded or decoded. Never affects circuit state.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Still over quota after the eviction pass.
    #[error("storage quota exceeded on the {tier} tier")]
    QuotaExceeded { tier: Tier },

    #[error("all tiers failed (remote: {remote}; local: {local})")]
    AllTiersFailed {
        remote: StorageError,
        local: StorageError,
    },

    #[error("local storage error: {0}")]
    Local(StorageError),

    #[error("data handler is shut down")]
    Closed,
}

impl HandlerError {
    /// Classify a local-tier failure.
    pub(crate) fn from_local(err: StorageError) -> Self {
        match err {
            StorageError::Serialization(msg) => Self::Serialization(msg),
            StorageError::QuotaExceeded { .. } => Self::QuotaExceeded { tier: Tier::Local },
            other => Self::Local(other),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("failed to open local storage: {0}")]
    Storage(#[from] StorageError),
}
