//! Scheduler error taxonomy.
//!
//! Errors fall into the categories the rest of the system dispatches on:
//!
//! - **Not found**: a durable lookup missed; test with [`CoreError::is_not_found`].
//! - **Conflict**: device-type, round-id, or identity assertions that reject a
//!   request without any state change.
//! - **Transient**: store or node-RPC failures; callers make no progress and
//!   rely on deadline-driven retry (next round, replacement dispatch).
//! - **Policy denied**: unauthorized tokens, unregistered devices.
//!
//! The engines recover transient errors locally and surface only policy
//! denials, not-found, and invariant violations to callers.

use crate::registry::TransportError;
use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by the scheduler core.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
    /// No registration row exists for the device.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The connecting node's type disagrees with its registration.
    #[error("node type mismatch for {device_id}: registered {registered}, got {actual}")]
    TypeMismatch {
        device_id: String,
        registered: crate::types::NodeType,
        actual: crate::types::NodeType,
    },

    /// A validation result arrived for a round that is no longer current.
    #[error("round id mismatch: expected {expected}, got {got}")]
    RoundMismatch { expected: u64, got: u64 },

    /// A manual validation round was requested while one is in progress.
    #[error("validation round already in progress")]
    InProgress,

    /// The caller is not allowed to perform the operation.
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    /// Malformed caller input rejected before any state change.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Persistent or ephemeral store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Node RPC failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CoreError {
    /// Returns `true` if the error is a missing durable record.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::Store(e) if e.is_not_found())
    }

    /// Returns `true` for errors that reject a request without state change.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CoreError::TypeMismatch { .. } | CoreError::RoundMismatch { .. } | CoreError::InProgress
        )
    }

    /// Returns `true` when retrying later can succeed without intervention.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Store(e) => e.is_transient(),
            CoreError::Transport(_) => true,
            _ => false,
        }
    }
}
