//! Error types for the store.
//!
//! Errors raised while evaluating a slice either surface to the caller of the
//! triggering `peek`/`subscribe`, or, inside a propagation wave or a
//! dispatch, are routed to the store's [`ErrorHandler`] so that one failing
//! branch never stops unrelated ones.

use std::fmt::Display;
use std::sync::Arc;

use crate::graph::SliceId;
use crate::state::AtomId;

/// Errors that can occur while building, reading or updating the slice graph.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// A slice's evaluation re-entered itself, directly or transitively.
    #[error("cyclic graph detected at {0:?}")]
    CyclicGraph(SliceId),

    /// A peek was issued for a slice that is not currently evaluating.
    #[error("async peeks not allowed: {0:?} is not evaluating")]
    PeekOutsideEvaluation(SliceId),

    /// A propagation wave was started while another one was running.
    #[error("propagation already running")]
    PropagationRunning,

    /// An assignment's atom resolved to a slice without settable state.
    #[error("{0:?} is not backed by state")]
    NotAStateSlice(SliceId),

    /// A slice held a value of a different type than the reader expected.
    #[error("{slice:?} does not hold a value of type {expected}")]
    TypeMismatch {
        /// The slice that was read.
        slice: SliceId,
        /// Name of the type the reader asked for.
        expected: &'static str,
    },

    /// A named atom was found while deep-cloning a state tree.
    #[error("named atom {0:?} can't be cloned")]
    NamedAtomClone(String),

    /// A state tree reached an atom that contains itself.
    #[error("atom {0:?} contains itself")]
    CyclicState(AtomId),

    /// An atom handle was serialized outside of a store snapshot.
    #[error("atoms can only be serialized inside a store snapshot")]
    SnapshotInactive,

    /// The store behind a slice or subscription has been dropped.
    #[error("store has been dropped")]
    StoreDropped,

    /// An effect returned pending work outside of a tokio runtime.
    #[error("async effect returned outside of a tokio runtime")]
    NoRuntime,

    /// Persisted state could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An asynchronous effect failed after it was scheduled.
    #[error("effect failed: {0}")]
    Effect(String),

    /// A user-supplied evaluation or update function failed.
    #[error("evaluation failed: {0}")]
    Evaluation(String),
}

impl StoreError {
    /// Build an [`StoreError::Evaluation`] from any displayable message.
    pub fn evaluation(message: impl Display) -> Self {
        Self::Evaluation(message.to_string())
    }

    /// Build an [`StoreError::Effect`] from any displayable message.
    pub fn effect(message: impl Display) -> Self {
        Self::Effect(message.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Convenience alias for store results.
pub type StoreResult<T> = Result<T, StoreError>;

/// Hook receiving errors that were isolated instead of returned.
pub type ErrorHandler = Arc<dyn Fn(StoreError) + Send + Sync>;

/// The default error handler: log and carry on.
pub fn log_error(err: StoreError) {
    tracing::error!(error = %err, "unhandled store error");
}
