//! Slice Graph
//!
//! This module implements the reactive dependency graph underneath the store.
//!
//! # Overview
//!
//! The graph is made of slices:
//!
//! - State slices hold a value set from outside (they back atoms)
//! - Value slices derive a value from the slices they read (selectors)
//! - Callback slices run side effects and are always leaves (subscriptions)
//!
//! Edges are discovered while evaluating: every slice read through a
//! [`SlicePeek`] becomes a dependency. Slices with subscribers are live and
//! updated eagerly by propagation waves; the rest are cold and pulled on
//! demand.
//!
//! # Design Decisions
//!
//! 1. Edges live on the slices themselves rather than in a central table.
//!    Children are held weakly and dependencies strongly, so an unreachable
//!    sub-graph is freed once nothing subscribes to it.
//!
//! 2. Propagation does not sort the affected slices. A slice pulls any
//!    dependency that has not settled in the current wave, which gives the
//!    same result as a topological order for any queue order.
//!
//! 3. Re-entering an evaluating slice is an error, never a hang.

mod propagator;
mod pull;
mod scheduler;
mod slice;

pub use propagator::Propagator;
pub use pull::{extract_value, PullResolver};
pub use scheduler::{propagate, ChangeSet, WaveReport};
pub use slice::{
    downcast, downcast_ref, same_identity, same_value, Resolve, SameFn, Slice, SliceId, SliceKind, SlicePeek,
    SliceValue,
};
