//! Middleware
//!
//! A middleware intercepts the store's operations. Each hook receives the
//! operation's input and a `next` continuation running the rest of the
//! chain; the default hooks pass straight through. The first middleware
//! added to the builder is the outermost.

use super::action::Assignment;
use super::subscribe::{Effect, Subscription};
use super::Store;
use crate::error::StoreResult;
use crate::graph::{ChangeSet, Slice, SliceValue};
use crate::state::Specifier;

/// Hooks around the store's operations.
pub trait Middleware: Send + Sync {
    /// Called once when the store is built.
    fn attach(&self, _store: &Store) {}

    /// Map a specifier to its slice.
    fn wrap(
        &self,
        _store: &Store,
        specifier: &Specifier,
        next: &dyn Fn(&Specifier) -> StoreResult<Slice>,
    ) -> StoreResult<Slice> {
        next(specifier)
    }

    /// Apply a flattened batch of assignments.
    fn dispatch(
        &self,
        _store: &Store,
        assignments: Vec<Assignment>,
        next: &dyn Fn(Vec<Assignment>) -> StoreResult<()>,
    ) -> StoreResult<()> {
        next(assignments)
    }

    /// Read a slice.
    fn peek(
        &self,
        _store: &Store,
        slice: &Slice,
        next: &dyn Fn(&Slice) -> StoreResult<SliceValue>,
    ) -> StoreResult<SliceValue> {
        next(slice)
    }

    /// Subscribe an effect.
    fn subscribe(
        &self,
        _store: &Store,
        effect: &Effect,
        next: &dyn Fn(&Effect) -> StoreResult<Subscription>,
    ) -> StoreResult<Subscription> {
        next(effect)
    }

    /// Propagate changes. `next` returns once the changes are settled or,
    /// when a wave is already running, queued.
    fn propagate(&self, _store: &Store, changes: ChangeSet, next: &dyn Fn(ChangeSet)) {
        next(changes)
    }
}

pub(crate) fn wrap(store: &Store, index: usize, specifier: &Specifier) -> StoreResult<Slice> {
    match store.middlewares().get(index) {
        Some(middleware) => middleware.wrap(store, specifier, &|specifier| wrap(store, index + 1, specifier)),
        None => store.wrap_base(specifier),
    }
}

pub(crate) fn dispatch(store: &Store, index: usize, assignments: Vec<Assignment>) -> StoreResult<()> {
    match store.middlewares().get(index) {
        Some(middleware) => {
            middleware.dispatch(store, assignments, &|assignments| dispatch(store, index + 1, assignments))
        }
        None => store.dispatch_base(assignments),
    }
}

pub(crate) fn peek(store: &Store, index: usize, slice: &Slice) -> StoreResult<SliceValue> {
    match store.middlewares().get(index) {
        Some(middleware) => middleware.peek(store, slice, &|slice| peek(store, index + 1, slice)),
        None => store.peek_base(slice),
    }
}

pub(crate) fn subscribe(store: &Store, index: usize, effect: &Effect) -> StoreResult<Subscription> {
    match store.middlewares().get(index) {
        Some(middleware) => middleware.subscribe(store, effect, &|effect| subscribe(store, index + 1, effect)),
        None => store.subscribe_base(effect),
    }
}

pub(crate) fn propagate(store: &Store, index: usize, changes: ChangeSet) {
    match store.middlewares().get(index) {
        Some(middleware) => middleware.propagate(store, changes, &|changes| propagate(store, index + 1, changes)),
        None => store.propagate_base(changes),
    }
}
