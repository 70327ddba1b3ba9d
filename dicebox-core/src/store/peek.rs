//! Store-aware reads handed to selectors, effects and thunks.

use std::sync::Arc;

use super::Store;
use crate::error::StoreResult;
use crate::graph::{downcast, extract_value, PullResolver, SlicePeek};
use crate::state::Readable;

enum Source<'a> {
    /// Inside a slice evaluation: reads become dependencies.
    Tracked(&'a SlicePeek<'a>),
    /// Inside a thunk: reads are untracked pulls sharing one set of marks.
    Pull(&'a PullResolver),
}

/// Reads atoms and selectors on behalf of a running derivation.
///
/// A `Peek` borrows the evaluation it was made for and can't escape it.
pub struct Peek<'a> {
    source: Source<'a>,
    store: &'a Store,
}

impl<'a> Peek<'a> {
    pub(crate) fn tracked(peek: &'a SlicePeek<'a>, store: &'a Store) -> Self {
        Self {
            source: Source::Tracked(peek),
            store,
        }
    }

    pub(crate) fn pull(resolver: &'a PullResolver, store: &'a Store) -> Self {
        Self {
            source: Source::Pull(resolver),
            store,
        }
    }

    /// Read `state`'s current value.
    pub fn get<R: Readable + ?Sized>(&self, state: &R) -> StoreResult<Arc<R::Value>> {
        let slice = self.store.wrap(state)?;
        let value = match self.source {
            Source::Tracked(peek) => peek.slice(&slice)?,
            Source::Pull(resolver) => extract_value(&slice, resolver)?,
        };
        downcast(slice.id(), value)
    }

    /// The store being read.
    pub fn store(&self) -> &Store {
        self.store
    }
}
