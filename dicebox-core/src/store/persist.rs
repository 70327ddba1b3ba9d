//! Persistence
//!
//! [`PersistMiddleware`] keeps named atoms in a [`Storage`] backend. The
//! first time a store wraps a named atom, the stored JSON is decoded and
//! installed as the atom's state. After every propagation, each named atom
//! the middleware has seen is serialized and recorded if its text changed.
//! Named atoms that have been dropped are forgotten.
//!
//! Serialization runs inside a snapshot of the store, so anonymous atoms
//! nested in a named one are stored as their current value and come back as
//! fresh anonymous atoms. A named atom nested in another is an error.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::middleware::Middleware;
use super::Store;
use crate::error::StoreResult;
use crate::graph::{ChangeSet, Slice};
use crate::state::{snapshot, AnyAtom, AtomId, AtomRecord, Specifier};

/// A string key-value backend.
pub trait Storage: Send + Sync {
    /// Store `value` under `key`.
    fn record(&self, key: &str, value: &str);

    /// The value stored under `key`.
    fn retrieve(&self, key: &str) -> Option<String>;
}

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn record(&self, key: &str, value: &str) {
        (**self).record(key, value)
    }

    fn retrieve(&self, key: &str) -> Option<String> {
        (**self).retrieve(key)
    }
}

/// In-process storage. Clones share their contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn record(&self, key: &str, value: &str) {
        self.entries.lock().insert(key.to_owned(), value.to_owned());
    }

    fn retrieve(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }
}

#[derive(Clone)]
struct Tracked {
    atom: Weak<AtomRecord>,
    slice: Slice,
    key: String,
    last: Option<String>,
}

/// Persists named atoms to a [`Storage`].
pub struct PersistMiddleware<S> {
    storage: S,
    prefix: String,
    tracked: Mutex<IndexMap<AtomId, Tracked>>,
}

impl<S: Storage> PersistMiddleware<S> {
    /// Persist to `storage`, keyed by atom name.
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            prefix: String::new(),
            tracked: Mutex::new(IndexMap::new()),
        }
    }

    /// Prepend `prefix` to every storage key.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn rehydrate(&self, store: &Store, atom: &AnyAtom, name: &str, slice: &Slice) {
        let key = format!("{}{}", self.prefix, name);
        let stored = self.storage.retrieve(&key);
        if let Some(text) = &stored {
            match atom.decode(text).and_then(|value| slice.set_state(value)) {
                Ok(()) => tracing::debug!(key = %key, "atom rehydrated"),
                Err(err) => store.handle_error(err),
            }
        }
        self.tracked.lock().insert(
            atom.id(),
            Tracked {
                atom: atom.downgrade(),
                slice: slice.clone(),
                key,
                last: stored,
            },
        );
    }

    /// Named atoms that are still alive. Dropped ones stop being tracked.
    fn live_entries(&self) -> Vec<(AnyAtom, Tracked)> {
        let mut live = Vec::new();
        self.tracked.lock().retain(|_, entry| match AnyAtom::upgrade(&entry.atom) {
            Some(atom) => {
                live.push((atom, entry.clone()));
                true
            }
            None => {
                tracing::trace!(key = %entry.key, "persisted atom dropped");
                false
            }
        });
        live
    }

    fn persist(&self, store: &Store) {
        let entries = self.live_entries();
        let _snapshot = snapshot::enter(store);
        for (atom, entry) in entries {
            match encode(&atom, &entry.slice) {
                Ok(Some(text)) if entry.last.as_deref() != Some(text.as_str()) => {
                    self.storage.record(&entry.key, &text);
                    tracing::trace!(key = %entry.key, "atom persisted");
                    if let Some(tracked) = self.tracked.lock().get_mut(&atom.id()) {
                        tracked.last = Some(text);
                    }
                }
                Ok(_) => {}
                Err(err) => store.handle_error(err),
            }
        }
    }
}

fn encode(atom: &AnyAtom, slice: &Slice) -> StoreResult<Option<String>> {
    slice.current_state().map(|value| atom.encode(&value)).transpose()
}

impl<S: Storage> Middleware for PersistMiddleware<S> {
    fn attach(&self, _store: &Store) {
        tracing::debug!(prefix = %self.prefix, "persistence attached");
    }

    fn wrap(
        &self,
        store: &Store,
        specifier: &Specifier,
        next: &dyn Fn(&Specifier) -> StoreResult<Slice>,
    ) -> StoreResult<Slice> {
        let slice = next(specifier)?;
        if let Specifier::Atom(atom) = specifier {
            if let Some(name) = atom.name() {
                if !self.tracked.lock().contains_key(&atom.id()) {
                    self.rehydrate(store, atom, name, &slice);
                }
            }
        }
        Ok(slice)
    }

    fn propagate(&self, store: &Store, changes: ChangeSet, next: &dyn Fn(ChangeSet)) {
        next(changes);
        self.persist(store);
    }
}
