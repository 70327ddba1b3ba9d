//! Selectors
//!
//! A selector is a pure derivation over other atoms and selectors. Building
//! a selector twice from the same function yields the same selector, so every
//! store keeps one slice per derivation however often the selector is built.
//!
//! Function identity is only stable for zero-sized functions (fn items and
//! non-capturing closures), which are keyed by their `TypeId`. A capturing
//! closure builds a fresh selector every time unless it is given an explicit
//! key with [`Selector::keyed`].

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::StoreResult;
use crate::graph::{same_value, SameFn, SliceValue};
use crate::store::{Peek, Store};

type SelectFn = dyn Fn(&Peek<'_>, &Store) -> StoreResult<SliceValue> + Send + Sync;

/// Unique identifier for a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SelectorId(u64);

impl SelectorId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

pub(crate) struct SelectorRecord {
    id: SelectorId,
    value_type: TypeId,
    select: Box<SelectFn>,
    same: SameFn,
}

/// A selector with its value type erased.
#[derive(Clone)]
pub struct AnySelector {
    record: Arc<SelectorRecord>,
}

impl AnySelector {
    /// Get the selector's ID.
    pub fn id(&self) -> SelectorId {
        self.record.id
    }

    pub(crate) fn select(&self, peek: &Peek<'_>, store: &Store) -> StoreResult<SliceValue> {
        (self.record.select)(peek, store)
    }

    pub(crate) fn same(&self) -> SameFn {
        self.record.same
    }

    pub(crate) fn downgrade(&self) -> Weak<SelectorRecord> {
        Arc::downgrade(&self.record)
    }

    pub(crate) fn upgrade(record: &Weak<SelectorRecord>) -> Option<Self> {
        record.upgrade().map(|record| Self { record })
    }
}

impl PartialEq for AnySelector {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for AnySelector {}

impl Hash for AnySelector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for AnySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Selector").field(&self.id()).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SelectorKey {
    Function(TypeId),
    Named(String),
}

fn registry() -> &'static DashMap<SelectorKey, AnySelector> {
    static REGISTRY: OnceLock<DashMap<SelectorKey, AnySelector>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// A typed handle to a derivation producing a `V`.
pub struct Selector<V> {
    any: AnySelector,
    _marker: PhantomData<fn() -> V>,
}

impl<V: PartialEq + Send + Sync + 'static> Selector<V> {
    /// Build the selector for `select`.
    ///
    /// The derivation reads other state through the peek handle; the store
    /// is there for selectors that hand out assignments or nested selectors.
    pub fn new<F>(select: F) -> Self
    where
        F: Fn(&Peek<'_>, &Store) -> StoreResult<V> + Send + Sync + 'static,
    {
        if std::mem::size_of::<F>() == 0 {
            Self::memoized(SelectorKey::Function(TypeId::of::<F>()), select)
        } else {
            Self::fresh(select)
        }
    }

    /// Build the selector registered under `key`, or register `select` under it.
    pub fn keyed<F>(key: impl Into<String>, select: F) -> Self
    where
        F: Fn(&Peek<'_>, &Store) -> StoreResult<V> + Send + Sync + 'static,
    {
        Self::memoized(SelectorKey::Named(key.into()), select)
    }

    fn fresh<F>(select: F) -> Self
    where
        F: Fn(&Peek<'_>, &Store) -> StoreResult<V> + Send + Sync + 'static,
    {
        Self {
            any: AnySelector {
                record: Arc::new(SelectorRecord {
                    id: SelectorId::next(),
                    value_type: TypeId::of::<V>(),
                    select: Box::new(move |peek, store| Ok(Arc::new(select(peek, store)?) as SliceValue)),
                    same: same_value::<V>,
                }),
            },
            _marker: PhantomData,
        }
    }

    fn memoized<F>(key: SelectorKey, select: F) -> Self
    where
        F: Fn(&Peek<'_>, &Store) -> StoreResult<V> + Send + Sync + 'static,
    {
        match registry().entry(key) {
            Entry::Occupied(entry) if entry.get().record.value_type == TypeId::of::<V>() => Self {
                any: entry.get().clone(),
                _marker: PhantomData,
            },
            Entry::Occupied(entry) => {
                tracing::warn!(key = ?entry.key(), "selector key reused for another value type");
                drop(entry);
                Self::fresh(select)
            }
            Entry::Vacant(entry) => {
                let selector = Self::fresh(select);
                entry.insert(selector.any.clone());
                selector
            }
        }
    }
}

impl<V> Selector<V> {
    /// Get the selector's ID.
    pub fn id(&self) -> SelectorId {
        self.any.id()
    }

    /// The selector with its value type erased.
    pub fn as_any(&self) -> &AnySelector {
        &self.any
    }
}

impl<V> Clone for Selector<V> {
    fn clone(&self) -> Self {
        Self {
            any: self.any.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V> PartialEq for Selector<V> {
    fn eq(&self, other: &Self) -> bool {
        self.any == other.any
    }
}

impl<V> Eq for Selector<V> {}

impl<V> fmt::Debug for Selector<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.any.fmt(f)
    }
}
