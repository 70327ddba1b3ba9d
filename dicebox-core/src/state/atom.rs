//! Atoms
//!
//! An atom is an addressable unit of mutable state. The handle itself holds
//! no value: each store keeps a state slice per atom, seeded with the atom's
//! default on first use. Atoms may hold other atoms, which stay opaque ids
//! into the store's slice table.

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::snapshot::{self, Encoded};
use crate::error::{StoreError, StoreResult};
use crate::graph::{downcast_ref, same_value, SameFn, SliceId, SliceValue};
use crate::store::Assignment;

/// Values an atom can hold: plain, comparable, JSON-shaped data.
pub trait StateValue: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> StateValue for T where T: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Unique identifier for an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomId(u64);

impl AtomId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Type-erased operations captured when the atom is built.
#[derive(Clone, Copy)]
pub(crate) struct AtomCodec {
    pub(crate) same: SameFn,
    encode: fn(&SliceValue) -> StoreResult<String>,
    decode: fn(&str) -> StoreResult<SliceValue>,
    value_type: TypeId,
    type_name: &'static str,
}

impl AtomCodec {
    fn of<T: StateValue>() -> Self {
        Self {
            same: same_value::<T>,
            encode: encode::<T>,
            decode: decode::<T>,
            value_type: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }
}

fn encode<T: StateValue>(value: &SliceValue) -> StoreResult<String> {
    let value = (**value)
        .downcast_ref::<T>()
        .ok_or_else(|| StoreError::Serialization(format!("expected a {}", std::any::type_name::<T>())))?;
    serde_json::to_string(value).map_err(snapshot::recover)
}

fn decode<T: StateValue>(text: &str) -> StoreResult<SliceValue> {
    let value: T = serde_json::from_str(text)?;
    Ok(Arc::new(value) as SliceValue)
}

pub(crate) struct AtomRecord {
    id: AtomId,
    name: Option<String>,
    default: SliceValue,
    codec: AtomCodec,
}

/// An atom with its value type erased.
#[derive(Clone)]
pub struct AnyAtom {
    record: Arc<AtomRecord>,
}

impl AnyAtom {
    /// Get the atom's ID.
    pub fn id(&self) -> AtomId {
        self.record.id
    }

    /// The stable name of a named atom.
    pub fn name(&self) -> Option<&str> {
        self.record.name.as_deref()
    }

    /// The value a store starts this atom with.
    pub fn default_value(&self) -> SliceValue {
        self.record.default.clone()
    }

    /// Name of the atom's value type.
    pub fn type_name(&self) -> &'static str {
        self.record.codec.type_name
    }

    /// Encode a value of this atom as JSON.
    ///
    /// Nested atoms only encode inside a store snapshot.
    pub fn encode(&self, value: &SliceValue) -> StoreResult<String> {
        (self.record.codec.encode)(value)
    }

    /// Decode a JSON value of this atom.
    pub fn decode(&self, text: &str) -> StoreResult<SliceValue> {
        (self.record.codec.decode)(text)
    }

    pub(crate) fn same(&self) -> SameFn {
        self.record.codec.same
    }

    pub(crate) fn downgrade(&self) -> Weak<AtomRecord> {
        Arc::downgrade(&self.record)
    }

    pub(crate) fn upgrade(record: &Weak<AtomRecord>) -> Option<Self> {
        record.upgrade().map(|record| Self { record })
    }
}

impl PartialEq for AnyAtom {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for AnyAtom {}

impl Hash for AnyAtom {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for AnyAtom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("id", &self.id())
            .field("name", &self.record.name)
            .field("type", &self.type_name())
            .finish()
    }
}

/// A typed handle to a unit of mutable state.
///
/// Cloning yields another handle to the same atom. Equality and hashing go
/// by identity, never by value.
pub struct Atom<T> {
    any: AnyAtom,
    _marker: PhantomData<fn() -> T>,
}

impl<T: StateValue> Atom<T> {
    /// Create an anonymous atom starting at `initial`.
    pub fn new(initial: T) -> Self {
        Self::build(None, initial)
    }

    /// Create a named atom. Named atoms are the ones persistence tracks.
    ///
    /// An empty name builds an anonymous atom.
    pub fn named(name: impl Into<String>, initial: T) -> Self {
        let name = name.into();
        Self::build((!name.is_empty()).then_some(name), initial)
    }

    fn build(name: Option<String>, initial: T) -> Self {
        Self {
            any: AnyAtom {
                record: Arc::new(AtomRecord {
                    id: AtomId::next(),
                    name,
                    default: Arc::new(initial),
                    codec: AtomCodec::of::<T>(),
                }),
            },
            _marker: PhantomData,
        }
    }

    /// Assign `value` to the atom.
    pub fn set(&self, value: T) -> Assignment {
        Assignment::set(self.any.clone(), Arc::new(value))
    }

    /// Derive the atom's next value from its current one.
    pub fn update<F>(&self, update: F) -> Assignment
    where
        F: FnOnce(&T) -> T + Send + 'static,
    {
        self.try_update(move |last| Ok(update(last)))
    }

    /// Like [`Atom::update`], for updates that can fail.
    ///
    /// A failure is reported to the store's error handler and leaves the atom
    /// unchanged.
    pub fn try_update<F>(&self, update: F) -> Assignment
    where
        F: FnOnce(&T) -> StoreResult<T> + Send + 'static,
    {
        Assignment::update(
            self.any.clone(),
            Box::new(move |slice: SliceId, last: &SliceValue| {
                let last = downcast_ref::<T>(slice, last)?;
                Ok(Arc::new(update(last)?) as SliceValue)
            }),
        )
    }
}

impl<T: 'static> Atom<T> {
    /// Recover the typed handle of an erased atom.
    pub(crate) fn from_any(any: AnyAtom) -> StoreResult<Self> {
        if any.record.codec.value_type != TypeId::of::<T>() {
            return Err(StoreError::Serialization(format!(
                "atom {:?} holds a {}, not a {}",
                any.id(),
                any.type_name(),
                std::any::type_name::<T>()
            )));
        }
        Ok(Self {
            any,
            _marker: PhantomData,
        })
    }
}

impl<T> Atom<T> {
    /// Get the atom's ID.
    pub fn id(&self) -> AtomId {
        self.any.id()
    }

    /// The stable name of a named atom.
    pub fn name(&self) -> Option<&str> {
        self.any.name()
    }

    /// The atom with its value type erased.
    pub fn as_any(&self) -> &AnyAtom {
        &self.any
    }
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            any: self.any.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for Atom<T> {
    fn eq(&self, other: &Self) -> bool {
        self.any == other.any
    }
}

impl<T> Eq for Atom<T> {}

impl<T> Hash for Atom<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.any.hash(state);
    }
}

impl<T> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.any.fmt(f)
    }
}

/// Serializes the atom against the active snapshot: its current value, or a
/// reference to it while the snapshot is cloning.
impl<T: StateValue> Serialize for Atom<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match snapshot::encode_atom(self).map_err(S::Error::custom)? {
            Encoded::Reference(raw) => serializer.serialize_u64(raw),
            Encoded::Value(value, _visit) => T::serialize(&value, serializer),
        }
    }
}

/// Deserializes into a fresh anonymous atom defaulting to the decoded value,
/// or into the clone of a referenced atom while a snapshot is cloning.
impl<'de, T: StateValue> Deserialize<'de> for Atom<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if snapshot::is_cloning() {
            let raw = u64::deserialize(deserializer)?;
            return snapshot::clone_atom(raw).map_err(D::Error::custom);
        }
        T::deserialize(deserializer).map(Atom::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atoms_compare_by_identity() {
        let a = Atom::new(1_u32);
        let b = Atom::new(1_u32);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn empty_names_build_anonymous_atoms() {
        assert_eq!(Atom::named("red", 0_u8).name(), Some("red"));
        assert_eq!(Atom::named("", 0_u8).name(), None);
    }

    #[test]
    fn codec_round_trips_plain_values() {
        let atom = Atom::new(vec![1_u32, 2]);
        let text = atom.as_any().encode(&atom.as_any().default_value()).unwrap();
        assert_eq!(text, "[1,2]");
        let decoded = atom.as_any().decode("[3]").unwrap();
        assert_eq!(decoded.downcast_ref::<Vec<u32>>(), Some(&vec![3]));
    }

    #[test]
    fn decode_rejects_malformed_json() {
        let atom = Atom::new(0_u32);
        let err = atom.as_any().decode("\"three\"").unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[test]
    fn nested_atoms_do_not_serialize_outside_a_snapshot() {
        let outer = vec![Atom::new(1_u32)];
        let err = serde_json::to_string(&outer).unwrap_err();
        assert_eq!(snapshot::recover(err), StoreError::SnapshotInactive);
    }

    #[test]
    fn deserialized_atoms_are_fresh() {
        let atoms: Vec<Atom<u32>> = serde_json::from_str("[4, 4]").unwrap();
        assert_ne!(atoms[0], atoms[1]);
        assert_eq!(atoms[0].name(), None);
    }
}
