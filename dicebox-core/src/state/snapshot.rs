//! Snapshot Context
//!
//! Serializing a state tree has to read the atoms nested inside it, but
//! `serde` gives a `Serialize` impl no way to reach a store. While a snapshot
//! is active, atom handles serialize against the snapshot's store.
//!
//! # Modes
//!
//! - **Inline** ([`enter`]): an atom serializes as its current value. This is
//!   the persisted form; decoding it yields fresh anonymous atoms.
//! - **Clone** (`enter_clone`): an atom serializes as a reference to itself and
//!   deserializes as its clone. Each source atom is cloned once per snapshot,
//!   so atoms shared within the tree stay shared in the copy.
//!
//! Both modes refuse an atom that contains itself with
//! [`StoreError::CyclicState`].
//!
//! # Implementation
//!
//! A thread-local stack holds one frame per active snapshot. Entering pushes
//! a frame and the returned guard pops it on drop, so nested snapshots (and
//! panics) keep the stack balanced.
//!
//! `serde` errors can only carry a message, so the precise [`StoreError`]
//! behind a failed atom read is parked in a thread-local slot and recovered
//! by [`recover`] once serialization has unwound.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use super::atom::{AnyAtom, Atom, AtomId, StateValue};
use crate::error::{StoreError, StoreResult};
use crate::store::Store;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Inline,
    Cloning,
}

struct Frame {
    store: Store,
    mode: Mode,
    /// Atoms whose value is being serialized or cloned.
    visiting: HashSet<AtomId>,
    /// Atoms referenced so far, by id.
    sources: HashMap<AtomId, AnyAtom>,
    /// Finished clones, by source id.
    clones: HashMap<AtomId, AnyAtom>,
}

thread_local! {
    static SNAPSHOTS: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
    static PARKED: RefCell<Option<StoreError>> = const { RefCell::new(None) };
}

/// Guard that ends the snapshot when dropped.
///
/// Not `Send`: the snapshot belongs to the thread that entered it.
pub struct SnapshotGuard {
    _thread: PhantomData<*const ()>,
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        SNAPSHOTS.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

fn push(store: &Store, mode: Mode) -> SnapshotGuard {
    SNAPSHOTS.with(|stack| {
        stack.borrow_mut().push(Frame {
            store: store.clone(),
            mode,
            visiting: HashSet::new(),
            sources: HashMap::new(),
            clones: HashMap::new(),
        })
    });
    PARKED.with(|parked| parked.borrow_mut().take());
    SnapshotGuard { _thread: PhantomData }
}

/// Start a snapshot of `store` on this thread.
pub fn enter(store: &Store) -> SnapshotGuard {
    push(store, Mode::Inline)
}

/// Start a snapshot of `store` that clones the atoms it reads.
pub(crate) fn enter_clone(store: &Store) -> SnapshotGuard {
    push(store, Mode::Cloning)
}

/// Whether a snapshot is active on this thread.
pub fn is_active() -> bool {
    SNAPSHOTS.with(|stack| !stack.borrow().is_empty())
}

/// Whether the innermost snapshot is cloning.
pub(crate) fn is_cloning() -> bool {
    SNAPSHOTS.with(|stack| stack.borrow().last().is_some_and(|frame| frame.mode == Mode::Cloning))
}

/// Marks an atom as being visited until dropped.
pub(crate) struct Visit {
    atom: AtomId,
}

impl Drop for Visit {
    fn drop(&mut self) {
        SNAPSHOTS.with(|stack| {
            if let Some(frame) = stack.borrow_mut().last_mut() {
                frame.visiting.remove(&self.atom);
            }
        });
    }
}

/// How an atom handle serializes in the innermost snapshot.
pub(crate) enum Encoded<T> {
    /// The atom's id, resolved again when the tree is deserialized.
    Reference(u64),
    /// The atom's current value. The atom counts as visited while the
    /// [`Visit`] lives.
    Value(Arc<T>, Visit),
}

/// Encode `atom` for the innermost snapshot.
///
/// Named atoms are refused: they are persisted under their own key and
/// can't be cloned into another tree.
pub(crate) fn encode_atom<T: StateValue>(atom: &Atom<T>) -> StoreResult<Encoded<T>> {
    if let Some(name) = atom.name() {
        return Err(park(StoreError::NamedAtomClone(name.to_owned())));
    }
    let id = atom.id();
    let store: StoreResult<Option<Store>> = SNAPSHOTS.with(|stack| {
        let mut stack = stack.borrow_mut();
        let frame = stack.last_mut().ok_or(StoreError::SnapshotInactive)?;
        match frame.mode {
            Mode::Cloning => {
                frame.sources.entry(id).or_insert_with(|| atom.as_any().clone());
                Ok(None)
            }
            Mode::Inline if !frame.visiting.insert(id) => Err(StoreError::CyclicState(id)),
            Mode::Inline => Ok(Some(frame.store.clone())),
        }
    });
    let encoded = match store {
        Ok(None) => Ok(Encoded::Reference(id.raw())),
        Ok(Some(store)) => {
            let visit = Visit { atom: id };
            store.peek(atom).map(|value| Encoded::Value(value, visit))
        }
        Err(err) => Err(err),
    };
    encoded.map_err(park)
}

enum Step {
    Done(AnyAtom),
    Build(Store, AnyAtom),
}

/// The clone of the atom referenced by `raw` in the innermost snapshot.
///
/// The source atom's current value is cloned recursively; an atom reached
/// again while its own value is being cloned is a [`StoreError::CyclicState`].
pub(crate) fn clone_atom<T: StateValue>(raw: u64) -> StoreResult<Atom<T>> {
    let id = AtomId::from_raw(raw);
    let step: StoreResult<Step> = SNAPSHOTS.with(|stack| {
        let mut stack = stack.borrow_mut();
        let frame = stack.last_mut().ok_or(StoreError::SnapshotInactive)?;
        if let Some(clone) = frame.clones.get(&id) {
            return Ok(Step::Done(clone.clone()));
        }
        let source = frame
            .sources
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::Serialization(format!("unknown atom reference {raw}")))?;
        if !frame.visiting.insert(id) {
            return Err(StoreError::CyclicState(id));
        }
        Ok(Step::Build(frame.store.clone(), source))
    });

    let cloned = step.and_then(|step| match step {
        Step::Done(clone) => Atom::from_any(clone),
        Step::Build(store, source) => {
            let _visit = Visit { atom: id };
            let value = store.peek(&Atom::<T>::from_any(source)?)?;
            let json = serde_json::to_value(&*value).map_err(recover)?;
            let clone = Atom::new(serde_json::from_value::<T>(json).map_err(recover)?);
            SNAPSHOTS.with(|stack| {
                if let Some(frame) = stack.borrow_mut().last_mut() {
                    frame.clones.insert(id, clone.as_any().clone());
                }
            });
            Ok(clone)
        }
    });
    cloned.map_err(park)
}

fn park(err: StoreError) -> StoreError {
    PARKED.with(|parked| *parked.borrow_mut() = Some(err.clone()));
    err
}

/// Turn a `serde_json` error back into the store error that caused it.
pub(crate) fn recover(err: serde_json::Error) -> StoreError {
    PARKED
        .with(|parked| parked.borrow_mut().take())
        .unwrap_or_else(|| StoreError::from(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Link {
        next: Option<Atom<Link>>,
    }

    #[test]
    fn snapshots_nest() {
        let outer = Store::new();
        let inner = Store::new();
        assert!(!is_active());
        {
            let _outer = enter(&outer);
            {
                let _inner = enter_clone(&inner);
                assert!(is_active());
                assert!(is_cloning());
            }
            assert!(is_active());
            assert!(!is_cloning());
        }
        assert!(!is_active());
    }

    #[test]
    fn nested_atoms_serialize_as_their_store_value() {
        let store = Store::new();
        let inner = Atom::new(1_u32);
        store.dispatch(inner.set(9)).unwrap();

        let _snapshot = enter(&store);
        assert_eq!(serde_json::to_string(&vec![inner]).unwrap(), "[9]");
    }

    #[test]
    fn shared_atoms_serialize_once_per_occurrence() {
        let store = Store::new();
        let shared = Atom::new(2_u32);

        let _snapshot = enter(&store);
        assert_eq!(serde_json::to_string(&vec![shared.clone(), shared]).unwrap(), "[2,2]");
    }

    #[test]
    fn named_atoms_are_refused() {
        let store = Store::new();
        let red = Atom::named("red", 1_u32);

        let _snapshot = enter(&store);
        let err = serde_json::to_string(&vec![red]).unwrap_err();
        assert_eq!(recover(err), StoreError::NamedAtomClone("red".into()));
    }

    #[test]
    fn self_containing_atoms_are_refused() {
        let store = Store::new();
        let a = Atom::new(Link { next: None });
        let b = Atom::new(Link { next: Some(a.clone()) });
        store.dispatch(a.set(Link { next: Some(b.clone()) })).unwrap();

        let _snapshot = enter(&store);
        let err = serde_json::to_string(&b).unwrap_err();
        assert_eq!(recover(err), StoreError::CyclicState(b.id()));
        // the failed walk leaves nothing behind
        let err = serde_json::to_string(&a).unwrap_err();
        assert_eq!(recover(err), StoreError::CyclicState(a.id()));
    }
}
