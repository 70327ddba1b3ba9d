//! Atoms and Selectors
//!
//! The user-facing vocabulary of the store. Atoms name mutable state,
//! selectors name derivations over it. Neither holds a value: a store maps
//! each of them to a slice of its own graph when they are first used.

mod atom;
mod selector;
pub mod snapshot;
mod specifier;

pub use atom::{AnyAtom, Atom, AtomId, StateValue};
pub(crate) use atom::AtomRecord;
pub use selector::{AnySelector, Selector, SelectorId};
pub(crate) use selector::SelectorRecord;
pub use specifier::{Readable, Specifier, State};
