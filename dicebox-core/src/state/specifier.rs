//! Specifiers: anything a store can turn into a slice.

use std::fmt;
use std::marker::PhantomData;

use super::atom::{AnyAtom, Atom};
use super::selector::{AnySelector, Selector};
use crate::graph::Slice;

/// The three things a store knows how to wrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Specifier {
    /// Backed by a state slice.
    Atom(AnyAtom),
    /// Backed by a derived slice.
    Selector(AnySelector),
    /// Already a slice; wrapped as is.
    Slice(Slice),
}

/// Something that can be read from a store as a `Value`.
pub trait Readable {
    /// The type a read produces.
    type Value: Send + Sync + 'static;

    /// How the store finds the backing slice.
    fn specifier(&self) -> Specifier;
}

impl<T: Send + Sync + 'static> Readable for Atom<T> {
    type Value = T;

    fn specifier(&self) -> Specifier {
        Specifier::Atom(self.as_any().clone())
    }
}

impl<V: Send + Sync + 'static> Readable for Selector<V> {
    type Value = V;

    fn specifier(&self) -> Specifier {
        Specifier::Selector(self.as_any().clone())
    }
}

/// A typed specifier: an atom, a selector, or a raw slice known to hold a `V`.
pub struct State<V> {
    specifier: Specifier,
    _marker: PhantomData<fn() -> V>,
}

impl<V> State<V> {
    /// Read a raw slice as a `V`. The type is checked on every read.
    pub fn from_slice(slice: Slice) -> Self {
        Self {
            specifier: Specifier::Slice(slice),
            _marker: PhantomData,
        }
    }
}

impl<V: Send + Sync + 'static> Readable for State<V> {
    type Value = V;

    fn specifier(&self) -> Specifier {
        self.specifier.clone()
    }
}

impl<T> From<&Atom<T>> for State<T> {
    fn from(atom: &Atom<T>) -> Self {
        Self {
            specifier: Specifier::Atom(atom.as_any().clone()),
            _marker: PhantomData,
        }
    }
}

impl<V> From<&Selector<V>> for State<V> {
    fn from(selector: &Selector<V>) -> Self {
        Self {
            specifier: Specifier::Selector(selector.as_any().clone()),
            _marker: PhantomData,
        }
    }
}

impl<V> Clone for State<V> {
    fn clone(&self) -> Self {
        Self {
            specifier: self.specifier.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V> fmt::Debug for State<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("State").field(&self.specifier).finish()
    }
}
