//! Slices
//!
//! A slice is one node of the reactive graph. It owns an evaluation function,
//! the set of slices read during its latest evaluation (dependencies) and the
//! set of slices that read it (children).
//!
//! A slice with at least one child is *live*: it keeps a cached value that the
//! propagation scheduler updates eagerly. A slice without children is *cold*:
//! its value is recomputed from its dependencies on every read.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};

/// A type-erased slice value.
pub type SliceValue = Arc<dyn Any + Send + Sync>;

/// Change detection between two values held by the same slice.
pub type SameFn = fn(&SliceValue, &SliceValue) -> bool;

type EvaluateFn = dyn Fn(&SlicePeek<'_>, &Slice) -> StoreResult<SliceValue> + Send + Sync;

/// Unique identifier for a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceId(u64);

impl SliceId {
    /// Generate a new unique slice ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SliceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for SliceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// The kind of slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceKind {
    /// A derived slice. Recomputes its value from the slices it reads.
    Value,

    /// A slice with externally settable state (backs an atom).
    /// Its evaluation returns the current state and reads nothing.
    State,

    /// A terminal side-effecting subscriber.
    /// Only ever a parent of the external sentinel, never a dependency.
    Callback,
}

/// Resolves the value of a dependency on behalf of an evaluating slice.
///
/// The pull reader ([`PullResolver`](super::PullResolver)) and the
/// propagation wave each provide their own resolution strategy.
pub trait Resolve {
    /// Produce the current value of `slice`.
    fn resolve(&self, slice: &Slice) -> StoreResult<SliceValue>;
}

/// Key of an entry in a slice's children. `None` is the external sentinel
/// standing for a manual subscriber.
type ChildKey = Option<SliceId>;

struct Links {
    dependencies: IndexMap<SliceId, Slice>,
    children: IndexMap<ChildKey, Option<Weak<SliceInner>>>,
    value: Option<SliceValue>,
    state: Option<SliceValue>,
}

struct SliceInner {
    id: SliceId,
    kind: SliceKind,
    evaluate: Box<EvaluateFn>,
    same: SameFn,
    evaluating: AtomicBool,
    links: Mutex<Links>,
}

/// A node in the reactive graph.
///
/// Cloning a `Slice` yields another handle to the same node.
#[derive(Clone)]
pub struct Slice {
    inner: Arc<SliceInner>,
}

/// Compare two values by pointer identity.
pub fn same_identity(a: &SliceValue, b: &SliceValue) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Compare two values with `V`'s `PartialEq`, falling back to identity.
pub fn same_value<V: PartialEq + 'static>(a: &SliceValue, b: &SliceValue) -> bool {
    if same_identity(a, b) {
        return true;
    }
    match ((**a).downcast_ref::<V>(), (**b).downcast_ref::<V>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Downcast an erased value read from `slice`.
pub fn downcast<T: Send + Sync + 'static>(slice: SliceId, value: SliceValue) -> StoreResult<Arc<T>> {
    value.downcast::<T>().map_err(|_| StoreError::TypeMismatch {
        slice,
        expected: std::any::type_name::<T>(),
    })
}

/// Borrow an erased value read from `slice` as a `T`.
pub fn downcast_ref<T: 'static>(slice: SliceId, value: &SliceValue) -> StoreResult<&T> {
    (**value).downcast_ref::<T>().ok_or(StoreError::TypeMismatch {
        slice,
        expected: std::any::type_name::<T>(),
    })
}

impl Slice {
    fn from_parts(kind: SliceKind, evaluate: Box<EvaluateFn>, same: SameFn, state: Option<SliceValue>) -> Self {
        Self {
            inner: Arc::new(SliceInner {
                id: SliceId::new(),
                kind,
                evaluate,
                same,
                evaluating: AtomicBool::new(false),
                links: Mutex::new(Links {
                    dependencies: IndexMap::new(),
                    children: IndexMap::new(),
                    value: None,
                    state,
                }),
            }),
        }
    }

    /// Create a derived slice whose changes are detected by identity.
    ///
    /// Every evaluation produces a fresh value, so every re-evaluation during
    /// propagation counts as a change.
    pub fn new<V, F>(evaluate: F) -> Self
    where
        V: Send + Sync + 'static,
        F: Fn(&SlicePeek<'_>, &Slice) -> StoreResult<V> + Send + Sync + 'static,
    {
        Self::from_parts(
            SliceKind::Value,
            Box::new(move |peek, this| Ok(Arc::new(evaluate(peek, this)?) as SliceValue)),
            same_identity,
            None,
        )
    }

    /// Create a derived slice whose changes are detected with `PartialEq`.
    pub fn memo<V, F>(evaluate: F) -> Self
    where
        V: PartialEq + Send + Sync + 'static,
        F: Fn(&SlicePeek<'_>, &Slice) -> StoreResult<V> + Send + Sync + 'static,
    {
        Self::from_parts(
            SliceKind::Value,
            Box::new(move |peek, this| Ok(Arc::new(evaluate(peek, this)?) as SliceValue)),
            same_value::<V>,
            None,
        )
    }

    /// Create a derived slice from an already type-erased evaluation.
    pub(crate) fn erased<F>(evaluate: F, same: SameFn) -> Self
    where
        F: Fn(&SlicePeek<'_>, &Slice) -> StoreResult<SliceValue> + Send + Sync + 'static,
    {
        Self::from_parts(SliceKind::Value, Box::new(evaluate), same, None)
    }

    /// Create a state slice holding `initial`.
    pub fn state<V: PartialEq + Send + Sync + 'static>(initial: V) -> Self {
        Self::state_erased(Arc::new(initial), same_value::<V>)
    }

    /// Create a state slice from an already type-erased value.
    pub(crate) fn state_erased(initial: SliceValue, same: SameFn) -> Self {
        Self::from_parts(
            SliceKind::State,
            Box::new(|_, this| this.current_state().ok_or(StoreError::NotAStateSlice(this.id()))),
            same,
            Some(initial),
        )
    }

    /// Create a callback slice running `callback` for its side effects.
    pub fn callback<F>(callback: F) -> Self
    where
        F: Fn(&SlicePeek<'_>) -> StoreResult<()> + Send + Sync + 'static,
    {
        Self::from_parts(
            SliceKind::Callback,
            Box::new(move |peek, _| {
                callback(peek)?;
                Ok(Arc::new(()) as SliceValue)
            }),
            same_identity,
            None,
        )
    }

    /// Get the slice's ID.
    pub fn id(&self) -> SliceId {
        self.inner.id
    }

    /// Get the slice's kind.
    pub fn kind(&self) -> SliceKind {
        self.inner.kind
    }

    /// Whether the slice has at least one child.
    pub fn is_live(&self) -> bool {
        !self.inner.links.lock().children.is_empty()
    }

    /// Whether the slice's evaluation function is running.
    pub fn is_evaluating(&self) -> bool {
        self.inner.evaluating.load(Ordering::SeqCst)
    }

    /// Number of children, counting the external sentinel.
    pub fn child_count(&self) -> usize {
        self.inner.links.lock().children.len()
    }

    /// Whether a manual subscriber (the external sentinel) is attached.
    pub fn has_external_child(&self) -> bool {
        self.inner.links.lock().children.contains_key(&None)
    }

    /// Child slices that are still alive. The external sentinel is skipped.
    pub fn children(&self) -> Vec<Slice> {
        self.inner
            .links
            .lock()
            .children
            .values()
            .flatten()
            .filter_map(Weak::upgrade)
            .map(|inner| Slice { inner })
            .collect()
    }

    /// Slices read during the latest evaluation.
    pub fn dependencies(&self) -> Vec<Slice> {
        self.inner.links.lock().dependencies.values().cloned().collect()
    }

    /// The cached value. Only meaningful while the slice is live.
    pub fn value(&self) -> Option<SliceValue> {
        self.inner.links.lock().value.clone()
    }

    pub(crate) fn set_value(&self, value: SliceValue) {
        self.inner.links.lock().value = Some(value);
    }

    /// The current state of a state slice.
    pub fn current_state(&self) -> Option<SliceValue> {
        self.inner.links.lock().state.clone()
    }

    /// Replace the state of a state slice.
    ///
    /// This does not propagate; dispatch is responsible for that.
    pub fn set_state(&self, state: SliceValue) -> StoreResult<()> {
        if self.kind() != SliceKind::State {
            return Err(StoreError::NotAStateSlice(self.id()));
        }
        self.inner.links.lock().state = Some(state);
        Ok(())
    }

    /// Whether two values of this slice are the same for change detection.
    pub fn same(&self, a: &SliceValue, b: &SliceValue) -> bool {
        (self.inner.same)(a, b)
    }

    /// Re-evaluate the slice, tracking the dependencies it reads.
    ///
    /// Dependencies not read this time are dropped (and unsubscribed from if
    /// the slice is live). A live slice subscribes to every dependency it
    /// reads. Re-entering a slice that is already evaluating fails with
    /// [`StoreError::CyclicGraph`].
    pub fn update(&self, resolver: &dyn Resolve) -> StoreResult<SliceValue> {
        if self.inner.evaluating.swap(true, Ordering::SeqCst) {
            return Err(StoreError::CyclicGraph(self.id()));
        }
        let _evaluating = EvaluatingGuard(&self.inner.evaluating);

        let stale = self.inner.links.lock().dependencies.clone();
        let peek = SlicePeek {
            owner: self,
            resolver,
            stale: RefCell::new(stale),
        };
        let value = (self.inner.evaluate)(&peek, self)?;

        let stale = peek.stale.into_inner();
        if !stale.is_empty() {
            let live = {
                let mut links = self.inner.links.lock();
                for id in stale.keys() {
                    links.dependencies.shift_remove(id);
                }
                !links.children.is_empty()
            };
            if live {
                for dependency in stale.values() {
                    dependency.unsubscribe(Some(self.id()));
                }
            }
        }

        Ok(value)
    }

    /// Register `child` (or the external sentinel when `None`).
    ///
    /// The first subscriber makes the slice live and triggers an initial
    /// update; if that update fails the edge is removed again before the
    /// error is returned. Subscribing the same child twice is a no-op.
    pub fn subscribe(&self, child: Option<&Slice>, resolver: &dyn Resolve) -> StoreResult<()> {
        let key = child.map(Slice::id);
        let first = {
            let mut links = self.inner.links.lock();
            if links.children.contains_key(&key) {
                return Ok(());
            }
            let first = links.children.is_empty();
            links
                .children
                .insert(key, child.map(|c| Arc::downgrade(&c.inner)));
            first
        };

        if first {
            tracing::trace!(slice = self.id().raw(), "slice going live");
            match self.update(resolver) {
                Ok(value) => self.set_value(value),
                Err(err) => {
                    self.unsubscribe(key);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Remove `child` (or the external sentinel when `None`).
    ///
    /// Removing the last child turns the slice cold and cascades the
    /// unsubscription to all of its dependencies.
    pub fn unsubscribe(&self, child: Option<SliceId>) {
        let dependencies: Vec<Slice> = {
            let mut links = self.inner.links.lock();
            if links.children.shift_remove(&child).is_none() || !links.children.is_empty() {
                return;
            }
            links.value = None;
            links.dependencies.values().cloned().collect()
        };

        tracing::trace!(slice = self.id().raw(), "slice going cold");
        for dependency in dependencies {
            dependency.unsubscribe(Some(self.id()));
        }
    }

    /// Activate a callback slice by subscribing the external sentinel.
    pub fn activate(&self, resolver: &dyn Resolve) -> StoreResult<()> {
        self.subscribe(None, resolver)
    }

    /// Deactivate a callback slice.
    pub fn deactivate(&self) {
        self.unsubscribe(None)
    }
}

impl PartialEq for Slice {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Slice {}

impl Hash for Slice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slice")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("children", &self.child_count())
            .finish()
    }
}

/// Resets the evaluating flag even if the evaluation panics.
struct EvaluatingGuard<'a>(&'a AtomicBool);

impl Drop for EvaluatingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Dependency-tracking reader handed to an evaluating slice.
///
/// Every read registers the dependency with the owner and, if the owner is
/// live, subscribes the owner to it. The handle borrows the evaluation, so it
/// cannot outlive it.
pub struct SlicePeek<'a> {
    owner: &'a Slice,
    resolver: &'a dyn Resolve,
    stale: RefCell<IndexMap<SliceId, Slice>>,
}

impl SlicePeek<'_> {
    /// Read `dependency` as a type-erased value.
    pub fn slice(&self, dependency: &Slice) -> StoreResult<SliceValue> {
        if !self.owner.is_evaluating() {
            return Err(StoreError::PeekOutsideEvaluation(self.owner.id()));
        }
        // a self edge would survive the unwinding of a failed subscribe
        if dependency.id() == self.owner.id() {
            return Err(StoreError::CyclicGraph(self.owner.id()));
        }
        self.stale.borrow_mut().shift_remove(&dependency.id());
        let live = {
            let mut links = self.owner.inner.links.lock();
            links
                .dependencies
                .insert(dependency.id(), dependency.clone());
            !links.children.is_empty()
        };
        if live {
            dependency.subscribe(Some(self.owner), self.resolver)?;
        }
        self.resolver.resolve(dependency)
    }

    /// Read `dependency` as a `T`.
    pub fn get<T: Send + Sync + 'static>(&self, dependency: &Slice) -> StoreResult<Arc<T>> {
        downcast(dependency.id(), self.slice(dependency)?)
    }

    /// The slice being evaluated.
    pub fn owner(&self) -> &Slice {
        self.owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PullResolver;

    #[test]
    fn slice_ids_are_unique() {
        let id1 = SliceId::new();
        let id2 = SliceId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn state_slice_evaluates_to_its_state() {
        let slice = Slice::state(3_u32);
        assert_eq!(slice.kind(), SliceKind::State);
        let value = slice.update(&PullResolver::new()).unwrap();
        assert_eq!(*downcast::<u32>(slice.id(), value).unwrap(), 3);
        assert!(slice.dependencies().is_empty());
    }

    #[test]
    fn set_state_replaces_the_current_state() {
        let slice = Slice::state(3_u32);
        slice.set_state(Arc::new(4_u32)).unwrap();
        let state = slice.current_state().unwrap();
        assert_eq!(*downcast::<u32>(slice.id(), state).unwrap(), 4);
        assert!(Slice::new(|_, _| Ok(1_u32)).current_state().is_none());
    }

    #[test]
    fn set_state_rejects_derived_slices() {
        let slice = Slice::new(|_, _| Ok(1_u32));
        let err = slice.set_state(Arc::new(2_u32)).unwrap_err();
        assert_eq!(err, StoreError::NotAStateSlice(slice.id()));
    }

    #[test]
    fn first_subscriber_makes_slice_live() {
        let base = Slice::state(2_u32);
        let doubled = {
            let base = base.clone();
            Slice::memo(move |peek, _| Ok(*peek.get::<u32>(&base)? * 2))
        };

        assert!(!doubled.is_live());
        doubled.activate(&PullResolver::new()).unwrap();

        assert!(doubled.is_live());
        assert!(doubled.has_external_child());
        assert!(base.is_live());
        assert_eq!(base.children(), vec![doubled.clone()]);
        let value = doubled.value().unwrap();
        assert_eq!(*downcast::<u32>(doubled.id(), value).unwrap(), 4);
    }

    #[test]
    fn redundant_subscriptions_are_ignored() {
        let slice = Slice::state(0_u8);
        let resolver = PullResolver::new();
        slice.activate(&resolver).unwrap();
        slice.activate(&resolver).unwrap();
        assert_eq!(slice.child_count(), 1);
    }

    #[test]
    fn last_unsubscribe_cascades_to_dependencies() {
        let base = Slice::state(1_u32);
        let middle = {
            let base = base.clone();
            Slice::new(move |peek, _| Ok(*peek.get::<u32>(&base)? + 1))
        };
        let top = {
            let middle = middle.clone();
            Slice::new(move |peek, _| Ok(*peek.get::<u32>(&middle)? + 1))
        };

        top.activate(&PullResolver::new()).unwrap();
        assert!(middle.is_live());
        assert!(base.is_live());

        top.deactivate();
        assert!(!top.is_live());
        assert!(!middle.is_live());
        assert!(!base.is_live());
        assert!(top.value().is_none());
    }

    #[test]
    fn stale_dependencies_are_pruned_and_unsubscribed() {
        let switch = Slice::state(true);
        let left = Slice::state(1_u32);
        let right = Slice::state(2_u32);
        let picked = {
            let (switch, left, right) = (switch.clone(), left.clone(), right.clone());
            Slice::new(move |peek, _| {
                if *peek.get::<bool>(&switch)? {
                    Ok(*peek.get::<u32>(&left)?)
                } else {
                    Ok(*peek.get::<u32>(&right)?)
                }
            })
        };

        picked.activate(&PullResolver::new()).unwrap();
        assert!(left.is_live());
        assert!(!right.is_live());

        switch.set_state(Arc::new(false)).unwrap();
        crate::graph::propagate(vec![vec![switch.clone()]], &|err| panic!("{err}")).unwrap();

        assert!(!left.is_live());
        assert!(right.is_live());
        let deps = picked.dependencies();
        assert_eq!(deps.len(), 2);
        assert!(deps.contains(&switch));
        assert!(deps.contains(&right));
    }

    #[test]
    fn self_reference_is_a_cyclic_graph() {
        let slot: Arc<Mutex<Option<Slice>>> = Arc::new(Mutex::new(None));
        let looping = {
            let slot = slot.clone();
            Slice::new(move |peek, _| {
                let me = slot.lock().clone().expect("slot filled");
                Ok(*peek.get::<u32>(&me)?)
            })
        };
        *slot.lock() = Some(looping.clone());

        let err = looping.activate(&PullResolver::new()).unwrap_err();
        assert_eq!(err, StoreError::CyclicGraph(looping.id()));
        assert_eq!(looping.child_count(), 0);
        assert!(!looping.is_evaluating());
    }

    #[test]
    fn failed_first_update_unwinds_the_subscription() {
        let base = Slice::state(1_u32);
        let failing = {
            let base = base.clone();
            Slice::new(move |peek, _| -> StoreResult<u32> {
                peek.get::<u32>(&base)?;
                Err(StoreError::evaluation("boom"))
            })
        };

        let err = failing.activate(&PullResolver::new()).unwrap_err();
        assert_eq!(err, StoreError::evaluation("boom"));
        assert!(!failing.is_live());
        assert!(!base.is_live());
    }

    #[test]
    fn reading_the_wrong_type_is_reported() {
        let base = Slice::state(1_u32);
        let reader = {
            let base = base.clone();
            Slice::new(move |peek, _| Ok(peek.get::<String>(&base)?.len()))
        };
        let err = reader.update(&PullResolver::new()).unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { slice, .. } if slice == base.id()));
    }
}
