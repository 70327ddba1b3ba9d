//! The store: one slice graph plus the tables mapping atoms and selectors
//! onto it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};

use super::action::{Action, Assignment};
use super::middleware::{self, Middleware};
use super::peek::Peek;
use super::subscribe::{self, Activation, Effect, EffectId, Subscription};
use crate::error::{log_error, ErrorHandler, StoreError, StoreResult};
use crate::graph::{
    downcast, extract_value, ChangeSet, Propagator, PullResolver, Slice, SliceId, SliceKind, SliceValue,
    WaveReport,
};
use crate::state::{
    snapshot, AnyAtom, AnySelector, AtomId, AtomRecord, Readable, SelectorId, SelectorRecord, Specifier,
    StateValue,
};

struct AtomEntry {
    atom: Weak<AtomRecord>,
    slice: Slice,
}

struct SelectorEntry {
    selector: Weak<SelectorRecord>,
    slice: Slice,
}

pub(crate) struct StoreInner {
    engine: ReentrantMutex<()>,
    atoms: Mutex<HashMap<AtomId, AtomEntry>>,
    selectors: Mutex<HashMap<SelectorId, SelectorEntry>>,
    subscriptions: Mutex<HashMap<EffectId, Activation>>,
    propagator: Propagator,
    middlewares: Vec<Box<dyn Middleware>>,
    handle_error: ErrorHandler,
}

/// Configures a [`Store`].
pub struct StoreBuilder {
    handle_error: ErrorHandler,
    middlewares: Vec<Box<dyn Middleware>>,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self {
            handle_error: Arc::new(log_error),
            middlewares: Vec::new(),
        }
    }
}

impl StoreBuilder {
    /// Receive the errors the store isolates instead of returning.
    ///
    /// The default handler logs them.
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(StoreError) + Send + Sync + 'static,
    {
        self.handle_error = Arc::new(handler);
        self
    }

    /// Add a middleware. The first one added is the outermost.
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Box::new(middleware));
        self
    }

    /// Build the store and attach its middlewares.
    pub fn build(self) -> Store {
        let store = Store {
            inner: Arc::new(StoreInner {
                engine: ReentrantMutex::new(()),
                atoms: Mutex::new(HashMap::new()),
                selectors: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                propagator: Propagator::new(),
                middlewares: self.middlewares,
                handle_error: self.handle_error,
            }),
        };
        for middleware in &store.inner.middlewares {
            middleware.attach(&store);
        }
        store
    }
}

/// A handle to a store.
///
/// Cloning yields another handle to the same store. Every entry point holds
/// the store's engine lock, so calls from other threads wait for the running
/// one while reentrant calls from effects on the same thread go through.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

/// A handle that does not keep the store alive.
#[derive(Clone)]
pub(crate) struct WeakStore(Weak<StoreInner>);

impl WeakStore {
    pub(crate) fn upgrade(&self) -> StoreResult<Store> {
        self.0.upgrade().map(|inner| Store { inner }).ok_or(StoreError::StoreDropped)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Create a store with the default error handler and no middleware.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring a store.
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    pub(crate) fn downgrade(&self) -> WeakStore {
        WeakStore(Arc::downgrade(&self.inner))
    }

    pub(crate) fn lock_engine(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.engine.lock()
    }

    pub(crate) fn middlewares(&self) -> &[Box<dyn Middleware>] {
        &self.inner.middlewares
    }

    pub(crate) fn subscriptions(&self) -> &Mutex<HashMap<EffectId, Activation>> {
        &self.inner.subscriptions
    }

    /// Report an isolated error to the store's handler.
    pub fn handle_error(&self, err: StoreError) {
        (self.inner.handle_error)(err)
    }

    /// The slice backing `state` in this store.
    pub fn wrap<R: Readable + ?Sized>(&self, state: &R) -> StoreResult<Slice> {
        self.wrap_specifier(&state.specifier())
    }

    /// The slice backing `specifier` in this store.
    pub fn wrap_specifier(&self, specifier: &Specifier) -> StoreResult<Slice> {
        let _engine = self.lock_engine();
        middleware::wrap(self, 0, specifier)
    }

    pub(crate) fn wrap_base(&self, specifier: &Specifier) -> StoreResult<Slice> {
        match specifier {
            Specifier::Slice(slice) => Ok(slice.clone()),
            Specifier::Atom(atom) => Ok(self.atom_slice(atom)),
            Specifier::Selector(selector) => Ok(self.selector_slice(selector)),
        }
    }

    fn atom_slice(&self, atom: &AnyAtom) -> Slice {
        let mut atoms = self.inner.atoms.lock();
        if let Some(entry) = atoms.get(&atom.id()) {
            return entry.slice.clone();
        }
        let slice = Slice::state_erased(atom.default_value(), atom.same());
        tracing::trace!(atom = atom.id().raw(), slice = slice.id().raw(), "atom wrapped");
        atoms.insert(
            atom.id(),
            AtomEntry {
                atom: atom.downgrade(),
                slice: slice.clone(),
            },
        );
        slice
    }

    fn selector_slice(&self, selector: &AnySelector) -> Slice {
        let mut selectors = self.inner.selectors.lock();
        if let Some(entry) = selectors.get(&selector.id()) {
            return entry.slice.clone();
        }
        let store = self.downgrade();
        let record = selector.downgrade();
        let slice = Slice::erased(
            move |tracker, _| {
                let store = store.upgrade()?;
                let selector = AnySelector::upgrade(&record)
                    .ok_or_else(|| StoreError::evaluation("selector has been dropped"))?;
                let peek = Peek::tracked(tracker, &store);
                selector.select(&peek, &store)
            },
            selector.same(),
        );
        tracing::trace!(selector = selector.id().raw(), slice = slice.id().raw(), "selector wrapped");
        selectors.insert(
            selector.id(),
            SelectorEntry {
                selector: selector.downgrade(),
                slice: slice.clone(),
            },
        );
        slice
    }

    /// Read `state`: the cached value when live, a fresh pull otherwise.
    pub fn peek<R: Readable + ?Sized>(&self, state: &R) -> StoreResult<Arc<R::Value>> {
        let slice = self.wrap(state)?;
        downcast(slice.id(), self.peek_slice(&slice)?)
    }

    /// Read a slice as a type-erased value.
    pub fn peek_slice(&self, slice: &Slice) -> StoreResult<SliceValue> {
        let _engine = self.lock_engine();
        middleware::peek(self, 0, slice)
    }

    pub(crate) fn peek_base(&self, slice: &Slice) -> StoreResult<SliceValue> {
        extract_value(slice, &PullResolver::new())
    }

    /// Apply `action` and propagate the changes in a single wave.
    ///
    /// Assignments apply in declaration order. A failing update is reported
    /// to the error handler and skips only its own atom. An assignment whose
    /// atom does not resolve to a state slice is skipped too, and the first
    /// such error is returned once the rest has been applied.
    pub fn dispatch(&self, action: impl Into<Action>) -> StoreResult<()> {
        let assignments = action.into().flatten();
        if assignments.is_empty() {
            return Ok(());
        }
        let _engine = self.lock_engine();
        middleware::dispatch(self, 0, assignments)
    }

    pub(crate) fn dispatch_base(&self, assignments: Vec<Assignment>) -> StoreResult<()> {
        let total = assignments.len();
        let mut changes: IndexMap<SliceId, Slice> = IndexMap::new();
        let mut failure = None;

        for assignment in assignments {
            let slice = match self.wrap_specifier(&Specifier::Atom(assignment.atom().clone())) {
                Ok(slice) if slice.kind() == SliceKind::State => slice,
                Ok(slice) => {
                    failure.get_or_insert(StoreError::NotAStateSlice(slice.id()));
                    continue;
                }
                Err(err) => {
                    failure.get_or_insert(err);
                    continue;
                }
            };
            let Some(last) = slice.current_state() else {
                failure.get_or_insert(StoreError::NotAStateSlice(slice.id()));
                continue;
            };

            match assignment.apply(slice.id(), &last) {
                Ok(next) => {
                    let changed = !slice.same(&last, &next);
                    slice.set_state(next)?;
                    if changed {
                        changes.insert(slice.id(), slice);
                    }
                }
                Err(err) => self.handle_error(err),
            }
        }

        tracing::debug!(assignments = total, changed = changes.len(), "dispatch applied");
        if !changes.is_empty() {
            self.propagate(changes.into_values().collect());
        }
        failure.map_or(Ok(()), Err)
    }

    /// Run `thunk` with the store and an untracked peek.
    ///
    /// Reads made through the peek share one set of marks, so a cold
    /// selector read twice in the thunk is evaluated once.
    pub fn dispatch_thunk<R>(&self, thunk: impl FnOnce(&Store, &Peek<'_>) -> R) -> R {
        let _engine = self.lock_engine();
        let resolver = PullResolver::new();
        let peek = Peek::pull(&resolver, self);
        thunk(self, &peek)
    }

    /// Run `effect` now and whenever the state it reads changes.
    ///
    /// Subscribing the same effect again shares the running activation; it
    /// stops once every returned [`Subscription`] is released.
    pub fn subscribe(&self, effect: &Effect) -> StoreResult<Subscription> {
        let _engine = self.lock_engine();
        middleware::subscribe(self, 0, effect)
    }

    pub(crate) fn subscribe_base(&self, effect: &Effect) -> StoreResult<Subscription> {
        subscribe::activate(self, effect)
    }

    /// Propagate changes to the given state slices.
    ///
    /// While a wave is running the changes are queued and settle together
    /// with everything else queued in the meantime.
    pub fn propagate(&self, changes: ChangeSet) {
        let _engine = self.lock_engine();
        middleware::propagate(self, 0, changes)
    }

    pub(crate) fn propagate_base(&self, changes: ChangeSet) {
        let handler = self.inner.handle_error.clone();
        self.inner.propagator.submit(changes, &*handler);
    }

    /// Clone `value`, replacing every nested anonymous atom with a fresh one
    /// holding its current value in this store.
    ///
    /// An atom reached twice is cloned once, so the copy shares it the same
    /// way. Fails with [`StoreError::NamedAtomClone`] on a nested named atom
    /// and with [`StoreError::CyclicState`] on an atom that contains itself.
    pub fn deep_clone<T: StateValue>(&self, value: &T) -> StoreResult<T> {
        let _engine = self.lock_engine();
        let _snapshot = snapshot::enter_clone(self);
        let json = serde_json::to_value(value).map_err(snapshot::recover)?;
        serde_json::from_value(json).map_err(snapshot::recover)
    }

    /// Forget the slices of atoms and selectors that no longer exist.
    ///
    /// Returns the number of table entries removed.
    pub fn collect_garbage(&self) -> usize {
        let _engine = self.lock_engine();
        let mut removed = 0;
        self.inner.atoms.lock().retain(|_, entry| {
            let alive = entry.atom.strong_count() > 0;
            removed += usize::from(!alive);
            alive
        });
        self.inner.selectors.lock().retain(|_, entry| {
            let alive = entry.selector.strong_count() > 0;
            removed += usize::from(!alive);
            alive
        });
        tracing::debug!(removed, "store garbage collected");
        removed
    }

    /// Number of propagation waves run so far.
    pub fn wave_count(&self) -> u64 {
        self.inner.propagator.wave_count()
    }

    /// Report of the most recent propagation wave.
    pub fn last_wave(&self) -> Option<WaveReport> {
        self.inner.propagator.last_report()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("atoms", &self.inner.atoms.lock().len())
            .field("selectors", &self.inner.selectors.lock().len())
            .field("subscriptions", &self.inner.subscriptions.lock().len())
            .field("middlewares", &self.inner.middlewares.len())
            .field("waves", &self.wave_count())
            .finish()
    }
}
