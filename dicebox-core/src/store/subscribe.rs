//! Subscriptions
//!
//! An effect is a side-effecting reader. Subscribing it builds a callback
//! slice that runs the effect once and again after every wave that changes
//! something it read. Subscriptions are reference counted per effect: the
//! callback slice is shared by every subscription of the same effect and
//! torn down, once, when the last one is released.
//!
//! An effect may hand back pending async work. The work is spawned on the
//! ambient tokio runtime and teardown waits for it before deactivating the
//! callback slice.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::peek::Peek;
use super::store::WeakStore;
use super::Store;
use crate::error::{log_error, StoreError, StoreResult};
use crate::graph::{PullResolver, Slice};

type RunFn = dyn Fn(&Peek<'_>, &Store) -> StoreResult<Completion> + Send + Sync;

type Activity = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// Unique identifier for an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectId(u64);

impl EffectId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// What an effect run leaves behind.
pub enum Completion {
    /// The run is over.
    Done,
    /// The run continues asynchronously.
    Pending(BoxFuture<'static, StoreResult<()>>),
}

impl Completion {
    /// Continue the run with `work`.
    pub fn pending<F>(work: F) -> Self
    where
        F: std::future::Future<Output = StoreResult<()>> + Send + 'static,
    {
        Completion::Pending(work.boxed())
    }
}

impl From<()> for Completion {
    fn from(_: ()) -> Self {
        Completion::Done
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Done => f.write_str("Done"),
            Completion::Pending(_) => f.write_str("Pending"),
        }
    }
}

struct EffectInner {
    id: EffectId,
    run: Box<RunFn>,
}

/// A side-effecting reader.
///
/// Clones share identity: subscribing any clone counts toward the same
/// activation.
#[derive(Clone)]
pub struct Effect {
    inner: Arc<EffectInner>,
}

impl Effect {
    /// Build an effect from `run`.
    ///
    /// Reads made through the peek handle are tracked; the effect runs again
    /// when any of them changes. Return `Ok(())` when done or
    /// `Ok(Completion::pending(..))` to continue asynchronously.
    pub fn new<F, C>(run: F) -> Self
    where
        F: Fn(&Peek<'_>, &Store) -> StoreResult<C> + Send + Sync + 'static,
        C: Into<Completion>,
    {
        Self {
            inner: Arc::new(EffectInner {
                id: EffectId::next(),
                run: Box::new(move |peek, store| run(peek, store).map(Into::into)),
            }),
        }
    }

    /// Get the effect's ID.
    pub fn id(&self) -> EffectId {
        self.inner.id
    }

    fn run(&self, peek: &Peek<'_>, store: &Store) -> StoreResult<Completion> {
        (self.inner.run)(peek, store)
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Effect").field(&self.id()).finish()
    }
}

/// A running effect shared by all of its subscriptions.
pub(crate) struct Activation {
    count: usize,
    callback: Slice,
    activity: Activity,
}

fn callback_slice(store: &Store, effect: &Effect, activity: Activity) -> Slice {
    let store = store.downgrade();
    let effect = effect.clone();
    Slice::callback(move |tracker| {
        let store = store.upgrade()?;
        let peek = Peek::tracked(tracker, &store);
        match effect.run(&peek, &store)? {
            Completion::Done => Ok(()),
            Completion::Pending(work) => {
                let runtime = Handle::try_current().map_err(|_| StoreError::NoRuntime)?;
                let weak = store.downgrade();
                let handle = runtime.spawn(async move {
                    if let Err(err) = work.await {
                        match weak.upgrade() {
                            Ok(store) => store.handle_error(err),
                            Err(_) => log_error(err),
                        }
                    }
                });
                let mut activity = activity.lock();
                activity.retain(|handle| !handle.is_finished());
                activity.push(handle);
                Ok(())
            }
        }
    })
}

/// Subscribe `effect`, activating it if this is its first subscription.
pub(crate) fn activate(store: &Store, effect: &Effect) -> StoreResult<Subscription> {
    let callback = {
        let mut subscriptions = store.subscriptions().lock();
        if let Some(activation) = subscriptions.get_mut(&effect.id()) {
            activation.count += 1;
            tracing::trace!(effect = effect.id().raw(), count = activation.count, "effect shared");
            return Ok(Subscription::new(store, effect.id()));
        }
        let activity = Activity::default();
        let callback = callback_slice(store, effect, activity.clone());
        subscriptions.insert(
            effect.id(),
            Activation {
                count: 1,
                callback: callback.clone(),
                activity,
            },
        );
        callback
    };

    if let Err(err) = callback.activate(&PullResolver::new()) {
        store.subscriptions().lock().remove(&effect.id());
        return Err(err);
    }
    tracing::debug!(effect = effect.id().raw(), slice = callback.id().raw(), "effect activated");
    Ok(Subscription::new(store, effect.id()))
}

fn release(store: &Store, effect: EffectId) -> Teardown {
    let _engine = store.lock_engine();
    let activation = {
        let mut subscriptions = store.subscriptions().lock();
        let Some(activation) = subscriptions.get_mut(&effect) else {
            return Teardown::done();
        };
        activation.count -= 1;
        if activation.count > 0 {
            return Teardown::done();
        }
        subscriptions.remove(&effect)
    };
    let Some(Activation { callback, activity, .. }) = activation else {
        return Teardown::done();
    };

    let pending: Vec<JoinHandle<()>> = activity
        .lock()
        .drain(..)
        .filter(|handle| !handle.is_finished())
        .collect();
    let runtime = match Handle::try_current() {
        Ok(runtime) if !pending.is_empty() => runtime,
        _ => {
            callback.deactivate();
            tracing::debug!(effect = effect.raw(), "effect deactivated");
            return Teardown::done();
        }
    };

    tracing::debug!(effect = effect.raw(), pending = pending.len(), "effect teardown waiting");
    let store = store.downgrade();
    let task = runtime.spawn(async move {
        join_all(pending).await;
        match store.upgrade() {
            Ok(store) => {
                let _engine = store.lock_engine();
                callback.deactivate();
            }
            Err(_) => callback.deactivate(),
        }
        tracing::debug!(effect = effect.raw(), "effect deactivated");
    });
    Teardown { task: Some(task) }
}

/// Keeps an effect subscribed until released.
///
/// Dropping the subscription releases it; [`Subscription::dispose`] does the
/// same and hands back the teardown.
#[must_use = "dropping a subscription releases it"]
pub struct Subscription {
    store: WeakStore,
    effect: EffectId,
    released: bool,
}

impl Subscription {
    fn new(store: &Store, effect: EffectId) -> Self {
        Self {
            store: store.downgrade(),
            effect,
            released: false,
        }
    }

    /// The subscribed effect.
    pub fn effect(&self) -> EffectId {
        self.effect
    }

    /// Release the subscription.
    pub fn dispose(mut self) -> Teardown {
        self.released = true;
        self.release()
    }

    fn release(&self) -> Teardown {
        match self.store.upgrade() {
            Ok(store) => release(&store, self.effect),
            Err(_) => Teardown::done(),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("effect", &self.effect)
            .field("released", &self.released)
            .finish()
    }
}

/// The deactivation that follows releasing a subscription.
///
/// Deactivation is immediate unless the effect still has async work in
/// flight, in which case it runs once that work is over.
#[derive(Debug)]
pub struct Teardown {
    task: Option<JoinHandle<()>>,
}

impl Teardown {
    fn done() -> Self {
        Self { task: None }
    }

    /// Whether deactivation is still waiting for async work.
    pub fn is_pending(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Wait for the deactivation to complete.
    pub async fn finished(self) {
        if let Some(task) = self.task {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "effect teardown task failed");
            }
        }
    }
}
