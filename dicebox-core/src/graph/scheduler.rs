//! Propagation Scheduler
//!
//! A propagation wave starts from the slices whose state just changed and
//! settles every affected slice exactly once.
//!
//! # Algorithm
//!
//! 1. Every root is enqueued. Each slice is enqueued at most once per wave,
//!    into the value queue or, for callback slices, the callback queue.
//! 2. Value slices are drained first. Re-evaluating a slice pulls any
//!    dependency that has not settled yet, so a slice never observes a
//!    half-propagated upstream value regardless of queue order.
//! 3. Only when a slice's value changed are its children enqueued, so the
//!    wave stops at a fixed point and untouched branches are never visited.
//! 4. A callback slice runs only when the value queue is empty, so every
//!    callback observes a fully settled state.
//!
//! Errors are isolated per slice: they go to the error handler and the rest
//! of the wave carries on.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};

use super::slice::{Resolve, Slice, SliceId, SliceKind, SliceValue};
use crate::error::{StoreError, StoreResult};

/// Roots of one propagation request.
pub type ChangeSet = Vec<Slice>;

thread_local! {
    static RUNNING: Cell<bool> = const { Cell::new(false) };
}

/// Counters describing one settled wave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaveReport {
    /// Value and state slices evaluated.
    pub evaluated: usize,
    /// Callback slices run.
    pub callbacks: usize,
    /// Errors routed to the handler.
    pub errors: usize,
}

/// State of one propagation wave.
pub(crate) struct Wave<'h> {
    enqueued: RefCell<HashSet<SliceId>>,
    settled: RefCell<HashMap<SliceId, StoreResult<SliceValue>>>,
    values: RefCell<VecDeque<Slice>>,
    callbacks: RefCell<VecDeque<Slice>>,
    report: Cell<WaveReport>,
    handle_error: &'h dyn Fn(StoreError),
}

impl<'h> Wave<'h> {
    fn new(handle_error: &'h dyn Fn(StoreError)) -> Self {
        Self {
            enqueued: RefCell::new(HashSet::new()),
            settled: RefCell::new(HashMap::new()),
            values: RefCell::new(VecDeque::new()),
            callbacks: RefCell::new(VecDeque::new()),
            report: Cell::new(WaveReport::default()),
            handle_error,
        }
    }

    fn enqueue(&self, slices: impl IntoIterator<Item = Slice>) {
        for slice in slices {
            if !self.enqueued.borrow_mut().insert(slice.id()) {
                continue;
            }
            match slice.kind() {
                SliceKind::Callback => self.callbacks.borrow_mut().push_back(slice),
                SliceKind::Value | SliceKind::State => self.values.borrow_mut().push_back(slice),
            }
        }
    }

    fn is_settled(&self, slice: &Slice) -> bool {
        self.settled.borrow().contains_key(&slice.id())
    }

    fn record_error(&self, err: StoreError) {
        let mut report = self.report.get();
        report.errors += 1;
        self.report.set(report);
        (self.handle_error)(err);
    }

    fn drain(&self) {
        loop {
            let next = self.values.borrow_mut().pop_front();
            if let Some(slice) = next {
                if !self.is_settled(&slice) {
                    if let Err(err) = self.resolve(&slice) {
                        self.record_error(err);
                    }
                }
                continue;
            }

            let next = self.callbacks.borrow_mut().pop_front();
            match next {
                // a callback torn down since it was enqueued no longer runs
                Some(callback) if !callback.is_live() => continue,
                Some(callback) => {
                    if let Err(err) = self.resolve(&callback) {
                        self.record_error(err);
                    }
                }
                None => break,
            }
        }
    }
}

impl Resolve for Wave<'_> {
    fn resolve(&self, slice: &Slice) -> StoreResult<SliceValue> {
        if let Some(outcome) = self.settled.borrow().get(&slice.id()) {
            return outcome.clone();
        }

        let last = slice.value();
        let outcome = slice.update(self);
        if let Ok(value) = &outcome {
            let changed = last.as_ref().map_or(true, |last| !slice.same(last, value));
            if changed {
                slice.set_value(value.clone());
                self.enqueue(slice.children());
            }
        }

        let mut report = self.report.get();
        match slice.kind() {
            SliceKind::Callback => report.callbacks += 1,
            SliceKind::Value | SliceKind::State => report.evaluated += 1,
        }
        self.report.set(report);

        self.settled.borrow_mut().insert(slice.id(), outcome.clone());
        outcome
    }
}

/// Resets the running flag when the wave ends, even by panic.
struct RunningGuard;

impl Drop for RunningGuard {
    fn drop(&mut self) {
        RUNNING.with(|running| running.set(false));
    }
}

/// Run one propagation wave over the union of `batches`.
///
/// Fails with [`StoreError::PropagationRunning`] when called from inside
/// another wave on the same thread.
pub fn propagate(batches: Vec<ChangeSet>, handle_error: &dyn Fn(StoreError)) -> StoreResult<WaveReport> {
    if RUNNING.with(|running| running.replace(true)) {
        return Err(StoreError::PropagationRunning);
    }
    let _running = RunningGuard;

    let roots: usize = batches.iter().map(Vec::len).sum();
    let span = tracing::debug_span!("propagation_wave", batches = batches.len(), roots);
    let _enter = span.enter();

    let wave = Wave::new(handle_error);
    for batch in batches {
        wave.enqueue(batch);
    }
    wave.drain();

    let report = wave.report.get();
    tracing::debug!(
        evaluated = report.evaluated,
        callbacks = report.callbacks,
        errors = report.errors,
        "wave settled"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{downcast, PullResolver};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn collect_errors() -> (Arc<Mutex<Vec<StoreError>>>, impl Fn(StoreError)) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        (errors, move |err| sink.lock().push(err))
    }

    #[test]
    fn change_reaches_callbacks_after_values_settle() {
        let base = Slice::state(1_u32);
        let doubled = {
            let base = base.clone();
            Slice::memo(move |peek, _| Ok(*peek.get::<u32>(&base)? * 2))
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callback = {
            let (base, doubled, seen) = (base.clone(), doubled.clone(), seen.clone());
            Slice::callback(move |peek| {
                let pair = (*peek.get::<u32>(&base)?, *peek.get::<u32>(&doubled)?);
                seen.lock().push(pair);
                Ok(())
            })
        };
        callback.activate(&PullResolver::new()).unwrap();

        base.set_state(Arc::new(5_u32)).unwrap();
        let (errors, handler) = collect_errors();
        let report = propagate(vec![vec![base.clone()]], &handler).unwrap();

        assert!(errors.lock().is_empty());
        assert_eq!(*seen.lock(), vec![(1, 2), (5, 10)]);
        assert_eq!(report.callbacks, 1);
        assert_eq!(report.evaluated, 2);
    }

    #[test]
    fn unchanged_values_stop_the_wave() {
        let base = Slice::state(4_u32);
        let parity = {
            let base = base.clone();
            Slice::memo(move |peek, _| Ok(*peek.get::<u32>(&base)? % 2))
        };
        let runs = Arc::new(AtomicUsize::new(0));
        let callback = {
            let (parity, runs) = (parity.clone(), runs.clone());
            Slice::callback(move |peek| {
                peek.get::<u32>(&parity)?;
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        callback.activate(&PullResolver::new()).unwrap();

        base.set_state(Arc::new(6_u32)).unwrap();
        let (_, handler) = collect_errors();
        let report = propagate(vec![vec![base.clone()]], &handler).unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(report.callbacks, 0);
        let value = parity.value().unwrap();
        assert_eq!(*downcast::<u32>(parity.id(), value).unwrap(), 0);
    }

    #[test]
    fn failing_branch_does_not_stop_siblings() {
        let base = Slice::state(1_u32);
        let failing = {
            let base = base.clone();
            Slice::new(move |peek, _| -> StoreResult<u32> {
                if *peek.get::<u32>(&base)? > 1 {
                    return Err(StoreError::evaluation("too big"));
                }
                Ok(0)
            })
        };
        let healthy = {
            let base = base.clone();
            Slice::memo(move |peek, _| Ok(*peek.get::<u32>(&base)? + 100))
        };
        let failing_sub = {
            let failing = failing.clone();
            Slice::callback(move |peek| peek.get::<u32>(&failing).map(drop))
        };
        let healthy_seen = Arc::new(AtomicUsize::new(0));
        let healthy_sub = {
            let (healthy, seen) = (healthy.clone(), healthy_seen.clone());
            Slice::callback(move |peek| {
                seen.store(*peek.get::<u32>(&healthy)? as usize, Ordering::SeqCst);
                Ok(())
            })
        };
        failing_sub.activate(&PullResolver::new()).unwrap();
        healthy_sub.activate(&PullResolver::new()).unwrap();

        base.set_state(Arc::new(2_u32)).unwrap();
        let (errors, handler) = collect_errors();
        let report = propagate(vec![vec![base.clone()]], &handler).unwrap();

        assert_eq!(*errors.lock(), vec![StoreError::evaluation("too big")]);
        assert_eq!(report.errors, 1);
        assert_eq!(healthy_seen.load(Ordering::SeqCst), 102);
    }

    #[test]
    fn nested_propagation_is_rejected() {
        let base = Slice::state(0_u32);
        let nested = Arc::new(Mutex::new(None));
        let callback = {
            let (base, nested) = (base.clone(), nested.clone());
            Slice::callback(move |peek| {
                if *peek.get::<u32>(&base)? > 0 {
                    let inner = propagate(vec![vec![base.clone()]], &|_| {});
                    *nested.lock() = Some(inner);
                }
                Ok(())
            })
        };
        callback.activate(&PullResolver::new()).unwrap();

        base.set_state(Arc::new(1_u32)).unwrap();
        propagate(vec![vec![base.clone()]], &|_| {}).unwrap();

        assert_eq!(*nested.lock(), Some(Err(StoreError::PropagationRunning)));
        // the flag is released once the outer wave ends
        assert!(propagate(vec![], &|_| {}).is_ok());
    }

    #[test]
    fn each_slice_settles_once_per_wave() {
        let base = Slice::state(1_u32);
        let evaluations = Arc::new(AtomicUsize::new(0));
        let shared = {
            let (base, evaluations) = (base.clone(), evaluations.clone());
            Slice::new(move |peek, _| {
                evaluations.fetch_add(1, Ordering::SeqCst);
                Ok(*peek.get::<u32>(&base)?)
            })
        };
        let readers: Vec<Slice> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                Slice::new(move |peek, _| Ok(*peek.get::<u32>(&shared)?))
            })
            .collect();
        let callback = {
            let readers = readers.clone();
            Slice::callback(move |peek| {
                for reader in &readers {
                    peek.get::<u32>(reader)?;
                }
                Ok(())
            })
        };
        callback.activate(&PullResolver::new()).unwrap();
        evaluations.store(0, Ordering::SeqCst);

        base.set_state(Arc::new(2_u32)).unwrap();
        propagate(vec![vec![base.clone()], vec![base.clone()]], &|_| {}).unwrap();

        assert_eq!(evaluations.load(Ordering::SeqCst), 1);
    }
}
