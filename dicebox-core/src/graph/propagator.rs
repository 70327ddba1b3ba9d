//! Batch coalescing in front of the scheduler.
//!
//! Requests arriving while a wave is running (for example a dispatch issued
//! by a callback) are queued instead of interleaved. The draining loop takes
//! every pending request at once, so requests queued during one wave settle
//! together in the next one, and waves run strictly in submission order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::scheduler::{self, ChangeSet, WaveReport};
use crate::error::StoreError;

/// FIFO of pending change sets plus the running flag.
#[derive(Default)]
pub struct Propagator {
    pending: Mutex<VecDeque<ChangeSet>>,
    running: AtomicBool,
    waves: AtomicU64,
    last_report: Mutex<Option<WaveReport>>,
}

/// Clears the running flag when draining stops, even by panic.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Propagator {
    /// Create an idle propagator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `changes` and, unless a wave is already running, drain the queue.
    ///
    /// Returns `true` if this call drained the queue itself.
    pub fn submit(&self, changes: ChangeSet, handle_error: &dyn Fn(StoreError)) -> bool {
        self.pending.lock().push_back(changes);
        if self.running.swap(true, Ordering::AcqRel) {
            tracing::trace!("wave running, batch queued");
            return false;
        }
        let _guard = DrainGuard(&self.running);

        loop {
            let batches: Vec<ChangeSet> = self.pending.lock().drain(..).collect();
            if batches.is_empty() {
                break;
            }
            match scheduler::propagate(batches, handle_error) {
                Ok(report) => {
                    self.waves.fetch_add(1, Ordering::Relaxed);
                    *self.last_report.lock() = Some(report);
                }
                Err(err) => handle_error(err),
            }
        }
        true
    }

    /// Whether a wave is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of waves run so far.
    pub fn wave_count(&self) -> u64 {
        self.waves.load(Ordering::Relaxed)
    }

    /// Report of the most recent wave.
    pub fn last_report(&self) -> Option<WaveReport> {
        *self.last_report.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{PullResolver, Slice};
    use std::sync::Arc;

    #[test]
    fn idle_propagator_runs_one_wave_per_submit() {
        let propagator = Propagator::new();
        let base = Slice::state(1_u32);

        assert!(propagator.submit(vec![base.clone()], &|_| {}));
        assert!(propagator.submit(vec![base.clone()], &|_| {}));

        assert_eq!(propagator.wave_count(), 2);
        assert!(!propagator.is_running());
        assert_eq!(propagator.last_report().unwrap().evaluated, 1);
    }

    #[test]
    fn submits_during_a_wave_are_coalesced_into_the_next_one() {
        let propagator = Arc::new(Propagator::new());
        let trigger = Slice::state(0_u32);
        let others: Vec<Slice> = (0..3).map(|i| Slice::state(i as u32)).collect();
        let queued = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let callback = {
            let (trigger, others, propagator, queued) =
                (trigger.clone(), others.clone(), propagator.clone(), queued.clone());
            Slice::callback(move |peek| {
                if *peek.get::<u32>(&trigger)? == 1 {
                    for other in &others {
                        queued.lock().push(propagator.submit(vec![other.clone()], &|_| {}));
                    }
                }
                Ok(())
            })
        };
        callback.activate(&PullResolver::new()).unwrap();

        trigger.set_state(Arc::new(1_u32)).unwrap();
        propagator.submit(vec![trigger.clone()], &|_| {});

        assert_eq!(*queued.lock(), vec![false, false, false]);
        // the trigger wave, then one wave for the three queued batches
        assert_eq!(propagator.wave_count(), 2);
        assert_eq!(propagator.last_report().unwrap().evaluated, 3);
    }
}
