//! Cold reads.
//!
//! A cold slice has no cached value, so reading it means pulling values from
//! its dependencies recursively. The marks of one read memoize every slice
//! visited, so a diamond-shaped graph evaluates each node once per read. No
//! subscription or cache survives the read.

use std::cell::RefCell;
use std::collections::HashMap;

use super::slice::{Resolve, Slice, SliceId, SliceValue};
use crate::error::StoreResult;

/// Marks scoped to one pull read.
#[derive(Default)]
pub struct PullResolver {
    marks: RefCell<HashMap<SliceId, SliceValue>>,
}

impl PullResolver {
    /// Create a resolver with empty marks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slices evaluated so far by this read.
    pub fn marked(&self) -> usize {
        self.marks.borrow().len()
    }
}

impl Resolve for PullResolver {
    fn resolve(&self, slice: &Slice) -> StoreResult<SliceValue> {
        extract_value(slice, self)
    }
}

/// Read `slice`: the cached value if live, otherwise a pull evaluation.
pub fn extract_value(slice: &Slice, marks: &PullResolver) -> StoreResult<SliceValue> {
    if slice.is_live() {
        // a live slice without a value is still in its first update
        if let Some(value) = slice.value() {
            return Ok(value);
        }
    }
    if let Some(value) = marks.marks.borrow().get(&slice.id()) {
        return Ok(value.clone());
    }
    let value = slice.update(marks)?;
    marks.marks.borrow_mut().insert(slice.id(), value.clone());
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::downcast;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counted(
        counter: &Arc<AtomicUsize>,
        deps: Vec<Slice>,
    ) -> Slice {
        let counter = counter.clone();
        Slice::new(move |peek, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut sum = 1_u32;
            for dep in &deps {
                sum += *peek.get::<u32>(dep)?;
            }
            Ok(sum)
        })
    }

    #[test]
    fn diamond_evaluates_each_node_once_per_read() {
        let evaluations = Arc::new(AtomicUsize::new(0));
        let root = counted(&evaluations, vec![]);
        let left = counted(&evaluations, vec![root.clone()]);
        let right = counted(&evaluations, vec![root.clone()]);
        let sink = counted(&evaluations, vec![left.clone(), right.clone()]);

        let value = extract_value(&sink, &PullResolver::new()).unwrap();
        assert_eq!(*downcast::<u32>(sink.id(), value).unwrap(), 5);
        assert_eq!(evaluations.load(Ordering::SeqCst), 4);

        // a second read recomputes from scratch
        extract_value(&sink, &PullResolver::new()).unwrap();
        assert_eq!(evaluations.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn cold_reads_leave_the_graph_cold() {
        let evaluations = Arc::new(AtomicUsize::new(0));
        let root = counted(&evaluations, vec![]);
        let sink = counted(&evaluations, vec![root.clone()]);

        for _ in 0..3 {
            let value = extract_value(&sink, &PullResolver::new()).unwrap();
            assert_eq!(*downcast::<u32>(sink.id(), value).unwrap(), 2);
        }
        assert!(!sink.is_live());
        assert!(!root.is_live());
        assert!(sink.value().is_none());
    }

    #[test]
    fn live_slices_answer_from_cache() {
        let evaluations = Arc::new(AtomicUsize::new(0));
        let root = counted(&evaluations, vec![]);
        root.activate(&PullResolver::new()).unwrap();
        assert_eq!(evaluations.load(Ordering::SeqCst), 1);

        let resolver = PullResolver::new();
        extract_value(&root, &resolver).unwrap();
        assert_eq!(evaluations.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.marked(), 0);
    }
}
