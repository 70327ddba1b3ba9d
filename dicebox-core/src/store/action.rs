//! Assignments and actions
//!
//! An assignment changes one atom. An action is an arbitrarily nested batch
//! of assignments; entries that are skipped stand for the `false`/`None`
//! left behind by conditional construction such as `cond.then(|| ..)`.

use std::fmt;

use smallvec::SmallVec;

use crate::error::StoreResult;
use crate::graph::{SliceId, SliceValue};
use crate::state::AnyAtom;

pub(crate) type UpdateFn = Box<dyn FnOnce(SliceId, &SliceValue) -> StoreResult<SliceValue> + Send>;

enum Operation {
    Set(SliceValue),
    Update(UpdateFn),
}

/// One change to one atom.
pub struct Assignment {
    atom: AnyAtom,
    operation: Operation,
}

impl Assignment {
    pub(crate) fn set(atom: AnyAtom, value: SliceValue) -> Self {
        Self {
            atom,
            operation: Operation::Set(value),
        }
    }

    pub(crate) fn update(atom: AnyAtom, update: UpdateFn) -> Self {
        Self {
            atom,
            operation: Operation::Update(update),
        }
    }

    /// The atom this assignment changes.
    pub fn atom(&self) -> &AnyAtom {
        &self.atom
    }

    /// Whether the new value is derived from the current one.
    pub fn is_update(&self) -> bool {
        matches!(self.operation, Operation::Update(_))
    }

    /// Compute the new state of `slice` given its current state.
    pub(crate) fn apply(self, slice: SliceId, last: &SliceValue) -> StoreResult<SliceValue> {
        match self.operation {
            Operation::Set(value) => Ok(value),
            Operation::Update(update) => update(slice, last),
        }
    }
}

impl fmt::Debug for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assignment")
            .field("atom", &self.atom)
            .field("update", &self.is_update())
            .finish()
    }
}

/// What [`Store::dispatch`](super::Store::dispatch) accepts.
#[derive(Debug)]
pub enum Action {
    /// A single assignment.
    Assign(Assignment),
    /// Nested actions, applied in order.
    Batch(Vec<Action>),
    /// An ignored entry.
    Skip,
}

impl Action {
    /// All assignments in declaration order, with nesting and skips removed.
    pub fn flatten(self) -> Vec<Assignment> {
        let mut assignments = Vec::new();
        let mut stack: SmallVec<[std::vec::IntoIter<Action>; 4]> = SmallVec::new();
        let mut next = Some(self);

        loop {
            match next.take() {
                Some(Action::Assign(assignment)) => assignments.push(assignment),
                Some(Action::Batch(actions)) => stack.push(actions.into_iter()),
                Some(Action::Skip) => {}
                None => {}
            }
            let Some(top) = stack.last_mut() else {
                break;
            };
            match top.next() {
                Some(action) => next = Some(action),
                None => {
                    stack.pop();
                }
            }
        }
        assignments
    }
}

impl From<Assignment> for Action {
    fn from(assignment: Assignment) -> Self {
        Action::Assign(assignment)
    }
}

impl<T: Into<Action>> From<Vec<T>> for Action {
    fn from(actions: Vec<T>) -> Self {
        Action::Batch(actions.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Action>, const N: usize> From<[T; N]> for Action {
    fn from(actions: [T; N]) -> Self {
        Action::Batch(actions.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Action>> From<Option<T>> for Action {
    fn from(action: Option<T>) -> Self {
        action.map_or(Action::Skip, Into::into)
    }
}

/// Booleans are placeholders left by `cond && assignment`-style building.
impl From<bool> for Action {
    fn from(_: bool) -> Self {
        Action::Skip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Atom;

    fn ids(assignments: &[Assignment]) -> Vec<u64> {
        assignments.iter().map(|a| a.atom().id().raw()).collect()
    }

    #[test]
    fn flatten_keeps_declaration_order() {
        let atoms: Vec<Atom<u32>> = (0..4).map(Atom::new).collect();
        let action = Action::Batch(vec![
            atoms[0].set(1).into(),
            Action::Batch(vec![atoms[1].set(1).into(), Action::Batch(vec![atoms[2].set(1).into()])]),
            atoms[3].set(1).into(),
        ]);

        let expected: Vec<u64> = atoms.iter().map(|a| a.id().raw()).collect();
        assert_eq!(ids(&action.flatten()), expected);
    }

    #[test]
    fn skips_are_dropped() {
        let atom = Atom::new(0_u32);
        let action = Action::Batch(vec![
            false.into(),
            None::<Assignment>.into(),
            Some(atom.set(2)).into(),
            Action::Batch(vec![]),
        ]);

        let assignments = action.flatten();
        assert_eq!(assignments.len(), 1);
        assert!(!assignments[0].is_update());
    }

    #[test]
    fn updates_see_the_last_value() {
        let atom = Atom::new(0_u32);
        let assignment = atom.update(|n| n + 5);
        assert!(assignment.is_update());

        let last: SliceValue = std::sync::Arc::new(10_u32);
        let next = assignment.apply(SliceId::from(0), &last).unwrap();
        assert_eq!(next.downcast_ref::<u32>(), Some(&15));
    }
}
