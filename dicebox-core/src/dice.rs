//! Dice
//!
//! The dice roller's state: a named atom holding the list of rolled dice,
//! each die an atom of its own so that rerolling one die only touches that
//! die's subscribers.

use std::sync::{Arc, OnceLock};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::state::{Atom, Selector};
use crate::store::{Assignment, Peek, Store};

/// One rolled die.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Die {
    /// Number of faces, at least one.
    pub faces: u32,
    /// The face showing, in `1..=faces`.
    pub roll: u32,
}

impl Die {
    /// Roll a fresh die with `faces` faces.
    pub fn roll(faces: u32) -> Self {
        Self::roll_with(&mut rand::rng(), faces)
    }

    /// Roll a fresh die using `rng`.
    pub fn roll_with<R: Rng + ?Sized>(rng: &mut R, faces: u32) -> Self {
        let faces = faces.max(1);
        Self {
            faces,
            roll: rng.random_range(1..=faces),
        }
    }

    /// The same die showing the next face, wrapping around after the last.
    pub fn incremented(self) -> Self {
        Self {
            faces: self.faces,
            roll: self.roll % self.faces.max(1) + 1,
        }
    }
}

/// The list of dice on the table.
pub fn dice_atom() -> &'static Atom<Vec<Atom<Die>>> {
    static DICE: OnceLock<Atom<Vec<Atom<Die>>>> = OnceLock::new();
    DICE.get_or_init(|| Atom::named("dice", Vec::new()))
}

/// Roll a new die and add it to the table.
pub fn add_die_roll(faces: u32) -> Assignment {
    let die = Atom::new(Die::roll(faces));
    dice_atom().update(move |dice| {
        let mut dice = dice.clone();
        dice.push(die);
        dice
    })
}

/// Roll `die` again.
pub fn reroll_die(die: &Atom<Die>) -> Assignment {
    die.update(|last| Die::roll(last.faces))
}

/// Turn `die` to its next face.
pub fn increment_die(die: &Atom<Die>) -> Assignment {
    die.update(|last| last.incremented())
}

/// Remove every die from the table.
pub fn clear_dice() -> Assignment {
    dice_atom().set(Vec::new())
}

fn sum_rolls(peek: &Peek<'_>, _: &Store) -> StoreResult<u64> {
    let dice = peek.get(dice_atom())?;
    let mut total = 0;
    for die in dice.iter() {
        total += u64::from(peek.get(die)?.roll);
    }
    Ok(total)
}

/// Sum of the faces showing.
pub fn total() -> Selector<u64> {
    Selector::new(sum_rolls)
}

/// Reroll every die on the table in a single dispatch.
pub fn reroll_all(store: &Store) -> StoreResult<()> {
    store.dispatch_thunk(|store, peek| {
        let dice: Arc<Vec<Atom<Die>>> = peek.get(dice_atom())?;
        store.dispatch(dice.iter().map(reroll_die).collect::<Vec<_>>())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn rolls_stay_on_the_die() {
        let mut rng = StdRng::seed_from_u64(7);
        for faces in [1, 2, 6, 20] {
            for _ in 0..50 {
                let die = Die::roll_with(&mut rng, faces);
                assert!((1..=faces).contains(&die.roll));
            }
        }
        assert_eq!(Die::roll_with(&mut rng, 0).faces, 1);
    }

    #[test]
    fn increment_wraps_around() {
        let die = Die { faces: 6, roll: 5 };
        assert_eq!(die.incremented().roll, 6);
        assert_eq!(die.incremented().incremented().roll, 1);
    }

    #[test]
    fn total_is_shared() {
        assert_eq!(total(), total());
    }

    #[test]
    fn total_of_large_dice_does_not_wrap() {
        let store = Store::new();
        let big = Die {
            faces: u32::MAX,
            roll: u32::MAX,
        };
        store
            .dispatch(dice_atom().set(vec![Atom::new(big), Atom::new(big)]))
            .unwrap();
        assert_eq!(*store.peek(&total()).unwrap(), 2 * u64::from(u32::MAX));
    }

    #[test]
    fn increment_die_updates_in_place() {
        let store = Store::new();
        let die = Atom::new(Die { faces: 4, roll: 4 });
        store.dispatch(increment_die(&die)).unwrap();
        assert_eq!(*store.peek(&die).unwrap(), Die { faces: 4, roll: 1 });
    }
}
