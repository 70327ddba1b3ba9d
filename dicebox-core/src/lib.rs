//! Dicebox Core
//!
//! This crate provides the state store behind the dicebox dice roller.
//! It implements:
//!
//! - A fine-grained reactive slice graph with dynamic dependency tracking
//! - Batched, glitch-free propagation of state changes
//! - Atoms, selectors and effects on top of the graph
//! - A store with dispatch, middleware and persistence
//! - The dice roller's own state
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Slices, cold reads and the propagation scheduler
//! - `state`: Atoms, selectors and snapshot serialization
//! - `store`: The store, dispatch, subscriptions and middleware
//! - `dice`: Dice atoms, assignments and the total selector
//!
//! # Example
//!
//! ```rust
//! use dicebox_core::dice::{add_die_roll, clear_dice, total};
//! use dicebox_core::Store;
//!
//! let store = Store::new();
//! store.dispatch(vec![add_die_roll(6), add_die_roll(6)]).unwrap();
//!
//! let sum = *store.peek(&total()).unwrap();
//! assert!((2..=12).contains(&sum));
//!
//! store.dispatch(clear_dice()).unwrap();
//! assert_eq!(*store.peek(&total()).unwrap(), 0);
//! ```

pub mod dice;
pub mod error;
pub mod graph;
pub mod state;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use state::{Atom, Readable, Selector, State, StateValue};
pub use store::{Action, Assignment, Effect, Peek, Store, Subscription};
