//! Store
//!
//! A [`Store`] owns one slice graph and the tables mapping atoms and
//! selectors onto it. It is the only way to change state: assignments are
//! dispatched, applied, and their consequences propagated in one wave.
//!
//! # Example
//!
//! ```
//! use dicebox_core::{Atom, Effect, Selector, Store};
//!
//! let store = Store::new();
//! let count = Atom::new(1_u32);
//! let doubled = {
//!     let count = count.clone();
//!     Selector::new(move |peek, _| Ok(*peek.get(&count)? * 2))
//! };
//!
//! let effect = {
//!     let doubled = doubled.clone();
//!     Effect::new(move |peek, _| {
//!         println!("doubled = {}", peek.get(&doubled)?);
//!         Ok(())
//!     })
//! };
//! let _subscription = store.subscribe(&effect).unwrap();
//!
//! store.dispatch(count.update(|n| n + 1)).unwrap();
//! assert_eq!(*store.peek(&doubled).unwrap(), 4);
//! ```

mod action;
mod middleware;
mod peek;
mod persist;
#[allow(clippy::module_inception)]
mod store;
mod subscribe;

pub use action::{Action, Assignment};
pub use middleware::Middleware;
pub use peek::Peek;
pub use persist::{MemoryStorage, PersistMiddleware, Storage};
pub use store::{Store, StoreBuilder};
pub use subscribe::{Completion, Effect, EffectId, Subscription, Teardown};
