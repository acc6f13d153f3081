//! A thread-safe observable value store with composable scopes.
//!
//! A [`Store`] owns a single value that any thread may read or update. Subscribers are told about every
//! committed change, and only about actual changes. A [`Scope`] is a read/write view of part of a store (or
//! of another scope) built from a getter and a merge function; it owns no value of its own and only
//! notifies when its projection changes.
//!
//! # Key Features
//!
//! - Updates from any thread are totally ordered, and every subscriber sees them in that order.
//! - A subscriber may update the store it is subscribed to without deadlocking.
//! - Subscribers can ask to be called on their own [`DispatchQueue`] instead of the updating thread.
//! - Scope writes can be validated by filters; a rejected write is a silent no-op.
//!
//! # Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use reactive_store::{Change, Store};
//!
//! #[derive(Debug, Clone, PartialEq, Default)]
//! struct Position {
//!     x: f64,
//!     y: f64,
//! }
//!
//! let store = Store::new(Position::default());
//! let x = store.scope(|position| position.x, |position, x| position.x = x);
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let _token = {
//!     let seen = seen.clone();
//!     x.subscribe(None, false, move |change: &Change<f64>| seen.lock().unwrap().push(change.new))
//! };
//!
//! x.set(3.0);
//! // a change elsewhere in the store does not reach the `x` scope
//! store.update(|position| position.y = 4.0);
//!
//! assert_eq!(*seen.lock().unwrap(), vec![3.0]);
//! assert_eq!(store.value(), Position { x: 3.0, y: 4.0 });
//! ```

mod change;
mod config;
mod error;
mod mutex_box;
mod node;
mod queue;
mod registry;
mod scope;
mod store;
mod token;

pub use change::Change;
pub use config::StoreConfig;
pub use error::{ConfigError, QueueError};
pub use mutex_box::{LockMode, MutexBox};
pub use queue::DispatchQueue;
pub use registry::{Callback, Registry, SubscriberId};
pub use scope::{Scope, ScopeBuilder};
pub use store::Store;
pub use token::{SubscriptionBag, SubscriptionToken};
