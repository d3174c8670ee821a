// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Optimist: optimistic transactions for client-embedded stores
//!
//! This crate lets an application apply writes to its local data immediately, before a server
//! has confirmed them, and undo them precisely when the server refuses. It is meant for the data
//! layer of interactive clients, where waiting a round-trip for every keystroke is not an
//! option.
//!
//! ## Core Concepts
//!
//! - A [`Value`] is a dynamically typed record: objects, arrays, keyed maps, sets and scalars.
//!   Rows are addressed by a [`Key`].
//! - A [`Draft`] is an editable clone of a record that remembers which fields were touched, so
//!   that only the net change of an edit has to be sent anywhere. Setting a field back to its
//!   original value counts as no change.
//! - A [`Mutation`] is one write (insert, update or delete) to one row of one collection. Rows
//!   are identified across collections by their [`GlobalKey`].
//! - A [`Transaction`] groups mutations that persist together. Writing the same row twice within
//!   one transaction merges the two writes: an insert followed by an update stays an insert,
//!   an insert followed by a delete disappears entirely.
//! - A [`Collection`] overlays the mutations of all unsettled transactions on top of the data
//!   it received from a sync layer, and notifies subscribers with [`ChangeMessage`]s.
//!
//! ## Transaction Lifecycle
//!
//! ```text
//!   pending ──commit──▶ persisting ──ok──▶ completed
//!      │                    │
//!      └────rollback────────┴───error────▶ failed
//! ```
//!
//! Committing hands the transaction to its commit function, which runs on the executor the
//! [`TransactionContext`] was created with. When a commit fails (or a transaction is rolled
//! back), every other *pending* transaction that wrote to one of the same rows is rolled back as
//! well: its writes were made on top of state that is now known to be wrong.
//!
//! ## Ambient Transactions
//!
//! [`Transaction::mutate`] makes a transaction *ambient* for the duration of a callback.
//! Collection writes issued in the callback join it instead of creating transactions of their
//! own, and change notifications are batched until the callback returns, through the context's
//! [`Scheduler`].
//!
//! ```rust
//! use futures::executor::LocalPool;
//! use optimist::{
//!     BoxError, Collection, CollectionConfig, CollectionError, MutationOptions,
//!     TransactionConfig, TransactionContext, record,
//! };
//!
//! let mut pool = LocalPool::new();
//! let context = TransactionContext::new(pool.spawner());
//! let todos = Collection::new(&context, CollectionConfig::keyed_by("todos", "id"));
//!
//! let tx = context
//!     .create_transaction(TransactionConfig::new(|tx| async move {
//!         assert_eq!(tx.mutation_count(), 1);
//!         Ok::<_, BoxError>(())
//!     }))
//!     .unwrap();
//!
//! tx.mutate(|| {
//!     todos.insert([record! { "id" => 1, "title" => "Buy milk" }], MutationOptions::default())?;
//!     todos.update_one(1, MutationOptions::default(), |draft| draft.set("done", true))?;
//!     Ok::<_, CollectionError>(())
//! })
//! .unwrap();
//!
//! let persisted = pool.run_until(tx.is_persisted()).unwrap();
//! assert_eq!(persisted.mutations()[0].modified.get_field("done").unwrap(), &true);
//! ```
//!
//! ## Threading
//!
//! Everything here is single-threaded: handles are reference counted with [`Rc`](std::rc::Rc)
//! and commit functions are spawned on a [`LocalSpawn`](futures::task::LocalSpawn) executor.
//! A UI thread owns its context and everything created from it.
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

use ahash::RandomState;
use std::collections::{HashMap, HashSet};

pub(crate) type FastMap<K, V> = HashMap<K, V, RandomState>;
pub(crate) type FastSet<T> = HashSet<T, RandomState>;

pub(crate) fn create_map<K, V>() -> FastMap<K, V> {
    HashMap::with_hasher(RandomState::new())
}

mod value;
pub use value::{Key, Pattern, Prop, Value, ValueKind};
pub mod draft;
pub use draft::{Draft, DraftError, DraftNode, Element, wrap};
pub mod mutation;
pub use mutation::{
    CollectionId, CollectionRef, GlobalKey, Mutation, MutationType, TransactionObserver,
};
pub mod transaction;
pub use transaction::{
    CommitFn, Persisting, Transaction, TransactionConfig, TransactionContext, TransactionId,
    TransactionState,
};
pub mod scheduler;
pub use scheduler::{Job, Scheduler, SchedulerError};
pub mod collection;
pub use collection::{
    ChangeMessage, Collection, CollectionConfig, LoadSubsetOptions, MutationOptions,
    RowUpdateMode, SyncMode, SyncOperation, SyncWriter,
};
pub mod subset;
pub use subset::{LoadSubset, LoadingSubsetChange, SubsetLoadTracker};
pub mod error;
pub use error::{
    BoxError, CollectionError, PersistError, PersistFailure, SyncError, TransactionError,
};
mod listeners;
pub use listeners::ListenerId;
#[cfg(feature = "json")]
mod json;
/// Macros usable for tests and initialization
pub mod macros;
