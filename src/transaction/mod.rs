// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Transactions: groups of optimistic mutations that persist, or fail, together.
//!
//! A [`Transaction`] is created from a [`TransactionContext`] with a commit function that
//! persists its mutations. Mutations are added either directly, with
//! [`Transaction::apply_mutations`], or by writing to collections inside
//! [`Transaction::mutate`].
//!
//! # Merging
//!
//! A transaction holds at most one mutation per row. A new write to a row that already has one
//! is merged into it, keeping the position of the first write:
//!
//! | existing | incoming | result                                                    |
//! |----------|----------|-----------------------------------------------------------|
//! | insert   | update   | insert of the updated row                                 |
//! | insert   | delete   | nothing; the row never existed as far as the server knows |
//! | update   | update   | update with the changes of both                           |
//! | update   | delete   | delete                                                    |
//! | delete   | delete   | the later delete                                          |
//! | insert   | insert   | the later insert                                          |
//!
//! Any other sequence (an insert or update after a delete, or an insert after an update) is
//! rejected with
//! [`TransactionError::InvalidMergeSequence`](crate::TransactionError::InvalidMergeSequence),
//! leaving the transaction unchanged.
//!
//! # Rollback
//!
//! When a transaction fails, its optimistic writes are undone. Every other pending transaction
//! with a mutation of one of the same rows is rolled back too, since it was built on top of
//! state that will never be confirmed. The cascade is one level deep: transactions rolled back
//! because of a conflict do not cascade further.
//!
//! ```rust
//! # use optimist::{BoxError, CollectionRef, Key, Mutation, PersistFailure, TransactionConfig, TransactionContext, TransactionState, record};
//! # use futures::executor::LocalPool;
//! let mut pool = LocalPool::new();
//! let context = TransactionContext::new(pool.spawner());
//! let todos = CollectionRef::detached("todos");
//! let config = || TransactionConfig::new(|_| async { Ok::<_, BoxError>(()) }).auto_commit(false);
//!
//! let first = context.create_transaction(config()).unwrap();
//! first.apply_mutations([Mutation::insert(todos.clone(), Key::from(1), record! { "id" => 1 })]).unwrap();
//! let second = context.create_transaction(config()).unwrap();
//! second.apply_mutations([Mutation::delete(todos, Key::from(1), record! { "id" => 1 })]).unwrap();
//!
//! first.rollback().unwrap();
//! assert_eq!(second.state(), TransactionState::Failed);
//! assert!(matches!(
//!     pool.run_until(second.is_persisted()),
//!     Err(PersistFailure::Conflict { .. })
//! ));
//! ```
mod context;
mod deferred;
mod handle;
mod merge;

pub use context::TransactionContext;
pub(crate) use handle::boxed_commit_fn;
pub use handle::{
    CommitFn, Persisting, Transaction, TransactionConfig, TransactionId, TransactionState,
};
