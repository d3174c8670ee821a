// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Errors.
//!
//! Configuration and lifecycle errors ([`TransactionError`], [`CollectionError`],
//! [`SyncError`]) are returned synchronously from the call that caused them. Failures to
//! persist surface asynchronously, through [`Transaction::is_persisted`] and the future
//! returned by [`Transaction::commit`], as a [`PersistFailure`].
//!
//! [`Transaction::is_persisted`]: crate::Transaction::is_persisted
//! [`Transaction::commit`]: crate::Transaction::commit
use crate::{GlobalKey, Key, MutationType, TransactionId, draft::DraftError, mutation::CollectionId};
use std::{error::Error, fmt, sync::Arc};

/// The error type commit functions and mutation handlers return.
///
/// Both `&str` and `String` convert into it, keeping their text as the error message.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("a commit function is required when creating a transaction")]
    MissingMutationFunction,
    #[error("transaction {0} is no longer pending, so it cannot be mutated")]
    NotPendingMutate(TransactionId),
    #[error("transaction {0} is no longer pending, so it cannot be committed")]
    NotPendingCommit(TransactionId),
    #[error("transaction {0} is already completed, so it cannot be rolled back")]
    AlreadyCompletedRollback(TransactionId),
    #[error("the transaction context of {0} has been dropped")]
    ContextDropped(TransactionId),
    /// A write sequence that cannot happen to a single row, such as an update after a delete.
    #[error("cannot merge {incoming} into a pending {existing} of {global_key}")]
    InvalidMergeSequence {
        global_key: GlobalKey,
        existing: MutationType,
        incoming: MutationType,
    },
}

/// Why a commit function failed.
///
/// Cloning is cheap and keeps identity: every clone handed out for one failure is
/// [`ptr_eq`](PersistError::ptr_eq) to the error stored on the transaction.
#[derive(Clone)]
pub struct PersistError(Arc<dyn Error + Send + Sync + 'static>);

impl PersistError {
    pub fn new(error: impl Into<BoxError>) -> Self {
        Self(Arc::from(error.into()))
    }

    /// Whether both handles refer to the same failure.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn message(&self) -> String {
        self.0.to_string()
    }

    pub fn inner(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.0
    }

    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }
}

impl From<BoxError> for PersistError {
    fn from(error: BoxError) -> Self {
        Self(Arc::from(error))
    }
}

impl fmt::Debug for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PersistError").field(&self.0).finish()
    }
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Error for PersistError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.0.source()
    }
}

/// How a transaction failed to persist.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PersistFailure {
    /// The commit function failed.
    #[error(transparent)]
    Persist(PersistError),
    /// Rolled back because another transaction writing to a shared row failed.
    #[error("rolled back because conflicting transaction {caused_by} failed")]
    Conflict { caused_by: TransactionId },
    /// Rolled back by the caller.
    #[error("the transaction was rolled back")]
    RolledBack,
    /// The transaction was dropped without ever settling.
    #[error("the transaction was dropped before it settled")]
    Abandoned,
}

impl PersistFailure {
    pub fn persist_error(&self) -> Option<&PersistError> {
        match self {
            Self::Persist(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectionError {
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Draft(#[from] DraftError),
    #[error("collection {collection} has no {operation} handler and no ambient transaction is active")]
    MissingHandler {
        collection: CollectionId,
        operation: MutationType,
    },
    #[error("cannot insert, a row with key {0} already exists")]
    DuplicateKey(Key),
    #[error("the row has no key")]
    UndefinedKey,
    #[error("no keys were passed to {0}")]
    NoKeysPassed(MutationType),
    #[error("cannot update, no row with key {0} exists")]
    UpdateKeyNotFound(Key),
    #[error("cannot delete, no row with key {0} exists")]
    DeleteKeyNotFound(Key),
    #[error("an update may not change the key of a row (from {from} to {to})")]
    KeyUpdateNotAllowed { from: Key, to: Key },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("no pending sync transaction to write to")]
    NoPendingSyncTransaction,
    #[error("the pending sync transaction is already committed")]
    SyncTransactionAlreadyCommitted,
    #[error("cannot sync an insert of key {key} into {collection}, a different row with that key exists")]
    DuplicateKeySync { collection: CollectionId, key: Key },
    #[error("the synced row has no key")]
    UndefinedKey,
}
