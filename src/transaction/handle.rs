// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use super::{
    context::{ContextInner, Membership, SchedulerScope},
    deferred::Deferred,
    merge::{self, Merged},
};
use crate::{
    BoxError, CollectionRef, FastSet, GlobalKey, Mutation, PersistError, PersistFailure,
    TransactionError, Value,
};
use chrono::{DateTime, Utc};
use futures::future::{FutureExt, LocalBoxFuture};
use smallvec::SmallVec;
use std::{
    cell::{Cell, RefCell},
    cmp::Ordering,
    fmt,
    future::{Future, poll_fn},
    pin::pin,
    rc::{Rc, Weak},
    sync::atomic::{self, AtomicU64},
};
use tracing::{debug, warn};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Identifies a transaction. Generated as a ULID unless the caller picks one.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TransactionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Where a transaction is in its lifecycle.
///
/// States only move forward: `Pending → Persisting → Completed | Failed`, or
/// `Pending → Failed` through a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Pending,
    Persisting,
    Completed,
    Failed,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Persisting => "persisting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// Persists the mutations of a transaction, typically by sending them to a server.
pub type CommitFn = Rc<dyn Fn(Transaction) -> LocalBoxFuture<'static, Result<(), BoxError>>>;

pub(crate) fn boxed_commit_fn<F, Fut, E>(commit_fn: F) -> CommitFn
where
    F: Fn(Transaction) -> Fut + 'static,
    Fut: Future<Output = Result<(), E>> + 'static,
    E: Into<BoxError>,
{
    Rc::new(move |tx| {
        let persist = commit_fn(tx);
        async move { persist.await.map_err(Into::<BoxError>::into) }.boxed_local()
    })
}

/// Resolves once a transaction has settled.
pub type Persisting = LocalBoxFuture<'static, Result<Transaction, PersistFailure>>;

/// How to create a transaction.
///
/// ```rust
/// # use optimist::{TransactionConfig, BoxError, record};
/// let config = TransactionConfig::new(|tx| async move {
///     // send tx.mutations() to the server
///     Ok::<_, BoxError>(())
/// })
/// .auto_commit(false)
/// .metadata(record! { "source" => "settings-page" });
/// ```
#[derive(Clone)]
pub struct TransactionConfig {
    pub(crate) commit_fn: Option<CommitFn>,
    pub(crate) auto_commit: bool,
    pub(crate) metadata: Value,
    pub(crate) id: Option<TransactionId>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            commit_fn: None,
            auto_commit: true,
            metadata: Value::object(),
            id: None,
        }
    }
}

impl TransactionConfig {
    pub fn new<F, Fut, E>(commit_fn: F) -> Self
    where
        F: Fn(Transaction) -> Fut + 'static,
        Fut: Future<Output = Result<(), E>> + 'static,
        E: Into<BoxError>,
    {
        Self::default().commit_fn(commit_fn)
    }

    #[must_use]
    pub fn commit_fn<F, Fut, E>(mut self, commit_fn: F) -> Self
    where
        F: Fn(Transaction) -> Fut + 'static,
        Fut: Future<Output = Result<(), E>> + 'static,
        E: Into<BoxError>,
    {
        self.commit_fn = Some(boxed_commit_fn(commit_fn));
        self
    }

    pub(crate) fn with_commit_fn(mut self, commit_fn: CommitFn) -> Self {
        self.commit_fn = Some(commit_fn);
        self
    }

    /// Whether leaving a `mutate` scope commits the transaction. Defaults to `true`.
    #[must_use]
    pub fn auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<TransactionId>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl fmt::Debug for TransactionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionConfig")
            .field("commit_fn", &self.commit_fn.is_some())
            .field("auto_commit", &self.auto_commit)
            .field("metadata", &self.metadata)
            .field("id", &self.id)
            .finish()
    }
}

pub(crate) struct TransactionInner {
    id: TransactionId,
    context: Weak<ContextInner>,
    commit_fn: CommitFn,
    auto_commit: bool,
    created_at: DateTime<Utc>,
    sequence_number: u64,
    metadata: Value,
    state: Cell<TransactionState>,
    mutations: RefCell<Vec<Mutation>>,
    error: RefCell<Option<PersistError>>,
    persisted: Deferred<Result<(), PersistFailure>>,
}

/// A group of optimistic mutations that persist, or fail, together.
///
/// `Transaction` is a cheap handle; clones refer to the same transaction.
#[derive(Clone)]
pub struct Transaction(Rc<TransactionInner>);

impl Transaction {
    pub(crate) fn new(context: Weak<ContextInner>, commit_fn: CommitFn, config: TransactionConfig) -> Self {
        Self(Rc::new(TransactionInner {
            id: config.id.unwrap_or_else(TransactionId::generate),
            context,
            commit_fn,
            auto_commit: config.auto_commit,
            created_at: Utc::now(),
            sequence_number: SEQUENCE.fetch_add(1, atomic::Ordering::Relaxed),
            metadata: config.metadata,
            state: Cell::new(TransactionState::Pending),
            mutations: RefCell::new(Vec::new()),
            error: RefCell::new(None),
            persisted: Deferred::new(),
        }))
    }

    pub fn id(&self) -> &TransactionId {
        &self.0.id
    }

    pub fn state(&self) -> TransactionState {
        self.0.state.get()
    }

    pub fn auto_commit(&self) -> bool {
        self.0.auto_commit
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.0.created_at
    }

    pub fn sequence_number(&self) -> u64 {
        self.0.sequence_number
    }

    pub fn metadata(&self) -> &Value {
        &self.0.metadata
    }

    /// A snapshot of the mutations, in the order their rows were first written.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.0.mutations.borrow().clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.0.mutations.borrow().len()
    }

    pub(crate) fn with_mutations<R>(&self, f: impl FnOnce(&[Mutation]) -> R) -> R {
        f(&self.0.mutations.borrow())
    }

    /// The failure of the commit function, once it has failed.
    pub fn error(&self) -> Option<PersistError> {
        self.0.error.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Orders transactions by creation time, then by creation sequence.
    pub fn compare_created_at(&self, other: &Self) -> Ordering {
        self.created_at()
            .cmp(&other.created_at())
            .then_with(|| self.sequence_number().cmp(&other.sequence_number()))
    }

    fn context(&self) -> Result<Rc<ContextInner>, TransactionError> {
        self.0
            .context
            .upgrade()
            .ok_or_else(|| TransactionError::ContextDropped(self.id().clone()))
    }

    /// Runs `f` with this transaction as the ambient transaction.
    ///
    /// Collection writes issued by `f` without an explicit transaction join this one. With
    /// auto-commit enabled (the default) the transaction is committed once `f` returns `Ok`;
    /// the outcome of that commit is observable through [`is_persisted`](Self::is_persisted).
    pub fn mutate<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<TransactionError>,
    {
        self.ensure_mutable()?;
        let context = self.context()?;
        let result = {
            let _member = Membership::enter(&context, self);
            let _scheduler = SchedulerScope::enter(&context, self.id());
            f()
        };
        if result.is_ok() && self.auto_commit() {
            self.commit_detached();
        }
        result
    }

    /// Like [`mutate`](Self::mutate), for a callback that suspends.
    ///
    /// This transaction is ambient during every poll of the returned future, so writes made
    /// after an `.await` still join it while other tasks polled in between do not.
    pub async fn mutate_async<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError>,
    {
        self.ensure_mutable()?;
        let context = self.context()?;
        let result = {
            let _scheduler = SchedulerScope::enter(&context, self.id());
            let future = {
                let _member = Membership::enter(&context, self);
                f()
            };
            let mut future = pin!(future);
            poll_fn(|cx| {
                let _member = Membership::enter(&context, self);
                future.as_mut().poll(cx)
            })
            .await
        };
        if result.is_ok() && self.auto_commit() {
            self.commit_detached();
        }
        result
    }

    fn ensure_mutable(&self) -> Result<(), TransactionError> {
        if self.state() == TransactionState::Pending {
            Ok(())
        } else {
            Err(TransactionError::NotPendingMutate(self.id().clone()))
        }
    }

    /// Adds `batch` to this transaction, merging with earlier writes to the same rows.
    ///
    /// Either the whole batch is applied or, on an invalid write sequence, none of it.
    pub fn apply_mutations(&self, batch: impl IntoIterator<Item = Mutation>) -> Result<(), TransactionError> {
        self.ensure_mutable()?;
        let mut working = self.mutations();
        for incoming in batch {
            let existing = working
                .iter()
                .position(|mutation| mutation.global_key == incoming.global_key);
            match existing {
                Some(index) => match merge::merge_pending(&working[index], incoming)? {
                    Merged::Replace(merged) => working[index] = merged,
                    Merged::Cancel => {
                        working.remove(index);
                    }
                },
                None => working.push(incoming),
            }
        }
        *self.0.mutations.borrow_mut() = working;
        Ok(())
    }

    /// Starts persisting this transaction.
    ///
    /// A transaction without mutations completes immediately without calling its commit
    /// function. Otherwise the commit function runs on the context's executor; the returned
    /// future resolves once it has settled.
    pub fn commit(&self) -> Result<Persisting, TransactionError> {
        if self.state() != TransactionState::Pending {
            return Err(TransactionError::NotPendingCommit(self.id().clone()));
        }
        self.set_state(TransactionState::Persisting);

        if self.mutation_count() == 0 {
            self.set_state(TransactionState::Completed);
            self.0.persisted.settle(Ok(()));
            return Ok(self.is_persisted());
        }

        debug!(transaction = %self.id(), mutations = self.mutation_count(), "committing transaction");
        let persist = (self.0.commit_fn)(self.clone());
        let tx = self.clone();
        let driver = async move {
            let outcome = persist.await;
            tx.finish_commit(outcome.map_err(PersistError::from));
        };
        let spawned = self
            .context()
            .map_err(PersistError::new)
            .and_then(|context| context.spawn(driver.boxed_local()).map_err(PersistError::new));
        if let Err(error) = spawned {
            self.finish_commit(Err(error));
        }
        Ok(self.is_persisted())
    }

    fn commit_detached(&self) {
        if let Err(error) = self.commit() {
            debug!(transaction = %self.id(), %error, "auto-commit skipped");
        }
    }

    fn finish_commit(&self, outcome: Result<(), PersistError>) {
        match outcome {
            Ok(()) => {
                if self.state() != TransactionState::Persisting {
                    debug!(transaction = %self.id(), state = %self.state(), "commit finished after the transaction settled");
                    return;
                }
                self.set_state(TransactionState::Completed);
                self.touch_collections();
                self.0.persisted.settle(Ok(()));
            }
            Err(error) => {
                warn!(transaction = %self.id(), %error, "commit failed, rolling back");
                *self.0.error.borrow_mut() = Some(error);
                if let Err(error) = self.rollback() {
                    debug!(transaction = %self.id(), %error, "rollback after failed commit skipped");
                }
            }
        }
    }

    /// Marks this transaction failed and undoes its optimistic writes.
    ///
    /// Every other pending transaction that wrote to one of the same rows is rolled back as
    /// well. Rolling back a failed transaction again has no effect.
    pub fn rollback(&self) -> Result<(), TransactionError> {
        match self.state() {
            TransactionState::Completed => {
                Err(TransactionError::AlreadyCompletedRollback(self.id().clone()))
            }
            TransactionState::Failed => Ok(()),
            TransactionState::Pending | TransactionState::Persisting => {
                self.fail(None);
                Ok(())
            }
        }
    }

    fn fail(&self, caused_by: Option<&TransactionId>) {
        self.set_state(TransactionState::Failed);
        if caused_by.is_none() {
            for other in self.conflicting_transactions() {
                // an earlier cascade step may already have failed it
                if other.state() == TransactionState::Pending {
                    debug!(transaction = %other.id(), caused_by = %self.id(), "cascading rollback");
                    other.fail(Some(self.id()));
                }
            }
        }
        let failure = match (self.error(), caused_by) {
            (Some(error), _) => PersistFailure::Persist(error),
            (None, Some(id)) => PersistFailure::Conflict {
                caused_by: id.clone(),
            },
            (None, None) => PersistFailure::RolledBack,
        };
        self.0.persisted.settle(Err(failure));
        self.touch_collections();
    }

    /// Pending transactions, other than this one, sharing a row with this one; in registry
    /// order.
    fn conflicting_transactions(&self) -> Vec<Transaction> {
        let keys: FastSet<GlobalKey> = self.with_mutations(|mutations| {
            mutations.iter().map(|m| m.global_key.clone()).collect()
        });
        let Some(context) = self.0.context.upgrade() else {
            return Vec::new();
        };
        if keys.is_empty() {
            return Vec::new();
        }
        context
            .registered()
            .into_iter()
            .filter(|other| {
                !other.ptr_eq(self)
                    && other.state() == TransactionState::Pending
                    && other.with_mutations(|mutations| {
                        mutations.iter().any(|m| keys.contains(&m.global_key))
                    })
            })
            .collect()
    }

    fn set_state(&self, next: TransactionState) {
        let previous = self.0.state.replace(next);
        debug!(transaction = %self.id(), from = %previous, to = %next, "transaction state changed");
        if next.is_terminal() {
            if let Some(context) = self.0.context.upgrade() {
                context.unregister(self);
            }
        }
    }

    /// Lets every collection this transaction wrote to react to its new state.
    fn touch_collections(&self) {
        let collections = self.with_mutations(|mutations| {
            let mut distinct: SmallVec<[CollectionRef; 4]> = SmallVec::new();
            for mutation in mutations {
                if !distinct.iter().any(|c| c.id() == mutation.collection.id()) {
                    distinct.push(mutation.collection.clone());
                }
            }
            distinct
        });
        for collection in collections {
            let Some(observer) = collection.observer() else {
                continue;
            };
            observer.on_transaction_state_change();
            if observer.has_pending_synced_transactions() {
                observer.commit_pending_transactions();
            }
        }
    }

    /// Resolves with this transaction once it completes, or with why it failed.
    pub fn is_persisted(&self) -> Persisting {
        let settled = self.0.persisted.wait();
        let tx = self.clone();
        async move {
            match settled.await {
                Ok(Ok(())) => Ok(tx),
                Ok(Err(failure)) => Err(failure),
                Err(_canceled) => Err(PersistFailure::Abandoned),
            }
        }
        .boxed_local()
    }

    pub(crate) fn abandon(&self) {
        if self.0.persisted.settle(Err(PersistFailure::Abandoned)) {
            debug!(transaction = %self.id(), state = %self.state(), "transaction abandoned");
        }
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}
impl Eq for Transaction {}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", self.id())
            .field("state", &self.state())
            .field("mutations", &self.mutation_count())
            .finish()
    }
}
