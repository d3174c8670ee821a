// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Collections of rows that show local writes before they are persisted.
//!
//! A [`Collection`] holds two layers:
//!
//! - the *synced* rows, written by a sync layer through a [`SyncWriter`] and treated as the
//!   truth;
//! - an *optimistic overlay*, rebuilt from the mutations of every transaction that wrote to the
//!   collection and has not completed or failed yet.
//!
//! Reads see the overlay on top of the synced rows. Whenever a transaction changes state the
//! overlay is rebuilt, and once a transaction completes its writes are expected to come back
//! through the sync layer. Synced batches that arrive while a transaction of the collection is
//! persisting are held back until it settles, so a server echo never briefly overwrites a write
//! the user is still waiting on.
//!
//! Writes ([`insert`](Collection::insert), [`update`](Collection::update),
//! [`delete`](Collection::delete)) join the ambient transaction when called inside
//! [`Transaction::mutate`]. Otherwise each call creates its own transaction, persisted by the
//! matching handler of the [`CollectionConfig`], and commits it right away.
//!
//! ```rust
//! # use optimist::{BoxError, Collection, CollectionConfig, Key, MutationOptions, TransactionContext, record};
//! # use futures::executor::LocalPool;
//! let mut pool = LocalPool::new();
//! let context = TransactionContext::new(pool.spawner());
//! let todos = Collection::new(
//!     &context,
//!     CollectionConfig::keyed_by("todos", "id")
//!         .on_insert(|tx| async move {
//!             // send tx.mutations() to the server
//!             Ok::<_, BoxError>(())
//!         }),
//! );
//!
//! let tx = todos
//!     .insert([record! { "id" => 1, "title" => "buy milk" }], MutationOptions::default())
//!     .unwrap();
//! assert!(todos.has(&Key::from(1)));
//!
//! pool.run_until_stalled();
//! assert_eq!(tx.state(), optimist::TransactionState::Completed);
//! ```
mod state;
mod sync;

pub use sync::{SyncOperation, SyncWriter};

use self::state::CollectionState;
use crate::{
    BoxError, CollectionError, CollectionId, CollectionRef, CommitFn, Draft, DraftError, DraftNode,
    Job, Key, LoadSubset, Mutation, MutationType, SubsetLoadTracker, Transaction,
    TransactionConfig, TransactionContext, TransactionObserver, Value,
    listeners::{ListenerId, Listeners},
    transaction::boxed_commit_fn,
};
use std::{
    cell::RefCell,
    fmt,
    future::Future,
    mem,
    rc::{Rc, Weak},
};
use tracing::debug;

/// How a synced update is applied to the existing synced row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowUpdateMode {
    /// The update carries only changed fields, which are merged into the row.
    #[default]
    Partial,
    /// The update carries the whole row, which replaces the existing one.
    Full,
}

/// When the sync layer delivers rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Everything is synced up front; subset loads are no-ops.
    #[default]
    Eager,
    /// Rows are loaded when a query asks for them, through the configured subset loader.
    OnDemand,
}

/// A visible change to a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeMessage {
    Insert {
        key: Key,
        value: Value,
    },
    Update {
        key: Key,
        value: Value,
        previous_value: Value,
    },
    /// `value` is the row as it was before it disappeared.
    Delete {
        key: Key,
        value: Value,
    },
}

impl ChangeMessage {
    pub fn key(&self) -> &Key {
        match self {
            Self::Insert { key, .. } | Self::Update { key, .. } | Self::Delete { key, .. } => key,
        }
    }

    pub fn value(&self) -> &Value {
        match self {
            Self::Insert { value, .. } | Self::Update { value, .. } | Self::Delete { value, .. } => {
                value
            }
        }
    }

    pub fn kind(&self) -> MutationType {
        match self {
            Self::Insert { .. } => MutationType::Insert,
            Self::Update { .. } => MutationType::Update,
            Self::Delete { .. } => MutationType::Delete,
        }
    }

    /// The change that turns `previous` into `current`, if they differ.
    pub(crate) fn between(key: Key, previous: Option<&Value>, current: Option<&Value>) -> Option<Self> {
        match (previous, current) {
            (None, None) => None,
            (None, Some(value)) => Some(Self::Insert {
                key,
                value: value.clone(),
            }),
            (Some(value), None) => Some(Self::Delete {
                key,
                value: value.clone(),
            }),
            (Some(previous), Some(current)) if previous != current => Some(Self::Update {
                key,
                value: current.clone(),
                previous_value: previous.clone(),
            }),
            (Some(_), Some(_)) => None,
        }
    }
}

/// Describes which rows a query needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSubsetOptions {
    pub filter: Option<Value>,
    pub order_by: Vec<String>,
    pub limit: Option<usize>,
    pub cursor: Option<Value>,
}

type GetKeyFn = Rc<dyn Fn(&Value) -> Option<Key>>;
type LoadSubsetFn = Rc<dyn Fn(&LoadSubsetOptions) -> LoadSubset>;
type UnloadSubsetFn = Rc<dyn Fn(&LoadSubsetOptions)>;

/// How to create a collection.
#[derive(Clone)]
pub struct CollectionConfig {
    id: CollectionId,
    get_key: GetKeyFn,
    on_insert: Option<CommitFn>,
    on_update: Option<CommitFn>,
    on_delete: Option<CommitFn>,
    row_update_mode: RowUpdateMode,
    sync_mode: SyncMode,
    load_subset: Option<LoadSubsetFn>,
    unload_subset: Option<UnloadSubsetFn>,
}

impl CollectionConfig {
    /// `get_key` extracts the key of a row, or `None` if the row has none.
    pub fn new(id: impl Into<CollectionId>, get_key: impl Fn(&Value) -> Option<Key> + 'static) -> Self {
        Self {
            id: id.into(),
            get_key: Rc::new(get_key),
            on_insert: None,
            on_update: None,
            on_delete: None,
            row_update_mode: RowUpdateMode::default(),
            sync_mode: SyncMode::default(),
            load_subset: None,
            unload_subset: None,
        }
    }

    /// Keys rows by the value of one of their fields.
    pub fn keyed_by(id: impl Into<CollectionId>, field: impl Into<String>) -> Self {
        let field = field.into();
        Self::new(id, move |row| row.get_field(&field).and_then(Value::to_key))
    }

    /// Persists inserts made outside of an explicit transaction.
    #[must_use]
    pub fn on_insert<F, Fut, E>(mut self, handler: F) -> Self
    where
        F: Fn(Transaction) -> Fut + 'static,
        Fut: Future<Output = Result<(), E>> + 'static,
        E: Into<BoxError>,
    {
        self.on_insert = Some(boxed_commit_fn(handler));
        self
    }

    /// Persists updates made outside of an explicit transaction.
    #[must_use]
    pub fn on_update<F, Fut, E>(mut self, handler: F) -> Self
    where
        F: Fn(Transaction) -> Fut + 'static,
        Fut: Future<Output = Result<(), E>> + 'static,
        E: Into<BoxError>,
    {
        self.on_update = Some(boxed_commit_fn(handler));
        self
    }

    /// Persists deletes made outside of an explicit transaction.
    #[must_use]
    pub fn on_delete<F, Fut, E>(mut self, handler: F) -> Self
    where
        F: Fn(Transaction) -> Fut + 'static,
        Fut: Future<Output = Result<(), E>> + 'static,
        E: Into<BoxError>,
    {
        self.on_delete = Some(boxed_commit_fn(handler));
        self
    }

    #[must_use]
    pub fn row_update_mode(mut self, mode: RowUpdateMode) -> Self {
        self.row_update_mode = mode;
        self
    }

    #[must_use]
    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    #[must_use]
    pub fn load_subset(mut self, loader: impl Fn(&LoadSubsetOptions) -> LoadSubset + 'static) -> Self {
        self.load_subset = Some(Rc::new(loader));
        self
    }

    #[must_use]
    pub fn unload_subset(mut self, unloader: impl Fn(&LoadSubsetOptions) + 'static) -> Self {
        self.unload_subset = Some(Rc::new(unloader));
        self
    }

    fn handler(&self, kind: MutationType) -> Option<&CommitFn> {
        match kind {
            MutationType::Insert => self.on_insert.as_ref(),
            MutationType::Update => self.on_update.as_ref(),
            MutationType::Delete => self.on_delete.as_ref(),
        }
    }
}

impl fmt::Debug for CollectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionConfig")
            .field("id", &self.id)
            .field("on_insert", &self.on_insert.is_some())
            .field("on_update", &self.on_update.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .field("row_update_mode", &self.row_update_mode)
            .field("sync_mode", &self.sync_mode)
            .finish_non_exhaustive()
    }
}

/// Per-write options.
#[derive(Debug, Clone)]
pub struct MutationOptions {
    optimistic: bool,
    metadata: Option<Value>,
}

impl Default for MutationOptions {
    fn default() -> Self {
        Self {
            optimistic: true,
            metadata: None,
        }
    }
}

impl MutationOptions {
    /// Whether the write shows in the collection before it persists. Defaults to `true`.
    #[must_use]
    pub fn optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn apply(&self, mutation: Mutation) -> Mutation {
        mutation
            .with_optimistic(self.optimistic)
            .with_metadata(self.metadata.clone())
    }
}

/// A keyed set of rows with an optimistic overlay.
///
/// `Collection` is a cheap handle; clones refer to the same collection.
#[derive(Clone)]
pub struct Collection(Rc<CollectionInner>);

pub(crate) struct CollectionInner {
    id: CollectionId,
    context: TransactionContext,
    config: CollectionConfig,
    state: RefCell<CollectionState>,
    listeners: Listeners<[ChangeMessage]>,
    /// Changes waiting for the ambient transaction's `mutate` scope to end.
    queued: RefCell<Vec<ChangeMessage>>,
    subsets: SubsetLoadTracker,
    this: Weak<CollectionInner>,
}

impl Collection {
    pub fn new(context: &TransactionContext, config: CollectionConfig) -> Self {
        Self(Rc::new_cyclic(|this| CollectionInner {
            id: config.id.clone(),
            context: context.clone(),
            state: RefCell::new(CollectionState::new(config.id.clone())),
            config,
            listeners: Listeners::default(),
            queued: RefCell::new(Vec::new()),
            subsets: SubsetLoadTracker::new(),
            this: this.clone(),
        }))
    }

    pub fn id(&self) -> &CollectionId {
        &self.0.id
    }

    pub fn get(&self, key: &Key) -> Option<Value> {
        self.0.state.borrow().get(key).cloned()
    }

    pub fn has(&self, key: &Key) -> bool {
        self.0.state.borrow().has(key)
    }

    /// Visible keys: synced rows in key order, followed by rows that only exist locally.
    pub fn keys(&self) -> Vec<Key> {
        self.0.state.borrow().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.entries().into_iter().map(|(_, value)| value).collect()
    }

    pub fn entries(&self) -> Vec<(Key, Value)> {
        let state = self.0.state.borrow();
        state
            .keys()
            .filter_map(|key| state.get(key).map(|value| (key.clone(), value.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.state.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the visible row at `key` comes from a write that has not settled yet.
    pub fn is_optimistic(&self, key: &Key) -> bool {
        self.0.state.borrow().is_optimistic(key)
    }

    /// The metadata the sync layer attached to the synced row at `key`.
    pub fn synced_metadata(&self, key: &Key) -> Option<Value> {
        self.0.state.borrow().synced_metadata.get(key).cloned()
    }

    /// Transactions with writes to this collection that have not completed or failed yet.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.0.state.borrow().tracked_transactions().to_vec()
    }

    /// Calls `listener` with every batch of visible changes.
    pub fn subscribe_changes(&self, listener: impl Fn(&[ChangeMessage]) + 'static) -> ListenerId {
        self.0.listeners.add(listener)
    }

    pub fn unsubscribe_changes(&self, id: ListenerId) -> bool {
        self.0.listeners.remove(id)
    }

    pub fn sync_writer(&self) -> SyncWriter {
        SyncWriter::new(Rc::clone(&self.0))
    }

    /// Inserts new rows.
    pub fn insert(
        &self,
        rows: impl IntoIterator<Item = Value>,
        options: MutationOptions,
    ) -> Result<Transaction, CollectionError> {
        let inner = &self.0;
        let ambient = inner.ambient_or_handler(MutationType::Insert)?;
        let mut batch: Vec<Key> = Vec::new();
        let mut mutations = Vec::new();
        {
            let state = inner.state.borrow();
            for row in rows {
                let key = inner.key_of(&row).ok_or(CollectionError::UndefinedKey)?;
                if state.has(&key) || batch.contains(&key) {
                    return Err(CollectionError::DuplicateKey(key));
                }
                batch.push(key.clone());
                mutations.push(options.apply(Mutation::insert(inner.collection_ref(), key, row)));
            }
        }
        if mutations.is_empty() {
            return Err(CollectionError::NoKeysPassed(MutationType::Insert));
        }
        inner.enlist(ambient, MutationType::Insert, mutations)
    }

    /// Edits the rows at `keys` through drafts, one per key and in the same order.
    ///
    /// Rows whose draft ends up unchanged are skipped. If no row changed, the returned
    /// transaction is empty and already completed.
    pub fn update<K, F>(
        &self,
        keys: impl IntoIterator<Item = K>,
        options: MutationOptions,
        edit: F,
    ) -> Result<Transaction, CollectionError>
    where
        K: Into<Key>,
        F: FnOnce(&mut [Draft]) -> Result<(), DraftError>,
    {
        let inner = &self.0;
        let ambient = inner.ambient_or_handler(MutationType::Update)?;
        let keys: Vec<Key> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Err(CollectionError::NoKeysPassed(MutationType::Update));
        }
        let originals = {
            let state = inner.state.borrow();
            keys.iter()
                .map(|key| {
                    state
                        .get(key)
                        .cloned()
                        .ok_or_else(|| CollectionError::UpdateKeyNotFound(key.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        let mut drafts: Vec<Draft> = originals.iter().map(Draft::new).collect();
        edit(&mut drafts)?;

        let mut mutations = Vec::new();
        for ((key, original), draft) in keys.into_iter().zip(originals).zip(drafts) {
            if !draft.is_modified() {
                continue;
            }
            let changes = draft.changes();
            let modified = draft.into_current();
            let new_key = inner.key_of(&modified).ok_or(CollectionError::UndefinedKey)?;
            if new_key != key {
                return Err(CollectionError::KeyUpdateNotAllowed {
                    from: key,
                    to: new_key,
                });
            }
            let sync_metadata = inner.synced_metadata_or_empty(&key);
            mutations.push(
                options
                    .apply(Mutation::update(inner.collection_ref(), key, original, modified, changes))
                    .with_sync_metadata(sync_metadata),
            );
        }

        if mutations.is_empty() {
            debug!(collection = %inner.id, "update changed nothing");
            let tx = inner
                .context
                .create_transaction(TransactionConfig::new(|_| async { Ok::<_, BoxError>(()) }))?;
            let _ = tx.commit()?;
            return Ok(tx);
        }
        inner.enlist(ambient, MutationType::Update, mutations)
    }

    /// Edits the row at `key` through a draft.
    pub fn update_one<F>(
        &self,
        key: impl Into<Key>,
        options: MutationOptions,
        edit: F,
    ) -> Result<Transaction, CollectionError>
    where
        F: FnOnce(&mut DraftNode<'_>) -> Result<(), DraftError>,
    {
        self.update([key.into()], options, |drafts| match drafts.first_mut() {
            Some(draft) => edit(&mut draft.root()),
            None => Ok(()),
        })
    }

    /// Deletes the rows at `keys`.
    pub fn delete<K>(
        &self,
        keys: impl IntoIterator<Item = K>,
        options: MutationOptions,
    ) -> Result<Transaction, CollectionError>
    where
        K: Into<Key>,
    {
        let inner = &self.0;
        let ambient = inner.ambient_or_handler(MutationType::Delete)?;
        let mut mutations = Vec::new();
        for key in keys.into_iter().map(Into::into) {
            let original = inner
                .state
                .borrow()
                .get(&key)
                .cloned()
                .ok_or_else(|| CollectionError::DeleteKeyNotFound(key.clone()))?;
            let sync_metadata = inner.synced_metadata_or_empty(&key);
            mutations.push(
                options
                    .apply(Mutation::delete(inner.collection_ref(), key, original))
                    .with_sync_metadata(sync_metadata),
            );
        }
        if mutations.is_empty() {
            return Err(CollectionError::NoKeysPassed(MutationType::Delete));
        }
        inner.enlist(ambient, MutationType::Delete, mutations)
    }

    /// Asks the sync layer for the rows described by `options`.
    ///
    /// Eagerly synced collections, and collections without a subset loader, have nothing to
    /// load and return [`LoadSubset::Ready`]. Loads in flight are counted by
    /// [`subset_tracker`](Self::subset_tracker).
    pub fn load_subset(&self, options: &LoadSubsetOptions) -> LoadSubset {
        let config = &self.0.config;
        if config.sync_mode == SyncMode::Eager {
            return LoadSubset::Ready;
        }
        match &config.load_subset {
            Some(loader) => self.0.subsets.load_subset(loader(options)),
            None => LoadSubset::Ready,
        }
    }

    /// Tells the sync layer the rows described by `options` are no longer needed.
    pub fn unload_subset(&self, options: &LoadSubsetOptions) {
        if let Some(unloader) = &self.0.config.unload_subset {
            unloader(options);
        }
    }

    pub fn is_loading_subset(&self) -> bool {
        self.0.subsets.is_loading_subset()
    }

    pub fn subset_tracker(&self) -> &SubsetLoadTracker {
        &self.0.subsets
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.0.id)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl CollectionInner {
    fn key_of(&self, row: &Value) -> Option<Key> {
        (self.config.get_key)(row)
    }

    fn collection_ref(&self) -> CollectionRef {
        let observer: Weak<dyn TransactionObserver> = self.this.clone();
        CollectionRef::from_weak(self.id.clone(), observer)
    }

    fn synced_metadata_or_empty(&self, key: &Key) -> Value {
        self.state
            .borrow()
            .synced_metadata
            .get(key)
            .cloned()
            .unwrap_or_else(Value::object)
    }

    /// The ambient transaction, or an error if there is none and no handler could persist the
    /// write on its own.
    fn ambient_or_handler(&self, kind: MutationType) -> Result<Option<Transaction>, CollectionError> {
        let ambient = self.context.active_transaction();
        if ambient.is_none() && self.config.handler(kind).is_none() {
            return Err(CollectionError::MissingHandler {
                collection: self.id.clone(),
                operation: kind,
            });
        }
        Ok(ambient)
    }

    /// Adds `mutations` to the ambient transaction, or to a new transaction that is committed
    /// right away.
    fn enlist(
        &self,
        ambient: Option<Transaction>,
        kind: MutationType,
        mutations: Vec<Mutation>,
    ) -> Result<Transaction, CollectionError> {
        if let Some(tx) = ambient {
            tx.apply_mutations(mutations)?;
            self.track_write(&tx);
            return Ok(tx);
        }

        let handler = self
            .config
            .handler(kind)
            .cloned()
            .ok_or_else(|| CollectionError::MissingHandler {
                collection: self.id.clone(),
                operation: kind,
            })?;
        let tx = self
            .context
            .create_transaction(TransactionConfig::default().with_commit_fn(handler))?;
        tx.apply_mutations(mutations)?;
        self.track_write(&tx);
        debug!(collection = %self.id, transaction = %tx.id(), operation = %kind, "committing direct write");
        let _ = tx.commit()?;
        Ok(tx)
    }

    fn track_write(&self, tx: &Transaction) {
        let events = {
            let mut state = self.state.borrow_mut();
            state.track(tx);
            state.recompute_optimistic(true)
        };
        self.dispatch(events);
    }

    /// Delivers `events` to subscribers, after the ambient `mutate` scope if there is one.
    fn dispatch(&self, events: Vec<ChangeMessage>) {
        if events.is_empty() {
            return;
        }
        self.queued.borrow_mut().extend(events);
        match self.context.active_transaction() {
            Some(tx) => {
                let this = self.this.clone();
                self.context.scheduler().schedule(
                    Some(tx.id()),
                    Job::new(format!("changes:{}", self.id), move || {
                        if let Some(inner) = this.upgrade() {
                            inner.flush_events();
                        }
                    }),
                );
            }
            None => self.flush_events(),
        }
    }

    fn flush_events(&self) {
        let events = mem::take(&mut *self.queued.borrow_mut());
        if !events.is_empty() {
            self.listeners.emit(&events);
        }
    }
}

impl TransactionObserver for CollectionInner {
    fn collection_id(&self) -> CollectionId {
        self.id.clone()
    }

    fn on_transaction_state_change(&self) {
        let events = {
            let mut state = self.state.borrow_mut();
            state.capture_pre_sync();
            let events = state.recompute_optimistic(false);
            state.prune_settled();
            events
        };
        self.dispatch(events);
    }

    fn has_pending_synced_transactions(&self) -> bool {
        !self.state.borrow().pending_synced.is_empty()
    }

    fn commit_pending_transactions(&self) {
        let events = self
            .state
            .borrow_mut()
            .commit_pending(self.config.row_update_mode);
        if let Some(events) = events {
            self.dispatch(events);
        }
    }
}
