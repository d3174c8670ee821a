// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! The synced base of a collection and the optimistic overlay on top of it.
use super::{ChangeMessage, RowUpdateMode, sync::SyncOperation};
use crate::{CollectionId, Key, MutationType, Transaction, TransactionState, Value};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    mem,
};
use tracing::{debug, trace};

/// A batch of synced writes that has not been applied yet.
#[derive(Debug, Default)]
pub(crate) struct PendingSync {
    pub(crate) committed: bool,
    /// Applied as soon as it commits, even while transactions are persisting.
    pub(crate) immediate: bool,
    /// Replaces the whole synced base rather than patching it.
    pub(crate) truncate: bool,
    pub(crate) operations: Vec<(Key, SyncOperation)>,
    pub(crate) deleted_keys: BTreeSet<Key>,
}

#[derive(Debug)]
pub(crate) struct CollectionState {
    id: CollectionId,
    pub(crate) synced_data: BTreeMap<Key, Value>,
    pub(crate) synced_metadata: BTreeMap<Key, Value>,
    optimistic_upserts: BTreeMap<Key, Value>,
    optimistic_deletes: BTreeSet<Key>,
    /// Non-terminal transactions that wrote to this collection, oldest first.
    transactions: Vec<Transaction>,
    pub(crate) pending_synced: Vec<PendingSync>,
    /// What was visible for keys with buffered synced writes before the overlay last changed.
    pre_sync_visible: BTreeMap<Key, Option<Value>>,
    /// Keys whose overlay changes are reported when the buffered synced writes apply.
    recently_synced: BTreeSet<Key>,
}

impl CollectionState {
    pub(crate) fn new(id: CollectionId) -> Self {
        Self {
            id,
            synced_data: BTreeMap::new(),
            synced_metadata: BTreeMap::new(),
            optimistic_upserts: BTreeMap::new(),
            optimistic_deletes: BTreeSet::new(),
            transactions: Vec::new(),
            pending_synced: Vec::new(),
            pre_sync_visible: BTreeMap::new(),
            recently_synced: BTreeSet::new(),
        }
    }

    pub(crate) fn get(&self, key: &Key) -> Option<&Value> {
        if self.optimistic_deletes.contains(key) {
            return None;
        }
        self.optimistic_upserts
            .get(key)
            .or_else(|| self.synced_data.get(key))
    }

    pub(crate) fn has(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    /// Visible keys: synced keys in key order, then keys only present in the overlay.
    pub(crate) fn keys(&self) -> impl Iterator<Item = &Key> + '_ {
        let synced = self
            .synced_data
            .keys()
            .filter(|key| !self.optimistic_deletes.contains(*key));
        let local = self.optimistic_upserts.keys().filter(|key| {
            !self.synced_data.contains_key(*key) && !self.optimistic_deletes.contains(*key)
        });
        synced.chain(local)
    }

    pub(crate) fn len(&self) -> usize {
        self.keys().count()
    }

    pub(crate) fn is_optimistic(&self, key: &Key) -> bool {
        self.optimistic_upserts.contains_key(key) || self.optimistic_deletes.contains(key)
    }

    pub(crate) fn track(&mut self, tx: &Transaction) {
        if self.transactions.iter().any(|tracked| tracked.ptr_eq(tx)) {
            return;
        }
        let index = self
            .transactions
            .partition_point(|tracked| tracked.compare_created_at(tx) == Ordering::Less);
        self.transactions.insert(index, tx.clone());
    }

    pub(crate) fn tracked_transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub(crate) fn prune_settled(&mut self) {
        self.transactions.retain(|tx| !tx.state().is_terminal());
    }

    pub(crate) fn has_persisting(&self) -> bool {
        self.transactions
            .iter()
            .any(|tx| tx.state() == TransactionState::Persisting)
    }

    fn rebuild_overlay(&mut self) {
        let Self {
            id,
            transactions,
            optimistic_upserts,
            optimistic_deletes,
            ..
        } = self;
        let id: &CollectionId = id;
        optimistic_upserts.clear();
        optimistic_deletes.clear();
        for tx in transactions.iter().filter(|tx| !tx.state().is_terminal()) {
            tx.with_mutations(|mutations| {
                let ours = mutations
                    .iter()
                    .filter(|mutation| mutation.optimistic && mutation.collection.id() == id);
                for mutation in ours {
                    match mutation.kind {
                        MutationType::Insert | MutationType::Update => {
                            optimistic_upserts.insert(mutation.key.clone(), mutation.modified.clone());
                            optimistic_deletes.remove(&mutation.key);
                        }
                        MutationType::Delete => {
                            optimistic_upserts.remove(&mutation.key);
                            optimistic_deletes.insert(mutation.key.clone());
                        }
                    }
                }
            });
        }
    }

    /// Rebuilds the overlay from the tracked transactions and reports what became visible.
    ///
    /// Unless `user_triggered`, changes to keys awaiting buffered synced writes are left out;
    /// they are reported once those writes apply. While the writes are held back by a
    /// persisting transaction, subscribers therefore still see the last reported value of such
    /// a key even if a rollback already changed what [`get`](Self::get) returns. The single
    /// event emitted when the batch applies goes from the value captured in
    /// [`capture_pre_sync`](Self::capture_pre_sync) straight to the synced one.
    pub(crate) fn recompute_optimistic(&mut self, user_triggered: bool) -> Vec<ChangeMessage> {
        let previous_upserts = mem::take(&mut self.optimistic_upserts);
        let previous_deletes = mem::take(&mut self.optimistic_deletes);
        self.rebuild_overlay();

        let touched: BTreeSet<Key> = previous_upserts
            .keys()
            .chain(&previous_deletes)
            .chain(self.optimistic_upserts.keys())
            .chain(&self.optimistic_deletes)
            .cloned()
            .collect();
        let mut events = Vec::new();
        for key in touched {
            if !user_triggered && self.recently_synced.contains(&key) {
                trace!(collection = %self.id, %key, "deferring change until synced writes apply");
                continue;
            }
            let previous = if previous_deletes.contains(&key) {
                None
            } else {
                previous_upserts
                    .get(&key)
                    .or_else(|| self.synced_data.get(&key))
            };
            let current = self.get(&key);
            events.extend(ChangeMessage::between(key, previous, current));
        }
        trace!(collection = %self.id, user_triggered, events = events.len(), "overlay recomputed");
        events
    }

    /// Remembers what is visible for every key with buffered synced writes.
    ///
    /// Must run before the overlay changes, so that applying the synced writes later reports
    /// the change from what the user saw, not from an intermediate state.
    pub(crate) fn capture_pre_sync(&mut self) {
        if self.pending_synced.is_empty() {
            return;
        }
        let keys: BTreeSet<Key> = self
            .pending_synced
            .iter()
            .flat_map(|batch| batch.operations.iter().map(|(key, _)| key.clone()))
            .collect();
        for key in keys {
            if !self.pre_sync_visible.contains_key(&key) {
                let visible = self.get(&key).cloned();
                self.pre_sync_visible.insert(key.clone(), visible);
            }
            self.recently_synced.insert(key);
        }
    }

    /// Applies every committed batch of synced writes, in arrival order.
    ///
    /// Returns `None` without applying anything while a transaction of this collection is
    /// persisting, unless a committed batch is immediate or truncating (in which case every
    /// committed batch applies, to keep their order).
    pub(crate) fn commit_pending(&mut self, mode: RowUpdateMode) -> Option<Vec<ChangeMessage>> {
        let committed = self.pending_synced.iter().filter(|batch| batch.committed);
        let (mut any, mut immediate, mut truncate) = (false, false, false);
        for batch in committed {
            any = true;
            immediate |= batch.immediate;
            truncate |= batch.truncate;
        }
        if !any {
            return None;
        }
        if self.has_persisting() && !immediate && !truncate {
            debug!(collection = %self.id, "holding synced writes while a transaction is persisting");
            return None;
        }

        let (committed, uncommitted): (Vec<_>, Vec<_>) = mem::take(&mut self.pending_synced)
            .into_iter()
            .partition(|batch| batch.committed);
        self.pending_synced = uncommitted;

        let mut affected: BTreeSet<Key> = committed
            .iter()
            .flat_map(|batch| batch.operations.iter().map(|(key, _)| key.clone()))
            .collect();
        if truncate {
            affected.extend(self.keys().cloned());
        }
        let before: BTreeMap<Key, Option<Value>> = affected
            .into_iter()
            .map(|key| {
                let visible = match self.pre_sync_visible.get(&key) {
                    Some(captured) => captured.clone(),
                    None => self.get(&key).cloned(),
                };
                (key, visible)
            })
            .collect();

        let mut applied = 0;
        for batch in committed {
            if batch.truncate {
                debug!(collection = %self.id, rows = self.synced_data.len(), "truncating synced data");
                self.synced_data.clear();
                self.synced_metadata.clear();
            }
            for (key, operation) in batch.operations {
                self.apply_synced(key, operation, mode);
                applied += 1;
            }
        }
        self.rebuild_overlay();

        let events = before
            .into_iter()
            .filter_map(|(key, previous)| {
                let current = self.get(&key);
                ChangeMessage::between(key, previous.as_ref(), current)
            })
            .collect::<Vec<_>>();
        self.pre_sync_visible.clear();
        self.recently_synced.clear();
        debug!(collection = %self.id, applied, events = events.len(), "applied synced writes");
        Some(events)
    }

    fn apply_synced(&mut self, key: Key, operation: SyncOperation, mode: RowUpdateMode) {
        let SyncOperation {
            kind,
            value,
            metadata,
        } = operation;
        match kind {
            MutationType::Insert => {
                self.synced_metadata
                    .insert(key.clone(), metadata.unwrap_or_else(Value::object));
                self.synced_data.insert(key, value);
            }
            MutationType::Update => {
                let metadata = match (self.synced_metadata.remove(&key), metadata) {
                    (Some(existing), Some(incoming)) => existing.merged_with(incoming),
                    (existing, incoming) => incoming.or(existing).unwrap_or_else(Value::object),
                };
                self.synced_metadata.insert(key.clone(), metadata);
                let row = match (mode, self.synced_data.remove(&key)) {
                    (RowUpdateMode::Partial, Some(existing)) => existing.merged_with(value),
                    (_, _) => value,
                };
                self.synced_data.insert(key, row);
            }
            MutationType::Delete => {
                self.synced_metadata.remove(&key);
                self.synced_data.remove(&key);
            }
        }
    }
}
