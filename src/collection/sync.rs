// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use super::{Collection, CollectionInner, state::PendingSync};
use crate::{MutationType, SyncError, TransactionObserver, Value};
use std::{fmt, rc::Rc};
use tracing::trace;

/// One row written by the sync layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOperation {
    pub kind: MutationType,
    /// The full row for inserts and deletes. For updates, the full row or only the changed
    /// fields, depending on the collection's [`RowUpdateMode`](super::RowUpdateMode).
    pub value: Value,
    pub metadata: Option<Value>,
}

impl SyncOperation {
    pub fn insert(value: impl Into<Value>) -> Self {
        Self::new(MutationType::Insert, value.into())
    }

    pub fn update(value: impl Into<Value>) -> Self {
        Self::new(MutationType::Update, value.into())
    }

    pub fn delete(value: impl Into<Value>) -> Self {
        Self::new(MutationType::Delete, value.into())
    }

    fn new(kind: MutationType, value: Value) -> Self {
        Self {
            kind,
            value,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Feeds authoritative rows from a sync layer into a [`Collection`].
///
/// Writes are grouped into batches: [`begin`](Self::begin) opens one, [`write`](Self::write)
/// adds rows to the most recently opened batch and [`commit`](Self::commit) closes it. Committed
/// batches are applied in the order they were opened, but not while a transaction writing to the
/// collection is persisting; its confirmation will usually arrive as part of those batches, and
/// applying them early would make the row flicker.
#[derive(Clone)]
pub struct SyncWriter {
    collection: Rc<CollectionInner>,
}

impl SyncWriter {
    pub(super) fn new(collection: Rc<CollectionInner>) -> Self {
        Self { collection }
    }

    pub fn collection(&self) -> Collection {
        Collection(Rc::clone(&self.collection))
    }

    /// Opens a batch.
    pub fn begin(&self) {
        self.open(PendingSync::default());
    }

    /// Opens a batch that applies as soon as it commits, even while transactions persist.
    ///
    /// Committing it applies every committed batch queued before it too.
    pub fn begin_immediate(&self) {
        self.open(PendingSync {
            immediate: true,
            ..PendingSync::default()
        });
    }

    fn open(&self, batch: PendingSync) {
        self.collection.state.borrow_mut().pending_synced.push(batch);
    }

    /// Adds a row to the open batch.
    ///
    /// An insert of a row that already exists in the synced data is accepted as an update if it
    /// is identical to the existing row, which is what an echo of a local insert looks like.
    pub fn write(&self, mut operation: SyncOperation) -> Result<(), SyncError> {
        let inner = &self.collection;
        let key = inner.key_of(&operation.value).ok_or(SyncError::UndefinedKey)?;
        let mut state = inner.state.borrow_mut();
        let state = &mut *state;
        let batch = state
            .pending_synced
            .last_mut()
            .ok_or(SyncError::NoPendingSyncTransaction)?;
        if batch.committed {
            return Err(SyncError::SyncTransactionAlreadyCommitted);
        }
        if operation.kind == MutationType::Insert
            && !batch.truncate
            && !batch.deleted_keys.contains(&key)
        {
            if let Some(existing) = state.synced_data.get(&key) {
                if *existing != operation.value {
                    return Err(SyncError::DuplicateKeySync {
                        collection: inner.id.clone(),
                        key,
                    });
                }
                operation.kind = MutationType::Update;
            }
        }
        if operation.kind == MutationType::Delete {
            batch.deleted_keys.insert(key.clone());
        }
        trace!(collection = %inner.id, %key, kind = %operation.kind, "synced write buffered");
        batch.operations.push((key, operation));
        Ok(())
    }

    /// Makes the open batch replace all synced rows instead of patching them.
    ///
    /// Rows already written to the batch are discarded.
    pub fn truncate(&self) -> Result<(), SyncError> {
        let mut state = self.collection.state.borrow_mut();
        let batch = state
            .pending_synced
            .last_mut()
            .ok_or(SyncError::NoPendingSyncTransaction)?;
        if batch.committed {
            return Err(SyncError::SyncTransactionAlreadyCommitted);
        }
        batch.operations.clear();
        batch.deleted_keys.clear();
        batch.truncate = true;
        Ok(())
    }

    /// Closes the open batch and applies committed batches if nothing holds them back.
    pub fn commit(&self) -> Result<(), SyncError> {
        {
            let mut state = self.collection.state.borrow_mut();
            let batch = state
                .pending_synced
                .last_mut()
                .ok_or(SyncError::NoPendingSyncTransaction)?;
            if batch.committed {
                return Err(SyncError::SyncTransactionAlreadyCommitted);
            }
            batch.committed = true;
        }
        self.collection.commit_pending_transactions();
        Ok(())
    }

    /// Writes `operations` as one immediate batch.
    ///
    /// If any operation is rejected, none of them are kept.
    pub fn write_immediate(&self, operations: impl IntoIterator<Item = SyncOperation>) -> Result<(), SyncError> {
        self.begin_immediate();
        for operation in operations {
            if let Err(error) = self.write(operation) {
                self.collection.state.borrow_mut().pending_synced.pop();
                return Err(error);
            }
        }
        self.commit()
    }
}

impl fmt::Debug for SyncWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SyncWriter").field(&self.collection.id).finish()
    }
}
