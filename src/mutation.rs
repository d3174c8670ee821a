// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! A single optimistic write to one row.
use crate::{Key, Value};
use chrono::{DateTime, Utc};
use std::{
    fmt,
    rc::{Rc, Weak},
};
use ulid::Ulid;

/// The kind of write a [`Mutation`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum MutationType {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for MutationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// Identifies a collection within a process.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct CollectionId(String);

impl CollectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CollectionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CollectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A row identity that is unique across every collection of a process.
///
/// Two mutations conflict exactly when their global keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalKey {
    pub collection: CollectionId,
    pub key: Key,
}

impl GlobalKey {
    pub fn new(collection: CollectionId, key: Key) -> Self {
        Self { collection, key }
    }
}

impl fmt::Display for GlobalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KEY::{}/{}", self.collection, self.key)
    }
}

/// What a transaction needs from a collection it wrote to.
///
/// Transactions call back into collections when they change state, so the overlay of
/// optimistic writes can be recomputed and buffered synced writes can be flushed.
pub trait TransactionObserver {
    fn collection_id(&self) -> CollectionId;

    /// Recompute the optimistic overlay after a transaction changed state.
    fn on_transaction_state_change(&self);

    fn has_pending_synced_transactions(&self) -> bool;

    /// Apply buffered synced writes, if nothing blocks them.
    fn commit_pending_transactions(&self);
}

/// A weak link from a mutation to the collection that produced it.
#[derive(Clone)]
pub struct CollectionRef {
    id: CollectionId,
    observer: Option<Weak<dyn TransactionObserver>>,
}

impl CollectionRef {
    pub fn new(observer: &Rc<dyn TransactionObserver>) -> Self {
        Self {
            id: observer.collection_id(),
            observer: Some(Rc::downgrade(observer)),
        }
    }

    /// A reference to a collection that is never notified.
    pub fn detached(id: impl Into<CollectionId>) -> Self {
        Self {
            id: id.into(),
            observer: None,
        }
    }

    pub(crate) fn from_weak(id: CollectionId, observer: Weak<dyn TransactionObserver>) -> Self {
        Self {
            id,
            observer: Some(observer),
        }
    }

    pub fn id(&self) -> &CollectionId {
        &self.id
    }

    pub fn observer(&self) -> Option<Rc<dyn TransactionObserver>> {
        self.observer.as_ref().and_then(Weak::upgrade)
    }
}

impl fmt::Debug for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CollectionRef").field(&self.id).finish()
    }
}

/// One optimistic write to one row.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub mutation_id: Ulid,
    pub kind: MutationType,
    pub key: Key,
    pub global_key: GlobalKey,
    /// The row before the write. Empty for inserts.
    pub original: Value,
    /// The row after the write.
    pub modified: Value,
    /// Only the fields that differ between `original` and `modified`.
    pub changes: Value,
    /// Whether the write is reflected in the collection's visible state before it persists.
    pub optimistic: bool,
    pub metadata: Option<Value>,
    pub sync_metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub collection: CollectionRef,
}

impl Mutation {
    fn new(
        kind: MutationType,
        collection: CollectionRef,
        key: Key,
        original: Value,
        modified: Value,
        changes: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            mutation_id: Ulid::new(),
            kind,
            global_key: GlobalKey::new(collection.id().clone(), key.clone()),
            key,
            original,
            modified,
            changes,
            optimistic: true,
            metadata: None,
            sync_metadata: Value::object(),
            created_at: now,
            updated_at: now,
            collection,
        }
    }

    pub fn insert(collection: CollectionRef, key: Key, modified: Value) -> Self {
        let changes = modified.clone();
        Self::new(
            MutationType::Insert,
            collection,
            key,
            Value::object(),
            modified,
            changes,
        )
    }

    pub fn update(
        collection: CollectionRef,
        key: Key,
        original: Value,
        modified: Value,
        changes: Value,
    ) -> Self {
        Self::new(MutationType::Update, collection, key, original, modified, changes)
    }

    /// A delete carries the removed row as its original, modified and changes.
    pub fn delete(collection: CollectionRef, key: Key, original: Value) -> Self {
        Self::new(
            MutationType::Delete,
            collection,
            key,
            original.clone(),
            original.clone(),
            original,
        )
    }

    #[must_use]
    pub fn with_optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Option<Value>) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_sync_metadata(mut self, sync_metadata: Value) -> Self {
        self.sync_metadata = sync_metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    #[test]
    fn global_key_rendering() {
        let key = GlobalKey::new(CollectionId::from("todos"), Key::from(42));
        insta::assert_snapshot!(key.to_string(), @"KEY::todos/42");
        let key = GlobalKey::new(CollectionId::from("users"), Key::from("ada"));
        insta::assert_snapshot!(key.to_string(), @"KEY::users/ada");
    }

    #[test]
    fn constructors_fill_images() {
        let collection = CollectionRef::detached("todos");
        let insert = Mutation::insert(collection.clone(), Key::from(1), record! { "id" => 1 });
        assert_eq!(insert.original, Value::object());
        assert_eq!(insert.changes, record! { "id" => 1 });
        assert!(insert.optimistic);

        let delete = Mutation::delete(collection, Key::from(1), record! { "id" => 1 });
        assert_eq!(delete.kind, MutationType::Delete);
        assert_eq!(delete.modified, delete.original);
        assert_eq!(delete.global_key.to_string(), "KEY::todos/1");
        assert!(delete.collection.observer().is_none());
    }
}
