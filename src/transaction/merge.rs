// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Merging repeated writes to one row within a transaction.
//!
//! A transaction holds at most one mutation per [`GlobalKey`](crate::GlobalKey). When a second
//! write to the same row arrives, the two collapse into one:
//!
//! | existing | incoming | result |
//! |----------|----------|--------|
//! | insert | update | insert carrying the update's post-image |
//! | insert | delete | nothing; the row never existed |
//! | update | update | update keeping the first pre-image |
//! | update | delete | the delete |
//! | delete | delete | the later delete |
//! | insert | insert | the later insert |
//!
//! Any other pair means the caller wrote to a row it had already removed (or re-inserted a row
//! it had updated). That is reported as [`TransactionError::InvalidMergeSequence`].
use crate::{Mutation, MutationType, TransactionError, Value};
use tracing::error;

#[derive(Debug)]
pub(crate) enum Merged {
    Replace(Mutation),
    Cancel,
}

fn union(existing: &Value, incoming: Value) -> Value {
    existing.clone().merged_with(incoming)
}

pub(crate) fn merge_pending(existing: &Mutation, incoming: Mutation) -> Result<Merged, TransactionError> {
    use MutationType::*;
    match (existing.kind, incoming.kind) {
        (Insert, Update) => Ok(Merged::Replace(Mutation {
            kind: Insert,
            original: Value::object(),
            changes: union(&existing.changes, incoming.changes),
            key: existing.key.clone(),
            global_key: existing.global_key.clone(),
            metadata: incoming.metadata.or_else(|| existing.metadata.clone()),
            sync_metadata: union(&existing.sync_metadata, incoming.sync_metadata),
            created_at: existing.created_at,
            optimistic: existing.optimistic,
            collection: existing.collection.clone(),
            modified: incoming.modified,
            mutation_id: incoming.mutation_id,
            updated_at: incoming.updated_at,
        })),
        (Insert, Delete) => Ok(Merged::Cancel),
        (Update, Update) => Ok(Merged::Replace(Mutation {
            original: existing.original.clone(),
            changes: union(&existing.changes, incoming.changes),
            metadata: incoming.metadata.or_else(|| existing.metadata.clone()),
            sync_metadata: union(&existing.sync_metadata, incoming.sync_metadata),
            ..incoming
        })),
        (Update, Delete) | (Delete, Delete) | (Insert, Insert) => Ok(Merged::Replace(incoming)),
        (existing_kind, incoming_kind) => {
            error!(
                global_key = %existing.global_key,
                existing = %existing_kind,
                incoming = %incoming_kind,
                "invalid mutation sequence for a single row"
            );
            Err(TransactionError::InvalidMergeSequence {
                global_key: existing.global_key.clone(),
                existing: existing_kind,
                incoming: incoming_kind,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CollectionRef, Key, record};

    fn collection() -> CollectionRef {
        CollectionRef::detached("todos")
    }

    fn insert(value: Value) -> Mutation {
        Mutation::insert(collection(), Key::from(1), value)
    }

    fn update(original: Value, modified: Value, changes: Value) -> Mutation {
        Mutation::update(collection(), Key::from(1), original, modified, changes)
    }

    fn delete(original: Value) -> Mutation {
        Mutation::delete(collection(), Key::from(1), original)
    }

    fn replaced(merged: Merged) -> Mutation {
        match merged {
            Merged::Replace(mutation) => mutation,
            Merged::Cancel => panic!("expected a replacement"),
        }
    }

    #[test]
    fn insert_then_update_stays_an_insert() {
        let existing = insert(record! { "id" => 1, "v" => "a" });
        let incoming = update(
            record! { "id" => 1, "v" => "a" },
            record! { "id" => 1, "v" => "b" },
            record! { "v" => "b" },
        )
        .with_metadata(Some(record! { "source" => "ui" }));
        let incoming_id = incoming.mutation_id;

        let merged = replaced(merge_pending(&existing, incoming).unwrap());
        assert_eq!(merged.kind, MutationType::Insert);
        assert_eq!(merged.original, Value::object());
        assert_eq!(merged.modified, record! { "id" => 1, "v" => "b" });
        assert_eq!(merged.changes, record! { "id" => 1, "v" => "b" });
        assert_eq!(merged.metadata, Some(record! { "source" => "ui" }));
        assert_eq!(merged.mutation_id, incoming_id);
        assert_eq!(merged.created_at, existing.created_at);
    }

    #[test]
    fn insert_then_delete_cancels() {
        let existing = insert(record! { "id" => 1 });
        let merged = merge_pending(&existing, delete(record! { "id" => 1 })).unwrap();
        assert!(matches!(merged, Merged::Cancel));
    }

    #[test]
    fn update_then_update_keeps_the_first_original() {
        let existing = update(
            record! { "id" => 1, "a" => 0, "b" => 0 },
            record! { "id" => 1, "a" => 1, "b" => 0 },
            record! { "a" => 1 },
        )
        .with_metadata(Some(record! { "n" => 1 }))
        .with_sync_metadata(record! { "etag" => "x" });
        let incoming = update(
            record! { "id" => 1, "a" => 1, "b" => 0 },
            record! { "id" => 1, "a" => 1, "b" => 2 },
            record! { "b" => 2 },
        )
        .with_sync_metadata(record! { "rev" => 2 });

        let merged = replaced(merge_pending(&existing, incoming).unwrap());
        assert_eq!(merged.kind, MutationType::Update);
        assert_eq!(merged.original, record! { "id" => 1, "a" => 0, "b" => 0 });
        assert_eq!(merged.modified, record! { "id" => 1, "a" => 1, "b" => 2 });
        assert_eq!(merged.changes, record! { "a" => 1, "b" => 2 });
        assert_eq!(merged.metadata, Some(record! { "n" => 1 }));
        assert_eq!(merged.sync_metadata, record! { "etag" => "x", "rev" => 2 });
    }

    #[test]
    fn delete_dominates_update() {
        let existing = update(record! { "id" => 1 }, record! { "id" => 1, "a" => 1 }, record! { "a" => 1 });
        let merged = replaced(merge_pending(&existing, delete(record! { "id" => 1, "a" => 1 })).unwrap());
        assert_eq!(merged.kind, MutationType::Delete);
    }

    #[test]
    fn repeated_kinds_take_the_latest() {
        let merged = replaced(merge_pending(&insert(record! { "v" => 1 }), insert(record! { "v" => 2 })).unwrap());
        assert_eq!(merged.modified, record! { "v" => 2 });
        let merged = replaced(merge_pending(&delete(record! { "v" => 1 }), delete(record! { "v" => 2 })).unwrap());
        assert_eq!(merged.original, record! { "v" => 2 });
    }

    #[test]
    fn impossible_sequences_are_errors() {
        let deleted = delete(record! { "id" => 1 });
        let error = merge_pending(&deleted, update(Value::object(), Value::object(), Value::object()))
            .unwrap_err();
        insta::assert_snapshot!(error.to_string(), @"cannot merge update into a pending delete of KEY::todos/1");
        assert!(merge_pending(&deleted, insert(record! { "id" => 1 })).is_err());
        let updated = update(Value::object(), Value::object(), Value::object());
        assert!(merge_pending(&updated, insert(record! { "id" => 1 })).is_err());
    }
}
