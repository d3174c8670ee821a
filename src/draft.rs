// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Drafts: edit a record in place and get back exactly what changed.
//!
//! A [`Draft`] wraps a clone of a record. Callers edit it through [`DraftNode`] handles as if it
//! were the record itself; afterwards [`Draft::changes`] reports only the props whose value
//! differs from the original. Writing a prop back to its original value *reverts* it, so a
//! sequence of edits with no net effect produces no changes at all.
//!
//! ```rust
//! use optimist::{draft, record};
//!
//! let todo = record! { "id" => 1, "title" => "Buy milk", "meta" => { "stars" => 0 } };
//! let changes = draft::with_change_tracking(&todo, |draft| {
//!     draft.set("title", "Buy oat milk")?;
//!     draft.child("meta")?.set("stars", 3)?;
//!     draft.set("title", "Buy milk") // reverts the first write
//! })
//! .unwrap();
//! assert_eq!(changes, record! { "meta" => { "stars" => 3 } });
//! ```
//!
//! # Structure
//!
//! Every container reached through a draft gets its own change tracker. Trackers live in an
//! arena owned by the [`Draft`] and link to their parent by `(tracker, prop)`. Children are
//! memoized, so reaching the same prop twice yields the same tracker. An edit to a child
//! propagates the child's working copy upward, so the root copy always reflects every nested
//! edit.
//!
//! Scalars and atomic leaves (bytes, timestamps, ulids, patterns) are never drafted. Reads
//! return them as plain values and writes replace them as a whole.
//!
//! # What counts as a change
//!
//! For key-assignable containers (objects and maps) a tracker remembers, per prop, whether it
//! was set (and differs from the original) or deleted. Arrays and sets are compared as a whole.
//! [`Draft::changes`] is:
//!
//! | root state | result |
//! |------------|--------|
//! | never modified, or fully reverted | empty object |
//! | not an object or map | the whole working copy |
//! | object or map | the props that were set, with their current values |
//!
//! Deleted props make the draft modified but do not appear in `changes()`.
use crate::{FastMap, Key, Prop, Value, ValueKind, create_map};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
};
use tracing::trace;

/// Errors raised by draft operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DraftError {
    #[error("{prop} is not addressable on a value of type {kind}")]
    InvalidProp { prop: Prop, kind: ValueKind },
    #[error("{0} does not exist")]
    MissingProp(Prop),
    #[error("{prop} holds a value of type {kind}, which cannot be drafted")]
    NotDraftable { prop: Prop, kind: ValueKind },
    #[error("index {index} is out of bounds for an array of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("expected a value of type {expected}, found {found}")]
    TypeMismatch {
        expected: ValueKind,
        found: ValueKind,
    },
}

type TrackerId = usize;

const ROOT: TrackerId = 0;

static NULL: Value = Value::Null;

#[derive(Debug, Clone)]
struct ParentLink {
    tracker: TrackerId,
    prop: Prop,
}

#[derive(Debug)]
struct ChangeTracker {
    original: Value,
    copy: Value,
    modified: bool,
    /// `true` for props set to a value differing from the original, `false` for deleted props.
    assigned: BTreeMap<Prop, bool>,
    parent: Option<ParentLink>,
}

impl ChangeTracker {
    fn new(original: Value, copy: Value, parent: Option<ParentLink>) -> Self {
        Self {
            modified: copy != original,
            original,
            copy,
            assigned: BTreeMap::new(),
            parent,
        }
    }

    /// A child drafted after its parent replaced it starts out differing from its original in
    /// props it never assigned, so the whole copy is compared rather than `assigned` alone.
    fn has_reverted(&self) -> bool {
        self.copy == self.original
    }

    fn expect(&self, expected: ValueKind) -> Result<(), DraftError> {
        if self.copy.kind() == expected {
            Ok(())
        } else {
            Err(self.mismatch(expected))
        }
    }

    fn mismatch(&self, expected: ValueKind) -> DraftError {
        DraftError::TypeMismatch {
            expected,
            found: self.copy.kind(),
        }
    }
}

/// A tracked, editable clone of a record.
#[derive(Debug)]
pub struct Draft {
    trackers: Vec<ChangeTracker>,
    children: FastMap<(TrackerId, Prop), TrackerId>,
}

/// Starts tracking edits to a clone of `target`.
pub fn wrap(target: &Value) -> Draft {
    Draft::new(target)
}

/// Runs `f` against a draft of `target` and returns the resulting [`Draft::changes`].
pub fn with_change_tracking<F>(target: &Value, f: F) -> Result<Value, DraftError>
where
    F: FnOnce(&mut DraftNode<'_>) -> Result<(), DraftError>,
{
    let mut draft = Draft::new(target);
    f(&mut draft.root())?;
    Ok(draft.changes())
}

/// Runs `f` against one draft per target and returns the changes of each, in order.
pub fn with_array_change_tracking<F>(targets: &[Value], f: F) -> Result<Vec<Value>, DraftError>
where
    F: FnOnce(&mut [Draft]) -> Result<(), DraftError>,
{
    let mut drafts: Vec<Draft> = targets.iter().map(Draft::new).collect();
    f(&mut drafts)?;
    Ok(drafts.iter().map(Draft::changes).collect())
}

impl Draft {
    pub fn new(target: &Value) -> Self {
        Self {
            trackers: vec![ChangeTracker::new(target.clone(), target.clone(), None)],
            children: create_map(),
        }
    }

    /// The editable root of this draft.
    pub fn root(&mut self) -> DraftNode<'_> {
        DraftNode {
            draft: self,
            id: ROOT,
        }
    }

    /// The record as it currently reads, with every edit applied.
    pub fn current(&self) -> &Value {
        &self.trackers[ROOT].copy
    }

    pub fn original(&self) -> &Value {
        &self.trackers[ROOT].original
    }

    pub fn is_modified(&self) -> bool {
        self.trackers[ROOT].modified
    }

    pub fn into_current(mut self) -> Value {
        std::mem::take(&mut self.trackers[ROOT].copy)
    }

    /// The net changes made through this draft.
    ///
    /// See the [module documentation](self) for the exact shape.
    pub fn changes(&self) -> Value {
        let root = &self.trackers[ROOT];
        if !root.modified {
            return Value::object();
        }
        if !root.copy.is_key_assignable() || root.assigned.is_empty() {
            return root.copy.clone();
        }
        let set_props = root
            .assigned
            .iter()
            .filter(|(_, set)| **set)
            .map(|(prop, _)| prop);
        match &root.copy {
            Value::Object(fields) => Value::Object(
                set_props
                    .filter_map(|prop| match prop {
                        Prop::Field(name) => fields.get(name).map(|v| (name.clone(), v.clone())),
                        _ => None,
                    })
                    .collect(),
            ),
            Value::Map(entries) => Value::Map(
                set_props
                    .filter_map(|prop| match prop {
                        Prop::Entry(key) => entries.get(key).map(|v| (key.clone(), v.clone())),
                        _ => None,
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn child(&mut self, id: TrackerId, prop: Prop) -> Result<TrackerId, DraftError> {
        let prop = canonical(&self.trackers[id].copy, prop);
        if let Some(&child) = self.children.get(&(id, prop.clone())) {
            return Ok(child);
        }
        let parent = &self.trackers[id];
        parent.copy.check_prop(&prop)?;
        let current = parent
            .copy
            .get_prop(&prop)
            .ok_or_else(|| DraftError::MissingProp(prop.clone()))?;
        if !current.is_draftable() {
            return Err(DraftError::NotDraftable {
                kind: current.kind(),
                prop,
            });
        }
        // array positions shift, so only keyed containers carry an original down to children
        let original = if parent.copy.is_key_assignable() {
            parent
                .original
                .get_prop(&prop)
                .filter(|original| original.kind() == current.kind())
                .unwrap_or(current)
        } else {
            current
        };
        let tracker = ChangeTracker::new(
            original.clone(),
            current.clone(),
            Some(ParentLink {
                tracker: id,
                prop: prop.clone(),
            }),
        );
        let child = self.trackers.len();
        self.trackers.push(tracker);
        self.children.insert((id, prop), child);
        Ok(child)
    }

    fn set(&mut self, id: TrackerId, prop: Prop, value: Value) -> Result<(), DraftError> {
        let tracker = &mut self.trackers[id];
        let prop = canonical(&tracker.copy, prop);
        tracker.copy.check_prop(&prop)?;
        if tracker.copy.get_prop(&prop) == Some(&value) {
            return Ok(());
        }
        let reverting = tracker.original.get_prop(&prop) == Some(&value);
        tracker.copy.set_prop(prop.clone(), value)?;
        if reverting {
            trace!(tracker = id, %prop, "draft prop reverted to original");
            tracker.assigned.remove(&prop);
        } else {
            trace!(tracker = id, %prop, "draft prop assigned");
            tracker.assigned.insert(prop.clone(), true);
        }
        self.children.remove(&(id, prop));
        self.settle(id);
        Ok(())
    }

    fn remove(&mut self, id: TrackerId, prop: Prop) -> Result<Option<Value>, DraftError> {
        let tracker = &mut self.trackers[id];
        let prop = canonical(&tracker.copy, prop);
        tracker.copy.check_prop(&prop)?;
        if let Prop::Index(index) = prop {
            return self.splice(id, |items| Ok((index < items.len()).then(|| items.remove(index))));
        }
        let Some(removed) = tracker.copy.remove_prop(&prop)? else {
            return Ok(None);
        };
        if tracker.original.has_prop(&prop) {
            trace!(tracker = id, %prop, "draft prop deleted");
            tracker.assigned.insert(prop.clone(), false);
        } else {
            trace!(tracker = id, %prop, "draft prop added then deleted");
            tracker.assigned.remove(&prop);
        }
        self.children.remove(&(id, prop));
        self.settle(id);
        Ok(Some(removed))
    }

    /// Applies a structural array operation. Element drafts are discarded since positions may
    /// have shifted.
    fn splice<R>(
        &mut self,
        id: TrackerId,
        op: impl FnOnce(&mut Vec<Value>) -> Result<R, DraftError>,
    ) -> Result<R, DraftError> {
        let Value::Array(items) = &mut self.trackers[id].copy else {
            return Err(self.trackers[id].mismatch(ValueKind::Array));
        };
        let result = op(items)?;
        self.children.retain(|(parent, _), _| *parent != id);
        self.settle(id);
        Ok(result)
    }

    fn with_set<R>(
        &mut self,
        id: TrackerId,
        op: impl FnOnce(&mut BTreeSet<Key>) -> R,
    ) -> Result<R, DraftError> {
        let Value::Set(members) = &mut self.trackers[id].copy else {
            return Err(self.trackers[id].mismatch(ValueKind::Set));
        };
        let result = op(members);
        self.settle(id);
        Ok(result)
    }

    /// Recomputes the modified state of `id` and every ancestor, pushing the working copy of
    /// each tracker into its parent.
    fn settle(&mut self, id: TrackerId) {
        let mut current = id;
        loop {
            let tracker = &mut self.trackers[current];
            if tracker.has_reverted() {
                tracker.modified = false;
                tracker.assigned.clear();
            } else {
                tracker.modified = true;
            }
            let Some(link) = tracker.parent.clone() else {
                return;
            };
            let copy = tracker.copy.clone();
            let parent = &mut self.trackers[link.tracker];
            if let Some(slot) = parent.copy.get_prop_mut(&link.prop) {
                *slot = copy;
            }
            if parent.copy.get_prop(&link.prop) == parent.original.get_prop(&link.prop) {
                parent.assigned.remove(&link.prop);
            } else {
                parent.assigned.insert(link.prop.clone(), true);
            }
            trace!(child = current, parent = link.tracker, prop = %link.prop, "draft change propagated");
            current = link.tracker;
        }
    }
}

/// Objects and maps accept both field and entry props for string keys; tracking always uses
/// the container's native form.
fn canonical(container: &Value, prop: Prop) -> Prop {
    match (container, prop) {
        (Value::Object(_), Prop::Entry(Key::Str(name))) => Prop::Field(name),
        (Value::Map(_), Prop::Field(name)) => Prop::Entry(Key::Str(name)),
        (_, prop) => prop,
    }
}

/// An editable view of one container inside a [`Draft`].
#[derive(Debug)]
pub struct DraftNode<'d> {
    draft: &'d mut Draft,
    id: TrackerId,
}

/// An element yielded to iteration callbacks.
///
/// Container elements come as nested drafts so edits made through them are tracked; everything
/// else comes as a plain value.
#[derive(Debug)]
pub enum Element<'d> {
    Draft(DraftNode<'d>),
    Value(&'d Value),
}

impl<'d> Element<'d> {
    pub fn value(&self) -> &Value {
        match self {
            Self::Draft(node) => node.value(),
            Self::Value(value) => value,
        }
    }

    pub fn as_draft(&mut self) -> Option<&mut DraftNode<'d>> {
        match self {
            Self::Draft(node) => Some(node),
            Self::Value(_) => None,
        }
    }

    pub fn into_draft(self) -> Option<DraftNode<'d>> {
        match self {
            Self::Draft(node) => Some(node),
            Self::Value(_) => None,
        }
    }
}

impl DraftNode<'_> {
    /// The live value of this node.
    pub fn value(&self) -> &Value {
        &self.draft.trackers[self.id].copy
    }

    pub fn get(&self, prop: impl Into<Prop>) -> Option<&Value> {
        self.value().get_prop(&prop.into())
    }

    pub fn is_modified(&self) -> bool {
        self.draft.trackers[self.id].modified
    }

    /// Number of elements of an array, entries of a map or members of a set.
    pub fn len(&self) -> usize {
        match self.value() {
            Value::Array(items) => items.len(),
            Value::Object(fields) => fields.len(),
            Value::Map(entries) => entries.len(),
            Value::Set(members) => members.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The nested draft for the container at `prop`.
    pub fn child(&mut self, prop: impl Into<Prop>) -> Result<DraftNode<'_>, DraftError> {
        let id = self.draft.child(self.id, prop.into())?;
        Ok(DraftNode {
            draft: &mut *self.draft,
            id,
        })
    }

    pub fn set(&mut self, prop: impl Into<Prop>, value: impl Into<Value>) -> Result<(), DraftError> {
        self.draft.set(self.id, prop.into(), value.into())
    }

    /// Deletes `prop`, returning the removed value. Deleting an array index shifts later
    /// elements down.
    pub fn remove(&mut self, prop: impl Into<Prop>) -> Result<Option<Value>, DraftError> {
        self.draft.remove(self.id, prop.into())
    }

    pub fn push(&mut self, value: impl Into<Value>) -> Result<(), DraftError> {
        let value = value.into();
        self.draft.splice(self.id, |items| {
            items.push(value);
            Ok(())
        })
    }

    pub fn pop(&mut self) -> Result<Option<Value>, DraftError> {
        self.draft.splice(self.id, |items| Ok(items.pop()))
    }

    pub fn insert(&mut self, index: usize, value: impl Into<Value>) -> Result<(), DraftError> {
        let value = value.into();
        self.draft.splice(self.id, |items| {
            let len = items.len();
            if index > len {
                return Err(DraftError::IndexOutOfBounds { index, len });
            }
            items.insert(index, value);
            Ok(())
        })
    }

    pub fn remove_at(&mut self, index: usize) -> Result<Value, DraftError> {
        self.draft.splice(self.id, |items| {
            let len = items.len();
            if index >= len {
                return Err(DraftError::IndexOutOfBounds { index, len });
            }
            Ok(items.remove(index))
        })
    }

    pub fn truncate(&mut self, len: usize) -> Result<(), DraftError> {
        self.draft.splice(self.id, |items| {
            items.truncate(len);
            Ok(())
        })
    }

    pub fn sort_by(
        &mut self,
        compare: impl FnMut(&Value, &Value) -> Ordering,
    ) -> Result<(), DraftError> {
        self.draft.splice(self.id, |items| {
            items.sort_by(compare);
            Ok(())
        })
    }

    pub fn reverse(&mut self) -> Result<(), DraftError> {
        self.draft.splice(self.id, |items| {
            items.reverse();
            Ok(())
        })
    }

    pub fn retain(&mut self, keep: impl FnMut(&Value) -> bool) -> Result<(), DraftError> {
        self.draft.splice(self.id, |items| {
            items.retain(keep);
            Ok(())
        })
    }

    pub fn insert_entry(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Result<(), DraftError> {
        self.draft.trackers[self.id].expect(ValueKind::Map)?;
        self.draft.set(self.id, Prop::Entry(key.into()), value.into())
    }

    pub fn remove_entry(&mut self, key: impl Into<Key>) -> Result<Option<Value>, DraftError> {
        self.draft.trackers[self.id].expect(ValueKind::Map)?;
        self.draft.remove(self.id, Prop::Entry(key.into()))
    }

    /// Adds `key` to a set, returning whether it was newly added.
    pub fn add(&mut self, key: impl Into<Key>) -> Result<bool, DraftError> {
        let key = key.into();
        self.draft.with_set(self.id, |members| members.insert(key))
    }

    /// Removes `key` from a set, returning whether it was present.
    pub fn delete(&mut self, key: &Key) -> Result<bool, DraftError> {
        self.draft.with_set(self.id, |members| members.remove(key))
    }

    pub fn contains(&self, key: &Key) -> bool {
        match self.value() {
            Value::Set(members) => members.contains(key),
            Value::Map(entries) => entries.contains_key(key),
            _ => false,
        }
    }

    /// Empties a map, set or array.
    pub fn clear(&mut self) -> Result<(), DraftError> {
        match self.value() {
            Value::Map(entries) => {
                let keys: Vec<Key> = entries.keys().cloned().collect();
                for key in keys {
                    self.draft.remove(self.id, Prop::Entry(key))?;
                }
                Ok(())
            }
            Value::Set(_) => self.draft.with_set(self.id, BTreeSet::clear),
            Value::Array(_) => self.truncate(0),
            other => Err(DraftError::TypeMismatch {
                expected: ValueKind::Map,
                found: other.kind(),
            }),
        }
    }

    pub fn for_each(&mut self, mut f: impl FnMut(usize, Element<'_>)) -> Result<(), DraftError> {
        for index in 0..self.array_len()? {
            f(index, self.element(Prop::Index(index)));
        }
        Ok(())
    }

    pub fn map<R>(&mut self, mut f: impl FnMut(usize, Element<'_>) -> R) -> Result<Vec<R>, DraftError> {
        let len = self.array_len()?;
        let mut out = Vec::with_capacity(len);
        for index in 0..len {
            out.push(f(index, self.element(Prop::Index(index))));
        }
        Ok(out)
    }

    /// Positions of the elements `f` accepts.
    pub fn filter(&mut self, mut f: impl FnMut(usize, Element<'_>) -> bool) -> Result<Vec<usize>, DraftError> {
        let mut matches = Vec::new();
        for index in 0..self.array_len()? {
            if f(index, self.element(Prop::Index(index))) {
                matches.push(index);
            }
        }
        Ok(matches)
    }

    /// The first element `f` accepts.
    pub fn find(
        &mut self,
        mut f: impl FnMut(usize, Element<'_>) -> bool,
    ) -> Result<Option<Element<'_>>, DraftError> {
        let mut found = None;
        for index in 0..self.array_len()? {
            if f(index, self.element(Prop::Index(index))) {
                found = Some(index);
                break;
            }
        }
        Ok(match found {
            Some(index) => Some(self.element(Prop::Index(index))),
            None => None,
        })
    }

    pub fn reduce<A>(
        &mut self,
        init: A,
        mut f: impl FnMut(A, usize, Element<'_>) -> A,
    ) -> Result<A, DraftError> {
        let mut acc = init;
        for index in 0..self.array_len()? {
            acc = f(acc, index, self.element(Prop::Index(index)));
        }
        Ok(acc)
    }

    pub fn any(&mut self, mut f: impl FnMut(usize, Element<'_>) -> bool) -> Result<bool, DraftError> {
        for index in 0..self.array_len()? {
            if f(index, self.element(Prop::Index(index))) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn all(&mut self, mut f: impl FnMut(usize, Element<'_>) -> bool) -> Result<bool, DraftError> {
        for index in 0..self.array_len()? {
            if !f(index, self.element(Prop::Index(index))) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn for_each_entry(&mut self, mut f: impl FnMut(&Key, Element<'_>)) -> Result<(), DraftError> {
        let keys: Vec<Key> = match self.value() {
            Value::Map(entries) => entries.keys().cloned().collect(),
            other => {
                return Err(DraftError::TypeMismatch {
                    expected: ValueKind::Map,
                    found: other.kind(),
                });
            }
        };
        for key in keys {
            let element = self.element(Prop::Entry(key.clone()));
            f(&key, element);
        }
        Ok(())
    }

    fn array_len(&self) -> Result<usize, DraftError> {
        match self.value() {
            Value::Array(items) => Ok(items.len()),
            other => Err(DraftError::TypeMismatch {
                expected: ValueKind::Array,
                found: other.kind(),
            }),
        }
    }

    fn element(&mut self, prop: Prop) -> Element<'_> {
        let draftable = self.value().get_prop(&prop).is_some_and(Value::is_draftable);
        if draftable {
            if let Ok(id) = self.draft.child(self.id, prop.clone()) {
                return Element::Draft(DraftNode {
                    draft: &mut *self.draft,
                    id,
                });
            }
        }
        Element::Value(self.value().get_prop(&prop).unwrap_or(&NULL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{record, value};
    use quickcheck::{Arbitrary, Gen};

    #[test]
    fn setting_back_to_the_original_reverts() {
        let mut draft = wrap(&record! { "a" => 1, "b" => 2 });
        let mut root = draft.root();
        root.set("a", 5).unwrap();
        assert!(root.is_modified());
        root.set("a", 1).unwrap();
        assert!(!draft.is_modified());
        assert_eq!(draft.changes(), Value::object());
    }

    #[test]
    fn writing_the_current_value_is_a_no_op() {
        let mut draft = wrap(&record! { "a" => 1 });
        draft.root().set("a", 1).unwrap();
        assert!(!draft.is_modified());
    }

    #[test]
    fn nested_edits_report_the_top_level_prop() {
        let original = record! { "id" => 1, "meta" => { "stars" => 0, "seen" => false } };
        let changes = with_change_tracking(&original, |draft| {
            draft.child("meta")?.set("stars", 4)
        })
        .unwrap();
        assert_eq!(changes, record! { "meta" => { "stars" => 4, "seen" => false } });
    }

    #[test]
    fn reverting_a_nested_edit_clears_every_level() {
        let original = record! { "a" => { "b" => { "c" => 1 } } };
        let mut draft = wrap(&original);
        {
            let mut root = draft.root();
            let mut a = root.child("a").unwrap();
            let mut b = a.child("b").unwrap();
            b.set("c", 2).unwrap();
            b.set("c", 1).unwrap();
            assert!(!b.is_modified());
        }
        assert!(!draft.is_modified());
        assert_eq!(draft.current(), &original);
    }

    #[test]
    fn a_child_drafted_after_replacement_stays_modified() {
        let original = record! { "x" => { "a" => 1, "b" => 1 } };
        let mut draft = wrap(&original);
        {
            let mut root = draft.root();
            root.set("x", record! { "a" => 2, "b" => 2 }).unwrap();
            let mut x = root.child("x").unwrap();
            assert!(x.is_modified());
            x.set("a", 1).unwrap();
            assert_eq!(x.value(), &record! { "a" => 1, "b" => 2 });
            assert!(x.is_modified());
        }
        assert!(draft.is_modified());
        assert_eq!(draft.changes(), record! { "x" => { "a" => 1, "b" => 2 } });
    }

    #[test]
    fn a_replaced_child_reverts_through_its_nested_draft() {
        let original = record! { "x" => { "a" => 1 } };
        let mut draft = wrap(&original);
        let mut root = draft.root();
        root.set("x", record! { "a" => 2 }).unwrap();
        root.child("x").unwrap().set("a", 1).unwrap();
        assert!(!draft.is_modified());
    }

    #[test]
    fn deletes_mark_modified_without_appearing_in_changes() {
        let mut draft = wrap(&record! { "a" => 1, "b" => 2 });
        let removed = draft.root().remove("b").unwrap();
        assert_eq!(removed, Some(Value::I64(2)));
        assert!(draft.is_modified());
        assert_eq!(draft.changes(), Value::object());
        assert_eq!(draft.current(), &record! { "a" => 1 });
    }

    #[test]
    fn deleting_an_added_prop_reverts_it() {
        let mut draft = wrap(&record! { "a" => 1 });
        let mut root = draft.root();
        root.set("b", 2).unwrap();
        root.remove("b").unwrap();
        assert!(!draft.is_modified());
    }

    #[test]
    fn restoring_a_deleted_prop_reverts_it() {
        let mut draft = wrap(&record! { "a" => 1 });
        let mut root = draft.root();
        root.remove("a").unwrap();
        root.set("a", 1).unwrap();
        assert!(!draft.is_modified());
    }

    #[test]
    fn array_edits_replace_the_whole_array_prop() {
        let original = record! { "tags" => ["a"] };
        let changes = with_change_tracking(&original, |draft| draft.child("tags")?.push("b")).unwrap();
        assert_eq!(changes, record! { "tags" => ["a", "b"] });
    }

    #[test]
    fn array_push_then_pop_is_no_change() {
        let mut draft = wrap(&record! { "tags" => ["a"] });
        {
            let mut root = draft.root();
            let mut tags = root.child("tags").unwrap();
            tags.push("b").unwrap();
            tags.pop().unwrap();
        }
        assert!(!draft.is_modified());
    }

    #[test]
    fn non_keyed_roots_report_the_whole_copy() {
        let changes = with_change_tracking(&value!([3, 1, 2]), |draft| {
            draft.sort_by(|a, b| a.as_i64().cmp(&b.as_i64()))
        })
        .unwrap();
        assert_eq!(changes, value!([1, 2, 3]));
    }

    #[test]
    fn iteration_yields_drafts_for_containers() {
        let original = record! {
            "todos" => [{ "title" => "a", "done" => false }, { "title" => "b", "done" => false }]
        };
        let changes = with_change_tracking(&original, |draft| {
            draft.child("todos")?.for_each(|_, mut todo| {
                if let Some(todo) = todo.as_draft() {
                    todo.set("done", true).unwrap();
                }
            })
        })
        .unwrap();
        assert_eq!(
            changes,
            record! { "todos" => [{ "title" => "a", "done" => true }, { "title" => "b", "done" => true }] }
        );
    }

    #[test]
    fn find_returns_a_tracked_element() {
        let original = value!([{ "id" => 1 }, { "id" => 2 }]);
        let mut draft = wrap(&original);
        {
            let mut root = draft.root();
            let found = root
                .find(|_, element| element.value().get_field("id") == Some(&Value::I64(2)))
                .unwrap();
            let mut todo = found.and_then(Element::into_draft).unwrap();
            todo.set("seen", true).unwrap();
        }
        assert_eq!(draft.changes(), value!([{ "id" => 1 }, { "id" => 2, "seen" => true }]));
    }

    #[test]
    fn scalars_in_arrays_are_plain_values() {
        let mut draft = wrap(&value!([1, 2, 3]));
        let sum = draft
            .root()
            .reduce(0, |acc, _, element| acc + element.value().as_i64().unwrap_or(0))
            .unwrap();
        assert_eq!(sum, 6);
        assert!(draft.root().all(|_, element| matches!(element, Element::Value(_))).unwrap());
        assert!(!draft.is_modified());
    }

    #[test]
    fn structural_edits_discard_element_drafts() {
        let mut draft = wrap(&value!([{ "n" => 1 }, { "n" => 2 }]));
        let mut root = draft.root();
        root.child(0).unwrap().set("n", 10).unwrap();
        root.remove_at(0).unwrap();
        root.child(0).unwrap().set("n", 20).unwrap();
        assert_eq!(root.value(), &value!([{ "n" => 20 }]));
    }

    #[test]
    fn map_entries_are_tracked_per_key() {
        let mut entries = BTreeMap::new();
        entries.insert(Key::Int(1), Value::from("one"));
        entries.insert(Key::Int(2), Value::from("two"));
        let original = Value::Map(entries);

        let mut draft = wrap(&original);
        let mut root = draft.root();
        root.insert_entry(3, "three").unwrap();
        root.remove_entry(1).unwrap();
        root.for_each_entry(|_, element| assert!(matches!(element, Element::Value(_))))
            .unwrap();

        let mut expected = BTreeMap::new();
        expected.insert(Key::Int(3), Value::from("three"));
        assert_eq!(draft.changes(), Value::Map(expected));
    }

    #[test]
    fn set_membership_changes() {
        let original = record! { "labels" => (Value::Set(BTreeSet::from([Key::from("a")]))) };
        let mut draft = wrap(&original);
        {
            let mut root = draft.root();
            let mut labels = root.child("labels").unwrap();
            assert!(labels.add("b").unwrap());
            assert!(labels.delete(&Key::from("b")).unwrap());
        }
        assert!(!draft.is_modified());
    }

    #[test]
    fn type_mismatches_are_errors() {
        let mut draft = wrap(&record! { "a" => 1 });
        let mut root = draft.root();
        assert_eq!(
            root.push(1),
            Err(DraftError::TypeMismatch {
                expected: ValueKind::Array,
                found: ValueKind::Object
            })
        );
        assert_eq!(
            root.child("a").err(),
            Some(DraftError::NotDraftable {
                prop: Prop::from("a"),
                kind: ValueKind::I64
            })
        );
        assert_eq!(
            root.child("missing").err(),
            Some(DraftError::MissingProp(Prop::from("missing")))
        );
        insta::assert_snapshot!(
            root.set(3, true).unwrap_err().to_string(),
            @"index 3 is not addressable on a value of type object"
        );
    }

    #[test]
    fn array_tracking_reports_each_target() {
        let targets = vec![record! { "id" => 1, "v" => 1 }, record! { "id" => 2, "v" => 1 }];
        let changes = with_array_change_tracking(&targets, |drafts| {
            drafts[1].root().set("v", 2)
        })
        .unwrap();
        assert_eq!(changes, vec![Value::object(), record! { "v" => 2 }]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8, u8),
        Remove(u8),
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            let field = u8::arbitrary(g) % 4;
            if bool::arbitrary(g) {
                Op::Set(field, u8::arbitrary(g) % 3)
            } else {
                Op::Remove(field)
            }
        }
    }

    fn field(n: u8) -> String {
        format!("f{n}")
    }

    #[quickcheck]
    fn changes_are_exactly_the_differing_props(ops: Vec<Op>) -> bool {
        let original = record! { "f0" => 0, "f1" => 1, "f2" => 2 };
        let mut draft = wrap(&original);
        {
            let mut root = draft.root();
            for op in ops {
                match op {
                    Op::Set(n, v) => root.set(field(n), Value::I64(v.into())).unwrap(),
                    Op::Remove(n) => {
                        root.remove(field(n)).unwrap();
                    }
                }
            }
        }
        let current = draft.current().clone();
        let expected: BTreeMap<String, Value> = current
            .as_object()
            .unwrap()
            .iter()
            .filter(|(name, v)| original.get_field(name) != Some(*v))
            .map(|(name, v)| (name.clone(), v.clone()))
            .collect();

        draft.is_modified() == (current != original)
            && (!draft.is_modified() || draft.changes() == Value::Object(expected))
    }
}
