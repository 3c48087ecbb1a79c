//! Collection wrappers (§4.C8): typed value arrays, reference arrays, and
//! lazily-materialised inverse-reference sets. All three promote from a
//! read-only engine-backed view to a session-owned one on first mutation,
//! and carry a version counter so a live iterator notices it's stale.

use crate::ids::ObjectId;
use crate::tracking::DeletedSet;
use crate::value::{ArrayValue, DeleteAction, PropertyValue};

/// A promotable, version-tracked array. `T` is `ArrayValue`'s element type
/// for value arrays or `ObjectId` for reference arrays — the two share this
/// shape (§4.C8 "same shape as value array").
pub enum Storage<T> {
    /// Read-only view backed by the engine's resolved value.
    Engine(std::sync::Arc<Vec<T>>),
    /// Promoted on first mutation.
    Session(Vec<T>),
}

impl<T: Clone> Storage<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            Storage::Engine(v) => v,
            Storage::Session(v) => v,
        }
    }

    pub fn promote(&mut self) -> &mut Vec<T> {
        if let Storage::Engine(v) = self {
            *self = Storage::Session(v.as_ref().clone());
        }
        match self {
            Storage::Session(v) => v,
            Storage::Engine(_) => unreachable!(),
        }
    }

    pub fn is_session_owned(&self) -> bool {
        matches!(self, Storage::Session(_))
    }
}

/// `DatabaseArray<T>` (§4.C8 "typed value array"). Plain value elements,
/// no reference-mutation hooks or delete-action filtering.
pub struct DatabaseArray<T> {
    storage: Storage<T>,
    version: u64,
}

impl<T: Clone> DatabaseArray<T> {
    pub fn from_engine(values: Vec<T>) -> Self {
        DatabaseArray { storage: Storage::Engine(std::sync::Arc::new(values)), version: 0 }
    }

    /// Wraps an already session-owned vector (no promotion needed on first
    /// write) — the session's mutators build these from a decoded property
    /// value rather than a freshly-read engine one.
    pub fn from_owned(values: Vec<T>) -> Self {
        DatabaseArray { storage: Storage::Session(values), version: 0 }
    }

    pub fn len(&self) -> usize {
        self.storage.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.storage.as_slice().get(index)
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter { slice: self.storage.as_slice(), version: self.version, observed: self.version, index: 0 }
    }

    /// Promotes to a session-owned copy (if not already), bumps the
    /// version, and returns the writable backing vector. Callers are
    /// expected to also flip the property's modification bit and mark the
    /// owning object modified (the session mediates that, §4.C6).
    pub fn promote_for_write(&mut self) -> &mut Vec<T> {
        self.version += 1;
        self.storage.promote()
    }

    pub fn snapshot(&self) -> ArraySnapshot<T> {
        ArraySnapshot { values: self.storage.as_slice().to_vec(), is_session_owned: self.storage.is_session_owned() }
    }
}

impl<T: Clone + PartialEq> DatabaseArray<T> {
    pub fn contains(&self, value: &T) -> bool {
        self.storage.as_slice().contains(value)
    }

    pub fn index_of(&self, value: &T) -> Option<usize> {
        self.storage.as_slice().iter().position(|v| v == value)
    }

    pub fn add_range(&mut self, values: impl IntoIterator<Item = T>) {
        self.promote_for_write().extend(values);
    }

    /// Removes the first matching element, §9 "list semantics".
    pub fn remove(&mut self, value: &T) -> bool {
        let buf = self.promote_for_write();
        match buf.iter().position(|v| v == value) {
            Some(pos) => {
                buf.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn remove_at(&mut self, index: usize) -> T {
        self.promote_for_write().remove(index)
    }

    pub fn clear(&mut self) {
        self.promote_for_write().clear();
    }
}

pub struct ArraySnapshot<T> {
    pub values: Vec<T>,
    pub is_session_owned: bool,
}

/// A version-checked iterator: `next()` panics with a clear message rather
/// than silently reading stale data if the array was mutated mid-iteration.
pub struct Iter<'a, T> {
    slice: &'a [T],
    version: u64,
    observed: u64,
    index: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        assert_eq!(self.version, self.observed, "array mutated during iteration");
        let item = self.slice.get(self.index)?;
        self.index += 1;
        Some(item)
    }
}

/// `ReferenceArray<T>` (§4.C8). Like `DatabaseArray<ObjectId>` but aware of
/// its delete action: when it's `SetToNull`, elements present in the
/// session's deleted set are lazily filtered out, promoting to a session
/// copy (without flipping the modification bit — a pure read-time filter)
/// the first time the deleted set moves past `last_observed_version`.
pub struct ReferenceArray {
    storage: Storage<ObjectId>,
    version: u64,
    delete_action: DeleteAction,
    last_observed_deleted_version: u64,
}

impl ReferenceArray {
    pub fn from_engine(ids: Vec<ObjectId>, delete_action: DeleteAction) -> Self {
        ReferenceArray {
            storage: Storage::Engine(std::sync::Arc::new(ids)),
            version: 0,
            delete_action,
            last_observed_deleted_version: 0,
        }
    }

    pub fn from_owned(ids: Vec<ObjectId>, delete_action: DeleteAction) -> Self {
        ReferenceArray { storage: Storage::Session(ids), version: 0, delete_action, last_observed_deleted_version: 0 }
    }

    /// Applies the `SetToNull` lazy filter if the deleted set has grown
    /// since this wrapper last looked. A no-op for other delete actions.
    pub fn refresh_filter(&mut self, deleted: &DeletedSet) {
        if self.delete_action != DeleteAction::SetToNull {
            return;
        }
        if deleted.version() == self.last_observed_deleted_version {
            return;
        }
        self.last_observed_deleted_version = deleted.version();
        let any_filtered = self.storage.as_slice().iter().any(|id| deleted.contains(*id));
        if any_filtered {
            let kept: Vec<ObjectId> = self.storage.as_slice().iter().filter(|id| !deleted.contains(**id)).cloned().collect();
            self.storage = Storage::Session(kept);
            self.version += 1;
        }
    }

    pub fn ids(&self) -> &[ObjectId] {
        self.storage.as_slice()
    }

    pub fn promote_for_write(&mut self) -> &mut Vec<ObjectId> {
        self.version += 1;
        self.storage.promote()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.storage.as_slice().contains(&id)
    }

    pub fn index_of(&self, id: ObjectId) -> Option<usize> {
        self.storage.as_slice().iter().position(|v| *v == id)
    }

    pub fn add_range(&mut self, ids: impl IntoIterator<Item = ObjectId>) {
        self.promote_for_write().extend(ids);
    }

    pub fn remove(&mut self, id: ObjectId) -> bool {
        let buf = self.promote_for_write();
        match buf.iter().position(|v| *v == id) {
            Some(pos) => {
                buf.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn remove_at(&mut self, index: usize) -> ObjectId {
        self.promote_for_write().remove(index)
    }

    pub fn clear(&mut self) {
        self.promote_for_write().clear();
    }
}

/// Bridges the session's dynamically-typed `ArrayValue` (one `Vec<T>` per
/// element kind) to the generic `DatabaseArray<T>` list operations above, so
/// `ObjectModel`'s array mutators (§9 Collections) go through `DatabaseArray`
/// once per operation instead of re-deriving `Vec` mutation per element kind.
impl ArrayValue {
    pub fn contains(&self, scalar: &PropertyValue) -> bool {
        self.index_of(scalar).is_some()
    }

    pub fn index_of(&self, scalar: &PropertyValue) -> Option<usize> {
        match (self, scalar) {
            (ArrayValue::Bool(v), PropertyValue::Bool(s)) => DatabaseArray::from_owned(v.clone()).index_of(s),
            (ArrayValue::Byte(v), PropertyValue::Byte(s)) => DatabaseArray::from_owned(v.clone()).index_of(s),
            (ArrayValue::Short(v), PropertyValue::Short(s)) => DatabaseArray::from_owned(v.clone()).index_of(s),
            (ArrayValue::Int(v), PropertyValue::Int(s)) => DatabaseArray::from_owned(v.clone()).index_of(s),
            (ArrayValue::Long(v), PropertyValue::Long(s)) => DatabaseArray::from_owned(v.clone()).index_of(s),
            (ArrayValue::Float(v), PropertyValue::Float(s)) => DatabaseArray::from_owned(v.clone()).index_of(s),
            (ArrayValue::Double(v), PropertyValue::Double(s)) => DatabaseArray::from_owned(v.clone()).index_of(s),
            (ArrayValue::DateTime(v), PropertyValue::DateTime(s)) => DatabaseArray::from_owned(v.clone()).index_of(s),
            (ArrayValue::String(v), PropertyValue::String(s)) => DatabaseArray::from_owned(v.clone()).index_of(s),
            _ => None,
        }
    }

    /// Appends `additions`; `false` if the element kinds don't match.
    pub fn add_range(&mut self, additions: ArrayValue) -> bool {
        macro_rules! add {
            ($v:ident, $a:ident) => {{
                let mut d = DatabaseArray::from_owned(std::mem::take($v));
                d.add_range($a);
                *$v = d.snapshot().values;
                true
            }};
        }
        match (self, additions) {
            (ArrayValue::Bool(v), ArrayValue::Bool(a)) => add!(v, a),
            (ArrayValue::Byte(v), ArrayValue::Byte(a)) => add!(v, a),
            (ArrayValue::Short(v), ArrayValue::Short(a)) => add!(v, a),
            (ArrayValue::Int(v), ArrayValue::Int(a)) => add!(v, a),
            (ArrayValue::Long(v), ArrayValue::Long(a)) => add!(v, a),
            (ArrayValue::Float(v), ArrayValue::Float(a)) => add!(v, a),
            (ArrayValue::Double(v), ArrayValue::Double(a)) => add!(v, a),
            (ArrayValue::DateTime(v), ArrayValue::DateTime(a)) => add!(v, a),
            (ArrayValue::String(v), ArrayValue::String(a)) => add!(v, a),
            _ => false,
        }
    }

    /// Removes the first element equal to `scalar`; `false` if absent or the
    /// element kind doesn't match.
    pub fn remove(&mut self, scalar: &PropertyValue) -> bool {
        macro_rules! remove {
            ($v:ident, $s:ident) => {{
                let mut d = DatabaseArray::from_owned(std::mem::take($v));
                let removed = d.remove($s);
                *$v = d.snapshot().values;
                removed
            }};
        }
        match (self, scalar) {
            (ArrayValue::Bool(v), PropertyValue::Bool(s)) => remove!(v, s),
            (ArrayValue::Byte(v), PropertyValue::Byte(s)) => remove!(v, s),
            (ArrayValue::Short(v), PropertyValue::Short(s)) => remove!(v, s),
            (ArrayValue::Int(v), PropertyValue::Int(s)) => remove!(v, s),
            (ArrayValue::Long(v), PropertyValue::Long(s)) => remove!(v, s),
            (ArrayValue::Float(v), PropertyValue::Float(s)) => remove!(v, s),
            (ArrayValue::Double(v), PropertyValue::Double(s)) => remove!(v, s),
            (ArrayValue::DateTime(v), PropertyValue::DateTime(s)) => remove!(v, s),
            (ArrayValue::String(v), PropertyValue::String(s)) => remove!(v, s),
            _ => false,
        }
    }

    pub fn remove_at(&mut self, index: usize) {
        macro_rules! remove_at {
            ($v:ident) => {{
                let mut d = DatabaseArray::from_owned(std::mem::take($v));
                d.remove_at(index);
                *$v = d.snapshot().values;
            }};
        }
        match self {
            ArrayValue::Bool(v) => remove_at!(v),
            ArrayValue::Byte(v) => remove_at!(v),
            ArrayValue::Short(v) => remove_at!(v),
            ArrayValue::Int(v) => remove_at!(v),
            ArrayValue::Long(v) => remove_at!(v),
            ArrayValue::Float(v) => remove_at!(v),
            ArrayValue::Double(v) => remove_at!(v),
            ArrayValue::DateTime(v) => remove_at!(v),
            ArrayValue::String(v) => remove_at!(v),
        }
    }

    pub fn clear(&mut self) {
        macro_rules! clear {
            ($v:ident) => {{
                let mut d = DatabaseArray::from_owned(std::mem::take($v));
                d.clear();
                *$v = d.snapshot().values;
            }};
        }
        match self {
            ArrayValue::Bool(v) => clear!(v),
            ArrayValue::Byte(v) => clear!(v),
            ArrayValue::Short(v) => clear!(v),
            ArrayValue::Int(v) => clear!(v),
            ArrayValue::Long(v) => clear!(v),
            ArrayValue::Float(v) => clear!(v),
            ArrayValue::Double(v) => clear!(v),
            ArrayValue::DateTime(v) => clear!(v),
            ArrayValue::String(v) => clear!(v),
        }
    }
}

/// `InverseReferenceSet<T>` (§4.C8). Never stored in the record buffer;
/// materialised on first access by merging the delta store with the
/// engine's committed inverse-reference array (§4.C5).
pub struct InverseReferenceSet {
    cached: Option<Vec<ObjectId>>,
}

impl InverseReferenceSet {
    pub fn new() -> Self {
        InverseReferenceSet { cached: None }
    }

    pub fn is_materialised(&self) -> bool {
        self.cached.is_some()
    }

    pub fn get_or_materialise(&mut self, fetch: impl FnOnce() -> Vec<ObjectId>) -> &[ObjectId] {
        if self.cached.is_none() {
            self.cached = Some(fetch());
        }
        self.cached.as_deref().unwrap()
    }

    /// Drops the cached array, per `release_memory()`.
    pub fn release_memory(&mut self) {
        self.cached = None;
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}

impl Default for InverseReferenceSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_array_promotes_on_write() {
        let mut arr: DatabaseArray<i32> = DatabaseArray::from_engine(vec![1, 2, 3]);
        assert!(!arr.storage.is_session_owned());
        arr.promote_for_write().push(4);
        assert!(arr.storage.is_session_owned());
        assert_eq!(arr.len(), 4);
    }

    #[test]
    fn value_array_list_operations() {
        let mut arr: DatabaseArray<i32> = DatabaseArray::from_engine(vec![1, 2, 3]);
        assert!(arr.contains(&2));
        assert_eq!(arr.index_of(&2), Some(1));
        arr.add_range([4, 5]);
        assert_eq!(arr.snapshot().values, vec![1, 2, 3, 4, 5]);
        assert!(arr.remove(&3));
        assert!(!arr.remove(&99));
        assert_eq!(arr.remove_at(0), 1);
        arr.clear();
        assert!(arr.is_empty());
    }

    #[test]
    fn reference_array_list_operations() {
        let a = ObjectId::new(2, 1);
        let b = ObjectId::new(2, 2);
        let mut arr = ReferenceArray::from_engine(vec![a, b], DeleteAction::CascadeDelete);
        assert!(arr.contains(a));
        assert_eq!(arr.index_of(b), Some(1));
        let c = ObjectId::new(2, 3);
        arr.add_range([c]);
        assert!(arr.remove(a));
        assert_eq!(arr.ids(), &[b, c]);
        arr.clear();
        assert!(arr.ids().is_empty());
    }

    #[test]
    fn array_value_list_operations() {
        let mut value = ArrayValue::Int(vec![10, 20, 30]);
        assert!(value.contains(&PropertyValue::Int(20)));
        assert_eq!(value.index_of(&PropertyValue::Int(30)), Some(2));
        assert!(value.add_range(ArrayValue::Int(vec![40])));
        assert!(value.remove(&PropertyValue::Int(10)));
        value.remove_at(0);
        assert_eq!(value, ArrayValue::Int(vec![30, 40]));
        value.clear();
        assert_eq!(value, ArrayValue::Int(vec![]));
    }

    #[test]
    fn reference_array_filters_set_to_null_targets_lazily() {
        let a = ObjectId::new(2, 1);
        let b = ObjectId::new(2, 2);
        let mut arr = ReferenceArray::from_engine(vec![a, b], DeleteAction::SetToNull);
        let mut deleted = DeletedSet::new();
        arr.refresh_filter(&deleted);
        assert_eq!(arr.ids(), &[a, b]);

        deleted.add(a);
        deleted.inc_version();
        arr.refresh_filter(&deleted);
        assert_eq!(arr.ids(), &[b]);
    }

    #[test]
    fn inverse_reference_set_materialises_once() {
        let mut set = InverseReferenceSet::new();
        let mut calls = 0;
        set.get_or_materialise(|| {
            calls += 1;
            vec![ObjectId::new(1, 1)]
        });
        set.get_or_materialise(|| {
            calls += 1;
            vec![]
        });
        assert_eq!(calls, 1);
        set.release_memory();
        assert!(!set.is_materialised());
    }
}
