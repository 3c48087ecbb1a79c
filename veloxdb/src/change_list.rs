//! The change list (§4.C4): every object touched this session, in a flat
//! growable array with a per-class chained index so `ApplyChanges` and the
//! cascade fixpoint can iterate one class's (or a class and its
//! descendants') entries without scanning the whole list.

use std::collections::HashMap;

use crate::ids::{ClassId, ObjectId};

/// What the change list tracks per touched object. The entity wrapper
/// itself lives in `object.rs`'s identity map; this just remembers *which*
/// ids were touched and in what class, for changeset emission ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    id: ObjectId,
    class_id: ClassId,
    kind: ChangeKind,
    /// Index of the next entry for the same class, or `None` — a singly
    /// linked chain threaded through the flat array (§4.C4).
    next: Option<usize>,
}

pub struct ChangeList {
    entries: Vec<Entry>,
    heads: HashMap<ClassId, usize>,
    tails: HashMap<ClassId, usize>,
    initial_capacity: usize,
}

impl ChangeList {
    pub fn new(initial_capacity: usize) -> Self {
        ChangeList {
            entries: Vec::with_capacity(initial_capacity),
            heads: HashMap::new(),
            tails: HashMap::new(),
            initial_capacity,
        }
    }

    pub fn add(&mut self, id: ObjectId, class_id: ClassId, kind: ChangeKind) {
        let idx = self.entries.len();
        self.entries.push(Entry { id, class_id, kind, next: None });
        match self.tails.get(&class_id).copied() {
            Some(tail) => self.entries[tail].next = Some(idx),
            None => {
                self.heads.insert(class_id, idx);
            }
        }
        self.tails.insert(class_id, idx);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Walks every entry of `class_id` alone, in insertion order.
    pub fn iter_class(&self, class_id: ClassId) -> impl Iterator<Item = (ObjectId, ChangeKind)> + '_ {
        ClassChain { entries: &self.entries, next: self.heads.get(&class_id).copied() }
    }

    /// Walks `class_id` and every class in `descendants` (already including
    /// `class_id` itself, per `Model::descendants`), in class order.
    pub fn iter_classes<'a>(&'a self, descendants: &'a [ClassId]) -> impl Iterator<Item = (ObjectId, ChangeKind)> + 'a {
        descendants.iter().flat_map(move |c| self.iter_class(*c))
    }

    pub fn iter_all(&self) -> impl Iterator<Item = (ObjectId, ClassId, ChangeKind)> + '_ {
        self.entries.iter().map(|e| (e.id, e.class_id, e.kind))
    }

    /// Drops all entries and shrinks the backing array back to its initial
    /// capacity, so a long-lived session's changeset bookkeeping doesn't
    /// keep the high-water mark of its largest transaction forever.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.entries.shrink_to(self.initial_capacity);
        self.heads.clear();
        self.tails.clear();
    }
}

struct ClassChain<'a> {
    entries: &'a [Entry],
    next: Option<usize>,
}

impl<'a> Iterator for ClassChain<'a> {
    type Item = (ObjectId, ChangeKind);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next?;
        let entry = &self.entries[idx];
        self.next = entry.next;
        Some((entry.id, entry.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_entries_per_class() {
        let mut list = ChangeList::new(8);
        list.add(ObjectId::new(1, 1), 1, ChangeKind::Inserted);
        list.add(ObjectId::new(2, 1), 2, ChangeKind::Inserted);
        list.add(ObjectId::new(1, 2), 1, ChangeKind::Updated);

        let class1: Vec<_> = list.iter_class(1).collect();
        assert_eq!(class1.len(), 2);
        assert_eq!(class1[0].0, ObjectId::new(1, 1));
        assert_eq!(class1[1].0, ObjectId::new(1, 2));

        let class2: Vec<_> = list.iter_class(2).collect();
        assert_eq!(class2.len(), 1);
    }

    #[test]
    fn clear_shrinks_back_to_initial_capacity() {
        let mut list = ChangeList::new(4);
        for i in 0..100 {
            list.add(ObjectId::new(1, i), 1, ChangeKind::Inserted);
        }
        assert!(list.entries.capacity() >= 100);
        list.clear();
        assert!(list.is_empty());
        assert!(list.entries.capacity() <= 100);
    }
}
