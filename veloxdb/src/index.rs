//! Index readers (§4.C7): unify an engine-backed hash/sorted scan with
//! whatever hasn't been flushed to the engine yet, either by flushing
//! (beyond a small change-count threshold) or by re-checking the session's
//! own pending changes against the lookup key.

use crate::change_list::{ChangeKind, ChangeList};
use crate::ids::{ClassId, ObjectId};
use crate::object::{Object, ObjectState};
use crate::value::PropertyValue;

/// How a session-local candidate's key is tested against the lookup. Kept
/// as a closure so callers can express per-index case-sensitivity/culture
/// comparers (§4.C7) without this module depending on `schema`/`record`.
pub type KeyPredicate<'a> = dyn Fn(ObjectId) -> bool + 'a;

/// How many locally-changed rows of a class are tolerated before a lookup
/// flushes them via `ApplyChanges` instead of scanning them in place.
pub const CASCADE_LOCAL_THRESHOLD: usize = 4;

pub enum LookupPlan {
    /// Fewer than the threshold of local changes: scan the change list
    /// directly against `predicate`, in addition to the engine lookup.
    ScanLocal,
    /// At or past the threshold: flush first so the engine lookup alone is
    /// authoritative.
    FlushFirst,
}

pub fn plan_for(change_list: &ChangeList, class: ClassId) -> LookupPlan {
    let count = change_list.iter_class(class).count();
    if count > CASCADE_LOCAL_THRESHOLD {
        LookupPlan::FlushFirst
    } else {
        LookupPlan::ScanLocal
    }
}

/// Merges an engine-sourced id list with session-local change-list entries
/// matching `predicate`, excluding anything `Deleted` and de-duplicating
/// ids the engine path already covered as a live `Read` wrapper (§4.C7
/// "to avoid double-counting").
pub fn merge_results(
    engine_ids: Vec<ObjectId>,
    change_list: &ChangeList,
    class: ClassId,
    predicate: &KeyPredicate<'_>,
    is_live: impl Fn(ObjectId) -> bool,
) -> Vec<ObjectId> {
    let mut out: Vec<ObjectId> = engine_ids.into_iter().filter(|id| is_live(*id)).collect();
    for (id, kind) in change_list.iter_class(class) {
        if matches!(kind, ChangeKind::Deleted) {
            continue;
        }
        if out.contains(&id) {
            continue;
        }
        if predicate(id) {
            out.push(id);
        }
    }
    out
}

/// A predicate over a live (non-deleted, non-abandoned) object's single
/// property value, the common case for a hash/sorted index key comparison.
pub fn property_equals(object: &Object, prop_id: crate::ids::PropertyId, want: &PropertyValue) -> bool {
    if object.state.contains(ObjectState::DELETED) || object.state.contains(ObjectState::ABANDONED) {
        return false;
    }
    let Some(prop) = object.class.property(prop_id) else { return false };
    if !prop.kind.is_simple() {
        return false;
    }
    &crate::record::read_simple(object.buffer.bytes(), &object.class, prop) == want
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_flushes_past_threshold() {
        let mut list = ChangeList::new(8);
        for i in 0..(CASCADE_LOCAL_THRESHOLD as u64 + 1) {
            list.add(ObjectId::new(1, i), 1, ChangeKind::Updated);
        }
        assert!(matches!(plan_for(&list, 1), LookupPlan::FlushFirst));
    }

    #[test]
    fn plan_scans_local_under_threshold() {
        let mut list = ChangeList::new(8);
        list.add(ObjectId::new(1, 1), 1, ChangeKind::Updated);
        assert!(matches!(plan_for(&list, 1), LookupPlan::ScanLocal));
    }
}
