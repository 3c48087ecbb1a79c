//! An in-memory `Engine`/`Transaction` implementation (§4.C9, ambient), the
//! only concrete engine in this crate. Grounded on the teacher's
//! `storage::memory::Memory` — a `BTreeMap`-backed store with no durability
//! — generalised from raw key/value bytes to class-described records, plus
//! the string/array/reference-array side tables and naive index scans the
//! object model needs on the other side of its boundary.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::changeset::{self, Block};
use crate::engine::{Changeset, Engine, ObjectReader, Transaction, TransactionKind};
use crate::error::{Error, Result};
use crate::ids::{ClassId, ObjectId, PropertyId};
use crate::record;
use crate::schema::Model;
use crate::value::{ArrayElementKind, ArrayValue, PropertyKind, PropertyValue};

struct MockState {
    /// class id -> (object id -> packed record buffer), mirroring how the
    /// real engine would keep one physical store per class.
    records: HashMap<ClassId, BTreeMap<ObjectId, Arc<[u8]>>>,
    strings: Vec<String>,
    arrays: Vec<ArrayValue>,
    ref_arrays: Vec<Vec<ObjectId>>,
    next_sequence: u64,
}

impl MockState {
    fn new() -> Self {
        MockState {
            records: HashMap::new(),
            strings: Vec::new(),
            arrays: Vec::new(),
            ref_arrays: Vec::new(),
            next_sequence: 1,
        }
    }
}

/// A handle-allocating engine-side store: `intern_*` returns a positive
/// handle usable in a record's indirect slot (§4.C2).
impl MockState {
    fn intern_string(&mut self, s: String) -> u64 {
        self.strings.push(s);
        self.strings.len() as u64
    }

    fn intern_array(&mut self, a: ArrayValue) -> u64 {
        self.arrays.push(a);
        self.arrays.len() as u64
    }

    fn intern_ref_array(&mut self, a: Vec<ObjectId>) -> u64 {
        self.ref_arrays.push(a);
        self.ref_arrays.len() as u64
    }
}

pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
    model: Arc<Model>,
}

impl MockEngine {
    pub fn new(model: Arc<Model>) -> Self {
        MockEngine { state: Arc::new(Mutex::new(MockState::new())), model }
    }
}

impl Engine for MockEngine {
    fn create_transaction(&self, kind: TransactionKind) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(MockTransaction { state: self.state.clone(), model: self.model.clone(), kind }))
    }
}

pub struct MockTransaction {
    state: Arc<Mutex<MockState>>,
    model: Arc<Model>,
    kind: TransactionKind,
}

impl MockTransaction {
    fn read_property(&self, buffer: &[u8], class_id: ClassId, prop_id: PropertyId) -> Result<PropertyValue> {
        let class = self
            .model
            .class(class_id)
            .ok_or_else(|| engine_err(format!("unknown class {class_id}")))?;
        let prop = class
            .property(prop_id)
            .ok_or_else(|| engine_err(format!("unknown property {prop_id} on class {class_id}")))?;
        match prop.kind {
            PropertyKind::Simple(_) => Ok(record::read_simple(buffer, class, prop)),
            PropertyKind::Indirect(kind) => {
                let handle = record::read_handle(buffer, class, prop);
                self.resolve_indirect(handle, kind)
            }
            PropertyKind::InverseReferenceSet => Err(engine_err("inverse-reference views have no stored value")),
        }
    }

    fn resolve_indirect(&self, handle: i64, kind: crate::value::IndirectKind) -> Result<PropertyValue> {
        use crate::value::IndirectKind;
        if handle == 0 {
            return Ok(match kind {
                IndirectKind::String => PropertyValue::String(String::new()),
                IndirectKind::Array(e) => PropertyValue::Array(empty_array(e)),
                IndirectKind::ReferenceArray => PropertyValue::ReferenceArray(Vec::new()),
            });
        }
        let state = self.state.lock().unwrap();
        let idx = (handle - 1) as usize;
        match kind {
            IndirectKind::String => Ok(PropertyValue::String(
                state.strings.get(idx).cloned().ok_or_else(|| engine_err("dangling string handle"))?,
            )),
            IndirectKind::Array(_) => Ok(PropertyValue::Array(
                state.arrays.get(idx).cloned().ok_or_else(|| engine_err("dangling array handle"))?,
            )),
            IndirectKind::ReferenceArray => Ok(PropertyValue::ReferenceArray(
                state.ref_arrays.get(idx).cloned().ok_or_else(|| engine_err("dangling reference-array handle"))?,
            )),
        }
    }
}

fn empty_array(kind: ArrayElementKind) -> ArrayValue {
    match kind {
        ArrayElementKind::Bool => ArrayValue::Bool(Vec::new()),
        ArrayElementKind::Byte => ArrayValue::Byte(Vec::new()),
        ArrayElementKind::Short => ArrayValue::Short(Vec::new()),
        ArrayElementKind::Int => ArrayValue::Int(Vec::new()),
        ArrayElementKind::Long => ArrayValue::Long(Vec::new()),
        ArrayElementKind::Float => ArrayValue::Float(Vec::new()),
        ArrayElementKind::Double => ArrayValue::Double(Vec::new()),
        ArrayElementKind::DateTime => ArrayValue::DateTime(Vec::new()),
        ArrayElementKind::String => ArrayValue::String(Vec::new()),
    }
}

fn engine_err(msg: impl Into<String>) -> Error {
    Error::EngineError(Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg.into())))
}

impl Transaction for MockTransaction {
    fn kind(&self) -> TransactionKind {
        self.kind
    }

    fn object_exists(&self, class: ClassId, id: ObjectId) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.records.get(&class).map(|m| m.contains_key(&id)).unwrap_or(false))
    }

    fn get_object(&self, id: ObjectId) -> Result<Option<ObjectReader>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .records
            .get(&id.class_id())
            .and_then(|m| m.get(&id))
            .map(|buf| ObjectReader { id, buffer: buf.clone() }))
    }

    fn begin_class_scan(&self, classes: &[ClassId]) -> Result<Box<dyn Iterator<Item = Result<ObjectReader>> + '_>> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for class in classes {
            if let Some(m) = state.records.get(class) {
                for (id, buf) in m.iter() {
                    out.push(Ok(ObjectReader { id: *id, buffer: buf.clone() }));
                }
            }
        }
        Ok(Box::new(out.into_iter()))
    }

    fn get_inverse_references(&self, id: ObjectId, property: PropertyId) -> Result<Vec<ObjectId>> {
        let state = self.state.lock().unwrap();
        let referrers = self.model.referrers(id.class_id());
        let mut out = Vec::new();
        for referring in referrers {
            if referring.property != property {
                continue;
            }
            let class = match self.model.class(referring.referrer_class) {
                Some(c) => c,
                None => continue,
            };
            let prop = match class.property(referring.property) {
                Some(p) => p,
                None => continue,
            };
            if let Some(m) = state.records.get(&referring.referrer_class) {
                for (referrer_id, buf) in m.iter() {
                    match prop.kind {
                        PropertyKind::Simple(_) => {
                            if let PropertyValue::Reference(target) = record::read_simple(buf, class, prop) {
                                if target == id {
                                    out.push(*referrer_id);
                                }
                            }
                        }
                        PropertyKind::Indirect(crate::value::IndirectKind::ReferenceArray) => {
                            let handle = record::read_handle(buf, class, prop);
                            if handle != 0 {
                                let idx = (handle - 1) as usize;
                                if let Some(ids) = state.ref_arrays.get(idx) {
                                    if ids.contains(&id) {
                                        out.push(*referrer_id);
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(out)
    }

    fn reserve_id_range(&self, count: u64) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let first = state.next_sequence;
        state.next_sequence = state
            .next_sequence
            .checked_add(count)
            .ok_or_else(|| Error::IdExhausted("mock engine sequence space exhausted".into()))?;
        Ok(first)
    }

    fn apply_changeset(&self, cs: Changeset, validate_refs: bool) -> Result<()> {
        let model = self.model.clone();
        let blocks = changeset::decode(&cs, |class_id, prop_id| {
            model.class(class_id).and_then(|c| c.property(prop_id)).map(|p| p.kind)
        })?;

        let mut state = self.state.lock().unwrap();
        for block in blocks {
            match block {
                Block::Insert { class_id, id, prop_ids, values } => {
                    apply_row(&mut state, &self.model, class_id, id, &prop_ids, &values)?;
                }
                Block::Update { class_id, id, prop_ids, values } => {
                    if validate_refs {
                        for v in &values {
                            if let PropertyValue::Reference(target) = v {
                                if !target.is_null()
                                    && !state
                                        .records
                                        .get(&target.class_id())
                                        .map(|m| m.contains_key(target))
                                        .unwrap_or(false)
                                {
                                    return Err(engine_err(format!("dangling reference to {target:?}")));
                                }
                            }
                        }
                    }
                    apply_row(&mut state, &self.model, class_id, id, &prop_ids, &values)?;
                }
                Block::Delete { class_id, id } => {
                    state.records.entry(class_id).or_default().remove(&id);
                }
            }
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn resolve_string(&self, handle: u64) -> Result<String> {
        let state = self.state.lock().unwrap();
        state
            .strings
            .get((handle - 1) as usize)
            .cloned()
            .ok_or_else(|| engine_err("dangling string handle"))
    }

    fn resolve_array(&self, handle: u64, _element: ArrayElementKind) -> Result<ArrayValue> {
        let state = self.state.lock().unwrap();
        state
            .arrays
            .get((handle - 1) as usize)
            .cloned()
            .ok_or_else(|| engine_err("dangling array handle"))
    }

    fn resolve_ref_array(&self, handle: u64) -> Result<Vec<ObjectId>> {
        let state = self.state.lock().unwrap();
        state
            .ref_arrays
            .get((handle - 1) as usize)
            .cloned()
            .ok_or_else(|| engine_err("dangling reference-array handle"))
    }

    fn hash_index_lookup(&self, _index: &str, class: ClassId, key: &[PropertyValue]) -> Result<Vec<ObjectId>> {
        self.scan_matching(class, key)
    }

    fn sorted_index_scan(
        &self,
        _index: &str,
        class: ClassId,
        low: Option<&[PropertyValue]>,
        high: Option<&[PropertyValue]>,
    ) -> Result<Vec<ObjectId>> {
        let state = self.state.lock().unwrap();
        let class_desc = self.model.class(class).ok_or_else(|| engine_err(format!("unknown class {class}")))?;
        let mut out = Vec::new();
        if let Some(m) = state.records.get(&class) {
            for (id, buf) in m.iter() {
                let mut ok = true;
                if let Some(low) = low {
                    ok &= self.cmp_key(class_desc, buf, low) != std::cmp::Ordering::Less;
                }
                if let Some(high) = high {
                    ok &= self.cmp_key(class_desc, buf, high) != std::cmp::Ordering::Greater;
                }
                if ok {
                    out.push(*id);
                }
            }
        }
        Ok(out)
    }
}

impl MockTransaction {
    /// No real secondary index structures exist in the mock engine (§4.C9):
    /// every lookup is a linear scan comparing the leading properties named
    /// by `key` against each record's simple prefix.
    fn scan_matching(&self, class: ClassId, key: &[PropertyValue]) -> Result<Vec<ObjectId>> {
        let state = self.state.lock().unwrap();
        let class_desc = self.model.class(class).ok_or_else(|| engine_err(format!("unknown class {class}")))?;
        let mut out = Vec::new();
        if let Some(m) = state.records.get(&class) {
            for (id, buf) in m.iter() {
                if self.cmp_key(class_desc, buf, key) == std::cmp::Ordering::Equal {
                    out.push(*id);
                }
            }
        }
        Ok(out)
    }

    /// Compares `key`'s values against this record's first `key.len()`
    /// simple properties, in declared order.
    fn cmp_key(&self, class: &crate::schema::ClassDescriptor, buf: &[u8], key: &[PropertyValue]) -> std::cmp::Ordering {
        for (i, want) in key.iter().enumerate() {
            let Some(prop) = class.properties.get(i) else { return std::cmp::Ordering::Less };
            let got = record::read_simple(buf, class, prop);
            let ord = compare_values(&got, want);
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    }
}

fn compare_values(a: &PropertyValue, b: &PropertyValue) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (PropertyValue::Int(x), PropertyValue::Int(y)) => x.cmp(y),
        (PropertyValue::Long(x), PropertyValue::Long(y)) => x.cmp(y),
        (PropertyValue::Short(x), PropertyValue::Short(y)) => x.cmp(y),
        (PropertyValue::Byte(x), PropertyValue::Byte(y)) => x.cmp(y),
        (PropertyValue::Bool(x), PropertyValue::Bool(y)) => x.cmp(y),
        (PropertyValue::DateTime(x), PropertyValue::DateTime(y)) => x.cmp(y),
        (PropertyValue::Float(x), PropertyValue::Float(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (PropertyValue::Double(x), PropertyValue::Double(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (PropertyValue::Reference(x), PropertyValue::Reference(y)) => x.raw().cmp(&y.raw()),
        _ => Ordering::Equal,
    }
}

/// Writes one decoded row's values into a (possibly freshly allocated)
/// record buffer and re-stores it, interning any indirect values afresh.
fn apply_row(
    state: &mut MockState,
    model: &Model,
    class_id: ClassId,
    id: ObjectId,
    prop_ids: &[PropertyId],
    values: &[PropertyValue],
) -> Result<()> {
    let class = model.class(class_id).ok_or_else(|| engine_err(format!("unknown class {class_id}")))?;
    let table = state.records.entry(class_id).or_default();
    let mut buf = table.get(&id).map(|b| b.to_vec()).unwrap_or_else(|| record::alloc_buffer(class));
    record::set_id(&mut buf, class, id);

    for (prop_id, value) in prop_ids.iter().zip(values.iter()) {
        let prop = class
            .property(*prop_id)
            .ok_or_else(|| engine_err(format!("unknown property {prop_id} on class {class_id}")))?;
        match prop.kind {
            PropertyKind::Simple(_) => record::write_simple(&mut buf, class, prop, value),
            PropertyKind::Indirect(_) => {
                let handle = match value {
                    PropertyValue::String(s) if s.is_empty() => 0,
                    PropertyValue::String(s) => state.intern_string(s.clone()) as i64,
                    PropertyValue::Array(a) if a.is_empty() => 0,
                    PropertyValue::Array(a) => state.intern_array(a.clone()) as i64,
                    PropertyValue::ReferenceArray(v) if v.is_empty() => 0,
                    PropertyValue::ReferenceArray(v) => state.intern_ref_array(v.clone()) as i64,
                    other => return Err(engine_err(format!("value {other:?} does not match indirect property {prop_id}"))),
                };
                record::write_handle(&mut buf, class, prop, handle);
            }
            PropertyKind::InverseReferenceSet => {
                return Err(engine_err("inverse-reference views cannot be written"));
            }
        }
    }

    let version = record::get_version(&buf, class).wrapping_add(1);
    record::set_version(&mut buf, class, version);
    record::clear_bitmap(&mut buf, class);
    table.insert(id, Arc::from(buf.into_boxed_slice()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::ChangesetWriter;
    use crate::schema::{ClassDef, ModelBuilder, PropertyDef};
    use crate::value::SimpleKind;

    fn model() -> Arc<Model> {
        Arc::new(
            ModelBuilder::new()
                .class(
                    ClassDef::new(1, "Station")
                        .property(PropertyDef::simple("elevation", SimpleKind::Int))
                        .property(PropertyDef::string("name")),
                )
                .build(),
        )
    }

    #[test]
    fn inserts_and_reads_back() {
        let model = model();
        let engine = MockEngine::new(model.clone());
        let tx = engine.create_transaction(TransactionKind::ReadWrite).unwrap();

        let id = ObjectId::new(1, 1);
        let mut w = ChangesetWriter::new();
        w.insert_block(1, id, &[2, 3], &[PropertyValue::Int(900), PropertyValue::String("Keystone".into())]);
        tx.apply_changeset(w.finish(), true).unwrap();

        let reader = tx.get_object(id).unwrap().unwrap();
        let class = model.class(1).unwrap();
        let elevation = class.property_by_name("elevation").unwrap();
        assert_eq!(record::read_simple(&reader.buffer, class, elevation), PropertyValue::Int(900));

        let name = class.property_by_name("name").unwrap();
        let handle = record::read_handle(&reader.buffer, class, name);
        assert_eq!(tx.resolve_string(handle as u64).unwrap(), "Keystone");
    }

    #[test]
    fn reserves_disjoint_ranges() {
        let engine = MockEngine::new(model());
        let tx = engine.create_transaction(TransactionKind::ReadWrite).unwrap();
        let first = tx.reserve_id_range(10).unwrap();
        let second = tx.reserve_id_range(5).unwrap();
        assert_eq!(second, first + 10);
    }
}
