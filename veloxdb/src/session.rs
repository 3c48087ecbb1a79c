//! The object model session (§4.C6): identity map, dirty tracking, the
//! cascade-delete fixpoint, and the two-phase `ApplyChanges` pipeline tying
//! every other module together. This is the one type application code
//! actually drives.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, trace, warn};

use crate::alloc::{IdAllocator, IdSource};
use crate::change_list::{ChangeKind, ChangeList};
use crate::changeset::ChangesetWriter;
use crate::collections::{InverseReferenceSet, ReferenceArray};
use crate::config::SessionConfig;
use crate::engine::{Engine, ObjectReader, Transaction, TransactionKind};
use crate::error::{Error, Result};
use crate::ids::{ClassId, ObjectId, PropertyId};
use crate::object::{Buffer, Object, ObjectState, SessionPool};
use crate::pool::{Checkout, ContextPool};
use crate::record;
use crate::schema::{ClassDescriptor, Model};
use crate::tracking::{DeletedSet, DeltaStore};
use crate::value::{ArrayValue, DeleteAction, IndirectKind, PropertyKind, PropertyValue, SimpleKind};

/// Wraps the session's transaction behind a mutex so the background id
/// allocator (§5, "two mutexes") can share it without `ObjectModel` itself
/// needing to be `Sync` — every other session operation is single-threaded
/// and only ever takes this lock uncontended.
struct TxnIdSource(Mutex<Box<dyn Transaction>>);

impl IdSource for TxnIdSource {
    fn reserve_id_range(&self, count: u64) -> Result<u64> {
        self.0.lock().unwrap().reserve_id_range(count)
    }
}

/// Inverse-reference-carrying reference properties seen while processing one
/// cascade pass but not backed by `track_inverse`; scheduled for a scan
/// against the engine (§4.C6 step 3).
struct ScanEntry {
    referrer_class: ClassId,
    property: PropertyId,
    delete_action: DeleteAction,
}

/// The reusable part of a session (§4.C10, "context pool slot"): the
/// change list and the three indirect-value pools. None of these hold a
/// reference to any one transaction, so they're what actually gets checked
/// out of and returned to the process-wide `ContextPool` rather than
/// allocated fresh per session.
struct SessionContext {
    change_list: ChangeList,
    string_pool: SessionPool<String>,
    array_pool: SessionPool<ArrayValue>,
    ref_array_pool: SessionPool<Vec<ObjectId>>,
}

impl SessionContext {
    fn new(config: &SessionConfig) -> Self {
        SessionContext {
            change_list: ChangeList::new(config.change_list_initial_capacity as usize),
            string_pool: SessionPool::new(config.buffer_string_pool_initial as usize),
            array_pool: SessionPool::new(config.buffer_string_pool_initial as usize),
            ref_array_pool: SessionPool::new(config.buffer_string_pool_initial as usize),
        }
    }

    /// A context handed back by a prior session still carries its stale
    /// contents; `open` clears it before use.
    fn reset(&mut self) {
        self.change_list.clear();
        self.string_pool.clear();
        self.array_pool.clear();
        self.ref_array_pool.clear();
    }
}

static CONTEXT_POOL: OnceLock<ContextPool<SessionContext>> = OnceLock::new();

fn context_pool(config: &SessionConfig) -> &'static ContextPool<SessionContext> {
    let config = config.clone();
    CONTEXT_POOL.get_or_init(move || ContextPool::new(move || SessionContext::new(&config)))
}

pub struct ObjectModel {
    model: Arc<Model>,
    config: SessionConfig,
    owner_thread: std::thread::ThreadId,
    txn_kind: TransactionKind,
    txn: Arc<TxnIdSource>,
    alloc: IdAllocator<TxnIdSource>,
    identity_map: HashMap<ObjectId, RefCell<Object>>,
    context: Checkout<'static, SessionContext>,
    deleted_set: DeletedSet,
    delta_store: DeltaStore,
    inverse_views: HashMap<(ObjectId, PropertyId), InverseReferenceSet>,
    disposed: bool,
}

impl ObjectModel {
    /// Opens a session (§4.C6, §2): acquires a transaction from `engine`
    /// and a context-pool slot (change list, string/array/reference-array
    /// pools) sized from `config` the first time the pool is created.
    pub fn open(engine: &dyn Engine, model: Arc<Model>, config: SessionConfig) -> Result<Self> {
        let txn = engine.create_transaction(config.transaction_kind)?;
        let txn = Arc::new(TxnIdSource(Mutex::new(txn)));
        let alloc = IdAllocator::new(
            txn.clone(),
            config.id_range_size as u64,
            config.id_range_request as u64,
            config.id_refill_water_mark,
        );
        let mut context = context_pool(&config).acquire();
        context.reset();
        debug!("session opened, transaction kind {:?}", config.transaction_kind);
        Ok(ObjectModel {
            model,
            txn_kind: config.transaction_kind,
            owner_thread: std::thread::current().id(),
            context,
            config,
            txn,
            alloc,
            identity_map: HashMap::new(),
            deleted_set: DeletedSet::new(),
            delta_store: DeltaStore::new(),
            inverse_views: HashMap::new(),
            disposed: false,
        })
    }

    fn check_thread(&self) -> Result<()> {
        let actual = std::thread::current().id();
        if actual != self.owner_thread {
            return Err(Error::WrongThread { owner: self.owner_thread, actual });
        }
        Ok(())
    }

    fn check_alive(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::ObjectDisposed);
        }
        Ok(())
    }

    fn guard(&self) -> Result<()> {
        self.check_alive()?;
        self.check_thread()
    }

    /// Wraps an engine error, auto-disposing the session for non-recoverable
    /// failures (§7 propagation policy), before returning it to the caller.
    fn fail(&mut self, err: Error) -> Error {
        if err.is_critical() {
            self.disposed = true;
        }
        err
    }

    fn class(&self, class_id: ClassId) -> Result<Arc<ClassDescriptor>> {
        self.model
            .class(class_id)
            .cloned()
            .ok_or(Error::InvalidObjectType(class_id))
    }

    // ---- creation -------------------------------------------------------

    /// `create_object<T>()` (§4.C6 "Creation").
    pub fn create_object(&mut self, class_id: ClassId) -> Result<ObjectId> {
        self.guard()?;
        let class = self.class(class_id)?;
        if class.is_abstract {
            return Err(Error::InvalidObjectType(class_id));
        }
        if self.txn_kind == TransactionKind::Read {
            return Err(Error::ReadTranWriteAttempt(ObjectId::NULL));
        }

        let sequence = self.alloc.reserve(1).map_err(|e| self.fail(e))?;
        let id = ObjectId::new(class_id, sequence);
        let mut buffer = record::alloc_buffer(&class);
        record::set_id(&mut buffer, &class, id);

        self.context.change_list.add(id, class_id, ChangeKind::Inserted);
        self.identity_map.insert(id, RefCell::new(Object::new_inserted(id, class, buffer)));
        trace!("created object {id:?}");
        Ok(id)
    }

    // ---- reads ------------------------------------------------------------

    /// `get_object(id)` (§4.C6 "Read paths").
    pub fn get_object(&mut self, id: ObjectId) -> Result<Option<ObjectId>> {
        self.guard()?;
        if let Some(cell) = self.identity_map.get(&id) {
            if cell.borrow().is_deleted() {
                return Ok(None);
            }
            return Ok(Some(id));
        }
        if self.deleted_set.contains(id) {
            return Ok(None);
        }

        let class = self.class(id.class_id())?;
        let reader = self.txn.0.lock().unwrap().get_object(id).map_err(|e| self.fail(e))?;
        match reader {
            None => Ok(None),
            Some(ObjectReader { buffer, .. }) => {
                self.identity_map.insert(id, RefCell::new(Object::new_read(id, class, buffer)));
                Ok(Some(id))
            }
        }
    }

    pub fn get_object_strict(&mut self, id: ObjectId) -> Result<ObjectId> {
        self.get_object(id)?.ok_or(Error::ObjectNotFound(id))
    }

    /// `get_all_objects<T>()` (§4.C6). Eagerly materialised here rather
    /// than returned as a lazy iterator borrowing `self` — an interpreter
    /// session mutates its identity map on every engine-backed id it
    /// touches, which doesn't play well with a borrowed iterator; callers
    /// get a `Vec` instead, in class-scan-then-change-list order.
    pub fn get_all_objects(&mut self, class_id: ClassId) -> Result<Vec<ObjectId>> {
        self.guard()?;
        let class = self.class(class_id)?;
        let classes: Vec<ClassId> = self.model.descendants(class_id).to_vec();
        let mut out = Vec::new();

        let rows: Vec<ObjectReader> = {
            let txn = self.txn.0.lock().unwrap();
            txn.begin_class_scan(&classes)
                .map_err(|e| Error::EngineError(Box::new(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))))?
                .collect::<Result<Vec<_>>>()
                .map_err(|e| self.fail(e))?
        };
        for reader in rows {
            if self.deleted_set.contains(reader.id) {
                continue;
            }
            if let Some(cell) = self.identity_map.get(&reader.id) {
                if cell.borrow().state.intersects(ObjectState::MODIFIED | ObjectState::INSERTED | ObjectState::DELETED) {
                    continue; // yielded via the change-list segment instead
                }
            } else {
                let row_class = self.class(reader.id.class_id())?;
                self.identity_map.insert(reader.id, RefCell::new(Object::new_read(reader.id, row_class, reader.buffer.clone())));
            }
            out.push(reader.id);
        }

        for (id, kind) in self.context.change_list.iter_classes(&classes) {
            if !matches!(kind, ChangeKind::Deleted) {
                out.push(id);
            }
        }
        let _ = class;
        Ok(out)
    }

    // ---- property access --------------------------------------------------

    /// `object.get(property)`: the interpreter's read path (§4.C3 "(b)").
    pub fn get(&mut self, id: ObjectId, prop_id: PropertyId) -> Result<PropertyValue> {
        self.guard()?;
        let cell = self.identity_map.get(&id).ok_or(Error::ObjectNotFound(id))?;
        let obj = cell.borrow();
        if obj.is_deleted() {
            return Err(Error::DeletedObjectAccess(id));
        }
        if obj.is_abandoned() {
            return Err(Error::AbandonedObjectAccess(id));
        }
        let prop = obj.class.property(prop_id).ok_or(Error::InvalidObjectType(id.class_id()))?;

        match prop.kind {
            PropertyKind::Simple(SimpleKind::Reference) => {
                let value = record::read_simple(obj.buffer.bytes(), &obj.class, prop);
                if let (PropertyValue::Reference(target), Some(DeleteAction::SetToNull)) = (&value, prop.delete_action) {
                    if !target.is_null() && self.deleted_set.contains(*target) {
                        return Ok(PropertyValue::Reference(ObjectId::NULL));
                    }
                }
                Ok(value)
            }
            PropertyKind::Simple(_) => Ok(record::read_simple(obj.buffer.bytes(), &obj.class, prop)),
            PropertyKind::Indirect(kind) => {
                let handle = record::read_handle(obj.buffer.bytes(), &obj.class, prop);
                self.resolve_indirect(handle, kind, prop.delete_action)
            }
            PropertyKind::InverseReferenceSet => {
                drop(obj);
                Ok(PropertyValue::ReferenceArray(self.inverse_view(id, prop_id)?))
            }
        }
    }

    /// `delete_action` is the property's own (only meaningful for
    /// `IndirectKind::ReferenceArray`): a `SetToNull` reference-array, like
    /// a `SetToNull` scalar reference (`get`'s `Simple(Reference)` arm),
    /// lazily filters out elements whose target is in the deleted set
    /// (spec §9 "reference-array collection wrappers ... lazily filter").
    fn resolve_indirect(&self, handle: i64, kind: IndirectKind, delete_action: Option<DeleteAction>) -> Result<PropertyValue> {
        let value = if handle == 0 {
            match kind {
                IndirectKind::String => PropertyValue::String(String::new()),
                IndirectKind::Array(_) => PropertyValue::Array(ArrayValue::Byte(Vec::new())),
                IndirectKind::ReferenceArray => PropertyValue::ReferenceArray(Vec::new()),
            }
        } else if let Some(index) = record::as_session_index(handle) {
            match kind {
                IndirectKind::String => {
                    PropertyValue::String(self.context.string_pool.get(index).cloned().ok_or(Error::ObjectDisposed)?)
                }
                IndirectKind::Array(_) => {
                    PropertyValue::Array(self.context.array_pool.get(index).cloned().ok_or(Error::ObjectDisposed)?)
                }
                IndirectKind::ReferenceArray => PropertyValue::ReferenceArray(
                    self.context.ref_array_pool.get(index).cloned().ok_or(Error::ObjectDisposed)?,
                ),
            }
        } else {
            let txn = self.txn.0.lock().unwrap();
            match kind {
                IndirectKind::String => PropertyValue::String(txn.resolve_string(handle as u64)?),
                IndirectKind::Array(e) => PropertyValue::Array(txn.resolve_array(handle as u64, e)?),
                IndirectKind::ReferenceArray => PropertyValue::ReferenceArray(txn.resolve_ref_array(handle as u64)?),
            }
        };

        if let (PropertyValue::ReferenceArray(ids), Some(DeleteAction::SetToNull)) = (&value, delete_action) {
            let mut filtered = ReferenceArray::from_engine(ids.clone(), DeleteAction::SetToNull);
            filtered.refresh_filter(&self.deleted_set);
            return Ok(PropertyValue::ReferenceArray(filtered.ids().to_vec()));
        }
        Ok(value)
    }

    /// Resolves an `InverseReferenceSet` property (declared on `id`'s own
    /// class, naming the *referrer* class it mirrors) down to the actual
    /// reference property id on that referrer class, then merges its live
    /// set (§4.C5, §4.C8). Not cached across calls here — caching lives at
    /// the `InverseReferenceSet` collection wrapper in application code;
    /// this is the session-level primitive it calls through.
    fn inverse_view(&mut self, id: ObjectId, prop_id: PropertyId) -> Result<Vec<ObjectId>> {
        let class = self.class(id.class_id())?;
        let prop = class.property(prop_id).ok_or(Error::InvalidObjectType(id.class_id()))?;
        let referrer_class = prop.target_class.ok_or(Error::InvalidObjectType(id.class_id()))?;
        let referring_property = self
            .model
            .referrers(id.class_id())
            .iter()
            .find(|r| r.referrer_class == referrer_class)
            .map(|r| r.property)
            .ok_or(Error::InvalidObjectType(id.class_id()))?;
        self.inverse_refs(id, referring_property)
    }

    /// The merged live set of referrers whose `referring_property` (declared
    /// on the referrer's own class) points at `id` (§4.C5).
    fn inverse_refs(&mut self, id: ObjectId, referring_property: PropertyId) -> Result<Vec<ObjectId>> {
        let committed = self
            .txn
            .0
            .lock()
            .unwrap()
            .get_inverse_references(id, referring_property)
            .map_err(|e| self.fail(e))?;
        Ok(self.delta_store.try_collect_changes(id, referring_property, &committed, &self.deleted_set))
    }

    /// `object.set(property, value)` (§4.C3 "Setters").
    pub fn set(&mut self, id: ObjectId, prop_id: PropertyId, value: PropertyValue) -> Result<()> {
        self.guard()?;
        if self.txn_kind == TransactionKind::Read {
            return Err(Error::ReadTranWriteAttempt(id));
        }
        {
            let cell = self.identity_map.get(&id).ok_or(Error::ObjectNotFound(id))?;
            let obj = cell.borrow();
            if obj.is_deleted() {
                return Err(Error::DeletedObjectAccess(id));
            }
            if obj.is_abandoned() {
                return Err(Error::AbandonedObjectAccess(id));
            }
        }

        let old_reference = {
            let cell = &self.identity_map[&id];
            let obj = cell.borrow();
            let prop = obj.class.property(prop_id).ok_or(Error::InvalidObjectType(id.class_id()))?;
            matches!(prop.kind, PropertyKind::Simple(SimpleKind::Reference)) && prop.track_inverse
        };
        let old_value = if old_reference { Some(self.get(id, prop_id)?) } else { None };

        self.object_modified(id);
        let class = self.identity_map[&id].borrow().class.clone();
        let prop = class.property(prop_id).ok_or(Error::InvalidObjectType(id.class_id()))?.clone();

        match prop.kind {
            PropertyKind::Simple(_) => {
                let mut cell = self.identity_map[&id].borrow_mut();
                let buf = cell.promote();
                record::write_simple(buf, &class, &prop, &value);
                record::set_bit(buf, &prop);
            }
            PropertyKind::Indirect(kind) => {
                let handle = self.write_indirect(&value, kind)?;
                let mut cell = self.identity_map[&id].borrow_mut();
                let buf = cell.promote();
                record::write_handle(buf, &class, &prop, handle);
                record::set_bit(buf, &prop);
            }
            PropertyKind::InverseReferenceSet => return Err(Error::InvalidObjectType(id.class_id())),
        }

        if prop.track_inverse {
            if let PropertyKind::Simple(SimpleKind::Reference) = prop.kind {
                if let PropertyValue::Reference(new_target) = value {
                    let old_target = match old_value {
                        Some(PropertyValue::Reference(t)) => t,
                        _ => ObjectId::NULL,
                    };
                    self.reference_modified(id, old_target, new_target, prop_id);
                }
            }
        }
        Ok(())
    }

    // ---- collection mutators (§9 Collections: list semantics beyond ------
    // ---- whole-value get/set) ---------------------------------------------

    fn property_delete_action(&self, id: ObjectId, prop_id: PropertyId) -> Result<DeleteAction> {
        let cell = self.identity_map.get(&id).ok_or(Error::ObjectNotFound(id))?;
        let obj = cell.borrow();
        let prop = obj.class.property(prop_id).ok_or(Error::InvalidObjectType(id.class_id()))?;
        Ok(prop.delete_action.unwrap_or(DeleteAction::SetToNull))
    }

    /// `array.contains(value)`.
    pub fn array_contains(&mut self, id: ObjectId, prop_id: PropertyId, value: &PropertyValue) -> Result<bool> {
        Ok(self.array_index_of(id, prop_id, value)?.is_some())
    }

    /// `array.index_of(value)`.
    pub fn array_index_of(&mut self, id: ObjectId, prop_id: PropertyId, value: &PropertyValue) -> Result<Option<usize>> {
        match (self.get(id, prop_id)?, value) {
            (PropertyValue::Array(a), scalar) => Ok(a.index_of(scalar)),
            (PropertyValue::ReferenceArray(ids), PropertyValue::Reference(target)) => {
                let delete_action = self.property_delete_action(id, prop_id)?;
                Ok(ReferenceArray::from_owned(ids, delete_action).index_of(*target))
            }
            _ => Err(Error::InvalidObjectType(id.class_id())),
        }
    }

    /// `array.add_range(values)`.
    pub fn array_add_range(&mut self, id: ObjectId, prop_id: PropertyId, values: PropertyValue) -> Result<()> {
        match (self.get(id, prop_id)?, values) {
            (PropertyValue::Array(mut a), PropertyValue::Array(extra)) => {
                if !a.add_range(extra) {
                    return Err(Error::InvalidObjectType(id.class_id()));
                }
                self.set(id, prop_id, PropertyValue::Array(a))
            }
            (PropertyValue::ReferenceArray(ids), PropertyValue::ReferenceArray(extra)) => {
                let mut arr = ReferenceArray::from_owned(ids, self.property_delete_action(id, prop_id)?);
                arr.add_range(extra);
                self.set(id, prop_id, PropertyValue::ReferenceArray(arr.ids().to_vec()))
            }
            _ => Err(Error::InvalidObjectType(id.class_id())),
        }
    }

    /// `array.remove(value)`: `true` if an element was removed.
    pub fn array_remove(&mut self, id: ObjectId, prop_id: PropertyId, value: &PropertyValue) -> Result<bool> {
        match (self.get(id, prop_id)?, value) {
            (PropertyValue::Array(mut a), scalar) => {
                let removed = a.remove(scalar);
                if removed {
                    self.set(id, prop_id, PropertyValue::Array(a))?;
                }
                Ok(removed)
            }
            (PropertyValue::ReferenceArray(ids), PropertyValue::Reference(target)) => {
                let mut arr = ReferenceArray::from_owned(ids, self.property_delete_action(id, prop_id)?);
                let removed = arr.remove(*target);
                if removed {
                    self.set(id, prop_id, PropertyValue::ReferenceArray(arr.ids().to_vec()))?;
                }
                Ok(removed)
            }
            _ => Err(Error::InvalidObjectType(id.class_id())),
        }
    }

    /// `array.remove_at(index)`.
    pub fn array_remove_at(&mut self, id: ObjectId, prop_id: PropertyId, index: usize) -> Result<()> {
        match self.get(id, prop_id)? {
            PropertyValue::Array(mut a) => {
                a.remove_at(index);
                self.set(id, prop_id, PropertyValue::Array(a))
            }
            PropertyValue::ReferenceArray(ids) => {
                if index >= ids.len() {
                    return Err(Error::InvalidObjectType(id.class_id()));
                }
                let mut arr = ReferenceArray::from_owned(ids, self.property_delete_action(id, prop_id)?);
                arr.remove_at(index);
                self.set(id, prop_id, PropertyValue::ReferenceArray(arr.ids().to_vec()))
            }
            _ => Err(Error::InvalidObjectType(id.class_id())),
        }
    }

    /// `array.clear()`.
    pub fn array_clear(&mut self, id: ObjectId, prop_id: PropertyId) -> Result<()> {
        match self.get(id, prop_id)? {
            PropertyValue::Array(mut a) => {
                a.clear();
                self.set(id, prop_id, PropertyValue::Array(a))
            }
            PropertyValue::ReferenceArray(_) => self.set(id, prop_id, PropertyValue::ReferenceArray(Vec::new())),
            _ => Err(Error::InvalidObjectType(id.class_id())),
        }
    }

    fn write_indirect(&mut self, value: &PropertyValue, kind: IndirectKind) -> Result<i64> {
        Ok(match (kind, value) {
            (IndirectKind::String, PropertyValue::String(s)) if s.is_empty() => 0,
            (IndirectKind::String, PropertyValue::String(s)) => record::session_handle(self.context.string_pool.push(s.clone())),
            (IndirectKind::Array(_), PropertyValue::Array(a)) if a.is_empty() => 0,
            (IndirectKind::Array(_), PropertyValue::Array(a)) => record::session_handle(self.context.array_pool.push(a.clone())),
            (IndirectKind::ReferenceArray, PropertyValue::ReferenceArray(v)) if v.is_empty() => 0,
            (IndirectKind::ReferenceArray, PropertyValue::ReferenceArray(v)) => {
                record::session_handle(self.context.ref_array_pool.push(v.clone()))
            }
            _ => return Err(Error::InvalidObjectType(0)),
        })
    }

    /// First-mutation promotion (§4.C6 "Modification"): copies the engine
    /// buffer into the session arena, appends to the change list, and
    /// transitions `Read -> Modified`. A no-op for anything already
    /// `Modified`/`Inserted`.
    fn object_modified(&mut self, id: ObjectId) {
        let (needs_add, class_id) = {
            let cell = &self.identity_map[&id];
            let mut obj = cell.borrow_mut();
            let was_dirty = obj.state.intersects(ObjectState::MODIFIED | ObjectState::INSERTED);
            if !was_dirty {
                obj.promote();
                obj.state.insert(ObjectState::MODIFIED);
            }
            (!was_dirty, obj.id.class_id())
        };
        if needs_add {
            self.context.change_list.add(id, class_id, ChangeKind::Updated);
        }
    }

    /// `reference_modified` (§4.C6 "Reference mutation tracking").
    fn reference_modified(&mut self, inverse_id: ObjectId, old_target: ObjectId, new_target: ObjectId, property_id: PropertyId) {
        if !old_target.is_null() {
            self.inverse_views.remove(&(old_target, property_id));
            self.delta_store.add(old_target, inverse_id, property_id, false);
        }
        if !new_target.is_null() {
            self.inverse_views.remove(&(new_target, property_id));
            self.delta_store.add(new_target, inverse_id, property_id, true);
        }
    }

    // ---- deletion / cascade -------------------------------------------------

    pub fn delete_object(&mut self, id: ObjectId, perform_cascade: bool) -> Result<()> {
        self.guard()?;
        self.delete_one(id);
        if perform_cascade {
            self.cascade_fixpoint(vec![id])?;
        }
        Ok(())
    }

    fn delete_one(&mut self, id: ObjectId) {
        let was_read_only = {
            let cell = self
                .identity_map
                .entry(id)
                .or_insert_with(|| RefCell::new(Object { id, class: self.model.class(id.class_id()).unwrap().clone(), buffer: Buffer::Session(Vec::new()), state: ObjectState::empty(), inverse_cache: Default::default(), last_observed_deleted_version: 0 }));
            let mut obj = cell.borrow_mut();
            let already_tracked = obj.state.intersects(ObjectState::MODIFIED | ObjectState::INSERTED | ObjectState::DELETED);
            obj.state.insert(ObjectState::DELETED);
            obj.invalidate_inverse_cache();
            !already_tracked && obj.state.contains(ObjectState::READ)
        };
        self.inverse_views.retain(|(target, _), _| *target != id);
        if was_read_only {
            self.context.change_list.add(id, id.class_id(), ChangeKind::Deleted);
        }
    }

    /// The cascade fixpoint (§4.C6), two alternating queues. Seed comes from
    /// `delete_object`'s single id.
    fn cascade_fixpoint(&mut self, seed: Vec<ObjectId>) -> Result<()> {
        let mut a = seed;
        let mut grew = false;

        loop {
            if a.is_empty() {
                break;
            }
            trace!("cascade fixpoint pass over {} ids", a.len());
            let mut b = Vec::new();
            let mut scan_classes: HashMap<ClassId, Vec<ScanEntry>> = HashMap::new();

            for id in &a {
                if self.deleted_set.add(*id) {
                    grew = true;
                }
                if let Some(cell) = self.identity_map.get(id) {
                    let mut obj = cell.borrow_mut();
                    if !obj.is_deleted() {
                        obj.state.insert(ObjectState::DELETED);
                    }
                }

                for referring in self.model.cascade_referrers(id.class_id()) {
                    // SetToNull edges never pull the referrer into the
                    // cascade; they're resolved later, in `apply_changes`'s
                    // refresh pass, by reading the slot back as null.
                    if referring.delete_action == DeleteAction::SetToNull {
                        continue;
                    }
                    if referring.track_inverse {
                        let live = self.inverse_refs(*id, referring.property)?;
                        if referring.delete_action == DeleteAction::PreventDelete {
                            if let Some(referrer) = live.first() {
                                self.disposed = true;
                                return Err(Error::PreventDeletedReferenced {
                                    target: *id,
                                    referrer: *referrer,
                                    property: referring.property,
                                });
                            }
                        } else {
                            b.extend(live);
                        }
                    } else {
                        scan_classes.entry(referring.referrer_class).or_default().push(ScanEntry {
                            referrer_class: referring.referrer_class,
                            property: referring.property,
                            delete_action: referring.delete_action,
                        });
                    }
                }
            }

            if !scan_classes.is_empty() {
                let targets: std::collections::HashSet<ObjectId> = a.iter().copied().collect();
                for (class_id, entries) in &scan_classes {
                    for row_id in self.for_each_object(*class_id)? {
                        let obj_class = self.class(row_id.class_id())?;
                        let buf = self.read_buffer(row_id)?;
                        for entry in entries {
                            let Some(prop) = obj_class.property(entry.property) else { continue };
                            let refers_to_target = match prop.kind {
                                PropertyKind::Simple(SimpleKind::Reference) => {
                                    matches!(record::read_simple(&buf, &obj_class, prop), PropertyValue::Reference(t) if targets.contains(&t))
                                }
                                PropertyKind::Indirect(kind @ IndirectKind::ReferenceArray) => {
                                    let handle = record::read_handle(&buf, &obj_class, prop);
                                    match self.resolve_indirect(handle, kind, prop.delete_action)? {
                                        PropertyValue::ReferenceArray(ids) => ids.iter().any(|t| targets.contains(t)),
                                        _ => false,
                                    }
                                }
                                _ => false,
                            };
                            if refers_to_target {
                                if entry.delete_action == DeleteAction::PreventDelete {
                                    self.disposed = true;
                                    return Err(Error::PreventDeletedReferenced {
                                        target: row_id,
                                        referrer: row_id,
                                        property: entry.property,
                                    });
                                }
                                b.push(row_id);
                            }
                        }
                    }
                }
            }

            a = b;
        }

        if grew {
            self.deleted_set.inc_version();
        }
        Ok(())
    }

    /// `for_each_object(class)` (§4.C6): engine scan (skipping identity-map
    /// and deleted-set hits already covered) plus the change-list segment.
    fn for_each_object(&mut self, class_id: ClassId) -> Result<Vec<ObjectId>> {
        let mut out = Vec::new();
        let rows: Vec<ObjectReader> = {
            let txn = self.txn.0.lock().unwrap();
            txn.begin_class_scan(std::slice::from_ref(&class_id))
                .map_err(|e| Error::EngineError(Box::new(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))))?
                .collect::<Result<Vec<_>>>()
                .map_err(|e| self.fail(e))?
        };
        for reader in rows {
            if self.deleted_set.contains(reader.id) {
                continue;
            }
            if let Some(cell) = self.identity_map.get(&reader.id) {
                if !cell.borrow().state.contains(ObjectState::READ) {
                    continue;
                }
            }
            out.push(reader.id);
        }
        for (id, kind) in self.context.change_list.iter_class(class_id) {
            if !matches!(kind, ChangeKind::Deleted) {
                out.push(id);
            }
        }
        Ok(out)
    }

    fn read_buffer(&self, id: ObjectId) -> Result<Vec<u8>> {
        if let Some(cell) = self.identity_map.get(&id) {
            return Ok(cell.borrow().buffer.bytes().to_vec());
        }
        let reader = self.txn.0.lock().unwrap().get_object(id)?.ok_or(Error::ObjectNotFound(id))?;
        Ok(reader.buffer.to_vec())
    }

    // ---- apply / commit / rollback / dispose ----------------------------

    /// `ApplyChanges` (§4.C6), non-commit variant (steps 1-6).
    pub fn apply_changes(&mut self) -> Result<()> {
        self.apply_changes_inner(false)
    }

    fn apply_changes_inner(&mut self, is_commit: bool) -> Result<()> {
        self.guard()?;
        if self.context.change_list.is_empty() && !self.deleted_set.has_deleted() {
            return Ok(()); // idempotence (§8): nothing to flush
        }
        debug!("applying changes, commit={is_commit}, {} touched", self.context.change_list.len());

        let mut writer = ChangesetWriter::new();
        let touched: Vec<(ObjectId, ClassId, ChangeKind)> = self.context.change_list.iter_all().collect();

        // Step 1: delete blocks for ids in the deleted set that weren't
        // also newly inserted this session (an insert-then-delete in the
        // same session never reaches the engine at all).
        let mut deleted_ids = Vec::new();
        self.deleted_set.for_each(|id| deleted_ids.push(id));
        for id in &deleted_ids {
            let newly_inserted = self
                .identity_map
                .get(id)
                .map(|c| c.borrow().state.contains(ObjectState::INSERTED))
                .unwrap_or(false);
            if !newly_inserted {
                writer.delete_block(id.class_id(), *id);
            }
        }

        // Step 2: insert/update blocks for every live touched entry.
        for (id, class_id, kind) in &touched {
            if matches!(kind, ChangeKind::Deleted) {
                continue;
            }
            let Some(cell) = self.identity_map.get(id) else { continue };
            let obj = cell.borrow();
            if obj.is_deleted() {
                continue;
            }
            let class = obj.class.clone();
            let (prop_ids, values) = self.emit_row(&obj, &class)?;
            drop(obj);
            match kind {
                ChangeKind::Inserted => writer.insert_block(*class_id, *id, &prop_ids, &values),
                ChangeKind::Updated => writer.update_block(*class_id, *id, &prop_ids, &values),
                ChangeKind::Deleted => unreachable!(),
            }
        }

        if !writer.is_empty() {
            let changeset = writer.finish();
            let txn = self.txn.0.lock().unwrap();
            txn.apply_changeset(changeset, true).map_err(|e| self.fail(e))?;
        }

        if !is_commit {
            // Step 4/5: refresh survivors and set-to-null-affected ids from
            // the engine's now-committed state.
            for (id, _, kind) in &touched {
                if matches!(kind, ChangeKind::Deleted) {
                    continue;
                }
                if self.deleted_set.contains(*id) {
                    continue;
                }
                self.refresh(*id)?;
            }
            // set-to-null affected rows: anything in the identity map whose
            // live SetToNull reference target is in the deleted set gets
            // refreshed too, so its cached buffer observes the null value.
            let affected: Vec<ObjectId> = self
                .identity_map
                .iter()
                .filter(|(id, cell)| {
                    !self.deleted_set.contains(**id) && !cell.borrow().is_deleted() && self.has_set_to_null_hit(**id)
                })
                .map(|(id, _)| *id)
                .collect();
            for id in affected {
                self.refresh(id)?;
            }

            // Step 6.
            self.deleted_set.clear();
            self.delta_store.clear();
            self.context.string_pool.clear();
            self.context.array_pool.clear();
            self.context.ref_array_pool.clear();
            self.context.change_list.clear();
            self.inverse_views.clear();
        }

        Ok(())
    }

    fn has_set_to_null_hit(&self, id: ObjectId) -> bool {
        let Some(cell) = self.identity_map.get(&id) else { return false };
        let obj = cell.borrow();
        obj.class.properties.iter().any(|p| {
            matches!(p.kind, PropertyKind::Simple(SimpleKind::Reference))
                && p.delete_action == Some(DeleteAction::SetToNull)
                && matches!(record::read_simple(obj.buffer.bytes(), &obj.class, p), PropertyValue::Reference(t) if self.deleted_set.contains(t))
        })
    }

    fn emit_row(&self, obj: &Object, class: &ClassDescriptor) -> Result<(Vec<PropertyId>, Vec<PropertyValue>)> {
        let insert = obj.state.contains(ObjectState::INSERTED);
        let mut prop_ids = Vec::new();
        let mut values = Vec::new();
        for prop in &class.properties {
            if matches!(prop.kind, PropertyKind::InverseReferenceSet) {
                continue;
            }
            if !insert && !record::bit_set(obj.buffer.bytes(), prop) {
                continue;
            }
            let value = match prop.kind {
                PropertyKind::Simple(SimpleKind::Reference) => {
                    let raw = record::read_simple(obj.buffer.bytes(), class, prop);
                    match (raw, prop.delete_action) {
                        (PropertyValue::Reference(t), Some(DeleteAction::SetToNull)) if self.deleted_set.contains(t) => {
                            PropertyValue::Reference(ObjectId::NULL)
                        }
                        (other, _) => other,
                    }
                }
                PropertyKind::Simple(_) => record::read_simple(obj.buffer.bytes(), class, prop),
                PropertyKind::Indirect(kind) => {
                    let handle = record::read_handle(obj.buffer.bytes(), class, prop);
                    self.resolve_indirect(handle, kind, prop.delete_action)?
                }
                PropertyKind::InverseReferenceSet => unreachable!(),
            };
            prop_ids.push(prop.id);
            values.push(value);
        }
        Ok((prop_ids, values))
    }

    fn refresh(&mut self, id: ObjectId) -> Result<()> {
        let reader = self.txn.0.lock().unwrap().get_object(id)?;
        if let (Some(cell), Some(reader)) = (self.identity_map.get(&id), reader) {
            let mut obj = cell.borrow_mut();
            obj.buffer = Buffer::Engine(reader.buffer);
            obj.state = ObjectState::READ;
            obj.invalidate_inverse_cache();
        }
        Ok(())
    }

    /// `Commit` (§4.C6): runs `ApplyChanges(is_commit=true)`, skipping
    /// steps 4-6, then commits and disposes.
    pub fn commit(mut self) -> Result<()> {
        self.apply_changes_inner(true)?;
        self.guard()?;
        let txn = Arc::try_unwrap(self.txn).ok().map(|t| t.0.into_inner().unwrap());
        self.disposed = true;
        if let Some(txn) = txn {
            txn.commit()?;
        }
        debug!("session committed");
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.guard()?;
        let txn = Arc::try_unwrap(self.txn).ok().map(|t| t.0.into_inner().unwrap());
        self.disposed = true;
        if let Some(txn) = txn {
            txn.rollback()?;
        }
        Ok(())
    }

    pub fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.identity_map.clear();
            warn!("session disposed without commit or rollback");
        }
    }
}

impl Drop for ObjectModel {
    fn drop(&mut self) {
        if !self.disposed {
            self.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_engine::MockEngine;
    use crate::schema::{ClassDef, ModelBuilder, PropertyDef};

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
    fn create_then_read_round_trips() {
        let model = model();
        let engine = MockEngine::new(model.clone());
        let mut session = ObjectModel::open(&engine, model.clone(), SessionConfig::default()).unwrap();

        let id = session.create_object(1).unwrap();
        session.set(id, 2, PropertyValue::Int(1200)).unwrap();
        session.set(id, 3, PropertyValue::String("Keystone".into())).unwrap();
        session.apply_changes().unwrap();

        assert_eq!(session.get(id, 2).unwrap(), PropertyValue::Int(1200));
        assert_eq!(session.get(id, 3).unwrap(), PropertyValue::String("Keystone".into()));
    }

    #[test]
    fn apply_changes_twice_is_idempotent() {
        let model = model();
        let engine = MockEngine::new(model.clone());
        let mut session = ObjectModel::open(&engine, model.clone(), SessionConfig::default()).unwrap();
        let id = session.create_object(1).unwrap();
        session.set(id, 2, PropertyValue::Int(1)).unwrap();
        session.apply_changes().unwrap();
        session.apply_changes().unwrap();
    }

    fn cascade_model(action: DeleteAction) -> Arc<Model> {
        Arc::new(
            ModelBuilder::new()
                .class(ClassDef::new(1, "B"))
                .class(ClassDef::new(2, "A").property(PropertyDef::reference("b", 1, action, true)))
                .build(),
        )
    }

    #[test]
    fn cascade_delete_reaches_referrers() {
        let model = cascade_model(DeleteAction::CascadeDelete);
        let engine = MockEngine::new(model.clone());
        let mut session = ObjectModel::open(&engine, model.clone(), SessionConfig::default()).unwrap();

        let b = session.create_object(1).unwrap();
        let a1 = session.create_object(2).unwrap();
        session.set(a1, 2, PropertyValue::Reference(b)).unwrap();
        session.apply_changes().unwrap();

        session.delete_object(b, true).unwrap();
        assert!(session.deleted_set.contains(b));
        assert!(session.deleted_set.contains(a1));
    }

    #[test]
    fn prevent_delete_disposes_session() {
        let model = cascade_model(DeleteAction::PreventDelete);
        let engine = MockEngine::new(model.clone());
        let mut session = ObjectModel::open(&engine, model.clone(), SessionConfig::default()).unwrap();

        let b = session.create_object(1).unwrap();
        let a = session.create_object(2).unwrap();
        session.set(a, 2, PropertyValue::Reference(b)).unwrap();
        session.apply_changes().unwrap();

        let err = session.delete_object(b, true).unwrap_err();
        assert!(matches!(err, Error::PreventDeletedReferenced { .. }));
        assert!(session.get_object(b).is_err());
    }

    fn reference_array_model(action: DeleteAction, track_inverse: bool) -> Arc<Model> {
        Arc::new(
            ModelBuilder::new()
                .class(ClassDef::new(1, "Post"))
                .class(ClassDef::new(2, "Blog").property(PropertyDef::reference_array("posts", 1, action, track_inverse)))
                .build(),
        )
    }

    #[test]
    fn reference_array_filters_set_to_null_targets_on_read() {
        let model = reference_array_model(DeleteAction::SetToNull, false);
        let engine = MockEngine::new(model.clone());
        let mut session = ObjectModel::open(&engine, model.clone(), SessionConfig::default()).unwrap();

        let post = session.create_object(1).unwrap();
        let blog = session.create_object(2).unwrap();
        session.set(blog, 2, PropertyValue::ReferenceArray(vec![post])).unwrap();
        session.apply_changes().unwrap();

        session.delete_object(post, true).unwrap();
        assert_eq!(session.get(blog, 2).unwrap(), PropertyValue::ReferenceArray(vec![]));
    }

    #[test]
    fn non_tracked_reference_array_cascades_delete() {
        let model = reference_array_model(DeleteAction::CascadeDelete, false);
        let engine = MockEngine::new(model.clone());
        let mut session = ObjectModel::open(&engine, model.clone(), SessionConfig::default()).unwrap();

        let post = session.create_object(1).unwrap();
        let blog = session.create_object(2).unwrap();
        session.set(blog, 2, PropertyValue::ReferenceArray(vec![post])).unwrap();
        session.apply_changes().unwrap();

        session.delete_object(post, true).unwrap();
        assert!(session.deleted_set.contains(post));
        assert!(session.deleted_set.contains(blog));
    }

    #[test]
    fn non_tracked_reference_array_prevents_delete() {
        let model = reference_array_model(DeleteAction::PreventDelete, false);
        let engine = MockEngine::new(model.clone());
        let mut session = ObjectModel::open(&engine, model.clone(), SessionConfig::default()).unwrap();

        let post = session.create_object(1).unwrap();
        let blog = session.create_object(2).unwrap();
        session.set(blog, 2, PropertyValue::ReferenceArray(vec![post])).unwrap();
        session.apply_changes().unwrap();

        let err = session.delete_object(post, true).unwrap_err();
        assert!(matches!(err, Error::PreventDeletedReferenced { .. }));
    }

    #[test]
    fn array_mutators_route_through_collections_wrappers() {
        let model = reference_array_model(DeleteAction::CascadeDelete, false);
        let engine = MockEngine::new(model.clone());
        let mut session = ObjectModel::open(&engine, model.clone(), SessionConfig::default()).unwrap();

        let p1 = session.create_object(1).unwrap();
        let p2 = session.create_object(1).unwrap();
        let blog = session.create_object(2).unwrap();
        session.set(blog, 2, PropertyValue::ReferenceArray(vec![p1])).unwrap();

        assert!(session.array_contains(blog, 2, &PropertyValue::Reference(p1)).unwrap());
        assert!(!session.array_contains(blog, 2, &PropertyValue::Reference(p2)).unwrap());

        session.array_add_range(blog, 2, PropertyValue::ReferenceArray(vec![p2])).unwrap();
        assert_eq!(session.array_index_of(blog, 2, &PropertyValue::Reference(p2)).unwrap(), Some(1));

        assert!(session.array_remove(blog, 2, &PropertyValue::Reference(p1)).unwrap());
        assert_eq!(session.get(blog, 2).unwrap(), PropertyValue::ReferenceArray(vec![p2]));

        session.array_clear(blog, 2).unwrap();
        assert_eq!(session.get(blog, 2).unwrap(), PropertyValue::ReferenceArray(vec![]));
    }

    #[test]
    fn context_is_returned_to_the_pool_and_reused() {
        let model = model();
        let engine = MockEngine::new(model.clone());
        let config = SessionConfig::default();
        {
            let mut session = ObjectModel::open(&engine, model.clone(), config.clone()).unwrap();
            let id = session.create_object(1).unwrap();
            session.set(id, 2, PropertyValue::Int(7)).unwrap();
        }
        // The dropped session's pooled context (with its stale change list)
        // must come back clean, not leak into the next session opened.
        let session = ObjectModel::open(&engine, model, config).unwrap();
        assert!(session.context.change_list.is_empty());
    }
}
