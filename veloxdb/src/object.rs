//! The entity wrapper (§3 "Entity wrapper") and the session-local value
//! pools backing session-owned indirect properties (§4.C8's "session string
//! pool" and its array/reference-array counterparts).

use std::sync::Arc;

use crate::ids::ObjectId;
use crate::schema::ClassDescriptor;

bitflags::bitflags! {
    /// The wrapper's flag set (§3). More than one bit can be set at once —
    /// e.g. an object can be both `Read` (it came from the engine) and later
    /// `Modified`, and `Selected` is an orthogonal scratch bit index readers
    /// use to avoid double-yielding a wrapper.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ObjectState: u8 {
        const READ = 1 << 0;
        const MODIFIED = 1 << 1;
        const DELETED = 1 << 2;
        const INSERTED = 1 << 3;
        const ABANDONED = 1 << 4;
        const NOT_CONSTRUCTED_FULLY = 1 << 5;
        const SELECTED = 1 << 6;
    }
}

/// Where a wrapper's record buffer currently lives.
pub enum Buffer {
    /// Clean, zero-copy view of the engine's committed bytes.
    Engine(Arc<[u8]>),
    /// Promoted on first mutation or on creation; owned by the session.
    Session(Vec<u8>),
}

impl Buffer {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Buffer::Engine(b) => b,
            Buffer::Session(b) => b,
        }
    }

    pub fn is_session_owned(&self) -> bool {
        matches!(self, Buffer::Session(_))
    }
}

/// One logical record (§3). At most one live wrapper exists per id within a
/// session — the identity map in `session.rs` enforces that.
pub struct Object {
    pub id: ObjectId,
    pub class: Arc<ClassDescriptor>,
    pub buffer: Buffer,
    pub state: ObjectState,
    /// Cached materialised `InverseReferenceSet` views, by property id.
    /// Invalidated by reference-mutation hooks and `ApplyChanges` refresh.
    pub inverse_cache: std::collections::HashMap<crate::ids::PropertyId, Vec<ObjectId>>,
    /// The deleted-set version this wrapper's `SetToNull` collection views
    /// were last filtered against (§4.C6).
    pub last_observed_deleted_version: u64,
}

impl Object {
    pub fn new_read(id: ObjectId, class: Arc<ClassDescriptor>, buffer: Arc<[u8]>) -> Self {
        Object {
            id,
            class,
            buffer: Buffer::Engine(buffer),
            state: ObjectState::READ,
            inverse_cache: std::collections::HashMap::new(),
            last_observed_deleted_version: 0,
        }
    }

    pub fn new_inserted(id: ObjectId, class: Arc<ClassDescriptor>, buffer: Vec<u8>) -> Self {
        Object {
            id,
            class,
            buffer: Buffer::Session(buffer),
            state: ObjectState::INSERTED,
            inverse_cache: std::collections::HashMap::new(),
            last_observed_deleted_version: 0,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.state.contains(ObjectState::DELETED)
    }

    pub fn is_abandoned(&self) -> bool {
        self.state.contains(ObjectState::ABANDONED)
    }

    /// Promotes the buffer to a session-owned copy if it isn't already one.
    /// Idempotent: a second call on an already-`Modified` wrapper is a
    /// cheap no-op at the session level (§4.C6 "subsequent mutations").
    pub fn promote(&mut self) -> &mut Vec<u8> {
        if let Buffer::Engine(bytes) = &self.buffer {
            self.buffer = Buffer::Session(bytes.to_vec());
        }
        match &mut self.buffer {
            Buffer::Session(v) => v,
            Buffer::Engine(_) => unreachable!(),
        }
    }

    pub fn invalidate_inverse_cache(&mut self) {
        self.inverse_cache.clear();
    }
}

/// A session-local value pool for one indirect property kind (strings,
/// typed arrays, or reference arrays), addressed by the negative handles
/// `record::session_handle` produces.
pub struct SessionPool<T> {
    values: Vec<T>,
    initial_capacity: usize,
}

impl<T> SessionPool<T> {
    pub fn new(initial_capacity: usize) -> Self {
        SessionPool { values: Vec::with_capacity(initial_capacity), initial_capacity }
    }

    pub fn push(&mut self, value: T) -> usize {
        self.values.push(value);
        self.values.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.values.get(index)
    }

    pub fn set(&mut self, index: usize, value: T) {
        self.values[index] = value;
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.values.shrink_to(self.initial_capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promote_copies_engine_buffer_once() {
        let class = Arc::new(crate::schema::ModelBuilder::new()
            .class(crate::schema::ClassDef::new(1, "X").property(crate::schema::PropertyDef::simple("v", crate::value::SimpleKind::Int)))
            .build()
            .class(1)
            .unwrap()
            .clone());
        let mut obj = Object::new_read(ObjectId::new(1, 1), class, Arc::from(vec![0u8; 32].into_boxed_slice()));
        assert!(!obj.buffer.is_session_owned());
        obj.promote();
        assert!(obj.buffer.is_session_owned());
    }

    #[test]
    fn pool_reuses_indices_via_session_handle_encoding() {
        let mut pool: SessionPool<String> = SessionPool::new(4);
        let idx = pool.push("hello".to_string());
        assert_eq!(crate::record::as_session_index(crate::record::session_handle(idx)), Some(idx));
        assert_eq!(pool.get(idx).unwrap(), "hello");
    }
}
