//! The storage-engine boundary (§6 "Inbound"). Everything here is an
//! interface the object model consumes; the engine itself — durability,
//! MVCC visibility, on-disk layout — is out of scope (§1). `mock_engine`
//! provides the only concrete implementation in this crate, for tests and
//! the `demos` binary.

use crate::error::Result;
use crate::ids::{ClassId, ObjectId, PropertyId};
use crate::value::{ArrayElementKind, ArrayValue, PropertyValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionKind {
    Read,
    ReadWrite,
}

/// The bytes of one committed (or session-pending, via the mock engine)
/// record, as read from the engine. An absent object is `Ok(None)` from
/// `Transaction::get_object`, not an empty reader.
#[derive(Clone)]
pub struct ObjectReader {
    pub id: ObjectId,
    pub buffer: std::sync::Arc<[u8]>,
}

/// A fully-built change, ready for `Transaction::apply_changeset`. Produced
/// by `changeset::ChangesetWriter`, consumed as an opaque byte blob by the
/// engine (§6 "Changeset block format").
#[derive(Clone, Default)]
pub struct Changeset {
    pub bytes: Vec<u8>,
}

/// One storage engine, able to mint transactions. Implementations are
/// expected to be cheaply cloneable handles (e.g. an `Arc` around shared
/// state), matching `Transaction`'s non-consuming read methods.
pub trait Engine: Send + Sync {
    fn create_transaction(&self, kind: TransactionKind) -> Result<Box<dyn Transaction>>;
}

/// One in-flight transaction. `commit`/`rollback` consume the boxed
/// transaction because neither can be meaningfully reused afterwards.
pub trait Transaction: Send {
    fn kind(&self) -> TransactionKind;

    fn object_exists(&self, class: ClassId, id: ObjectId) -> Result<bool>;

    /// `None` signals the object does not exist; the empty-reader encoding
    /// from §6 is collapsed into that at this boundary.
    fn get_object(&self, id: ObjectId) -> Result<Option<ObjectReader>>;

    /// Scans every concrete class in `classes` (the caller passes the
    /// model's resolved descendant set for polymorphic reads).
    fn begin_class_scan(&self, classes: &[ClassId]) -> Result<Box<dyn Iterator<Item = Result<ObjectReader>> + '_>>;

    /// The committed inverse references of `property` pointing at `id`, i.e.
    /// every object whose `property` currently holds (or array-contains)
    /// `id`. The delta store (§4.C5) adjusts this for session-local changes.
    fn get_inverse_references(&self, id: ObjectId, property: PropertyId) -> Result<Vec<ObjectId>>;

    /// Reserves `count` consecutive sequence numbers; returns the first.
    fn reserve_id_range(&self, count: u64) -> Result<u64>;

    fn apply_changeset(&self, changeset: Changeset, validate_refs: bool) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;

    fn resolve_string(&self, handle: u64) -> Result<String>;

    fn resolve_array(&self, handle: u64, element: ArrayElementKind) -> Result<ArrayValue>;

    fn resolve_ref_array(&self, handle: u64) -> Result<Vec<ObjectId>>;

    fn hash_index_lookup(&self, index: &str, class: ClassId, key: &[PropertyValue]) -> Result<Vec<ObjectId>>;

    fn sorted_index_scan(
        &self,
        index: &str,
        class: ClassId,
        low: Option<&[PropertyValue]>,
        high: Option<&[PropertyValue]>,
    ) -> Result<Vec<ObjectId>>;
}
