//! Error types for the object model session.

use thiserror::Error;

use crate::ids::{ClassId, ObjectId, PropertyId};

/// Errors raised by the object model. Most are recoverable: the session that
/// raised them stays usable. A few (see [`Error::is_critical`]) force the
/// session into the disposed state before they are returned.
#[derive(Debug, Error)]
pub enum Error {
    #[error("class {0} is unknown or abstract and cannot be instantiated")]
    InvalidObjectType(ClassId),

    #[error("operation attempted on a disposed session")]
    ObjectDisposed,

    #[error("session accessed from thread {actual:?}, owned by thread {owner:?}")]
    WrongThread {
        owner: std::thread::ThreadId,
        actual: std::thread::ThreadId,
    },

    #[error("object {0:?} was deleted earlier in this session")]
    DeletedObjectAccess(ObjectId),

    #[error("object {0:?} was abandoned and can no longer be accessed")]
    AbandonedObjectAccess(ObjectId),

    #[error("attempted to mutate object {0:?} inside a read-only transaction")]
    ReadTranWriteAttempt(ObjectId),

    #[error("object {object:?} requested by id was not found")]
    ObjectNotFound(ObjectId),

    #[error("cannot delete {target:?}: referenced by {referrer:?}.{property:?} with PreventDelete")]
    PreventDeletedReferenced {
        target: ObjectId,
        referrer: ObjectId,
        property: PropertyId,
    },

    #[error("id range allocator exhausted: {0}")]
    IdExhausted(String),

    #[error("object {0:?} belongs to a different session")]
    CrossModelReference(ObjectId),

    #[error("critical engine error, session disposed: {0}")]
    CriticalEngineError(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("engine error: {0}")]
    EngineError(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Errors that leave the session permanently disposed. The session must
    /// mark itself disposed *before* returning one of these (§7 propagation
    /// policy), so callers never observe a live session after seeing one.
    pub fn is_critical(&self) -> bool {
        matches!(self, Error::PreventDeletedReferenced { .. } | Error::CriticalEngineError(_))
    }

    /// Wraps an opaque engine-side failure, classifying it as critical unless
    /// the engine itself says it was a recoverable condition.
    pub fn from_engine<E>(err: E, recoverable: bool) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if recoverable {
            Error::EngineError(Box::new(err))
        } else {
            Error::CriticalEngineError(Box::new(err))
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
