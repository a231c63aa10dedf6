use thiserror::Error;

use driftnet_shared::{ContactId, GroupId, MessageId, TransportId};
use driftnet_store::StoreError;

/// Errors produced by the synchronization engine.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("no such contact: {0}")]
    NoSuchContact(ContactId),

    #[error("no such subscription: {0}")]
    NoSuchGroup(GroupId),

    #[error("no such message: {0}")]
    NoSuchMessage(MessageId),

    #[error("no such transport: {0}")]
    NoSuchTransport(TransportId),

    /// A peer sent a payload that violates a protocol limit.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Underlying store failure.  The transaction has been rolled back.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Wire serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Generic I/O error (e.g. spawning the cleaner thread).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Free space is below the critical threshold and nothing can be
    /// expired.  The cleaner treats this as fatal.
    #[error("message store critically full")]
    CriticalSpace,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DbError>;
