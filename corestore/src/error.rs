//! Store errors

use corestore_model::{EngineError, StorageError};

/// Errors surfaced by store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no identity supplied: expected one of name, key pair, manifest, key or discovery key")]
    MissingIdentity,

    #[error("store is closed")]
    StoreClosed,

    #[error("supplied primary key conflicts with the seed persisted in storage")]
    ConflictingSeed,

    #[error("stored core key does not match the key derived for name {name:?}")]
    StoredKeyMismatch { name: String },

    #[error("core not found in storage")]
    StorageEmpty,

    #[error("exclusive session wait cancelled: store closed")]
    ExclusiveWaitCancelled,

    #[error("lock poisoned")]
    LockPoisoned,

    #[error("engine failure: {0}")]
    Engine(EngineError),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl From<EngineError> for StoreError {
    fn from(err: EngineError) -> Self {
        match err {
            // The engine reports an absent core the same way the resolver's
            // pre-check does.
            EngineError::StorageEmpty => StoreError::StorageEmpty,
            other => StoreError::Engine(other),
        }
    }
}
