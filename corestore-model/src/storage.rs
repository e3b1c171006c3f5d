//! Storage contract
//!
//! The persistent backend corestore consumes: a seed slot, a per-discovery-
//! key auth directory, a `(name, namespace) -> discovery_key` alias table,
//! and lazy enumeration streams. The on-disk format belongs to the engine
//! vendor; corestore only routes through this interface.

use crate::manifest::{Alias, CoreAuth};
use crate::types::{DiscoveryKey, Namespace};
use async_trait::async_trait;
use futures_core::Stream;
use std::any::Any;
use std::pin::Pin;

/// Storage operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("storage is closed")]
    Closed,

    #[error("storage is suspended")]
    Suspended,

    #[error("io: {0}")]
    Io(String),
}

/// One persisted core, as reported by `create_core_stream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreInfo {
    pub discovery_key: DiscoveryKey,
    pub version: u32,
}

pub type CoreInfoStream = Pin<Box<dyn Stream<Item = CoreInfo> + Send>>;
pub type DiscoveryKeyStream = Pin<Box<dyn Stream<Item = DiscoveryKey> + Send>>;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the persisted master seed, if one was ever written.
    async fn get_seed(&self) -> Result<Option<[u8; 32]>, StorageError>;

    /// Persist the master seed. Returns the seed that is now on disk, which
    /// is the existing one if a concurrent writer got there first.
    async fn set_seed(&self, seed: [u8; 32]) -> Result<[u8; 32], StorageError>;

    /// Existence predicate for a core, by discovery key.
    async fn has(&self, discovery_key: &DiscoveryKey) -> Result<bool, StorageError>;

    async fn get_alias(&self, alias: &Alias) -> Result<Option<DiscoveryKey>, StorageError>;
    async fn put_alias(
        &self,
        alias: &Alias,
        discovery_key: &DiscoveryKey,
    ) -> Result<(), StorageError>;

    /// The persisted auth record for a core.
    async fn get_auth(&self, discovery_key: &DiscoveryKey) -> Result<Option<CoreAuth>, StorageError>;

    /// Lazily enumerate every persisted core. Finite; not restartable.
    fn create_core_stream(&self) -> CoreInfoStream;

    /// Lazily enumerate discovery keys, optionally filtered by the
    /// namespace the core was created under. Ordering is unspecified.
    fn create_discovery_key_stream(&self, namespace: Option<&Namespace>) -> DiscoveryKeyStream;

    async fn flush(&self) -> Result<(), StorageError>;
    async fn suspend(&self) -> Result<(), StorageError>;
    async fn resume(&self) -> Result<(), StorageError>;
    async fn close(&self) -> Result<(), StorageError>;

    /// Downcast hook for engines that need their concrete backend.
    fn as_any(&self) -> &dyn Any;
}
