//! MemBackend - shared in-memory storage backend
//!
//! Implements the `Storage` contract over one shared state. Clones share
//! the state, so "reopening the same path" in a test is constructing a new
//! store over a clone of the backend.

use corestore_model::{
    Alias, CoreAuth, CoreInfo, CoreInfoStream, CoreKey, DiscoveryKey, DiscoveryKeyStream,
    KeyPair, Manifest, Namespace, Storage, StorageError,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// One persisted core.
pub(crate) struct StoredCore {
    pub key: CoreKey,
    pub manifest: Option<Manifest>,
    pub key_pair: Option<KeyPair>,
    pub blocks: BTreeMap<u64, Vec<u8>>,
    pub length: u64,
    pub user_data: HashMap<String, Vec<u8>>,
    /// Namespace the core was created under, for filtered listing.
    pub namespace: Option<Namespace>,
    pub version: u32,
}

struct BackendState {
    seed: Option<[u8; 32]>,
    cores: HashMap<String, StoredCore>,
    aliases: HashMap<Alias, DiscoveryKey>,
    suspended: bool,
    closed: bool,
}

/// In-memory storage backend. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemBackend {
    state: Arc<Mutex<BackendState>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                seed: None,
                cores: HashMap::new(),
                aliases: HashMap::new(),
                suspended: false,
                closed: false,
            })),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BackendState>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::Io("backend lock poisoned".to_string()))
    }

    fn usable(state: &BackendState) -> Result<(), StorageError> {
        if state.closed {
            return Err(StorageError::Closed);
        }
        if state.suspended {
            return Err(StorageError::Suspended);
        }
        Ok(())
    }

    // ==================== engine-facing accessors ====================

    pub(crate) fn with_core<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut StoredCore) -> R,
    ) -> Result<Option<R>, StorageError> {
        let mut state = self.lock()?;
        Self::usable(&state)?;
        Ok(state.cores.get_mut(id).map(f))
    }

    pub(crate) fn has_core(&self, id: &str) -> Result<bool, StorageError> {
        let state = self.lock()?;
        Self::usable(&state)?;
        Ok(state.cores.contains_key(id))
    }

    pub(crate) fn insert_core(&self, id: &str, core: StoredCore) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        Self::usable(&state)?;
        state.cores.insert(id.to_string(), core);
        Ok(())
    }

    pub(crate) fn insert_alias(
        &self,
        alias: Alias,
        discovery_key: DiscoveryKey,
    ) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        Self::usable(&state)?;
        state.aliases.insert(alias, discovery_key);
        Ok(())
    }

    /// A fresh handle over the same stored state, as if the same path were
    /// opened again after a close.
    pub fn reopen(&self) -> MemBackend {
        if let Ok(mut state) = self.state.lock() {
            state.closed = false;
            state.suspended = false;
        }
        self.clone()
    }

    /// Overwrite a stored core's key. Test hook for simulating storage
    /// corruption.
    pub fn corrupt_core_key(&self, discovery_key: &DiscoveryKey, key: CoreKey) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(core) = state.cores.get_mut(&discovery_key.to_string()) {
                core.key = key;
            }
        }
    }
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemBackend {
    async fn get_seed(&self) -> Result<Option<[u8; 32]>, StorageError> {
        let state = self.lock()?;
        Self::usable(&state)?;
        Ok(state.seed)
    }

    async fn set_seed(&self, seed: [u8; 32]) -> Result<[u8; 32], StorageError> {
        let mut state = self.lock()?;
        Self::usable(&state)?;
        // First writer wins; later writers observe the persisted seed.
        Ok(*state.seed.get_or_insert(seed))
    }

    async fn has(&self, discovery_key: &DiscoveryKey) -> Result<bool, StorageError> {
        self.has_core(&discovery_key.to_string())
    }

    async fn get_alias(&self, alias: &Alias) -> Result<Option<DiscoveryKey>, StorageError> {
        let state = self.lock()?;
        Self::usable(&state)?;
        Ok(state.aliases.get(alias).copied())
    }

    async fn put_alias(
        &self,
        alias: &Alias,
        discovery_key: &DiscoveryKey,
    ) -> Result<(), StorageError> {
        self.insert_alias(alias.clone(), *discovery_key)
    }

    async fn get_auth(&self, discovery_key: &DiscoveryKey) -> Result<Option<CoreAuth>, StorageError> {
        let state = self.lock()?;
        Self::usable(&state)?;
        Ok(state
            .cores
            .get(&discovery_key.to_string())
            .map(|core| CoreAuth {
                key: Some(core.key),
                discovery_key: *discovery_key,
                manifest: core.manifest.clone(),
                key_pair: core.key_pair.clone(),
            }))
    }

    fn create_core_stream(&self) -> CoreInfoStream {
        let infos: Vec<CoreInfo> = match self.state.lock() {
            Ok(state) => state
                .cores
                .iter()
                .filter_map(|(id, core)| {
                    DiscoveryKey::from_hex(id).ok().map(|discovery_key| CoreInfo {
                        discovery_key,
                        version: core.version,
                    })
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        Box::pin(tokio_stream::iter(infos))
    }

    fn create_discovery_key_stream(&self, namespace: Option<&Namespace>) -> DiscoveryKeyStream {
        let namespace = namespace.copied();
        let keys: Vec<DiscoveryKey> = match self.state.lock() {
            Ok(state) => state
                .cores
                .iter()
                .filter(|(_, core)| match namespace {
                    Some(ns) => core.namespace == Some(ns),
                    None => true,
                })
                .filter_map(|(id, _)| DiscoveryKey::from_hex(id).ok())
                .collect(),
            Err(_) => Vec::new(),
        };
        Box::pin(tokio_stream::iter(keys))
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let state = self.lock()?;
        Self::usable(&state)?;
        Ok(())
    }

    async fn suspend(&self) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(StorageError::Closed);
        }
        state.suspended = true;
        Ok(())
    }

    async fn resume(&self) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if state.closed {
            return Err(StorageError::Closed);
        }
        state.suspended = false;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.closed = true;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
