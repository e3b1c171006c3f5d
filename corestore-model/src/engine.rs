//! Core engine contract
//!
//! Corestore consumes an append-log engine; it never implements one. The
//! traits here are the seam: `CoreEngine` mints cores and protocol streams,
//! `Core` is one open log, `Replicator` is the core's per-peer attachment
//! surface. All trait objects are shared behind `Arc`.

use crate::manifest::{Alias, CoreAuth, Manifest};
use crate::protocol::{Muxer, ProtocolStream};
use crate::storage::Storage;
use crate::types::{CoreKey, DiscoveryKey, KeyPair};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Installed on a core so the registry hears about the last session closing.
pub type IdleHook = Arc<dyn Fn() + Send + Sync>;

/// Fires on the false-to-true edge of the replicator's downloading flag.
pub type DownloadingHook = Arc<dyn Fn() + Send + Sync>;

/// A grace token held while the application is still discovering peers.
///
/// While any token is outstanding, reads on the core wait for at least one
/// peer-discovery attempt before declaring "no peers". Only the first
/// `release` has an effect; dropping an unreleased token releases it.
pub struct PeerToken {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl PeerToken {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self { release: Some(Box::new(release)) }
    }

    /// A token with no engine-side effect.
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for PeerToken {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PeerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerToken")
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Per-read options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOptions {
    /// Wait for the network when the block is not available locally.
    pub wait: bool,
    /// Bound on a single read; `None` disables.
    pub timeout: Option<Duration>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self { wait: true, timeout: None }
    }
}

/// Encryption pass-throughs. Opaque to corestore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionOptions {
    pub key: Option<[u8; 32]>,
    pub is_block_key: bool,
}

/// Options for `CoreEngine::create`.
#[derive(Debug, Clone)]
pub struct CoreOptions {
    pub discovery_key: DiscoveryKey,
    pub key: Option<CoreKey>,
    pub key_pair: Option<KeyPair>,
    pub manifest: Option<Manifest>,
    pub create_if_missing: bool,
    pub overwrite: bool,
    pub force: bool,
    pub draft: bool,
    /// Registered with the storage backend's alias table on creation.
    pub alias: Option<Alias>,
    /// User-data entries written on creation.
    pub user_data: Vec<(String, Vec<u8>)>,
    pub encryption: EncryptionOptions,
}

impl CoreOptions {
    pub fn new(discovery_key: DiscoveryKey) -> Self {
        Self {
            discovery_key,
            key: None,
            key_pair: None,
            manifest: None,
            create_if_missing: true,
            overwrite: false,
            force: false,
            draft: false,
            alias: None,
            user_data: Vec::new(),
            encryption: EncryptionOptions::default(),
        }
    }

    pub fn with_auth(mut self, auth: &CoreAuth) -> Self {
        self.key = auth.key;
        self.key_pair = auth.key_pair.clone();
        self.manifest = auth.manifest.clone();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditOptions {
    /// Report corrections without applying them.
    pub dry_run: bool,
}

/// Result of auditing one core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditStats {
    pub blocks_checked: u64,
    pub blocks_dropped: u64,
    pub tree_nodes_dropped: u64,
    pub bits_cleared: u64,
}

/// Errors surfaced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("core is closed")]
    Closed,

    #[error("core not found in storage")]
    StorageEmpty,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("read timed out")]
    Timeout,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("engine failure: {0}")]
    Other(String),
}

/// One open append-only log.
#[async_trait]
pub trait Core: Send + Sync {
    fn key(&self) -> CoreKey;
    fn discovery_key(&self) -> DiscoveryKey;
    fn manifest(&self) -> Option<Manifest>;
    fn key_pair(&self) -> Option<KeyPair>;
    fn writable(&self) -> bool;
    fn length(&self) -> u64;

    async fn ready(&self) -> Result<(), EngineError>;
    async fn close(&self) -> Result<(), EngineError>;
    fn is_closed(&self) -> bool;

    /// Upgrade a read-only core with signing material.
    async fn set_key_pair(&self, key_pair: KeyPair) -> Result<(), EngineError>;

    async fn append(&self, blocks: Vec<Vec<u8>>) -> Result<u64, EngineError>;
    async fn get(&self, index: u64, opts: ReadOptions) -> Result<Option<Vec<u8>>, EngineError>;

    async fn get_user_data(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError>;
    async fn set_user_data(&self, key: &str, value: &[u8]) -> Result<(), EngineError>;

    /// Session reference counting. `release` after the count reaches zero
    /// fires the installed idle hook.
    fn retain(&self);
    fn release(&self);
    /// True while no session (user or replicator) holds the core.
    fn is_idle(&self) -> bool;
    fn set_on_idle(&self, hook: Option<IdleHook>);

    /// Register a peer-discovery grace token.
    fn finding_peers(&self) -> PeerToken;

    fn replicator(&self) -> Arc<dyn Replicator>;

    async fn audit(&self, opts: AuditOptions) -> Result<AuditStats, EngineError>;
}

/// A core's replication attachment surface.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// True while any active session wants this core replicated.
    fn downloading(&self) -> bool;
    fn set_downloading(&self, downloading: bool);
    fn set_on_downloading(&self, hook: Option<DownloadingHook>);

    fn attached(&self, muxer: &dyn Muxer) -> bool;
    /// Attach the core to a peer muxer. Holds a replicator session on the
    /// core until the muxer detaches.
    async fn attach_to(&self, muxer: Arc<dyn Muxer>) -> Result<(), EngineError>;
}

/// The engine factory consumed by corestore.
#[async_trait]
pub trait CoreEngine: Send + Sync {
    /// Derive a core key from its manifest.
    fn key(&self, manifest: &Manifest) -> CoreKey;

    /// Derive the discovery key for a core key.
    fn discovery_key(&self, key: &CoreKey) -> DiscoveryKey;

    async fn create(
        &self,
        storage: Arc<dyn Storage>,
        opts: CoreOptions,
    ) -> Result<Arc<dyn Core>, EngineError>;

    fn create_protocol_stream(&self, initiator: bool) -> Arc<dyn ProtocolStream>;
}
