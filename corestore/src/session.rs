//! Sessions - user-held references to open cores
//!
//! A `Session` participates in its core's reference count: the core goes
//! idle (and becomes a GC candidate) when its last session closes. The
//! `SessionTracker` keeps the per-core lists of outstanding sessions so a
//! closing store can tear its own sessions down.

use crate::error::StoreError;
use corestore_model::{
    AuditOptions, AuditStats, Core, CoreKey, DiscoveryKey, EncryptionOptions, KeyPair, Manifest,
    PeerToken, ReadOptions, Replicator,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Async preload producing late identity/encryption overrides for a `get`.
pub type Preload = Pin<Box<dyn Future<Output = PreloadOptions> + Send + Sync>>;

/// Overrides a preload may supply.
#[derive(Debug, Clone, Default)]
pub struct PreloadOptions {
    pub key: Option<CoreKey>,
    pub key_pair: Option<KeyPair>,
    pub manifest: Option<Manifest>,
    pub encryption: Option<EncryptionOptions>,
}

/// Options for `Corestore::get`.
///
/// Exactly one identity source is required: `name`, `key_pair`, `manifest`,
/// `key`, `discovery_key`, or a `preload` that supplies one.
pub struct GetOptions {
    pub name: Option<String>,
    pub key: Option<CoreKey>,
    pub key_pair: Option<KeyPair>,
    pub manifest: Option<Manifest>,
    pub discovery_key: Option<DiscoveryKey>,
    pub preload: Option<Preload>,
    /// Participates in download-driven replication attachment.
    pub active: bool,
    /// Inherited from the owning store unless set.
    pub writable: Option<bool>,
    /// Serialize writable opens of this core behind a per-core lock.
    pub exclusive: bool,
    /// Reads wait for the network when a block is missing locally.
    pub wait: bool,
    /// Per-read bound; `None` disables.
    pub timeout: Option<Duration>,
    /// The session may append without persisting.
    pub draft: bool,
    /// When false, a core absent from storage fails instead of being created.
    pub create_if_missing: bool,
    pub encryption: EncryptionOptions,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            name: None,
            key: None,
            key_pair: None,
            manifest: None,
            discovery_key: None,
            preload: None,
            active: true,
            writable: None,
            exclusive: false,
            wait: true,
            timeout: None,
            draft: false,
            create_if_missing: true,
            encryption: EncryptionOptions::default(),
        }
    }
}

impl GetOptions {
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn key(key: CoreKey) -> Self {
        Self {
            key: Some(key),
            ..Self::default()
        }
    }

    pub fn key_pair(key_pair: KeyPair) -> Self {
        Self {
            key_pair: Some(key_pair),
            ..Self::default()
        }
    }

    pub fn manifest(manifest: Manifest) -> Self {
        Self {
            manifest: Some(manifest),
            ..Self::default()
        }
    }

    pub fn discovery_key(discovery_key: DiscoveryKey) -> Self {
        Self {
            discovery_key: Some(discovery_key),
            ..Self::default()
        }
    }

    pub fn preload(preload: Preload) -> Self {
        Self {
            preload: Some(preload),
            ..Self::default()
        }
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = Some(writable);
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn draft(mut self, draft: bool) -> Self {
        self.draft = draft;
        self
    }

    pub fn create_if_missing(mut self, create_if_missing: bool) -> Self {
        self.create_if_missing = create_if_missing;
        self
    }

    pub fn encryption(mut self, encryption: EncryptionOptions) -> Self {
        self.encryption = encryption;
        self
    }
}

impl std::fmt::Debug for GetOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetOptions")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("discovery_key", &self.discovery_key)
            .field("has_preload", &self.preload.is_some())
            .field("active", &self.active)
            .field("exclusive", &self.exclusive)
            .finish_non_exhaustive()
    }
}

/// Resolved per-session configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub active: bool,
    pub writable: bool,
    pub exclusive: bool,
    pub wait: bool,
    pub timeout: Option<Duration>,
    pub draft: bool,
}

pub(crate) struct SessionInner {
    id: String,
    core: Arc<dyn Core>,
    config: SessionConfig,
    tracker: std::sync::Weak<SessionTracker>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    exclusive_guard: Mutex<Option<tokio::sync::OwnedMutexGuard<()>>>,
    peer_token: Mutex<Option<PeerToken>>,
}

impl SessionInner {
    pub(crate) async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Release in acquisition order: peer token, exclusive lock, core ref.
        if let Ok(mut token) = self.peer_token.lock() {
            if let Some(mut token) = token.take() {
                token.release();
            }
        }
        if let Ok(mut guard) = self.exclusive_guard.lock() {
            guard.take();
        }
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.remove(&self.id, self);
        }
        self.core.release();
        let _ = self.closed_tx.send(true);
        debug!(core = %self.id, "session closed");
    }

    pub(crate) fn attach_peer_token(&self) {
        let Ok(mut token) = self.peer_token.lock() else { return };
        if token.is_none() && !self.closed.load(Ordering::SeqCst) {
            *token = Some(self.core.finding_peers());
        }
    }

    pub(crate) fn release_peer_token(&self) {
        let Ok(mut token) = self.peer_token.lock() else { return };
        if let Some(mut token) = token.take() {
            token.release();
        }
    }
}

/// A user-visible handle on one open core.
///
/// Dropping a session without closing it leaks its core reference until the
/// owning store closes; call `close()`.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        core: Arc<dyn Core>,
        config: SessionConfig,
        tracker: &Arc<SessionTracker>,
        exclusive_guard: Option<tokio::sync::OwnedMutexGuard<()>>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new(SessionInner {
            id,
            core,
            config,
            tracker: Arc::downgrade(tracker),
            closed: AtomicBool::new(false),
            closed_tx,
            exclusive_guard: Mutex::new(exclusive_guard),
            peer_token: Mutex::new(None),
        });
        tracker.register(inner.clone());
        Session { inner }
    }

    pub fn key(&self) -> CoreKey {
        self.inner.core.key()
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        self.inner.core.discovery_key()
    }

    pub fn manifest(&self) -> Option<Manifest> {
        self.inner.core.manifest()
    }

    pub fn key_pair(&self) -> Option<KeyPair> {
        self.inner.core.key_pair()
    }

    pub fn length(&self) -> u64 {
        self.inner.core.length()
    }

    pub fn writable(&self) -> bool {
        self.inner.config.writable && self.inner.core.writable()
    }

    pub fn is_active(&self) -> bool {
        self.inner.config.active
    }

    pub fn is_exclusive(&self) -> bool {
        self.inner.config.exclusive
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves when the session closes. Fires exactly once.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub async fn append(&self, blocks: Vec<Vec<u8>>) -> Result<u64, StoreError> {
        if self.is_closed() {
            return Err(StoreError::StoreClosed);
        }
        if !self.writable() {
            return Err(StoreError::InvalidInput(
                "session is not writable".to_string(),
            ));
        }
        Ok(self.inner.core.append(blocks).await?)
    }

    pub async fn get(&self, index: u64) -> Result<Option<Vec<u8>>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::StoreClosed);
        }
        let opts = ReadOptions {
            wait: self.inner.config.wait,
            timeout: self.inner.config.timeout,
        };
        Ok(self.inner.core.get(index, opts).await?)
    }

    pub async fn get_user_data(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.core.get_user_data(key).await?)
    }

    pub async fn set_user_data(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::StoreClosed);
        }
        Ok(self.inner.core.set_user_data(key, value).await?)
    }

    pub async fn audit(&self, opts: AuditOptions) -> Result<AuditStats, StoreError> {
        Ok(self.inner.core.audit(opts).await?)
    }

    pub async fn close(&self) {
        self.inner.close().await;
    }

    pub(crate) fn attach_peer_token(&self) {
        self.inner.attach_peer_token();
    }

    pub(crate) fn core(&self) -> Arc<dyn Core> {
        self.inner.core.clone()
    }

    pub(crate) fn replicator(&self) -> Arc<dyn Replicator> {
        self.inner.core.replicator()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("core", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Per-core lists of outstanding sessions for one store.
pub(crate) struct SessionTracker {
    sessions: Mutex<HashMap<String, Vec<Arc<SessionInner>>>>,
}

impl SessionTracker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn register(&self, session: Arc<SessionInner>) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions
                .entry(session.id.clone())
                .or_default()
                .push(session);
        }
    }

    fn remove(&self, id: &str, session: &SessionInner) {
        let Ok(mut sessions) = self.sessions.lock() else { return };
        if let Some(list) = sessions.get_mut(id) {
            list.retain(|s| !std::ptr::eq(s.as_ref(), session));
            // Empty lists are dropped eagerly.
            if list.is_empty() {
                sessions.remove(id);
            }
        }
    }

    /// Every live session across every core, in registration order per core.
    pub(crate) fn all(&self) -> Vec<Arc<SessionInner>> {
        self.sessions
            .lock()
            .map(|sessions| sessions.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn take_all(&self) -> Vec<Arc<SessionInner>> {
        self.sessions
            .lock()
            .map(|mut sessions| sessions.drain().flat_map(|(_, list)| list).collect())
            .unwrap_or_default()
    }
}
