//! MockCore - an in-memory append-only log
//!
//! Functional enough for lifecycle and replication tests: blocks persist in
//! the shared backend, sessions are reference counted with an idle hook on
//! the last release, and missing blocks are requested from attached peer
//! streams and ingested when a response arrives.

use crate::backend::{MemBackend, StoredCore};
use crate::stream::{SimMuxer, SimStreamInner, WireMessage};
use corestore_model::{
    AuditOptions, AuditStats, Core, CoreKey, CoreOptions, DiscoveryKey, DownloadingHook,
    EngineError, IdleHook, KeyPair, Manifest, Muxer, Namespace, PeerToken, ReadOptions,
    Replicator, StorageError,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, Notify};
use tracing::debug;

fn storage_err(err: StorageError) -> EngineError {
    match err {
        StorageError::Closed => EngineError::Closed,
        other => EngineError::Storage(other.to_string()),
    }
}

struct FindingPeersState {
    count: AtomicUsize,
    notify: Notify,
}

pub struct MockCore {
    backend: MemBackend,
    id: String,
    discovery_key: DiscoveryKey,
    key: CoreKey,
    manifest: Mutex<Option<Manifest>>,
    key_pair: Mutex<Option<KeyPair>>,
    sessions: AtomicUsize,
    on_idle: Mutex<Option<IdleHook>>,
    closed: AtomicBool,
    finding: Arc<FindingPeersState>,
    /// Fires with an index whenever a block becomes available locally.
    block_tx: broadcast::Sender<u64>,
    /// Indices readers are currently waiting on.
    wanted: Mutex<HashSet<u64>>,
    replicator: Arc<MockReplicator>,
}

impl MockCore {
    pub(crate) fn create(
        backend: MemBackend,
        opts: CoreOptions,
    ) -> Result<Arc<MockCore>, EngineError> {
        let id = opts.discovery_key.to_string();
        let exists = backend.has_core(&id).map_err(storage_err)?;

        if !exists {
            if !opts.create_if_missing {
                return Err(EngineError::StorageEmpty);
            }
            let Some(key) = opts.key else {
                return Err(EngineError::InvalidInput(
                    "cannot create a core from a discovery key alone".to_string(),
                ));
            };
            let namespace = namespace_from_user_data(&opts.user_data);
            let version = opts.manifest.as_ref().map(|m| m.version).unwrap_or(1);
            backend
                .insert_core(
                    &id,
                    StoredCore {
                        key,
                        manifest: opts.manifest.clone(),
                        key_pair: opts.key_pair.clone(),
                        blocks: BTreeMap::new(),
                        length: 0,
                        user_data: opts.user_data.iter().cloned().collect(),
                        namespace,
                        version,
                    },
                )
                .map_err(storage_err)?;
            debug!(core = %id, "created core");
        } else {
            // Adopt late-arriving auth material and user data, but never
            // overwrite the stored key.
            backend
                .with_core(&id, |core| {
                    if core.key_pair.is_none() && opts.key == Some(core.key) {
                        core.key_pair = opts.key_pair.clone();
                    }
                    if core.manifest.is_none() {
                        core.manifest = opts.manifest.clone();
                    }
                    for (key, value) in &opts.user_data {
                        core.user_data.insert(key.clone(), value.clone());
                    }
                    if core.namespace.is_none() {
                        core.namespace = namespace_from_user_data(&opts.user_data);
                    }
                })
                .map_err(storage_err)?;
        }
        if let Some(alias) = &opts.alias {
            backend
                .insert_alias(alias.clone(), opts.discovery_key)
                .map_err(storage_err)?;
        }

        let stored = backend
            .with_core(&id, |core| {
                (core.key, core.manifest.clone(), core.key_pair.clone())
            })
            .map_err(storage_err)?;
        let Some((key, manifest, key_pair)) = stored else {
            return Err(EngineError::StorageEmpty);
        };

        let (block_tx, _) = broadcast::channel(256);
        Ok(Arc::new_cyclic(|weak: &Weak<MockCore>| MockCore {
            backend,
            id,
            discovery_key: opts.discovery_key,
            key,
            manifest: Mutex::new(manifest),
            key_pair: Mutex::new(key_pair),
            sessions: AtomicUsize::new(0),
            on_idle: Mutex::new(None),
            closed: AtomicBool::new(false),
            finding: Arc::new(FindingPeersState {
                count: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
            block_tx,
            wanted: Mutex::new(HashSet::new()),
            replicator: Arc::new(MockReplicator::new(weak.clone())),
        }))
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    fn local_block(&self, index: u64) -> Result<Option<Vec<u8>>, EngineError> {
        self.backend
            .with_core(&self.id, |core| core.blocks.get(&index).cloned())
            .map_err(storage_err)
            .map(|found| found.flatten())
    }

    /// Serve a block to a peer; local data only.
    pub(crate) fn serve_block(&self, index: u64) -> Option<Vec<u8>> {
        if self.is_closed() {
            return None;
        }
        self.local_block(index).ok().flatten()
    }

    /// Store a block received from a peer and wake waiting readers.
    pub(crate) fn ingest_block(&self, index: u64, block: Vec<u8>) {
        if self.is_closed() {
            return;
        }
        let stored = self
            .backend
            .with_core(&self.id, |core| {
                core.blocks.entry(index).or_insert(block);
                if core.length <= index {
                    core.length = index + 1;
                }
            })
            .is_ok();
        if stored {
            if let Ok(mut wanted) = self.wanted.lock() {
                wanted.remove(&index);
            }
            let _ = self.block_tx.send(index);
        }
    }

    pub(crate) fn wanted_snapshot(&self) -> Vec<u64> {
        self.wanted
            .lock()
            .map(|wanted| wanted.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn mock_replicator(&self) -> Arc<MockReplicator> {
        self.replicator.clone()
    }
}

fn namespace_from_user_data(user_data: &[(String, Vec<u8>)]) -> Option<Namespace> {
    user_data
        .iter()
        .find(|(key, _)| key == "corestore/namespace")
        .and_then(|(_, value)| Namespace::try_from(value.clone()).ok())
}

#[async_trait]
impl Core for MockCore {
    fn key(&self) -> CoreKey {
        self.key
    }

    fn discovery_key(&self) -> DiscoveryKey {
        self.discovery_key
    }

    fn manifest(&self) -> Option<Manifest> {
        self.manifest.lock().ok().and_then(|m| m.clone())
    }

    fn key_pair(&self) -> Option<KeyPair> {
        self.key_pair.lock().ok().and_then(|kp| kp.clone())
    }

    fn writable(&self) -> bool {
        self.key_pair
            .lock()
            .ok()
            .and_then(|kp| kp.as_ref().map(|kp| kp.is_writable()))
            .unwrap_or(false)
    }

    fn length(&self) -> u64 {
        self.backend
            .with_core(&self.id, |core| core.length)
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    async fn ready(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.replicator.detach_all();
        // Wake any readers blocked on the network.
        let _ = self.block_tx.send(u64::MAX);
        debug!(core = %self.id, "core closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn set_key_pair(&self, key_pair: KeyPair) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        self.backend
            .with_core(&self.id, |core| {
                core.key_pair = Some(key_pair.clone());
            })
            .map_err(storage_err)?;
        if let Ok(mut stored) = self.key_pair.lock() {
            *stored = Some(key_pair);
        }
        Ok(())
    }

    async fn append(&self, blocks: Vec<Vec<u8>>) -> Result<u64, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        if !self.writable() {
            return Err(EngineError::InvalidInput(
                "core is not writable".to_string(),
            ));
        }
        let appended = self
            .backend
            .with_core(&self.id, |core| {
                let start = core.length;
                for block in &blocks {
                    core.blocks.insert(core.length, block.clone());
                    core.length += 1;
                }
                (start, core.length)
            })
            .map_err(storage_err)?;
        let Some((start, length)) = appended else {
            return Err(EngineError::StorageEmpty);
        };
        for index in start..length {
            let _ = self.block_tx.send(index);
        }
        self.replicator.broadcast_have(length);
        Ok(length)
    }

    async fn get(&self, index: u64, opts: ReadOptions) -> Result<Option<Vec<u8>>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        let deadline = opts.timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        loop {
            // Subscribe before the local check so an ingest between the two
            // still wakes the wait below.
            let mut block_rx = self.block_tx.subscribe();
            if let Some(block) = self.local_block(index)? {
                return Ok(Some(block));
            }
            if self.is_closed() {
                return Err(EngineError::Closed);
            }
            let finding = self.finding.count.load(Ordering::SeqCst) > 0;
            if !opts.wait && !finding {
                return Ok(None);
            }
            if opts.wait {
                if let Ok(mut wanted) = self.wanted.lock() {
                    wanted.insert(index);
                }
                self.replicator.request_block(index);
            }
            let wait = async {
                if opts.wait {
                    let _ = block_rx.recv().await;
                } else {
                    tokio::select! {
                        _ = block_rx.recv() => {}
                        _ = self.finding.notify.notified() => {}
                    }
                }
            };
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, wait).await.is_err() {
                        if let Ok(mut wanted) = self.wanted.lock() {
                            wanted.remove(&index);
                        }
                        return Err(EngineError::Timeout);
                    }
                }
                None => wait.await,
            }
            if !opts.wait
                && self.finding.count.load(Ordering::SeqCst) == 0
                && self.local_block(index)?.is_none()
            {
                // The discovery window elapsed without the block arriving.
                return Ok(None);
            }
        }
    }

    async fn get_user_data(&self, key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        self.backend
            .with_core(&self.id, |core| core.user_data.get(key).cloned())
            .map_err(storage_err)
            .map(|found| found.flatten())
    }

    async fn set_user_data(&self, key: &str, value: &[u8]) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        self.backend
            .with_core(&self.id, |core| {
                core.user_data.insert(key.to_string(), value.to_vec());
            })
            .map_err(storage_err)?;
        Ok(())
    }

    fn retain(&self) {
        self.sessions.fetch_add(1, Ordering::SeqCst);
    }

    fn is_idle(&self) -> bool {
        self.sessions.load(Ordering::SeqCst) == 0
    }

    fn release(&self) {
        let previous = self.sessions.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && !self.is_closed() {
            let hook = self.on_idle.lock().ok().and_then(|hook| hook.clone());
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    fn set_on_idle(&self, hook: Option<IdleHook>) {
        if let Ok(mut slot) = self.on_idle.lock() {
            *slot = hook;
        }
    }

    fn finding_peers(&self) -> PeerToken {
        self.finding.count.fetch_add(1, Ordering::SeqCst);
        let finding = self.finding.clone();
        PeerToken::new(move || {
            finding.count.fetch_sub(1, Ordering::SeqCst);
            finding.notify.notify_waiters();
        })
    }

    fn replicator(&self) -> Arc<dyn Replicator> {
        self.replicator.clone()
    }

    async fn audit(&self, _opts: AuditOptions) -> Result<AuditStats, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        let checked = self
            .backend
            .with_core(&self.id, |core| core.blocks.len() as u64)
            .map_err(storage_err)?
            .unwrap_or(0);
        // Nothing to repair in a backend without trees or bitfields.
        Ok(AuditStats {
            blocks_checked: checked,
            ..AuditStats::default()
        })
    }
}

struct Attachment {
    muxer_id: u64,
    stream: Weak<SimStreamInner>,
}

/// Per-core replication surface: the downloading flag with its hook, and
/// the set of attached peer streams.
pub struct MockReplicator {
    core: Weak<MockCore>,
    downloading: AtomicBool,
    on_downloading: Mutex<Option<DownloadingHook>>,
    attachments: Mutex<Vec<Attachment>>,
}

impl MockReplicator {
    fn new(core: Weak<MockCore>) -> Self {
        Self {
            core,
            downloading: AtomicBool::new(false),
            on_downloading: Mutex::new(None),
            attachments: Mutex::new(Vec::new()),
        }
    }

    fn streams(&self) -> Vec<Arc<SimStreamInner>> {
        self.attachments
            .lock()
            .map(|attachments| {
                attachments
                    .iter()
                    .filter_map(|attachment| attachment.stream.upgrade())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn request_block(&self, index: u64) {
        let Some(core) = self.core.upgrade() else { return };
        for stream in self.streams() {
            stream.send(WireMessage::Request {
                discovery_key: core.discovery_key,
                index,
            });
        }
    }

    pub(crate) fn broadcast_have(&self, length: u64) {
        let Some(core) = self.core.upgrade() else { return };
        for stream in self.streams() {
            stream.send(WireMessage::Have {
                discovery_key: core.discovery_key,
                length,
            });
        }
    }

    /// Remove one attachment and drop its core reference. Does not call
    /// back into the stream.
    pub(crate) fn remove_attachment(&self, muxer_id: u64) -> bool {
        let removed = {
            let Ok(mut attachments) = self.attachments.lock() else {
                return false;
            };
            let before = attachments.len();
            attachments.retain(|attachment| attachment.muxer_id != muxer_id);
            before != attachments.len()
        };
        if removed {
            if let Some(core) = self.core.upgrade() {
                core.release();
            }
        }
        removed
    }

    /// Detach from every stream; used when the core closes.
    fn detach_all(&self) {
        let attachments: Vec<Attachment> = {
            match self.attachments.lock() {
                Ok(mut attachments) => std::mem::take(&mut *attachments),
                Err(_) => Vec::new(),
            }
        };
        let Some(core) = self.core.upgrade() else { return };
        for attachment in attachments {
            if let Some(stream) = attachment.stream.upgrade() {
                stream.detach_core(core.id());
            }
            core.release();
        }
    }
}

#[async_trait]
impl Replicator for MockReplicator {
    fn downloading(&self) -> bool {
        self.downloading.load(Ordering::SeqCst)
    }

    fn set_downloading(&self, downloading: bool) {
        if downloading {
            if !self.downloading.swap(true, Ordering::SeqCst) {
                let hook = self
                    .on_downloading
                    .lock()
                    .ok()
                    .and_then(|hook| hook.clone());
                if let Some(hook) = hook {
                    hook();
                }
            }
        } else {
            self.downloading.store(false, Ordering::SeqCst);
        }
    }

    fn set_on_downloading(&self, hook: Option<DownloadingHook>) {
        if let Ok(mut slot) = self.on_downloading.lock() {
            *slot = hook;
        }
    }

    fn attached(&self, muxer: &dyn Muxer) -> bool {
        let id = muxer.id();
        self.attachments
            .lock()
            .map(|attachments| {
                attachments
                    .iter()
                    .any(|attachment| attachment.muxer_id == id)
            })
            .unwrap_or(false)
    }

    async fn attach_to(&self, muxer: Arc<dyn Muxer>) -> Result<(), EngineError> {
        let Some(sim) = muxer.as_any().downcast_ref::<SimMuxer>() else {
            return Err(EngineError::InvalidInput(
                "unsupported muxer implementation".to_string(),
            ));
        };
        let stream = sim.inner();
        let Some(core) = self.core.upgrade() else {
            return Err(EngineError::Closed);
        };
        if core.is_closed() {
            return Err(EngineError::Closed);
        }
        {
            let Ok(mut attachments) = self.attachments.lock() else {
                return Err(EngineError::Other("attachment lock poisoned".to_string()));
            };
            if attachments
                .iter()
                .any(|attachment| attachment.muxer_id == stream.muxer_id())
            {
                return Ok(());
            }
            attachments.push(Attachment {
                muxer_id: stream.muxer_id(),
                stream: Arc::downgrade(&stream),
            });
        }
        // The attachment holds a replicator session on the core.
        core.retain();
        stream.attach_core(core.clone());
        Ok(())
    }
}
