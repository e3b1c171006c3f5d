//! Corestore - the public store API
//!
//! One store is the *root*: it owns the storage backend, the core registry,
//! the stream tracker and the master seed. Child store sessions (made with
//! `namespace()` / `session()`) share all of that with the root and own only
//! their namespace, their sessions, and their writability default.

use crate::auth::{self, AuthContext};
use crate::error::StoreError;
use crate::keys;
use crate::registry::{CoreRegistry, WatchHandle};
use crate::session::{GetOptions, Session, SessionConfig, SessionTracker};
use crate::streams::StreamTracker;
use corestore_model::{
    Alias, Core, CoreAuth, CoreEngine, CoreOptions, DiscoveryKey, DiscoveryKeyStream, KeyPair,
    Namespace, ProtocolStream, Storage,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

/// User-data key carrying a named core's UTF-8 name.
pub const USER_DATA_NAME: &str = "corestore/name";
/// User-data key carrying a named core's 32-byte namespace.
pub const USER_DATA_NAMESPACE: &str = "corestore/namespace";

/// Bound on the known-missing discovery-key cache.
const KNOWN_MISSING_LIMIT: usize = 65_536;

/// Options for constructing a root store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Externally supplied master seed; must match a persisted one.
    pub primary_key: Option<[u8; 32]>,
    pub manifest_version: u32,
    pub writable: bool,
    /// Passive stores never auto-attach their cores to streams.
    pub passive: bool,
    /// Idle GC tick interval.
    pub gc_interval: Duration,
    /// Consecutive idle ticks before an idle core is closed.
    pub gc_strikes: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            primary_key: None,
            manifest_version: 1,
            writable: true,
            passive: false,
            gc_interval: Duration::from_secs(2),
            gc_strikes: 3,
        }
    }
}

impl StoreOptions {
    pub fn primary_key(mut self, primary_key: [u8; 32]) -> Self {
        self.primary_key = Some(primary_key);
        self
    }

    pub fn manifest_version(mut self, manifest_version: u32) -> Self {
        self.manifest_version = manifest_version;
        self
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn passive(mut self, passive: bool) -> Self {
        self.passive = passive;
        self
    }

    pub fn gc_interval(mut self, gc_interval: Duration) -> Self {
        self.gc_interval = gc_interval;
        self
    }

    pub fn gc_strikes(mut self, gc_strikes: u32) -> Self {
        self.gc_strikes = gc_strikes;
        self
    }
}

/// Options for a child store session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub namespace: Option<Namespace>,
    pub writable: Option<bool>,
    pub manifest_version: Option<u32>,
}

impl SessionOptions {
    pub fn namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = Some(namespace);
        self
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = Some(writable);
        self
    }

    pub fn manifest_version(mut self, manifest_version: u32) -> Self {
        self.manifest_version = Some(manifest_version);
        self
    }
}

/// How `replicate` obtains its stream.
pub enum ReplicationRole {
    /// Create a new stream as the handshake initiator.
    Initiator,
    /// Create a new stream as the handshake responder.
    Responder,
    /// Attach to a caller-owned stream; corestore will not destroy it.
    Stream(Arc<dyn ProtocolStream>),
}

impl From<bool> for ReplicationRole {
    fn from(initiator: bool) -> Self {
        if initiator {
            ReplicationRole::Initiator
        } else {
            ReplicationRole::Responder
        }
    }
}

impl From<Arc<dyn ProtocolStream>> for ReplicationRole {
    fn from(stream: Arc<dyn ProtocolStream>) -> Self {
        ReplicationRole::Stream(stream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StorePhase {
    Opened,
    Closing,
    Closed,
}

/// Bounded set of discovery keys that recently failed to open, so repeated
/// remote announcements of an absent core do not thrash storage.
struct KnownMissing {
    set: HashSet<String>,
    order: VecDeque<String>,
    limit: usize,
}

impl KnownMissing {
    fn new(limit: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            limit,
        }
    }

    fn insert(&mut self, id: String) {
        if self.set.insert(id.clone()) {
            self.order.push_back(id);
            while self.order.len() > self.limit {
                if let Some(evicted) = self.order.pop_front() {
                    self.set.remove(&evicted);
                }
            }
        }
    }

    fn remove(&mut self, id: &str) {
        if self.set.remove(id) {
            self.order.retain(|entry| entry != id);
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }
}

/// Root-owned state, shared by reference with every child store session.
pub(crate) struct RootShared {
    pub(crate) engine: Arc<dyn CoreEngine>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) cores: Arc<CoreRegistry>,
    pub(crate) streams: Arc<StreamTracker>,
    pub(crate) passive: bool,
    primary_key: OnceCell<[u8; 32]>,
    supplied_primary_key: Option<[u8; 32]>,
    children: Mutex<Vec<Weak<StoreLocal>>>,
    missing: Mutex<KnownMissing>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    phase_tx: watch::Sender<StorePhase>,
    close_cell: OnceCell<()>,
}

impl RootShared {
    fn phase(&self) -> StorePhase {
        *self.phase_tx.borrow()
    }

    fn note_missing(&self, id: &str) {
        if let Ok(mut missing) = self.missing.lock() {
            missing.insert(id.to_string());
        }
    }

    fn clear_missing(&self, id: &str) {
        if let Ok(mut missing) = self.missing.lock() {
            missing.remove(id);
        }
    }

    fn is_known_missing(&self, id: &str) -> bool {
        self.missing
            .lock()
            .map(|missing| missing.contains(id))
            .unwrap_or(false)
    }

    fn register_child(&self, local: &Arc<StoreLocal>) {
        if let Ok(mut children) = self.children.lock() {
            children.retain(|child| child.strong_count() > 0);
            children.push(Arc::downgrade(local));
        }
    }

    async fn close_root(self: &Arc<Self>) {
        self.close_cell
            .get_or_init(|| async {
                let _ = self.phase_tx.send(StorePhase::Closing);
                let children: Vec<Weak<StoreLocal>> = {
                    match self.children.lock() {
                        Ok(mut children) => std::mem::take(&mut *children),
                        Err(_) => Vec::new(),
                    }
                };
                for child in children {
                    if let Some(local) = child.upgrade() {
                        local.close_local(&self.cores).await;
                    }
                }
                self.cores.close().await;
                self.streams.destroy().await;
                if let Err(err) = self.storage.close().await {
                    warn!(error = %err, "error closing storage");
                }
                let _ = self.phase_tx.send(StorePhase::Closed);
                info!("corestore closed");
            })
            .await;
    }
}

/// How a store session's namespace is produced at ready time.
enum NsInit {
    Fixed(Namespace),
    Inherit(Arc<StoreLocal>),
    Derived { parent: Arc<StoreLocal>, name: String },
    /// Adopt the namespace persisted in a core's user data.
    Bootstrap(Arc<dyn Core>),
}

/// Per-store-session state.
pub(crate) struct StoreLocal {
    ns_init: NsInit,
    ns: OnceCell<Namespace>,
    writable: bool,
    manifest_version: u32,
    pub(crate) sessions: Arc<SessionTracker>,
    finding: Mutex<usize>,
    closed: AtomicBool,
    close_cell: OnceCell<()>,
    watch_handles: Mutex<Vec<WatchHandle>>,
    is_root: bool,
}

impl StoreLocal {
    fn resolve_ns(
        self: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Namespace, StoreError>> + Send>>
    {
        Box::pin(async move {
            let ns = self
                .ns
                .get_or_try_init(|| async {
                    match &self.ns_init {
                        NsInit::Fixed(ns) => Ok(*ns),
                        NsInit::Inherit(parent) => parent.clone().resolve_ns().await,
                        NsInit::Derived { parent, name } => {
                            let parent_ns = parent.clone().resolve_ns().await?;
                            Ok(keys::derive_namespace(&parent_ns, name.as_bytes()))
                        }
                        NsInit::Bootstrap(core) => {
                            let data = core
                                .get_user_data(USER_DATA_NAMESPACE)
                                .await
                                .map_err(StoreError::from)?;
                            let Some(bytes) = data else {
                                return Err(StoreError::InvalidInput(
                                    "bootstrap core carries no namespace user data".to_string(),
                                ));
                            };
                            Namespace::try_from(bytes).map_err(|_| {
                                StoreError::InvalidInput(
                                    "bootstrap namespace must be 32 bytes".to_string(),
                                )
                            })
                        }
                    }
                })
                .await?;
            Ok(*ns)
        })
    }

    async fn close_local(self: Arc<Self>, cores: &Arc<CoreRegistry>) {
        let this = self.clone();
        self.close_cell
            .get_or_init(|| async move {
                this.closed.store(true, Ordering::SeqCst);
                let handles: Vec<WatchHandle> = match this.watch_handles.lock() {
                    Ok(mut handles) => std::mem::take(&mut *handles),
                    Err(_) => Vec::new(),
                };
                for handle in handles {
                    cores.unwatch(&handle);
                }
                for session in this.sessions.take_all() {
                    session.close().await;
                }
                debug!("store session closed");
            })
            .await;
    }

    fn finding_count(&self) -> usize {
        self.finding.lock().map(|count| *count).unwrap_or(0)
    }

    fn finding_increment(&self) {
        let Ok(mut count) = self.finding.lock() else { return };
        *count += 1;
        if *count == 1 {
            // 0 -> 1: every live session acquires a grace token.
            for session in self.sessions.all() {
                session.attach_peer_token();
            }
        }
    }

    fn finding_decrement(&self) {
        let Ok(mut count) = self.finding.lock() else { return };
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            // 1 -> 0: drain tokens in acquisition order.
            for session in self.sessions.all() {
                session.release_peer_token();
            }
        }
    }
}

/// Release handle returned by `finding_peers`. Only the first `release`
/// (or the drop) decrements the counter.
pub struct FindingPeersHandle {
    local: Weak<StoreLocal>,
    released: AtomicBool,
}

impl FindingPeersHandle {
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(local) = self.local.upgrade() {
            local.finding_decrement();
        }
    }
}

impl Drop for FindingPeersHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// A store over a collection of authenticated append-only logs.
#[derive(Clone)]
pub struct Corestore {
    pub(crate) shared: Arc<RootShared>,
    pub(crate) local: Arc<StoreLocal>,
}

impl Corestore {
    /// Construct a root store over a storage backend and core engine.
    pub fn new(
        storage: Arc<dyn Storage>,
        engine: Arc<dyn CoreEngine>,
        opts: StoreOptions,
    ) -> Self {
        let (phase_tx, _) = watch::channel(StorePhase::Opened);
        let shared = Arc::new(RootShared {
            engine,
            storage,
            cores: CoreRegistry::new(opts.gc_interval, opts.gc_strikes),
            streams: StreamTracker::new(),
            passive: opts.passive,
            primary_key: OnceCell::new(),
            supplied_primary_key: opts.primary_key,
            children: Mutex::new(Vec::new()),
            missing: Mutex::new(KnownMissing::new(KNOWN_MISSING_LIMIT)),
            locks: Mutex::new(HashMap::new()),
            phase_tx,
            close_cell: OnceCell::new(),
        });
        let local = Arc::new(StoreLocal {
            ns_init: NsInit::Fixed(Namespace::DEFAULT),
            ns: OnceCell::new(),
            writable: opts.writable,
            manifest_version: opts.manifest_version,
            sessions: SessionTracker::new(),
            finding: Mutex::new(0),
            closed: AtomicBool::new(false),
            close_cell: OnceCell::new(),
            watch_handles: Mutex::new(Vec::new()),
            is_root: true,
        });
        Corestore { shared, local }
    }

    /// Generate a fresh opaque 32-byte token.
    pub fn create_token() -> [u8; 32] {
        keys::create_token()
    }

    pub fn is_closed(&self) -> bool {
        self.local.closed.load(Ordering::SeqCst) || self.shared.phase() != StorePhase::Opened
    }

    /// The resolved master seed. `None` until the store has opened.
    pub fn primary_key(&self) -> Option<[u8; 32]> {
        self.shared.primary_key.get().copied()
    }

    /// The resolved namespace. `None` until the store has opened (bootstrap
    /// children learn theirs at ready time).
    pub fn namespace_key(&self) -> Option<Namespace> {
        self.local.ns.get().copied()
    }

    pub fn writable(&self) -> bool {
        self.local.writable
    }

    /// The shared core registry.
    pub fn cores(&self) -> Arc<CoreRegistry> {
        self.shared.cores.clone()
    }

    /// The shared replication stream tracker.
    pub fn streams(&self) -> Arc<StreamTracker> {
        self.shared.streams.clone()
    }

    /// Load or claim the master seed.
    async fn open_root(&self) -> Result<[u8; 32], StoreError> {
        let shared = &self.shared;
        let primary_key = shared
            .primary_key
            .get_or_try_init(|| async {
                let supplied = shared.supplied_primary_key;
                match shared.storage.get_seed().await? {
                    Some(seed) => {
                        if let Some(supplied) = supplied {
                            if supplied != seed {
                                return Err(StoreError::ConflictingSeed);
                            }
                        }
                        Ok(seed)
                    }
                    None => {
                        let seed = supplied.unwrap_or_else(keys::create_token);
                        let persisted = shared.storage.set_seed(seed).await?;
                        if supplied.is_some() && persisted != seed {
                            // A concurrent writer claimed the slot first.
                            return Err(StoreError::ConflictingSeed);
                        }
                        Ok(persisted)
                    }
                }
            })
            .await?;
        shared.cores.ensure_gc();
        Ok(*primary_key)
    }

    /// Open the store: resolve the master seed and this session's namespace.
    pub async fn ready(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::StoreClosed);
        }
        self.open_root().await?;
        self.local.clone().resolve_ns().await?;
        Ok(())
    }

    /// Get a session for a core.
    pub async fn get(&self, opts: GetOptions) -> Result<Session, StoreError> {
        if self.is_closed() {
            return Err(StoreError::StoreClosed);
        }
        auth::validate(&opts)?;

        let primary_key = self.open_root().await?;
        let ns = self.local.clone().resolve_ns().await?;

        let mut opts = opts;
        if let Some(preload) = opts.preload.take() {
            let pre = preload.await;
            if opts.key.is_none() {
                opts.key = pre.key;
            }
            if opts.key_pair.is_none() {
                opts.key_pair = pre.key_pair;
            }
            if opts.manifest.is_none() {
                opts.manifest = pre.manifest;
            }
            if let Some(encryption) = pre.encryption {
                opts.encryption = encryption;
            }
        }

        let ctx = AuthContext {
            primary_key: &primary_key,
            namespace: &ns,
            manifest_version: self.local.manifest_version,
            engine: &self.shared.engine,
        };
        let resolved = auth::resolve(&ctx, &opts)?;
        let id = resolved.discovery_key.to_string();

        // A discovery-key-only open never creates; check existence first.
        if resolved.key.is_none() && !self.shared.cores.opened(&id) {
            if !self.shared.storage.has(&resolved.discovery_key).await? {
                return Err(StoreError::StorageEmpty);
            }
        }

        let writable = opts.writable.unwrap_or(self.local.writable);
        let config = SessionConfig {
            active: opts.active,
            writable,
            exclusive: opts.exclusive,
            wait: opts.wait,
            timeout: opts.timeout,
            draft: opts.draft,
        };

        // Read-only sessions never take the write lock.
        let exclusive_guard = if config.exclusive && config.writable {
            Some(self.acquire_exclusive(&id).await?)
        } else {
            None
        };

        let intern = self
            .shared
            .cores
            .intern(&id, || self.open_core(&opts, &resolved, &ns))
            .await;
        let (slot, created) = match intern {
            Ok(entry) => entry,
            Err(err) => {
                if matches!(err, StoreError::StorageEmpty | StoreError::Engine(_)) {
                    self.shared.note_missing(&id);
                }
                return Err(err);
            }
        };
        if created {
            self.shared.clear_missing(&id);
        }
        let Some(core) = slot.core() else {
            return Err(StoreError::StoreClosed);
        };
        if self.is_closed() {
            return Err(StoreError::StoreClosed);
        }

        if !created {
            // The reuse path re-checks what the opening factory checked.
            if let (Some(expected), Some(name)) = (resolved.key, &opts.name) {
                if core.key() != expected {
                    return Err(StoreError::StoredKeyMismatch { name: name.clone() });
                }
            }
            // A named reopen may carry signing material an earlier
            // remote-initiated open lacked.
            if let Some(key_pair) = &resolved.key_pair {
                if key_pair.is_writable() && !core.writable() {
                    core.set_key_pair(key_pair.clone()).await?;
                }
            }
        }

        core.retain();
        let session = Session::new(
            id,
            core.clone(),
            config.clone(),
            &self.local.sessions,
            exclusive_guard,
        );
        if self.local.finding_count() > 0 {
            session.attach_peer_token();
        }
        if config.active {
            core.replicator().set_downloading(true);
        }
        Ok(session)
    }

    /// The opening factory run under the registry's dedup.
    async fn open_core(
        &self,
        opts: &GetOptions,
        resolved: &CoreAuth,
        ns: &Namespace,
    ) -> Result<Arc<dyn Core>, StoreError> {
        let mut core_opts = CoreOptions::new(resolved.discovery_key).with_auth(resolved);
        core_opts.create_if_missing = opts.create_if_missing;
        core_opts.draft = opts.draft;
        core_opts.encryption = opts.encryption.clone();
        if let Some(name) = &opts.name {
            core_opts.alias = Some(Alias {
                name: name.clone(),
                namespace: *ns,
            });
            core_opts.user_data = vec![
                (USER_DATA_NAME.to_string(), name.as_bytes().to_vec()),
                (USER_DATA_NAMESPACE.to_string(), ns.as_bytes().to_vec()),
            ];
        }

        let core = self
            .shared
            .engine
            .create(self.shared.storage.clone(), core_opts)
            .await?;
        core.ready().await?;

        // A named core's on-disk key must match the re-derived one.
        if let (Some(expected), Some(name)) = (resolved.key, &opts.name) {
            if core.key() != expected {
                let _ = core.close().await;
                return Err(StoreError::StoredKeyMismatch { name: name.clone() });
            }
        }

        self.shared.cores.install_idle_hook(&core);

        if !self.shared.passive {
            let streams = Arc::downgrade(&self.shared.streams);
            let weak_core = Arc::downgrade(&core);
            core.replicator()
                .set_on_downloading(Some(Arc::new(move || {
                    let Some(streams) = streams.upgrade() else { return };
                    let Some(core) = weak_core.upgrade() else { return };
                    tokio::spawn(async move {
                        streams.attach_all(&core).await;
                    });
                })));
        }

        Ok(core)
    }

    async fn acquire_exclusive(
        &self,
        id: &str,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, StoreError> {
        let lock = {
            let mut locks = self
                .shared
                .locks
                .lock()
                .map_err(|_| StoreError::LockPoisoned)?;
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let mut phase_rx = self.shared.phase_tx.subscribe();
        tokio::select! {
            // Cancellation wins when both are ready.
            biased;
            _ = phase_rx.wait_for(|phase| *phase != StorePhase::Opened) => {
                Err(StoreError::ExclusiveWaitCancelled)
            }
            guard = lock.lock_owned() => Ok(guard),
        }
    }

    /// Construct a peer stream (or adopt a caller-owned one), attach every
    /// downloading core, and open further cores the remote announces.
    pub async fn replicate(
        &self,
        role: impl Into<ReplicationRole>,
    ) -> Result<Arc<dyn ProtocolStream>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::StoreClosed);
        }
        self.ready().await?;

        let (stream, is_external) = match role.into() {
            ReplicationRole::Initiator => (self.shared.engine.create_protocol_stream(true), false),
            ReplicationRole::Responder => (self.shared.engine.create_protocol_stream(false), false),
            ReplicationRole::Stream(stream) => (stream, true),
        };

        let shared = Arc::downgrade(&self.shared);
        let local = Arc::downgrade(&self.local);
        let weak_stream = Arc::downgrade(&stream);
        stream.set_on_discovery_key(Some(Arc::new(move |discovery_key| {
            let shared = shared.clone();
            let local = local.clone();
            let weak_stream = weak_stream.clone();
            Box::pin(async move {
                let Some(shared) = shared.upgrade() else { return };
                let Some(local) = local.upgrade() else { return };
                let Some(stream) = weak_stream.upgrade() else { return };
                Corestore::on_remote_discovery_key(shared, local, stream, discovery_key).await;
            })
        })));

        let record = self.shared.streams.add(stream.clone(), is_external);

        // Drop the record when the stream goes away.
        {
            let mut close_rx = stream.subscribe_close();
            let streams = Arc::downgrade(&self.shared.streams);
            let record = record.clone();
            tokio::spawn(async move {
                let _ = close_rx.recv().await;
                if let Some(streams) = streams.upgrade() {
                    streams.remove(&record);
                }
            });
        }

        if !self.shared.passive {
            // Cork so the remote observes one deterministic advertised set
            // on handshake.
            let muxer = stream.muxer();
            muxer.cork();
            for slot in self.shared.cores.opened_cores() {
                let Some(core) = slot.core() else { continue };
                let replicator = core.replicator();
                if !replicator.downloading() || replicator.attached(muxer.as_ref()) {
                    continue;
                }
                if let Err(err) = replicator.attach_to(muxer.clone()).await {
                    warn!(core = %slot.id(), error = %err, "failed to attach core to new stream");
                }
            }
            let stream = stream.clone();
            tokio::spawn(async move {
                stream.opened().await;
                stream.muxer().uncork();
            });
        }

        debug!(external = is_external, "registered replication stream");
        Ok(stream)
    }

    /// `on_discovery_key` path: open a locally known core the remote asked
    /// for and attach it to that stream.
    async fn on_remote_discovery_key(
        shared: Arc<RootShared>,
        local: Arc<StoreLocal>,
        stream: Arc<dyn ProtocolStream>,
        discovery_key: DiscoveryKey,
    ) {
        if shared.phase() != StorePhase::Opened {
            return;
        }
        let id = discovery_key.to_string();
        if shared.is_known_missing(&id) {
            return;
        }
        if !shared.cores.opened(&id) {
            match shared.storage.has(&discovery_key).await {
                Ok(true) => {}
                // Unknown locally; nothing to serve.
                _ => return,
            }
        }

        let store = Corestore {
            shared: shared.clone(),
            local,
        };
        let opts = GetOptions::discovery_key(discovery_key)
            .active(false)
            .create_if_missing(false);
        match store.get(opts).await {
            Ok(session) => {
                let muxer = stream.muxer();
                let replicator = session.replicator();
                if !replicator.attached(muxer.as_ref()) {
                    if let Err(err) = replicator.attach_to(muxer).await {
                        warn!(core = %id, error = %err, "failed to attach on-demand core");
                    }
                }
                // The attachment holds its own replicator session; this
                // bootstrap session is done.
                session.close().await;
            }
            Err(err) => {
                debug!(core = %id, error = %err, "on-demand open failed");
                shared.note_missing(&id);
            }
        }
    }

    /// A child store session under a derived namespace. Namespaces chain.
    pub fn namespace(&self, name: impl Into<String>) -> Corestore {
        let name = name.into();
        let ns_init = match self.local.ns.get() {
            Some(parent_ns) => NsInit::Fixed(keys::derive_namespace(parent_ns, name.as_bytes())),
            None => NsInit::Derived {
                parent: self.local.clone(),
                name,
            },
        };
        self.child(ns_init, None, None)
    }

    /// A child store session that adopts the namespace persisted in a
    /// core's user data at ready time.
    pub fn namespace_from(&self, bootstrap: &Session) -> Corestore {
        self.child(NsInit::Bootstrap(bootstrap.core()), None, None)
    }

    /// A child store session sharing this store's registry and streams.
    pub fn session(&self, opts: SessionOptions) -> Corestore {
        let ns_init = match opts.namespace {
            Some(ns) => NsInit::Fixed(ns),
            None => match self.local.ns.get() {
                Some(ns) => NsInit::Fixed(*ns),
                None => NsInit::Inherit(self.local.clone()),
            },
        };
        self.child(ns_init, opts.writable, opts.manifest_version)
    }

    fn child(
        &self,
        ns_init: NsInit,
        writable: Option<bool>,
        manifest_version: Option<u32>,
    ) -> Corestore {
        let local = Arc::new(StoreLocal {
            ns_init,
            ns: OnceCell::new(),
            writable: writable.unwrap_or(self.local.writable),
            manifest_version: manifest_version.unwrap_or(self.local.manifest_version),
            sessions: SessionTracker::new(),
            finding: Mutex::new(0),
            closed: AtomicBool::new(false),
            close_cell: OnceCell::new(),
            watch_handles: Mutex::new(Vec::new()),
            is_root: false,
        });
        self.shared.register_child(&local);
        Corestore {
            shared: self.shared.clone(),
            local,
        }
    }

    /// Lazily enumerate persisted discovery keys, optionally restricted to
    /// one namespace. Ordering is unspecified.
    pub async fn list(
        &self,
        namespace: Option<Namespace>,
    ) -> Result<DiscoveryKeyStream, StoreError> {
        if self.is_closed() {
            return Err(StoreError::StoreClosed);
        }
        self.ready().await?;
        Ok(self
            .shared
            .storage
            .create_discovery_key_stream(namespace.as_ref()))
    }

    /// Derive the key pair for `name` under `namespace` (this store's
    /// namespace when absent).
    pub async fn create_key_pair(
        &self,
        name: &str,
        namespace: Option<Namespace>,
    ) -> Result<KeyPair, StoreError> {
        let primary_key = self.open_root().await?;
        let ns = match namespace {
            Some(ns) => ns,
            None => self.local.clone().resolve_ns().await?,
        };
        Ok(keys::create_key_pair(&primary_key, &ns, name.as_bytes()))
    }

    /// Register a callback fired for every core interned after this call.
    pub fn watch(
        &self,
        callback: impl Fn(&Arc<dyn Core>) + Send + Sync + 'static,
    ) -> WatchHandle {
        let handle = self.shared.cores.watch(Arc::new(callback));
        if let Ok(mut handles) = self.local.watch_handles.lock() {
            handles.push(handle.clone());
        }
        handle
    }

    pub fn unwatch(&self, handle: &WatchHandle) {
        if let Ok(mut handles) = self.local.watch_handles.lock() {
            handles.retain(|registered| registered != handle);
        }
        self.shared.cores.unwatch(handle);
    }

    /// Signal that peer discovery is in flight; sessions on this store wait
    /// for at least one discovery attempt before declaring "no peers".
    pub fn finding_peers(&self) -> FindingPeersHandle {
        self.local.finding_increment();
        FindingPeersHandle {
            local: Arc::downgrade(&self.local),
            released: AtomicBool::new(false),
        }
    }

    /// Suspend the storage backend.
    pub async fn suspend(&self) -> Result<(), StoreError> {
        self.ready().await?;
        self.shared.storage.suspend().await?;
        info!("storage suspended");
        Ok(())
    }

    /// Resume a suspended storage backend.
    pub async fn resume(&self) -> Result<(), StoreError> {
        self.ready().await?;
        self.shared.storage.resume().await?;
        info!("storage resumed");
        Ok(())
    }

    /// Close this store session. Closing a child closes only its own
    /// sessions; closing the root closes every child store, every open
    /// core, then the storage. Idempotent.
    pub async fn close(&self) -> Result<(), StoreError> {
        if self.local.is_root {
            // Flip the phase first so pending exclusive waiters cancel
            // before the closing sessions release their locks.
            let _ = self.shared.phase_tx.send_if_modified(|phase| {
                if *phase == StorePhase::Opened {
                    *phase = StorePhase::Closing;
                    true
                } else {
                    false
                }
            });
        }
        self.local.clone().close_local(&self.shared.cores).await;
        if self.local.is_root {
            self.shared.close_root().await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Corestore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Corestore")
            .field("root", &self.local.is_root)
            .field("writable", &self.local.writable)
            .field("cores", &self.shared.cores.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_missing_is_bounded() {
        let mut missing = KnownMissing::new(2);
        missing.insert("a".to_string());
        missing.insert("b".to_string());
        missing.insert("c".to_string());
        assert!(!missing.contains("a"));
        assert!(missing.contains("b"));
        assert!(missing.contains("c"));

        missing.remove("b");
        assert!(!missing.contains("b"));

        // Re-inserting an evicted entry works.
        missing.insert("a".to_string());
        assert!(missing.contains("a"));
    }

    #[test]
    fn test_known_missing_insert_is_idempotent() {
        let mut missing = KnownMissing::new(2);
        missing.insert("a".to_string());
        missing.insert("a".to_string());
        missing.insert("b".to_string());
        // The duplicate did not consume a slot.
        assert!(missing.contains("a"));
        assert!(missing.contains("b"));
    }

    #[test]
    fn test_replication_role_from_bool() {
        assert!(matches!(
            ReplicationRole::from(true),
            ReplicationRole::Initiator
        ));
        assert!(matches!(
            ReplicationRole::from(false),
            ReplicationRole::Responder
        ));
    }
}
