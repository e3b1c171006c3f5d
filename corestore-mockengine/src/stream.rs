//! SimStream - in-memory protocol stream and muxer
//!
//! Two piped streams exchange a tiny announce/request/response protocol:
//! attached cores announce their discovery key and length, readers request
//! missing blocks from every attached stream, and announcements re-trigger
//! pending requests so late attachment still completes outstanding reads.
//! Cork buffers outgoing traffic until uncork after the pipe is up.

use crate::core::MockCore;
use corestore_model::{Core as _, DiscoveryKey, DiscoveryKeyHook, Muxer, ProtocolStream};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::trace;

static NEXT_MUXER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub(crate) enum WireMessage {
    /// Announce an attached core.
    Open { discovery_key: DiscoveryKey },
    Have {
        discovery_key: DiscoveryKey,
        length: u64,
    },
    Request {
        discovery_key: DiscoveryKey,
        index: u64,
    },
    Data {
        discovery_key: DiscoveryKey,
        index: u64,
        block: Vec<u8>,
    },
    /// Close the channel for one core.
    Close { discovery_key: DiscoveryKey },
}

pub(crate) struct SimStreamInner {
    muxer_id: u64,
    initiator: bool,
    corked: AtomicBool,
    destroyed: AtomicBool,
    opened_tx: watch::Sender<bool>,
    close_tx: broadcast::Sender<()>,
    out_tx: Mutex<Option<mpsc::UnboundedSender<WireMessage>>>,
    pending: Mutex<VecDeque<WireMessage>>,
    attached: Mutex<HashMap<String, Arc<MockCore>>>,
    remote_open: Mutex<HashSet<String>>,
    on_discovery_key: Mutex<Option<DiscoveryKeyHook>>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SimStreamInner {
    pub(crate) fn muxer_id(&self) -> u64 {
        self.muxer_id
    }

    /// Queue or transmit a message. Everything buffers while corked or
    /// unpiped so the remote observes one deterministic burst.
    pub(crate) fn send(&self, message: WireMessage) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let corked = self.corked.load(Ordering::SeqCst);
        let out = self.out_tx.lock().ok().and_then(|out| out.clone());
        match out {
            Some(out) if !corked => {
                let _ = out.send(message);
            }
            _ => {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.push_back(message);
                }
            }
        }
    }

    fn flush(&self) {
        let Some(out) = self.out_tx.lock().ok().and_then(|out| out.clone()) else {
            return;
        };
        let drained: Vec<WireMessage> = {
            let Ok(mut pending) = self.pending.lock() else { return };
            pending.drain(..).collect()
        };
        for message in drained {
            let _ = out.send(message);
        }
    }

    fn cork(&self) {
        self.corked.store(true, Ordering::SeqCst);
    }

    fn uncork(&self) {
        self.corked.store(false, Ordering::SeqCst);
        self.flush();
    }

    /// Wire this side to its peer and mark the handshake complete.
    fn connect(&self, out: mpsc::UnboundedSender<WireMessage>) {
        if let Ok(mut slot) = self.out_tx.lock() {
            *slot = Some(out);
        }
        let _ = self.opened_tx.send(true);
        if !self.corked.load(Ordering::SeqCst) {
            self.flush();
        }
    }

    /// Register a core on this muxer and announce it.
    pub(crate) fn attach_core(&self, core: Arc<MockCore>) {
        let discovery_key = core.discovery_key();
        let length = core.length();
        let wanted = core.wanted_snapshot();
        if let Ok(mut attached) = self.attached.lock() {
            attached.insert(core.id().to_string(), core);
        }
        self.send(WireMessage::Open { discovery_key });
        self.send(WireMessage::Have {
            discovery_key,
            length,
        });
        for index in wanted {
            self.send(WireMessage::Request {
                discovery_key,
                index,
            });
        }
    }

    /// Drop a core from this muxer and tell the remote.
    pub(crate) fn detach_core(&self, id: &str) {
        let removed = self
            .attached
            .lock()
            .ok()
            .and_then(|mut attached| attached.remove(id));
        if let Some(core) = removed {
            self.send(WireMessage::Close {
                discovery_key: core.discovery_key(),
            });
        }
    }

    fn attached_core(&self, id: &str) -> Option<Arc<MockCore>> {
        self.attached
            .lock()
            .ok()
            .and_then(|attached| attached.get(id).cloned())
    }

    async fn handle(self: &Arc<Self>, message: WireMessage) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        match message {
            WireMessage::Open { discovery_key } => {
                let id = discovery_key.to_string();
                if let Ok(mut remote) = self.remote_open.lock() {
                    remote.insert(id.clone());
                }
                match self.attached_core(&id) {
                    Some(core) => {
                        // Answer the announce with our own state.
                        self.send(WireMessage::Have {
                            discovery_key,
                            length: core.length(),
                        });
                        for index in core.wanted_snapshot() {
                            self.send(WireMessage::Request {
                                discovery_key,
                                index,
                            });
                        }
                    }
                    None => {
                        // Unknown discovery key; let the store decide.
                        let hook = self
                            .on_discovery_key
                            .lock()
                            .ok()
                            .and_then(|hook| hook.clone());
                        if let Some(hook) = hook {
                            trace!(core = %id, "remote announced unknown core");
                            hook(discovery_key).await;
                        }
                    }
                }
            }
            WireMessage::Have { discovery_key, .. } => {
                // The peer may now be able to serve what we still want.
                if let Some(core) = self.attached_core(&discovery_key.to_string()) {
                    for index in core.wanted_snapshot() {
                        self.send(WireMessage::Request {
                            discovery_key,
                            index,
                        });
                    }
                }
            }
            WireMessage::Request {
                discovery_key,
                index,
            } => {
                if let Some(core) = self.attached_core(&discovery_key.to_string()) {
                    if let Some(block) = core.serve_block(index) {
                        self.send(WireMessage::Data {
                            discovery_key,
                            index,
                            block,
                        });
                    }
                }
            }
            WireMessage::Data {
                discovery_key,
                index,
                block,
            } => {
                if let Some(core) = self.attached_core(&discovery_key.to_string()) {
                    core.ingest_block(index, block);
                }
            }
            WireMessage::Close { discovery_key } => {
                if let Ok(mut remote) = self.remote_open.lock() {
                    remote.remove(&discovery_key.to_string());
                }
            }
        }
    }

    fn destroy_inner(&self, abort_pump: bool) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Release handshake waiters and drop the outgoing half so the
        // remote pump ends.
        let _ = self.opened_tx.send(true);
        if let Ok(mut out) = self.out_tx.lock() {
            out.take();
        }
        if abort_pump {
            if let Ok(mut pump) = self.pump.lock() {
                if let Some(pump) = pump.take() {
                    pump.abort();
                }
            }
        }
        let cores: Vec<Arc<MockCore>> = {
            match self.attached.lock() {
                Ok(mut attached) => attached.drain().map(|(_, core)| core).collect(),
                Err(_) => Vec::new(),
            }
        };
        for core in cores {
            core.mock_replicator().remove_attachment(self.muxer_id);
        }
        let _ = self.close_tx.send(());
        trace!(muxer = self.muxer_id, "stream destroyed");
    }
}

/// Muxer face of a sim stream.
#[derive(Clone)]
pub struct SimMuxer {
    inner: Arc<SimStreamInner>,
}

impl SimMuxer {
    pub(crate) fn inner(&self) -> Arc<SimStreamInner> {
        self.inner.clone()
    }
}

impl Muxer for SimMuxer {
    fn id(&self) -> u64 {
        self.inner.muxer_id
    }

    fn cork(&self) {
        self.inner.cork();
    }

    fn uncork(&self) {
        self.inner.uncork();
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// In-memory protocol stream. Produce pairs with [`pipe`].
pub struct SimStream {
    inner: Arc<SimStreamInner>,
}

impl SimStream {
    pub fn new(initiator: bool) -> Self {
        let (opened_tx, _) = watch::channel(false);
        let (close_tx, _) = broadcast::channel(4);
        Self {
            inner: Arc::new(SimStreamInner {
                muxer_id: NEXT_MUXER_ID.fetch_add(1, Ordering::Relaxed),
                initiator,
                corked: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                opened_tx,
                close_tx,
                out_tx: Mutex::new(None),
                pending: Mutex::new(VecDeque::new()),
                attached: Mutex::new(HashMap::new()),
                remote_open: Mutex::new(HashSet::new()),
                on_discovery_key: Mutex::new(None),
                pump: Mutex::new(None),
            }),
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.inner.initiator
    }
}

#[async_trait]
impl ProtocolStream for SimStream {
    fn muxer(&self) -> Arc<dyn Muxer> {
        Arc::new(SimMuxer {
            inner: self.inner.clone(),
        })
    }

    async fn opened(&self) {
        let mut rx = self.inner.opened_tx.subscribe();
        let _ = rx.wait_for(|opened| *opened).await;
    }

    fn set_on_discovery_key(&self, hook: Option<DiscoveryKeyHook>) {
        if let Ok(mut slot) = self.inner.on_discovery_key.lock() {
            *slot = hook;
        }
    }

    fn subscribe_close(&self) -> broadcast::Receiver<()> {
        self.inner.close_tx.subscribe()
    }

    async fn close_core(&self, discovery_key: &DiscoveryKey) {
        let id = discovery_key.to_string();
        if let Some(core) = self.inner.attached_core(&id) {
            core.mock_replicator().remove_attachment(self.inner.muxer_id);
        }
        self.inner.detach_core(&id);
    }

    async fn destroy(&self) {
        self.inner.destroy_inner(true);
    }

    fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

async fn pump(inner: Arc<SimStreamInner>, mut rx: mpsc::UnboundedReceiver<WireMessage>) {
    while let Some(message) = rx.recv().await {
        if inner.destroyed.load(Ordering::SeqCst) {
            break;
        }
        inner.handle(message).await;
    }
    // Remote went away; tear this side down too.
    inner.destroy_inner(false);
}

/// Connect two sim streams, as if their byte streams were piped into each
/// other. Returns false if either stream is not a sim stream or is already
/// destroyed.
pub fn pipe(a: &Arc<dyn ProtocolStream>, b: &Arc<dyn ProtocolStream>) -> bool {
    let muxer_a = a.muxer();
    let muxer_b = b.muxer();
    let (Some(sim_a), Some(sim_b)) = (
        muxer_a.as_any().downcast_ref::<SimMuxer>(),
        muxer_b.as_any().downcast_ref::<SimMuxer>(),
    ) else {
        return false;
    };
    let a = sim_a.inner();
    let b = sim_b.inner();
    if a.destroyed.load(Ordering::SeqCst) || b.destroyed.load(Ordering::SeqCst) {
        return false;
    }

    let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
    let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();

    if let Ok(mut slot) = a.pump.lock() {
        *slot = Some(tokio::spawn(pump(a.clone(), b_to_a_rx)));
    }
    if let Ok(mut slot) = b.pump.lock() {
        *slot = Some(tokio::spawn(pump(b.clone(), a_to_b_rx)));
    }
    a.connect(a_to_b_tx);
    b.connect(b_to_a_tx);
    true
}
