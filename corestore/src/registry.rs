//! CoreRegistry - interns open cores by discovery key
//!
//! Provides process-wide access to cores:
//! - Deduplicates concurrent opens (one core per discovery key)
//! - Runs cooperative idle GC over cores whose last session closed
//! - Fans out open notifications to registered watchers

use crate::error::StoreError;
use corestore_model::Core;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Lifecycle phase of a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorePhase {
    /// The opening factory is still running.
    Opening,
    /// Live and reusable.
    Opened,
    /// Close in flight; reported absent to lookups, not yet evicted.
    Closing,
    /// Closed and removed.
    Closed,
}

/// One registry entry. The slot outlives phase transitions so concurrent
/// openers can await them.
pub struct CoreSlot {
    id: String,
    phase_tx: watch::Sender<CorePhase>,
    core: OnceLock<Arc<dyn Core>>,
}

impl CoreSlot {
    fn new(id: &str) -> Self {
        let (phase_tx, _) = watch::channel(CorePhase::Opening);
        Self {
            id: id.to_string(),
            phase_tx,
            core: OnceLock::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> CorePhase {
        *self.phase_tx.borrow()
    }

    /// The interned core. `None` only while the slot is still opening.
    pub fn core(&self) -> Option<Arc<dyn Core>> {
        self.core.get().cloned()
    }

    fn set_phase(&self, phase: CorePhase) {
        let _ = self.phase_tx.send(phase);
    }

    async fn wait_not_opening(&self) {
        let mut rx = self.phase_tx.subscribe();
        let _ = rx.wait_for(|p| *p != CorePhase::Opening).await;
    }

    async fn wait_closed(&self) {
        let mut rx = self.phase_tx.subscribe();
        let _ = rx.wait_for(|p| *p == CorePhase::Closed).await;
    }
}

/// Fired with each newly interned core.
pub type CoreOpenCallback = Arc<dyn Fn(&Arc<dyn Core>) + Send + Sync>;

/// Identifies one registered watcher callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchHandle(u64);

struct RegistryState {
    cores: HashMap<String, Arc<CoreSlot>>,
    /// Idle strike counters, keyed like `cores`. Presence means the core is
    /// a GC candidate; entries are cleared when a slot is resumed, so the
    /// sweeper and concurrent opens serialize through the same lock.
    idle: HashMap<String, u32>,
}

/// Process-wide discovery-key -> core map with idle GC and watcher fan-out.
pub struct CoreRegistry {
    state: Mutex<RegistryState>,
    watchers: Mutex<Vec<(u64, CoreOpenCallback)>>,
    next_watcher: AtomicU64,
    gc_interval: Duration,
    gc_strikes: u32,
    closed: AtomicBool,
    gc_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl CoreRegistry {
    pub fn new(gc_interval: Duration, gc_strikes: u32) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(RegistryState {
                cores: HashMap::new(),
                idle: HashMap::new(),
            }),
            watchers: Mutex::new(Vec::new()),
            next_watcher: AtomicU64::new(0),
            gc_interval,
            gc_strikes,
            closed: AtomicBool::new(false),
            gc_task: Mutex::new(None),
            shutdown_tx,
        })
    }

    /// The live core slot for `id`. Closing cores are reported absent.
    pub fn get(&self, id: &str) -> Option<Arc<CoreSlot>> {
        let Ok(state) = self.state.lock() else { return None };
        state
            .cores
            .get(id)
            .filter(|slot| slot.phase() == CorePhase::Opened)
            .cloned()
    }

    pub fn opened(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// The slot for `id` in any phase. Cancels pending idle GC on a live
    /// slot; a closing slot is returned so the caller can await the close
    /// before re-opening.
    pub fn resume(&self, id: &str) -> Option<Arc<CoreSlot>> {
        let Ok(mut state) = self.state.lock() else { return None };
        let slot = state.cores.get(id).cloned()?;
        if slot.phase() == CorePhase::Opened {
            state.idle.remove(id);
        }
        Some(slot)
    }

    /// Snapshot of every live core slot, in no particular order.
    pub fn opened_cores(&self) -> Vec<Arc<CoreSlot>> {
        let Ok(state) = self.state.lock() else { return Vec::new() };
        state
            .cores
            .values()
            .filter(|slot| slot.phase() == CorePhase::Opened)
            .cloned()
            .collect()
    }

    /// Number of live (non-closing) cores.
    pub fn len(&self) -> usize {
        let Ok(state) = self.state.lock() else { return 0 };
        state
            .cores
            .values()
            .filter(|slot| slot.phase() == CorePhase::Opened)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a watcher. Watchers see every core interned after
    /// registration; earlier opens are not replayed.
    pub fn watch(&self, callback: CoreOpenCallback) -> WatchHandle {
        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.push((id, callback));
        }
        WatchHandle(id)
    }

    pub fn unwatch(&self, handle: &WatchHandle) {
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.retain(|(id, _)| *id != handle.0);
        }
    }

    /// Mark a core idle. The sweeper closes it after it has sat idle for
    /// the configured number of ticks; any resume resets the counter.
    pub fn mark_idle(&self, id: &str) {
        let Ok(mut state) = self.state.lock() else { return };
        let live = state
            .cores
            .get(id)
            .map(|slot| slot.phase() == CorePhase::Opened)
            .unwrap_or(false);
        if live {
            state.idle.insert(id.to_string(), 0);
        }
    }

    /// Get the core for `id`, opening it with `factory` if nobody has.
    ///
    /// Concurrent calls for one id resolve to the same slot: an opening
    /// predecessor is awaited, a closing predecessor is waited out before a
    /// fresh open. Returns the slot and whether this call created it.
    pub async fn intern<F, Fut>(
        &self,
        id: &str,
        factory: F,
    ) -> Result<(Arc<CoreSlot>, bool), StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn Core>, StoreError>>,
    {
        enum Action {
            Reuse(Arc<CoreSlot>),
            WaitOpen(Arc<CoreSlot>),
            WaitClose(Arc<CoreSlot>),
            Create(Arc<CoreSlot>),
        }

        let slot = loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(StoreError::StoreClosed);
            }

            let action = {
                let mut state = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
                match state.cores.get(id).cloned() {
                    Some(slot) => match slot.phase() {
                        CorePhase::Opened => {
                            state.idle.remove(id);
                            Action::Reuse(slot)
                        }
                        CorePhase::Opening => Action::WaitOpen(slot),
                        CorePhase::Closing | CorePhase::Closed => Action::WaitClose(slot),
                    },
                    None => {
                        let slot = Arc::new(CoreSlot::new(id));
                        state.cores.insert(id.to_string(), slot.clone());
                        Action::Create(slot)
                    }
                }
            };

            match action {
                Action::Reuse(slot) => return Ok((slot, false)),
                Action::WaitOpen(slot) => slot.wait_not_opening().await,
                Action::WaitClose(slot) => slot.wait_closed().await,
                Action::Create(slot) => break slot,
            }
        };

        match factory().await {
            Ok(core) => {
                let _ = slot.core.set(core.clone());
                slot.set_phase(CorePhase::Opened);
                debug!(core = %slot.id(), "opened core");
                self.fire_watchers(&core);
                Ok((slot, true))
            }
            Err(err) => {
                self.evict(&slot);
                Err(err)
            }
        }
    }

    fn fire_watchers(&self, core: &Arc<dyn Core>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let callbacks: Vec<CoreOpenCallback> = {
            let Ok(watchers) = self.watchers.lock() else { return };
            watchers.iter().map(|(_, cb)| cb.clone()).collect()
        };
        // Most recently registered watcher first.
        for callback in callbacks.iter().rev() {
            callback(core);
        }
    }

    fn evict(&self, slot: &Arc<CoreSlot>) {
        if let Ok(mut state) = self.state.lock() {
            let same = state
                .cores
                .get(slot.id())
                .map(|current| Arc::ptr_eq(current, slot))
                .unwrap_or(false);
            if same {
                state.cores.remove(slot.id());
            }
            state.idle.remove(slot.id());
        }
        slot.set_phase(CorePhase::Closed);
    }

    /// Start the idle sweeper if it is not running. Requires a runtime.
    pub fn ensure_gc(self: &Arc<Self>) {
        let Ok(mut task) = self.gc_task.lock() else { return };
        if task.is_some() || self.closed.load(Ordering::SeqCst) {
            return;
        }
        let registry = Arc::downgrade(self);
        let interval = self.gc_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so a fresh
            // idle core gets its full grace window.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(registry) = registry.upgrade() else { break };
                        registry.sweep().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));
    }

    async fn sweep(&self) {
        let due: Vec<Arc<CoreSlot>> = {
            let Ok(mut state) = self.state.lock() else { return };
            let strikes = self.gc_strikes;
            let mut due_ids = Vec::new();
            for (id, count) in state.idle.iter_mut() {
                *count += 1;
                if *count >= strikes {
                    due_ids.push(id.clone());
                }
            }
            let mut due = Vec::new();
            for id in due_ids {
                state.idle.remove(&id);
                if let Some(slot) = state.cores.get(&id) {
                    if slot.phase() != CorePhase::Opened {
                        continue;
                    }
                    // A replicator attachment may have picked the core back
                    // up since it reported idle; the engine is authoritative.
                    let still_idle = slot.core().map(|core| core.is_idle()).unwrap_or(false);
                    if !still_idle {
                        continue;
                    }
                    // Transition under the lock so a concurrent open either
                    // resumed the core (clearing its idle entry) or will
                    // observe Closing and wait the close out.
                    slot.set_phase(CorePhase::Closing);
                    due.push(slot.clone());
                }
            }
            due
        };

        for slot in due {
            let Some(core) = slot.core() else {
                self.evict(&slot);
                continue;
            };
            core.set_on_idle(None);
            if let Err(err) = core.close().await {
                warn!(core = %slot.id(), error = %err, "error closing idle core");
            }
            self.evict(&slot);
            debug!(core = %slot.id(), "evicted idle core");
        }
    }

    /// Stop the sweeper, forbid idle re-entry, and close every core.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let task = match self.gc_task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        if let Some(task) = task {
            let _ = task.await;
        }

        let slots: Vec<Arc<CoreSlot>> = {
            let Ok(mut state) = self.state.lock() else { return };
            state.idle.clear();
            state.cores.drain().map(|(_, slot)| slot).collect()
        };

        for slot in &slots {
            if let Some(core) = slot.core() {
                core.set_on_idle(None);
            }
        }
        for slot in slots {
            if slot.phase() == CorePhase::Opened {
                slot.set_phase(CorePhase::Closing);
                if let Some(core) = slot.core() {
                    if let Err(err) = core.close().await {
                        warn!(core = %slot.id(), error = %err, "error closing core");
                    }
                }
            }
            slot.set_phase(CorePhase::Closed);
        }
        debug!("core registry closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Install the idle hook that routes a core's idle signal back into
    /// this registry.
    pub fn install_idle_hook(self: &Arc<Self>, core: &Arc<dyn Core>) {
        let registry = Arc::downgrade(self);
        let id = core.discovery_key().to_string();
        core.set_on_idle(Some(Arc::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.mark_idle(&id);
            }
        })));
    }
}

impl Drop for CoreRegistry {
    fn drop(&mut self) {
        // A registry dropped without close() must not leak its sweeper.
        if let Ok(mut task) = self.gc_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}
