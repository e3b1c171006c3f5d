//! StreamTracker - bookkeeping for live peer streams
//!
//! Holds every replication stream the store knows about, supports O(1)
//! removal by swapping the tail into the vacated slot, and fans core
//! attachments out to every stream.

use corestore_model::{Core, ProtocolStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Index value for a record that is no longer tracked.
const UNTRACKED: usize = usize::MAX;

/// One live peer stream. `is_external` marks streams supplied by the
/// caller, which the tracker must never destroy.
pub struct StreamRecord {
    pub stream: Arc<dyn ProtocolStream>,
    pub is_external: bool,
    index: AtomicUsize,
}

/// Positionally-indexed list of live peer streams.
pub struct StreamTracker {
    records: Mutex<Vec<Arc<StreamRecord>>>,
}

impl StreamTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
        })
    }

    pub fn add(&self, stream: Arc<dyn ProtocolStream>, is_external: bool) -> Arc<StreamRecord> {
        let record = Arc::new(StreamRecord {
            stream,
            is_external,
            index: AtomicUsize::new(UNTRACKED),
        });
        if let Ok(mut records) = self.records.lock() {
            record.index.store(records.len(), Ordering::SeqCst);
            records.push(record.clone());
        }
        record
    }

    /// Swap-remove a record; the moved tail record's index is fixed up.
    pub fn remove(&self, record: &Arc<StreamRecord>) -> bool {
        let Ok(mut records) = self.records.lock() else { return false };
        let index = record.index.swap(UNTRACKED, Ordering::SeqCst);
        if index == UNTRACKED || index >= records.len() {
            return false;
        }
        if !Arc::ptr_eq(&records[index], record) {
            return false;
        }
        records.swap_remove(index);
        if index < records.len() {
            records[index].index.store(index, Ordering::SeqCst);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<StreamRecord>> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Attach a core to every tracked stream it is not already attached to.
    pub async fn attach_all(&self, core: &Arc<dyn Core>) {
        let replicator = core.replicator();
        for record in self.snapshot() {
            if record.stream.is_destroyed() {
                continue;
            }
            let muxer = record.stream.muxer();
            if replicator.attached(muxer.as_ref()) {
                continue;
            }
            if let Err(err) = replicator.attach_to(muxer).await {
                warn!(core = %core.discovery_key(), error = %err, "failed to attach core to stream");
            }
        }
    }

    /// Destroy every stream this store created, newest first. Caller-owned
    /// streams are left alone.
    pub async fn destroy(&self) {
        let records = {
            let Ok(mut records) = self.records.lock() else { return };
            std::mem::take(&mut *records)
        };
        for record in records.iter().rev() {
            record.index.store(UNTRACKED, Ordering::SeqCst);
            if !record.is_external {
                record.stream.destroy().await;
            }
        }
        debug!(streams = records.len(), "stream tracker destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corestore_model::{DiscoveryKey, DiscoveryKeyHook, Muxer};
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    struct NullMuxer;

    impl Muxer for NullMuxer {
        fn id(&self) -> u64 {
            0
        }
        fn cork(&self) {}
        fn uncork(&self) {}
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct NullStream {
        close_tx: broadcast::Sender<()>,
    }

    impl NullStream {
        fn new() -> Arc<Self> {
            let (close_tx, _) = broadcast::channel(1);
            Arc::new(Self { close_tx })
        }
    }

    #[async_trait]
    impl ProtocolStream for NullStream {
        fn muxer(&self) -> Arc<dyn Muxer> {
            Arc::new(NullMuxer)
        }
        async fn opened(&self) {}
        fn set_on_discovery_key(&self, _hook: Option<DiscoveryKeyHook>) {}
        fn subscribe_close(&self) -> broadcast::Receiver<()> {
            self.close_tx.subscribe()
        }
        async fn close_core(&self, _discovery_key: &DiscoveryKey) {}
        async fn destroy(&self) {}
        fn is_destroyed(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_swap_remove_fixes_moved_index() {
        let tracker = StreamTracker::new();
        let a = tracker.add(NullStream::new(), false);
        let b = tracker.add(NullStream::new(), false);
        let c = tracker.add(NullStream::new(), true);
        assert_eq!(tracker.len(), 3);

        // Removing the head swaps the tail (c) into slot 0.
        assert!(tracker.remove(&a));
        assert_eq!(tracker.len(), 2);
        assert_eq!(c.index.load(Ordering::SeqCst), 0);
        assert_eq!(b.index.load(Ordering::SeqCst), 1);

        // Double remove is a no-op.
        assert!(!tracker.remove(&a));
        assert!(tracker.remove(&c));
        assert!(tracker.remove(&b));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_remove_tail() {
        let tracker = StreamTracker::new();
        let a = tracker.add(NullStream::new(), false);
        let b = tracker.add(NullStream::new(), false);
        assert!(tracker.remove(&b));
        assert_eq!(a.index.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.len(), 1);
    }
}
