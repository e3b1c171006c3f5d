#![allow(dead_code)]

use corestore::{Corestore, StoreOptions};
use corestore_mockengine::{MemBackend, MockEngine};
use std::sync::Arc;
use std::time::Duration;

/// A store over the given backend with a fast idle GC, so eviction tests
/// finish quickly.
pub fn make_store(backend: &MemBackend) -> Corestore {
    make_store_opts(backend, StoreOptions::default())
}

pub fn make_store_opts(backend: &MemBackend, opts: StoreOptions) -> Corestore {
    let opts = opts.gc_interval(Duration::from_millis(20)).gc_strikes(3);
    Corestore::new(Arc::new(backend.clone()), MockEngine::new(), opts)
}

/// Poll `check` for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
