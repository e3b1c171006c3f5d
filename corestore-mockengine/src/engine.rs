//! MockEngine - the core engine contract over MemBackend

use crate::backend::MemBackend;
use crate::core::MockCore;
use crate::stream::SimStream;
use corestore_model::{
    Core, CoreEngine, CoreKey, CoreOptions, DiscoveryKey, EngineError, Manifest, ProtocolStream,
    Storage,
};
use async_trait::async_trait;
use std::sync::Arc;

pub struct MockEngine;

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl CoreEngine for MockEngine {
    /// A core's key is the hash of its manifest.
    fn key(&self, manifest: &Manifest) -> CoreKey {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"corestore/manifest");
        hasher.update(&manifest.version.to_le_bytes());
        for signer in &manifest.signers {
            hasher.update(signer.public_key.as_bytes());
        }
        CoreKey(*hasher.finalize().as_bytes())
    }

    fn discovery_key(&self, key: &CoreKey) -> DiscoveryKey {
        DiscoveryKey(*blake3::keyed_hash(key.as_bytes(), b"hypercore").as_bytes())
    }

    async fn create(
        &self,
        storage: Arc<dyn Storage>,
        opts: CoreOptions,
    ) -> Result<Arc<dyn Core>, EngineError> {
        let Some(backend) = storage.as_any().downcast_ref::<MemBackend>() else {
            return Err(EngineError::InvalidInput(
                "unsupported storage backend".to_string(),
            ));
        };
        let core = MockCore::create(backend.clone(), opts)?;
        let core: Arc<dyn Core> = core;
        Ok(core)
    }

    fn create_protocol_stream(&self, initiator: bool) -> Arc<dyn ProtocolStream> {
        Arc::new(SimStream::new(initiator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corestore_model::PubKey;

    #[test]
    fn test_manifest_key_is_deterministic() {
        let engine = MockEngine::new();
        let manifest = Manifest::single_signer(1, PubKey([5; 32]));
        assert_eq!(engine.key(&manifest), engine.key(&manifest));
    }

    #[test]
    fn test_manifest_version_changes_key() {
        let engine = MockEngine::new();
        let v1 = Manifest::single_signer(1, PubKey([5; 32]));
        let v2 = Manifest::single_signer(2, PubKey([5; 32]));
        assert_ne!(engine.key(&v1), engine.key(&v2));
    }

    #[test]
    fn test_discovery_key_differs_from_key() {
        let engine = MockEngine::new();
        let key = engine.key(&Manifest::single_signer(1, PubKey([5; 32])));
        let discovery_key = engine.discovery_key(&key);
        assert_ne!(discovery_key.as_bytes(), key.as_bytes());
        // And is itself deterministic.
        assert_eq!(discovery_key, engine.discovery_key(&key));
    }
}
