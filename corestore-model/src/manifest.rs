//! Core manifests
//!
//! A manifest describes a core's authorization: who may sign, and under
//! which manifest version. The engine derives a core's `key`
//! deterministically from its manifest.

use crate::types::{CoreKey, DiscoveryKey, KeyPair, Namespace, PubKey};
use serde::{Deserialize, Serialize};

/// A single authorized signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signer {
    pub public_key: PubKey,
}

/// The engine's description of a core's authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub signers: Vec<Signer>,
}

impl Manifest {
    /// The common case: one signer under the given manifest version.
    pub fn single_signer(version: u32, public_key: PubKey) -> Self {
        Self {
            version,
            signers: vec![Signer { public_key }],
        }
    }
}

/// A fully resolved core identity: what a `get` request translates to, and
/// what the storage backend persists per discovery key.
///
/// `key` is absent only for remote-only opens where just the discovery key
/// is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreAuth {
    pub key: Option<CoreKey>,
    pub discovery_key: DiscoveryKey,
    pub manifest: Option<Manifest>,
    pub key_pair: Option<KeyPair>,
}

/// A `(name, namespace)` pair the storage backend maps to a discovery key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Alias {
    pub name: String,
    pub namespace: Namespace,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_signer() {
        let pk = PubKey([3; 32]);
        let manifest = Manifest::single_signer(1, pk);
        assert_eq!(manifest.version, 1);
        assert_eq!(manifest.signers.len(), 1);
        assert_eq!(manifest.signers[0].public_key, pk);
    }
}
