//! Centralized key derivation for corestore.
//!
//! **All** namespace hashing, seed derivation, keypair creation, and token
//! generation goes through this module. This provides a single audit surface
//! for cryptographic correctness.
//!
//! # Primitives
//!
//! | Primitive   | Algorithm         | Purpose                                  |
//! |-------------|-------------------|------------------------------------------|
//! | Namespace   | BLAKE3 (32 B)     | Domain separation for name derivation    |
//! | Seed        | keyed BLAKE3      | Per-core signing seed from the master    |
//! | Key pair    | Ed25519 from seed | Core signing identity                    |
//!
//! Every derivation is pure and deterministic: two stores sharing a master
//! seed derive identical key pairs for identical `(namespace, name)` inputs.

use corestore_model::{KeyPair, Namespace, PubKey, SecretKey};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use std::sync::LazyLock;
use zeroize::Zeroizing;

/// Domain tag mixed into every seed derivation: slot 0 of the derivation
/// family over the ASCII string `"corestore"`. Keeps seeds from colliding
/// with other applications sharing the same master seed.
static PROTOCOL_TAG: LazyLock<[u8; 32]> = LazyLock::new(|| {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"corestore");
    hasher.update(&[0]);
    *hasher.finalize().as_bytes()
});

/// Derive a child namespace: `H(parent || name)`.
///
/// Namespaces chain; a zero-length name is legal.
pub fn derive_namespace(parent: &Namespace, name: &[u8]) -> Namespace {
    let mut hasher = blake3::Hasher::new();
    hasher.update(parent.as_bytes());
    hasher.update(name);
    Namespace(*hasher.finalize().as_bytes())
}

/// Derive a signing seed: `H_keyed(TAG || namespace || name; key = primary_key)`.
pub fn derive_seed(primary_key: &[u8; 32], namespace: &Namespace, name: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut hasher = blake3::Hasher::new_keyed(primary_key);
    hasher.update(PROTOCOL_TAG.as_slice());
    hasher.update(namespace.as_bytes());
    hasher.update(name);
    Zeroizing::new(*hasher.finalize().as_bytes())
}

/// Derive the Ed25519 signing key pair for `(primary_key, namespace, name)`.
pub fn create_key_pair(primary_key: &[u8; 32], namespace: &Namespace, name: &[u8]) -> KeyPair {
    let seed = derive_seed(primary_key, namespace, name);
    let signing_key = SigningKey::from_bytes(&seed);
    KeyPair {
        public_key: PubKey(signing_key.verifying_key().to_bytes()),
        secret_key: Some(SecretKey::from_bytes(signing_key.to_bytes())),
    }
}

/// Generate 32 bytes of cryptographically secure randomness.
///
/// Used for: fresh master seeds, opaque tokens.
pub fn create_token() -> [u8; 32] {
    let mut token = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut token);
    token
}
