//! Corestore Model
//!
//! Shared types and consumed contracts for corestore:
//! - **Types**: strong newtypes for core keys, discovery keys, namespaces
//! - **Manifest**: core authorization descriptions and resolved auth
//! - **Engine**: the append-log engine contract (`CoreEngine`, `Core`)
//! - **Protocol**: the peer stream/muxer contract
//! - **Storage**: the persistent backend contract

pub mod engine;
pub mod manifest;
pub mod protocol;
pub mod storage;
pub mod types;

pub use engine::{
    AuditOptions, AuditStats, Core, CoreEngine, CoreOptions, DownloadingHook, EncryptionOptions,
    EngineError, IdleHook, PeerToken, ReadOptions, Replicator,
};
pub use manifest::{Alias, CoreAuth, Manifest, Signer};
pub use protocol::{DiscoveryKeyHook, Muxer, ProtocolStream};
pub use storage::{CoreInfo, CoreInfoStream, DiscoveryKeyStream, Storage, StorageError};
pub use types::{CoreKey, DiscoveryKey, KeyPair, Namespace, PubKey, SecretKey};
