//! Corestore
//!
//! Factory and lifecycle manager for collections of authenticated
//! append-only logs sharing one storage root, one master seed, and one
//! replication fabric:
//! - **keys**: deterministic namespace/seed/keypair derivation
//! - **CoreRegistry**: discovery-key interning, idle GC, watcher fan-out
//! - **Session**: user-held core references with reference counting
//! - **StreamTracker**: attach every eligible core to every live peer
//! - **Corestore**: the public API (root store and child store sessions)
//! - **Audit**: sweep persisted cores through the engine's audit

pub mod audit;
pub mod error;
pub mod keys;
pub mod registry;
pub mod session;
pub mod store;
pub mod streams;

mod auth;

pub use audit::CoreAuditReport;
pub use error::StoreError;
pub use registry::{CoreOpenCallback, CorePhase, CoreRegistry, CoreSlot, WatchHandle};
pub use session::{GetOptions, Preload, PreloadOptions, Session, SessionConfig};
pub use store::{
    Corestore, FindingPeersHandle, ReplicationRole, SessionOptions, StoreOptions, USER_DATA_NAME,
    USER_DATA_NAMESPACE,
};
pub use streams::{StreamRecord, StreamTracker};

// The shared model types, re-exported for consumers.
pub use corestore_model::{
    Alias, AuditOptions, AuditStats, Core, CoreAuth, CoreEngine, CoreKey, DiscoveryKey,
    EncryptionOptions, EngineError, KeyPair, Manifest, Namespace, ProtocolStream, PubKey,
    Storage, StorageError,
};
