//! Protocol stream contract
//!
//! The wire layer (handshake, framing, multiplexing) lives outside
//! corestore. Corestore only attaches cores to muxers, corks the initial
//! advertisement burst, and reacts to discovery keys the remote announces.

use crate::types::DiscoveryKey;
use async_trait::async_trait;
use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Invoked by the muxer when the remote advertises an unknown discovery key.
pub type DiscoveryKeyHook =
    Arc<dyn Fn(DiscoveryKey) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// The multiplexing object attached to a peer stream. Cores are attached to
/// a muxer to participate in that peer's traffic.
pub trait Muxer: Send + Sync {
    /// Unique per muxer instance; used for attachment identity checks.
    fn id(&self) -> u64;

    /// Buffer outgoing core advertisements.
    fn cork(&self);
    fn uncork(&self);

    fn as_any(&self) -> &dyn Any;
}

/// A live peer stream produced by the engine (or supplied by the caller).
#[async_trait]
pub trait ProtocolStream: Send + Sync {
    fn muxer(&self) -> Arc<dyn Muxer>;

    /// Resolves once the handshake completes.
    async fn opened(&self);

    fn set_on_discovery_key(&self, hook: Option<DiscoveryKeyHook>);

    /// Fires once when the stream closes or is destroyed.
    fn subscribe_close(&self) -> broadcast::Receiver<()>;

    /// Close the channel for one core on this stream.
    async fn close_core(&self, discovery_key: &DiscoveryKey);

    async fn destroy(&self);
    fn is_destroyed(&self) -> bool;
}
