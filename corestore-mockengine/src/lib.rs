//! Corestore Mock Engine
//!
//! In-memory test doubles for the contracts corestore consumes:
//! - **MemBackend**: shared-state storage backend (clones share "disk")
//! - **MockEngine** / **MockCore**: a functional in-memory append-log
//!   engine with session refcounting, idle hooks and block serving
//! - **SimStream** / **pipe**: channel-based protocol streams exchanging
//!   announce/request/response messages between attached cores

pub mod backend;
pub mod core;
pub mod engine;
pub mod stream;

pub use backend::MemBackend;
pub use core::MockCore;
pub use engine::MockEngine;
pub use stream::{pipe, SimMuxer, SimStream};
