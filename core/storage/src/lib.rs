//! Cloud storage abstraction for vaultsync.
//!
//! The sync engine treats the encrypted cloud as a black box reached through
//! the id-addressed [`CloudStore`] trait. This crate defines that trait and
//! ships two implementations, opened by name from config.
//!
//! # Design Principles
//! - Id addressing: items keep their id across renames and moves
//! - Content is sealed chunk by chunk with a per-file key
//! - Async operations: All I/O operations are async
//! - Unified error semantics: Consistent error types across stores

pub mod dir;
pub mod memory;
pub mod provider;
pub mod registry;
pub mod seal;

pub use dir::DirStore;
pub use memory::MemoryStore;
pub use provider::{CloudFileMeta, CloudNode, CloudStore, CHUNK_SIZE};
pub use registry::{open_store, store_kind, OpenStore, StoreKind, STORE_KINDS};
