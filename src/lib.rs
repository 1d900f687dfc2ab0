//! Disk storage engine for BitTorrent-style transfers.
//!
//! The crate maps piece-addressed blocks onto multi-file layouts, caches
//! uncommitted bytes in a bounded write-back cache, hashes pieces
//! incrementally as their bytes arrive, and throttles disk traffic with
//! caller-ticked rate budgets. All mutable state lives in one scheduler task
//! behind the [`DiskManager`] handle; physical I/O goes through the injected
//! [`FileBackend`] trait.

pub mod backend;
pub mod cache;
pub mod error;
pub mod hasher;
pub mod layout;
pub mod manager;
pub mod rate;

pub use backend::{FileBackend, MemoryBackend, TokioFileBackend};
pub use error::DiskError;
pub use hasher::{HashKind, PieceDigest};
pub use layout::{BlockRequest, FileEntry, TorrentId, TorrentLayout};
pub use manager::{DiskManager, DiskSettings, DiskStats};
