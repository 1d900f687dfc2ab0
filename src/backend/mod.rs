//! Injected file back-end.
//!
//! The disk manager never opens files itself; all physical existence,
//! create, read, write, move and close operations go through this trait so
//! callers can substitute platform-specific or in-memory implementations.
//! Errors are surfaced to the manager unchanged.

mod disk;
mod memory;

pub use disk::TokioFileBackend;
pub use memory::MemoryBackend;

use std::io;
use std::path::Path;

use async_trait::async_trait;

/// Physical file operations, implemented outside the disk core.
///
/// Implementations must support concurrent access across distinct files; the
/// manager guarantees it never issues two overlapping operations against the
/// same file concurrently. Handle lifetime (open-file limits, LRU closing)
/// is the backend's own business.
#[async_trait]
pub trait FileBackend: Send + Sync {
    async fn exists(&self, path: &Path) -> io::Result<bool>;

    /// Creates the file if missing. Returns `true` if it was created.
    async fn create(&self, path: &Path) -> io::Result<bool>;

    /// Reads at `offset` into `buf`, returning the number of bytes read.
    /// Short reads past the end of the file are not errors.
    async fn read(&self, path: &Path, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes `data` at `offset`, creating the file (and parent directories)
    /// as needed.
    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()>;

    async fn flush(&self, path: &Path) -> io::Result<()>;

    async fn close(&self, path: &Path) -> io::Result<()>;

    /// Moves a file, creating target directories as needed. Fails without
    /// touching source or target when the target exists and `overwrite` is
    /// false.
    async fn rename(&self, path: &Path, new_path: &Path, overwrite: bool) -> io::Result<()>;

    /// Length of the file, or `None` if it does not exist.
    async fn len(&self, path: &Path) -> io::Result<Option<u64>>;

    /// Sets the file length. Returns `false` if the file does not exist.
    async fn set_len(&self, path: &Path, len: u64) -> io::Result<bool>;

    /// Bounds how many handles the backend keeps open at once.
    async fn set_max_open_files(&self, n: usize);
}
