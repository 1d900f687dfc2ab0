//! In-memory `FileBackend` with physical I/O counters.
//!
//! Ships with the crate (not just test code) so consumers can assert the
//! physical I/O cost of cache and hashing behaviour, the way this crate's
//! own integration tests do.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::FileBackend;

#[derive(Default)]
pub struct MemoryBackend {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    /// When set, every write fails with this error kind.
    fail_writes: Mutex<Option<io::ErrorKind>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_ops(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_ops(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Makes subsequent writes fail, for error-propagation tests.
    pub fn fail_writes_with(&self, kind: Option<io::ErrorKind>) {
        *self.fail_writes.lock().unwrap() = kind;
    }

    /// Raw file contents, if the file exists.
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    /// Seeds a file without touching the counters.
    pub fn put(&self, path: &Path, data: Vec<u8>) {
        self.files.lock().unwrap().insert(path.to_path_buf(), data);
    }
}

#[async_trait]
impl FileBackend for MemoryBackend {
    async fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.files.lock().unwrap().contains_key(path))
    }

    async fn create(&self, path: &Path) -> io::Result<bool> {
        let mut files = self.files.lock().unwrap();
        if files.contains_key(path) {
            return Ok(false);
        }
        files.insert(path.to_path_buf(), Vec::new());
        Ok(true)
    }

    async fn read(&self, path: &Path, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let files = self.files.lock().unwrap();
        let data = files.get(path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, path.display().to_string())
        })?;

        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);

        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
        if let Some(kind) = *self.fail_writes.lock().unwrap() {
            return Err(io::Error::new(kind, "injected write failure"));
        }

        let mut files = self.files.lock().unwrap();
        let file = files.entry(path.to_path_buf()).or_default();
        let end = offset as usize + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[offset as usize..end].copy_from_slice(data);

        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    async fn close(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    async fn rename(&self, path: &Path, new_path: &Path, overwrite: bool) -> io::Result<()> {
        let mut files = self.files.lock().unwrap();
        if !overwrite && files.contains_key(new_path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                new_path.display().to_string(),
            ));
        }
        let data = files.remove(path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, path.display().to_string())
        })?;
        files.insert(new_path.to_path_buf(), data);
        Ok(())
    }

    async fn len(&self, path: &Path) -> io::Result<Option<u64>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(path)
            .map(|d| d.len() as u64))
    }

    async fn set_len(&self, path: &Path, len: u64) -> io::Result<bool> {
        let mut files = self.files.lock().unwrap();
        match files.get_mut(path) {
            Some(data) => {
                data.resize(len as usize, 0);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_max_open_files(&self, _n: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_track_physical_io() {
        let backend = MemoryBackend::new();
        let path = Path::new("a/b");

        backend.write(path, 0, &[1, 2, 3]).await.unwrap();
        assert_eq!(backend.write_ops(), 1);
        assert_eq!(backend.bytes_written(), 3);

        let mut buf = [0u8; 3];
        backend.read(path, 0, &mut buf).await.unwrap();
        assert_eq!(backend.read_ops(), 1);
        assert_eq!(backend.bytes_read(), 3);
        assert_eq!(buf, [1, 2, 3]);
    }

    #[tokio::test]
    async fn rename_conflict_leaves_both_intact() {
        let backend = MemoryBackend::new();
        backend.put(Path::new("src"), vec![1]);
        backend.put(Path::new("dst"), vec![2]);

        let err = backend
            .rename(Path::new("src"), Path::new("dst"), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(backend.contents(Path::new("src")).unwrap(), vec![1]);
        assert_eq!(backend.contents(Path::new("dst")).unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn injected_write_failure() {
        let backend = MemoryBackend::new();
        backend.fail_writes_with(Some(io::ErrorKind::PermissionDenied));
        let err = backend.write(Path::new("f"), 0, &[0]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }
}
