//! `FileBackend` over the local filesystem via tokio.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::FileBackend;

const DEFAULT_MAX_OPEN_FILES: usize = 128;

struct Handle {
    file: Arc<Mutex<File>>,
    last_used: Instant,
}

/// Filesystem backend with an internal handle table.
///
/// Handles are kept open across calls and the least recently used one is
/// synced and closed once the table exceeds the configured limit.
pub struct TokioFileBackend {
    handles: Mutex<HashMap<PathBuf, Handle>>,
    max_open: AtomicUsize,
}

impl TokioFileBackend {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            max_open: AtomicUsize::new(DEFAULT_MAX_OPEN_FILES),
        }
    }

    async fn ensure_parent_dirs(path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn get_or_open(&self, path: &Path, create: bool) -> io::Result<Arc<Mutex<File>>> {
        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.get_mut(path) {
            handle.last_used = Instant::now();
            return Ok(handle.file.clone());
        }

        if create {
            Self::ensure_parent_dirs(path).await?;
        }
        let file = OpenOptions::new()
            .create(create)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .await?;
        let file = Arc::new(Mutex::new(file));
        handles.insert(
            path.to_path_buf(),
            Handle {
                file: file.clone(),
                last_used: Instant::now(),
            },
        );

        let max_open = self.max_open.load(Ordering::Relaxed).max(1);
        while handles.len() > max_open {
            let oldest = handles
                .iter()
                .min_by_key(|(_, h)| h.last_used)
                .map(|(p, _)| p.clone());
            let Some(victim) = oldest else { break };
            if let Some(handle) = handles.remove(&victim) {
                let file = handle.file.lock().await;
                let _ = file.sync_data().await;
            }
        }

        Ok(file)
    }

    async fn drop_handle(&self, path: &Path) -> io::Result<()> {
        let handle = self.handles.lock().await.remove(path);
        if let Some(handle) = handle {
            let file = handle.file.lock().await;
            file.sync_data().await?;
        }
        Ok(())
    }
}

impl Default for TokioFileBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileBackend for TokioFileBackend {
    async fn exists(&self, path: &Path) -> io::Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, path: &Path) -> io::Result<bool> {
        if self.exists(path).await? {
            return Ok(false);
        }
        Self::ensure_parent_dirs(path).await?;
        File::create(path).await?;
        Ok(true)
    }

    async fn read(&self, path: &Path, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let handle = self.get_or_open(path, false).await?;
        let mut file = handle.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
        let handle = self.get_or_open(path, true).await?;
        let mut file = handle.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await
    }

    async fn flush(&self, path: &Path) -> io::Result<()> {
        let handle = {
            let handles = self.handles.lock().await;
            handles.get(path).map(|h| h.file.clone())
        };
        if let Some(handle) = handle {
            let file = handle.lock().await;
            file.sync_data().await?;
        }
        Ok(())
    }

    async fn close(&self, path: &Path) -> io::Result<()> {
        self.drop_handle(path).await
    }

    async fn rename(&self, path: &Path, new_path: &Path, overwrite: bool) -> io::Result<()> {
        if !overwrite && self.exists(new_path).await? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("target exists: {}", new_path.display()),
            ));
        }
        // Open handles point at the old inodes, both for the source and for
        // a target being replaced; drop them first.
        self.drop_handle(path).await?;
        self.drop_handle(new_path).await?;
        Self::ensure_parent_dirs(new_path).await?;
        tokio::fs::rename(path, new_path).await
    }

    async fn len(&self, path: &Path) -> io::Result<Option<u64>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_len(&self, path: &Path, len: u64) -> io::Result<bool> {
        if !self.exists(path).await? {
            return Ok(false);
        }
        let handle = self.get_or_open(path, false).await?;
        let file = handle.lock().await;
        file.set_len(len).await?;
        Ok(true)
    }

    async fn set_max_open_files(&self, n: usize) {
        self.max_open.store(n.max(1), Ordering::Relaxed);
        tracing::debug!(max_open_files = n, "backend handle limit updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let temp = TempDir::new().unwrap();
        let backend = TokioFileBackend::new();
        let path = temp.path().join("sub/dir/file.dat");

        backend.write(&path, 4, b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        let n = backend.read(&path, 4, &mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn short_read_past_eof() {
        let temp = TempDir::new().unwrap();
        let backend = TokioFileBackend::new();
        let path = temp.path().join("file.dat");

        backend.write(&path, 0, b"abc").await.unwrap();
        let mut buf = [0u8; 8];
        let n = backend.read(&path, 0, &mut buf).await.unwrap();
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn rename_respects_overwrite_flag() {
        let temp = TempDir::new().unwrap();
        let backend = TokioFileBackend::new();
        let src = temp.path().join("src.dat");
        let dst = temp.path().join("dst.dat");

        backend.write(&src, 0, b"source").await.unwrap();
        backend.write(&dst, 0, b"target").await.unwrap();

        let err = backend.rename(&src, &dst, false).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(backend.exists(&src).await.unwrap());

        backend.rename(&src, &dst, true).await.unwrap();
        assert!(!backend.exists(&src).await.unwrap());
        let mut buf = [0u8; 6];
        backend.read(&dst, 0, &mut buf).await.unwrap();
        assert_eq!(&buf, b"source");
    }

    #[tokio::test]
    async fn handle_table_respects_limit() {
        let temp = TempDir::new().unwrap();
        let backend = TokioFileBackend::new();
        backend.set_max_open_files(2).await;

        for i in 0..5 {
            let path = temp.path().join(format!("f{i}"));
            backend.write(&path, 0, b"x").await.unwrap();
        }
        assert!(backend.handles.lock().await.len() <= 2);
    }
}
