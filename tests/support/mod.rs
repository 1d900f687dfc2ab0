//! Test back-end that can hold selected physical operations in flight.

#![allow(dead_code)]

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

use torrent_disk::{FileBackend, MemoryBackend};

/// Wraps [`MemoryBackend`] so a test can park reads or writes mid-flight.
///
/// `gate_reads(n)` (or `gate_writes`) arms the next `n` operations of that
/// kind: each one announces itself on the entered channel and then waits for
/// a [`GatedBackend::release`] permit before touching the inner backend.
pub struct GatedBackend {
    inner: MemoryBackend,
    gated_reads: AtomicUsize,
    gated_writes: AtomicUsize,
    entered: mpsc::UnboundedSender<()>,
    gate: Semaphore,
}

impl GatedBackend {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (entered, entered_rx) = mpsc::unbounded_channel();
        let backend = Arc::new(Self {
            inner: MemoryBackend::new(),
            gated_reads: AtomicUsize::new(0),
            gated_writes: AtomicUsize::new(0),
            entered,
            gate: Semaphore::new(0),
        });
        (backend, entered_rx)
    }

    pub fn memory(&self) -> &MemoryBackend {
        &self.inner
    }

    pub fn gate_reads(&self, n: usize) {
        self.gated_reads.store(n, Ordering::SeqCst);
    }

    pub fn gate_writes(&self, n: usize) {
        self.gated_writes.store(n, Ordering::SeqCst);
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    async fn park_if_armed(&self, armed: &AtomicUsize) {
        let claimed = armed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if claimed {
            let _ = self.entered.send(());
            self.gate.acquire().await.expect("gate closed").forget();
        }
    }
}

#[async_trait]
impl FileBackend for GatedBackend {
    async fn exists(&self, path: &Path) -> io::Result<bool> {
        self.inner.exists(path).await
    }

    async fn create(&self, path: &Path) -> io::Result<bool> {
        self.inner.create(path).await
    }

    async fn read(&self, path: &Path, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.park_if_armed(&self.gated_reads).await;
        self.inner.read(path, offset, buf).await
    }

    async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
        self.park_if_armed(&self.gated_writes).await;
        self.inner.write(path, offset, data).await
    }

    async fn flush(&self, path: &Path) -> io::Result<()> {
        self.inner.flush(path).await
    }

    async fn close(&self, path: &Path) -> io::Result<()> {
        self.inner.close(path).await
    }

    async fn rename(&self, path: &Path, new_path: &Path, overwrite: bool) -> io::Result<()> {
        self.inner.rename(path, new_path, overwrite).await
    }

    async fn len(&self, path: &Path) -> io::Result<Option<u64>> {
        self.inner.len(path).await
    }

    async fn set_len(&self, path: &Path, len: u64) -> io::Result<bool> {
        self.inner.set_len(path, len).await
    }

    async fn set_max_open_files(&self, n: usize) {
        self.inner.set_max_open_files(n).await
    }
}
