//! Public entry point for torrent disk storage.
//!
//! [`DiskManager`] is a cheap-to-clone handle over the scheduler task that
//! owns the cache, the rate queues and the piece hash state. All methods are
//! async and complete when the scheduler (or a worker it spawned) resolved
//! the operation.

mod scheduler;
mod settings;

pub use scheduler::DiskStats;
pub use settings::DiskSettings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::backend::FileBackend;
use crate::error::DiskError;
use crate::hasher::PieceDigest;
use crate::layout::{BlockRequest, TorrentId, TorrentLayout};

use scheduler::{Command, Scheduler};

const COMMAND_BUFFER: usize = 256;

#[derive(Clone)]
pub struct DiskManager {
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
}

impl DiskManager {
    /// Starts the scheduler task over the given file back-end.
    pub fn new(backend: Arc<dyn FileBackend>, settings: DiskSettings) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(backend, settings, tx.clone());
        tokio::spawn(scheduler.run(rx, cancel.clone()));
        Self { tx, cancel }
    }

    /// Registers a transfer; re-adding an id tears down the previous state.
    pub async fn add_torrent(&self, layout: TorrentLayout) -> Result<(), DiskError> {
        self.request(|reply| Command::AddTorrent { layout, reply })
            .await
    }

    /// Drops all state of a transfer. Queued operations fail, uncommitted
    /// cache entries are discarded.
    pub async fn remove_torrent(&self, id: TorrentId) -> Result<(), DiskError> {
        self.request(|reply| Command::RemoveTorrent { id, reply })
            .await
    }

    /// Reads one block, serving cache-resident bytes without touching disk.
    pub async fn read_block(&self, id: TorrentId, block: BlockRequest) -> Result<Bytes, DiskError> {
        self.request(|reply| Command::Read { id, block, reply })
            .await
    }

    /// Writes one block through the cache. Resolves once the bytes are
    /// accepted, or once they are committed when the cache cannot hold them.
    pub async fn write_block(
        &self,
        id: TorrentId,
        block: BlockRequest,
        data: Bytes,
    ) -> Result<(), DiskError> {
        self.request(|reply| Command::Write {
            id,
            block,
            data,
            reply,
        })
        .await
    }

    /// Digest of one piece. Repeatable: asking again without intervening
    /// writes returns the same digest.
    pub async fn get_hash(&self, id: TorrentId, piece: u32) -> Result<PieceDigest, DiskError> {
        self.request(|reply| Command::GetHash { id, piece, reply })
            .await
    }

    /// Moves one file to a new absolute path, after flushing and draining
    /// the transfer's physical I/O.
    pub async fn move_file(
        &self,
        id: TorrentId,
        file_index: usize,
        new_path: PathBuf,
        overwrite: bool,
    ) -> Result<(), DiskError> {
        self.request(|reply| Command::MoveFile {
            id,
            file_index,
            new_path,
            overwrite,
            reply,
        })
        .await
    }

    /// Re-anchors every file of the transfer under a new root directory.
    pub async fn move_files(
        &self,
        id: TorrentId,
        new_root: PathBuf,
        overwrite: bool,
    ) -> Result<(), DiskError> {
        self.request(|reply| Command::MoveFiles {
            id,
            new_root,
            overwrite,
            reply,
        })
        .await
    }

    pub async fn file_exists(&self, id: TorrentId, file_index: usize) -> Result<bool, DiskError> {
        self.request(|reply| Command::FileExists {
            id,
            file_index,
            reply,
        })
        .await
    }

    pub async fn any_files_exist(&self, id: TorrentId) -> Result<bool, DiskError> {
        self.request(|reply| Command::AnyFilesExist { id, reply })
            .await
    }

    /// Flushes the transfer and releases its file handles.
    pub async fn close_files(&self, id: TorrentId) -> Result<(), DiskError> {
        self.request(|reply| Command::CloseFiles { id, reply }).await
    }

    /// Commits every dirty block of the transfer, resolving once none remain.
    pub async fn flush(&self, id: TorrentId) -> Result<(), DiskError> {
        self.request(|reply| Command::Flush { id, reply }).await
    }

    /// Applies new rate and cache limits to current and future operations.
    pub async fn update_settings(&self, settings: DiskSettings) -> Result<(), DiskError> {
        self.request(|reply| Command::UpdateSettings { settings, reply })
            .await
    }

    /// Advances rate-limiter time. The caller owns the clock; without ticks
    /// no suspended operation ever resumes.
    pub async fn tick(&self, elapsed: Duration) -> Result<(), DiskError> {
        self.request(|reply| Command::Tick { elapsed, reply }).await
    }

    pub async fn stats(&self) -> Result<DiskStats, DiskError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Stats { reply: tx })
            .await
            .map_err(|_| DiskError::Shutdown)?;
        rx.await.map_err(|_| DiskError::Shutdown)
    }

    /// Stops the scheduler. Outstanding and subsequent requests fail with
    /// [`DiskError::Shutdown`].
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(scheduler::Reply<T>) -> Command,
    ) -> Result<T, DiskError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| DiskError::Shutdown)?;
        rx.await.map_err(|_| DiskError::Shutdown)?
    }
}
