use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("block out of piece bounds: piece {piece}, offset {offset}, length {length}")]
    InvalidBlockBounds { piece: u32, offset: u32, length: u32 },

    #[error("offset {offset} out of range for torrent of {total} bytes")]
    OffsetOutOfRange { offset: u64, total: u64 },

    #[error("torrent not registered: {0}")]
    UnknownTorrent(String),

    #[error("invalid file index: {0}")]
    UnknownFile(usize),

    #[error("move target already exists: {0}")]
    MoveConflict(PathBuf),

    #[error("deferred write failed: {0}")]
    WriteFailed(String),

    #[error("operation dropped: torrent was removed")]
    TorrentRemoved,

    #[error("disk scheduler is shut down")]
    Shutdown,
}
