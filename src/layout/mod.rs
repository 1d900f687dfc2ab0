//! Static shape of one transfer: how pieces and blocks map onto files.
//!
//! All lookups here are pure functions over the layout; nothing in this
//! module touches the file back-end. Out-of-range coordinates are rejected
//! as parameter errors before any physical I/O is attempted.

use std::fmt;
use std::path::PathBuf;

use crate::error::DiskError;
use crate::hasher::HashKind;

/// Identity of one transfer (the info-hash in BitTorrent terms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TorrentId(pub [u8; 20]);

impl fmt::Display for TorrentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// One file of the transfer, placed at a cumulative byte offset.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Where the file currently lives; updated by moves.
    pub path: PathBuf,
    /// The original relative descriptor from the transfer metadata;
    /// moves to a new root re-anchor this.
    pub relative: PathBuf,
    pub length: u64,
    /// Global byte offset where this file starts.
    pub offset: u64,
}

impl FileEntry {
    pub fn contains(&self, global_offset: u64) -> bool {
        self.length > 0 && global_offset >= self.offset && global_offset < self.offset + self.length
    }
}

/// A sub-range of one file touched by a read or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSegment {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

/// One read/write unit: a sub-range of a single piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

/// Static shape of one transfer.
#[derive(Debug, Clone)]
pub struct TorrentLayout {
    id: TorrentId,
    files: Vec<FileEntry>,
    piece_length: u32,
    total_size: u64,
    piece_count: u32,
    hash_kind: HashKind,
}

impl TorrentLayout {
    /// Builds a layout from ordered `(relative path, length)` descriptors.
    pub fn new(
        id: TorrentId,
        files: Vec<(PathBuf, u64)>,
        piece_length: u32,
        hash_kind: HashKind,
    ) -> Self {
        let mut entries = Vec::with_capacity(files.len());
        let mut offset = 0u64;
        for (path, length) in files {
            entries.push(FileEntry {
                path: path.clone(),
                relative: path,
                length,
                offset,
            });
            offset += length;
        }

        let total_size = offset;
        let piece_count = if total_size == 0 || piece_length == 0 {
            0
        } else {
            total_size.div_ceil(piece_length as u64) as u32
        };

        Self {
            id,
            files: entries,
            piece_length,
            total_size,
            piece_count,
            hash_kind,
        }
    }

    pub fn id(&self) -> TorrentId {
        self.id
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn hash_kind(&self) -> HashKind {
        self.hash_kind
    }

    /// Length of one piece; the last piece covers whatever remains.
    pub fn piece_len(&self, piece: u32) -> Result<u64, DiskError> {
        if piece >= self.piece_count {
            return Err(DiskError::InvalidPieceIndex(piece));
        }
        if piece + 1 == self.piece_count {
            Ok(self.total_size - self.piece_length as u64 * (self.piece_count as u64 - 1))
        } else {
            Ok(self.piece_length as u64)
        }
    }

    /// Global byte offset where a piece starts.
    pub fn piece_start(&self, piece: u32) -> u64 {
        piece as u64 * self.piece_length as u64
    }

    /// Index of the file whose byte range contains `global_offset`.
    ///
    /// Zero-length files never terminate a lookup; they are skipped even when
    /// their start coincides with the offset. The only exception is an
    /// entirely zero-length layout, where offset 0 resolves to the first
    /// file so callers can still address it.
    pub fn find_file_by_offset(&self, global_offset: u64) -> Result<usize, DiskError> {
        if self.total_size == 0 {
            if global_offset == 0 && !self.files.is_empty() {
                return Ok(0);
            }
            return Err(DiskError::OffsetOutOfRange {
                offset: global_offset,
                total: self.total_size,
            });
        }

        self.files
            .iter()
            .position(|f| f.contains(global_offset))
            .ok_or(DiskError::OffsetOutOfRange {
                offset: global_offset,
                total: self.total_size,
            })
    }

    /// Index of the file containing the first byte of a piece.
    ///
    /// When the piece boundary coincides exactly with a file boundary the
    /// earlier file wins.
    pub fn find_file_by_piece(&self, piece: u32) -> Result<usize, DiskError> {
        if piece >= self.piece_count {
            return Err(DiskError::InvalidPieceIndex(piece));
        }
        let start = self.piece_start(piece);

        for (idx, f) in self.files.iter().enumerate() {
            if f.length == 0 {
                continue;
            }
            // Inclusive end: a piece starting exactly where a file ends maps
            // to that (earlier) file.
            if start >= f.offset && start <= f.offset + f.length {
                return Ok(idx);
            }
        }
        Err(DiskError::OffsetOutOfRange {
            offset: start,
            total: self.total_size,
        })
    }

    /// Splits `[global_offset, global_offset + length)` at file boundaries.
    ///
    /// Segments come back in file order; concatenating them reconstructs the
    /// requested range.
    pub fn segments(&self, global_offset: u64, length: u64) -> Result<Vec<FileSegment>, DiskError> {
        if global_offset + length > self.total_size {
            return Err(DiskError::OffsetOutOfRange {
                offset: global_offset + length,
                total: self.total_size,
            });
        }
        if length == 0 {
            return Ok(Vec::new());
        }

        let mut segments = Vec::new();
        let mut current = global_offset;
        let mut remaining = length;

        for (idx, f) in self.files.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if !f.contains(current) {
                continue;
            }

            let file_offset = current - f.offset;
            let available = f.length - file_offset;
            let take = remaining.min(available);

            segments.push(FileSegment {
                file_index: idx,
                file_offset,
                length: take,
            });
            current += take;
            remaining -= take;
        }

        Ok(segments)
    }

    /// Validates a block request and resolves it to a global byte span.
    pub fn block_span(&self, block: &BlockRequest) -> Result<(u64, u64), DiskError> {
        let piece_len = self.piece_len(block.piece)?;
        if block.length == 0 || block.offset as u64 + block.length as u64 > piece_len {
            return Err(DiskError::InvalidBlockBounds {
                piece: block.piece,
                offset: block.offset,
                length: block.length,
            });
        }

        let global = self.piece_start(block.piece) + block.offset as u64;
        Ok((global, block.length as u64))
    }

    /// Updates the tracked path of one file after a successful move.
    pub(crate) fn set_file_path(&mut self, file_index: usize, path: PathBuf) {
        self.files[file_index].path = path;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> TorrentId {
        TorrentId([7u8; 20])
    }

    fn four_file_layout() -> TorrentLayout {
        TorrentLayout::new(
            id(),
            vec![
                (PathBuf::from("a"), 512),
                (PathBuf::from("b"), 1024),
                (PathBuf::from("c"), 1536),
                (PathBuf::from("d"), 16896),
            ],
            16384,
            HashKind::Sha1,
        )
    }

    #[test]
    fn piece_count_and_last_piece_length() {
        let layout = four_file_layout();
        assert_eq!(layout.total_size(), 19968);
        assert_eq!(layout.piece_count(), 2);
        assert_eq!(layout.piece_len(0).unwrap(), 16384);
        assert_eq!(layout.piece_len(1).unwrap(), 19968 - 16384);
        assert!(layout.piece_len(2).is_err());
    }

    #[test]
    fn find_file_by_offset_basic() {
        let layout = four_file_layout();
        assert_eq!(layout.find_file_by_offset(0).unwrap(), 0);
        assert_eq!(layout.find_file_by_offset(511).unwrap(), 0);
        assert_eq!(layout.find_file_by_offset(512).unwrap(), 1);
        assert_eq!(layout.find_file_by_offset(512 + 1024).unwrap(), 2);
        assert_eq!(layout.find_file_by_offset(19967).unwrap(), 3);
        assert!(layout.find_file_by_offset(19968).is_err());
    }

    #[test]
    fn zero_length_files_are_skipped() {
        let layout = TorrentLayout::new(
            id(),
            vec![
                (PathBuf::from("a"), 100),
                (PathBuf::from("empty"), 0),
                (PathBuf::from("b"), 100),
            ],
            64,
            HashKind::Sha1,
        );
        // Offset 100 is covered by "b", not terminated at the empty file that
        // also starts there.
        assert_eq!(layout.find_file_by_offset(100).unwrap(), 2);
    }

    #[test]
    fn zero_length_layout_resolves_offset_zero() {
        let layout = TorrentLayout::new(
            id(),
            vec![(PathBuf::from("empty"), 0)],
            64,
            HashKind::Sha1,
        );
        assert_eq!(layout.find_file_by_offset(0).unwrap(), 0);
        assert!(layout.find_file_by_offset(1).is_err());
        assert_eq!(layout.piece_count(), 0);
    }

    #[test]
    fn piece_on_exact_file_boundary_maps_to_earlier_file() {
        // File "a" ends exactly where piece 1 starts.
        let layout = TorrentLayout::new(
            id(),
            vec![(PathBuf::from("a"), 64), (PathBuf::from("b"), 64)],
            64,
            HashKind::Sha1,
        );
        assert_eq!(layout.find_file_by_piece(0).unwrap(), 0);
        assert_eq!(layout.find_file_by_piece(1).unwrap(), 0);
    }

    #[test]
    fn segments_split_across_files() {
        let layout = four_file_layout();
        let segments = layout.segments(0, 16384).unwrap();
        assert_eq!(
            segments,
            vec![
                FileSegment { file_index: 0, file_offset: 0, length: 512 },
                FileSegment { file_index: 1, file_offset: 0, length: 1024 },
                FileSegment { file_index: 2, file_offset: 0, length: 1536 },
                FileSegment { file_index: 3, file_offset: 0, length: 16384 - 512 - 1024 - 1536 },
            ]
        );

        let total: u64 = segments.iter().map(|s| s.length).sum();
        assert_eq!(total, 16384);
    }

    #[test]
    fn segments_out_of_range_is_parameter_error() {
        let layout = four_file_layout();
        assert!(matches!(
            layout.segments(19000, 2000),
            Err(DiskError::OffsetOutOfRange { .. })
        ));
    }

    #[test]
    fn block_span_validates_piece_bounds() {
        let layout = four_file_layout();
        let ok = BlockRequest { piece: 1, offset: 0, length: 100 };
        assert_eq!(layout.block_span(&ok).unwrap(), (16384, 100));

        let too_long = BlockRequest { piece: 1, offset: 0, length: 16384 };
        assert!(matches!(
            layout.block_span(&too_long),
            Err(DiskError::InvalidBlockBounds { .. })
        ));

        let bad_piece = BlockRequest { piece: 9, offset: 0, length: 1 };
        assert!(matches!(
            layout.block_span(&bad_piece),
            Err(DiskError::InvalidPieceIndex(9))
        ));
    }
}
