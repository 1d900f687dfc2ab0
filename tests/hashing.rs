use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use torrent_disk::{
    BlockRequest, DiskManager, DiskSettings, HashKind, MemoryBackend, TorrentId, TorrentLayout,
};

const PIECE_LEN: u32 = 16384;

fn layout(kind: HashKind) -> TorrentLayout {
    TorrentLayout::new(
        TorrentId([7; 20]),
        vec![(PathBuf::from("payload.bin"), 2 * PIECE_LEN as u64)],
        PIECE_LEN,
        kind,
    )
}

fn piece_data(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

async fn manager(kind: HashKind) -> (DiskManager, Arc<MemoryBackend>, TorrentId) {
    let backend = Arc::new(MemoryBackend::new());
    let disk = DiskManager::new(backend.clone(), DiskSettings::default());
    let layout = layout(kind);
    let id = layout.id();
    disk.add_torrent(layout).await.unwrap();
    (disk, backend, id)
}

#[tokio::test]
async fn out_of_order_writes_hash_like_sequential() {
    let (disk, _backend, id) = manager(HashKind::Sha1).await;
    let data = piece_data(3, PIECE_LEN as usize);

    // Second half first, then the first half.
    let half = PIECE_LEN / 2;
    disk.write_block(
        id,
        BlockRequest {
            piece: 0,
            offset: half,
            length: half,
        },
        Bytes::copy_from_slice(&data[half as usize..]),
    )
    .await
    .unwrap();
    disk.write_block(
        id,
        BlockRequest {
            piece: 0,
            offset: 0,
            length: half,
        },
        Bytes::copy_from_slice(&data[..half as usize]),
    )
    .await
    .unwrap();

    let digest = disk.get_hash(id, 0).await.unwrap();
    let expected: [u8; 20] = Sha1::digest(&data).into();
    assert_eq!(digest.sha1, Some(expected));
    assert_eq!(digest.sha256, None);
}

#[tokio::test]
async fn all_write_orders_produce_the_direct_digest() {
    let data = piece_data(6, PIECE_LEN as usize);
    let expected: [u8; 20] = Sha1::digest(&data).into();
    let quarter = PIECE_LEN / 4;

    // Forward, reverse, and one adjacent swap.
    for order in [[0u32, 1, 2, 3], [3, 2, 1, 0], [0, 2, 1, 3]] {
        let (disk, _backend, id) = manager(HashKind::Sha1).await;
        for block_index in order {
            let offset = block_index * quarter;
            disk.write_block(
                id,
                BlockRequest {
                    piece: 0,
                    offset,
                    length: quarter,
                },
                Bytes::copy_from_slice(
                    &data[offset as usize..(offset + quarter) as usize],
                ),
            )
            .await
            .unwrap();
        }
        let digest = disk.get_hash(id, 0).await.unwrap();
        assert_eq!(digest.sha1, Some(expected), "order {order:?}");
    }
}

#[tokio::test]
async fn interleaved_pieces_hash_independently() {
    let (disk, _backend, id) = manager(HashKind::Sha1).await;
    let data0 = piece_data(1, PIECE_LEN as usize);
    let data1 = piece_data(2, PIECE_LEN as usize);

    // Alternate quarter-piece writes between the two pieces.
    let quarter = PIECE_LEN / 4;
    for step in 0..4u32 {
        for (piece, data) in [(0u32, &data0), (1u32, &data1)] {
            let offset = step * quarter;
            disk.write_block(
                id,
                BlockRequest {
                    piece,
                    offset,
                    length: quarter,
                },
                Bytes::copy_from_slice(
                    &data[offset as usize..(offset + quarter) as usize],
                ),
            )
            .await
            .unwrap();
        }
    }

    let expected0: [u8; 20] = Sha1::digest(&data0).into();
    let expected1: [u8; 20] = Sha1::digest(&data1).into();
    assert_eq!(disk.get_hash(id, 0).await.unwrap().sha1, Some(expected0));
    assert_eq!(disk.get_hash(id, 1).await.unwrap().sha1, Some(expected1));
}

#[tokio::test]
async fn repeated_hash_of_partial_piece_is_stable_and_cached() {
    let (disk, backend, id) = manager(HashKind::Sha1).await;

    // Only the first half of the piece is ever written; the unwritten tail
    // reads as zeros.
    let half = PIECE_LEN / 2;
    let mut full = piece_data(9, half as usize);
    full.resize(PIECE_LEN as usize, 0);
    disk.write_block(
        id,
        BlockRequest {
            piece: 0,
            offset: 0,
            length: half,
        },
        Bytes::copy_from_slice(&full[..half as usize]),
    )
    .await
    .unwrap();

    let first = disk.get_hash(id, 0).await.unwrap();
    let expected: [u8; 20] = Sha1::digest(&full).into();
    assert_eq!(first.sha1, Some(expected));

    // The remainder was cached by the first request; asking again must not
    // touch the back-end.
    let reads_after_first = backend.read_ops();
    let second = disk.get_hash(id, 0).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(backend.read_ops(), reads_after_first);
}

#[tokio::test]
async fn hybrid_kind_produces_both_digests() {
    let (disk, _backend, id) = manager(HashKind::Hybrid).await;
    let data = piece_data(5, PIECE_LEN as usize);

    disk.write_block(
        id,
        BlockRequest {
            piece: 0,
            offset: 0,
            length: PIECE_LEN,
        },
        Bytes::from(data.clone()),
    )
    .await
    .unwrap();

    let digest = disk.get_hash(id, 0).await.unwrap();
    let sha1: [u8; 20] = Sha1::digest(&data).into();
    let sha256: [u8; 32] = Sha256::digest(&data).into();
    assert_eq!(digest.sha1, Some(sha1));
    assert_eq!(digest.sha256, Some(sha256));
}

#[tokio::test]
async fn rewrite_after_hash_restarts_the_piece() {
    let (disk, _backend, id) = manager(HashKind::Sha1).await;
    let wrong = piece_data(4, PIECE_LEN as usize);
    let right = piece_data(8, PIECE_LEN as usize);

    let block = BlockRequest {
        piece: 0,
        offset: 0,
        length: PIECE_LEN,
    };
    disk.write_block(id, block, Bytes::from(wrong.clone()))
        .await
        .unwrap();
    let first = disk.get_hash(id, 0).await.unwrap();
    let wrong_digest: [u8; 20] = Sha1::digest(&wrong).into();
    assert_eq!(first.sha1, Some(wrong_digest));

    // Overwrite the whole piece, as a caller would after a failed
    // verification, and hash again.
    disk.write_block(id, block, Bytes::from(right.clone()))
        .await
        .unwrap();
    let second = disk.get_hash(id, 0).await.unwrap();
    let right_digest: [u8; 20] = Sha1::digest(&right).into();
    assert_eq!(second.sha1, Some(right_digest));
}
