use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use torrent_disk::{
    BlockRequest, DiskError, DiskManager, DiskSettings, HashKind, MemoryBackend, TorrentId,
    TorrentLayout,
};

const PIECE_LEN: u32 = 16384;

fn layout() -> TorrentLayout {
    TorrentLayout::new(
        TorrentId([8; 20]),
        vec![
            (PathBuf::from("old/movie.mkv"), PIECE_LEN as u64),
            (PathBuf::from("old/subs.srt"), 3584),
        ],
        PIECE_LEN,
        HashKind::Sha1,
    )
}

async fn manager() -> (DiskManager, Arc<MemoryBackend>, TorrentId) {
    let backend = Arc::new(MemoryBackend::new());
    let disk = DiskManager::new(backend.clone(), DiskSettings::default());
    let layout = layout();
    let id = layout.id();
    disk.add_torrent(layout).await.unwrap();
    (disk, backend, id)
}

fn full_piece() -> Bytes {
    Bytes::from((0..PIECE_LEN).map(|i| i as u8).collect::<Vec<u8>>())
}

#[tokio::test]
async fn move_file_relocates_and_redirects_io() {
    let (disk, backend, id) = manager().await;
    let data = full_piece();
    disk.write_block(
        id,
        BlockRequest {
            piece: 0,
            offset: 0,
            length: PIECE_LEN,
        },
        data.clone(),
    )
    .await
    .unwrap();

    disk.move_file(id, 0, PathBuf::from("new/movie.mkv"), false)
        .await
        .unwrap();

    // The dirty block was committed before the rename, to the old path,
    // which then moved wholesale.
    assert!(backend.contents(&PathBuf::from("old/movie.mkv")).is_none());
    assert_eq!(
        backend.contents(&PathBuf::from("new/movie.mkv")).unwrap(),
        &data[..]
    );

    // Subsequent reads follow the new path.
    let read = disk
        .read_block(
            id,
            BlockRequest {
                piece: 0,
                offset: 0,
                length: PIECE_LEN,
            },
        )
        .await
        .unwrap();
    assert_eq!(read, data);
}

#[tokio::test]
async fn move_without_overwrite_refuses_occupied_target() {
    let (disk, backend, id) = manager().await;
    disk.write_block(
        id,
        BlockRequest {
            piece: 0,
            offset: 0,
            length: PIECE_LEN,
        },
        full_piece(),
    )
    .await
    .unwrap();
    disk.flush(id).await.unwrap();

    backend.put(&PathBuf::from("taken.mkv"), vec![0xff; 8]);
    let err = disk
        .move_file(id, 0, PathBuf::from("taken.mkv"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, DiskError::MoveConflict(_)));

    // Nothing moved; the original stays addressable.
    assert!(backend.contents(&PathBuf::from("old/movie.mkv")).is_some());
    assert_eq!(backend.contents(&PathBuf::from("taken.mkv")).unwrap().len(), 8);
}

#[tokio::test]
async fn move_with_overwrite_replaces_target() {
    let (disk, backend, id) = manager().await;
    let data = full_piece();
    disk.write_block(
        id,
        BlockRequest {
            piece: 0,
            offset: 0,
            length: PIECE_LEN,
        },
        data.clone(),
    )
    .await
    .unwrap();

    backend.put(&PathBuf::from("taken.mkv"), vec![0xff; 8]);
    disk.move_file(id, 0, PathBuf::from("taken.mkv"), true)
        .await
        .unwrap();
    assert_eq!(
        backend.contents(&PathBuf::from("taken.mkv")).unwrap(),
        &data[..]
    );
}

#[tokio::test]
async fn move_files_reanchors_the_whole_transfer() {
    let (disk, backend, id) = manager().await;
    let data = full_piece();
    let tail = Bytes::from(vec![0x11u8; 3584]);
    disk.write_block(
        id,
        BlockRequest {
            piece: 0,
            offset: 0,
            length: PIECE_LEN,
        },
        data.clone(),
    )
    .await
    .unwrap();
    disk.write_block(
        id,
        BlockRequest {
            piece: 1,
            offset: 0,
            length: 3584,
        },
        tail.clone(),
    )
    .await
    .unwrap();

    disk.move_files(id, PathBuf::from("/library"), false)
        .await
        .unwrap();

    // Files land under the new root using their layout-relative paths.
    assert_eq!(
        backend
            .contents(&PathBuf::from("/library/old/movie.mkv"))
            .unwrap(),
        &data[..]
    );
    assert_eq!(
        backend
            .contents(&PathBuf::from("/library/old/subs.srt"))
            .unwrap(),
        &tail[..]
    );
    assert!(backend.contents(&PathBuf::from("old/movie.mkv")).is_none());

    assert!(disk.file_exists(id, 0).await.unwrap());
    assert!(disk.file_exists(id, 1).await.unwrap());
}

#[tokio::test]
async fn moving_never_written_files_only_retargets_them() {
    let (disk, backend, id) = manager().await;

    // No bytes were ever written; the move succeeds by bookkeeping alone.
    disk.move_files(id, PathBuf::from("/library"), false)
        .await
        .unwrap();
    assert!(!disk.any_files_exist(id).await.unwrap());

    // Later writes go to the new location.
    disk.write_block(
        id,
        BlockRequest {
            piece: 1,
            offset: 0,
            length: 3584,
        },
        Bytes::from(vec![0x22u8; 3584]),
    )
    .await
    .unwrap();
    disk.flush(id).await.unwrap();
    assert!(backend
        .contents(&PathBuf::from("/library/old/subs.srt"))
        .is_some());
    assert!(backend.contents(&PathBuf::from("old/subs.srt")).is_none());
}
