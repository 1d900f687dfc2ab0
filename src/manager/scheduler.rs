//! The IO loop: one task owns all shared mutable state.
//!
//! Commands arrive over an mpsc channel; the loop validates, consults the
//! cache and hash accumulators, and debits the rate budgets, all serialized.
//! Physical file operations run in spawned workers that hold per-file locks
//! and report back through the same channel, so continuations never mutate
//! shared state off the loop.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backend::FileBackend;
use crate::cache::{BlockCache, BlockState, CacheKey, FifoPolicy, FlushItem};
use crate::error::DiskError;
use crate::hasher::{Accumulator, PieceDigest, PieceHasher};
use crate::layout::{BlockRequest, TorrentId, TorrentLayout};
use crate::rate::{Direction, RateLimiter};

use super::settings::DiskSettings;

pub(super) type Reply<T> = oneshot::Sender<Result<T, DiskError>>;

/// Occupancy counters reported by [`super::DiskManager::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskStats {
    /// Sum of sizes of reads waiting for rate admission.
    pub pending_read_bytes: u64,
    /// Sum of sizes of writes waiting for rate admission.
    pub pending_write_bytes: u64,
    pub queued_reads: usize,
    pub queued_writes: usize,
    pub cache_used_bytes: u64,
    pub cache_budget_bytes: u64,
}

pub(super) enum Command {
    AddTorrent {
        layout: TorrentLayout,
        reply: Reply<()>,
    },
    RemoveTorrent {
        id: TorrentId,
        reply: Reply<()>,
    },
    Read {
        id: TorrentId,
        block: BlockRequest,
        reply: Reply<Bytes>,
    },
    Write {
        id: TorrentId,
        block: BlockRequest,
        data: Bytes,
        reply: Reply<()>,
    },
    GetHash {
        id: TorrentId,
        piece: u32,
        reply: Reply<PieceDigest>,
    },
    MoveFile {
        id: TorrentId,
        file_index: usize,
        new_path: PathBuf,
        overwrite: bool,
        reply: Reply<()>,
    },
    MoveFiles {
        id: TorrentId,
        new_root: PathBuf,
        overwrite: bool,
        reply: Reply<()>,
    },
    FileExists {
        id: TorrentId,
        file_index: usize,
        reply: Reply<bool>,
    },
    AnyFilesExist {
        id: TorrentId,
        reply: Reply<bool>,
    },
    CloseFiles {
        id: TorrentId,
        reply: Reply<()>,
    },
    Flush {
        id: TorrentId,
        reply: Reply<()>,
    },
    UpdateSettings {
        settings: DiskSettings,
        reply: Reply<()>,
    },
    Tick {
        elapsed: Duration,
        reply: Reply<()>,
    },
    Stats {
        reply: oneshot::Sender<DiskStats>,
    },
    Completion(Completion),
}

/// Posted by workers once their physical operation finished; the loop is the
/// only place state changes in response.
pub(super) enum Completion {
    Flushed {
        id: TorrentId,
        gen: u64,
        key: CacheKey,
        epoch: u64,
        result: io::Result<()>,
    },
    ReadDone {
        id: TorrentId,
        gen: u64,
        inserts: Vec<(u64, Bytes)>,
    },
    HashDone {
        id: TorrentId,
        gen: u64,
        inserts: Vec<(u64, Bytes)>,
    },
    Moved {
        id: TorrentId,
        gen: u64,
        updates: Vec<(usize, PathBuf)>,
        result: Result<(), DiskError>,
        reply: Reply<()>,
    },
    Closed {
        id: TorrentId,
        gen: u64,
        result: io::Result<()>,
        reply: Reply<()>,
    },
    Done {
        id: TorrentId,
        gen: u64,
    },
}

/// A rate-suspended operation, resumed on a later tick.
pub(super) struct QueuedOp {
    id: TorrentId,
    op: OpKind,
}

enum OpKind {
    Read {
        block: BlockRequest,
        reply: Reply<Bytes>,
    },
    Write {
        block: BlockRequest,
        data: Bytes,
        reply: Reply<()>,
    },
}

/// Operations parked until the transfer's physical I/O quiesces.
enum DeferredOp {
    MoveFile {
        file_index: usize,
        new_path: PathBuf,
        overwrite: bool,
        reply: Reply<()>,
    },
    MoveFiles {
        new_root: PathBuf,
        overwrite: bool,
        reply: Reply<()>,
    },
    Close(Reply<()>),
    Flush(Reply<()>),
}

struct TorrentState {
    layout: TorrentLayout,
    /// Distinguishes completions of a removed-and-re-added transfer.
    gen: u64,
    hashers: HashMap<u32, PieceHasher>,
    /// One lock per file: no two overlapping physical ops on the same file.
    locks: Vec<Arc<Mutex<()>>>,
    /// Spawned physical workers not yet completed.
    inflight: usize,
    deferred: VecDeque<DeferredOp>,
    /// First deferred-flush failure; fails subsequent operations.
    sticky: Option<String>,
}

/// One bounded chunk of a physical read or write, path and lock resolved on
/// the loop so workers never look at the layout.
struct SegTask {
    path: PathBuf,
    file_offset: u64,
    length: u64,
    lock: Arc<Mutex<()>>,
}

/// A gap in the cache that must come from the backend.
struct DiskRun {
    global: u64,
    length: u64,
    segs: Vec<SegTask>,
}

enum Part {
    Cached(Bytes),
    Disk(DiskRun),
}

pub(super) struct Scheduler {
    backend: Arc<dyn FileBackend>,
    cache: BlockCache,
    limiter: RateLimiter<QueuedOp>,
    torrents: HashMap<TorrentId, TorrentState>,
    /// Write repliers parked until their own block's flush lands.
    write_waiters: HashMap<(TorrentId, u64, u64), Reply<()>>,
    tx: mpsc::Sender<Command>,
    next_gen: u64,
}

impl Scheduler {
    pub(super) fn new(
        backend: Arc<dyn FileBackend>,
        settings: DiskSettings,
        tx: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            backend,
            cache: BlockCache::new(settings.cache_bytes, Box::new(FifoPolicy::new())),
            limiter: RateLimiter::new(settings.max_read_rate, settings.max_write_rate),
            torrents: HashMap::new(),
            write_waiters: HashMap::new(),
            tx,
            next_gen: 0,
        }
    }

    pub(super) async fn run(mut self, mut rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
            }
        }
        debug!("disk scheduler stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::AddTorrent { layout, reply } => {
                let id = layout.id();
                if self.torrents.contains_key(&id) {
                    self.purge(id);
                }
                let gen = self.next_gen;
                self.next_gen += 1;
                let locks = layout
                    .files()
                    .iter()
                    .map(|_| Arc::new(Mutex::new(())))
                    .collect();
                self.torrents.insert(
                    id,
                    TorrentState {
                        layout,
                        gen,
                        hashers: HashMap::new(),
                        locks,
                        inflight: 0,
                        deferred: VecDeque::new(),
                        sticky: None,
                    },
                );
                debug!(torrent = %id, "torrent added");
                let _ = reply.send(Ok(()));
            }

            Command::RemoveTorrent { id, reply } => {
                self.purge(id);
                debug!(torrent = %id, "torrent removed");
                let _ = reply.send(Ok(()));
            }

            Command::Read { id, block, reply } => {
                let (global, len) = match self.validate(id, &block) {
                    Ok(span) => span,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                let op = QueuedOp {
                    id,
                    op: OpKind::Read { block, reply },
                };
                if let Some(op) = self.limiter.admit(Direction::Read, len, op) {
                    self.exec(op, global);
                }
            }

            Command::Write {
                id,
                block,
                data,
                reply,
            } => {
                let (global, len) = match self.validate(id, &block) {
                    Ok(span) => span,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                if data.len() as u64 != len {
                    let _ = reply.send(Err(DiskError::InvalidBlockBounds {
                        piece: block.piece,
                        offset: block.offset,
                        length: data.len() as u32,
                    }));
                    return;
                }
                let op = QueuedOp {
                    id,
                    op: OpKind::Write { block, data, reply },
                };
                if let Some(op) = self.limiter.admit(Direction::Write, len, op) {
                    self.exec(op, global);
                }
            }

            Command::GetHash { id, piece, reply } => match self.check_ready(id) {
                Ok(()) => self.exec_get_hash(id, piece, reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },

            Command::MoveFile {
                id,
                file_index,
                new_path,
                overwrite,
                reply,
            } => {
                let valid = self.check_ready(id).and_then(|()| {
                    let ts = &self.torrents[&id];
                    if file_index >= ts.layout.files().len() {
                        Err(DiskError::UnknownFile(file_index))
                    } else {
                        Ok(())
                    }
                });
                if let Err(e) = valid {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.defer(
                    id,
                    DeferredOp::MoveFile {
                        file_index,
                        new_path,
                        overwrite,
                        reply,
                    },
                );
            }

            Command::MoveFiles {
                id,
                new_root,
                overwrite,
                reply,
            } => match self.check_ready(id) {
                Ok(()) => self.defer(
                    id,
                    DeferredOp::MoveFiles {
                        new_root,
                        overwrite,
                        reply,
                    },
                ),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },

            Command::FileExists {
                id,
                file_index,
                reply,
            } => {
                let path = match self.torrents.get(&id) {
                    Some(ts) => match ts.layout.files().get(file_index) {
                        Some(f) => f.path.clone(),
                        None => {
                            let _ = reply.send(Err(DiskError::UnknownFile(file_index)));
                            return;
                        }
                    },
                    None => {
                        let _ = reply.send(Err(DiskError::UnknownTorrent(id.to_string())));
                        return;
                    }
                };
                self.spawn_probe(id, vec![path], false, reply);
            }

            Command::AnyFilesExist { id, reply } => {
                let paths = match self.torrents.get(&id) {
                    Some(ts) => ts.layout.files().iter().map(|f| f.path.clone()).collect(),
                    None => {
                        let _ = reply.send(Err(DiskError::UnknownTorrent(id.to_string())));
                        return;
                    }
                };
                self.spawn_probe(id, paths, true, reply);
            }

            Command::CloseFiles { id, reply } => match self.check_ready(id) {
                Ok(()) => self.defer(id, DeferredOp::Close(reply)),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },

            Command::Flush { id, reply } => match self.check_ready(id) {
                Ok(()) => self.defer(id, DeferredOp::Flush(reply)),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },

            Command::UpdateSettings { settings, reply } => {
                for op in self.limiter.set_rate(Direction::Read, settings.max_read_rate) {
                    self.exec_queued(op);
                }
                for op in self
                    .limiter
                    .set_rate(Direction::Write, settings.max_write_rate)
                {
                    self.exec_queued(op);
                }
                self.cache.set_budget(settings.cache_bytes);
                let plan = self.cache.make_room();
                self.apply_flushes(plan.flush);
                debug!(
                    read_rate = settings.max_read_rate,
                    write_rate = settings.max_write_rate,
                    cache_bytes = settings.cache_bytes,
                    "settings updated"
                );
                let _ = reply.send(Ok(()));
            }

            Command::Tick { elapsed, reply } => {
                for op in self.limiter.tick(elapsed) {
                    self.exec_queued(op);
                }
                let _ = reply.send(Ok(()));
            }

            Command::Stats { reply } => {
                let _ = reply.send(DiskStats {
                    pending_read_bytes: self.limiter.pending_bytes(Direction::Read),
                    pending_write_bytes: self.limiter.pending_bytes(Direction::Write),
                    queued_reads: self.limiter.queue_len(Direction::Read),
                    queued_writes: self.limiter.queue_len(Direction::Write),
                    cache_used_bytes: self.cache.used(),
                    cache_budget_bytes: self.cache.budget(),
                });
            }

            Command::Completion(completion) => self.handle_completion(completion),
        }
    }

    // ---- validation -----------------------------------------------------

    fn check_ready(&self, id: TorrentId) -> Result<(), DiskError> {
        let ts = self
            .torrents
            .get(&id)
            .ok_or_else(|| DiskError::UnknownTorrent(id.to_string()))?;
        if let Some(msg) = &ts.sticky {
            return Err(DiskError::WriteFailed(msg.clone()));
        }
        Ok(())
    }

    /// Parameter errors are rejected here, before rate admission and before
    /// any backend contact.
    fn validate(&self, id: TorrentId, block: &BlockRequest) -> Result<(u64, u64), DiskError> {
        self.check_ready(id)?;
        self.torrents[&id].layout.block_span(block)
    }

    // ---- execution of admitted operations --------------------------------

    fn exec_queued(&mut self, op: QueuedOp) {
        let block = match &op.op {
            OpKind::Read { block, .. } => *block,
            OpKind::Write { block, .. } => *block,
        };
        // The transfer may have vanished while the op sat in the rate queue;
        // teardown already failed those, so this lookup only re-resolves the
        // span for live transfers.
        match self.torrents.get(&op.id) {
            Some(ts) => match ts.layout.block_span(&block) {
                Ok((global, _)) => self.exec(op, global),
                Err(e) => fail_queued(op, e),
            },
            None => fail_queued(op, DiskError::TorrentRemoved),
        }
    }

    fn exec(&mut self, op: QueuedOp, global: u64) {
        match op.op {
            OpKind::Read { block, reply } => self.exec_read(op.id, block, global, reply),
            OpKind::Write { block, data, reply } => {
                self.exec_write(op.id, block, data, global, reply)
            }
        }
    }

    fn exec_read(&mut self, id: TorrentId, block: BlockRequest, global: u64, reply: Reply<Bytes>) {
        let end = global + block.length as u64;
        let parts = match self.build_parts(id, global, end) {
            Ok(parts) => parts,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let fully_cached = parts.iter().all(|p| matches!(p, Part::Cached(_)));
        if fully_cached {
            let mut buf = BytesMut::with_capacity((end - global) as usize);
            for part in &parts {
                if let Part::Cached(data) = part {
                    buf.extend_from_slice(data);
                }
            }
            let _ = reply.send(Ok(buf.freeze()));
            return;
        }

        let ts = self.torrents.get_mut(&id).expect("validated");
        ts.inflight += 1;
        let gen = ts.gen;
        let backend = self.backend.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let total = (end - global) as usize;
            let mut buf = vec![0u8; total];
            let mut inserts = Vec::new();
            let mut pos = 0usize;
            let mut failure = None;

            for part in &parts {
                match part {
                    Part::Cached(data) => {
                        buf[pos..pos + data.len()].copy_from_slice(data);
                        pos += data.len();
                    }
                    Part::Disk(run) => {
                        let len = run.length as usize;
                        if let Err(e) = disk_read(&backend, run, &mut buf[pos..pos + len]).await {
                            failure = Some(e);
                            break;
                        }
                        inserts.push((run.global, pos, len));
                        pos += len;
                    }
                }
            }

            // Completion first: a caller reacting to the reply must observe
            // the read-back bytes already cached.
            match failure {
                Some(e) => {
                    let _ = tx
                        .send(Command::Completion(Completion::Done { id, gen }))
                        .await;
                    let _ = reply.send(Err(DiskError::Io(e)));
                }
                None => {
                    let data = Bytes::from(buf);
                    let inserts = inserts
                        .into_iter()
                        .map(|(off, pos, len)| (off, data.slice(pos..pos + len)))
                        .collect();
                    let _ = tx
                        .send(Command::Completion(Completion::ReadDone { id, gen, inserts }))
                        .await;
                    let _ = reply.send(Ok(data));
                }
            }
        });
    }

    fn exec_write(
        &mut self,
        id: TorrentId,
        block: BlockRequest,
        data: Bytes,
        global: u64,
        reply: Reply<()>,
    ) {
        // Feed the rolling hash while the data is at hand.
        {
            let ts = self.torrents.get_mut(&id).expect("validated");
            let kind = ts.layout.hash_kind();
            let piece_start = ts.layout.piece_start(block.piece);
            let piece_end = piece_start + ts.layout.piece_len(block.piece).expect("validated");

            let hasher = ts
                .hashers
                .entry(block.piece)
                .or_insert_with(|| PieceHasher::new(kind));
            if hasher.is_finalized() || (block.offset as u64) < hasher.bytes_hashed() {
                // Superseded or re-verified piece: start a fresh attempt.
                hasher.reset();
            }
            if block.offset as u64 == hasher.bytes_hashed() {
                hasher.advance(&data);
                // Earlier out-of-order arrivals may already be resident.
                let from = piece_start + hasher.bytes_hashed();
                let (run, _) = self.cache.contiguous_from(id, from, piece_end);
                for fragment in run {
                    hasher.advance(&fragment);
                }
            }
        }

        let epoch = self.cache.insert(id, global, data, BlockState::Dirty);
        let plan = self.cache.make_room();

        if plan.flush.iter().any(|f| f.key == (id, global)) {
            // Pass-through (or immediate eviction): the caller learns the
            // outcome of its own physical flush.
            self.write_waiters.insert((id, global, epoch), reply);
        } else {
            let _ = reply.send(Ok(()));
        }
        self.apply_flushes(plan.flush);
    }

    fn exec_get_hash(&mut self, id: TorrentId, piece: u32, reply: Reply<PieceDigest>) {
        let ts = self.torrents.get_mut(&id).expect("checked");
        let kind = ts.layout.hash_kind();
        let piece_len = match ts.layout.piece_len(piece) {
            Ok(len) => len,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let piece_start = ts.layout.piece_start(piece);
        let piece_end = piece_start + piece_len;

        let hasher = ts
            .hashers
            .entry(piece)
            .or_insert_with(|| PieceHasher::new(kind));

        // Catch up over bytes that became contiguous since the last write.
        let hashed_upto = piece_start + hasher.bytes_hashed();
        let (run, _) = self.cache.contiguous_from(id, hashed_upto, piece_end);
        for fragment in run {
            hasher.advance(&fragment);
        }

        let remainder_from = piece_start + hasher.bytes_hashed();
        let acc = hasher.fork();
        hasher.mark_finalized();

        if remainder_from >= piece_end {
            let _ = reply.send(Ok(acc.finalize()));
            return;
        }

        let parts = match self.build_parts(id, remainder_from, piece_end) {
            Ok(parts) => parts,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let ts = self.torrents.get_mut(&id).expect("checked");
        ts.inflight += 1;
        let gen = ts.gen;
        let backend = self.backend.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            // Completion first, so a repeated digest request finds the
            // remainder bytes cached instead of re-reading them.
            match hash_remainder(&backend, acc, parts).await {
                Ok((digest, inserts)) => {
                    let _ = tx
                        .send(Command::Completion(Completion::HashDone { id, gen, inserts }))
                        .await;
                    let _ = reply.send(Ok(digest));
                }
                Err(e) => {
                    let _ = tx
                        .send(Command::Completion(Completion::Done { id, gen }))
                        .await;
                    let _ = reply.send(Err(DiskError::Io(e)));
                }
            }
        });
    }

    // ---- deferred operations (moves, close, flush) -----------------------

    /// Moves, closes and explicit flushes wait until the transfer has no
    /// in-flight physical ops and no uncommitted cache entries.
    fn defer(&mut self, id: TorrentId, op: DeferredOp) {
        let flush_items = self.cache.take_dirty(id);
        self.apply_flushes(flush_items);
        let ts = self.torrents.get_mut(&id).expect("checked");
        ts.deferred.push_back(op);
        self.try_run_deferred(id);
    }

    fn try_run_deferred(&mut self, id: TorrentId) {
        loop {
            let Some(ts) = self.torrents.get_mut(&id) else {
                return;
            };
            if let Some(msg) = ts.sticky.clone() {
                // A deferred flush failed; nothing here can complete cleanly.
                for op in ts.deferred.drain(..) {
                    fail_deferred(op, DiskError::WriteFailed(msg.clone()));
                }
                return;
            }
            if ts.inflight > 0 || self.cache.has_uncommitted(id) {
                return;
            }
            let Some(op) = ts.deferred.pop_front() else {
                return;
            };
            match op {
                DeferredOp::Flush(reply) => self.spawn_sync(id, false, reply),
                DeferredOp::Close(reply) => self.spawn_sync(id, true, reply),
                DeferredOp::MoveFile {
                    file_index,
                    new_path,
                    overwrite,
                    reply,
                } => self.spawn_move(id, vec![(file_index, new_path)], overwrite, reply),
                DeferredOp::MoveFiles {
                    new_root,
                    overwrite,
                    reply,
                } => {
                    let ts = &self.torrents[&id];
                    let moves = ts
                        .layout
                        .files()
                        .iter()
                        .enumerate()
                        .map(|(i, f)| (i, new_root.join(&f.relative)))
                        .collect();
                    self.spawn_move(id, moves, overwrite, reply);
                }
            }
        }
    }

    fn spawn_move(
        &mut self,
        id: TorrentId,
        moves: Vec<(usize, PathBuf)>,
        overwrite: bool,
        reply: Reply<()>,
    ) {
        let ts = self.torrents.get_mut(&id).expect("checked");
        ts.inflight += 1;
        let gen = ts.gen;
        let jobs: Vec<(usize, PathBuf, PathBuf, Arc<Mutex<()>>)> = moves
            .into_iter()
            .map(|(i, new_path)| {
                (
                    i,
                    ts.layout.files()[i].path.clone(),
                    new_path,
                    ts.locks[i].clone(),
                )
            })
            .collect();
        let backend = self.backend.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let mut updates = Vec::new();
            let mut result = Ok(());
            for (file_index, old_path, new_path, lock) in jobs {
                if old_path == new_path {
                    continue;
                }
                let _guard = lock.lock().await;
                let outcome = async {
                    if !overwrite && backend.exists(&new_path).await? {
                        return Err(DiskError::MoveConflict(new_path.clone()));
                    }
                    match backend.rename(&old_path, &new_path, overwrite).await {
                        Ok(()) => Ok(()),
                        // A file never written to has nothing to rename; its
                        // tracked path still moves.
                        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                        Err(e) => Err(DiskError::Io(e)),
                    }
                }
                .await;
                match outcome {
                    Ok(()) => updates.push((file_index, new_path)),
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            let _ = tx
                .send(Command::Completion(Completion::Moved {
                    id,
                    gen,
                    updates,
                    result,
                    reply,
                }))
                .await;
        });
    }

    /// Syncs every file of the transfer to stable storage, optionally
    /// releasing their handles afterwards. Dirty cache entries were already
    /// committed by the quiesce that precedes deferred execution.
    fn spawn_sync(&mut self, id: TorrentId, close: bool, reply: Reply<()>) {
        let ts = self.torrents.get_mut(&id).expect("checked");
        ts.inflight += 1;
        let gen = ts.gen;
        let jobs: Vec<(PathBuf, Arc<Mutex<()>>)> = ts
            .layout
            .files()
            .iter()
            .zip(&ts.locks)
            .map(|(f, lock)| (f.path.clone(), lock.clone()))
            .collect();
        let backend = self.backend.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let mut result = Ok(());
            for (path, lock) in jobs {
                let _guard = lock.lock().await;
                let outcome = async {
                    backend.flush(&path).await?;
                    if close {
                        backend.close(&path).await?;
                    }
                    Ok(())
                }
                .await;
                if let Err(e) = outcome {
                    result = Err(e);
                    break;
                }
            }
            let _ = tx
                .send(Command::Completion(Completion::Closed {
                    id,
                    gen,
                    result,
                    reply,
                }))
                .await;
        });
    }

    fn spawn_probe(&mut self, id: TorrentId, paths: Vec<PathBuf>, any: bool, reply: Reply<bool>) {
        let ts = self.torrents.get_mut(&id).expect("checked");
        ts.inflight += 1;
        let gen = ts.gen;
        let backend = self.backend.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let checks = join_all(paths.iter().map(|p| backend.exists(p))).await;
            let mut outcome: Result<bool, DiskError> = Ok(false);
            for check in checks {
                match check {
                    Ok(true) => {
                        outcome = Ok(true);
                        if any {
                            break;
                        }
                    }
                    Ok(false) => {
                        if !any {
                            outcome = Ok(false);
                            break;
                        }
                    }
                    Err(e) => {
                        outcome = Err(DiskError::Io(e));
                        break;
                    }
                }
            }
            let _ = tx
                .send(Command::Completion(Completion::Done { id, gen }))
                .await;
            let _ = reply.send(outcome);
        });
    }

    // ---- completions ------------------------------------------------------

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Flushed {
                id,
                gen,
                key,
                epoch,
                result,
            } => {
                if !self.still_current(id, gen) {
                    return;
                }
                self.dec_inflight(id);
                match result {
                    Ok(()) => {
                        self.cache.mark_clean(key, epoch);
                        if let Some(waiter) = self.write_waiters.remove(&(id, key.1, epoch)) {
                            let _ = waiter.send(Ok(()));
                        }
                    }
                    Err(e) => {
                        error!(torrent = %id, offset = key.1, "flush failed: {e}");
                        self.cache.mark_dirty(key, epoch);
                        match self.write_waiters.remove(&(id, key.1, epoch)) {
                            Some(waiter) => {
                                let _ = waiter.send(Err(DiskError::Io(e)));
                            }
                            None => {
                                let ts = self.torrents.get_mut(&id).expect("checked");
                                if ts.sticky.is_none() {
                                    ts.sticky = Some(e.to_string());
                                }
                            }
                        }
                    }
                }
                self.try_run_deferred(id);
            }

            Completion::ReadDone { id, gen, inserts }
            | Completion::HashDone { id, gen, inserts } => {
                if !self.still_current(id, gen) {
                    return;
                }
                self.dec_inflight(id);
                // Only fill gaps: a block written while the physical read was
                // in flight must not be clobbered by stale read-back bytes.
                for (offset, data) in inserts {
                    self.cache.insert_absent(id, offset, data);
                }
                let plan = self.cache.make_room();
                self.apply_flushes(plan.flush);
                self.try_run_deferred(id);
            }

            Completion::Moved {
                id,
                gen,
                updates,
                result,
                reply,
            } => {
                if !self.still_current(id, gen) {
                    let _ = reply.send(Err(DiskError::TorrentRemoved));
                    return;
                }
                self.dec_inflight(id);
                let ts = self.torrents.get_mut(&id).expect("checked");
                for (file_index, new_path) in updates {
                    ts.layout.set_file_path(file_index, new_path);
                }
                let _ = reply.send(result);
                self.try_run_deferred(id);
            }

            Completion::Closed {
                id,
                gen,
                result,
                reply,
            } => {
                if !self.still_current(id, gen) {
                    let _ = reply.send(Err(DiskError::TorrentRemoved));
                    return;
                }
                self.dec_inflight(id);
                let _ = reply.send(result.map_err(DiskError::Io));
                self.try_run_deferred(id);
            }

            Completion::Done { id, gen } => {
                if self.still_current(id, gen) {
                    self.dec_inflight(id);
                    self.try_run_deferred(id);
                }
            }
        }
    }

    fn still_current(&self, id: TorrentId, gen: u64) -> bool {
        self.torrents.get(&id).map(|ts| ts.gen == gen).unwrap_or(false)
    }

    fn dec_inflight(&mut self, id: TorrentId) {
        if let Some(ts) = self.torrents.get_mut(&id) {
            ts.inflight = ts.inflight.saturating_sub(1);
        }
    }

    // ---- shared plumbing --------------------------------------------------

    /// Splits `[start, end)` into cache-resident fragments and disk runs,
    /// resolving each disk run to file segments with their locks.
    fn build_parts(&self, id: TorrentId, start: u64, end: u64) -> Result<Vec<Part>, DiskError> {
        let ts = &self.torrents[&id];
        let mut parts = Vec::new();
        let mut current = start;

        let push_disk = |parts: &mut Vec<Part>, from: u64, to: u64| -> Result<(), DiskError> {
            let segs = ts
                .layout
                .segments(from, to - from)?
                .into_iter()
                .map(|s| SegTask {
                    path: ts.layout.files()[s.file_index].path.clone(),
                    file_offset: s.file_offset,
                    length: s.length,
                    lock: ts.locks[s.file_index].clone(),
                })
                .collect();
            parts.push(Part::Disk(DiskRun {
                global: from,
                length: to - from,
                segs,
            }));
            Ok(())
        };

        for span in self.cache.spans(id, start, end) {
            if span.offset > current {
                push_disk(&mut parts, current, span.offset)?;
                current = span.offset;
            }
            let span_end = span.offset + span.data.len() as u64;
            if span_end <= current {
                continue;
            }
            let skip = (current - span.offset) as usize;
            parts.push(Part::Cached(span.data.slice(skip..)));
            current = span_end;
        }
        if current < end {
            push_disk(&mut parts, current, end)?;
        }
        Ok(parts)
    }

    /// Spawns one flush worker per dirty victim handed back by the cache.
    fn apply_flushes(&mut self, items: Vec<FlushItem>) {
        for item in items {
            let (id, global) = item.key;
            let Some(ts) = self.torrents.get_mut(&id) else {
                warn!(torrent = %id, "dropping flush for unknown torrent");
                continue;
            };
            let segs: Vec<SegTask> = match ts.layout.segments(global, item.data.len() as u64) {
                Ok(segs) => segs
                    .into_iter()
                    .map(|s| SegTask {
                        path: ts.layout.files()[s.file_index].path.clone(),
                        file_offset: s.file_offset,
                        length: s.length,
                        lock: ts.locks[s.file_index].clone(),
                    })
                    .collect(),
                Err(e) => {
                    error!(torrent = %id, offset = global, "unflushable cache entry: {e}");
                    continue;
                }
            };
            ts.inflight += 1;
            let gen = ts.gen;
            let backend = self.backend.clone();
            let tx = self.tx.clone();
            let data = item.data;
            let key = item.key;
            let epoch = item.epoch;

            tokio::spawn(async move {
                let mut result = Ok(());
                let mut pos = 0usize;
                for seg in segs {
                    let _guard = seg.lock.lock().await;
                    let len = seg.length as usize;
                    if let Err(e) = backend
                        .write(&seg.path, seg.file_offset, &data[pos..pos + len])
                        .await
                    {
                        result = Err(e);
                        break;
                    }
                    pos += len;
                }
                let _ = tx
                    .send(Command::Completion(Completion::Flushed {
                        id,
                        gen,
                        key,
                        epoch,
                        result,
                    }))
                    .await;
            });
        }
    }

    /// Transfer teardown: queued, deferred and cached state of this transfer
    /// is dropped; other transfers are untouched.
    fn purge(&mut self, id: TorrentId) {
        for op in self.limiter.remove_jobs(|op| op.id == id) {
            fail_queued(op, DiskError::TorrentRemoved);
        }
        let parked: Vec<_> = self
            .write_waiters
            .keys()
            .filter(|(wid, _, _)| *wid == id)
            .copied()
            .collect();
        for key in parked {
            if let Some(waiter) = self.write_waiters.remove(&key) {
                let _ = waiter.send(Err(DiskError::TorrentRemoved));
            }
        }
        if let Some(mut ts) = self.torrents.remove(&id) {
            for op in ts.deferred.drain(..) {
                fail_deferred(op, DiskError::TorrentRemoved);
            }
        }
        self.cache.remove_transfer(id);
    }
}

fn fail_queued(op: QueuedOp, err: DiskError) {
    match op.op {
        OpKind::Read { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        OpKind::Write { reply, .. } => {
            let _ = reply.send(Err(err));
        }
    }
}

fn fail_deferred(op: DeferredOp, err: DiskError) {
    match op {
        DeferredOp::MoveFile { reply, .. }
        | DeferredOp::MoveFiles { reply, .. }
        | DeferredOp::Close(reply)
        | DeferredOp::Flush(reply) => {
            let _ = reply.send(Err(err));
        }
    }
}

/// Reads one disk run into `out`, segment by segment under the file locks.
/// Short reads leave the pre-zeroed tail in place, matching what a sparse or
/// not-yet-extended file would contain.
async fn disk_read(
    backend: &Arc<dyn FileBackend>,
    run: &DiskRun,
    out: &mut [u8],
) -> io::Result<()> {
    let mut pos = 0usize;
    for seg in &run.segs {
        let _guard = seg.lock.lock().await;
        let len = seg.length as usize;
        match backend.read(&seg.path, seg.file_offset, &mut out[pos..pos + len]).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // The file was never created; its bytes read as zeros.
            }
            Err(e) => return Err(e),
        }
        pos += len;
    }
    Ok(())
}

/// Hashes the trailing remainder of a piece against a forked accumulator.
async fn hash_remainder(
    backend: &Arc<dyn FileBackend>,
    mut acc: Accumulator,
    parts: Vec<Part>,
) -> io::Result<(PieceDigest, Vec<(u64, Bytes)>)> {
    let mut inserts = Vec::new();
    for part in &parts {
        match part {
            Part::Cached(data) => acc.update(data),
            Part::Disk(run) => {
                let mut buf = vec![0u8; run.length as usize];
                disk_read(backend, run, &mut buf).await?;
                acc.update(&buf);
                inserts.push((run.global, Bytes::from(buf)));
            }
        }
    }
    Ok((acc.finalize(), inserts))
}
