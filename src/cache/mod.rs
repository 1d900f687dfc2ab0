//! Bounded in-memory holding area for recently written or read bytes.
//!
//! Entries are keyed by transfer identity plus global byte offset and are
//! never visible across transfers. The cache itself performs no I/O: when the
//! budget is exceeded it hands the scheduler an eviction plan listing clean
//! entries to drop and dirty entries to flush first.

mod policy;

pub use policy::{EvictionPolicy, FifoPolicy};

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use crate::layout::TorrentId;

pub type CacheKey = (TorrentId, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Not yet committed to the file back-end.
    Dirty,
    /// A physical flush is in flight.
    Flushing,
    /// Committed; safe to evict.
    Clean,
}

struct CachedBlock {
    data: Bytes,
    state: BlockState,
    /// Bumped when the entry is superseded so a stale flush completion
    /// cannot mark newer data clean.
    epoch: u64,
}

/// One resident fragment of a requested range.
#[derive(Debug, Clone)]
pub struct CacheSpan {
    pub offset: u64,
    pub data: Bytes,
}

/// A dirty entry the scheduler must flush before it can be dropped.
pub struct FlushItem {
    pub key: CacheKey,
    pub epoch: u64,
    pub data: Bytes,
}

/// Outcome of a budget-enforcement pass.
#[derive(Default)]
pub struct EvictionPlan {
    pub evicted: Vec<CacheKey>,
    pub flush: Vec<FlushItem>,
}

impl EvictionPlan {
    fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.flush.is_empty()
    }
}

pub struct BlockCache {
    budget: u64,
    used: u64,
    blocks: HashMap<TorrentId, BTreeMap<u64, CachedBlock>>,
    policy: Box<dyn EvictionPolicy>,
    next_epoch: u64,
}

impl BlockCache {
    pub fn new(budget: u64, policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            budget,
            used: 0,
            blocks: HashMap::new(),
            policy,
            next_epoch: 0,
        }
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn set_budget(&mut self, budget: u64) {
        self.budget = budget;
    }

    /// Inserts (or supersedes) a block, returning its epoch. Resident entries
    /// overlapping the incoming range are trimmed or dropped so no two
    /// entries ever cover the same byte.
    pub fn insert(&mut self, id: TorrentId, offset: u64, data: Bytes, state: BlockState) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        let end = offset + data.len() as u64;

        let entries = self.blocks.entry(id).or_default();

        // A predecessor entry may reach into the new range: cut its tail, and
        // re-key any part that extends past the new range's end.
        if let Some((&prev_off, _)) = entries.range(..offset).next_back() {
            let prev = entries.get_mut(&prev_off).expect("looked up");
            let prev_end = prev_off + prev.data.len() as u64;
            if prev_end > offset {
                let keep = (offset - prev_off) as usize;
                self.used -= prev.data.len() as u64 - keep as u64;
                let tail = (prev_end > end).then(|| {
                    (
                        prev.data.slice((end - prev_off) as usize..),
                        Self::rekeyed_state(prev.state),
                        prev.epoch,
                    )
                });
                prev.data = prev.data.slice(..keep);
                if let Some((tail_data, tail_state, tail_epoch)) = tail {
                    self.used += tail_data.len() as u64;
                    entries.insert(
                        end,
                        CachedBlock {
                            data: tail_data,
                            state: tail_state,
                            epoch: tail_epoch,
                        },
                    );
                    self.policy.record_insert((id, end));
                }
            }
        }

        // Entries starting inside the new range are superseded; one that
        // extends past the end keeps its tail under a new key.
        let covered: Vec<u64> = entries.range(offset..end).map(|(&o, _)| o).collect();
        for old_off in covered {
            let old = entries.remove(&old_off).expect("looked up");
            let old_end = old_off + old.data.len() as u64;
            self.used -= old.data.len() as u64;
            self.policy.record_remove((id, old_off));
            if old_end > end {
                let tail = old.data.slice((end - old_off) as usize..);
                self.used += tail.len() as u64;
                entries.insert(
                    end,
                    CachedBlock {
                        data: tail,
                        state: Self::rekeyed_state(old.state),
                        epoch: old.epoch,
                    },
                );
                self.policy.record_insert((id, end));
            }
        }

        self.used += data.len() as u64;
        entries.insert(offset, CachedBlock { data, state, epoch });
        if state != BlockState::Flushing {
            self.policy.record_insert((id, offset));
        }
        epoch
    }

    /// A fragment moved to a new key can no longer be matched by an in-flight
    /// flush completion, so it goes back to the dirty pool for a re-flush.
    fn rekeyed_state(state: BlockState) -> BlockState {
        match state {
            BlockState::Flushing => BlockState::Dirty,
            other => other,
        }
    }

    /// Inserts only the parts of the range not already resident, as clean
    /// entries. Read-back data arrives asynchronously and must never
    /// supersede bytes written while the physical read was in flight.
    pub fn insert_absent(&mut self, id: TorrentId, offset: u64, data: Bytes) {
        let end = offset + data.len() as u64;
        let resident: Vec<(u64, u64)> = self
            .spans(id, offset, end)
            .into_iter()
            .map(|s| (s.offset, s.offset + s.data.len() as u64))
            .collect();
        let mut cursor = offset;
        for (start, stop) in resident {
            if start > cursor {
                let gap = data.slice((cursor - offset) as usize..(start - offset) as usize);
                self.insert(id, cursor, gap, BlockState::Clean);
            }
            cursor = cursor.max(stop);
        }
        if cursor < end {
            let gap = data.slice((cursor - offset) as usize..);
            self.insert(id, cursor, gap, BlockState::Clean);
        }
    }

    /// Current state of the entry at an exact offset, if resident.
    pub fn state_of(&self, key: CacheKey) -> Option<BlockState> {
        self.blocks.get(&key.0)?.get(&key.1).map(|b| b.state)
    }

    /// Resident fragments overlapping `[start, end)`, clipped and sorted.
    pub fn spans(&self, id: TorrentId, start: u64, end: u64) -> Vec<CacheSpan> {
        let Some(entries) = self.blocks.get(&id) else {
            return Vec::new();
        };
        let mut out = Vec::new();

        // An entry starting before `start` may still cover it.
        if let Some((&off, block)) = entries.range(..start).next_back() {
            let block_end = off + block.data.len() as u64;
            if block_end > start {
                let clip_end = block_end.min(end);
                out.push(CacheSpan {
                    offset: start,
                    data: block
                        .data
                        .slice((start - off) as usize..(clip_end - off) as usize),
                });
            }
        }

        for (&off, block) in entries.range(start..end) {
            let block_end = off + block.data.len() as u64;
            let clip_end = block_end.min(end);
            out.push(CacheSpan {
                offset: off,
                data: block.data.slice(0..(clip_end - off) as usize),
            });
        }
        out
    }

    /// Fragments forming a gap-free run starting exactly at `start`, plus
    /// the offset the run reaches. Used to advance a piece hash over
    /// resident bytes.
    pub fn contiguous_from(&self, id: TorrentId, start: u64, end: u64) -> (Vec<Bytes>, u64) {
        let mut run = Vec::new();
        let mut current = start;
        for span in self.spans(id, start, end) {
            if span.offset > current {
                break;
            }
            let span_end = span.offset + span.data.len() as u64;
            if span_end <= current {
                continue;
            }
            let skip = (current - span.offset) as usize;
            run.push(span.data.slice(skip..));
            current = span_end;
            if current >= end {
                break;
            }
        }
        (run, current.min(end))
    }

    /// Marks a flushed entry clean; ignored when the entry was superseded
    /// in the meantime. Over-budget entries are dropped on the spot, since
    /// they were already selected as victims.
    pub fn mark_clean(&mut self, key: CacheKey, epoch: u64) {
        let Some(entries) = self.blocks.get_mut(&key.0) else {
            return;
        };
        let Some(block) = entries.get_mut(&key.1) else {
            return;
        };
        if block.epoch != epoch {
            return;
        }
        block.state = BlockState::Clean;

        if self.used > self.budget {
            let removed = entries.remove(&key.1).map(|b| b.data.len() as u64);
            if let Some(len) = removed {
                self.used -= len;
            }
        } else {
            self.policy.record_insert(key);
        }
    }

    /// Returns a failed flush to the dirty pool so it can be retried.
    pub fn mark_dirty(&mut self, key: CacheKey, epoch: u64) {
        if let Some(block) = self.blocks.get_mut(&key.0).and_then(|e| e.get_mut(&key.1)) {
            if block.epoch == epoch {
                block.state = BlockState::Dirty;
                self.policy.record_insert(key);
            }
        }
    }

    /// Enforces the byte budget: oldest clean entries are dropped, dirty
    /// victims move to the flushing state and are handed back for physical
    /// writes. With a zero budget every write passes straight through.
    pub fn make_room(&mut self) -> EvictionPlan {
        let mut plan = EvictionPlan::default();
        while self.used > self.budget {
            let Some(key) = self.policy.pop_victim() else {
                break;
            };
            let Some(entries) = self.blocks.get_mut(&key.0) else {
                continue;
            };
            let Some(block) = entries.get_mut(&key.1) else {
                continue;
            };
            match block.state {
                BlockState::Clean => {
                    let len = block.data.len() as u64;
                    entries.remove(&key.1);
                    self.used -= len;
                    plan.evicted.push(key);
                }
                BlockState::Dirty => {
                    block.state = BlockState::Flushing;
                    plan.flush.push(FlushItem {
                        key,
                        epoch: block.epoch,
                        data: block.data.clone(),
                    });
                }
                BlockState::Flushing => {}
            }
        }
        if !plan.is_empty() {
            tracing::debug!(
                evicted = plan.evicted.len(),
                flushing = plan.flush.len(),
                used = self.used,
                budget = self.budget,
                "cache budget enforcement"
            );
        }
        plan
    }

    /// All dirty entries of one transfer, switched to flushing. Used before
    /// moves, closes and explicit flushes.
    pub fn take_dirty(&mut self, id: TorrentId) -> Vec<FlushItem> {
        let Some(entries) = self.blocks.get_mut(&id) else {
            return Vec::new();
        };
        let mut items = Vec::new();
        for (&off, block) in entries.iter_mut() {
            if block.state == BlockState::Dirty {
                block.state = BlockState::Flushing;
                self.policy.record_remove((id, off));
                items.push(FlushItem {
                    key: (id, off),
                    epoch: block.epoch,
                    data: block.data.clone(),
                });
            }
        }
        items
    }

    /// True while any entry of the transfer has not yet been committed.
    pub fn has_uncommitted(&self, id: TorrentId) -> bool {
        self.blocks
            .get(&id)
            .map(|e| e.values().any(|b| b.state != BlockState::Clean))
            .unwrap_or(false)
    }

    /// Drops every entry belonging to one transfer, others untouched.
    pub fn remove_transfer(&mut self, id: TorrentId) {
        if let Some(entries) = self.blocks.remove(&id) {
            for (off, block) in entries {
                self.used -= block.data.len() as u64;
                self.policy.record_remove((id, off));
            }
        }
    }
}
