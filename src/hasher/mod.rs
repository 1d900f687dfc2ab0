//! Rolling per-piece hash state.
//!
//! The accumulator only ever consumes bytes starting exactly at the confirmed
//! contiguous offset; gapped blocks are parked elsewhere (cache or disk) and
//! never advance it. Finishing a hash works on a fork of the accumulator so
//! the confirmed prefix is never re-hashed and the call is repeatable.

use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Which digest scheme(s) a transfer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Sha1,
    Sha256,
    /// Hybrid transfers carry both a 20-byte and a 32-byte hash per piece.
    Hybrid,
}

/// Finalized digest(s) for one piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceDigest {
    pub sha1: Option<[u8; 20]>,
    pub sha256: Option<[u8; 32]>,
}

/// Cloneable rolling hash state.
#[derive(Clone)]
pub struct Accumulator {
    sha1: Option<Sha1>,
    sha256: Option<Sha256>,
}

impl Accumulator {
    fn new(kind: HashKind) -> Self {
        let (v1, v2) = match kind {
            HashKind::Sha1 => (true, false),
            HashKind::Sha256 => (false, true),
            HashKind::Hybrid => (true, true),
        };
        Self {
            sha1: v1.then(Sha1::new),
            sha256: v2.then(Sha256::new),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        if let Some(h) = &mut self.sha1 {
            h.update(data);
        }
        if let Some(h) = &mut self.sha256 {
            h.update(data);
        }
    }

    pub fn finalize(self) -> PieceDigest {
        PieceDigest {
            sha1: self.sha1.map(|h| h.finalize().into()),
            sha256: self.sha256.map(|h| h.finalize().into()),
        }
    }
}

/// Verification progress for one piece.
pub struct PieceHasher {
    kind: HashKind,
    acc: Accumulator,
    /// Piece-local length of the confirmed contiguous prefix.
    bytes_hashed: u64,
    /// Set once a full digest has been produced; the next write to this
    /// piece starts a fresh verification attempt.
    finalized: bool,
}

impl PieceHasher {
    pub fn new(kind: HashKind) -> Self {
        Self {
            kind,
            acc: Accumulator::new(kind),
            bytes_hashed: 0,
            finalized: false,
        }
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn mark_finalized(&mut self) {
        self.finalized = true;
    }

    /// Feeds bytes that start exactly at the confirmed offset.
    pub fn advance(&mut self, data: &[u8]) {
        self.acc.update(data);
        self.bytes_hashed += data.len() as u64;
    }

    /// Discards all progress; used when already-hashed bytes are superseded.
    pub fn reset(&mut self) {
        self.acc = Accumulator::new(self.kind);
        self.bytes_hashed = 0;
        self.finalized = false;
    }

    /// Clones the accumulator so the remainder of the piece can be hashed
    /// without consuming the confirmed prefix.
    pub fn fork(&self) -> Accumulator {
        self.acc.clone()
    }
}
