//! Tracks which pieces of the torrent are complete, independently of the
//! piece database's own notion of completeness (the two must never
//! disagree). Backed by a dense bitset since both the completion map and
//! the peer wire protocol's bitfield message are fixed-size,
//! densely-addressed bit tables.

use bitvec::prelude::*;

pub type Bitfield = BitVec<u8, Msb0>;

#[derive(Debug, Clone)]
pub struct CompletionBitmap {
    bits: Bitfield,
    count: usize,
}

impl CompletionBitmap {
    pub fn new(num_pieces: u32) -> Self {
        Self {
            bits: Bitfield::repeat(false, num_pieces as usize),
            count: 0,
        }
    }

    /// Marks `idx` complete. Idempotent: marking an already-complete index
    /// again is a no-op and does not double count.
    pub fn mark_complete(&mut self, idx: u32) {
        let idx = idx as usize;
        if !self.bits[idx] {
            self.bits.set(idx, true);
            self.count += 1;
        }
    }

    pub fn is_complete(&self, idx: u32) -> bool {
        self.bits[idx as usize]
    }

    /// True once every piece is complete (the torrent is a seed).
    pub fn all_complete(&self) -> bool {
        self.count == self.bits.len()
    }

    pub fn num_complete(&self) -> usize {
        self.count
    }

    pub fn num_pieces(&self) -> usize {
        self.bits.len()
    }

    pub fn as_bitfield(&self) -> &Bitfield {
        &self.bits
    }
}
