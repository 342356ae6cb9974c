//! The piece database contract.
//!
//! The storage backend itself - block read/write, hashing, piece assembly -
//! is an external collaborator owned by the embedder. The mediator only
//! ever reaches pieces through this trait, never the storage directly.

use crate::peer::PeerId;

/// A sub-range of a piece exchanged in a single REQUEST/PIECE message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece_idx: u32,
    pub offset: u32,
    pub len: u32,
}

/// Outcome of writing a received block into a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Accepted, piece still incomplete.
    Accepted,
    /// The piece is now fully received and its hash matches.
    CompletedValid,
    /// The piece is now fully received but its hash does not match.
    CompletedInvalid,
    /// A local I/O error; piece state is unchanged, a retry may succeed.
    Error,
}

/// The piece database contract the mediator depends on.
///
/// Every operation takes the piece index directly, rather than returning a
/// per-piece handle to operate on separately - that would require a trait
/// object with its own mutable-borrow lifetime for no benefit here.
pub trait PieceDb {
    fn is_complete(&self, idx: u32) -> bool;

    /// Every block in the piece has been offered to some peer (not
    /// necessarily received yet).
    fn is_fully_requested(&self, idx: u32) -> bool;

    /// Produces the next outstanding block to request, or `None` if the
    /// piece is fully requested.
    fn poll_block_request(&mut self, idx: u32) -> Option<BlockInfo>;

    /// `source_peer` attributes the contributed bytes to a peer, for
    /// blacklist accounting.
    fn write_block(
        &mut self,
        idx: u32,
        block: BlockInfo,
        data: &[u8],
        source_peer: PeerId,
    ) -> WriteOutcome;

    /// Returns an unserved or invalidated block to the request pool.
    fn giveback_block(&mut self, idx: u32, block: BlockInfo);

    /// Count of distinct peers that contributed any byte to this piece's
    /// current download attempt.
    fn num_peers(&self, idx: u32) -> usize;

    /// The peers counted by [`PieceDb::num_peers`].
    fn get_peers(&self, idx: u32) -> Vec<PeerId>;

    /// Discards all partial progress on the piece so it can be downloaded
    /// again from scratch.
    fn drop_download_progress(&mut self, idx: u32);

    /// Serves previously-written bytes back out for upload; appends to
    /// `out` and returns whether the block was available.
    fn write_block_to_stream(&self, idx: u32, block: BlockInfo, out: &mut Vec<u8>) -> bool;
}
