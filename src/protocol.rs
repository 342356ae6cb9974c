//! Contracts for the handshake and the post-handshake message handler.
//!
//! Byte-level framing and parsing of the peer wire protocol live entirely
//! on the embedder's side of these traits; the mediator only ever calls
//! into a peer connection through them and only ever learns what happened
//! on the wire through the events they return. Returning events rather
//! than letting a peer connection call back into the mediator directly
//! avoids a reference cycle between the two.

use crate::bitfield::Bitfield;
use crate::peer::PeerId;
use crate::piece::BlockInfo;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake bytes do not name the BitTorrent protocol")]
    BadProtocol,
    #[error("info-hash in handshake does not match this torrent")]
    InfoHashMismatch,
    #[error("handshake framing is malformed")]
    Malformed,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed peer wire protocol message")]
    Malformed,
}

/// Result of feeding bytes to an in-progress handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// More bytes are needed before the handshake can be judged.
    Pending,
    /// The handshake completed and the remote peer-id was recovered.
    Complete(PeerId),
}

/// Drives the 68-byte handshake exchange for one peer. A peer record holds
/// exactly one of this or a [`PeerConnection`] at a time.
pub trait Handshaker: Send {
    fn feed(&mut self, bytes: &[u8]) -> Result<HandshakeOutcome, HandshakeError>;

    /// The handshake bytes to send first on an outbound connection.
    fn outbound_bytes(&self) -> Vec<u8>;
}

/// Constructs the per-peer collaborators the byte-level framer/parser is
/// specialised over. Installed once via `set_protocol_factory`; the
/// mediator never constructs a handshaker or connection itself.
pub trait ProtocolFactory: Send {
    fn new_handshaker(&self, info_hash: [u8; 20], my_peer_id: [u8; 20]) -> Box<dyn Handshaker>;
    fn new_connection(&self) -> Box<dyn PeerConnection>;
}

/// Something the mediator learned from a peer connection while processing
/// inbound bytes or a periodic tick.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Log(String),
    /// Bytes ready for the embedder to push out over the wire.
    Send(Vec<u8>),
    /// A full block of payload arrived on a PIECE message.
    PushBlock { block: BlockInfo, data: Vec<u8> },
    /// The peer connection has pipeline room and wants a new block to
    /// request; the mediator will enqueue a `PollBlock` job for it.
    PollBlockRequested,
    /// The peer announced it has a piece (HAVE or BITFIELD).
    PeerHavePiece(u32),
    /// A previously offered block was not served and should be returned to
    /// the request pool.
    PeerGivebackBlock(BlockInfo),
    /// A REQUEST arrived for a block the mediator should serve from the
    /// piece database.
    RequestBlock(BlockInfo),
    /// The connection judged itself unusable and should be torn down.
    Disconnect(String),
}

/// The post-handshake per-peer protocol state machine the mediator drives.
///
/// Rate getters and the choke/unchoke calls are the subset the choker
/// uses; no separate object is needed for that since every peer
/// connection already implements the full trait.
pub trait PeerConnection: Send {
    fn feed(&mut self, bytes: &[u8]) -> Result<Vec<PeerEvent>, ProtocolError>;

    /// Called once per tick; used to expire stale requests or resend a
    /// keepalive, at the connection's own discretion.
    fn periodic(&mut self) -> Vec<PeerEvent>;

    fn send_have(&mut self, idx: u32) -> Vec<PeerEvent>;

    /// Sent exactly once, immediately after the handshake completes.
    fn send_bitfield(&mut self) -> Vec<PeerEvent>;

    fn choke_peer(&mut self) -> Vec<PeerEvent>;
    fn unchoke_peer(&mut self) -> Vec<PeerEvent>;

    /// Offers a block the peer may request; queues a REQUEST subject to
    /// the connection's own pipeline depth limit.
    fn offer_block(&mut self, block: BlockInfo) -> Vec<PeerEvent>;

    /// Supplies previously-requested bytes back to a peer that asked for
    /// them via [`PeerEvent::RequestBlock`].
    fn serve_block(&mut self, block: BlockInfo, data: &[u8]) -> Vec<PeerEvent>;

    fn set_piece_info(&mut self, num_pieces: u32, piece_length: u32);
    fn set_progress(&mut self, completion: &Bitfield);

    fn am_choking(&self) -> bool;
    fn am_interested(&self) -> bool;
    fn peer_choking(&self) -> bool;
    fn peer_interested(&self) -> bool;

    fn download_rate(&self) -> f64;
    fn upload_rate(&self) -> f64;
}
