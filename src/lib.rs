//! Mediator core for a single-torrent BitTorrent swarm participant.
//!
//! This crate owns the peer registry, the job queue, the blacklist, the
//! completion bitmap, and the choker, and wires them to two
//! dependency-injected collaborators (a piece database and a piece
//! selector) plus a protocol factory that produces the per-peer
//! handshake and message-handler state machines. It does not itself
//! touch a socket: the embedder drives it via [`mediator::DownloadManager`]
//! and supplies the connect/send/lock/log primitives through
//! [`callbacks::Callbacks`].

pub mod bitfield;
pub mod blacklist;
pub mod callbacks;
pub mod choker;
pub mod config;
pub mod error;
pub mod job;
pub mod mediator;
pub mod peer;
pub mod piece;
pub mod protocol;
pub mod selector;
pub mod stats;

pub use config::{Config, TorrentGeometry};
pub use error::{DmError, Result};
pub use mediator::DownloadManager;
