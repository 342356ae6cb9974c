//! Read-only typed access to the mediator's tunables.
//!
//! Parsing these out of a file or CLI is the embedder's responsibility;
//! this crate only needs the typed, already-resolved values, handed in by
//! whoever constructs the mediator.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Immutable torrent geometry, supplied once at construction.
#[derive(Debug, Clone, Copy)]
pub struct TorrentGeometry {
    pub num_pieces: u32,
    pub piece_length: u32,
    pub last_piece_length: u32,
    pub info_hash: [u8; 20],
}

impl TorrentGeometry {
    pub fn piece_length(&self, idx: u32) -> u32 {
        debug_assert!(idx < self.num_pieces, "piece index out of bounds");
        if idx == self.num_pieces - 1 {
            self.last_piece_length
        } else {
            self.piece_length
        }
    }
}

/// Tunables governing peer limits, request pacing, and storage.
#[derive(Debug, Clone)]
pub struct Config {
    pub my_peer_id: [u8; 20],
    pub my_ip: IpAddr,
    pub pwp_listen_port: u16,
    pub max_peer_connections: usize,
    pub max_active_peers: usize,
    pub max_pending_requests: usize,
    pub download_path: std::path::PathBuf,
    pub max_cache_mem_bytes: u64,
    pub shutdown_when_complete: bool,
    /// Corroborating "potentially bad" events required to promote a peer to
    /// the confirmed blacklist.
    pub blacklist_promotion_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            my_peer_id: [0; 20],
            my_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            pwp_listen_port: 6881,
            max_peer_connections: 32,
            max_active_peers: 32,
            max_pending_requests: 10,
            download_path: std::path::PathBuf::from("."),
            max_cache_mem_bytes: 1_000_000,
            shutdown_when_complete: false,
            blacklist_promotion_threshold: 2,
        }
    }
}

impl Config {
    /// The local listen address, used by `add_peer` to suppress a self-add.
    pub fn local_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.my_ip, self.pwp_listen_port)
    }
}
