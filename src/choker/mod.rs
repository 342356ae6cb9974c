//! Periodic choke/unchoke decisions.
//!
//! Two concrete policies exist (leeching and seeding); both run on the
//! same 10s reciprocation / 30s optimistic-unchoke cadence and reach
//! peers through the same small slice of [`crate::protocol::PeerConnection`].

pub mod leecher;
pub mod seeder;

use std::time::{Duration, Instant};

use crate::peer::NetHandle;
use crate::protocol::PeerConnection;

pub const RECIPROCATION_PERIOD: Duration = Duration::from_secs(10);
pub const OPTIMISTIC_PERIOD: Duration = Duration::from_secs(30);

/// The subset of a peer connection the choker reads and drives. Every
/// [`PeerConnection`] already satisfies this, so no separate object needs
/// to be constructed per peer.
pub trait ChokerPeer {
    fn get_drate(&self) -> f64;
    fn get_urate(&self) -> f64;
    fn get_is_interested(&self) -> bool;
    fn get_is_choked(&self) -> bool;
    fn choke_peer(&mut self);
    fn unchoke_peer(&mut self);
}

impl<T: PeerConnection + ?Sized> ChokerPeer for T {
    fn get_drate(&self) -> f64 {
        self.download_rate()
    }

    fn get_urate(&self) -> f64 {
        self.upload_rate()
    }

    fn get_is_interested(&self) -> bool {
        self.peer_interested()
    }

    fn get_is_choked(&self) -> bool {
        self.am_choking()
    }

    fn choke_peer(&mut self) {
        PeerConnection::choke_peer(self);
    }

    fn unchoke_peer(&mut self) {
        PeerConnection::unchoke_peer(self);
    }
}

/// Drives which cadence(s) are due given elapsed time since the last
/// check; shared by both concrete chokers so the timer bookkeeping isn't
/// duplicated.
#[derive(Debug)]
pub struct ChokerClock {
    last_reciprocation: Instant,
    last_optimistic: Instant,
}

impl ChokerClock {
    pub fn new(now: Instant) -> Self {
        Self {
            last_reciprocation: now,
            last_optimistic: now,
        }
    }

    pub fn reciprocation_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_reciprocation) >= RECIPROCATION_PERIOD
    }

    pub fn optimistic_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_optimistic) >= OPTIMISTIC_PERIOD
    }

    pub fn mark_reciprocation(&mut self, now: Instant) {
        self.last_reciprocation = now;
    }

    pub fn mark_optimistic(&mut self, now: Instant) {
        self.last_optimistic = now;
    }
}

/// Picks the `max_active_peers` peers with the highest value of `rate_of`
/// among `candidates`, breaking ties by `NetHandle` for a stable result.
pub(crate) fn top_n_by_rate(
    mut candidates: Vec<(NetHandle, f64)>,
    max_active_peers: usize,
) -> Vec<NetHandle> {
    candidates.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0 .0.cmp(&b.0 .0))
    });
    candidates
        .into_iter()
        .take(max_active_peers)
        .map(|(h, _)| h)
        .collect()
}
