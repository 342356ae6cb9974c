use std::time::Instant;

use rand::seq::SliceRandom;

use super::{top_n_by_rate, ChokerClock, ChokerPeer};
use crate::peer::NetHandle;

/// Reciprocation by download rate from us, plus a periodic optimistic
/// unchoke of one random choked-and-interested peer.
#[derive(Debug)]
pub struct LeechingChoker {
    clock: ChokerClock,
    max_active_peers: usize,
}

impl LeechingChoker {
    pub fn new(now: Instant, max_active_peers: usize) -> Self {
        Self {
            clock: ChokerClock::new(now),
            max_active_peers,
        }
    }

    /// Runs whichever cadence(s) are due against the live peer set.
    /// `peers` pairs each connected peer's handle with its connection.
    pub fn run(&mut self, now: Instant, peers: &mut [(NetHandle, &mut dyn ChokerPeer)]) {
        if self.clock.reciprocation_due(now) {
            self.reciprocate(peers);
            self.clock.mark_reciprocation(now);
        }
        if self.clock.optimistic_due(now) {
            self.optimistic_unchoke(peers);
            self.clock.mark_optimistic(now);
        }
    }

    fn reciprocate(&self, peers: &mut [(NetHandle, &mut dyn ChokerPeer)]) {
        let candidates: Vec<(NetHandle, f64)> = peers
            .iter()
            .filter(|(_, p)| p.get_is_interested())
            .map(|(h, p)| (*h, p.get_drate()))
            .collect();
        let winners = top_n_by_rate(candidates, self.max_active_peers);

        for (handle, peer) in peers.iter_mut() {
            if winners.contains(handle) {
                peer.unchoke_peer();
            } else {
                peer.choke_peer();
            }
        }
    }

    fn optimistic_unchoke(&self, peers: &mut [(NetHandle, &mut dyn ChokerPeer)]) {
        let choked_interested: Vec<usize> = peers
            .iter()
            .enumerate()
            .filter(|(_, (_, p))| p.get_is_interested() && p.get_is_choked())
            .map(|(i, _)| i)
            .collect();
        if let Some(&idx) = choked_interested.choose(&mut rand::thread_rng()) {
            peers[idx].1.unchoke_peer();
        }
    }
}
