use std::time::Instant;

use rand::seq::SliceRandom;

use super::{top_n_by_rate, ChokerClock, ChokerPeer};
use crate::peer::NetHandle;

/// Swapped in once the torrent is fully complete. Download rate is
/// meaningless for a seed, so reciprocation instead rewards the peers
/// we're already uploading to fastest; the cadence and optimistic-unchoke
/// behaviour are unchanged from the leeching choker.
#[derive(Debug)]
pub struct SeedingChoker {
    clock: ChokerClock,
    max_active_peers: usize,
}

impl SeedingChoker {
    pub fn new(now: Instant, max_active_peers: usize) -> Self {
        Self {
            clock: ChokerClock::new(now),
            max_active_peers,
        }
    }

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
            .map(|(h, p)| (*h, p.get_urate()))
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
