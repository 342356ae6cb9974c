use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;

use super::{PieceInfo, PieceSelector};
use crate::peer::PeerId;

/// Picks uniformly at random among pieces the given peer has and we
/// don't, and that aren't already in flight to someone else.
#[derive(Debug)]
pub struct RandomSelector {
    pieces: Vec<PieceInfo>,
    have: Vec<bool>,
    peer_bitfields: HashMap<PeerId, HashSet<u32>>,
}

impl RandomSelector {
    pub fn new(num_pieces: u32) -> Self {
        Self {
            pieces: vec![PieceInfo::default(); num_pieces as usize],
            have: vec![false; num_pieces as usize],
            peer_bitfields: HashMap::new(),
        }
    }
}

impl PieceSelector for RandomSelector {
    fn add_peer(&mut self, peer: PeerId) {
        self.peer_bitfields.entry(peer).or_default();
    }

    fn remove_peer(&mut self, peer: PeerId) {
        self.peer_bitfields.remove(&peer);
    }

    fn have_piece(&mut self, idx: u32) {
        self.have[idx as usize] = true;
    }

    fn peer_have_piece(&mut self, peer: PeerId, idx: u32) {
        self.pieces[idx as usize].frequency += 1;
        self.peer_bitfields.entry(peer).or_default().insert(idx);
    }

    fn peer_giveback_piece(&mut self, peer: Option<PeerId>, idx: u32) {
        self.pieces[idx as usize].in_flight = false;
        if let Some(peer) = peer {
            if let Some(bf) = self.peer_bitfields.get_mut(&peer) {
                bf.remove(&idx);
            }
        }
    }

    fn poll_piece(&mut self, peer: PeerId) -> Option<u32> {
        let candidates: Vec<u32> = self
            .peer_bitfields
            .get(&peer)?
            .iter()
            .copied()
            .filter(|&idx| !self.have[idx as usize] && !self.pieces[idx as usize].in_flight)
            .collect();

        let chosen = *candidates.choose(&mut rand::thread_rng())?;
        self.pieces[chosen as usize].in_flight = true;
        Some(chosen)
    }
}
