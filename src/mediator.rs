//! Wires the peer registry, piece database, selector, choker, and job
//! queue into the single component the embedder drives.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use crate::bitfield::CompletionBitmap;
use crate::blacklist::Blacklist;
use crate::callbacks::{format_log_line, format_peer_log_line, Callbacks};
use crate::choker::leecher::LeechingChoker;
use crate::choker::seeder::SeedingChoker;
use crate::choker::ChokerPeer;
use crate::config::{Config, TorrentGeometry};
use crate::error::{DmError, Result};
use crate::job::{Job, JobQueue};
use crate::peer::{AddPeerError, NetHandle, PeerId, PeerRecord, PeerRegistry, ProtocolStage};
use crate::piece::{PieceDb, WriteOutcome};
use crate::protocol::{PeerEvent, ProtocolFactory};
use crate::selector::PieceSelector;
use crate::stats::{PeerStats, Stats};

pub struct DownloadManager {
    geometry: TorrentGeometry,
    config: Config,

    callbacks: Option<Callbacks>,
    piece_db: Option<Box<dyn PieceDb>>,
    selector: Option<Box<dyn PieceSelector>>,
    protocol_factory: Option<Box<dyn ProtocolFactory>>,

    registry: PeerRegistry,
    jobs: JobQueue,
    blacklist: Blacklist,
    completion: CompletionBitmap,

    leecher_choker: LeechingChoker,
    seeder_choker: Option<SeedingChoker>,
    is_seeding: bool,
}

impl DownloadManager {
    pub fn new(geometry: TorrentGeometry, config: Config, now: Instant) -> Self {
        let completion = CompletionBitmap::new(geometry.num_pieces);
        let leecher_choker = LeechingChoker::new(now, config.max_active_peers);
        let blacklist = Blacklist::new(config.blacklist_promotion_threshold);
        Self {
            geometry,
            config,
            callbacks: None,
            piece_db: None,
            selector: None,
            protocol_factory: None,
            registry: PeerRegistry::new(),
            jobs: JobQueue::new(),
            blacklist,
            completion,
            leecher_choker,
            seeder_choker: None,
            is_seeding: false,
        }
    }

    pub fn set_callbacks(&mut self, callbacks: Callbacks) {
        self.callbacks = Some(callbacks);
    }

    pub fn set_protocol_factory(&mut self, factory: Box<dyn ProtocolFactory>) {
        self.protocol_factory = Some(factory);
    }

    /// Installs the piece database. If the selector is already installed,
    /// scans for already-complete pieces the same way `set_piece_selector`
    /// does when installed second.
    pub fn set_piece_db(&mut self, db: Box<dyn PieceDb>) {
        self.piece_db = Some(db);
        if self.selector.is_some() {
            self.sync_selector_with_existing_completion();
        }
    }

    /// Installs the piece selector. Scans all piece indices and, for each
    /// already complete, informs the selector and marks the completion
    /// bitmap, so installation order relative to `set_piece_db` doesn't
    /// matter.
    pub fn set_piece_selector(&mut self, selector: Box<dyn PieceSelector>) {
        self.selector = Some(selector);
        if self.piece_db.is_some() {
            self.sync_selector_with_existing_completion();
        }
    }

    fn sync_selector_with_existing_completion(&mut self) {
        let db = self.piece_db.as_ref().expect("piece db installed");
        let selector = self.selector.as_mut().expect("selector installed");
        for idx in 0..self.geometry.num_pieces {
            if db.is_complete(idx) {
                selector.have_piece(idx);
                self.completion.mark_complete(idx);
            }
        }
    }

    fn callbacks_mut(&mut self) -> Result<&mut Callbacks> {
        self.callbacks.as_mut().ok_or(DmError::CallbacksNotSet)
    }

    fn log(&mut self, line: String) {
        let my_peer_id = self.config.my_peer_id;
        if let Some(cb) = self.callbacks.as_mut() {
            cb.log.log("dm", &format_log_line(&my_peer_id, &line));
        }
    }

    fn log_peer(&mut self, peer_id: PeerId, line: String) {
        if let Some(cb) = self.callbacks.as_mut() {
            cb.log.log("pwp", &format_peer_log_line(&peer_id, &line));
        }
    }

    /// Pushes a job under the embedder's exclusive-access lock. Inbound
    /// callbacks that reach this (`dispatch_from_buffer`, `peer_connect_ok`)
    /// may run on an arbitrary embedder thread, while `tick`'s drain runs
    /// on whichever thread the embedder calls `tick` from; `call_exclusively`
    /// is the only thing serialising the two.
    fn enqueue_job(&mut self, job: Job) {
        let jobs = &mut self.jobs;
        match self.callbacks.as_mut() {
            Some(cb) => cb.lock.call_exclusively(&mut || jobs.push(job)),
            None => jobs.push(job),
        }
    }

    /// Drains the job queue under the same lock guarding `enqueue_job`.
    fn drain_jobs(&mut self) -> Vec<Job> {
        let jobs = &mut self.jobs;
        let mut drained = Vec::new();
        match self.callbacks.as_mut() {
            Some(cb) => {
                let drained = &mut drained;
                cb.lock.call_exclusively(&mut || *drained = jobs.drain());
            }
            None => drained = jobs.drain(),
        }
        drained
    }

    // ---- peer lifecycle ----------------------------------------------

    pub fn add_peer(
        &mut self,
        peer_id: Option<PeerId>,
        ip: IpAddr,
        port: u16,
        nethandle: Option<NetHandle>,
    ) -> Result<NetHandle> {
        let addr = SocketAddr::new(ip, port);
        if addr == self.config.local_endpoint() {
            return Err(AddPeerError::SelfAdd.into());
        }
        if self.registry.contains_addr(&addr) {
            return Err(AddPeerError::DuplicateAddress.into());
        }
        if let Some(id) = peer_id {
            if self.blacklist.is_confirmed(&id) {
                return Err(AddPeerError::Blacklisted.into());
            }
        }
        if self.registry.len() >= self.config.max_peer_connections {
            return Err(AddPeerError::RegistryFull.into());
        }

        let handle = match nethandle {
            Some(handle) => {
                let factory = self
                    .protocol_factory
                    .as_ref()
                    .ok_or(DmError::ProtocolFactoryNotSet)?;
                let handshaker =
                    factory.new_handshaker(self.geometry.info_hash, self.config.my_peer_id);
                self.registry.insert(PeerRecord {
                    peer_id,
                    addr,
                    nethandle: handle,
                    stage: ProtocolStage::Handshaking(handshaker),
                    failed_connection: false,
                });
                handle
            }
            None => {
                let cb = self.callbacks_mut()?;
                let handle = cb
                    .connect
                    .connect(ip, port)
                    .ok_or(AddPeerError::ConnectFailed)?;
                self.registry.insert(PeerRecord {
                    peer_id,
                    addr,
                    nethandle: handle,
                    stage: ProtocolStage::Pending,
                    failed_connection: false,
                });
                handle
            }
        };

        self.log(format!("peer added,{ip}:{port}"));
        Ok(handle)
    }

    pub fn remove_peer(&mut self, handle: NetHandle) {
        if let Some(record) = self.registry.remove(handle) {
            if let Some(peer_id) = record.peer_id {
                if let Some(selector) = self.selector.as_mut() {
                    selector.remove_peer(peer_id);
                }
            }
            self.log(format!("peer removed,{}", record.addr));
        }
    }

    /// Explicit teardown, replacing the source's unimplemented
    /// `bt_dm_release` (§9): drains the job queue, removes every peer, then
    /// releases the registry, blacklist, selector, choker, and completion
    /// bitmap in that order. The embedder must not call any other operation
    /// on this mediator afterwards.
    pub fn release(&mut self, now: Instant) {
        let _ = self.drain_jobs();

        let handles: Vec<NetHandle> = self.registry.handles().collect();
        for handle in handles {
            self.remove_peer(handle);
        }

        self.registry = PeerRegistry::new();
        self.blacklist = Blacklist::new(self.config.blacklist_promotion_threshold);
        self.selector = None;
        self.leecher_choker = LeechingChoker::new(now, self.config.max_active_peers);
        self.seeder_choker = None;
        self.completion = CompletionBitmap::new(self.geometry.num_pieces);
    }

    /// An outbound connection attempt the embedder started on our behalf
    /// has succeeded; begin the outbound handshake.
    pub fn peer_connect_ok(&mut self, handle: NetHandle, _ip: IpAddr, _port: u16) -> Result<()> {
        let factory = self
            .protocol_factory
            .as_ref()
            .ok_or(DmError::ProtocolFactoryNotSet)?;
        let handshaker = factory.new_handshaker(self.geometry.info_hash, self.config.my_peer_id);
        let outbound = handshaker.outbound_bytes();

        if let Some(record) = self.registry.get_mut(handle) {
            record.stage = ProtocolStage::Handshaking(handshaker);
        }

        let cb = self.callbacks_mut()?;
        cb.send.send(handle, &outbound);
        Ok(())
    }

    pub fn peer_connect_fail(&mut self, handle: NetHandle) {
        if let Some(record) = self.registry.get_mut(handle) {
            record.failed_connection = true;
        }
    }

    // ---- inbound bytes --------------------------------------------------

    /// Returns `true` on success, `false` on unknown handle or a framing
    /// failure that doesn't warrant removal.
    pub fn dispatch_from_buffer(&mut self, handle: NetHandle, bytes: &[u8]) -> bool {
        enum Outcome {
            Pending,
            HandshakeDone(PeerId),
            HandshakeFailed,
            Unknown,
            Active(Vec<PeerEvent>),
            BadMessage(Option<PeerId>),
        }

        let outcome = match self.registry.get_mut(handle) {
            None => Outcome::Unknown,
            Some(record) => match &mut record.stage {
                ProtocolStage::Pending => Outcome::Unknown,
                ProtocolStage::Handshaking(hs) => match hs.feed(bytes) {
                    Ok(crate::protocol::HandshakeOutcome::Pending) => Outcome::Pending,
                    Ok(crate::protocol::HandshakeOutcome::Complete(remote_id)) => {
                        Outcome::HandshakeDone(remote_id)
                    }
                    Err(_) => Outcome::HandshakeFailed,
                },
                ProtocolStage::Active(conn) => match conn.feed(bytes) {
                    Ok(events) => Outcome::Active(events),
                    Err(_) => Outcome::BadMessage(record.peer_id),
                },
            },
        };

        match outcome {
            Outcome::Unknown | Outcome::HandshakeFailed => false,
            Outcome::Pending => true,
            Outcome::HandshakeDone(remote_id) => self.complete_handshake(handle, remote_id),
            Outcome::Active(events) => {
                let pending = events.into_iter().map(|e| (handle, e)).collect();
                self.process_pending(pending);
                true
            }
            Outcome::BadMessage(peer_id) => {
                self.log_peer(peer_id.unwrap_or([0; 20]), "disconnecting,bad msg".to_string());
                self.remove_peer(handle);
                false
            }
        }
    }

    fn complete_handshake(&mut self, handle: NetHandle, remote_id: PeerId) -> bool {
        if self.blacklist.is_confirmed(&remote_id) {
            self.log_peer(remote_id, "disconnecting,confirmed blacklisted".to_string());
            self.remove_peer(handle);
            return false;
        }
        let Some(factory) = self.protocol_factory.as_ref() else {
            return false;
        };
        let mut conn = factory.new_connection();
        conn.set_piece_info(self.geometry.num_pieces, self.geometry.piece_length);
        conn.set_progress(self.completion.as_bitfield());
        let bitfield_events = conn.send_bitfield();

        if let Some(record) = self.registry.get_mut(handle) {
            record.peer_id = Some(remote_id);
            record.stage = ProtocolStage::Active(conn);
        }

        if let Some(selector) = self.selector.as_mut() {
            selector.add_peer(remote_id);
        }

        self.log_peer(remote_id, "handshake complete".to_string());

        let pending: VecDeque<(NetHandle, PeerEvent)> =
            bitfield_events.into_iter().map(|e| (handle, e)).collect();
        let sent_ok = self.process_pending_tracking_send(pending);
        if !sent_ok {
            self.remove_peer(handle);
            return false;
        }
        true
    }

    /// Like `process_pending`, but reports whether every `Send` event in
    /// the batch was accepted, used only for the post-handshake bitfield
    /// send whose failure must remove the peer.
    fn process_pending_tracking_send(&mut self, mut pending: VecDeque<(NetHandle, PeerEvent)>) -> bool {
        let mut all_ok = true;
        while let Some((handle, event)) = pending.pop_front() {
            if let PeerEvent::Send(bytes) = &event {
                let ok = self
                    .callbacks
                    .as_mut()
                    .map(|cb| cb.send.send(handle, bytes))
                    .unwrap_or(false);
                all_ok &= ok;
                continue;
            }
            let mut more = VecDeque::new();
            self.handle_event(handle, event, &mut more);
            pending.extend(more);
        }
        all_ok
    }

    fn process_pending(&mut self, mut pending: VecDeque<(NetHandle, PeerEvent)>) {
        while let Some((handle, event)) = pending.pop_front() {
            let mut more = VecDeque::new();
            self.handle_event(handle, event, &mut more);
            pending.extend(more);
        }
    }

    fn handle_event(
        &mut self,
        handle: NetHandle,
        event: PeerEvent,
        out: &mut VecDeque<(NetHandle, PeerEvent)>,
    ) {
        match event {
            PeerEvent::Log(line) => {
                let peer_id = self.registry.get(handle).and_then(|r| r.peer_id);
                match peer_id {
                    Some(id) => self.log_peer(id, line),
                    None => self.log(line),
                }
            }
            PeerEvent::Send(bytes) => {
                if let Some(cb) = self.callbacks.as_mut() {
                    cb.send.send(handle, &bytes);
                }
            }
            PeerEvent::PushBlock { block, data } => self.pushblock(handle, block.piece_idx, block, &data, out),
            PeerEvent::PollBlockRequested => self.enqueue_job(Job::PollBlock { peer: handle }),
            PeerEvent::PeerHavePiece(idx) => {
                if let Some(peer_id) = self.registry.get(handle).and_then(|r| r.peer_id) {
                    if let Some(selector) = self.selector.as_mut() {
                        selector.peer_have_piece(peer_id, idx);
                    }
                }
            }
            PeerEvent::PeerGivebackBlock(block) => {
                let peer_id = self.registry.get(handle).and_then(|r| r.peer_id);
                if let Some(db) = self.piece_db.as_mut() {
                    db.giveback_block(block.piece_idx, block);
                }
                if let (Some(peer_id), Some(selector)) = (peer_id, self.selector.as_mut()) {
                    selector.peer_giveback_piece(Some(peer_id), block.piece_idx);
                }
            }
            PeerEvent::RequestBlock(block) => {
                let mut buf = Vec::new();
                let available = self
                    .piece_db
                    .as_ref()
                    .map(|db| db.write_block_to_stream(block.piece_idx, block, &mut buf))
                    .unwrap_or(false);
                if available {
                    if let Some(conn) = self.registry.get_mut(handle).and_then(|r| r.connection_mut()) {
                        let events = conn.serve_block(block, &buf);
                        out.extend(events.into_iter().map(|e| (handle, e)));
                    }
                }
            }
            PeerEvent::Disconnect(reason) => {
                let peer_id = self.registry.get(handle).and_then(|r| r.peer_id);
                if let Some(id) = peer_id {
                    self.log_peer(id, format!("disconnecting,{reason}"));
                }
                self.remove_peer(handle);
            }
        }
    }

    /// The critical inbound path: writes a block into a piece and reacts
    /// to the outcome.
    fn pushblock(
        &mut self,
        handle: NetHandle,
        idx: u32,
        block: crate::piece::BlockInfo,
        data: &[u8],
        out: &mut VecDeque<(NetHandle, PeerEvent)>,
    ) {
        let Some(source_peer) = self.registry.get(handle).and_then(|r| r.peer_id) else {
            return;
        };
        let Some(db) = self.piece_db.as_mut() else {
            return;
        };
        let outcome = db.write_block(idx, block, data, source_peer);

        match outcome {
            WriteOutcome::Accepted => {}
            WriteOutcome::CompletedValid => {
                if let Some(selector) = self.selector.as_mut() {
                    selector.have_piece(idx);
                }
                self.completion.mark_complete(idx);
                self.broadcast_have(idx, out);
            }
            WriteOutcome::CompletedInvalid => self.on_invalid_piece(idx, out),
            WriteOutcome::Error => {
                self.log_peer(source_peer, format!("block write error,piece {idx}"));
            }
        }
    }

    fn broadcast_have(&mut self, idx: u32, out: &mut VecDeque<(NetHandle, PeerEvent)>) {
        let active_handles: Vec<NetHandle> = self
            .registry
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.nethandle)
            .collect();
        for h in active_handles {
            if let Some(conn) = self.registry.get_mut(h).and_then(|r| r.connection_mut()) {
                let events = conn.send_have(idx);
                out.extend(events.into_iter().map(|e| (h, e)));
            }
        }
    }

    fn on_invalid_piece(&mut self, idx: u32, _out: &mut VecDeque<(NetHandle, PeerEvent)>) {
        let Some(db) = self.piece_db.as_mut() else {
            return;
        };
        let contributors = db.get_peers(idx);
        let mut to_remove = Vec::new();

        if contributors.len() == 1 {
            let peer = contributors[0];
            self.blacklist.confirm(peer);
            if let Some(h) = self.registry.find_handle_by_peer_id(&peer) {
                to_remove.push(h);
            }
        } else {
            for peer in contributors {
                if self.blacklist.mark_suspected(peer) {
                    if let Some(h) = self.registry.find_handle_by_peer_id(&peer) {
                        to_remove.push(h);
                    }
                }
            }

            if let Some(db) = self.piece_db.as_mut() {
                db.drop_download_progress(idx);
            }
            if let Some(selector) = self.selector.as_mut() {
                selector.peer_giveback_piece(None, idx);
            }
        }

        for h in to_remove {
            self.remove_peer(h);
        }
    }

    // ---- job dispatch ----------------------------------------------------

    fn dispatch_poll_block(&mut self, peer: NetHandle, out: &mut VecDeque<(NetHandle, PeerEvent)>) {
        let Some(peer_id) = self.registry.get(peer).and_then(|r| r.peer_id) else {
            return;
        };

        loop {
            let idx = match self.selector.as_mut().and_then(|s| s.poll_piece(peer_id)) {
                Some(idx) => idx,
                None => return,
            };

            let already_complete = self
                .piece_db
                .as_ref()
                .map(|db| db.is_complete(idx))
                .unwrap_or(true);
            if already_complete {
                if let Some(selector) = self.selector.as_mut() {
                    selector.have_piece(idx);
                }
                continue;
            }

            let mut progressed = false;
            loop {
                let fully_requested = self
                    .piece_db
                    .as_ref()
                    .map(|db| db.is_fully_requested(idx))
                    .unwrap_or(true);
                if fully_requested {
                    break;
                }
                let block = self.piece_db.as_mut().and_then(|db| db.poll_block_request(idx));
                match block {
                    Some(block) => {
                        if let Some(conn) = self.registry.get_mut(peer).and_then(|r| r.connection_mut()) {
                            let events = conn.offer_block(block);
                            out.extend(events.into_iter().map(|e| (peer, e)));
                            progressed = true;
                        }
                    }
                    None => break,
                }
            }
            if progressed {
                return;
            }
        }
    }

    // ---- tick --------------------------------------------------------

    pub fn tick(&mut self, now: Instant, mut stats: Option<&mut Stats>) {
        if self.is_seeding && self.config.shutdown_when_complete {
            if let Some(stats) = stats.as_deref_mut() {
                self.fill_stats(stats);
            }
            return;
        }

        let jobs = self.drain_jobs();
        let mut pending = VecDeque::new();
        for job in jobs {
            match job {
                Job::PollBlock { peer } => self.dispatch_poll_block(peer, &mut pending),
            }
        }
        self.process_pending(pending);

        let handles: Vec<NetHandle> = self.registry.handles().collect();
        let mut pending = VecDeque::new();
        for h in handles {
            if let Some(conn) = self.registry.get_mut(h).and_then(|r| r.connection_mut()) {
                let events = conn.periodic();
                pending.extend(events.into_iter().map(|e| (h, e)));
            }
        }
        self.process_pending(pending);

        let failed: Vec<NetHandle> = self
            .registry
            .iter()
            .filter(|r| r.failed_connection)
            .map(|r| r.nethandle)
            .collect();
        for h in failed {
            self.remove_peer(h);
        }

        self.run_choker(now);

        if self.completion.all_complete() && !self.is_seeding {
            self.is_seeding = true;
            self.seeder_choker = Some(SeedingChoker::new(now, self.config.max_active_peers));
        }

        if let Some(stats) = stats {
            self.fill_stats(stats);
        }
    }

    fn run_choker(&mut self, now: Instant) {
        let handles: Vec<NetHandle> = self.registry.handles().collect();
        let mut conns: Vec<(NetHandle, &mut dyn ChokerPeer)> = Vec::new();
        for h in handles {
            if let Some(conn) = self.registry.get_mut(h).and_then(|r| r.connection_mut()) {
                conns.push((h, conn as &mut dyn ChokerPeer));
            }
        }

        if self.is_seeding {
            if let Some(choker) = self.seeder_choker.as_mut() {
                choker.run(now, &mut conns);
            }
        } else {
            self.leecher_choker.run(now, &mut conns);
        }
    }

    fn fill_stats(&self, stats: &mut Stats) {
        stats.peers.clear();
        for record in self.registry.iter() {
            let conn = record.connection();
            stats.peers.push(PeerStats {
                handle: record.nethandle,
                // Whether the peer is choking us.
                choked: conn.map(|c| c.peer_choking()).unwrap_or(true),
                // Whether we are choking the peer.
                choking: conn.map(|c| c.am_choking()).unwrap_or(true),
                connected: record.is_active(),
                failed_connection: record.failed_connection,
                download_rate: conn.map(|c| c.download_rate()).unwrap_or(0.0),
                upload_rate: conn.map(|c| c.upload_rate()).unwrap_or(0.0),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use crate::piece::BlockInfo;
    use crate::protocol::{
        HandshakeError, HandshakeOutcome, Handshaker, PeerConnection, ProtocolError,
    };

    fn geometry() -> TorrentGeometry {
        TorrentGeometry {
            num_pieces: 2,
            piece_length: 40,
            last_piece_length: 40,
            info_hash: [0; 20],
        }
    }

    fn config() -> Config {
        Config {
            blacklist_promotion_threshold: 2,
            ..Config::default()
        }
    }

    fn peer(b: u8) -> PeerId {
        [b; 20]
    }

    /// A connection double that records every call the mediator makes on
    /// it, shared via `Arc<Mutex<_>>` (the trait requires `Send`) so tests
    /// can inspect it after it has been moved into the registry.
    #[derive(Default, Clone)]
    struct RecordingConnection {
        choking: bool,
        interested: bool,
        peer_choking: bool,
        peer_interested: bool,
        haves_sent: Arc<Mutex<Vec<u32>>>,
        periodic_calls: Arc<Mutex<u32>>,
    }

    impl PeerConnection for RecordingConnection {
        fn feed(&mut self, _bytes: &[u8]) -> std::result::Result<Vec<PeerEvent>, ProtocolError> {
            Ok(vec![])
        }
        fn periodic(&mut self) -> Vec<PeerEvent> {
            *self.periodic_calls.lock().unwrap() += 1;
            vec![]
        }
        fn send_have(&mut self, idx: u32) -> Vec<PeerEvent> {
            self.haves_sent.lock().unwrap().push(idx);
            vec![]
        }
        fn send_bitfield(&mut self) -> Vec<PeerEvent> {
            vec![]
        }
        fn choke_peer(&mut self) -> Vec<PeerEvent> {
            self.choking = true;
            vec![]
        }
        fn unchoke_peer(&mut self) -> Vec<PeerEvent> {
            self.choking = false;
            vec![]
        }
        fn offer_block(&mut self, _block: BlockInfo) -> Vec<PeerEvent> {
            vec![]
        }
        fn serve_block(&mut self, _block: BlockInfo, _data: &[u8]) -> Vec<PeerEvent> {
            vec![]
        }
        fn set_piece_info(&mut self, _num_pieces: u32, _piece_length: u32) {}
        fn set_progress(&mut self, _completion: &crate::bitfield::Bitfield) {}
        fn am_choking(&self) -> bool {
            self.choking
        }
        fn am_interested(&self) -> bool {
            self.interested
        }
        fn peer_choking(&self) -> bool {
            self.peer_choking
        }
        fn peer_interested(&self) -> bool {
            self.peer_interested
        }
        fn download_rate(&self) -> f64 {
            0.0
        }
        fn upload_rate(&self) -> f64 {
            0.0
        }
    }

    struct NoopHandshaker;

    impl Handshaker for NoopHandshaker {
        fn feed(&mut self, _bytes: &[u8]) -> std::result::Result<HandshakeOutcome, HandshakeError> {
            Ok(HandshakeOutcome::Pending)
        }
        fn outbound_bytes(&self) -> Vec<u8> {
            vec![]
        }
    }

    /// A handshaker that completes on the first byte fed to it, reporting a
    /// fixed remote peer-id. Used only to drive `complete_handshake` without
    /// a real byte-level handshake implementation.
    struct CompletingHandshaker(PeerId);

    impl Handshaker for CompletingHandshaker {
        fn feed(&mut self, _bytes: &[u8]) -> std::result::Result<HandshakeOutcome, HandshakeError> {
            Ok(HandshakeOutcome::Complete(self.0))
        }
        fn outbound_bytes(&self) -> Vec<u8> {
            vec![]
        }
    }

    /// A protocol factory that always hands out [`RecordingConnection`]s,
    /// used only by the blacklisted-reconnect test, which needs
    /// `new_connection` to succeed but never constructs a handshaker
    /// through it (the test seeds `ProtocolStage::Handshaking` directly).
    struct RecordingConnectionFactory;

    impl ProtocolFactory for RecordingConnectionFactory {
        fn new_handshaker(&self, _info_hash: [u8; 20], _my_peer_id: [u8; 20]) -> Box<dyn Handshaker> {
            Box::new(NoopHandshaker)
        }
        fn new_connection(&self) -> Box<dyn PeerConnection> {
            Box::new(RecordingConnection::default())
        }
    }

    /// A protocol factory whose connections are always [`RecordingConnection`]s,
    /// used only by the add-peer tests below, which never drive the
    /// handshake to completion.
    struct RecordingProtocolFactory;

    impl ProtocolFactory for RecordingProtocolFactory {
        fn new_handshaker(&self, _info_hash: [u8; 20], _my_peer_id: [u8; 20]) -> Box<dyn Handshaker> {
            Box::new(NoopHandshaker)
        }
        fn new_connection(&self) -> Box<dyn PeerConnection> {
            Box::new(RecordingConnection::default())
        }
    }

    #[derive(Default)]
    struct FakePieceDb {
        complete: std::collections::HashSet<u32>,
        contributors: HashMap<u32, Vec<PeerId>>,
        outcomes: VecDeque<WriteOutcome>,
        dropped: Arc<Mutex<Vec<u32>>>,
    }

    impl FakePieceDb {
        fn with_outcomes(outcomes: Vec<WriteOutcome>) -> Self {
            Self {
                outcomes: outcomes.into(),
                ..Default::default()
            }
        }
    }

    impl PieceDb for FakePieceDb {
        fn is_complete(&self, idx: u32) -> bool {
            self.complete.contains(&idx)
        }
        fn is_fully_requested(&self, _idx: u32) -> bool {
            true
        }
        fn poll_block_request(&mut self, _idx: u32) -> Option<BlockInfo> {
            None
        }
        fn write_block(
            &mut self,
            idx: u32,
            _block: BlockInfo,
            _data: &[u8],
            source_peer: PeerId,
        ) -> WriteOutcome {
            self.contributors.entry(idx).or_default().push(source_peer);
            let outcome = self.outcomes.pop_front().unwrap_or(WriteOutcome::Accepted);
            if outcome == WriteOutcome::CompletedValid {
                self.complete.insert(idx);
            }
            outcome
        }
        fn giveback_block(&mut self, _idx: u32, _block: BlockInfo) {}
        fn num_peers(&self, idx: u32) -> usize {
            self.contributors.get(&idx).map(Vec::len).unwrap_or(0)
        }
        fn get_peers(&self, idx: u32) -> Vec<PeerId> {
            self.contributors.get(&idx).cloned().unwrap_or_default()
        }
        fn drop_download_progress(&mut self, idx: u32) {
            self.dropped.lock().unwrap().push(idx);
        }
        fn write_block_to_stream(&self, _idx: u32, _block: BlockInfo, _out: &mut Vec<u8>) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct FakeSelector {
        have_calls: Vec<u32>,
        giveback_calls: Arc<Mutex<Vec<(Option<PeerId>, u32)>>>,
    }

    impl PieceSelector for FakeSelector {
        fn add_peer(&mut self, _peer: PeerId) {}
        fn remove_peer(&mut self, _peer: PeerId) {}
        fn have_piece(&mut self, idx: u32) {
            self.have_calls.push(idx);
        }
        fn peer_have_piece(&mut self, _peer: PeerId, _idx: u32) {}
        fn peer_giveback_piece(&mut self, peer: Option<PeerId>, idx: u32) {
            self.giveback_calls.lock().unwrap().push((peer, idx));
        }
        fn poll_piece(&mut self, _peer: PeerId) -> Option<u32> {
            None
        }
    }

    fn insert_active_peer(dm: &mut DownloadManager, handle: u64, id: PeerId, port: u16, conn: RecordingConnection) -> NetHandle {
        let h = NetHandle(handle);
        dm.registry.insert(PeerRecord {
            peer_id: Some(id),
            addr: format!("10.0.0.1:{port}").parse().unwrap(),
            nethandle: h,
            stage: ProtocolStage::Active(Box::new(conn)),
            failed_connection: false,
        });
        h
    }

    // Scenario 1 (spec 8.1): happy handshake, single piece.
    #[test]
    fn happy_path_single_piece_completes_and_broadcasts_have() {
        let now = Instant::now();
        let mut dm = DownloadManager::new(geometry(), config(), now);
        dm.set_piece_selector(Box::new(FakeSelector::default()));
        dm.set_piece_db(Box::new(FakePieceDb::with_outcomes(vec![
            WriteOutcome::CompletedValid,
        ])));

        let a = peer(1);
        let conn = RecordingConnection::default();
        let haves_sent = conn.haves_sent.clone();
        let handle = insert_active_peer(&mut dm, 1, a, 100, conn);

        let block = BlockInfo {
            piece_idx: 0,
            offset: 0,
            len: 40,
        };
        let mut out = VecDeque::new();
        dm.pushblock(handle, 0, block, &[0u8; 40], &mut out);

        assert!(dm.completion.is_complete(0));
        assert_eq!(*haves_sent.lock().unwrap(), vec![0]);
    }

    // Scenario 2 (spec 8.2): bad piece, single source, confirms immediately.
    // Per §4.5, the single-source path only blacklists - it does not drop
    // download progress or give the piece back to the selector (that's
    // scoped to the multi-contributor path, scenario 3 below).
    #[test]
    fn invalid_piece_single_contributor_confirms_blacklist() {
        let now = Instant::now();
        let mut dm = DownloadManager::new(geometry(), config(), now);
        let selector = FakeSelector::default();
        let giveback_calls = selector.giveback_calls.clone();
        dm.set_piece_selector(Box::new(selector));
        let db = FakePieceDb::with_outcomes(vec![WriteOutcome::CompletedInvalid]);
        let dropped = db.dropped.clone();
        dm.set_piece_db(Box::new(db));

        let a = peer(1);
        let handle = insert_active_peer(&mut dm, 1, a, 100, RecordingConnection::default());

        let block = BlockInfo {
            piece_idx: 0,
            offset: 0,
            len: 40,
        };
        let mut out = VecDeque::new();
        dm.pushblock(handle, 0, block, &[0u8; 40], &mut out);

        assert!(dm.blacklist.is_confirmed(&a));
        assert!(!dm.completion.is_complete(0));
        assert!(
            dropped.lock().unwrap().is_empty(),
            "single-contributor path must not drop download progress"
        );
        assert!(
            giveback_calls.lock().unwrap().is_empty(),
            "single-contributor path must not give the piece back to the selector"
        );
    }

    // Scenario 3 (spec 8.3): bad piece, two sources, neither confirmed yet.
    #[test]
    fn invalid_piece_multi_contributor_marks_both_suspected_and_gives_back() {
        let now = Instant::now();
        let mut dm = DownloadManager::new(geometry(), config(), now);
        let selector = FakeSelector::default();
        let giveback_calls = selector.giveback_calls.clone();
        dm.set_piece_selector(Box::new(selector));
        let db = FakePieceDb::with_outcomes(vec![
            WriteOutcome::Accepted,
            WriteOutcome::CompletedInvalid,
        ]);
        let dropped = db.dropped.clone();
        dm.set_piece_db(Box::new(db));

        let a = peer(1);
        let b = peer(2);
        let handle_a = insert_active_peer(&mut dm, 1, a, 100, RecordingConnection::default());
        let handle_b = insert_active_peer(&mut dm, 2, b, 101, RecordingConnection::default());

        let block = BlockInfo {
            piece_idx: 0,
            offset: 0,
            len: 20,
        };
        let mut out = VecDeque::new();
        dm.pushblock(handle_a, 0, block, &[0u8; 20], &mut out);
        let block2 = BlockInfo {
            piece_idx: 0,
            offset: 20,
            len: 20,
        };
        dm.pushblock(handle_b, 0, block2, &[0u8; 20], &mut out);

        assert!(!dm.blacklist.is_confirmed(&a));
        assert!(!dm.blacklist.is_confirmed(&b));
        assert!(!dm.completion.is_complete(0));
        assert_eq!(*dropped.lock().unwrap(), vec![0]);
        assert_eq!(*giveback_calls.lock().unwrap(), vec![(None, 0)]);
    }

    // Scenario 4 (spec 8.4): self-add is suppressed.
    #[test]
    fn self_add_is_suppressed() {
        let now = Instant::now();
        let mut dm = DownloadManager::new(geometry(), config(), now);
        let local = dm.config.local_endpoint();
        let result = dm.add_peer(None, local.ip(), local.port(), Some(NetHandle(1)));
        assert!(result.is_err());
        assert_eq!(dm.registry.len(), 0);
    }

    // Scenario 5 (spec 8.5): duplicate (ip, port) is suppressed after the
    // first successful add.
    #[test]
    fn duplicate_address_suppressed_after_first_add() {
        let now = Instant::now();
        let mut dm = DownloadManager::new(geometry(), config(), now);
        dm.set_protocol_factory(Box::new(RecordingProtocolFactory));

        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        let first = dm.add_peer(None, ip, 9000, Some(NetHandle(1)));
        assert!(first.is_ok());
        assert_eq!(dm.registry.len(), 1);

        let second = dm.add_peer(None, ip, 9000, Some(NetHandle(2)));
        assert!(second.is_err());
        assert_eq!(dm.registry.len(), 1);
    }

    // Invariant 6 (spec §8 / §4.5): a confirmed-blacklisted peer never
    // reappears in the registry, even when its peer-id is already known at
    // add time.
    #[test]
    fn add_peer_rejects_a_confirmed_blacklisted_peer_id() {
        let now = Instant::now();
        let mut dm = DownloadManager::new(geometry(), config(), now);
        dm.set_protocol_factory(Box::new(RecordingProtocolFactory));

        let a = peer(1);
        dm.blacklist.confirm(a);

        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        let result = dm.add_peer(Some(a), ip, 9001, Some(NetHandle(1)));

        assert!(result.is_err());
        assert_eq!(dm.registry.len(), 0);
    }

    // Invariant 6, the other reappearance path: a peer whose id was not
    // known at add time (inbound connection, nethandle supplied by the
    // embedder) but turns out to be confirmed-bad once the handshake
    // recovers its remote peer-id must be refused, not activated.
    #[test]
    fn complete_handshake_refuses_a_confirmed_blacklisted_remote_id() {
        let now = Instant::now();
        let mut dm = DownloadManager::new(geometry(), config(), now);
        dm.set_protocol_factory(Box::new(RecordingConnectionFactory));

        let a = peer(1);
        dm.blacklist.confirm(a);

        let handle = NetHandle(1);
        dm.registry.insert(PeerRecord {
            peer_id: None,
            addr: "10.0.0.1:100".parse().unwrap(),
            nethandle: handle,
            stage: ProtocolStage::Handshaking(Box::new(CompletingHandshaker(a))),
            failed_connection: false,
        });

        let ok = dm.dispatch_from_buffer(handle, &[]);

        assert!(!ok);
        assert_eq!(dm.registry.len(), 0);
    }

    // Scenario 6 (spec 8.6): once seeding with shutdown_when_complete set,
    // tick dispatches no jobs and advances no peer, but still fills stats.
    #[test]
    fn tick_is_a_noop_once_seeding_and_shutdown_requested() {
        let now = Instant::now();
        let mut cfg = config();
        cfg.shutdown_when_complete = true;
        let mut dm = DownloadManager::new(geometry(), cfg, now);

        for idx in 0..dm.geometry.num_pieces {
            dm.completion.mark_complete(idx);
        }
        dm.is_seeding = true;

        let conn = RecordingConnection::default();
        let periodic_calls = conn.periodic_calls.clone();
        insert_active_peer(&mut dm, 1, peer(1), 100, conn);
        dm.jobs.push(Job::PollBlock {
            peer: NetHandle(1),
        });

        let mut stats = Stats::default();
        dm.tick(now, Some(&mut stats));

        assert_eq!(*periodic_calls.lock().unwrap(), 0);
        assert_eq!(dm.jobs.len(), 1, "job queue must not be drained while shut down");
        assert_eq!(stats.peer_count(), 1);
    }

    // §9 teardown resolution: release drains jobs, removes every peer, and
    // resets the collaborators so a stale `Instant`-based choker clock
    // doesn't survive into whatever comes next.
    #[test]
    fn release_drains_jobs_and_clears_the_registry() {
        let now = Instant::now();
        let mut dm = DownloadManager::new(geometry(), config(), now);
        dm.set_piece_selector(Box::new(FakeSelector::default()));
        insert_active_peer(&mut dm, 1, peer(1), 100, RecordingConnection::default());
        dm.jobs.push(Job::PollBlock {
            peer: NetHandle(1),
        });

        dm.release(now);

        assert_eq!(dm.registry.len(), 0);
        assert_eq!(dm.jobs.len(), 0);
        assert!(!dm.completion.is_complete(0));
    }

    // Law (spec 8): dispatching PollBlock for a peer whose selector offers
    // only an already-complete index produces no REQUEST.
    #[test]
    fn poll_block_dispatch_is_idempotent_on_already_complete_pieces() {
        #[derive(Default)]
        struct OfferOnceThenNone {
            offered: bool,
        }
        impl PieceSelector for OfferOnceThenNone {
            fn add_peer(&mut self, _peer: PeerId) {}
            fn remove_peer(&mut self, _peer: PeerId) {}
            fn have_piece(&mut self, _idx: u32) {}
            fn peer_have_piece(&mut self, _peer: PeerId, _idx: u32) {}
            fn peer_giveback_piece(&mut self, _peer: Option<PeerId>, _idx: u32) {}
            fn poll_piece(&mut self, _peer: PeerId) -> Option<u32> {
                if self.offered {
                    None
                } else {
                    self.offered = true;
                    Some(0)
                }
            }
        }

        let now = Instant::now();
        let mut dm = DownloadManager::new(geometry(), config(), now);
        dm.set_piece_selector(Box::new(OfferOnceThenNone::default()));
        let mut db = FakePieceDb::default();
        db.complete.insert(0);
        dm.set_piece_db(Box::new(db));

        let handle = insert_active_peer(&mut dm, 1, peer(1), 100, RecordingConnection::default());
        let mut out = VecDeque::new();
        dm.dispatch_poll_block(handle, &mut out);

        assert!(
            out.is_empty(),
            "no REQUEST should be offered for an already-complete piece"
        );
    }
}
