//! Peer identity and the peer registry.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::protocol::{Handshaker, PeerConnection};

/// A 20-byte BitTorrent peer identity.
pub type PeerId = [u8; 20];

/// Opaque network handle supplied by the embedder; the mediator never
/// interprets it, only uses it as a registry key and hands it back on
/// outbound send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetHandle(pub u64);

/// Which half of the "exactly one of handshaker or message handler is
/// active" invariant a peer record is currently in. An outbound add
/// starts `Pending` until the embedder confirms the connection attempt.
pub enum ProtocolStage {
    Pending,
    Handshaking(Box<dyn Handshaker>),
    Active(Box<dyn PeerConnection>),
}

impl std::fmt::Debug for ProtocolStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolStage::Pending => write!(f, "Pending"),
            ProtocolStage::Handshaking(_) => write!(f, "Handshaking"),
            ProtocolStage::Active(_) => write!(f, "Active"),
        }
    }
}

#[derive(Debug)]
pub struct PeerRecord {
    /// Remote peer-id; empty until handshake completes.
    pub peer_id: Option<PeerId>,
    pub addr: SocketAddr,
    pub nethandle: NetHandle,
    pub stage: ProtocolStage,
    /// Set once an outbound connection attempt has been reported failed
    /// by the embedder. Terminal: the record is removed on next tick.
    pub failed_connection: bool,
}

impl PeerRecord {
    pub fn is_active(&self) -> bool {
        matches!(self.stage, ProtocolStage::Active(_))
    }

    pub fn connection(&self) -> Option<&dyn PeerConnection> {
        match &self.stage {
            ProtocolStage::Active(conn) => Some(conn.as_ref()),
            _ => None,
        }
    }

    pub fn connection_mut(&mut self) -> Option<&mut (dyn PeerConnection + 'static)> {
        match &mut self.stage {
            ProtocolStage::Active(conn) => Some(conn.as_mut()),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddPeerError {
    #[error("refusing to add ourselves as a peer")]
    SelfAdd,

    #[error("peer already present at this address")]
    DuplicateAddress,

    #[error("registry is at max_peer_connections capacity")]
    RegistryFull,

    #[error("embedder could not start an outbound connection")]
    ConnectFailed,

    #[error("peer is confirmed-bad and must not be re-added")]
    Blacklisted,
}

/// Bijection between network handles and peer records, plus an auxiliary
/// (ip, port) index to suppress duplicate additions.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    by_handle: HashMap<NetHandle, PeerRecord>,
    by_addr: HashMap<SocketAddr, NetHandle>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    pub fn contains_addr(&self, addr: &SocketAddr) -> bool {
        self.by_addr.contains_key(addr)
    }

    pub fn get(&self, handle: NetHandle) -> Option<&PeerRecord> {
        self.by_handle.get(&handle)
    }

    pub fn get_mut(&mut self, handle: NetHandle) -> Option<&mut PeerRecord> {
        self.by_handle.get_mut(&handle)
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&PeerRecord> {
        self.by_addr.get(addr).and_then(|h| self.by_handle.get(h))
    }

    /// Inserts a new record, keyed by its nethandle and address. Callers
    /// are responsible for the self-add / duplicate-address / capacity
    /// checks; this only enforces the bijection invariant itself.
    pub fn insert(&mut self, record: PeerRecord) {
        let handle = record.nethandle;
        let addr = record.addr;
        self.by_addr.insert(addr, handle);
        self.by_handle.insert(handle, record);
    }

    pub fn remove(&mut self, handle: NetHandle) -> Option<PeerRecord> {
        let record = self.by_handle.remove(&handle)?;
        self.by_addr.remove(&record.addr);
        Some(record)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.by_handle.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PeerRecord> {
        self.by_handle.values_mut()
    }

    pub fn handles(&self) -> impl Iterator<Item = NetHandle> + '_ {
        self.by_handle.keys().copied()
    }

    pub fn find_handle_by_peer_id(&self, peer_id: &PeerId) -> Option<NetHandle> {
        self.by_handle
            .values()
            .find(|r| r.peer_id.as_ref() == Some(peer_id))
            .map(|r| r.nethandle)
    }
}
