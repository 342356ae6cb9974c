//! The outbound capabilities an embedder installs before driving the
//! mediator: connecting to peers, sending bytes, mutual exclusion, and
//! logging. These replace a function-pointer-and-`void*`-context table
//! with trait objects over a value-typed handle.

use std::net::IpAddr;

use crate::peer::NetHandle;

/// Asks the embedder to open an outbound connection. The embedder reports
/// the outcome later via `DownloadManager::peer_connect_ok` /
/// `peer_connect_fail`, keyed on the handle it returns here.
pub trait PeerConnect: Send {
    fn connect(&mut self, ip: IpAddr, port: u16) -> Option<NetHandle>;
}

/// Pushes bytes out over an already-established connection. Returns
/// whether the send was accepted by the embedder's transport.
pub trait PeerSend: Send {
    fn send(&mut self, handle: NetHandle, bytes: &[u8]) -> bool;
}

/// The lock-through-callback primitive: the embedder owns the actual
/// mutual-exclusion primitive (a `Mutex`, a `parking_lot::Mutex`, or
/// something coarser); the mediator only ever mutates shared state through
/// this closure so it never has to choose a lock type itself.
pub trait CallExclusively: Send {
    fn call_exclusively(&mut self, f: &mut dyn FnMut());
}

/// A structured log sink. The mediator only produces events; where they
/// go is entirely the embedder's decision.
pub trait Log: Send {
    fn log(&mut self, source: &str, line: &str);
}

/// The bundle installed once via `set_callbacks`.
pub struct Callbacks {
    pub connect: Box<dyn PeerConnect>,
    pub send: Box<dyn PeerSend>,
    pub lock: Box<dyn CallExclusively>,
    pub log: Box<dyn Log>,
}

/// Formats a line the way the mediator's own log lines are shaped:
/// `"<my_peer_id_hex>,<message>"`, or `"pwp,<peer_id_hex>,<message>"` for
/// peer-scoped events.
pub fn format_log_line(my_peer_id: &[u8; 20], message: &str) -> String {
    format!("{},{}", hex::encode(my_peer_id), message)
}

pub fn format_peer_log_line(peer_id: &[u8; 20], message: &str) -> String {
    format!("pwp,{},{}", hex::encode(peer_id), message)
}
