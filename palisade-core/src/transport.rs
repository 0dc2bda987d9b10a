//! Peer transport contract and an in-process implementation.
//!
//! The consensus driver hands outbound messages to a [`Transport`]; sending
//! must never block and messages may be dropped; clients time out and
//! retry, and raft re-sends whatever mattered. The channel mesh below wires
//! several nodes together inside one process, which is how the integration
//! tests (and single-binary local clusters) run; a networked transport
//! lives behind the same trait.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use raft::prelude::Message;
use tokio::sync::mpsc;
use tracing::trace;

pub trait Transport: Send + Sync + 'static {
    /// Queue messages for delivery. Must not block; best effort.
    fn send(&self, msgs: Vec<Message>);
    fn add_peer(&self, id: u64, urls: &[String]);
    fn remove_peer(&self, id: u64);
    fn update_peer(&self, id: u64, urls: &[String]);
    fn remove_all_peers(&self);
    fn stop(&self);
}

/// Transport that drops everything. Suitable for single-member clusters,
/// which never produce outbound messages.
#[derive(Default)]
pub struct NoopTransport;

impl Transport for NoopTransport {
    fn send(&self, _msgs: Vec<Message>) {}
    fn add_peer(&self, _id: u64, _urls: &[String]) {}
    fn remove_peer(&self, _id: u64) {}
    fn update_peer(&self, _id: u64, _urls: &[String]) {}
    fn remove_all_peers(&self) {}
    fn stop(&self) {}
}

/// Shared routing table for a set of in-process nodes. Each node registers
/// an inbox and gets a [`ChannelTransport`] that routes by destination id.
#[derive(Default)]
pub struct LocalMesh {
    inboxes: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
}

impl LocalMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalMesh::default())
    }

    /// Create the inbox for `id` and return its receiving half. The caller
    /// pumps received messages into `Server::process`.
    pub fn register(&self, id: u64) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        rx
    }

    pub fn unregister(&self, id: u64) {
        self.inboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn transport(self: &Arc<Self>) -> Arc<ChannelTransport> {
        Arc::new(ChannelTransport {
            mesh: Arc::clone(self),
            peers: Mutex::new(HashSet::new()),
        })
    }

    fn route(&self, msg: Message) {
        let inboxes = self.inboxes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = inboxes.get(&msg.to) {
            // A full or closed inbox means a dropped message, which the
            // contract allows.
            let _ = tx.send(msg);
        }
    }
}

/// Mesh-backed [`Transport`]. Messages are only delivered to peers that
/// have been added, mirroring how a networked transport only dials known
/// members.
pub struct ChannelTransport {
    mesh: Arc<LocalMesh>,
    peers: Mutex<HashSet<u64>>,
}

impl Transport for ChannelTransport {
    fn send(&self, msgs: Vec<Message>) {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        for msg in msgs {
            if msg.to == 0 || !peers.contains(&msg.to) {
                trace!(to = msg.to, "dropping message to unknown peer");
                continue;
            }
            self.mesh.route(msg);
        }
    }

    fn add_peer(&self, id: u64, _urls: &[String]) {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
    }

    fn remove_peer(&self, id: u64) {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    fn update_peer(&self, id: u64, _urls: &[String]) {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
    }

    fn remove_all_peers(&self) {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn stop(&self) {
        self.remove_all_peers();
    }
}
