//! Peer registry
//!
//! Tracks the open link to every known remote node, keyed by the remote's id.
//! Owned by the node's event loop, so it needs no locking.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::network::framing::encode_frame;
use crate::network::link::{LinkId, PeerChannel};
use crate::protocol::MeshMessage;

/// Lifecycle of a registered connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// One registered connection
#[derive(Debug)]
pub struct PeerConnection {
    pub remote_id: String,
    pub display_name: String,
    /// What the remote said about its role in its handshake
    pub claims_leader: bool,
    pub channel: PeerChannel,
    pub state: ConnectionState,
}

/// Snapshot of a connection for display
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSummary {
    pub remote_id: String,
    pub display_name: String,
    pub claims_leader: bool,
    pub link: LinkId,
    pub state: ConnectionState,
}

/// Outcome of a fan-out
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Registry of open peer connections
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<String, PeerConnection>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection for `remote_id`.
    ///
    /// Returns `false` and leaves the registry untouched when an open connection
    /// for that id already exists; the existing connection wins.
    pub fn register_connection(
        &mut self,
        remote_id: &str,
        display_name: &str,
        claims_leader: bool,
        channel: PeerChannel,
    ) -> bool {
        if let Some(existing) = self.peers.get(remote_id) {
            if existing.state == ConnectionState::Open && existing.channel.is_open() {
                tracing::warn!(
                    peer = %remote_id,
                    existing_link = existing.channel.link(),
                    rejected_link = channel.link(),
                    "Duplicate connection, keeping the existing one"
                );
                return false;
            }
        }

        self.peers.insert(
            remote_id.to_string(),
            PeerConnection {
                remote_id: remote_id.to_string(),
                display_name: display_name.to_string(),
                claims_leader,
                channel,
                state: ConnectionState::Open,
            },
        );
        true
    }

    /// Refresh what a repeated handshake says about an already registered peer
    pub fn update_identity(&mut self, remote_id: &str, display_name: &str, claims_leader: bool) -> bool {
        match self.peers.get_mut(remote_id) {
            Some(peer) => {
                peer.display_name = display_name.to_string();
                peer.claims_leader = claims_leader;
                true
            }
            None => false,
        }
    }

    /// Remove the entry for `remote_id`; removing an absent id is a no-op
    pub fn unregister(&mut self, remote_id: &str) -> Option<PeerConnection> {
        self.peers.remove(remote_id).map(|mut peer| {
            peer.state = ConnectionState::Closed;
            peer
        })
    }

    /// Remove whichever entry is carried by `link`, if any
    pub fn unregister_link(&mut self, link: LinkId) -> Option<PeerConnection> {
        let remote_id = self.remote_id_for_link(link)?.to_string();
        self.unregister(&remote_id)
    }

    /// Send `message` to every open connection.
    ///
    /// Each connection is tried independently; a failed send marks that
    /// connection closed and does not stop delivery to the rest.
    pub fn broadcast(&mut self, message: &MeshMessage) -> Result<BroadcastReport> {
        let frame = encode_frame(message)?;
        let mut report = BroadcastReport::default();

        for peer in self.peers.values_mut() {
            if peer.state != ConnectionState::Open {
                continue;
            }
            match peer.channel.send_frame(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(peer = %peer.remote_id, "Broadcast of {} failed: {}", message.kind(), e);
                    peer.state = ConnectionState::Closed;
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            kind = message.kind(),
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast"
        );
        Ok(report)
    }

    /// Ask every link to close
    pub fn close_all(&mut self) {
        for peer in self.peers.values_mut() {
            peer.channel.close();
            peer.state = ConnectionState::Closing;
        }
    }

    /// Snapshot of the registered connections
    pub fn list(&self) -> Vec<PeerSummary> {
        self.peers
            .values()
            .map(|peer| PeerSummary {
                remote_id: peer.remote_id.clone(),
                display_name: peer.display_name.clone(),
                claims_leader: peer.claims_leader,
                link: peer.channel.link(),
                state: peer.state,
            })
            .collect()
    }

    pub fn get(&self, remote_id: &str) -> Option<&PeerConnection> {
        self.peers.get(remote_id)
    }

    pub fn remote_id_for_link(&self, link: LinkId) -> Option<&str> {
        self.peers
            .values()
            .find(|peer| peer.channel.link() == link)
            .map(|peer| peer.remote_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
