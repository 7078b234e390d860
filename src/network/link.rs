//! Handles to open transport links

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::error::{NetworkError, Result};
use crate::network::framing::encode_frame;
use crate::protocol::MeshMessage;

/// Process-unique id of one transport link
pub type LinkId = u64;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh link id
pub fn next_link_id() -> LinkId {
    NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Which side opened the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Instruction for a link's writer task
#[derive(Debug)]
pub enum Outbound {
    Frame(Bytes),
    Close,
    /// Close because the peer is already linked; an outbound dialer stops
    Reject,
}

/// Sending half of one ordered, reliable link
///
/// Sends never block: frames are queued for the link's writer task.
#[derive(Debug, Clone)]
pub struct PeerChannel {
    link: LinkId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl PeerChannel {
    /// Create a channel and the receiver its writer task drains
    pub fn new(link: LinkId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { link, tx }, rx)
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    /// Encode and queue one message
    pub fn send(&self, message: &MeshMessage) -> Result<()> {
        let frame = encode_frame(message)?;
        self.send_frame(frame)?;
        Ok(())
    }

    /// Queue an already encoded frame
    pub fn send_frame(&self, frame: Bytes) -> std::result::Result<(), NetworkError> {
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|_| NetworkError::Closed)
    }

    /// Ask the writer to flush queued frames and shut the link down
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    /// Close a link the node will not use, such as a duplicate or a
    /// connection to itself. The dialer behind it gives up on the address.
    pub fn reject(&self) {
        let _ = self.tx.send(Outbound::Reject);
    }

    /// Whether the writer task is still accepting frames
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Lifecycle events reported by the transport
#[derive(Debug)]
pub enum LinkEvent {
    Opened {
        link: LinkId,
        channel: PeerChannel,
        remote_addr: Option<SocketAddr>,
        direction: Direction,
    },
    Message {
        link: LinkId,
        message: MeshMessage,
    },
    Closed {
        link: LinkId,
        reason: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_ids_are_unique() {
        let a = next_link_id();
        let b = next_link_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_send_fails_once_writer_is_gone() {
        let (channel, rx) = PeerChannel::new(next_link_id());
        assert!(channel.is_open());
        assert!(channel.send(&MeshMessage::Pause).is_ok());

        drop(rx);
        assert!(!channel.is_open());
        assert!(channel.send(&MeshMessage::Pause).is_err());
    }

    #[test]
    fn test_close_is_queued_after_frames() {
        let (channel, mut rx) = PeerChannel::new(next_link_id());
        channel.send(&MeshMessage::Stop).unwrap();
        channel.close();

        assert!(matches!(rx.try_recv(), Ok(Outbound::Frame(_))));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
    }

    #[test]
    fn test_reject_is_distinct_from_close() {
        let (channel, mut rx) = PeerChannel::new(next_link_id());
        channel.reject();

        assert!(matches!(rx.try_recv(), Ok(Outbound::Reject)));
        assert!(rx.try_recv().is_err());
    }
}
