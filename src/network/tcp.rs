//! TCP transport: listener, outbound links, reconnect with backoff
//!
//! Each link runs a reader loop and a writer task. The reader turns frames into
//! [`LinkEvent::Message`]s; both report a single [`LinkEvent::Closed`] when the
//! link ends for any reason. A link the node rejected is not redialed.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::NetworkError;
use crate::network::framing::read_frame;
use crate::network::link::{next_link_id, Direction, LinkEvent, Outbound, PeerChannel};
use crate::protocol::MeshMessage;

/// How a link ended, as far as its dialer cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkOutcome {
    /// Closed before the remote said anything
    Silent,
    /// The remote delivered at least one message
    Delivered,
    /// This node rejected the link (duplicate or self)
    Rejected,
}

/// Why a link's writer task stopped
enum WriterExit {
    Drained,
    Rejected,
    Failed(String),
}

/// Spawns link tasks that report into one event channel
#[derive(Clone)]
pub struct TcpTransport {
    events: mpsc::UnboundedSender<LinkEvent>,
    max_frame_bytes: usize,
}

impl TcpTransport {
    pub fn new(events: mpsc::UnboundedSender<LinkEvent>, max_frame_bytes: usize) -> Self {
        Self {
            events,
            max_frame_bytes,
        }
    }

    /// Bind `addr` and accept inbound links in the background
    pub async fn listen(&self, addr: &str) -> Result<(SocketAddr, JoinHandle<()>), NetworkError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        tracing::info!("Accepting mesh links on {}", local_addr);

        let transport = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        tracing::debug!("Inbound link from {}", remote);
                        let transport = transport.clone();
                        tokio::spawn(async move {
                            transport.run_link(stream, Direction::Inbound).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }

                if transport.events.is_closed() {
                    break;
                }
            }
        });

        Ok((local_addr, handle))
    }

    /// Keep an outbound link to `addr` up, redialing with exponential backoff.
    ///
    /// Stops for good once the node rejects the link, since the peer behind
    /// `addr` is then already linked some other way (or is this node).
    pub fn maintain(&self, addr: String, initial: Duration, max: Duration) -> JoinHandle<()> {
        let transport = self.clone();
        tokio::spawn(async move {
            let mut backoff = initial;
            loop {
                match TcpStream::connect(&addr).await {
                    Ok(stream) => {
                        tracing::info!("Connected to {}", addr);
                        match transport.run_link(stream, Direction::Outbound).await {
                            LinkOutcome::Rejected => {
                                tracing::info!("{} is already linked, no longer dialing it", addr);
                                break;
                            }
                            LinkOutcome::Delivered => backoff = initial,
                            LinkOutcome::Silent => {}
                        }
                        tracing::info!("Link to {} ended", addr);
                    }
                    Err(e) => {
                        tracing::warn!("Connection to {} failed: {}", addr, e);
                    }
                }

                if transport.events.is_closed() {
                    break;
                }

                tracing::debug!("Redialing {} in {:?}", addr, backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max);
            }
        })
    }

    /// Drive one link until it closes
    async fn run_link(&self, stream: TcpStream, direction: Direction) -> LinkOutcome {
        let link = next_link_id();
        let remote_addr = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        let (channel, mut outbound_rx) = PeerChannel::new(link);
        let opened = LinkEvent::Opened {
            link,
            channel,
            remote_addr,
            direction,
        };
        if self.events.send(opened).is_err() {
            return LinkOutcome::Silent;
        }

        let mut writer_task = tokio::spawn(async move {
            let mut exit = WriterExit::Drained;
            while let Some(outbound) = outbound_rx.recv().await {
                match outbound {
                    Outbound::Frame(frame) => {
                        if let Err(e) = writer.write_all(&frame).await {
                            return WriterExit::Failed(e.to_string());
                        }
                    }
                    Outbound::Close => break,
                    Outbound::Reject => {
                        exit = WriterExit::Rejected;
                        break;
                    }
                }
            }
            let _ = writer.shutdown().await;
            exit
        });

        let mut delivered = false;
        let mut rejected = false;
        let mut writer_done = false;
        let reason = loop {
            tokio::select! {
                frame = read_frame(&mut reader, self.max_frame_bytes) => match frame {
                    Ok(Some(body)) => match MeshMessage::decode(&body) {
                        Ok(Some(message)) => {
                            delivered = true;
                            if self.events.send(LinkEvent::Message { link, message }).is_err() {
                                break None;
                            }
                        }
                        Ok(None) => {
                            tracing::debug!(link, "Ignoring message of unknown kind");
                        }
                        Err(e) => {
                            tracing::debug!(link, "Ignoring undecodable message: {}", e);
                        }
                    },
                    Ok(None) => break None,
                    Err(e) => break Some(e.to_string()),
                },
                written = &mut writer_task => {
                    writer_done = true;
                    match written {
                        Ok(WriterExit::Rejected) => {
                            rejected = true;
                            break Some("rejected".to_string());
                        }
                        Ok(WriterExit::Failed(e)) => break Some(e),
                        Ok(WriterExit::Drained) | Err(_) => break None,
                    }
                }
            }
        };

        // The remote may hang up first after our rejection
        if !writer_done && writer_task.is_finished() {
            rejected = matches!((&mut writer_task).await, Ok(WriterExit::Rejected));
        }
        writer_task.abort();
        let _ = self.events.send(LinkEvent::Closed { link, reason });

        if rejected {
            LinkOutcome::Rejected
        } else if delivered {
            LinkOutcome::Delivered
        } else {
            LinkOutcome::Silent
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for link event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_loopback_link_delivers_messages() {
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();

        let server = TcpTransport::new(server_tx, 1 << 20);
        let client = TcpTransport::new(client_tx, 1 << 20);

        let (addr, _accept) = server.listen("127.0.0.1:0").await.unwrap();
        let _dial = client.maintain(
            addr.to_string(),
            Duration::from_millis(50),
            Duration::from_millis(200),
        );

        let client_channel = match next_event(&mut client_rx).await {
            LinkEvent::Opened { channel, direction, .. } => {
                assert_eq!(direction, Direction::Outbound);
                channel
            }
            other => panic!("unexpected event: {:?}", other),
        };
        // Dropping the last channel handle closes a link, so keep the server's
        let (server_link, _server_channel) = match next_event(&mut server_rx).await {
            LinkEvent::Opened { link, channel, direction, .. } => {
                assert_eq!(direction, Direction::Inbound);
                (link, channel)
            }
            other => panic!("unexpected event: {:?}", other),
        };

        client_channel.send(&MeshMessage::Ping { timestamp: 12.5 }).unwrap();
        client_channel.send(&MeshMessage::Stop).unwrap();

        match next_event(&mut server_rx).await {
            LinkEvent::Message { link, message } => {
                assert_eq!(link, server_link);
                assert_eq!(message, MeshMessage::Ping { timestamp: 12.5 });
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match next_event(&mut server_rx).await {
            LinkEvent::Message { message, .. } => assert_eq!(message, MeshMessage::Stop),
            other => panic!("unexpected event: {:?}", other),
        }

        // Closing from the client side ends the link on both ends
        client_channel.close();
        match next_event(&mut server_rx).await {
            LinkEvent::Closed { link, .. } => assert_eq!(link, server_link),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_maintain_redials_after_refusal() {
        // Reserve a port, then free it so the first dials are refused
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let client = TcpTransport::new(client_tx, 1 << 20);
        let _dial = client.maintain(
            addr.to_string(),
            Duration::from_millis(20),
            Duration::from_millis(40),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;

        let (server_tx, _server_rx) = mpsc::unbounded_channel();
        let server = TcpTransport::new(server_tx, 1 << 20);
        let _accept = server.listen(&addr.to_string()).await.unwrap();

        match next_event(&mut client_rx).await {
            LinkEvent::Opened { direction, .. } => assert_eq!(direction, Direction::Outbound),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_link_is_not_redialed() {
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let server = TcpTransport::new(server_tx, 1 << 20);
        let (addr, _accept) = server.listen("127.0.0.1:0").await.unwrap();

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let client = TcpTransport::new(client_tx, 1 << 20);
        let dial = client.maintain(
            addr.to_string(),
            Duration::from_millis(10),
            Duration::from_millis(20),
        );

        let _server_channel = match next_event(&mut server_rx).await {
            LinkEvent::Opened { channel, .. } => channel,
            other => panic!("unexpected event: {:?}", other),
        };
        let client_channel = match next_event(&mut client_rx).await {
            LinkEvent::Opened { channel, .. } => channel,
            other => panic!("unexpected event: {:?}", other),
        };
        client_channel.send(&MeshMessage::Pause).unwrap();
        client_channel.reject();

        timeout(Duration::from_secs(5), dial)
            .await
            .expect("dialer kept running after rejection")
            .unwrap();

        // One link only: no redial reached the listener
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(event) = server_rx.try_recv() {
            assert!(!matches!(event, LinkEvent::Opened { .. }), "redialed: {:?}", event);
        }
    }
}
