//! Command dispatcher
//!
//! Routes every decoded message from a link to the component that owns it.
//! The match over [`MeshMessage`] is exhaustive; kinds this build does not
//! know never get this far (they decode to `None` at the link).
//!
//! Until a link's handshake arrives, only the handshake itself and probes are
//! accepted on it. Commands only a leader may originate are applied by
//! followers and ignored, with a warning, by a node that is itself leader.

use crate::mesh::node::MeshNode;
use crate::mesh::sync::{wall_clock_ms, ClockSyncProber};
use crate::network::link::{LinkId, PeerChannel};
use crate::protocol::MeshMessage;

impl MeshNode {
    pub(super) fn dispatch(&mut self, link: LinkId, message: MeshMessage) {
        tracing::debug!(link, kind = message.kind(), "Dispatch");

        match message {
            MeshMessage::Handshake {
                peer_id,
                device_name,
                is_leader,
                timestamp,
            } => self.on_handshake(link, peer_id, device_name, is_leader, timestamp),
            MeshMessage::Audio {
                file_name,
                raw_bytes,
            } => {
                if let Some(from) = self.authorize(link, "audio") {
                    self.cancel_start();
                    // The old asset goes now; a failed decode must not leave it behind
                    self.scheduler.clear_asset(self.engine.as_mut());
                    self.loader.accept_remote(&from, file_name, raw_bytes);
                }
            }
            MeshMessage::Play { start_time, offset } => {
                if let Some(from) = self.authorize(link, "play") {
                    match self
                        .scheduler
                        .realize_play(self.engine.as_mut(), start_time, offset)
                    {
                        Ok(scheduled) => self.arm_start(scheduled),
                        Err(e) => {
                            self.counters.messages_ignored += 1;
                            tracing::warn!(peer = %from, "Dropping play: {}", e);
                        }
                    }
                }
            }
            MeshMessage::Pause => {
                if self.authorize(link, "pause").is_some() {
                    self.cancel_start();
                    self.scheduler.pause(self.engine.as_mut());
                }
            }
            MeshMessage::Stop => {
                if self.authorize(link, "stop").is_some() {
                    self.cancel_start();
                    self.scheduler.stop(self.engine.as_mut());
                }
            }
            MeshMessage::Volume { level } => {
                if self.authorize(link, "volume").is_some() {
                    self.scheduler.set_volume(self.engine.as_mut(), level);
                }
            }
            MeshMessage::Ping { timestamp } => match self.channel_for(link) {
                Some(channel) => {
                    if let Err(e) = channel.send(&ClockSyncProber::reply(timestamp)) {
                        tracing::debug!(link, "Could not answer probe: {}", e);
                    }
                }
                None => self.counters.messages_ignored += 1,
            },
            MeshMessage::Pong { timestamp } => {
                match self.registry.remote_id_for_link(link).map(str::to_string) {
                    Some(peer) => {
                        self.prober.record_pong(&peer, timestamp, wall_clock_ms());
                    }
                    None => self.counters.messages_ignored += 1,
                }
            }
        }
    }

    fn on_handshake(
        &mut self,
        link: LinkId,
        peer_id: String,
        device_name: String,
        is_leader: bool,
        timestamp: f64,
    ) {
        if peer_id == self.identity.id {
            tracing::warn!(link, "Connected to ourselves, closing link");
            if let Some(pending) = self.pending_links.remove(&link) {
                pending.channel.reject();
            }
            return;
        }

        if let Some(pending) = self.pending_links.remove(&link) {
            let channel = pending.channel.clone();
            if !self
                .registry
                .register_connection(&peer_id, &device_name, is_leader, pending.channel)
            {
                tracing::debug!(peer = %peer_id, link, "Already linked, rejecting duplicate");
                channel.reject();
                return;
            }
            tracing::info!(
                peer = %peer_id,
                addr = ?pending.remote_addr,
                direction = ?pending.direction,
                "Peer {} joined ({} connected)",
                device_name,
                self.registry.len()
            );
        } else if self.registry.remote_id_for_link(link) == Some(peer_id.as_str()) {
            self.registry.update_identity(&peer_id, &device_name, is_leader);
            tracing::debug!(peer = %peer_id, is_leader, "Peer refreshed its handshake");
        } else {
            self.counters.messages_ignored += 1;
            tracing::warn!(link, peer = %peer_id, "Handshake does not match the link's peer");
            return;
        }

        self.prober.record_handshake(&peer_id, timestamp, wall_clock_ms());

        if is_leader && self.roles.is_leader() {
            tracing::warn!(
                peer = %peer_id,
                "{} also claims leadership; followers apply whichever command arrives last",
                device_name
            );
        }
    }

    /// Sender of an authoritative command, if this node should apply it
    fn authorize(&mut self, link: LinkId, kind: &'static str) -> Option<String> {
        let Some(from) = self.registry.remote_id_for_link(link).map(str::to_string) else {
            self.counters.messages_ignored += 1;
            tracing::debug!(link, kind, "Ignoring command before handshake");
            return None;
        };

        if self.roles.is_leader() {
            self.counters.messages_ignored += 1;
            tracing::warn!(peer = %from, kind, "Ignoring command from another leader");
            return None;
        }
        Some(from)
    }

    fn channel_for(&self, link: LinkId) -> Option<&PeerChannel> {
        if let Some(pending) = self.pending_links.get(&link) {
            return Some(&pending.channel);
        }
        self.registry
            .remote_id_for_link(link)
            .and_then(|id| self.registry.get(id))
            .map(|peer| &peer.channel)
    }
}

#[cfg(test)]
mod tests {
    use crate::audio::engine::EngineCall;
    use crate::mesh::node::tests::test_node;
    use crate::mesh::node::{Inbox, MeshNode};
    use crate::mesh::scheduler::PlaybackPhase;
    use crate::mesh::sync::wall_clock_ms;
    use crate::network::link::{next_link_id, Direction, LinkEvent, LinkId, Outbound, PeerChannel};
    use crate::protocol::MeshMessage;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    fn open_link(node: &mut MeshNode) -> (LinkId, UnboundedReceiver<Outbound>) {
        let link = next_link_id();
        let (channel, rx) = PeerChannel::new(link);
        node.handle_link_event(LinkEvent::Opened {
            link,
            channel,
            remote_addr: None,
            direction: Direction::Inbound,
        });
        (link, rx)
    }

    fn deliver(node: &mut MeshNode, link: LinkId, message: MeshMessage) {
        node.handle_link_event(LinkEvent::Message { link, message });
    }

    fn handshake(id: &str, is_leader: bool) -> MeshMessage {
        MeshMessage::Handshake {
            peer_id: id.to_string(),
            device_name: format!("{}-device", id),
            is_leader,
            timestamp: wall_clock_ms(),
        }
    }

    fn attach(node: &mut MeshNode, id: &str, is_leader: bool) -> (LinkId, UnboundedReceiver<Outbound>) {
        let (link, rx) = open_link(node);
        deliver(node, link, handshake(id, is_leader));
        (link, rx)
    }

    /// Messages queued on a link, plus whether it was rejected
    fn sent(rx: &mut UnboundedReceiver<Outbound>) -> (Vec<MeshMessage>, bool) {
        let mut messages = Vec::new();
        let mut rejected = false;
        while let Ok(outbound) = rx.try_recv() {
            match outbound {
                Outbound::Frame(frame) => {
                    if let Ok(Some(message)) = MeshMessage::decode(&frame[4..]) {
                        messages.push(message);
                    }
                }
                Outbound::Close => {}
                Outbound::Reject => rejected = true,
            }
        }
        (messages, rejected)
    }

    async fn with_asset(node: &mut MeshNode, inbox: &mut Inbox, link: LinkId) {
        deliver(
            node,
            link,
            MeshMessage::Audio {
                file_name: "song.ogg".into(),
                raw_bytes: vec![0; 20],
            },
        );
        let decoded = timeout(Duration::from_secs(5), inbox.decoded.recv())
            .await
            .unwrap()
            .unwrap();
        node.handle_decoded(decoded);
    }

    #[tokio::test]
    async fn test_handshake_registers_peer() {
        let (mut node, _inbox, _clock, _journal) = test_node(false);
        let (link, mut rx) = open_link(&mut node);

        assert_eq!(node.status().pending_links, 1);
        deliver(&mut node, link, handshake("leader", true));

        let status = node.status();
        assert_eq!(status.pending_links, 0);
        assert_eq!(status.peers.len(), 1);
        assert_eq!(status.peers[0].summary.display_name, "leader-device");
        assert!(status.peers[0].metrics.is_some());

        let (messages, rejected) = sent(&mut rx);
        assert!(matches!(messages[0], MeshMessage::Handshake { .. }));
        assert!(!rejected);
    }

    #[tokio::test]
    async fn test_duplicate_link_is_rejected() {
        let (mut node, _inbox, _clock, _journal) = test_node(false);
        let (first, mut rx1) = attach(&mut node, "leader", true);
        let (_second, mut rx2) = attach(&mut node, "leader", true);

        assert!(!sent(&mut rx1).1);
        let (_, rejected) = sent(&mut rx2);
        assert!(rejected);
        assert_eq!(node.registry.len(), 1);
        assert_eq!(node.registry.remote_id_for_link(first), Some("leader"));
    }

    #[tokio::test]
    async fn test_commands_before_handshake_are_ignored() {
        let (mut node, _inbox, _clock, journal) = test_node(false);
        let (link, _rx) = open_link(&mut node);

        deliver(&mut node, link, MeshMessage::Stop);
        deliver(&mut node, link, MeshMessage::Volume { level: 0.1 });

        assert_eq!(node.counters.messages_ignored, 2);
        assert_eq!(node.scheduler.volume(), 1.0);
        assert!(!journal.lock().contains(&EngineCall::Gain(0.1)));
    }

    #[tokio::test]
    async fn test_follower_realizes_leader_commands() {
        let (mut node, mut inbox, clock, journal) = test_node(false);
        let (link, _rx) = attach(&mut node, "leader", true);
        with_asset(&mut node, &mut inbox, link).await;
        assert_eq!(node.status().playback.asset.as_deref(), Some("song.ogg"));

        let start = clock.now() + 0.15;
        deliver(&mut node, link, MeshMessage::Play { start_time: start, offset: 0.0 });
        assert_eq!(node.scheduler.phase(), PlaybackPhase::Scheduled);

        clock.advance(0.15);
        let generation = node.scheduler.pending_generation().unwrap();
        node.handle_start_due(generation);
        assert_eq!(node.scheduler.phase(), PlaybackPhase::Playing);

        deliver(&mut node, link, MeshMessage::Volume { level: 0.25 });
        assert_eq!(node.scheduler.volume(), 0.25);

        clock.advance(2.0);
        deliver(&mut node, link, MeshMessage::Pause);
        assert_eq!(node.scheduler.phase(), PlaybackPhase::Paused);
        assert!((node.scheduler.state().paused_at_offset - 2.0).abs() < 1e-6);

        deliver(&mut node, link, MeshMessage::Stop);
        assert_eq!(node.scheduler.phase(), PlaybackPhase::Stopped);
        assert_eq!(node.scheduler.state().paused_at_offset, 0.0);

        let plays = journal
            .lock()
            .iter()
            .filter(|call| matches!(call, EngineCall::Play { .. }))
            .count();
        assert_eq!(plays, 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_play() {
        let (mut node, mut inbox, clock, journal) = test_node(false);
        let (link, _rx) = attach(&mut node, "leader", true);
        with_asset(&mut node, &mut inbox, link).await;

        deliver(
            &mut node,
            link,
            MeshMessage::Play { start_time: clock.now() + 0.15, offset: 0.0 },
        );
        let generation = node.scheduler.pending_generation().unwrap();
        deliver(&mut node, link, MeshMessage::Stop);

        clock.advance(1.0);
        node.handle_start_due(generation);

        assert_eq!(node.scheduler.phase(), PlaybackPhase::Stopped);
        assert!(!journal
            .lock()
            .iter()
            .any(|call| matches!(call, EngineCall::Play { .. })));
    }

    #[tokio::test]
    async fn test_play_without_asset_is_dropped() {
        let (mut node, _inbox, clock, _journal) = test_node(false);
        let (link, _rx) = attach(&mut node, "leader", true);

        deliver(&mut node, link, MeshMessage::Play { start_time: clock.now(), offset: 0.0 });

        assert_eq!(node.scheduler.phase(), PlaybackPhase::Stopped);
        assert_eq!(node.counters.messages_ignored, 1);
    }

    #[tokio::test]
    async fn test_unreachable_play_is_ignored_and_node_survives() {
        let (mut node, mut inbox, clock, journal) = test_node(false);
        let (link, _rx) = attach(&mut node, "leader", true);
        with_asset(&mut node, &mut inbox, link).await;

        deliver(&mut node, link, MeshMessage::Play { start_time: 1e20, offset: 0.0 });
        deliver(&mut node, link, MeshMessage::Play { start_time: f64::INFINITY, offset: 0.0 });

        assert_eq!(node.counters.messages_ignored, 2);
        assert_eq!(node.scheduler.phase(), PlaybackPhase::Stopped);
        assert!(node.scheduler.pending_generation().is_none());

        // Still applying sane commands afterwards
        deliver(&mut node, link, MeshMessage::Play { start_time: clock.now(), offset: 0.0 });
        assert_eq!(node.scheduler.phase(), PlaybackPhase::Playing);
        let plays = journal
            .lock()
            .iter()
            .filter(|call| matches!(call, EngineCall::Play { .. }))
            .count();
        assert_eq!(plays, 1);
    }

    #[tokio::test]
    async fn test_failed_decode_leaves_no_asset() {
        let (mut node, mut inbox, _clock, _journal) = test_node(false);
        let (link, _rx) = attach(&mut node, "leader", true);
        with_asset(&mut node, &mut inbox, link).await;

        deliver(
            &mut node,
            link,
            MeshMessage::Audio { file_name: "broken.mp3".into(), raw_bytes: b"bad".to_vec() },
        );
        assert!(node.scheduler.asset().is_none());

        let decoded = timeout(Duration::from_secs(5), inbox.decoded.recv())
            .await
            .unwrap()
            .unwrap();
        node.handle_decoded(decoded);

        assert!(node.scheduler.asset().is_none());
        assert_eq!(node.counters.decode_failures, 1);
    }

    #[tokio::test]
    async fn test_leader_ignores_rival_commands() {
        let (mut node, _inbox, _clock, journal) = test_node(true);
        let (link, _rx) = attach(&mut node, "rival", true);
        let calls_before = journal.lock().len();

        deliver(&mut node, link, MeshMessage::Volume { level: 0.0 });
        deliver(&mut node, link, MeshMessage::Stop);

        assert_eq!(node.scheduler.volume(), 1.0);
        assert_eq!(journal.lock().len(), calls_before);
        assert_eq!(node.counters.messages_ignored, 2);
    }

    #[tokio::test]
    async fn test_ping_is_answered_and_pong_recorded() {
        let (mut node, _inbox, _clock, _journal) = test_node(false);
        let (link, mut rx) = attach(&mut node, "leader", true);
        sent(&mut rx);

        deliver(&mut node, link, MeshMessage::Ping { timestamp: 42.0 });
        let (messages, _) = sent(&mut rx);
        assert_eq!(messages, vec![MeshMessage::Pong { timestamp: 42.0 }]);

        let sent_at = wall_clock_ms() - 30.0;
        deliver(&mut node, link, MeshMessage::Pong { timestamp: sent_at });
        let metrics = node.prober.peer("leader").unwrap();
        assert!(metrics.latest_latency_ms >= 29.0);
    }

    #[tokio::test]
    async fn test_closed_link_unregisters_peer() {
        let (mut node, _inbox, _clock, _journal) = test_node(false);
        let (link, _rx) = attach(&mut node, "leader", true);
        assert!(node.prober.peer("leader").is_some());

        node.handle_link_event(LinkEvent::Closed { link, reason: None });
        node.handle_link_event(LinkEvent::Closed { link, reason: None });

        assert!(node.registry.is_empty());
        assert!(node.prober.peer("leader").is_none());
    }

    #[tokio::test]
    async fn test_self_connection_is_dropped() {
        let (mut node, _inbox, _clock, _journal) = test_node(false);
        let own_id = node.identity.id.clone();
        let (link, mut rx) = open_link(&mut node);

        deliver(&mut node, link, handshake(&own_id, false));

        assert!(node.registry.is_empty());
        assert_eq!(node.status().pending_links, 0);
        assert!(sent(&mut rx).1);
    }
}
