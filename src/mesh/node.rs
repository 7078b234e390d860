//! Mesh node
//!
//! [`MeshNode`] owns every piece of coordination state and runs as a single
//! event-loop task. Link events, operator commands, decode results, scheduled
//! start timers and the periodic probe/status ticks all arrive on channels and
//! are handled one at a time, so nothing in here needs a lock. Operators talk
//! to the node through a cloneable [`MeshHandle`].

use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::audio::buffer::AudioAsset;
use crate::audio::decode::SymphoniaDecoder;
use crate::audio::engine::{AssetDecoder, AudioEngine, SimulatedEngine};
use crate::audio::output::DeviceEngine;
use crate::config::{MeshConfig, OutputKind};
use crate::constants::STATUS_TICK_MS;
use crate::error::{MeshError, Result};
use crate::mesh::distribution::{AssetLoader, AssetOrigin, DecodedAsset};
use crate::mesh::registry::{PeerRegistry, PeerSummary};
use crate::mesh::role::RoleController;
use crate::mesh::scheduler::{PlaybackScheduler, PlaybackSnapshot, ScheduledStart};
use crate::mesh::sync::{wall_clock_ms, ClockSyncProber, SyncMetrics};
use crate::network::link::{Direction, LinkEvent, LinkId, PeerChannel};
use crate::network::tcp::TcpTransport;
use crate::protocol::{MeshMessage, NodeIdentity, Role};

/// Reply slot for an operator request
pub type Responder<T> = oneshot::Sender<Result<T>>;

/// Operator requests handled by the event loop
#[derive(Debug)]
pub enum NodeCommand {
    BecomeLeader { reply: Responder<bool> },
    BecomeFollower { reply: Responder<bool> },
    LoadFile { path: PathBuf, reply: Responder<AssetInfo> },
    Play { reply: Responder<()> },
    Pause { reply: Responder<()> },
    Stop { reply: Responder<()> },
    SetVolume { level: f32, reply: Responder<f32> },
    Connect { addr: String, reply: Responder<()> },
    Status { reply: Responder<NodeStatus> },
    Shutdown { reply: Responder<()> },
}

/// Description of a loaded asset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetInfo {
    pub name: String,
    pub byte_size: usize,
    pub duration_seconds: f64,
}

impl From<&AudioAsset> for AssetInfo {
    fn from(asset: &AudioAsset) -> Self {
        Self {
            name: asset.name.clone(),
            byte_size: asset.byte_size,
            duration_seconds: asset.duration_seconds,
        }
    }
}

/// Running totals
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeCounters {
    pub messages_received: u64,
    pub messages_ignored: u64,
    pub broadcasts: u64,
    pub decode_failures: u64,
}

/// One registered peer with its latest latency sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerStatus {
    #[serde(flatten)]
    pub summary: PeerSummary,
    pub metrics: Option<SyncMetrics>,
}

/// Point-in-time view of a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub id: String,
    pub display_name: String,
    pub role: Role,
    pub listen_addr: Option<String>,
    pub playback: PlaybackSnapshot,
    pub sync: SyncMetrics,
    /// Lead the next leader-issued play would use
    pub lead_seconds: f64,
    pub peers: Vec<PeerStatus>,
    pub pending_links: usize,
    pub counters: NodeCounters,
    pub probes_sent: u64,
}

/// A link whose handshake has not arrived yet
#[derive(Debug)]
pub(super) struct PendingLink {
    pub(super) channel: PeerChannel,
    pub(super) remote_addr: Option<SocketAddr>,
    pub(super) direction: Direction,
}

/// Receiving ends of the event loop's channels
pub(super) struct Inbox {
    pub(super) links: mpsc::UnboundedReceiver<LinkEvent>,
    pub(super) commands: mpsc::UnboundedReceiver<NodeCommand>,
    pub(super) decoded: mpsc::UnboundedReceiver<DecodedAsset>,
    pub(super) timers: mpsc::UnboundedReceiver<u64>,
}

/// Handle for driving a running node
#[derive(Debug, Clone)]
pub struct MeshHandle {
    commands: mpsc::UnboundedSender<NodeCommand>,
    identity: NodeIdentity,
    listen_addr: Option<SocketAddr>,
}

impl MeshHandle {
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Bound listener address, if the node accepts links
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Returns whether the role changed
    pub async fn become_leader(&self) -> Result<bool> {
        self.request(|reply| NodeCommand::BecomeLeader { reply }).await
    }

    /// Returns whether the role changed
    pub async fn become_follower(&self) -> Result<bool> {
        self.request(|reply| NodeCommand::BecomeFollower { reply }).await
    }

    /// Load and distribute a file; resolves once it is decoded locally
    pub async fn load_file(&self, path: impl Into<PathBuf>) -> Result<AssetInfo> {
        let path = path.into();
        self.request(|reply| NodeCommand::LoadFile { path, reply }).await
    }

    pub async fn play(&self) -> Result<()> {
        self.request(|reply| NodeCommand::Play { reply }).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| NodeCommand::Pause { reply }).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| NodeCommand::Stop { reply }).await
    }

    /// Returns the applied (clamped) level
    pub async fn set_volume(&self, level: f32) -> Result<f32> {
        self.request(|reply| NodeCommand::SetVolume { level, reply }).await
    }

    /// Dial `addr` and keep the link up
    pub async fn connect(&self, addr: impl Into<String>) -> Result<()> {
        let addr = addr.into();
        self.request(|reply| NodeCommand::Connect { addr, reply }).await
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        self.request(|reply| NodeCommand::Status { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| NodeCommand::Shutdown { reply }).await
    }

    async fn request<T>(&self, make: impl FnOnce(Responder<T>) -> NodeCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| MeshError::ShutDown)?;
        rx.await.map_err(|_| MeshError::ShutDown)?
    }
}

/// Coordination state of one node
pub struct MeshNode {
    pub(super) identity: NodeIdentity,
    pub(super) config: MeshConfig,
    pub(super) roles: RoleController,
    pub(super) registry: PeerRegistry,
    pub(super) prober: ClockSyncProber,
    pub(super) scheduler: PlaybackScheduler,
    pub(super) engine: Box<dyn AudioEngine>,
    pub(super) loader: AssetLoader,
    pub(super) pending_links: HashMap<LinkId, PendingLink>,
    pub(super) counters: NodeCounters,
    transport: TcpTransport,
    timer_tx: mpsc::UnboundedSender<u64>,
    start_timer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    /// Outbound dialers by address; a finished one has given up
    dialers: HashMap<String, JoinHandle<()>>,
    load_reply: Option<(u64, Responder<AssetInfo>)>,
    listen_addr: Option<SocketAddr>,
}

impl MeshNode {
    /// Start a node from configuration with the configured output.
    ///
    /// Fails when the output device or the listen address is unavailable.
    pub async fn start(config: MeshConfig) -> Result<MeshHandle> {
        let engine: Box<dyn AudioEngine> = match config.audio.output {
            OutputKind::Device => {
                let engine = DeviceEngine::open(config.audio.device.as_deref())?;
                tracing::info!("Audio output: {}", engine.device_name());
                Box::new(engine)
            }
            OutputKind::Simulated => {
                tracing::info!("Audio output: simulated");
                Box::new(SimulatedEngine::new())
            }
        };
        Self::spawn(config, engine, Arc::new(SymphoniaDecoder::new())).await
    }

    /// Start a node with an explicit engine and decoder
    pub async fn spawn(
        config: MeshConfig,
        engine: Box<dyn AudioEngine>,
        decoder: Arc<dyn AssetDecoder>,
    ) -> Result<MeshHandle> {
        let (mut node, inbox, commands) = Self::new(config, engine, decoder);
        node.bring_up().await?;

        let handle = MeshHandle {
            commands,
            identity: node.identity.clone(),
            listen_addr: node.listen_addr,
        };
        tokio::spawn(node.run(inbox));
        Ok(handle)
    }

    pub(super) fn new(
        config: MeshConfig,
        mut engine: Box<dyn AudioEngine>,
        decoder: Arc<dyn AssetDecoder>,
    ) -> (Self, Inbox, mpsc::UnboundedSender<NodeCommand>) {
        let (link_tx, links) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (decoded_tx, decoded) = mpsc::unbounded_channel();
        let (timer_tx, timers) = mpsc::unbounded_channel();

        let identity = NodeIdentity::generate(config.node.display_name.clone());
        let role = if config.node.start_as_leader {
            Role::Leader
        } else {
            Role::Follower
        };
        engine.set_gain(config.audio.initial_volume);

        let node = Self {
            identity,
            roles: RoleController::new(role),
            registry: PeerRegistry::new(),
            prober: ClockSyncProber::new(),
            scheduler: PlaybackScheduler::new(config.audio.initial_volume),
            engine,
            loader: AssetLoader::new(decoder, decoded_tx),
            pending_links: HashMap::new(),
            counters: NodeCounters::default(),
            transport: TcpTransport::new(link_tx, config.network.max_frame_bytes),
            timer_tx,
            start_timer: None,
            tasks: Vec::new(),
            dialers: HashMap::new(),
            load_reply: None,
            listen_addr: None,
            config,
        };
        let inbox = Inbox {
            links,
            commands,
            decoded,
            timers,
        };
        (node, inbox, command_tx)
    }

    /// Bind the listener and dial configured peers
    async fn bring_up(&mut self) -> Result<()> {
        if let Some(addr) = self.config.network.listen_addr.clone() {
            let (local_addr, accept) = self.transport.listen(&addr).await?;
            self.listen_addr = Some(local_addr);
            self.tasks.push(accept);
        }
        for addr in self.config.network.peers.clone() {
            self.dial(addr);
        }
        Ok(())
    }

    async fn run(mut self, mut inbox: Inbox) {
        let mut probe = tokio::time::interval(self.config.sync.ping_interval());
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status_tick = tokio::time::interval(Duration::from_millis(STATUS_TICK_MS));
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            id = %self.identity.id,
            name = %self.identity.display_name,
            role = %self.roles.role(),
            "Mesh node running"
        );

        loop {
            tokio::select! {
                Some(event) = inbox.links.recv() => self.handle_link_event(event),
                command = inbox.commands.recv() => match command {
                    Some(NodeCommand::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(Ok(()));
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(decoded) = inbox.decoded.recv() => self.handle_decoded(decoded),
                Some(generation) = inbox.timers.recv() => self.handle_start_due(generation),
                _ = probe.tick() => self.probe_peers(),
                _ = status_tick.tick() => self.check_playback(),
            }
        }

        tracing::info!("Mesh node stopped");
    }

    pub(super) fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened {
                link,
                channel,
                remote_addr,
                direction,
            } => {
                tracing::debug!(link, ?remote_addr, ?direction, "Link opened");
                if let Err(e) = channel.send(&self.handshake()) {
                    tracing::warn!(link, "Could not send handshake: {}", e);
                    return;
                }
                self.pending_links.insert(
                    link,
                    PendingLink {
                        channel,
                        remote_addr,
                        direction,
                    },
                );
            }
            LinkEvent::Message { link, message } => {
                self.counters.messages_received += 1;
                self.dispatch(link, message);
            }
            LinkEvent::Closed { link, reason } => {
                if self.pending_links.remove(&link).is_some() {
                    tracing::debug!(link, ?reason, "Link closed before handshake");
                    return;
                }
                if let Some(peer) = self.registry.unregister_link(link) {
                    self.prober.forget(&peer.remote_id);
                    tracing::info!(
                        peer = %peer.remote_id,
                        reason = reason.as_deref().unwrap_or("closed"),
                        "Peer {} left ({} connected)",
                        peer.display_name,
                        self.registry.len()
                    );
                }
            }
        }
    }

    fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::BecomeLeader { reply } => {
                let _ = reply.send(Ok(self.become_leader()));
            }
            NodeCommand::BecomeFollower { reply } => {
                let _ = reply.send(Ok(self.become_follower()));
            }
            NodeCommand::LoadFile { path, reply } => {
                if !self.roles.is_leader() {
                    let _ = reply.send(Err(MeshError::NotLeader("load audio").into()));
                    return;
                }
                if let Some((_, previous)) = self.load_reply.take() {
                    let _ = previous.send(Err(MeshError::Superseded.into()));
                }
                let generation = self.loader.load_local(path);
                self.load_reply = Some((generation, reply));
            }
            NodeCommand::Play { reply } => {
                let _ = reply.send(self.leader_play());
            }
            NodeCommand::Pause { reply } => {
                let _ = reply.send(self.leader_pause());
            }
            NodeCommand::Stop { reply } => {
                let _ = reply.send(self.leader_stop());
            }
            NodeCommand::SetVolume { level, reply } => {
                let _ = reply.send(Ok(self.set_volume(level)));
            }
            NodeCommand::Connect { addr, reply } => {
                let _ = self.dial(addr);
                let _ = reply.send(Ok(()));
            }
            NodeCommand::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
            NodeCommand::Shutdown { reply } => {
                // The run loop intercepts shutdown; reaching here means a direct call
                self.shutdown();
                let _ = reply.send(Ok(()));
            }
        }
    }

    pub(super) fn become_leader(&mut self) -> bool {
        if !self.roles.become_leader() {
            return false;
        }
        self.announce_identity();

        let rivals: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|peer| peer.claims_leader)
            .map(|peer| peer.display_name)
            .collect();
        if !rivals.is_empty() {
            tracing::warn!(
                "Other nodes also claim leadership ({}); followers apply whichever command arrives last",
                rivals.join(", ")
            );
        }
        true
    }

    /// Followers only hold assets received from a leader, so the local one goes
    pub(super) fn become_follower(&mut self) -> bool {
        if !self.roles.become_follower() {
            return false;
        }
        self.cancel_start();
        self.loader.cancel();
        if let Some((_, reply)) = self.load_reply.take() {
            let _ = reply.send(Err(MeshError::NotLeader("load audio").into()));
        }
        self.scheduler.clear_asset(self.engine.as_mut());
        self.announce_identity();
        true
    }

    fn require_leader(&self, action: &'static str) -> Result<()> {
        if self.roles.is_leader() {
            Ok(())
        } else {
            Err(MeshError::NotLeader(action).into())
        }
    }

    pub(super) fn leader_play(&mut self) -> Result<()> {
        self.require_leader("start playback")?;
        let lead = self
            .prober
            .lead_seconds(self.config.sync.lead_seconds(), self.config.sync.adaptive_lead);

        match self.scheduler.leader_play(self.engine.as_mut(), lead)? {
            Some(plan) => {
                tracing::info!(lead_seconds = lead, "Starting playback");
                self.arm_start(plan.scheduled);
                self.broadcast(&plan.message);
            }
            None => tracing::debug!("Already playing"),
        }
        Ok(())
    }

    pub(super) fn leader_pause(&mut self) -> Result<()> {
        self.require_leader("pause playback")?;
        self.cancel_start();
        self.scheduler.pause(self.engine.as_mut());
        self.broadcast(&MeshMessage::Pause);
        Ok(())
    }

    pub(super) fn leader_stop(&mut self) -> Result<()> {
        self.require_leader("stop playback")?;
        self.cancel_start();
        self.scheduler.stop(self.engine.as_mut());
        self.broadcast(&MeshMessage::Stop);
        Ok(())
    }

    /// Leaders broadcast the level; followers only change their own output
    pub(super) fn set_volume(&mut self, level: f32) -> f32 {
        let level = self.scheduler.set_volume(self.engine.as_mut(), level);
        if self.roles.is_leader() {
            self.broadcast(&MeshMessage::Volume { level });
        } else {
            tracing::debug!(level, "Local volume change");
        }
        level
    }

    pub(super) fn handle_decoded(&mut self, decoded: DecodedAsset) {
        if !self.loader.is_current(decoded.generation) {
            tracing::debug!("Discarding superseded decode of {}", decoded.file_name);
            return;
        }

        match decoded.result {
            Ok(asset) => {
                let info = AssetInfo::from(&asset);
                self.cancel_start();
                self.scheduler.load_asset(self.engine.as_mut(), asset);

                if decoded.origin == AssetOrigin::Local {
                    if let Some(raw_bytes) = decoded.raw_bytes {
                        self.broadcast(&MeshMessage::Audio {
                            file_name: decoded.file_name,
                            raw_bytes,
                        });
                    }
                }
                self.reply_load(decoded.generation, Ok(info));
            }
            Err(e) => {
                self.counters.decode_failures += 1;
                match &decoded.origin {
                    AssetOrigin::Remote { from } => {
                        tracing::error!(peer = %from, "Could not decode {}: {}", decoded.file_name, e)
                    }
                    AssetOrigin::Local => tracing::error!("Could not load {}: {}", decoded.file_name, e),
                }
                self.reply_load(decoded.generation, Err(e));
            }
        }
    }

    fn reply_load(&mut self, generation: u64, result: Result<AssetInfo>) {
        if let Some((expected, reply)) = self.load_reply.take() {
            if expected == generation {
                let _ = reply.send(result);
            } else {
                self.load_reply = Some((expected, reply));
            }
        }
    }

    pub(super) fn handle_start_due(&mut self, generation: u64) {
        if self.scheduler.fire_scheduled(self.engine.as_mut(), generation) {
            tracing::info!("Playback started");
        } else {
            tracing::debug!(generation, "Ignoring superseded scheduled start");
        }
    }

    /// Arm the deferred start, replacing any previous one
    pub(super) fn arm_start(&mut self, scheduled: Option<ScheduledStart>) {
        self.cancel_start();
        if let Some(scheduled) = scheduled {
            let timers = self.timer_tx.clone();
            self.start_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(scheduled.delay).await;
                let _ = timers.send(scheduled.generation);
            }));
        }
    }

    pub(super) fn cancel_start(&mut self) {
        if let Some(timer) = self.start_timer.take() {
            timer.abort();
        }
    }

    pub(super) fn broadcast(&mut self, message: &MeshMessage) {
        match self.registry.broadcast(message) {
            Ok(_) => self.counters.broadcasts += 1,
            Err(e) => tracing::error!("Could not broadcast {}: {}", message.kind(), e),
        }
    }

    pub(super) fn handshake(&self) -> MeshMessage {
        MeshMessage::Handshake {
            peer_id: self.identity.id.clone(),
            device_name: self.identity.display_name.clone(),
            is_leader: self.roles.is_leader(),
            timestamp: wall_clock_ms(),
        }
    }

    /// Re-send the handshake so peers see the current role
    fn announce_identity(&mut self) {
        let handshake = self.handshake();
        if let Err(e) = self.registry.broadcast(&handshake) {
            tracing::warn!("Could not announce role change: {}", e);
        }
    }

    fn probe_peers(&mut self) {
        if self.registry.is_empty() {
            return;
        }
        let ping = self.prober.ping(wall_clock_ms());
        if let Err(e) = self.registry.broadcast(&ping) {
            tracing::warn!("Could not send latency probe: {}", e);
        }
    }

    fn check_playback(&mut self) {
        if self.scheduler.poll_finished(self.engine.as_mut()) {
            tracing::info!("Playback finished");
        }
    }

    /// Start maintaining a link to `addr` unless a dialer already is
    pub(super) fn dial(&mut self, addr: String) -> bool {
        if let Some(dialer) = self.dialers.get(&addr) {
            if !dialer.is_finished() {
                tracing::info!("Already dialing {}", addr);
                return false;
            }
        }

        tracing::info!("Maintaining link to {}", addr);
        let task = self.transport.maintain(
            addr.clone(),
            self.config.network.reconnect_initial(),
            self.config.network.reconnect_max(),
        );
        self.dialers.insert(addr, task);
        true
    }

    pub(super) fn status(&self) -> NodeStatus {
        let peers = self
            .registry
            .list()
            .into_iter()
            .map(|summary| PeerStatus {
                metrics: self.prober.peer(&summary.remote_id),
                summary,
            })
            .collect();

        NodeStatus {
            id: self.identity.id.clone(),
            display_name: self.identity.display_name.clone(),
            role: self.roles.role(),
            listen_addr: self.listen_addr.map(|addr| addr.to_string()),
            playback: self.scheduler.snapshot(self.engine.current_clock_time()),
            sync: self.prober.latest(),
            lead_seconds: self
                .prober
                .lead_seconds(self.config.sync.lead_seconds(), self.config.sync.adaptive_lead),
            peers,
            pending_links: self.pending_links.len(),
            counters: self.counters,
            probes_sent: self.prober.probes_sent(),
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("Shutting down mesh node");
        self.cancel_start();
        self.loader.cancel();
        self.scheduler.stop(self.engine.as_mut());
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for (_, dialer) in self.dialers.drain() {
            dialer.abort();
        }
        for (_, pending) in self.pending_links.drain() {
            pending.channel.close();
        }
        self.registry.close_all();
        if let Some((_, reply)) = self.load_reply.take() {
            let _ = reply.send(Err(MeshError::ShutDown.into()));
        }
    }
}
