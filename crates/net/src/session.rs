//! Room session
//!
//! Ties the pieces together: claims a mesh identity, runs the election, then
//! either serves the hub directory or joins the hub as a client, and drives
//! the peer mesh. One task owns all of it; [`Session`] talks to that task
//! over channels.

use std::sync::Arc;

use huddle_core::{ChatMessage, ParticipantProfile, PeerSnapshot, RoomKey, SessionConfig};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

use crate::discovery::{self, DiscoveryEvent};
use crate::election::{elect, Election};
use crate::error::{Error, Result};
use crate::hub::{DirectoryEvent, HubDirectory, HubInput};
use crate::mesh::{MeshEvent, MeshInput, PeerMesh};
use crate::protocol::{MeshMessage, SignalMessage};
use crate::transport::{ChannelEvent, ChannelHandle, Dialer, Transport};

/// Which side of the election we ended up on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Hub,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Hub => f.write_str("hub"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Events delivered to the application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The peer roster changed
    PeersChanged(Vec<PeerSnapshot>),
    /// A chat message arrived, or we sent one
    Message(ChatMessage),
    /// A peer could not be reached and will not be retried
    PeerFailed { peer_id: String },
    /// The signaling channel to the hub closed
    HubLost,
    /// Nobody has been connected for the configured idle time
    RoomIdle,
}

enum SessionCommand {
    SendMessage(ChatMessage),
    BroadcastRaw(MeshMessage),
    Stop(oneshot::Sender<()>),
}

#[derive(Default)]
struct SessionView {
    peers: Vec<PeerSnapshot>,
    members: Option<Vec<(String, ParticipantProfile)>>,
}

/// A joined room
pub struct Session {
    local_id: String,
    role: Role,
    room: RoomKey,
    view: Arc<RwLock<SessionView>>,
    event_rx: mpsc::UnboundedReceiver<SessionEvent>,
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl Session {
    /// Join `room` as `profile`.
    ///
    /// Fails when no identity can be claimed or the hub cannot be reached.
    pub async fn start(
        transport: Arc<dyn Transport>,
        room: RoomKey,
        profile: ParticipantProfile,
        config: SessionConfig,
    ) -> Result<Self> {
        let mesh_endpoint = transport.claim(None).await?;
        let local_id = mesh_endpoint.id().to_string();
        info!(room = %room, local_id = %local_id, "Starting session");

        let election = match elect(transport.as_ref(), &room, config.election_timeout()).await {
            Ok(election) => election,
            Err(e) => {
                warn!(error = %e, "Election failed, trying to join as client");
                Election::Client
            }
        };

        let (mesh_dialer, mesh_incoming) = mesh_endpoint.into_parts();

        let (role, hub, signal) = match election {
            Election::Hub(endpoint) => {
                let (hub_dialer, hub_incoming) = endpoint.into_parts();
                let (directory, hub_rx) = HubDirectory::new(&local_id, profile.clone());
                directory.listen(hub_incoming);
                (Role::Hub, Some((directory, hub_rx, hub_dialer)), None)
            }
            Election::Client => {
                let joined = discovery::join_hub(
                    &mesh_dialer,
                    &room.rendezvous_id(),
                    &profile,
                    config.hub_join_timeout(),
                    config.hub_join_policy(),
                )
                .await;
                match joined {
                    Ok(channel) => (Role::Client, None, Some(channel.into_parts())),
                    Err(e) => {
                        warn!(room = %room, error = %e, "Could not join room");
                        mesh_dialer.release();
                        return Err(e);
                    }
                }
            }
        };

        let (mesh, mesh_rx) = PeerMesh::new(mesh_dialer.clone(), &profile, config.peer_retry_policy());
        mesh.listen(mesh_incoming);

        let view = Arc::new(RwLock::new(SessionView::default()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let heartbeat = config.heartbeat_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });
        let idle_timeout = config.idle_timeout();

        let (directory, hub_rx, hub_dialer) = match hub {
            Some((directory, rx, dialer)) => (Some(directory), Some(rx), Some(dialer)),
            None => (None, None, None),
        };
        let (signal_handle, signal_events) = match signal {
            Some((handle, events)) => (Some(handle), Some(events)),
            None => (None, None),
        };

        let task = SessionTask {
            local_id: local_id.clone(),
            mesh,
            mesh_dialer,
            directory,
            hub_dialer,
            signal_handle,
            view: view.clone(),
            event_tx,
            idle_timeout,
            idle_deadline: idle_timeout.map(|t| Instant::now() + t),
            alone: true,
        };
        task.publish_members().await;
        tokio::spawn(task.run(cmd_rx, mesh_rx, hub_rx, signal_events, heartbeat));

        info!(local_id = %local_id, role = %role, "Session running");
        Ok(Session {
            local_id,
            role,
            room,
            view,
            event_rx,
            cmd_tx,
        })
    }

    /// Our identity in the mesh
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn room(&self) -> &RoomKey {
        &self.room
    }

    /// Get the next session event, `None` once stopped
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.recv().await
    }

    /// Try to get the next event without waiting
    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Broadcast a chat message; it is also echoed back as a local event
    pub async fn send_message(&self, message: ChatMessage) -> Result<()> {
        self.cmd_tx
            .send(SessionCommand::SendMessage(message))
            .await
            .map_err(|_| Error::NotRunning)
    }

    /// Broadcast any mesh message as is
    pub async fn broadcast_raw(&self, message: MeshMessage) -> Result<()> {
        self.cmd_tx
            .send(SessionCommand::BroadcastRaw(message))
            .await
            .map_err(|_| Error::NotRunning)
    }

    /// Latest peer roster
    pub async fn peers(&self) -> Vec<PeerSnapshot> {
        self.view.read().await.peers.clone()
    }

    /// Room members as the hub sees them; `None` unless we are the hub
    pub async fn members(&self) -> Option<Vec<(String, ParticipantProfile)>> {
        self.view.read().await.members.clone()
    }

    /// Leave the room. Safe to call more than once.
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(SessionCommand::Stop(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

struct SessionTask {
    local_id: String,
    mesh: PeerMesh,
    mesh_dialer: Dialer,
    directory: Option<HubDirectory>,
    hub_dialer: Option<Dialer>,
    signal_handle: Option<ChannelHandle>,
    view: Arc<RwLock<SessionView>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    idle_timeout: Option<std::time::Duration>,
    idle_deadline: Option<Instant>,
    alone: bool,
}

impl SessionTask {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        mut mesh_rx: mpsc::UnboundedReceiver<MeshInput>,
        mut hub_rx: Option<mpsc::UnboundedReceiver<HubInput>>,
        mut signal_events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
        mut heartbeat: Option<Interval>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::SendMessage(message)) => {
                            let delivered = self.mesh.broadcast(&MeshMessage::Message(message.clone()));
                            debug!(id = %message.id, delivered = delivered, "Message sent");
                            self.emit(SessionEvent::Message(message));
                        }
                        Some(SessionCommand::BroadcastRaw(message)) => {
                            self.mesh.broadcast(&message);
                        }
                        Some(SessionCommand::Stop(ack)) => {
                            self.shutdown();
                            let _ = ack.send(());
                            break;
                        }
                        None => {
                            self.shutdown();
                            break;
                        }
                    }
                }

                Some(input) = mesh_rx.recv() => {
                    let events = self.mesh.handle(input);
                    self.apply_mesh(events).await;
                }

                Some(input) = recv_opt(&mut hub_rx) => {
                    let changed = match self.directory.as_mut() {
                        Some(directory) => directory.handle(input),
                        None => Vec::new(),
                    };
                    for event in &changed {
                        match event {
                            DirectoryEvent::MemberJoined(id) => debug!(peer_id = %id, "Member joined"),
                            DirectoryEvent::MemberProfiled(id, p) => {
                                debug!(peer_id = %id, username = %p.username, "Member profiled")
                            }
                            DirectoryEvent::MemberLeft(id) => debug!(peer_id = %id, "Member left"),
                        }
                    }
                    if !changed.is_empty() {
                        self.publish_members().await;
                    }
                }

                event = recv_opt(&mut signal_events), if signal_events.is_some() => {
                    match event {
                        Some(ChannelEvent::Data(value)) => self.on_signal(value).await,
                        Some(ChannelEvent::Error(e)) => warn!(error = %e, "Signaling channel error"),
                        Some(ChannelEvent::Open) => {}
                        Some(ChannelEvent::Close) | None => {
                            warn!("Lost signaling channel to hub");
                            signal_events = None;
                            self.signal_handle = None;
                            self.emit(SessionEvent::HubLost);
                        }
                    }
                }

                _ = tick(&mut heartbeat) => {
                    let pinged = self.mesh.ping_all();
                    debug!(peers = pinged, "Heartbeat");
                }

                _ = idle(self.idle_deadline) => {
                    info!("Room has been empty for a while");
                    self.idle_deadline = None;
                    self.emit(SessionEvent::RoomIdle);
                }
            }
        }

        debug!(local_id = %self.local_id, "Session task finished");
    }

    async fn on_signal(&mut self, value: serde_json::Value) {
        let msg = match SignalMessage::from_value(value) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "Dropping signal from hub");
                return;
            }
        };

        let mut changed = false;
        for event in discovery::interpret(msg, &self.local_id) {
            match event {
                DiscoveryEvent::Discovered(peer_id) => {
                    changed |= self.mesh.connect_to_peer(&peer_id);
                }
                DiscoveryEvent::Left(peer_id) => {
                    changed |= self.mesh.forget(&peer_id);
                }
            }
        }
        if changed {
            self.publish_peers().await;
        }
    }

    async fn apply_mesh(&mut self, events: Vec<MeshEvent>) {
        let mut roster_changed = false;
        for event in events {
            match event {
                MeshEvent::Message { message, .. } => self.emit(SessionEvent::Message(message)),
                MeshEvent::PeerFailed(peer_id) => {
                    self.emit(SessionEvent::PeerFailed { peer_id });
                    roster_changed = true;
                }
                MeshEvent::PeerConnected(_)
                | MeshEvent::ProfileUpdated(..)
                | MeshEvent::Retrying { .. }
                | MeshEvent::PeerLeft(_) => roster_changed = true,
            }
        }

        if roster_changed {
            self.publish_peers().await;
        }
        self.track_idle();
    }

    fn track_idle(&mut self) {
        let alone = self.mesh.connected_count() == 0;
        if alone && !self.alone {
            self.idle_deadline = self.idle_timeout.map(|t| Instant::now() + t);
        } else if !alone {
            self.idle_deadline = None;
        }
        self.alone = alone;
    }

    async fn publish_peers(&self) {
        let peers = self.mesh.snapshot();
        self.view.write().await.peers = peers.clone();
        self.emit(SessionEvent::PeersChanged(peers));
    }

    async fn publish_members(&self) {
        if let Some(directory) = &self.directory {
            self.view.write().await.members = Some(directory.members());
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("Session events dropped, nobody listening");
        }
    }

    /// Hub links first, then the mesh, then our identities
    fn shutdown(&mut self) {
        info!(local_id = %self.local_id, "Stopping session");

        if let Some(directory) = self.directory.as_mut() {
            directory.close_all();
        }
        if let Some(handle) = self.signal_handle.take() {
            handle.close();
        }
        self.mesh.close_all();

        if let Some(dialer) = self.hub_dialer.take() {
            dialer.release();
        }
        self.mesh_dialer.release();
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
