//! Peer session manager
//!
//! Owns every direct channel between the local participant and the other
//! members of the room. Handles the USER_INFO handshake, routes inbound mesh
//! messages, and retries transient connection failures with bounded
//! exponential backoff.
//!
//! All state lives in [`PeerMesh`] and is only touched from
//! [`PeerMesh::handle`], which the owner drives from one task.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use huddle_core::{ChatMessage, ParticipantProfile, PeerSnapshot, PeerStatus, RetryPolicy};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{MeshMessage, UserInfo};
use crate::transport::{Channel, ChannelEvent, ChannelHandle, ConnectOptions, Dialer, TransportError};

/// Input for the mesh's event loop
#[derive(Debug)]
pub enum MeshInput {
    /// A remote member opened a channel to us
    Incoming(Channel),
    /// Something happened on mesh channel `conn`
    Event { conn: u64, event: ChannelEvent },
    /// A scheduled reconnection is due
    Retry(String),
}

/// What the owner of the mesh needs to know about
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    PeerConnected(String),
    ProfileUpdated(String, ParticipantProfile),
    Message { from: String, message: ChatMessage },
    Retrying {
        peer_id: String,
        attempt: u32,
        delay: Duration,
    },
    /// Retries exhausted or the failure was not transient
    PeerFailed(String),
    /// The live channel to this peer closed
    PeerLeft(String),
}

/// Per-peer bookkeeping
#[derive(Debug, Clone)]
pub struct PeerConnectionState {
    pub peer_id: String,
    pub profile: Option<ParticipantProfile>,
    /// Live channel, set once a channel to this peer has opened
    conn: Option<u64>,
    pub status: PeerStatus,
    /// The live channel closed while another one was still in flight
    handing_over: bool,
}

impl PeerConnectionState {
    fn new(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            profile: None,
            conn: None,
            status: PeerStatus::Connecting,
            handing_over: false,
        }
    }
}

struct MeshLink {
    peer_id: String,
    handle: ChannelHandle,
    /// We dialled this channel
    outbound: bool,
}

/// The local participant's direct channels to every other member
pub struct PeerMesh {
    local_id: String,
    info: UserInfo,
    dialer: Dialer,
    policy: RetryPolicy,
    peers: HashMap<String, PeerConnectionState>,
    links: HashMap<u64, MeshLink>,
    pending: HashSet<String>,
    retries: HashMap<String, u32>,
    next_conn: u64,
    tx: mpsc::UnboundedSender<MeshInput>,
}

impl PeerMesh {
    pub fn new(
        dialer: Dialer,
        profile: &ParticipantProfile,
        policy: RetryPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<MeshInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mesh = Self {
            local_id: dialer.local_id().to_string(),
            info: UserInfo::from(profile),
            dialer,
            policy,
            peers: HashMap::new(),
            links: HashMap::new(),
            pending: HashSet::new(),
            retries: HashMap::new(),
            next_conn: 0,
            tx,
        };
        (mesh, rx)
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Feed inbound channels of the mesh endpoint into this mesh
    pub fn listen(&self, mut incoming: mpsc::UnboundedReceiver<Channel>) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(channel) = incoming.recv().await {
                if tx.send(MeshInput::Incoming(channel)).is_err() {
                    break;
                }
            }
        });
    }

    /// Dial `peer_id` unless a live channel or an attempt already exists.
    ///
    /// Returns whether a new channel was created.
    pub fn connect_to_peer(&mut self, peer_id: &str) -> bool {
        if peer_id == self.local_id {
            return false;
        }
        if self.is_live(peer_id) || self.pending.contains(peer_id) {
            debug!(peer_id = %peer_id, "Already connected or connecting");
            return false;
        }
        self.pending.insert(peer_id.to_string());
        self.dial(peer_id);
        true
    }

    fn dial(&mut self, peer_id: &str) {
        info!(peer_id = %peer_id, "Connecting to peer");
        let channel = self.dialer.connect(peer_id, ConnectOptions::default());
        self.track(channel, true);
        self.peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerConnectionState::new(peer_id))
            .status = PeerStatus::Connecting;
    }

    /// Take ownership of an inbound channel
    pub fn accept(&mut self, channel: Channel) {
        if channel.peer() == self.local_id {
            channel.handle().close();
            return;
        }
        let peer_id = channel.peer().to_string();
        debug!(peer_id = %peer_id, "Incoming mesh channel");
        self.peers
            .entry(peer_id.clone())
            .or_insert_with(|| PeerConnectionState::new(&peer_id));
        self.track(channel, false);
    }

    fn track(&mut self, channel: Channel, outbound: bool) {
        let conn = self.next_conn;
        self.next_conn += 1;

        let (handle, mut events) = channel.into_parts();
        self.links.insert(
            conn,
            MeshLink {
                peer_id: handle.peer().to_string(),
                handle,
                outbound,
            },
        );

        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(MeshInput::Event { conn, event }).is_err() {
                    break;
                }
            }
        });
    }

    fn is_live(&self, peer_id: &str) -> bool {
        self.peers
            .get(peer_id)
            .and_then(|p| p.conn)
            .is_some()
    }

    pub fn handle(&mut self, input: MeshInput) -> Vec<MeshEvent> {
        match input {
            MeshInput::Incoming(channel) => {
                self.accept(channel);
                Vec::new()
            }
            MeshInput::Event { conn, event } => match event {
                ChannelEvent::Open => self.on_open(conn),
                ChannelEvent::Data(value) => self.on_data(conn, value),
                ChannelEvent::Close => self.on_close(conn),
                ChannelEvent::Error(e) => self.on_error(conn, e),
            },
            MeshInput::Retry(peer_id) => {
                self.on_retry(&peer_id);
                Vec::new()
            }
        }
    }

    fn on_open(&mut self, conn: u64) -> Vec<MeshEvent> {
        let Some(link) = self.links.get(&conn) else {
            return Vec::new();
        };
        let peer_id = link.peer_id.clone();
        let initiated_by_us = link.outbound;

        self.pending.remove(&peer_id);
        self.retries.remove(&peer_id);

        let existing = self.peers.get(&peer_id).and_then(|p| p.conn);
        if let Some(old) = existing.filter(|old| *old != conn) {
            // simultaneous dial: both sides keep the channel opened by the smaller id
            let old_outbound = self.links.get(&old).map(|l| l.outbound);
            let preferred_is_ours = self.local_id < peer_id;
            let keep_new = match old_outbound {
                Some(old_outbound) if old_outbound != initiated_by_us => {
                    initiated_by_us == preferred_is_ours
                }
                _ => true,
            };
            let dropped = if keep_new { old } else { conn };
            debug!(peer_id = %peer_id, conn = dropped, "Closing duplicate mesh channel");
            if let Some(link) = self.links.remove(&dropped) {
                link.handle.close();
            }
            if !keep_new {
                return Vec::new();
            }
        }

        let Some(link) = self.links.get(&conn) else {
            return Vec::new();
        };
        if let Err(e) = send(&link.handle, &MeshMessage::UserInfo(self.info.clone())) {
            warn!(peer_id = %peer_id, error = %e, "Failed to send user info");
        }

        let state = self
            .peers
            .entry(peer_id.clone())
            .or_insert_with(|| PeerConnectionState::new(&peer_id));
        state.conn = Some(conn);
        state.status = PeerStatus::Connected;
        state.handing_over = false;

        info!(peer_id = %peer_id, "Peer connected");
        vec![MeshEvent::PeerConnected(peer_id)]
    }

    fn on_data(&mut self, conn: u64, value: Value) -> Vec<MeshEvent> {
        let Some(link) = self.links.get(&conn) else {
            return Vec::new();
        };
        let peer_id = link.peer_id.clone();

        let msg = match MeshMessage::from_value(value) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "Dropping mesh message");
                return Vec::new();
            }
        };

        match msg {
            MeshMessage::UserInfo(info) => {
                let profile = ParticipantProfile::from(info);
                debug!(peer_id = %peer_id, username = %profile.username, "Peer profile received");
                if let Some(state) = self.peers.get_mut(&peer_id) {
                    state.profile = Some(profile.clone());
                }
                vec![MeshEvent::ProfileUpdated(peer_id, profile)]
            }
            MeshMessage::Message(message) => vec![MeshEvent::Message {
                from: peer_id,
                message,
            }],
            MeshMessage::Ping => {
                if let Err(e) = send(&link.handle, &MeshMessage::Pong) {
                    warn!(peer_id = %peer_id, error = %e, "Failed to answer ping");
                }
                Vec::new()
            }
            MeshMessage::Pong => {
                let Some(state) = self.peers.get_mut(&peer_id) else {
                    return Vec::new();
                };
                if state.conn == Some(conn) && state.status != PeerStatus::Connected {
                    state.status = PeerStatus::Connected;
                    return vec![MeshEvent::PeerConnected(peer_id)];
                }
                Vec::new()
            }
        }
    }

    fn on_error(&mut self, conn: u64, error: TransportError) -> Vec<MeshEvent> {
        let Some(link) = self.links.remove(&conn) else {
            return Vec::new();
        };
        let peer_id = link.peer_id;

        let Some(state) = self.peers.get_mut(&peer_id) else {
            return Vec::new();
        };
        match state.conn {
            Some(live) if live != conn => {
                debug!(peer_id = %peer_id, error = %error, "Error on superseded channel");
                return Vec::new();
            }
            Some(_) => state.conn = None,
            None => {}
        }
        state.status = PeerStatus::Failed;

        let retries = self.retries.get(&peer_id).copied().unwrap_or(0);
        if error.is_transient() && retries < self.policy.limit {
            let delay = self.policy.delay(retries);
            let attempt = retries + 1;
            self.retries.insert(peer_id.clone(), attempt);
            self.pending.insert(peer_id.clone());
            warn!(
                peer_id = %peer_id,
                error = %error,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Peer connection failed, retrying"
            );

            let tx = self.tx.clone();
            let target = peer_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(MeshInput::Retry(target));
            });

            return vec![MeshEvent::Retrying {
                peer_id,
                attempt,
                delay,
            }];
        }

        warn!(peer_id = %peer_id, error = %error, retries = retries, "Peer connection failed");
        self.pending.remove(&peer_id);
        vec![MeshEvent::PeerFailed(peer_id)]
    }

    fn on_retry(&mut self, peer_id: &str) {
        if self.is_live(peer_id) {
            debug!(peer_id = %peer_id, "Skipping retry, already connected");
            self.pending.remove(peer_id);
            return;
        }
        if !self.pending.contains(peer_id) {
            debug!(peer_id = %peer_id, "Skipping retry, peer forgotten");
            return;
        }
        self.dial(peer_id);
    }

    fn on_close(&mut self, conn: u64) -> Vec<MeshEvent> {
        let Some(link) = self.links.remove(&conn) else {
            return Vec::new();
        };
        let peer_id = link.peer_id;

        let others_in_flight = self.links.values().any(|l| l.peer_id == peer_id);
        let Some(state) = self.peers.get_mut(&peer_id) else {
            return Vec::new();
        };

        if state.conn == Some(conn) && others_in_flight {
            // a duplicate channel is still opening; it takes over on open
            debug!(peer_id = %peer_id, conn = conn, "Live mesh channel closed, waiting for duplicate");
            state.conn = None;
            state.status = PeerStatus::Connecting;
            state.handing_over = true;
            self.pending.insert(peer_id);
            return Vec::new();
        }

        if state.conn != Some(conn) {
            debug!(peer_id = %peer_id, "Non-live mesh channel closed");
            if state.conn.is_some() || others_in_flight {
                return Vec::new();
            }
            if !state.handing_over {
                if link.outbound {
                    self.pending.remove(&peer_id);
                    state.status = PeerStatus::Disconnected;
                }
                return Vec::new();
            }
        }

        info!(peer_id = %peer_id, "Peer left");
        self.pending.remove(&peer_id);
        self.peers.remove(&peer_id);
        vec![MeshEvent::PeerLeft(peer_id)]
    }

    /// Drop bookkeeping for a peer the hub reported gone, unless a live
    /// channel still connects us; the mesh has the final say
    pub fn forget(&mut self, peer_id: &str) -> bool {
        if self.is_live(peer_id) {
            return false;
        }
        self.pending.remove(peer_id);
        self.retries.remove(peer_id);
        let stale: Vec<u64> = self
            .links
            .iter()
            .filter(|(_, l)| l.peer_id == peer_id)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in stale {
            if let Some(link) = self.links.remove(&conn) {
                link.handle.close();
            }
        }
        self.peers.remove(peer_id).is_some()
    }

    /// Send to every open live channel; failures are logged per peer.
    ///
    /// Returns how many peers the message was handed to.
    pub fn broadcast(&self, msg: &MeshMessage) -> usize {
        let value = match msg.to_value() {
            Ok(value) => value,
            Err(e) => {
                warn!(kind = msg.kind(), error = %e, "Failed to encode mesh message");
                return 0;
            }
        };

        let mut delivered = 0;
        for state in self.peers.values() {
            let Some(link) = state.conn.and_then(|c| self.links.get(&c)) else {
                continue;
            };
            if !link.handle.is_open() {
                debug!(peer_id = %state.peer_id, "Skipping closed channel");
                continue;
            }
            match link.handle.send(&value) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(peer_id = %state.peer_id, error = %e, "Broadcast send failed"),
            }
        }
        delivered
    }

    pub fn ping_all(&self) -> usize {
        self.broadcast(&MeshMessage::Ping)
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self
            .peers
            .values()
            .map(|state| PeerSnapshot {
                peer_id: state.peer_id.clone(),
                profile: state.profile.clone(),
                status: state.status,
                retry_count: self.retries.get(&state.peer_id).copied().unwrap_or(0),
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerConnectionState> {
        self.peers.get(peer_id)
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.status.is_connected())
            .count()
    }

    /// Close every channel and forget every peer. Pending retries become no-ops.
    pub fn close_all(&mut self) {
        for (_, link) in self.links.drain() {
            link.handle.close();
        }
        self.peers.clear();
        self.pending.clear();
        self.retries.clear();
    }
}

fn send(handle: &ChannelHandle, msg: &MeshMessage) -> crate::Result<()> {
    handle.send(&msg.to_value()?)
}
