//! Hub directory
//!
//! Runs only on the process holding the rendezvous identity. Tracks who is in
//! the room, answers each new signaling channel with the current member list
//! and gossips joins and departures to everyone else.
//!
//! The hub's own chat identity is a member from the start, carrying the local
//! profile, so the first joiner already learns about the hub's user.

use std::collections::{BTreeMap, HashMap};

use huddle_core::ParticipantProfile;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::SignalMessage;
use crate::transport::{Channel, ChannelEvent, ChannelHandle};

/// Input for the directory's event loop
#[derive(Debug)]
pub enum HubInput {
    /// A member opened a signaling channel to the rendezvous identity
    Incoming(Channel),
    /// Something happened on signaling channel `conn`
    Event { conn: u64, event: ChannelEvent },
}

/// Membership changes observed by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    MemberJoined(String),
    MemberProfiled(String, ParticipantProfile),
    MemberLeft(String),
}

struct MemberLink {
    conn: u64,
    handle: ChannelHandle,
}

/// Room membership owned by the hub
pub struct HubDirectory {
    self_id: String,
    members: BTreeMap<String, ParticipantProfile>,
    links: HashMap<String, MemberLink>,
    /// Channels that arrived but have not opened yet
    pending: HashMap<u64, ChannelHandle>,
    next_conn: u64,
    tx: mpsc::UnboundedSender<HubInput>,
}

impl HubDirectory {
    /// New directory with the hub's own chat identity as first member
    pub fn new(
        self_id: &str,
        self_profile: ParticipantProfile,
    ) -> (Self, mpsc::UnboundedReceiver<HubInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut members = BTreeMap::new();
        members.insert(self_id.to_string(), self_profile);

        let directory = Self {
            self_id: self_id.to_string(),
            members,
            links: HashMap::new(),
            pending: HashMap::new(),
            next_conn: 0,
            tx,
        };
        (directory, rx)
    }

    /// Feed inbound channels of the rendezvous endpoint into this directory
    pub fn listen(&self, mut incoming: mpsc::UnboundedReceiver<Channel>) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(channel) = incoming.recv().await {
                if tx.send(HubInput::Incoming(channel)).is_err() {
                    break;
                }
            }
        });
    }

    pub fn handle(&mut self, input: HubInput) -> Vec<DirectoryEvent> {
        match input {
            HubInput::Incoming(channel) => {
                self.track(channel);
                Vec::new()
            }
            HubInput::Event { conn, event } => match event {
                ChannelEvent::Open => self.on_open(conn),
                ChannelEvent::Data(value) => self.on_data(conn, value),
                ChannelEvent::Close => self.on_close(conn),
                ChannelEvent::Error(e) => {
                    warn!(conn = conn, error = %e, "Signaling channel error");
                    if self.pending.remove(&conn).is_some() {
                        return Vec::new();
                    }
                    let gone = self
                        .member_for(conn)
                        .map(|id| !self.links[id].handle.is_open())
                        .unwrap_or(false);
                    if gone {
                        self.on_close(conn)
                    } else {
                        Vec::new()
                    }
                }
            },
        }
    }

    fn track(&mut self, channel: Channel) {
        let conn = self.next_conn;
        self.next_conn += 1;

        let (handle, mut events) = channel.into_parts();
        debug!(peer = %handle.peer(), conn = conn, "Hub: new signaling channel");
        self.pending.insert(conn, handle);

        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(HubInput::Event { conn, event }).is_err() {
                    break;
                }
            }
        });
    }

    fn member_for(&self, conn: u64) -> Option<&String> {
        self.links
            .iter()
            .find(|(_, link)| link.conn == conn)
            .map(|(id, _)| id)
    }

    fn on_open(&mut self, conn: u64) -> Vec<DirectoryEvent> {
        let Some(handle) = self.pending.remove(&conn) else {
            return Vec::new();
        };
        let peer_id = handle.peer().to_string();

        // metadata carries the profile when the transport supports it
        let profile = handle
            .metadata()
            .and_then(|m| serde_json::from_value::<ParticipantProfile>(m.clone()).ok())
            .unwrap_or_else(|| ParticipantProfile::placeholder(&peer_id));

        if let Some(old) = self.links.insert(
            peer_id.clone(),
            MemberLink {
                conn,
                handle: handle.clone(),
            },
        ) {
            debug!(peer_id = %peer_id, "Replacing older signaling channel");
            old.handle.close();
        }
        self.members.insert(peer_id.clone(), profile);

        let peers: Vec<String> = self
            .members
            .keys()
            .filter(|id| **id != peer_id)
            .cloned()
            .collect();
        info!(peer_id = %peer_id, peers = ?peers, "Hub: sending peer list");
        if let Err(e) = handle.send(&SignalMessage::PeerList { peers }) {
            warn!(peer_id = %peer_id, error = %e, "Failed to send peer list");
        }

        self.broadcast(
            &SignalMessage::PeerJoined {
                peer_id: peer_id.clone(),
            },
            Some(&peer_id),
        );

        vec![DirectoryEvent::MemberJoined(peer_id)]
    }

    fn on_data(&mut self, conn: u64, value: serde_json::Value) -> Vec<DirectoryEvent> {
        let Some(peer_id) = self.member_for(conn).cloned() else {
            debug!(conn = conn, "Data on unknown signaling channel");
            return Vec::new();
        };

        let msg = match SignalMessage::from_value(value) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "Dropping malformed signal");
                return Vec::new();
            }
        };

        match msg {
            SignalMessage::Join {
                peer_id: announced,
                user_id,
                username,
                avatar_seed,
            } => {
                if user_id.is_empty() || username.is_empty() || avatar_seed.is_empty() {
                    debug!(peer_id = %peer_id, "Ignoring incomplete join");
                    return Vec::new();
                }
                if announced != peer_id {
                    debug!(peer_id = %peer_id, announced = %announced, "Join names a different peer id");
                }
                let profile = ParticipantProfile {
                    user_id,
                    username,
                    avatar_seed,
                };
                info!(peer_id = %peer_id, username = %profile.username, "Hub: member announced");
                self.members.insert(peer_id.clone(), profile.clone());
                vec![DirectoryEvent::MemberProfiled(peer_id, profile)]
            }
            other => {
                debug!(peer_id = %peer_id, msg = ?other, "Ignoring unexpected signal");
                Vec::new()
            }
        }
    }

    fn on_close(&mut self, conn: u64) -> Vec<DirectoryEvent> {
        if self.pending.remove(&conn).is_some() {
            return Vec::new();
        }
        let Some(peer_id) = self.member_for(conn).cloned() else {
            return Vec::new();
        };

        info!(peer_id = %peer_id, "Hub: member left");
        self.links.remove(&peer_id);
        self.members.remove(&peer_id);
        self.broadcast(
            &SignalMessage::PeerLeft {
                peer_id: peer_id.clone(),
            },
            None,
        );

        vec![DirectoryEvent::MemberLeft(peer_id)]
    }

    /// Send to every open member channel independently; failures are logged
    fn broadcast(&self, msg: &SignalMessage, except: Option<&str>) {
        for (peer_id, link) in &self.links {
            if except == Some(peer_id.as_str()) {
                continue;
            }
            if !link.handle.is_open() {
                debug!(peer_id = %peer_id, "Skipping closed signaling channel");
                continue;
            }
            if let Err(e) = link.handle.send(msg) {
                warn!(peer_id = %peer_id, error = %e, "Failed to broadcast from hub");
            }
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Current members including the hub itself
    pub fn members(&self) -> Vec<(String, ParticipantProfile)> {
        self.members
            .iter()
            .map(|(id, p)| (id.clone(), p.clone()))
            .collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Open signaling channels to members
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Close every signaling channel and forget all members but the hub
    pub fn close_all(&mut self) {
        for (_, link) in self.links.drain() {
            link.handle.close();
        }
        for (_, handle) in self.pending.drain() {
            handle.close();
        }
        let own = self.members.remove(&self.self_id);
        self.members.clear();
        if let Some(own) = own {
            self.members.insert(self.self_id.clone(), own);
        }
    }
}
