//! In-memory room state
//!
//! Chat history and the peer roster live only for the lifetime of the
//! process. Nothing here is persisted.

use std::collections::{BTreeMap, VecDeque};

use crate::models::{username_for_seed, ChatMessage, ParticipantProfile, PeerSnapshot, PeerStatus};

/// Maximum messages kept in memory
const MAX_MESSAGES: usize = 1000;

/// Roster entry for a remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub profile: Option<ParticipantProfile>,
    pub status: PeerStatus,
}

impl PeerEntry {
    /// Announced username, or a stable dish name derived from the peer id
    /// until a real profile arrives
    pub fn display_name(&self, peer_id: &str) -> String {
        match &self.profile {
            Some(profile) if !profile.is_placeholder() => profile.username.clone(),
            _ => username_for_seed(peer_id),
        }
    }
}

/// Chat log and roster for the room the local user is in
#[derive(Debug)]
pub struct RoomState {
    local: ParticipantProfile,
    messages: VecDeque<ChatMessage>,
    peers: BTreeMap<String, PeerEntry>,
}

impl RoomState {
    pub fn new(local: ParticipantProfile) -> Self {
        Self {
            local,
            messages: VecDeque::new(),
            peers: BTreeMap::new(),
        }
    }

    pub fn local(&self) -> &ParticipantProfile {
        &self.local
    }

    /// Append a message, dropping the oldest once the log is full
    pub fn add_message(&mut self, message: ChatMessage) {
        if self.messages.iter().any(|m| m.id == message.id) {
            return;
        }
        if self.messages.len() >= MAX_MESSAGES {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// Oldest first
    pub fn messages(&self) -> impl ExactSizeIterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerEntry> {
        self.peers.get(peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = (&String, &PeerEntry)> {
        self.peers.iter()
    }

    /// Replace the roster with a fresh snapshot from the session
    pub fn sync_peers(&mut self, snapshot: &[PeerSnapshot]) {
        self.peers = snapshot
            .iter()
            .map(|p| {
                (
                    p.peer_id.clone(),
                    PeerEntry {
                        profile: p.profile.clone(),
                        status: p.status,
                    },
                )
            })
            .collect();
    }

    /// Connected peers plus the local user
    pub fn online_count(&self) -> usize {
        1 + self
            .peers
            .values()
            .filter(|p| p.status.is_connected())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str) -> ParticipantProfile {
        ParticipantProfile::new(format!("u-{}", name), name.to_string(), name.to_string()).unwrap()
    }

    fn snapshot(id: &str, profile: Option<ParticipantProfile>, status: PeerStatus) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: id.into(),
            profile,
            status,
            retry_count: 0,
        }
    }

    #[test]
    fn test_roster_follows_snapshots() {
        let mut state = RoomState::new(profile("Pho"));
        assert_eq!(state.online_count(), 1);

        state.sync_peers(&[snapshot("p1", None, PeerStatus::Connecting)]);
        assert_eq!(state.peer("p1").unwrap().status, PeerStatus::Connecting);
        assert_eq!(state.online_count(), 1);

        state.sync_peers(&[snapshot("p1", Some(profile("Taco")), PeerStatus::Connected)]);
        let entry = state.peer("p1").unwrap();
        assert_eq!(entry.display_name("p1"), "Taco");
        assert_eq!(state.online_count(), 2);

        state.sync_peers(&[snapshot("p2", None, PeerStatus::Connected)]);
        assert!(state.peer("p1").is_none());
        assert_eq!(state.online_count(), 2);
    }

    #[test]
    fn test_display_name_before_profile() {
        let unknown = PeerEntry {
            profile: None,
            status: PeerStatus::Connecting,
        };
        assert_eq!(unknown.display_name("peer-7"), username_for_seed("peer-7"));

        let placeholder = PeerEntry {
            profile: Some(ParticipantProfile::placeholder("peer-7")),
            status: PeerStatus::Connected,
        };
        assert_eq!(placeholder.display_name("peer-7"), username_for_seed("peer-7"));
    }

    #[test]
    fn test_message_log_dedup_and_cap() {
        let me = profile("Pho");
        let mut state = RoomState::new(me.clone());

        let msg = ChatMessage::text(&me, "hi");
        state.add_message(msg.clone());
        state.add_message(msg);
        assert_eq!(state.message_count(), 1);

        for i in 0..MAX_MESSAGES {
            state.add_message(ChatMessage::text(&me, format!("m{}", i)));
        }
        assert_eq!(state.message_count(), MAX_MESSAGES);
        assert_eq!(state.messages().next().unwrap().summary(), "m0");
        assert_eq!(state.messages().last().unwrap().summary(), format!("m{}", MAX_MESSAGES - 1));
    }
}
