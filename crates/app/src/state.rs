//! Terminal view of a room
//!
//! Applies session events to the in-memory [`RoomState`] and renders the
//! lines the terminal should show.

use std::collections::BTreeMap;

use huddle_core::{ChatMessage, ParticipantProfile, PeerStatus, RoomState};
use huddle_net::SessionEvent;

/// Room state plus what is needed to describe changes to it
pub struct ChatView {
    room: RoomState,
}

impl ChatView {
    pub fn new(local: ParticipantProfile) -> Self {
        Self {
            room: RoomState::new(local),
        }
    }

    pub fn room(&self) -> &RoomState {
        &self.room
    }

    /// Apply one event, returning the lines to print
    pub fn apply(&mut self, event: SessionEvent) -> Vec<String> {
        match event {
            SessionEvent::PeersChanged(snapshot) => {
                let before = self.connected_names();
                self.room.sync_peers(&snapshot);
                let after = self.connected_names();

                let mut lines = Vec::new();
                for (id, name) in &after {
                    if !before.contains_key(id) {
                        lines.push(format!("* {} joined ({} online)", name, self.room.online_count()));
                    }
                }
                for (id, name) in &before {
                    if !after.contains_key(id) {
                        lines.push(format!("* {} left ({} online)", name, self.room.online_count()));
                    }
                }
                lines
            }
            SessionEvent::Message(message) => {
                let line = render_message(&message);
                self.room.add_message(message);
                vec![line]
            }
            SessionEvent::PeerFailed { peer_id } => {
                let name = self.display_name(&peer_id);
                vec![format!("! Could not reach {}", name)]
            }
            SessionEvent::HubLost => vec!["! Lost the connection to the room hub".to_string()],
            SessionEvent::RoomIdle => vec!["* You are alone in this room".to_string()],
        }
    }

    /// Lines for the `/who` command
    pub fn who(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "{} online: {} (you)",
            self.room.online_count(),
            self.room.local().username
        )];
        for (id, entry) in self.room.peers() {
            lines.push(format!("  {} [{}]", entry.display_name(id), entry.status));
        }
        lines
    }

    fn display_name(&self, peer_id: &str) -> String {
        match self.room.peer(peer_id) {
            Some(entry) => entry.display_name(peer_id),
            None => huddle_core::username_for_seed(peer_id),
        }
    }

    /// Connected peers keyed by id, with a name once one is known
    fn connected_names(&self) -> BTreeMap<String, String> {
        self.room
            .peers()
            .filter(|(_, entry)| entry.status == PeerStatus::Connected)
            .map(|(id, _)| (id.clone(), self.display_name(id)))
            .collect()
    }
}

pub fn render_message(message: &ChatMessage) -> String {
    format!(
        "[{}] {}: {}",
        message.format_timestamp(),
        message.sender_name,
        message.summary()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::PeerSnapshot;

    fn snapshot(id: &str, name: Option<&str>, status: PeerStatus) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: id.to_string(),
            profile: name.map(|n| ParticipantProfile::with_username(n).unwrap()),
            status,
            retry_count: 0,
        }
    }

    #[test]
    fn test_join_and_leave_lines() {
        let mut view = ChatView::new(ParticipantProfile::with_username("Pho").unwrap());

        let lines = view.apply(SessionEvent::PeersChanged(vec![snapshot(
            "b",
            Some("Taco"),
            PeerStatus::Connected,
        )]));
        assert_eq!(lines, vec!["* Taco joined (2 online)"]);

        // status-only changes are quiet
        let lines = view.apply(SessionEvent::PeersChanged(vec![
            snapshot("b", Some("Taco"), PeerStatus::Connected),
            snapshot("c", None, PeerStatus::Connecting),
        ]));
        assert!(lines.is_empty());

        let lines = view.apply(SessionEvent::PeersChanged(vec![snapshot(
            "c",
            None,
            PeerStatus::Failed,
        )]));
        assert_eq!(lines, vec!["* Taco left (1 online)"]);
    }

    #[test]
    fn test_messages_are_logged() {
        let local = ParticipantProfile::with_username("Pho").unwrap();
        let mut view = ChatView::new(local.clone());
        let message = ChatMessage::text(&local, "hello");

        let lines = view.apply(SessionEvent::Message(message.clone()));
        assert!(lines[0].ends_with("Pho: hello"));
        view.apply(SessionEvent::Message(message));
        assert_eq!(view.room().message_count(), 1);
    }

    #[test]
    fn test_who_lists_everyone() {
        let mut view = ChatView::new(ParticipantProfile::with_username("Pho").unwrap());
        view.apply(SessionEvent::PeersChanged(vec![
            snapshot("b", Some("Taco"), PeerStatus::Connected),
            snapshot("c", None, PeerStatus::Connecting),
        ]));

        assert_eq!(
            view.who(),
            vec![
                "2 online: Pho (you)".to_string(),
                "  Taco [connected]".to_string(),
                format!("  {} [connecting]", huddle_core::username_for_seed("c")),
            ]
        );
    }

    #[test]
    fn test_unknown_peer_gets_a_dish_name() {
        let mut view = ChatView::new(ParticipantProfile::with_username("Pho").unwrap());
        let lines = view.apply(SessionEvent::PeerFailed {
            peer_id: "c".into(),
        });
        assert_eq!(
            lines,
            vec![format!("! Could not reach {}", huddle_core::username_for_seed("c"))]
        );
    }
}
