//! Peer connection status as seen by the local participant

use serde::{Deserialize, Serialize};

use super::ParticipantProfile;

/// Lifecycle of a direct link to one remote identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl PeerStatus {
    pub fn is_connected(self) -> bool {
        self == PeerStatus::Connected
    }
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PeerStatus::Disconnected => "disconnected",
            PeerStatus::Connecting => "connecting",
            PeerStatus::Connected => "connected",
            PeerStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a remote peer handed to consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub profile: Option<ParticipantProfile>,
    pub status: PeerStatus,
    pub retry_count: u32,
}

impl PeerSnapshot {
    /// Name to display, falling back to the transport identity
    pub fn display_name(&self) -> &str {
        self.profile
            .as_ref()
            .map(|p| p.username.as_str())
            .unwrap_or(self.peer_id.as_str())
    }
}
