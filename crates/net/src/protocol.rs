//! Wire message types
//!
//! Three families, never mixed on one channel:
//! - [`SignalMessage`]: hub <-> member signaling
//! - [`MeshMessage`]: peer <-> peer chat traffic
//! - [`RelayMessage`]: TCP transport <-> broker

use huddle_core::{ChatMessage, ParticipantProfile};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Hub signaling messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Member announces the identity it chats under and its profile
    #[serde(rename_all = "camelCase")]
    Join {
        peer_id: String,
        user_id: String,
        username: String,
        avatar_seed: String,
    },

    /// Current members, never including the recipient
    PeerList { peers: Vec<String> },

    /// Somebody new arrived
    #[serde(rename_all = "camelCase", alias = "announce")]
    PeerJoined { peer_id: String },

    /// A member's signaling channel closed
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String },
}

impl SignalMessage {
    pub fn join(peer_id: &str, profile: &ParticipantProfile) -> Self {
        SignalMessage::Join {
            peer_id: peer_id.to_string(),
            user_id: profile.user_id.clone(),
            username: profile.username.clone(),
            avatar_seed: profile.avatar_seed.clone(),
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::Protocol(format!("Bad signal: {}", e)))
    }
}

/// Profile handshake sent on every freshly opened mesh channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: String,
    pub username: String,
    pub avatar_seed: String,
}

impl From<&ParticipantProfile> for UserInfo {
    fn from(p: &ParticipantProfile) -> Self {
        Self {
            id: p.user_id.clone(),
            username: p.username.clone(),
            avatar_seed: p.avatar_seed.clone(),
        }
    }
}

impl From<UserInfo> for ParticipantProfile {
    fn from(info: UserInfo) -> Self {
        Self {
            user_id: info.id,
            username: info.username,
            avatar_seed: info.avatar_seed,
        }
    }
}

/// Mesh messages, `{ "type": ..., "payload": ... }` on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum MeshMessage {
    UserInfo(UserInfo),
    Message(ChatMessage),
    Ping,
    Pong,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

impl MeshMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            MeshMessage::UserInfo(_) => "user_info",
            MeshMessage::Message(_) => "message",
            MeshMessage::Ping => "ping",
            MeshMessage::Pong => "pong",
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        let payload = match self {
            MeshMessage::UserInfo(info) => serde_json::to_value(info)?,
            MeshMessage::Message(msg) => serde_json::to_value(msg)?,
            MeshMessage::Ping | MeshMessage::Pong => Value::Object(Default::default()),
        };
        Ok(serde_json::to_value(Envelope {
            kind: self.kind().to_string(),
            payload,
        })?)
    }

    /// Decode by tag; unknown tags are a protocol error
    pub fn from_value(value: Value) -> Result<Self> {
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("Bad mesh envelope: {}", e)))?;

        let msg = match envelope.kind.as_str() {
            "user_info" => MeshMessage::UserInfo(
                serde_json::from_value(envelope.payload)
                    .map_err(|e| Error::Protocol(format!("Bad user_info: {}", e)))?,
            ),
            "message" => MeshMessage::Message(
                serde_json::from_value(envelope.payload)
                    .map_err(|e| Error::Protocol(format!("Bad message: {}", e)))?,
            ),
            "ping" => MeshMessage::Ping,
            "pong" => MeshMessage::Pong,
            other => return Err(Error::Protocol(format!("Unknown mesh type: {}", other))),
        };
        Ok(msg)
    }
}

/// TCP transport <-> broker messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// First frame from a client: claim an identity (random when absent)
    Claim { id: Option<String> },

    /// Identity granted
    Claimed { id: String },

    /// Identity refused
    ClaimRejected { kind: String, reason: String },

    /// Open a channel to another identity
    Connect {
        channel: Uuid,
        to: String,
        metadata: Option<Value>,
    },

    /// Someone opened a channel to us
    Incoming {
        channel: Uuid,
        from: String,
        metadata: Option<Value>,
    },

    /// Our channel reached its target
    Opened { channel: Uuid },

    /// Our channel could not be opened
    ConnectFailed {
        channel: Uuid,
        kind: String,
        reason: String,
    },

    /// Channel payload, either direction
    Data { channel: Uuid, payload: Value },

    /// Close a channel
    Close { channel: Uuid },

    /// The other side closed
    Closed { channel: Uuid },

    /// Keepalive
    Ping,

    /// Keepalive reply
    Pong,
}

impl RelayMessage {
    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
