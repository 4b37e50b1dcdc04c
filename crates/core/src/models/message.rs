//! Chat message model
//!
//! Messages travel as JSON over the mesh, so field names follow the wire
//! format (`camelCase`, `type` tag).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ParticipantProfile;
use crate::error::{Error, Result};

/// A chat message exchanged in a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender_id: String,
    pub sender_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: MessageBody,
}

/// Message payload, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        image_data: String,
        filename: String,
        size: u64,
    },
    #[serde(rename_all = "camelCase")]
    File {
        filename: String,
        size: u64,
        mime_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_data: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Audio {
        audio_data: String,
        /// Seconds
        duration: f64,
        size: u64,
    },
    System {
        content: String,
    },
    UserJoin {
        content: String,
    },
    UserLeave {
        content: String,
    },
}

impl ChatMessage {
    pub fn new(sender: &ParticipantProfile, body: MessageBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: sender.user_id.clone(),
            sender_name: sender.username.clone(),
            timestamp: Utc::now(),
            body,
        }
    }

    pub fn text(sender: &ParticipantProfile, content: impl Into<String>) -> Self {
        Self::new(
            sender,
            MessageBody::Text {
                content: content.into(),
            },
        )
    }

    /// Locally generated notice (joins, leaves, room events)
    pub fn system(body: MessageBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: String::from("system"),
            sender_name: String::from("system"),
            timestamp: Utc::now(),
            body,
        }
    }

    /// Attachment message chosen by mime type
    pub fn attachment(sender: &ParticipantProfile, attachment: Attachment) -> Self {
        let body = if attachment.is_image() {
            MessageBody::Image {
                image_data: attachment.data,
                filename: attachment.filename,
                size: attachment.size,
            }
        } else {
            MessageBody::File {
                filename: attachment.filename,
                size: attachment.size,
                mime_type: attachment.mime_type,
                file_data: Some(attachment.data),
            }
        };
        Self::new(sender, body)
    }

    pub fn format_timestamp(&self) -> String {
        self.timestamp.format("%H:%M").to_string()
    }

    /// One-line rendering for terminals and logs
    pub fn summary(&self) -> String {
        match &self.body {
            MessageBody::Text { content }
            | MessageBody::System { content }
            | MessageBody::UserJoin { content }
            | MessageBody::UserLeave { content } => content.clone(),
            MessageBody::Image { filename, size, .. } => {
                format!("[image] {} ({})", filename, format_file_size(*size))
            }
            MessageBody::File { filename, size, .. } => {
                format!("[file] {} ({})", filename, format_file_size(*size))
            }
            MessageBody::Audio { duration, .. } => format!("[audio] {:.1}s", duration),
        }
    }
}

/// Base64-encoded file ready to be embedded in a message
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub data: String,
}

impl Attachment {
    pub fn from_bytes(filename: &str, mime_type: Option<&str>, bytes: &[u8]) -> Self {
        Self {
            filename: filename.to_string(),
            mime_type: mime_type
                .map(str::to_string)
                .unwrap_or_else(|| guess_mime_type(filename).to_string()),
            size: bytes.len() as u64,
            data: STANDARD.encode(bytes),
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Decode a base64 attachment payload
pub fn decode_attachment(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| Error::Attachment(format!("invalid base64: {}", e)))
}

fn guess_mime_type(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "webm" => "audio/webm",
        _ => "application/octet-stream",
    }
}

/// Human readable size: `0 B`, `1.5 KB`, `2 MB`
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[unit])
}
