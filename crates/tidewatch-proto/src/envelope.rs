use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome class of a generic status envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Success,
    Error,
    Info,
}

/// Generic `{status, message}` envelope used for acknowledgments and errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub status: StatusKind,
    pub message: String,
}

impl Status {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: StatusKind::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: StatusKind::Error,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            status: StatusKind::Info,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == StatusKind::Error
    }
}

/// First message a server sends on a freshly accepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub server_name: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub connection_id: Uuid,
}

/// One row of a `file_list` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub full_path: String,
    pub is_directory: bool,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One encoded frame inside a `video_batch` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameData {
    pub index: u64,
    /// Base64 JPEG.
    pub data: String,
}

/// Typed envelopes, discriminated on the wire by their `type` field.
///
/// `path` is the session key of a transfer: the path exactly as the console
/// requested it. Consumers normalize it with [`crate::normalize_key`] before
/// correlating envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Handshake(Handshake),
    FileList {
        path: String,
        items: Vec<FileEntry>,
    },
    FileStart {
        path: String,
        size: u64,
        content_type: String,
    },
    FileChunk {
        path: String,
        index: u64,
        data: String,
    },
    FileEnd {
        path: String,
        total_chunks: u64,
    },
    VideoStart {
        count: u64,
    },
    RecStarted,
    VideoBatch {
        frames: Vec<FrameData>,
    },
    VideoEnd,
}

/// Anything the server writes as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(ServerEvent),
    Status(Status),
}

impl ServerMessage {
    /// Parses one inbound text message. Returns `None` for text that is not a
    /// JSON envelope (echoes, `PONG`).
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim_start();
        if !trimmed.starts_with('{') {
            return None;
        }
        if let Ok(event) = serde_json::from_str::<ServerEvent>(trimmed) {
            return Some(Self::Event(event));
        }
        serde_json::from_str::<Status>(trimmed).ok().map(Self::Status)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<ServerEvent> for ServerMessage {
    fn from(event: ServerEvent) -> Self {
        Self::Event(event)
    }
}

impl From<Status> for ServerMessage {
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}
