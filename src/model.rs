//! Shared data model: the session record, media kinds, server status
//! records, chat messages, and the cross-context bus message.
//!
//! Wire-facing types keep the field names the remote service and the
//! broadcast channel use (`sessionId`, `filename`, `SESSION_UPDATE`), so they
//! serialize without a translation layer.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session record
// ---------------------------------------------------------------------------

/// Identifiers shorter than this are treated as corrupt.
pub const MIN_SESSION_ID_LEN: usize = 16;

/// Stored identifiers older than this are discarded on next read.
pub const SESSION_RETENTION_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Timestamps further than this in the future are treated as corrupt.
const MAX_CLOCK_SKEW_MS: i64 = 5 * 60 * 1000;

/// Values that earlier clients or misbehaving scripts wrote as a stand-in
/// for "no session".
const PLACEHOLDER_IDS: &[&str] = &["default", "undefined", "null", "anonymous", "none"];

/// The persisted session identifier and the time it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Opaque identifier sent with every request.
    pub id: String,
    /// Write time as epoch milliseconds.
    pub created_at: i64,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: id.into(),
            created_at,
        }
    }

    /// Whether the record can still be trusted at `now_ms`.
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        if !is_usable_session_id(&self.id) {
            return false;
        }
        let age = now_ms.saturating_sub(self.created_at);
        age <= SESSION_RETENTION_MS && age >= -MAX_CLOCK_SKEW_MS
    }
}

/// Check an identifier for length and placeholder values.
pub fn is_usable_session_id(id: &str) -> bool {
    let trimmed = id.trim();
    trimmed.len() >= MIN_SESSION_ID_LEN
        && trimmed == id
        && !PLACEHOLDER_IDS
            .iter()
            .any(|p| trimmed.eq_ignore_ascii_case(p))
}

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Parse a stored timestamp string into epoch milliseconds.
///
/// Values below 100 billion are taken as seconds (older clients stored
/// `Date.now() / 1000`-style values); anything else as milliseconds.
/// RFC 3339 strings are accepted as well. Values that overflow when scaled
/// to milliseconds are rejected.
pub fn parse_stored_timestamp(raw: &str) -> Option<i64> {
    const MILLIS_THRESHOLD: i64 = 100_000_000_000;

    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(i) = raw.parse::<i64>() {
        return if i < MILLIS_THRESHOLD {
            i.checked_mul(1000)
        } else {
            Some(i)
        };
    }
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

// ---------------------------------------------------------------------------
// Media kinds
// ---------------------------------------------------------------------------

/// The two kinds of file the service processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    #[serde(rename = "pdf")]
    Document,
    #[serde(rename = "audio")]
    Audio,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Document, MediaKind::Audio];

    /// Human-readable label for messages.
    pub fn label(self) -> &'static str {
        match self {
            Self::Document => "PDF",
            Self::Audio => "audio",
        }
    }

    /// Path segment used by the upload and status endpoints.
    pub fn slug(self) -> &'static str {
        match self {
            Self::Document => "pdf",
            Self::Audio => "audio",
        }
    }

    /// Lowercase file extensions accepted for this kind.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Document => &["pdf"],
            Self::Audio => &["mp3", "wav", "m4a", "ogg", "flac", "webm"],
        }
    }

    /// How long to wait for server-side processing before giving up.
    pub fn processing_timeout(self) -> Duration {
        match self {
            Self::Document => Duration::from_secs(5 * 60),
            Self::Audio => Duration::from_secs(10 * 60),
        }
    }

    /// Whether `path` has an extension this kind accepts.
    pub fn accepts(self, path: &Path) -> bool {
        extension_of(path).is_some_and(|ext| self.extensions().contains(&ext.as_str()))
    }

    /// Guess the kind from a file extension.
    pub fn detect(path: &Path) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.accepts(path))
    }

    /// MIME type sent with the multipart file part.
    pub fn mime_type(self, path: &Path) -> &'static str {
        match (self, extension_of(path).as_deref()) {
            (Self::Document, _) => "application/pdf",
            (Self::Audio, Some("mp3")) => "audio/mpeg",
            (Self::Audio, Some("wav")) => "audio/wav",
            (Self::Audio, Some("m4a")) => "audio/mp4",
            (Self::Audio, Some("ogg")) => "audio/ogg",
            (Self::Audio, Some("flac")) => "audio/flac",
            (Self::Audio, Some("webm")) => "audio/webm",
            (Self::Audio, _) => "application/octet-stream",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" | "document" | "doc" => Ok(Self::Document),
            "audio" => Ok(Self::Audio),
            other => Err(format!("unknown media kind '{other}' (expected pdf or audio)")),
        }
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

// ---------------------------------------------------------------------------
// Status records
// ---------------------------------------------------------------------------

/// Server-side processing state of one uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    #[serde(alias = "pending", alias = "queued", alias = "uploaded")]
    Processing,
    #[serde(alias = "completed", alias = "done", alias = "processed")]
    Ready,
    #[serde(alias = "error")]
    Failed,
    /// Anything the client does not recognize; polling continues.
    #[serde(other)]
    Unknown,
}

impl ProcessingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

/// One entry of a status endpoint response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStatus {
    pub filename: String,
    pub status: ProcessingStatus,
    /// Server-supplied failure detail, if any.
    #[serde(default, alias = "message", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Fields the client does not interpret (page counts, durations, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// Who sent a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// A single entry of the chat transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Cross-context bus
// ---------------------------------------------------------------------------

/// Message published on the session bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusMessage {
    /// A context created or refreshed its identifier.
    #[serde(rename = "SESSION_UPDATE", rename_all = "camelCase")]
    SessionUpdate { session_id: String, timestamp: i64 },
}
