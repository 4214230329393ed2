//! Actionable typed errors for docchat.
//!
//! Each error variant includes enough context for the user to understand
//! what went wrong and what to do next. Internal propagation in the CLI uses
//! `anyhow`; the public API exposes these `thiserror` types.
//!
//! Storage errors never reach callers of the session manager: they are
//! recovered by falling through to the next tier. They are public so that
//! custom [`KeyValueStore`](crate::storage::KeyValueStore) implementations
//! can report them.

use std::path::PathBuf;

use crate::model::MediaKind;

/// Failure of a single storage tier operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Backend cannot be used at all (access denied, missing directory,
    /// private mode, ...).
    #[error("storage tier '{tier}' unavailable: {reason}")]
    Unavailable { tier: String, reason: String },

    /// Backend refused the write because it is full.
    #[error("storage tier '{tier}' quota exceeded")]
    QuotaExceeded { tier: String },

    /// Backend contents could not be decoded.
    #[error("storage tier '{tier}' is corrupt: {detail}")]
    Corrupt { tier: String, detail: String },
}

/// Errors that docchat surfaces to the user.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// An upload or chat action was attempted without a signed-in state.
    #[error("You must sign in before you can {action}. Set DOCCHAT_TOKEN or pass --token.")]
    NotSignedIn { action: String },

    /// File does not match the media kind it is being uploaded as.
    #[error(
        "{} is not a supported {} file. Accepted extensions: {}",
        path.display(),
        kind.label(),
        kind.extensions().join(", ")
    )]
    UnsupportedFile { path: PathBuf, kind: MediaKind },

    /// Local file could not be read for upload.
    #[error("Failed to read {}: {detail}", path.display())]
    FileRead { path: PathBuf, detail: String },

    /// Request never produced a response (connect, DNS, TLS, reset).
    #[error("Request to {endpoint} failed: {detail}")]
    Network { endpoint: String, detail: String },

    /// Server answered with a non-success status.
    #[error("Request to {endpoint} returned HTTP {status}: {body}")]
    HttpStatus {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// Server answered but the body could not be decoded.
    #[error("Unexpected response from {endpoint}: {detail}")]
    MalformedResponse { endpoint: String, detail: String },

    /// Chat message was empty after trimming.
    #[error("Message is empty. Type something to ask about your files.")]
    EmptyMessage,

    /// A polling loop for this file is already running.
    #[error("'{filename}' is already being uploaded. Wait for it to finish.")]
    AlreadyInProgress { filename: String },

    /// `retry()` was called on an upload that has not failed.
    #[error("Upload of '{filename}' has not failed; nothing to retry.")]
    NothingToRetry { filename: String },

    /// Configuration file could not be read or parsed.
    #[error("Invalid configuration at {}: {detail}", path.display())]
    Config { path: PathBuf, detail: String },
}

impl ClientError {
    /// Whether a polling loop should keep going after this error.
    ///
    /// Network failures, server-side errors, throttling and undecodable
    /// bodies are transient. Any other HTTP status ends the loop.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } | Self::MalformedResponse { .. } => true,
            Self::HttpStatus { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }

    /// Stable snake_case tag used in `--json` output.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::NotSignedIn { .. } => "not_signed_in",
            Self::UnsupportedFile { .. } => "unsupported_file",
            Self::FileRead { .. } => "file_read",
            Self::Network { .. } => "network",
            Self::HttpStatus { .. } => "http_status",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::EmptyMessage => "empty_message",
            Self::AlreadyInProgress { .. } => "already_in_progress",
            Self::NothingToRetry { .. } => "nothing_to_retry",
            Self::Config { .. } => "config",
        }
    }
}
