//! Remote service client: upload, status and chat endpoints, plus the
//! authentication gate every user action passes through.
//!
//! Endpoints (relative to the configured base URL):
//!
//! | Action | Request |
//! |--------|---------|
//! | upload | `POST /upload/{pdf,audio}` multipart `file`, `X-Session-ID` header |
//! | status | `GET /status/{pdf,audio}?session_id=…` → list of status records |
//! | chat   | `POST /chat` JSON `{"message"}`, `X-Session-ID` header → `{"response"}` |
//!
//! The [`MediaApi`] and [`ChatApi`] traits are the seam the upload tracker
//! and chat session are generic over; [`HttpApi`] is the reqwest-backed
//! implementation.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::ClientError;
use crate::model::{FileStatus, MediaKind};

/// Header carrying the session identifier.
pub const SESSION_HEADER: &str = "X-Session-ID";

/// Longest server error body kept in an error message.
const MAX_ERROR_BODY: usize = 300;

// ---------------------------------------------------------------------------
// Authentication gate
// ---------------------------------------------------------------------------

/// Externally managed signed-in state.
pub trait AuthGate: Send + Sync {
    fn is_signed_in(&self) -> bool;

    /// Refuse `action` when signed out. Nothing is queued for later.
    fn require(&self, action: &str) -> Result<(), ClientError> {
        if self.is_signed_in() {
            Ok(())
        } else {
            warn!(action, "action refused: not signed in");
            Err(ClientError::NotSignedIn {
                action: action.to_string(),
            })
        }
    }
}

impl AuthGate for Config {
    fn is_signed_in(&self) -> bool {
        Config::is_signed_in(self)
    }
}

/// Fixed signed-in state, for embedding callers that track auth themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticAuth(pub bool);

impl AuthGate for StaticAuth {
    fn is_signed_in(&self) -> bool {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Upload payload
// ---------------------------------------------------------------------------

/// A file validated for a media kind and loaded into memory.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub kind: MediaKind,
    /// Name the server reports status under.
    pub filename: String,
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    /// Check the extension against `kind` and read the file.
    pub async fn read(path: &Path, kind: MediaKind) -> Result<Self, ClientError> {
        if !kind.accepts(path) {
            return Err(ClientError::UnsupportedFile {
                path: path.to_path_buf(),
                kind,
            });
        }
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ClientError::FileRead {
                path: path.to_path_buf(),
                detail: "path has no file name".to_string(),
            })?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ClientError::FileRead {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        Ok(Self {
            kind,
            filename,
            path: path.to_path_buf(),
            bytes,
        })
    }

    /// In-memory payload, no extension check.
    pub fn from_bytes(kind: MediaKind, filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        let filename = filename.into();
        Self {
            kind,
            path: PathBuf::from(&filename),
            filename,
            bytes,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        self.kind.mime_type(&self.path)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Upload and status endpoints.
pub trait MediaApi: Send + Sync {
    fn upload(
        &self,
        file: &UploadFile,
        session_id: &str,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn fetch_status(
        &self,
        kind: MediaKind,
        session_id: &str,
    ) -> impl Future<Output = Result<Vec<FileStatus>, ClientError>> + Send;
}

/// Chat endpoint.
pub trait ChatApi: Send + Sync {
    fn send_message(
        &self,
        message: &str,
        session_id: &str,
    ) -> impl Future<Output = Result<String, ClientError>> + Send;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// reqwest-backed client for the remote service.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpApi {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("docchat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClientError::Network {
                endpoint: base_url.to_string(),
                detail: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ClientError> {
        Self::new(
            &config.api_url,
            config.token.clone(),
            config.request_timeout(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn upload_url(&self, kind: MediaKind) -> String {
        format!("{}/upload/{}", self.base_url, kind.slug())
    }

    pub fn status_url(&self, kind: MediaKind, session_id: &str) -> String {
        format!(
            "{}/status/{}?session_id={}",
            self.base_url,
            kind.slug(),
            urlencoding::encode(session_id)
        )
    }

    pub fn chat_url(&self) -> String {
        format!("{}/chat", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl MediaApi for HttpApi {
    async fn upload(&self, file: &UploadFile, session_id: &str) -> Result<(), ClientError> {
        let url = self.upload_url(file.kind);
        let part = reqwest::multipart::Part::bytes(file.bytes.clone())
            .file_name(file.filename.clone())
            .mime_str(file.mime_type())
            .map_err(|e| ClientError::Network {
                endpoint: url.clone(),
                detail: format!("invalid MIME type: {e}"),
            })?;
        let form = reqwest::multipart::Form::new().part("file", part);

        debug!(url = %url, filename = %file.filename, bytes = file.bytes.len(), "uploading file");
        let response = self
            .authorize(self.client.post(&url))
            .header(SESSION_HEADER, session_id)
            .multipart(form)
            .send()
            .await
            .map_err(|e| network_error(&url, e))?;
        check_status(&url, response).await?;
        Ok(())
    }

    async fn fetch_status(
        &self,
        kind: MediaKind,
        session_id: &str,
    ) -> Result<Vec<FileStatus>, ClientError> {
        let url = self.status_url(kind, session_id);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| network_error(&url, e))?;
        let body = check_status(&url, response)
            .await?
            .text()
            .await
            .map_err(|e| network_error(&url, e))?;
        trace!(url = %url, body = %body, "status response");
        parse_status_body(&body).map_err(|detail| ClientError::MalformedResponse {
            endpoint: url,
            detail,
        })
    }
}

impl ChatApi for HttpApi {
    async fn send_message(&self, message: &str, session_id: &str) -> Result<String, ClientError> {
        let url = self.chat_url();
        let response = self
            .authorize(self.client.post(&url))
            .header(SESSION_HEADER, session_id)
            .json(&serde_json::json!({ "message": message }))
            .send()
            .await
            .map_err(|e| network_error(&url, e))?;
        let body: serde_json::Value = check_status(&url, response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::MalformedResponse {
                endpoint: url.clone(),
                detail: e.to_string(),
            })?;
        parse_chat_reply(&body).ok_or_else(|| ClientError::MalformedResponse {
            endpoint: url,
            detail: "no response text in body".to_string(),
        })
    }
}

fn network_error(url: &str, e: reqwest::Error) -> ClientError {
    let detail = if e.is_timeout() {
        "request timed out".to_string()
    } else {
        e.to_string()
    };
    ClientError::Network {
        endpoint: url.to_string(),
        detail,
    }
}

async fn check_status(
    url: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
        body.push_str("...");
    }
    Err(ClientError::HttpStatus {
        endpoint: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

/// Decode a status response: a bare array, or an object wrapping one under
/// `files` or `statuses`.
pub fn parse_status_body(body: &str) -> Result<Vec<FileStatus>, String> {
    let value: serde_json::Value = serde_json::from_str(body).map_err(|e| e.to_string())?;
    let list = match value {
        serde_json::Value::Array(_) => value,
        serde_json::Value::Object(mut obj) => obj
            .remove("files")
            .or_else(|| obj.remove("statuses"))
            .ok_or_else(|| "expected a list of file statuses".to_string())?,
        _ => return Err("expected a list of file statuses".to_string()),
    };
    serde_json::from_value(list).map_err(|e| e.to_string())
}

/// Pull the assistant's text out of a chat response body.
pub fn parse_chat_reply(body: &serde_json::Value) -> Option<String> {
    if let Some(text) = body.as_str() {
        return Some(text.to_string());
    }
    ["response", "message", "answer"]
        .iter()
        .find_map(|key| body.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
}
