//! Client configuration.
//!
//! Sources, later ones winning:
//! 1. Built-in defaults.
//! 2. `config.toml` at `$DOCCHAT_CONFIG`, or `<config_dir>/docchat/config.toml`.
//! 3. Environment: `DOCCHAT_API_URL`, `DOCCHAT_TOKEN`, `DOCCHAT_HOME`,
//!    `DOCCHAT_SESSION_DIR`, `DOCCHAT_CHANNEL`.
//! 4. CLI flags (applied by the binary).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClientError;
use crate::model::MediaKind;

pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Resolved settings for one client run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Base URL of the remote service.
    pub api_url: String,
    /// Bearer token from the identity provider; absent means signed out.
    pub token: Option<String>,
    /// Directory of the durable storage tier.
    pub data_dir: PathBuf,
    /// Directory of the session-scoped storage tier.
    pub session_dir: PathBuf,
    /// Name of the session broadcast channel.
    pub channel: String,
    /// Delay between status polls.
    pub poll_interval_ms: u64,
    /// Override of the PDF processing ceiling.
    pub document_timeout_secs: Option<u64>,
    /// Override of the audio processing ceiling.
    pub audio_timeout_secs: Option<u64>,
    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
            data_dir: default_data_dir(),
            session_dir: default_session_dir(),
            channel: crate::sync::DEFAULT_CHANNEL.to_string(),
            poll_interval_ms: 2_000,
            document_timeout_secs: None,
            audio_timeout_secs: None,
            request_timeout_secs: 30,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("docchat"))
        .unwrap_or_else(|| PathBuf::from(".docchat"))
}

/// Runtime dir when the platform has one (cleared at logout), else a
/// per-user temp subdirectory.
fn default_session_dir() -> PathBuf {
    if let Some(dir) = dirs::runtime_dir() {
        return dir.join("docchat");
    }
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "default".to_string());
    std::env::temp_dir().join(format!("docchat-{user}"))
}

/// Default location of the config file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("docchat").join("config.toml"))
}

impl Config {
    /// Load from file and environment.
    ///
    /// An explicitly named file must exist; the default location is
    /// optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ClientError> {
        let from_env = std::env::var_os("DOCCHAT_CONFIG").map(PathBuf::from);
        let (path, required) = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(p) => (Some(p), true),
            None => (default_config_path(), false),
        };

        let mut config = match path {
            Some(ref p) if p.is_file() => Self::from_file(p)?,
            Some(ref p) if required => {
                return Err(ClientError::Config {
                    path: p.clone(),
                    detail: "file not found".to_string(),
                });
            }
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ClientError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ClientError::Config {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let config = Self::from_toml(&raw).map_err(|detail| ClientError::Config {
            path: path.to_path_buf(),
            detail,
        })?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|e| e.to_string())
    }

    /// Apply `DOCCHAT_*` overrides from `lookup` (the process environment in
    /// normal use). Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = get("DOCCHAT_API_URL") {
            self.api_url = url;
        }
        if let Some(token) = get("DOCCHAT_TOKEN") {
            self.token = Some(token);
        }
        if let Some(home) = get("DOCCHAT_HOME") {
            self.data_dir = PathBuf::from(home);
        }
        if let Some(dir) = get("DOCCHAT_SESSION_DIR") {
            self.session_dir = PathBuf::from(dir);
        }
        if let Some(channel) = get("DOCCHAT_CHANNEL") {
            self.channel = channel;
        }
    }

    pub fn durable_store_path(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }

    pub fn session_store_path(&self) -> PathBuf {
        self.session_dir.join("session.json")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Processing ceiling for `kind`, honoring overrides.
    pub fn processing_timeout(&self, kind: MediaKind) -> Duration {
        let override_secs = match kind {
            MediaKind::Document => self.document_timeout_secs,
            MediaKind::Audio => self.audio_timeout_secs,
        };
        override_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| kind.processing_timeout())
    }

    /// Whether an identity token is present.
    pub fn is_signed_in(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            api_url = "https://docs.example.com/api"
            poll_interval_ms = 500
            audio_timeout_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.api_url, "https://docs.example.com/api");
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(
            config.processing_timeout(MediaKind::Audio),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.processing_timeout(MediaKind::Document),
            Duration::from_secs(300)
        );
        assert_eq!(config.channel, crate::sync::DEFAULT_CHANNEL);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml("api_uri = \"typo\"").unwrap_err();
        assert!(err.contains("api_uri"));
    }

    #[test]
    fn env_overrides_win_and_blank_values_are_ignored() {
        let env: HashMap<&str, &str> = [
            ("DOCCHAT_API_URL", "http://127.0.0.1:9000"),
            ("DOCCHAT_TOKEN", "   "),
            ("DOCCHAT_HOME", "/var/lib/docchat"),
            ("DOCCHAT_CHANNEL", "team-a"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.api_url, "http://127.0.0.1:9000");
        assert_eq!(config.token, None);
        assert!(!config.is_signed_in());
        assert_eq!(
            config.durable_store_path(),
            PathBuf::from("/var/lib/docchat/session.json")
        );
        assert_eq!(config.channel, "team-a");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("nope.toml");
        let err = Config::load(Some(&missing)).unwrap_err();
        assert!(matches!(err, ClientError::Config { .. }));
    }

    #[test]
    fn malformed_file_reports_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "poll_interval_ms = \"soon\"").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }
}
