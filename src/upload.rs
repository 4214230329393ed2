//! Upload tracker: the upload state machine.
//!
//! ```text
//! Idle ──► Uploading ──► Processing ──► Ready
//!              │              │
//!              └──────────────┴──► Failed { reason, message } ──retry()──► Idle
//! ```
//!
//! Processing is a polling loop: one status request per tick until the file
//! is reported `ready` or `failed`, or the per-kind ceiling elapses.
//! Transient request errors are logged and retried until that ceiling;
//! anything else ends the loop. Failures are never retried automatically.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::api::{AuthGate, MediaApi, UploadFile};
use crate::config::Config;
use crate::error::ClientError;
use crate::model::{FileStatus, MediaKind, ProcessingStatus};

/// Why an upload ended in [`UploadState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The upload request itself failed.
    Upload,
    /// Status polling hit a non-transient error.
    Network,
    /// The server reported the file as failed.
    Processing,
    /// No terminal status before the ceiling.
    Timeout,
}

/// Observable state of one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UploadState {
    Idle,
    Uploading,
    Processing,
    Ready,
    Failed {
        reason: FailureReason,
        message: String,
    },
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed { .. })
    }

    /// Whether the retry control should be offered.
    pub fn can_retry(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Poll cadence and ceiling for one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSettings {
    pub fn for_kind(config: &Config, kind: MediaKind) -> Self {
        Self {
            interval: config.poll_interval(),
            timeout: config.processing_timeout(kind),
        }
    }
}

// ---------------------------------------------------------------------------
// In-flight registry
// ---------------------------------------------------------------------------

static PROCESS_IN_FLIGHT: LazyLock<InFlight> = LazyLock::new(InFlight::new);

/// Files with a running upload/poll loop. Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    active: Arc<Mutex<HashSet<(MediaKind, String)>>>,
}

impl InFlight {
    /// A registry of its own, independent of every other tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry trackers use unless given another one.
    pub fn shared() -> Self {
        PROCESS_IN_FLIGHT.clone()
    }

    /// Reserve `filename`; the reservation ends when the guard drops.
    pub fn claim(&self, kind: MediaKind, filename: &str) -> Result<InFlightGuard, ClientError> {
        let key = (kind, filename.to_string());
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(key.clone()) {
            return Err(ClientError::AlreadyInProgress {
                filename: filename.to_string(),
            });
        }
        Ok(InFlightGuard {
            registry: self.clone(),
            key,
        })
    }
}

/// Releases an [`InFlight`] reservation on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: InFlight,
    key: (MediaKind, String),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.key);
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Drives one file through upload and processing.
pub struct UploadTracker<'a, A: MediaApi> {
    api: &'a A,
    file: UploadFile,
    session_id: String,
    settings: PollSettings,
    registry: InFlight,
    state_tx: watch::Sender<UploadState>,
    history: Vec<UploadState>,
}

impl<'a, A: MediaApi> UploadTracker<'a, A> {
    pub fn new(
        api: &'a A,
        file: UploadFile,
        session_id: impl Into<String>,
        settings: PollSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(UploadState::Idle);
        Self {
            api,
            file,
            session_id: session_id.into(),
            settings,
            registry: InFlight::shared(),
            state_tx,
            history: vec![UploadState::Idle],
        }
    }

    /// Use `registry` instead of the process-wide one.
    pub fn with_registry(mut self, registry: InFlight) -> Self {
        self.registry = registry;
        self
    }

    pub fn state(&self) -> UploadState {
        self.state_tx.borrow().clone()
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn history(&self) -> &[UploadState] {
        &self.history
    }

    pub fn file(&self) -> &UploadFile {
        &self.file
    }

    /// Watch state changes (e.g. to render progress).
    pub fn subscribe(&self) -> watch::Receiver<UploadState> {
        self.state_tx.subscribe()
    }

    /// Upload and poll to a terminal state.
    ///
    /// `Err` means the action was refused (signed out, already running) and
    /// the state did not change. Upload, processing and timeout failures
    /// are reported through the returned [`UploadState::Failed`]. Calling
    /// this outside `Idle` returns the current state untouched.
    pub async fn run(&mut self, auth: &dyn AuthGate) -> Result<UploadState, ClientError> {
        if self.state() != UploadState::Idle {
            return Ok(self.state());
        }
        auth.require(&format!("upload {}", self.file.filename))?;
        let _guard = self.registry.claim(self.file.kind, &self.file.filename)?;

        self.transition(UploadState::Uploading);
        if let Err(e) = self.api.upload(&self.file, &self.session_id).await {
            warn!(filename = %self.file.filename, error = %e, "upload failed");
            self.transition(UploadState::Failed {
                reason: FailureReason::Upload,
                message: e.to_string(),
            });
            return Ok(self.state());
        }

        self.transition(UploadState::Processing);
        let outcome = self.poll_until_done().await;
        self.transition(outcome);
        Ok(self.state())
    }

    /// The retry control: only available from `Failed`.
    pub async fn retry(&mut self, auth: &dyn AuthGate) -> Result<UploadState, ClientError> {
        if !self.state().can_retry() {
            return Err(ClientError::NothingToRetry {
                filename: self.file.filename.clone(),
            });
        }
        auth.require(&format!("upload {}", self.file.filename))?;
        info!(filename = %self.file.filename, "retrying upload");
        self.transition(UploadState::Idle);
        self.run(auth).await
    }

    fn transition(&mut self, state: UploadState) {
        debug!(
            filename = %self.file.filename,
            from = self.state().label(),
            to = state.label(),
            "upload state change"
        );
        if let UploadState::Failed { reason, message } = &state {
            info!(filename = %self.file.filename, ?reason, %message, "upload failed");
        }
        self.history.push(state.clone());
        self.state_tx.send_replace(state);
    }

    async fn poll_until_done(&self) -> UploadState {
        let deadline = Instant::now() + self.settings.timeout;
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut polls: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(deadline) => return self.timed_out(polls),
            }
            polls += 1;

            let request = self.api.fetch_status(self.file.kind, &self.session_id);
            let result = match tokio::time::timeout_at(deadline, request).await {
                Ok(result) => result,
                Err(_) => return self.timed_out(polls),
            };

            match result {
                Ok(records) => {
                    if let Some(state) = self.evaluate(&records) {
                        info!(filename = %self.file.filename, polls, "processing finished");
                        return state;
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(filename = %self.file.filename, error = %e, "status poll failed; will retry");
                }
                Err(e) => {
                    return UploadState::Failed {
                        reason: FailureReason::Network,
                        message: e.to_string(),
                    };
                }
            }
        }
    }

    /// Terminal state for this file, if the records contain one.
    fn evaluate(&self, records: &[FileStatus]) -> Option<UploadState> {
        let Some(record) = records.iter().find(|r| r.filename == self.file.filename) else {
            trace!(filename = %self.file.filename, "file not listed yet");
            return None;
        };
        match record.status {
            ProcessingStatus::Ready => Some(UploadState::Ready),
            ProcessingStatus::Failed => {
                let message = record
                    .error
                    .as_deref()
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        format!("The server could not process {}.", self.file.filename)
                    });
                Some(UploadState::Failed {
                    reason: FailureReason::Processing,
                    message,
                })
            }
            ProcessingStatus::Processing | ProcessingStatus::Unknown => {
                trace!(filename = %self.file.filename, status = ?record.status, "still processing");
                None
            }
        }
    }

    fn timed_out(&self, polls: u32) -> UploadState {
        warn!(filename = %self.file.filename, polls, "processing timed out");
        UploadState::Failed {
            reason: FailureReason::Timeout,
            message: format!(
                "Processing {} timed out after {}. Try again later.",
                self.file.filename,
                describe_duration(self.settings.timeout)
            ),
        }
    }
}

/// `"5 minutes"`, `"1 minute"`, `"90 seconds"`.
fn describe_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        60 => "1 minute".to_string(),
        s if s >= 60 && s % 60 == 0 => format!("{} minutes", s / 60),
        1 => "1 second".to_string(),
        s => format!("{s} seconds"),
    }
}
