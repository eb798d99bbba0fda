//! Verification state and progress reporting
//!
//! A [`ProgressTracker`] owns the single [`VerificationState`] of one run. It is
//! the only writer, and it enforces the two run invariants:
//! - `progress_percent` never decreases
//! - `phase` only moves forward, except into a terminal failure / cancellation
//!   and the one soft settle from `indexing` back to `transaction_confirmed`
//!
//! Every accepted change is pushed to a caller-supplied [`ProgressSink`].

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind};

pub const PROGRESS_SUBMITTED: u8 = 25;
pub const PROGRESS_CONFIRMED: u8 = 50;
pub const PROGRESS_INDEXING_START: u8 = 60;
pub const PROGRESS_INDEXING_END: u8 = 80;
pub const PROGRESS_AVAILABLE: u8 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uploading,
    TransactionSubmitted,
    TransactionConfirmed,
    Indexing,
    Available,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Uploading => "uploading",
            Phase::TransactionSubmitted => "transaction_submitted",
            Phase::TransactionConfirmed => "transaction_confirmed",
            Phase::Indexing => "indexing",
            Phase::Available => "available",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }

    /// Failed and cancelled are absorbing; nothing leaves them
    pub fn is_absorbing(&self) -> bool {
        matches!(self, Phase::Failed | Phase::Cancelled)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The record threaded through one run. Also the shape of every progress snapshot
/// and of the final result handed to the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationState {
    pub status: Phase,
    pub message: String,
    pub progress_percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    /// Non-authoritative identifier; never a ledger hash
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,
}

/// Final result of a run
pub type UploadOutcome = VerificationState;

impl VerificationState {
    fn start(object_name: &str) -> Self {
        Self {
            status: Phase::Uploading,
            message: format!("Uploading {object_name}"),
            progress_percent: 0,
            transaction_hash: None,
            placeholder_id: None,
            error_kind: None,
            error_detail: None,
            explorer_url: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == Phase::Available
    }
}

/// Receives progress snapshots. Called in phase order from the run's own task.
pub trait ProgressSink: Send + Sync {
    fn report(&self, snapshot: &VerificationState);
}

/// Sink that drops every snapshot
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _snapshot: &VerificationState) {}
}

/// Sink forwarding snapshots into a channel
pub struct ChannelProgress(pub mpsc::UnboundedSender<VerificationState>);

impl ProgressSink for ChannelProgress {
    fn report(&self, snapshot: &VerificationState) {
        // A dropped receiver means the caller stopped listening; the run continues.
        let _ = self.0.send(snapshot.clone());
    }
}

/// Sink wrapping a closure
pub struct CallbackProgress<F>(pub F);

impl<F> ProgressSink for CallbackProgress<F>
where
    F: Fn(&VerificationState) + Send + Sync,
{
    fn report(&self, snapshot: &VerificationState) {
        (self.0)(snapshot)
    }
}

/// Sole owner and writer of one run's [`VerificationState`]
pub struct ProgressTracker {
    state: VerificationState,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressTracker {
    /// Start a run and emit the initial snapshot
    pub fn start(object_name: &str, sink: Arc<dyn ProgressSink>) -> Self {
        let tracker = Self {
            state: VerificationState::start(object_name),
            sink,
        };
        tracker.emit();
        tracker
    }

    pub fn state(&self) -> &VerificationState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.status
    }

    fn emit(&self) {
        debug!(
            phase = %self.state.status,
            progress = self.state.progress_percent,
            "{}",
            self.state.message
        );
        self.sink.report(&self.state);
    }

    /// Move forward to `phase`. Backward moves and moves out of an absorbing phase
    /// are refused. Progress is clamped so it never decreases.
    pub fn advance(&mut self, phase: Phase, percent: u8, message: impl Into<String>) -> bool {
        if self.state.status.is_absorbing() || phase < self.state.status {
            warn!("Refusing phase change {} -> {}", self.state.status, phase);
            return false;
        }
        self.state.status = phase;
        self.state.progress_percent = self.state.progress_percent.max(percent.min(100));
        self.state.message = message.into();
        self.emit();
        true
    }

    /// Raise progress within the current phase
    pub fn bump(&mut self, percent: u8, message: impl Into<String>) {
        if self.state.status.is_absorbing() {
            return;
        }
        let percent = percent.min(100);
        if percent <= self.state.progress_percent {
            return;
        }
        self.state.progress_percent = percent;
        self.state.message = message.into();
        self.emit();
    }

    /// Record a transaction hash that was positively matched to this run
    pub fn set_transaction_hash(&mut self, hash: String, explorer_url: Option<String>) {
        self.state.transaction_hash = Some(hash);
        self.state.explorer_url = explorer_url;
    }

    pub fn set_placeholder_id(&mut self, id: String) {
        self.state.placeholder_id = Some(id);
    }

    /// Record a soft condition without changing phase
    pub fn note(&mut self, err: &Error) {
        self.state.error_kind = Some(err.kind());
        self.state.error_detail = Some(err.to_string());
        self.state.message = err.user_message();
        self.emit();
    }

    /// Terminal failure, reachable from any non-absorbing phase
    pub fn fail(mut self, err: &Error) -> UploadOutcome {
        if !self.state.status.is_absorbing() {
            let target = if matches!(err, Error::Cancelled) {
                Phase::Cancelled
            } else {
                Phase::Failed
            };
            self.state.status = target;
            self.state.error_kind = Some(err.kind());
            self.state.error_detail = Some(err.to_string());
            self.state.message = err.user_message();
            self.emit();
        }
        self.state
    }

    /// Soft terminal after index exhaustion: settle on `transaction_confirmed`,
    /// keeping the progress reached
    pub fn settle_confirmed(mut self, err: &Error) -> UploadOutcome {
        if self.state.status == Phase::Indexing {
            self.state.status = Phase::TransactionConfirmed;
            self.note(err);
        }
        self.state
    }

    /// End the run in its current phase
    pub fn finish(self) -> UploadOutcome {
        self.state
    }
}
