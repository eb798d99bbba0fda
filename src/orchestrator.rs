//! Upload orchestration
//!
//! Sequences write, resolution, confirmation and index verification as one state
//! machine per upload. Each run owns its own [`ProgressTracker`]; nothing is shared
//! between concurrent runs except the read-only account and stage clients.
//!
//! Write and resolution hold a per-account lock, so a run only ever sees ledger
//! history up to its own write. Confirmation and indexing run concurrently.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use url::Url;

use crate::config::ValidatedConfig;
use crate::confirmation::ConfirmationWaiter;
use crate::error::{Error, Result};
use crate::index::{transaction_url, ExplorerProbe, IndexOutcome, IndexVerifier};
use crate::ledger::{LedgerClient, RestLedgerClient};
use crate::resolver::{RecentHistoryResolver, TransactionResolver};
use crate::state::{
    ChannelProgress, Phase, ProgressSink, ProgressTracker, UploadOutcome, VerificationState,
    PROGRESS_AVAILABLE, PROGRESS_CONFIRMED, PROGRESS_INDEXING_END, PROGRESS_INDEXING_START,
    PROGRESS_SUBMITTED,
};
use crate::types::{LedgerAccount, Network, TransactionId, UploadRequest};
use crate::writer::{BlobWriter, HttpBlobWriter};

/// Progress for index attempt `attempt` of `max`, spread over the indexing window
pub fn indexing_progress(attempt: u32, max: u32) -> u8 {
    let max = max.max(1);
    let span = u32::from(PROGRESS_INDEXING_END - PROGRESS_INDEXING_START);
    let step = span * attempt.min(max) / max;
    PROGRESS_INDEXING_START + step as u8
}

fn record_stage(stage: &'static str, started: Instant) {
    #[cfg(feature = "metrics")]
    crate::metrics::observe_stage_duration(stage, started.elapsed().as_secs_f64());
    #[cfg(not(feature = "metrics"))]
    let _ = (stage, started);
}

fn record_outcome(outcome: &UploadOutcome) {
    #[cfg(feature = "metrics")]
    crate::metrics::inc_outcome(outcome.status.as_str());
    #[cfg(not(feature = "metrics"))]
    let _ = outcome;
}

fn record_index_attempts(outcome: &IndexOutcome) {
    #[cfg(feature = "metrics")]
    {
        let attempts = match outcome {
            IndexOutcome::Visible { attempts }
            | IndexOutcome::NotYetIndexed { attempts }
            | IndexOutcome::Cancelled { attempts } => *attempts,
        };
        crate::metrics::observe_index_attempts(attempts);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = outcome;
}

/// A run started with [`UploadOrchestrator::spawn`]
pub struct UploadHandle {
    /// Progress snapshots in phase order. Closes when the run ends.
    pub progress: mpsc::UnboundedReceiver<VerificationState>,
    cancel: CancellationToken,
    task: JoinHandle<UploadOutcome>,
}

impl UploadHandle {
    /// Abandon the run. Background polling stops at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the final outcome
    pub async fn join(self) -> Result<UploadOutcome> {
        self.task
            .await
            .map_err(|e| Error::TaskFailed(e.to_string()))
    }
}

pub struct UploadOrchestrator {
    account: LedgerAccount,
    network: Network,
    explorer_url: Option<Url>,
    writer: Arc<dyn BlobWriter>,
    resolver: Arc<dyn TransactionResolver>,
    confirmation: ConfirmationWaiter,
    index: IndexVerifier,
    submissions: Mutex<()>,
}

impl UploadOrchestrator {
    pub fn new(
        account: LedgerAccount,
        writer: Arc<dyn BlobWriter>,
        resolver: Arc<dyn TransactionResolver>,
        confirmation: ConfirmationWaiter,
        index: IndexVerifier,
    ) -> Self {
        Self {
            account,
            network: Network::default(),
            explorer_url: None,
            writer,
            resolver,
            confirmation,
            index,
            submissions: Mutex::new(()),
        }
    }

    /// Attach explorer links for resolved transactions
    pub fn with_explorer(mut self, explorer_url: Url, network: Network) -> Self {
        self.explorer_url = Some(explorer_url);
        self.network = network;
        self
    }

    /// Build the live pipeline from a validated configuration
    pub fn from_config(config: &ValidatedConfig) -> Result<Self> {
        let ledger: Arc<dyn LedgerClient> = Arc::new(RestLedgerClient::new(
            config.ledger_rpc_url.clone(),
            config.request_timeout,
        )?);
        let writer = Arc::new(HttpBlobWriter::new(
            config.storage_rpc_url.clone(),
            config.api_key.clone(),
            config.request_timeout,
        )?);
        let resolver = Arc::new(RecentHistoryResolver::new(
            ledger.clone(),
            config.resolver.clone(),
        ));
        let probe = Arc::new(ExplorerProbe::new(
            config.explorer_url.clone(),
            config.network,
            config.request_timeout,
        )?);

        Ok(Self::new(
            config.account.clone(),
            writer,
            resolver,
            ConfirmationWaiter::new(ledger, config.confirmation),
            IndexVerifier::new(probe, config.index),
        )
        .with_explorer(config.explorer_url.clone(), config.network))
    }

    pub fn account(&self) -> &LedgerAccount {
        &self.account
    }

    fn explorer_link(&self, hash: &str) -> Option<String> {
        self.explorer_url
            .as_ref()
            .and_then(|base| transaction_url(base, self.network, hash))
    }

    /// Run one upload to a terminal outcome.
    ///
    /// Never returns an error: every failure is folded into the outcome's
    /// `status`, `errorKind` and `errorDetail`.
    #[instrument(skip_all, fields(object_name = %request.object_name(), address = %self.account.address()))]
    pub async fn run(
        &self,
        request: UploadRequest,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> UploadOutcome {
        let mut tracker = ProgressTracker::start(request.object_name(), progress);

        let submission = tokio::select! {
            _ = cancel.cancelled() => return self.finish(tracker.fail(&Error::Cancelled)),
            guard = self.submissions.lock() => guard,
        };

        let started = Instant::now();
        let written = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = self.writer.write(&request, &self.account) => res,
        };
        record_stage("write", started);
        if let Err(e) = written {
            error!("Write of {} failed: {}", request.object_name(), e);
            return self.finish(tracker.fail(&e));
        }

        tracker.advance(
            Phase::TransactionSubmitted,
            PROGRESS_SUBMITTED,
            "Upload submitted, locating the ledger transaction",
        );

        let started = Instant::now();
        let resolved = self.resolver.resolve(&self.account, &request, &cancel).await;
        record_stage("resolve", started);
        drop(submission);

        let outcome = match resolved {
            Err(e) => {
                warn!("Could not attribute a transaction to {}: {}", request.object_name(), e);
                tracker.fail(&e)
            }
            Ok(TransactionId::Authoritative(hash)) => {
                let link = self.explorer_link(&hash);
                tracker.set_transaction_hash(hash.clone(), link);
                self.confirm_and_index(tracker, &hash, request.object_name(), &cancel)
                    .await
            }
            Ok(TransactionId::Placeholder(id)) => {
                tracker.set_placeholder_id(id.clone());
                self.index_placeholder(tracker, &id, request.object_name(), &cancel)
                    .await
            }
        };
        self.finish(outcome)
    }

    /// Re-run confirmation and index verification for a transaction submitted
    /// earlier, e.g. after a confirmation or index timeout
    #[instrument(skip_all, fields(tx_hash = %hash, object_name = %object_name))]
    pub async fn reverify(
        &self,
        hash: &str,
        object_name: &str,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> UploadOutcome {
        let mut tracker = ProgressTracker::start(object_name, progress);
        tracker.set_transaction_hash(hash.to_string(), self.explorer_link(hash));
        tracker.advance(
            Phase::TransactionSubmitted,
            PROGRESS_SUBMITTED,
            format!("Re-checking transaction {hash}"),
        );
        let outcome = self
            .confirm_and_index(tracker, hash, object_name, &cancel)
            .await;
        self.finish(outcome)
    }

    /// Run an upload on its own task
    pub fn spawn(self: &Arc<Self>, request: UploadRequest) -> UploadHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            this.run(request, Arc::new(ChannelProgress(tx)), token)
                .await
        });
        UploadHandle {
            progress: rx,
            cancel,
            task,
        }
    }

    fn finish(&self, outcome: UploadOutcome) -> UploadOutcome {
        record_outcome(&outcome);
        info!(
            phase = %outcome.status,
            progress = outcome.progress_percent,
            "Upload run finished: {}",
            outcome.message
        );
        outcome
    }

    async fn confirm_and_index(
        &self,
        mut tracker: ProgressTracker,
        hash: &str,
        object_name: &str,
        cancel: &CancellationToken,
    ) -> UploadOutcome {
        let started = Instant::now();
        let confirmed = self.confirmation.wait(hash, cancel).await.into_result(hash);
        record_stage("confirm", started);

        match confirmed {
            Ok(_) => {}
            Err(e @ Error::ConfirmationTimeout { .. }) => {
                tracker.note(&e);
                return tracker.finish();
            }
            Err(e) => return tracker.fail(&e),
        }

        tracker.advance(
            Phase::TransactionConfirmed,
            PROGRESS_CONFIRMED,
            "Transaction confirmed on the ledger",
        );

        match self.verify_index(&mut tracker, object_name, cancel).await {
            IndexOutcome::Visible { .. } => {
                tracker.advance(
                    Phase::Available,
                    PROGRESS_AVAILABLE,
                    format!("{object_name} is available"),
                );
                tracker.finish()
            }
            IndexOutcome::NotYetIndexed { attempts } => {
                tracker.settle_confirmed(&Error::IndexTimeout {
                    object_name: object_name.to_string(),
                    attempts,
                })
            }
            IndexOutcome::Cancelled { .. } => tracker.fail(&Error::Cancelled),
        }
    }

    /// Without an authoritative hash there is nothing to confirm; only a positive
    /// index observation can make the upload available.
    async fn index_placeholder(
        &self,
        mut tracker: ProgressTracker,
        placeholder_id: &str,
        object_name: &str,
        cancel: &CancellationToken,
    ) -> UploadOutcome {
        match self.verify_index(&mut tracker, object_name, cancel).await {
            IndexOutcome::Visible { .. } => {
                tracker.advance(
                    Phase::Available,
                    PROGRESS_AVAILABLE,
                    format!("{object_name} is available"),
                );
                tracker.finish()
            }
            IndexOutcome::NotYetIndexed { attempts } => tracker.fail(&Error::Unattributed {
                placeholder_id: placeholder_id.to_string(),
                attempts,
            }),
            IndexOutcome::Cancelled { .. } => tracker.fail(&Error::Cancelled),
        }
    }

    async fn verify_index(
        &self,
        tracker: &mut ProgressTracker,
        object_name: &str,
        cancel: &CancellationToken,
    ) -> IndexOutcome {
        tracker.advance(
            Phase::Indexing,
            PROGRESS_INDEXING_START,
            "Waiting for the upload to appear in the explorer",
        );

        let started = Instant::now();
        let outcome = self
            .index
            .verify(self.account.address(), object_name, cancel, |attempt, max| {
                tracker.bump(
                    indexing_progress(attempt, max),
                    format!("Checking explorer for {object_name} ({attempt}/{max})"),
                )
            })
            .await;
        record_stage("index", started);
        record_index_attempts(&outcome);
        outcome
    }
}
