//! Ledger confirmation stage
//!
//! Waits for a resolved transaction to reach a terminal ledger state within the
//! confirmation budget. The waiter itself never retries; the ledger client polls
//! at the budget's interval until the budget runs out.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::ledger::LedgerClient;
use crate::types::PollingBudget;

/// Tri-state result of waiting for a transaction, plus cancellation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirmed { vm_status: String },
    /// The ledger executed the transaction and reported a failure
    Failed { vm_status: String },
    /// Neither confirmed nor failed within the budget. Safe to re-poll.
    TimedOut { waited: Duration },
    Cancelled,
}

impl ConfirmationOutcome {
    /// Convert the non-success outcomes into pipeline errors
    pub fn into_result(self, hash: &str) -> Result<String> {
        match self {
            ConfirmationOutcome::Confirmed { vm_status } => Ok(vm_status),
            ConfirmationOutcome::Failed { vm_status } => Err(Error::LedgerExecution {
                hash: hash.to_string(),
                vm_status,
            }),
            ConfirmationOutcome::TimedOut { waited } => Err(Error::ConfirmationTimeout {
                hash: hash.to_string(),
                waited,
            }),
            ConfirmationOutcome::Cancelled => Err(Error::Cancelled),
        }
    }
}

pub struct ConfirmationWaiter {
    ledger: Arc<dyn LedgerClient>,
    budget: PollingBudget,
}

impl ConfirmationWaiter {
    pub fn new(ledger: Arc<dyn LedgerClient>, budget: PollingBudget) -> Self {
        Self { ledger, budget }
    }

    pub fn budget(&self) -> PollingBudget {
        self.budget
    }

    #[instrument(skip(self, cancel), fields(timeout = ?self.budget.total()))]
    pub async fn wait(&self, hash: &str, cancel: &CancellationToken) -> ConfirmationOutcome {
        let timeout = self.budget.total();
        let poll_interval = self.budget.interval();
        let started = tokio::time::Instant::now();

        // The outer timeout bounds a ledger client that ignores its own deadline.
        let waited = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Confirmation wait for {} cancelled", hash);
                return ConfirmationOutcome::Cancelled;
            }
            res = tokio::time::timeout(
                timeout,
                self.ledger.wait_for_transaction(hash, timeout, poll_interval),
            ) => res,
        };

        match waited {
            Ok(Ok(Some(receipt))) if receipt.success => {
                info!(tx_hash = %hash, "Transaction confirmed: {}", receipt.vm_status);
                ConfirmationOutcome::Confirmed {
                    vm_status: receipt.vm_status,
                }
            }
            Ok(Ok(Some(receipt))) => {
                warn!(tx_hash = %hash, "Transaction failed on ledger: {}", receipt.vm_status);
                ConfirmationOutcome::Failed {
                    vm_status: receipt.vm_status,
                }
            }
            Ok(Ok(None)) | Err(_) => {
                warn!(tx_hash = %hash, "Transaction not confirmed within {:?}", timeout);
                ConfirmationOutcome::TimedOut {
                    waited: started.elapsed(),
                }
            }
            Ok(Err(e)) => {
                warn!(tx_hash = %hash, "Ledger wait aborted: {}", e);
                ConfirmationOutcome::TimedOut {
                    waited: started.elapsed(),
                }
            }
        }
    }
}
