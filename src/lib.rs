//! Upload submission and multi-stage verification pipeline
//!
//! A blob is written to the storage network, the ledger transaction the write
//! produced is attributed from the account's recent history, confirmed on the
//! ledger, and finally observed in the external explorer index. Each stage has its
//! own polling budget and failure taxonomy; [`UploadOrchestrator`] threads a
//! single [`VerificationState`] through all of them and reports monotonic progress.

pub mod config;
pub mod confirmation;
pub mod error;
pub mod index;
pub mod ledger;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod orchestrator;
pub mod resolver;
pub mod state;
pub mod telemetry;
pub mod types;
pub mod writer;

pub use config::{validate, PipelineConfig, ValidatedConfig};
pub use error::{Error, ErrorKind, Result};
pub use orchestrator::{UploadHandle, UploadOrchestrator};
pub use state::{Phase, ProgressSink, UploadOutcome, VerificationState};
pub use types::{LedgerAccount, Network, PollingBudget, TransactionId, UploadRequest};
