//! Error types for the upload pipeline
//!
//! Every stage reports through a single [`Error`] enum. The variants follow the
//! pipeline's failure taxonomy: some are user-visible failures, some are soft
//! conditions that a caller may re-poll, and the rest is transport plumbing.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Which fee could not be covered by the account balance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FundsShortfall {
    /// Not enough native balance to pay the ledger transaction fee
    TransactionFee,
    /// Not enough storage token balance to pay for the blob's storage period
    Storage,
}

/// A single problem found while validating configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigProblem {
    pub field: &'static str,
    pub reason: String,
}

impl std::fmt::Display for ConfigProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

fn join_fields(missing: &[&'static str], malformed: &[ConfigProblem]) -> String {
    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!("missing [{}]", missing.join(", ")));
    }
    if !malformed.is_empty() {
        let items: Vec<String> = malformed.iter().map(|p| p.to_string()).collect();
        parts.push(format!("malformed [{}]", items.join("; ")));
    }
    parts.join(", ")
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {}", join_fields(.missing, .malformed))]
    Configuration {
        missing: Vec<&'static str>,
        malformed: Vec<ConfigProblem>,
    },

    #[error("Invalid upload request: {0}")]
    InvalidRequest(String),

    #[error("Blob name already exists: {object_name}")]
    WriteCollision { object_name: String },

    #[error("Insufficient funds ({shortfall:?}): {detail}")]
    InsufficientFunds {
        shortfall: FundsShortfall,
        detail: String,
    },

    #[error("Rate limited by storage network (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Storage write failed: {0}")]
    WriteFailed(String),

    #[error("No transaction within {window_secs}s among the {inspected} most recent for {address}")]
    Resolution {
        address: String,
        window_secs: u64,
        inspected: usize,
    },

    #[error("No ledger transaction attributed and {placeholder_id} not seen after {attempts} index checks")]
    Unattributed {
        placeholder_id: String,
        attempts: u32,
    },

    #[error("Ledger transaction {hash} failed: {vm_status}")]
    LedgerExecution { hash: String, vm_status: String },

    #[error("Transaction {hash} not confirmed within {waited:?}")]
    ConfirmationTimeout { hash: String, waited: Duration },

    #[error("{object_name} not visible in index after {attempts} attempts")]
    IndexTimeout { object_name: String, attempts: u32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Upload task failed: {0}")]
    TaskFailed(String),

    #[error("Signing error: {0}")]
    SigningError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Unexpected response from {endpoint}: {detail}")]
    UnexpectedResponse { endpoint: String, detail: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Serializable discriminant of [`Error`], carried in the final upload outcome
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    InvalidRequest,
    WriteCollision,
    InsufficientFunds,
    RateLimited,
    Network,
    Resolution,
    LedgerExecution,
    ConfirmationTimeout,
    IndexTimeout,
    Cancelled,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration { .. } | Error::SigningError(_) | Error::TomlError(_) => {
                ErrorKind::Configuration
            }
            Error::InvalidRequest(_) | Error::IoError(_) => ErrorKind::InvalidRequest,
            Error::WriteCollision { .. } => ErrorKind::WriteCollision,
            Error::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::WriteFailed(_)
            | Error::HttpError(_)
            | Error::UnexpectedResponse { .. }
            | Error::SerializationError(_) => ErrorKind::Network,
            Error::Resolution { .. } | Error::Unattributed { .. } => ErrorKind::Resolution,
            Error::LedgerExecution { .. } => ErrorKind::LedgerExecution,
            Error::ConfirmationTimeout { .. } => ErrorKind::ConfirmationTimeout,
            Error::IndexTimeout { .. } => ErrorKind::IndexTimeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::TaskFailed(_) => ErrorKind::Internal,
        }
    }

    /// Failures the end user has to act on (fix config, rename, top up funds)
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Configuration
                | ErrorKind::InvalidRequest
                | ErrorKind::WriteCollision
                | ErrorKind::InsufficientFunds
                | ErrorKind::LedgerExecution
        )
    }

    /// Conditions a caller may retry or re-poll later without changing anything
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited
                | ErrorKind::Network
                | ErrorKind::ConfirmationTimeout
                | ErrorKind::IndexTimeout
        )
    }

    /// Message suitable for showing to the person who started the upload
    pub fn user_message(&self) -> String {
        match self {
            Error::Configuration { .. } => {
                "Upload is not configured correctly. Check credentials and network endpoints."
                    .to_string()
            }
            Error::InvalidRequest(reason) => format!("Upload request rejected: {reason}"),
            Error::WriteCollision { object_name } => format!(
                "A file named \"{object_name}\" already exists. Rename the file and try again."
            ),
            Error::InsufficientFunds {
                shortfall: FundsShortfall::TransactionFee,
                ..
            } => "Not enough balance to pay the transaction fee. Fund the account and retry."
                .to_string(),
            Error::InsufficientFunds {
                shortfall: FundsShortfall::Storage,
                ..
            } => "Not enough storage tokens to pay for this upload. Fund the account and retry."
                .to_string(),
            Error::RateLimited {
                retry_after: Some(wait),
            } => format!(
                "The storage network is rate limiting uploads. Try again in {}s.",
                wait.as_secs()
            ),
            Error::RateLimited { retry_after: None } => {
                "The storage network is rate limiting uploads. Try again later.".to_string()
            }
            Error::WriteFailed(_)
            | Error::HttpError(_)
            | Error::UnexpectedResponse { .. }
            | Error::SerializationError(_) => {
                "Upload failed because the storage network could not be reached.".to_string()
            }
            Error::Resolution { .. } | Error::Unattributed { .. } => {
                "The upload was sent but its ledger transaction could not be identified."
                    .to_string()
            }
            Error::LedgerExecution { vm_status, .. } => {
                format!("The ledger rejected the upload transaction: {vm_status}")
            }
            Error::ConfirmationTimeout { .. } => {
                "Upload submitted. Ledger confirmation is still pending.".to_string()
            }
            Error::IndexTimeout { .. } => {
                "Upload confirmed. It may take a few minutes to appear in the explorer."
                    .to_string()
            }
            Error::Cancelled => "Upload verification was cancelled.".to_string(),
            Error::TaskFailed(_) => "Upload stopped unexpectedly.".to_string(),
            Error::SigningError(_) | Error::TomlError(_) | Error::IoError(_) => {
                format!("Upload could not start: {self}")
            }
        }
    }
}
