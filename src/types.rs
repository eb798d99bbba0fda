//! Core data types shared by every pipeline stage

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Longest blob name accepted by the storage network
pub const MAX_OBJECT_NAME_LEN: usize = 1024;

/// A single blob write. Immutable once built.
#[derive(Clone, Debug)]
pub struct UploadRequest {
    object_bytes: Bytes,
    object_name: String,
    expiration: DateTime<Utc>,
}

impl UploadRequest {
    pub fn new(
        object_bytes: impl Into<Bytes>,
        object_name: impl Into<String>,
        expiration: DateTime<Utc>,
    ) -> Result<Self> {
        let object_name = object_name.into();
        if object_name.trim().is_empty() {
            return Err(Error::InvalidRequest("blob name is empty".to_string()));
        }
        if object_name.starts_with('/') {
            return Err(Error::InvalidRequest(format!(
                "blob name must not start with '/': {object_name}"
            )));
        }
        if object_name
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(Error::InvalidRequest(format!(
                "blob name has an empty, '.' or '..' segment: {object_name}"
            )));
        }
        if object_name.len() > MAX_OBJECT_NAME_LEN {
            return Err(Error::InvalidRequest(format!(
                "blob name is {} bytes, limit is {MAX_OBJECT_NAME_LEN}",
                object_name.len()
            )));
        }
        if expiration <= Utc::now() {
            return Err(Error::InvalidRequest(format!(
                "expiration {} is not in the future",
                expiration.to_rfc3339()
            )));
        }

        Ok(Self {
            object_bytes: object_bytes.into(),
            object_name,
            expiration,
        })
    }

    pub fn object_bytes(&self) -> &Bytes {
        &self.object_bytes
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn expiration(&self) -> DateTime<Utc> {
        self.expiration
    }

    /// Expiration in microseconds since the Unix epoch, as the storage network expects it
    pub fn expiration_micros(&self) -> i64 {
        self.expiration.timestamp_micros()
    }

    /// Hex SHA-256 of the blob contents
    pub fn content_sha256(&self) -> String {
        hex::encode(Sha256::digest(&self.object_bytes))
    }
}

/// The account that signs and pays for writes. Shared read-only across uploads.
#[derive(Clone)]
pub struct LedgerAccount {
    address: String,
    signing_key: SigningKey,
}

impl LedgerAccount {
    pub fn new(address: impl Into<String>, signing_key: SigningKey) -> Self {
        Self {
            address: address.into().to_lowercase(),
            signing_key,
        }
    }

    /// Build an account from a hex-encoded 32-byte ed25519 seed (optionally `0x` prefixed)
    pub fn from_hex_seed(address: impl Into<String>, seed_hex: &str) -> Result<Self> {
        let raw = hex::decode(seed_hex.trim_start_matches("0x"))
            .map_err(|e| Error::SigningError(format!("private key is not hex: {e}")))?;
        let seed: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
            Error::SigningError(format!("private key must be 32 bytes, got {}", raw.len()))
        })?;
        Ok(Self::new(address, SigningKey::from_bytes(&seed)))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key_hex(&self) -> String {
        format!("0x{}", hex::encode(self.signing_key.verifying_key().as_bytes()))
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for LedgerAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerAccount")
            .field("address", &self.address)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

/// A transaction observed in the account's recent history
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateTransaction {
    pub hash: String,
    pub observed_at: DateTime<Utc>,
    pub success: bool,
    pub vm_status: String,
}

/// How a transaction identifier was obtained
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionId {
    /// Matched against the ledger's history for this upload attempt
    Authoritative(String),
    /// Derived locally from the request; never a ledger hash
    Placeholder(String),
}

impl TransactionId {
    pub fn as_str(&self) -> &str {
        match self {
            TransactionId::Authoritative(id) | TransactionId::Placeholder(id) => id,
        }
    }

    pub fn is_authoritative(&self) -> bool {
        matches!(self, TransactionId::Authoritative(_))
    }
}

/// Attempt count and spacing for one polling stage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingBudget {
    pub max_attempts: u32,
    pub interval_millis: u64,
}

impl PollingBudget {
    pub const fn new(max_attempts: u32, interval_millis: u64) -> Self {
        Self {
            max_attempts,
            interval_millis,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_millis)
    }

    /// Upper bound on time spent in the stage
    pub fn total(&self) -> Duration {
        self.interval() * self.max_attempts.max(1)
    }
}

/// Networks with known default endpoints
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    #[default]
    Testnet,
    Devnet,
    Local,
}

impl Network {
    pub fn default_ledger_rpc_url(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://api.mainnet.aptoslabs.com/v1",
            Network::Testnet => "https://api.testnet.aptoslabs.com/v1",
            Network::Devnet => "https://api.devnet.aptoslabs.com/v1",
            Network::Local => "http://127.0.0.1:8080/v1",
        }
    }

    /// Storage and explorer endpoints are only preset for a local stack
    pub fn default_storage_rpc_url(&self) -> Option<&'static str> {
        match self {
            Network::Local => Some("http://127.0.0.1:9090/v1"),
            _ => None,
        }
    }

    pub fn default_explorer_url(&self) -> Option<&'static str> {
        match self {
            Network::Local => Some("http://127.0.0.1:3000"),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Devnet => "devnet",
            Network::Local => "local",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    const SEED: &str = "9f1c3a8e2b7d4f6a0c5e8b1d3f7a9c2e4b6d8f0a1c3e5b7d9f2a4c6e8b0d1f3a";

    fn tomorrow() -> DateTime<Utc> {
        Utc::now() + ChronoDuration::days(1)
    }

    #[test]
    fn test_request_rejects_bad_names() {
        assert!(UploadRequest::new(vec![1u8], "", tomorrow()).is_err());
        assert!(UploadRequest::new(vec![1u8], "   ", tomorrow()).is_err());
        assert!(UploadRequest::new(vec![1u8], "/abs/path.txt", tomorrow()).is_err());
        for name in ["./a", "a/./b", "docs/../../0xother/x.txt", "..", "a//b", "dir/"] {
            let err = UploadRequest::new(vec![1u8], name, tomorrow()).unwrap_err();
            assert!(matches!(err, Error::InvalidRequest(_)), "{name} accepted");
        }
        assert!(UploadRequest::new(vec![1u8], "docs/..hidden/v1.2.txt", tomorrow()).is_ok());
        let long = "x".repeat(MAX_OBJECT_NAME_LEN + 1);
        assert!(UploadRequest::new(vec![1u8], long, tomorrow()).is_err());
    }

    #[test]
    fn test_request_rejects_past_expiration() {
        let past = Utc::now() - ChronoDuration::seconds(1);
        let err = UploadRequest::new(vec![1u8], "a.txt", past).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_expiration_micros_and_digest() {
        let expiration = tomorrow();
        let req = UploadRequest::new(b"hello".to_vec(), "docs/hello.txt", expiration).unwrap();
        assert_eq!(req.expiration_micros(), expiration.timestamp_micros());
        assert_eq!(
            req.content_sha256(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_account_from_seed() {
        let account = LedgerAccount::from_hex_seed("0xABCDEF", SEED).unwrap();
        assert_eq!(account.address(), "0xabcdef");
        assert!(account.public_key_hex().starts_with("0x"));
        assert_eq!(account.public_key_hex().len(), 2 + 64);

        let with_prefix = LedgerAccount::from_hex_seed("0xabcdef", &format!("0x{SEED}")).unwrap();
        assert_eq!(account.public_key_hex(), with_prefix.public_key_hex());
    }

    #[test]
    fn test_account_rejects_short_seed() {
        let err = LedgerAccount::from_hex_seed("0x1", "abcd").unwrap_err();
        assert!(matches!(err, Error::SigningError(_)));
    }

    #[test]
    fn test_account_debug_hides_key() {
        let account = LedgerAccount::from_hex_seed("0x1", SEED).unwrap();
        let printed = format!("{account:?}");
        assert!(printed.contains("REDACTED"));
        assert!(!printed.contains(SEED));
    }

    #[test]
    fn test_polling_budget_total() {
        let budget = PollingBudget::new(10, 15_000);
        assert_eq!(budget.interval(), Duration::from_secs(15));
        assert_eq!(budget.total(), Duration::from_secs(150));
        assert_eq!(PollingBudget::new(0, 500).total(), Duration::from_millis(500));
    }

    #[test]
    fn test_transaction_id_tagging() {
        let real = TransactionId::Authoritative("0xabc".to_string());
        let fake = TransactionId::Placeholder("placeholder-123".to_string());
        assert!(real.is_authoritative());
        assert!(!fake.is_authoritative());
        assert_eq!(fake.as_str(), "placeholder-123");
    }
}
