//! Blob writes against the storage network
//!
//! The storage network acknowledges a write but does not hand back the ledger
//! transaction it produced. Failures arrive as free-form strings and are
//! classified into the pipeline's error taxonomy by [`classify_write_failure`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{Error, FundsShortfall, Result};
use crate::types::{LedgerAccount, UploadRequest};

/// Acknowledgement from the storage network. Carries no ledger identifier.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct WriteAck {
    #[serde(default)]
    pub message: Option<String>,
}

#[async_trait]
pub trait BlobWriter: Send + Sync {
    /// Write the blob under `request.object_name()` for `account`
    async fn write(&self, request: &UploadRequest, account: &LedgerAccount) -> Result<WriteAck>;
}

/// Map a storage network failure string onto the error taxonomy.
///
/// Fee shortfall is checked before the storage shortfall because fee errors also
/// mention "insufficient".
pub fn classify_write_failure(object_name: &str, detail: &str) -> Error {
    let lower = detail.to_ascii_lowercase();

    if lower.contains("already exists")
        || lower.contains("blob_already_exists")
        || lower.contains("eblob_already_exists")
        || lower.contains("duplicate blob")
    {
        return Error::WriteCollision {
            object_name: object_name.to_string(),
        };
    }

    if lower.contains("insufficient_balance_for_transaction_fee")
        || lower.contains("insufficient balance for transaction fee")
        || lower.contains("insufficient gas")
    {
        return Error::InsufficientFunds {
            shortfall: FundsShortfall::TransactionFee,
            detail: detail.to_string(),
        };
    }

    if lower.contains("einsufficient_funds")
        || lower.contains("insufficient funds")
        || lower.contains("insufficient_balance")
        || lower.contains("insufficient balance")
    {
        return Error::InsufficientFunds {
            shortfall: FundsShortfall::Storage,
            detail: detail.to_string(),
        };
    }

    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
    {
        return Error::RateLimited { retry_after: None };
    }

    Error::WriteFailed(detail.to_string())
}

/// Message covered by the write signature
pub fn signing_message(request: &UploadRequest, address: &str) -> Vec<u8> {
    let payload = format!(
        "{}/{}:{}:{}",
        address,
        request.object_name(),
        request.expiration_micros(),
        request.content_sha256()
    );
    Sha256::digest(payload.as_bytes()).to_vec()
}

/// Blob writer backed by the storage network's HTTP RPC
pub struct HttpBlobWriter {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl HttpBlobWriter {
    pub fn new(base_url: Url, api_key: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::HttpError)?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    fn blob_url(&self, address: &str, object_name: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::WriteFailed(format!("invalid storage base URL {}", self.base_url)))?
            .pop_if_empty()
            .push("blobs")
            .push(address)
            .extend(object_name.split('/'));
        Ok(url)
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl BlobWriter for HttpBlobWriter {
    #[instrument(
        skip(self, request, account),
        fields(
            object_name = %request.object_name(),
            size = request.object_bytes().len(),
            signer.public_key = %account.public_key_hex(),
        )
    )]
    async fn write(&self, request: &UploadRequest, account: &LedgerAccount) -> Result<WriteAck> {
        let url = self.blob_url(account.address(), request.object_name())?;
        let signature = account.sign(&signing_message(request, account.address()));

        debug!("PUT {}", url);

        let response = self
            .client
            .put(url.clone())
            .bearer_auth(&self.api_key)
            .header("x-expiration-micros", request.expiration_micros().to_string())
            .header("x-content-sha256", request.content_sha256())
            .header("x-public-key", account.public_key_hex())
            .header("x-signature", hex::encode(signature.to_bytes()))
            .body(request.object_bytes().clone())
            .send()
            .await
            .map_err(|e| Error::WriteFailed(format!("storage request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let ack = if body.trim().is_empty() {
                WriteAck::default()
            } else {
                match serde_json::from_str::<WriteAck>(&body) {
                    Ok(ack) => ack,
                    Err(_) => WriteAck {
                        message: Some(body),
                    },
                }
            };
            info!("Storage network acknowledged write of {}", request.object_name());
            return Ok(ack);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = retry_after(response.headers());
            warn!("Storage network rate limited the write (retry after {:?})", wait);
            return Err(Error::RateLimited { retry_after: wait });
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT {
            return Err(Error::WriteCollision {
                object_name: request.object_name().to_string(),
            });
        }

        warn!("Storage write failed with status {}: {}", status, body);
        let detail = if body.is_empty() {
            format!("status {status}")
        } else {
            body
        };
        Err(classify_write_failure(request.object_name(), &detail))
    }
}
