//! Ledger REST client
//!
//! Two read-only calls are needed from the ledger: the account's recent
//! transaction history, and the status of a single transaction by hash. Both are
//! idempotent, so every failure here is safe to retry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::types::CandidateTransaction;

/// Terminal ledger result for a transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub hash: String,
    pub success: bool,
    pub vm_status: String,
}

/// Point-in-time status of a transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    /// The ledger has not seen the hash (yet)
    NotFound,
    /// Accepted into the mempool, not yet committed
    Pending,
    Committed(TransactionReceipt),
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Most recent committed transactions sent by `address`, at most `limit`
    async fn list_recent_transactions(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<CandidateTransaction>>;

    /// Block until `hash` is committed or `timeout` elapses, checking every
    /// `poll_interval`. `Ok(None)` means timeout.
    async fn wait_for_transaction(
        &self,
        hash: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<TransactionReceipt>>;
}

#[derive(Debug, Deserialize)]
struct RawTransaction {
    #[serde(rename = "type")]
    kind: String,
    hash: String,
    /// Microseconds since the Unix epoch, encoded as a string
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    vm_status: Option<String>,
}

impl RawTransaction {
    fn committed_at(&self) -> Option<DateTime<Utc>> {
        let micros = self.timestamp.as_deref()?.parse::<i64>().ok()?;
        Utc.timestamp_micros(micros).single()
    }

    fn into_status(self) -> TransactionStatus {
        if self.kind == "pending_transaction" {
            return TransactionStatus::Pending;
        }
        TransactionStatus::Committed(TransactionReceipt {
            hash: self.hash,
            success: self.success.unwrap_or(false),
            vm_status: self.vm_status.unwrap_or_default(),
        })
    }
}

/// Ledger client for an Aptos-style REST API
pub struct RestLedgerClient {
    client: Client,
    base_url: Url,
}

impl RestLedgerClient {
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(Error::HttpError)?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::UnexpectedResponse {
                endpoint: self.base_url.to_string(),
                detail: "base URL cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Single status lookup for `hash`
    pub async fn transaction_status(&self, hash: &str) -> Result<TransactionStatus> {
        let url = self.endpoint(&["transactions", "by_hash", hash])?;
        let response = self.client.get(url.clone()).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(TransactionStatus::NotFound);
        }
        if !response.status().is_success() {
            return Err(Error::UnexpectedResponse {
                endpoint: url.to_string(),
                detail: format!("status {}", response.status()),
            });
        }

        let raw: RawTransaction = response.json().await?;
        Ok(raw.into_status())
    }
}

#[async_trait]
impl LedgerClient for RestLedgerClient {
    #[instrument(skip(self))]
    async fn list_recent_transactions(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<CandidateTransaction>> {
        let mut url = self.endpoint(&["accounts", address, "transactions"])?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());

        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(Error::UnexpectedResponse {
                endpoint: url.to_string(),
                detail: format!("status {}", response.status()),
            });
        }

        let raw: Vec<RawTransaction> = response.json().await?;
        let candidates: Vec<CandidateTransaction> = raw
            .into_iter()
            .filter_map(|tx| {
                let observed_at = tx.committed_at()?;
                Some(CandidateTransaction {
                    hash: tx.hash,
                    observed_at,
                    success: tx.success.unwrap_or(false),
                    vm_status: tx.vm_status.unwrap_or_default(),
                })
            })
            .collect();

        debug!("Fetched {} timestamped transactions", candidates.len());
        Ok(candidates)
    }

    #[instrument(skip(self))]
    async fn wait_for_transaction(
        &self,
        hash: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<TransactionReceipt>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.transaction_status(hash).await {
                Ok(TransactionStatus::Committed(receipt)) => return Ok(Some(receipt)),
                Ok(TransactionStatus::Pending) => debug!("Transaction {} still pending", hash),
                Ok(TransactionStatus::NotFound) => debug!("Transaction {} not found yet", hash),
                Err(e) => warn!("Status lookup for {} failed, will retry: {}", hash, e),
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> RestLedgerClient {
        let base = Url::parse(&format!("{}/v1", server.uri())).unwrap();
        RestLedgerClient::new(base, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_list_recent_transactions_parses_history() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/accounts/0xabc/transactions"))
            .and(query_param("limit", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "type": "user_transaction",
                    "hash": "0x01",
                    "timestamp": "1700000000000000",
                    "success": true,
                    "vm_status": "Executed successfully"
                },
                {
                    "type": "user_transaction",
                    "hash": "0x02",
                    "timestamp": "1700000003500000",
                    "success": false,
                    "vm_status": "Move abort"
                },
                {
                    "type": "pending_transaction",
                    "hash": "0x03"
                }
            ])))
            .mount(&server)
            .await;

        let txs = client_for(&server)
            .await
            .list_recent_transactions("0xabc", 5)
            .await
            .unwrap();

        assert_eq!(txs.len(), 2, "untimestamped entries are skipped");
        assert_eq!(txs[0].hash, "0x01");
        assert_eq!(txs[0].observed_at.timestamp(), 1_700_000_000);
        assert!(txs[0].success);
        assert_eq!(txs[1].observed_at.timestamp_micros(), 1_700_000_003_500_000);
        assert_eq!(txs[1].vm_status, "Move abort");
    }

    #[tokio::test]
    async fn test_list_recent_transactions_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .list_recent_transactions("0xabc", 5)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedResponse { .. }));
    }

    #[tokio::test]
    async fn test_transaction_status_variants() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/transactions/by_hash/0xpending"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "type": "pending_transaction", "hash": "0xpending" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/transactions/by_hash/0xdone"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "type": "user_transaction",
                "hash": "0xdone",
                "timestamp": "1700000000000000",
                "success": true,
                "vm_status": "Executed successfully"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/transactions/by_hash/0xmissing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert_eq!(
            client.transaction_status("0xpending").await.unwrap(),
            TransactionStatus::Pending
        );
        assert_eq!(
            client.transaction_status("0xmissing").await.unwrap(),
            TransactionStatus::NotFound
        );
        match client.transaction_status("0xdone").await.unwrap() {
            TransactionStatus::Committed(receipt) => {
                assert!(receipt.success);
                assert_eq!(receipt.vm_status, "Executed successfully");
            }
            other => panic!("expected committed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_for_transaction_polls_until_committed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/transactions/by_hash/0xabc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "type": "pending_transaction", "hash": "0xabc" })),
            )
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/transactions/by_hash/0xabc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "type": "user_transaction",
                "hash": "0xabc",
                "timestamp": "1700000000000000",
                "success": false,
                "vm_status": "Out of gas"
            })))
            .mount(&server)
            .await;

        let receipt = client_for(&server)
            .await
            .wait_for_transaction("0xabc", Duration::from_secs(5), Duration::from_millis(20))
            .await
            .unwrap()
            .expect("committed before timeout");
        assert!(!receipt.success);
        assert_eq!(receipt.vm_status, "Out of gas");
    }

    #[tokio::test]
    async fn test_wait_for_transaction_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = client_for(&server)
            .await
            .wait_for_transaction("0xnever", Duration::from_millis(100), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
