//! Attribution of a ledger transaction to a storage write
//!
//! The storage network does not return the transaction hash for a write, so the
//! hash is recovered from the account's recent history: the newest transaction
//! younger than the recency window and not already attributed to another upload is
//! taken to be ours. This is a heuristic: activity on the account from outside
//! this process can still be picked up. Uploads from this process are serialised
//! between write and resolution by the orchestrator. It lives behind
//! [`TransactionResolver`] so a write call that returns the hash directly can
//! replace it without touching the orchestrator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ResolverSettings;
use crate::error::{Error, Result};
use crate::ledger::LedgerClient;
use crate::types::{CandidateTransaction, LedgerAccount, TransactionId, UploadRequest};

#[async_trait]
pub trait TransactionResolver: Send + Sync {
    /// Identify the transaction produced by the write of `request` from `account`
    async fn resolve(
        &self,
        account: &LedgerAccount,
        request: &UploadRequest,
        cancel: &CancellationToken,
    ) -> Result<TransactionId>;
}

fn is_within_window(observed_at: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    let window =
        chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500));
    now.signed_duration_since(observed_at) < window
}

/// Newest candidate whose age at `now` is strictly below `window`.
///
/// Candidates stamped in the future (clock skew) count as age zero.
pub fn select_recent<'a>(
    candidates: &'a [CandidateTransaction],
    now: DateTime<Utc>,
    window: Duration,
) -> Option<&'a CandidateTransaction> {
    candidates
        .iter()
        .filter(|tx| is_within_window(tx.observed_at, now, window))
        .max_by_key(|tx| tx.observed_at)
}

/// Deterministic identifier derived from the request. Never a ledger hash.
pub fn placeholder_id(address: &str, request: &UploadRequest) -> String {
    let digest = Sha256::digest(
        format!(
            "{}:{}:{}",
            address,
            request.object_name(),
            request.expiration_micros()
        )
        .as_bytes(),
    );
    format!("placeholder-{}", hex::encode(&digest[..16]))
}

/// Resolver that scans the account's recent ledger history.
///
/// A hash is handed out at most once; claims are kept until they age out of the
/// recency window.
pub struct RecentHistoryResolver {
    ledger: Arc<dyn LedgerClient>,
    settings: ResolverSettings,
    claimed: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl RecentHistoryResolver {
    pub fn new(ledger: Arc<dyn LedgerClient>, settings: ResolverSettings) -> Self {
        Self {
            ledger,
            settings,
            claimed: Mutex::new(HashMap::new()),
        }
    }

    /// Pick the newest unclaimed candidate inside the window and claim it
    fn claim(
        &self,
        candidates: &[CandidateTransaction],
        now: DateTime<Utc>,
    ) -> Option<CandidateTransaction> {
        let window = self.settings.recency_window();
        let mut claimed = match self.claimed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        claimed.retain(|_, observed_at| is_within_window(*observed_at, now, window));

        let unclaimed: Vec<CandidateTransaction> = candidates
            .iter()
            .filter(|tx| !claimed.contains_key(&tx.hash))
            .cloned()
            .collect();
        let selected = select_recent(&unclaimed, now, window)?.clone();
        claimed.insert(selected.hash.clone(), selected.observed_at);
        Some(selected)
    }

    async fn lookup_once(&self, account: &LedgerAccount) -> Option<CandidateTransaction> {
        let candidates = match self
            .ledger
            .list_recent_transactions(account.address(), self.settings.history_limit)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to list recent transactions: {}", e);
                return None;
            }
        };

        let selected = self.claim(&candidates, Utc::now());
        debug!(
            "Inspected {} candidates, selected {:?}",
            candidates.len(),
            selected.as_ref().map(|tx| &tx.hash)
        );
        selected
    }
}

#[async_trait]
impl TransactionResolver for RecentHistoryResolver {
    #[instrument(skip(self, account, request, cancel), fields(object_name = %request.object_name()))]
    async fn resolve(
        &self,
        account: &LedgerAccount,
        request: &UploadRequest,
        cancel: &CancellationToken,
    ) -> Result<TransactionId> {
        let attempts = self.settings.lookup_attempts;

        for attempt in 1..=attempts {
            if let Some(tx) = self.lookup_once(account).await {
                info!(tx_hash = %tx.hash, attempt, "Attributed transaction to write");
                return Ok(TransactionId::Authoritative(tx.hash));
            }

            if attempt < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(self.settings.lookup_interval()) => {}
                }
            }
        }

        if self.settings.placeholder_fallback {
            let id = placeholder_id(account.address(), request);
            warn!(placeholder = %id, "No transaction matched; using non-authoritative placeholder");
            return Ok(TransactionId::Placeholder(id));
        }

        Err(Error::Resolution {
            address: account.address().to_string(),
            window_secs: self.settings.recency_window_secs,
            inspected: self.settings.history_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TransactionReceipt;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SEED: &str = "9f1c3a8e2b7d4f6a0c5e8b1d3f7a9c2e4b6d8f0a1c3e5b7d9f2a4c6e8b0d1f3a";

    fn tx(hash: &str, observed_at: DateTime<Utc>) -> CandidateTransaction {
        CandidateTransaction {
            hash: hash.to_string(),
            observed_at,
            success: true,
            vm_status: "Executed successfully".to_string(),
        }
    }

    struct HistoryLedger {
        ages_secs: Vec<i64>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LedgerClient for HistoryLedger {
        async fn list_recent_transactions(
            &self,
            _address: &str,
            limit: usize,
        ) -> Result<Vec<CandidateTransaction>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now();
            Ok(self
                .ages_secs
                .iter()
                .take(limit)
                .enumerate()
                .map(|(i, age)| tx(&format!("0x{i}"), now - ChronoDuration::seconds(*age)))
                .collect())
        }

        async fn wait_for_transaction(
            &self,
            _hash: &str,
            _timeout: Duration,
            _poll_interval: Duration,
        ) -> Result<Option<TransactionReceipt>> {
            Ok(None)
        }
    }

    fn resolver(
        ages_secs: Vec<i64>,
        settings: ResolverSettings,
    ) -> (RecentHistoryResolver, Arc<HistoryLedger>) {
        let ledger = Arc::new(HistoryLedger {
            ages_secs,
            calls: AtomicUsize::new(0),
        });
        (RecentHistoryResolver::new(ledger.clone(), settings), ledger)
    }

    fn fast_settings() -> ResolverSettings {
        ResolverSettings {
            lookup_attempts: 2,
            lookup_interval_millis: 1,
            ..Default::default()
        }
    }

    fn account() -> LedgerAccount {
        LedgerAccount::from_hex_seed("0xabc", SEED).unwrap()
    }

    fn request() -> UploadRequest {
        UploadRequest::new(b"x".to_vec(), "a.txt", Utc::now() + ChronoDuration::days(1)).unwrap()
    }

    #[test]
    fn test_select_recent_picks_newest_inside_window() {
        let now = Utc::now();
        let candidates = vec![
            tx("old", now - ChronoDuration::seconds(120)),
            tx("mid", now - ChronoDuration::seconds(30)),
            tx("new", now - ChronoDuration::seconds(3)),
        ];
        let selected = select_recent(&candidates, now, Duration::from_secs(60)).unwrap();
        assert_eq!(selected.hash, "new");
    }

    #[test]
    fn test_select_recent_window_is_exclusive() {
        let now = Utc::now();
        let candidates = vec![tx("edge", now - ChronoDuration::seconds(60))];
        assert!(select_recent(&candidates, now, Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_select_recent_accepts_future_stamps() {
        let now = Utc::now();
        let candidates = vec![tx("skewed", now + ChronoDuration::seconds(2))];
        assert_eq!(
            select_recent(&candidates, now, Duration::from_secs(60)).map(|t| t.hash.as_str()),
            Some("skewed")
        );
    }

    #[test]
    fn test_placeholder_is_deterministic_and_tagged() {
        let req = request();
        let a = placeholder_id("0xabc", &req);
        let b = placeholder_id("0xabc", &req);
        assert_eq!(a, b);
        assert!(a.starts_with("placeholder-"));
        assert_ne!(a, placeholder_id("0xdef", &req));
    }

    #[tokio::test]
    async fn test_resolve_returns_authoritative_hash() {
        let (resolver, _) = resolver(vec![200, 3, 90], fast_settings());
        let id = resolver
            .resolve(&account(), &request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(id, TransactionId::Authoritative("0x1".to_string()));
    }

    #[tokio::test]
    async fn test_claimed_hash_is_not_handed_out_twice() {
        let (resolver, _) = resolver(vec![2, 200, 8], fast_settings());
        let cancel = CancellationToken::new();

        let first = resolver.resolve(&account(), &request(), &cancel).await.unwrap();
        let second = resolver.resolve(&account(), &request(), &cancel).await.unwrap();
        let third = resolver.resolve(&account(), &request(), &cancel).await;

        assert_eq!(first, TransactionId::Authoritative("0x0".to_string()));
        assert_eq!(second, TransactionId::Authoritative("0x2".to_string()));
        assert!(matches!(third, Err(Error::Resolution { .. })));
    }

    #[tokio::test]
    async fn test_zero_lookup_attempts_queries_nothing() {
        let settings = ResolverSettings {
            lookup_attempts: 0,
            ..fast_settings()
        };
        let (resolver, ledger) = resolver(vec![1], settings);
        let err = resolver
            .resolve(&account(), &request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Resolution { .. }));
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolve_fails_when_nothing_is_recent() {
        let (resolver, ledger) = resolver(vec![61, 120, 300, 900, 3600], fast_settings());
        let err = resolver
            .resolve(&account(), &request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Resolution {
                window_secs: 60,
                inspected: 5,
                ..
            }
        ));
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_placeholder_when_enabled() {
        let settings = ResolverSettings {
            placeholder_fallback: true,
            ..fast_settings()
        };
        let (resolver, _) = resolver(vec![], settings);
        let req = request();
        let id = resolver
            .resolve(&account(), &req, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!id.is_authoritative());
        assert_eq!(id.as_str(), placeholder_id("0xabc", &req));
    }

    #[tokio::test]
    async fn test_resolve_observes_cancellation_between_lookups() {
        let settings = ResolverSettings {
            lookup_attempts: 5,
            lookup_interval_millis: 60_000,
            ..Default::default()
        };
        let (resolver, ledger) = resolver(vec![], settings);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = resolver
            .resolve(&account(), &request(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #[test]
        fn prop_selection_is_newest_within_window(
            ages in proptest::collection::vec(0i64..240_000, 0..8),
            window_ms in 1u64..120_000,
        ) {
            let now = Utc::now();
            let candidates: Vec<CandidateTransaction> = ages
                .iter()
                .enumerate()
                .map(|(i, age)| tx(&format!("0x{i}"), now - ChronoDuration::milliseconds(*age)))
                .collect();

            let selected = select_recent(&candidates, now, Duration::from_millis(window_ms));
            let eligible: Vec<&CandidateTransaction> = candidates
                .iter()
                .filter(|t| (now - t.observed_at).num_milliseconds() < window_ms as i64)
                .collect();

            match selected {
                None => prop_assert!(eligible.is_empty()),
                Some(chosen) => {
                    prop_assert!((now - chosen.observed_at).num_milliseconds() < window_ms as i64);
                    for other in eligible {
                        prop_assert!(chosen.observed_at >= other.observed_at);
                    }
                }
            }
        }
    }
}
