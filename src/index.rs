//! Index visibility stage
//!
//! After ledger confirmation the blob still has to show up in the external
//! explorer/index, which lags the ledger and cannot be nudged. The verifier polls
//! the listing surface on a slow fixed interval within a bounded budget. Running
//! out of budget is a soft outcome, not a failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::types::{Network, PollingBudget};

#[async_trait]
pub trait VisibilityProbe: Send + Sync {
    /// Whether `object_name` is currently listed for `address`
    async fn is_visible(&self, address: &str, object_name: &str) -> Result<bool>;
}

/// Probe that fetches the explorer's account listing page and scans it for the
/// blob name. A plain substring match, so it is only as precise as the page.
pub struct ExplorerProbe {
    client: Client,
    base_url: Url,
    network: Network,
}

impl ExplorerProbe {
    pub fn new(base_url: Url, network: Network, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::HttpError)?;
        Ok(Self {
            client,
            base_url,
            network,
        })
    }

    fn listing_url(&self, address: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::UnexpectedResponse {
                endpoint: self.base_url.to_string(),
                detail: "base URL cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(["account", address, "blobs"]);
        url.query_pairs_mut()
            .append_pair("network", self.network.as_str());
        Ok(url)
    }
}

#[async_trait]
impl VisibilityProbe for ExplorerProbe {
    async fn is_visible(&self, address: &str, object_name: &str) -> Result<bool> {
        let url = self.listing_url(address)?;
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(Error::UnexpectedResponse {
                endpoint: url.to_string(),
                detail: format!("status {}", response.status()),
            });
        }
        let body = response.text().await?;
        Ok(body.contains(object_name))
    }
}

/// Explorer link for a confirmed transaction
pub fn transaction_url(explorer: &Url, network: Network, hash: &str) -> Option<String> {
    let mut url = explorer.clone();
    url.path_segments_mut()
        .ok()?
        .pop_if_empty()
        .extend(["txn", hash]);
    url.query_pairs_mut().append_pair("network", network.as_str());
    Some(url.to_string())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexOutcome {
    Visible { attempts: u32 },
    /// Budget exhausted without observing the blob
    NotYetIndexed { attempts: u32 },
    Cancelled { attempts: u32 },
}

pub struct IndexVerifier {
    probe: Arc<dyn VisibilityProbe>,
    budget: PollingBudget,
}

impl IndexVerifier {
    pub fn new(probe: Arc<dyn VisibilityProbe>, budget: PollingBudget) -> Self {
        Self { probe, budget }
    }

    pub fn budget(&self) -> PollingBudget {
        self.budget
    }

    /// Poll until the blob is visible, the budget runs out, or `cancel` fires.
    ///
    /// `on_attempt(attempt, max_attempts)` is called before each query.
    #[instrument(skip(self, cancel, on_attempt), fields(max_attempts = self.budget.max_attempts))]
    pub async fn verify<F>(
        &self,
        address: &str,
        object_name: &str,
        cancel: &CancellationToken,
        mut on_attempt: F,
    ) -> IndexOutcome
    where
        F: FnMut(u32, u32) + Send,
    {
        let max = self.budget.max_attempts;

        for attempt in 1..=max {
            if cancel.is_cancelled() {
                return IndexOutcome::Cancelled {
                    attempts: attempt - 1,
                };
            }

            on_attempt(attempt, max);
            match self.probe.is_visible(address, object_name).await {
                Ok(true) => {
                    info!(attempt, "{} is visible in the index", object_name);
                    return IndexOutcome::Visible { attempts: attempt };
                }
                Ok(false) => debug!(attempt, "{} not indexed yet", object_name),
                Err(e) => warn!(attempt, "Index probe failed, will retry: {}", e),
            }

            if attempt < max {
                tokio::select! {
                    _ = cancel.cancelled() => return IndexOutcome::Cancelled { attempts: attempt },
                    _ = tokio::time::sleep(self.budget.interval()) => {}
                }
            }
        }

        info!(
            "{} not visible after {} attempts, leaving it to the index",
            object_name, max
        );
        IndexOutcome::NotYetIndexed { attempts: max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Probe that becomes visible on a given attempt and records query times
    struct CountingProbe {
        visible_on: Option<u32>,
        fail_on: Option<u32>,
        queries: Mutex<Vec<Instant>>,
    }

    impl CountingProbe {
        fn new(visible_on: Option<u32>) -> Arc<Self> {
            Arc::new(Self {
                visible_on,
                fail_on: None,
                queries: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.queries.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl VisibilityProbe for CountingProbe {
        async fn is_visible(&self, _address: &str, _object_name: &str) -> Result<bool> {
            let attempt = {
                let mut q = self.queries.lock().unwrap();
                q.push(Instant::now());
                q.len() as u32
            };
            if self.fail_on == Some(attempt) {
                return Err(Error::UnexpectedResponse {
                    endpoint: "explorer".to_string(),
                    detail: "502".to_string(),
                });
            }
            Ok(self.visible_on.is_some_and(|n| attempt >= n))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_as_soon_as_visible() {
        let probe = CountingProbe::new(Some(2));
        let verifier = IndexVerifier::new(probe.clone(), PollingBudget::new(10, 15_000));
        let mut seen = Vec::new();

        let outcome = verifier
            .verify("0xabc", "a.txt", &CancellationToken::new(), |a, m| {
                seen.push((a, m))
            })
            .await;

        assert_eq!(outcome, IndexOutcome::Visible { attempts: 2 });
        assert_eq!(probe.count(), 2);
        assert_eq!(seen, vec![(1, 10), (2, 10)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_bounds_queries_and_spacing() {
        let probe = CountingProbe::new(None);
        let verifier = IndexVerifier::new(probe.clone(), PollingBudget::new(10, 15_000));

        let outcome = verifier
            .verify("0xabc", "a.txt", &CancellationToken::new(), |_, _| {})
            .await;

        assert_eq!(outcome, IndexOutcome::NotYetIndexed { attempts: 10 });
        let queries = probe.queries.lock().unwrap();
        assert_eq!(queries.len(), 10);
        for pair in queries.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(15_000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_makes_no_queries() {
        let probe = CountingProbe::new(Some(1));
        let verifier = IndexVerifier::new(probe.clone(), PollingBudget::new(0, 15_000));

        let outcome = verifier
            .verify("0xabc", "a.txt", &CancellationToken::new(), |_, _| {})
            .await;
        assert_eq!(outcome, IndexOutcome::NotYetIndexed { attempts: 0 });
        assert_eq!(probe.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_errors_are_retried() {
        let probe = Arc::new(CountingProbe {
            visible_on: Some(2),
            fail_on: Some(1),
            queries: Mutex::new(Vec::new()),
        });
        let verifier = IndexVerifier::new(probe.clone(), PollingBudget::new(3, 1_000));

        let outcome = verifier
            .verify("0xabc", "a.txt", &CancellationToken::new(), |_, _| {})
            .await;
        assert_eq!(outcome, IndexOutcome::Visible { attempts: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_sleep() {
        let probe = CountingProbe::new(None);
        let verifier = IndexVerifier::new(probe.clone(), PollingBudget::new(10, 15_000));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            trigger.cancel();
        });

        let outcome = verifier.verify("0xabc", "a.txt", &cancel, |_, _| {}).await;
        assert_eq!(outcome, IndexOutcome::Cancelled { attempts: 2 });
        assert_eq!(probe.count(), 2);
    }

    #[tokio::test]
    async fn test_explorer_probe_scans_listing_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/account/0xabc/blobs"))
            .and(query_param("network", "testnet"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<table><tr><td>reports/q3.pdf</td></tr></table>"),
            )
            .mount(&server)
            .await;

        let probe = ExplorerProbe::new(
            Url::parse(&server.uri()).unwrap(),
            Network::Testnet,
            Duration::from_secs(5),
        )
        .unwrap();

        assert!(probe.is_visible("0xabc", "reports/q3.pdf").await.unwrap());
        assert!(!probe.is_visible("0xabc", "missing.bin").await.unwrap());
    }

    #[tokio::test]
    async fn test_explorer_probe_reports_http_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let probe = ExplorerProbe::new(
            Url::parse(&server.uri()).unwrap(),
            Network::Testnet,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(probe.is_visible("0xabc", "a.txt").await.is_err());
    }

    #[test]
    fn test_transaction_url() {
        let explorer = Url::parse("https://explorer.example.com/").unwrap();
        assert_eq!(
            transaction_url(&explorer, Network::Devnet, "0xabc").as_deref(),
            Some("https://explorer.example.com/txn/0xabc?network=devnet")
        );
    }
}
