//! Pipeline configuration and the pre-flight validator
//!
//! Configuration can come from a TOML file, CLI flags or environment variables.
//! Nothing touches the network until [`validate`] has turned a [`PipelineConfig`]
//! into a [`ValidatedConfig`].

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{ConfigProblem, Error, Result};
use crate::types::{LedgerAccount, Network, PollingBudget};

pub const DEFAULT_HISTORY_LIMIT: usize = 5;
pub const DEFAULT_RECENCY_WINDOW_SECS: u64 = 60;
pub const DEFAULT_CONFIRMATION_BUDGET: PollingBudget = PollingBudget::new(30, 1_000);
pub const DEFAULT_INDEX_BUDGET: PollingBudget = PollingBudget::new(10, 15_000);

/// Settings for attributing a ledger transaction to a write
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ResolverSettings {
    /// How many of the account's most recent transactions to inspect
    pub history_limit: usize,
    /// Maximum age of a transaction that can be attributed to the write
    pub recency_window_secs: u64,
    /// History lookups before giving up (the write may land a moment after the ack)
    pub lookup_attempts: u32,
    pub lookup_interval_millis: u64,
    /// Fall back to a locally derived, non-authoritative identifier
    pub placeholder_fallback: bool,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            recency_window_secs: DEFAULT_RECENCY_WINDOW_SECS,
            lookup_attempts: 3,
            lookup_interval_millis: 2_000,
            placeholder_fallback: false,
        }
    }
}

impl ResolverSettings {
    pub fn recency_window(&self) -> Duration {
        Duration::from_secs(self.recency_window_secs)
    }

    pub fn lookup_interval(&self) -> Duration {
        Duration::from_millis(self.lookup_interval_millis)
    }
}

/// Raw, unvalidated configuration
#[derive(Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PipelineConfig {
    pub network: Network,
    pub private_key: Option<String>,
    pub account_address: Option<String>,
    pub ledger_rpc_url: Option<String>,
    pub storage_rpc_url: Option<String>,
    pub explorer_url: Option<String>,
    pub api_key: Option<String>,
    pub resolver: ResolverSettings,
    pub confirmation: Option<PollingBudget>,
    pub index: Option<PollingBudget>,
    pub request_timeout_secs: Option<u64>,
}

impl std::fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("PipelineConfig")
            .field("network", &self.network)
            .field("private_key", &redact(&self.private_key))
            .field("account_address", &self.account_address)
            .field("ledger_rpc_url", &self.ledger_rpc_url)
            .field("storage_rpc_url", &self.storage_rpc_url)
            .field("explorer_url", &self.explorer_url)
            .field("api_key", &redact(&self.api_key))
            .field("resolver", &self.resolver)
            .field("confirmation", &self.confirmation)
            .field("index", &self.index)
            .finish()
    }
}

impl PipelineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Fill endpoints the caller left unset from the network preset
    pub fn with_network_defaults(mut self) -> Self {
        if self.ledger_rpc_url.is_none() {
            self.ledger_rpc_url = Some(self.network.default_ledger_rpc_url().to_string());
        }
        if self.storage_rpc_url.is_none() {
            self.storage_rpc_url = self.network.default_storage_rpc_url().map(str::to_string);
        }
        if self.explorer_url.is_none() {
            self.explorer_url = self.network.default_explorer_url().map(str::to_string);
        }
        self
    }
}

/// Configuration that passed [`validate`]. The only way to build a live pipeline.
#[derive(Clone, Debug)]
pub struct ValidatedConfig {
    pub network: Network,
    pub account: LedgerAccount,
    pub ledger_rpc_url: Url,
    pub storage_rpc_url: Url,
    pub explorer_url: Url,
    pub api_key: String,
    pub resolver: ResolverSettings,
    pub confirmation: PollingBudget,
    pub index: PollingBudget,
    pub request_timeout: Duration,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn check_url(field: &'static str, raw: &str, malformed: &mut Vec<ConfigProblem>) -> Option<Url> {
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url),
        Ok(url) => {
            malformed.push(ConfigProblem {
                field,
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
            None
        }
        Err(e) => {
            malformed.push(ConfigProblem {
                field,
                reason: format!("not a valid URL: {e}"),
            });
            None
        }
    }
}

fn is_hex_address(raw: &str) -> bool {
    raw.strip_prefix("0x")
        .map(|h| !h.is_empty() && h.len() <= 64 && h.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

fn is_hex_seed(raw: &str) -> bool {
    let h = raw.strip_prefix("0x").unwrap_or(raw);
    h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit())
}

fn check_budget(
    field: &'static str,
    budget: PollingBudget,
    malformed: &mut Vec<ConfigProblem>,
) -> PollingBudget {
    if budget.max_attempts == 0 {
        malformed.push(ConfigProblem {
            field,
            reason: "max_attempts must be at least 1".to_string(),
        });
    }
    budget
}

/// Check that every credential and endpoint is present and well-formed.
///
/// Pure: performs no I/O. Reports all missing and malformed fields at once.
pub fn validate(config: &PipelineConfig) -> Result<ValidatedConfig> {
    let mut missing = Vec::new();
    let mut malformed = Vec::new();

    let private_key = present(&config.private_key);
    match private_key {
        None => missing.push("private_key"),
        Some(key) if !is_hex_seed(key) => malformed.push(ConfigProblem {
            field: "private_key",
            reason: "expected 32-byte hex ed25519 seed".to_string(),
        }),
        Some(_) => {}
    }

    let address = present(&config.account_address);
    match address {
        None => missing.push("account_address"),
        Some(addr) if !is_hex_address(addr) => malformed.push(ConfigProblem {
            field: "account_address",
            reason: "expected 0x-prefixed hex".to_string(),
        }),
        Some(_) => {}
    }

    let mut url_field = |field: &'static str, value: &Option<String>| match present(value) {
        None => {
            missing.push(field);
            None
        }
        Some(raw) => check_url(field, raw, &mut malformed),
    };
    let ledger_rpc_url = url_field("ledger_rpc_url", &config.ledger_rpc_url);
    let storage_rpc_url = url_field("storage_rpc_url", &config.storage_rpc_url);
    let explorer_url = url_field("explorer_url", &config.explorer_url);

    let api_key = present(&config.api_key);
    if api_key.is_none() {
        missing.push("api_key");
    }

    if config.resolver.history_limit == 0 {
        malformed.push(ConfigProblem {
            field: "resolver.history_limit",
            reason: "must be at least 1".to_string(),
        });
    }
    if config.resolver.lookup_attempts == 0 {
        malformed.push(ConfigProblem {
            field: "resolver.lookup_attempts",
            reason: "must be at least 1".to_string(),
        });
    }
    if config.resolver.recency_window_secs == 0 {
        malformed.push(ConfigProblem {
            field: "resolver.recency_window_secs",
            reason: "must be at least 1".to_string(),
        });
    }
    let confirmation = check_budget(
        "confirmation",
        config.confirmation.unwrap_or(DEFAULT_CONFIRMATION_BUDGET),
        &mut malformed,
    );
    let index = check_budget(
        "index",
        config.index.unwrap_or(DEFAULT_INDEX_BUDGET),
        &mut malformed,
    );

    if !missing.is_empty() || !malformed.is_empty() {
        return Err(Error::Configuration { missing, malformed });
    }

    // Every Option below was checked above.
    let (
        Some(private_key),
        Some(address),
        Some(ledger_rpc_url),
        Some(storage_rpc_url),
        Some(explorer_url),
        Some(api_key),
    ) = (
        private_key,
        address,
        ledger_rpc_url,
        storage_rpc_url,
        explorer_url,
        api_key,
    )
    else {
        return Err(Error::Configuration {
            missing: Vec::new(),
            malformed: Vec::new(),
        });
    };

    Ok(ValidatedConfig {
        network: config.network,
        account: LedgerAccount::from_hex_seed(address, private_key)?,
        ledger_rpc_url,
        storage_rpc_url,
        explorer_url,
        api_key: api_key.to_string(),
        resolver: config.resolver.clone(),
        confirmation,
        index,
        request_timeout: Duration::from_secs(config.request_timeout_secs.unwrap_or(30)),
    })
}
