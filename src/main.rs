//! upload-pipeline entry point
//!
//! Writes files to the storage network and follows each upload through ledger
//! confirmation and explorer indexing. Final outcomes are printed as JSON on
//! stdout; progress goes to the log on stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use upload_pipeline::state::NoProgress;
use upload_pipeline::telemetry;
use upload_pipeline::{
    validate, Network, Phase, PipelineConfig, UploadOrchestrator, UploadOutcome, UploadRequest,
    ValidatedConfig,
};

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "upload-pipeline", version)]
#[command(about = "Upload blobs and verify them through ledger confirmation and indexing")]
struct Cli {
    /// TOML configuration file; flags and environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, env = "UPLOAD_NETWORK", global = true)]
    network: Option<Network>,

    /// Hex ed25519 seed of the signing account
    #[arg(long, env = "UPLOAD_PRIVATE_KEY", hide_env_values = true, global = true)]
    private_key: Option<String>,

    #[arg(long, env = "UPLOAD_ACCOUNT_ADDRESS", global = true)]
    account_address: Option<String>,

    #[arg(long, env = "UPLOAD_LEDGER_RPC_URL", global = true)]
    ledger_rpc_url: Option<String>,

    #[arg(long, env = "UPLOAD_STORAGE_RPC_URL", global = true)]
    storage_rpc_url: Option<String>,

    #[arg(long, env = "UPLOAD_EXPLORER_URL", global = true)]
    explorer_url: Option<String>,

    #[arg(long, env = "UPLOAD_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Write Prometheus metrics to stderr when done
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate credentials and endpoints without touching the network
    CheckConfig,

    /// Upload one or more files and wait for them to become available
    Upload {
        /// File to upload; repeat to upload several concurrently
        #[arg(short, long, required = true)]
        file: Vec<PathBuf>,

        /// Blob name (defaults to the file name; only valid with a single file)
        #[arg(short, long)]
        name: Option<String>,

        /// Storage period, e.g. 30d, 12h, 45m
        #[arg(long, default_value = "30d", value_parser = parse_expires_in)]
        expires_in: chrono::Duration,

        /// Use a non-authoritative placeholder when no transaction can be attributed
        #[arg(long)]
        placeholder_fallback: bool,
    },

    /// Re-run confirmation and index checks for an earlier upload
    Reverify {
        #[arg(long)]
        tx_hash: String,

        #[arg(long)]
        name: String,
    },
}

fn parse_expires_in(raw: &str) -> Result<chrono::Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in '{raw}' (use s, m, h or d)"))?;
    let (value, unit) = raw.split_at(split);
    let value: i64 = value
        .parse()
        .map_err(|_| format!("invalid number in '{raw}'"))?;
    let duration = match unit {
        "s" => chrono::Duration::seconds(value),
        "m" => chrono::Duration::minutes(value),
        "h" => chrono::Duration::hours(value),
        "d" => chrono::Duration::days(value),
        other => return Err(format!("unknown unit '{other}' (use s, m, h or d)")),
    };
    if duration <= chrono::Duration::zero() {
        return Err("expiry must be in the future".to_string());
    }
    Ok(duration)
}

impl Cli {
    fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_toml_file(path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => PipelineConfig::default(),
        };

        if let Some(network) = self.network {
            config.network = network;
        }
        let overrides = [
            (&mut config.private_key, &self.private_key),
            (&mut config.account_address, &self.account_address),
            (&mut config.ledger_rpc_url, &self.ledger_rpc_url),
            (&mut config.storage_rpc_url, &self.storage_rpc_url),
            (&mut config.explorer_url, &self.explorer_url),
            (&mut config.api_key, &self.api_key),
        ];
        for (slot, value) in overrides {
            if value.is_some() {
                slot.clone_from(value);
            }
        }

        Ok(config.with_network_defaults())
    }
}

fn print_json(outcomes: &[UploadOutcome]) -> anyhow::Result<()> {
    let text = match outcomes {
        [single] => serde_json::to_string_pretty(single)?,
        many => serde_json::to_string_pretty(many)?,
    };
    println!("{text}");
    Ok(())
}

fn cancel_on_ctrl_c(tokens: Vec<CancellationToken>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling {} upload(s)", tokens.len());
            for token in tokens {
                token.cancel();
            }
        }
    });
}

async fn upload(
    config: ValidatedConfig,
    files: Vec<PathBuf>,
    name: Option<String>,
    expires_in: chrono::Duration,
) -> anyhow::Result<Vec<UploadOutcome>> {
    if name.is_some() && files.len() > 1 {
        bail!("--name can only be used with a single --file");
    }

    let expiration = Utc::now() + expires_in;
    let mut requests = Vec::with_capacity(files.len());
    for path in &files {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let object_name = match &name {
            Some(n) => n.clone(),
            None => path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .with_context(|| format!("{} has no file name", path.display()))?,
        };
        requests.push(UploadRequest::new(bytes, object_name, expiration)?);
    }

    let orchestrator = Arc::new(UploadOrchestrator::from_config(&config)?);
    let handles: Vec<_> = requests
        .into_iter()
        .map(|request| orchestrator.spawn(request))
        .collect();
    cancel_on_ctrl_c(handles.iter().map(|h| h.cancellation_token()).collect());

    let runs = handles.into_iter().map(|mut handle| async move {
        while let Some(snapshot) = handle.progress.recv().await {
            info!(
                phase = %snapshot.status,
                progress = snapshot.progress_percent,
                "{}",
                snapshot.message
            );
        }
        handle.join().await
    });

    let mut outcomes = Vec::new();
    for result in join_all(runs).await {
        outcomes.push(result?);
    }
    Ok(outcomes)
}

async fn reverify(
    config: ValidatedConfig,
    tx_hash: String,
    name: String,
) -> anyhow::Result<UploadOutcome> {
    let orchestrator = UploadOrchestrator::from_config(&config)?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(vec![cancel.clone()]);
    Ok(orchestrator
        .reverify(&tx_hash, &name, Arc::new(NoProgress), cancel)
        .await)
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let raw = cli.pipeline_config()?;

    match cli.command {
        Command::CheckConfig => match validate(&raw) {
            Ok(config) => {
                let summary = serde_json::json!({
                    "valid": true,
                    "network": config.network,
                    "accountAddress": config.account.address(),
                    "ledgerRpcUrl": config.ledger_rpc_url.as_str(),
                    "storageRpcUrl": config.storage_rpc_url.as_str(),
                    "explorerUrl": config.explorer_url.as_str(),
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
                Ok(true)
            }
            Err(e) => {
                let summary = serde_json::json!({
                    "valid": false,
                    "errorKind": e.kind(),
                    "errorDetail": e.to_string(),
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
                Ok(false)
            }
        },
        Command::Upload {
            file,
            name,
            expires_in,
            placeholder_fallback,
        } => {
            let mut raw = raw;
            raw.resolver.placeholder_fallback |= placeholder_fallback;
            let config = validate(&raw)?;
            let outcomes = upload(config, file, name, expires_in).await?;
            print_json(&outcomes)?;
            Ok(outcomes
                .iter()
                .all(|o| !matches!(o.status, Phase::Failed | Phase::Cancelled)))
        }
        Command::Reverify { tx_hash, name } => {
            let config = validate(&raw)?;
            let outcome = reverify(config, tx_hash, name).await?;
            print_json(std::slice::from_ref(&outcome))?;
            Ok(!matches!(outcome.status, Phase::Failed | Phase::Cancelled))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_logging(matches!(cli.log_format, LogFormat::Json))?;

    info!(
        "upload-pipeline v{} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_SHA"),
        env!("BUILD_DATE")
    );

    let print_metrics = cli.print_metrics;
    let result = run(cli).await;

    #[cfg(feature = "metrics")]
    if print_metrics {
        match upload_pipeline::metrics::render() {
            Ok(text) => eprint!("{text}"),
            Err(e) => error!("Failed to encode metrics: {}", e),
        }
    }
    #[cfg(not(feature = "metrics"))]
    if print_metrics {
        warn!("Built without the metrics feature");
    }

    telemetry::shutdown_telemetry();

    match result {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            Err(e)
        }
    }
}
