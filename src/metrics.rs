//! Prometheus metrics for upload runs
//!
//! # Exported metrics
//! - `upload_outcomes_total` (counter): finished runs labeled by terminal status.
//! - `upload_stage_duration_seconds` (histogram): time spent per stage
//!   (`write`, `resolve`, `confirm`, `index`).
//! - `upload_index_attempts` (histogram): explorer queries made per index stage.

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, linear_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    /// Terminal phase, e.g. "available", "transaction_confirmed", "failed"
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StageLabels {
    pub stage: String,
}

pub static UPLOAD_OUTCOMES_TOTAL: Lazy<Family<OutcomeLabels, Counter>> =
    Lazy::new(Family::default);

pub static STAGE_DURATION_SECONDS: Lazy<Family<StageLabels, Histogram>> = Lazy::new(|| {
    fn stage_histogram() -> Histogram {
        // 10ms .. ~5.5min; index stages run for minutes.
        Histogram::new(exponential_buckets(0.01, 2.0, 16))
    }

    Family::new_with_constructor(stage_histogram)
});

pub static INDEX_ATTEMPTS: Lazy<Histogram> =
    Lazy::new(|| Histogram::new(linear_buckets(1.0, 1.0, 10)));

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    // Counters get the `_total` suffix on encode.
    registry.register(
        "upload_outcomes",
        "Finished upload runs by terminal status",
        UPLOAD_OUTCOMES_TOTAL.clone(),
    );
    registry.register(
        "upload_stage_duration_seconds",
        "Time spent in each upload stage in seconds",
        STAGE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "upload_index_attempts",
        "Explorer queries made before the index stage ended",
        INDEX_ATTEMPTS.clone(),
    );
    registry
});

pub fn inc_outcome(status: &str) {
    let labels = OutcomeLabels {
        status: status.to_string(),
    };
    UPLOAD_OUTCOMES_TOTAL.get_or_create(&labels).inc();
}

/// Observe a stage duration in seconds.
pub fn observe_stage_duration(stage: &str, seconds: f64) {
    let labels = StageLabels {
        stage: stage.to_string(),
    };
    STAGE_DURATION_SECONDS.get_or_create(&labels).observe(seconds);
}

pub fn observe_index_attempts(attempts: u32) {
    INDEX_ATTEMPTS.observe(f64::from(attempts));
}

/// Encode the registry in the Prometheus text exposition format
pub fn render() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}
