use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register units and help text for every metric the crate emits.
///
/// Safe to call repeatedly; only the first call reaches the recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "ldcache_entry_hit_total",
            Unit::Count,
            "Cache entry lookups that found a well-formed record."
        );
        describe_counter!(
            "ldcache_entry_miss_total",
            Unit::Count,
            "Cache entry lookups that found nothing."
        );
        describe_counter!(
            "ldcache_entry_malformed_total",
            Unit::Count,
            "Cache records missing a required field, served as misses."
        );
        describe_counter!(
            "ldcache_write_back_total",
            Unit::Count,
            "Authorized public entries written back to the cache."
        );
        describe_counter!(
            "ldcache_write_back_failed_total",
            Unit::Count,
            "Write-back attempts that failed and were skipped."
        );
        describe_histogram!(
            "ldcache_authorize_ms",
            Unit::Milliseconds,
            "Backend authorization latency per service group, labelled by mode."
        );
        describe_counter!(
            "ldcache_invalidation_processed_total",
            Unit::Count,
            "Invalidation messages applied and acknowledged."
        );
        describe_counter!(
            "ldcache_invalidation_failed_total",
            Unit::Count,
            "Invalidation messages that could not be applied."
        );
        describe_counter!(
            "ldcache_invalidation_ignored_total",
            Unit::Count,
            "Invalidation messages of an unknown type, acknowledged without effect."
        );
    });
}
