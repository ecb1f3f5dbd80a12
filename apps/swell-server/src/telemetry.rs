//! Process-wide observability: the Prometheus recorder behind `/_swell/metrics`,
//! the log subscriber, and an optional stdout span exporter.

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "swell-server";
const OTEL_STDOUT_ENV: &str = "SWELL_OTEL_STDOUT";

/// Patches carried by one frame; most flushes touch a handful of nodes.
const PATCH_BUCKETS: &[f64] = &[1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Counter,
    Gauge,
    Histogram,
}

/// Help text exported for the runtime's metrics.
const DESCRIPTIONS: &[(Kind, &str, &str)] = &[
    (Kind::Gauge, "swell_sessions_active", "Sessions with a live connection"),
    (Kind::Gauge, "swell_sessions_detached", "Sessions waiting inside their resume window"),
    (Kind::Counter, "swell_sessions_created_total", "Sessions mounted for a new client"),
    (Kind::Counter, "swell_sessions_rejected_total", "Session admissions refused, by reason"),
    (Kind::Counter, "swell_sessions_evicted_total", "Sessions force-closed by LRU or memory pressure"),
    (Kind::Counter, "swell_sessions_persisted_total", "Snapshots written to the session store"),
    (Kind::Counter, "swell_sessions_restored_total", "Sessions rebuilt from a stored snapshot"),
    (Kind::Counter, "swell_session_resumed_total", "Live sessions reattached to a new socket"),
    (Kind::Counter, "swell_handshakes_total", "Handshakes by outcome"),
    (Kind::Counter, "swell_resync_total", "Resync answers by plan"),
    (Kind::Counter, "swell_events_dropped_total", "Client events refused by a full queue"),
    (Kind::Counter, "swell_flush_capped_total", "Flushes that hit the iteration cap"),
    (Kind::Counter, "swell_panics_total", "Recovered panics by site"),
    (Kind::Counter, "swell_prefetch_dropped_total", "Prefetch requests dropped, by reason"),
    (Kind::Counter, "swell_prefetch_hits_total", "Navigations served from a prefetched render"),
    (Kind::Counter, "swell_storm_dropped_total", "Work refused by the storm budget, by kind"),
    (Kind::Histogram, "swell_patches_per_frame", "Patches in each outbound patch frame"),
];

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .add_global_label("service", SERVICE_NAME)
            .set_buckets_for_metric(Matcher::Full("swell_patches_per_frame".into()), PATCH_BUCKETS)
            .context("invalid histogram buckets")?
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_metrics();

        let tracer_provider = env_truthy(OTEL_STDOUT_ENV).then(stdout_provider);
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;
        if tracer_provider.is_some() {
            info!(env = OTEL_STDOUT_ENV, "OpenTelemetry stdout exporter enabled");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to shutdown OpenTelemetry tracer provider");
            }
        }
    }
}

fn stdout_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn describe_metrics() {
    for &(kind, name, help) in DESCRIPTIONS {
        match kind {
            Kind::Counter => {
                describe_counter!(name, Unit::Count, help);
            }
            Kind::Gauge => {
                describe_gauge!(name, Unit::Count, help);
            }
            Kind::Histogram => {
                describe_histogram!(name, Unit::Count, help);
            }
        }
    }
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|val| truthy(&val))
        .unwrap_or(false)
}

fn truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test_timeout::timeout]
    fn truthy_values() {
        for value in ["1", "true", "YES", "On"] {
            assert!(truthy(value), "{value}");
        }
        for value in ["0", "false", "", "nope"] {
            assert!(!truthy(value), "{value}");
        }
    }

    #[test_timeout::timeout]
    fn descriptions_name_each_metric_once() {
        let mut seen = HashSet::new();
        for (kind, name, help) in DESCRIPTIONS {
            assert!(name.starts_with("swell_"), "{name}");
            assert!(!help.is_empty(), "{name}");
            assert!(seen.insert(*name), "{name} described twice");
            if name.ends_with("_total") {
                assert_eq!(*kind, Kind::Counter, "{name}");
            }
        }
    }

    #[test_timeout::timeout]
    fn patch_buckets_are_increasing() {
        assert!(PATCH_BUCKETS.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
