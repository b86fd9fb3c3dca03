use anyhow::{Context, Result};
use beach_bonfire_core::{RoomId, Uid};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, info_span, warn, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

const SERVICE_NAME: &str = "beach-bonfire";
const OTEL_STDOUT_ENV: &str = "BONFIRE_OTEL_STDOUT";

/// Counters exported by the relay, with their Prometheus help text.
const COUNTERS: &[(&str, &str)] = &[
    ("bonfire_participants_registered_total", "Participants admitted to a room"),
    ("bonfire_registrations_rejected_total", "Registrations refused, by reason"),
    ("bonfire_handshakes_rejected_total", "WebSocket handshakes refused, by reason"),
    ("bonfire_roster_broadcasts_total", "participant-update broadcasts sent"),
    ("bonfire_signals_forwarded_total", "Point-to-point signals delivered, by kind"),
    ("bonfire_signals_dropped_total", "Signals dropped without delivery, by kind"),
    ("bonfire_heartbeat_evictions_total", "Participants evicted after missed heartbeats"),
];

const GAUGES: &[(&str, &str)] = &[
    ("bonfire_rooms_active", "Rooms with at least one participant"),
    ("bonfire_participants_active", "Registered participants across all rooms"),
];

/// Logging, span export and the Prometheus recorder for the relay process.
/// Dropping it flushes the span exporter.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_metrics();

        let tracer_provider = env_truthy(OTEL_STDOUT_ENV).then(stdout_tracer_provider);
        let registry = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false));
        match &tracer_provider {
            Some(provider) => {
                global::set_tracer_provider(provider.clone());
                registry
                    .with(tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME)))
                    .try_init()
            }
            None => registry.try_init(),
        }
        .context("failed to initialise tracing subscriber")?;

        if tracer_provider.is_some() {
            info!("exporting bonfire spans to stdout ({OTEL_STDOUT_ENV}=1)");
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
                warn!(error = %err, "failed to flush bonfire spans on shutdown");
            }
        }
    }
}

/// Span covering one participant's signaling transport, from registration to
/// close.
pub fn connection_span(room_id: &RoomId, uid: Uid, connection_id: Uuid) -> Span {
    info_span!(
        "bonfire.connection",
        room_id = %room_id,
        uid,
        connection_id = %connection_id
    )
}

fn describe_metrics() {
    for &(name, help) in COUNTERS {
        describe_counter!(name, help);
    }
    for &(name, help) in GAUGES {
        describe_gauge!(name, help);
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])
                .build(),
        )
        .build()
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key).is_ok_and(|val| is_truthy(&val))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn metric_names_are_unique_and_prefixed() {
        let mut names: Vec<&str> = COUNTERS.iter().chain(GAUGES).map(|(name, _)| *name).collect();
        assert!(names.iter().all(|name| name.starts_with("bonfire_")));
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test_timeout::timeout]
    fn truthy_values() {
        for value in ["1", "true", " YES ", "on"] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["", "0", "off", "nope"] {
            assert!(!is_truthy(value), "{value}");
        }
    }
}
