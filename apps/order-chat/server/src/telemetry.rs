//! Logging, the Prometheus recorder behind `/metrics`, and optional span export
//! for the relay.

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::{trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "order-chat-relay";
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MetricKind {
    Counter,
    Gauge,
}

/// Every metric the relay emits, with the help text served on `/metrics`.
const RELAY_METRICS: &[(&str, MetricKind, &str)] = &[
    (
        "order_chat_sinks_active",
        MetricKind::Gauge,
        "Open chat streams across all conversations.",
    ),
    (
        "order_chat_conversations_active",
        MetricKind::Gauge,
        "Conversations with at least one open stream.",
    ),
    (
        "order_chat_streams_opened_total",
        MetricKind::Counter,
        "Chat streams accepted by the events endpoint.",
    ),
    (
        "order_chat_streams_closed_total",
        MetricKind::Counter,
        "Chat streams torn down for any reason.",
    ),
    (
        "order_chat_subscribe_rejected_total",
        MetricKind::Counter,
        "Subscription attempts refused, labelled by reason.",
    ),
    (
        "order_chat_heartbeats_total",
        MetricKind::Counter,
        "Heartbeat frames queued on open streams.",
    ),
    (
        "order_chat_frames_delivered_total",
        MetricKind::Counter,
        "Published frames queued on subscriber streams.",
    ),
    (
        "order_chat_sinks_pruned_total",
        MetricKind::Counter,
        "Streams dropped during publish, labelled by reason.",
    ),
];

/// Environment knobs read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Directive used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
    /// Print spans to stdout through OpenTelemetry (`ORDER_CHAT_OTEL_STDOUT`).
    pub stdout_spans: bool,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let stdout_spans = lookup("ORDER_CHAT_OTEL_STDOUT")
            .map(|value| {
                matches!(
                    value.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(false);
        let default_filter = lookup("ORDER_CHAT_LOG")
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_owned());
        Self {
            default_filter,
            stdout_spans,
        }
    }
}

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    spans: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        Self::init_with(TelemetryConfig::from_env())
    }

    pub fn init_with(config: TelemetryConfig) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .add_global_label("service", SERVICE_NAME)
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_metrics();

        let spans = config.stdout_spans.then(stdout_tracer_provider);
        let otel_layer = spans.as_ref().map(|provider| {
            opentelemetry::global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        info!(
            stdout_spans = config.stdout_spans,
            metrics = RELAY_METRICS.len(),
            "telemetry ready"
        );
        Ok(Self {
            metrics_handle,
            spans,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }

    /// Flushes exported spans. Call once the server has stopped.
    pub fn shutdown(self) {
        let Some(provider) = self.spans else {
            return;
        };
        if let Err(err) = provider.shutdown() {
            warn!(error = %err, "span exporter did not shut down cleanly");
        }
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    let resource = Resource::builder()
        .with_attributes([KeyValue::new("service.name", SERVICE_NAME)])
        .build();
    SdkTracerProvider::builder()
        .with_resource(resource)
        .with_sampler(Sampler::AlwaysOn)
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .build()
}

fn describe_metrics() {
    for &(name, kind, help) in RELAY_METRICS {
        match kind {
            MetricKind::Counter => {
                describe_counter!(name, help);
            }
            MetricKind::Gauge => {
                describe_gauge!(name, help);
            }
        }
    }
}
