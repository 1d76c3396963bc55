use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use opentelemetry::metrics::{Counter, Gauge};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tokio::runtime::Runtime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const OTLP_ENDPOINT_OVERRIDE_ENV: &str = "HEIGHT_UPGRADE_OTEL_EXPORTER_OTLP_ENDPOINT";
const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const DEFAULT_SERVICE_NAME: &str = "height-upgrade";
const DEFAULT_METRIC_EXPORT_INTERVAL_SECS: u64 = 15;

static HEIGHT_POLLS_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
static OBSERVED_HEIGHT_GAUGE: OnceLock<Gauge<u64>> = OnceLock::new();
static UPGRADE_TRANSITIONS_COUNTER: OnceLock<Counter<u64>> = OnceLock::new();

pub struct ObservabilityGuard {
    _tracer_provider: Option<SdkTracerProvider>,
    _meter_provider: Option<SdkMeterProvider>,
    _tokio_runtime: Option<Runtime>,
}

impl ObservabilityGuard {
    /// Console logging always; OTLP export only when an endpoint is configured.
    pub fn init() -> Self {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr);

        let Some(endpoint) = configured_otlp_endpoint() else {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init();
            return Self::console_only();
        };

        match setup_otel_pipeline(&endpoint) {
            Ok(pipeline) => {
                let tracer = pipeline.tracer_provider.tracer("height-upgrade");
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(otel_layer)
                    .try_init();

                init_instruments();

                eprintln!(
                    "{{\"event\":\"observability_init\",\"status\":\"ok\",\"otlp_endpoint\":{}}}",
                    json_string(&endpoint)
                );

                Self {
                    _tracer_provider: Some(pipeline.tracer_provider),
                    _meter_provider: Some(pipeline.meter_provider),
                    _tokio_runtime: Some(pipeline.runtime),
                }
            }
            Err(err) => {
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .try_init();
                eprintln!(
                    "{{\"event\":\"observability_init\",\"status\":\"degraded\",\"message\":{}}}",
                    json_string(&format!("{:#}", err))
                );
                Self::console_only()
            }
        }
    }

    fn console_only() -> Self {
        Self {
            _tracer_provider: None,
            _meter_provider: None,
            _tokio_runtime: None,
        }
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(meter_provider) = self._meter_provider.as_ref() {
            if let Err(err) = meter_provider.force_flush() {
                report_shutdown_error("metrics", "flush_error", &err.to_string());
            }
            if let Err(err) = meter_provider.shutdown() {
                report_shutdown_error("metrics", "shutdown_error", &err.to_string());
            }
        }

        if let Some(tracer_provider) = self._tracer_provider.as_ref() {
            let flush_errors = tracer_provider
                .force_flush()
                .into_iter()
                .filter_map(|result| result.err().map(|err| err.to_string()))
                .collect::<Vec<_>>();
            if !flush_errors.is_empty() {
                report_shutdown_error("traces", "flush_error", &flush_errors.join("; "));
            }
            if let Err(err) = tracer_provider.shutdown() {
                report_shutdown_error("traces", "shutdown_error", &err.to_string());
            }
        }
    }
}

fn report_shutdown_error(component: &str, status: &str, message: &str) {
    eprintln!(
        "{{\"event\":\"observability_shutdown\",\"component\":\"{}\",\"status\":\"{}\",\"message\":{}}}",
        component,
        status,
        json_string(message)
    );
}

fn json_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"unencodable message\"".to_string())
}

struct PipelineState {
    runtime: Runtime,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

fn configured_otlp_endpoint() -> Option<String> {
    [OTLP_ENDPOINT_OVERRIDE_ENV, OTLP_ENDPOINT_ENV]
        .iter()
        .filter_map(|key| env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

fn setup_otel_pipeline(endpoint: &str) -> Result<PipelineState> {
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(anyhow!(
            "OTLP endpoint must start with http:// or https://, got '{}'",
            endpoint
        ));
    }
    let service_name = env::var("OTEL_SERVICE_NAME")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
    let export_interval_secs = env::var("OTEL_METRIC_EXPORT_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_METRIC_EXPORT_INTERVAL_SECS);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .thread_name("height-upgrade-otel")
        .build()
        .context("failed building tokio runtime for OpenTelemetry")?;
    let _runtime_guard = runtime.enter();

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name)]);

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.to_string())
        .build()
        .context("failed building OTLP span exporter")?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(span_exporter, opentelemetry_sdk::runtime::Tokio)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.to_string())
        .build()
        .context("failed building OTLP metric exporter")?;

    let periodic_reader =
        PeriodicReader::builder(metric_exporter, opentelemetry_sdk::runtime::Tokio)
            .with_interval(Duration::from_secs(export_interval_secs))
            .build();

    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(periodic_reader)
        .build();
    global::set_meter_provider(meter_provider.clone());

    Ok(PipelineState {
        runtime,
        tracer_provider,
        meter_provider,
    })
}

fn init_instruments() {
    let meter = global::meter("height-upgrade");

    let _ = HEIGHT_POLLS_COUNTER.get_or_init(|| {
        meter
            .u64_counter("height_polls_total")
            .with_description("Height polls by outcome (ok or unavailable).")
            .build()
    });
    let _ = OBSERVED_HEIGHT_GAUGE.get_or_init(|| {
        meter
            .u64_gauge("observed_height")
            .with_description("Latest block height reported by the status endpoint.")
            .build()
    });
    let _ = UPGRADE_TRANSITIONS_COUNTER.get_or_init(|| {
        meter
            .u64_counter("upgrade_transitions_total")
            .with_description("Upgrade sequence states reached, by state name.")
            .build()
    });
}

pub fn record_height_poll(status: &'static str, observed_height: Option<u64>) {
    if let Some(counter) = HEIGHT_POLLS_COUNTER.get() {
        counter.add(1, &[KeyValue::new("status", status)]);
    }
    if let (Some(gauge), Some(height)) = (OBSERVED_HEIGHT_GAUGE.get(), observed_height) {
        gauge.record(height, &[]);
    }
}

pub fn record_transition(state: &'static str) {
    if let Some(counter) = UPGRADE_TRANSITIONS_COUNTER.get() {
        counter.add(1, &[KeyValue::new("state", state)]);
    }
}
