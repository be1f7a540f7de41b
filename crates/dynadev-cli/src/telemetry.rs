//! Tracing pipeline for the `dynadev` binary.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP collector base URL. When set, spans are exported over OTLP/HTTP. |
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `DYNADEV_LOG_FORMAT=json` | JSON logs, and JSON lines for delivered events. |
//!
//! Spans exported over OTLP carry the served device on their resource
//! (`device.name`, `dynadev.server`), so traces from several `dynadev`
//! processes can be told apart in the collector.

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing::info;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, ServerKind};

/// Output format shared by the log subscriber and the console transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    /// Read `DYNADEV_LOG_FORMAT`.
    pub fn from_env() -> Self {
        Self::from_name(std::env::var("DYNADEV_LOG_FORMAT").ok().as_deref())
    }

    fn from_name(name: Option<&str>) -> Self {
        match name.map(str::trim) {
            Some(n) if n.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }

    pub fn is_json(self) -> bool {
        self == LogFormat::Json
    }
}

/// Everything the tracing pipeline needs to know, resolved once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySettings {
    pub device_name: String,
    pub server: ServerKind,
    pub format: LogFormat,
    pub otlp_endpoint: Option<String>,
}

impl TelemetrySettings {
    pub fn new(cfg: &Config, format: LogFormat) -> Self {
        Self {
            device_name: cfg.device_name.clone(),
            server: cfg.server,
            format,
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Install the global `tracing` subscriber, with an OTLP layer when an
/// exporter endpoint is configured.
///
/// Hold the returned guard for the lifetime of the process.
pub fn init_tracing(settings: &TelemetrySettings) -> TracerProviderGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let provider = build_provider(settings);

    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("dynadev")));
    let fmt_layer = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(fmt_layer)
        .init();

    info!(
        device = %settings.device_name,
        server = %settings.server,
        otlp = provider.is_some(),
        "tracing initialised"
    );
    TracerProviderGuard(provider)
}

// ─────────────────────────────────────────────────────────────────────────────
// RAII guard
// ─────────────────────────────────────────────────────────────────────────────

/// Shuts the [`SdkTracerProvider`] down on drop, flushing pending spans.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[dynadev] OpenTelemetry provider shutdown error: {e}");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Service name plus the identity of the served device.
fn build_resource(settings: &TelemetrySettings) -> Resource {
    Resource::builder()
        .with_service_name("dynadev")
        .with_attributes([
            KeyValue::new("device.name", settings.device_name.clone()),
            KeyValue::new("dynadev.server", settings.server.to_string()),
        ])
        .build()
}

/// `None` without an endpoint or when the exporter fails to build.
fn build_provider(settings: &TelemetrySettings) -> Option<SdkTracerProvider> {
    let endpoint = settings.otlp_endpoint.clone()?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[dynadev] OTLP exporter init failed: {e}"))
        .ok()?;

    Some(
        SdkTracerProvider::builder()
            .with_resource(build_resource(settings))
            // Tracing starts before the Tokio runtime exists, so no batch
            // exporter here.
            .with_simple_exporter(exporter)
            .build(),
    )
}
