use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry::metrics::MeterProvider;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt as tracing_fmt};

pub const SERVICE_NAME: &str = "greentic-cloudant";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// Unknown names fall back to `info`.
    pub fn parse(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            "critical" => LogLevel::Critical,
            _ => LogLevel::Info,
        }
    }

    /// The `EnvFilter` directive for this level.
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directive())
    }
}

/// Emits a log line through `tracing` with the node as context.
pub fn log(level: LogLevel, context: &str, msg: &str) {
    match level {
        LogLevel::Trace => tracing::trace!(%context, "{msg}"),
        LogLevel::Debug => tracing::debug!(%context, "{msg}"),
        LogLevel::Info => tracing::info!(%context, "{msg}"),
        LogLevel::Warn => tracing::warn!(%context, "{msg}"),
        LogLevel::Error => tracing::error!(%context, "{msg}"),
        LogLevel::Critical => tracing::error!(%context, "[CRITICAL] {msg}"),
    }
}

/// Keeps the exporters alive; dropping it flushes nothing, call [`Telemetry::shutdown`].
pub enum Telemetry {
    Otlp {
        logger_provider: SdkLoggerProvider,
        tracer_provider: SdkTracerProvider,
        meter_provider: SdkMeterProvider,
    },
    Files,
}

impl Telemetry {
    pub fn shutdown(self) {
        if let Telemetry::Otlp {
            logger_provider,
            tracer_provider,
            meter_provider,
        } = self
        {
            if let Err(e) = tracer_provider.shutdown() {
                eprintln!("tracer shutdown failed: {e}");
            }
            if let Err(e) = meter_provider.shutdown() {
                eprintln!("meter shutdown failed: {e}");
            }
            if let Err(e) = logger_provider.shutdown() {
                eprintln!("logger shutdown failed: {e}");
            }
        }
    }
}

/// Installs the global subscriber.
///
/// With an OTLP endpoint, logs, traces and metrics go to the collector and a
/// copy of the logs goes to stdout. Without one, logs are written to a daily
/// rolling text file and request events to a JSON file under `root`.
pub fn init_tracing(
    root: &Path,
    log_file: &str,
    event_file: &str,
    log_level: LogLevel,
    otel_endpoint: Option<String>,
) -> Result<Telemetry> {
    match otel_endpoint {
        Some(endpoint) => init_otlp(log_level, &endpoint),
        None => init_files(log_level, root.join(log_file), root.join(event_file)),
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();

fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_otlp(log_level: LogLevel, endpoint: &str) -> Result<Telemetry> {
    let logger_provider = SdkLoggerProvider::builder()
        .with_batch_exporter(
            LogExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()
                .context("building OTLP log exporter")?,
        )
        .with_resource(get_resource())
        .build();

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(
            SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()
                .context("building OTLP span exporter")?,
        )
        .with_resource(get_resource())
        .build();

    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(
            MetricExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()
                .context("building OTLP metric exporter")?,
        )
        .with_resource(get_resource())
        .build();

    let otel_filter = EnvFilter::new(log_level.directive())
        .add_directive("hyper=off".parse()?)
        .add_directive("tonic=off".parse()?)
        .add_directive("h2=off".parse()?)
        .add_directive("reqwest=off".parse()?);
    let otel_logs_layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(otel_filter);

    let fmt_layer = tracing_fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::new(log_level.directive()));

    Registry::default()
        .with(otel_logs_layer)
        .with(fmt_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    global::set_tracer_provider(tracer_provider.clone());
    global::set_meter_provider(meter_provider.clone());
    let _ = meter_provider.meter(SERVICE_NAME);

    Ok(Telemetry::Otlp {
        logger_provider,
        tracer_provider,
        meter_provider,
    })
}

fn rolling(path: &Path) -> Result<RollingFileAppender> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("{} has no file name", path.display()))?;
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(name)
        .build(dir)
        .with_context(|| format!("opening log file {}", path.display()))
}

fn init_files(log_level: LogLevel, log_file: PathBuf, event_file: PathBuf) -> Result<Telemetry> {
    let txt_layer = tracing_fmt::layer()
        .with_writer(rolling(&log_file)?)
        .with_ansi(false)
        .with_filter(EnvFilter::new(log_level.directive()));

    // only events with target = "request"
    let json_layer = tracing_fmt::layer()
        .json()
        .with_writer(rolling(&event_file)?)
        .with_target(true)
        .with_filter(EnvFilter::new("request=info"));

    Registry::default()
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    Ok(Telemetry::Files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_levels() {
        assert_eq!(LogLevel::parse("DEBUG"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("nonsense"), LogLevel::Info);
        assert_eq!(LogLevel::Critical.directive(), "error");
    }

    #[test]
    fn test_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&LogLevel::Warn).unwrap(), "\"warn\"");
    }
}
