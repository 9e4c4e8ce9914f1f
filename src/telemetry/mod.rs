//! Logging and OpenTelemetry initialization.
//!
//! Every process is one short batch run (`index`, `dispatch`, one `work`
//! job per group), so telemetry is scoped to the run: the resource names
//! the subcommand, the stage and group it handles, and the AWS Batch job it
//! runs inside. The bin calls [`TelemetryGuard::shutdown`] as its last step
//! so the final spans and metric points leave the container before it exits.
//!
//! Console output goes to stderr; stdout is reserved for reports and
//! `--json` output.

pub mod metrics;
pub mod work;

use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::error::{Error, Result};
use crate::model::{GroupKey, Stage};

/// Resource attribute naming the subcommand a process runs.
pub const COMMAND_KEY: &str = "batch.command";
/// Resource attribute naming the stage a dispatch or work run handles.
pub const STAGE_KEY: &str = "batch.stage";
/// Resource attribute naming the group a work run handles.
pub const GROUP_KEY: &str = "batch.group";

/// Container environment set by AWS Batch, mapped to resource attributes.
const BATCH_JOB_ENV: &[(&str, &str)] = &[
    ("AWS_BATCH_JOB_ID", "aws.batch.job.id"),
    ("AWS_BATCH_JOB_ATTEMPT", "aws.batch.job.attempt"),
    ("AWS_BATCH_JQ_NAME", "aws.batch.job_queue"),
    ("AWS_BATCH_CE_NAME", "aws.batch.compute_environment"),
];

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint. Without one only console logging is set up.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset (e.g. "info", "batchtrack=debug").
    pub log_level: String,
    pub command: Option<String>,
    pub attributes: Vec<KeyValue>,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>, log_level: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            service_name: service_name.into(),
            log_level: log_level.into(),
            command: None,
            attributes: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_stage(self, stage: Stage) -> Self {
        self.with_attribute(KeyValue::new(STAGE_KEY, stage.as_str()))
    }

    pub fn with_group(self, group: GroupKey) -> Self {
        self.with_attribute(KeyValue::new(GROUP_KEY, i64::from(group.0)))
    }

    pub fn with_attribute(mut self, attribute: KeyValue) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Resource shared by the trace, metric and log pipelines.
    pub fn resource(&self) -> Resource {
        let mut builder = Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attribute(KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            ));
        if let Some(command) = &self.command {
            builder = builder.with_attribute(KeyValue::new(COMMAND_KEY, command.clone()));
        }
        builder
            .with_attributes(self.attributes.iter().cloned())
            .with_attributes(batch_job_attributes())
            .build()
    }
}

fn batch_job_attributes() -> Vec<KeyValue> {
    BATCH_JOB_ENV
        .iter()
        .filter_map(|(var, key)| {
            let value = std::env::var(var).ok()?;
            Some(KeyValue::new(*key, value))
        })
        .collect()
}

/// The three OTLP pipelines of an exporting process.
struct Providers {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl Providers {
    fn build(endpoint: &str, resource: Resource) -> Result<Self> {
        use opentelemetry_otlp::WithExportConfig as _;

        let span_exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("span", e))?;
        let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("metric", e))?;
        let log_exporter = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("log", e))?;

        Ok(Self {
            tracer: SdkTracerProvider::builder()
                .with_batch_exporter(span_exporter)
                .with_resource(resource.clone())
                .build(),
            meter: SdkMeterProvider::builder()
                .with_periodic_exporter(metric_exporter)
                .with_resource(resource.clone())
                .build(),
            logger: SdkLoggerProvider::builder()
                .with_batch_exporter(log_exporter)
                .with_resource(resource)
                .build(),
        })
    }

    fn force_flush(&self) {
        let _ = self.tracer.force_flush();
        let _ = self.meter.force_flush();
        let _ = self.logger.force_flush();
    }

    /// Shut every pipeline down, then report the first that failed.
    fn shutdown(self) -> Result<()> {
        let results = [
            ("log", self.logger.shutdown()),
            ("metric", self.meter.shutdown()),
            ("trace", self.tracer.shutdown()),
        ];
        for (signal, result) in results {
            if let Err(e) = result {
                return Err(Error::Other(format!("{signal} pipeline shutdown failed: {e}")));
            }
        }
        Ok(())
    }
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

/// Owns the OTLP pipelines for one run.
///
/// Call [`shutdown`](Self::shutdown) when the run ends. Dropping the guard
/// also shuts down, but swallows export errors.
pub struct TelemetryGuard {
    providers: Option<Providers>,
}

impl TelemetryGuard {
    /// Whether OTLP export is active.
    pub fn is_exporting(&self) -> bool {
        self.providers.is_some()
    }

    /// Export whatever is buffered without ending the run.
    pub fn force_flush(&self) {
        if let Some(providers) = &self.providers {
            providers.force_flush();
        }
    }

    /// Flush and shut down every pipeline.
    pub fn shutdown(mut self) -> Result<()> {
        match self.providers.take() {
            Some(providers) => providers.shutdown(),
            None => Ok(()),
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(providers) = self.providers.take() {
            let _ = providers.shutdown();
        }
    }
}

/// Install the global subscriber, with OTLP export when an endpoint is set.
///
/// # Errors
///
/// Fails if an exporter cannot be built or a global subscriber is already
/// installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let console = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let Some(endpoint) = config.endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console)
            .try_init()
            .map_err(subscriber_error)?;
        return Ok(TelemetryGuard { providers: None });
    };

    let providers = Providers::build(endpoint, config.resource())?;
    opentelemetry::global::set_meter_provider(providers.meter.clone());
    let tracer = providers.tracer.tracer(env!("CARGO_PKG_NAME"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console.compact())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
            &providers.logger,
        ))
        .try_init()
        .map_err(subscriber_error)?;

    Ok(TelemetryGuard {
        providers: Some(providers),
    })
}

fn subscriber_error(e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to init tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_only_guard_shuts_down_cleanly() {
        let guard = TelemetryGuard { providers: None };
        assert!(!guard.is_exporting());
        guard.force_flush();
        guard.shutdown().unwrap();
    }

    #[test]
    fn config_builder_collects_attributes() {
        let config = TelemetryConfig::new("batchtrack", "info")
            .with_endpoint(Some("http://localhost:4317".to_string()))
            .with_command("dispatch")
            .with_stage(Stage::Parcellated);
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:4317"));
        assert_eq!(config.command.as_deref(), Some("dispatch"));
        assert_eq!(config.attributes.len(), 1);
    }
}
