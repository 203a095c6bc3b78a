use opentelemetry::runtime::Tokio;
use opentelemetry::sdk::trace::config;
use opentelemetry::sdk::trace::Sampler;
use opentelemetry::sdk::trace::Tracer;
use opentelemetry::sdk::Resource;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;

use super::TracerBuilder;

/// Export the `start`, `tick` and `socket_input` spans over OTLP/gRPC.
///
/// Set with `--otlp-url`; without it spans only reach the log.
#[derive(Debug, Clone, PartialEq)]
pub struct OtlpTracingConfig {
    /// `service.name` resource on every span.
    pub service_name: String,
    /// Collector endpoint. The exporter's own default when unset.
    pub url: Option<String>,
    /// Fraction of tick traces kept, from `--otlp-sampling-ratio`.
    pub sampling_ratio: f64,
}

impl OtlpTracingConfig {
    pub fn new(service_name: impl Into<String>, url: Option<String>, sampling_ratio: f64) -> Self {
        Self {
            service_name: service_name.into(),
            url,
            sampling_ratio,
        }
    }
}

impl TracerBuilder for OtlpTracingConfig {
    fn build(&self) -> PipelineResult<Tracer> {
        let exporter = match &self.url {
            Some(endpoint) => opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
            None => opentelemetry_otlp::new_exporter().tonic(),
        };

        opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(
                config()
                    .with_sampler(Sampler::TraceIdRatioBased(self.sampling_ratio))
                    .with_resource(Resource::new(vec![KeyValue::new(
                        "service.name",
                        self.service_name.clone(),
                    )])),
            )
            .install_batch(Tokio)
            .map_err(|err| {
                PipelineError::Config(format!(
                    "can't export spans to {}: {err}",
                    self.url.as_deref().unwrap_or("the default OTLP collector")
                ))
            })
    }
}
