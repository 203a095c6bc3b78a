//! Pipeline metrics.
//!
//! Instruments are created from the global OpenTelemetry meter and
//! exported through the Prometheus default registry, which the
//! webserver renders at `/metrics`. Without [`initialize_metrics`]
//! the global meter is a no-op, which is what tests run against.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::sdk::metrics::Aggregation;
use opentelemetry::sdk::metrics::Instrument;
use opentelemetry::sdk::metrics::MeterProvider;
use opentelemetry::sdk::metrics::Stream;
use opentelemetry::KeyValue;
use prometheus::default_registry;
use prometheus::Encoder;
use prometheus::TextEncoder;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;
use crate::pipeline::SourceEndpoint;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Route every [`PipelineMetrics`] instrument into the Prometheus
/// default registry under the `wordstream_` prefix.
///
/// Call once per process, before the first pipeline starts.
pub fn initialize_metrics() -> PipelineResult<()> {
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(default_registry().clone())
        .with_namespace("wordstream")
        .build()
        .map_err(|err| PipelineError::Config(format!("can't build metrics exporter: {err}")))?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                // Tick, checkpoint and append timings.
                Instrument::new().name("*_duration_seconds"),
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                    ],
                    record_min_max: true,
                }),
            )
            .map_err(|err| PipelineError::Config(format!("bad metrics view: {err}")))?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Everything in the default registry in the Prometheus text format.
pub fn render_metrics() -> PipelineResult<String> {
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&default_registry().gather(), &mut buf)
        .map_err(|err| PipelineError::Config(format!("can't encode metrics: {err}")))?;
    String::from_utf8(buf)
        .map_err(|err| PipelineError::Config(format!("metrics are not UTF-8: {err}")))
}

/// Instruments the tick loop records into.
pub(crate) struct PipelineMetrics {
    pub(crate) tick_count: Counter<u64>,
    pub(crate) line_inp_count: Counter<u64>,
    pub(crate) token_count: Counter<u64>,
    pub(crate) dropped_token_count: Counter<u64>,
    pub(crate) checkpoint_write_count: Counter<u64>,
    pub(crate) checkpoint_failure_count: Counter<u64>,
    pub(crate) tick_histogram: Histogram<f64>,
    pub(crate) checkpoint_histogram: Histogram<f64>,
    pub(crate) sink_histogram: Histogram<f64>,
    pub(crate) labels: Vec<KeyValue>,
}

impl PipelineMetrics {
    pub(crate) fn new(source: &SourceEndpoint) -> Self {
        let meter = global::meter("wordstream");
        Self {
            tick_count: meter
                .u64_counter("tick_count")
                .with_description("number of ticks completed")
                .init(),
            line_inp_count: meter
                .u64_counter("line_inp_count")
                .with_description("number of lines drained from the source")
                .init(),
            token_count: meter
                .u64_counter("token_count")
                .with_description("number of words added to the counts")
                .init(),
            dropped_token_count: meter
                .u64_counter("dropped_token_count")
                .with_description("number of stop words left out of the counts")
                .init(),
            checkpoint_write_count: meter
                .u64_counter("checkpoint_write_count")
                .with_description("number of checkpoints written")
                .init(),
            checkpoint_failure_count: meter
                .u64_counter("checkpoint_failure_count")
                .with_description("number of checkpoint writes that failed")
                .init(),
            tick_histogram: meter
                .f64_histogram("tick_duration_seconds")
                .with_description("whole tick duration in seconds")
                .init(),
            checkpoint_histogram: meter
                .f64_histogram("checkpoint_duration_seconds")
                .with_description("checkpoint write duration in seconds")
                .init(),
            sink_histogram: meter
                .f64_histogram("sink_append_duration_seconds")
                .with_description("output append duration in seconds")
                .init(),
            labels: vec![KeyValue::new("source", source.to_string())],
        }
    }
}
