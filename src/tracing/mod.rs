//! Internal code for tracing/logging.
//!
//! Logging to stderr is always enabled. The level comes from the
//! `WORDSTREAM_LOG` env var as an [`EnvFilter`] directive if set,
//! otherwise from the configured level applied to this crate only.
//!
//! Span export is optional. Each tracing backend implements
//! [`TracerBuilder`]; currently only the OpenTelemetry collector is
//! supported.

use opentelemetry::sdk::trace::Tracer;
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;

pub mod otlp_tracing;

pub use otlp_tracing::OtlpTracingConfig;

/// Env var holding a full filter directive, e.g.
/// `wordstream=debug,rusqlite=warn`.
pub const LOG_ENV_VAR: &str = "WORDSTREAM_LOG";

/// Trait that all the tracing configs implement.
/// This function should just return the proper `Tracer` for the backend.
trait TracerBuilder {
    fn build(&self) -> PipelineResult<Tracer>;
}

pub fn parse_log_level(level: &str) -> PipelineResult<LevelFilter> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        "off" => Ok(LevelFilter::OFF),
        level => Err(PipelineError::Config(format!("wrong log level: {level}"))),
    }
}

fn log_filter(level: LevelFilter) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(format!("wordstream={level}")))
}

/// Install the global subscriber.
///
/// Must be called from within a tokio runtime context if `otlp` is
/// set, since the span exporter runs as a background task.
pub fn setup(level: LevelFilter, otlp: Option<&OtlpTracingConfig>) -> PipelineResult<()> {
    let logs = tracing_subscriber::fmt::Layer::default()
        .with_writer(std::io::stderr)
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true)
        .with_filter(log_filter(level));

    if let Some(conf) = otlp {
        let tracer = conf.build()?;
        let telemetry = tracing_opentelemetry::layer()
            .with_tracer(tracer)
            // Send all traces from this crate
            .with_filter(Targets::new().with_target("wordstream", LevelFilter::TRACE));
        set_global_subscriber(Registry::default().with(logs).with(telemetry));
    } else {
        set_global_subscriber(Registry::default().with(logs));
    }
    Ok(())
}

/// Flush any spans still waiting to be exported.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if tracing was already initialized, e.g. when
    // running more than one pipeline in the same process.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse() {
    assert_eq!(parse_log_level("INFO").unwrap(), LevelFilter::INFO);
    assert_eq!(parse_log_level("trace").unwrap(), LevelFilter::TRACE);
    assert!(parse_log_level("loud").is_err());
}
