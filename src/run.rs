//! Process entry point.
//!
//! [`cli_main`] parses arguments, sets up logging, metrics and the
//! tokio runtime, hands the pipeline to [`crate::worker::start`] and
//! ticks on the main thread until Ctrl-C. Every fatal error comes back
//! here to be printed and turned into an exit status.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::error::ContextKind;
use clap::error::ContextValue;
use clap::error::ErrorKind;
use clap::Parser;

use crate::clock::SystemClock;
use crate::errors::prepend_tname;
use crate::errors::PipelineError;
use crate::errors::PipelineResult;
use crate::errors::Reraise;
use crate::inputs::RetryPolicy;
use crate::inputs::SocketInputConfig;
use crate::metrics::initialize_metrics;
use crate::outputs::FileOutputConfig;
use crate::pipeline::CheckpointCadence;
use crate::pipeline::OutputTarget;
use crate::pipeline::PipelineConfig;
use crate::pipeline::SourceEndpoint;
use crate::pipeline::TickInterval;
use crate::recovery::SqliteCheckpointStore;
use crate::tracing::parse_log_level;
use crate::tracing::OtlpTracingConfig;
use crate::webserver::run_webserver;
use crate::worker;

/// Count words on a network text stream, surviving restarts.
///
/// Every tick, the words received since the previous tick are counted
/// and one line with their running totals is appended to OUTPUT.
/// State is checkpointed to CHECKPOINT_LOCATION; restarting with the
/// same location resumes where the last checkpoint left off.
#[derive(Parser, Debug)]
#[command(name = "wordstream", author, version, about, long_about = None)]
pub struct Cli {
    /// Host of the newline-delimited text source.
    pub host: String,

    /// Port of the text source.
    pub port: u16,

    /// Directory to keep checkpoints in. `file://` URIs are accepted.
    pub checkpoint_location: String,

    /// File to append counts to. `file://` URIs are accepted.
    pub output: String,

    /// Length of each tick in milliseconds.
    #[arg(long, env = "WORDSTREAM_TICK_INTERVAL_MS", default_value_t = 1000)]
    pub tick_interval_ms: u64,

    /// Write a checkpoint after every N ticks.
    #[arg(long, env = "WORDSTREAM_CHECKPOINT_EVERY", default_value_t = 1)]
    pub checkpoint_every: u64,

    /// Word to leave out of the counts. Repeat for more.
    #[arg(
        long = "stop-word",
        env = "WORDSTREAM_STOP_WORDS",
        value_delimiter = ','
    )]
    pub stop_words: Vec<String>,

    /// Give up on the source after this many failed connection attempts
    /// in a row.
    #[arg(long, env = "WORDSTREAM_SOURCE_RETRIES", default_value_t = 30)]
    pub source_retries: u32,

    /// Log level for this program. Overridden by a full filter in
    /// `WORDSTREAM_LOG`.
    #[arg(long, env = "WORDSTREAM_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Export spans to this OpenTelemetry collector (gRPC).
    #[arg(long, env = "WORDSTREAM_OTLP_URL")]
    pub otlp_url: Option<String>,

    /// Fraction of traces to export.
    #[arg(long, env = "WORDSTREAM_OTLP_SAMPLING_RATIO", default_value_t = 1.0)]
    pub otlp_sampling_ratio: f64,

    /// Serve `/pipeline` and `/metrics` on this port.
    #[arg(long, env = "WORDSTREAM_API_PORT")]
    pub api_port: Option<u16>,
}

/// Accept a plain path or a `file://` URI.
fn local_path(arg: &str) -> PipelineResult<PathBuf> {
    match arg.split_once("://") {
        None => Ok(PathBuf::from(arg)),
        Some(("file", path)) => Ok(PathBuf::from(path)),
        Some((scheme, _)) => Err(PipelineError::Config(format!(
            "unsupported URI scheme {scheme:?} in {arg:?}; only local paths are supported"
        ))),
    }
}

impl Cli {
    pub fn pipeline_config(&self) -> PipelineResult<PipelineConfig> {
        let tick_interval = TickInterval::new(Duration::from_millis(self.tick_interval_ms))?;
        let cadence = CheckpointCadence::every(self.checkpoint_every)?;
        Ok(PipelineConfig::new(
            SourceEndpoint::new(self.host.clone(), self.port),
            local_path(&self.checkpoint_location)?,
            OutputTarget::new(local_path(&self.output)?),
        )
        .with_tick_interval(tick_interval)
        .with_checkpoint_cadence(cadence)
        .with_stop_words(self.stop_words.iter().cloned()))
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.source_retries,
            ..RetryPolicy::default()
        }
    }

    fn otlp(&self) -> Option<OtlpTracingConfig> {
        self.otlp_url.as_ref().map(|url| {
            OtlpTracingConfig::new("wordstream", Some(url.clone()), self.otlp_sampling_ratio)
        })
    }
}

/// Main entry point; returns the process exit status.
pub fn cli_main() -> i32 {
    cli_main_from(std::env::args_os())
}

pub fn cli_main_from<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => return usage_error(err),
    };

    let interrupt = Arc::new(AtomicBool::new(false));
    install_panic_hook(interrupt.clone());

    match run_main(cli, interrupt) {
        Ok(()) => 0,
        Err(err) => {
            eprint!("{}", prepend_tname(err.report()));
            err.exit_code()
        }
    }
}

fn usage_error(err: clap::Error) -> i32 {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            // Goes to stdout.
            let _ = err.print();
            0
        }
        ErrorKind::UnknownArgument if is_flag(&err) => {
            let _ = err.print();
            crate::errors::EXIT_USAGE
        }
        ErrorKind::MissingRequiredArgument | ErrorKind::UnknownArgument => {
            let err = PipelineError::ArgumentCount {
                usage: err.render().to_string(),
            };
            eprintln!("{err}");
            err.exit_code()
        }
        _ => {
            let _ = err.print();
            crate::errors::EXIT_USAGE
        }
    }
}

/// Did clap reject a `--flag` rather than an extra positional?
fn is_flag(err: &clap::Error) -> bool {
    matches!(
        err.get(ContextKind::InvalidArg),
        Some(ContextValue::String(arg)) if arg.starts_with('-')
    )
}

/// Print panics with the thread name and ask the tick loop to stop.
fn install_panic_hook(interrupt: Arc<AtomicBool>) {
    std::panic::set_hook(Box::new(move |info| {
        interrupt.store(true, Ordering::Relaxed);
        let msg = if let Some(msg) = info.payload().downcast_ref::<String>() {
            msg.clone()
        } else if let Some(msg) = info.payload().downcast_ref::<&str>() {
            msg.to_string()
        } else {
            format!("{info}")
        };
        let location = info
            .location()
            .map(|loc| format!(" ({loc})"))
            .unwrap_or_default();
        let msg = prepend_tname(format!("panic{location}: {msg}"));
        // Write in one go so lines from different threads don't
        // interleave.
        let mut stderr = std::io::stderr().lock();
        std::io::Write::write_all(&mut stderr, msg.as_bytes())
            .unwrap_or_else(|err| eprintln!("Error printing error (that's not good): {err}"));
    }));
}

fn run_main(cli: Cli, interrupt: Arc<AtomicBool>) -> PipelineResult<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("wordstream-io")
        .build()
        .reraise("error building tokio runtime")?;
    // The span exporter and socket reader spawn onto this runtime.
    let _guard = rt.enter();

    let level = parse_log_level(&cli.log_level)?;
    crate::tracing::setup(level, cli.otlp().as_ref())?;
    initialize_metrics().reraise("error initializing metrics")?;

    let config = cli.pipeline_config()?;
    tracing::info!("Starting {config:?}");

    let interrupt_l = interrupt.clone();
    rt.spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupted; stopping after the current tick");
                interrupt_l.store(true, Ordering::Relaxed);
            }
            Err(err) => tracing::warn!("Can't listen for Ctrl-C: {err}"),
        }
    });

    let inputs = SocketInputConfig::new(rt.handle().clone(), cli.retry_policy());
    let store = SqliteCheckpointStore::new(config.checkpoint_location());
    let pipeline = worker::start(
        config,
        Box::new(store),
        &inputs,
        &FileOutputConfig::new(),
        Box::new(SystemClock::new()),
    )
    .reraise("error starting pipeline")?;

    if let Some(port) = cli.api_port {
        let bound = pipeline.config().clone();
        rt.spawn(async move {
            if let Err(err) = run_webserver(bound, port).await {
                tracing::error!("{}", err.report());
            }
        });
    }

    let res = pipeline.run(|| interrupt.load(Ordering::Relaxed));
    crate::tracing::shutdown();
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("wordstream").chain(args.iter().copied()))
    }

    #[test]
    fn four_positional_args() {
        let cli = parse(&["localhost", "9999", "/tmp/ckpt", "file:///tmp/out.txt"]).unwrap();
        let config = cli.pipeline_config().unwrap();
        assert_eq!(config.source(), &SourceEndpoint::new("localhost", 9999));
        assert_eq!(config.checkpoint_location(), PathBuf::from("/tmp/ckpt"));
        assert_eq!(config.output(), &OutputTarget::new("/tmp/out.txt"));
        assert_eq!(config.tick_interval(), TickInterval::default());
        assert_eq!(cli.retry_policy().max_attempts, 30);
    }

    #[test]
    fn wrong_arg_count_is_usage_error() {
        let err = parse(&["localhost", "9999", "/tmp/ckpt"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert_eq!(usage_error(err), crate::errors::EXIT_USAGE);

        let err = parse(&["localhost", "9999", "/tmp/ckpt", "/tmp/out", "extra"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
        assert_eq!(usage_error(err), crate::errors::EXIT_USAGE);

        assert_eq!(cli_main_from(["wordstream"]), crate::errors::EXIT_USAGE);
    }

    #[test]
    fn unknown_flag_is_not_extra_positional() {
        let err = parse(&["localhost", "9999", "/tmp/ckpt", "/tmp/out", "extra"]).unwrap_err();
        assert!(!is_flag(&err));

        let err = parse(&["localhost", "9999", "/tmp/ckpt", "/tmp/out", "--bogus"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
        assert!(is_flag(&err));
        assert_eq!(usage_error(err), crate::errors::EXIT_USAGE);
    }

    #[test]
    fn bad_port_is_usage_error() {
        let err = parse(&["localhost", "http", "/tmp/ckpt", "/tmp/out"]).unwrap_err();
        assert_eq!(usage_error(err), crate::errors::EXIT_USAGE);
    }

    #[test]
    fn help_exits_zero() {
        assert_eq!(cli_main_from(["wordstream", "--help"]), 0);
    }

    #[test]
    fn knobs() {
        let cli = parse(&[
            "localhost",
            "9999",
            "/tmp/ckpt",
            "/tmp/out",
            "--tick-interval-ms",
            "250",
            "--checkpoint-every",
            "5",
            "--stop-word",
            "the",
            "--stop-word",
            "a,an",
        ])
        .unwrap();
        let config = cli.pipeline_config().unwrap();
        assert_eq!(
            config.tick_interval().duration(),
            Duration::from_millis(250)
        );
        assert_eq!(config.checkpoint_cadence().ticks(), 5);
        let stop: Vec<&str> = config.stop_words().iter().map(String::as_str).collect();
        assert_eq!(stop, vec!["a", "an", "the"]);
    }

    #[test]
    fn invalid_knobs_are_config_errors() {
        let cli = parse(&[
            "localhost",
            "9999",
            "/tmp/ckpt",
            "/tmp/out",
            "--tick-interval-ms",
            "0",
        ])
        .unwrap();
        assert!(matches!(
            cli.pipeline_config(),
            Err(PipelineError::Config(_))
        ));

        let cli = parse(&["localhost", "9999", "hdfs://nn/ckpt", "/tmp/out"]).unwrap();
        assert!(matches!(
            cli.pipeline_config(),
            Err(PipelineError::Config(_))
        ));
    }
}
