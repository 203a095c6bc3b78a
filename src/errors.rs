//! Error kinds surfaced by the pipeline.
//!
//! Every fatal condition ends up as a [`PipelineError`]. Intermediate
//! layers add context with [`Reraise::reraise`], which records the
//! caller's source location the same way a traceback would, so the
//! final diagnostic printed by [`crate::run::cli_main`] reads as a
//! chain of "what we were doing" messages down to the root cause.

use std::panic::Location;

use thiserror::Error;

/// Process exit status for usage errors.
pub const EXIT_USAGE: i32 = 1;
/// Process exit status when the checkpoint can't be trusted.
pub const EXIT_CORRUPT_CHECKPOINT: i32 = 2;
/// Process exit status for every other fatal error.
pub const EXIT_FATAL: i32 = 3;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Wrong number of positional startup arguments.
    #[error("expected 4 arguments: <host> <port> <checkpoint location> <output>\n{usage}")]
    ArgumentCount { usage: String },

    /// A checkpoint exists but failed validation.
    ///
    /// Never recovered from; starting fresh would silently discard
    /// accumulated state.
    #[error("checkpoint at {location} is corrupt: {reason}")]
    CheckpointCorruption { location: String, reason: String },

    /// The source connector gave up.
    #[error("source {endpoint} is unavailable: {reason}")]
    SourceUnavailable { endpoint: String, reason: String },

    /// A durable append to the output target failed.
    #[error("error appending to output {target}")]
    SinkWrite {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// A durable checkpoint write failed.
    ///
    /// The scheduler logs this and carries on; only the replay window
    /// on the next recovery grows.
    #[error("error writing checkpoint to {location}: {reason}")]
    CheckpointWrite { location: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("({location}) {msg}")]
    Context {
        location: &'static Location<'static>,
        msg: String,
        #[source]
        source: Box<PipelineError>,
    },
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Peel off any [`PipelineError::Context`] wrapping.
    pub fn root(&self) -> &PipelineError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_checkpoint_corruption(&self) -> bool {
        matches!(self.root(), Self::CheckpointCorruption { .. })
    }

    /// Map to the process exit status.
    pub fn exit_code(&self) -> i32 {
        match self.root() {
            Self::ArgumentCount { .. } => EXIT_USAGE,
            Self::CheckpointCorruption { .. } => EXIT_CORRUPT_CHECKPOINT,
            _ => EXIT_FATAL,
        }
    }

    /// Render the full cause chain, one cause per line.
    pub fn report(&self) -> String {
        let mut msg = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(err) = cause {
            msg.push_str(&format!("\nCaused by => {err}"));
            cause = err.source();
        }
        msg
    }
}

/// Add a message and the caller's location to any error that can be
/// turned into a [`PipelineError`].
///
/// Example:
///     fs::create_dir_all(&dir).reraise("can't create checkpoint dir")?;
pub trait Reraise<T> {
    #[track_caller]
    fn reraise(self, msg: &str) -> PipelineResult<T>;

    #[track_caller]
    fn reraise_with(self, f: impl FnOnce() -> String) -> PipelineResult<T>;
}

impl<T, E> Reraise<T> for Result<T, E>
where
    E: Into<PipelineError>,
{
    #[track_caller]
    fn reraise(self, msg: &str) -> PipelineResult<T> {
        let location = Location::caller();
        self.map_err(|err| PipelineError::Context {
            location,
            msg: msg.to_string(),
            source: Box::new(err.into()),
        })
    }

    #[track_caller]
    fn reraise_with(self, f: impl FnOnce() -> String) -> PipelineResult<T> {
        let location = Location::caller();
        self.map_err(|err| PipelineError::Context {
            location,
            msg: f(),
            source: Box::new(err.into()),
        })
    }
}

/// Prepend the name of the current thread to each line.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

#[test]
fn reraise_keeps_root_kind() {
    let res: PipelineResult<()> = Err(PipelineError::CheckpointCorruption {
        location: "/tmp/ckpt".into(),
        reason: "checksum mismatch".into(),
    });
    let err = res.reraise("error recovering").unwrap_err();

    assert!(err.is_checkpoint_corruption());
    assert_eq!(err.exit_code(), EXIT_CORRUPT_CHECKPOINT);
    let report = err.report();
    assert!(report.contains("error recovering"));
    assert!(report.contains("errors.rs"));
    assert!(report.contains("Caused by => checkpoint at /tmp/ckpt is corrupt"));
}

#[test]
fn io_errors_are_fatal() {
    let res: Result<(), std::io::Error> = Err(std::io::Error::new(
        std::io::ErrorKind::PermissionDenied,
        "nope",
    ));
    let err = res.reraise_with(|| "can't open output".to_string()).unwrap_err();

    assert_eq!(err.exit_code(), EXIT_FATAL);
    assert!(!err.is_checkpoint_corruption());
}

#[test]
fn prepend_tname_prefixes_every_line() {
    let found = std::thread::Builder::new()
        .name("tick-loop".into())
        .spawn(|| prepend_tname("a\nb".to_string()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(found, "<tick-loop> a\n<tick-loop> b\n");
}
