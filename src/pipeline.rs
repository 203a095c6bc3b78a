//! The pipeline definition.
//!
//! A [`PipelineConfig`] is the whole "blueprint" of a running
//! pipeline: where lines come from, where rendered counts go, where
//! checkpoints live and how often ticks fire. It is built once at
//! startup and never mutated afterwards; it is also embedded in every
//! checkpoint so a recovered run binds to the same source and output
//! as the run that wrote it.

use std::collections::BTreeSet;
use std::fmt;
use std::num::NonZeroU64;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;

/// Network address of the line-oriented text source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceEndpoint {
    pub host: String,
    pub port: u16,
}

impl SourceEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for SourceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Path of the append-only output file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputTarget(PathBuf);

impl OutputTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Wall-clock length of each tick.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickInterval(Duration);

impl TickInterval {
    pub fn new(dur: Duration) -> PipelineResult<Self> {
        if dur.is_zero() {
            Err(PipelineError::Config(
                "tick interval must be a positive duration".to_string(),
            ))
        } else {
            Ok(Self(dur))
        }
    }

    pub fn duration(&self) -> Duration {
        self.0
    }
}

impl Default for TickInterval {
    fn default() -> Self {
        Self(Duration::from_secs(1))
    }
}

/// Write a checkpoint after every N completed ticks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointCadence(NonZeroU64);

impl CheckpointCadence {
    pub fn every(ticks: u64) -> PipelineResult<Self> {
        NonZeroU64::new(ticks)
            .map(Self)
            .ok_or_else(|| PipelineError::Config("checkpoint cadence must be at least 1".into()))
    }

    /// Is a checkpoint due after `completed` ticks in this execution?
    pub fn is_due(&self, completed: u64) -> bool {
        completed % self.0.get() == 0
    }

    pub fn ticks(&self) -> u64 {
        self.0.get()
    }
}

impl Default for CheckpointCadence {
    fn default() -> Self {
        Self(NonZeroU64::MIN)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    source: SourceEndpoint,
    checkpoint_location: PathBuf,
    output: OutputTarget,
    tick_interval: TickInterval,
    checkpoint_cadence: CheckpointCadence,
    stop_words: BTreeSet<String>,
}

impl PipelineConfig {
    pub fn new(
        source: SourceEndpoint,
        checkpoint_location: impl Into<PathBuf>,
        output: OutputTarget,
    ) -> Self {
        Self {
            source,
            checkpoint_location: checkpoint_location.into(),
            output,
            tick_interval: TickInterval::default(),
            checkpoint_cadence: CheckpointCadence::default(),
            stop_words: BTreeSet::new(),
        }
    }

    pub fn with_tick_interval(mut self, tick_interval: TickInterval) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_checkpoint_cadence(mut self, cadence: CheckpointCadence) -> Self {
        self.checkpoint_cadence = cadence;
        self
    }

    pub fn with_stop_words<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_words = words.into_iter().map(Into::into).collect();
        self
    }

    /// Take the source and output bindings from a previously
    /// checkpointed config, keeping this config's scheduling knobs.
    pub(crate) fn rebound_to(&self, previous: &PipelineConfig) -> Self {
        Self {
            source: previous.source.clone(),
            output: previous.output.clone(),
            ..self.clone()
        }
    }

    pub fn source(&self) -> &SourceEndpoint {
        &self.source
    }

    pub fn checkpoint_location(&self) -> &Path {
        &self.checkpoint_location
    }

    pub fn output(&self) -> &OutputTarget {
        &self.output
    }

    pub fn tick_interval(&self) -> TickInterval {
        self.tick_interval
    }

    pub fn checkpoint_cadence(&self) -> CheckpointCadence {
        self.checkpoint_cadence
    }

    pub fn stop_words(&self) -> &BTreeSet<String> {
        &self.stop_words
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_test::assert_tokens;
    use serde_test::Token;

    #[test]
    fn endpoint_serde() {
        let endpoint = SourceEndpoint::new("localhost", 9999);
        assert_tokens(
            &endpoint,
            &[
                Token::Struct {
                    name: "SourceEndpoint",
                    len: 2,
                },
                Token::Str("host"),
                Token::Str("localhost"),
                Token::Str("port"),
                Token::U16(9999),
                Token::StructEnd,
            ],
        );
        assert_eq!(endpoint.to_string(), "localhost:9999");
    }

    #[test]
    fn zero_tick_interval_rejected() {
        assert!(TickInterval::new(Duration::ZERO).is_err());
        assert_eq!(
            TickInterval::new(Duration::from_millis(250))
                .unwrap()
                .duration(),
            Duration::from_millis(250)
        );
        assert_eq!(TickInterval::default().duration(), Duration::from_secs(1));
    }

    #[test]
    fn cadence() {
        assert!(CheckpointCadence::every(0).is_err());

        let every_tick = CheckpointCadence::default();
        assert!((1..5).all(|n| every_tick.is_due(n)));

        let every_third = CheckpointCadence::every(3).unwrap();
        let due: Vec<u64> = (1..10).filter(|n| every_third.is_due(*n)).collect();
        assert_eq!(due, vec![3, 6, 9]);
    }

    #[test]
    fn rebound_keeps_knobs() {
        let old = PipelineConfig::new(
            SourceEndpoint::new("old-host", 1),
            "/ckpt",
            OutputTarget::new("/old.txt"),
        );
        let new = PipelineConfig::new(
            SourceEndpoint::new("new-host", 2),
            "/ckpt",
            OutputTarget::new("/new.txt"),
        )
        .with_checkpoint_cadence(CheckpointCadence::every(5).unwrap())
        .with_stop_words(["the"]);

        let found = new.rebound_to(&old);
        assert_eq!(found.source(), old.source());
        assert_eq!(found.output(), old.output());
        assert_eq!(found.checkpoint_cadence().ticks(), 5);
        assert!(found.stop_words().contains("the"));
    }
}
