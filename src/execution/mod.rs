//! The tick loop.
//!
//! [`BatchScheduler`] owns every moving part of a running pipeline and
//! drives them one tick at a time. Each tick runs to completion before
//! the next one's input is drained:
//!
//! 1. Drain all lines the source buffered since the last boundary.
//! 2. Fold them into the [`AggregationState`].
//! 3. Write a checkpoint if the cadence says one is due.
//! 4. Durably append the tick's rendering to the output.
//!
//! The checkpoint carries the completed tick's snapshot, so a crash
//! between 3 and 4 is covered by the recovery controller re-emitting
//! that tick. Ticks are never skipped: if the loop falls behind the
//! wall clock, the next tick starts immediately.

use std::fmt;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use opentelemetry::KeyValue;
use serde::Deserialize;
use serde::Serialize;

use crate::clock::Clock;
use crate::errors::PipelineError;
use crate::errors::PipelineResult;
use crate::inputs::InputReader;
use crate::inputs::SourceError;
use crate::metrics::PipelineMetrics;
use crate::operators::tokens;
use crate::operators::AggregationState;
use crate::operators::Snapshot;
use crate::operators::WordCount;
use crate::outputs::OutputWriter;
use crate::pipeline::PipelineConfig;
use crate::recovery::CheckpointRecord;
use crate::recovery::CheckpointStore;
use crate::with_timer;

/// Longest single sleep while waiting for a tick boundary. The
/// interrupt is checked between slices.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Logical index of a tick. The first tick of a fresh pipeline is 0.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TickIndex(pub u64);

impl TickIndex {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TickIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One tick's worth of drained input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    pub index: TickIndex,
    pub timestamp: DateTime<Utc>,
    pub lines: Vec<String>,
}

/// A tick after aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedTick {
    pub index: TickIndex,
    pub timestamp: DateTime<Utc>,
    pub snapshot: Snapshot,
}

/// Drives ticks over one source, output and checkpoint store.
///
/// Built by [`crate::worker::start`], which decides the starting
/// state and tick.
pub struct BatchScheduler {
    config: PipelineConfig,
    logic: WordCount,
    state: AggregationState,
    next_tick: TickIndex,
    last_tick: Option<CompletedTick>,
    /// Boundary at which the previous tick was cut.
    last_boundary: DateTime<Utc>,
    /// Ticks completed by this process.
    completed: u64,
    input: Box<dyn InputReader>,
    output: Box<dyn OutputWriter>,
    store: Box<dyn CheckpointStore>,
    clock: Box<dyn Clock>,
    metrics: PipelineMetrics,
}

impl BatchScheduler {
    pub(crate) fn new(
        config: PipelineConfig,
        state: AggregationState,
        last_tick: Option<CompletedTick>,
        input: Box<dyn InputReader>,
        output: Box<dyn OutputWriter>,
        store: Box<dyn CheckpointStore>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let next_tick = last_tick
            .as_ref()
            .map(|tick| tick.index.next())
            .unwrap_or_default();
        let last_boundary = clock.now();
        let logic = WordCount::new(config.stop_words().clone());
        let metrics = PipelineMetrics::new(config.source());
        Self {
            config,
            logic,
            state,
            next_tick,
            last_tick,
            last_boundary,
            completed: 0,
            input,
            output,
            store,
            clock,
            metrics,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> &AggregationState {
        &self.state
    }

    pub fn next_tick(&self) -> TickIndex {
        self.next_tick
    }

    pub fn last_tick(&self) -> Option<&CompletedTick> {
        self.last_tick.as_ref()
    }

    /// Tick every interval until `interrupt` returns `true`, then
    /// write a final checkpoint.
    ///
    /// An in-flight tick always finishes. Returns early only on a
    /// fatal error, in which case no final checkpoint is attempted.
    pub fn run(&mut self, interrupt: impl Fn() -> bool) -> PipelineResult<()> {
        tracing::info!("Tick loop start at tick {}", self.next_tick);
        let interval = chrono::Duration::from_std(self.config.tick_interval().duration())
            .map_err(|err| PipelineError::Config(format!("tick interval out of range: {err}")))?;

        let mut boundary = self.clock.now() + interval;
        while !interrupt() {
            if !self.wait_until(boundary, &interrupt) {
                break;
            }
            self.step(boundary)?;
            boundary = boundary + interval;
        }

        self.shutdown();
        tracing::info!("Tick loop stop before tick {}", self.next_tick);
        Ok(())
    }

    /// Sleep until `boundary`. Returns `false` if interrupted first.
    fn wait_until(&mut self, boundary: DateTime<Utc>, interrupt: &impl Fn() -> bool) -> bool {
        loop {
            // Negative means we're behind; tick right away.
            let remaining = match (boundary - self.clock.now()).to_std() {
                Ok(remaining) if !remaining.is_zero() => remaining,
                _ => return true,
            };
            if interrupt() {
                return false;
            }
            self.clock.sleep(remaining.min(WAIT_SLICE));
        }
    }

    /// Run a single tick cut at `timestamp`.
    #[tracing::instrument(name = "tick", skip_all, fields(tick = %self.next_tick))]
    pub fn step(&mut self, timestamp: DateTime<Utc>) -> PipelineResult<()> {
        let index = self.next_tick;
        let labels = self.metrics.labels.clone();
        with_timer!(self.metrics.tick_histogram, labels, {
            let lines = self.drain(index)?;
            let tick = Tick {
                index,
                timestamp,
                lines,
            };
            let completed = self.aggregate(tick);
            self.completed += 1;

            if self.config.checkpoint_cadence().is_due(self.completed) {
                self.checkpoint();
            }

            with_timer!(
                self.metrics.sink_histogram,
                labels,
                self.output.append(&completed.snapshot, completed.timestamp)
            )?;

            tracing::info!("Dropped {} word(s) totally", self.state.dropped());
            self.metrics.tick_count.add(1, &labels);
            self.last_boundary = timestamp;
            self.next_tick = index.next();
            Ok(())
        })
    }

    fn drain(&mut self, index: TickIndex) -> PipelineResult<Vec<String>> {
        match self.input.next_batch(self.last_boundary) {
            Ok(lines) => {
                tracing::debug!("Drained {} line(s)", lines.len());
                Ok(lines)
            }
            Err(SourceError::Transient(reason)) => {
                tracing::warn!("Source not ready, tick {index} has no input: {reason}");
                Ok(Vec::new())
            }
            Err(SourceError::Unavailable(reason)) => Err(PipelineError::SourceUnavailable {
                endpoint: self.config.source().to_string(),
                reason,
            }),
        }
    }

    fn aggregate(&mut self, tick: Tick) -> CompletedTick {
        let Tick {
            index,
            timestamp,
            lines,
        } = tick;
        let seen: usize = lines.iter().map(|line| tokens(line).count()).sum();
        let state = std::mem::take(&mut self.state);
        let dropped_before = state.dropped();
        let (state, snapshot) = self.logic.apply(state, &lines);
        let dropped = state.dropped() - dropped_before;
        self.state = state;

        self.metrics
            .line_inp_count
            .add(lines.len() as u64, &self.metrics.labels);
        self.metrics
            .token_count
            .add(seen as u64 - dropped, &self.metrics.labels);
        self.metrics
            .dropped_token_count
            .add(dropped, &self.metrics.labels);

        let completed = CompletedTick {
            index,
            timestamp,
            snapshot,
        };
        self.last_tick = Some(completed.clone());
        completed
    }

    /// Write a checkpoint of everything completed so far.
    ///
    /// Failure is logged and counted, never returned: a missed
    /// checkpoint only means more ticks get replayed on recovery.
    fn checkpoint(&mut self) {
        let record = CheckpointRecord::new(
            self.config.clone(),
            self.state.clone(),
            self.last_tick.clone(),
            self.clock.now(),
        );
        let res = with_timer!(
            self.metrics.checkpoint_histogram,
            self.metrics.labels,
            self.store.write(&record)
        );
        match res {
            Ok(()) => {
                tracing::debug!(
                    "Checkpointed through tick {:?} to {}",
                    record.last_tick.as_ref().map(|tick| tick.index),
                    self.store.location()
                );
                self.metrics
                    .checkpoint_write_count
                    .add(1, &self.metrics.labels);
            }
            Err(err) => {
                tracing::warn!("Continuing without checkpoint: {}", err.report());
                let mut labels = self.metrics.labels.clone();
                labels.push(KeyValue::new("location", self.store.location()));
                self.metrics.checkpoint_failure_count.add(1, &labels);
            }
        }
    }

    /// Best-effort final checkpoint.
    pub fn shutdown(&mut self) {
        tracing::info!("Writing final checkpoint");
        self.checkpoint();
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::clock::TestingClock;
    use crate::inputs::InputBuilder;
    use crate::inputs::TestingInputConfig;
    use crate::outputs::OutputBuilder;
    use crate::outputs::TestingOutputConfig;
    use crate::pipeline::CheckpointCadence;
    use crate::pipeline::OutputTarget;
    use crate::pipeline::SourceEndpoint;
    use crate::recovery::CheckpointRead;
    use crate::recovery::InMemCheckpointStore;

    struct Harness {
        input: TestingInputConfig,
        output: TestingOutputConfig,
        store: InMemCheckpointStore,
        clock: TestingClock,
    }

    fn start() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_357_008_430_000).unwrap()
    }

    fn config() -> PipelineConfig {
        PipelineConfig::new(
            SourceEndpoint::new("localhost", 9999),
            "/tmp/ckpt",
            OutputTarget::new("/tmp/out.txt"),
        )
    }

    impl Harness {
        fn new() -> Self {
            Self {
                input: TestingInputConfig::new(),
                output: TestingOutputConfig::new(),
                store: InMemCheckpointStore::new(),
                clock: TestingClock::new(start()),
            }
        }

        fn scheduler(&self, config: PipelineConfig) -> BatchScheduler {
            BatchScheduler::new(
                config.clone(),
                AggregationState::new(),
                None,
                self.input.build(config.source()).unwrap(),
                self.output.build(config.output()).unwrap(),
                Box::new(self.store.clone()),
                Box::new(self.clock.clone()),
            )
        }

        fn checkpointed(&self) -> CheckpointRecord {
            match self.store.read() {
                CheckpointRead::Present(record) => record,
                other => panic!("expected a checkpoint, found {other:?}"),
            }
        }
    }

    #[test]
    fn two_ticks() {
        let h = Harness::new();
        h.input.push_batch(["a b a"]);
        h.input.push_batch(["b c"]);
        let mut scheduler = h.scheduler(config());

        scheduler.step(start()).unwrap();
        scheduler
            .step(start() + chrono::Duration::seconds(1))
            .unwrap();

        assert_eq!(
            h.output.lines(),
            vec![
                "Counts at time 1357008430000 ms [a: 2, b: 1]",
                "Counts at time 1357008431000 ms [b: 2, c: 1]",
            ]
        );
        assert_eq!(
            scheduler.state(),
            &AggregationState::from_iter([("a", 2), ("b", 2), ("c", 1)])
        );
        assert_eq!(scheduler.next_tick(), TickIndex(2));

        let record = h.checkpointed();
        assert_eq!(&record.state, scheduler.state());
        assert_eq!(record.last_tick.unwrap().index, TickIndex(1));
    }

    #[test]
    fn empty_tick_renders() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(config());

        scheduler.step(start()).unwrap();
        assert_eq!(h.output.lines(), vec!["Counts at time 1357008430000 ms []"]);
    }

    #[test]
    fn transient_source_error_is_empty_tick() {
        let h = Harness::new();
        h.input
            .push_error(SourceError::Transient("reconnecting".into()));
        h.input.push_batch(["a"]);
        let mut scheduler = h.scheduler(config());

        scheduler.step(start()).unwrap();
        scheduler.step(start()).unwrap();
        assert_eq!(h.output.lines().len(), 2);
        assert_eq!(scheduler.state().get("a"), Some(1));
    }

    #[test]
    fn unavailable_source_is_fatal() {
        let h = Harness::new();
        h.input
            .push_error(SourceError::Unavailable("refused".into()));
        let mut scheduler = h.scheduler(config());

        let err = scheduler.step(start()).unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
        assert!(h.output.lines().is_empty());
        assert_eq!(scheduler.next_tick(), TickIndex(0));
    }

    #[test]
    fn sink_error_is_fatal() {
        let h = Harness::new();
        h.input.push_batch(["a"]);
        h.output.fail_appends(true);
        let mut scheduler = h.scheduler(config());

        let err = scheduler.step(start()).unwrap_err();
        assert!(matches!(err, PipelineError::SinkWrite { .. }));
        // Checkpoint went first, so the tick can be re-emitted.
        assert_eq!(h.checkpointed().last_tick.unwrap().index, TickIndex(0));
    }

    #[test]
    fn checkpoint_failure_is_not_fatal() {
        let h = Harness::new();
        h.input.push_batch(["a"]);
        h.store.fail_writes(true);
        let mut scheduler = h.scheduler(config());

        scheduler.step(start()).unwrap();
        assert_eq!(h.output.lines().len(), 1);
        assert_eq!(h.store.read(), CheckpointRead::Absent);
    }

    #[test]
    fn cadence_skips_checkpoints() {
        let h = Harness::new();
        let mut scheduler =
            h.scheduler(config().with_checkpoint_cadence(CheckpointCadence::every(3).unwrap()));

        scheduler.step(start()).unwrap();
        scheduler.step(start()).unwrap();
        assert_eq!(h.store.writes(), 0);
        scheduler.step(start()).unwrap();
        assert_eq!(h.store.writes(), 1);
        assert_eq!(h.checkpointed().last_tick.unwrap().index, TickIndex(2));
    }

    #[test]
    fn run_ticks_on_boundaries_until_interrupted() {
        let h = Harness::new();
        h.input.push_batch(["a"]);
        h.input.push_batch(["a b"]);
        let mut scheduler = h.scheduler(config());

        let output = h.output.clone();
        scheduler.run(|| output.lines().len() >= 3).unwrap();

        assert_eq!(
            h.output.lines(),
            vec![
                "Counts at time 1357008431000 ms [a: 1]",
                "Counts at time 1357008432000 ms [a: 2, b: 1]",
                "Counts at time 1357008433000 ms []",
            ]
        );
        // Final checkpoint covers the last tick.
        assert_eq!(h.checkpointed().last_tick.unwrap().index, TickIndex(2));
    }

    #[test]
    fn falling_behind_does_not_skip_ticks() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(config());

        // Stall for several intervals before the loop even starts
        // waiting; every missed boundary still gets its own tick.
        let clock = h.clock.clone();
        let output = h.output.clone();
        let stalled = std::cell::Cell::new(false);
        scheduler
            .run(|| {
                if !stalled.replace(true) {
                    clock.advance(Duration::from_secs(5));
                }
                output.lines().len() >= 4
            })
            .unwrap();

        let times: Vec<String> = h.output.lines();
        assert_eq!(
            times,
            vec![
                "Counts at time 1357008431000 ms []",
                "Counts at time 1357008432000 ms []",
                "Counts at time 1357008433000 ms []",
                "Counts at time 1357008434000 ms []",
            ]
        );
    }

    #[test]
    fn interrupt_before_first_boundary_still_checkpoints() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(config());

        scheduler.run(|| true).unwrap();
        assert!(h.output.lines().is_empty());
        assert_eq!(h.checkpointed().last_tick, None);
    }
}
