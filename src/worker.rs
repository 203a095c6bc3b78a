//! Starting or resuming a pipeline.
//!
//! [`start`] is the only place that decides between a fresh pipeline
//! and a recovered one. That decision is made once, from the
//! [`CheckpointRead`] of the configured store:
//!
//! - Absent: empty state, first tick 0, stale output cleared.
//! - Present: restored state, next tick after the checkpointed one,
//!   output kept and the checkpointed tick re-emitted.
//! - Corrupt: refuse to start.

use tracing::instrument;

use crate::clock::Clock;
use crate::errors::PipelineError;
use crate::errors::PipelineResult;
use crate::errors::Reraise;
use crate::execution::BatchScheduler;
use crate::execution::TickIndex;
use crate::inputs::InputBuilder;
use crate::operators::AggregationState;
use crate::outputs::OutputBuilder;
use crate::pipeline::PipelineConfig;
use crate::recovery::CheckpointRead;
use crate::recovery::CheckpointRecord;
use crate::recovery::CheckpointStore;

/// A pipeline that's ready to tick.
pub struct RunningPipeline {
    scheduler: BatchScheduler,
    recovered: bool,
}

impl RunningPipeline {
    /// Was this resumed from a checkpoint?
    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    /// Config actually bound; on recovery the source and output come
    /// from the checkpoint.
    pub fn config(&self) -> &PipelineConfig {
        self.scheduler.config()
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut BatchScheduler {
        &mut self.scheduler
    }

    /// Tick until `interrupt` returns `true`.
    pub fn run(mut self, interrupt: impl Fn() -> bool) -> PipelineResult<()> {
        self.scheduler.run(interrupt)
    }
}

/// Build a fresh or recovered pipeline for `config`.
#[instrument(name = "start", skip_all, fields(checkpoint = %store.location()))]
pub fn start(
    config: PipelineConfig,
    store: Box<dyn CheckpointStore>,
    inputs: &dyn InputBuilder,
    outputs: &dyn OutputBuilder,
    clock: Box<dyn Clock>,
) -> PipelineResult<RunningPipeline> {
    match store.read() {
        CheckpointRead::Absent => create(config, store, inputs, outputs, clock),
        CheckpointRead::Present(record) => resume(config, record, store, inputs, outputs, clock),
        CheckpointRead::Corrupt(reason) => Err(PipelineError::CheckpointCorruption {
            location: store.location(),
            reason,
        }),
    }
}

fn create(
    config: PipelineConfig,
    store: Box<dyn CheckpointStore>,
    inputs: &dyn InputBuilder,
    outputs: &dyn OutputBuilder,
    clock: Box<dyn Clock>,
) -> PipelineResult<RunningPipeline> {
    let mut output = outputs
        .build(config.output())
        .reraise("error building output")?;
    output
        .reset()
        .reraise_with(|| format!("error clearing stale output {}", config.output()))?;
    let input = inputs
        .build(config.source())
        .reraise("error building input")?;

    tracing::info!("No checkpoint found; new pipeline created");
    let scheduler = BatchScheduler::new(
        config,
        AggregationState::new(),
        None,
        input,
        output,
        store,
        clock,
    );
    Ok(RunningPipeline {
        scheduler,
        recovered: false,
    })
}

fn resume(
    config: PipelineConfig,
    record: CheckpointRecord,
    store: Box<dyn CheckpointStore>,
    inputs: &dyn InputBuilder,
    outputs: &dyn OutputBuilder,
    clock: Box<dyn Clock>,
) -> PipelineResult<RunningPipeline> {
    let bound = config.rebound_to(&record.config);
    if bound.source() != config.source() {
        tracing::warn!(
            "Checkpoint was taken reading from {}; ignoring configured source {}",
            bound.source(),
            config.source()
        );
    }
    if bound.output() != config.output() {
        tracing::warn!(
            "Checkpoint was taken writing to {}; ignoring configured output {}",
            bound.output(),
            config.output()
        );
    }

    let mut output = outputs
        .build(bound.output())
        .reraise("error building output")?;
    // Its append may not have happened before the last run stopped.
    if let Some(tick) = &record.last_tick {
        tracing::info!("Re-emitting checkpointed tick {}", tick.index);
        output
            .append(&tick.snapshot, tick.timestamp)
            .reraise("error re-emitting checkpointed tick")?;
    }
    let input = inputs
        .build(bound.source())
        .reraise("error building input")?;

    let resume_at: TickIndex = record.resume_tick();
    tracing::info!(
        "Pipeline resumed from checkpoint written at {}; next tick {resume_at}",
        record.written_at
    );
    let scheduler = BatchScheduler::new(
        bound,
        record.state,
        record.last_tick,
        input,
        output,
        store,
        clock,
    );
    Ok(RunningPipeline {
        scheduler,
        recovered: true,
    })
}
