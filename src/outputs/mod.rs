//! Internal code for output.
//!
//! Output is based around the core trait of [`OutputWriter`]. The
//! scheduler hands it each tick's [`Snapshot`] and timestamp; the
//! writer renders and durably appends one line per tick.
//!
//! This follows the same pattern as input: an [`OutputBuilder`]
//! config object knows how to bind to an [`OutputTarget`] and builds
//! the writer that does the work. E.g. [`FileOutputConfig`] builds a
//! [`FileOutput`].
//!
//! Appends are not idempotent across restarts. A tick re-emitted
//! after recovery is appended again.

use chrono::DateTime;
use chrono::Utc;

use crate::errors::PipelineResult;
use crate::operators::Snapshot;
use crate::pipeline::OutputTarget;

pub mod file_output;
pub mod testing_output;

pub use file_output::FileOutput;
pub use file_output::FileOutputConfig;
pub use testing_output::TestingOutput;
pub use testing_output::TestingOutputConfig;

/// Defines how output of the pipeline is written.
pub trait OutputWriter {
    /// Durably append the rendering of one tick.
    ///
    /// Must not return before the line is flushed.
    fn append(&mut self, snapshot: &Snapshot, timestamp: DateTime<Utc>) -> PipelineResult<()>;

    /// Clear any previous output. Only called when starting fresh.
    fn reset(&mut self) -> PipelineResult<()>;
}

/// Bind a writer to an output target.
pub trait OutputBuilder {
    fn build(&self, target: &OutputTarget) -> PipelineResult<Box<dyn OutputWriter>>;
}

/// Render one tick as a single line, without the trailing newline.
///
/// `Counts at time 1357008430000 ms [a: 2, b: 1]`
pub fn render(snapshot: &Snapshot, timestamp: DateTime<Utc>) -> String {
    format!(
        "Counts at time {} ms {snapshot}",
        timestamp.timestamp_millis()
    )
}

#[test]
fn render_line() {
    use chrono::TimeZone;

    let ts = Utc.timestamp_millis_opt(1_357_008_430_000).unwrap();
    let snapshot = Snapshot::from_iter([("a", 2), ("b", 1)]);
    assert_eq!(
        render(&snapshot, ts),
        "Counts at time 1357008430000 ms [a: 2, b: 1]"
    );
    assert_eq!(
        render(&Snapshot::default(), ts),
        "Counts at time 1357008430000 ms []"
    );
}
