//! Capturing output for tests.

use std::cell::Cell;
use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use chrono::DateTime;
use chrono::Utc;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;
use crate::operators::Snapshot;
use crate::pipeline::OutputTarget;

use super::render;
use super::OutputBuilder;
use super::OutputWriter;

/// Builds [`TestingOutput`]s that all append into one shared list of
/// rendered lines.
///
/// Clones share the list, so a test keeps a handle and inspects it
/// after the pipeline under test has stopped.
#[derive(Debug, Clone, Default)]
pub struct TestingOutputConfig {
    lines: Rc<RefCell<Vec<String>>>,
    resets: Rc<Cell<usize>>,
    fail_appends: Rc<Cell<bool>>,
}

impl TestingOutputConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate output as if a previous run had written it.
    pub fn with_lines<I, S>(self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lines
            .borrow_mut()
            .extend(lines.into_iter().map(Into::into));
        self
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }

    /// How many times any writer was reset.
    pub fn resets(&self) -> usize {
        self.resets.get()
    }

    /// Make every following append fail like a full disk.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.set(fail);
    }
}

impl OutputBuilder for TestingOutputConfig {
    fn build(&self, target: &OutputTarget) -> PipelineResult<Box<dyn OutputWriter>> {
        Ok(Box::new(TestingOutput {
            target: target.clone(),
            config: self.clone(),
        }))
    }
}

pub struct TestingOutput {
    target: OutputTarget,
    config: TestingOutputConfig,
}

impl OutputWriter for TestingOutput {
    fn append(&mut self, snapshot: &Snapshot, timestamp: DateTime<Utc>) -> PipelineResult<()> {
        if self.config.fail_appends.get() {
            return Err(PipelineError::SinkWrite {
                target: self.target.to_string(),
                source: io::Error::new(io::ErrorKind::Other, "testing output failure"),
            });
        }
        self.config
            .lines
            .borrow_mut()
            .push(render(snapshot, timestamp));
        Ok(())
    }

    fn reset(&mut self) -> PipelineResult<()> {
        self.config.lines.borrow_mut().clear();
        self.config.resets.set(self.config.resets.get() + 1);
        Ok(())
    }
}

#[test]
fn captures_and_resets() {
    use chrono::TimeZone;

    let config = TestingOutputConfig::new().with_lines(["stale"]);
    let mut output = config.build(&OutputTarget::new("/dev/null")).unwrap();
    let ts = Utc.timestamp_millis_opt(1_000).unwrap();

    output.reset().unwrap();
    output
        .append(&Snapshot::from_iter([("a", 1)]), ts)
        .unwrap();
    assert_eq!(config.lines(), vec!["Counts at time 1000 ms [a: 1]"]);
    assert_eq!(config.resets(), 1);

    config.fail_appends(true);
    let err = output.append(&Snapshot::default(), ts).unwrap_err();
    assert!(matches!(err, PipelineError::SinkWrite { .. }));
}
