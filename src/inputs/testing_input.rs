//! Scripted input for tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use chrono::DateTime;
use chrono::Utc;

use crate::errors::PipelineResult;
use crate::pipeline::SourceEndpoint;

use super::InputBuilder;
use super::InputReader;
use super::SourceError;

type Script = Rc<RefCell<VecDeque<Result<Vec<String>, SourceError>>>>;

/// Builds [`TestingInput`]s that all share one script of drains.
///
/// Each call to [`InputReader::next_batch`] pops the next scripted
/// result; once the script runs out every drain is an empty batch.
/// Clones share the script, so a test can keep a handle and feed
/// more batches while a pipeline is running.
#[derive(Debug, Clone, Default)]
pub struct TestingInputConfig {
    script: Script,
    bound_to: Rc<RefCell<Vec<SourceEndpoint>>>,
}

impl TestingInputConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one tick's worth of lines.
    pub fn push_batch<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script
            .borrow_mut()
            .push_back(Ok(lines.into_iter().map(Into::into).collect()));
    }

    pub fn push_error(&self, err: SourceError) {
        self.script.borrow_mut().push_back(Err(err));
    }

    /// Endpoints readers were built for, in build order.
    pub fn bound_to(&self) -> Vec<SourceEndpoint> {
        self.bound_to.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.borrow().len()
    }
}

impl InputBuilder for TestingInputConfig {
    fn build(&self, endpoint: &SourceEndpoint) -> PipelineResult<Box<dyn InputReader>> {
        self.bound_to.borrow_mut().push(endpoint.clone());
        Ok(Box::new(TestingInput {
            script: self.script.clone(),
        }))
    }
}

pub struct TestingInput {
    script: Script,
}

impl InputReader for TestingInput {
    fn next_batch(&mut self, _since: DateTime<Utc>) -> Result<Vec<String>, SourceError> {
        self.script
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[test]
fn plays_script_then_empties() {
    let config = TestingInputConfig::new();
    config.push_batch(["a b a"]);
    config.push_error(SourceError::Transient("blip".into()));

    assert_eq!(config.remaining(), 2);

    let mut input = config.build(&SourceEndpoint::new("localhost", 9999)).unwrap();
    assert_eq!(input.next_batch(Utc::now()), Ok(vec!["a b a".to_string()]));
    assert!(input.next_batch(Utc::now()).unwrap_err().is_transient());
    assert_eq!(config.remaining(), 0);
    assert_eq!(input.next_batch(Utc::now()), Ok(Vec::new()));
    assert_eq!(config.bound_to(), vec![SourceEndpoint::new("localhost", 9999)]);
}
