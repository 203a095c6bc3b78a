//! Internal code for input.
//!
//! A source connector is split in two: an [`InputBuilder`] which knows
//! how to bind to a [`SourceEndpoint`], and the [`InputReader`] it
//! builds, which the scheduler drains once per tick.
//!
//! Readers buffer concurrently however they like but must hand over a
//! finished batch of lines on each [`InputReader::next_batch`] call
//! and must never block the tick waiting for more.

use chrono::DateTime;
use chrono::Utc;
use thiserror::Error;

use crate::errors::PipelineResult;
use crate::pipeline::SourceEndpoint;

pub mod socket_input;
pub mod testing_input;

pub use socket_input::RetryPolicy;
pub use socket_input::SocketInput;
pub use socket_input::SocketInputConfig;
pub use testing_input::TestingInput;
pub use testing_input::TestingInputConfig;

/// Why a drain produced no lines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The connector is retrying on its own; treat this tick as
    /// having zero lines.
    #[error("source is retrying: {0}")]
    Transient(String),
    /// The connector gave up.
    #[error("source gave up: {0}")]
    Unavailable(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Defines how a single source of lines is read.
pub trait InputReader {
    /// Return every line buffered since the previous call.
    ///
    /// `since` is the timestamp of the previous tick boundary. An
    /// empty batch is valid. This must not block waiting for lines.
    fn next_batch(&mut self, since: DateTime<Utc>) -> Result<Vec<String>, SourceError>;
}

/// Bind a reader to an endpoint.
pub trait InputBuilder {
    fn build(&self, endpoint: &SourceEndpoint) -> PipelineResult<Box<dyn InputReader>>;
}
