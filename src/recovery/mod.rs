//! Checkpointing and recovery.
//!
//! A checkpoint is a single [`CheckpointRecord`]: the pipeline
//! definition, the cumulative [`AggregationState`] and the last tick
//! that completed before it was taken. Each write replaces the
//! previous record whole; there is no history.
//!
//! Records are stored as JSON next to a [`seahash`] checksum of those
//! exact bytes. Reading gives a [`CheckpointRead`] which keeps "there
//! is nothing here" and "there is something here but it's garbage"
//! apart, so the caller can refuse to start over on top of a damaged
//! checkpoint.
//!
//! [`SqliteCheckpointStore`] is the durable backend;
//! [`InMemCheckpointStore`] behaves the same but lives only as long as
//! the process.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;
use crate::execution::CompletedTick;
use crate::execution::TickIndex;
use crate::operators::AggregationState;
use crate::pipeline::PipelineConfig;

pub mod in_mem;
pub mod sqlite;

pub use in_mem::InMemCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

/// Bump when [`CheckpointRecord`]'s encoding changes incompatibly.
pub const FORMAT_VERSION: u32 = 1;

/// Everything needed to resume a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub format_version: u32,
    /// Source and output bindings of the run that wrote this.
    pub config: PipelineConfig,
    pub state: AggregationState,
    /// [`None`] if no tick had completed yet.
    pub last_tick: Option<CompletedTick>,
    pub written_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(
        config: PipelineConfig,
        state: AggregationState,
        last_tick: Option<CompletedTick>,
        written_at: DateTime<Utc>,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            config,
            state,
            last_tick,
            written_at,
        }
    }

    /// The tick a pipeline resumed from this record starts at.
    pub fn resume_tick(&self) -> TickIndex {
        self.last_tick
            .as_ref()
            .map(|tick| tick.index.next())
            .unwrap_or_default()
    }
}

/// Outcome of looking for a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointRead {
    /// Nothing was ever written at this location.
    Absent,
    /// Something is there but it failed validation.
    Corrupt(String),
    Present(CheckpointRecord),
}

/// Durable home of the single latest [`CheckpointRecord`].
pub trait CheckpointStore {
    /// Look up the latest record.
    fn read(&self) -> CheckpointRead;

    /// Atomically replace the latest record.
    ///
    /// Readers see either the previous record or this one, never a
    /// mix. Failures are [`PipelineError::CheckpointWrite`].
    fn write(&mut self, record: &CheckpointRecord) -> PipelineResult<()>;

    /// Human readable location for diagnostics.
    fn location(&self) -> String;
}

/// A record as it sits in storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EncodedRecord {
    pub(crate) bytes: Vec<u8>,
    pub(crate) checksum: u64,
}

pub(crate) fn encode(record: &CheckpointRecord, location: &str) -> PipelineResult<EncodedRecord> {
    let bytes = serde_json::to_vec(record).map_err(|err| PipelineError::CheckpointWrite {
        location: location.to_string(),
        reason: format!("can't serialize checkpoint: {err}"),
    })?;
    let checksum = seahash::hash(&bytes);
    Ok(EncodedRecord { bytes, checksum })
}

/// Validate and deserialize; the error is the reason it's corrupt.
pub(crate) fn decode(encoded: &EncodedRecord) -> Result<CheckpointRecord, String> {
    let found = seahash::hash(&encoded.bytes);
    if found != encoded.checksum {
        return Err(format!(
            "checksum mismatch: stored {:016x}, computed {found:016x}",
            encoded.checksum
        ));
    }
    let record: CheckpointRecord = serde_json::from_slice(&encoded.bytes)
        .map_err(|err| format!("can't deserialize record: {err}"))?;
    if record.format_version != FORMAT_VERSION {
        return Err(format!(
            "unsupported format version {}; expected {FORMAT_VERSION}",
            record.format_version
        ));
    }
    Ok(record)
}

#[cfg(test)]
pub(crate) fn example_record() -> CheckpointRecord {
    use chrono::TimeZone;

    use crate::operators::Snapshot;
    use crate::pipeline::OutputTarget;
    use crate::pipeline::SourceEndpoint;

    let config = PipelineConfig::new(
        SourceEndpoint::new("localhost", 9999),
        "/tmp/ckpt",
        OutputTarget::new("/tmp/out.txt"),
    );
    let ts = Utc.timestamp_millis_opt(1_357_008_430_000).unwrap();
    CheckpointRecord::new(
        config,
        AggregationState::from_iter([("a", 2), ("b", 1)]),
        Some(CompletedTick {
            index: TickIndex(0),
            timestamp: ts,
            snapshot: Snapshot::from_iter([("a", 2), ("b", 1)]),
        }),
        ts,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_tick_follows_last() {
        let mut record = example_record();
        assert_eq!(record.resume_tick(), TickIndex(1));

        record.last_tick = None;
        assert_eq!(record.resume_tick(), TickIndex(0));
    }

    #[test]
    fn decode_checks_checksum() {
        let record = example_record();
        let mut encoded = encode(&record, "test").unwrap();
        assert_eq!(decode(&encoded), Ok(record));

        encoded.bytes[10] ^= 0xff;
        let reason = decode(&encoded).unwrap_err();
        assert!(reason.contains("checksum mismatch"), "{reason}");
    }

    #[test]
    fn decode_checks_version() {
        let mut record = example_record();
        record.format_version = FORMAT_VERSION + 1;
        let encoded = encode(&record, "test").unwrap();
        let reason = decode(&encoded).unwrap_err();
        assert!(reason.contains("unsupported format version"), "{reason}");
    }

    #[test]
    fn decode_rejects_garbage_with_good_checksum() {
        let bytes = b"{\"not\": \"a record\"}".to_vec();
        let encoded = EncodedRecord {
            checksum: seahash::hash(&bytes),
            bytes,
        };
        let reason = decode(&encoded).unwrap_err();
        assert!(reason.contains("can't deserialize"), "{reason}");
    }
}
