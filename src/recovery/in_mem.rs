//! In-memory checkpoint backend.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;

use super::decode;
use super::encode;
use super::CheckpointRead;
use super::CheckpointRecord;
use super::CheckpointStore;
use super::EncodedRecord;

/// Keeps the checksummed encoding in memory.
///
/// Clones share the slot, so a "restarted" pipeline in a test can be
/// handed a clone of the store the previous one wrote to.
#[derive(Debug, Clone, Default)]
pub struct InMemCheckpointStore {
    slot: Rc<RefCell<Option<EncodedRecord>>>,
    fail_writes: Rc<Cell<bool>>,
    writes: Rc<Cell<usize>>,
}

impl InMemCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }

    /// Number of successful writes.
    pub fn writes(&self) -> usize {
        self.writes.get()
    }

    /// Flip a byte of the stored encoding.
    pub fn corrupt(&self) {
        if let Some(encoded) = self.slot.borrow_mut().as_mut() {
            if let Some(byte) = encoded.bytes.last_mut() {
                *byte ^= 0xff;
            }
        }
    }
}

impl CheckpointStore for InMemCheckpointStore {
    fn read(&self) -> CheckpointRead {
        match self.slot.borrow().as_ref() {
            None => CheckpointRead::Absent,
            Some(encoded) => match decode(encoded) {
                Ok(record) => CheckpointRead::Present(record),
                Err(reason) => CheckpointRead::Corrupt(reason),
            },
        }
    }

    fn write(&mut self, record: &CheckpointRecord) -> PipelineResult<()> {
        if self.fail_writes.get() {
            return Err(PipelineError::CheckpointWrite {
                location: self.location(),
                reason: "in-memory store set to fail".to_string(),
            });
        }
        let encoded = encode(record, &self.location())?;
        *self.slot.borrow_mut() = Some(encoded);
        self.writes.set(self.writes.get() + 1);
        Ok(())
    }

    fn location(&self) -> String {
        "in-memory".to_string()
    }
}
