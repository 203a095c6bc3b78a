//! SQLite checkpoint backend.

use std::path::Path;
use std::path::PathBuf;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;

use super::decode;
use super::encode;
use super::CheckpointRead;
use super::CheckpointRecord;
use super::CheckpointStore;
use super::EncodedRecord;

/// Name of the DB file inside the checkpoint directory.
pub const DB_FILE_NAME: &str = "checkpoint.sqlite3";

/// `user_version` after all [`migrations`] ran.
const SCHEMA_VERSION: i64 = 1;

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Only ever one row; the `id` check enforces it.
        M::up(
            "CREATE TABLE checkpoint ( \
             id INTEGER NOT NULL PRIMARY KEY CHECK (id = 0), \
             written_at TEXT NOT NULL, \
             tick_index INTEGER CHECK (tick_index >= 0), \
             checksum TEXT NOT NULL, \
             record TEXT NOT NULL \
             ) STRICT",
        ),
    ])
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    migrations().validate()
}

/// Setup our connection-level pragmas and bring the schema up to date.
/// Run this on each writing connection.
fn setup_conn(conn: &mut Connection) -> Result<(), Box<dyn std::error::Error>> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    // A checkpoint isn't committed until it's on disk.
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    migrations().to_latest(conn)?;
    Ok(())
}

/// Keep the latest checkpoint in a SQLite DB in a directory.
///
/// The directory and DB are created on first write. Each write is an
/// upsert of the single row inside a transaction, so a crash mid-write
/// leaves the previous checkpoint in place.
pub struct SqliteCheckpointStore {
    dir: PathBuf,
    conn: Option<Connection>,
}

impl SqliteCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            conn: None,
        }
    }

    pub fn db_file(&self) -> PathBuf {
        self.dir.join(DB_FILE_NAME)
    }

    fn open_for_write(&mut self) -> Result<&mut Connection, Box<dyn std::error::Error>> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                std::fs::create_dir_all(&self.dir)?;
                let file = self.db_file();
                tracing::info!("Opening checkpoint DB at {file:?}");
                let mut conn = Connection::open_with_flags(
                    &file,
                    OpenFlags::SQLITE_OPEN_READ_WRITE
                        | OpenFlags::SQLITE_OPEN_CREATE
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                setup_conn(&mut conn)?;
                conn
            }
        };
        Ok(self.conn.insert(conn))
    }

    fn try_write(
        &mut self,
        encoded: &EncodedRecord,
        record: &CheckpointRecord,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let tick_index = record
            .last_tick
            .as_ref()
            .map(|tick| i64::try_from(tick.index.0))
            .transpose()?;
        let written_at = record.written_at.to_rfc3339();
        let checksum = format!("{:016x}", encoded.checksum);
        let json = std::str::from_utf8(&encoded.bytes)?;

        let conn = self.open_for_write()?;
        let txn = conn.transaction()?;
        txn.execute(
            "INSERT INTO checkpoint (id, written_at, tick_index, checksum, record) \
             VALUES (0, ?1, ?2, ?3, ?4) \
             ON CONFLICT (id) DO UPDATE \
             SET written_at = EXCLUDED.written_at, \
             tick_index = EXCLUDED.tick_index, \
             checksum = EXCLUDED.checksum, \
             record = EXCLUDED.record",
            (written_at, tick_index, checksum, json),
        )?;
        txn.commit()?;
        Ok(())
    }
}

/// A stored row before validation.
struct StoredRow {
    tick_index: Option<i64>,
    checksum: String,
    record: String,
}

/// Everything that can go wrong in here means the file is there but
/// unusable.
fn try_read(file: &Path) -> Result<Option<StoredRow>, String> {
    let conn = Connection::open_with_flags(
        file,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|err| format!("can't open DB: {err}"))?;
    conn.pragma_update(None, "busy_timeout", "5000")
        .map_err(|err| format!("can't configure DB: {err}"))?;

    let version: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|err| format!("not a checkpoint DB: {err}"))?;
    if version == 0 {
        // Created but a schema was never committed; no checkpoint was
        // ever written.
        return Ok(None);
    }
    if version != SCHEMA_VERSION {
        return Err(format!(
            "unsupported schema version {version}; expected {SCHEMA_VERSION}"
        ));
    }

    conn.query_row(
        "SELECT tick_index, checksum, record FROM checkpoint WHERE id = 0",
        (),
        |row| {
            Ok(StoredRow {
                tick_index: row.get(0)?,
                checksum: row.get(1)?,
                record: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(|err| format!("can't read checkpoint row: {err}"))
}

fn validate(row: StoredRow) -> Result<CheckpointRecord, String> {
    let checksum = u64::from_str_radix(&row.checksum, 16)
        .map_err(|err| format!("malformed checksum {:?}: {err}", row.checksum))?;
    let record = decode(&EncodedRecord {
        bytes: row.record.into_bytes(),
        checksum,
    })?;

    let in_record = record
        .last_tick
        .as_ref()
        .and_then(|tick| i64::try_from(tick.index.0).ok());
    if in_record != row.tick_index {
        return Err(format!(
            "tick index column {:?} disagrees with record {in_record:?}",
            row.tick_index
        ));
    }
    Ok(record)
}

impl CheckpointStore for SqliteCheckpointStore {
    fn read(&self) -> CheckpointRead {
        let file = self.db_file();
        if !file.exists() {
            tracing::debug!("No checkpoint DB at {file:?}");
            return CheckpointRead::Absent;
        }

        match try_read(&file).and_then(|row| row.map(validate).transpose()) {
            Ok(None) => CheckpointRead::Absent,
            Ok(Some(record)) => CheckpointRead::Present(record),
            Err(reason) => CheckpointRead::Corrupt(reason),
        }
    }

    fn write(&mut self, record: &CheckpointRecord) -> PipelineResult<()> {
        let location = self.location();
        let encoded = encode(record, &location)?;
        tracing::trace!("Writing checkpoint of {} bytes", encoded.bytes.len());
        self.try_write(&encoded, record).map_err(|err| {
            // Start from a fresh connection next time.
            self.conn = None;
            PipelineError::CheckpointWrite {
                location,
                reason: err.to_string(),
            }
        })
    }

    fn location(&self) -> String {
        self.dir.display().to_string()
    }
}
