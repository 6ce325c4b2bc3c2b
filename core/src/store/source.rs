//! Read-only input source: an external SQLite database holding the
//! `entity` and `event` tables the analytics scripts populate.

use crate::{
    entity::{EntityRecord, EventRecord},
    error::PipelineResult,
    pipeline::RunInput,
};
use rusqlite::{Connection, OpenFlags};

pub struct InputSource {
    conn: Connection,
}

impl InputSource {
    pub fn open(path: &str) -> PipelineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
        )?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection (used in tests).
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    /// Columns are read as nullable so malformed rows reach record
    /// validation instead of failing the whole read.
    pub fn read_entities(&self) -> PipelineResult<Vec<EntityRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, region, signup_date FROM entity ORDER BY rowid",
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok(EntityRecord {
                    id:          row.get(0)?,
                    region:      row.get(1)?,
                    signup_date: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn read_events(&self) -> PipelineResult<Vec<EventRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, timestamp, status, amount FROM event ORDER BY rowid",
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok(EventRecord {
                    entity_id: row.get(0)?,
                    timestamp: row.get(1)?,
                    status:    row.get(2)?,
                    amount:    row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn read_input(&self) -> PipelineResult<RunInput> {
        let entities = self.read_entities()?;
        let events = self.read_events()?;
        log::debug!(
            "read {} entity and {} event records from source",
            entities.len(), events.len(),
        );
        Ok(RunInput { entities, events })
    }
}
