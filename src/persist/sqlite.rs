//! SQLite-backed write-through mutation store.

use std::path::Path;

use rusqlite::{Connection, params};

use crate::{
    mutation::{MUTATION_FORMAT_VERSION, MutationRecord, StoredMutationEnvelope},
    types::{MutationId, MutationStatus},
};

use super::{PersistError, PersistResult, QueueSink};

/// SQLite implementation of [`crate::persist::QueueSink`].
pub struct SqliteQueueSink {
    conn: Connection,
}

impl SqliteQueueSink {
    /// Opens or creates a SQLite-backed sink at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite sink.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Number of stored records.
    pub fn count(&self) -> PersistResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM mutations", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl QueueSink for SqliteQueueSink {
    fn upsert(&mut self, record: &MutationRecord) -> PersistResult<()> {
        let payload = serde_json::to_vec(&StoredMutationEnvelope::new(record.clone()))?;
        self.conn.execute(
            "INSERT INTO mutations(id, seq, collection, target_id, status, enqueued_at_ms, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                seq = excluded.seq,
                collection = excluded.collection,
                target_id = excluded.target_id,
                status = excluded.status,
                payload = excluded.payload",
            params![
                record.id.to_string(),
                record.seq as i64,
                record.collection,
                record.target_id,
                status_label(record.status),
                record.enqueued_at as i64,
                payload,
            ],
        )?;
        Ok(())
    }

    fn remove(&mut self, id: &MutationId) -> PersistResult<()> {
        self.conn
            .execute("DELETE FROM mutations WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    fn load_all(&self) -> PersistResult<Vec<MutationRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload FROM mutations ORDER BY seq ASC")?;

        let rows = stmt.query_map([], |row| {
            let payload: Vec<u8> = row.get(0)?;
            decode_record_payload(&payload).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    payload.len(),
                    rusqlite::types::Type::Blob,
                    Box::new(std::io::Error::other(err)),
                )
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }
}

fn status_label(status: MutationStatus) -> &'static str {
    match status {
        MutationStatus::Pending => "pending",
        MutationStatus::InFlight => "in_flight",
        MutationStatus::Failed => "failed",
        MutationStatus::Done => "done",
    }
}

fn decode_record_payload(payload: &[u8]) -> Result<MutationRecord, PersistError> {
    let envelope: StoredMutationEnvelope = serde_json::from_slice(payload)?;
    if envelope.format_version != MUTATION_FORMAT_VERSION {
        return Err(PersistError::Message(format!(
            "unsupported mutation format version: {}",
            envelope.format_version
        )));
    }
    Ok(envelope.record)
}
