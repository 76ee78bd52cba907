use crate::journal::{BufferedRecord, CursorCheckpoint, JournalError, JournalStore};
use crate::model::{Clock, Manifest};
use crate::sqlite_pragma::{apply_journal_pragmas, Durability};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

const SELECT_COLUMNS: &str = "batch_number, source, payload, chain, module_hash, module_name, \
     output_type, final_block_only, block_number, block_id, timestamp, cursor";

/// rusqlite-backed journal
///
/// `seq` (AUTOINCREMENT) keeps append order stable across deletes, so records
/// of one chain come back in the order their blocks arrived.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(db_path: impl AsRef<Path>, durability: Durability) -> Result<Self, JournalError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path.as_ref())?;
        apply_journal_pragmas(&conn, durability)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS journal (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                batch_number INTEGER NOT NULL,
                source TEXT NOT NULL,
                payload TEXT NOT NULL,
                chain TEXT NOT NULL,
                module_hash TEXT NOT NULL,
                module_name TEXT NOT NULL,
                output_type TEXT NOT NULL,
                final_block_only INTEGER NOT NULL,
                block_number INTEGER NOT NULL,
                block_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                cursor TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_journal_batch ON journal(batch_number);
            CREATE TABLE IF NOT EXISTS cursors (
                chain TEXT NOT NULL,
                module_hash TEXT NOT NULL,
                block_number INTEGER NOT NULL,
                cursor TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (chain, module_hash)
            );",
        )?;

        log::info!(
            "✅ Journal opened at {} (durability: {})",
            db_path.as_ref().display(),
            durability
        );

        Ok(Self { conn })
    }
}

impl JournalStore for SqliteStore {
    fn append(&mut self, records: &[BufferedRecord]) -> Result<(), JournalError> {
        if records.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO journal
                 (batch_number, source, payload, chain, module_hash, module_name,
                  output_type, final_block_only, block_number, block_id, timestamp, cursor)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;

            for record in records {
                stmt.execute(params![
                    to_sql_int(record.batch_number)?,
                    record.source,
                    record.payload,
                    record.manifest.chain,
                    record.manifest.module_hash,
                    record.manifest.module_name,
                    record.manifest.output_type,
                    record.manifest.final_block_only,
                    to_sql_int(record.clock.block_number)?,
                    record.clock.block_id,
                    record
                        .clock
                        .timestamp
                        .to_rfc3339_opts(SecondsFormat::AutoSi, true),
                    record.cursor,
                ])?;
            }
        }
        tx.commit()?;

        Ok(())
    }

    fn max_batch_number(&self) -> Result<Option<u64>, JournalError> {
        let max: Option<i64> =
            self.conn
                .query_row("SELECT MAX(batch_number) FROM journal", [], |row| row.get(0))?;
        Ok(max.map(|n| n as u64))
    }

    fn select_through(&self, boundary: u64) -> Result<Vec<BufferedRecord>, JournalError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {} FROM journal WHERE batch_number <= ?1 ORDER BY seq",
            SELECT_COLUMNS
        ))?;

        let records = stmt
            .query_map(params![to_sql_int(boundary)?], read_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn delete_below(&mut self, watermark: u64) -> Result<usize, JournalError> {
        let deleted = self.conn.execute(
            "DELETE FROM journal WHERE batch_number < ?1",
            params![to_sql_int(watermark)?],
        )?;
        Ok(deleted)
    }

    fn count(&self) -> Result<u64, JournalError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM journal", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn save_cursors(&mut self, checkpoints: &[CursorCheckpoint]) -> Result<(), JournalError> {
        if checkpoints.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        upsert_cursors(&tx, checkpoints)?;
        tx.commit()?;

        Ok(())
    }

    fn commit_through(
        &mut self,
        watermark: u64,
        checkpoints: &[CursorCheckpoint],
    ) -> Result<usize, JournalError> {
        // Dropping the transaction on any error rolls both statements back
        let tx = self.conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM journal WHERE batch_number < ?1",
            params![to_sql_int(watermark)?],
        )?;
        upsert_cursors(&tx, checkpoints)?;
        tx.commit()?;

        Ok(deleted)
    }

    fn latest_cursor(
        &self,
        chain: &str,
        module_hash: &str,
    ) -> Result<Option<String>, JournalError> {
        let cursor = self
            .conn
            .query_row(
                "SELECT cursor FROM cursors WHERE chain = ?1 AND module_hash = ?2",
                params![chain, module_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor)
    }

    fn store_type(&self) -> &'static str {
        "SQLite"
    }
}

fn to_sql_int(value: u64) -> Result<i64, JournalError> {
    i64::try_from(value)
        .map_err(|_| JournalError::Corrupt(format!("{} does not fit a SQLite integer", value)))
}

fn upsert_cursors(conn: &Connection, checkpoints: &[CursorCheckpoint]) -> Result<(), JournalError> {
    let now = Utc::now().timestamp();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO cursors (chain, module_hash, block_number, cursor, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(chain, module_hash) DO UPDATE SET
            block_number = excluded.block_number,
            cursor = excluded.cursor,
            updated_at = excluded.updated_at
         WHERE excluded.block_number >= cursors.block_number",
    )?;

    for checkpoint in checkpoints {
        stmt.execute(params![
            checkpoint.chain,
            checkpoint.module_hash,
            to_sql_int(checkpoint.block_number)?,
            checkpoint.cursor,
            now,
        ])?;
    }

    Ok(())
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<BufferedRecord> {
    let raw_timestamp: String = row.get(10)?;
    let timestamp = DateTime::parse_from_rfc3339(&raw_timestamp)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?;

    Ok(BufferedRecord {
        batch_number: row.get::<_, i64>(0)? as u64,
        source: row.get(1)?,
        payload: row.get(2)?,
        manifest: Manifest {
            chain: row.get(3)?,
            module_hash: row.get(4)?,
            module_name: row.get(5)?,
            output_type: row.get(6)?,
            final_block_only: row.get(7)?,
        },
        clock: Clock {
            block_number: row.get::<_, i64>(8)? as u64,
            block_id: row.get(9)?,
            timestamp,
        },
        cursor: row.get(11)?,
    })
}
