//! Durable slot store over SQLite.
//!
//! The compare-and-set is a single `UPDATE ... WHERE status = ? AND
//! claimed_by IS ? ... RETURNING` statement, which SQLite executes atomically
//! across connections and processes sharing the database file.

use super::{CasOutcome, Mutation, SlotStore, StoreError, check_slot_count};
use crate::db;
use crate::model::{Slot, SlotKey, SlotStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, types::Type};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const SLOT_COLUMNS: &str = "task_id, slot_num, status, claimed_by, claimed_at_us, \
                            completed_by, completed_at_us, version";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Unavailable(format!("sqlite: {err}"))
    }
}

impl SqliteStore {
    /// Open (or create) the store at `path`, applying pragmas and migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = db::open_store_db(path, busy_timeout)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(db::open_in_memory()?),
            path: None,
        })
    }

    /// Backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))?;
        f(&mut conn)
    }

    fn cas(
        &self,
        key: SlotKey,
        expected_status: SlotStatus,
        expected_claimed_by: Option<&str>,
        expected_version: Option<u64>,
        mutation: &Mutation,
    ) -> Result<CasOutcome, StoreError> {
        mutation.check_source(key, expected_status)?;

        self.with_conn(|conn| {
            if let Some(updated) = run_cas(
                conn,
                key,
                expected_status,
                expected_claimed_by,
                expected_version,
                mutation,
            )? {
                return Ok(CasOutcome::Applied(updated));
            }
            let observed = select_slot(conn, key)?.ok_or(StoreError::NotFound(key))?;
            Ok(CasOutcome::Conflict(observed))
        })
    }
}

fn to_micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn from_micros(column: usize, us: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    us.map(|us| {
        DateTime::from_timestamp_micros(us).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                Type::Integer,
                format!("timestamp out of range: {us}").into(),
            )
        })
    })
    .transpose()
}

fn slot_from_row(row: &Row<'_>) -> rusqlite::Result<Slot> {
    let status: String = row.get(2)?;
    let status = status.parse::<SlotStatus>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(err))
    })?;
    let version: i64 = row.get(7)?;

    Ok(Slot {
        task_id: row.get(0)?,
        slot_num: row.get(1)?,
        status,
        claimed_by: row.get(3)?,
        claimed_at: from_micros(4, row.get(4)?)?,
        completed_by: row.get(5)?,
        completed_at: from_micros(6, row.get(6)?)?,
        version: u64::try_from(version).unwrap_or_default(),
    })
}

fn select_slot(conn: &Connection, key: SlotKey) -> rusqlite::Result<Option<Slot>> {
    conn.query_row(
        &format!("SELECT {SLOT_COLUMNS} FROM slots WHERE task_id = ?1 AND slot_num = ?2"),
        params![key.task_id, key.slot_num],
        slot_from_row,
    )
    .optional()
}

fn run_cas(
    conn: &Connection,
    key: SlotKey,
    expected_status: SlotStatus,
    expected_claimed_by: Option<&str>,
    expected_version: Option<u64>,
    mutation: &Mutation,
) -> rusqlite::Result<Option<Slot>> {
    // ?1..?5 are shared by every variant; SET expressions see the old row.
    let guard = "WHERE task_id = ?1 AND slot_num = ?2 AND status = ?3 AND claimed_by IS ?4 \
                 AND (?5 IS NULL OR version = ?5)";
    let version = expected_version.map(|v| i64::try_from(v).unwrap_or(i64::MAX));
    let returning = format!("RETURNING {SLOT_COLUMNS}");

    match mutation {
        Mutation::Claim { worker_id, at } => conn
            .query_row(
                &format!(
                    "UPDATE slots SET status = 'in_progress', claimed_by = ?6, \
                     claimed_at_us = ?7, version = version + 1 {guard} {returning}"
                ),
                params![
                    key.task_id,
                    key.slot_num,
                    expected_status.as_str(),
                    expected_claimed_by,
                    version,
                    worker_id,
                    to_micros(*at),
                ],
                slot_from_row,
            )
            .optional(),
        Mutation::Complete { at } => conn
            .query_row(
                &format!(
                    "UPDATE slots SET status = 'completed', completed_by = claimed_by, \
                     completed_at_us = ?6, claimed_by = NULL, claimed_at_us = NULL, \
                     version = version + 1 {guard} {returning}"
                ),
                params![
                    key.task_id,
                    key.slot_num,
                    expected_status.as_str(),
                    expected_claimed_by,
                    version,
                    to_micros(*at),
                ],
                slot_from_row,
            )
            .optional(),
        Mutation::Release => conn
            .query_row(
                &format!(
                    "UPDATE slots SET status = 'available', claimed_by = NULL, \
                     claimed_at_us = NULL, version = version + 1 {guard} {returning}"
                ),
                params![
                    key.task_id,
                    key.slot_num,
                    expected_status.as_str(),
                    expected_claimed_by,
                    version,
                ],
                slot_from_row,
            )
            .optional(),
    }
}

impl SlotStore for SqliteStore {
    fn get(&self, key: SlotKey) -> Result<Slot, StoreError> {
        self.with_conn(|conn| select_slot(conn, key)?.ok_or(StoreError::NotFound(key)))
    }

    fn list(&self, task_id: Option<i64>) -> Result<Vec<Slot>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SLOT_COLUMNS} FROM slots \
                 WHERE ?1 IS NULL OR task_id = ?1 \
                 ORDER BY task_id ASC, slot_num ASC"
            ))?;
            let rows = stmt.query_map(params![task_id], slot_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn conditional_update(
        &self,
        key: SlotKey,
        expected_status: SlotStatus,
        expected_claimed_by: Option<&str>,
        mutation: &Mutation,
    ) -> Result<CasOutcome, StoreError> {
        self.cas(key, expected_status, expected_claimed_by, None, mutation)
    }

    fn conditional_update_at_version(
        &self,
        key: SlotKey,
        expected_status: SlotStatus,
        expected_claimed_by: Option<&str>,
        expected_version: u64,
        mutation: &Mutation,
    ) -> Result<CasOutcome, StoreError> {
        self.cas(
            key,
            expected_status,
            expected_claimed_by,
            Some(expected_version),
            mutation,
        )
    }

    fn create_slots(&self, task_ids: &[i64], slot_count: u32) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut count =
                    tx.prepare_cached("SELECT COUNT(*) FROM slots WHERE task_id = ?1")?;
                for &task_id in task_ids {
                    let existing: i64 = count.query_row(params![task_id], |row| row.get(0))?;
                    let existing = usize::try_from(existing).unwrap_or_default();
                    check_slot_count(task_id, existing, slot_count)?;
                }
            }
            let mut created = 0;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO slots (task_id, slot_num, status) \
                     VALUES (?1, ?2, 'available')",
                )?;
                for &task_id in task_ids {
                    for slot_num in 1..=slot_count {
                        created += stmt.execute(params![task_id, slot_num])?;
                    }
                }
            }
            tx.commit()?;
            Ok(created)
        })
    }
}
