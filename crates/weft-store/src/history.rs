use chrono::Utc;
use serde_json::Value;
use tracing::instrument;

use weft_core::history::{ActionKind, ActionRecord, ActionStatus};
use weft_core::ids::InstanceId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const HISTORY_COLUMNS: &str = "instance_id, sequence_no, kind, name, target, input, status,
         result, error, resolved_order, created_at, updated_at";

/// Append-only per-instance action log. Records transition
/// scheduled → completed | failed exactly once; replays read them back in
/// sequence order.
pub struct HistoryRepo {
    db: Database,
}

impl HistoryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a newly scheduled action at a call site.
    #[instrument(skip(self, input), fields(instance_id = %instance_id, sequence_no, kind = %kind, name))]
    pub fn insert_scheduled(
        &self,
        instance_id: &InstanceId,
        sequence_no: u32,
        kind: ActionKind,
        name: &str,
        target: Option<&str>,
        input: Option<&Value>,
    ) -> Result<ActionRecord, StoreError> {
        let raw_input = input.map(serde_json::to_string).transpose()?;
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO history (instance_id, sequence_no, kind, name, target, input,
                                      status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'scheduled', ?7, ?8)",
                rusqlite::params![
                    instance_id.as_str(),
                    sequence_no,
                    kind.to_string(),
                    name,
                    target,
                    raw_input,
                    now,
                    now,
                ],
            )?;

            Ok(ActionRecord {
                instance_id: instance_id.clone(),
                sequence_no,
                kind,
                name: name.to_owned(),
                target: target.map(str::to_owned),
                input: input.cloned(),
                status: ActionStatus::Scheduled,
                result: None,
                error: None,
                resolved_order: None,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Resolve a scheduled record. Returns false if the record was already
    /// resolved, which makes duplicate completions harmless.
    #[instrument(skip(self, result), fields(instance_id = %instance_id, sequence_no, status = %status))]
    pub fn resolve(
        &self,
        instance_id: &InstanceId,
        sequence_no: u32,
        status: ActionStatus,
        result: Option<&Value>,
        error: Option<&str>,
        resolved_order: u32,
    ) -> Result<bool, StoreError> {
        let raw_result = result.map(serde_json::to_string).transpose()?;
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let updated = conn.execute(
                "UPDATE history
                 SET status = ?1, result = ?2, error = ?3, resolved_order = ?4, updated_at = ?5
                 WHERE instance_id = ?6 AND sequence_no = ?7 AND status = 'scheduled'",
                rusqlite::params![
                    status.to_string(),
                    raw_result,
                    error,
                    resolved_order,
                    now,
                    instance_id.as_str(),
                    sequence_no,
                ],
            )?;
            Ok(updated == 1)
        })
    }

    /// Full history for an instance in program order.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub fn load(&self, instance_id: &InstanceId) -> Result<Vec<ActionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {HISTORY_COLUMNS} FROM history
                 WHERE instance_id = ?1 ORDER BY sequence_no"
            ))?;
            let mut rows = stmt.query([instance_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_record(row)?);
            }
            Ok(results)
        })
    }

    /// Records still awaiting resolution, in program order.
    #[instrument(skip(self), fields(instance_id = %instance_id))]
    pub fn scheduled(&self, instance_id: &InstanceId) -> Result<Vec<ActionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {HISTORY_COLUMNS} FROM history
                 WHERE instance_id = ?1 AND status = 'scheduled' ORDER BY sequence_no"
            ))?;
            let mut rows = stmt.query([instance_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_record(row)?);
            }
            Ok(results)
        })
    }

    /// Sequence number of the oldest unresolved wait for a named event.
    #[instrument(skip(self), fields(instance_id = %instance_id, event_name))]
    pub fn oldest_unmatched_wait(
        &self,
        instance_id: &InstanceId,
        event_name: &str,
    ) -> Result<Option<u32>, StoreError> {
        self.db.with_conn(|conn| {
            let seq: Option<u32> = conn.query_row(
                "SELECT MIN(sequence_no) FROM history
                 WHERE instance_id = ?1 AND kind = 'external_event'
                   AND name = ?2 AND status = 'scheduled'",
                rusqlite::params![instance_id.as_str(), event_name],
                |row| row.get(0),
            )?;
            Ok(seq)
        })
    }
}

/// External events that arrived before any wait point existed for them.
/// Drained FIFO per (instance, name).
pub struct EventBufferRepo {
    db: Database,
}

impl EventBufferRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, payload), fields(instance_id = %instance_id, event_name))]
    pub fn push(
        &self,
        instance_id: &InstanceId,
        event_name: &str,
        payload: &Value,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(payload)?;
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO event_buffer (instance_id, event_name, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![instance_id.as_str(), event_name, raw, now],
            )?;
            Ok(())
        })
    }

    /// Remove and return the oldest buffered payload for (instance, name).
    /// Select + delete run under the connection lock.
    #[instrument(skip(self), fields(instance_id = %instance_id, event_name))]
    pub fn pop_oldest(
        &self,
        instance_id: &InstanceId,
        event_name: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.db.with_conn(|conn| {
            let found: Option<(i64, String)> = conn
                .query_row(
                    "SELECT id, payload FROM event_buffer
                     WHERE instance_id = ?1 AND event_name = ?2
                     ORDER BY id LIMIT 1",
                    rusqlite::params![instance_id.as_str(), event_name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(StoreError::from(other)),
                })?;

            match found {
                Some((id, raw)) => {
                    conn.execute("DELETE FROM event_buffer WHERE id = ?1", [id])?;
                    Ok(Some(row_helpers::parse_json(&raw, "event_buffer", "payload")?))
                }
                None => Ok(None),
            }
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<ActionRecord, StoreError> {
    let raw_id: String = row_helpers::get(row, 0, "history", "instance_id")?;
    let raw_kind: String = row_helpers::get(row, 2, "history", "kind")?;
    let raw_input: Option<String> = row_helpers::get_opt(row, 5, "history", "input")?;
    let raw_status: String = row_helpers::get(row, 6, "history", "status")?;
    let raw_result: Option<String> = row_helpers::get_opt(row, 7, "history", "result")?;

    Ok(ActionRecord {
        instance_id: InstanceId::from_raw(raw_id),
        sequence_no: row_helpers::get(row, 1, "history", "sequence_no")?,
        kind: row_helpers::parse_enum(&raw_kind, "history", "kind")?,
        name: row_helpers::get(row, 3, "history", "name")?,
        target: row_helpers::get_opt(row, 4, "history", "target")?,
        input: raw_input
            .map(|r| row_helpers::parse_json(&r, "history", "input"))
            .transpose()?,
        status: row_helpers::parse_enum(&raw_status, "history", "status")?,
        result: raw_result
            .map(|r| row_helpers::parse_json(&r, "history", "result"))
            .transpose()?,
        error: row_helpers::get_opt(row, 8, "history", "error")?,
        resolved_order: row_helpers::get_opt(row, 9, "history", "resolved_order")?,
        created_at: row_helpers::get(row, 10, "history", "created_at")?,
        updated_at: row_helpers::get(row, 11, "history", "updated_at")?,
    })
}
