use chrono::Utc;
use serde_json::Value;
use tracing::instrument;

use weft_core::history::{InstanceRow, InstanceStatus};
use weft_core::ids::InstanceId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const INSTANCE_COLUMNS: &str = "id, orchestration, input, status, output, error, custom_status,
         parent_instance_id, parent_sequence_no, created_at, updated_at";

pub struct InstanceRepo {
    db: Database,
}

impl InstanceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new instance in `running` status. `parent` links a child
    /// back to the call site that spawned it.
    #[instrument(skip(self, input), fields(instance_id = %id, orchestration))]
    pub fn create(
        &self,
        id: &InstanceId,
        orchestration: &str,
        input: &Value,
        parent: Option<(&InstanceId, u32)>,
    ) -> Result<InstanceRow, StoreError> {
        let raw_input = serde_json::to_string(input)?;
        let now = Utc::now().to_rfc3339();
        let (parent_id, parent_seq) = match parent {
            Some((pid, seq)) => (Some(pid.as_str().to_owned()), Some(seq)),
            None => (None, None),
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO instances (id, orchestration, input, status, parent_instance_id,
                                        parent_sequence_no, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'running', ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id.as_str(),
                    orchestration,
                    raw_input,
                    parent_id,
                    parent_seq,
                    now,
                    now,
                ],
            )?;

            Ok(InstanceRow {
                id: id.clone(),
                orchestration: orchestration.to_owned(),
                input: input.clone(),
                status: InstanceStatus::Running,
                output: None,
                error: None,
                custom_status: None,
                parent_instance_id: parent.map(|(pid, _)| pid.clone()),
                parent_sequence_no: parent.map(|(_, seq)| seq),
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn get(&self, id: &InstanceId) -> Result<InstanceRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_instance(row),
                None => Err(StoreError::NotFound(format!("instance {id}"))),
            }
        })
    }

    #[instrument(skip(self), fields(instance_id = %id, status = %status))]
    pub fn set_status(&self, id: &InstanceId, status: InstanceStatus) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE instances SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![status.to_string(), now, id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self, output), fields(instance_id = %id))]
    pub fn complete(&self, id: &InstanceId, output: &Value) -> Result<(), StoreError> {
        let raw = serde_json::to_string(output)?;
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE instances SET status = 'completed', output = ?1, updated_at = ?2
                 WHERE id = ?3",
                rusqlite::params![raw, now, id.as_str()],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(instance_id = %id))]
    pub fn fail(&self, id: &InstanceId, error: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE instances SET status = 'failed', error = ?1, updated_at = ?2
                 WHERE id = ?3",
                rusqlite::params![error, now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Caller-visible progress snapshot, replaced wholesale on each call.
    #[instrument(skip(self, status), fields(instance_id = %id))]
    pub fn set_custom_status(&self, id: &InstanceId, status: &Value) -> Result<(), StoreError> {
        let raw = serde_json::to_string(status)?;
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE instances SET custom_status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![raw, now, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Bump and return the per-instance resolution counter. The returned
    /// value stamps a resolving history record so completion order survives
    /// replay. Both statements run under the connection lock.
    pub fn next_resolution_order(&self, id: &InstanceId) -> Result<u32, StoreError> {
        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE instances SET resolution_counter = resolution_counter + 1 WHERE id = ?1",
                [id.as_str()],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("instance {id}")));
            }
            let order: u32 = conn.query_row(
                "SELECT resolution_counter FROM instances WHERE id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )?;
            Ok(order)
        })
    }

    /// Instances that still need driving after a restart.
    #[instrument(skip(self))]
    pub fn list_non_terminal(&self) -> Result<Vec<InstanceRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INSTANCE_COLUMNS} FROM instances
                 WHERE status IN ('running', 'pending') ORDER BY created_at"
            ))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_instance(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_instance(row: &rusqlite::Row<'_>) -> Result<InstanceRow, StoreError> {
    let raw_id: String = row_helpers::get(row, 0, "instances", "id")?;
    let raw_input: String = row_helpers::get(row, 2, "instances", "input")?;
    let raw_status: String = row_helpers::get(row, 3, "instances", "status")?;
    let raw_output: Option<String> = row_helpers::get_opt(row, 4, "instances", "output")?;
    let raw_custom: Option<String> = row_helpers::get_opt(row, 6, "instances", "custom_status")?;
    let raw_parent: Option<String> =
        row_helpers::get_opt(row, 7, "instances", "parent_instance_id")?;

    Ok(InstanceRow {
        id: InstanceId::from_raw(raw_id),
        orchestration: row_helpers::get(row, 1, "instances", "orchestration")?,
        input: row_helpers::parse_json(&raw_input, "instances", "input")?,
        status: row_helpers::parse_enum(&raw_status, "instances", "status")?,
        output: raw_output
            .map(|r| row_helpers::parse_json(&r, "instances", "output"))
            .transpose()?,
        error: row_helpers::get_opt(row, 5, "instances", "error")?,
        custom_status: raw_custom
            .map(|r| row_helpers::parse_json(&r, "instances", "custom_status"))
            .transpose()?,
        parent_instance_id: raw_parent.map(InstanceId::from_raw),
        parent_sequence_no: row_helpers::get_opt(row, 8, "instances", "parent_sequence_no")?,
        created_at: row_helpers::get(row, 9, "instances", "created_at")?,
        updated_at: row_helpers::get(row, 10, "instances", "updated_at")?,
    })
}
