//! Sync task status records

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::format_timestamp;
use crate::error::{Result, StewardError};
use crate::types::*;

const TASK_COLUMNS: &str =
    "id, user_id, platform, resource_id, state, error, items_synced, requested_at, started_at, completed_at";

fn task_from_row(row: &Row) -> rusqlite::Result<SyncTask> {
    let to_sql_err = |e: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    };
    let platform: String = row.get("platform")?;
    let state: String = row.get("state")?;
    let requested_at: String = row.get("requested_at")?;

    Ok(SyncTask {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        platform: platform.parse().map_err(to_sql_err)?,
        resource_id: row.get("resource_id")?,
        state: state.parse().map_err(to_sql_err)?,
        error: row.get("error")?,
        items_synced: row.get("items_synced")?,
        requested_at: parse_timestamp(&requested_at),
        started_at: parse_optional_timestamp(row.get("started_at")?),
        completed_at: parse_optional_timestamp(row.get("completed_at")?),
    })
}

/// Create a pending task record
pub fn insert_task(
    conn: &Connection,
    user_id: &str,
    platform: Platform,
    resource_id: Option<&str>,
    requested_at: DateTime<Utc>,
) -> Result<SyncTask> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sync_tasks (id, user_id, platform, resource_id, state, requested_at)
         VALUES (?, ?, ?, ?, 'pending', ?)",
        params![
            id,
            user_id,
            platform.as_str(),
            resource_id,
            format_timestamp(requested_at)
        ],
    )?;
    get_task(conn, &id)
}

pub fn get_task(conn: &Connection, id: &str) -> Result<SyncTask> {
    let sql = format!("SELECT {} FROM sync_tasks WHERE id = ?", TASK_COLUMNS);
    conn.query_row(&sql, [id], task_from_row)
        .optional()?
        .ok_or_else(|| StewardError::NotFound(format!("sync task {}", id)))
}

pub fn mark_running(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE sync_tasks SET state = 'running', started_at = ? WHERE id = ? AND state = 'pending'",
        params![format_timestamp(Utc::now()), id],
    )?;
    Ok(())
}

pub fn mark_completed(conn: &Connection, id: &str, items_synced: usize) -> Result<()> {
    conn.execute(
        "UPDATE sync_tasks SET state = 'completed', items_synced = ?, completed_at = ?, error = NULL
         WHERE id = ?",
        params![items_synced as i64, format_timestamp(Utc::now()), id],
    )?;
    Ok(())
}

pub fn mark_failed(conn: &Connection, id: &str, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE sync_tasks SET state = 'failed', error = ?, completed_at = ? WHERE id = ?",
        params![error, format_timestamp(Utc::now()), id],
    )?;
    Ok(())
}

/// Most recent tasks for a user, newest first
pub fn recent_tasks(conn: &Connection, user_id: &str, limit: usize) -> Result<Vec<SyncTask>> {
    let sql = format!(
        "SELECT {} FROM sync_tasks WHERE user_id = ? ORDER BY requested_at DESC LIMIT ?",
        TASK_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let tasks = stmt
        .query_map(params![user_id, limit as i64], task_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tasks)
}

/// Tasks left non-terminal by a previous process are failed on startup
pub fn fail_abandoned(conn: &Connection) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE sync_tasks SET state = 'failed', error = 'abandoned by previous process',
                completed_at = ?
         WHERE state IN ('pending', 'running')",
        params![format_timestamp(Utc::now())],
    )?;
    Ok(changed)
}
