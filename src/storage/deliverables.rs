//! Deliverable and version queries

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::format_timestamp;
use crate::error::{Result, StewardError};
use crate::types::*;

const DELIVERABLE_COLUMNS: &str = "id, user_id, title, deliverable_type, schedule, sources,
    destination, state, origin, instructions, project_id, last_generated_at, created_at, updated_at";

fn conversion_error(e: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
}

fn deliverable_from_row(row: &Row) -> rusqlite::Result<Deliverable> {
    let deliverable_type: String = row.get("deliverable_type")?;
    let schedule: String = row.get("schedule")?;
    let sources: String = row.get("sources")?;
    let destination: Option<String> = row.get("destination")?;
    let state: String = row.get("state")?;
    let origin: String = row.get("origin")?;
    let last_generated_at: Option<String> = row.get("last_generated_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Deliverable {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        title: row.get("title")?,
        deliverable_type: deliverable_type.parse().map_err(conversion_error)?,
        schedule: serde_json::from_str(&schedule).unwrap_or_default(),
        sources: serde_json::from_str(&sources).unwrap_or_default(),
        destination: destination.and_then(|d| serde_json::from_str(&d).ok()),
        state: state.parse().map_err(conversion_error)?,
        origin: if origin == "emergent" {
            DeliverableOrigin::Emergent
        } else {
            DeliverableOrigin::User
        },
        instructions: row.get("instructions")?,
        project_id: row.get("project_id")?,
        last_generated_at: parse_optional_timestamp(last_generated_at),
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn version_from_row(row: &Row) -> rusqlite::Result<DeliverableVersion> {
    let trigger: String = row.get("trigger")?;
    let created_at: String = row.get("created_at")?;
    Ok(DeliverableVersion {
        id: row.get("id")?,
        deliverable_id: row.get("deliverable_id")?,
        version: row.get("version")?,
        content: row.get("content")?,
        trigger: trigger.parse().map_err(conversion_error)?,
        ceiling_truncated: row.get::<_, i32>("ceiling_truncated")? != 0,
        delivered: row.get::<_, i32>("delivered")? != 0,
        delivery_error: row.get("delivery_error")?,
        created_at: parse_timestamp(&created_at),
    })
}

fn origin_str(origin: DeliverableOrigin) -> &'static str {
    match origin {
        DeliverableOrigin::User => "user",
        DeliverableOrigin::Emergent => "emergent",
    }
}

pub fn create_deliverable(conn: &Connection, input: &CreateDeliverableInput) -> Result<Deliverable> {
    if input.title.trim().is_empty() {
        return Err(StewardError::InvalidInput(
            "deliverable title cannot be empty".to_string(),
        ));
    }

    let id = Uuid::new_v4().to_string();
    let now = format_timestamp(Utc::now());
    let destination = input
        .destination
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO deliverables (id, user_id, title, deliverable_type, schedule, sources,
                                   destination, state, origin, instructions, project_id,
                                   created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, ?, ?, ?)",
        params![
            id,
            input.user_id,
            input.title.trim(),
            input.deliverable_type.as_str(),
            serde_json::to_string(&input.schedule)?,
            serde_json::to_string(&input.sources)?,
            destination,
            origin_str(input.origin),
            input.instructions,
            input.project_id,
            now,
            now,
        ],
    )?;

    get_deliverable(conn, &input.user_id, &id)
}

pub fn get_deliverable(conn: &Connection, user_id: &str, id: &str) -> Result<Deliverable> {
    let sql = format!(
        "SELECT {} FROM deliverables WHERE id = ? AND user_id = ?",
        DELIVERABLE_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.query_row(params![id, user_id], deliverable_from_row)
        .optional()?
        .ok_or_else(|| StewardError::NotFound(format!("deliverable {}", id)))
}

/// Deliverables for a user, optionally filtered by state
pub fn list_deliverables(
    conn: &Connection,
    user_id: &str,
    state: Option<DeliverableState>,
) -> Result<Vec<Deliverable>> {
    let deliverables = match state {
        Some(state) => {
            let sql = format!(
                "SELECT {} FROM deliverables WHERE user_id = ? AND state = ? ORDER BY created_at",
                DELIVERABLE_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(params![user_id, state.as_str()], deliverable_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
        None => {
            let sql = format!(
                "SELECT {} FROM deliverables WHERE user_id = ? ORDER BY created_at",
                DELIVERABLE_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(params![user_id], deliverable_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
    };
    Ok(deliverables)
}

/// Users owning at least one active deliverable or any snapshot
pub fn list_active_users(conn: &Connection) -> Result<Vec<UserId>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM deliverables WHERE state = 'active'
         UNION
         SELECT user_id FROM snapshots
         ORDER BY user_id",
    )?;
    let users = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(users)
}

pub fn update_deliverable(
    conn: &Connection,
    user_id: &str,
    id: &str,
    input: &UpdateDeliverableInput,
) -> Result<Deliverable> {
    let mut deliverable = get_deliverable(conn, user_id, id)?;

    if let Some(ref title) = input.title {
        if title.trim().is_empty() {
            return Err(StewardError::InvalidInput(
                "deliverable title cannot be empty".to_string(),
            ));
        }
        deliverable.title = title.trim().to_string();
    }
    if let Some(state) = input.state {
        deliverable.state = state;
    }
    if let Some(schedule) = input.schedule {
        deliverable.schedule = schedule;
    }
    if let Some(ref sources) = input.sources {
        deliverable.sources = sources.clone();
    }
    if let Some(ref destination) = input.destination {
        deliverable.destination = Some(destination.clone());
    }
    if let Some(ref instructions) = input.instructions {
        deliverable.instructions = Some(instructions.clone());
    }

    let destination = deliverable
        .destination
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "UPDATE deliverables SET title = ?, state = ?, schedule = ?, sources = ?,
                destination = ?, instructions = ?, updated_at = ?
         WHERE id = ? AND user_id = ?",
        params![
            deliverable.title,
            deliverable.state.as_str(),
            serde_json::to_string(&deliverable.schedule)?,
            serde_json::to_string(&deliverable.sources)?,
            destination,
            deliverable.instructions,
            format_timestamp(Utc::now()),
            id,
            user_id,
        ],
    )?;

    get_deliverable(conn, user_id, id)
}

pub fn set_state(
    conn: &Connection,
    user_id: &str,
    id: &str,
    state: DeliverableState,
) -> Result<Deliverable> {
    update_deliverable(
        conn,
        user_id,
        id,
        &UpdateDeliverableInput {
            state: Some(state),
            ..Default::default()
        },
    )
}

/// Persist a new version and advance `last_generated_at` together.
///
/// Must run inside a transaction so a failed insert leaves the deliverable untouched.
pub fn record_generation(
    conn: &Connection,
    deliverable_id: &str,
    content: &str,
    trigger: TriggerKind,
    ceiling_truncated: bool,
    generated_at: DateTime<Utc>,
) -> Result<DeliverableVersion> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM deliverable_versions WHERE deliverable_id = ?",
        [deliverable_id],
        |row| row.get(0),
    )?;
    let at = format_timestamp(generated_at);

    conn.execute(
        "INSERT INTO deliverable_versions (deliverable_id, version, content, trigger,
                                           ceiling_truncated, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            deliverable_id,
            next,
            content,
            trigger.as_str(),
            ceiling_truncated as i32,
            at
        ],
    )?;
    let version_id = conn.last_insert_rowid();

    let changed = conn.execute(
        "UPDATE deliverables SET last_generated_at = ?, updated_at = ? WHERE id = ?",
        params![at, at, deliverable_id],
    )?;
    if changed == 0 {
        return Err(StewardError::NotFound(format!(
            "deliverable {}",
            deliverable_id
        )));
    }

    get_version(conn, version_id)
}

fn get_version(conn: &Connection, version_id: i64) -> Result<DeliverableVersion> {
    conn.query_row(
        "SELECT id, deliverable_id, version, content, trigger, ceiling_truncated, delivered,
                delivery_error, created_at
         FROM deliverable_versions WHERE id = ?",
        [version_id],
        version_from_row,
    )
    .optional()?
    .ok_or_else(|| StewardError::NotFound(format!("version #{}", version_id)))
}

/// Record the outcome of delivering a version
pub fn mark_delivery(
    conn: &Connection,
    version_id: i64,
    delivered: bool,
    error: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE deliverable_versions SET delivered = ?, delivery_error = ? WHERE id = ?",
        params![delivered as i32, error, version_id],
    )?;
    Ok(())
}

/// Versions of a deliverable, newest first
pub fn list_versions(
    conn: &Connection,
    deliverable_id: &str,
    limit: usize,
) -> Result<Vec<DeliverableVersion>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, deliverable_id, version, content, trigger, ceiling_truncated, delivered,
                delivery_error, created_at
         FROM deliverable_versions WHERE deliverable_id = ?
         ORDER BY version DESC LIMIT ?",
    )?;
    let versions = stmt
        .query_map(params![deliverable_id, limit as i64], version_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(versions)
}

/// Any non-archived deliverable already anchored on this exact resource
pub fn find_covering(
    conn: &Connection,
    user_id: &str,
    anchor: &SourceRef,
) -> Result<Option<Deliverable>> {
    let resource_id = match &anchor.resource_id {
        Some(r) => r,
        None => return Ok(None),
    };
    let candidates = list_deliverables(conn, user_id, None)?;
    Ok(candidates.into_iter().find(|d| {
        d.state != DeliverableState::Archived
            && d.sources
                .iter()
                .any(|s| s.platform == anchor.platform && s.resource_id.as_deref() == Some(resource_id))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn input(title: &str) -> CreateDeliverableInput {
        CreateDeliverableInput {
            user_id: "u1".to_string(),
            title: title.to_string(),
            deliverable_type: DeliverableType::StatusReport,
            sources: vec![SourceRef::platform(Platform::Slack)],
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_get() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let created = create_deliverable(conn, &input("Weekly status"))?;
                let fetched = get_deliverable(conn, "u1", &created.id)?;
                assert_eq!(fetched.title, "Weekly status");
                assert_eq!(fetched.state, DeliverableState::Active);
                assert_eq!(fetched.sources, vec![SourceRef::platform(Platform::Slack)]);
                assert!(fetched.last_generated_at.is_none());

                // other users cannot see it
                assert!(get_deliverable(conn, "u2", &created.id).is_err());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_record_generation_numbers_versions() {
        let storage = Storage::open_in_memory().unwrap();
        let created = storage
            .with_connection(|conn| create_deliverable(conn, &input("Digest")))
            .unwrap();

        for expected in 1..=3 {
            let version = storage
                .with_transaction(|conn| {
                    record_generation(conn, &created.id, "body", TriggerKind::Schedule, false, Utc::now())
                })
                .unwrap();
            assert_eq!(version.version, expected);
        }

        storage
            .with_connection(|conn| {
                let versions = list_versions(conn, &created.id, 10)?;
                assert_eq!(versions.len(), 3);
                assert_eq!(versions[0].version, 3);
                assert!(get_deliverable(conn, "u1", &created.id)?.last_generated_at.is_some());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_state_transitions() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let created = create_deliverable(conn, &input("Report"))?;
                set_state(conn, "u1", &created.id, DeliverableState::Paused)?;
                assert!(list_deliverables(conn, "u1", Some(DeliverableState::Active))?.is_empty());
                assert_eq!(list_deliverables(conn, "u1", Some(DeliverableState::Paused))?.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_find_covering_anchor() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let mut prep = input("Prep: design review");
                prep.deliverable_type = DeliverableType::MeetingPrep;
                prep.sources = vec![SourceRef::resource(Platform::Calendar, "evt-1")];
                create_deliverable(conn, &prep)?;

                let anchor = SourceRef::resource(Platform::Calendar, "evt-1");
                assert!(find_covering(conn, "u1", &anchor)?.is_some());
                let other = SourceRef::resource(Platform::Calendar, "evt-2");
                assert!(find_covering(conn, "u1", &other)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_empty_title_rejected() {
        let storage = Storage::open_in_memory().unwrap();
        let result = storage.with_connection(|conn| create_deliverable(conn, &input("  ")));
        assert!(matches!(result, Err(StewardError::InvalidInput(_))));
    }
}
