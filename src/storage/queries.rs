//! Database queries for memory operations
//!
//! Memories are never hard-deleted: deletion flips `active` and every
//! read path filters on it.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use sha2::{Digest, Sha256};

use super::format_timestamp;
use crate::error::{Result, StewardError};
use crate::types::*;

const MEMORY_COLUMNS: &str = "id, user_id, project_id, content, embedding, entities, importance,
     origin_kind, origin_ref, active, created_at, updated_at, last_referenced_at";

/// Parse a memory from a database row (tags are loaded separately)
pub fn memory_from_row(row: &Row) -> rusqlite::Result<Memory> {
    let project_id: Option<String> = row.get("project_id")?;
    let embedding_bytes: Vec<u8> = row.get("embedding")?;
    let entities_str: String = row.get("entities")?;
    let origin_kind: String = row.get("origin_kind")?;
    let active: i32 = row.get("active")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let last_referenced_at: Option<String> = row.get("last_referenced_at")?;

    let scope = match project_id {
        Some(project_id) => MemoryScope::Project { project_id },
        None => MemoryScope::User,
    };

    Ok(Memory {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        scope,
        content: row.get("content")?,
        embedding: bytes_to_embedding(&embedding_bytes),
        tags: vec![],
        entities: serde_json::from_str(&entities_str).unwrap_or_default(),
        importance: row.get("importance")?,
        provenance: Provenance {
            kind: origin_kind.parse().unwrap_or_default(),
            reference: row.get("origin_ref")?,
        },
        active: active != 0,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
        last_referenced_at: parse_optional_timestamp(last_referenced_at),
    })
}

/// Serialize an embedding as little-endian f32 bytes
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute SHA256 hash of normalized content for exact duplicate detection
pub fn compute_content_hash(content: &str) -> String {
    let normalized = content
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

fn validate_importance(importance: f32) -> Result<f32> {
    if !(0.0..=1.0).contains(&importance) || importance.is_nan() {
        return Err(StewardError::InvalidInput(format!(
            "importance must be within [0, 1], got {}",
            importance
        )));
    }
    Ok(importance)
}

/// Load tags for a memory
pub fn load_tags(conn: &Connection, memory_id: MemoryId) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare_cached("SELECT tag FROM memory_tags WHERE memory_id = ? ORDER BY tag")?;

    let tags: Vec<String> = stmt
        .query_map([memory_id], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(tags)
}

fn save_tags(conn: &Connection, memory_id: MemoryId, tags: &[String]) -> Result<()> {
    conn.execute("DELETE FROM memory_tags WHERE memory_id = ?", [memory_id])?;
    for tag in tags {
        let tag = tag.trim();
        if tag.is_empty() {
            continue;
        }
        conn.execute(
            "INSERT OR IGNORE INTO memory_tags (memory_id, tag) VALUES (?, ?)",
            params![memory_id, tag],
        )?;
    }
    Ok(())
}

/// Insert a memory. The embedding is computed by the caller.
pub fn create_memory(
    conn: &Connection,
    input: &CreateMemoryInput,
    embedding: &[f32],
) -> Result<Memory> {
    if input.content.trim().is_empty() {
        return Err(StewardError::InvalidInput(
            "memory content cannot be empty".to_string(),
        ));
    }
    let importance = validate_importance(input.importance.unwrap_or(0.5))?;
    let now = format_timestamp(Utc::now());

    conn.execute(
        "INSERT INTO memories (user_id, project_id, content, content_hash, embedding, entities,
                               importance, origin_kind, origin_ref, active, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        params![
            input.user_id,
            input.scope.project_id(),
            input.content,
            compute_content_hash(&input.content),
            embedding_to_bytes(embedding),
            serde_json::to_string(&input.entities)?,
            importance,
            input.provenance.kind.as_str(),
            input.provenance.reference,
            now,
            now,
        ],
    )?;

    let id = conn.last_insert_rowid();
    save_tags(conn, id, &input.tags)?;

    get_memory(conn, &input.user_id, id)
}

/// Fetch a memory owned by `user_id`, including soft-deleted ones
pub fn get_memory(conn: &Connection, user_id: &str, id: MemoryId) -> Result<Memory> {
    let sql = format!(
        "SELECT {} FROM memories WHERE id = ? AND user_id = ?",
        MEMORY_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut memory = stmt
        .query_row(params![id, user_id], memory_from_row)
        .map_err(|_| StewardError::NotFound(format!("memory #{}", id)))?;
    memory.tags = load_tags(conn, id)?;
    Ok(memory)
}

fn scope_clause(scope: &MemoryScope) -> (&'static str, Option<String>) {
    match scope {
        MemoryScope::User => (" AND project_id IS NULL", None),
        MemoryScope::Project { project_id } => (
            " AND (project_id IS NULL OR project_id = ?)",
            Some(project_id.clone()),
        ),
    }
}

/// Every active memory visible under `scope`
pub fn visible_memories(
    conn: &Connection,
    user_id: &str,
    scope: &MemoryScope,
) -> Result<Vec<Memory>> {
    let (clause, project) = scope_clause(scope);
    let sql = format!(
        "SELECT {} FROM memories WHERE user_id = ? AND active = 1{}",
        MEMORY_COLUMNS, clause
    );
    let mut stmt = conn.prepare(&sql)?;

    let mut memories: Vec<Memory> = match project {
        Some(project_id) => stmt
            .query_map(params![user_id, project_id], memory_from_row)?
            .collect::<rusqlite::Result<_>>()?,
        None => stmt
            .query_map(params![user_id], memory_from_row)?
            .collect::<rusqlite::Result<_>>()?,
    };

    for memory in &mut memories {
        memory.tags = load_tags(conn, memory.id)?;
    }

    Ok(memories)
}

/// List memories for display, newest first
pub fn list_memories(
    conn: &Connection,
    user_id: &str,
    scope: &MemoryScope,
    include_inactive: bool,
    limit: usize,
) -> Result<Vec<Memory>> {
    let mut memories = if include_inactive {
        let sql = format!(
            "SELECT {} FROM memories WHERE user_id = ? ORDER BY updated_at DESC",
            MEMORY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let all: Vec<Memory> = stmt
            .query_map(params![user_id], memory_from_row)?
            .collect::<rusqlite::Result<_>>()?;
        all.into_iter()
            .filter(|m| scope.admits(&m.scope))
            .collect::<Vec<_>>()
    } else {
        let mut visible = visible_memories(conn, user_id, scope)?;
        visible.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        visible
    };

    memories.truncate(limit);
    for memory in &mut memories {
        if memory.tags.is_empty() {
            memory.tags = load_tags(conn, memory.id)?;
        }
    }
    Ok(memories)
}

/// Find an active memory with identical normalized content in the same scope
pub fn find_by_content_hash(
    conn: &Connection,
    user_id: &str,
    scope: &MemoryScope,
    content_hash: &str,
) -> Result<Option<Memory>> {
    let sql = format!(
        "SELECT {} FROM memories
         WHERE user_id = ? AND content_hash = ? AND active = 1
           AND project_id IS ?
         LIMIT 1",
        MEMORY_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let found = stmt.query_row(
        params![user_id, content_hash, scope.project_id()],
        memory_from_row,
    );

    match found {
        Ok(mut memory) => {
            memory.tags = load_tags(conn, memory.id)?;
            Ok(Some(memory))
        }
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StewardError::Database(e)),
    }
}

/// Adjust importance and/or tags
pub fn update_memory(
    conn: &Connection,
    user_id: &str,
    id: MemoryId,
    input: &UpdateMemoryInput,
) -> Result<Memory> {
    let existing = get_memory(conn, user_id, id)?;
    if !existing.active {
        return Err(StewardError::InvalidInput(format!(
            "memory #{} has been deleted",
            id
        )));
    }

    let now = format_timestamp(Utc::now());
    if let Some(importance) = input.importance {
        let importance = validate_importance(importance)?;
        conn.execute(
            "UPDATE memories SET importance = ?, updated_at = ? WHERE id = ?",
            params![importance, now, id],
        )?;
    }
    if let Some(ref tags) = input.tags {
        save_tags(conn, id, tags)?;
        conn.execute(
            "UPDATE memories SET updated_at = ? WHERE id = ?",
            params![now, id],
        )?;
    }

    get_memory(conn, user_id, id)
}

/// Soft delete; the row is retained for audit
pub fn soft_delete_memory(conn: &Connection, user_id: &str, id: MemoryId) -> Result<()> {
    let changed = conn.execute(
        "UPDATE memories SET active = 0, updated_at = ? WHERE id = ? AND user_id = ?",
        params![format_timestamp(Utc::now()), id, user_id],
    )?;
    if changed == 0 {
        return Err(StewardError::NotFound(format!("memory #{}", id)));
    }
    Ok(())
}

/// Record that memories were surfaced by a retrieval
pub fn touch_references(conn: &Connection, ids: &[MemoryId], at: DateTime<Utc>) -> Result<()> {
    let at = format_timestamp(at);
    let mut stmt = conn.prepare_cached("UPDATE memories SET last_referenced_at = ? WHERE id = ?")?;
    for id in ids {
        stmt.execute(params![at, id])?;
    }
    Ok(())
}

/// Exponentially decay importance of memories not referenced within one half-life.
///
/// Elapsed time is measured from the later of the last reference and the last
/// update, and `updated_at` is advanced, so repeated runs compose instead of
/// compounding. Returns the number of memories changed.
pub fn decay_importance(
    conn: &Connection,
    user_id: &str,
    half_life_days: f64,
    floor: f32,
    now: DateTime<Utc>,
) -> Result<usize> {
    if half_life_days <= 0.0 {
        return Err(StewardError::InvalidInput(
            "half_life_days must be positive".to_string(),
        ));
    }

    let mut stmt = conn.prepare(
        "SELECT id, importance, updated_at, last_referenced_at, created_at
         FROM memories WHERE user_id = ? AND active = 1",
    )?;
    let rows: Vec<(MemoryId, f32, String, Option<String>, String)> = stmt
        .query_map([user_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })?
        .collect::<rusqlite::Result<_>>()?;

    let mut changed = 0;
    for (id, importance, updated_at, last_referenced_at, created_at) in rows {
        let last_reference = parse_optional_timestamp(last_referenced_at)
            .unwrap_or_else(|| parse_timestamp(&created_at));
        let idle_days = (now - last_reference).num_seconds() as f64 / 86_400.0;
        if idle_days < half_life_days {
            continue;
        }

        let anchor = last_reference.max(parse_timestamp(&updated_at));
        let elapsed_days = ((now - anchor).num_seconds() as f64 / 86_400.0).max(0.0);
        let factor = 0.5_f64.powf(elapsed_days / half_life_days) as f32;
        let decayed = (importance * factor).max(floor);

        if (decayed - importance).abs() > f32::EPSILON {
            conn.execute(
                "UPDATE memories SET importance = ?, updated_at = ? WHERE id = ?",
                params![decayed, format_timestamp(now), id],
            )?;
            changed += 1;
        }
    }

    Ok(changed)
}
