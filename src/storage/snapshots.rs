//! Snapshot store queries
//!
//! Snapshots are idempotent overwrites keyed by (user, platform, resource):
//! the newest sync wins and `synced_at` always reflects that sync.
//! `changed_at` only moves when a sync brings different content or metadata,
//! so re-syncing an unchanged resource is not news to triage.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::format_timestamp;
use crate::error::Result;
use crate::types::*;

fn snapshot_from_row(row: &Row) -> rusqlite::Result<SyncSnapshot> {
    let platform: String = row.get("platform")?;
    let metadata: String = row.get("metadata")?;
    let synced_at: String = row.get("synced_at")?;
    let retained_until: Option<String> = row.get("retained_until")?;

    Ok(SyncSnapshot {
        platform: platform.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        user_id: row.get("user_id")?,
        resource_id: row.get("resource_id")?,
        content: row.get("content")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        synced_at: parse_timestamp(&synced_at),
        retained_until: parse_optional_timestamp(retained_until),
    })
}

/// Upper bound for in-process filtering scans
const SCAN_LIMIT: usize = 10_000;

const SNAPSHOT_COLUMNS: &str =
    "user_id, platform, resource_id, content, metadata, synced_at, retained_until";

/// Insert or overwrite a snapshot (last write wins, retention mark kept)
pub fn upsert_snapshot(conn: &Connection, snapshot: &SyncSnapshot) -> Result<()> {
    conn.execute(
        "INSERT INTO snapshots (user_id, platform, resource_id, content, metadata, synced_at, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(user_id, platform, resource_id) DO UPDATE SET
            changed_at = CASE
                WHEN snapshots.content != excluded.content
                  OR snapshots.metadata != excluded.metadata
                  OR snapshots.changed_at IS NULL
                THEN excluded.synced_at
                ELSE snapshots.changed_at
            END,
            content = excluded.content,
            metadata = excluded.metadata,
            synced_at = excluded.synced_at",
        params![
            snapshot.user_id,
            snapshot.platform.as_str(),
            snapshot.resource_id,
            snapshot.content,
            serde_json::to_string(&snapshot.metadata)?,
            format_timestamp(snapshot.synced_at),
        ],
    )?;
    Ok(())
}

pub fn get_snapshot(
    conn: &Connection,
    user_id: &str,
    platform: Platform,
    resource_id: &str,
) -> Result<Option<SyncSnapshot>> {
    let sql = format!(
        "SELECT {} FROM snapshots WHERE user_id = ? AND platform = ? AND resource_id = ?",
        SNAPSHOT_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query_map(
        params![user_id, platform.as_str(), resource_id],
        snapshot_from_row,
    )?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

/// Newest snapshots on a platform
pub fn list_snapshots(
    conn: &Connection,
    user_id: &str,
    platform: Platform,
    limit: usize,
) -> Result<Vec<SyncSnapshot>> {
    let sql = format!(
        "SELECT {} FROM snapshots WHERE user_id = ? AND platform = ?
         ORDER BY synced_at DESC LIMIT ?",
        SNAPSHOT_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let snapshots = stmt
        .query_map(
            params![user_id, platform.as_str(), limit as i64],
            snapshot_from_row,
        )?
        .collect::<rusqlite::Result<_>>()?;
    Ok(snapshots)
}

/// Snapshots whose content contains every query term (case-insensitive)
pub fn search_snapshots(
    conn: &Connection,
    user_id: &str,
    platform: Platform,
    query: &str,
    limit: usize,
) -> Result<Vec<SyncSnapshot>> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .filter(|t| t.len() > 1)
        .collect();
    if terms.is_empty() {
        return list_snapshots(conn, user_id, platform, limit);
    }

    let candidates = list_snapshots(conn, user_id, platform, SCAN_LIMIT)?;
    let mut matched: Vec<SyncSnapshot> = candidates
        .into_iter()
        .filter(|s| {
            let haystack = format!("{} {}", s.content, s.metadata).to_lowercase();
            terms.iter().all(|term| haystack.contains(term.as_str()))
        })
        .collect();
    matched.truncate(limit);
    Ok(matched)
}

/// Every snapshot covered by any of `sources`, newest first
pub fn snapshots_for_sources(
    conn: &Connection,
    user_id: &str,
    sources: &[SourceRef],
    limit: usize,
) -> Result<Vec<SyncSnapshot>> {
    let mut platforms: Vec<Platform> = sources.iter().map(|s| s.platform).collect();
    platforms.sort();
    platforms.dedup();

    let mut found = Vec::new();
    for platform in platforms {
        let on_platform = list_snapshots(conn, user_id, platform, SCAN_LIMIT)?;
        found.extend(
            on_platform
                .into_iter()
                .filter(|s| sources.iter().any(|src| src.matches(s.platform, &s.resource_id))),
        );
    }

    found.sort_by(|a, b| b.synced_at.cmp(&a.synced_at));
    found.truncate(limit);
    Ok(found)
}

/// Most recent content change across the resources named by `sources`
pub fn latest_changed_at(
    conn: &Connection,
    user_id: &str,
    sources: &[SourceRef],
) -> Result<Option<DateTime<Utc>>> {
    let mut latest: Option<DateTime<Utc>> = None;
    for source in sources {
        let value: Option<String> = match &source.resource_id {
            Some(resource_id) => conn.query_row(
                "SELECT MAX(changed_at) FROM snapshots
                 WHERE user_id = ? AND platform = ? AND resource_id = ?",
                params![user_id, source.platform.as_str(), resource_id],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT MAX(changed_at) FROM snapshots WHERE user_id = ? AND platform = ?",
                params![user_id, source.platform.as_str()],
                |row| row.get(0),
            )?,
        };
        if let Some(ts) = parse_optional_timestamp(value) {
            latest = Some(latest.map_or(ts, |current| current.max(ts)));
        }
    }
    Ok(latest)
}

/// RFC 3339 `start` from an event snapshot's metadata
pub fn event_start(snapshot: &SyncSnapshot) -> Option<DateTime<Utc>> {
    snapshot
        .metadata
        .get("start")
        .and_then(|v| v.as_str())
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Snapshots on `platform` whose metadata holds a start time within the window
pub fn upcoming_events(
    conn: &Connection,
    user_id: &str,
    platform: Platform,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<(SyncSnapshot, DateTime<Utc>)>> {
    let all = list_snapshots(conn, user_id, platform, SCAN_LIMIT)?;
    let mut events: Vec<(SyncSnapshot, DateTime<Utc>)> = all
        .into_iter()
        .filter_map(|s| {
            let start = event_start(&s)?;
            (start >= from && start <= until).then_some((s, start))
        })
        .collect();
    events.sort_by_key(|(_, start)| *start);
    Ok(events)
}

/// Snapshots on platforms other than `exclude`
pub fn snapshots_excluding_platform(
    conn: &Connection,
    user_id: &str,
    exclude: Platform,
    limit: usize,
) -> Result<Vec<SyncSnapshot>> {
    let sql = format!(
        "SELECT {} FROM snapshots WHERE user_id = ? AND platform != ?
         ORDER BY synced_at DESC LIMIT ?",
        SNAPSHOT_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let snapshots = stmt
        .query_map(
            params![user_id, exclude.as_str(), limit as i64],
            snapshot_from_row,
        )?
        .collect::<rusqlite::Result<_>>()?;
    Ok(snapshots)
}

/// Extend retention of the snapshots covered by `sources`; never shortens it
pub fn mark_retained(
    conn: &Connection,
    user_id: &str,
    sources: &[SourceRef],
    until: DateTime<Utc>,
) -> Result<usize> {
    let until = format_timestamp(until);
    let mut marked = 0;
    for source in sources {
        marked += match &source.resource_id {
            Some(resource_id) => conn.execute(
                "UPDATE snapshots SET retained_until = ?
                 WHERE user_id = ? AND platform = ? AND resource_id = ?
                   AND (retained_until IS NULL OR retained_until < ?)",
                params![until, user_id, source.platform.as_str(), resource_id, until],
            )?,
            None => conn.execute(
                "UPDATE snapshots SET retained_until = ?
                 WHERE user_id = ? AND platform = ?
                   AND (retained_until IS NULL OR retained_until < ?)",
                params![until, user_id, source.platform.as_str(), until],
            )?,
        };
    }
    Ok(marked)
}

/// Latest sync time and item count per platform
pub fn platform_freshness(
    conn: &Connection,
    user_id: &str,
) -> Result<Vec<(Platform, DateTime<Utc>, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT platform, MAX(synced_at), COUNT(*) FROM snapshots
         WHERE user_id = ? GROUP BY platform ORDER BY platform",
    )?;
    let rows: Vec<(String, String, i64)> = stmt
        .query_map([user_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<_>>()?;

    Ok(rows
        .into_iter()
        .filter_map(|(platform, synced_at, count)| {
            platform
                .parse::<Platform>()
                .ok()
                .map(|p| (p, parse_timestamp(&synced_at), count))
        })
        .collect())
}
