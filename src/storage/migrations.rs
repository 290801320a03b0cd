//! Database migrations for Steward

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    if current_version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Memories, snapshots, deliverables (v1)
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS memories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            project_id TEXT,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            entities TEXT NOT NULL DEFAULT '{}',
            importance REAL NOT NULL DEFAULT 0.5,
            origin_kind TEXT NOT NULL DEFAULT 'manual',
            origin_ref TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_referenced_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_memories_scope
            ON memories(user_id, active, project_id);
        CREATE INDEX IF NOT EXISTS idx_memories_hash
            ON memories(user_id, content_hash);

        CREATE TABLE IF NOT EXISTS memory_tags (
            memory_id INTEGER NOT NULL,
            tag TEXT NOT NULL COLLATE NOCASE,
            PRIMARY KEY (memory_id, tag),
            FOREIGN KEY (memory_id) REFERENCES memories(id) ON DELETE CASCADE
        );

        -- One row per (user, platform, resource); overwritten by each sync
        CREATE TABLE IF NOT EXISTS snapshots (
            user_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            synced_at TEXT NOT NULL,
            retained_until TEXT,
            PRIMARY KEY (user_id, platform, resource_id)
        );

        CREATE INDEX IF NOT EXISTS idx_snapshots_synced
            ON snapshots(user_id, platform, synced_at);

        CREATE TABLE IF NOT EXISTS deliverables (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            deliverable_type TEXT NOT NULL,
            schedule TEXT NOT NULL DEFAULT '{}',
            sources TEXT NOT NULL DEFAULT '[]',
            destination TEXT,
            state TEXT NOT NULL DEFAULT 'active',
            origin TEXT NOT NULL DEFAULT 'user',
            instructions TEXT,
            project_id TEXT,
            last_generated_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_deliverables_user
            ON deliverables(user_id, state);

        CREATE TABLE IF NOT EXISTS deliverable_versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            deliverable_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            content TEXT NOT NULL,
            trigger TEXT NOT NULL,
            ceiling_truncated INTEGER NOT NULL DEFAULT 0,
            delivered INTEGER NOT NULL DEFAULT 0,
            delivery_error TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(deliverable_id, version),
            FOREIGN KEY (deliverable_id) REFERENCES deliverables(id) ON DELETE CASCADE
        );

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

/// Sync task records and user preferences (v2)
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sync_tasks (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            resource_id TEXT,
            state TEXT NOT NULL DEFAULT 'pending',
            error TEXT,
            items_synced INTEGER NOT NULL DEFAULT 0,
            requested_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_tasks_user
            ON sync_tasks(user_id, platform, requested_at);

        CREATE TABLE IF NOT EXISTS preferences (
            user_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, key)
        );

        INSERT OR IGNORE INTO schema_version (version) VALUES (2);
        "#,
    )?;

    Ok(())
}

/// Content-change time on snapshots, separate from the sync time (v3)
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        ALTER TABLE snapshots ADD COLUMN changed_at TEXT;
        UPDATE snapshots SET changed_at = synced_at WHERE changed_at IS NULL;

        CREATE INDEX IF NOT EXISTS idx_snapshots_changed
            ON snapshots(user_id, platform, changed_at);

        INSERT OR IGNORE INTO schema_version (version) VALUES (3);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_v3_backfills_changed_at_from_synced_at() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )
        .unwrap();
        migrate_v1(&conn).unwrap();
        migrate_v2(&conn).unwrap();
        conn.execute(
            "INSERT INTO snapshots (user_id, platform, resource_id, content, synced_at)
             VALUES ('u1', 'slack', 'C1', 'hello', '2026-04-06T09:00:00.000Z')",
            [],
        )
        .unwrap();

        run_migrations(&conn).unwrap();

        let changed_at: String = conn
            .query_row("SELECT changed_at FROM snapshots", [], |row| row.get(0))
            .unwrap();
        assert_eq!(changed_at, "2026-04-06T09:00:00.000Z");
    }
}
