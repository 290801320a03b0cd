//! Per-user key/value preferences (timezone, email, internal domains)

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;

use super::format_timestamp;
use crate::error::Result;

pub const TIMEZONE: &str = "timezone";
pub const EMAIL: &str = "email";
/// Comma-separated list of domains treated as internal by triage
pub const INTERNAL_DOMAINS: &str = "internal_domains";

pub fn get_preference(conn: &Connection, user_id: &str, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM preferences WHERE user_id = ? AND key = ?",
            params![user_id, key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub fn set_preference(conn: &Connection, user_id: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO preferences (user_id, key, value, updated_at) VALUES (?, ?, ?, ?)
         ON CONFLICT(user_id, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![user_id, key, value, format_timestamp(Utc::now())],
    )?;
    Ok(())
}

pub fn list_preferences(conn: &Connection, user_id: &str) -> Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM preferences WHERE user_id = ?")?;
    let prefs = stmt
        .query_map([user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<HashMap<String, String>>>()?;
    Ok(prefs)
}

/// Domains considered internal: the explicit list plus the user's own email domain
pub fn internal_domains(conn: &Connection, user_id: &str) -> Result<Vec<String>> {
    let mut domains: Vec<String> = get_preference(conn, user_id, INTERNAL_DOMAINS)?
        .map(|raw| {
            raw.split(',')
                .map(|d| d.trim().trim_start_matches('@').to_lowercase())
                .filter(|d| !d.is_empty())
                .collect()
        })
        .unwrap_or_default();

    if let Some(email) = get_preference(conn, user_id, EMAIL)? {
        if let Some((_, domain)) = email.rsplit_once('@') {
            let domain = domain.trim().to_lowercase();
            if !domain.is_empty() && !domains.contains(&domain) {
                domains.push(domain);
            }
        }
    }

    Ok(domains)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[test]
    fn test_set_overwrites() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                set_preference(conn, "u1", TIMEZONE, "UTC")?;
                set_preference(conn, "u1", TIMEZONE, "Europe/Berlin")?;
                assert_eq!(
                    get_preference(conn, "u1", TIMEZONE)?.as_deref(),
                    Some("Europe/Berlin")
                );
                assert!(get_preference(conn, "u2", TIMEZONE)?.is_none());
                assert_eq!(list_preferences(conn, "u1")?.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_internal_domains_include_own_email() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                set_preference(conn, "u1", INTERNAL_DOMAINS, "@Acme.io, subsidiary.com ,")?;
                set_preference(conn, "u1", EMAIL, "dana@acme.dev")?;
                let domains = internal_domains(conn, "u1")?;
                assert_eq!(domains, vec!["acme.io", "subsidiary.com", "acme.dev"]);
                Ok(())
            })
            .unwrap();
    }
}
