//! Storage engine for Steward
//!
//! Handles SQLite database operations, WAL mode, and schema management.

mod connection;
pub mod deliverables;
mod migrations;
pub mod preferences;
pub mod queries;
pub mod snapshots;
pub mod sync_tasks;

pub use connection::Storage;
pub use migrations::SCHEMA_VERSION;

use chrono::{DateTime, SecondsFormat, Utc};

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text
pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let late = early + chrono::Duration::milliseconds(1500);
        assert!(format_timestamp(early) < format_timestamp(late));
        assert_eq!(format_timestamp(early).len(), format_timestamp(late).len());
    }
}
