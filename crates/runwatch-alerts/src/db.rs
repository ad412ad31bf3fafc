use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::Result;

/// Initialise the alert schema in `conn`.
///
/// Creates the `alerts` and `notification_history` tables (idempotent) plus
/// the indexes the dispatch query and per-resource lookups rely on.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS alerts (
            id                TEXT    NOT NULL PRIMARY KEY,  -- region_resource_threshold
            resource_id       TEXT    NOT NULL,
            resource_name     TEXT    NOT NULL,
            region            TEXT    NOT NULL,
            launch_time       TEXT    NOT NULL,
            threshold_minutes INTEGER NOT NULL,
            scheduled_time    TEXT    NOT NULL,   -- launch_time + threshold
            status            TEXT    NOT NULL DEFAULT 'pending',
            resource_state    TEXT    NOT NULL DEFAULT 'running',
            deleted           INTEGER NOT NULL DEFAULT 0,
            delivery_target   TEXT    NOT NULL,
            attempts          INTEGER NOT NULL DEFAULT 0,
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL,
            last_error_at     TEXT,
            error             TEXT
        ) STRICT;

        -- Dispatch scan: status/deleted/state equality, then scheduled_time order.
        CREATE INDEX IF NOT EXISTS idx_alerts_due
            ON alerts (status, deleted, resource_state, scheduled_time);
        CREATE INDEX IF NOT EXISTS idx_alerts_resource
            ON alerts (resource_id, region);

        CREATE TABLE IF NOT EXISTS notification_history (
            id                TEXT    NOT NULL PRIMARY KEY,  -- UUIDv7, time-sortable
            kind              TEXT    NOT NULL,
            title             TEXT    NOT NULL,
            body              TEXT    NOT NULL,
            resource_id       TEXT    NOT NULL,
            resource_name     TEXT    NOT NULL,
            region            TEXT    NOT NULL,
            alert_id          TEXT,
            threshold_minutes INTEGER,
            runtime_minutes   INTEGER,
            message_id        TEXT,
            error             TEXT,
            data              TEXT    NOT NULL DEFAULT '{}',  -- JSON string map
            created_at        TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_history_resource
            ON notification_history (resource_id, created_at);
        ",
    )?;
    Ok(())
}

/// Fixed-width RFC 3339 so lexical order in SQLite equals time order.
pub(crate) fn to_db_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn from_db_time(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn db_time_orders_lexically() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(1500);
        assert!(to_db_time(a) < to_db_time(b));
        assert_eq!(from_db_time(0, &to_db_time(a)).unwrap().timestamp_millis(), a.timestamp_millis());
    }
}
