use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::error::{CountdownError, Result};
use crate::types::LocalCountdown;

/// Durable key-value storage for countdowns, keyed by resource id.
pub trait CountdownStorage: Send + Sync {
    fn save(&self, countdown: &LocalCountdown) -> Result<()>;
    fn load(&self, resource_id: &str) -> Result<Option<LocalCountdown>>;
    /// Returns whether a row existed.
    fn delete(&self, resource_id: &str) -> Result<bool>;
    fn list(&self) -> Result<Vec<LocalCountdown>>;
}

/// `local_countdowns` table in the client-side SQLite file.
#[derive(Clone)]
pub struct SqliteCountdownStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCountdownStorage {
    pub fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS local_countdowns (
                resource_id   TEXT    NOT NULL PRIMARY KEY,
                resource_name TEXT    NOT NULL,
                region        TEXT    NOT NULL,
                end_time      TEXT    NOT NULL,
                enabled       INTEGER NOT NULL DEFAULT 1
            ) STRICT;",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CountdownError::LockPoisoned)
    }
}

fn row_to_countdown(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalCountdown> {
    let end: String = row.get(3)?;
    let end_time = DateTime::parse_from_rfc3339(&end)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(LocalCountdown {
        resource_id: row.get(0)?,
        resource_name: row.get(1)?,
        region: row.get(2)?,
        end_time,
        enabled: row.get(4)?,
    })
}

impl CountdownStorage for SqliteCountdownStorage {
    fn save(&self, c: &LocalCountdown) -> Result<()> {
        let db = self.lock()?;
        db.execute(
            "INSERT INTO local_countdowns (resource_id, resource_name, region, end_time, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(resource_id) DO UPDATE SET
                resource_name = excluded.resource_name,
                region        = excluded.region,
                end_time      = excluded.end_time,
                enabled       = excluded.enabled",
            rusqlite::params![
                c.resource_id,
                c.resource_name,
                c.region,
                c.end_time.to_rfc3339_opts(SecondsFormat::Millis, true),
                c.enabled,
            ],
        )?;
        Ok(())
    }

    fn load(&self, resource_id: &str) -> Result<Option<LocalCountdown>> {
        let db = self.lock()?;
        let c = db
            .query_row(
                "SELECT resource_id, resource_name, region, end_time, enabled
                 FROM local_countdowns WHERE resource_id = ?1",
                [resource_id],
                row_to_countdown,
            )
            .optional()?;
        Ok(c)
    }

    fn delete(&self, resource_id: &str) -> Result<bool> {
        let db = self.lock()?;
        let n = db.execute("DELETE FROM local_countdowns WHERE resource_id = ?1", [resource_id])?;
        Ok(n > 0)
    }

    fn list(&self) -> Result<Vec<LocalCountdown>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT resource_id, resource_name, region, end_time, enabled
             FROM local_countdowns ORDER BY end_time",
        )?;
        let rows = stmt.query_map([], row_to_countdown)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
