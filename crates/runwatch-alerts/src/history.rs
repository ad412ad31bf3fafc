//! Append-only notification history, read by the UI as a feed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::db::{from_db_time, to_db_time};
use crate::error::{AlertError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    /// Push accepted by the transport.
    Delivered,
    /// Push rejected permanently or retries ran out.
    DeliveryFailed,
    /// Live alerts withdrawn because the resource stopped or state went stale.
    AlertsCancelled,
}

impl HistoryKind {
    fn as_str(&self) -> &'static str {
        match self {
            HistoryKind::Delivered => "delivered",
            HistoryKind::DeliveryFailed => "delivery_failed",
            HistoryKind::AlertsCancelled => "alerts_cancelled",
        }
    }
}

impl std::str::FromStr for HistoryKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "delivered" => Ok(HistoryKind::Delivered),
            "delivery_failed" => Ok(HistoryKind::DeliveryFailed),
            "alerts_cancelled" => Ok(HistoryKind::AlertsCancelled),
            other => Err(format!("unknown history kind: {other}")),
        }
    }
}

/// One immutable history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub kind: HistoryKind,
    pub title: String,
    pub body: String,
    pub resource_id: String,
    pub resource_name: String,
    pub region: String,
    pub alert_id: Option<String>,
    pub threshold_minutes: Option<u32>,
    pub runtime_minutes: Option<i64>,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub data: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    /// A new entry with a fresh UUIDv7 id and empty optional fields.
    pub fn new(
        kind: HistoryKind,
        resource_id: &str,
        resource_name: &str,
        region: &str,
        title: &str,
        body: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            kind,
            title: title.to_string(),
            body: body.to_string(),
            resource_id: resource_id.to_string(),
            resource_name: resource_name.to_string(),
            region: region.to_string(),
            alert_id: None,
            threshold_minutes: None,
            runtime_minutes: None,
            message_id: None,
            error: None,
            data: BTreeMap::new(),
            created_at: at,
        }
    }
}

/// Writer and reader for the `notification_history` table.
///
/// There is no update or delete path: entries are only ever appended.
#[derive(Clone)]
pub struct HistoryLog {
    conn: Arc<Mutex<Connection>>,
}

impl HistoryLog {
    /// Share a connection whose schema was created by `db::init_db`.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| AlertError::LockPoisoned)
    }

    pub fn append(&self, entry: &HistoryEntry) -> Result<()> {
        let data = serde_json::to_string(&entry.data)?;
        let db = self.lock()?;
        db.execute(
            "INSERT INTO notification_history
             (id, kind, title, body, resource_id, resource_name, region, alert_id,
              threshold_minutes, runtime_minutes, message_id, error, data, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            rusqlite::params![
                entry.id,
                entry.kind.as_str(),
                entry.title,
                entry.body,
                entry.resource_id,
                entry.resource_name,
                entry.region,
                entry.alert_id,
                entry.threshold_minutes,
                entry.runtime_minutes,
                entry.message_id,
                entry.error,
                data,
                to_db_time(entry.created_at),
            ],
        )?;
        debug!(kind = entry.kind.as_str(), resource_id = %entry.resource_id, "history appended");
        Ok(())
    }

    /// Most recent entries across all resources, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.select(None, limit)
    }

    /// Most recent entries for one resource, newest first.
    pub fn for_resource(&self, resource_id: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.select(Some(resource_id), limit)
    }

    fn select(&self, resource_id: Option<&str>, limit: usize) -> Result<Vec<HistoryEntry>> {
        let db = self.lock()?;
        // UUIDv7 ids sort by creation, which breaks ties inside one millisecond.
        let mut stmt = db.prepare(
            "SELECT id, kind, title, body, resource_id, resource_name, region, alert_id,
                    threshold_minutes, runtime_minutes, message_id, error, data, created_at
             FROM notification_history
             WHERE (?1 IS NULL OR resource_id = ?1)
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![resource_id, limit as i64], |row| {
            let kind: String = row.get(1)?;
            let data: String = row.get(12)?;
            Ok((
                HistoryEntry {
                    id: row.get(0)?,
                    kind: kind.parse().map_err(|e: String| {
                        rusqlite::Error::FromSqlConversionFailure(
                            1,
                            rusqlite::types::Type::Text,
                            e.into(),
                        )
                    })?,
                    title: row.get(2)?,
                    body: row.get(3)?,
                    resource_id: row.get(4)?,
                    resource_name: row.get(5)?,
                    region: row.get(6)?,
                    alert_id: row.get(7)?,
                    threshold_minutes: row.get(8)?,
                    runtime_minutes: row.get(9)?,
                    message_id: row.get(10)?,
                    error: row.get(11)?,
                    data: BTreeMap::new(),
                    created_at: from_db_time(13, &row.get::<_, String>(13)?)?,
                },
                data,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (mut entry, data) = row?;
            entry.data = serde_json::from_str(&data)?;
            out.push(entry);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AlertStore;
    use chrono::{Duration, TimeZone};

    #[test]
    fn feed_is_newest_first_and_filterable() {
        let store = AlertStore::open_in_memory().unwrap();
        let log = HistoryLog::new(store.connection());
        let t0 = Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap();

        let mut first = HistoryEntry::new(HistoryKind::Delivered, "i-1", "web", "r1", "t", "b", t0);
        first.data.insert("threshold".into(), "30".into());
        log.append(&first).unwrap();
        log.append(&HistoryEntry::new(
            HistoryKind::AlertsCancelled,
            "i-2",
            "db",
            "r1",
            "t",
            "b",
            t0 + Duration::minutes(1),
        ))
        .unwrap();

        let recent = log.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].resource_id, "i-2");

        let only = log.for_resource("i-1", 10).unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].kind, HistoryKind::Delivered);
        assert_eq!(only[0].data.get("threshold").map(String::as_str), Some("30"));

        assert_eq!(log.recent(1).unwrap().len(), 1);
    }
}
