use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use runwatch_core::{AlertStatus, ResourceState};
use tracing::{debug, instrument};

use crate::db::{from_db_time, init_db, to_db_time};
use crate::error::{AlertError, Result};
use crate::types::AlertRecord;

const SELECT_COLUMNS: &str = "SELECT id, resource_id, resource_name, region, launch_time,
        threshold_minutes, scheduled_time, status, resource_state, deleted,
        delivery_target, attempts, created_at, updated_at, last_error_at, error
 FROM alerts";

/// Equality filters for [`AlertStore::query`]. Unset fields don't filter.
///
/// Results are always ordered by `scheduled_time` ascending (ties broken by
/// threshold), which is the order the dispatch loop consumes them in.
#[derive(Debug, Clone, Default)]
pub struct AlertQuery {
    pub status: Option<AlertStatus>,
    pub deleted: Option<bool>,
    pub resource_state: Option<ResourceState>,
    pub resource_id: Option<String>,
    pub region: Option<String>,
    pub scheduled_at_or_before: Option<DateTime<Utc>>,
}

impl AlertQuery {
    /// `status=pending AND deleted=false AND resource_state=running` in `region`.
    pub fn dispatch_scan(region: &str) -> Self {
        Self {
            status: Some(AlertStatus::Pending),
            deleted: Some(false),
            resource_state: Some(ResourceState::Running),
            region: Some(region.to_string()),
            ..Default::default()
        }
    }

    /// Every non-deleted record for one resource, whatever its status.
    pub fn live_for(resource_id: &str, region: &str) -> Self {
        Self {
            deleted: Some(false),
            resource_id: Some(resource_id.to_string()),
            region: Some(region.to_string()),
            ..Default::default()
        }
    }

    fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(status) = self.status {
            clauses.push("status = ?");
            values.push(Value::Text(status.to_string()));
        }
        if let Some(deleted) = self.deleted {
            clauses.push("deleted = ?");
            values.push(Value::Integer(deleted as i64));
        }
        if let Some(ref state) = self.resource_state {
            clauses.push("resource_state = ?");
            values.push(Value::Text(state.as_str().to_string()));
        }
        if let Some(ref id) = self.resource_id {
            clauses.push("resource_id = ?");
            values.push(Value::Text(id.clone()));
        }
        if let Some(ref region) = self.region {
            clauses.push("region = ?");
            values.push(Value::Text(region.clone()));
        }
        if let Some(at) = self.scheduled_at_or_before {
            clauses.push("scheduled_time <= ?");
            values.push(Value::Text(to_db_time(at)));
        }

        let mut sql = SELECT_COLUMNS.to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY scheduled_time ASC, threshold_minutes ASC");
        (sql, values)
    }
}

/// SQLite-backed document store for [`AlertRecord`]s.
///
/// Pure persistence: no scheduling decisions are made here. Cloning is cheap
/// and every clone shares the same connection, so the registrar, tracker and
/// dispatcher all observe one another's writes immediately.
#[derive(Clone)]
pub struct AlertStore {
    conn: Arc<Mutex<Connection>>,
}

impl AlertStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// The shared connection, for components that keep their own tables in
    /// the same database (e.g. the history log).
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| AlertError::LockPoisoned)
    }

    pub fn get(&self, id: &str) -> Result<Option<AlertRecord>> {
        let db = self.lock()?;
        let rec = db
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                [id],
                row_to_record,
            )
            .optional()?;
        Ok(rec)
    }

    /// Insert or overwrite by id. The original `created_at` is preserved.
    #[instrument(skip(self, rec), fields(alert_id = %rec.id))]
    pub fn upsert(&self, rec: &AlertRecord) -> Result<()> {
        self.upsert_batch(std::slice::from_ref(rec))
    }

    /// Upsert several records in one transaction.
    pub fn upsert_batch(&self, records: &[AlertRecord]) -> Result<()> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO alerts
                 (id, resource_id, resource_name, region, launch_time, threshold_minutes,
                  scheduled_time, status, resource_state, deleted, delivery_target,
                  attempts, created_at, updated_at, last_error_at, error)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
                 ON CONFLICT(id) DO UPDATE SET
                    resource_id       = excluded.resource_id,
                    resource_name     = excluded.resource_name,
                    region            = excluded.region,
                    launch_time       = excluded.launch_time,
                    threshold_minutes = excluded.threshold_minutes,
                    scheduled_time    = excluded.scheduled_time,
                    status            = excluded.status,
                    resource_state    = excluded.resource_state,
                    deleted           = excluded.deleted,
                    delivery_target   = excluded.delivery_target,
                    attempts          = excluded.attempts,
                    updated_at        = excluded.updated_at,
                    last_error_at     = excluded.last_error_at,
                    error             = excluded.error",
            )?;
            for rec in records {
                stmt.execute(rusqlite::params![
                    rec.id,
                    rec.resource_id,
                    rec.resource_name,
                    rec.region,
                    to_db_time(rec.launch_time),
                    rec.threshold_minutes,
                    to_db_time(rec.scheduled_time),
                    rec.status.to_string(),
                    rec.resource_state.as_str(),
                    rec.deleted,
                    rec.delivery_target,
                    rec.attempts,
                    to_db_time(rec.created_at),
                    to_db_time(rec.updated_at),
                    rec.last_error_at.map(to_db_time),
                    rec.error,
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = records.len(), "alerts upserted");
        Ok(())
    }

    /// Query by predicate, ordered by `scheduled_time` ascending.
    pub fn query(&self, q: &AlertQuery) -> Result<Vec<AlertRecord>> {
        let (sql, values) = q.to_sql();
        let db = self.lock()?;
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn live_for_resource(&self, resource_id: &str, region: &str) -> Result<Vec<AlertRecord>> {
        self.query(&AlertQuery::live_for(resource_id, region))
    }

    /// Regions that currently hold at least one dispatchable candidate.
    pub fn pending_regions(&self) -> Result<Vec<String>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT DISTINCT region FROM alerts
             WHERE status = 'pending' AND deleted = 0 AND resource_state = 'running'
             ORDER BY region",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Soft-delete `ids` as `cancelled` in one transaction. Already-deleted
    /// rows are left alone. Returns how many rows changed.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub fn batch_delete(&self, ids: &[String], reason: &str, now: DateTime<Utc>) -> Result<usize> {
        let now = to_db_time(now);
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE alerts SET status = 'cancelled', deleted = 1, error = ?1, updated_at = ?2
                 WHERE id = ?3 AND deleted = 0",
            )?;
            for id in ids {
                changed += stmt.execute(rusqlite::params![reason, now, id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Soft-delete every live record of one resource in a single statement.
    #[instrument(skip(self, reason))]
    pub fn cancel_resource(
        &self,
        resource_id: &str,
        region: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let db = self.lock()?;
        let n = db.execute(
            "UPDATE alerts SET status = 'cancelled', deleted = 1, error = ?1, updated_at = ?2
             WHERE resource_id = ?3 AND region = ?4 AND deleted = 0",
            rusqlite::params![reason, to_db_time(now), resource_id, region],
        )?;
        Ok(n)
    }

    /// Mirror a non-halting lifecycle state onto the live records of a resource.
    pub fn update_resource_state(
        &self,
        resource_id: &str,
        region: &str,
        state: &ResourceState,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let db = self.lock()?;
        let n = db.execute(
            "UPDATE alerts SET resource_state = ?1, updated_at = ?2
             WHERE resource_id = ?3 AND region = ?4 AND deleted = 0",
            rusqlite::params![state.as_str(), to_db_time(now), resource_id, region],
        )?;
        Ok(n)
    }

    /// Mark `fired` as sent and soft-delete every other pending record of the
    /// same resource whose threshold is `<=` the fired one, atomically.
    ///
    /// Returns the number of subsumed siblings. Larger thresholds stay pending.
    #[instrument(skip(self, fired), fields(alert_id = %fired.id))]
    pub fn mark_sent_and_prune(&self, fired: &AlertRecord, now: DateTime<Utc>) -> Result<usize> {
        let now = to_db_time(now);
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        tx.execute(
            "UPDATE alerts SET status = 'sent', deleted = 1, error = NULL, updated_at = ?1
             WHERE id = ?2",
            rusqlite::params![now, fired.id],
        )?;
        let reason = format!("subsumed by {}m alert", fired.threshold_minutes);
        let pruned = tx.execute(
            "UPDATE alerts SET status = 'cancelled', deleted = 1, error = ?1, updated_at = ?2
             WHERE resource_id = ?3 AND region = ?4 AND id != ?5
               AND deleted = 0 AND status = 'pending' AND threshold_minutes <= ?6",
            rusqlite::params![
                reason,
                now,
                fired.resource_id,
                fired.region,
                fired.id,
                fired.threshold_minutes
            ],
        )?;
        tx.commit()?;
        Ok(pruned)
    }

    /// Record a permanent delivery failure. The record stops being scanned.
    pub fn mark_error(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
        let now = to_db_time(now);
        let db = self.lock()?;
        db.execute(
            "UPDATE alerts SET status = 'error', error = ?1, last_error_at = ?2, updated_at = ?2
             WHERE id = ?3",
            rusqlite::params![error, now, id],
        )?;
        Ok(())
    }

    /// Count a transient failure against the record and return its new status:
    /// still `pending` until `max_attempts` ticks have failed, then `error`.
    pub fn record_transient_failure(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<AlertStatus> {
        let now = to_db_time(now);
        let db = self.lock()?;
        // SET expressions read pre-update values, so `attempts + 1` is the new count.
        db.execute(
            "UPDATE alerts SET
                attempts = attempts + 1,
                last_error_at = ?1,
                updated_at = ?1,
                error = ?2,
                status = CASE WHEN attempts + 1 >= ?3 THEN 'error' ELSE status END
             WHERE id = ?4",
            rusqlite::params![now, error, max_attempts, id],
        )?;
        let status: String =
            db.query_row("SELECT status FROM alerts WHERE id = ?1", [id], |row| row.get(0))?;
        status
            .parse()
            .map_err(|e: String| AlertError::Database(conversion_error(0, e)))
    }

    pub fn count_live(&self, resource_id: &str, region: &str) -> Result<usize> {
        let db = self.lock()?;
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM alerts WHERE resource_id = ?1 AND region = ?2 AND deleted = 0",
            rusqlite::params![resource_id, region],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Physically remove finished or soft-deleted rows last touched at or
    /// before `cutoff`, plus pending rows that can never be delivered.
    pub fn purge(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let aged = tx.execute(
            "DELETE FROM alerts
             WHERE (deleted = 1 OR status != 'pending') AND updated_at <= ?1",
            [to_db_time(cutoff)],
        )?;
        let orphaned = tx.execute(
            "DELETE FROM alerts WHERE status = 'pending' AND deleted = 0 AND delivery_target = ''",
            [],
        )?;
        tx.commit()?;
        Ok(aged + orphaned)
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertRecord> {
    let status: String = row.get(7)?;
    let state: String = row.get(8)?;
    let last_error_at: Option<String> = row.get(14)?;
    Ok(AlertRecord {
        id: row.get(0)?,
        resource_id: row.get(1)?,
        resource_name: row.get(2)?,
        region: row.get(3)?,
        launch_time: from_db_time(4, &row.get::<_, String>(4)?)?,
        threshold_minutes: row.get(5)?,
        scheduled_time: from_db_time(6, &row.get::<_, String>(6)?)?,
        status: status.parse().map_err(|e| conversion_error(7, e))?,
        resource_state: state.parse().map_err(|e| conversion_error(8, e))?,
        deleted: row.get(9)?,
        delivery_target: row.get(10)?,
        attempts: row.get(11)?,
        created_at: from_db_time(12, &row.get::<_, String>(12)?)?,
        updated_at: from_db_time(13, &row.get::<_, String>(13)?)?,
        last_error_at: last_error_at
            .as_deref()
            .map(|s| from_db_time(14, s))
            .transpose()?,
        error: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap()
    }

    fn rec(resource: &str, region: &str, threshold: u32) -> AlertRecord {
        AlertRecord::new(resource, resource, region, t0(), threshold, "tok-123456", t0())
    }

    #[test]
    fn upsert_overwrites_same_id() {
        let store = AlertStore::open_in_memory().unwrap();
        let mut a = rec("i-1", "r1", 30);
        store.upsert(&a).unwrap();
        a.delivery_target = "tok-new".to_string();
        store.upsert(&a).unwrap();

        let all = store.query(&AlertQuery::default()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].delivery_target, "tok-new");
        assert_eq!(all[0].launch_time, t0());
        assert_eq!(all[0].status, AlertStatus::Pending);
    }

    #[test]
    fn query_orders_by_scheduled_time() {
        let store = AlertStore::open_in_memory().unwrap();
        store
            .upsert_batch(&[rec("i-1", "r1", 90), rec("i-1", "r1", 30), rec("i-1", "r1", 60)])
            .unwrap();
        let got: Vec<u32> = store
            .query(&AlertQuery::dispatch_scan("r1"))
            .unwrap()
            .iter()
            .map(|r| r.threshold_minutes)
            .collect();
        assert_eq!(got, vec![30, 60, 90]);
    }

    #[test]
    fn dispatch_scan_excludes_non_running_and_deleted() {
        let store = AlertStore::open_in_memory().unwrap();
        let mut stopped = rec("i-2", "r1", 30);
        stopped.resource_state = ResourceState::Stopped;
        let mut gone = rec("i-3", "r1", 30);
        gone.deleted = true;
        store
            .upsert_batch(&[rec("i-1", "r1", 30), stopped, gone, rec("i-4", "r2", 30)])
            .unwrap();

        let scan = store.query(&AlertQuery::dispatch_scan("r1")).unwrap();
        assert_eq!(scan.len(), 1);
        assert_eq!(scan[0].resource_id, "i-1");
        assert_eq!(store.pending_regions().unwrap(), vec!["r1", "r2"]);
    }

    #[test]
    fn mark_sent_prunes_lower_thresholds_only() {
        let store = AlertStore::open_in_memory().unwrap();
        let records = [rec("i-1", "r1", 30), rec("i-1", "r1", 60), rec("i-1", "r1", 90)];
        store.upsert_batch(&records).unwrap();
        store.upsert(&rec("i-9", "r1", 30)).unwrap();

        let pruned = store.mark_sent_and_prune(&records[1], t0()).unwrap();
        assert_eq!(pruned, 1);

        let fired = store.get(&records[1].id).unwrap().unwrap();
        assert_eq!(fired.status, AlertStatus::Sent);
        assert!(fired.deleted);
        let lower = store.get(&records[0].id).unwrap().unwrap();
        assert!(lower.deleted);
        assert_eq!(lower.status, AlertStatus::Cancelled);

        let live = store.live_for_resource("i-1", "r1").unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].threshold_minutes, 90);
        assert_eq!(store.count_live("i-9", "r1").unwrap(), 1);
    }

    #[test]
    fn transient_failures_escalate_to_error() {
        let store = AlertStore::open_in_memory().unwrap();
        let a = rec("i-1", "r1", 30);
        store.upsert(&a).unwrap();

        assert_eq!(
            store.record_transient_failure(&a.id, "timeout", t0(), 2).unwrap(),
            AlertStatus::Pending
        );
        assert_eq!(
            store.record_transient_failure(&a.id, "timeout", t0(), 2).unwrap(),
            AlertStatus::Error
        );
        let got = store.get(&a.id).unwrap().unwrap();
        assert_eq!(got.attempts, 2);
        assert_eq!(got.last_error_at, Some(t0()));
        assert_eq!(got.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn cancel_resource_touches_only_that_resource() {
        let store = AlertStore::open_in_memory().unwrap();
        store
            .upsert_batch(&[rec("i-1", "r1", 30), rec("i-1", "r1", 60), rec("i-1", "r2", 30)])
            .unwrap();
        assert_eq!(store.cancel_resource("i-1", "r1", "stopped", t0()).unwrap(), 2);
        assert_eq!(store.count_live("i-1", "r1").unwrap(), 0);
        assert_eq!(store.count_live("i-1", "r2").unwrap(), 1);
    }

    #[test]
    fn batch_delete_skips_already_deleted() {
        let store = AlertStore::open_in_memory().unwrap();
        let a = rec("i-1", "r1", 30);
        let b = rec("i-1", "r1", 60);
        store.upsert_batch(&[a.clone(), b.clone()]).unwrap();
        let ids = vec![a.id.clone(), b.id.clone()];
        assert_eq!(store.batch_delete(&ids, "user", t0()).unwrap(), 2);
        assert_eq!(store.batch_delete(&ids, "user", t0()).unwrap(), 0);
    }

    #[test]
    fn purge_removes_old_finished_and_orphans() {
        let store = AlertStore::open_in_memory().unwrap();
        let old = rec("i-1", "r1", 30);
        let fresh = rec("i-1", "r1", 60);
        let mut orphan = rec("i-2", "r1", 30);
        orphan.delivery_target = String::new();
        store.upsert_batch(&[old.clone(), fresh.clone(), orphan]).unwrap();

        store.mark_sent_and_prune(&old, t0()).unwrap();
        store.mark_error(&fresh.id, "bad token", t0() + Duration::hours(30)).unwrap();

        let purged = store.purge(t0() + Duration::hours(24)).unwrap();
        assert_eq!(purged, 2);
        let left = store.query(&AlertQuery::default()).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, fresh.id);
    }
}
