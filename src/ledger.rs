//! Content-addressed deduplication ledger (C4), backed by SQLite.
//!
//! Grounded in `duplicate_filter.py`'s `DuplicateFilter`: same schema
//! shape, same OR-merge upsert, same pending-queue queries. Column names
//! are generalized from the Garmin/MQTT-specific `garmin_uploaded`/
//! `mqtt_published` to `cloud_delivered`/`bus_delivered` since this ledger
//! serves any cloud/bus sink pair, not just Garmin and MQTT.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Duration, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task::spawn_blocking;

use crate::error::BridgeError;
use crate::models::{BloodPressureReading, LedgerRow, LedgerStatistics};

/// Cheaply cloneable handle onto a shared SQLite connection. Cloning
/// shares the same connection rather than opening a new one, which is
/// what lets `spawn_blocking` move a handle onto a worker thread without
/// borrowing the orchestrator's `Ledger` across an `.await` point.
#[derive(Clone)]
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Open (or create) the ledger database at `path`, creating the
    /// schema if it doesn't already exist.
    pub fn open(path: &str) -> Result<Self, BridgeError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BridgeError::Storage(rusqlite::Error::InvalidPath(
                        format!("failed to create {}: {e}", parent.display()).into(),
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS uploaded_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fingerprint TEXT UNIQUE NOT NULL,
                timestamp TEXT NOT NULL,
                systolic INTEGER NOT NULL,
                diastolic INTEGER NOT NULL,
                pulse INTEGER NOT NULL,
                irregular_heartbeat INTEGER NOT NULL DEFAULT 0,
                body_movement INTEGER NOT NULL DEFAULT 0,
                user_slot INTEGER NOT NULL DEFAULT 1,
                category TEXT,
                uploaded_at TEXT NOT NULL,
                cloud_delivered INTEGER NOT NULL DEFAULT 0,
                bus_delivered INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_fingerprint ON uploaded_records(fingerprint);
            CREATE INDEX IF NOT EXISTS idx_timestamp ON uploaded_records(timestamp);
            CREATE INDEX IF NOT EXISTS idx_user_slot ON uploaded_records(user_slot);",
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// In-memory ledger, used by tests and `--dry-run`.
    pub fn open_in_memory() -> Result<Self, BridgeError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE uploaded_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fingerprint TEXT UNIQUE NOT NULL,
                timestamp TEXT NOT NULL,
                systolic INTEGER NOT NULL,
                diastolic INTEGER NOT NULL,
                pulse INTEGER NOT NULL,
                irregular_heartbeat INTEGER NOT NULL DEFAULT 0,
                body_movement INTEGER NOT NULL DEFAULT 0,
                user_slot INTEGER NOT NULL DEFAULT 1,
                category TEXT,
                uploaded_at TEXT NOT NULL,
                cloud_delivered INTEGER NOT NULL DEFAULT 0,
                bus_delivered INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_duplicate(&self, fingerprint: &str) -> Result<bool, BridgeError> {
        let exists: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM uploaded_records WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Return only the readings not already present in the ledger.
    pub fn filter_new(
        &self,
        records: &[BloodPressureReading],
    ) -> Result<Vec<BloodPressureReading>, BridgeError> {
        let mut new_records = Vec::new();
        for record in records {
            if !self.is_duplicate(&record.record_hash())? {
                new_records.push(record.clone());
            }
        }
        Ok(new_records)
    }

    /// Insert a record, or OR-merge its delivery flags into an existing
    /// row with the same fingerprint.
    pub fn mark_uploaded(
        &self,
        record: &BloodPressureReading,
        cloud: bool,
        bus: bool,
    ) -> Result<(), BridgeError> {
        let now = Utc::now().naive_utc();
        self.conn().execute(
            "INSERT INTO uploaded_records
                (fingerprint, timestamp, systolic, diastolic, pulse,
                 irregular_heartbeat, body_movement, user_slot, category,
                 uploaded_at, cloud_delivered, bus_delivered)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(fingerprint) DO UPDATE SET
                cloud_delivered = cloud_delivered OR excluded.cloud_delivered,
                bus_delivered = bus_delivered OR excluded.bus_delivered",
            params![
                record.record_hash(),
                record.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(),
                record.systolic,
                record.diastolic,
                record.pulse,
                record.irregular_heartbeat,
                record.body_movement,
                record.user_slot,
                record.category().as_str(),
                now.format("%Y-%m-%dT%H:%M:%S").to_string(),
                cloud,
                bus,
            ],
        )?;
        Ok(())
    }

    /// Update delivery status for an existing row. `None` leaves a flag
    /// untouched.
    pub fn update_status(
        &self,
        fingerprint: &str,
        cloud: Option<bool>,
        bus: Option<bool>,
    ) -> Result<(), BridgeError> {
        if let Some(cloud) = cloud {
            self.conn().execute(
                "UPDATE uploaded_records SET cloud_delivered = ?1 WHERE fingerprint = ?2",
                params![cloud, fingerprint],
            )?;
        }
        if let Some(bus) = bus {
            self.conn().execute(
                "UPDATE uploaded_records SET bus_delivered = ?1 WHERE fingerprint = ?2",
                params![bus, fingerprint],
            )?;
        }
        Ok(())
    }

    pub fn pending_cloud(&self, limit: i64) -> Result<Vec<LedgerRow>, BridgeError> {
        self.query_rows(
            "SELECT * FROM uploaded_records WHERE cloud_delivered = 0 ORDER BY timestamp ASC LIMIT ?1",
            params![limit],
        )
    }

    pub fn pending_bus(&self, limit: i64) -> Result<Vec<LedgerRow>, BridgeError> {
        self.query_rows(
            "SELECT * FROM uploaded_records WHERE bus_delivered = 0 ORDER BY timestamp ASC LIMIT ?1",
            params![limit],
        )
    }

    /// Newest-first rows, optionally filtered by user slot and/or a
    /// `[from, to]` timestamp range, mirroring `get_history`'s
    /// `user_slot`/`start_date`/`end_date` filters.
    pub fn history(
        &self,
        limit: i64,
        user_slot: Option<u32>,
        from: Option<NaiveDateTime>,
        to: Option<NaiveDateTime>,
    ) -> Result<Vec<LedgerRow>, BridgeError> {
        let from = from.map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string());
        let to = to.map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string());

        let mut clauses = Vec::new();
        let mut query_params: Vec<&dyn rusqlite::ToSql> = Vec::new();
        if let Some(slot) = &user_slot {
            clauses.push("user_slot = ?");
            query_params.push(slot);
        }
        if let Some(from) = &from {
            clauses.push("timestamp >= ?");
            query_params.push(from);
        }
        if let Some(to) = &to {
            clauses.push("timestamp <= ?");
            query_params.push(to);
        }
        query_params.push(&limit);

        let where_sql =
            if clauses.is_empty() { String::new() } else { format!("WHERE {}", clauses.join(" AND ")) };
        let sql = format!("SELECT * FROM uploaded_records {where_sql} ORDER BY timestamp DESC LIMIT ?");
        self.query_rows(&sql, query_params.as_slice())
    }

    pub fn statistics(&self, user_slot: Option<u32>) -> Result<LedgerStatistics, BridgeError> {
        let where_clause = if user_slot.is_some() { "WHERE user_slot = ?1" } else { "" };
        let slot_param: Vec<&dyn rusqlite::ToSql> = match &user_slot {
            Some(slot) => vec![slot],
            None => vec![],
        };
        let conn = self.conn();

        let total_records: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM uploaded_records {where_clause}"),
            slot_param.as_slice(),
            |r| r.get(0),
        )?;
        let cloud_delivered: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM uploaded_records {where_clause} {} cloud_delivered = 1",
                if where_clause.is_empty() { "WHERE" } else { "AND" }
            ),
            slot_param.as_slice(),
            |r| r.get(0),
        )?;
        let bus_delivered: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM uploaded_records {where_clause} {} bus_delivered = 1",
                if where_clause.is_empty() { "WHERE" } else { "AND" }
            ),
            slot_param.as_slice(),
            |r| r.get(0),
        )?;
        let (first_record, last_record): (Option<String>, Option<String>) = conn.query_row(
            &format!("SELECT MIN(timestamp), MAX(timestamp) FROM uploaded_records {where_clause}"),
            slot_param.as_slice(),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let (avg_systolic, avg_diastolic, avg_pulse): (Option<f64>, Option<f64>, Option<f64>) = conn
            .query_row(
                &format!(
                    "SELECT AVG(systolic), AVG(diastolic), AVG(pulse) FROM uploaded_records {where_clause}"
                ),
                slot_param.as_slice(),
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )?;

        Ok(LedgerStatistics {
            total_records,
            cloud_delivered,
            bus_delivered,
            first_record: first_record.and_then(|s| parse_timestamp(&s)),
            last_record: last_record.and_then(|s| parse_timestamp(&s)),
            avg_systolic,
            avg_diastolic,
            avg_pulse,
        })
    }

    /// Delete records older than `days`, using proper calendar-duration
    /// subtraction rather than day-of-month arithmetic.
    pub fn purge_older_than(&self, days: i64) -> Result<usize, BridgeError> {
        let cutoff = (Utc::now().naive_utc() - Duration::days(days))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();
        let deleted =
            self.conn().execute("DELETE FROM uploaded_records WHERE timestamp < ?1", params![cutoff])?;
        Ok(deleted)
    }

    pub fn clear_all(&self) -> Result<usize, BridgeError> {
        Ok(self.conn().execute("DELETE FROM uploaded_records", [])?)
    }

    fn query_rows(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<LedgerRow>, BridgeError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| {
                let timestamp: String = row.get("timestamp")?;
                let uploaded_at: String = row.get("uploaded_at")?;
                Ok(LedgerRow {
                    id: row.get("id")?,
                    fingerprint: row.get("fingerprint")?,
                    timestamp: parse_timestamp(&timestamp).unwrap_or_default(),
                    systolic: row.get("systolic")?,
                    diastolic: row.get("diastolic")?,
                    pulse: row.get("pulse")?,
                    irregular_heartbeat: row.get("irregular_heartbeat")?,
                    body_movement: row.get("body_movement")?,
                    user_slot: row.get("user_slot")?,
                    category: row.get("category")?,
                    uploaded_at: parse_timestamp(&uploaded_at).unwrap_or_default(),
                    cloud_delivered: row.get("cloud_delivered")?,
                    bus_delivered: row.get("bus_delivered")?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Run a blocking ledger call on the blocking thread pool. `self` is
    /// cloned (a cheap `Arc` bump) rather than borrowed, since the closure
    /// must be `'static` to cross the `spawn_blocking` boundary.
    async fn blocking<T, F>(&self, f: F) -> Result<T, BridgeError>
    where
        F: FnOnce(&Ledger) -> Result<T, BridgeError> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = self.clone();
        spawn_blocking(move || f(&ledger)).await.map_err(|e| BridgeError::Task(e.to_string()))?
    }

    /// Async facade over [`filter_new`](Self::filter_new): the sync cycle's
    /// hot path, so it must not block the orchestrator's async task on
    /// disk I/O.
    pub async fn filter_new_async(
        &self,
        records: Vec<BloodPressureReading>,
    ) -> Result<Vec<BloodPressureReading>, BridgeError> {
        self.blocking(move |ledger| ledger.filter_new(&records)).await
    }

    pub async fn mark_uploaded_async(
        &self,
        record: BloodPressureReading,
        cloud: bool,
        bus: bool,
    ) -> Result<(), BridgeError> {
        self.blocking(move |ledger| ledger.mark_uploaded(&record, cloud, bus)).await
    }

    pub async fn pending_cloud_async(&self, limit: i64) -> Result<Vec<LedgerRow>, BridgeError> {
        self.blocking(move |ledger| ledger.pending_cloud(limit)).await
    }

    pub async fn pending_bus_async(&self, limit: i64) -> Result<Vec<LedgerRow>, BridgeError> {
        self.blocking(move |ledger| ledger.pending_bus(limit)).await
    }

    pub async fn update_status_async(
        &self,
        fingerprint: String,
        cloud: Option<bool>,
        bus: Option<bool>,
    ) -> Result<(), BridgeError> {
        self.blocking(move |ledger| ledger.update_status(&fingerprint, cloud, bus)).await
    }
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn reading(hash_seed: u32) -> BloodPressureReading {
        BloodPressureReading {
            timestamp: NaiveDate::from_ymd_opt(2025, 12, 26)
                .unwrap()
                .and_hms_opt(22, 59, 22)
                .unwrap(),
            systolic: 139,
            diastolic: 83,
            pulse: 73 + hash_seed,
            irregular_heartbeat: false,
            body_movement: false,
            user_slot: 1,
        }
    }

    #[test]
    fn dedupe_across_cycles_s4() {
        let ledger = Ledger::open_in_memory().unwrap();
        let r = reading(0);
        assert!(ledger.filter_new(&[r.clone()]).unwrap().len() == 1);
        ledger.mark_uploaded(&r, true, true).unwrap();
        assert!(ledger.is_duplicate(&r.record_hash()).unwrap());
        assert!(ledger.filter_new(&[r.clone()]).unwrap().is_empty());
    }

    #[test]
    fn or_merge_upsert_never_resets_a_delivered_flag() {
        let ledger = Ledger::open_in_memory().unwrap();
        let r = reading(0);
        ledger.mark_uploaded(&r, true, false).unwrap();
        ledger.mark_uploaded(&r, false, true).unwrap();

        let rows = ledger.history(10, None, None, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].cloud_delivered);
        assert!(rows[0].bus_delivered);
    }

    #[test]
    fn pending_queues_exclude_delivered_records() {
        let ledger = Ledger::open_in_memory().unwrap();
        let r1 = reading(0);
        let mut r2 = reading(1);
        r2.user_slot = 2;
        ledger.mark_uploaded(&r1, true, true).unwrap();
        ledger.mark_uploaded(&r2, false, false).unwrap();

        let pending_cloud = ledger.pending_cloud(10).unwrap();
        assert_eq!(pending_cloud.len(), 1);
        assert_eq!(pending_cloud[0].fingerprint, r2.record_hash());
    }

    #[test]
    fn history_filters_by_user_slot_and_date_range() {
        let ledger = Ledger::open_in_memory().unwrap();
        let mut older = reading(0);
        older.timestamp = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let mut other_user = reading(1);
        other_user.user_slot = 2;
        let newest = reading(2);

        ledger.mark_uploaded(&older, true, true).unwrap();
        ledger.mark_uploaded(&other_user, true, true).unwrap();
        ledger.mark_uploaded(&newest, true, true).unwrap();

        let by_slot = ledger.history(10, Some(1), None, None).unwrap();
        assert_eq!(by_slot.len(), 2);
        assert!(by_slot.iter().all(|r| r.user_slot == 1));

        let from = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let ranged = ledger.history(10, None, Some(from), None).unwrap();
        assert_eq!(ranged.len(), 2);
        assert!(ranged.iter().all(|r| r.timestamp >= from));
    }

    #[test]
    fn purge_uses_calendar_duration_not_day_of_month_arithmetic() {
        let ledger = Ledger::open_in_memory().unwrap();
        let old = BloodPressureReading {
            timestamp: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
            ..reading(0)
        };
        ledger.mark_uploaded(&old, true, true).unwrap();
        let deleted = ledger.purge_older_than(365).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(ledger.statistics(None).unwrap().total_records, 0);
    }

    #[test]
    fn statistics_report_counts_and_averages() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.mark_uploaded(&reading(0), true, true).unwrap();
        ledger.mark_uploaded(&reading(1), false, false).unwrap();

        let stats = ledger.statistics(None).unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.cloud_delivered, 1);
        assert_eq!(stats.bus_delivered, 1);
        assert_eq!(stats.avg_systolic, Some(139.0));
    }

    #[tokio::test]
    async fn async_facades_run_off_the_calling_task() {
        let ledger = Ledger::open_in_memory().unwrap();
        let r = reading(0);
        let fresh = ledger.filter_new_async(vec![r.clone()]).await.unwrap();
        assert_eq!(fresh.len(), 1);
        ledger.mark_uploaded_async(r.clone(), true, false).await.unwrap();
        let pending = ledger.pending_bus_async(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        ledger.update_status_async(pending[0].fingerprint.clone(), None, Some(true)).await.unwrap();
        assert!(ledger.pending_bus_async(10).await.unwrap().is_empty());
    }
}
