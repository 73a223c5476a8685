//! ==============================================================================
//! store/sqlite.rs - durable backend on an embedded sqlite database
//! ==============================================================================
//!
//! tables:
//!     devices            device_id, secret, status code, last_seen
//!     buffered_readings  one row per accepted reading, json payload,
//!                        processed flag (indexed with device_id)
//!     summaries          one row per roll-up, one REAL column per
//!                        (statistic, field), e.g. avg_temperature
//!
//! all calls run on the blocking pool behind a single connection. every
//! statement is committed before the call returns.
//!
//! ==============================================================================

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{DeviceRegistry, IngestionBuffer, StoreError, SummaryStore};
use crate::domain::{BufferedRecord, Device, DeviceStatus, Field, Reading, SummaryRecord};

const STATS: [&str; 4] = ["max", "min", "avg", "var"];

fn stat_columns() -> Vec<String> {
    STATS
        .iter()
        .flat_map(|stat| Field::ALL.iter().map(move |f| format!("{}_{}", stat, f.name())))
        .collect()
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=FULL;\
             PRAGMA busy_timeout=5000;",
        )?;
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS devices (\
               device_id TEXT PRIMARY KEY,\
               secret TEXT NOT NULL,\
               status INTEGER NOT NULL DEFAULT 0,\
               last_seen INTEGER\
             );\
             CREATE TABLE IF NOT EXISTS buffered_readings (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               device_id TEXT NOT NULL,\
               timestamp INTEGER NOT NULL,\
               data TEXT NOT NULL,\
               processed INTEGER NOT NULL DEFAULT 0\
             );\
             CREATE INDEX IF NOT EXISTS idx_buffer_device \
               ON buffered_readings(device_id, processed, id);",
        )?;

        let columns: Vec<String> = stat_columns()
            .into_iter()
            .map(|c| format!("{} REAL NOT NULL", c))
            .collect();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS summaries (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               device_id TEXT NOT NULL,\
               created_at INTEGER NOT NULL,\
               sample_count INTEGER NOT NULL,\
               {}\
             );\
             CREATE INDEX IF NOT EXISTS idx_summaries_device ON summaries(device_id, created_at);",
            columns.join(",")
        ))?;
        Ok(())
    }

    /// run `f` against the connection on the blocking pool
    async fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, i64, Option<i64>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn reading_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<Reading> {
    let mut reading = Reading::default();
    for (i, field) in Field::ALL.into_iter().enumerate() {
        let v: f64 = row.get(offset + i)?;
        reading.set(field, v as f32);
    }
    Ok(reading)
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<SummaryRecord> {
    Ok(SummaryRecord {
        id: row.get(0)?,
        device_id: row.get(1)?,
        created_at: row.get(2)?,
        sample_count: row.get(3)?,
        max: reading_at(row, 4)?,
        min: reading_at(row, 14)?,
        avg: reading_at(row, 24)?,
        var: reading_at(row, 34)?,
    })
}

#[async_trait]
impl DeviceRegistry for SqliteStore {
    async fn find(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT device_id, secret, status, last_seen FROM devices WHERE device_id = ?1",
                    params![device_id],
                    device_from_row,
                )
                .optional()?;
            let Some((device_id, secret, code, last_seen)) = row else {
                return Ok(None);
            };
            let status = DeviceStatus::from_code(code)
                .ok_or_else(|| {
                    StoreError::Corrupt(format!("device {} status {}", device_id, code))
                })?;
            Ok(Some(Device { device_id, secret, status, last_seen }))
        })
        .await
    }

    async fn provision(&self, device_id: &str, secret: &str) -> Result<(), StoreError> {
        let device_id = device_id.to_string();
        let secret = secret.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO devices (device_id, secret) VALUES (?1, ?2) \
                 ON CONFLICT(device_id) DO UPDATE SET secret = excluded.secret",
                params![device_id, secret],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_status(&self, device_id: &str, status: DeviceStatus) -> Result<(), StoreError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let rows = conn.execute(
                "UPDATE devices SET status = ?1 WHERE device_id = ?2",
                params![status.code(), device_id],
            )?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("device {}", device_id)));
            }
            Ok(())
        })
        .await
    }

    async fn record_activity(&self, device_id: &str, at: i64) -> Result<(), StoreError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let rows = conn.execute(
                "UPDATE devices SET status = ?1, last_seen = ?2 WHERE device_id = ?3",
                params![DeviceStatus::Active.code(), at, device_id],
            )?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("device {}", device_id)));
            }
            Ok(())
        })
        .await
    }

    async fn transition(
        &self,
        device_id: &str,
        from: DeviceStatus,
        to: DeviceStatus,
    ) -> Result<bool, StoreError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let rows = conn.execute(
                "UPDATE devices SET status = ?1 WHERE device_id = ?2 AND status = ?3",
                params![to.code(), device_id, from.code()],
            )?;
            Ok(rows > 0)
        })
        .await
    }
}

#[async_trait]
impl IngestionBuffer for SqliteStore {
    async fn append(
        &self,
        device_id: &str,
        timestamp: i64,
        reading: &Reading,
    ) -> Result<i64, StoreError> {
        let device_id = device_id.to_string();
        let data = serde_json::to_string(reading)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO buffered_readings (device_id, timestamp, data, processed) \
                 VALUES (?1, ?2, ?3, 0)",
                params![device_id, timestamp, data],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn count_unprocessed(&self, device_id: &str) -> Result<u64, StoreError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM buffered_readings WHERE device_id = ?1 AND processed = 0",
                params![device_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn drain_unprocessed(&self, device_id: &str) -> Result<Vec<BufferedRecord>, StoreError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, device_id, timestamp, data FROM buffered_readings \
                 WHERE device_id = ?1 AND processed = 0 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![device_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (id, device_id, timestamp, data) = row?;
                records.push(BufferedRecord {
                    id,
                    device_id,
                    timestamp,
                    reading: serde_json::from_str(&data)?,
                    processed: false,
                });
            }
            Ok(records)
        })
        .await
    }

    async fn mark_processed(&self, device_id: &str, ids: &[i64]) -> Result<u64, StoreError> {
        let device_id = device_id.to_string();
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut changed = 0u64;
            {
                let mut stmt = tx.prepare(
                    "UPDATE buffered_readings SET processed = 1 \
                     WHERE device_id = ?1 AND id = ?2 AND processed = 0",
                )?;
                for id in ids {
                    changed += stmt.execute(params![device_id, id])? as u64;
                }
            }
            tx.commit()?;
            Ok(changed)
        })
        .await
    }

    async fn purge_processed(&self, device_id: &str) -> Result<u64, StoreError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let rows = conn.execute(
                "DELETE FROM buffered_readings WHERE device_id = ?1 AND processed = 1",
                params![device_id],
            )?;
            Ok(rows as u64)
        })
        .await
    }
}

#[async_trait]
impl SummaryStore for SqliteStore {
    async fn insert(&self, summary: &SummaryRecord) -> Result<i64, StoreError> {
        let mut values = vec![
            Value::Text(summary.device_id.clone()),
            Value::Integer(summary.created_at),
            Value::Integer(summary.sample_count as i64),
        ];
        for stat in [&summary.max, &summary.min, &summary.avg, &summary.var] {
            values.extend(Field::ALL.iter().map(|f| Value::Real(stat.get(*f) as f64)));
        }

        self.with_conn(move |conn| {
            let columns = stat_columns();
            let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "INSERT INTO summaries (device_id, created_at, sample_count, {}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            );
            conn.execute(&sql, params_from_iter(values))?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn list(
        &self,
        device_id: &str,
        after: Option<i64>,
        before: Option<i64>,
    ) -> Result<Vec<SummaryRecord>, StoreError> {
        let device_id = device_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT id, device_id, created_at, sample_count, {} FROM summaries \
                 WHERE device_id = ?1 \
                   AND (?2 IS NULL OR created_at > ?2) \
                   AND (?3 IS NULL OR created_at < ?3) \
                 ORDER BY created_at, id",
                stat_columns().join(", ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![device_id, after, before], summary_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}
