use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::Connection;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::schema::init_sql;

/// A DuckDB backend for OpticData.
///
/// DuckDB is single-writer: concurrent reads are fine, but concurrent writes
/// cause contention. We wrap the connection in `Arc<Mutex<_>>` so the async
/// runtime serialises all access while the struct stays cheap to clone and
/// share across Axum handlers and the scheduler.
///
/// Holding the lock for a whole identity-merge or attribution sub-batch is
/// what makes those operations atomic with respect to each other.
pub struct DuckDbBackend {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl DuckDbBackend {
    /// Open (or create) a DuckDB database file at `path`.
    ///
    /// Runs the idempotent schema in [`init_sql`], which also applies the
    /// memory limit and thread cap.
    pub fn open(path: &str, memory_limit: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(&init_sql(memory_limit))?;
        info!(path, memory_limit, "DuckDB opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an **in-memory** DuckDB database.
    ///
    /// Intended for tests only — data is discarded when the struct is
    /// dropped.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(&init_sql("256MB"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Execute `SELECT 1` as a lightweight liveness check.
    ///
    /// Called by the `/health` endpoint. Returns an error if the connection
    /// is unavailable (file locked, disk full, etc.).
    pub async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("SELECT 1")?;
        Ok(())
    }

    /// Direct connection access for integration tests.
    pub async fn conn_for_test(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

impl Clone for DuckDbBackend {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

/// Timestamp format used for every TIMESTAMP column. DuckDB parses it
/// implicitly on insert; reads go through `CAST(col AS VARCHAR)` and back
/// through [`parse_ts`].
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|e| anyhow!("bad timestamp {raw:?}: {e}"))?;
    Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_round_trip() {
        let now = Utc::now();
        let parsed = parse_ts(&fmt_ts(now)).expect("parse");
        assert!((now - parsed).num_microseconds().unwrap_or(0).abs() < 2);
    }

    #[tokio::test]
    async fn in_memory_backend_answers_ping() {
        let db = DuckDbBackend::open_in_memory().expect("open");
        db.ping().await.expect("ping");
    }
}
