//! SQLite-backed durable transport.
//!
//! Every stream lives in one append-only `records` table. The rowid sequence
//! is the record sequence, so ids are ordered across streams and never
//! reused. Blocking reads poll the table, waking early on appends made
//! through this handle.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Fields, Record, RecordId, Transport, TransportKind};
use crate::error::{Error, Result};

/// Upper bound between polls while a read is blocked.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct SqliteTransport {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    appended: Notify,
}

impl SqliteTransport {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::transport(format!("sqlite open {}: {}", path.display(), e)))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                stream TEXT NOT NULL,
                ts INTEGER NOT NULL,
                fields TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_stream ON records(stream, seq);
            "#,
        )
        .map_err(|e| Error::transport(format!("sqlite init: {}", e)))?;

        tracing::debug!("Opened transport database {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
            appended: Notify::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a statement batch on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await
        .map_err(|e| Error::transport(format!("sqlite worker: {}", e)))?
    }

    async fn query(&self, stream: &str, after: Option<RecordId>, limit: usize) -> Result<Vec<Record>> {
        let stream = stream.to_string();
        let after = after.map(|id| id.seq() as i64).unwrap_or(0);
        let limit = if limit == 0 { -1 } else { limit as i64 };
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT seq, ts, fields FROM records WHERE stream = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![stream, after, limit], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (seq, ts, raw) = row?;
                let fields: Fields = serde_json::from_str(&raw)
                    .map_err(|e| Error::codec(format!("record {} fields: {}", seq, e)))?;
                records.push(Record {
                    id: RecordId::new(ts, seq as u64),
                    fields,
                });
            }
            Ok(records)
        })
        .await
    }
}

#[async_trait]
impl Transport for SqliteTransport {
    async fn append(&self, stream: &str, fields: Fields) -> Result<RecordId> {
        let stream = stream.to_string();
        let raw = serde_json::to_string(&fields)?;
        let ts = chrono::Utc::now().timestamp_millis();
        let id = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO records (stream, ts, fields) VALUES (?1, ?2, ?3)",
                    params![stream, ts, raw],
                )?;
                Ok(RecordId::new(ts, conn.last_insert_rowid() as u64))
            })
            .await?;
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read(
        &self,
        stream: &str,
        after: Option<RecordId>,
        limit: usize,
        block: Duration,
    ) -> Result<Vec<Record>> {
        let deadline = Instant::now() + block;
        loop {
            let appended = self.appended.notified();
            let records = self.query(stream, after, limit).await?;
            if !records.is_empty() {
                return Ok(records);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(records);
            }
            // Other processes append without notifying us, so poll as well.
            let _ = tokio::time::timeout(remaining.min(POLL_INTERVAL), appended).await;
        }
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<usize> {
        let stream = stream.to_string();
        let keep = max_len as i64;
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM records WHERE stream = ?1 AND seq NOT IN \
                 (SELECT seq FROM records WHERE stream = ?1 ORDER BY seq DESC LIMIT ?2)",
                params![stream, keep],
            )?;
            Ok(removed)
        })
        .await
    }

    async fn trim_before(&self, stream: &str, id: RecordId) -> Result<usize> {
        let stream = stream.to_string();
        let seq = id.seq() as i64;
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM records WHERE stream = ?1 AND seq < ?2",
                params![stream, seq],
            )?;
            Ok(removed)
        })
        .await
    }

    async fn streams(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT stream FROM records")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Durable
    }
}
