//! Append-only record streams that envelopes travel over.
//!
//! A transport stores flat string records in named streams and hands out
//! ordered ids. Two backends implement it: SQLite for durability and an
//! in-process store for tests and degraded operation. The backend is picked
//! once by [`connect`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::TransportSettings;
use crate::error::{Error, Result};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryTransport;
pub use sqlite::SqliteTransport;

/// Record ids: `<millis>-<seq>`. The sequence is shared by every stream of a
/// transport, so ids compare across streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId {
    seq: u64,
    millis: i64,
}

impl RecordId {
    pub fn new(millis: i64, seq: u64) -> Self {
        Self { seq, millis }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for RecordId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| Error::codec(format!("bad record id '{}'", s)))?;
        let millis = millis
            .parse()
            .map_err(|_| Error::codec(format!("bad record id '{}'", s)))?;
        let seq = seq
            .parse()
            .map_err(|_| Error::codec(format!("bad record id '{}'", s)))?;
        Ok(Self { seq, millis })
    }
}

pub type Fields = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub fields: Fields,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Durable,
    Memory,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Durable => f.write_str("durable"),
            TransportKind::Memory => f.write_str("memory"),
        }
    }
}

/// Stream storage used by the queue.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Append one record and return its id.
    async fn append(&self, stream: &str, fields: Fields) -> Result<RecordId>;

    /// Records newer than `after`, oldest first, at most `limit` (0 means no
    /// limit). With a non-zero `block`, waits that long for something to
    /// arrive and returns an empty vec on timeout.
    async fn read(
        &self,
        stream: &str,
        after: Option<RecordId>,
        limit: usize,
        block: Duration,
    ) -> Result<Vec<Record>>;

    /// Drop the oldest records so at most `max_len` remain.
    async fn trim(&self, stream: &str, max_len: usize) -> Result<usize>;

    /// Drop every record older than `id`.
    async fn trim_before(&self, stream: &str, id: RecordId) -> Result<usize>;

    /// Names of the non-empty streams.
    async fn streams(&self) -> Result<Vec<String>>;

    fn kind(&self) -> TransportKind;
}

/// Build the configured transport. A durable backend that cannot be opened
/// falls back to memory; the choice is final for the transport's lifetime.
pub fn connect(settings: &TransportSettings) -> Arc<dyn Transport> {
    match settings.kind {
        TransportKind::Memory => {
            tracing::info!("Using in-memory transport");
            Arc::new(MemoryTransport::new())
        }
        TransportKind::Durable => {
            let opened = match &settings.path {
                Some(path) => SqliteTransport::open(path),
                None => Err(Error::Config("durable transport needs a path".into())),
            };
            match opened {
                Ok(transport) => {
                    tracing::info!("Using durable transport at {:?}", settings.path);
                    Arc::new(transport)
                }
                Err(e) => {
                    tracing::warn!("Durable transport unavailable, falling back to memory: {}", e);
                    Arc::new(MemoryTransport::new())
                }
            }
        }
    }
}
