//! In-process transport. Same ids and visibility as the durable backend,
//! nothing survives the process.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Fields, Record, RecordId, Transport, TransportKind};
use crate::error::Result;

#[derive(Default)]
struct Streams {
    streams: HashMap<String, Vec<Record>>,
    next_seq: u64,
}

#[derive(Default)]
pub struct MemoryTransport {
    inner: Mutex<Streams>,
    appended: Notify,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect(&self, stream: &str, after: Option<RecordId>, limit: usize) -> Vec<Record> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(records) = inner.streams.get(stream) else {
            return Vec::new();
        };
        let start = match after {
            Some(after) => records.partition_point(|r| r.id <= after),
            None => 0,
        };
        let take = if limit == 0 { usize::MAX } else { limit };
        records[start..].iter().take(take).cloned().collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn append(&self, stream: &str, fields: Fields) -> Result<RecordId> {
        let id = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.next_seq += 1;
            let id = RecordId::new(chrono::Utc::now().timestamp_millis(), inner.next_seq);
            inner
                .streams
                .entry(stream.to_string())
                .or_default()
                .push(Record { id, fields });
            id
        };
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
            // Registered before the check so an append in between still wakes us.
            let appended = self.appended.notified();
            let records = self.collect(stream, after, limit);
            if !records.is_empty() {
                return Ok(records);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(records);
            }
            if tokio::time::timeout(remaining, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(records) = inner.streams.get_mut(stream) else {
            return Ok(0);
        };
        let excess = records.len().saturating_sub(max_len);
        records.drain(..excess);
        Ok(excess)
    }

    async fn trim_before(&self, stream: &str, id: RecordId) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(records) = inner.streams.get_mut(stream) else {
            return Ok(0);
        };
        let cut = records.partition_point(|r| r.id < id);
        records.drain(..cut);
        Ok(cut)
    }

    async fn streams(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .streams
            .iter()
            .filter(|(_, records)| !records.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }
}
