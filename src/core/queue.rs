//! Envelope delivery over a [`Transport`].
//!
//! Stream layout under the configured prefix:
//! - `<prefix>:agent:<id>` : envelopes addressed to one agent
//! - `<prefix>:broadcast`  : envelopes addressed to everyone
//! - `<prefix>:acks`       : ack and retry records
//!
//! Envelope records are never rewritten. Acks and retries are appended to
//! the ack stream and folded in on read, per consumer, so a broadcast acked
//! by one agent stays pending for the others.
//!
//! Cleanup replaces the ack stream with one summary per live consumer plus a
//! compaction mark per envelope stream. Summaries carry `upto`, the newest
//! record they replace, and are ignored while any of those records remain.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::clock::SharedClock;
use crate::config::QueueSettings;
use crate::error::Result;
use crate::protocol::codec;
use crate::protocol::{Envelope, EnvelopeId, EnvelopeStatus, MessageType};
use crate::transport::{Fields, Record, RecordId, Transport, TransportKind};

const ACK_REF: &str = "ref";
const ACK_AGENT: &str = "agent";
const ACK_KIND: &str = "kind";
const ACK_STATUS: &str = "status";
const ACK_ERROR: &str = "error";
const ACK_COUNT: &str = "count";
const ACK_STREAM: &str = "stream";
const ACK_UPTO: &str = "upto";

const KIND_ACK: &str = "ack";
const KIND_RETRY: &str = "retry";
const KIND_MARK: &str = "mark";

/// What `receive` should return.
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    pub limit: usize,
    /// Only these message types; `None` means all.
    pub types: Option<Vec<MessageType>>,
    /// Only envelopes appended after this record.
    pub after: Option<RecordId>,
    /// How long to wait when nothing is deliverable.
    pub block: Duration,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            types: None,
            after: None,
            block: Duration::ZERO,
        }
    }
}

impl ReceiveOptions {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn with_types(mut self, types: Vec<MessageType>) -> Self {
        self.types = Some(types);
        self
    }

    pub fn with_after(mut self, after: RecordId) -> Self {
        self.after = Some(after);
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Settled envelopes dropped from the front of their streams.
    pub compacted: usize,
    /// Envelopes dropped to respect the stream length cap.
    pub trimmed: usize,
    /// Ack records whose envelopes are gone.
    pub acks_removed: usize,
}

/// Direct envelopes by effective status, plus broadcast totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub processed: usize,
    pub failed: usize,
    pub expired: usize,
    pub dead: usize,
    pub broadcasts: usize,
    pub ack_records: usize,
}

type ConsumerKey = (RecordId, String);

#[derive(Debug, Clone)]
struct AckEntry {
    status: EnvelopeStatus,
    error: Option<String>,
}

/// Ack stream folded into per-consumer state.
#[derive(Default)]
struct AckLedger {
    acks: HashMap<ConsumerKey, AckEntry>,
    retries: HashMap<ConsumerKey, u32>,
    /// `(ack record, target envelope)` for every ack and retry record.
    records: Vec<(RecordId, RecordId)>,
    /// Newest record removed from each envelope stream by cleanup.
    marks: HashMap<String, RecordId>,
    newest: Option<RecordId>,
}

fn parse_id(fields: &Fields, key: &str) -> Option<RecordId> {
    fields.get(key).and_then(|v| v.parse::<RecordId>().ok())
}

impl AckLedger {
    fn fold(records: &[Record]) -> Self {
        let mut ledger = Self {
            newest: records.last().map(|r| r.id),
            ..Self::default()
        };
        let Some(oldest) = records.first().map(|r| r.id) else {
            return ledger;
        };

        for record in records {
            if parse_id(&record.fields, ACK_UPTO).map_or(false, |upto| oldest <= upto) {
                continue;
            }
            let target = parse_id(&record.fields, ACK_REF);
            let kind = record.fields.get(ACK_KIND).map(String::as_str);

            if kind == Some(KIND_MARK) {
                match (target, record.fields.get(ACK_STREAM)) {
                    (Some(target), Some(stream)) => {
                        let mark = ledger.marks.entry(stream.clone()).or_insert(target);
                        *mark = (*mark).max(target);
                    }
                    _ => tracing::warn!("Skipping malformed mark record {}", record.id),
                }
                continue;
            }

            let (Some(target), Some(agent)) = (target, record.fields.get(ACK_AGENT)) else {
                tracing::warn!("Skipping malformed ack record {}", record.id);
                continue;
            };
            ledger.records.push((record.id, target));
            let key = (target, agent.clone());
            match kind {
                Some(KIND_ACK) => {
                    let status = record
                        .fields
                        .get(ACK_STATUS)
                        .and_then(|s| s.parse::<EnvelopeStatus>().ok())
                        .unwrap_or(EnvelopeStatus::Processed);
                    // First ack wins.
                    ledger.acks.entry(key).or_insert(AckEntry {
                        status,
                        error: record.fields.get(ACK_ERROR).cloned(),
                    });
                }
                Some(KIND_RETRY) => {
                    let count = record
                        .fields
                        .get(ACK_COUNT)
                        .and_then(|c| c.parse::<u32>().ok())
                        .unwrap_or(1);
                    *ledger.retries.entry(key).or_insert(0) += count;
                }
                other => tracing::warn!("Unknown ack kind {:?} in record {}", other, record.id),
            }
        }
        ledger
    }

    fn is_acked(&self, target: RecordId, agent: &str) -> bool {
        self.acks.contains_key(&(target, agent.to_string()))
    }

    /// Already removed from one of `streams` by cleanup.
    fn is_compacted(&self, target: RecordId, streams: &[String]) -> bool {
        streams
            .iter()
            .any(|stream| self.marks.get(stream).map_or(false, |mark| target <= *mark))
    }

    /// The envelope as `agent` currently sees it.
    fn apply(&self, target: RecordId, agent: &str, mut envelope: Envelope) -> Envelope {
        let key = (target, agent.to_string());
        if let Some(entry) = self.acks.get(&key) {
            envelope.status = entry.status;
        }
        if let Some(retries) = self.retries.get(&key) {
            envelope.retry_count = envelope
                .retry_count
                .saturating_add(*retries)
                .min(envelope.max_retries);
        }
        envelope
    }
}

/// Decode a stored envelope and stamp it with its record id.
fn decode_record(record: &Record) -> Result<Envelope> {
    let mut envelope = codec::decode(&record.fields)?;
    envelope.id = EnvelopeId::new(record.id.to_string());
    Ok(envelope)
}

fn deliverable(envelope: &Envelope, now: DateTime<Utc>) -> bool {
    envelope.status == EnvelopeStatus::Pending
        && !envelope.is_expired_at(now)
        && !envelope.is_exhausted()
}

/// A read position just before `id`, so a read returns `id` first.
fn just_before(id: RecordId) -> Option<RecordId> {
    id.seq().checked_sub(1).map(|seq| RecordId::new(i64::MAX, seq))
}

/// A trim position that drops `id` and everything older, but nothing newer.
fn just_after(id: RecordId) -> RecordId {
    RecordId::new(0, id.seq() + 1)
}

pub struct QueueManager {
    transport: Arc<dyn Transport>,
    settings: QueueSettings,
    clock: SharedClock,
}

impl QueueManager {
    pub fn new(transport: Arc<dyn Transport>, settings: QueueSettings, clock: SharedClock) -> Self {
        Self {
            transport,
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn direct_stream(&self, agent_id: &str) -> String {
        format!("{}:agent:{}", self.settings.stream_prefix, agent_id)
    }

    pub fn broadcast_stream(&self) -> String {
        format!("{}:broadcast", self.settings.stream_prefix)
    }

    pub fn ack_stream(&self) -> String {
        format!("{}:acks", self.settings.stream_prefix)
    }

    fn direct_prefix(&self) -> String {
        format!("{}:agent:", self.settings.stream_prefix)
    }

    /// Append an envelope to its recipient's stream, or the broadcast stream.
    pub async fn try_send(&self, envelope: &Envelope) -> Result<EnvelopeId> {
        envelope.validate()?;
        let stream = match &envelope.to {
            Some(to) => self.direct_stream(to),
            None => self.broadcast_stream(),
        };
        let fields = match self.broadcast_expiry(envelope) {
            Some(expires_at) => {
                let mut envelope = envelope.clone();
                envelope.expires_at = Some(expires_at);
                codec::encode(&envelope)?
            }
            None => codec::encode(envelope)?,
        };
        let id = self.transport.append(&stream, fields).await?;
        tracing::debug!(
            "Queued {} from {} to {} as {}",
            envelope.message_type,
            envelope.from,
            envelope.to.as_deref().unwrap_or("*"),
            id
        );
        Ok(EnvelopeId::new(id.to_string()))
    }

    /// Broadcasts without their own expiry get the configured one, so
    /// cleanup can eventually drop them and their acks.
    fn broadcast_expiry(&self, envelope: &Envelope) -> Option<DateTime<Utc>> {
        if envelope.is_broadcast() && envelope.expires_at.is_none() {
            self.settings.broadcast_ttl().map(|ttl| envelope.created_at + ttl)
        } else {
            None
        }
    }

    /// Send without surfacing errors; failures are logged and return false.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        match self.try_send(envelope).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("Failed to send {} from {}: {}", envelope.message_type, envelope.from, e);
                false
            }
        }
    }

    async fn read_all(&self, stream: &str, after: Option<RecordId>) -> Result<Vec<Record>> {
        self.transport.read(stream, after, 0, Duration::ZERO).await
    }

    async fn ledger(&self) -> Result<AckLedger> {
        let records = self.read_all(&self.ack_stream(), None).await?;
        Ok(AckLedger::fold(&records))
    }

    /// Every envelope visible to `agent_id` with its consumer view applied,
    /// and the newest record seen on each of the two streams.
    async fn visible(
        &self,
        agent_id: &str,
        after: Option<RecordId>,
    ) -> Result<(Vec<(RecordId, Envelope)>, Option<RecordId>, Option<RecordId>)> {
        let direct = self.read_all(&self.direct_stream(agent_id), after).await?;
        let broadcast = self.read_all(&self.broadcast_stream(), after).await?;
        let ledger = self.ledger().await?;

        let last_direct = direct.last().map(|r| r.id).or(after);
        let last_broadcast = broadcast.last().map(|r| r.id).or(after);

        let mut visible = Vec::with_capacity(direct.len() + broadcast.len());
        for record in direct.iter().chain(broadcast.iter()) {
            match decode_record(record) {
                Ok(envelope) if envelope.is_for(agent_id) => {
                    visible.push((record.id, ledger.apply(record.id, agent_id, envelope)));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping undecodable record {}: {}", record.id, e),
            }
        }
        Ok((visible, last_direct, last_broadcast))
    }

    /// Pending envelopes for `agent_id`, most urgent first.
    pub async fn receive(&self, agent_id: &str, opts: &ReceiveOptions) -> Result<Vec<Envelope>> {
        let deadline = Instant::now() + opts.block;
        loop {
            let (visible, last_direct, last_broadcast) = self.visible(agent_id, opts.after).await?;
            let now = self.clock.now();

            let mut ready: Vec<(RecordId, Envelope)> = visible
                .into_iter()
                .filter(|(_, e)| deliverable(e, now))
                .filter(|(_, e)| {
                    opts.types
                        .as_ref()
                        .map_or(true, |types| types.contains(&e.message_type))
                })
                .collect();
            ready.sort_by(|(a_id, a), (b_id, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a_id.cmp(b_id))
            });
            ready.truncate(opts.limit);

            let remaining = deadline.saturating_duration_since(Instant::now());
            if !ready.is_empty() || remaining.is_zero() {
                return Ok(ready.into_iter().map(|(_, e)| e).collect());
            }

            let direct = self.direct_stream(agent_id);
            let broadcast = self.broadcast_stream();
            tokio::select! {
                r = self.transport.read(&direct, last_direct, 1, remaining) => { r?; }
                r = self.transport.read(&broadcast, last_broadcast, 1, remaining) => { r?; }
            }
        }
    }

    /// Find the record for `id` in the streams `agent_id` can see.
    async fn locate(&self, id: &EnvelopeId, agent_id: &str) -> Result<Option<(RecordId, Envelope)>> {
        let target: RecordId = id.as_str().parse()?;
        for stream in [self.direct_stream(agent_id), self.broadcast_stream()] {
            let records = self
                .transport
                .read(&stream, just_before(target), 1, Duration::ZERO)
                .await?;
            if let Some(record) = records.into_iter().find(|r| r.id == target) {
                let envelope = decode_record(&record)?;
                if envelope.is_for(agent_id) {
                    return Ok(Some((target, envelope)));
                }
            }
        }
        Ok(None)
    }

    async fn try_ack(
        &self,
        id: &EnvelopeId,
        agent_id: &str,
        status: EnvelopeStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        if status == EnvelopeStatus::Pending {
            return Ok(false);
        }
        let Some((target, _)) = self.locate(id, agent_id).await? else {
            let target: RecordId = id.as_str().parse()?;
            let streams = [self.direct_stream(agent_id), self.broadcast_stream()];
            if self.ledger().await?.is_compacted(target, &streams) {
                tracing::debug!("{} already compacted, ack from {} is a no-op", id, agent_id);
                return Ok(true);
            }
            tracing::debug!("Ack for {} not visible to {}", id, agent_id);
            return Ok(false);
        };
        if self.ledger().await?.is_acked(target, agent_id) {
            return Ok(true);
        }

        let mut fields = Fields::new();
        fields.insert(ACK_REF.into(), target.to_string());
        fields.insert(ACK_AGENT.into(), agent_id.to_string());
        fields.insert(ACK_KIND.into(), KIND_ACK.into());
        fields.insert(ACK_STATUS.into(), status.as_str().into());
        if let Some(error) = error {
            fields.insert(ACK_ERROR.into(), error.to_string());
        }
        self.transport.append(&self.ack_stream(), fields).await?;
        tracing::debug!("{} acked {} as {}", agent_id, id, status);
        Ok(true)
    }

    /// Settle an envelope for one consumer. Acking twice is a no-op that
    /// still returns true.
    pub async fn ack(
        &self,
        id: &EnvelopeId,
        agent_id: &str,
        status: EnvelopeStatus,
        error: Option<&str>,
    ) -> bool {
        match self.try_ack(id, agent_id, status, error).await {
            Ok(acked) => acked,
            Err(e) => {
                tracing::warn!("Failed to ack {} for {}: {}", id, agent_id, e);
                false
            }
        }
    }

    async fn try_nack(&self, id: &EnvelopeId, agent_id: &str, error: Option<&str>) -> Result<bool> {
        let Some((target, envelope)) = self.locate(id, agent_id).await? else {
            return Ok(false);
        };
        let ledger = self.ledger().await?;
        if ledger.is_acked(target, agent_id) {
            return Ok(false);
        }
        let current = ledger.apply(target, agent_id, envelope);
        if current.is_exhausted() {
            return Ok(true);
        }

        let mut fields = Fields::new();
        fields.insert(ACK_REF.into(), target.to_string());
        fields.insert(ACK_AGENT.into(), agent_id.to_string());
        fields.insert(ACK_KIND.into(), KIND_RETRY.into());
        if let Some(error) = error {
            fields.insert(ACK_ERROR.into(), error.to_string());
        }
        self.transport.append(&self.ack_stream(), fields).await?;

        let attempts = current.retry_count + 1;
        if attempts >= current.max_retries {
            tracing::warn!("{} exhausted its retries for {}", id, agent_id);
        } else {
            tracing::debug!("{} will redeliver {} (retry {}/{})", agent_id, id, attempts, current.max_retries);
        }
        Ok(true)
    }

    /// Record a failed delivery attempt. The envelope stays pending until its
    /// retries run out, then only [`dead_letters`](Self::dead_letters) shows it.
    pub async fn nack(&self, id: &EnvelopeId, agent_id: &str, error: Option<&str>) -> bool {
        match self.try_nack(id, agent_id, error).await {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!("Failed to nack {} for {}: {}", id, agent_id, e);
                false
            }
        }
    }

    /// Pending, unexpired envelopes for `agent_id` whose retries are exhausted.
    pub async fn dead_letters(&self, agent_id: &str) -> Result<Vec<Envelope>> {
        let (visible, _, _) = self.visible(agent_id, None).await?;
        let now = self.clock.now();
        Ok(visible
            .into_iter()
            .map(|(_, e)| e)
            .filter(|e| e.status == EnvelopeStatus::Pending && !e.is_expired_at(now) && e.is_exhausted())
            .collect())
    }

    /// Drop settled envelopes, cap stream lengths and rewrite the ack stream
    /// down to what the remaining envelopes still need.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        let ledger = self.ledger().await?;
        let now = self.clock.now();
        let direct_prefix = self.direct_prefix();
        let broadcast = self.broadcast_stream();
        let max_len = self.settings.max_stream_len;

        let mut marks = ledger.marks.clone();
        let mut remaining: HashSet<RecordId> = HashSet::new();
        for stream in self.transport.streams().await? {
            let agent = stream.strip_prefix(&direct_prefix).map(str::to_string);
            if agent.is_none() && stream != broadcast {
                continue;
            }

            let records = self.read_all(&stream, None).await?;
            let settled = |record: &Record| match decode_record(record) {
                Err(_) => true,
                Ok(envelope) => match &agent {
                    Some(agent) => {
                        let seen = ledger.apply(record.id, agent, envelope);
                        seen.status != EnvelopeStatus::Pending
                            || seen.is_expired_at(now)
                            || seen.is_exhausted()
                    }
                    None => envelope.is_expired_at(now),
                },
            };

            let cut = records.iter().position(|r| !settled(r)).unwrap_or(records.len());
            let compacted = match (records.get(cut), records.last()) {
                (Some(first_live), _) => self.transport.trim_before(&stream, first_live.id).await?,
                (None, Some(last)) => self.transport.trim_before(&stream, just_after(last.id)).await?,
                (None, None) => 0,
            };
            let trimmed = self.transport.trim(&stream, max_len).await?;

            let dropped = (compacted + trimmed).min(records.len());
            if let Some(last_dropped) = dropped.checked_sub(1).map(|i| records[i].id) {
                let mark = marks.entry(stream.clone()).or_insert(last_dropped);
                *mark = (*mark).max(last_dropped);
            }
            remaining.extend(records[dropped..].iter().map(|r| r.id));
            report.compacted += compacted;
            report.trimmed += trimmed;
        }

        let dead = ledger
            .records
            .iter()
            .filter(|(_, target)| !remaining.contains(target))
            .count();
        if dead > 0 || marks != ledger.marks {
            self.rewrite_acks(&ledger, &remaining, &marks).await?;
            report.acks_removed = dead;
        }

        let capped = self.transport.trim(&self.ack_stream(), max_len).await?;
        if capped > 0 {
            tracing::warn!("Ack stream over {} records, dropped {} oldest", max_len, capped);
            report.acks_removed += capped;
        }

        if report != CleanupReport::default() {
            tracing::info!(
                "Queue cleanup: compacted {}, trimmed {}, acks removed {}",
                report.compacted,
                report.trimmed,
                report.acks_removed
            );
        }
        Ok(report)
    }

    /// Append one summary per live consumer and the compaction marks, then
    /// drop every record the summaries replace. Acks appended meanwhile are
    /// newer than `ledger.newest` and survive.
    async fn rewrite_acks(
        &self,
        ledger: &AckLedger,
        remaining: &HashSet<RecordId>,
        marks: &HashMap<String, RecordId>,
    ) -> Result<()> {
        let stream = self.ack_stream();
        let consumer = |(target, agent): &ConsumerKey, kind: &str| {
            let mut fields = Fields::new();
            fields.insert(ACK_REF.into(), target.to_string());
            fields.insert(ACK_AGENT.into(), agent.clone());
            fields.insert(ACK_KIND.into(), kind.into());
            fields
        };

        let mut summaries = Vec::new();
        for (key, entry) in ledger.acks.iter().filter(|(key, _)| remaining.contains(&key.0)) {
            let mut fields = consumer(key, KIND_ACK);
            fields.insert(ACK_STATUS.into(), entry.status.as_str().into());
            if let Some(error) = &entry.error {
                fields.insert(ACK_ERROR.into(), error.clone());
            }
            summaries.push(fields);
        }
        for (key, count) in ledger.retries.iter().filter(|(key, _)| remaining.contains(&key.0)) {
            let mut fields = consumer(key, KIND_RETRY);
            fields.insert(ACK_COUNT.into(), count.to_string());
            summaries.push(fields);
        }
        for (name, mark) in marks {
            let mut fields = Fields::new();
            fields.insert(ACK_KIND.into(), KIND_MARK.into());
            fields.insert(ACK_STREAM.into(), name.clone());
            fields.insert(ACK_REF.into(), mark.to_string());
            summaries.push(fields);
        }

        for mut fields in summaries {
            if let Some(newest) = ledger.newest {
                fields.insert(ACK_UPTO.into(), newest.to_string());
            }
            self.transport.append(&stream, fields).await?;
        }
        if let Some(newest) = ledger.newest {
            self.transport.trim_before(&stream, just_after(newest)).await?;
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let ledger = self.ledger().await?;
        let now = self.clock.now();
        let direct_prefix = self.direct_prefix();
        let broadcast = self.broadcast_stream();
        let mut stats = QueueStats {
            ack_records: ledger.records.len(),
            ..QueueStats::default()
        };

        for stream in self.transport.streams().await? {
            if stream == broadcast {
                stats.broadcasts += self.read_all(&stream, None).await?.len();
                continue;
            }
            let Some(agent) = stream.strip_prefix(&direct_prefix) else {
                continue;
            };
            for record in self.read_all(&stream, None).await? {
                let Ok(envelope) = decode_record(&record) else {
                    continue;
                };
                let seen = ledger.apply(record.id, agent, envelope);
                stats.total += 1;
                match seen.status {
                    EnvelopeStatus::Pending if seen.is_expired_at(now) => stats.expired += 1,
                    EnvelopeStatus::Pending if seen.is_exhausted() => stats.dead += 1,
                    EnvelopeStatus::Pending => stats.pending += 1,
                    EnvelopeStatus::Processing => stats.processing += 1,
                    EnvelopeStatus::Processed => stats.processed += 1,
                    EnvelopeStatus::Failed => stats.failed += 1,
                    EnvelopeStatus::Expired => stats.expired += 1,
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::{EnvelopeBuilder, Priority};
    use crate::transport::{MemoryTransport, SqliteTransport};
    use chrono::TimeZone;
    use serde_json::json;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn queue_on(transport: Arc<dyn Transport>, clock: &ManualClock) -> QueueManager {
        QueueManager::new(transport, QueueSettings::default(), Arc::new(clock.clone()))
    }

    fn memory_queue() -> (QueueManager, ManualClock) {
        let clock = ManualClock::new(start());
        (queue_on(Arc::new(MemoryTransport::new()), &clock), clock)
    }

    fn request(to: &str, priority: Priority, label: &str) -> Envelope {
        EnvelopeBuilder::from("supervisor")
            .to(to)
            .message_type(MessageType::TaskRequest)
            .priority(priority)
            .payload(json!({"task_id": label}))
            .created_at(start())
            .build()
            .unwrap()
    }

    async fn priority_order(queue: &QueueManager) {
        for (p, label) in [
            (Priority::Low, "low"),
            (Priority::Critical, "critical"),
            (Priority::Medium, "medium"),
            (Priority::High, "high"),
        ] {
            assert!(queue.send(&request("w1", p, label)).await);
        }

        let got = queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap();
        let labels: Vec<_> = got.iter().filter_map(|e| e.task_id()).collect();
        assert_eq!(labels, vec!["critical", "high", "medium", "low"]);
        assert!(got.iter().all(|e| e.id.is_assigned()));
    }

    async fn double_ack(queue: &QueueManager) {
        queue.send(&request("w1", Priority::Medium, "t")).await;
        let got = queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap();
        let id = got[0].id.clone();

        assert!(queue.ack(&id, "w1", EnvelopeStatus::Processed, None).await);
        assert!(queue.ack(&id, "w1", EnvelopeStatus::Failed, Some("late")).await);
        assert!(queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap().is_empty());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.ack_records, 1);
    }

    #[tokio::test]
    async fn test_priority_order_memory() {
        let (queue, _clock) = memory_queue();
        priority_order(&queue).await;
    }

    #[tokio::test]
    async fn test_priority_order_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let transport = SqliteTransport::open(&dir.path().join("q.db")).unwrap();
        priority_order(&queue_on(Arc::new(transport), &clock)).await;
    }

    #[tokio::test]
    async fn test_double_ack_memory() {
        let (queue, _clock) = memory_queue();
        double_ack(&queue).await;
    }

    #[tokio::test]
    async fn test_double_ack_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(start());
        let transport = SqliteTransport::open(&dir.path().join("q.db")).unwrap();
        double_ack(&queue_on(Arc::new(transport), &clock)).await;
    }

    #[tokio::test]
    async fn test_ties_break_by_creation_then_insertion() {
        let (queue, _clock) = memory_queue();
        let mut later = request("w1", Priority::High, "later");
        later.created_at = start() + chrono::Duration::seconds(1);
        queue.send(&later).await;
        queue.send(&request("w1", Priority::High, "first")).await;
        queue.send(&request("w1", Priority::High, "second")).await;

        let got = queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap();
        let labels: Vec<_> = got.iter().filter_map(|e| e.task_id()).collect();
        assert_eq!(labels, vec!["first", "second", "later"]);
    }

    #[tokio::test]
    async fn test_expired_envelopes_are_never_received() {
        let (queue, clock) = memory_queue();
        let envelope = EnvelopeBuilder::from("supervisor")
            .to("w1")
            .message_type(MessageType::TaskRequest)
            .created_at(start())
            .ttl(chrono::Duration::seconds(30))
            .build()
            .unwrap();
        queue.send(&envelope).await;

        assert_eq!(queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap().len(), 1);
        clock.advance(chrono::Duration::seconds(30));
        assert!(queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap().is_empty());
        assert!(queue.dead_letters("w1").await.unwrap().is_empty());
        assert_eq!(queue.stats().await.unwrap().expired, 1);
    }

    #[tokio::test]
    async fn test_processing_envelopes_are_not_redelivered() {
        let (queue, _clock) = memory_queue();
        queue.send(&request("w1", Priority::Medium, "t")).await;
        let id = queue.receive("w1", &ReceiveOptions::new(1)).await.unwrap()[0].id.clone();

        assert!(queue.ack(&id, "w1", EnvelopeStatus::Processing, None).await);
        assert!(queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_rejects_pending_and_foreign_ids() {
        let (queue, _clock) = memory_queue();
        queue.send(&request("w1", Priority::Medium, "t")).await;
        let id = queue.receive("w1", &ReceiveOptions::new(1)).await.unwrap()[0].id.clone();

        assert!(!queue.ack(&id, "w1", EnvelopeStatus::Pending, None).await);
        assert!(!queue.ack(&id, "w2", EnvelopeStatus::Processed, None).await);
        assert!(!queue.ack(&EnvelopeId::new("0-999"), "w1", EnvelopeStatus::Processed, None).await);
        assert!(!queue.ack(&EnvelopeId::new("nonsense"), "w1", EnvelopeStatus::Processed, None).await);
        assert_eq!(queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_is_acked_per_consumer() {
        let (queue, _clock) = memory_queue();
        let notice = Envelope::broadcast("supervisor", MessageType::Broadcast, json!({"note": "deploy"}));
        queue.send(&notice).await;

        let w1 = queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap();
        assert_eq!(w1.len(), 1);
        assert!(queue.ack(&w1[0].id, "w1", EnvelopeStatus::Processed, None).await);

        assert!(queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap().is_empty());
        assert_eq!(queue.receive("w2", &ReceiveOptions::new(10)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_type_filter() {
        let (queue, _clock) = memory_queue();
        queue.send(&request("w1", Priority::Medium, "t")).await;
        queue
            .send(&Envelope::new("w2", "w1", MessageType::Heartbeat, json!({})))
            .await;

        let opts = ReceiveOptions::new(10).with_types(vec![MessageType::Heartbeat]);
        let got = queue.receive("w1", &opts).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].message_type, MessageType::Heartbeat);
    }

    #[tokio::test]
    async fn test_receive_after_skips_older_records() {
        let (queue, _clock) = memory_queue();
        let first = queue.try_send(&request("w1", Priority::Medium, "a")).await.unwrap();
        queue.send(&request("w1", Priority::Medium, "b")).await;

        let after: RecordId = first.as_str().parse().unwrap();
        let got = queue
            .receive("w1", &ReceiveOptions::new(10).with_after(after))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].task_id(), Some("b"));
    }

    #[tokio::test]
    async fn test_nack_until_dead_letter() {
        let (queue, _clock) = memory_queue();
        let mut envelope = request("w1", Priority::Medium, "poison");
        envelope.max_retries = 2;
        queue.send(&envelope).await;

        let id = queue.receive("w1", &ReceiveOptions::new(1)).await.unwrap()[0].id.clone();
        assert!(queue.nack(&id, "w1", Some("boom")).await);

        let again = queue.receive("w1", &ReceiveOptions::new(1)).await.unwrap();
        assert_eq!(again[0].retry_count, 1);

        assert!(queue.nack(&id, "w1", Some("boom")).await);
        assert!(queue.receive("w1", &ReceiveOptions::new(1)).await.unwrap().is_empty());

        let dead = queue.dead_letters("w1").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 2);

        // Saturated: no further retry records.
        assert!(queue.nack(&id, "w1", None).await);
        assert_eq!(queue.stats().await.unwrap().ack_records, 2);
        assert_eq!(queue.stats().await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn test_receive_blocks_until_send() {
        let clock = ManualClock::new(start());
        let queue = Arc::new(queue_on(Arc::new(MemoryTransport::new()), &clock));

        let sender = queue.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            sender.send(&request("w1", Priority::High, "late")).await
        });

        let opts = ReceiveOptions::new(10).with_block(Duration::from_secs(5));
        let got = queue.receive("w1", &opts).await.unwrap();
        assert_eq!(got.len(), 1);
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_blocking_receive_times_out_empty() {
        let (queue, _clock) = memory_queue();
        let opts = ReceiveOptions::new(10).with_block(Duration::from_millis(40));
        assert!(queue.receive("w1", &opts).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_compacts_settled_prefix() {
        let (queue, _clock) = memory_queue();
        queue.send(&request("w1", Priority::Medium, "a")).await;
        queue.send(&request("w1", Priority::Medium, "b")).await;
        queue.send(&request("w1", Priority::Medium, "c")).await;

        let got = queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap();
        let by_label = |label: &str| got.iter().find(|e| e.task_id() == Some(label)).unwrap().id.clone();
        queue.ack(&by_label("a"), "w1", EnvelopeStatus::Processed, None).await;
        queue.ack(&by_label("c"), "w1", EnvelopeStatus::Processed, None).await;

        let report = queue.cleanup().await.unwrap();
        assert_eq!(report.compacted, 1);
        assert_eq!(report.acks_removed, 1);

        // "c" stays acked even though "b" blocks it from being compacted.
        let left = queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].task_id(), Some("b"));

        queue.ack(&left[0].id, "w1", EnvelopeStatus::Processed, None).await;
        let report = queue.cleanup().await.unwrap();
        assert_eq!(report.compacted, 2);
        assert_eq!(report.acks_removed, 2);
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_ack_survives_compaction() {
        let (queue, _clock) = memory_queue();
        queue.send(&request("w1", Priority::Medium, "t")).await;
        let id = queue.receive("w1", &ReceiveOptions::new(1)).await.unwrap()[0].id.clone();

        assert!(queue.ack(&id, "w1", EnvelopeStatus::Processed, None).await);
        assert_eq!(queue.cleanup().await.unwrap().compacted, 1);
        assert!(queue.ack(&id, "w1", EnvelopeStatus::Processed, None).await);
        assert!(queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap().is_empty());
        assert!(!queue.ack(&id, "w2", EnvelopeStatus::Processed, None).await);
    }

    #[tokio::test]
    async fn test_cleanup_drops_acks_behind_a_live_broadcast() {
        let (queue, clock) = memory_queue();
        let mut notice = Envelope::broadcast("supervisor", MessageType::Broadcast, json!({"note": "deploy"}));
        notice.created_at = start();
        queue.send(&notice).await;
        let notice_id = queue.receive("w1", &ReceiveOptions::new(1)).await.unwrap()[0].id.clone();
        assert!(queue.ack(&notice_id, "w1", EnvelopeStatus::Processed, None).await);

        for i in 0..50 {
            queue.send(&request("w2", Priority::Medium, &format!("t{}", i))).await;
        }
        for envelope in queue.receive("w2", &ReceiveOptions::new(100)).await.unwrap() {
            if envelope.is_broadcast() {
                continue;
            }
            assert!(queue.ack(&envelope.id, "w2", EnvelopeStatus::Processed, None).await);
        }

        let report = queue.cleanup().await.unwrap();
        assert_eq!(report.compacted, 50);
        assert_eq!(report.acks_removed, 50);
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.ack_records, 1);
        assert_eq!(stats.broadcasts, 1);

        // The broadcast stays settled for w1 and pending for w2.
        assert!(queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap().is_empty());
        assert_eq!(queue.receive("w2", &ReceiveOptions::new(10)).await.unwrap().len(), 1);

        // Broadcasts expire after the configured ttl, then nothing is left.
        clock.advance(chrono::Duration::hours(1));
        let report = queue.cleanup().await.unwrap();
        assert_eq!(report.compacted, 1);
        assert_eq!(report.acks_removed, 1);
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
        assert!(queue.receive("w9", &ReceiveOptions::new(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retries_survive_ack_rewrite() {
        let (queue, _clock) = memory_queue();
        queue.send(&request("w1", Priority::Medium, "done")).await;
        queue.send(&request("w1", Priority::Medium, "flaky")).await;
        let got = queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap();
        let by_label = |label: &str| got.iter().find(|e| e.task_id() == Some(label)).unwrap().id.clone();

        queue.ack(&by_label("done"), "w1", EnvelopeStatus::Processed, None).await;
        queue.nack(&by_label("flaky"), "w1", Some("boom")).await;
        queue.nack(&by_label("flaky"), "w1", Some("boom")).await;

        let report = queue.cleanup().await.unwrap();
        assert_eq!(report.compacted, 1);
        assert_eq!(report.acks_removed, 1);

        let left = queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].retry_count, 2);
        assert_eq!(queue.stats().await.unwrap().ack_records, 1);
    }

    #[tokio::test]
    async fn test_cleanup_caps_ack_stream() {
        let clock = ManualClock::new(start());
        let settings = QueueSettings {
            max_stream_len: 3,
            ..QueueSettings::default()
        };
        let queue = QueueManager::new(Arc::new(MemoryTransport::new()), settings, Arc::new(clock));
        for _ in 0..2 {
            let mut notice = Envelope::broadcast("supervisor", MessageType::Broadcast, json!({}));
            notice.created_at = start();
            queue.send(&notice).await;
        }
        for agent in ["w1", "w2", "w3"] {
            for envelope in queue.receive(agent, &ReceiveOptions::new(10)).await.unwrap() {
                queue.ack(&envelope.id, agent, EnvelopeStatus::Processed, None).await;
            }
        }
        assert_eq!(queue.stats().await.unwrap().ack_records, 6);

        let report = queue.cleanup().await.unwrap();
        assert_eq!(report.acks_removed, 3);
        assert_eq!(queue.stats().await.unwrap().ack_records, 3);
    }

    #[tokio::test]
    async fn test_cleanup_caps_stream_length() {
        let clock = ManualClock::new(start());
        let settings = QueueSettings {
            max_stream_len: 2,
            ..QueueSettings::default()
        };
        let queue = QueueManager::new(Arc::new(MemoryTransport::new()), settings, Arc::new(clock));
        for label in ["a", "b", "c", "d"] {
            queue.send(&request("w1", Priority::Medium, label)).await;
        }

        let report = queue.cleanup().await.unwrap();
        assert_eq!(report.trimmed, 2);
        let left = queue.receive("w1", &ReceiveOptions::new(10)).await.unwrap();
        let labels: Vec<_> = left.iter().filter_map(|e| e.task_id()).collect();
        assert_eq!(labels, vec!["c", "d"]);
    }
}
