//! Agent registry: who is online, what they can do and how busy they are.
//!
//! The registry is in-memory and shared through `Arc`. Agents are never
//! removed, only marked offline. Persistence is explicit through
//! [`AgentRegistry::snapshot`] and [`AgentRegistry::restore`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::SharedClock;
use crate::config::RegistrySettings;
use crate::error::{Error, Result};
use crate::lock::with_lock;
use crate::protocol::{AgentRole, AgentStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub role: AgentRole,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub max_concurrency: u32,
    pub current_load: u32,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Registration order, for tie breaking.
    pub registered_seq: u64,
}

impl AgentRecord {
    /// `current_load / max_concurrency`. A zero limit counts as full when
    /// anything is running and empty otherwise.
    pub fn load_factor(&self) -> f64 {
        if self.max_concurrency == 0 {
            return if self.current_load > 0 { 1.0 } else { 0.0 };
        }
        self.current_load as f64 / self.max_concurrency as f64
    }

    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_heartbeat
    }

    /// Can take one more task right now.
    pub fn is_available_at(&self, now: DateTime<Utc>, staleness_window: Duration) -> bool {
        self.status.accepts_work()
            && self.current_load < self.max_concurrency
            && self.heartbeat_age(now) < staleness_window
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_role: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    /// Mean load factor across all agents.
    pub average_load: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistrySnapshot {
    taken_at: Option<DateTime<Utc>>,
    next_seq: u64,
    agents: Vec<AgentRecord>,
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentRecord>,
    next_seq: u64,
}

pub struct AgentRegistry {
    state: RwLock<RegistryState>,
    settings: RegistrySettings,
    clock: SharedClock,
}

impl AgentRegistry {
    pub fn new(settings: RegistrySettings, clock: SharedClock) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register or refresh an agent. Re-registering keeps the original
    /// registration order and the current load (clamped to the new limit).
    pub fn register(
        &self,
        id: &str,
        role: AgentRole,
        capabilities: BTreeSet<String>,
        max_concurrency: u32,
        metadata: Map<String, Value>,
    ) -> AgentRecord {
        let now = self.clock.now();
        let mut state = self.write();

        if let Some(existing) = state.agents.get_mut(id) {
            existing.role = role;
            existing.capabilities = capabilities;
            existing.max_concurrency = max_concurrency;
            existing.current_load = existing.current_load.min(max_concurrency);
            existing.status = AgentStatus::Active;
            existing.last_heartbeat = now;
            existing.metadata = metadata;
            tracing::info!("Refreshed agent {} ({})", id, role);
            return existing.clone();
        }

        state.next_seq += 1;
        let record = AgentRecord {
            id: id.to_string(),
            role,
            capabilities,
            status: AgentStatus::Active,
            max_concurrency,
            current_load: 0,
            last_heartbeat: now,
            metadata,
            registered_seq: state.next_seq,
        };
        state.agents.insert(id.to_string(), record.clone());
        tracing::info!(
            "Registered agent {} ({}) with capabilities {:?}",
            id,
            role,
            record.capabilities
        );
        record
    }

    /// Record a liveness report. Unknown agents are rejected.
    pub fn heartbeat(
        &self,
        id: &str,
        status: AgentStatus,
        current_load: u32,
        metadata: Map<String, Value>,
    ) -> bool {
        let now = self.clock.now();
        let mut state = self.write();
        let Some(agent) = state.agents.get_mut(id) else {
            tracing::warn!("{}", Error::UnknownAgent(id.to_string()));
            return false;
        };

        if current_load > agent.max_concurrency {
            tracing::warn!(
                "Agent {} reported load {} above its limit {}, clamping",
                id,
                current_load,
                agent.max_concurrency
            );
        }
        agent.current_load = current_load.min(agent.max_concurrency);
        agent.status = status;
        agent.last_heartbeat = now;
        agent.metadata.extend(metadata);
        tracing::debug!("Heartbeat from {}: {} load {}", id, status, agent.current_load);
        true
    }

    /// Available agents holding every required capability, least loaded
    /// first, ties by registration order.
    pub fn find_available(
        &self,
        required: &BTreeSet<String>,
        role: Option<AgentRole>,
        limit: usize,
    ) -> Vec<AgentRecord> {
        let now = self.clock.now();
        let window = self.settings.staleness_window();
        let state = self.read();

        let mut candidates: Vec<&AgentRecord> = state
            .agents
            .values()
            .filter(|a| role.map_or(true, |r| a.role == r))
            .filter(|a| a.has_capabilities(required))
            .filter(|a| a.is_available_at(now, window))
            .collect();
        candidates.sort_by(|a, b| {
            a.load_factor()
                .total_cmp(&b.load_factor())
                .then(a.registered_seq.cmp(&b.registered_seq))
        });
        candidates.into_iter().take(limit).cloned().collect()
    }

    /// Whether one specific agent could take a task needing `required`.
    pub fn is_available(&self, id: &str, required: &BTreeSet<String>) -> bool {
        let now = self.clock.now();
        let window = self.settings.staleness_window();
        self.read()
            .agents
            .get(id)
            .map_or(false, |a| a.has_capabilities(required) && a.is_available_at(now, window))
    }

    /// Mark agents silent for longer than `max_age` as offline. Returns how
    /// many changed.
    pub fn mark_stale(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let mut state = self.write();
        let mut changed = 0;
        for agent in state.agents.values_mut() {
            if agent.status != AgentStatus::Offline && agent.heartbeat_age(now) > max_age {
                tracing::warn!(
                    "Agent {} silent for {}s, marking offline",
                    agent.id,
                    agent.heartbeat_age(now).num_seconds()
                );
                agent.status = AgentStatus::Offline;
                changed += 1;
            }
        }
        changed
    }

    pub fn get(&self, id: &str) -> Option<AgentRecord> {
        self.read().agents.get(id).cloned()
    }

    /// All agents in registration order.
    pub fn agents(&self, include_offline: bool) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self
            .read()
            .agents
            .values()
            .filter(|a| include_offline || a.status != AgentStatus::Offline)
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.registered_seq);
        agents
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.read();
        let mut stats = RegistryStats {
            total: state.agents.len(),
            ..RegistryStats::default()
        };
        let mut load_sum = 0.0;
        for agent in state.agents.values() {
            *stats.by_role.entry(agent.role.to_string()).or_default() += 1;
            *stats.by_status.entry(agent.status.to_string()).or_default() += 1;
            load_sum += agent.load_factor();
        }
        if stats.total > 0 {
            stats.average_load = load_sum / stats.total as f64;
        }
        stats
    }

    /// Write the registry to `path` as JSON.
    pub fn snapshot(&self, path: &Path) -> Result<usize> {
        let snapshot = {
            let state = self.read();
            let mut agents: Vec<AgentRecord> = state.agents.values().cloned().collect();
            agents.sort_by_key(|a| a.registered_seq);
            RegistrySnapshot {
                taken_at: Some(self.clock.now()),
                next_seq: state.next_seq,
                agents,
            }
        };
        let count = snapshot.agents.len();
        let content = serde_json::to_string_pretty(&snapshot)?;

        with_lock(path, || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, content)?;
            std::fs::rename(&tmp, path)?;
            Ok(())
        })?;
        tracing::info!("Saved registry snapshot with {} agents to {}", count, path.display());
        Ok(count)
    }

    /// Replace the in-memory registry with the snapshot at `path`.
    pub fn restore(&self, path: &Path) -> Result<usize> {
        let snapshot: RegistrySnapshot = with_lock(path, || {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)
                .map_err(|e| Error::Snapshot(format!("{}: {}", path.display(), e)))
        })?;

        let count = snapshot.agents.len();
        let highest = snapshot.agents.iter().map(|a| a.registered_seq).max().unwrap_or(0);
        let mut state = self.write();
        state.next_seq = snapshot.next_seq.max(highest);
        state.agents = snapshot
            .agents
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();
        tracing::info!("Restored {} agents from {}", count, path.display());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn caps(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn registry() -> (AgentRegistry, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap());
        (
            AgentRegistry::new(RegistrySettings::default(), Arc::new(clock.clone())),
            clock,
        )
    }

    #[test]
    fn test_find_available_filters_and_orders_by_load() {
        let (reg, _clock) = registry();
        reg.register("a", AgentRole::Worker, caps(&["python", "sql"]), 5, Map::new());
        reg.register("b", AgentRole::Worker, caps(&["python"]), 5, Map::new());
        reg.register("c", AgentRole::Worker, caps(&["rust"]), 5, Map::new());
        reg.heartbeat("a", AgentStatus::Active, 2, Map::new());

        let found = reg.find_available(&caps(&["python"]), None, 10);
        let ids: Vec<_> = found.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(found.iter().all(|a| a.capabilities.contains("python")));
    }

    #[test]
    fn test_find_available_ties_by_registration_and_respects_role() {
        let (reg, _clock) = registry();
        reg.register("sup", AgentRole::Supervisor, caps(&["python"]), 5, Map::new());
        reg.register("w2", AgentRole::Worker, caps(&["python"]), 4, Map::new());
        reg.register("w1", AgentRole::Worker, caps(&["python"]), 2, Map::new());

        let ids: Vec<_> = reg
            .find_available(&caps(&[]), Some(AgentRole::Worker), 10)
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["w2".to_string(), "w1".to_string()]);
        assert_eq!(reg.find_available(&caps(&[]), None, 1).len(), 1);
    }

    #[test]
    fn test_full_busy_and_stale_agents_are_unavailable() {
        let (reg, clock) = registry();
        reg.register("full", AgentRole::Worker, caps(&[]), 1, Map::new());
        reg.register("busy", AgentRole::Worker, caps(&[]), 3, Map::new());
        reg.register("zero", AgentRole::Worker, caps(&[]), 0, Map::new());
        reg.heartbeat("full", AgentStatus::Active, 1, Map::new());
        reg.heartbeat("busy", AgentStatus::Busy, 0, Map::new());
        assert!(reg.find_available(&caps(&[]), None, 10).is_empty());

        reg.register("late", AgentRole::Worker, caps(&[]), 3, Map::new());
        clock.advance(Duration::minutes(5));
        assert!(reg.find_available(&caps(&[]), None, 10).is_empty());
    }

    #[test]
    fn test_heartbeat_unknown_agent() {
        let (reg, _clock) = registry();
        assert!(!reg.heartbeat("ghost", AgentStatus::Active, 0, Map::new()));
    }

    #[test]
    fn test_heartbeat_clamps_load_and_merges_metadata() {
        let (reg, _clock) = registry();
        let mut meta = Map::new();
        meta.insert("host".into(), Value::from("box-1"));
        reg.register("w", AgentRole::Worker, caps(&[]), 2, meta);

        let mut update = Map::new();
        update.insert("version".into(), Value::from("1.2"));
        assert!(reg.heartbeat("w", AgentStatus::Busy, 9, update));

        let agent = reg.get("w").unwrap();
        assert_eq!(agent.current_load, 2);
        assert_eq!(agent.status, AgentStatus::Busy);
        assert_eq!(agent.metadata["host"], "box-1");
        assert_eq!(agent.metadata["version"], "1.2");
    }

    #[test]
    fn test_register_is_an_upsert() {
        let (reg, clock) = registry();
        let first = reg.register("w", AgentRole::Worker, caps(&["python"]), 4, Map::new());
        reg.register("other", AgentRole::Worker, caps(&[]), 1, Map::new());
        reg.heartbeat("w", AgentStatus::Busy, 3, Map::new());

        clock.advance(Duration::minutes(10));
        reg.mark_stale(Duration::minutes(5));
        let again = reg.register("w", AgentRole::Worker, caps(&["python", "go"]), 2, Map::new());

        assert_eq!(again.registered_seq, first.registered_seq);
        assert_eq!(again.current_load, 2);
        assert_eq!(again.status, AgentStatus::Active);
        assert_eq!(again.last_heartbeat, clock.now());
        assert!(again.capabilities.contains("go"));
        assert_eq!(reg.agents(true).len(), 2);
    }

    #[test]
    fn test_mark_stale() {
        let (reg, clock) = registry();
        let start = clock.now();
        reg.register("old", AgentRole::Worker, caps(&[]), 1, Map::new());
        clock.set(start + Duration::minutes(2));
        reg.register("recent", AgentRole::Worker, caps(&[]), 1, Map::new());

        clock.set(start + Duration::minutes(6));
        assert_eq!(reg.mark_stale(Duration::minutes(5)), 1);
        assert_eq!(reg.get("old").unwrap().status, AgentStatus::Offline);
        assert_eq!(reg.get("recent").unwrap().status, AgentStatus::Active);
        assert_eq!(reg.mark_stale(Duration::minutes(5)), 0);

        assert_eq!(reg.agents(false).len(), 1);
        assert_eq!(reg.agents(true).len(), 2);
    }

    #[test]
    fn test_stats() {
        let (reg, _clock) = registry();
        reg.register("sup", AgentRole::Supervisor, caps(&[]), 0, Map::new());
        reg.register("w", AgentRole::Worker, caps(&[]), 4, Map::new());
        reg.heartbeat("w", AgentStatus::Busy, 2, Map::new());

        let stats = reg.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_role["worker"], 1);
        assert_eq!(stats.by_status["busy"], 1);
        assert!((stats.average_load - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let (reg, _clock) = registry();
        reg.register("a", AgentRole::Worker, caps(&["python"]), 3, Map::new());
        reg.register("b", AgentRole::Supervisor, caps(&[]), 1, Map::new());
        assert_eq!(reg.snapshot(&path).unwrap(), 2);

        let (fresh, _clock) = registry();
        fresh.register("stray", AgentRole::Worker, caps(&[]), 1, Map::new());
        assert_eq!(fresh.restore(&path).unwrap(), 2);

        assert!(fresh.get("stray").is_none());
        assert_eq!(fresh.get("a"), reg.get("a"));
        let c = fresh.register("c", AgentRole::Worker, caps(&[]), 1, Map::new());
        assert_eq!(c.registered_seq, 3);
    }

    #[test]
    fn test_restore_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "not json").unwrap();

        let (reg, _clock) = registry();
        assert!(matches!(reg.restore(&path), Err(Error::Snapshot(_))));
    }
}
