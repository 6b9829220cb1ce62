//! Supervisor side of task coordination.
//!
//! The coordinator picks agents through the registry, sends them
//! `task_request` envelopes and folds their responses back into an
//! in-memory task table. It is the only writer of that table; the table
//! mutex is held for a whole inbound batch.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use super::queue::{CleanupReport, QueueManager, QueueStats, ReceiveOptions};
use super::registry::{AgentRecord, AgentRegistry, RegistryStats};
use super::task::{CompletionCallback, TaskAssignment, TaskId, TaskSpec};
use crate::clock::SharedClock;
use crate::config::CoordinatorSettings;
use crate::error::{Error, Result};
use crate::protocol::payload::{self, ACTION_REGISTER, ACTION_SUPERVISOR_SHUTDOWN};
use crate::protocol::{
    AgentRole, AgentStatus, Envelope, EnvelopeBuilder, EnvelopeStatus, ErrorReport, MessageType,
    Registration, StatusUpdate, TaskResponse, TaskState,
};

/// How many candidates to ask the registry for.
const CANDIDATE_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorMetrics {
    pub tasks_assigned: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    /// Rolling mean over completed tasks, in seconds.
    pub average_completion_secs: f64,
    pub messages_processed: u64,
    pub handler_failures: u64,
}

/// What one maintenance pass found. Nothing in it has been acted on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub stale_agents: usize,
    pub cleanup: Option<CleanupReport>,
    pub stuck_tasks: Vec<TaskId>,
    pub overdue_tasks: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub supervisor_id: String,
    pub active_tasks: usize,
    pub metrics: CoordinatorMetrics,
    pub registry: RegistryStats,
    pub queue: Option<QueueStats>,
}

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<TaskId, TaskAssignment>,
    callbacks: HashMap<TaskId, CompletionCallback>,
    metrics: CoordinatorMetrics,
}

impl TaskTable {
    /// Drop a terminal task, record it and run its callback.
    fn finalize(&mut self, id: &TaskId) {
        let Some(task) = self.tasks.remove(id) else {
            return;
        };
        let m = &mut self.metrics;
        match task.status {
            TaskState::Completed => {
                m.tasks_completed += 1;
                let secs = (task.updated_at - task.created_at).num_milliseconds() as f64 / 1000.0;
                m.average_completion_secs += (secs - m.average_completion_secs) / m.tasks_completed as f64;
                tracing::info!("Task {} completed by {} in {:.1}s", id, task.agent_id, secs);
            }
            _ => {
                m.tasks_failed += 1;
                tracing::warn!(
                    "Task {} failed on {}: {}",
                    id,
                    task.agent_id,
                    task.error.as_deref().unwrap_or("no error given")
                );
            }
        }
        if let Some(callback) = self.callbacks.remove(id) {
            callback(&task);
        }
    }
}

pub struct SupervisorCoordinator {
    id: String,
    queue: Arc<QueueManager>,
    registry: Arc<AgentRegistry>,
    settings: CoordinatorSettings,
    clock: SharedClock,
    table: Mutex<TaskTable>,
}

impl SupervisorCoordinator {
    /// Create a coordinator and register it as a supervisor.
    pub fn new(
        id: impl Into<String>,
        queue: Arc<QueueManager>,
        registry: Arc<AgentRegistry>,
        settings: CoordinatorSettings,
        clock: SharedClock,
    ) -> Self {
        let id = id.into();
        registry.register(
            &id,
            AgentRole::Supervisor,
            BTreeSet::from(["coordination".to_string()]),
            0,
            Map::new(),
        );
        tracing::info!("Supervisor {} ready on {} transport", id, queue.transport_kind());
        Self {
            id,
            queue,
            registry,
            settings,
            clock,
            table: Mutex::new(TaskTable::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    fn select_agent(&self, spec: &TaskSpec) -> Option<AgentRecord> {
        if let Some(preferred) = &spec.preferred_agent {
            if self.registry.is_available(preferred, &spec.required_capabilities) {
                return self.registry.get(preferred);
            }
            tracing::debug!("Preferred agent {} unavailable for {}", preferred, spec.task_type);
        }
        self.registry
            .find_available(&spec.required_capabilities, Some(AgentRole::Worker), CANDIDATE_LIMIT)
            .into_iter()
            .next()
    }

    /// Hand a task to the least loaded capable worker. Returns `None` when
    /// nobody can take it or the request cannot be sent; nothing is queued
    /// for later in either case.
    pub async fn assign_task(&self, mut spec: TaskSpec) -> Option<TaskId> {
        let Some(agent) = self.select_agent(&spec) else {
            tracing::warn!(
                "{}",
                Error::NoAvailableAgent(format!(
                    "{} needs {:?}",
                    spec.task_type, spec.required_capabilities
                ))
            );
            return None;
        };

        let now = self.clock.now();
        let mut task = TaskAssignment::new(&spec, &agent.id, now);
        let envelope = match self.task_envelope(&task, &spec) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Cannot build request for {}: {}", spec.task_type, e);
                return None;
            }
        };

        // Held across the send so a fast response always finds its task.
        let mut table = self.table.lock().await;
        match self.queue.try_send(&envelope).await {
            Ok(request_id) => {
                task.mark_assigned(request_id, now);
                let id = task.id.clone();
                tracing::info!("Assigned task {} ({}) to {}", id, task.task_type, agent.id);
                if let Some(callback) = spec.on_complete.take() {
                    table.callbacks.insert(id.clone(), callback);
                }
                table.tasks.insert(id.clone(), task);
                table.metrics.tasks_assigned += 1;
                Some(id)
            }
            Err(e) => {
                tracing::warn!("Failed to send task {} to {}: {}", task.id, agent.id, e);
                None
            }
        }
    }

    fn task_envelope(&self, task: &TaskAssignment, spec: &TaskSpec) -> Result<Envelope> {
        let mut builder = EnvelopeBuilder::from(&self.id)
            .to(&task.agent_id)
            .message_type(MessageType::TaskRequest)
            .payload(payload::to_value(&task.request())?)
            .priority(spec.priority)
            .created_at(task.created_at)
            .max_retries(self.queue.settings().default_max_retries);
        if let Some(deadline) = spec.deadline {
            builder = builder.expires_at(deadline);
        }
        builder.build()
    }

    /// Handle up to `max` inbound envelopes without waiting.
    pub async fn process_inbound(&self, max: usize) -> usize {
        let mut table = self.table.lock().await;
        let batch = match self.queue.receive(&self.id, &ReceiveOptions::new(max)).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!("Inbound receive failed: {}", e);
                return 0;
            }
        };

        let mut acked = 0;
        for envelope in batch {
            match self.dispatch(&mut table, &envelope) {
                Ok(()) => {
                    if self
                        .queue
                        .ack(&envelope.id, &self.id, EnvelopeStatus::Processed, None)
                        .await
                    {
                        acked += 1;
                        table.metrics.messages_processed += 1;
                    }
                }
                Err(e) => {
                    table.metrics.handler_failures += 1;
                    let failure = Error::Handler(format!(
                        "{} {} from {}: {}",
                        envelope.message_type, envelope.id, envelope.from, e
                    ));
                    tracing::warn!("{}", failure);
                    self.queue.nack(&envelope.id, &self.id, Some(&failure.to_string())).await;
                }
            }
        }
        acked
    }

    /// Wait up to `block` for inbound work, then handle a batch.
    pub async fn poll_inbound(&self, max: usize, block: Duration) -> usize {
        if !block.is_zero() {
            let opts = ReceiveOptions::new(1).with_block(block);
            match self.queue.receive(&self.id, &opts).await {
                Ok(ready) if ready.is_empty() => return 0,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Inbound wait failed: {}", e);
                    return 0;
                }
            }
        }
        self.process_inbound(max).await
    }

    fn dispatch(&self, table: &mut TaskTable, envelope: &Envelope) -> Result<()> {
        match envelope.message_type {
            MessageType::TaskResponse => self.on_task_response(table, envelope),
            MessageType::StatusUpdate | MessageType::Heartbeat => self.on_status(envelope),
            MessageType::ErrorReport => self.on_error_report(table, envelope),
            MessageType::Coordination => self.on_coordination(envelope),
            MessageType::TaskRequest | MessageType::Broadcast => {
                tracing::debug!("Ignoring {} from {}", envelope.message_type, envelope.from);
                Ok(())
            }
        }
    }

    fn on_task_response(&self, table: &mut TaskTable, envelope: &Envelope) -> Result<()> {
        let response: TaskResponse = payload::from_value(&envelope.payload)?;
        let id = TaskId::from(response.task_id.as_str());
        let Some(task) = table.tasks.get_mut(&id) else {
            tracing::debug!("Response for unknown or finished task {}", id);
            return Ok(());
        };
        if task.agent_id != envelope.from {
            tracing::warn!("Task {} answered by {}, assigned to {}", id, envelope.from, task.agent_id);
        }

        task.apply_response(&response, self.clock.now());
        tracing::debug!("Task {} is {} ({:.0}%)", id, task.status, task.progress * 100.0);
        if task.status.is_terminal() {
            table.finalize(&id);
        }
        Ok(())
    }

    fn on_status(&self, envelope: &Envelope) -> Result<()> {
        let update: StatusUpdate = payload::from_value(&envelope.payload)?;
        if self
            .registry
            .heartbeat(&envelope.from, update.status, update.current_load, update.metadata)
        {
            Ok(())
        } else {
            Err(Error::UnknownAgent(envelope.from.clone()))
        }
    }

    fn on_error_report(&self, table: &mut TaskTable, envelope: &Envelope) -> Result<()> {
        let report: ErrorReport = match payload::from_value(&envelope.payload) {
            Ok(report) => report,
            Err(_) => ErrorReport {
                task_id: envelope.task_id().map(str::to_string),
                error_type: "unknown".to_string(),
                error_message: envelope.payload.to_string(),
            },
        };
        tracing::error!(
            "Error report from {}: {} - {}",
            envelope.from,
            report.error_type,
            report.error_message
        );

        let Some(task_id) = report.task_id.as_deref() else {
            return Ok(());
        };
        let id = TaskId::from(task_id);
        if let Some(task) = table.tasks.get_mut(&id) {
            let error = format!("{}: {}", report.error_type, report.error_message);
            if task.fail(error, self.clock.now()) {
                table.finalize(&id);
            }
        }
        Ok(())
    }

    fn on_coordination(&self, envelope: &Envelope) -> Result<()> {
        match payload::action(&envelope.payload) {
            Some(ACTION_REGISTER) => {
                let reg: Registration = payload::from_value(&envelope.payload)?;
                self.registry.register(
                    &envelope.from,
                    reg.role,
                    reg.capabilities,
                    reg.max_concurrency,
                    reg.metadata,
                );
            }
            other => tracing::debug!("Coordination {:?} from {}", other, envelope.from),
        }
        Ok(())
    }

    /// Mark stale agents, compact the queue and report stuck or overdue
    /// tasks. Nothing is reassigned.
    pub async fn maintenance_sweep(&self) -> MaintenanceReport {
        self.registry.heartbeat(&self.id, AgentStatus::Active, 0, Map::new());
        let stale_agents = self.registry.mark_stale(self.registry.settings().staleness_window());

        let cleanup = match self.queue.cleanup().await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!("Queue cleanup failed: {}", e);
                None
            }
        };

        let now = self.clock.now();
        let threshold = self.settings.stuck_task_threshold();
        let table = self.table.lock().await;
        let mut stuck_tasks = Vec::new();
        let mut overdue_tasks = Vec::new();
        for task in table.tasks.values() {
            if task.is_stuck(now, threshold) {
                tracing::warn!(
                    "Task {} on {} still {} after {}m",
                    task.id,
                    task.agent_id,
                    task.status,
                    task.age(now).num_minutes()
                );
                stuck_tasks.push(task.id.clone());
            }
            if task.is_overdue(now) {
                tracing::warn!("Task {} on {} is past its deadline", task.id, task.agent_id);
                overdue_tasks.push(task.id.clone());
            }
        }
        stuck_tasks.sort();
        overdue_tasks.sort();

        MaintenanceReport {
            stale_agents,
            cleanup,
            stuck_tasks,
            overdue_tasks,
        }
    }

    /// Send one envelope to every agent.
    pub async fn broadcast(&self, content: Value, message_type: MessageType) -> bool {
        let envelope = match EnvelopeBuilder::from(&self.id)
            .message_type(message_type)
            .payload(content)
            .created_at(self.clock.now())
            .max_retries(self.queue.settings().default_max_retries)
            .build()
        {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Cannot build broadcast: {}", e);
                return false;
            }
        };
        self.queue.send(&envelope).await
    }

    pub async fn task_status(&self, id: &TaskId) -> Option<TaskAssignment> {
        self.table.lock().await.tasks.get(id).cloned()
    }

    /// Tracked tasks, oldest first.
    pub async fn active_tasks(&self) -> Vec<TaskAssignment> {
        let mut tasks: Vec<_> = self.table.lock().await.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    pub async fn metrics(&self) -> CoordinatorMetrics {
        self.table.lock().await.metrics.clone()
    }

    pub async fn stats(&self) -> CoordinatorStats {
        let (active_tasks, metrics) = {
            let table = self.table.lock().await;
            (table.tasks.len(), table.metrics.clone())
        };
        let queue = match self.queue.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!("Queue stats unavailable: {}", e);
                None
            }
        };
        CoordinatorStats {
            supervisor_id: self.id.clone(),
            active_tasks,
            metrics,
            registry: self.registry.stats(),
            queue,
        }
    }

    /// Stop tracking a task. A worker that already has it keeps going; its
    /// later responses are ignored.
    pub async fn cancel_task(&self, id: &TaskId) -> bool {
        let mut table = self.table.lock().await;
        table.callbacks.remove(id);
        match table.tasks.remove(id) {
            Some(task) => {
                table.metrics.tasks_cancelled += 1;
                tracing::info!("Cancelled task {} on {}", id, task.agent_id);
                true
            }
            None => false,
        }
    }

    /// Tell every agent the supervisor is going away.
    pub async fn shutdown(&self) {
        let stats = self.stats().await;
        let notice = json!({
            "action": ACTION_SUPERVISOR_SHUTDOWN,
            "supervisor_id": self.id,
            "active_tasks": stats.active_tasks,
        });
        if !self.broadcast(notice, MessageType::Coordination).await {
            tracing::warn!("Shutdown notice could not be broadcast");
        }
        tracing::info!(
            "Supervisor {} shut down: {} assigned, {} completed, {} failed, {} still active",
            self.id,
            stats.metrics.tasks_assigned,
            stats.metrics.tasks_completed,
            stats.metrics.tasks_failed,
            stats.active_tasks
        );
    }
}
