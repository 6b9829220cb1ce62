//! Worker-side helper for talking to a supervisor.
//!
//! A worker process registers with its supervisor, pulls `task_request`
//! envelopes, reports progress and results, and heartbeats its load. The
//! actual task execution lives outside this crate.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::SharedClock;
use crate::core::{QueueManager, ReceiveOptions};
use crate::error::Result;
use crate::protocol::payload;
use crate::protocol::{
    AgentRole, AgentStatus, EnvelopeBuilder, EnvelopeId, EnvelopeStatus, ErrorReport,
    MessageType, Priority, Registration, StatusUpdate, TaskRequest, TaskResponse,
};

/// A task request pulled from the queue, not yet accepted.
#[derive(Debug, Clone)]
pub struct IncomingTask {
    pub envelope_id: EnvelopeId,
    pub priority: Priority,
    pub request: TaskRequest,
}

pub struct WorkerClient {
    id: String,
    supervisor_id: String,
    capabilities: BTreeSet<String>,
    max_concurrency: u32,
    metadata: Map<String, Value>,
    queue: Arc<QueueManager>,
    clock: SharedClock,
    active: Mutex<HashMap<String, TaskRequest>>,
}

impl WorkerClient {
    pub fn new(
        id: impl Into<String>,
        supervisor_id: impl Into<String>,
        capabilities: BTreeSet<String>,
        max_concurrency: u32,
        queue: Arc<QueueManager>,
        clock: SharedClock,
    ) -> Self {
        Self {
            id: id.into(),
            supervisor_id: supervisor_id.into(),
            capabilities,
            max_concurrency,
            metadata: Map::new(),
            queue,
            clock,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of accepted, unfinished tasks.
    pub fn current_load(&self) -> u32 {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).len() as u32
    }

    async fn send_to_supervisor<T: Serialize>(&self, message_type: MessageType, body: &T) -> bool {
        let envelope = payload::to_value(body).and_then(|payload| {
            EnvelopeBuilder::from(&self.id)
                .to(&self.supervisor_id)
                .message_type(message_type)
                .payload(payload)
                .created_at(self.clock.now())
                .max_retries(self.queue.settings().default_max_retries)
                .build()
        });
        match envelope {
            Ok(envelope) => self.queue.send(&envelope).await,
            Err(e) => {
                tracing::warn!("Worker {} cannot build {}: {}", self.id, message_type, e);
                false
            }
        }
    }

    /// Announce this worker to the supervisor.
    pub async fn register(&self) -> bool {
        let mut registration =
            Registration::new(AgentRole::Worker, self.capabilities.clone(), self.max_concurrency);
        registration.metadata = self.metadata.clone();
        let sent = self.send_to_supervisor(MessageType::Coordination, &registration).await;
        if sent {
            tracing::info!("Worker {} registered with {}", self.id, self.supervisor_id);
        }
        sent
    }

    /// Report status and the tracked load.
    pub async fn heartbeat(&self, status: AgentStatus) -> bool {
        let update = StatusUpdate {
            status,
            current_load: self.current_load(),
            metadata: Map::new(),
        };
        self.send_to_supervisor(MessageType::Heartbeat, &update).await
    }

    /// Pull pending task requests, waiting up to `block` for one to arrive.
    /// Requests with an unreadable payload are acked as failed.
    pub async fn next_tasks(&self, limit: usize, block: Duration) -> Result<Vec<IncomingTask>> {
        let opts = ReceiveOptions::new(limit)
            .with_types(vec![MessageType::TaskRequest])
            .with_block(block);
        let mut tasks = Vec::new();
        for envelope in self.queue.receive(&self.id, &opts).await? {
            match payload::from_value::<TaskRequest>(&envelope.payload) {
                Ok(request) => tasks.push(IncomingTask {
                    envelope_id: envelope.id,
                    priority: envelope.priority,
                    request,
                }),
                Err(e) => {
                    tracing::warn!("Worker {} rejecting request {}: {}", self.id, envelope.id, e);
                    let reason = e.to_string();
                    self.queue
                        .ack(&envelope.id, &self.id, EnvelopeStatus::Failed, Some(&reason))
                        .await;
                }
            }
        }
        Ok(tasks)
    }

    /// Take ownership of a task: settle its request and tell the supervisor
    /// work has started.
    pub async fn accept(&self, task: &IncomingTask) -> bool {
        if !self
            .queue
            .ack(&task.envelope_id, &self.id, EnvelopeStatus::Processing, None)
            .await
        {
            return false;
        }
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.request.task_id.clone(), task.request.clone());
        tracing::info!("Worker {} accepted task {}", self.id, task.request.task_id);
        self.report_progress(&task.request.task_id, 0.0).await
    }

    pub async fn report_progress(&self, task_id: &str, progress: f64) -> bool {
        let response = TaskResponse::in_progress(task_id, progress.clamp(0.0, 1.0));
        self.send_to_supervisor(MessageType::TaskResponse, &response).await
    }

    fn untrack(&self, task_id: &str) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
    }

    pub async fn complete(&self, task_id: &str, result: Value) -> bool {
        self.untrack(task_id);
        tracing::info!("Worker {} completed task {}", self.id, task_id);
        self.send_to_supervisor(MessageType::TaskResponse, &TaskResponse::completed(task_id, result))
            .await
    }

    /// Give up on a task and report why.
    pub async fn fail(&self, task_id: &str, error: &str) -> bool {
        self.untrack(task_id);
        tracing::warn!("Worker {} failed task {}: {}", self.id, task_id, error);
        let report = ErrorReport {
            task_id: Some(task_id.to_string()),
            error_type: "task_failed".to_string(),
            error_message: error.to_string(),
        };
        self.send_to_supervisor(MessageType::ErrorReport, &report).await
    }

    /// Heartbeat every `interval` until the handle is stopped.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> HeartbeatHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let client = Arc::clone(self);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let status = if client.current_load() >= client.max_concurrency {
                            AgentStatus::Busy
                        } else {
                            AgentStatus::Active
                        };
                        if !client.heartbeat(status).await {
                            tracing::warn!("Heartbeat from {} was not delivered", client.id);
                        }
                    }
                }
            }
            tracing::debug!("Heartbeat loop for {} stopped", client.id);
        });
        HeartbeatHandle { shutdown_tx, join }
    }
}

/// Running heartbeat loop.
pub struct HeartbeatHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub async fn stop(self) {
        // Receiver gone means the loop already ended.
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}
