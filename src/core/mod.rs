//! Core module - queue, registry and coordination.
//!
//! This module contains the heart of agent-relay:
//! - Envelope delivery with per-consumer acks
//! - Agent registry and load-based selection
//! - Supervisor-side task tracking

pub mod coordinator;
pub mod queue;
pub mod registry;
pub mod task;

pub use coordinator::{CoordinatorMetrics, CoordinatorStats, MaintenanceReport, SupervisorCoordinator};
pub use queue::{CleanupReport, QueueManager, QueueStats, ReceiveOptions};
pub use registry::{AgentRecord, AgentRegistry, RegistryStats};
pub use task::{CompletionCallback, TaskAssignment, TaskId, TaskSpec};
