//! agent-relay library root.
//!
//! Envelope delivery between agents over a pluggable stream transport, an
//! agent registry, and a supervisor-side coordinator that assigns tasks to
//! workers and tracks them to completion.

pub mod cli;
pub mod clock;
pub mod config;
pub mod core;
pub mod daemon;
pub mod error;
pub mod lock;
pub mod logging;
pub mod protocol;
pub mod transport;
pub mod worker;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{load_settings, Settings};
pub use core::{AgentRegistry, QueueManager, ReceiveOptions, SupervisorCoordinator, TaskSpec};
pub use daemon::{run_coordinator_daemon, CoordinatorDaemon};
pub use error::{Error, Result};
pub use protocol::{Envelope, EnvelopeId, MessageType, Priority};
pub use transport::{Transport, TransportKind};
pub use worker::WorkerClient;
