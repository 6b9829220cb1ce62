//! Agent communication protocol.
//!
//! - Envelopes with correlation ids and expiry
//! - Tagged enums with a single wire spelling
//! - Flat field codec shared by every transport
//! - Typed payloads for tasks, status, errors and registration

pub mod codec;
pub mod envelope;
pub mod payload;
pub mod types;

pub use envelope::{Envelope, EnvelopeBuilder, EnvelopeId, DEFAULT_MAX_RETRIES};
pub use payload::{ErrorReport, Registration, StatusUpdate, TaskRequest, TaskResponse};
pub use types::{AgentRole, AgentStatus, EnvelopeStatus, MessageType, Priority, TaskState};
