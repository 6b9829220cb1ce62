//! Tagged enums shared by envelopes, payloads and the registry.
//!
//! Every enum has a single wire spelling (`as_str`) and a strict parser:
//! an unrecognized tag is a codec error, never passed through.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

macro_rules! wire_enum {
    ($name:ident, $what:literal, { $($variant:ident => $tag:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $tag),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($tag => Ok($name::$variant),)+
                    other => Err(Error::codec(format!("unknown {} '{}'", $what, other))),
                }
            }
        }
    };
}

/// Message type classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Work handed to an agent
    TaskRequest,
    /// Progress or result for a task
    TaskResponse,
    /// Agent status / load report
    StatusUpdate,
    /// Failure report, optionally tied to a task
    ErrorReport,
    /// Liveness signal
    Heartbeat,
    /// Fan-out notice with no specific recipient
    Broadcast,
    /// Control messages between agents and the supervisor
    Coordination,
}

wire_enum!(MessageType, "message type", {
    TaskRequest => "task_request",
    TaskResponse => "task_response",
    StatusUpdate => "status_update",
    ErrorReport => "error_report",
    Heartbeat => "heartbeat",
    Broadcast => "broadcast",
    Coordination => "coordination",
});

/// Message priority, 1 is the most urgent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Critical = 1,
    High = 2,
    Medium = 3,
    Low = 4,
    Background = 5,
}

impl Priority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Critical),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Medium),
            4 => Ok(Priority::Low),
            5 => Ok(Priority::Background),
            other => Err(Error::codec(format!("unknown priority '{}'", other))),
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.value()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u8 = s
            .trim()
            .parse()
            .map_err(|_| Error::codec(format!("unknown priority '{}'", s)))?;
        Priority::try_from(value)
    }
}

/// Delivery status of an envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    Expired,
}

wire_enum!(EnvelopeStatus, "envelope status", {
    Pending => "pending",
    Processing => "processing",
    Processed => "processed",
    Failed => "failed",
    Expired => "expired",
});

impl Default for EnvelopeStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Supervisor,
    Worker,
}

wire_enum!(AgentRole, "agent role", {
    Supervisor => "supervisor",
    Worker => "worker",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Idle,
    Busy,
    Offline,
    Error,
}

wire_enum!(AgentStatus, "agent status", {
    Active => "active",
    Idle => "idle",
    Busy => "busy",
    Offline => "offline",
    Error => "error",
});

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl AgentStatus {
    /// Statuses in which an agent may take new work.
    pub fn accepts_work(self) -> bool {
        matches!(self, AgentStatus::Active | AgentStatus::Idle)
    }
}

/// Lifecycle of a task assignment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

wire_enum!(TaskState, "task state", {
    Pending => "pending",
    Assigned => "assigned",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}
