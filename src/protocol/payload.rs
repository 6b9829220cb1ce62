//! Typed views over envelope payloads.
//!
//! Payloads travel as opaque JSON. These structs are the shapes the
//! coordinator and worker helper agree on; anything else in the payload is
//! ignored on decode.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::{AgentRole, AgentStatus, TaskState};
use crate::error::{Error, Result};

/// Coordination action that announces a worker to the supervisor.
pub const ACTION_REGISTER: &str = "register";
/// Coordination action broadcast when the supervisor stops.
pub const ACTION_SUPERVISOR_SHUTDOWN: &str = "supervisor_shutdown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub status: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

impl TaskResponse {
    pub fn in_progress(task_id: impl Into<String>, progress: f64) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskState::InProgress,
            result: None,
            error: None,
            progress: Some(progress),
        }
    }

    pub fn completed(task_id: impl Into<String>, result: Value) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskState::Completed,
            result: Some(result),
            error: None,
            progress: Some(1.0),
        }
    }

    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskState::Failed,
            result: None,
            error: Some(error.into()),
            progress: None,
        }
    }
}

/// Load and status report, carried by `status_update` and `heartbeat`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default, alias = "current_tasks", alias = "current_task_count")]
    pub current_load: u32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub error_type: String,
    pub error_message: String,
}

/// Remote registration, sent as a `coordination` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub action: String,
    pub role: AgentRole,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub max_concurrency: u32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Registration {
    pub fn new(role: AgentRole, capabilities: BTreeSet<String>, max_concurrency: u32) -> Self {
        Self {
            action: ACTION_REGISTER.to_string(),
            role,
            capabilities,
            max_concurrency,
            metadata: Map::new(),
        }
    }
}

/// Serialize a payload struct into an envelope body.
pub fn to_value<T: Serialize>(payload: &T) -> Result<Value> {
    Ok(serde_json::to_value(payload)?)
}

/// Decode an envelope body, reporting shape mismatches as codec errors.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T> {
    T::deserialize(value).map_err(|e| Error::codec(format!("payload: {}", e)))
}

/// The `action` key of a coordination payload.
pub fn action(value: &Value) -> Option<&str> {
    value.get("action").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_update_accepts_load_aliases() {
        let a: StatusUpdate = from_value(&json!({"status": "busy", "current_tasks": 2})).unwrap();
        let b: StatusUpdate = from_value(&json!({"current_task_count": 4})).unwrap();
        let c: StatusUpdate = from_value(&json!({"current_load": 1})).unwrap();

        assert_eq!(a.status, AgentStatus::Busy);
        assert_eq!(a.current_load, 2);
        assert_eq!(b.current_load, 4);
        assert_eq!(b.status, AgentStatus::Active);
        assert_eq!(c.current_load, 1);
    }

    #[test]
    fn test_task_response_rejects_unknown_status() {
        let result: Result<TaskResponse> = from_value(&json!({"task_id": "t", "status": "done"}));
        assert!(matches!(result, Err(Error::Codec(_))));
    }

    #[test]
    fn test_registration_shape() {
        let reg = Registration::new(AgentRole::Worker, ["python".to_string()].into(), 3);
        let value = to_value(&reg).unwrap();

        assert_eq!(action(&value), Some(ACTION_REGISTER));
        assert_eq!(value["role"], "worker");
        assert_eq!(from_value::<Registration>(&value).unwrap(), reg);
    }

    #[test]
    fn test_task_request_defaults() {
        let req: TaskRequest = from_value(&json!({"task_id": "t1", "task_type": "review"})).unwrap();
        assert!(req.required_capabilities.is_empty());
        assert!(req.deadline.is_none());
        assert_eq!(req.parameters, Value::Null);
    }
}
