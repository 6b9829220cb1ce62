//! Task assignments tracked by the coordinator.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{EnvelopeId, Priority, TaskRequest, TaskResponse, TaskState};

/// ULID-based task id; sortable by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Called once when a task reaches a terminal state.
pub type CompletionCallback = Box<dyn FnOnce(&TaskAssignment) + Send>;

/// What the caller wants done.
pub struct TaskSpec {
    pub task_type: String,
    pub description: String,
    pub params: Value,
    pub required_capabilities: BTreeSet<String>,
    pub priority: Priority,
    pub deadline: Option<DateTime<Utc>>,
    pub preferred_agent: Option<String>,
    pub on_complete: Option<CompletionCallback>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            description: description.into(),
            params: Value::Object(Default::default()),
            required_capabilities: BTreeSet::new(),
            priority: Priority::default(),
            deadline: None,
            preferred_agent: None,
            on_complete: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn requiring<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn prefer(mut self, agent_id: impl Into<String>) -> Self {
        self.preferred_agent = Some(agent_id.into());
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&TaskAssignment) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub id: TaskId,
    pub agent_id: String,
    pub task_type: String,
    pub description: String,
    pub params: Value,
    pub required_capabilities: BTreeSet<String>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub status: TaskState,
    pub progress: f64,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// The `task_request` envelope that carried this task.
    pub request_id: Option<EnvelopeId>,
}

impl TaskAssignment {
    pub fn new(spec: &TaskSpec, agent_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::generate(),
            agent_id: agent_id.to_string(),
            task_type: spec.task_type.clone(),
            description: spec.description.clone(),
            params: spec.params.clone(),
            required_capabilities: spec.required_capabilities.clone(),
            priority: spec.priority,
            created_at: now,
            updated_at: now,
            deadline: spec.deadline,
            status: TaskState::Pending,
            progress: 0.0,
            result: None,
            error: None,
            request_id: None,
        }
    }

    pub fn request(&self) -> TaskRequest {
        TaskRequest {
            task_id: self.id.to_string(),
            task_type: self.task_type.clone(),
            description: self.description.clone(),
            parameters: self.params.clone(),
            deadline: self.deadline,
            required_capabilities: self.required_capabilities.clone(),
        }
    }

    pub fn mark_assigned(&mut self, request_id: EnvelopeId, now: DateTime<Utc>) {
        self.status = TaskState::Assigned;
        self.request_id = Some(request_id);
        self.updated_at = now;
    }

    /// Fold a worker response in. Workers may only move a task forward to
    /// `in_progress`, `completed` or `failed`; terminal tasks never change
    /// again.
    pub fn apply_response(&mut self, response: &TaskResponse, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if !matches!(
            response.status,
            TaskState::InProgress | TaskState::Completed | TaskState::Failed
        ) {
            tracing::warn!(
                "Ignoring {} response for task {} ({})",
                response.status,
                self.id,
                self.status
            );
            return false;
        }
        self.status = response.status;
        if let Some(progress) = response.progress {
            self.progress = progress.clamp(0.0, 1.0);
        }
        if response.status == TaskState::Completed {
            self.progress = 1.0;
        }
        if response.result.is_some() {
            self.result = response.result.clone();
        }
        if response.error.is_some() {
            self.error = response.error.clone();
        }
        self.updated_at = now;
        true
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskState::Failed;
        self.error = Some(error.into());
        self.updated_at = now;
        true
    }

    /// Never picked up by the worker within `threshold`.
    pub fn is_stuck(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        matches!(self.status, TaskState::Pending | TaskState::Assigned)
            && now - self.created_at > threshold
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.deadline.map_or(false, |d| d < now)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn assignment() -> TaskAssignment {
        let spec = TaskSpec::new("review", "Review the parser").requiring(["python"]);
        TaskAssignment::new(&spec, "w1", now())
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut task = assignment();
        task.apply_response(&TaskResponse::in_progress(task.id.to_string(), 1.7), now());
        assert_eq!(task.progress, 1.0);
        task.apply_response(&TaskResponse::in_progress(task.id.to_string(), -0.2), now());
        assert_eq!(task.progress, 0.0);
        assert_eq!(task.status, TaskState::InProgress);
    }

    #[test]
    fn test_terminal_is_final() {
        let mut task = assignment();
        assert!(task.apply_response(&TaskResponse::completed(task.id.to_string(), json!({"ok": true})), now()));
        assert!(!task.apply_response(&TaskResponse::in_progress(task.id.to_string(), 0.5), now()));
        assert!(!task.fail("late", now()));
        assert_eq!(task.status, TaskState::Completed);
        assert_eq!(task.result, Some(json!({"ok": true})));
    }

    #[test]
    fn test_response_cannot_move_task_backwards() {
        let mut task = assignment();
        task.mark_assigned(EnvelopeId::new("1-1"), now());
        assert!(task.apply_response(&TaskResponse::in_progress(task.id.to_string(), 0.4), now()));

        for status in [TaskState::Pending, TaskState::Assigned] {
            let response = TaskResponse {
                status,
                ..TaskResponse::in_progress(task.id.to_string(), 0.9)
            };
            assert!(!task.apply_response(&response, now()));
        }
        assert_eq!(task.status, TaskState::InProgress);
        assert_eq!(task.progress, 0.4);
        assert!(!task.is_stuck(now() + Duration::hours(3), Duration::hours(2)));
    }

    #[test]
    fn test_stuck_and_overdue() {
        let mut task = assignment();
        task.deadline = Some(now() + Duration::hours(1));
        assert!(!task.is_stuck(now() + Duration::hours(2), Duration::hours(2)));
        assert!(task.is_stuck(now() + Duration::hours(3), Duration::hours(2)));
        assert!(task.is_overdue(now() + Duration::hours(3)));

        task.status = TaskState::InProgress;
        assert!(!task.is_stuck(now() + Duration::hours(3), Duration::hours(2)));
    }

    #[test]
    fn test_request_payload() {
        let task = assignment();
        let request = task.request();
        assert_eq!(request.task_id, task.id.to_string());
        assert!(request.required_capabilities.contains("python"));
    }
}
