//! Message envelopes: one routed unit of communication between agents.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::types::{EnvelopeStatus, MessageType, Priority};
use crate::error::{Error, Result};

/// Default number of redeliveries before an envelope is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Opaque envelope id. Assigned by the transport when the envelope is sent;
/// empty before that.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(String);

impl EnvelopeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn unassigned() -> Self {
        Self(String::new())
    }

    pub fn is_assigned(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EnvelopeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub from: String,
    /// Recipient agent id; `None` means broadcast.
    pub to: Option<String>,
    pub message_type: MessageType,
    /// Opaque body. The core only looks at `task_id`.
    pub payload: Value,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: EnvelopeStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Correlation to an earlier envelope.
    pub parent_id: Option<EnvelopeId>,
}

impl Envelope {
    /// Direct envelope with default priority.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        message_type: MessageType,
        payload: Value,
    ) -> Self {
        Self {
            id: EnvelopeId::unassigned(),
            from: from.into(),
            to: Some(to.into()),
            message_type,
            payload,
            priority: Priority::default(),
            created_at: Utc::now(),
            expires_at: None,
            status: EnvelopeStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            parent_id: None,
        }
    }

    /// Envelope addressed to every agent.
    pub fn broadcast(from: impl Into<String>, message_type: MessageType, payload: Value) -> Self {
        Self {
            to: None,
            ..Self::new(from, String::new(), message_type, payload)
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Whether `agent_id` should see this envelope (direct or broadcast).
    pub fn is_for(&self, agent_id: &str) -> bool {
        match &self.to {
            Some(to) => to == agent_id,
            None => true,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires| expires <= now)
    }

    /// Retries exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Correlation key carried in the payload, if any.
    pub fn task_id(&self) -> Option<&str> {
        self.payload.get("task_id").and_then(Value::as_str)
    }

    /// Build a reply addressed to the sender of this envelope.
    pub fn reply(&self, from: impl Into<String>, message_type: MessageType, payload: Value) -> Self {
        Self {
            priority: self.priority,
            parent_id: self.id.is_assigned().then(|| self.id.clone()),
            ..Self::new(from, self.from.clone(), message_type, payload)
        }
    }

    /// Checks the structural invariants the wire format relies on.
    pub fn validate(&self) -> Result<()> {
        if self.from.is_empty() {
            return Err(Error::codec("envelope sender is empty"));
        }
        if matches!(&self.to, Some(to) if to.is_empty()) {
            return Err(Error::codec("envelope recipient is empty"));
        }
        if let Some(expires) = self.expires_at {
            if expires < self.created_at {
                return Err(Error::codec(format!(
                    "expires_at {} precedes created_at {}",
                    expires, self.created_at
                )));
            }
        }
        if self.status == EnvelopeStatus::Pending && self.retry_count > self.max_retries {
            return Err(Error::codec(format!(
                "retry_count {} exceeds max_retries {}",
                self.retry_count, self.max_retries
            )));
        }
        Ok(())
    }
}

/// Builder for creating envelopes with fluent API.
pub struct EnvelopeBuilder {
    from: String,
    to: Option<String>,
    message_type: Option<MessageType>,
    payload: Value,
    priority: Priority,
    created_at: Option<DateTime<Utc>>,
    ttl: Option<Duration>,
    expires_at: Option<DateTime<Utc>>,
    max_retries: u32,
    parent_id: Option<EnvelopeId>,
}

impl EnvelopeBuilder {
    /// Start building an envelope from an agent.
    pub fn from(agent_id: impl Into<String>) -> Self {
        Self {
            from: agent_id.into(),
            to: None,
            message_type: None,
            payload: Value::Object(Default::default()),
            priority: Priority::default(),
            created_at: None,
            ttl: None,
            expires_at: None,
            max_retries: DEFAULT_MAX_RETRIES,
            parent_id: None,
        }
    }

    /// Address to a single agent. Leaving this unset makes a broadcast.
    pub fn to(mut self, agent_id: impl Into<String>) -> Self {
        self.to = Some(agent_id.into());
        self
    }

    pub fn message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Expire `ttl` after creation. Ignored when `expires_at` is set.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn parent(mut self, id: EnvelopeId) -> Self {
        self.parent_id = Some(id);
        self
    }

    /// Build the envelope.
    pub fn build(self) -> Result<Envelope> {
        let message_type = self
            .message_type
            .ok_or_else(|| Error::codec("message type is required"))?;
        let created_at = self.created_at.unwrap_or_else(Utc::now);
        let expires_at = self.expires_at.or_else(|| self.ttl.map(|ttl| created_at + ttl));

        let envelope = Envelope {
            id: EnvelopeId::unassigned(),
            from: self.from,
            to: self.to,
            message_type,
            payload: self.payload,
            priority: self.priority,
            created_at,
            expires_at,
            status: EnvelopeStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries,
            parent_id: self.parent_id,
        };
        envelope.validate()?;
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_creation() {
        let envelope = Envelope::new("supervisor", "coder", MessageType::TaskRequest, json!({"task_id": "t1"}));

        assert_eq!(envelope.from, "supervisor");
        assert_eq!(envelope.to, Some("coder".to_string()));
        assert!(!envelope.id.is_assigned());
        assert_eq!(envelope.task_id(), Some("t1"));
        assert_eq!(envelope.status, EnvelopeStatus::Pending);
    }

    #[test]
    fn test_envelope_builder() {
        let envelope = EnvelopeBuilder::from("supervisor")
            .to("coder")
            .message_type(MessageType::TaskRequest)
            .priority(Priority::High)
            .ttl(Duration::hours(1))
            .max_retries(5)
            .build()
            .unwrap();

        assert_eq!(envelope.to.as_deref(), Some("coder"));
        assert_eq!(envelope.expires_at, Some(envelope.created_at + Duration::hours(1)));
        assert_eq!(envelope.max_retries, 5);
        assert_eq!(envelope.priority, Priority::High);
    }

    #[test]
    fn test_builder_rejects_expiry_before_creation() {
        let now = Utc::now();
        let result = EnvelopeBuilder::from("supervisor")
            .to("coder")
            .message_type(MessageType::Heartbeat)
            .created_at(now)
            .expires_at(now - Duration::seconds(1))
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn test_builder_requires_message_type() {
        assert!(EnvelopeBuilder::from("supervisor").to("coder").build().is_err());
    }

    #[test]
    fn test_broadcast_is_for_everyone() {
        let envelope = Envelope::broadcast("supervisor", MessageType::Broadcast, json!({"note": "hi"}));

        assert!(envelope.is_broadcast());
        assert!(envelope.is_for("coder"));
        assert!(envelope.is_for("reviewer"));
    }

    #[test]
    fn test_reply_is_correlated() {
        let mut request = Envelope::new("supervisor", "coder", MessageType::TaskRequest, json!({}));
        request.id = EnvelopeId::new("1700000000000-7");
        request.priority = Priority::Critical;

        let reply = request.reply("coder", MessageType::TaskResponse, json!({"status": "completed"}));
        assert_eq!(reply.to.as_deref(), Some("supervisor"));
        assert_eq!(reply.parent_id, Some(request.id.clone()));
        assert_eq!(reply.priority, Priority::Critical);
    }

    #[test]
    fn test_expiration() {
        let now = Utc::now();
        let envelope = EnvelopeBuilder::from("supervisor")
            .to("coder")
            .message_type(MessageType::TaskRequest)
            .created_at(now)
            .ttl(Duration::seconds(30))
            .build()
            .unwrap();

        assert!(!envelope.is_expired_at(now));
        assert!(envelope.is_expired_at(now + Duration::seconds(30)));
    }
}
