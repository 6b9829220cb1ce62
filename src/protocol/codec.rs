//! Flat wire encoding of envelopes.
//!
//! Both transports store records as string-keyed string fields, so an
//! envelope is flattened into one field per attribute. Optional attributes
//! are omitted when absent. Decoding is strict: unknown tags and malformed
//! values are [`Error::Codec`].

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};

use super::envelope::{Envelope, EnvelopeId};
use crate::error::{Error, Result};

pub type Fields = BTreeMap<String, String>;

pub const F_ID: &str = "id";
pub const F_FROM: &str = "from";
pub const F_TO: &str = "to";
pub const F_TYPE: &str = "type";
pub const F_PAYLOAD: &str = "payload";
pub const F_PRIORITY: &str = "priority";
pub const F_STATUS: &str = "status";
pub const F_RETRY_COUNT: &str = "retry_count";
pub const F_MAX_RETRIES: &str = "max_retries";
pub const F_CREATED_AT: &str = "created_at";
pub const F_EXPIRES_AT: &str = "expires_at";
pub const F_PARENT_ID: &str = "parent_id";

pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::codec(format!("bad {} '{}': {}", field, value, e)))
}

/// Flatten an envelope into wire fields.
pub fn encode(envelope: &Envelope) -> Result<Fields> {
    let mut fields = Fields::new();
    if envelope.id.is_assigned() {
        fields.insert(F_ID.into(), envelope.id.to_string());
    }
    fields.insert(F_FROM.into(), envelope.from.clone());
    if let Some(to) = &envelope.to {
        fields.insert(F_TO.into(), to.clone());
    }
    fields.insert(F_TYPE.into(), envelope.message_type.as_str().into());
    fields.insert(F_PAYLOAD.into(), serde_json::to_string(&envelope.payload)?);
    fields.insert(F_PRIORITY.into(), envelope.priority.to_string());
    fields.insert(F_STATUS.into(), envelope.status.as_str().into());
    fields.insert(F_RETRY_COUNT.into(), envelope.retry_count.to_string());
    fields.insert(F_MAX_RETRIES.into(), envelope.max_retries.to_string());
    fields.insert(F_CREATED_AT.into(), format_timestamp(&envelope.created_at));
    if let Some(expires) = &envelope.expires_at {
        fields.insert(F_EXPIRES_AT.into(), format_timestamp(expires));
    }
    if let Some(parent) = &envelope.parent_id {
        fields.insert(F_PARENT_ID.into(), parent.to_string());
    }
    Ok(fields)
}

fn required<'a>(fields: &'a Fields, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| Error::codec(format!("missing field '{}'", name)))
}

fn parse_count(fields: &Fields, name: &str) -> Result<u32> {
    let raw = required(fields, name)?;
    raw.parse()
        .map_err(|_| Error::codec(format!("bad {} '{}'", name, raw)))
}

/// Rebuild an envelope from wire fields.
pub fn decode(fields: &Fields) -> Result<Envelope> {
    let payload_raw = required(fields, F_PAYLOAD)?;
    let payload = serde_json::from_str(payload_raw)
        .map_err(|e| Error::codec(format!("bad payload: {}", e)))?;

    let envelope = Envelope {
        id: fields
            .get(F_ID)
            .map(|s| EnvelopeId::new(s.as_str()))
            .unwrap_or_default(),
        from: required(fields, F_FROM)?.to_string(),
        to: fields.get(F_TO).cloned(),
        message_type: required(fields, F_TYPE)?.parse()?,
        payload,
        priority: required(fields, F_PRIORITY)?.parse()?,
        created_at: parse_timestamp(F_CREATED_AT, required(fields, F_CREATED_AT)?)?,
        expires_at: fields
            .get(F_EXPIRES_AT)
            .map(|s| parse_timestamp(F_EXPIRES_AT, s))
            .transpose()?,
        status: required(fields, F_STATUS)?.parse()?,
        retry_count: parse_count(fields, F_RETRY_COUNT)?,
        max_retries: parse_count(fields, F_MAX_RETRIES)?,
        parent_id: fields.get(F_PARENT_ID).map(|s| EnvelopeId::new(s.as_str())),
    };
    envelope.validate()?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::EnvelopeBuilder;
    use crate::protocol::types::{EnvelopeStatus, MessageType, Priority};
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_round_trip_preserves_every_field() {
        let mut envelope = EnvelopeBuilder::from("supervisor")
            .to("coder")
            .message_type(MessageType::TaskRequest)
            .payload(json!({"task_id": "01HX", "nested": {"n": [1, 2, 3]}}))
            .priority(Priority::Background)
            .ttl(Duration::minutes(10))
            .max_retries(7)
            .parent(EnvelopeId::new("17-1"))
            .build()
            .unwrap();
        envelope.id = EnvelopeId::new("1700000000000-42");
        envelope.status = EnvelopeStatus::Processing;
        envelope.retry_count = 2;

        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_absent_optionals_are_omitted() {
        let envelope = Envelope::broadcast("supervisor", MessageType::Broadcast, json!("hello"));
        let fields = encode(&envelope).unwrap();

        assert!(!fields.contains_key(F_ID));
        assert!(!fields.contains_key(F_TO));
        assert!(!fields.contains_key(F_EXPIRES_AT));
        assert!(!fields.contains_key(F_PARENT_ID));

        let decoded = decode(&fields).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_unknown_tags_fail() {
        let envelope = Envelope::new("a", "b", MessageType::Heartbeat, json!({}));
        let good = encode(&envelope).unwrap();

        let mut bad_type = good.clone();
        bad_type.insert(F_TYPE.into(), "gossip".into());
        assert!(matches!(decode(&bad_type), Err(Error::Codec(_))));

        let mut bad_priority = good.clone();
        bad_priority.insert(F_PRIORITY.into(), "0".into());
        assert!(matches!(decode(&bad_priority), Err(Error::Codec(_))));

        let mut bad_status = good.clone();
        bad_status.insert(F_STATUS.into(), "done".into());
        assert!(matches!(decode(&bad_status), Err(Error::Codec(_))));

        let mut bad_payload = good;
        bad_payload.insert(F_PAYLOAD.into(), "{not json".into());
        assert!(matches!(decode(&bad_payload), Err(Error::Codec(_))));
    }

    #[test]
    fn test_missing_field_fails() {
        let mut fields = encode(&Envelope::new("a", "b", MessageType::Heartbeat, json!({}))).unwrap();
        fields.remove(F_CREATED_AT);
        assert!(decode(&fields).is_err());
    }
}
