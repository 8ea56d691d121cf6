//! Events: immutable facts about an approval instance.
//!
//! An [`Event`] records that something happened to an instance. Events are
//! never mutated in place: [`Event::with_payload`] returns a new value that
//! keeps the identity (`id`, type, instance, correlation) and owns an
//! independent copy of the payload.
//!
//! # Correlation
//!
//! Every event carries a [`CorrelationId`]. Events caused by the same
//! originating action share it, so a chain such as
//! `instance.created → instance.status_changed` can be traced end to end.
//! Use [`Event::with_correlation`] when emitting a consequence of another event.
//!
//! # Payload
//!
//! The payload is an open JSON map because the external approval platform
//! sends loosely-typed bodies. Read it through the typed accessors
//! (`payload_str`, `payload_i64`, `payload_f64`, `payload_bool`), which never
//! fail, or through a typed view such as [`StatusChange`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::EventError;

/// Loosely-typed event payload.
pub type Payload = Map<String, Value>;

/// Payload keys written on `instance.status_changed` events.
pub const PAYLOAD_PREVIOUS_STATUS: &str = "previous_status";
pub const PAYLOAD_NEW_STATUS: &str = "new_status";
pub const PAYLOAD_TRIGGER: &str = "trigger";
/// Optional payload key naming who caused the event.
pub const PAYLOAD_ACTOR: &str = "actor";

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier of a single event value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation ID shared by a chain of causally related events.
///
/// Use `CorrelationId::NONE` for uncorrelated events, or `CorrelationId::new()`
/// to generate a fresh ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Sentinel value for uncorrelated events (nil UUID).
    pub const NONE: Self = Self(Uuid::nil());

    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Check if this is the NONE sentinel value.
    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    /// Check if this is a real correlation ID (not NONE).
    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<CorrelationId> for Uuid {
    fn from(cid: CorrelationId) -> Uuid {
        cid.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// =============================================================================
// Event Type
// =============================================================================

/// The closed set of event types the workflow core understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "instance.created")]
    InstanceCreated,
    #[serde(rename = "instance.approved")]
    InstanceApproved,
    #[serde(rename = "instance.rejected")]
    InstanceRejected,
    #[serde(rename = "instance.status_changed")]
    InstanceStatusChanged,
    #[serde(rename = "attachment.ready")]
    AttachmentReady,
    #[serde(rename = "audit.completed")]
    AuditCompleted,
    #[serde(rename = "voucher.generated")]
    VoucherGenerated,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::InstanceCreated,
        EventType::InstanceApproved,
        EventType::InstanceRejected,
        EventType::InstanceStatusChanged,
        EventType::AttachmentReady,
        EventType::AuditCompleted,
        EventType::VoucherGenerated,
    ];

    /// Dotted wire name, e.g. `instance.created`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::InstanceCreated => "instance.created",
            EventType::InstanceApproved => "instance.approved",
            EventType::InstanceRejected => "instance.rejected",
            EventType::InstanceStatusChanged => "instance.status_changed",
            EventType::AttachmentReady => "attachment.ready",
            EventType::AuditCompleted => "audit.completed",
            EventType::VoucherGenerated => "voucher.generated",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}

// =============================================================================
// Event
// =============================================================================

/// Something that happened to an approval instance.
///
/// `instance_id` may be `0` when the emitter only knows the external
/// platform's identifier; the workflow engine resolves it on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    #[serde(rename = "type")]
    event_type: EventType,
    instance_id: i64,
    external_instance_id: String,
    payload: Payload,
    timestamp: DateTime<Utc>,
    correlation_id: CorrelationId,
}

impl Event {
    /// Create an event with a fresh id and a fresh correlation id.
    pub fn new(
        event_type: EventType,
        instance_id: i64,
        external_instance_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self::with_correlation(
            event_type,
            instance_id,
            external_instance_id,
            payload,
            CorrelationId::new(),
        )
    }

    /// Create an event that continues an existing correlation chain.
    pub fn with_correlation(
        event_type: EventType,
        instance_id: i64,
        external_instance_id: impl Into<String>,
        payload: Payload,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            instance_id,
            external_instance_id: external_instance_id.into(),
            payload,
            timestamp: Utc::now(),
            correlation_id,
        }
    }

    /// Return a copy of this event with one more payload field.
    ///
    /// The receiver is left untouched; the returned event keeps the same id.
    pub fn with_payload(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut next = self.clone();
        next.payload.insert(key.into(), value.into());
        next
    }

    /// Parse a loosely-typed body from the approval platform.
    ///
    /// Expects an object with a `type` field; `instance_id`,
    /// `external_instance_id`, `payload` and `correlation_id` are optional.
    /// A fresh id and timestamp are assigned.
    pub fn from_json(body: &Value) -> Result<Self, EventError> {
        let object = body
            .as_object()
            .ok_or_else(|| EventError::Malformed("event body is not an object".into()))?;

        let event_type: EventType = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::Malformed("missing event type".into()))?
            .parse()?;

        let instance_id = object.get("instance_id").map(coerce_i64).unwrap_or(0);
        let external_instance_id = object
            .get("external_instance_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let payload = match object.get("payload") {
            None | Some(Value::Null) => Payload::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(EventError::Malformed("payload is not an object".into())),
        };
        let correlation_id = object
            .get("correlation_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(CorrelationId::from)
            .unwrap_or_default();

        Ok(Self::with_correlation(
            event_type,
            instance_id,
            external_instance_id,
            payload,
            correlation_id,
        ))
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    pub fn external_instance_id(&self) -> &str {
        &self.external_instance_id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// String payload value, or `""` when absent or not a string.
    pub fn payload_str(&self, key: &str) -> String {
        match self.payload.get(key) {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        }
    }

    /// Integer payload value; floats are truncated, numeric strings parsed, `0` otherwise.
    pub fn payload_i64(&self, key: &str) -> i64 {
        self.payload.get(key).map(coerce_i64).unwrap_or(0)
    }

    /// Float payload value; integers widened, numeric strings parsed, `0.0` otherwise.
    pub fn payload_f64(&self, key: &str) -> f64 {
        match self.payload.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// Boolean payload value; `"true"`/`"false"` strings parsed, `false` otherwise.
    pub fn payload_bool(&self, key: &str) -> bool {
        match self.payload.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.trim().parse().unwrap_or(false),
            _ => false,
        }
    }
}

fn coerce_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

// =============================================================================
// Status Change view
// =============================================================================

/// Typed view over an `instance.status_changed` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub previous_status: String,
    pub new_status: String,
    pub trigger: String,
}

impl StatusChange {
    /// Read the status change carried by `event`.
    ///
    /// Returns `None` for other event types or when the payload lacks
    /// the status fields.
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.event_type() != EventType::InstanceStatusChanged {
            return None;
        }
        let change = Self {
            previous_status: event.payload_str(PAYLOAD_PREVIOUS_STATUS),
            new_status: event.payload_str(PAYLOAD_NEW_STATUS),
            trigger: event.payload_str(PAYLOAD_TRIGGER),
        };
        if change.previous_status.is_empty() || change.new_status.is_empty() {
            return None;
        }
        Some(change)
    }

    pub fn into_payload(self) -> Payload {
        let mut payload = Payload::new();
        payload.insert(PAYLOAD_PREVIOUS_STATUS.into(), self.previous_status.into());
        payload.insert(PAYLOAD_NEW_STATUS.into(), self.new_status.into());
        payload.insert(PAYLOAD_TRIGGER.into(), self.trigger.into());
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_new_assigns_independent_ids() {
        let a = Event::new(EventType::InstanceCreated, 1, "ext-1", Payload::new());
        let b = Event::new(EventType::InstanceCreated, 1, "ext-1", Payload::new());

        assert_ne!(a.id(), b.id());
        assert_ne!(a.correlation_id(), b.correlation_id());
        assert_ne!(*a.id().as_uuid(), a.correlation_id().into_inner());
        assert!(a.correlation_id().is_some());
    }

    #[test]
    fn test_with_correlation_keeps_supplied_id() {
        let cid = CorrelationId::new();
        let event = Event::with_correlation(
            EventType::AuditCompleted,
            7,
            "ext-7",
            Payload::new(),
            cid,
        );
        assert_eq!(event.correlation_id(), cid);
        assert_eq!(event.instance_id(), 7);
        assert_eq!(event.external_instance_id(), "ext-7");
    }

    #[test]
    fn test_with_payload_does_not_touch_original() {
        let original = Event::new(
            EventType::InstanceApproved,
            3,
            "ext-3",
            payload(json!({ "amount": 10 })),
        );
        let extended = original.with_payload("comment", "looks fine");

        assert_eq!(original.payload().len(), 1);
        assert!(original.payload().get("comment").is_none());
        assert_eq!(extended.payload_str("comment"), "looks fine");
        assert_eq!(extended.payload_i64("amount"), 10);

        assert_eq!(extended.id(), original.id());
        assert_eq!(extended.event_type(), original.event_type());
        assert_eq!(extended.instance_id(), original.instance_id());
        assert_eq!(extended.correlation_id(), original.correlation_id());
    }

    #[test]
    fn test_typed_accessors_coerce() {
        let event = Event::new(
            EventType::AuditCompleted,
            1,
            "",
            payload(json!({
                "score": 87.9,
                "count": 4,
                "count_str": " 12 ",
                "ratio_str": "0.25",
                "passed": true,
                "passed_str": "true",
                "name": "audit",
            })),
        );

        assert_eq!(event.payload_i64("score"), 87);
        assert_eq!(event.payload_i64("count"), 4);
        assert_eq!(event.payload_i64("count_str"), 12);
        assert_eq!(event.payload_f64("count"), 4.0);
        assert_eq!(event.payload_f64("ratio_str"), 0.25);
        assert!(event.payload_bool("passed"));
        assert!(event.payload_bool("passed_str"));
        assert_eq!(event.payload_str("name"), "audit");
    }

    #[test]
    fn test_typed_accessors_return_zero_values() {
        let event = Event::new(
            EventType::AuditCompleted,
            1,
            "",
            payload(json!({ "name": "audit", "flag": 1, "list": [1, 2] })),
        );

        assert_eq!(event.payload_str("missing"), "");
        assert_eq!(event.payload_str("flag"), "");
        assert_eq!(event.payload_i64("name"), 0);
        assert_eq!(event.payload_i64("list"), 0);
        assert_eq!(event.payload_f64("missing"), 0.0);
        assert!(!event.payload_bool("flag"));
        assert!(!event.payload_bool("name"));
    }

    #[test]
    fn test_event_type_wire_names() {
        for event_type in EventType::ALL {
            let parsed: EventType = event_type.as_str().parse().unwrap();
            assert_eq!(parsed, event_type);
        }
        assert_eq!(
            serde_json::to_value(EventType::InstanceStatusChanged).unwrap(),
            json!("instance.status_changed")
        );
        assert!(matches!(
            "instance.deleted".parse::<EventType>(),
            Err(EventError::UnknownEventType(t)) if t == "instance.deleted"
        ));
    }

    #[test]
    fn test_from_json_parses_platform_body() {
        let cid = Uuid::new_v4();
        let event = Event::from_json(&json!({
            "type": "instance.approved",
            "external_instance_id": "LARK-42",
            "payload": { "actor": "bob" },
            "correlation_id": cid.to_string(),
        }))
        .unwrap();

        assert_eq!(event.event_type(), EventType::InstanceApproved);
        assert_eq!(event.instance_id(), 0);
        assert_eq!(event.external_instance_id(), "LARK-42");
        assert_eq!(event.payload_str(PAYLOAD_ACTOR), "bob");
        assert_eq!(event.correlation_id(), CorrelationId::from(cid));
    }

    #[test]
    fn test_from_json_rejects_unknown_type() {
        let err = Event::from_json(&json!({ "type": "instance.archived" })).unwrap_err();
        assert!(matches!(err, EventError::UnknownEventType(_)));
        assert!(err.to_string().contains("instance.archived"));

        let err = Event::from_json(&json!(["not", "an", "object"])).unwrap_err();
        assert!(matches!(err, EventError::Malformed(_)));
    }

    #[test]
    fn test_status_change_view() {
        let change = StatusChange {
            previous_status: "CREATED".into(),
            new_status: "AI_AUDITING".into(),
            trigger: "START_AUDIT".into(),
        };
        let event = Event::new(
            EventType::InstanceStatusChanged,
            9,
            "ext-9",
            change.clone().into_payload(),
        );
        assert_eq!(StatusChange::from_event(&event), Some(change));

        let other = Event::new(EventType::AuditCompleted, 9, "ext-9", Payload::new());
        assert_eq!(StatusChange::from_event(&other), None);
    }

    #[test]
    fn test_serde_round_trip_keeps_identity() {
        let event = Event::new(
            EventType::VoucherGenerated,
            5,
            "ext-5",
            payload(json!({ "voucher_no": "V-001" })),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("voucher.generated"));

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_correlation_none_display() {
        assert_eq!(CorrelationId::NONE.to_string(), "NONE");
        assert!(CorrelationId::NONE.is_none());
    }
}
