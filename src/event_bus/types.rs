use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::kinds::EventKind;
use crate::error::{EventBusError, Result};

// ============================================================================
// Event
// ============================================================================

/// Core event structure shared by both transports.
///
/// Serialized in camelCase, producing the wire/history shape:
/// `{"type", "userId", "organizationId", "timestamp", "correlationId", "metadata"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event kind (semantic type), also the broker channel name
    /// Examples: "location.created", "booking.created", "system.error"
    #[serde(rename = "type")]
    pub kind: String,

    /// Acting user (opaque)
    #[serde(default)]
    pub user_id: String,

    /// Tenant (opaque)
    #[serde(default)]
    pub organization_id: String,

    /// Creation time (RFC 3339 on the wire)
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Trace/de-duplication id, generated at publish time when empty
    #[serde(default)]
    pub correlation_id: String,

    #[serde(default)]
    pub metadata: EventMetadata,
}

impl Event {
    /// Create a new event (correlation id is assigned at publish time)
    pub fn new(
        kind: impl Into<String>,
        user_id: impl Into<String>,
        organization_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            timestamp: Utc::now(),
            correlation_id: String::new(),
            metadata: EventMetadata::default(),
        }
    }

    /// Create a system event with no actor context
    pub fn system(kind: impl Into<String>, payload: EventPayload) -> Self {
        Self::new(kind, "system", "system").with_payload(payload)
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.metadata.payload = payload;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = Some(source.into());
        self
    }

    /// Assign a correlation id if the caller left it empty.
    pub fn ensure_identity(&mut self) {
        if self.correlation_id.trim().is_empty() {
            self.correlation_id = Uuid::new_v4().to_string();
        }
    }

    /// Check the kind and that the payload variant belongs to it.
    pub fn validate(&self) -> Result<()> {
        if self.kind.trim().is_empty() {
            return Err(EventBusError::invalid_event("event type cannot be empty"));
        }
        if self.kind.chars().any(char::is_whitespace) {
            return Err(EventBusError::invalid_event(format!(
                "event type '{}' contains whitespace",
                self.kind
            )));
        }
        self.metadata.payload.validate_for(&self.kind)
    }

    /// Structural recursion guard for synthesized error events.
    pub fn is_error_event(&self) -> bool {
        matches!(self.metadata.payload, EventPayload::SystemError(_))
            || EventKind::is_error_kind(&self.kind)
    }

    /// Build the `system.error` event reported when a handler fails on `original`.
    pub fn system_error(
        original: &Event,
        subscription_id: &SubscriptionId,
        message: impl Into<String>,
    ) -> Self {
        let data = SystemErrorData {
            original_type: original.kind.clone(),
            original_correlation_id: original.correlation_id.clone(),
            subscription_id: subscription_id.to_string(),
            transport: subscription_id.transport,
            message: message.into(),
        };

        Self {
            kind: EventKind::SYSTEM_ERROR.to_string(),
            user_id: original.user_id.clone(),
            organization_id: original.organization_id.clone(),
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4().to_string(),
            metadata: EventMetadata {
                source: Some(format!("{}-bus", subscription_id.transport)),
                service: original.metadata.service.clone(),
                instance_id: original.metadata.instance_id.clone(),
                published_at: None,
                payload: EventPayload::SystemError(data),
            },
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Provenance plus a typed payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Publishing component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Publishing service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Process instance that pushed the event through the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub payload: EventPayload,
}

/// All payload shapes an event can carry.
///
/// Serialized with `#[serde(tag = "kind", content = "data")]`,
/// producing JSON like: `{"kind": "entity", "data": {...}}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum EventPayload {
    #[default]
    #[serde(rename = "empty")]
    Empty,

    #[serde(rename = "entity")]
    Entity(EntityData),

    #[serde(rename = "custom")]
    Custom(Value),

    #[serde(rename = "system.error")]
    SystemError(SystemErrorData),

    #[serde(rename = "system.eventbus.initialized")]
    BusInitialized(BusLifecycleData),

    #[serde(rename = "system.eventbus.shutdown")]
    BusShutdown(BusLifecycleData),
}

impl EventPayload {
    /// The event kind this variant is bound to, if any.
    pub fn reserved_kind(&self) -> Option<&'static str> {
        match self {
            EventPayload::SystemError(_) => Some(EventKind::SYSTEM_ERROR),
            EventPayload::BusInitialized(_) => Some(EventKind::SYSTEM_EVENTBUS_INITIALIZED),
            EventPayload::BusShutdown(_) => Some(EventKind::SYSTEM_EVENTBUS_SHUTDOWN),
            EventPayload::Empty | EventPayload::Entity(_) | EventPayload::Custom(_) => None,
        }
    }

    pub fn validate_for(&self, kind: &str) -> Result<()> {
        if let Some(expected) = self.reserved_kind() {
            if expected != kind {
                return Err(EventBusError::invalid_event(format!(
                    "payload for '{}' cannot be attached to '{}'",
                    expected, kind
                )));
            }
            return Ok(());
        }

        if EventKind::is_reserved(kind) {
            return Err(EventBusError::invalid_event(format!(
                "'{}' is reserved and requires its typed payload",
                kind
            )));
        }

        if let EventPayload::Entity(data) = self {
            let action = EventKind::split(kind).map(|(_, action)| action);
            if !action.is_some_and(|a| EventKind::ENTITY_ACTIONS.contains(&a)) {
                return Err(EventBusError::invalid_event(format!(
                    "entity payload requires a created/updated/deleted kind, got '{}'",
                    kind
                )));
            }
            if data.entity_id.is_empty() {
                return Err(EventBusError::invalid_event("entity payload requires an entity_id"));
            }
        }

        Ok(())
    }
}

// ============================================================================
// Payload data structures
// ============================================================================

/// Data for `<entity>.created|updated|deleted` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityData {
    pub entity_id: String,
    /// Entity snapshot or changed fields
    #[serde(default)]
    pub changes: Value,
}

/// Data for system.error - synthesized when a subscriber fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemErrorData {
    pub original_type: String,
    pub original_correlation_id: String,
    pub subscription_id: String,
    pub transport: Transport,
    pub message: String,
}

/// Data for system.eventbus.initialized / system.eventbus.shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusLifecycleData {
    pub service: String,
    pub mode: BusMode,
    pub remote_enabled: bool,
    pub local_subscriptions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_subscriptions: Option<usize>,
}

// ============================================================================
// Transports and subscriptions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Local,
    Remote,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Local => "local",
            Transport::Remote => "remote",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating mode of the hybrid bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusMode {
    Hybrid,
    LocalOnly,
}

impl BusMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusMode::Hybrid => "hybrid",
            BusMode::LocalOnly => "local-only",
        }
    }
}

impl fmt::Display for BusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-tagged subscription handle, rendered as `local:<uuid>` / `remote:<uuid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SubscriptionId {
    pub transport: Transport,
    pub id: Uuid,
}

impl SubscriptionId {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            id: Uuid::new_v4(),
        }
    }

    pub fn local() -> Self {
        Self::new(Transport::Local)
    }

    pub fn remote() -> Self {
        Self::new(Transport::Remote)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport, self.id)
    }
}

impl FromStr for SubscriptionId {
    type Err = EventBusError;

    fn from_str(s: &str) -> Result<Self> {
        let (tag, id) = s
            .split_once(':')
            .ok_or_else(|| EventBusError::configuration(format!("malformed subscription id '{}'", s)))?;
        let transport = match tag {
            "local" => Transport::Local,
            "remote" => Transport::Remote,
            other => {
                return Err(EventBusError::configuration(format!(
                    "unknown transport tag '{}'",
                    other
                )));
            }
        };
        let id = Uuid::parse_str(id)
            .map_err(|e| EventBusError::configuration(format!("malformed subscription id '{}': {}", s, e)))?;
        Ok(Self { transport, id })
    }
}

impl From<SubscriptionId> for String {
    fn from(id: SubscriptionId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for SubscriptionId {
    type Error = EventBusError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}
