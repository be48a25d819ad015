//! Orchestrator event classification.
//!
//! Events are signals, not payloads: classification only decides *which*
//! service to look at again and whether it is going away. The current
//! descriptor is always re-read from the orchestrator afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::descriptor::ServiceId;

/// Event type for service-level actions.
pub const SERVICE_EVENT: &str = "service";

/// Event type for container (task) actions.
pub const CONTAINER_EVENT: &str = "container";

/// One event from the orchestrator stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorEvent {
    pub event_type: String,
    pub action: String,

    /// Affected service. Empty when the event is not tied to a service.
    pub service_id: ServiceId,

    pub timestamp: DateTime<Utc>,
}

impl OrchestratorEvent {
    pub fn new(
        event_type: impl Into<String>,
        action: impl Into<String>,
        service_id: impl Into<ServiceId>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            action: action.into(),
            service_id: service_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// What the engine should do about an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventClass {
    /// The service was created, updated, scaled or had a task start.
    /// Re-derive its registration and diff.
    Changed(ServiceId),

    /// The service is gone.
    Removed(ServiceId),

    /// Not relevant to registration.
    Ignored,
}

impl EventClass {
    /// The service this event concerns, if any.
    pub fn service_id(&self) -> Option<&ServiceId> {
        match self {
            Self::Changed(id) | Self::Removed(id) => Some(id),
            Self::Ignored => None,
        }
    }
}

/// Classify an event using only its type and action.
pub fn classify(event: &OrchestratorEvent) -> EventClass {
    if event.service_id.is_empty() {
        return EventClass::Ignored;
    }

    let id = event.service_id.clone();
    match (event.event_type.as_str(), event.action.as_str()) {
        (SERVICE_EVENT, "create" | "update") => EventClass::Changed(id),
        (SERVICE_EVENT, "remove") => EventClass::Removed(id),
        // Task deaths leave the service in place; its own removal event
        // is what takes it out of the registry.
        (CONTAINER_EVENT, "start") => EventClass::Changed(id),
        _ => EventClass::Ignored,
    }
}
