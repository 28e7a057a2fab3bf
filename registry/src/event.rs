// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Events emitted by the registry on every mutating transition (spec §4.8).

use sparkmesh_protocol::mgmt::ResponseStatus;
use serde_json::Value as JsonValue;

/// The kind of transition an [`Event`] reports.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// First registration or first birth for a device id.
    DeviceRegistered,
    /// A registration update or a TELEMETRY data merge.
    DeviceUpdated {
        /// The merged delta, for a MGMT update (`None` for a TELEMETRY merge).
        mgmt_delta: Option<JsonValue>,
    },
    /// Explicit deregistration, death, or lifetime exhaustion.
    DeviceDeregistered {
        /// Human-readable reason (`"dereg"`, `"death"`, `"lifetime_exhaustion"`).
        reason: &'static str,
    },
    /// A correlated command response was observed.
    CommandResponse {
        /// Correlation id matched against the originating command.
        correlation_id: String,
        /// The response's status.
        status: ResponseStatus,
    },
    /// A TELEMETRY birth (or rebirth) was applied.
    TelemetryBirth,
    /// A TELEMETRY death was applied.
    TelemetryDeath,
}

/// One registry event: `{event_type, timestamp, nested data, origin device_id}` (spec §4.8).
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// The device this event originates from.
    pub device_id: String,
    /// Emission timestamp, ms since epoch.
    pub timestamp: u64,
    /// The event's kind and any nested data.
    pub kind: EventKind,
}

/// A predicate used by [`crate::handle::RegistryHandle::subscribe_events`] to filter the
/// broadcast stream client-side, so the filter never runs on the registry's write path.
pub trait EventFilter: Send + 'static {
    /// Whether `event` passes this filter.
    fn matches(&self, event: &Event) -> bool;
}

/// A filter that accepts every event.
pub struct AllEvents;

impl EventFilter for AllEvents {
    fn matches(&self, _event: &Event) -> bool {
        true
    }
}

/// A filter that accepts events for one device id only.
pub struct ForDevice(pub String);

impl EventFilter for ForDevice {
    fn matches(&self, event: &Event) -> bool {
        event.device_id == self.0
    }
}
