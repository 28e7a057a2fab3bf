// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MGMT protocol engine: device-side registration/update/command-intake ([`device`]) and
//! host-side registration table/lifetime/command-correlation ([`host`]).

pub mod device;
pub mod host;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// A device's management object tree: object id → instance id → resource id → value.
pub type ObjectTree = BTreeMap<u16, BTreeMap<u16, BTreeMap<u16, JsonValue>>>;

/// Merge `delta` into `base`, replacing resource values whole (not combining them).
pub fn merge_object_tree(base: &mut ObjectTree, delta: ObjectTree) {
    for (object_id, instances) in delta {
        let base_instances = base.entry(object_id).or_default();
        for (instance_id, resources) in instances {
            let base_resources = base_instances.entry(instance_id).or_default();
            for (resource_id, value) in resources {
                base_resources.insert(resource_id, value);
            }
        }
    }
}

/// Default command response timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bulk-mode batch size.
pub const DEFAULT_BULK_SIZE: usize = 10;

/// Default bulk-mode flush interval.
pub const DEFAULT_BULK_INTERVAL: Duration = Duration::from_millis(50);

/// `{endpoint, lifetime_s, protocol_version, binding_mode, objects}`, published to
/// `<prefix>/<device_id>/reg`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationMessage {
    /// The device's declared endpoint name.
    pub endpoint: String,
    /// Declared lifetime, seconds.
    pub lifetime_s: u64,
    /// Protocol version string.
    pub protocol_version: String,
    /// Binding mode (e.g. `"UQ"`).
    pub binding_mode: String,
    /// Initial object tree.
    pub objects: ObjectTree,
}

/// One write operation accumulated by bulk mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkOperation {
    /// Object id.
    pub object_id: u16,
    /// Instance id.
    pub instance_id: u16,
    /// Resource id.
    pub resource_id: u16,
    /// New value.
    pub value: JsonValue,
}

/// Bulk-mode envelope published to `<prefix>/<id>/bulk`: `{bulk_operations, device_id,
/// bulk_size, timestamp}` (§6 external-interface wire shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkEnvelope {
    /// Accumulated operations, in original order.
    pub bulk_operations: Vec<BulkOperation>,
    /// Originating device id.
    pub device_id: String,
    /// Number of operations in this envelope.
    pub bulk_size: usize,
    /// Emission timestamp, ms since epoch.
    pub timestamp: u64,
}

/// `{command_name, parameters, correlation_id, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Command/verb name.
    pub command_name: String,
    /// Command parameters.
    pub parameters: BTreeMap<String, JsonValue>,
    /// Correlation id matched against the eventual response.
    pub correlation_id: String,
    /// Issue timestamp, ms since epoch.
    pub timestamp: u64,
}

/// Status of a [`ResponseEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// The command succeeded.
    Ok,
    /// The command failed.
    Error,
}

/// Mirrors [`CommandEnvelope`] with `{correlation_id, status, result|error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Correlation id copied from the originating [`CommandEnvelope`].
    pub correlation_id: String,
    /// Outcome status.
    pub status: ResponseStatus,
    /// Present when `status == Ok`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<JsonValue>,
    /// Present when `status == Error`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    /// Build a success response.
    #[must_use]
    pub fn ok(correlation_id: impl Into<String>, result: JsonValue) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResponseStatus::Ok,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    #[must_use]
    pub fn err(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResponseStatus::Error,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Error raised by the MGMT engine.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct MgmtError(#[from] MgmtErrorKind);

/// Kinds of [`MgmtError`].
#[derive(Debug, Error)]
pub enum MgmtErrorKind {
    /// The underlying publish failed.
    #[error("failed to publish {0}: {1}")]
    Publish(&'static str, String),
    /// A command's response did not arrive within the configured timeout.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    /// A payload could not be parsed as the expected MGMT JSON shape.
    #[error("malformed mgmt payload: {0}")]
    Malformed(String),
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
