// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! JSON-facing shapes returned across the INTEGRATION surface (spec.md §4.11/§6).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sparkmesh_protocol::metric::Value as MetricValue;
use sparkmesh_protocol::mgmt::ObjectTree;
use sparkmesh_registry::record::DeviceRecord;

/// One entry of [`crate::broker::IntegrationBroker::discover_devices`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    /// Device id.
    pub device_id: String,
    /// Declared device type, if known.
    pub device_type: Option<String>,
    /// Combined liveness status, as its `Debug` spelling (`"Online"`, `"Stale"`, ...).
    pub status: String,
}

/// Outcome of [`crate::broker::IntegrationBroker::set_device_parameters`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetParametersOutcome {
    /// Parameter names that were forwarded to the device.
    pub applied: Vec<String>,
    /// Parameter names rejected as non-writable, with their rejection reason.
    pub rejected: Vec<RejectedParam>,
}

/// One parameter [`crate::broker::IntegrationBroker::set_device_parameters`] declined to apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedParam {
    /// The rejected parameter's name.
    pub name: String,
    /// Human-readable rejection reason.
    pub reason: String,
}

/// `{functions, commands, templates}`, the response shape of
/// [`crate::broker::IntegrationBroker::parse_description_writable_parameters`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WritableParameters {
    /// Function names and their formal parameters.
    pub functions: JsonValue,
    /// Command names and their formal parameters.
    pub commands: JsonValue,
    /// Configuration template names and their settings.
    pub templates: JsonValue,
}

/// Render a device record's current telemetry metrics and MGMT object tree as one JSON
/// snapshot, the shape `get_device_parameters`/`get_device_data` returns.
#[must_use]
pub fn snapshot_to_json(record: &DeviceRecord) -> JsonValue {
    let mut metrics = Map::new();
    for (name, snapshot) in &record.telemetry_metrics {
        metrics.insert(name.clone(), metric_value_to_json(&snapshot.value));
    }
    let mut root = Map::new();
    root.insert("device_id".to_string(), JsonValue::String(record.device_id.clone()));
    root.insert("status".to_string(), JsonValue::String(format!("{:?}", record.status)));
    root.insert("telemetry_metrics".to_string(), JsonValue::Object(metrics));
    root.insert("mgmt_objects".to_string(), object_tree_to_json(&record.mgmt_objects));
    JsonValue::Object(root)
}

/// Render an `ObjectTree`'s numeric object/instance/resource ids as string object keys, since
/// JSON objects have no native integer-keyed form.
#[must_use]
pub fn object_tree_to_json(tree: &ObjectTree) -> JsonValue {
    let mut objects = Map::new();
    for (object_id, instances) in tree {
        let mut instances_json = Map::new();
        for (instance_id, resources) in instances {
            let mut resources_json = Map::new();
            for (resource_id, value) in resources {
                resources_json.insert(resource_id.to_string(), value.clone());
            }
            instances_json.insert(instance_id.to_string(), JsonValue::Object(resources_json));
        }
        objects.insert(object_id.to_string(), JsonValue::Object(instances_json));
    }
    JsonValue::Object(objects)
}

/// Convert one decoded metric [`MetricValue`] to JSON, losslessly where JSON's number type
/// allows and as a hex string for opaque/raw byte values.
#[must_use]
pub fn metric_value_to_json(value: &MetricValue) -> JsonValue {
    match value {
        MetricValue::Int8(v) => JsonValue::from(*v),
        MetricValue::Int16(v) => JsonValue::from(*v),
        MetricValue::Int32(v) => JsonValue::from(*v),
        MetricValue::Int64(v) => JsonValue::from(*v),
        MetricValue::UInt8(v) => JsonValue::from(*v),
        MetricValue::UInt16(v) => JsonValue::from(*v),
        MetricValue::UInt32(v) => JsonValue::from(*v),
        MetricValue::UInt64(v) => JsonValue::from(*v),
        MetricValue::Float(v) => serde_json::Number::from_f64(f64::from(*v)).map_or(JsonValue::Null, JsonValue::Number),
        MetricValue::Double(v) => serde_json::Number::from_f64(*v).map_or(JsonValue::Null, JsonValue::Number),
        MetricValue::Boolean(v) => JsonValue::from(*v),
        MetricValue::String(v) => JsonValue::String(v.clone()),
        MetricValue::Bytes(v) | MetricValue::Opaque(v) => JsonValue::String(to_hex(v)),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
