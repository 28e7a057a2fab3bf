// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Maps MQTT topic filters onto stream topics.
//!
//! The default table extends the original bridge's Sparkplug-birth/data/death and
//! LwM2M-registration/update pairs to cover every TELEMETRY message type and MGMT verb, since a
//! durable audit log that silently drops node-scoped telemetry or bulk/dereg/event traffic would
//! defeat the point of a durable-stream bridge.

use sparkmesh_protocol::topic;

/// An ordered list of `(mqtt topic filter, stream topic)` pairs. The first matching filter wins.
#[derive(Debug, Clone)]
pub struct TopicMap {
    entries: Vec<(String, String)>,
}

impl TopicMap {
    /// Build an empty map; every topic falls through [`TopicMap::resolve`] as unmapped.
    #[must_use]
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// Append a mapping. Earlier entries take priority over later ones with the same match.
    #[must_use]
    pub fn with_mapping(mut self, filter: impl Into<String>, stream_topic: impl Into<String>) -> Self {
        self.entries.push((filter.into(), stream_topic.into()));
        self
    }

    /// Resolve `mqtt_topic` to its stream topic, if any configured filter matches.
    #[must_use]
    pub fn resolve(&self, mqtt_topic: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(filter, _)| topic::matches(filter, mqtt_topic).unwrap_or(false))
            .map(|(_, stream_topic)| stream_topic.as_str())
    }
}

impl Default for TopicMap {
    fn default() -> Self {
        Self::empty()
            .with_mapping("spBv1.0/+/NBIRTH/+", "iot.telemetry.sparkmesh.node_birth")
            .with_mapping("spBv1.0/+/NDATA/+", "iot.telemetry.sparkmesh.node_data")
            .with_mapping("spBv1.0/+/NDEATH/+", "iot.telemetry.sparkmesh.node_death")
            .with_mapping("spBv1.0/+/DBIRTH/+/+", "iot.telemetry.sparkmesh.birth")
            .with_mapping("spBv1.0/+/DDATA/+/+", "iot.telemetry.sparkmesh.data")
            .with_mapping("spBv1.0/+/DDEATH/+/+", "iot.telemetry.sparkmesh.death")
            .with_mapping("lwm2m/+/reg", "iot.telemetry.lwm2m.registration")
            .with_mapping("lwm2m/+/update", "iot.telemetry.lwm2m.update")
            .with_mapping("lwm2m/+/bulk", "iot.telemetry.lwm2m.bulk")
            .with_mapping("lwm2m/+/dereg", "iot.telemetry.lwm2m.deregistration")
            .with_mapping("lwm2m/+/event", "iot.telemetry.lwm2m.event")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("spBv1.0/IIoT/DDATA/edge-1/dev-A", Some("iot.telemetry.sparkmesh.data"); "device data")]
    #[test_case("spBv1.0/IIoT/NBIRTH/edge-1", Some("iot.telemetry.sparkmesh.node_birth"); "node birth")]
    #[test_case("lwm2m/dev-B/reg", Some("iot.telemetry.lwm2m.registration"); "registration")]
    #[test_case("lwm2m/dev-B/cmd/read", None; "commands are not bridged")]
    #[test_case("unrelated/topic/shape", None; "unrecognized topic")]
    fn resolves_default_mappings(mqtt_topic: &str, expected: Option<&str>) {
        assert_eq!(TopicMap::default().resolve(mqtt_topic), expected);
    }

    #[test]
    fn first_matching_entry_wins() {
        let map = TopicMap::empty()
            .with_mapping("a/+", "first")
            .with_mapping("a/b", "second");
        assert_eq!(map.resolve("a/b"), Some("first"));
    }
}
