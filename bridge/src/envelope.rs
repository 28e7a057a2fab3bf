// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The record shape republished onto the durable stream.

use serde::{Deserialize, Serialize};

/// One bridged record: the original MQTT publish plus the metadata the original bridge's
/// `_parse_mqtt_message` attached before handing off to its Kafka producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Device id extracted from the source topic, used as the stream record's key.
    pub device_id: String,
    /// The MQTT topic the payload was received on.
    pub source_topic: String,
    /// Ingestion timestamp, ms since epoch.
    pub timestamp_ms: u64,
    /// Size of `body` in bytes, carried alongside rather than recomputed downstream.
    pub payload_size: usize,
    /// The raw payload, base64-free: stream producers that need text framing encode it
    /// themselves rather than this crate guessing a payload's shape up front.
    #[serde(with = "serde_bytes_vec")]
    pub body: Vec<u8>,
}

impl Envelope {
    /// Build an envelope, deriving `payload_size` from `body`.
    #[must_use]
    pub fn new(device_id: impl Into<String>, source_topic: impl Into<String>, timestamp_ms: u64, body: Vec<u8>) -> Self {
        let device_id = device_id.into();
        let source_topic = source_topic.into();
        Self {
            device_id,
            source_topic,
            timestamp_ms,
            payload_size: body.len(),
            body,
        }
    }
}

/// `Vec<u8>` serializes as a JSON array of numbers by default; the original bridge's payloads
/// are frequently binary Sparkplug B, so an array-of-bytes encoding (rather than a string one
/// that would require choosing an escaping scheme) keeps round-tripping lossless.
mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(bytes.iter().copied())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_payload_size_from_body() {
        let envelope = Envelope::new("dev-A", "spBv1.0/IIoT/DDATA/edge-1/dev-A", 1_000, vec![1, 2, 3]);
        assert_eq!(envelope.payload_size, 3);
    }

    #[test]
    fn round_trips_through_json() {
        let envelope = Envelope::new("dev-A", "lwm2m/dev-A/update", 2_000, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, envelope);
    }
}
