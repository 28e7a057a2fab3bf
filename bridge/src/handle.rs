// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The bridge's public handle and the background task that drains it.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::broadcast;

use crate::envelope::Envelope;
use crate::producer::StreamProducer;
use crate::topic_map::TopicMap;

/// Default bound on the ingestion channel (spec §5: "bounded... default 10 000... drop-oldest").
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct Ingested {
    topic: String,
    payload: Bytes,
    timestamp_ms: u64,
}

/// A cheap, cloneable handle onto a running bridge.
#[derive(Clone)]
pub struct BridgeHandle {
    tx: broadcast::Sender<Ingested>,
}

/// Entry point mirroring the device registry's `Registry::spawn` split between a handle and
/// the task that drives it.
pub struct Bridge;

impl Bridge {
    /// Spawn a bridge draining into `producer`. Returns a handle and the task that drives it;
    /// the caller is responsible for spawning the task (e.g. with `tokio::spawn`).
    #[must_use]
    pub fn spawn<P: StreamProducer>(
        producer: P,
        topic_map: TopicMap,
        queue_capacity: usize,
    ) -> (BridgeHandle, impl Future<Output = ()>) {
        let (tx, rx) = broadcast::channel(queue_capacity);
        let handle = BridgeHandle { tx: tx.clone() };
        let task = run_drain_loop(rx, Arc::new(producer), topic_map);
        (handle, task)
    }
}

impl BridgeHandle {
    /// Ingest one raw MQTT publish. Synchronous and non-blocking: the call only enqueues onto
    /// the bounded, drop-oldest channel the background task drains; `qos` is accepted for
    /// parity with the broker facade's publish signature but does not otherwise affect bridging.
    pub fn ingest(&self, topic: impl Into<String>, payload: Bytes, _qos: u8) {
        let item = Ingested {
            topic: topic.into(),
            payload,
            timestamp_ms: Utc::now().timestamp_millis().max(0) as u64,
        };
        // An Err here means there are no receivers left, i.e. the drain task has exited; the
        // original bridge logged and counted such failures rather than propagating them, since
        // ingestion is fire-and-forget from the broker subscription's perspective.
        if self.tx.send(item).is_err() {
            log::warn!("bridge drain task is not running; dropping ingested publish");
        }
    }
}

async fn run_drain_loop<P: StreamProducer>(
    mut rx: broadcast::Receiver<Ingested>,
    producer: Arc<P>,
    topic_map: TopicMap,
) {
    loop {
        let item = match rx.recv().await {
            Ok(item) => item,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("bridge drain loop lagged, {skipped} publishes dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let Some(stream_topic) = topic_map.resolve(&item.topic) else {
            log::debug!("no stream mapping for topic {}", item.topic);
            continue;
        };
        let stream_topic = stream_topic.to_string();

        let device_id = extract_device_id(&item.topic);
        let envelope = Envelope::new(device_id.clone(), item.topic.clone(), item.timestamp_ms, item.payload.to_vec());
        let Ok(body) = serde_json::to_vec(&envelope) else {
            log::error!("failed to serialize envelope for topic {}", item.topic);
            continue;
        };

        if let Err(err) = producer.publish(&stream_topic, &device_id, body).await {
            log::error!("failed to publish to {stream_topic}: {err}");
        }
    }
}

/// Extract a device id from an MQTT topic for use as the stream record's partition key,
/// mirroring the original bridge's `_extract_device_id`: Sparkplug topics carry the id in the
/// fourth segment (node-scoped messages fall back to the third, the edge-node id), LwM2M
/// topics carry it in the second.
fn extract_device_id(topic: &str) -> String {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.first() == Some(&"spBv1.0") {
        return parts.get(4).or(parts.get(3)).copied().unwrap_or(topic).to_string();
    }
    if parts.first() == Some(&"lwm2m") {
        return parts.get(1).copied().unwrap_or(topic).to_string();
    }
    topic.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::test_support::RecordingProducer;
    use std::sync::Arc as StdArc;
    use std::time::Duration;
    use test_case::test_case;

    #[test_case("spBv1.0/IIoT/DDATA/edge-1/dev-A", "dev-A"; "device scoped sparkplug")]
    #[test_case("spBv1.0/IIoT/NBIRTH/edge-1", "edge-1"; "node scoped sparkplug")]
    #[test_case("lwm2m/dev-B/update", "dev-B"; "lwm2m")]
    fn extracts_device_id(topic: &str, expected: &str) {
        assert_eq!(extract_device_id(topic), expected);
    }

    #[tokio::test]
    async fn bridges_a_mapped_publish_to_the_producer() {
        let producer = StdArc::new(RecordingProducer::default());
        let (tx, rx) = broadcast::channel(16);
        let task = tokio::spawn(run_drain_loop(rx, producer.clone(), TopicMap::default()));
        let handle = BridgeHandle { tx };

        handle.ingest("spBv1.0/IIoT/DDATA/edge-1/dev-A", Bytes::from_static(b"payload"), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(handle);
        let _ = tokio::time::timeout(Duration::from_millis(100), task).await;

        let published = producer.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "iot.telemetry.sparkmesh.data");
        assert_eq!(published[0].1, "dev-A");
    }

    #[tokio::test]
    async fn unmapped_topics_are_not_published() {
        let producer = StdArc::new(RecordingProducer::default());
        let (tx, rx) = broadcast::channel(16);
        let task = tokio::spawn(run_drain_loop(rx, producer.clone(), TopicMap::default()));
        let handle = BridgeHandle { tx };

        handle.ingest("unrelated/topic/shape", Bytes::new(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(handle);
        let _ = tokio::time::timeout(Duration::from_millis(100), task).await;

        assert!(producer.published.lock().unwrap().is_empty());
    }
}
