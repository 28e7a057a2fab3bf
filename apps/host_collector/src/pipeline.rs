// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Single-writer message pipeline (spec.md §5): one task owns both the per-node TELEMETRY
//! states (C5) and the MGMT registration table (C7), applies every inbound publish to them in
//! broker-delivery order, and mirrors each transition into the device registry (C8).

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use sparkmesh_mqtt::control_packet::{Publish, QoS};
use sparkmesh_mqtt::interface::MqttPubSub;
use sparkmesh_protocol::metric::Payload;
use sparkmesh_protocol::mgmt::host::{CommandCorrelator, RegisterOutcome, RegistrationTable};
use sparkmesh_protocol::mgmt::{MgmtVerb, RegistrationMessage, ResponseEnvelope};
use sparkmesh_protocol::telemetry::host::{NodeState, Outcome};
use sparkmesh_protocol::topic::{self, MgmtTopic, MsgType, ParsedTopic, TelemetryTopic};
use sparkmesh_registry::RegistryHandle;

/// The pipeline's mutable state, owned exclusively by the task that drives [`Pipeline::ingest`].
pub struct Pipeline {
    telemetry: HashMap<String, NodeState>,
    registrations: RegistrationTable,
    correlator: CommandCorrelator,
    registry: RegistryHandle,
    mgmt_prefix: String,
}

impl Pipeline {
    /// Construct a pipeline reporting transitions to `registry`.
    #[must_use]
    pub fn new(registry: RegistryHandle, mgmt_prefix: impl Into<String>) -> Self {
        Self {
            telemetry: HashMap::new(),
            registrations: RegistrationTable::new(),
            correlator: CommandCorrelator::new(),
            registry,
            mgmt_prefix: mgmt_prefix.into(),
        }
    }

    /// Apply one inbound broker publish to the owned state, reporting any resulting transition
    /// to the registry. Returns `true` if the message was recognized (whether or not it merged
    /// cleanly), which callers use to decide whether to also relay the raw publish to the bridge.
    pub async fn ingest<P: MqttPubSub + Send + Sync>(&mut self, publish: &Publish, pub_sub: &P) -> bool {
        let topic_str = String::from_utf8_lossy(&publish.topic).to_string();
        match topic::parse(&topic_str) {
            Ok(ParsedTopic::Telemetry(telemetry_topic)) => {
                self.ingest_telemetry(&telemetry_topic, &publish.payload, pub_sub).await;
                true
            }
            Ok(ParsedTopic::Mgmt(mgmt_topic)) => {
                self.ingest_mgmt(&mgmt_topic, &publish.payload).await;
                true
            }
            Err(e) => {
                log::debug!("ignoring unrecognized topic {topic_str}: {e}");
                false
            }
        }
    }

    async fn ingest_telemetry<P: MqttPubSub + Send + Sync>(&mut self, topic: &TelemetryTopic, payload: &Bytes, pub_sub: &P) {
        let device_key = telemetry_key(topic);
        let decoded = match Payload::decode(payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("malformed telemetry payload on node {}: {e}", topic.node_id);
                return;
            }
        };

        let state = self.telemetry.entry(device_key.clone()).or_default();
        let outcome = match topic.msg_type {
            MsgType::NBirth | MsgType::DBirth => state.apply_birth(decoded.timestamp, decoded.metrics.clone()),
            MsgType::NData | MsgType::DData => state.apply_data(decoded.timestamp, decoded.seq, decoded.metrics.clone()),
            MsgType::NDeath | MsgType::DDeath => state.apply_death(),
            MsgType::NCmd | MsgType::DCmd => return,
        };

        let metrics_snapshot = || -> BTreeMap<String, sparkmesh_registry::MetricSnapshot> {
            state
                .metrics
                .iter()
                .map(|(name, metric)| {
                    (
                        name.clone(),
                        sparkmesh_registry::MetricSnapshot {
                            value: metric.value.clone(),
                            datatype: metric.value.datatype(),
                            timestamp: metric.timestamp,
                        },
                    )
                })
                .collect()
        };

        match outcome {
            Outcome::BirthApplied => {
                let _ = self
                    .registry
                    .apply_telemetry_birth(device_key.clone(), None, None, decoded.timestamp, metrics_snapshot())
                    .await;
            }
            Outcome::DataApplied => {
                let _ = self
                    .registry
                    .apply_telemetry_data(device_key.clone(), decoded.timestamp, metrics_snapshot(), state.expected_seq)
                    .await;
            }
            Outcome::DeathApplied => {
                let _ = self.registry.apply_telemetry_death(device_key.clone(), decoded.timestamp).await;
            }
            Outcome::GapDetectedRebirthRequested => {
                let _ = self.registry.apply_telemetry_gap(device_key.clone(), decoded.timestamp).await;
                self.request_rebirth(topic, pub_sub).await;
            }
        }
    }

    async fn request_rebirth<P: MqttPubSub + Send + Sync>(&self, topic: &TelemetryTopic, pub_sub: &P) {
        let rebirth_topic = topic::format_telemetry(&TelemetryTopic {
            namespace: topic.namespace.clone(),
            group_id: topic.group_id.clone(),
            msg_type: if topic.device_id.is_some() { MsgType::DCmd } else { MsgType::NCmd },
            node_id: topic.node_id.clone(),
            device_id: topic.device_id.clone(),
        });
        log::info!("sequence gap on {}; requesting rebirth on {rebirth_topic}", topic.node_id);
        if let Err(e) = pub_sub.publish(rebirth_topic, QoS::AtLeastOnce, false, Bytes::new()).await {
            log::error!("failed to publish rebirth request for {}: {e}", topic.node_id);
        }
    }

    async fn ingest_mgmt(&mut self, topic: &MgmtTopic, payload: &Bytes) {
        let now = now_ms();
        match topic.verb {
            MgmtVerb::Reg => {
                let message: RegistrationMessage = match serde_json::from_slice(payload) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("malformed registration for {}: {e}", topic.device_id);
                        return;
                    }
                };
                let lifetime_s = message.lifetime_s;
                let objects = message.objects.clone();
                if self.registrations.register(&topic.device_id, message, now) == RegisterOutcome::Created {
                    log::info!("device {} registered, lifetime {lifetime_s}s", topic.device_id);
                }
                let _ = self.registry.apply_mgmt_registered(topic.device_id.clone(), lifetime_s, objects, now).await;
            }
            MgmtVerb::Update => {
                let delta = match serde_json::from_slice(payload) {
                    Ok(delta) => delta,
                    Err(e) => {
                        log::warn!("malformed update for {}: {e}", topic.device_id);
                        return;
                    }
                };
                if let Ok(()) = self.registrations.update(&topic.device_id, clone_object_tree(&delta), now) {
                    let _ = self.registry.apply_mgmt_updated(topic.device_id.clone(), delta, now).await;
                } else {
                    log::warn!("update for unregistered device {}", topic.device_id);
                }
            }
            MgmtVerb::Bulk => {
                let envelope: sparkmesh_protocol::mgmt::BulkEnvelope = match serde_json::from_slice(payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        log::warn!("malformed bulk envelope for {}: {e}", topic.device_id);
                        return;
                    }
                };
                let mut delta = sparkmesh_protocol::mgmt::ObjectTree::new();
                for op in envelope.bulk_operations {
                    delta
                        .entry(op.object_id)
                        .or_default()
                        .entry(op.instance_id)
                        .or_default()
                        .insert(op.resource_id, op.value);
                }
                if let Ok(()) = self.registrations.update(&topic.device_id, clone_object_tree(&delta), now) {
                    let _ = self.registry.apply_mgmt_updated(topic.device_id.clone(), delta, now).await;
                }
            }
            MgmtVerb::Dereg => {
                self.registrations.deregister(&topic.device_id);
                let _ = self.registry.apply_mgmt_deregistered(topic.device_id.clone(), now).await;
            }
            MgmtVerb::Resp => {
                let response: ResponseEnvelope = match serde_json::from_slice(payload) {
                    Ok(response) => response,
                    Err(e) => {
                        log::warn!("malformed command response for {}: {e}", topic.device_id);
                        return;
                    }
                };
                let _ = self
                    .registry
                    .apply_command_response(topic.device_id.clone(), now, response.correlation_id.clone(), response.status)
                    .await;
                self.correlator.complete(response);
            }
            MgmtVerb::Event | MgmtVerb::Config => {
                log::debug!("observed {} on {}; no registry transition defined", topic.verb, topic.device_id);
            }
        }
    }

    /// Run one lazy sweep (spec.md §5: "evaluated lazily... on a low-frequency sweep, default
    /// 1s"): staleness over every tracked telemetry node, and lifetime expiry over the
    /// registration table, mirroring any resulting transitions into the registry.
    pub async fn sweep(&mut self) {
        let now = now_ms();
        for (device_id, state) in &mut self.telemetry {
            let before = state.status;
            state.evaluate_staleness(now);
            if state.status != before && state.status == sparkmesh_protocol::telemetry::host::Status::Stale {
                let _ = self.registry.apply_telemetry_gap(device_id.clone(), now).await;
            }
        }
        self.registrations.sweep_expiry(now);
        let device_ids: Vec<String> = self.registrations.device_ids().map(str::to_string).collect();
        for device_id in device_ids {
            let Some(record) = self.registrations.get(&device_id) else { continue };
            match record.status {
                sparkmesh_protocol::mgmt::host::RegStatus::Stale => {
                    let _ = self.registry.apply_mgmt_lifetime_stale(device_id, now).await;
                }
                sparkmesh_protocol::mgmt::host::RegStatus::Offline => {
                    let _ = self.registry.apply_mgmt_lifetime_expired(device_id, now).await;
                }
                sparkmesh_protocol::mgmt::host::RegStatus::Online => {}
            }
        }
    }

    /// Send a correlated command to `device_id` and await its response (C7's
    /// `send_command(device_id, verb, payload)`).
    ///
    /// # Errors
    /// Returns [`sparkmesh_protocol::mgmt::MgmtError`] on publish failure or timeout.
    pub async fn send_command<P: MqttPubSub + Send + Sync>(
        &self,
        pub_sub: &P,
        device_id: &str,
        verb: &str,
        parameters: BTreeMap<String, serde_json::Value>,
    ) -> Result<ResponseEnvelope, sparkmesh_protocol::mgmt::MgmtError> {
        self.correlator
            .send_command_default_timeout(pub_sub, &self.mgmt_prefix, device_id, verb, parameters)
            .await
    }
}

fn clone_object_tree(tree: &sparkmesh_protocol::mgmt::ObjectTree) -> sparkmesh_protocol::mgmt::ObjectTree {
    tree.clone()
}

fn telemetry_key(topic: &TelemetryTopic) -> String {
    topic.device_id.clone().unwrap_or_else(|| topic.node_id.clone())
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sparkmesh_mqtt::control_packet::{PublishProperties, SubscribeProperties, UnsubscribeProperties};
    use sparkmesh_mqtt::error::{PublishError, SubscribeError, UnsubscribeError};
    use sparkmesh_mqtt::interface::CompletionToken;
    use sparkmesh_protocol::metric::{Metric, Value};
    use sparkmesh_registry::{Registry, RegistryConfig};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct RecordingPubSub {
        published: Arc<std::sync::Mutex<Vec<String>>>,
    }

    fn ready_token() -> CompletionToken {
        CompletionToken(Box::new(async { Ok(()) }))
    }

    #[async_trait]
    impl MqttPubSub for RecordingPubSub {
        async fn publish(
            &self,
            topic: impl Into<String> + Send,
            _qos: QoS,
            _retain: bool,
            _payload: impl Into<Bytes> + Send,
        ) -> Result<CompletionToken, PublishError> {
            self.published.lock().unwrap().push(topic.into());
            Ok(ready_token())
        }

        async fn publish_with_properties(
            &self,
            topic: impl Into<String> + Send,
            qos: QoS,
            retain: bool,
            payload: impl Into<Bytes> + Send,
            _properties: PublishProperties,
        ) -> Result<CompletionToken, PublishError> {
            self.publish(topic, qos, retain, payload).await
        }

        async fn subscribe(
            &self,
            _topic: impl Into<String> + Send,
            _qos: QoS,
        ) -> Result<CompletionToken, SubscribeError> {
            Ok(ready_token())
        }

        async fn subscribe_with_properties(
            &self,
            _topic: impl Into<String> + Send,
            _qos: QoS,
            _properties: SubscribeProperties,
        ) -> Result<CompletionToken, SubscribeError> {
            Ok(ready_token())
        }

        async fn unsubscribe(&self, _topic: impl Into<String> + Send) -> Result<CompletionToken, UnsubscribeError> {
            Ok(ready_token())
        }

        async fn unsubscribe_with_properties(
            &self,
            _topic: impl Into<String> + Send,
            _properties: UnsubscribeProperties,
        ) -> Result<CompletionToken, UnsubscribeError> {
            Ok(ready_token())
        }
    }

    fn publish(topic: &str, payload: Bytes) -> Publish {
        let mut publish = Publish::new(topic, QoS::AtMostOnce, payload);
        publish.retain = false;
        publish
    }

    #[tokio::test]
    async fn birth_then_data_registers_and_merges_into_registry() {
        let (registry, task) = Registry::spawn(RegistryConfig::default());
        let _driver = tokio::spawn(task);
        let mut pipeline = Pipeline::new(registry.clone(), "lwm2m");
        let pub_sub = RecordingPubSub::default();

        let birth = sparkmesh_protocol::metric::Payload::new(
            1_000,
            0,
            None,
            vec![Metric::new("Current_A", 1_000, Value::Double(12.0))],
        )
        .encode();
        pipeline
            .ingest(&publish("spBv1.0/IIoT/DBIRTH/br-1/br-1", birth), &pub_sub)
            .await;

        let record = registry.get("br-1").await.unwrap().unwrap();
        assert_eq!(record.telemetry_seq_expected, 1);
        assert!(record.telemetry_metrics.contains_key("Current_A"));
    }

    #[tokio::test]
    async fn sequence_gap_requests_rebirth_on_the_node_cmd_topic() {
        let (registry, task) = Registry::spawn(RegistryConfig::default());
        let _driver = tokio::spawn(task);
        let mut pipeline = Pipeline::new(registry, "lwm2m");
        let pub_sub = RecordingPubSub::default();

        let birth = sparkmesh_protocol::metric::Payload::new(1_000, 0, None, vec![]).encode();
        pipeline
            .ingest(&publish("spBv1.0/IIoT/DBIRTH/br-1/br-1", birth), &pub_sub)
            .await;

        let gapped = sparkmesh_protocol::metric::Payload::new(2_000, 5, None, vec![]).encode();
        pipeline
            .ingest(&publish("spBv1.0/IIoT/DDATA/br-1/br-1", gapped), &pub_sub)
            .await;

        let published = pub_sub.published.lock().unwrap();
        assert_eq!(published.as_slice(), ["spBv1.0/IIoT/DCMD/br-1/br-1"]);
    }

    #[tokio::test]
    async fn registration_then_deregistration_round_trip() {
        let (registry, task) = Registry::spawn(RegistryConfig::default());
        let _driver = tokio::spawn(task);
        let mut pipeline = Pipeline::new(registry.clone(), "lwm2m");
        let pub_sub = RecordingPubSub::default();

        let registration = RegistrationMessage {
            endpoint: "br-1".to_string(),
            lifetime_s: 120,
            protocol_version: "1.2".to_string(),
            binding_mode: "UQ".to_string(),
            objects: sparkmesh_protocol::mgmt::ObjectTree::new(),
        };
        let payload = Bytes::from(serde_json::to_vec(&registration).unwrap());
        pipeline.ingest(&publish("lwm2m/br-1/reg", payload), &pub_sub).await;
        assert!(registry.get("br-1").await.unwrap().is_some());

        pipeline.ingest(&publish("lwm2m/br-1/dereg", Bytes::new()), &pub_sub).await;
        let record = registry.get("br-1").await.unwrap().unwrap();
        assert_eq!(record.status, sparkmesh_registry::Status::Offline);
    }
}
