// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Keeps this process's own device registry and command correlator current from the broker's
//! MGMT traffic, mirroring the host-collector's MGMT half (C7) without TELEMETRY: this gateway
//! answers INTEGRATION calls against configuration state, not telemetry metrics.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use sparkmesh_integration::SparkmeshAdapter;
use sparkmesh_mqtt::control_packet::Publish;
use sparkmesh_mqtt::interface::MqttPubSub;
use sparkmesh_protocol::mgmt::host::{RegisterOutcome, RegistrationTable};
use sparkmesh_protocol::mgmt::{MgmtVerb, ObjectTree, RegistrationMessage, ResponseEnvelope};
use sparkmesh_protocol::topic::{self, MgmtTopic, ParsedTopic};
use sparkmesh_registry::RegistryHandle;

/// Owns the registration table mirrored from observed MGMT traffic, and forwards command
/// responses to the [`SparkmeshAdapter`] awaiting them.
pub struct GatewayIngest<P: MqttPubSub + Send + Sync> {
    registrations: RegistrationTable,
    registry: RegistryHandle,
    adapter: Arc<SparkmeshAdapter<P>>,
}

impl<P: MqttPubSub + Send + Sync> GatewayIngest<P> {
    /// Construct an ingest loop mirroring transitions into `registry` and completing commands
    /// dispatched through `adapter`.
    #[must_use]
    pub fn new(registry: RegistryHandle, adapter: Arc<SparkmeshAdapter<P>>) -> Self {
        Self {
            registrations: RegistrationTable::new(),
            registry,
            adapter,
        }
    }

    /// Apply one inbound MGMT publish. Non-MGMT topics (e.g. TELEMETRY) are ignored: this
    /// gateway's registry view covers configuration state only.
    pub async fn ingest(&mut self, publish: &Publish) {
        let topic_str = String::from_utf8_lossy(&publish.topic).to_string();
        let Ok(ParsedTopic::Mgmt(mgmt_topic)) = topic::parse(&topic_str) else {
            return;
        };
        self.ingest_mgmt(&mgmt_topic, &publish.payload).await;
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
                let delta: ObjectTree = match serde_json::from_slice(payload) {
                    Ok(delta) => delta,
                    Err(e) => {
                        log::warn!("malformed update for {}: {e}", topic.device_id);
                        return;
                    }
                };
                if self.registrations.update(&topic.device_id, delta.clone(), now).is_ok() {
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
                let mut delta = ObjectTree::new();
                for op in envelope.bulk_operations {
                    delta
                        .entry(op.object_id)
                        .or_default()
                        .entry(op.instance_id)
                        .or_default()
                        .insert(op.resource_id, op.value);
                }
                if self.registrations.update(&topic.device_id, delta.clone(), now).is_ok() {
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
                self.adapter.complete_response(response);
            }
            MgmtVerb::Event | MgmtVerb::Config => {
                log::debug!("observed {} on {}; no registry transition defined", topic.verb, topic.device_id);
            }
        }
    }

    /// Evaluate lifetime expiry over the registration table, mirroring any resulting
    /// transitions into the registry (same lazy-sweep discipline as the host collector).
    pub async fn sweep(&mut self) {
        let now = now_ms();
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
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
