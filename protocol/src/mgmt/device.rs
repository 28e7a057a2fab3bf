// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device-side MGMT engine (C6): registration, periodic update (single or bulk mode), and
//! command intake.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value as JsonValue;
use sparkmesh_mqtt::control_packet::QoS;
use sparkmesh_mqtt::interface::MqttPubSub;

use crate::mgmt::{
    now_ms, BulkEnvelope, BulkOperation, CommandEnvelope, MgmtError, MgmtErrorKind, ObjectTree,
    RegistrationMessage, ResponseEnvelope, DEFAULT_BULK_INTERVAL, DEFAULT_BULK_SIZE,
};

/// Validates and applies a `configure` command's settings against the device's loaded
/// description (C10). Kept as an injected trait so this crate does not depend on
/// `sparkmesh_description`; the device-agent binary supplies the concrete implementation.
pub trait ConfigApplier: Send {
    /// Apply `settings`, returning the effective configuration on success or a reason on
    /// rejection.
    fn apply(&mut self, settings: &BTreeMap<String, JsonValue>) -> Result<JsonValue, String>;

    /// The device's current effective configuration, for `get_configuration`.
    fn effective_configuration(&self) -> JsonValue;
}

/// Handles domain-specific semantic operation commands (`trip`, `close`, `reset`, ...) that
/// are not one of the built-in verbs.
pub trait SemanticCommandHandler: Send {
    /// Execute `verb` with `parameters`, returning a result value or an error reason.
    fn handle(&mut self, verb: &str, parameters: &BTreeMap<String, JsonValue>) -> Result<JsonValue, String>;
}

/// Static configuration for one device's MGMT engine.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", setter(into))]
pub struct DeviceMgmtConfig {
    /// Topic prefix, e.g. `lwm2m`.
    pub prefix: String,
    /// Device id.
    pub device_id: String,
    /// Declared endpoint name.
    pub endpoint: String,
    /// Declared lifetime, seconds.
    pub lifetime_s: u64,
    /// Protocol version string.
    #[builder(default = "\"1.2\".to_string()")]
    pub protocol_version: String,
    /// Binding mode.
    #[builder(default = "\"UQ\".to_string()")]
    pub binding_mode: String,
    /// Interval between periodic update firings.
    pub update_interval: Duration,
    /// Whether to batch updates as bulk operations rather than single updates.
    #[builder(default)]
    pub bulk_mode: bool,
    /// Bulk-mode batch size.
    #[builder(default = "DEFAULT_BULK_SIZE")]
    pub bulk_size: usize,
    /// Bulk-mode flush interval.
    #[builder(default = "DEFAULT_BULK_INTERVAL")]
    pub bulk_interval: Duration,
}

/// The device-side MGMT engine.
pub struct DeviceMgmt<P: MqttPubSub> {
    pub_sub: P,
    config: DeviceMgmtConfig,
    objects: ObjectTree,
    pending_bulk: Vec<BulkOperation>,
}

impl<P: MqttPubSub + Send + Sync> DeviceMgmt<P> {
    /// Construct a new engine over the given initial object tree.
    pub fn new(pub_sub: P, config: DeviceMgmtConfig, objects: ObjectTree) -> Self {
        Self {
            pub_sub,
            config,
            objects,
            pending_bulk: Vec::new(),
        }
    }

    fn topic(&self, verb: &str) -> String {
        format!("{}/{}/{verb}", self.config.prefix, self.config.device_id)
    }

    fn topic_sub(&self, verb: &str, sub: &str) -> String {
        format!("{}/{}/{verb}/{sub}", self.config.prefix, self.config.device_id)
    }

    /// Publish the registration document. Fire-and-acknowledge: liveness is established by a
    /// successful broker publish, not a response message.
    ///
    /// # Errors
    /// Returns [`MgmtError`] if the publish itself fails.
    pub async fn register(&mut self) -> Result<(), MgmtError> {
        let message = RegistrationMessage {
            endpoint: self.config.endpoint.clone(),
            lifetime_s: self.config.lifetime_s,
            protocol_version: self.config.protocol_version.clone(),
            binding_mode: self.config.binding_mode.clone(),
            objects: self.objects.clone(),
        };
        let payload = serde_json::to_vec(&message)
            .map_err(|e| MgmtErrorKind::Malformed(e.to_string()))?;
        self.pub_sub
            .publish(self.topic("reg"), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| MgmtErrorKind::Publish("registration", e.to_string()))?;
        Ok(())
    }

    /// Apply `ops` to the local object tree and emit them per the configured mode: a full
    /// update immediately in single-update mode, or accumulated (and flushed at `bulk_size`)
    /// in bulk mode.
    ///
    /// # Errors
    /// Returns [`MgmtError`] if a publish triggered by this call fails.
    pub async fn apply_operations(&mut self, ops: Vec<BulkOperation>) -> Result<(), MgmtError> {
        for op in &ops {
            self.objects
                .entry(op.object_id)
                .or_default()
                .entry(op.instance_id)
                .or_default()
                .insert(op.resource_id, op.value.clone());
        }

        if self.config.bulk_mode {
            self.pending_bulk.extend(ops);
            if self.pending_bulk.len() >= self.config.bulk_size {
                self.flush_bulk().await?;
            }
            Ok(())
        } else {
            self.publish_single_update().await
        }
    }

    async fn publish_single_update(&mut self) -> Result<(), MgmtError> {
        let payload =
            serde_json::to_vec(&self.objects).map_err(|e| MgmtErrorKind::Malformed(e.to_string()))?;
        self.pub_sub
            .publish(self.topic("update"), QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| MgmtErrorKind::Publish("update", e.to_string()))?;
        Ok(())
    }

    /// Flush any pending bulk operations as one envelope, preserving their original order.
    /// A no-op if nothing is pending. Called both when the batch reaches `bulk_size` and when
    /// `bulk_interval` elapses, per §4.6.
    ///
    /// # Errors
    /// Returns [`MgmtError`] if the publish fails.
    pub async fn flush_bulk(&mut self) -> Result<(), MgmtError> {
        if self.pending_bulk.is_empty() {
            return Ok(());
        }
        let bulk_operations = std::mem::take(&mut self.pending_bulk);
        let envelope = BulkEnvelope {
            bulk_size: bulk_operations.len(),
            bulk_operations,
            device_id: self.config.device_id.clone(),
            timestamp: now_ms(),
        };
        let payload =
            serde_json::to_vec(&envelope).map_err(|e| MgmtErrorKind::Malformed(e.to_string()))?;
        self.pub_sub
            .publish(self.topic("bulk"), QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| MgmtErrorKind::Publish("bulk", e.to_string()))?;
        Ok(())
    }

    /// Number of operations currently buffered awaiting a bulk flush.
    #[must_use]
    pub fn pending_bulk_count(&self) -> usize {
        self.pending_bulk.len()
    }

    /// Dispatch an inbound command (received on `<prefix>/<id>/cmd/<verb>`) and publish the
    /// corresponding response.
    ///
    /// # Errors
    /// Returns [`MgmtError`] only if publishing the response itself fails; command-level
    /// failures are reported as an `Error`-status [`ResponseEnvelope`], not an `Err`.
    pub async fn dispatch_command(
        &mut self,
        verb: &str,
        cmd: CommandEnvelope,
        config_applier: Option<&mut dyn ConfigApplier>,
        semantic_handler: Option<&mut dyn SemanticCommandHandler>,
    ) -> Result<(), MgmtError> {
        let (response_sub, response) = match verb {
            "read" => ("read", self.handle_read(&cmd)),
            "write" => ("write", self.handle_write(&cmd)),
            "execute" => {
                let result = semantic_handler
                    .map(|h| h.handle("execute", &cmd.parameters))
                    .unwrap_or_else(|| Err("no handler registered for execute".to_string()));
                ("execute", to_response(&cmd, result))
            }
            "configure" => {
                let result = config_applier
                    .map(|a| a.apply(&cmd.parameters))
                    .unwrap_or_else(|| Err("no description loaded to validate configure".to_string()));
                self.publish_effective_config(&cmd, config_applier_result_ok(&result)).await?;
                ("configure", to_response(&cmd, result))
            }
            "get_configuration" => {
                let effective = config_applier
                    .map(|a| a.effective_configuration())
                    .unwrap_or(JsonValue::Null);
                self.publish_effective_config(&cmd, Some(effective.clone())).await?;
                ("get_configuration", ResponseEnvelope::ok(&cmd.correlation_id, effective))
            }
            other => {
                let result = semantic_handler
                    .map(|h| h.handle(other, &cmd.parameters))
                    .unwrap_or_else(|| Err(format!("unrecognized verb: {other}")));
                (other, to_response(&cmd, result))
            }
        };

        let payload =
            serde_json::to_vec(&response).map_err(|e| MgmtErrorKind::Malformed(e.to_string()))?;
        self.pub_sub
            .publish(self.topic_sub("resp", response_sub), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| MgmtErrorKind::Publish("command response", e.to_string()))?;
        Ok(())
    }

    fn handle_read(&self, cmd: &CommandEnvelope) -> ResponseEnvelope {
        match resource_path(&cmd.parameters) {
            Some((object_id, instance_id, resource_id)) => {
                let value = self
                    .objects
                    .get(&object_id)
                    .and_then(|instances| instances.get(&instance_id))
                    .and_then(|resources| resources.get(&resource_id))
                    .cloned();
                match value {
                    Some(v) => ResponseEnvelope::ok(&cmd.correlation_id, v),
                    None => ResponseEnvelope::err(&cmd.correlation_id, "resource not found"),
                }
            }
            None => ResponseEnvelope::err(&cmd.correlation_id, "missing object/instance/resource id"),
        }
    }

    fn handle_write(&mut self, cmd: &CommandEnvelope) -> ResponseEnvelope {
        match resource_path(&cmd.parameters) {
            Some((object_id, instance_id, resource_id)) => {
                let Some(value) = cmd.parameters.get("value").cloned() else {
                    return ResponseEnvelope::err(&cmd.correlation_id, "missing value");
                };
                self.objects
                    .entry(object_id)
                    .or_default()
                    .entry(instance_id)
                    .or_default()
                    .insert(resource_id, value);
                ResponseEnvelope::ok(&cmd.correlation_id, JsonValue::Bool(true))
            }
            None => ResponseEnvelope::err(&cmd.correlation_id, "missing object/instance/resource id"),
        }
    }

    async fn publish_effective_config(
        &self,
        cmd: &CommandEnvelope,
        effective: Option<JsonValue>,
    ) -> Result<(), MgmtError> {
        let Some(effective) = effective else {
            return Ok(());
        };
        let payload = serde_json::to_vec(&serde_json::json!({
            "device_id": self.config.device_id,
            "correlation_id": cmd.correlation_id,
            "effective": effective,
        }))
        .map_err(|e| MgmtErrorKind::Malformed(e.to_string()))?;
        self.pub_sub
            .publish(self.topic("config"), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| MgmtErrorKind::Publish("config", e.to_string()))?;
        Ok(())
    }
}

fn config_applier_result_ok(result: &Result<JsonValue, String>) -> Option<JsonValue> {
    result.as_ref().ok().cloned()
}

fn to_response(cmd: &CommandEnvelope, result: Result<JsonValue, String>) -> ResponseEnvelope {
    match result {
        Ok(value) => ResponseEnvelope::ok(&cmd.correlation_id, value),
        Err(reason) => ResponseEnvelope::err(&cmd.correlation_id, reason),
    }
}

fn resource_path(parameters: &BTreeMap<String, JsonValue>) -> Option<(u16, u16, u16)> {
    let object_id = parameters.get("object_id")?.as_u64()?;
    let instance_id = parameters.get("instance_id")?.as_u64()?;
    let resource_id = parameters.get("resource_id")?.as_u64()?;
    Some((
        u16::try_from(object_id).ok()?,
        u16::try_from(instance_id).ok()?,
        u16::try_from(resource_id).ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use sparkmesh_mqtt::control_packet::{PublishProperties, SubscribeProperties, UnsubscribeProperties};
    use sparkmesh_mqtt::error::{PublishError, SubscribeError, UnsubscribeError};
    use sparkmesh_mqtt::interface::CompletionToken;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingPubSub {
        published: Arc<Mutex<Vec<(String, Bytes)>>>,
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
            payload: impl Into<Bytes> + Send,
        ) -> Result<CompletionToken, PublishError> {
            self.published.lock().unwrap().push((topic.into(), payload.into()));
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

        async fn unsubscribe(
            &self,
            _topic: impl Into<String> + Send,
        ) -> Result<CompletionToken, UnsubscribeError> {
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

    fn config(bulk_mode: bool) -> DeviceMgmtConfig {
        DeviceMgmtConfigBuilder::default()
            .prefix("lwm2m")
            .device_id("dev-C")
            .endpoint("dev-C")
            .lifetime_s(60u64)
            .update_interval(Duration::from_millis(10))
            .bulk_mode(bulk_mode)
            .bulk_size(10usize)
            .bulk_interval(Duration::from_millis(50))
            .build()
            .unwrap()
    }

    fn op(object_id: u16, instance_id: u16, resource_id: u16, value: i64) -> BulkOperation {
        BulkOperation {
            object_id,
            instance_id,
            resource_id,
            value: JsonValue::from(value),
        }
    }

    #[tokio::test]
    async fn register_publishes_to_reg_topic() {
        let pub_sub = RecordingPubSub::default();
        let mut engine = DeviceMgmt::new(pub_sub.clone(), config(false), ObjectTree::new());
        engine.register().await.unwrap();
        let published = pub_sub.published.lock().unwrap();
        assert_eq!(published[0].0, "lwm2m/dev-C/reg");
    }

    #[tokio::test]
    async fn single_update_mode_publishes_immediately() {
        let pub_sub = RecordingPubSub::default();
        let mut engine = DeviceMgmt::new(pub_sub.clone(), config(false), ObjectTree::new());
        engine.apply_operations(vec![op(3, 0, 1, 42)]).await.unwrap();
        let published = pub_sub.published.lock().unwrap();
        assert_eq!(published[0].0, "lwm2m/dev-C/update");
    }

    #[tokio::test]
    async fn bulk_mode_accumulates_until_bulk_size_reached() {
        let pub_sub = RecordingPubSub::default();
        let mut engine = DeviceMgmt::new(pub_sub.clone(), config(true), ObjectTree::new());
        for i in 0..9 {
            engine.apply_operations(vec![op(3, 0, 1, i)]).await.unwrap();
        }
        assert_eq!(engine.pending_bulk_count(), 9);
        assert!(pub_sub.published.lock().unwrap().is_empty());

        engine.apply_operations(vec![op(3, 0, 1, 9)]).await.unwrap();
        assert_eq!(engine.pending_bulk_count(), 0);
        let published = pub_sub.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "lwm2m/dev-C/bulk");
        let envelope: BulkEnvelope = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(envelope.bulk_size, 10);
        assert_eq!(envelope.bulk_operations[0].value, JsonValue::from(0));
        assert_eq!(envelope.bulk_operations[9].value, JsonValue::from(9));
    }

    #[tokio::test]
    async fn bulk_flush_on_partial_batch_emits_remaining_count() {
        let pub_sub = RecordingPubSub::default();
        let mut engine = DeviceMgmt::new(pub_sub.clone(), config(true), ObjectTree::new());
        for i in 0..3 {
            engine.apply_operations(vec![op(3, 0, 1, i)]).await.unwrap();
        }
        engine.flush_bulk().await.unwrap();
        let published = pub_sub.published.lock().unwrap();
        let envelope: BulkEnvelope = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(envelope.bulk_size, 3);
    }

    #[tokio::test]
    async fn read_command_returns_current_value() {
        let pub_sub = RecordingPubSub::default();
        let mut objects = ObjectTree::new();
        objects.entry(3).or_default().entry(0).or_default().insert(1, JsonValue::from(120));
        let mut engine = DeviceMgmt::new(pub_sub.clone(), config(false), objects);

        let mut params = BTreeMap::new();
        params.insert("object_id".to_string(), JsonValue::from(3));
        params.insert("instance_id".to_string(), JsonValue::from(0));
        params.insert("resource_id".to_string(), JsonValue::from(1));
        let cmd = CommandEnvelope {
            command_name: "read".to_string(),
            parameters: params,
            correlation_id: "corr-1".to_string(),
            timestamp: 0,
        };

        engine.dispatch_command("read", cmd, None, None).await.unwrap();
        let published = pub_sub.published.lock().unwrap();
        assert_eq!(published[0].0, "lwm2m/dev-C/resp/read");
        let resp: ResponseEnvelope = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(resp.result, Some(JsonValue::from(120)));
    }

    #[tokio::test]
    async fn write_command_applies_value_and_acknowledges() {
        let pub_sub = RecordingPubSub::default();
        let mut engine = DeviceMgmt::new(pub_sub.clone(), config(false), ObjectTree::new());

        let mut params = BTreeMap::new();
        params.insert("object_id".to_string(), JsonValue::from(3));
        params.insert("instance_id".to_string(), JsonValue::from(0));
        params.insert("resource_id".to_string(), JsonValue::from(1));
        params.insert("value".to_string(), JsonValue::from(500));
        let cmd = CommandEnvelope {
            command_name: "write".to_string(),
            parameters: params,
            correlation_id: "corr-2".to_string(),
            timestamp: 0,
        };

        engine.dispatch_command("write", cmd, None, None).await.unwrap();
        assert_eq!(engine.objects[&3][&0][&1], JsonValue::from(500));
        let published = pub_sub.published.lock().unwrap();
        assert_eq!(published[0].0, "lwm2m/dev-C/resp/write");
    }

    #[tokio::test]
    async fn execute_without_handler_responds_with_error_not_publish_failure() {
        let pub_sub = RecordingPubSub::default();
        let mut engine = DeviceMgmt::new(pub_sub.clone(), config(false), ObjectTree::new());
        let cmd = CommandEnvelope {
            command_name: "trip".to_string(),
            parameters: BTreeMap::new(),
            correlation_id: "corr-3".to_string(),
            timestamp: 0,
        };
        engine.dispatch_command("execute", cmd, None, None).await.unwrap();
        let published = pub_sub.published.lock().unwrap();
        let resp: ResponseEnvelope = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(resp.status, crate::mgmt::ResponseStatus::Error);
    }
}
