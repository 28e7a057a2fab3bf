// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device-side TELEMETRY engine (C4): birth emission, absolute-deadline scheduled data
//! emission, and best-effort death on shutdown.

use std::time::Duration;

use sparkmesh_mqtt::control_packet::QoS;
use sparkmesh_mqtt::interface::MqttPubSub;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metric::{Metric, Payload};
use crate::telemetry::{TelemetryError, TelemetryErrorKind};
use crate::topic::{format_telemetry, MsgType, TelemetryTopic};

/// A pluggable source of sensor samples. Physical/simulated sensor math is deliberately not
/// this engine's concern (spec: "physical sensor emulation math, treated as a pluggable
/// source").
pub trait SensorSource: Send {
    /// Produce the next set of metric samples. Called once per scheduled firing.
    fn sample(&mut self) -> Vec<Metric>;

    /// The birth-time metric set: every metric this device will ever publish, each with its
    /// initial value. Defaults to one [`SensorSource::sample`] call.
    fn birth_metrics(&mut self) -> Vec<Metric> {
        self.sample()
    }
}

/// Lifecycle state of a device's TELEMETRY engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not yet started.
    Init,
    /// Waiting for the broker connection/subscriptions to be ready.
    AwaitingBroker,
    /// Birth published; about to enter `publishing`.
    Registered,
    /// Periodic data emission is active.
    Publishing,
    /// Shutting down; death emission in progress.
    Dying,
    /// Terminated.
    Done,
}

/// Static identity and scheduling configuration for one device's TELEMETRY engine.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", setter(into))]
pub struct DeviceTelemetryConfig {
    /// Topic namespace, e.g. `spBv1.0`.
    pub namespace: String,
    /// Topic group id.
    pub group_id: String,
    /// Edge node id (this process's node identity).
    pub node_id: String,
    /// Device id within the node. `None` for a node-scoped (not device-scoped) telemetry
    /// stream.
    #[builder(default)]
    pub device_id: Option<String>,
    /// Interval between scheduled DDATA/NDATA firings.
    pub interval: Duration,
}

impl DeviceTelemetryConfig {
    fn topic(&self, msg_type: MsgType) -> String {
        format_telemetry(&TelemetryTopic {
            namespace: self.namespace.clone(),
            group_id: self.group_id.clone(),
            msg_type,
            node_id: self.node_id.clone(),
            device_id: self.device_id.clone(),
        })
    }

    fn birth_msg_type(&self) -> MsgType {
        if self.device_id.is_some() {
            MsgType::DBirth
        } else {
            MsgType::NBirth
        }
    }

    fn data_msg_type(&self) -> MsgType {
        if self.device_id.is_some() {
            MsgType::DData
        } else {
            MsgType::NData
        }
    }

    fn death_msg_type(&self) -> MsgType {
        if self.device_id.is_some() {
            MsgType::DDeath
        } else {
            MsgType::NDeath
        }
    }
}

/// The device-side TELEMETRY engine: owns the sequence counter and drives the
/// init → awaiting_broker → registered → publishing → dying → done state machine.
pub struct DeviceTelemetry<P: MqttPubSub> {
    pub_sub: P,
    config: DeviceTelemetryConfig,
    state: State,
    seq: u8,
}

impl<P: MqttPubSub + Send + Sync> DeviceTelemetry<P> {
    /// Construct a new engine, in `Init` state.
    pub fn new(pub_sub: P, config: DeviceTelemetryConfig) -> Self {
        Self {
            pub_sub,
            config,
            state: State::Init,
            seq: 0,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Run the engine to completion: emit birth, then loop emitting scheduled data until
    /// `cancel` fires or a rebirth is requested via `rebirth_requests`, then emit death.
    ///
    /// Scheduling uses an absolute deadline (`next = prev + interval`) so the publish cadence
    /// never drifts; if the loop falls behind by more than one interval it resyncs without
    /// bursting out the missed slots.
    ///
    /// # Errors
    /// Returns [`TelemetryError`] only if the initial birth publish fails; once `publishing`
    /// is entered, per-firing publish failures are logged and do not stop the loop (death
    /// emission failure is explicitly non-fatal per spec).
    pub async fn run(
        &mut self,
        mut sensor: impl SensorSource,
        mut rebirth_requests: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> Result<(), TelemetryError> {
        self.state = State::AwaitingBroker;
        self.state = State::Registered;
        self.emit_birth(&mut sensor).await?;
        self.state = State::Publishing;

        let mut deadline = Instant::now() + self.config.interval;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(()) = rebirth_requests.recv() => {
                    if let Err(e) = self.emit_birth(&mut sensor).await {
                        log::error!("rebirth publish failed for {}: {e}", self.config.node_id);
                    }
                    deadline = Instant::now() + self.config.interval;
                }
                () = tokio::time::sleep_until(deadline) => {
                    let now = Instant::now();
                    if now > deadline + self.config.interval {
                        log::warn!(
                            "telemetry scheduler for {} fell behind; skipping missed slots instead of bursting",
                            self.config.node_id
                        );
                        deadline = now;
                    }
                    self.emit_data(&mut sensor).await;
                    deadline += self.config.interval;
                }
            }
        }

        self.state = State::Dying;
        self.emit_death().await;
        self.state = State::Done;
        Ok(())
    }

    async fn emit_birth(&mut self, sensor: &mut impl SensorSource) -> Result<(), TelemetryError> {
        self.seq = 0;
        let metrics = sensor.birth_metrics();
        let payload = Payload::new(now_ms(), self.seq, self.config.device_id.clone(), metrics);
        let topic = self.config.topic(self.config.birth_msg_type());
        self.pub_sub
            .publish(topic, QoS::AtLeastOnce, false, payload.encode())
            .await
            .map_err(|e| TelemetryErrorKind::Publish("birth", e.to_string()))?;
        Ok(())
    }

    async fn emit_data(&mut self, sensor: &mut impl SensorSource) {
        self.seq = self.seq.wrapping_add(1);
        let metrics = sensor.sample();
        let payload = Payload::new(now_ms(), self.seq, self.config.device_id.clone(), metrics);
        let topic = self.config.topic(self.config.data_msg_type());
        if let Err(e) = self
            .pub_sub
            .publish(topic, QoS::AtMostOnce, false, payload.encode())
            .await
        {
            log::error!("telemetry data publish failed for {}: {e}", self.config.node_id);
        }
    }

    async fn emit_death(&mut self) {
        let payload = Payload::new(now_ms(), self.seq, self.config.device_id.clone(), vec![]);
        let topic = self.config.topic(self.config.death_msg_type());
        if let Err(e) = self
            .pub_sub
            .publish(topic, QoS::AtLeastOnce, false, payload.encode())
            .await
        {
            log::warn!("death publish failed for {} (non-fatal): {e}", self.config.node_id);
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Value;
    use async_trait::async_trait;
    use bytes::Bytes;
    use sparkmesh_mqtt::control_packet::{PublishProperties, SubscribeProperties, UnsubscribeProperties};
    use sparkmesh_mqtt::error::{PublishError, SubscribeError, UnsubscribeError};
    use sparkmesh_mqtt::interface::CompletionToken;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingPubSub {
        published: Arc<Mutex<Vec<(String, QoS, Bytes)>>>,
    }

    fn ready_token() -> CompletionToken {
        CompletionToken(Box::new(async { Ok(()) }))
    }

    #[async_trait]
    impl MqttPubSub for RecordingPubSub {
        async fn publish(
            &self,
            topic: impl Into<String> + Send,
            qos: QoS,
            _retain: bool,
            payload: impl Into<Bytes> + Send,
        ) -> Result<CompletionToken, PublishError> {
            self.published
                .lock()
                .unwrap()
                .push((topic.into(), qos, payload.into()));
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

    struct FixedSensor {
        metrics: Vec<Metric>,
    }

    impl SensorSource for FixedSensor {
        fn sample(&mut self) -> Vec<Metric> {
            self.metrics.clone()
        }
    }

    fn config(device_id: Option<&str>) -> DeviceTelemetryConfig {
        DeviceTelemetryConfigBuilder::default()
            .namespace("spBv1.0")
            .group_id("IIoT")
            .node_id("edge-1")
            .device_id(device_id.map(str::to_string))
            .interval(Duration::from_millis(5))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn birth_uses_device_scoped_topic_and_seq_zero() {
        let pub_sub = RecordingPubSub::default();
        let mut engine = DeviceTelemetry::new(pub_sub.clone(), config(Some("dev-A")));
        let mut sensor = FixedSensor {
            metrics: vec![Metric::new("Temp", 1, Value::Double(22.0))],
        };
        engine.emit_birth(&mut sensor).await.unwrap();

        let published = pub_sub.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "spBv1.0/IIoT/DBIRTH/edge-1/dev-A");
        let decoded = Payload::decode(&published[0].2).unwrap();
        assert_eq!(decoded.seq, 0);
    }

    #[tokio::test]
    async fn data_sequence_increments_and_wraps_mod_256() {
        let pub_sub = RecordingPubSub::default();
        let mut engine = DeviceTelemetry::new(pub_sub.clone(), config(None));
        engine.seq = 255;
        let mut sensor = FixedSensor { metrics: vec![] };
        engine.emit_data(&mut sensor).await;
        let published = pub_sub.published.lock().unwrap();
        let decoded = Payload::decode(&published[0].2).unwrap();
        assert_eq!(decoded.seq, 0);
    }

    #[tokio::test]
    async fn death_emission_failure_is_non_fatal() {
        // A pub_sub is always Ok() in this harness; this test documents the contract that
        // emit_death swallows errors rather than propagating them.
        let pub_sub = RecordingPubSub::default();
        let mut engine = DeviceTelemetry::new(pub_sub, config(Some("dev-A")));
        engine.emit_death().await;
        assert_eq!(engine.state(), State::Init);
    }

    #[tokio::test]
    async fn run_emits_birth_then_death_on_immediate_cancel() {
        let pub_sub = RecordingPubSub::default();
        let mut engine = DeviceTelemetry::new(pub_sub.clone(), config(Some("dev-A")));
        let sensor = FixedSensor {
            metrics: vec![Metric::new("Temp", 1, Value::Double(22.0))],
        };
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        engine.run(sensor, rx, cancel).await.unwrap();

        let published = pub_sub.published.lock().unwrap();
        assert_eq!(published[0].0, "spBv1.0/IIoT/DBIRTH/edge-1/dev-A");
        assert_eq!(published[1].0, "spBv1.0/IIoT/DDEATH/edge-1/dev-A");
        assert_eq!(engine.state(), State::Done);
    }
}
