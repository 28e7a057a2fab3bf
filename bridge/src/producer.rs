// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The seam between the bridge's drain loop and whatever durable stream backs it.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeErrorKind};

/// Publishes one record to a durable stream topic, keyed for partition affinity.
///
/// This is the protocol-agnostic seam the original bridge's single hard-coded
/// `KafkaProducer` occupied; `KafkaStreamProducer` is the one concrete implementation this
/// crate ships; an in-memory producer (below) exercises the drain loop in tests without a
/// broker.
#[async_trait]
pub trait StreamProducer: Send + Sync + 'static {
    /// Publish `payload` under `key` onto `topic`.
    ///
    /// # Errors
    /// Returns [`BridgeError`] if the underlying client reports a delivery failure.
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BridgeError>;
}

/// A [`StreamProducer`] backed by `rdkafka`'s future-based producer, talking to any
/// Kafka-wire-compatible broker (Redpanda in the original deployment).
pub struct KafkaStreamProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaStreamProducer {
    /// Build a producer from `config`.
    ///
    /// # Errors
    /// Returns [`BridgeError`] if the underlying client configuration is rejected.
    pub fn new(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.send_timeout.as_millis().to_string())
            .set("acks", "all")
            .set("retries", "3")
            .create()
            .map_err(|err| BridgeErrorKind::Config(err.to_string()))?;
        Ok(Self {
            producer,
            send_timeout: config.send_timeout,
        })
    }
}

#[async_trait]
impl StreamProducer for KafkaStreamProducer {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        let record = FutureRecord::to(topic).key(key).payload(&payload);
        self.producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(err, _)| {
                BridgeErrorKind::Publish {
                    topic: topic.to_string(),
                    reason: err.to_string(),
                }
                .into()
            })
            .map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::{async_trait, BridgeError, StreamProducer};

    /// Records every publish it receives; never fails.
    #[derive(Default)]
    pub struct RecordingProducer {
        pub published: Mutex<Vec<(String, String, Vec<u8>)>>,
    }

    #[async_trait]
    impl StreamProducer for RecordingProducer {
        async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), key.to_string(), payload));
            Ok(())
        }
    }
}
