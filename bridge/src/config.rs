// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Construction options for the bridge and its stream producer.

use std::env::{self, VarError};
use std::time::Duration;

use crate::handle::DEFAULT_EVENT_QUEUE_CAPACITY;

/// Construction options for [`crate::Bridge::spawn`] and [`crate::producer::KafkaStreamProducer`].
#[derive(Builder, Clone)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct BridgeConfig {
    /// Comma-separated `host:port` list, passed through to `rdkafka`'s `bootstrap.servers`.
    pub brokers: String,
    /// Per-record delivery timeout.
    #[builder(default = "Duration::from_secs(10)")]
    pub send_timeout: Duration,
    /// Capacity of the bounded, drop-oldest ingestion channel sitting in front of the
    /// producer task (spec §5's "bounded... default 10 000... drop-oldest").
    #[builder(default = "DEFAULT_EVENT_QUEUE_CAPACITY")]
    pub event_queue_capacity: usize,
}

impl BridgeConfigBuilder {
    /// Initialize the builder from environment variables.
    ///
    /// # Errors
    /// Returns a `String` describing the error if a present environment variable cannot be
    /// parsed.
    pub fn from_environment() -> Result<Self, String> {
        let brokers = string_from_environment("SPARKMESH_BRIDGE_BROKERS")?;
        let send_timeout = string_from_environment("SPARKMESH_BRIDGE_SEND_TIMEOUT_S")?
            .map(|v| v.parse::<u64>().map(Duration::from_secs))
            .transpose()
            .map_err(|e| format!("SPARKMESH_BRIDGE_SEND_TIMEOUT_S: {e}"))?;
        let event_queue_capacity = string_from_environment("SPARKMESH_BRIDGE_EVENT_QUEUE_CAPACITY")?
            .map(|v| v.parse::<usize>())
            .transpose()
            .map_err(|e| format!("SPARKMESH_BRIDGE_EVENT_QUEUE_CAPACITY: {e}"))?;

        if brokers.is_none() {
            log::warn!("SPARKMESH_BRIDGE_BROKERS is not set in environment");
        }

        Ok(Self {
            brokers,
            send_timeout,
            event_queue_capacity,
        })
    }

    fn validate(&self) -> Result<(), String> {
        match &self.brokers {
            Some(brokers) if brokers.is_empty() => Err("brokers cannot be empty".to_string()),
            None => Err("brokers is required".to_string()),
            Some(_) => Ok(()),
        }
    }
}

fn string_from_environment(key: &str) -> Result<Option<String>, String> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err("Could not parse non-unicode environment variable".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_brokers() {
        let err = BridgeConfigBuilder::default().build().unwrap_err();
        assert!(err.to_string().contains("brokers"));
    }

    #[test]
    fn build_succeeds_with_brokers() {
        let config = BridgeConfigBuilder::default()
            .brokers("redpanda:9092".to_string())
            .build()
            .unwrap();
        assert_eq!(config.event_queue_capacity, DEFAULT_EVENT_QUEUE_CAPACITY);
    }

    #[test]
    fn from_environment_reads_brokers() {
        temp_env::with_var("SPARKMESH_BRIDGE_BROKERS", Some("redpanda:9092"), || {
            let builder = BridgeConfigBuilder::from_environment().unwrap();
            let config = builder.build().unwrap();
            assert_eq!(config.brokers, "redpanda:9092");
        });
    }
}
