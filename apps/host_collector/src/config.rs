// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Environment-driven configuration for the host-collector binary (spec.md §6's "stream
//! endpoint and topic-map overrides... staleness thresholds").

use std::env::{self, VarError};
use std::time::Duration;

use derive_builder::Builder;

/// This process's topic scoping and sweep configuration, read once at startup.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct CollectorConfig {
    /// TELEMETRY topic namespace this collector listens on.
    #[builder(default = "\"spBv1.0\".to_string()")]
    pub namespace: String,
    /// MGMT topic prefix this collector listens on.
    #[builder(default = "\"lwm2m\".to_string()")]
    pub mgmt_prefix: String,
    /// Interval between lazy staleness/expiry sweeps (spec.md §5: "default 1s").
    #[builder(default = "Duration::from_secs(1)")]
    pub sweep_interval: Duration,
    /// Whether raw broker traffic is relayed to the durable-stream bridge. Disabled when no
    /// bridge broker list is configured, so the collector can run standalone in development.
    #[builder(default)]
    pub bridge_enabled: bool,
}

impl CollectorConfigBuilder {
    /// Initialize the builder from environment variables.
    ///
    /// # Errors
    /// Returns a `String` describing the error if a present environment variable cannot be
    /// parsed.
    pub fn from_environment() -> Result<Self, String> {
        let namespace = string_from_environment("SPARKMESH_NAMESPACE")?;
        let mgmt_prefix = string_from_environment("SPARKMESH_MGMT_PREFIX")?;
        let sweep_interval = string_from_environment("SPARKMESH_SWEEP_INTERVAL_S")?
            .map(|v| v.parse::<u64>().map(Duration::from_secs))
            .transpose()
            .map_err(|e| format!("SPARKMESH_SWEEP_INTERVAL_S: {e}"))?;
        let bridge_enabled = Some(env::var("SPARKMESH_BRIDGE_BROKERS").is_ok());

        Ok(Self {
            namespace,
            mgmt_prefix,
            sweep_interval,
            bridge_enabled,
        })
    }

    fn validate(&self) -> Result<(), String> {
        Ok(())
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
    fn defaults_apply_with_no_environment() {
        let config = CollectorConfigBuilder::default().build().unwrap();
        assert_eq!(config.namespace, "spBv1.0");
        assert_eq!(config.mgmt_prefix, "lwm2m");
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert!(!config.bridge_enabled);
    }
}
