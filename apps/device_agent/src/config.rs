// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Environment-driven configuration for the device-agent binary (spec.md §6's "device identity,
//! type, group; telemetry interval, MGMT interval, bulk mode, bulk size, bulk interval").

use std::env::{self, VarError};
use std::time::Duration;

use derive_builder::Builder;

/// This process's static identity and scheduling configuration, read once at startup.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct AgentConfig {
    /// This device's id, unique within its group.
    pub device_id: String,
    /// Declared device type, selecting which synthetic sensor/command behavior to run.
    #[builder(default = "\"smart-breaker\".to_string()")]
    pub device_type: String,
    /// TELEMETRY topic group id.
    #[builder(default = "\"IIoT\".to_string()")]
    pub group_id: String,
    /// TELEMETRY topic namespace.
    #[builder(default = "\"spBv1.0\".to_string()")]
    pub namespace: String,
    /// MGMT topic prefix.
    #[builder(default = "\"lwm2m\".to_string()")]
    pub mgmt_prefix: String,
    /// Interval between scheduled DDATA firings.
    #[builder(default = "Duration::from_secs(5)")]
    pub telemetry_interval: Duration,
    /// Declared MGMT lifetime, seconds.
    #[builder(default = "120")]
    pub mgmt_lifetime_s: u64,
    /// Interval between periodic MGMT update firings.
    #[builder(default = "Duration::from_secs(10)")]
    pub mgmt_update_interval: Duration,
    /// Batch MGMT updates as bulk operations rather than single updates.
    #[builder(default)]
    pub mgmt_bulk_mode: bool,
    /// Bulk-mode batch size.
    #[builder(default = "10")]
    pub mgmt_bulk_size: usize,
    /// Bulk-mode flush interval.
    #[builder(default = "Duration::from_millis(50)")]
    pub mgmt_bulk_interval: Duration,
    /// Path to an optional device-description document, used to validate `configure` commands.
    #[builder(default)]
    pub description_path: Option<String>,
}

impl AgentConfigBuilder {
    /// Initialize the builder from environment variables.
    ///
    /// # Errors
    /// Returns a `String` describing the error if a present environment variable cannot be
    /// parsed.
    pub fn from_environment() -> Result<Self, String> {
        let device_id = string_from_environment("DEVICE_ID")?;
        let device_type = string_from_environment("DEVICE_TYPE")?;
        let group_id = string_from_environment("GROUP_ID")?;
        let namespace = string_from_environment("SPARKMESH_NAMESPACE")?;
        let mgmt_prefix = string_from_environment("SPARKMESH_MGMT_PREFIX")?;
        let telemetry_interval = duration_secs_from_environment("SPARKMESH_TELEMETRY_INTERVAL_S")?;
        let mgmt_lifetime_s = string_from_environment("SPARKMESH_MGMT_LIFETIME_S")?
            .map(|v| v.parse::<u64>())
            .transpose()
            .map_err(|e| format!("SPARKMESH_MGMT_LIFETIME_S: {e}"))?;
        let mgmt_update_interval = duration_secs_from_environment("SPARKMESH_MGMT_UPDATE_INTERVAL_S")?;
        let mgmt_bulk_mode = string_from_environment("SPARKMESH_MGMT_BULK_MODE")?
            .map(|v| v.parse::<bool>())
            .transpose()
            .map_err(|e| format!("SPARKMESH_MGMT_BULK_MODE: {e}"))?;
        let mgmt_bulk_size = string_from_environment("SPARKMESH_MGMT_BULK_SIZE")?
            .map(|v| v.parse::<usize>())
            .transpose()
            .map_err(|e| format!("SPARKMESH_MGMT_BULK_SIZE: {e}"))?;
        let mgmt_bulk_interval = string_from_environment("SPARKMESH_MGMT_BULK_INTERVAL_MS")?
            .map(|v| v.parse::<u64>().map(Duration::from_millis))
            .transpose()
            .map_err(|e| format!("SPARKMESH_MGMT_BULK_INTERVAL_MS: {e}"))?;
        let description_path = string_from_environment("SPARKMESH_DESCRIPTION_PATH")?;

        if device_id.is_none() {
            log::warn!("DEVICE_ID is not set in environment");
        }

        Ok(Self {
            device_id,
            device_type,
            group_id,
            namespace,
            mgmt_prefix,
            telemetry_interval,
            mgmt_lifetime_s,
            mgmt_update_interval,
            mgmt_bulk_mode,
            mgmt_bulk_size,
            mgmt_bulk_interval,
            description_path,
        })
    }

    fn validate(&self) -> Result<(), String> {
        match &self.device_id {
            Some(device_id) if device_id.is_empty() => Err("device_id cannot be empty".to_string()),
            None => Err("device_id is required".to_string()),
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

fn duration_secs_from_environment(key: &str) -> Result<Option<Duration>, String> {
    string_from_environment(key)?
        .map(|v| v.parse::<u64>().map(Duration::from_secs))
        .transpose()
        .map_err(|e| format!("{key}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_device_id() {
        let err = AgentConfigBuilder::default().build().unwrap_err();
        assert!(err.to_string().contains("device_id"));
    }

    #[test]
    fn build_succeeds_with_device_id_and_fills_defaults() {
        let config = AgentConfigBuilder::default().device_id("br-1".to_string()).build().unwrap();
        assert_eq!(config.device_type, "smart-breaker");
        assert_eq!(config.mgmt_bulk_size, 10);
    }
}
