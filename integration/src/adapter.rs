// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The protocol-agnostic adapter seam (spec.md §4.11), and the one concrete adapter this
//! crate ships.
//!
//! Grounded in the original bridge's `DeviceProtocolAdapter` abstract base class
//! (`start`/`stop`/`discover_devices`/`get_device_data`/`send_device_command`), generalized so
//! a Modbus or HTTP adapter could implement the same trait without touching
//! [`crate::broker::IntegrationBroker`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sparkmesh_mqtt::interface::MqttPubSub;
use sparkmesh_protocol::mgmt::host::CommandCorrelator;
use sparkmesh_protocol::mgmt::{ResponseStatus, DEFAULT_COMMAND_TIMEOUT};
use sparkmesh_registry::{DeviceFilter, RegistryHandle};

use crate::error::{IntegrationError, IntegrationErrorKind};
use crate::model::{snapshot_to_json, DeviceSummary};

/// A protocol-agnostic device adapter. The INTEGRATION broker routes each per-device call to
/// whichever adapter owns that device, and unions every adapter's `discover_devices` result.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Start the adapter's background work, if any.
    ///
    /// # Errors
    /// Returns [`IntegrationError`] if startup fails.
    async fn start(&self) -> Result<(), IntegrationError>;

    /// Stop the adapter, releasing any resources `start` acquired.
    ///
    /// # Errors
    /// Returns [`IntegrationError`] if shutdown fails.
    async fn stop(&self) -> Result<(), IntegrationError>;

    /// List every device this adapter currently knows about.
    ///
    /// # Errors
    /// Returns [`IntegrationError`] if the adapter cannot be reached.
    async fn discover_devices(&self) -> Result<Vec<DeviceSummary>, IntegrationError>;

    /// Fetch a device's current data snapshot.
    ///
    /// # Errors
    /// Returns [`IntegrationError::is_not_found`] if the adapter does not own `device_id`.
    async fn get_device_data(&self, device_id: &str) -> Result<JsonValue, IntegrationError>;

    /// Send `verb` with `parameters` to `device_id` and return its response payload.
    ///
    /// # Errors
    /// Returns [`IntegrationError`] if the device is unknown, the adapter is unreachable, or
    /// dispatch fails.
    async fn send_device_command(
        &self,
        device_id: &str,
        verb: &str,
        parameters: BTreeMap<String, JsonValue>,
    ) -> Result<JsonValue, IntegrationError>;
}

/// The sole concrete [`Adapter`]: reads device snapshots from the registry (C8) and dispatches
/// commands over MGMT (C7) via a [`CommandCorrelator`].
pub struct SparkmeshAdapter<P: MqttPubSub + Send + Sync> {
    registry: RegistryHandle,
    pub_sub: P,
    correlator: CommandCorrelator,
    mgmt_prefix: String,
    command_timeout: Duration,
}

impl<P: MqttPubSub + Send + Sync> SparkmeshAdapter<P> {
    /// Build an adapter over an already-running registry and broker session.
    #[must_use]
    pub fn new(registry: RegistryHandle, pub_sub: P, mgmt_prefix: impl Into<String>) -> Self {
        Self {
            registry,
            pub_sub,
            correlator: CommandCorrelator::new(),
            mgmt_prefix: mgmt_prefix.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Override the per-command response timeout (default 5s, per spec.md §4.7).
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Deliver an observed MGMT response to whichever in-flight command is awaiting it. The
    /// caller (typically the host process's MGMT response-topic handler) is responsible for
    /// decoding the wire payload into a [`sparkmesh_protocol::mgmt::ResponseEnvelope`] first.
    pub fn complete_response(&self, response: sparkmesh_protocol::mgmt::ResponseEnvelope) {
        self.correlator.complete(response);
    }
}

#[async_trait]
impl<P: MqttPubSub + Send + Sync> Adapter for SparkmeshAdapter<P> {
    async fn start(&self) -> Result<(), IntegrationError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), IntegrationError> {
        Ok(())
    }

    async fn discover_devices(&self) -> Result<Vec<DeviceSummary>, IntegrationError> {
        let records = self
            .registry
            .list(DeviceFilter::All)
            .await
            .map_err(|e| IntegrationErrorKind::Dispatch(e.to_string()))?;
        Ok(records
            .into_iter()
            .map(|record| DeviceSummary {
                device_id: record.device_id,
                device_type: record.device_type,
                status: format!("{:?}", record.status),
            })
            .collect())
    }

    async fn get_device_data(&self, device_id: &str) -> Result<JsonValue, IntegrationError> {
        let record = self
            .registry
            .get(device_id)
            .await
            .map_err(|e| IntegrationErrorKind::Dispatch(e.to_string()))?
            .ok_or_else(|| IntegrationErrorKind::NotFound {
                device_id: device_id.to_string(),
            })?;
        Ok(snapshot_to_json(&record))
    }

    async fn send_device_command(
        &self,
        device_id: &str,
        verb: &str,
        parameters: BTreeMap<String, JsonValue>,
    ) -> Result<JsonValue, IntegrationError> {
        if self
            .registry
            .get(device_id)
            .await
            .map_err(|e| IntegrationErrorKind::Dispatch(e.to_string()))?
            .is_none()
        {
            return Err(IntegrationErrorKind::NotFound {
                device_id: device_id.to_string(),
            }
            .into());
        }

        let response = self
            .correlator
            .send_command(&self.pub_sub, &self.mgmt_prefix, device_id, verb, parameters, self.command_timeout)
            .await
            .map_err(|e| IntegrationErrorKind::Dispatch(e.to_string()))?;

        match response.status {
            ResponseStatus::Ok => Ok(response.result.unwrap_or(JsonValue::Null)),
            ResponseStatus::Error => Err(IntegrationErrorKind::Dispatch(
                response
                    .error
                    .unwrap_or_else(|| "device reported an error with no detail".to_string()),
            )
            .into()),
        }
    }
}
