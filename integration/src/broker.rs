// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The INTEGRATION broker facade (spec.md §4.11/§6): the external-facing surface that routes
//! each call to whichever registered [`Adapter`] owns the target device.

use std::collections::BTreeMap;

use serde_json::{Map, Value as JsonValue};
use sparkmesh_description::DeviceDescription;

use crate::adapter::Adapter;
use crate::error::{IntegrationError, IntegrationErrorKind};
use crate::model::{DeviceSummary, RejectedParam, SetParametersOutcome, WritableParameters};

/// Governs whether [`IntegrationBroker::set_device_parameters`] applies writable keys when
/// the request also names a non-writable key (spec.md §4.10: "do not partially apply writable
/// ones unless configured to").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrictMode {
    /// Reject the whole request (no keys applied) if any key is non-writable.
    Strict,
    /// Apply every writable key; report non-writable keys as rejected.
    Permissive,
}

/// Protocol-agnostic facade over one or more [`Adapter`]s and an optional device-description
/// (C10) used to validate `SetDeviceParameters` requests.
pub struct IntegrationBroker {
    adapters: Vec<Box<dyn Adapter>>,
    description: Option<DeviceDescription>,
    strict_mode: StrictMode,
}

impl IntegrationBroker {
    /// Build a broker over `adapters`, with no loaded device-description.
    #[must_use]
    pub fn new(adapters: Vec<Box<dyn Adapter>>, strict_mode: StrictMode) -> Self {
        Self {
            adapters,
            description: None,
            strict_mode,
        }
    }

    /// Attach a loaded device-description, used to validate `SetDeviceParameters` and to
    /// answer `ParseDescriptionWritableParameters`.
    #[must_use]
    pub fn with_description(mut self, description: DeviceDescription) -> Self {
        self.description = Some(description);
        self
    }

    /// `DiscoverDevices() -> list of device summaries`, unioning every adapter.
    ///
    /// # Errors
    /// Returns [`IntegrationError`] if any adapter fails to answer.
    pub async fn discover_devices(&self) -> Result<Vec<DeviceSummary>, IntegrationError> {
        let mut out = Vec::new();
        for adapter in &self.adapters {
            out.extend(adapter.discover_devices().await?);
        }
        Ok(out)
    }

    /// `GetDeviceParameters(id) -> snapshot`.
    ///
    /// # Errors
    /// Returns [`IntegrationErrorKind::NotFound`] if no adapter owns `id`.
    pub async fn get_device_parameters(&self, device_id: &str) -> Result<JsonValue, IntegrationError> {
        self.owning_adapter(device_id).await?.get_device_data(device_id).await
    }

    /// `GetDeviceConfiguration(id) -> effective configuration`, read-through via a
    /// `get_configuration` command.
    ///
    /// # Errors
    /// Returns [`IntegrationError`] if the device is unknown or the adapter is unreachable.
    pub async fn get_device_configuration(&self, device_id: &str) -> Result<JsonValue, IntegrationError> {
        let adapter = self.owning_adapter(device_id).await?;
        adapter.send_device_command(device_id, "get_configuration", BTreeMap::new()).await
    }

    /// `SendDeviceCommand(id, verb, params) -> {status}`.
    ///
    /// # Errors
    /// Returns [`IntegrationError`] if the device is unknown, the adapter is unreachable, or
    /// dispatch fails.
    pub async fn send_device_command(
        &self,
        device_id: &str,
        verb: &str,
        params: BTreeMap<String, JsonValue>,
    ) -> Result<JsonValue, IntegrationError> {
        let adapter = self.owning_adapter(device_id).await?;
        adapter.send_device_command(device_id, verb, params).await
    }

    /// `SetDeviceParameters(id, params) -> {status, applied_params}`. Each key is checked
    /// against the loaded description's writable set (spec.md §4.10); with no description
    /// loaded every key is treated as non-writable, since there is nothing to validate against.
    ///
    /// # Errors
    /// Returns [`IntegrationErrorKind::InvalidParam`] in strict mode if any key is
    /// non-writable, or [`IntegrationError`] if the device is unknown, the adapter is
    /// unreachable, or dispatch fails.
    pub async fn set_device_parameters(
        &self,
        device_id: &str,
        params: BTreeMap<String, JsonValue>,
    ) -> Result<SetParametersOutcome, IntegrationError> {
        let mut applied = BTreeMap::new();
        let mut rejected = Vec::new();
        for (name, value) in params {
            if self.description.as_ref().is_some_and(|d| d.is_writable(&name)) {
                applied.insert(name, value);
            } else {
                rejected.push(RejectedParam {
                    name,
                    reason: "not declared writable by any command or function".to_string(),
                });
            }
        }

        if self.strict_mode == StrictMode::Strict && !rejected.is_empty() {
            return Err(IntegrationErrorKind::InvalidParam {
                name: rejected[0].name.clone(),
                reason: rejected[0].reason.clone(),
            }
            .into());
        }

        let applied_names: Vec<String> = applied.keys().cloned().collect();
        if !applied.is_empty() {
            let adapter = self.owning_adapter(device_id).await?;
            adapter.send_device_command(device_id, "configure", applied).await?;
        }

        Ok(SetParametersOutcome {
            applied: applied_names,
            rejected,
        })
    }

    /// `ParseDescriptionWritableParameters(device_type) -> {functions, commands, templates}`.
    /// `device_type` is accepted for parity with the external surface's signature; this
    /// broker holds at most one loaded description at a time, so the argument is not used to
    /// select among several.
    ///
    /// # Errors
    /// Returns [`IntegrationError`] if no description is loaded.
    pub fn parse_description_writable_parameters(&self, _device_type: &str) -> Result<WritableParameters, IntegrationError> {
        let description = self.description.as_ref().ok_or_else(|| {
            IntegrationErrorKind::Dispatch("no device-description loaded".to_string())
        })?;

        let functions = serde_json::to_value(&description.functions).unwrap_or(JsonValue::Object(Map::new()));
        let commands = serde_json::to_value(&description.commands).unwrap_or(JsonValue::Object(Map::new()));
        let templates =
            serde_json::to_value(&description.configuration_templates).unwrap_or(JsonValue::Object(Map::new()));

        Ok(WritableParameters {
            functions,
            commands,
            templates,
        })
    }

    async fn owning_adapter(&self, device_id: &str) -> Result<&dyn Adapter, IntegrationError> {
        for adapter in &self.adapters {
            if adapter.discover_devices().await?.iter().any(|d| d.device_id == device_id) {
                return Ok(adapter.as_ref());
            }
        }
        Err(IntegrationErrorKind::NotFound {
            device_id: device_id.to_string(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct StubAdapter {
        devices: Vec<DeviceSummary>,
        commands: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Adapter for StubAdapter {
        async fn start(&self) -> Result<(), IntegrationError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), IntegrationError> {
            Ok(())
        }

        async fn discover_devices(&self) -> Result<Vec<DeviceSummary>, IntegrationError> {
            Ok(self.devices.clone())
        }

        async fn get_device_data(&self, device_id: &str) -> Result<JsonValue, IntegrationError> {
            Ok(serde_json::json!({"device_id": device_id}))
        }

        async fn send_device_command(
            &self,
            device_id: &str,
            verb: &str,
            _parameters: BTreeMap<String, JsonValue>,
        ) -> Result<JsonValue, IntegrationError> {
            self.commands.lock().unwrap().push((device_id.to_string(), verb.to_string()));
            Ok(JsonValue::Null)
        }
    }

    fn one_device_adapter() -> StubAdapter {
        StubAdapter {
            devices: vec![DeviceSummary {
                device_id: "br-1".to_string(),
                device_type: Some("smart-breaker".to_string()),
                status: "Online".to_string(),
            }],
            commands: Mutex::new(Vec::new()),
        }
    }

    fn breaker_description() -> sparkmesh_description::DeviceDescription {
        sparkmesh_description::DeviceDescription::parse(
            r#"<Device xmlns="http://www.opcfoundation.org/FDI/2011/Device">
                <DeviceIdentity><DeviceType>smart-breaker</DeviceType></DeviceIdentity>
                <DeviceCapabilities>
                  <DeviceFunctions>
                    <Function name="configure_pickup">
                      <Parameters><Parameter name="overcurrent_pickup" type="float"/></Parameters>
                    </Function>
                  </DeviceFunctions>
                </DeviceCapabilities>
            </Device>"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn discover_devices_unions_every_adapter() {
        let broker = IntegrationBroker::new(vec![Box::new(one_device_adapter())], StrictMode::Permissive);
        let devices = broker.discover_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let broker = IntegrationBroker::new(vec![Box::new(one_device_adapter())], StrictMode::Permissive);
        let err = broker.get_device_parameters("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn strict_mode_rejects_the_whole_request_on_any_non_writable_key() {
        let broker = IntegrationBroker::new(vec![Box::new(one_device_adapter())], StrictMode::Strict)
            .with_description(breaker_description());

        let mut params = BTreeMap::new();
        params.insert("overcurrent_pickup".to_string(), serde_json::json!(120));
        params.insert("serial_number".to_string(), serde_json::json!("X"));

        let err = broker.set_device_parameters("br-1", params).await.unwrap_err();
        assert!(err.to_string().contains("serial_number"));
    }

    #[tokio::test]
    async fn permissive_mode_applies_writable_keys_and_reports_the_rest_rejected() {
        let broker = IntegrationBroker::new(vec![Box::new(one_device_adapter())], StrictMode::Permissive)
            .with_description(breaker_description());

        let mut params = BTreeMap::new();
        params.insert("overcurrent_pickup".to_string(), serde_json::json!(120));
        params.insert("serial_number".to_string(), serde_json::json!("X"));

        let outcome = broker.set_device_parameters("br-1", params).await.unwrap();
        assert_eq!(outcome.applied, vec!["overcurrent_pickup".to_string()]);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].name, "serial_number");
    }

    #[test]
    fn parse_description_writable_parameters_requires_a_loaded_description() {
        let broker = IntegrationBroker::new(vec![], StrictMode::Permissive);
        assert!(broker.parse_description_writable_parameters("smart-breaker").is_err());
    }
}
