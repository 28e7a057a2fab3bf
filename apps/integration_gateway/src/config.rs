// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Environment-driven configuration for the integration-gateway binary (spec.md §6's "MGMT
//! prefix, an optional device-description path, and the strict/permissive parameter-set mode").

use std::env::{self, VarError};

use derive_builder::Builder;
use sparkmesh_integration::StrictMode;

/// This process's MGMT scoping, optional description document, and validation mode, read once
/// at startup.
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", setter(into), build_fn(validate = "Self::validate"))]
pub struct GatewayConfig {
    /// MGMT topic prefix this gateway listens on.
    #[builder(default = "\"lwm2m\".to_string()")]
    pub mgmt_prefix: String,
    /// Path to a device-description document used to validate `SetDeviceParameters`.
    #[builder(default)]
    pub description_path: Option<String>,
    /// Whether `SetDeviceParameters` rejects the whole request on any non-writable key.
    #[builder(default = "StrictMode::Permissive")]
    pub strict_mode: StrictMode,
}

impl GatewayConfigBuilder {
    /// Initialize the builder from environment variables.
    ///
    /// # Errors
    /// Returns a `String` describing the error if a present environment variable cannot be
    /// parsed.
    pub fn from_environment() -> Result<Self, String> {
        let mgmt_prefix = string_from_environment("SPARKMESH_MGMT_PREFIX")?;
        let description_path = string_from_environment("SPARKMESH_DESCRIPTION_PATH")?;
        let strict_mode = string_from_environment("SPARKMESH_STRICT_MODE")?
            .map(|v| match v.to_ascii_lowercase().as_str() {
                "strict" => Ok(StrictMode::Strict),
                "permissive" => Ok(StrictMode::Permissive),
                other => Err(format!("SPARKMESH_STRICT_MODE: unrecognized value {other}")),
            })
            .transpose()?;

        Ok(Self {
            mgmt_prefix,
            description_path,
            strict_mode,
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
        let config = GatewayConfigBuilder::default().build().unwrap();
        assert_eq!(config.mgmt_prefix, "lwm2m");
        assert!(config.description_path.is_none());
        assert_eq!(config.strict_mode, StrictMode::Permissive);
    }
}
