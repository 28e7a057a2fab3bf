// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The typed shape a device-description document parses into.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `DeviceIdentity`: the package's identifying metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// `DeviceType`.
    pub device_type: String,
    /// `DeviceManufacturer`.
    pub manufacturer: String,
    /// `DeviceModel`.
    pub model: String,
    /// `DeviceSerialNumber`.
    pub serial: String,
    /// `DeviceVersion` (revision history, not the protocol version).
    pub version: String,
    /// `DeviceDescription` free-text summary.
    pub description: String,
}

/// An inclusive numeric range, parsed from a `"min-max"` attribute string.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    /// Inclusive lower bound.
    pub min: f64,
    /// Inclusive upper bound.
    pub max: f64,
}

/// One entry of `DeviceParameters`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceParameter {
    /// Parameter name, used as its map key too.
    pub name: String,
    /// Declared datatype, as a free-form string (the document does not constrain this to C2's
    /// numeric tag set).
    pub r#type: String,
    /// Engineering units, if declared.
    pub units: Option<String>,
    /// Valid range, if declared.
    pub range: Option<Range>,
    /// Default value, as the document's raw string.
    pub default: Option<String>,
    /// Whether the device requires this parameter to be set before operating.
    pub mandatory: bool,
    /// Enumerated value aliases from a `ValueMap` child element. Additive over spec.md's
    /// named fields: the original driver carries this, and it costs nothing to keep.
    pub value_map: BTreeMap<String, String>,
}

/// One named setting inside a [`ConfigurationTemplate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSetting {
    /// Setting value, as the document's raw string.
    pub value: String,
    /// Engineering units, if declared.
    pub units: Option<String>,
}

/// One entry of `ConfigurationTemplates`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationTemplate {
    /// Template name, used as its map key too.
    pub name: String,
    /// Free-text summary.
    pub description: String,
    /// The template's settings, keyed by parameter name.
    pub settings: BTreeMap<String, TemplateSetting>,
}

/// One formal parameter of a [`Command`] or [`Function`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name.
    pub name: String,
    /// Declared datatype, as a free-form string.
    pub r#type: String,
    /// Default value, as the document's raw string.
    pub default: Option<String>,
    /// Engineering units, if declared (`DeviceFunctions` only).
    pub units: Option<String>,
    /// Whether the caller must supply this parameter (`DeviceCommands` only).
    pub required: bool,
}

/// One entry of `DeviceCommands`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name, used as its map key too.
    pub name: String,
    /// Free-text summary.
    pub description: String,
    /// Formal parameters the command accepts.
    pub parameters: Vec<ParameterSpec>,
}

/// One entry of `DeviceFunctions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Function {
    /// Function name, used as its map key too.
    pub name: String,
    /// Free-text summary.
    pub description: String,
    /// Formal parameters the function accepts.
    pub parameters: Vec<ParameterSpec>,
}

/// The fully parsed device-description document (spec.md §4.10).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescription {
    /// `DeviceIdentity`.
    pub identity: DeviceIdentity,
    /// `DeviceCapabilities/DeviceParameters`, keyed by parameter name.
    pub parameters: BTreeMap<String, DeviceParameter>,
    /// `DeviceConfiguration/ConfigurationTemplates`, keyed by template name.
    pub configuration_templates: BTreeMap<String, ConfigurationTemplate>,
    /// `DeviceCapabilities/DeviceCommands`, keyed by command name.
    pub commands: BTreeMap<String, Command>,
    /// `DeviceCapabilities/DeviceFunctions`, keyed by function name.
    pub functions: BTreeMap<String, Function>,
}

impl DeviceDescription {
    /// True iff `param_name` appears in any command's or function's parameter list. This
    /// governs the INTEGRATION broker's parameter-set validation (spec.md §4.10/§4.11): a
    /// parameter that only appears in `DeviceParameters` describes device state, not something
    /// an external tool may configure through a command.
    #[must_use]
    pub fn is_writable(&self, param_name: &str) -> bool {
        self.commands
            .values()
            .flat_map(|command| &command.parameters)
            .chain(self.functions.values().flat_map(|function| &function.parameters))
            .any(|param| param.name == param_name)
    }
}
