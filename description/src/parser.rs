// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Namespace-then-fallback XML traversal, mirroring the original driver's
//! `root.find("fdi:Tag", namespace)` then `root.find("Tag")` pattern.

use roxmltree::{Document, Node};

use crate::error::{DescriptionError, DescriptionErrorKind};
use crate::model::{
    Command, ConfigurationTemplate, DeviceDescription, DeviceIdentity, DeviceParameter, Function, ParameterSpec,
    Range, TemplateSetting,
};

const FDI_NAMESPACE: &str = "http://www.opcfoundation.org/FDI/2011/Device";

/// Parse a device-description document, accepting both its namespaced and unnamespaced forms.
///
/// # Errors
/// Returns [`DescriptionError`] if the document is not well-formed XML, or `DeviceIdentity` is
/// missing in both forms.
pub fn parse(xml: &str) -> Result<DeviceDescription, DescriptionError> {
    let doc = Document::parse(xml).map_err(DescriptionErrorKind::Malformed)?;
    let root = doc.root_element();

    let identity_node = child(root, "DeviceIdentity").ok_or(DescriptionErrorKind::MissingElement("DeviceIdentity"))?;
    let identity = DeviceIdentity {
        device_type: text(identity_node, "DeviceType"),
        manufacturer: text(identity_node, "DeviceManufacturer"),
        model: text(identity_node, "DeviceModel"),
        serial: text(identity_node, "DeviceSerialNumber"),
        version: text(identity_node, "DeviceVersion"),
        description: text(identity_node, "DeviceDescription"),
    };

    let mut parameters = std::collections::BTreeMap::new();
    let mut commands = std::collections::BTreeMap::new();
    let mut functions = std::collections::BTreeMap::new();
    if let Some(capabilities) = child(root, "DeviceCapabilities") {
        parameters = parse_device_parameters(capabilities);
        commands = parse_device_commands(capabilities);
        functions = parse_device_functions(capabilities);
    }

    let mut configuration_templates = std::collections::BTreeMap::new();
    if let Some(configuration) = child(root, "DeviceConfiguration") {
        configuration_templates = parse_configuration_templates(configuration);
    }

    Ok(DeviceDescription {
        identity,
        parameters,
        configuration_templates,
        commands,
        functions,
    })
}

/// Look up `tag` under `node`, trying the FDI namespace first and falling back to an
/// unprefixed match.
fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == tag && n.tag_name().namespace() == Some(FDI_NAMESPACE))
        .or_else(|| node.children().find(|n| n.is_element() && n.tag_name().name() == tag && n.tag_name().namespace().is_none()))
}

fn children<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Vec<Node<'a, 'input>> {
    node.children()
        .filter(|n| n.is_element() && n.tag_name().name() == tag)
        .collect()
}

fn text(node: Node, tag: &str) -> String {
    child(node, tag).and_then(|n| n.text()).unwrap_or("").to_string()
}

fn attr(node: Node, name: &str) -> Option<String> {
    node.attribute(name).map(str::to_string)
}

fn attr_bool(node: Node, name: &str, default: bool) -> bool {
    node.attribute(name).map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(default)
}

fn parse_range(range_attr: Option<&str>) -> Option<Range> {
    let raw = range_attr?;
    let (min_str, max_str) = raw.split_once('-')?;
    let min = min_str.trim().parse::<f64>().ok()?;
    let max = max_str.trim().parse::<f64>().ok()?;
    Some(Range { min, max })
}

fn parse_device_parameters(capabilities: Node) -> std::collections::BTreeMap<String, DeviceParameter> {
    let mut out = std::collections::BTreeMap::new();
    let Some(parameters_elem) = child(capabilities, "DeviceParameters") else {
        return out;
    };
    for param_elem in children(parameters_elem, "Parameter") {
        let name = attr(param_elem, "name").unwrap_or_default();
        let range = parse_range(param_elem.attribute("range"));
        let mut value_map = std::collections::BTreeMap::new();
        if let Some(value_map_elem) = child(param_elem, "ValueMap") {
            for value_elem in children(value_map_elem, "Value") {
                let value_name = attr(value_elem, "name").unwrap_or_default();
                value_map.insert(value_name.clone(), value_name);
            }
        }
        let parameter = DeviceParameter {
            name: name.clone(),
            r#type: attr(param_elem, "type").unwrap_or_default(),
            units: attr(param_elem, "units"),
            range,
            default: attr(param_elem, "default"),
            mandatory: attr_bool(param_elem, "mandatory", false),
            value_map,
        };
        out.insert(name, parameter);
    }
    out
}

fn parse_configuration_templates(configuration: Node) -> std::collections::BTreeMap<String, ConfigurationTemplate> {
    let mut out = std::collections::BTreeMap::new();
    let Some(templates_elem) = child(configuration, "ConfigurationTemplates") else {
        return out;
    };
    for template_elem in children(templates_elem, "Template") {
        let name = attr(template_elem, "name").unwrap_or_default();
        let description = text(template_elem, "Description");
        let mut settings = std::collections::BTreeMap::new();
        if let Some(settings_elem) = child(template_elem, "Settings") {
            for setting_elem in children(settings_elem, "Setting") {
                let setting_name = attr(setting_elem, "name").unwrap_or_default();
                settings.insert(
                    setting_name,
                    TemplateSetting {
                        value: attr(setting_elem, "value").unwrap_or_default(),
                        units: attr(setting_elem, "units"),
                    },
                );
            }
        }
        out.insert(
            name.clone(),
            ConfigurationTemplate {
                name,
                description,
                settings,
            },
        );
    }
    out
}

fn parse_parameter_specs(params_elem: Node) -> Vec<ParameterSpec> {
    children(params_elem, "Parameter")
        .into_iter()
        .map(|param_elem| ParameterSpec {
            name: attr(param_elem, "name").unwrap_or_default(),
            r#type: attr(param_elem, "type").unwrap_or_default(),
            default: attr(param_elem, "default"),
            units: attr(param_elem, "units"),
            required: attr_bool(param_elem, "required", false),
        })
        .collect()
}

fn parse_device_functions(capabilities: Node) -> std::collections::BTreeMap<String, Function> {
    let mut out = std::collections::BTreeMap::new();
    let Some(functions_elem) = child(capabilities, "DeviceFunctions") else {
        return out;
    };
    for func_elem in children(functions_elem, "Function") {
        let name = attr(func_elem, "name").unwrap_or_default();
        let description = text(func_elem, "Description");
        let parameters = child(func_elem, "Parameters").map(parse_parameter_specs).unwrap_or_default();
        out.insert(
            name.clone(),
            Function {
                name,
                description,
                parameters,
            },
        );
    }
    out
}

fn parse_device_commands(capabilities: Node) -> std::collections::BTreeMap<String, Command> {
    let mut out = std::collections::BTreeMap::new();
    let Some(commands_elem) = child(capabilities, "DeviceCommands") else {
        return out;
    };
    for cmd_elem in children(commands_elem, "Command") {
        let name = attr(cmd_elem, "name").unwrap_or_default();
        let description = attr(cmd_elem, "description").unwrap_or_default();
        let parameters = child(cmd_elem, "Parameters").map(parse_parameter_specs).unwrap_or_default();
        out.insert(
            name.clone(),
            Command {
                name,
                description,
                parameters,
            },
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMART_BREAKER_NAMESPACED: &str = r#"
        <Device xmlns="http://www.opcfoundation.org/FDI/2011/Device">
          <DeviceIdentity>
            <DeviceType>smart-breaker</DeviceType>
            <DeviceManufacturer>Contoso</DeviceManufacturer>
            <DeviceModel>SB-200</DeviceModel>
            <DeviceSerialNumber>SN-001</DeviceSerialNumber>
            <DeviceVersion>1.2</DeviceVersion>
            <DeviceDescription>200A smart circuit breaker</DeviceDescription>
          </DeviceIdentity>
          <DeviceCapabilities>
            <DeviceParameters>
              <Parameter name="overcurrent_pickup" type="float" units="A" range="50-250" default="120" mandatory="true">
                <ValueMap>
                  <Value name="trip_curve_standard"/>
                  <Value name="trip_curve_fast"/>
                </ValueMap>
              </Parameter>
              <Parameter name="serial_number" type="string"/>
            </DeviceParameters>
            <DeviceFunctions>
              <Function name="configure_pickup">
                <Description>Adjust overcurrent pickup</Description>
                <Parameters>
                  <Parameter name="overcurrent_pickup" type="float" default="120" units="A"/>
                </Parameters>
              </Function>
            </DeviceFunctions>
            <DeviceCommands>
              <Command name="reset" description="Reset trip latch">
                <Parameters/>
              </Command>
            </DeviceCommands>
          </DeviceCapabilities>
          <DeviceConfiguration>
            <ConfigurationTemplates>
              <Template name="default">
                <Description>Factory defaults</Description>
                <Settings>
                  <Setting name="overcurrent_pickup" value="120" units="A"/>
                </Settings>
              </Template>
            </ConfigurationTemplates>
          </DeviceConfiguration>
        </Device>
    "#;

    #[test]
    fn parses_identity_and_parameters() {
        let description = parse(SMART_BREAKER_NAMESPACED).unwrap();
        assert_eq!(description.identity.device_type, "smart-breaker");
        let pickup = &description.parameters["overcurrent_pickup"];
        assert_eq!(pickup.range, Some(Range { min: 50.0, max: 250.0 }));
        assert_eq!(pickup.value_map.len(), 2);
        assert!(pickup.mandatory);
    }

    #[test]
    fn writable_parameters_come_from_commands_and_functions() {
        let description = parse(SMART_BREAKER_NAMESPACED).unwrap();
        assert!(description.is_writable("overcurrent_pickup"));
        assert!(!description.is_writable("serial_number"));
    }

    #[test]
    fn parses_configuration_templates() {
        let description = parse(SMART_BREAKER_NAMESPACED).unwrap();
        let template = &description.configuration_templates["default"];
        assert_eq!(template.settings["overcurrent_pickup"].value, "120");
    }

    #[test]
    fn accepts_unnamespaced_documents() {
        let unnamespaced = SMART_BREAKER_NAMESPACED.replace(
            r#"xmlns="http://www.opcfoundation.org/FDI/2011/Device""#,
            "",
        );
        let description = parse(&unnamespaced).unwrap();
        assert_eq!(description.identity.device_type, "smart-breaker");
        assert!(description.is_writable("overcurrent_pickup"));
    }

    #[test]
    fn missing_identity_is_an_error() {
        let err = parse("<Device></Device>").unwrap_err();
        assert!(err.to_string().contains("DeviceIdentity"));
    }
}
