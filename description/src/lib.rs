// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! Device-description document loader: parses an XML-shaped description into a typed
//! `DeviceDescription` and answers whether a given parameter name is writable.

pub mod error;
mod model;
mod parser;

pub use error::DescriptionError;
pub use model::{
    Command, ConfigurationTemplate, DeviceDescription, DeviceIdentity, DeviceParameter, Function, ParameterSpec,
    Range, TemplateSetting,
};

impl DeviceDescription {
    /// Parse a device-description document, accepting both its namespaced and unnamespaced
    /// forms.
    ///
    /// # Errors
    /// Returns [`DescriptionError`] if the document is not well-formed XML, or `DeviceIdentity`
    /// is missing in both forms.
    pub fn parse(xml: &str) -> Result<Self, DescriptionError> {
        parser::parse(xml)
    }
}

//----------------------------------------------------------------------

/// Include the README doc on a struct when running doctests to validate that the code in the
/// README can compile to verify that it has not rotted.
#[doc = include_str!("../README.md")]
#[cfg(doctest)]
struct ReadmeDoctests;
