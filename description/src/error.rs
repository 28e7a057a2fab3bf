// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Errors raised loading a device-description document.

use thiserror::Error;

/// Error raised parsing a device-description document.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct DescriptionError(#[from] DescriptionErrorKind);

/// Kinds of [`DescriptionError`].
#[derive(Debug, Error)]
pub enum DescriptionErrorKind {
    /// The document is not well-formed XML.
    #[error("malformed document: {0}")]
    Malformed(#[from] roxmltree::Error),
    /// A required element is missing, in both its namespaced and unnamespaced forms.
    #[error("missing required element: {0}")]
    MissingElement(&'static str),
}
