// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Errors raised by the registry.

use thiserror::Error;

/// Error raised by [`crate::handle::RegistryHandle`].
#[derive(Debug, Error)]
#[error(transparent)]
pub struct RegistryError(#[from] RegistryErrorKind);

/// Kinds of [`RegistryError`].
#[derive(Debug, Error)]
pub enum RegistryErrorKind {
    /// The owning registry task has already shut down.
    #[error("registry actor is no longer running")]
    ActorGone,
}
