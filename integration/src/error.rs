// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Errors raised by the INTEGRATION broker and its adapters.

use thiserror::Error;

/// Error raised by an [`crate::adapter::Adapter`] or [`crate::broker::IntegrationBroker`]
/// operation.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct IntegrationError(#[from] IntegrationErrorKind);

impl IntegrationError {
    /// True iff this is a [`IntegrationErrorKind::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.0, IntegrationErrorKind::NotFound { .. })
    }
}

/// Kinds of [`IntegrationError`] (spec.md §4.11 failure semantics).
#[derive(Debug, Error)]
pub enum IntegrationErrorKind {
    /// No adapter owns `device_id`.
    #[error("unknown device: {device_id}")]
    NotFound {
        /// The device id that no adapter recognized.
        device_id: String,
    },
    /// The adapter owning `device_id` is not currently reachable.
    #[error("adapter unavailable for device {device_id}")]
    AdapterUnavailable {
        /// The device id whose adapter is unreachable.
        device_id: String,
    },
    /// A supplied parameter failed validation against the device's description.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParam {
        /// The offending parameter's name.
        name: String,
        /// Human-readable rejection reason.
        reason: String,
    },
    /// The underlying command dispatch failed (publish error, or no response within timeout).
    #[error("command dispatch failed: {0}")]
    Dispatch(String),
}
