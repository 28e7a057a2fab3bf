// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TELEMETRY protocol engine: device-side birth/data/death emission ([`device`]) and host-side
//! sequence validation and state reconstruction ([`host`]).

pub mod device;
pub mod host;

use std::time::Duration;

use thiserror::Error;

/// Error raised by the TELEMETRY engine.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct TelemetryError(#[from] TelemetryErrorKind);

/// Kinds of [`TelemetryError`].
#[derive(Debug, Error)]
pub enum TelemetryErrorKind {
    /// The underlying publish failed.
    #[error("failed to publish {0}: {1}")]
    Publish(&'static str, String),
}

/// Default staleness threshold used when a device's publish interval is not known to the host.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

/// Multiplier applied to a known publish interval to derive the staleness threshold (§4.5:
/// `3 × its publish interval`).
pub const STALE_AFTER_INTERVAL_MULTIPLIER: u32 = 3;
