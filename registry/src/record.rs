// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The unified per-device record (spec §3) merged from the host-side TELEMETRY and MGMT
//! engines.

use std::collections::BTreeMap;

use sparkmesh_protocol::mgmt::ObjectTree;
use sparkmesh_protocol::metric::{DataType, Value};

/// Liveness status of a device as seen by the registry. Distinct from (but derived from) the
/// TELEMETRY engine's [`sparkmesh_protocol::telemetry::host::Status`] and the MGMT engine's
/// [`sparkmesh_protocol::mgmt::host::RegStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Neither a birth nor a registration has ever been observed.
    Unknown,
    /// Online on every path expected for this device's type.
    Online,
    /// At least one expected path is stale (sequence gap or expiry), none are offline.
    Stale,
    /// A death, deregistration, or double lifetime expiry was observed on an expected path.
    Offline,
    /// A domain-specific fault/trip condition was reported via a semantic command response.
    Tripped,
}

/// A snapshot of one telemetry metric's current value (spec §3: "telemetry_metrics").
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    /// Current value.
    pub value: Value,
    /// Value's datatype tag.
    pub datatype: DataType,
    /// Timestamp (ms) this value was last set.
    pub timestamp: u64,
}

/// A metric's declared capability, normally sourced from a loaded device-description (C10).
#[derive(Debug, Clone, PartialEq)]
pub struct Capability {
    /// Declared type name (as the description document spells it).
    pub metric_type: String,
    /// Engineering units, if declared.
    pub units: Option<String>,
    /// Valid range, if declared.
    pub range: Option<(f64, f64)>,
}

/// Which paths are expected for a device's type, governing the `status = online` invariant
/// (spec §3: "requires both a valid birth AND a non-expired registration, when both paths are
/// expected for this device type").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedPaths {
    /// Whether this device type is expected to publish TELEMETRY birth/data.
    pub telemetry: bool,
    /// Whether this device type is expected to register/update over MGMT.
    pub mgmt: bool,
}

impl Default for ExpectedPaths {
    fn default() -> Self {
        Self {
            telemetry: true,
            mgmt: true,
        }
    }
}

/// Per-path liveness tracked inside a [`DeviceRecord`], combined into the overall [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathStatus {
    Unknown,
    Online,
    Stale,
    Offline,
}

/// The unified device record (spec §3).
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    /// Unique, case-sensitive device id.
    pub device_id: String,
    /// Device type; selects the telemetry schema and description document.
    pub device_type: Option<String>,
    /// Logical grouping for the telemetry topic namespace.
    pub group_id: Option<String>,
    /// Combined liveness status.
    pub status: Status,
    /// Which paths this device's type is expected to use.
    pub expected_paths: ExpectedPaths,
    /// First reg or first birth, ms since epoch.
    pub registered_at: Option<u64>,
    /// Most recent activity on either path, ms since epoch.
    pub last_seen: Option<u64>,
    /// Most recent birth, ms since epoch.
    pub birth_time: Option<u64>,
    /// Most recent death, ms since epoch.
    pub death_time: Option<u64>,
    /// Declared MGMT lifetime, seconds.
    pub lifetime_s: Option<u64>,
    /// Next TELEMETRY sequence number expected from this device (spec §4.5).
    pub telemetry_seq_expected: u8,
    /// Merged MGMT object tree.
    pub mgmt_objects: ObjectTree,
    /// Current telemetry metric values, keyed by name.
    pub telemetry_metrics: BTreeMap<String, MetricSnapshot>,
    /// Declared capabilities, keyed by metric name.
    pub capabilities: BTreeMap<String, Capability>,

    pub(crate) telemetry_path: PathStatus,
    pub(crate) mgmt_path: PathStatus,
}

impl DeviceRecord {
    pub(crate) fn new(device_id: String) -> Self {
        Self {
            device_id,
            device_type: None,
            group_id: None,
            status: Status::Unknown,
            expected_paths: ExpectedPaths::default(),
            registered_at: None,
            last_seen: None,
            birth_time: None,
            death_time: None,
            lifetime_s: None,
            telemetry_seq_expected: 0,
            mgmt_objects: ObjectTree::new(),
            telemetry_metrics: BTreeMap::new(),
            capabilities: BTreeMap::new(),
            telemetry_path: PathStatus::Unknown,
            mgmt_path: PathStatus::Unknown,
        }
    }

    /// Recompute [`DeviceRecord::status`] from the per-path liveness, honoring
    /// [`ExpectedPaths`]: a path not expected for this device's type never holds the combined
    /// status back.
    pub(crate) fn recompute_status(&mut self) {
        if matches!(self.status, Status::Tripped) {
            return;
        }

        let telemetry = if self.expected_paths.telemetry {
            self.telemetry_path
        } else {
            PathStatus::Online
        };
        let mgmt = if self.expected_paths.mgmt {
            self.mgmt_path
        } else {
            PathStatus::Online
        };

        self.status = if telemetry == PathStatus::Offline || mgmt == PathStatus::Offline {
            Status::Offline
        } else if telemetry == PathStatus::Unknown && mgmt == PathStatus::Unknown {
            Status::Unknown
        } else if telemetry == PathStatus::Stale || mgmt == PathStatus::Stale {
            Status::Stale
        } else if telemetry == PathStatus::Online && mgmt == PathStatus::Online {
            Status::Online
        } else {
            // One path is still Unknown (never observed) while the other is Online/Stale: the
            // device is not yet fully confirmed on every expected path.
            Status::Stale
        };
    }
}
