// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The single-writer task owning the device table. Never invoked directly; constructed through
//! [`crate::handle::Registry::spawn`].

use std::collections::{BTreeMap, HashMap};

use log::{debug, trace, warn};
use sparkmesh_protocol::mgmt::{merge_object_tree, ObjectTree, ResponseStatus};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::event::{Event, EventKind};
use crate::handle::DeviceFilter;
use crate::record::{Capability, DeviceRecord, ExpectedPaths, MetricSnapshot, PathStatus, Status};

/// The full command protocol understood by the registry actor. Private: callers go through
/// [`crate::handle::RegistryHandle`]'s typed methods instead of constructing these directly.
pub(crate) enum Command {
    TelemetryBirth {
        device_id: String,
        device_type: Option<String>,
        group_id: Option<String>,
        timestamp_ms: u64,
        metrics: BTreeMap<String, MetricSnapshot>,
    },
    TelemetryData {
        device_id: String,
        timestamp_ms: u64,
        metrics: BTreeMap<String, MetricSnapshot>,
        seq_expected: u8,
    },
    TelemetryGap {
        device_id: String,
        timestamp_ms: u64,
    },
    TelemetryDeath {
        device_id: String,
        timestamp_ms: u64,
    },
    MgmtRegistered {
        device_id: String,
        lifetime_s: u64,
        objects: ObjectTree,
        timestamp_ms: u64,
    },
    MgmtUpdated {
        device_id: String,
        delta: ObjectTree,
        timestamp_ms: u64,
    },
    MgmtDeregistered {
        device_id: String,
        timestamp_ms: u64,
    },
    MgmtLifetimeStale {
        device_id: String,
        timestamp_ms: u64,
    },
    MgmtLifetimeExpired {
        device_id: String,
        timestamp_ms: u64,
    },
    CommandResponse {
        device_id: String,
        timestamp_ms: u64,
        correlation_id: String,
        status: ResponseStatus,
    },
    SetExpectedPaths {
        device_id: String,
        expected: ExpectedPaths,
    },
    SetCapabilities {
        device_id: String,
        capabilities: BTreeMap<String, Capability>,
    },
    Get {
        device_id: String,
        reply: oneshot::Sender<Option<DeviceRecord>>,
    },
    List {
        filter: DeviceFilter,
        reply: oneshot::Sender<Vec<DeviceRecord>>,
    },
}

/// Drives the registry until every [`crate::handle::RegistryHandle`] clone (and the spawning
/// `Registry`) has been dropped.
pub(crate) async fn run_actor(mut rx: mpsc::Receiver<Command>, events: broadcast::Sender<Event>) {
    let mut devices: HashMap<String, DeviceRecord> = HashMap::new();

    while let Some(command) = rx.recv().await {
        apply(&mut devices, &events, command);
    }

    debug!("registry actor exiting: all handles dropped");
}

fn emit(events: &broadcast::Sender<Event>, device_id: &str, timestamp: u64, kind: EventKind) {
    // `send` only errors when there are no receivers at all; that's expected whenever nobody
    // has subscribed yet and is not a failure.
    let _ = events.send(Event {
        device_id: device_id.to_string(),
        timestamp,
        kind,
    });
}

fn apply(devices: &mut HashMap<String, DeviceRecord>, events: &broadcast::Sender<Event>, command: Command) {
    match command {
        Command::TelemetryBirth {
            device_id,
            device_type,
            group_id,
            timestamp_ms,
            metrics,
        } => {
            let first_seen = !devices.contains_key(&device_id);
            let record = devices
                .entry(device_id.clone())
                .or_insert_with(|| DeviceRecord::new(device_id.clone()));
            if first_seen {
                record.registered_at = Some(timestamp_ms);
            }
            record.device_type = device_type.or(record.device_type.take());
            record.group_id = group_id.or(record.group_id.take());
            record.birth_time = Some(timestamp_ms);
            record.death_time = None;
            record.last_seen = Some(timestamp_ms);
            record.telemetry_seq_expected = 1;
            record.telemetry_metrics = metrics;
            record.telemetry_path = PathStatus::Online;
            record.recompute_status();

            if first_seen {
                emit(events, &device_id, timestamp_ms, EventKind::DeviceRegistered);
            }
            emit(events, &device_id, timestamp_ms, EventKind::TelemetryBirth);
        }

        Command::TelemetryData {
            device_id,
            timestamp_ms,
            metrics,
            seq_expected,
        } => {
            let Some(record) = devices.get_mut(&device_id) else {
                warn!("telemetry data for unknown device {device_id}, dropping");
                return;
            };
            record.last_seen = Some(timestamp_ms);
            record.telemetry_seq_expected = seq_expected;
            record.telemetry_metrics = metrics;
            record.telemetry_path = PathStatus::Online;
            record.recompute_status();
            emit(events, &device_id, timestamp_ms, EventKind::DeviceUpdated { mgmt_delta: None });
        }

        Command::TelemetryGap { device_id, timestamp_ms } => {
            let Some(record) = devices.get_mut(&device_id) else {
                warn!("telemetry gap for unknown device {device_id}, dropping");
                return;
            };
            record.last_seen = Some(timestamp_ms);
            record.telemetry_path = PathStatus::Stale;
            record.recompute_status();
            trace!("device {device_id} telemetry path marked stale after sequence gap");
        }

        Command::TelemetryDeath { device_id, timestamp_ms } => {
            let Some(record) = devices.get_mut(&device_id) else {
                warn!("telemetry death for unknown device {device_id}, dropping");
                return;
            };
            record.telemetry_metrics.clear();
            record.death_time = Some(timestamp_ms);
            record.last_seen = Some(timestamp_ms);
            record.telemetry_path = PathStatus::Offline;
            record.recompute_status();
            emit(
                events,
                &device_id,
                timestamp_ms,
                EventKind::DeviceDeregistered { reason: "death" },
            );
        }

        Command::MgmtRegistered {
            device_id,
            lifetime_s,
            objects,
            timestamp_ms,
        } => {
            let first_seen = !devices.contains_key(&device_id);
            let record = devices
                .entry(device_id.clone())
                .or_insert_with(|| DeviceRecord::new(device_id.clone()));
            if first_seen {
                record.registered_at = Some(timestamp_ms);
            }
            record.lifetime_s = Some(lifetime_s);
            record.mgmt_objects = objects;
            record.last_seen = Some(timestamp_ms);
            record.mgmt_path = PathStatus::Online;
            record.recompute_status();

            if first_seen {
                emit(events, &device_id, timestamp_ms, EventKind::DeviceRegistered);
            } else {
                emit(events, &device_id, timestamp_ms, EventKind::DeviceUpdated { mgmt_delta: None });
            }
        }

        Command::MgmtUpdated {
            device_id,
            delta,
            timestamp_ms,
        } => {
            let Some(record) = devices.get_mut(&device_id) else {
                warn!("mgmt update for unregistered device {device_id}, dropping");
                return;
            };
            let delta_json = serde_json::to_value(&delta).ok();
            merge_object_tree(&mut record.mgmt_objects, delta);
            record.last_seen = Some(timestamp_ms);
            record.mgmt_path = PathStatus::Online;
            record.recompute_status();
            emit(
                events,
                &device_id,
                timestamp_ms,
                EventKind::DeviceUpdated {
                    mgmt_delta: delta_json,
                },
            );
        }

        Command::MgmtDeregistered { device_id, timestamp_ms } => {
            let Some(record) = devices.get_mut(&device_id) else {
                warn!("deregistration for unknown device {device_id}, dropping");
                return;
            };
            record.mgmt_path = PathStatus::Offline;
            record.recompute_status();
            emit(
                events,
                &device_id,
                timestamp_ms,
                EventKind::DeviceDeregistered { reason: "dereg" },
            );
        }

        Command::MgmtLifetimeStale { device_id, .. } => {
            let Some(record) = devices.get_mut(&device_id) else {
                return;
            };
            record.mgmt_path = PathStatus::Stale;
            record.recompute_status();
            trace!("device {device_id} lifetime exceeded once, marked stale");
        }

        Command::MgmtLifetimeExpired { device_id, timestamp_ms } => {
            let Some(record) = devices.get_mut(&device_id) else {
                return;
            };
            record.mgmt_path = PathStatus::Offline;
            record.recompute_status();
            emit(
                events,
                &device_id,
                timestamp_ms,
                EventKind::DeviceDeregistered {
                    reason: "lifetime_exhaustion",
                },
            );
        }

        Command::CommandResponse {
            device_id,
            timestamp_ms,
            correlation_id,
            status,
        } => {
            if status == ResponseStatus::Error {
                if let Some(record) = devices.get_mut(&device_id) {
                    record.status = Status::Tripped;
                }
            }
            emit(
                events,
                &device_id,
                timestamp_ms,
                EventKind::CommandResponse { correlation_id, status },
            );
        }

        Command::SetExpectedPaths { device_id, expected } => {
            let record = devices
                .entry(device_id.clone())
                .or_insert_with(|| DeviceRecord::new(device_id));
            record.expected_paths = expected;
            record.recompute_status();
        }

        Command::SetCapabilities { device_id, capabilities } => {
            let record = devices
                .entry(device_id.clone())
                .or_insert_with(|| DeviceRecord::new(device_id));
            record.capabilities = capabilities;
        }

        Command::Get { device_id, reply } => {
            let _ = reply.send(devices.get(&device_id).cloned());
        }

        Command::List { filter, reply } => {
            let matched = devices
                .values()
                .filter(|record| matches_filter(record, &filter))
                .cloned()
                .collect();
            let _ = reply.send(matched);
        }
    }
}

fn matches_filter(record: &DeviceRecord, filter: &DeviceFilter) -> bool {
    match filter {
        DeviceFilter::All => true,
        DeviceFilter::ByStatus(status) => record.status == *status,
        DeviceFilter::ByDeviceType(device_type) => record.device_type.as_deref() == Some(device_type.as_str()),
    }
}
