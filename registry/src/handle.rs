// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The registry's public handle and the command protocol it sends to the owning actor task.

use std::collections::BTreeMap;

use sparkmesh_protocol::mgmt::{ObjectTree, ResponseStatus};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::actor::{run_actor, Command};
use crate::error::{RegistryError, RegistryErrorKind};
use crate::event::Event;
use crate::record::{Capability, DeviceRecord, ExpectedPaths, MetricSnapshot, Status};

/// Default bound on both the command mailbox and the event broadcast channel (spec §4.8/§5:
/// "bounded... default 10 000... drop-oldest").
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 10_000;

/// Construction options for [`Registry::spawn`].
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Capacity of the bounded event broadcast channel.
    pub event_queue_capacity: usize,
    /// Capacity of the command mailbox.
    pub command_queue_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            command_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
        }
    }
}

/// Selects which records [`RegistryHandle::list`] returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFilter {
    /// Every known device.
    All,
    /// Devices currently in the given status.
    ByStatus(Status),
    /// Devices of the given type.
    ByDeviceType(String),
}

/// A cheap, cloneable handle to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<Event>,
}

/// Entry point: spawns a registry actor and returns a handle plus the task driving it.
///
/// The returned future must be polled to completion (typically via `tokio::spawn`) for the
/// handle to do anything; this mirrors the broker facade's `BrokerSession::run` pattern of
/// separating construction from the long-lived driving task.
pub struct Registry;

impl Registry {
    /// Spawn a new registry actor. Returns a handle and the task that drives it; the caller is
    /// responsible for spawning the task (e.g. with `tokio::spawn`).
    #[must_use]
    pub fn spawn(config: RegistryConfig) -> (RegistryHandle, impl std::future::Future<Output = ()>) {
        let (tx, rx) = mpsc::channel(config.command_queue_capacity);
        let (events, _) = broadcast::channel(config.event_queue_capacity);
        let handle = RegistryHandle {
            tx,
            events: events.clone(),
        };
        let task = run_actor(rx, events);
        (handle, task)
    }
}

impl RegistryHandle {
    async fn send(&self, command: Command) -> Result<(), RegistryError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| RegistryErrorKind::ActorGone.into())
    }

    /// Apply a TELEMETRY birth (or rebirth): replace the device's metric schema and values.
    ///
    /// # Errors
    /// Returns [`RegistryError`] if the actor task has shut down.
    pub async fn apply_telemetry_birth(
        &self,
        device_id: impl Into<String>,
        device_type: Option<String>,
        group_id: Option<String>,
        timestamp_ms: u64,
        metrics: BTreeMap<String, MetricSnapshot>,
    ) -> Result<(), RegistryError> {
        self.send(Command::TelemetryBirth {
            device_id: device_id.into(),
            device_type,
            group_id,
            timestamp_ms,
            metrics,
        })
        .await
    }

    /// Apply a TELEMETRY data merge: mirror the host engine's already-merged metric snapshot.
    ///
    /// # Errors
    /// Returns [`RegistryError`] if the actor task has shut down.
    pub async fn apply_telemetry_data(
        &self,
        device_id: impl Into<String>,
        timestamp_ms: u64,
        metrics: BTreeMap<String, MetricSnapshot>,
        seq_expected: u8,
    ) -> Result<(), RegistryError> {
        self.send(Command::TelemetryData {
            device_id: device_id.into(),
            timestamp_ms,
            metrics,
            seq_expected,
        })
        .await
    }

    /// Mark a device's telemetry path stale following a sequence-gap rebirth request.
    ///
    /// # Errors
    /// Returns [`RegistryError`] if the actor task has shut down.
    pub async fn apply_telemetry_gap(
        &self,
        device_id: impl Into<String>,
        timestamp_ms: u64,
    ) -> Result<(), RegistryError> {
        self.send(Command::TelemetryGap {
            device_id: device_id.into(),
            timestamp_ms,
        })
        .await
    }

    /// Apply a TELEMETRY death: clear metrics, mark the telemetry path offline.
    ///
    /// # Errors
    /// Returns [`RegistryError`] if the actor task has shut down.
    pub async fn apply_telemetry_death(
        &self,
        device_id: impl Into<String>,
        timestamp_ms: u64,
    ) -> Result<(), RegistryError> {
        self.send(Command::TelemetryDeath {
            device_id: device_id.into(),
            timestamp_ms,
        })
        .await
    }

    /// Apply a MGMT registration: replace the object tree wholesale.
    ///
    /// # Errors
    /// Returns [`RegistryError`] if the actor task has shut down.
    pub async fn apply_mgmt_registered(
        &self,
        device_id: impl Into<String>,
        lifetime_s: u64,
        objects: ObjectTree,
        timestamp_ms: u64,
    ) -> Result<(), RegistryError> {
        self.send(Command::MgmtRegistered {
            device_id: device_id.into(),
            lifetime_s,
            objects,
            timestamp_ms,
        })
        .await
    }

    /// Apply a MGMT update: merge the delta into the object tree.
    ///
    /// # Errors
    /// Returns [`RegistryError`] if the actor task has shut down.
    pub async fn apply_mgmt_updated(
        &self,
        device_id: impl Into<String>,
        delta: ObjectTree,
        timestamp_ms: u64,
    ) -> Result<(), RegistryError> {
        self.send(Command::MgmtUpdated {
            device_id: device_id.into(),
            delta,
            timestamp_ms,
        })
        .await
    }

    /// Apply an explicit MGMT deregistration.
    ///
    /// # Errors
    /// Returns [`RegistryError`] if the actor task has shut down.
    pub async fn apply_mgmt_deregistered(
        &self,
        device_id: impl Into<String>,
        timestamp_ms: u64,
    ) -> Result<(), RegistryError> {
        self.send(Command::MgmtDeregistered {
            device_id: device_id.into(),
            timestamp_ms,
        })
        .await
    }

    /// Apply a single lifetime expiry (`Online` → `Stale`).
    ///
    /// # Errors
    /// Returns [`RegistryError`] if the actor task has shut down.
    pub async fn apply_mgmt_lifetime_stale(
        &self,
        device_id: impl Into<String>,
        timestamp_ms: u64,
    ) -> Result<(), RegistryError> {
        self.send(Command::MgmtLifetimeStale {
            device_id: device_id.into(),
            timestamp_ms,
        })
        .await
    }

    /// Apply a double lifetime expiry (`Stale` → `Offline`).
    ///
    /// # Errors
    /// Returns [`RegistryError`] if the actor task has shut down.
    pub async fn apply_mgmt_lifetime_expired(
        &self,
        device_id: impl Into<String>,
        timestamp_ms: u64,
    ) -> Result<(), RegistryError> {
        self.send(Command::MgmtLifetimeExpired {
            device_id: device_id.into(),
            timestamp_ms,
        })
        .await
    }

    /// Record a correlated command response observed on the MGMT `resp` topic.
    ///
    /// # Errors
    /// Returns [`RegistryError`] if the actor task has shut down.
    pub async fn apply_command_response(
        &self,
        device_id: impl Into<String>,
        timestamp_ms: u64,
        correlation_id: impl Into<String>,
        status: ResponseStatus,
    ) -> Result<(), RegistryError> {
        self.send(Command::CommandResponse {
            device_id: device_id.into(),
            timestamp_ms,
            correlation_id: correlation_id.into(),
            status,
        })
        .await
    }

    /// Declare which paths a device's type is expected to use, governing the combined
    /// [`Status`] invariant.
    ///
    /// # Errors
    /// Returns [`RegistryError`] if the actor task has shut down.
    pub async fn set_expected_paths(
        &self,
        device_id: impl Into<String>,
        expected: ExpectedPaths,
    ) -> Result<(), RegistryError> {
        self.send(Command::SetExpectedPaths {
            device_id: device_id.into(),
            expected,
        })
        .await
    }

    /// Attach capabilities (typically sourced from a loaded device-description) to a device.
    ///
    /// # Errors
    /// Returns [`RegistryError`] if the actor task has shut down.
    pub async fn set_capabilities(
        &self,
        device_id: impl Into<String>,
        capabilities: BTreeMap<String, Capability>,
    ) -> Result<(), RegistryError> {
        self.send(Command::SetCapabilities {
            device_id: device_id.into(),
            capabilities,
        })
        .await
    }

    /// Look up one device's current record.
    ///
    /// # Errors
    /// Returns [`RegistryError`] if the actor task has shut down.
    pub async fn get(&self, device_id: impl Into<String>) -> Result<Option<DeviceRecord>, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Get {
            device_id: device_id.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| RegistryErrorKind::ActorGone.into())
    }

    /// List device records matching `filter`.
    ///
    /// # Errors
    /// Returns [`RegistryError`] if the actor task has shut down.
    pub async fn list(&self, filter: DeviceFilter) -> Result<Vec<DeviceRecord>, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::List { filter, reply }).await?;
        rx.await.map_err(|_| RegistryErrorKind::ActorGone.into())
    }

    /// Subscribe to the registry's event stream. The channel is bounded and drop-oldest: a slow
    /// subscriber observes [`tokio::sync::broadcast::error::RecvError::Lagged`] rather than
    /// stalling the registry's write path.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}
