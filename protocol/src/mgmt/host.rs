// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host-side MGMT engine (C7): registration table with lifetime expiry, and command
//! dispatch with response correlation.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value as JsonValue;
use sparkmesh_mqtt::control_packet::QoS;
use sparkmesh_mqtt::interface::MqttPubSub;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::mgmt::{
    now_ms, CommandEnvelope, MgmtError, MgmtErrorKind, ObjectTree, RegistrationMessage,
    ResponseEnvelope, DEFAULT_COMMAND_TIMEOUT,
};

/// Liveness status of a registered device, as tracked by the host-side MGMT engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegStatus {
    /// Registered and within its lifetime window.
    Online,
    /// Lifetime expired once (`> lifetime_s` since last update) but not yet doubly expired.
    Stale,
    /// Lifetime doubly expired (`> 2 × lifetime_s`), or explicit deregistration observed.
    Offline,
}

/// A device's registration-table entry.
#[derive(Debug, Clone)]
pub struct RegistrationRecord {
    /// Declared lifetime, seconds.
    pub lifetime_s: u64,
    /// Timestamp (ms) of the most recent reg or update.
    pub last_update_ms: u64,
    /// Merged object tree.
    pub objects: ObjectTree,
    /// Current liveness status.
    pub status: RegStatus,
}

/// Outcome of [`RegistrationTable::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// No record existed for this device id; one was created.
    Created,
    /// A record already existed; it was replaced and the lifetime timer reset (idempotent:
    /// no duplicate record results from re-sending the same registration).
    Reset,
}

/// Registration table keyed by `device_id` (C7).
#[derive(Debug, Default)]
pub struct RegistrationTable {
    devices: HashMap<String, RegistrationRecord>,
}

impl RegistrationTable {
    /// Construct an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle an inbound registration: create or replace the record, (re)start the lifetime
    /// timer.
    pub fn register(&mut self, device_id: &str, message: RegistrationMessage, now: u64) -> RegisterOutcome {
        let record = RegistrationRecord {
            lifetime_s: message.lifetime_s,
            last_update_ms: now,
            objects: message.objects,
            status: RegStatus::Online,
        };
        match self.devices.entry(device_id.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.insert(record);
                RegisterOutcome::Reset
            }
            Entry::Vacant(entry) => {
                entry.insert(record);
                RegisterOutcome::Created
            }
        }
    }

    /// Merge an update into the device's object tree and reset its lifetime timer.
    ///
    /// # Errors
    /// Returns [`MgmtError`] if no record exists for `device_id` (an update with no prior
    /// registration is a protocol error, not silently ignored).
    pub fn update(&mut self, device_id: &str, delta: ObjectTree, now: u64) -> Result<(), MgmtError> {
        let record = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| MgmtErrorKind::Malformed(format!("update for unregistered device {device_id}")))?;
        crate::mgmt::merge_object_tree(&mut record.objects, delta);
        record.last_update_ms = now;
        record.status = RegStatus::Online;
        Ok(())
    }

    /// Mark a device offline on explicit deregistration. The record is retained.
    pub fn deregister(&mut self, device_id: &str) {
        if let Some(record) = self.devices.get_mut(device_id) {
            record.status = RegStatus::Offline;
        }
    }

    /// Evaluate lifetime expiry for every device against `now`, transitioning `Online` →
    /// `Stale` at `lifetime_s` and `Stale` → `Offline` at `2 × lifetime_s`. Call on a
    /// low-frequency sweep per the concurrency model's lazy-timer discipline.
    pub fn sweep_expiry(&mut self, now: u64) {
        for record in self.devices.values_mut() {
            if record.status == RegStatus::Offline {
                continue;
            }
            let elapsed_s = now.saturating_sub(record.last_update_ms) / 1000;
            if elapsed_s >= 2 * record.lifetime_s {
                record.status = RegStatus::Offline;
            } else if elapsed_s >= record.lifetime_s {
                record.status = RegStatus::Stale;
            }
        }
    }

    /// Look up a device's registration record.
    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<&RegistrationRecord> {
        self.devices.get(device_id)
    }

    /// Every device id this table currently holds a record for, for callers that need to
    /// sweep the whole table (e.g. lifetime expiry against the registry).
    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }
}

/// Correlates outbound commands with their inbound responses by `correlation_id`, and
/// enforces a per-command timeout.
#[derive(Default)]
pub struct CommandCorrelator {
    pending: Mutex<HashMap<String, oneshot::Sender<ResponseEnvelope>>>,
}

impl CommandCorrelator {
    /// Construct a correlator with no commands in flight.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a command to `<prefix>/<device_id>/cmd/<verb>` and await its
    /// `<prefix>/<device_id>/resp/<verb>` response, correlated by `correlation_id`.
    ///
    /// # Errors
    /// Returns [`MgmtError`] if the publish fails, or `Timeout` if no matching response is
    /// observed (via [`CommandCorrelator::complete`]) within `timeout`.
    pub async fn send_command<P: MqttPubSub + Send + Sync>(
        &self,
        pub_sub: &P,
        prefix: &str,
        device_id: &str,
        verb: &str,
        parameters: BTreeMap<String, JsonValue>,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, MgmtError> {
        let correlation_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(correlation_id.clone(), tx);

        let envelope = CommandEnvelope {
            command_name: verb.to_string(),
            parameters,
            correlation_id: correlation_id.clone(),
            timestamp: now_ms(),
        };
        let payload =
            serde_json::to_vec(&envelope).map_err(|e| MgmtErrorKind::Malformed(e.to_string()))?;
        let topic = format!("{prefix}/{device_id}/cmd/{verb}");
        if let Err(e) = pub_sub.publish(topic, QoS::AtLeastOnce, false, payload).await {
            self.pending.lock().unwrap().remove(&correlation_id);
            return Err(MgmtErrorKind::Publish("command", e.to_string()).into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(MgmtErrorKind::Malformed("correlator dropped before response arrived".to_string()).into()),
            Err(_) => {
                self.pending.lock().unwrap().remove(&correlation_id);
                Err(MgmtErrorKind::Timeout(timeout).into())
            }
        }
    }

    /// Same as [`CommandCorrelator::send_command`] with the default 5s timeout.
    ///
    /// # Errors
    /// See [`CommandCorrelator::send_command`].
    pub async fn send_command_default_timeout<P: MqttPubSub + Send + Sync>(
        &self,
        pub_sub: &P,
        prefix: &str,
        device_id: &str,
        verb: &str,
        parameters: BTreeMap<String, JsonValue>,
    ) -> Result<ResponseEnvelope, MgmtError> {
        self.send_command(pub_sub, prefix, device_id, verb, parameters, DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    /// Deliver an observed response (received on `<prefix>/<id>/resp/<verb>`) to whichever
    /// caller is awaiting its `correlation_id`. A response with no matching in-flight command
    /// (already timed out, or unsolicited) is silently dropped.
    pub fn complete(&self, response: ResponseEnvelope) {
        if let Some(tx) = self.pending.lock().unwrap().remove(&response.correlation_id) {
            let _ = tx.send(response);
        }
    }
}
