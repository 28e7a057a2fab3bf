// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host-side TELEMETRY engine (C5): per-edge-node sequence validation, birth→state
//! reconstruction, delta application, and staleness detection.
//!
//! Messages for a single edge node MUST be fed to [`NodeState::apply`] in broker-delivery
//! order; ordering across distinct nodes is not this module's concern (spec §5).

use std::collections::BTreeMap;
use std::time::Duration;

use crate::metric::{Metric, Value};
use crate::telemetry::{DEFAULT_STALE_AFTER, STALE_AFTER_INTERVAL_MULTIPLIER};

/// Outcome of applying one inbound TELEMETRY message to a [`NodeState`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Birth applied; schema and values replaced wholesale.
    BirthApplied,
    /// Data applied; metrics merged by name.
    DataApplied,
    /// A sequence gap was detected. The payload was discarded and the node is now `stale`;
    /// the caller (the binary wiring this engine to the broker) is expected to publish an
    /// NCMD rebirth request in response.
    GapDetectedRebirthRequested,
    /// Death applied; metrics cleared, node marked offline.
    DeathApplied,
}

/// Liveness status of a node as observed by the host-side TELEMETRY engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No birth has ever been observed.
    Unknown,
    /// Birth observed, sequence intact, data fresh.
    Online,
    /// Birth observed, but either a sequence gap was seen (awaiting rebirth) or data has not
    /// arrived within the staleness threshold.
    Stale,
    /// Death observed.
    Offline,
}

/// The host's reconstructed view of one edge node's (or device's) telemetry schema and values.
#[derive(Debug, Clone)]
pub struct NodeState {
    /// Next sequence number this node is expected to send.
    pub expected_seq: u8,
    /// Current liveness status.
    pub status: Status,
    /// Metrics introduced by the most recent birth, updated in place by subsequent data.
    pub metrics: BTreeMap<String, Metric>,
    /// Timestamp (ms) of the most recently accepted birth or data message.
    pub last_seen_ms: Option<u64>,
    /// The publish interval this node declared, if known, for staleness threshold derivation.
    pub publish_interval: Option<Duration>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            expected_seq: 0,
            status: Status::Unknown,
            metrics: BTreeMap::new(),
            last_seen_ms: None,
            publish_interval: None,
        }
    }
}

impl NodeState {
    /// Construct a fresh, never-seen node state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a birth: replace the metric schema/values wholesale, set `expected_seq = 1` (the
    /// first DATA after a birth carries `seq = 1`; birth itself is `seq = 0`).
    pub fn apply_birth(&mut self, timestamp_ms: u64, metrics: Vec<Metric>) -> Outcome {
        self.metrics = metrics.into_iter().map(|m| (m.name.clone(), m)).collect();
        self.expected_seq = 1;
        self.status = Status::Online;
        self.last_seen_ms = Some(timestamp_ms);
        Outcome::BirthApplied
    }

    /// Apply a data message. On a sequence match, merges metrics by name (absent metrics keep
    /// their previous value) and advances `expected_seq`. On a mismatch, discards the payload,
    /// marks the node `stale`, and signals that a rebirth request should be sent.
    pub fn apply_data(&mut self, timestamp_ms: u64, seq: u8, metrics: Vec<Metric>) -> Outcome {
        if seq != self.expected_seq {
            self.status = Status::Stale;
            return Outcome::GapDetectedRebirthRequested;
        }
        for metric in metrics {
            self.metrics.insert(metric.name.clone(), metric);
        }
        self.expected_seq = seq.wrapping_add(1);
        self.status = Status::Online;
        self.last_seen_ms = Some(timestamp_ms);
        Outcome::DataApplied
    }

    /// Apply a death: clear metrics, mark offline, retain the record.
    pub fn apply_death(&mut self) -> Outcome {
        self.metrics.clear();
        self.status = Status::Offline;
        Outcome::DeathApplied
    }

    /// The staleness threshold for this node: `3 ×` its declared publish interval, or the
    /// default (30s) if the interval is not known.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        self.publish_interval
            .map(|interval| interval * STALE_AFTER_INTERVAL_MULTIPLIER)
            .unwrap_or(DEFAULT_STALE_AFTER)
    }

    /// Evaluate staleness against the current time, without requiring a new message. Call on a
    /// low-frequency sweep per the concurrency model's lazy-timer discipline.
    pub fn evaluate_staleness(&mut self, now_ms: u64) {
        if self.status != Status::Online {
            return;
        }
        let Some(last_seen) = self.last_seen_ms else {
            return;
        };
        let elapsed = Duration::from_millis(now_ms.saturating_sub(last_seen));
        if elapsed >= self.stale_after() {
            self.status = Status::Stale;
        }
    }

    /// A snapshot of the node's current metric values, keyed by name.
    #[must_use]
    pub fn metric_values(&self) -> BTreeMap<String, Value> {
        self.metrics
            .iter()
            .map(|(name, metric)| (name.clone(), metric.value.clone()))
            .collect()
    }
}
