// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! Unified device registry and event fan-out (C8).
//!
//! Merges what the host-side TELEMETRY engine ([`sparkmesh_protocol::telemetry::host`]) and
//! MGMT engine ([`sparkmesh_protocol::mgmt::host`]) each know about a device into one
//! [`record::DeviceRecord`], and republishes every mutating transition on a bounded,
//! drop-oldest [`event::Event`] stream for the durable-stream bridge (C9) and other consumers
//! to drain independently of the registry's write path.

mod actor;
pub mod error;
pub mod event;
mod handle;
pub mod record;

pub use error::{RegistryError, RegistryErrorKind};
pub use event::{AllEvents, Event, EventFilter, EventKind, ForDevice};
pub use handle::{DeviceFilter, Registry, RegistryConfig, RegistryHandle, DEFAULT_EVENT_QUEUE_CAPACITY};
pub use record::{Capability, DeviceRecord, ExpectedPaths, MetricSnapshot, Status};

#[doc = include_str!("../README.md")]
#[cfg(doctest)]
struct ReadmeDoctests;

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use sparkmesh_protocol::metric::{DataType, Value};
    use test_case::test_case;

    use super::*;

    fn metric(value: i64) -> MetricSnapshot {
        MetricSnapshot {
            value: Value::Int64(value),
            datatype: DataType::Int64,
            timestamp: 1_000,
        }
    }

    #[tokio::test]
    async fn unregistered_device_starts_unknown_and_absent() {
        let (registry, task) = Registry::spawn(RegistryConfig::default());
        let _driver = tokio::spawn(task);

        assert_eq!(registry.get("widget-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn birth_registers_and_emits_device_registered_and_birth() {
        let (registry, task) = Registry::spawn(RegistryConfig::default());
        let _driver = tokio::spawn(task);
        let mut events = registry.subscribe_events();

        let mut metrics = BTreeMap::new();
        metrics.insert("temp_c".to_string(), metric(21));
        registry
            .apply_telemetry_birth("widget-1", Some("thermostat".into()), None, 1_000, metrics)
            .await
            .unwrap();

        let record = registry.get("widget-1").await.unwrap().unwrap();
        assert_eq!(record.status, Status::Stale); // mgmt path still Unknown, telemetry Online
        assert_eq!(record.registered_at, Some(1_000));
        assert_eq!(record.telemetry_seq_expected, 1);

        let first = events.recv().await.unwrap();
        assert!(matches!(first.kind, EventKind::DeviceRegistered));
        let second = events.recv().await.unwrap();
        assert!(matches!(second.kind, EventKind::TelemetryBirth));
    }

    #[tokio::test]
    async fn birth_replaces_metric_schema_rather_than_merging() {
        let (registry, task) = Registry::spawn(RegistryConfig::default());
        let _driver = tokio::spawn(task);

        let mut first = BTreeMap::new();
        first.insert("temp_c".to_string(), metric(21));
        first.insert("humidity".to_string(), metric(40));
        registry
            .apply_telemetry_birth("widget-1", None, None, 1_000, first)
            .await
            .unwrap();

        let mut rebirth = BTreeMap::new();
        rebirth.insert("temp_c".to_string(), metric(22));
        registry
            .apply_telemetry_birth("widget-1", None, None, 2_000, rebirth)
            .await
            .unwrap();

        let record = registry.get("widget-1").await.unwrap().unwrap();
        assert_eq!(record.telemetry_metrics.len(), 1);
        assert!(!record.telemetry_metrics.contains_key("humidity"));
    }

    #[tokio::test]
    async fn both_paths_online_yields_overall_online() {
        let (registry, task) = Registry::spawn(RegistryConfig::default());
        let _driver = tokio::spawn(task);

        let mut metrics = BTreeMap::new();
        metrics.insert("temp_c".to_string(), metric(21));
        registry
            .apply_telemetry_birth("widget-1", None, None, 1_000, metrics)
            .await
            .unwrap();
        registry
            .apply_mgmt_registered("widget-1", 3_600, Default::default(), 1_000)
            .await
            .unwrap();

        let record = registry.get("widget-1").await.unwrap().unwrap();
        assert_eq!(record.status, Status::Online);
    }

    #[tokio::test]
    async fn path_not_expected_does_not_hold_status_back() {
        let (registry, task) = Registry::spawn(RegistryConfig::default());
        let _driver = tokio::spawn(task);

        registry
            .set_expected_paths(
                "widget-1",
                ExpectedPaths {
                    telemetry: true,
                    mgmt: false,
                },
            )
            .await
            .unwrap();
        let mut metrics = BTreeMap::new();
        metrics.insert("temp_c".to_string(), metric(21));
        registry
            .apply_telemetry_birth("widget-1", None, None, 1_000, metrics)
            .await
            .unwrap();

        let record = registry.get("widget-1").await.unwrap().unwrap();
        assert_eq!(record.status, Status::Online);
    }

    #[test_case(true; "birth observed")]
    #[test_case(false; "registration observed")]
    #[tokio::test]
    async fn death_or_expiry_marks_offline_regardless_of_which_path(birth_first: bool) {
        let (registry, task) = Registry::spawn(RegistryConfig::default());
        let _driver = tokio::spawn(task);

        if birth_first {
            let mut metrics = BTreeMap::new();
            metrics.insert("temp_c".to_string(), metric(21));
            registry
                .apply_telemetry_birth("widget-1", None, None, 1_000, metrics)
                .await
                .unwrap();
            registry.apply_telemetry_death("widget-1", 2_000).await.unwrap();
        } else {
            registry
                .apply_mgmt_registered("widget-1", 3_600, Default::default(), 1_000)
                .await
                .unwrap();
            registry.apply_mgmt_lifetime_stale("widget-1", 2_000).await.unwrap();
            registry.apply_mgmt_lifetime_expired("widget-1", 3_000).await.unwrap();
        }

        let record = registry.get("widget-1").await.unwrap().unwrap();
        assert_eq!(record.status, Status::Offline);
    }

    #[tokio::test]
    async fn sequence_gap_marks_stale_without_clearing_metrics() {
        let (registry, task) = Registry::spawn(RegistryConfig::default());
        let _driver = tokio::spawn(task);

        let mut metrics = BTreeMap::new();
        metrics.insert("temp_c".to_string(), metric(21));
        registry
            .apply_telemetry_birth("widget-1", None, None, 1_000, metrics)
            .await
            .unwrap();
        registry.apply_telemetry_gap("widget-1", 2_000).await.unwrap();

        let record = registry.get("widget-1").await.unwrap().unwrap();
        assert_eq!(record.status, Status::Stale);
        assert!(record.telemetry_metrics.contains_key("temp_c"));
    }

    #[tokio::test]
    async fn command_error_response_trips_the_device() {
        let (registry, task) = Registry::spawn(RegistryConfig::default());
        let _driver = tokio::spawn(task);

        registry
            .apply_mgmt_registered("widget-1", 3_600, Default::default(), 1_000)
            .await
            .unwrap();
        registry
            .apply_command_response(
                "widget-1",
                2_000,
                "corr-1",
                sparkmesh_protocol::mgmt::ResponseStatus::Error,
            )
            .await
            .unwrap();

        let record = registry.get("widget-1").await.unwrap().unwrap();
        assert_eq!(record.status, Status::Tripped);

        // Tripped status is sticky: further telemetry activity does not clear it on its own.
        let mut metrics = BTreeMap::new();
        metrics.insert("temp_c".to_string(), metric(21));
        registry
            .apply_telemetry_birth("widget-1", None, None, 3_000, metrics)
            .await
            .unwrap();
        let record = registry.get("widget-1").await.unwrap().unwrap();
        assert_eq!(record.status, Status::Tripped);
    }

    #[tokio::test]
    async fn list_filters_by_status_and_device_type() {
        let (registry, task) = Registry::spawn(RegistryConfig::default());
        let _driver = tokio::spawn(task);

        let mut metrics = BTreeMap::new();
        metrics.insert("temp_c".to_string(), metric(21));
        registry
            .apply_telemetry_birth("widget-1", Some("thermostat".into()), None, 1_000, metrics.clone())
            .await
            .unwrap();
        registry
            .apply_telemetry_birth("widget-2", Some("valve".into()), None, 1_000, metrics)
            .await
            .unwrap();
        registry.apply_telemetry_death("widget-2", 2_000).await.unwrap();

        let offline = registry.list(DeviceFilter::ByStatus(Status::Offline)).await.unwrap();
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].device_id, "widget-2");

        let thermostats = registry
            .list(DeviceFilter::ByDeviceType("thermostat".into()))
            .await
            .unwrap();
        assert_eq!(thermostats.len(), 1);
        assert_eq!(thermostats[0].device_id, "widget-1");

        let all = registry.list(DeviceFilter::All).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn capabilities_are_attached_independently_of_telemetry_or_mgmt() {
        let (registry, task) = Registry::spawn(RegistryConfig::default());
        let _driver = tokio::spawn(task);

        let mut capabilities = BTreeMap::new();
        capabilities.insert(
            "temp_c".to_string(),
            Capability {
                metric_type: "Double".to_string(),
                units: Some("celsius".to_string()),
                range: Some((-40.0, 125.0)),
            },
        );
        registry.set_capabilities("widget-1", capabilities).await.unwrap();

        let record = registry.get("widget-1").await.unwrap().unwrap();
        assert_eq!(record.capabilities.len(), 1);
        assert_eq!(record.status, Status::Unknown);
    }

    #[tokio::test]
    async fn slow_subscriber_sees_lagged_rather_than_blocking_the_registry() {
        let (registry, task) = Registry::spawn(RegistryConfig {
            event_queue_capacity: 2,
            command_queue_capacity: 16,
        });
        let _driver = tokio::spawn(task);
        let mut events = registry.subscribe_events();

        for i in 0..5u64 {
            let mut metrics = BTreeMap::new();
            metrics.insert("temp_c".to_string(), metric(i as i64));
            registry
                .apply_telemetry_birth("widget-1", None, None, i, metrics)
                .await
                .unwrap();
        }

        // The producer never blocked despite nobody draining promptly; the receiver now
        // observes a lag rather than an unbounded backlog.
        let err = events.recv().await.unwrap_err();
        assert!(matches!(err, tokio::sync::broadcast::error::RecvError::Lagged(_)));
    }

    #[tokio::test]
    async fn dropped_handle_eventually_ends_the_actor_task() {
        let (registry, task) = Registry::spawn(RegistryConfig::default());
        let driver = tokio::spawn(task);
        drop(registry);
        tokio_test::assert_ok!(driver.await);
    }
}
