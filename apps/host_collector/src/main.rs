// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host-side process (spec.md §6): wires the host-side TELEMETRY engine (C5) and MGMT engine
//! (C7) into the device registry (C8), and optionally relays raw broker traffic plus registry
//! events onto the durable-stream bridge (C9).

mod config;
mod pipeline;

use std::process::ExitCode;

use sparkmesh_bridge::producer::KafkaStreamProducer;
use sparkmesh_bridge::{Bridge, BridgeConfigBuilder, TopicMap};
use sparkmesh_mqtt::connection_settings::BrokerConnectionSettingsBuilder;
use sparkmesh_mqtt::control_packet::QoS;
use sparkmesh_mqtt::interface::{MqttPubSub, PubReceiver};
use sparkmesh_mqtt::session::{BrokerSession, SessionOptionsBuilder};
use sparkmesh_registry::{Registry, RegistryConfig};
use tokio::time::interval;

use config::CollectorConfigBuilder;
use pipeline::Pipeline;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::max())
        .format_timestamp_millis()
        .filter_module("rumqttc", log::LevelFilter::Warn)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(StartupOrRunError::Startup(message)) => {
            log::error!("host collector could not start: {message}");
            ExitCode::from(1)
        }
        Err(StartupOrRunError::BrokerUnreachable(message)) => {
            log::error!("host collector exiting, broker unreachable: {message}");
            ExitCode::from(2)
        }
        Err(StartupOrRunError::Interrupted) => ExitCode::from(130),
    }
}

enum StartupOrRunError {
    Startup(String),
    BrokerUnreachable(String),
    Interrupted,
}

async fn run() -> Result<(), StartupOrRunError> {
    let config = CollectorConfigBuilder::from_environment()
        .map_err(StartupOrRunError::Startup)?
        .build()
        .map_err(StartupOrRunError::Startup)?;

    let connection_settings = BrokerConnectionSettingsBuilder::from_environment()
        .map_err(StartupOrRunError::Startup)?
        .client_id("sparkmesh-host-collector".to_string())
        .build()
        .map_err(StartupOrRunError::Startup)?;
    let session_options = SessionOptionsBuilder::default()
        .connection_settings(connection_settings)
        .build()
        .map_err(|e| StartupOrRunError::Startup(e.to_string()))?;
    let mut session = BrokerSession::new(session_options).map_err(|e| StartupOrRunError::Startup(e.to_string()))?;
    let pub_sub = session.pub_sub();
    let exit_handle = session.get_session_exit_handle();

    // No filtered receivers are registered: every publish this process receives, whether
    // TELEMETRY or MGMT, lands on the unfiltered receiver and is dispatched by topic shape.
    let mut inbound = session
        .take_unfiltered_pub_receiver(true)
        .ok_or_else(|| StartupOrRunError::Startup("unfiltered receiver already taken".to_string()))?;

    let telemetry_filter = format!("{}/{}/+/#", config.namespace, "+");
    pub_sub
        .subscribe(telemetry_filter, QoS::AtMostOnce)
        .await
        .map_err(|e| StartupOrRunError::Startup(format!("subscribe to TELEMETRY topics: {e}")))?;
    let mgmt_filter = format!("{}/+/+/#", config.mgmt_prefix);
    pub_sub
        .subscribe(mgmt_filter, QoS::AtLeastOnce)
        .await
        .map_err(|e| StartupOrRunError::Startup(format!("subscribe to MGMT topics: {e}")))?;

    let (registry, registry_task) = Registry::spawn(RegistryConfig::default());
    let registry_driver = tokio::spawn(registry_task);

    let bridge_handle = if config.bridge_enabled {
        let bridge_config = BridgeConfigBuilder::from_environment()
            .map_err(StartupOrRunError::Startup)?
            .build()
            .map_err(StartupOrRunError::Startup)?;
        let producer = KafkaStreamProducer::new(&bridge_config).map_err(|e| StartupOrRunError::Startup(e.to_string()))?;
        let (handle, task) = Bridge::spawn(producer, TopicMap::default(), bridge_config.event_queue_capacity);
        tokio::spawn(task);
        Some(handle)
    } else {
        log::warn!("durable-stream bridge disabled; set SPARKMESH_BRIDGE_BROKERS to enable it");
        None
    };

    // The pipeline is owned exclusively by this one task (spec.md §5's single-writer
    // discipline): every inbound publish and every lazy sweep tick is applied to it in the
    // order this select loop observes them, never concurrently.
    let pipeline_cancel = tokio_util::sync::CancellationToken::new();
    let pipeline_task = {
        let pub_sub = pub_sub.clone();
        let sweep_interval = config.sweep_interval;
        let cancel = pipeline_cancel.clone();
        tokio::spawn(async move {
            let mut pipeline = Pipeline::new(registry.clone(), config.mgmt_prefix.clone());
            let mut ticker = interval(sweep_interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        pipeline.sweep().await;
                    }
                    publish = inbound.recv() => {
                        let Some(publish) = publish else { break };
                        let topic = String::from_utf8_lossy(&publish.topic).to_string();
                        let recognized = pipeline.ingest(&publish, &pub_sub).await;
                        if recognized {
                            if let Some(bridge) = &bridge_handle {
                                bridge.ingest(topic, publish.payload.clone(), publish.qos as u8);
                            }
                        }
                    }
                }
            }
        })
    };

    let session_run = session.run();
    tokio::pin!(session_run);

    let outcome = tokio::select! {
        result = &mut session_run => match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("reconnection halted") => {
                Err(StartupOrRunError::BrokerUnreachable(e.to_string()))
            }
            Err(e) => Err(StartupOrRunError::Startup(e.to_string())),
        },
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupt received, shutting down host collector");
            let _ = exit_handle.exit_session().await;
            let _ = session_run.await;
            Err(StartupOrRunError::Interrupted)
        }
    };

    pipeline_cancel.cancel();
    let _ = pipeline_task.await;
    drop(registry_driver);
    outcome
}
